//! MSP transport and link-mode arbiter.
//!
//! Multiplexes many logical MSP request/response exchanges and an
//! interactive CLI text console over one physical link. The wire codec is
//! not here: frames enter and leave through the [`FrameSink`] trait and
//! the `handle_response`/`handle_text` callbacks, so the transport treats
//! messages as opaque `(command, payload)` pairs. Command ids are `u16`;
//! ids above 255 are the codec's concern (MSPv2 framing).
//!
//! Three rules are enforced centrally:
//!
//! 1. **Single flight**: at most one MSP exchange is on the wire at a
//!    time, however many threads call in.
//! 2. **Mode exclusion**: while the CLI console is attached, every MSP
//!    request is refused up front instead of timing out.
//! 3. **Config lock**: multi-step config operations hold a reentrant
//!    counter that telemetry polling checks before each cycle.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};

/// Settling delay inserted by the first (outermost) config-lock acquire.
const CONFIG_LOCK_SETTLE: Duration = Duration::from_millis(50);

/// Text written to enter the CLI console.
const CLI_ENTER: &str = "#";

/// Which channel currently owns the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkMode {
    /// No link.
    #[default]
    Closed,
    /// Binary MSP exchanges allowed.
    Msp,
    /// CLI text console attached; MSP requests are refused.
    Cli,
}

/// Outlet for framed MSP requests and raw CLI text.
///
/// Implemented by the wire codec that owns the physical link; the
/// transport never sees frame bytes.
pub trait FrameSink: Send {
    /// Encode and write one MSP request.
    fn send_frame(&mut self, command: u16, payload: &[u8]) -> Result<()>;

    /// Write raw text (CLI mode).
    fn send_text(&mut self, text: &str) -> Result<()>;
}

/// Which path a config write ended up taking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWritePath {
    /// The binary MSP request succeeded.
    Msp,
    /// The board lacked the MSP command; the equivalent CLI text command
    /// was accepted instead.
    Cli,
}

struct PendingRequest {
    tx: SyncSender<Result<Vec<u8>>>,
}

#[derive(Default)]
struct TransportState {
    mode: LinkMode,
    /// Keyed by command id. Safe despite the single slot per command: the
    /// in-flight token serializes all senders, so no two requests for the
    /// same command can overlap.
    pending: HashMap<u16, PendingRequest>,
    config_lock_depth: u32,
    cli_buffer: String,
    cli_lines: VecDeque<String>,
}

struct Shared {
    state: Mutex<TransportState>,
    cli_line_ready: Condvar,
    /// Single-flight token: held for the whole of one request/response
    /// exchange, released on success, timeout and link loss alike.
    in_flight: Mutex<()>,
}

/// MSP request/response transport over one link.
///
/// Clone freely; clones share one state and one in-flight token.
pub struct MspTransport<S: FrameSink> {
    shared: Arc<Shared>,
    sink: Arc<Mutex<S>>,
}

impl<S: FrameSink> Clone for MspTransport<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            sink: Arc::clone(&self.sink),
        }
    }
}

impl<S: FrameSink> MspTransport<S> {
    /// Create a transport over the given sink. Starts [`LinkMode::Closed`];
    /// call [`MspTransport::connect`] once the link is up.
    pub fn new(sink: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TransportState::default()),
                cli_line_ready: Condvar::new(),
                in_flight: Mutex::new(()),
            }),
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    fn state(&self) -> MutexGuard<'_, TransportState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Current link mode.
    pub fn mode(&self) -> LinkMode {
        self.state().mode
    }

    /// Mark the link up and reset all per-connection state.
    pub fn connect(&self) {
        let mut st = self.state();
        self.reset_locked(&mut st, "link reconnected");
        st.mode = LinkMode::Msp;
        info!("MSP transport connected");
    }

    /// Mark the link down; every pending request fails immediately.
    pub fn disconnect(&self) {
        let mut st = self.state();
        self.reset_locked(&mut st, "link closed");
        st.mode = LinkMode::Closed;
        info!("MSP transport disconnected");
    }

    fn reset_locked(&self, st: &mut TransportState, reason: &str) {
        for (command, entry) in st.pending.drain() {
            debug!("Failing pending MSP command {command}: {reason}");
            let _ = entry
                .tx
                .send(Err(Error::LinkUnavailable(reason.to_string())));
        }
        st.config_lock_depth = 0;
        st.cli_buffer.clear();
        st.cli_lines.clear();
    }

    /// Send one MSP request and wait for its response.
    ///
    /// Serialized process-wide: a second caller blocks until the first
    /// exchange resolves (response, timeout or link loss) before its frame
    /// is written. Refused up front while the CLI console is attached.
    pub fn send_request(
        &self,
        command: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let _flight = self
            .shared
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let rx = {
            let mut st = self.state();
            match st.mode {
                LinkMode::Msp => {},
                LinkMode::Closed => {
                    return Err(Error::LinkUnavailable("link not open".to_string()));
                },
                LinkMode::Cli => {
                    return Err(Error::LinkUnavailable(
                        "CLI mode active; leave the CLI before issuing MSP requests".to_string(),
                    ));
                },
            }

            let (tx, rx) = mpsc::sync_channel(1);
            st.pending.insert(command, PendingRequest { tx });
            rx
        };

        if let Err(e) = self.sink_frame(command, payload) {
            self.state().pending.remove(&command);
            return Err(e);
        }

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.state().pending.remove(&command);
                Err(Error::ProtocolTimeout(format!(
                    "MSP command {command} got no response within {} ms",
                    timeout.as_millis()
                )))
            },
            Err(RecvTimeoutError::Disconnected) => Err(Error::LinkUnavailable(format!(
                "MSP command {command} dropped without a response"
            ))),
        }
    }

    /// Deliver a decoded response frame. Called by the frame dispatcher
    /// that reads the link.
    pub fn handle_response(&self, command: u16, payload: Vec<u8>) {
        let entry = self.state().pending.remove(&command);
        match entry {
            Some(pending) => {
                let _ = pending.tx.send(Ok(payload));
            },
            None => debug!("Unsolicited MSP response for command {command}"),
        }
    }

    /// Deliver a device-reported failure for a command. Called by the
    /// frame dispatcher on an MSP error frame.
    pub fn handle_failure(&self, command: u16, error: Error) {
        let entry = self.state().pending.remove(&command);
        match entry {
            Some(pending) => {
                let _ = pending.tx.send(Err(error));
            },
            None => debug!("Unsolicited MSP failure for command {command}"),
        }
    }

    fn sink_frame(&self, command: u16, payload: &[u8]) -> Result<()> {
        self.sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .send_frame(command, payload)
    }

    fn sink_text(&self, text: &str) -> Result<()> {
        self.sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .send_text(text)
    }

    // --- config lock ---

    /// Take the config lock for a multi-step config operation.
    ///
    /// The outermost acquire inserts a fixed settling delay before
    /// returning; nested acquires are free. Telemetry pollers check
    /// [`MspTransport::telemetry_paused`] and skip a cycle while any
    /// guard is alive.
    pub fn config_lock(&self) -> ConfigLockGuard<'_, S> {
        let outermost = {
            let mut st = self.state();
            st.config_lock_depth += 1;
            st.config_lock_depth == 1
        };
        if outermost {
            thread::sleep(CONFIG_LOCK_SETTLE);
        }
        ConfigLockGuard { transport: self }
    }

    /// Whether periodic telemetry polling must skip this cycle.
    pub fn telemetry_paused(&self) -> bool {
        let st = self.state();
        st.config_lock_depth > 0 || st.mode == LinkMode::Cli
    }

    // --- CLI mode ---

    /// Attach the CLI text console.
    ///
    /// Every pending MSP response is cancelled immediately with a
    /// distinguishable error instead of being left to time out.
    pub fn enter_cli_mode(&self) -> Result<()> {
        {
            let mut st = self.state();
            match st.mode {
                LinkMode::Msp => {},
                LinkMode::Cli => return Ok(()),
                LinkMode::Closed => {
                    return Err(Error::LinkUnavailable("link not open".to_string()));
                },
            }

            for (command, entry) in st.pending.drain() {
                debug!("Cancelling pending MSP command {command} for CLI mode");
                let _ = entry.tx.send(Err(Error::Aborted(format!(
                    "MSP command {command} cancelled: entering CLI mode"
                ))));
            }
            st.mode = LinkMode::Cli;
            st.cli_buffer.clear();
            st.cli_lines.clear();
        }

        info!("Entering CLI mode");
        self.sink_text(CLI_ENTER)
    }

    /// Detach the CLI console and allow MSP requests again.
    ///
    /// The caller has already sent its closing `exit`/`save` command; after
    /// `save` the board reboots, so the caller should expect the link to
    /// drop and schedule a reconnect rather than treating silence as a
    /// fault.
    pub fn leave_cli_mode(&self) -> Result<()> {
        let mut st = self.state();
        match st.mode {
            LinkMode::Cli => {},
            LinkMode::Msp => return Ok(()),
            LinkMode::Closed => {
                return Err(Error::LinkUnavailable("link not open".to_string()));
            },
        }
        st.mode = LinkMode::Msp;
        st.cli_buffer.clear();
        st.cli_lines.clear();
        info!("Left CLI mode");
        Ok(())
    }

    /// Deliver raw console text. Called by the link reader while the CLI
    /// console is attached; buffered into whole lines.
    pub fn handle_text(&self, chunk: &str) {
        let mut st = self.state();
        if st.mode != LinkMode::Cli {
            debug!("Dropping {} bytes of text outside CLI mode", chunk.len());
            return;
        }

        st.cli_buffer.push_str(chunk);
        while let Some(pos) = st.cli_buffer.find('\n') {
            let line: String = st.cli_buffer.drain(..=pos).collect();
            st.cli_lines.push_back(line.trim_end_matches(['\r', '\n']).to_string());
        }
        self.shared.cli_line_ready.notify_all();
    }

    /// Send one CLI command and collect the echoed response text until
    /// `timeout` passes (or a parse rejection is seen).
    pub fn send_cli_command(&self, command: &str, timeout: Duration) -> Result<String> {
        if self.mode() != LinkMode::Cli {
            return Err(Error::LinkUnavailable(
                "CLI console not attached".to_string(),
            ));
        }

        self.sink_text(&format!("{command}\n"))?;

        let deadline = Instant::now() + timeout;
        let mut collected = String::new();
        let mut st = self.state();
        loop {
            while let Some(line) = st.cli_lines.pop_front() {
                collected.push_str(&line);
                collected.push('\n');
            }
            if collected.contains("Parse error") {
                break;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            let (guard, wait) = self
                .shared
                .cli_line_ready
                .wait_timeout(st, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            st = guard;
            if wait.timed_out() {
                while let Some(line) = st.cli_lines.pop_front() {
                    collected.push_str(&line);
                    collected.push('\n');
                }
                break;
            }
        }
        Ok(collected)
    }

    // --- capability fallback ---

    /// Write a config setting, falling back to the CLI when the board's
    /// MSP version lacks the command.
    ///
    /// The CLI path infers success from the absence of a `"Parse error"`
    /// echo, which is a heuristic; both paths surface through the same
    /// typed result so callers need not care which one ran.
    pub fn write_config_with_fallback(
        &self,
        command: u16,
        payload: &[u8],
        cli_command: &str,
        timeout: Duration,
    ) -> Result<ConfigWritePath> {
        match self.send_request(command, payload, timeout) {
            Ok(_) => Ok(ConfigWritePath::Msp),
            Err(e) if triggers_cli_fallback(&e, command) => {
                warn!("MSP command {command} unsupported ({e}); falling back to CLI");

                self.enter_cli_mode()?;
                let echoed = self.send_cli_command(cli_command, timeout);
                let left = self.leave_cli_mode();

                let echoed = echoed?;
                left?;

                if echoed.contains("Parse error") {
                    Err(Error::Unsupported(format!(
                        "CLI rejected fallback command {cli_command:?}"
                    )))
                } else {
                    Ok(ConfigWritePath::Cli)
                }
            },
            Err(e) => Err(e),
        }
    }
}

/// Whether an MSP failure means "this board's firmware lacks the
/// command", as opposed to a transient fault.
fn triggers_cli_fallback(error: &Error, command: u16) -> bool {
    match error {
        Error::Unsupported(_) | Error::ProtocolTimeout(_) => true,
        Error::ProtocolRejected(message) => {
            message.contains("not supported") || message.contains(&command.to_string())
        },
        _ => false,
    }
}

/// Held token pausing telemetry around a multi-step config operation.
pub struct ConfigLockGuard<'a, S: FrameSink> {
    transport: &'a MspTransport<S>,
}

impl<S: FrameSink> Drop for ConfigLockGuard<'_, S> {
    fn drop(&mut self) {
        let mut st = self.transport.state();
        st.config_lock_depth = st.config_lock_depth.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct SinkLog {
        frames: Vec<(u16, Vec<u8>)>,
        texts: Vec<String>,
    }

    /// Records everything; never fails.
    #[derive(Clone, Default)]
    struct MockSink {
        log: Arc<Mutex<SinkLog>>,
    }

    impl MockSink {
        fn log(&self) -> Arc<Mutex<SinkLog>> {
            Arc::clone(&self.log)
        }
    }

    impl FrameSink for MockSink {
        fn send_frame(&mut self, command: u16, payload: &[u8]) -> Result<()> {
            self.log.lock().unwrap().frames.push((command, payload.to_vec()));
            Ok(())
        }

        fn send_text(&mut self, text: &str) -> Result<()> {
            self.log.lock().unwrap().texts.push(text.to_string());
            Ok(())
        }
    }

    fn connected_transport() -> (MspTransport<MockSink>, Arc<Mutex<SinkLog>>) {
        let sink = MockSink::default();
        let log = sink.log();
        let transport = MspTransport::new(sink);
        transport.connect();
        (transport, log)
    }

    fn wait_for_frames(log: &Arc<Mutex<SinkLog>>, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while log.lock().unwrap().frames.len() < count {
            assert!(Instant::now() < deadline, "no frame {count} on the wire");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_request_response_round_trip() {
        let (transport, log) = connected_transport();

        let responder = transport.clone();
        let handle = thread::spawn(move || {
            responder.send_request(108, &[1, 2], Duration::from_secs(1))
        });

        wait_for_frames(&log, 1);
        transport.handle_response(108, vec![9, 9]);

        assert_eq!(handle.join().unwrap().unwrap(), vec![9, 9]);
        assert_eq!(log.lock().unwrap().frames[0], (108, vec![1, 2]));
    }

    #[test]
    fn test_single_flight_serializes_same_command() {
        let (transport, log) = connected_transport();

        let mut workers = Vec::new();
        for _ in 0..2 {
            let t = transport.clone();
            workers.push(thread::spawn(move || {
                t.send_request(101, &[], Duration::from_secs(2))
            }));
        }

        // The second frame must not hit the wire before the first exchange
        // resolves.
        wait_for_frames(&log, 1);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(log.lock().unwrap().frames.len(), 1);

        transport.handle_response(101, vec![1]);
        wait_for_frames(&log, 2);
        transport.handle_response(101, vec![2]);

        let mut payloads: Vec<Vec<u8>> = workers
            .into_iter()
            .map(|w| w.join().unwrap().unwrap())
            .collect();
        payloads.sort();
        assert_eq!(payloads, vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_request_timeout_clears_pending() {
        let (transport, _log) = connected_transport();

        let err = transport
            .send_request(200, &[], Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolTimeout(_)));

        // A late response after the timeout is unsolicited, not a panic.
        transport.handle_response(200, vec![1]);
        assert!(transport.state().pending.is_empty());
    }

    #[test]
    fn test_cli_mode_refuses_requests_immediately() {
        let (transport, log) = connected_transport();
        transport.enter_cli_mode().unwrap();

        let started = Instant::now();
        let err = transport
            .send_request(42, &[], Duration::from_secs(5))
            .unwrap_err();

        assert!(matches!(err, Error::LinkUnavailable(_)));
        assert!(err.to_string().contains("CLI"));
        // Refused up front, not after the 5 s budget.
        assert!(started.elapsed() < Duration::from_secs(1));
        // Nothing was framed; only the CLI-enter text went out.
        assert!(log.lock().unwrap().frames.is_empty());
        assert_eq!(log.lock().unwrap().texts, vec!["#".to_string()]);
    }

    #[test]
    fn test_entering_cli_cancels_pending_requests() {
        let (transport, log) = connected_transport();

        let requester = transport.clone();
        let handle = thread::spawn(move || {
            requester.send_request(66, &[], Duration::from_secs(10))
        });
        wait_for_frames(&log, 1);

        let started = Instant::now();
        transport.enter_cli_mode().unwrap();

        let err = handle.join().unwrap().unwrap_err();
        assert!(err.is_aborted());
        assert!(err.to_string().contains("CLI"));
        // Cancelled, not timed out.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_disconnect_resets_state() {
        let (transport, log) = connected_transport();
        transport.enter_cli_mode().unwrap();
        transport.handle_text("stale\n");
        let _unused = log;

        transport.disconnect();
        assert_eq!(transport.mode(), LinkMode::Closed);
        assert!(matches!(
            transport.send_request(1, &[], Duration::from_millis(10)),
            Err(Error::LinkUnavailable(_))
        ));

        transport.connect();
        assert_eq!(transport.mode(), LinkMode::Msp);
        assert!(transport.state().cli_lines.is_empty());
    }

    #[test]
    fn test_config_lock_is_reentrant() {
        let (transport, _log) = connected_transport();
        assert!(!transport.telemetry_paused());

        let outer = transport.config_lock();
        assert!(transport.telemetry_paused());
        {
            let _inner = transport.config_lock();
            assert!(transport.telemetry_paused());
        }
        // Dropping the nested guard keeps telemetry paused.
        assert!(transport.telemetry_paused());

        drop(outer);
        assert!(!transport.telemetry_paused());
    }

    #[test]
    fn test_cli_text_is_line_buffered() {
        let (transport, _log) = connected_transport();
        transport.enter_cli_mode().unwrap();

        transport.handle_text("set acc_h");
        transport.handle_text("ardware = AUTO\r\nsaved\r\n");

        let st = transport.state();
        assert_eq!(
            st.cli_lines,
            vec!["set acc_hardware = AUTO".to_string(), "saved".to_string()]
        );
    }

    #[test]
    fn test_fallback_takes_cli_path_on_timeout() {
        let (transport, log) = connected_transport();

        let feeder = transport.clone();
        let feeder_log = Arc::clone(&log);
        let handle = thread::spawn(move || {
            // Wait for the CLI command to go out, then echo it back clean.
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                let texts = feeder_log.lock().unwrap().texts.clone();
                if texts.iter().any(|t| t.starts_with("set servo")) {
                    break;
                }
                assert!(Instant::now() < deadline, "CLI command never sent");
                thread::sleep(Duration::from_millis(1));
            }
            feeder.handle_text("set servo = 1500\n");
        });

        // No responder: the MSP attempt times out and triggers the fallback.
        let path = transport
            .write_config_with_fallback(212, &[0x01], "set servo = 1500", Duration::from_millis(80))
            .unwrap();
        handle.join().unwrap();

        assert_eq!(path, ConfigWritePath::Cli);
        // Back on the binary channel afterwards.
        assert_eq!(transport.mode(), LinkMode::Msp);
    }

    #[test]
    fn test_fallback_surfaces_parse_error_as_unsupported() {
        let (transport, log) = connected_transport();

        let feeder = transport.clone();
        let feeder_log = Arc::clone(&log);
        let handle = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                let texts = feeder_log.lock().unwrap().texts.clone();
                if texts.iter().any(|t| t.starts_with("set bogus")) {
                    break;
                }
                assert!(Instant::now() < deadline, "CLI command never sent");
                thread::sleep(Duration::from_millis(1));
            }
            feeder.handle_text("Parse error\n");
        });

        let err = transport
            .write_config_with_fallback(212, &[], "set bogus = 1", Duration::from_millis(80))
            .unwrap_err();
        handle.join().unwrap();

        assert!(matches!(err, Error::Unsupported(_)));
        assert_eq!(transport.mode(), LinkMode::Msp);
    }

    #[test]
    fn test_device_failure_resolves_pending() {
        let (transport, log) = connected_transport();

        let requester = transport.clone();
        let handle = thread::spawn(move || {
            requester.send_request(77, &[], Duration::from_secs(2))
        });
        wait_for_frames(&log, 1);

        transport.handle_failure(
            77,
            Error::ProtocolRejected("command 77 not supported".to_string()),
        );
        let err = handle.join().unwrap().unwrap_err();
        assert!(triggers_cli_fallback(&err, 77));
    }
}
