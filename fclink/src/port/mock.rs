//! Scripted in-memory port for protocol tests.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::port::{LinkOpener, Port};

/// One step of a scripted read sequence.
#[derive(Debug, Clone)]
pub enum ReadStep {
    /// Bytes the "device" sends.
    Data(Vec<u8>),
    /// No response: the next read times out.
    Silence,
}

/// A scripted port: reads pop from a step queue, writes are recorded.
///
/// Writes are kept behind an `Arc` so tests can inspect them after the
/// port has been moved into (and closed by) the code under test.
pub struct MockPort {
    reads: VecDeque<ReadStep>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    timeout: Duration,
    baud: u32,
    closed: bool,
}

impl MockPort {
    /// Create a port with an empty script (every read times out).
    pub fn new() -> Self {
        Self {
            reads: VecDeque::new(),
            writes: Arc::new(Mutex::new(Vec::new())),
            timeout: Duration::from_millis(1000),
            baud: 115200,
            closed: false,
        }
    }

    /// Append device bytes to the script.
    pub fn push_data(&mut self, data: impl Into<Vec<u8>>) {
        self.reads.push_back(ReadStep::Data(data.into()));
    }

    /// Append a timed-out read to the script.
    pub fn push_silence(&mut self) {
        self.reads.push_back(ReadStep::Silence);
    }

    /// Handle for inspecting recorded writes after the port is consumed.
    pub fn writes_handle(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.writes)
    }

    /// Whether any recorded write frame starts with `byte`.
    pub fn wrote_frame_starting_with(writes: &Arc<Mutex<Vec<Vec<u8>>>>, byte: u8) -> bool {
        writes
            .lock()
            .unwrap()
            .iter()
            .any(|w| w.first() == Some(&byte))
    }
}

impl Default for MockPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn clear_buffers(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn set_dtr(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "port closed",
            ));
        }

        match self.reads.front_mut() {
            Some(ReadStep::Data(data)) => {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                data.drain(..n);
                if data.is_empty() {
                    self.reads.pop_front();
                }
                Ok(n)
            },
            Some(ReadStep::Silence) => {
                self.reads.pop_front();
                // A real port would block for the full timeout; tests only
                // need the TimedOut outcome, so keep the delay short.
                std::thread::sleep(self.timeout.min(Duration::from_millis(10)));
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "scripted silence",
                ))
            },
            None => {
                std::thread::sleep(self.timeout.min(Duration::from_millis(10)));
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "script exhausted",
                ))
            },
        }
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "port closed",
            ));
        }
        self.writes.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Opener handing out a queue of scripted ports.
pub struct MockOpener {
    ports: VecDeque<MockPort>,
    fail_opens: usize,
    pub opens: usize,
}

impl MockOpener {
    /// Create an opener with the given port queue.
    pub fn with_ports(ports: Vec<MockPort>) -> Self {
        Self {
            ports: ports.into(),
            fail_opens: 0,
            opens: 0,
        }
    }

    /// Make the first `n` open attempts fail.
    #[must_use]
    pub fn fail_first_opens(mut self, n: usize) -> Self {
        self.fail_opens = n;
        self
    }
}

impl LinkOpener for MockOpener {
    type Link = MockPort;

    fn open_link(&mut self) -> Result<Self::Link> {
        self.opens += 1;
        if self.fail_opens > 0 {
            self.fail_opens -= 1;
            return Err(Error::LinkUnavailable("scripted open failure".to_string()));
        }
        self.ports
            .pop_front()
            .ok_or_else(|| Error::LinkUnavailable("no scripted port left".to_string()))
    }
}
