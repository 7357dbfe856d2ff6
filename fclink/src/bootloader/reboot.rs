//! Strategies for coaxing a flight controller into bootloader mode.
//!
//! Two independent mechanisms, tried in order:
//!
//! 1. A MAVLink `COMMAND_LONG` asking the autopilot to reboot and hold in
//!    its bootloader.
//! 2. A raw NSH shell sequence (`"\r\r\r"` to wake the console, then
//!    `"reboot -b\n"`), for firmware that exposes a NuttX shell on the
//!    same port.
//!
//! Both are fire-and-forget: the board cannot acknowledge, it just drops
//! the link while rebooting. The caller picks the settle delay based on
//! whether any command was written at all.

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::Result;
use crate::port::{LinkOpener, Port};
use crate::protocol::mavlink;

/// Pause between waking the NSH console and issuing the reboot command.
const NSH_WAKE_DELAY: Duration = Duration::from_millis(200);

/// Settle delay after a reboot command was written.
pub const SETTLE_AFTER_COMMAND: Duration = Duration::from_secs(4);

/// Settle delay when no strategy managed to write a command (the board
/// may already be sitting in its bootloader).
pub const SETTLE_NO_COMMAND: Duration = Duration::from_secs(2);

/// What the reboot ladder managed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootOutcome {
    /// A reboot command was written to the link.
    CommandSent,
    /// No strategy could write anything.
    NoCommand,
}

impl RebootOutcome {
    /// The settle delay to apply before re-opening the link.
    pub fn settle_delay(self) -> Duration {
        match self {
            Self::CommandSent => SETTLE_AFTER_COMMAND,
            Self::NoCommand => SETTLE_NO_COMMAND,
        }
    }
}

/// Try each reboot strategy in order; best effort, never fails hard.
///
/// The caller must have closed its own link first: every strategy opens a
/// fresh one and closes it again before returning.
pub fn enter_bootloader<O: LinkOpener>(opener: &mut O) -> RebootOutcome {
    info!("Requesting reboot into bootloader");

    match send_mavlink_reboot(opener) {
        Ok(()) => {
            debug!("MAVLink reboot command written");
            return RebootOutcome::CommandSent;
        },
        Err(e) => debug!("MAVLink reboot failed, trying NSH: {e}"),
    }

    match send_nsh_reboot(opener) {
        Ok(()) => {
            debug!("NSH reboot command written");
            RebootOutcome::CommandSent
        },
        Err(e) => {
            warn!("No reboot strategy succeeded: {e}");
            RebootOutcome::NoCommand
        },
    }
}

/// Strategy 1: MAVLink reboot-to-bootloader, broadcast to any autopilot.
fn send_mavlink_reboot<O: LinkOpener>(opener: &mut O) -> Result<()> {
    let mut port = opener.open_link()?;
    let frame = mavlink::reboot_to_bootloader_frame(0, 0);
    let result = port.write_all_bytes(&frame);
    let _ = port.close();
    result
}

/// Strategy 2: wake an NSH console and ask it to reboot into the
/// bootloader.
fn send_nsh_reboot<O: LinkOpener>(opener: &mut O) -> Result<()> {
    let mut port = opener.open_link()?;
    let result = (|| {
        port.write_all_bytes(b"\r\r\r")?;
        thread::sleep(NSH_WAKE_DELAY);
        port.write_all_bytes(b"reboot -b\n")
    })();
    let _ = port.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{MockOpener, MockPort};

    #[test]
    fn test_mavlink_strategy_wins_when_link_opens() {
        let port = MockPort::new();
        let writes = port.writes_handle();
        let mut opener = MockOpener::with_ports(vec![port]);

        let outcome = enter_bootloader(&mut opener);
        assert_eq!(outcome, RebootOutcome::CommandSent);

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0][0], mavlink::STX_V1);
    }

    #[test]
    fn test_nsh_fallback_when_first_open_fails() {
        let port = MockPort::new();
        let writes = port.writes_handle();
        // First open (MAVLink strategy) fails, second (NSH) succeeds.
        let mut opener = MockOpener::with_ports(vec![port]).fail_first_opens(1);

        let outcome = enter_bootloader(&mut opener);
        assert_eq!(outcome, RebootOutcome::CommandSent);

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"\r\r\r".to_vec());
        assert_eq!(writes[1], b"reboot -b\n".to_vec());
    }

    #[test]
    fn test_no_command_when_nothing_opens() {
        let mut opener = MockOpener::with_ports(vec![]).fail_first_opens(2);
        let outcome = enter_bootloader(&mut opener);
        assert_eq!(outcome, RebootOutcome::NoCommand);
        assert_eq!(outcome.settle_delay(), SETTLE_NO_COMMAND);
        assert_eq!(
            RebootOutcome::CommandSent.settle_delay(),
            SETTLE_AFTER_COMMAND
        );
    }
}
