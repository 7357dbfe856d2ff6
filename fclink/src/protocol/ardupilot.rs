//! ArduPilot serial bootloader wire protocol.
//!
//! Byte-level vocabulary of the custom bootloader that ArduPilot boards
//! expose after reset (115200 8N1). Commands are single bytes terminated
//! by [`EOC`]; the device answers [`INSYNC`] followed by a status byte.
//!
//! ```text
//! Host:   [cmd] ([args...]) [EOC]
//! Device: [INSYNC] [OK | FAILED | INVALID]
//! ```
//!
//! `PROG_MULTI` carries one chunk of firmware bytes:
//!
//! ```text
//! +------+-----------+--------------+------+
//! | 0x27 | len <=252 |  len bytes   | 0x20 |
//! +------+-----------+--------------+------+
//! ```

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::port::Port;

/// Request sync / no-op probe.
pub const GET_SYNC: u8 = 0x21;
/// Query one device-info parameter.
pub const GET_DEVICE: u8 = 0x22;
/// Erase the application flash.
pub const CHIP_ERASE: u8 = 0x23;
/// Program one chunk of firmware bytes.
pub const PROG_MULTI: u8 = 0x27;
/// Read the CRC32 the device computes over its whole flash.
pub const GET_CRC: u8 = 0x29;
/// Reboot into the freshly-written application.
pub const REBOOT: u8 = 0x30;
/// End-of-command marker, terminates every command.
pub const EOC: u8 = 0x20;

/// First response byte of every reply.
pub const INSYNC: u8 = 0x12;
/// Command accepted.
pub const OK: u8 = 0x10;
/// Command understood but failed.
pub const FAILED: u8 = 0x11;
/// Command not understood / bad state.
pub const INVALID: u8 = 0x13;

/// Maximum payload of one `PROG_MULTI` frame: a multiple of 4, one below
/// the protocol's 255-byte length-field ceiling.
pub const PROG_MULTI_MAX: usize = 252;

/// `GET_DEVICE` sub-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceParam {
    /// Bootloader protocol revision.
    BlRev = 1,
    /// Board type identifier.
    BoardId = 2,
    /// Board hardware revision.
    BoardRev = 3,
    /// Application flash size in bytes.
    FlashSize = 4,
}

impl DeviceParam {
    /// Human-readable name, used in timeout/error messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::BlRev => "bootloader revision",
            Self::BoardId => "board id",
            Self::BoardRev => "board revision",
            Self::FlashSize => "flash size",
        }
    }
}

/// Build a bare `[cmd][EOC]` frame.
pub fn command(cmd: u8) -> [u8; 2] {
    [cmd, EOC]
}

/// Build a `[GET_DEVICE][param][EOC]` frame.
pub fn get_device(param: DeviceParam) -> [u8; 3] {
    [GET_DEVICE, param as u8, EOC]
}

/// Build a `PROG_MULTI` frame for one chunk.
///
/// Callers must keep `chunk` within [`PROG_MULTI_MAX`]; the split is done
/// by [`chunks`].
pub fn prog_multi(chunk: &[u8]) -> Vec<u8> {
    debug_assert!(chunk.len() <= PROG_MULTI_MAX);
    let mut frame = Vec::with_capacity(chunk.len() + 3);
    frame.push(PROG_MULTI);
    // Safe cast, bounded by PROG_MULTI_MAX
    frame.push(chunk.len() as u8);
    frame.extend_from_slice(chunk);
    frame.push(EOC);
    frame
}

/// Split a firmware image into `PROG_MULTI`-sized chunks.
///
/// Produces `ceil(len / 252)` chunks; all but possibly the last are full
/// 252-byte (4-aligned) chunks, and their concatenation is the image.
pub fn chunks(image: &[u8]) -> impl Iterator<Item = &[u8]> {
    image.chunks(PROG_MULTI_MAX)
}

/// Read exactly `buf.len()` bytes within `timeout`.
///
/// Uses the port's own blocking read timeout trimmed to the remaining
/// deadline rather than polling. Short reads accumulate until the buffer
/// is full or the deadline passes.
pub fn read_exact_within<P: Port>(
    port: &mut P,
    buf: &mut [u8],
    timeout: Duration,
    what: &str,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;

    while filled < buf.len() {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or_else(|| {
                Error::ProtocolTimeout(format!(
                    "no complete response while waiting for {what} ({}/{} bytes)",
                    filled,
                    buf.len()
                ))
            })?;

        port.set_timeout(remaining)?;
        match port.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(Error::LinkUnavailable(format!(
                    "link closed while waiting for {what}"
                )));
            },
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(Error::ProtocolTimeout(format!(
                    "no complete response while waiting for {what} ({}/{} bytes)",
                    filled,
                    buf.len()
                )));
            },
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
            Err(e) => return Err(Error::Io(e)),
        }
    }

    Ok(())
}

/// Read and check the `[INSYNC][OK]` trailer within `timeout`.
///
/// `FAILED`/`INVALID` status bytes map to [`Error::ProtocolRejected`];
/// anything else on the wire is treated the same way (the stream is
/// desynchronized).
pub fn read_sync<P: Port>(port: &mut P, timeout: Duration, what: &str) -> Result<()> {
    let mut resp = [0u8; 2];
    read_exact_within(port, &mut resp, timeout, what)?;

    if resp[0] != INSYNC {
        return Err(Error::ProtocolRejected(format!(
            "expected INSYNC for {what}, got {:#04x}",
            resp[0]
        )));
    }
    match resp[1] {
        OK => Ok(()),
        FAILED => Err(Error::ProtocolRejected(format!(
            "device reported FAILED for {what}"
        ))),
        INVALID => Err(Error::ProtocolRejected(format!(
            "device reported INVALID for {what}"
        ))),
        other => Err(Error::ProtocolRejected(format!(
            "bad status byte {other:#04x} for {what}"
        ))),
    }
}
