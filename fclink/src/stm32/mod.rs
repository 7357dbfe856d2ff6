//! STM32 factory USART bootloader probe.
//!
//! Best-effort board identification against the ST ROM bootloader (AN3155),
//! not a flashing path. The exchange is tiny: sync with `0x7F`, then
//! `GET_ID` to read a 16-bit chip id that maps to a part family.
//!
//! ```text
//! Host:   [0x7F]
//! Device: [ACK]                      (or NACK when already synced)
//! Host:   [0x02][0xFD]               GET_ID + complement
//! Device: [len][idHigh][idLow][ACK]
//! ```
//!
//! The ROM bootloader auto-detects the baud rate from the sync byte's
//! timing and requires even parity, so the native probe walks a descending
//! baud ladder with 8E1 framing. DTR and RTS are held inactive throughout;
//! many boards wire them to reset/boot pins. Silence at every rate is the
//! normal "not in this bootloader" outcome, never an error.

use std::thread;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::port::Port;

/// Sync byte; the target measures its timing to lock the baud rate.
pub const SYNC: u8 = 0x7F;
/// Positive acknowledge.
pub const ACK: u8 = 0x79;
/// Negative acknowledge.
pub const NACK: u8 = 0x1F;

/// GET command, used only to confirm an already-synced bootloader.
const CMD_GET: u8 = 0x00;
/// GET_ID command.
const CMD_GET_ID: u8 = 0x02;

/// Budget for the sync-byte acknowledge.
const SYNC_TIMEOUT: Duration = Duration::from_millis(500);
/// Budget per command response byte.
const COMMAND_TIMEOUT: Duration = Duration::from_millis(200);
/// Sync attempts per baud rate.
const SYNC_ATTEMPTS: u32 = 3;
/// Pause between sync attempts.
const SYNC_BACKOFF: Duration = Duration::from_millis(100);

/// Baud rates to try, in descending order.
pub const BAUD_LADDER: [u32; 5] = [115_200, 57_600, 38_400, 19_200, 9_600];

/// Identity of a chip answering the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipInfo {
    /// 16-bit device id from `GET_ID`.
    pub chip_id: u16,
    /// Part family, when the id is known.
    pub name: Option<&'static str>,
    /// Baud rate the bootloader answered at.
    pub baud_rate: u32,
}

/// Map a `GET_ID` device id to its part family (AN2606 table).
pub fn chip_name(chip_id: u16) -> Option<&'static str> {
    let name = match chip_id {
        0x410 => "STM32F101/F102/F103 (medium density)",
        0x411 => "STM32F2xx",
        0x412 => "STM32F101/F102/F103 (low density)",
        0x413 => "STM32F405/F407/F415/F417",
        0x414 => "STM32F101/F102/F103 (high density)",
        0x418 => "STM32F105/F107",
        0x419 => "STM32F42x/F43x",
        0x421 => "STM32F446",
        0x423 | 0x433 | 0x431 => "STM32F4x1",
        0x440 => "STM32F05x",
        0x449 => "STM32F74x/F75x",
        0x450 => "STM32H74x/H75x",
        0x451 => "STM32F76x/F77x",
        0x452 => "STM32F72x/F73x",
        _ => return None,
    };
    Some(name)
}

/// Build a `[cmd][complement]` frame.
fn command(cmd: u8) -> [u8; 2] {
    [cmd, !cmd]
}

/// Read one byte; `None` when the device stays silent past `timeout`.
fn read_byte<P: Port>(port: &mut P, timeout: Duration) -> Result<Option<u8>> {
    port.set_timeout(timeout)?;
    let mut byte = [0u8; 1];
    loop {
        match port.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// Probe an open link for the STM32 ROM bootloader.
///
/// The port must already be framed 8E1 with DTR/RTS inactive. Returns
/// `Ok(None)` when nothing answers; `Err` only on link-level I/O faults.
pub fn probe_port<P: Port>(port: &mut P) -> Result<Option<ChipInfo>> {
    if !sync(port)? {
        return Ok(None);
    }

    port.write_all_bytes(&command(CMD_GET_ID))?;
    match read_byte(port, COMMAND_TIMEOUT)? {
        Some(ACK) => {},
        Some(other) => {
            debug!("GET_ID refused with {other:#04x}");
            return Ok(None);
        },
        None => return Ok(None),
    }

    // Reply is [len][len+1 id bytes][ACK]; the id is the first two bytes.
    let len = match read_byte(port, COMMAND_TIMEOUT)? {
        Some(len) => len as usize,
        None => return Ok(None),
    };
    let mut id_bytes = Vec::with_capacity(len + 1);
    for _ in 0..=len {
        match read_byte(port, COMMAND_TIMEOUT)? {
            Some(byte) => id_bytes.push(byte),
            None => return Ok(None),
        }
    }
    // Trailing ACK; tolerate its absence, the id is already in hand.
    let _ = read_byte(port, COMMAND_TIMEOUT)?;

    if id_bytes.len() < 2 {
        debug!("GET_ID reply too short: {id_bytes:02x?}");
        return Ok(None);
    }
    let chip_id = u16::from(id_bytes[0]) << 8 | u16::from(id_bytes[1]);

    debug!(
        "STM32 bootloader answered at {} baud, chip id {chip_id:#06x}",
        port.baud_rate()
    );

    Ok(Some(ChipInfo {
        chip_id,
        name: chip_name(chip_id),
        baud_rate: port.baud_rate(),
    }))
}

/// Run the sync handshake; `Ok(false)` means nothing answered.
fn sync<P: Port>(port: &mut P) -> Result<bool> {
    for attempt in 1..=SYNC_ATTEMPTS {
        port.clear_buffers()?;
        port.write_all_bytes(&[SYNC])?;

        match read_byte(port, SYNC_TIMEOUT)? {
            Some(ACK) => return Ok(true),
            Some(NACK) => {
                // A NACK usually means the bootloader is already synced
                // from an earlier probe; confirm with a harmless GET.
                debug!("Sync NACKed, confirming with GET");
                port.write_all_bytes(&command(CMD_GET))?;
                if read_byte(port, COMMAND_TIMEOUT)? == Some(ACK) {
                    port.clear_buffers()?;
                    return Ok(true);
                }
            },
            Some(other) => debug!("Unexpected sync reply {other:#04x}"),
            None => debug!("No sync reply (attempt {attempt}/{SYNC_ATTEMPTS})"),
        }

        if attempt < SYNC_ATTEMPTS {
            thread::sleep(SYNC_BACKOFF);
        }
    }
    Ok(false)
}

/// Probe a serial port across the baud ladder.
///
/// Opens the port 8E1 at each rate in turn; the first rate the bootloader
/// answers at wins. `Ok(None)` when no rate gets an answer.
#[cfg(feature = "native")]
pub fn probe(port_name: &str) -> Result<Option<ChipInfo>> {
    use crate::port::{LinkOpener, Parity, SerialConfig, SerialLinkOpener};

    for baud in BAUD_LADDER {
        debug!("Probing {port_name} for STM32 bootloader at {baud} baud");
        let config = SerialConfig::new(port_name, baud)
            .with_timeout(SYNC_TIMEOUT)
            .with_parity(Parity::Even);

        let mut port = SerialLinkOpener::new(config).open_link()?;
        port.set_dtr(false)?;
        port.set_rts(false)?;

        let found = probe_port(&mut port)?;
        let _ = port.close();

        if found.is_some() {
            return Ok(found);
        }
    }

    Ok(None)
}
