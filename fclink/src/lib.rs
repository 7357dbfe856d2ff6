//! # fclink
//!
//! Device link and firmware-flashing protocol core for flight
//! controllers.
//!
//! This crate implements the serial protocol state machines a ground
//! station needs to talk to a flight controller:
//!
//! - ArduPilot serial bootloader sessions (sync, device info, erase,
//!   program, CRC verify, reboot) with a reboot-into-bootloader recovery
//!   ladder
//! - APJ firmware container loading and the bootloader's zero-seeded
//!   CRC32
//! - MSP request/response transport with CLI-mode arbitration over one
//!   link
//! - STM32 ROM bootloader probing for board identification
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport`
//!   crate
//!
//! ## Features
//!
//! - `native` (default): real serial port support; disable it to use the
//!   protocol engines against your own [`port::Port`] implementation
//!
//! ## Example
//!
//! ```rust,no_run
//! use fclink::{ArdupilotFlasher, FirmwareImage};
//! use fclink::port::{SerialConfig, SerialLinkOpener};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::load("arducopter.apj")?;
//!
//!     let config = SerialConfig::new("/dev/ttyACM0", 115_200);
//!     let mut flasher = ArdupilotFlasher::new(SerialLinkOpener::new(config));
//!
//!     let result = flasher.flash(&image, &mut |event| {
//!         println!("{:3}% {}", event.progress, event.message);
//!     });
//!     println!("{:?}", result.message);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod bootloader;
pub mod error;
pub mod image;
pub mod msp;
pub mod port;
pub mod protocol;
pub mod stm32;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupt_requested() -> bool {
    INTERRUPT_CHECKER.get().is_some_and(|checker| checker())
}

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator, SerialLinkOpener};
pub use {
    bootloader::{
        AbortHandle, ArdupilotFlasher, BootloaderSession, DeviceInfo, FlashResult, FlashState,
        ProgressEvent, SessionState,
    },
    error::{Error, Result},
    image::FirmwareImage,
    msp::{ConfigWritePath, FrameSink, LinkMode, MspTransport},
    port::{LinkOpener, Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{crc32, crc32_erased},
    stm32::{ChipInfo, chip_name},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_defaults_to_false() {
        assert!(!is_interrupt_requested());

        // Registration is first-wins and must never report true unless the
        // registered checker does.
        set_interrupt_checker(|| false);
        assert!(!is_interrupt_requested());
    }
}
