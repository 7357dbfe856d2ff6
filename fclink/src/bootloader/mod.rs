//! ArduPilot bootloader flashing.
//!
//! [`session::BootloaderSession`] implements the command/response state
//! machine against one open link; [`session::ArdupilotFlasher`] drives a
//! whole flash attempt (sync, device info, erase, program, verify,
//! reboot) including the reboot-to-bootloader recovery path, and reduces
//! it to exactly one [`FlashResult`].

pub mod reboot;
pub mod session;

pub use session::{ArdupilotFlasher, BootloaderSession, DeviceInfo, SessionState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Error, Result};

/// Phase of a flash attempt, as reported to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    /// Loading/validating inputs, opening the link.
    Preparing,
    /// Rebooting the board into its bootloader.
    EnteringBootloader,
    /// Chip erase in progress.
    Erasing,
    /// Writing firmware chunks.
    Flashing,
    /// CRC verification.
    Verifying,
    /// Rebooting into the new firmware.
    Rebooting,
    /// Terminal success.
    Complete,
}

/// Progress report emitted during a flash attempt.
///
/// Monotonic in practice but not enforced; retries may re-emit lower
/// percentages.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Current phase.
    pub state: FlashState,
    /// Overall progress, 0..=100.
    pub progress: u8,
    /// Human-readable status line.
    pub message: String,
    /// Bytes written so far (programming phase only).
    pub bytes_written: Option<usize>,
    /// Total bytes to write (programming phase only).
    pub total_bytes: Option<usize>,
}

impl ProgressEvent {
    /// Create an event without byte counters.
    pub fn new(state: FlashState, progress: u8, message: impl Into<String>) -> Self {
        Self {
            state,
            progress,
            message: message.into(),
            bytes_written: None,
            total_bytes: None,
        }
    }

    /// Create a programming-phase event with byte counters.
    pub fn flashing(progress: u8, written: usize, total: usize) -> Self {
        Self {
            state: FlashState::Flashing,
            progress,
            message: format!("Flashing {written}/{total} bytes"),
            bytes_written: Some(written),
            total_bytes: Some(total),
        }
    }
}

/// Terminal outcome of one flash attempt. Exactly one per attempt.
#[derive(Debug, Clone)]
pub struct FlashResult {
    /// Whether the firmware was written (and, where attempted, verified).
    pub success: bool,
    /// Error description for failures.
    pub error: Option<String>,
    /// Human-readable summary.
    pub message: Option<String>,
    /// CRC verification outcome: `None` when the bootloader is too old to
    /// support verification, `Some(false)` when the image was written but
    /// the CRC did not match.
    pub verified: Option<bool>,
    /// Wall-clock duration of the attempt.
    pub duration: Duration,
}

impl FlashResult {
    fn success(verified: Option<bool>, duration: Duration) -> Self {
        let message = match verified {
            Some(true) => "Firmware written and verified",
            _ => "Firmware written",
        };
        Self {
            success: true,
            error: None,
            message: Some(message.to_string()),
            verified,
            duration,
        }
    }

    fn failure(error: &Error, duration: Duration) -> Self {
        // A CRC mismatch means the write itself went through; word it as
        // "written but not verified" rather than implying corruption.
        let verified = if error.is_verification_mismatch() {
            Some(false)
        } else {
            None
        };
        let message = if error.is_verification_mismatch() {
            Some("Firmware written but not verified".to_string())
        } else {
            None
        };
        Self {
            success: false,
            error: Some(error.to_string()),
            message,
            verified,
            duration,
        }
    }
}

/// Cooperative cancellation handle for a flash attempt.
///
/// Abort is checked at chunk/step boundaries, so cancellation latency is
/// bounded by one chunk's timeout window, not immediate.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Create a new, un-aborted handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the flash attempt.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Process-wide flash lock.
///
/// A firmware flash and an MSP session must never race on the same port;
/// the flashing path takes this token before opening its link.
static FLASH_LOCK: Mutex<()> = Mutex::new(());

/// Held token proving this process owns the flashing path.
pub struct FlashLock {
    _guard: MutexGuard<'static, ()>,
}

impl FlashLock {
    /// Acquire the flash lock, waiting for any in-flight flash to finish.
    pub fn acquire() -> Self {
        let guard = FLASH_LOCK
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Self { _guard: guard }
    }

    /// Acquire the flash lock without blocking.
    ///
    /// Fails if another flash attempt is already in progress; callers that
    /// want immediate feedback (a UI "flash" button) use this instead of
    /// [`FlashLock::acquire`].
    pub fn try_acquire() -> Result<Self> {
        match FLASH_LOCK.try_lock() {
            Ok(guard) => Ok(Self { _guard: guard }),
            Err(std::sync::TryLockError::WouldBlock) => Err(Error::LinkUnavailable(
                "another firmware flash is already in progress".to_string(),
            )),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => Ok(Self {
                _guard: poisoned.into_inner(),
            }),
        }
    }
}
