//! ArduPilot bootloader session and flash orchestration.
//!
//! [`BootloaderSession`] owns one open link and implements the
//! command/response exchanges; its phase is an explicit [`SessionState`]
//! and every forward move goes through one transition check, so a command
//! can never be sent from the wrong state. [`ArdupilotFlasher`] owns the
//! link opener and drives a complete flash attempt, including the
//! reboot-into-bootloader recovery ladder when the board does not answer
//! the first sync round.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::bootloader::reboot;
use crate::bootloader::{AbortHandle, FlashLock, FlashResult, FlashState, ProgressEvent};
use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::port::{LinkOpener, Port};
use crate::protocol::ardupilot::{
    self, CHIP_ERASE, DeviceParam, GET_CRC, GET_SYNC, REBOOT, read_exact_within, read_sync,
};
use crate::protocol::crc::{crc32, crc32_erased};

/// Budget for one `INSYNC`/`OK` reply to `GET_SYNC`.
const SYNC_TIMEOUT: Duration = Duration::from_millis(1000);

/// Pause between sync attempts after a rejection or silence.
const SYNC_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Sync attempts on the happy path.
pub const SYNC_ATTEMPTS_INITIAL: u32 = 3;

/// Sync attempts after a recovery reboot.
pub const SYNC_ATTEMPTS_RECOVERY: u32 = 5;

/// Budget per device-info parameter exchange.
const DEVICE_INFO_TIMEOUT: Duration = Duration::from_millis(1000);

/// Budget for the chip erase; by far the slowest single exchange.
const ERASE_TIMEOUT: Duration = Duration::from_secs(20);

/// Budget per programmed chunk.
const PROGRAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for the device to compute and report its flash CRC.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Supported bootloader revision range.
const BL_REV_MIN: u32 = 2;
const BL_REV_MAX: u32 = 20;

/// Oldest bootloader revision with `GET_CRC` support.
const BL_REV_VERIFY: u32 = 3;

/// Phase of a bootloader session.
///
/// Forward transitions follow this order with no skipping (verification
/// is optional on old bootloaders); `Failed`/`Aborted` are reachable from
/// anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Link open, nothing exchanged yet.
    Idle,
    /// Attempting `GET_SYNC`.
    Syncing,
    /// Querying bootloader revision, board id/rev, flash size.
    ReadingDeviceInfo,
    /// Chip erase in flight.
    Erasing,
    /// Writing `PROG_MULTI` chunks.
    Programming,
    /// CRC readback in flight.
    Verifying,
    /// Reboot command issued.
    Rebooting,
    /// Terminal: flash attempt completed.
    Done,
    /// Terminal: flash attempt failed.
    Failed,
    /// Terminal: flash attempt cancelled.
    Aborted,
}

impl SessionState {
    fn may_advance_to(self, next: Self) -> bool {
        use SessionState as S;
        matches!(
            (self, next),
            (_, S::Failed)
                | (_, S::Aborted)
                | (S::Idle, S::Syncing)
                | (S::Syncing, S::ReadingDeviceInfo)
                | (S::ReadingDeviceInfo, S::Erasing)
                | (S::Erasing, S::Programming)
                | (S::Programming, S::Verifying)
                | (S::Programming, S::Rebooting)
                | (S::Verifying, S::Rebooting)
                | (S::Rebooting, S::Done)
        )
    }
}

/// Device identity and capacity reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Bootloader protocol revision.
    pub bl_rev: u32,
    /// Board type identifier.
    pub board_id: u32,
    /// Board hardware revision.
    pub board_rev: u32,
    /// Application flash size in bytes.
    pub flash_size: u32,
}

/// One bootloader session over one open link.
pub struct BootloaderSession<P: Port> {
    port: P,
    state: SessionState,
    info: Option<DeviceInfo>,
}

impl<P: Port> BootloaderSession<P> {
    /// Wrap an open link in a fresh session.
    pub fn new(port: P) -> Self {
        Self {
            port,
            state: SessionState::Idle,
            info: None,
        }
    }

    /// Current session phase.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Device info, available after [`BootloaderSession::read_device_info`].
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    /// Close the underlying link. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        self.port.close()
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        if self.state.may_advance_to(next) {
            debug!("Session {:?} -> {next:?}", self.state);
            self.state = next;
            Ok(())
        } else {
            Err(Error::LinkUnavailable(format!(
                "bootloader session cannot move from {:?} to {next:?}",
                self.state
            )))
        }
    }

    /// Move to the matching terminal state for `outcome`.
    fn mark_terminal(&mut self, outcome: &Result<Option<bool>>) {
        match outcome {
            Ok(_) => {}, // reboot() already advanced to Done
            Err(e) if e.is_aborted() => {
                let _ = self.transition(SessionState::Aborted);
            },
            Err(_) => {
                let _ = self.transition(SessionState::Failed);
            },
        }
    }

    /// One `GET_SYNC` exchange without retries or state changes.
    ///
    /// Also used as the pre-erase re-sync, where the session is already
    /// past `Syncing`.
    fn try_sync_once(&mut self) -> Result<()> {
        self.port.clear_buffers()?;
        self.port.write_all_bytes(&ardupilot::command(GET_SYNC))?;
        read_sync(&mut self.port, SYNC_TIMEOUT, "sync")
    }

    /// Synchronize with the bootloader, retrying up to `max_attempts`.
    ///
    /// Silence and `INVALID`/`FAILED` replies both count as "device
    /// present but busy" and are retried after discarding buffered input;
    /// anything else aborts immediately.
    pub fn sync(&mut self, max_attempts: u32) -> Result<()> {
        self.transition(SessionState::Syncing)?;

        for attempt in 1..=max_attempts {
            match self.try_sync_once() {
                Ok(()) => {
                    debug!("Synchronized on attempt {attempt}/{max_attempts}");
                    return Ok(());
                },
                Err(e @ (Error::ProtocolTimeout(_) | Error::ProtocolRejected(_))) => {
                    debug!("Sync attempt {attempt}/{max_attempts} failed: {e}");
                    if attempt < max_attempts {
                        let _ = self.port.clear_buffers();
                        thread::sleep(SYNC_RETRY_DELAY);
                    }
                },
                Err(other) => return Err(other),
            }
        }

        Err(Error::ProtocolTimeout(format!(
            "no sync after {max_attempts} attempts; likely causes: firmware built for a \
             different board, a board without a bootloader, or the port is in use by \
             another application"
        )))
    }

    /// One `GET_DEVICE` exchange: LE u32 value plus trailing sync.
    fn get_device_u32(&mut self, param: DeviceParam) -> Result<u32> {
        self.port.write_all_bytes(&ardupilot::get_device(param))?;
        let mut raw = [0u8; 4];
        read_exact_within(&mut self.port, &mut raw, DEVICE_INFO_TIMEOUT, param.name())?;
        read_sync(&mut self.port, DEVICE_INFO_TIMEOUT, param.name())?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Query bootloader revision, board id/revision and flash size.
    ///
    /// Any missing piece is a hard failure; no destructive command may be
    /// sent without complete device info.
    pub fn read_device_info(&mut self) -> Result<DeviceInfo> {
        self.transition(SessionState::ReadingDeviceInfo)?;

        let bl_rev = self.get_device_u32(DeviceParam::BlRev)?;
        let board_id = self.get_device_u32(DeviceParam::BoardId)?;
        let board_rev = self.get_device_u32(DeviceParam::BoardRev)?;
        let flash_size = self.get_device_u32(DeviceParam::FlashSize)?;

        info!(
            "Bootloader rev {bl_rev}, board id {board_id} rev {board_rev}, \
             flash {flash_size} bytes"
        );

        let info = DeviceInfo {
            bl_rev,
            board_id,
            board_rev,
            flash_size,
        };
        self.info = Some(info);
        Ok(info)
    }

    /// Validate device info against the firmware before anything
    /// destructive happens. Each failure is distinct and user-facing.
    pub fn validate(&self, image: &FirmwareImage) -> Result<()> {
        let info = self.info.ok_or_else(|| {
            Error::LinkUnavailable("device info not read before validation".to_string())
        })?;

        if !(BL_REV_MIN..=BL_REV_MAX).contains(&info.bl_rev) {
            return Err(Error::ValidationFailed(format!(
                "unsupported bootloader revision {} (expected {BL_REV_MIN}..={BL_REV_MAX})",
                info.bl_rev
            )));
        }
        if image.board_id != 0 && info.board_id != image.board_id {
            return Err(Error::ValidationFailed(format!(
                "firmware is built for board id {} but the device reports board id {}",
                image.board_id, info.board_id
            )));
        }
        if image.bytes.len() as u64 > u64::from(info.flash_size) {
            return Err(Error::ValidationFailed(format!(
                "firmware ({} bytes) does not fit in flash ({} bytes)",
                image.bytes.len(),
                info.flash_size
            )));
        }
        Ok(())
    }

    /// Erase the application flash.
    pub fn erase(&mut self) -> Result<()> {
        self.transition(SessionState::Erasing)?;

        // Sync can go stale after the device-info phase on some bootloader
        // builds; re-sync and re-read the revision right before erasing.
        self.try_sync_once()?;
        let _ = self.get_device_u32(DeviceParam::BlRev)?;

        info!("Erasing chip (may take up to {}s)", ERASE_TIMEOUT.as_secs());
        self.port.write_all_bytes(&ardupilot::command(CHIP_ERASE))?;
        read_sync(&mut self.port, ERASE_TIMEOUT, "chip erase")
    }

    /// Program the firmware image in `PROG_MULTI` chunks.
    ///
    /// The abort handle is checked once per chunk boundary, so
    /// cancellation latency is bounded by one chunk's timeout window.
    /// Progress covers 20..=80% of the overall attempt.
    pub fn program(
        &mut self,
        image: &FirmwareImage,
        abort: &AbortHandle,
        progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<()> {
        self.transition(SessionState::Programming)?;

        let total = image.bytes.len();
        let mut written = 0usize;

        for chunk in ardupilot::chunks(&image.bytes) {
            if abort.is_aborted() || crate::is_interrupt_requested() {
                return Err(Error::Aborted("flash cancelled while programming".to_string()));
            }

            self.port.write_all_bytes(&ardupilot::prog_multi(chunk))?;
            read_sync(&mut self.port, PROGRAM_TIMEOUT, "program chunk")?;

            written += chunk.len();
            // Safe cast, 20 + 0..=60
            let pct = (20 + written * 60 / total.max(1)) as u8;
            progress(ProgressEvent::flashing(pct, written, total));
        }

        Ok(())
    }

    /// Verify the written image against the bootloader's flash CRC.
    ///
    /// The device checksums its whole flash, so the expected value chains
    /// the firmware CRC with a virtual run of erased (`0xFF`) bytes out to
    /// the end of flash.
    pub fn verify(&mut self, image: &FirmwareImage) -> Result<()> {
        self.transition(SessionState::Verifying)?;

        let info = self.info.ok_or_else(|| {
            Error::LinkUnavailable("device info not read before verification".to_string())
        })?;

        let state = crc32(&image.bytes, 0);
        // Callers driving the session directly may not have validated the
        // image against the device info, so the fit is re-checked here.
        let padding = (info.flash_size as usize)
            .checked_sub(image.bytes.len())
            .ok_or_else(|| {
                Error::ValidationFailed(format!(
                    "firmware ({} bytes) does not fit in flash ({} bytes)",
                    image.bytes.len(),
                    info.flash_size
                ))
            })?;
        let expected = crc32_erased(state, padding);

        self.port.write_all_bytes(&ardupilot::command(GET_CRC))?;
        let mut raw = [0u8; 4];
        read_exact_within(&mut self.port, &mut raw, VERIFY_TIMEOUT, "flash CRC")?;
        read_sync(&mut self.port, VERIFY_TIMEOUT, "flash CRC")?;
        let actual = u32::from_le_bytes(raw);

        if actual != expected {
            warn!("Flash CRC mismatch: expected {expected:#010x}, device reported {actual:#010x}");
            return Err(Error::VerificationMismatch { expected, actual });
        }

        debug!("Flash CRC verified: {expected:#010x}");
        Ok(())
    }

    /// Reboot into the freshly written firmware.
    ///
    /// The board drops the link as soon as it reboots; a write error here
    /// is expected and not a failure.
    pub fn reboot(&mut self) -> Result<()> {
        self.transition(SessionState::Rebooting)?;

        if let Err(e) = self.port.write_all_bytes(&ardupilot::command(REBOOT)) {
            debug!("Reboot write failed (board likely already resetting): {e}");
        }

        self.transition(SessionState::Done)
    }
}

/// Drives complete flash attempts over links produced by an opener.
///
/// Owns the recovery ladder (close link, reboot strategies, settle,
/// reopen, resync) and guarantees the link is closed exactly once and the
/// flash lock released exactly once per attempt, through a single cleanup
/// path.
pub struct ArdupilotFlasher<O: LinkOpener> {
    opener: O,
    session: Option<BootloaderSession<O::Link>>,
    abort: AbortHandle,
    reboot_on_sync_failure: bool,
}

impl<O: LinkOpener> ArdupilotFlasher<O> {
    /// Create a flasher over the given link opener.
    pub fn new(opener: O) -> Self {
        Self {
            opener,
            session: None,
            abort: AbortHandle::new(),
            reboot_on_sync_failure: true,
        }
    }

    /// Enable or disable the reboot-to-bootloader recovery ladder.
    #[must_use]
    pub fn with_reboot_strategies(mut self, enabled: bool) -> Self {
        self.reboot_on_sync_failure = enabled;
        self
    }

    /// Handle for cancelling the attempt from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Run one complete flash attempt. Always returns exactly one
    /// terminal [`FlashResult`].
    pub fn flash(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(ProgressEvent),
    ) -> FlashResult {
        let started = Instant::now();
        let _lock = FlashLock::acquire();

        let outcome = self.run(image, progress);

        // Single cleanup path for every exit: close the link exactly once
        // here, release the flash lock when `_lock` drops.
        if let Some(mut session) = self.session.take() {
            session.mark_terminal(&outcome);
            let _ = session.close();
        }

        let duration = started.elapsed();
        match outcome {
            Ok(verified) => {
                progress(ProgressEvent::new(
                    FlashState::Complete,
                    100,
                    "Flash complete",
                ));
                FlashResult::success(verified, duration)
            },
            Err(e) => {
                warn!("Flash attempt failed after {duration:?}: {e}");
                FlashResult::failure(&e, duration)
            },
        }
    }

    fn run(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<Option<bool>> {
        progress(ProgressEvent::new(
            FlashState::Preparing,
            0,
            "Opening bootloader link",
        ));
        self.check_abort()?;

        self.session = Some(BootloaderSession::new(self.opener.open_link()?));

        // First sync round; if the board stays silent, walk the recovery
        // ladder once before giving up.
        if let Err(first) = self.session_mut()?.sync(SYNC_ATTEMPTS_INITIAL) {
            if !self.reboot_on_sync_failure {
                return Err(first);
            }
            info!("Initial sync failed ({first}); rebooting board into bootloader");
            progress(ProgressEvent::new(
                FlashState::EnteringBootloader,
                5,
                "Rebooting board into bootloader",
            ));

            if let Some(mut stale) = self.session.take() {
                let _ = stale.close();
            }
            let outcome = reboot::enter_bootloader(&mut self.opener);
            thread::sleep(outcome.settle_delay());
            self.check_abort()?;

            self.session = Some(BootloaderSession::new(self.opener.open_link()?));
            self.session_mut()?.sync(SYNC_ATTEMPTS_RECOVERY)?;
        }

        progress(ProgressEvent::new(
            FlashState::Preparing,
            10,
            "Reading device info",
        ));
        let info = self.session_mut()?.read_device_info()?;
        self.session_mut()?.validate(image)?;
        self.check_abort()?;

        progress(ProgressEvent::new(FlashState::Erasing, 15, "Erasing flash"));
        self.session_mut()?.erase()?;
        self.check_abort()?;

        progress(ProgressEvent::flashing(20, 0, image.bytes.len()));
        let abort = self.abort.clone();
        self.session_mut()?.program(image, &abort, &mut *progress)?;

        let verified = if info.bl_rev >= BL_REV_VERIFY {
            self.check_abort()?;
            progress(ProgressEvent::new(
                FlashState::Verifying,
                85,
                "Verifying flash CRC",
            ));
            self.session_mut()?.verify(image)?;
            Some(true)
        } else {
            debug!(
                "Bootloader rev {} predates CRC readback; skipping verification",
                info.bl_rev
            );
            None
        };

        progress(ProgressEvent::new(
            FlashState::Rebooting,
            95,
            "Rebooting into new firmware",
        ));
        self.session_mut()?.reboot()?;

        Ok(verified)
    }

    fn session_mut(&mut self) -> Result<&mut BootloaderSession<O::Link>> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::LinkUnavailable("no open bootloader session".to_string()))
    }

    fn check_abort(&self) -> Result<()> {
        if self.abort.is_aborted() || crate::is_interrupt_requested() {
            Err(Error::Aborted("flash cancelled".to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{MockOpener, MockPort};
    use crate::protocol::ardupilot::{INSYNC, OK, PROG_MULTI};

    const SYNC_OK: [u8; 2] = [INSYNC, OK];

    fn push_device_u32(port: &mut MockPort, value: u32) {
        let mut reply = value.to_le_bytes().to_vec();
        reply.extend_from_slice(&SYNC_OK);
        port.push_data(reply);
    }

    /// Expected GET_CRC reply for an image in a given flash.
    fn device_crc(image: &FirmwareImage, flash_size: u32) -> u32 {
        let state = crc32(&image.bytes, 0);
        crc32_erased(state, flash_size as usize - image.bytes.len())
    }

    /// Script a full happy-path exchange for `image`.
    fn happy_port(image: &FirmwareImage, bl_rev: u32, board_id: u32, flash_size: u32) -> MockPort {
        let mut port = MockPort::new();
        // Initial sync
        port.push_data(SYNC_OK);
        // Device info: bl_rev, board id, board rev, flash size
        push_device_u32(&mut port, bl_rev);
        push_device_u32(&mut port, board_id);
        push_device_u32(&mut port, 1);
        push_device_u32(&mut port, flash_size);
        // Pre-erase re-sync + revision re-read
        port.push_data(SYNC_OK);
        push_device_u32(&mut port, bl_rev);
        // Erase ack
        port.push_data(SYNC_OK);
        // One ack per programmed chunk
        for _ in 0..image.bytes.len().div_ceil(ardupilot::PROG_MULTI_MAX) {
            port.push_data(SYNC_OK);
        }
        // CRC readback
        if bl_rev >= BL_REV_VERIFY {
            let mut reply = device_crc(image, flash_size).to_le_bytes().to_vec();
            reply.extend_from_slice(&SYNC_OK);
            port.push_data(reply);
        }
        port
    }

    fn test_image(len: usize, board_id: u32) -> FirmwareImage {
        let mut image = FirmwareImage::from_raw((0..len).map(|i| (i % 256) as u8).collect());
        image.board_id = board_id;
        image
    }

    #[test]
    fn test_full_flash_success_and_verified() {
        let image = test_image(600, 9);
        let port = happy_port(&image, 5, 9, 4096);
        let writes = port.writes_handle();
        let mut flasher = ArdupilotFlasher::new(MockOpener::with_ports(vec![port]));

        let mut events = Vec::new();
        let result = flasher.flash(&image, &mut |e| events.push(e));

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.verified, Some(true));
        assert!(MockPort::wrote_frame_starting_with(&writes, REBOOT));
        assert!(MockPort::wrote_frame_starting_with(&writes, CHIP_ERASE));

        // 600 bytes -> 3 chunks
        let prog_frames = writes
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.first() == Some(&PROG_MULTI))
            .count();
        assert_eq!(prog_frames, 3);

        assert_eq!(events.last().unwrap().state, FlashState::Complete);
        assert_eq!(events.last().unwrap().progress, 100);
    }

    #[test]
    fn test_old_bootloader_skips_verification() {
        let image = test_image(100, 0);
        let port = happy_port(&image, 2, 7, 4096);
        let mut flasher = ArdupilotFlasher::new(MockOpener::with_ports(vec![port]));

        let result = flasher.flash(&image, &mut |_| {});
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.verified, None);
    }

    #[test]
    fn test_sync_retry_bound() {
        // Silent twice, answers on the third attempt: budget 3 passes.
        let mut port = MockPort::new();
        port.push_silence();
        port.push_silence();
        port.push_data(SYNC_OK);
        let mut session = BootloaderSession::new(port);
        assert!(session.sync(3).is_ok());

        // Same script with budget 2 fails.
        let mut port = MockPort::new();
        port.push_silence();
        port.push_silence();
        port.push_data(SYNC_OK);
        let mut session = BootloaderSession::new(port);
        let err = session.sync(2).unwrap_err();
        assert!(matches!(err, Error::ProtocolTimeout(_)));
    }

    #[test]
    fn test_rejected_sync_is_retried() {
        use crate::protocol::ardupilot::INVALID;
        let mut port = MockPort::new();
        port.push_data([INSYNC, INVALID]);
        port.push_data(SYNC_OK);
        let mut session = BootloaderSession::new(port);
        assert!(session.sync(3).is_ok());
    }

    #[test]
    fn test_board_id_mismatch_never_erases() {
        let image = test_image(100, 9);
        let mut port = MockPort::new();
        port.push_data(SYNC_OK);
        push_device_u32(&mut port, 5); // bl_rev
        push_device_u32(&mut port, 11); // device board id != 9
        push_device_u32(&mut port, 1);
        push_device_u32(&mut port, 4096);
        let writes = port.writes_handle();

        let mut flasher =
            ArdupilotFlasher::new(MockOpener::with_ports(vec![port])).with_reboot_strategies(false);
        let result = flasher.flash(&image, &mut |_| {});

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("board id"), "unexpected error: {error}");
        assert!(!MockPort::wrote_frame_starting_with(&writes, CHIP_ERASE));
        assert!(!MockPort::wrote_frame_starting_with(&writes, PROG_MULTI));
    }

    #[test]
    fn test_image_too_large_is_validation_failure() {
        let image = test_image(8192, 0);
        let mut port = MockPort::new();
        port.push_data(SYNC_OK);
        push_device_u32(&mut port, 5);
        push_device_u32(&mut port, 9);
        push_device_u32(&mut port, 1);
        push_device_u32(&mut port, 4096); // smaller than the image
        let writes = port.writes_handle();

        let mut flasher =
            ArdupilotFlasher::new(MockOpener::with_ports(vec![port])).with_reboot_strategies(false);
        let result = flasher.flash(&image, &mut |_| {});

        assert!(!result.success);
        assert!(result.error.unwrap().contains("does not fit"));
        assert!(!MockPort::wrote_frame_starting_with(&writes, CHIP_ERASE));
    }

    #[test]
    fn test_verify_rejects_oversized_image_without_validate() {
        // Session driven directly with validate() skipped: verify() must
        // refuse the oversized image, not panic or report a bogus CRC.
        let image = test_image(8, 0);
        let mut port = MockPort::new();
        port.push_data(SYNC_OK);
        push_device_u32(&mut port, 5); // bl_rev
        push_device_u32(&mut port, 9);
        push_device_u32(&mut port, 1);
        push_device_u32(&mut port, 4); // flash smaller than the image
        port.push_data(SYNC_OK); // pre-erase re-sync
        push_device_u32(&mut port, 5);
        port.push_data(SYNC_OK); // erase
        port.push_data(SYNC_OK); // single chunk
        let writes = port.writes_handle();

        let mut session = BootloaderSession::new(port);
        session.sync(1).unwrap();
        session.read_device_info().unwrap();
        session.erase().unwrap();
        session
            .program(&image, &AbortHandle::new(), &mut |_| {})
            .unwrap();
        let err = session.verify(&image).unwrap_err();

        assert!(matches!(err, Error::ValidationFailed(_)), "got: {err:?}");
        assert!(!MockPort::wrote_frame_starting_with(&writes, GET_CRC));
    }

    #[test]
    fn test_verification_mismatch_is_distinct() {
        let image = test_image(100, 0);
        let mut port = MockPort::new();
        port.push_data(SYNC_OK);
        push_device_u32(&mut port, 5);
        push_device_u32(&mut port, 9);
        push_device_u32(&mut port, 1);
        push_device_u32(&mut port, 4096);
        port.push_data(SYNC_OK); // pre-erase re-sync
        push_device_u32(&mut port, 5);
        port.push_data(SYNC_OK); // erase
        port.push_data(SYNC_OK); // single chunk
        let mut reply = 0xBAD0BAD0u32.to_le_bytes().to_vec();
        reply.extend_from_slice(&SYNC_OK);
        port.push_data(reply);

        let mut flasher =
            ArdupilotFlasher::new(MockOpener::with_ports(vec![port])).with_reboot_strategies(false);
        let result = flasher.flash(&image, &mut |_| {});

        assert!(!result.success);
        assert_eq!(result.verified, Some(false));
        assert_eq!(
            result.message.as_deref(),
            Some("Firmware written but not verified")
        );
    }

    #[test]
    fn test_abort_during_programming_is_bounded() {
        let image = test_image(600, 0);
        let mut port = MockPort::new();
        port.push_data(SYNC_OK); // chunk 1 ack; abort lands before chunk 2
        let writes = port.writes_handle();

        let mut session = BootloaderSession::new(port);
        session.state = SessionState::Erasing;
        session.info = Some(DeviceInfo {
            bl_rev: 5,
            board_id: 0,
            board_rev: 1,
            flash_size: 4096,
        });

        let abort = AbortHandle::new();
        let started = Instant::now();
        let aborter = abort.clone();
        // Abort after the first chunk completes.
        let mut chunks_done = 0;
        let err = session
            .program(&image, &abort, &mut |_| {
                chunks_done += 1;
                if chunks_done == 1 {
                    aborter.abort();
                }
            })
            .unwrap_err();

        assert!(err.is_aborted());
        // Terminal within one chunk-timeout window.
        assert!(started.elapsed() < PROGRAM_TIMEOUT);
        // Exactly one chunk written, and reboot never sent.
        let prog_frames = writes
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.first() == Some(&PROG_MULTI))
            .count();
        assert_eq!(prog_frames, 1);
        assert!(!MockPort::wrote_frame_starting_with(&writes, REBOOT));
    }

    #[test]
    fn test_recovery_reboot_then_flash() {
        let image = test_image(100, 0);

        // Session port 1: stays silent for all 3 initial attempts.
        let mut silent = MockPort::new();
        silent.push_silence();
        silent.push_silence();
        silent.push_silence();

        // Reboot strategy port (MAVLink frame lands here).
        let reboot_port = MockPort::new();
        let reboot_writes = reboot_port.writes_handle();

        // Session port 2: full happy path.
        let retry = happy_port(&image, 5, 0, 4096);

        let opener = MockOpener::with_ports(vec![silent, reboot_port, retry]);
        let mut flasher = ArdupilotFlasher::new(opener);

        let result = flasher.flash(&image, &mut |_| {});
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.verified, Some(true));

        // The MAVLink reboot frame went out on the strategy link.
        let writes = reboot_writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0][0], crate::protocol::mavlink::STX_V1);
    }

    #[test]
    fn test_session_rejects_out_of_order_commands() {
        let port = MockPort::new();
        let mut session = BootloaderSession::new(port);

        // Device info before sync must be refused without touching the wire.
        let err = session.read_device_info().unwrap_err();
        assert!(matches!(err, Error::LinkUnavailable(_)));

        // Erase before sync likewise.
        let err = session.erase().unwrap_err();
        assert!(matches!(err, Error::LinkUnavailable(_)));
    }
}
