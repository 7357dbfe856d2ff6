//! Flash command implementation.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use console::style;
use fclink::port::{SerialConfig, SerialLinkOpener};
use fclink::{ArdupilotFlasher, FirmwareImage, FlashState};
use indicatif::{ProgressBar, ProgressStyle};

use crate::Cli;
use crate::commands::get_port;
use crate::config::Config;

/// Read/write timeout for the bootloader link; protocol waits set their
/// own per-exchange budgets on top.
const LINK_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn run(cli: &Cli, config: &mut Config, firmware: &Path, no_reboot: bool) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware from {}",
            style("📦").cyan(),
            firmware.display()
        );
    }

    let image = FirmwareImage::load(firmware)
        .with_context(|| format!("failed to load firmware from {}", firmware.display()))?;

    if !cli.quiet {
        let board = if image.board_id == 0 {
            "any".to_string()
        } else {
            image.board_id.to_string()
        };
        eprintln!(
            "{} {} bytes for board id {} (CRC32 {:#010x})",
            style("ℹ").blue(),
            image.len(),
            board,
            fclink::crc32(&image.bytes, 0)
        );
    }

    let port = get_port(cli, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            style(&port).cyan(),
            cli.baud
        );
    }

    let serial_config = SerialConfig::new(&port, cli.baud).with_timeout(LINK_TIMEOUT);
    let mut flasher =
        ArdupilotFlasher::new(SerialLinkOpener::new(serial_config)).with_reboot_strategies(!no_reboot);

    let pb = if cli.quiet || !console::Term::stderr().is_term() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let result = flasher.flash(&image, &mut |event| {
        pb.set_position(u64::from(event.progress));
        pb.set_message(event.message.clone());
        if event.state == FlashState::Complete {
            pb.finish_with_message("Complete");
        }
    });

    if !pb.is_finished() {
        pb.abandon();
    }

    if result.success {
        let summary = result.message.as_deref().unwrap_or("Firmware written");
        if !cli.quiet {
            let verify_note = match result.verified {
                Some(true) => " (verified)",
                None => " (bootloader too old to verify)",
                Some(false) => "",
            };
            eprintln!(
                "\n{} {summary}{verify_note} in {:.1}s",
                style("🎉").green().bold(),
                result.duration.as_secs_f32()
            );
        }
        Ok(())
    } else {
        let error = result
            .error
            .unwrap_or_else(|| "unknown flash failure".to_string());
        if result.verified == Some(false) {
            // The image is on the board; only the readback check failed.
            eprintln!(
                "{} Firmware written but not verified",
                style("⚠").yellow().bold()
            );
        }
        bail!("flash failed: {error}");
    }
}
