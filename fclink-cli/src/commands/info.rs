//! Firmware info command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use fclink::FirmwareImage;

pub(crate) fn run(firmware: &Path, json: bool) -> Result<()> {
    let image = FirmwareImage::load(firmware)
        .with_context(|| format!("failed to load firmware from {}", firmware.display()))?;
    let crc = fclink::crc32(&image.bytes, 0);

    if json {
        let info = serde_json::json!({
            "path": firmware.display().to_string(),
            "board_id": image.board_id,
            "declared_size": image.declared_size,
            "padded_size": image.len(),
            "crc32": format!("{crc:#010x}"),
        });
        println!("{}", serde_json::to_string_pretty(&info).unwrap_or_default());
        return Ok(());
    }

    eprintln!("{}", style("Firmware information").bold().underlined());
    eprintln!("  File:          {}", firmware.display());
    if image.board_id == 0 {
        eprintln!("  Board id:      any (not declared)");
    } else {
        eprintln!("  Board id:      {}", image.board_id);
    }
    eprintln!("  Declared size: {} bytes", image.declared_size);
    eprintln!("  Padded size:   {} bytes", image.len());
    eprintln!("  CRC32:         {crc:#010x}");

    Ok(())
}
