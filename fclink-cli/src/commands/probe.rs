//! STM32 bootloader probe command implementation.

use anyhow::Result;
use console::style;

use crate::Cli;
use crate::commands::get_port;
use crate::config::Config;

pub(crate) fn run(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let port = get_port(cli, config)?;

    if !cli.quiet && !json {
        eprintln!(
            "{} Probing {} for the STM32 ROM bootloader...",
            style("🔍").cyan(),
            style(&port).cyan()
        );
    }

    let found = fclink::stm32::probe(&port)?;

    if json {
        let value = match &found {
            Some(chip) => serde_json::json!({
                "detected": true,
                "chip_id": format!("{:#06x}", chip.chip_id),
                "name": chip.name,
                "baud": chip.baud_rate,
            }),
            None => serde_json::json!({ "detected": false }),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_default()
        );
        return Ok(());
    }

    match found {
        Some(chip) => {
            eprintln!(
                "{} Chip id {} at {} baud: {}",
                style("✓").green().bold(),
                style(format!("{:#06x}", chip.chip_id)).cyan(),
                chip.baud_rate,
                chip.name.unwrap_or("unknown part")
            );
        },
        None => {
            // Normal outcome: the board simply is not in this bootloader.
            eprintln!(
                "{} No STM32 bootloader detected on {port}",
                style("ℹ").blue()
            );
        },
    }

    Ok(())
}
