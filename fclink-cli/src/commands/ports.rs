//! List-ports command implementation.

use anyhow::Result;
use console::style;
use fclink::port::{NativePortEnumerator, PortEnumerator};

use crate::config::Config;
use crate::serial::{describe_port, is_known_device};

pub(crate) fn run(config: &Config, json: bool) -> Result<()> {
    let ports = NativePortEnumerator::list_ports()?;

    if json {
        let entries: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "known": is_known_device(p, config),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial_number,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &ports {
        let marker = if is_known_device(port, config) {
            style("•").green()
        } else {
            style("•").dim()
        };
        let known_note = if is_known_device(port, config) {
            format!(" [{}]", style("flight controller").yellow())
        } else {
            String::new()
        };
        eprintln!("  {marker} {}{known_note}", describe_port(port));
    }

    Ok(())
}
