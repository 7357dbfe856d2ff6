//! Interactive serial port selection.
//!
//! Flight controllers mostly show up as USB CDC-ACM devices from a small
//! set of vendors, so selection prefers recognized devices:
//! - Explicit `--port` always wins
//! - A port remembered in the configuration is used next
//! - Otherwise known flight-controller ports are offered, interactively
//!   via dialoguer or deterministically in non-interactive mode

use std::cmp::Ordering;

use anyhow::Result;
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use fclink::port::{NativePortEnumerator, PortEnumerator, PortInfo};
use log::debug;

use crate::CliError;
use crate::config::Config;

/// USB vendor ids that commonly carry flight controllers.
///
/// 0x0483 STMicroelectronics (most F4/F7/H7 boards), 0x26AC 3D Robotics,
/// 0x2DAE CubePilot, 0x1209 pid.codes (ArduPilot allocations),
/// 0x3162 Holybro, 0x27AC mRo.
const KNOWN_FC_VENDORS: &[u16] = &[0x0483, 0x26AC, 0x2DAE, 0x1209, 0x3162, 0x27AC];

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// List all ports (including unknown types).
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if ambiguous).
    pub non_interactive: bool,
}

/// Result of port selection including whether it was a known device.
pub struct SelectedPort {
    /// The selected port info.
    pub port: PortInfo,
    /// Whether this port matched a known/configured device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    // Selection failures are usage/setup problems (exit code 2), not
    // device faults.
    CliError::Usage(message.to_string()).into()
}

/// Whether a port looks like a flight controller (built-in vendor table
/// plus devices remembered in the configuration).
pub fn is_known_device(port: &PortInfo, config: &Config) -> bool {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return false;
    };
    KNOWN_FC_VENDORS.contains(&vid) || config.usb_device.iter().any(|d| d.matches(vid, pid))
}

fn named_port(name: &str, config: &Config) -> SelectedPort {
    // An explicitly named port may not be enumerable (symlinks, TCP
    // bridges); fall back to a bare entry.
    let ports = NativePortEnumerator::list_ports().unwrap_or_default();
    let port = ports
        .into_iter()
        .find(|p| p.name == name)
        .unwrap_or_else(|| PortInfo {
            name: name.to_string(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        });
    SelectedPort {
        is_known: is_known_device(&port, config),
        port,
    }
}

fn select_non_interactive(candidates: Vec<PortInfo>, config: &Config) -> Result<SelectedPort> {
    // Must be deterministic and never prompt: exactly one candidate is an
    // auto-selection, anything else is a setup problem.
    match candidates.len().cmp(&1) {
        Ordering::Equal => {
            let port = candidates.into_iter().next().unwrap_or_else(|| {
                unreachable!("candidates has exactly 1 element here")
            });
            Ok(SelectedPort {
                is_known: is_known_device(&port, config),
                port,
            })
        },
        Ordering::Greater => Err(usage_err(
            "multiple serial ports found; specify one with --port",
        )),
        Ordering::Less => Err(usage_err("no serial ports found")),
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    // If port explicitly specified, use it
    if let Some(port_name) = &options.port {
        return Ok(named_port(port_name, config));
    }

    // If port in config, use it
    if let Some(port_name) = &config.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(named_port(port_name, config));
    }

    let ports = NativePortEnumerator::list_ports().unwrap_or_default();
    if ports.is_empty() {
        return Err(usage_err("no serial ports found"));
    }

    // Prefer recognized flight-controller ports unless asked for all
    let known: Vec<PortInfo> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();
    let candidates = if options.list_all_ports || known.is_empty() {
        ports
    } else {
        known
    };

    if options.non_interactive {
        return select_non_interactive(candidates, config);
    }

    if candidates.len() == 1 {
        let port = candidates.into_iter().next().unwrap_or_else(|| {
            unreachable!("candidates has exactly 1 element here")
        });
        eprintln!(
            "{} Using port {}",
            style("→").green().bold(),
            style(&port.name).cyan()
        );
        return Ok(SelectedPort {
            is_known: is_known_device(&port, config),
            port,
        });
    }

    let labels: Vec<String> = candidates.iter().map(describe_port).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a serial port")
        .items(&labels)
        .default(0)
        .interact()
        .map_err(|e| usage_err(&format!("port selection cancelled: {e}")))?;

    let port = candidates
        .into_iter()
        .nth(selection)
        .ok_or_else(|| usage_err("port selection out of range"))?;
    Ok(SelectedPort {
        is_known: is_known_device(&port, config),
        port,
    })
}

/// Offer to remember an unrecognized device for future auto-detection.
pub fn ask_remember_port(port: &PortInfo, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };

    let remember = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Remember {} ({vid:04X}:{pid:04X}) as a flight controller?",
            port.name
        ))
        .default(false)
        .interact()
        .unwrap_or(false);

    if remember {
        config.remember_usb_device(vid, pid)?;
    }
    Ok(())
}

/// One-line human-readable description of a port.
pub fn describe_port(port: &PortInfo) -> String {
    let mut label = port.name.clone();
    if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        label.push_str(&format!(" ({vid:04X}:{pid:04X})"));
    }
    if let Some(product) = &port.product {
        label.push_str(&format!(" - {product}"));
    }
    label
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb_port(name: &str, vid: u16, pid: u16) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: Some(vid),
            pid: Some(pid),
            manufacturer: None,
            product: Some("Test Device".to_string()),
            serial_number: None,
        }
    }

    #[test]
    fn test_known_device_by_vendor_table() {
        let config = Config::default();
        assert!(is_known_device(&usb_port("/dev/ttyACM0", 0x2DAE, 0x1011), &config));
        assert!(!is_known_device(&usb_port("/dev/ttyUSB0", 0x10C4, 0xEA60), &config));
    }

    #[test]
    fn test_known_device_from_config() {
        let mut config = Config::default();
        config.usb_device.push(crate::config::UsbDevice {
            vid: 0x10C4,
            pid: 0xEA60,
        });
        assert!(is_known_device(&usb_port("/dev/ttyUSB0", 0x10C4, 0xEA60), &config));
    }

    #[test]
    fn test_non_interactive_needs_exactly_one_candidate() {
        let config = Config::default();

        let one = vec![usb_port("/dev/ttyACM0", 0x0483, 0x5740)];
        assert!(select_non_interactive(one, &config).is_ok());

        let none: Vec<PortInfo> = Vec::new();
        assert!(select_non_interactive(none, &config).is_err());

        let two = vec![
            usb_port("/dev/ttyACM0", 0x0483, 0x5740),
            usb_port("/dev/ttyACM1", 0x0483, 0x5740),
        ];
        assert!(select_non_interactive(two, &config).is_err());
    }

    #[test]
    fn test_describe_port_includes_ids_and_product() {
        let label = describe_port(&usb_port("/dev/ttyACM0", 0x0483, 0x5740));
        assert!(label.contains("/dev/ttyACM0"));
        assert!(label.contains("0483:5740"));
        assert!(label.contains("Test Device"));
    }
}
