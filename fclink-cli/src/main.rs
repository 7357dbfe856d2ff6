//! fclink CLI - flash and probe flight controllers from the command line.
//!
//! ## Features
//!
//! - Flash APJ firmware packages and raw binaries over the ArduPilot
//!   serial bootloader
//! - Probe boards for the STM32 ROM bootloader
//! - Inspect firmware files without touching hardware
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use env_logger::Env;
use log::debug;

mod commands;
mod config;
mod serial;

use config::Config;

/// Set by the Ctrl-C handler; polled by long-running library loops.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Errors that map to specific CLI exit codes.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// User/setup problem (bad invocation, no usable port). Exit code 2.
    #[error("{0}")]
    Usage(String),
}

/// fclink - flash and probe ArduPilot/MSP flight controllers.
///
/// Environment variables:
///   FCLINK_PORT              - Default serial port
///   FCLINK_BAUD              - Default baud rate (default: 115200)
///   FCLINK_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "fclink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "FCLINK_PORT")]
    port: Option<String>,

    /// Baud rate for the bootloader link.
    #[arg(
        short,
        long,
        global = true,
        default_value = "115200",
        env = "FCLINK_BAUD"
    )]
    baud: u32,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "FCLINK_NON_INTERACTIVE")]
    non_interactive: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash a firmware file (.apj or raw binary) over the ArduPilot
    /// bootloader.
    Flash {
        /// Path to the firmware file.
        firmware: PathBuf,

        /// Do not try to reboot a running autopilot into its bootloader
        /// when the first sync fails.
        #[arg(long)]
        no_reboot: bool,
    },

    /// Probe a board for the STM32 ROM bootloader and report its chip id.
    Probe {
        /// Output the probe result as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show information about a firmware file.
    Info {
        /// Path to the firmware file.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    // NO_COLOR and TTY detection
    let stderr_is_tty = console::Term::stderr().is_term();
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "fclink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // First Ctrl-C requests a cooperative abort; a second one kills the
    // process the normal way.
    let _ = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::Relaxed) {
            std::process::exit(130);
        }
        eprintln!("\nInterrupt requested, finishing current step...");
    });
    fclink::set_interrupt_checker(|| INTERRUPTED.load(Ordering::Relaxed));

    // Load configuration
    let mut cfg = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let outcome = match &cli.command {
        Commands::Flash {
            firmware,
            no_reboot,
        } => commands::flash::run(&cli, &mut cfg, firmware, *no_reboot),
        Commands::Probe { json } => commands::probe::run(&cli, &mut cfg, *json),
        Commands::Info { firmware, json } => commands::info::run(firmware, *json),
        Commands::ListPorts { json } => commands::ports::run(&cfg, *json),
        Commands::Completions { shell } => {
            commands::completions::run(*shell);
            Ok(())
        },
    };

    if let Err(error) = outcome {
        // Usage/setup failures exit 2 so scripts can distinguish them from
        // device/protocol failures (exit 1).
        if error.downcast_ref::<CliError>().is_some() {
            eprintln!("{} {error}", console::style("Error:").red().bold());
            std::process::exit(2);
        }
        return Err(error);
    }

    Ok(())
}
