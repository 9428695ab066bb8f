//! espota CLI - push over-the-air firmware updates to devices on the
//! local network.
//!
//! ## Features
//!
//! - UDP invitation with bounded retry
//! - Challenge-response authentication for all three device
//!   generations, with automatic fallback for MD5-era credentials
//! - TCP connect-back streaming with a progress bar or terse ticks
//! - Configuration file and environment variable support
//! - Shell completion generation

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Ctrl-C flag shared with the library's interrupt checkpoints.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Whether the user asked to stop.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Wire Ctrl-C into the library so uploads abort between I/O steps.
pub(crate) fn install_interrupt_handler() {
    espota::set_interrupt_checker(was_interrupted);
    let _ = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed));
}

/// espota - push OTA firmware updates to espota-compatible devices.
///
/// Environment variables:
///   ESPOTA_ADDRESS          - Default device address
///   ESPOTA_PORT             - Default device OTA port (default: 3232)
///   ESPOTA_PASSWORD         - OTA password
///   ESPOTA_NON_INTERACTIVE  - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "espota")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "ESPOTA_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Upload a firmware image to a device over the air.
    Upload(UploadArgs),

    /// Show the size and digest of a firmware image.
    Info {
        /// Path to the firmware image.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
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

/// Arguments for the upload command.
#[derive(clap::Args)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct UploadArgs {
    /// Path to the firmware image.
    pub firmware: PathBuf,

    /// Device address (IP or hostname).
    #[arg(short = 'i', long, env = "ESPOTA_ADDRESS")]
    pub address: Option<String>,

    /// Device OTA port.
    #[arg(short, long, env = "ESPOTA_PORT")]
    pub port: Option<u16>,

    /// Local address to bind the data-channel listener to.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Local connect-back port (random if not specified).
    #[arg(long)]
    pub host_port: Option<u16>,

    /// OTA password; prompts when given without a value.
    #[arg(short = 'a', long, num_args = 0..=1)]
    pub auth: Option<Option<String>>,

    /// Upload a filesystem image instead of application firmware.
    #[arg(short, long)]
    pub spiffs: bool,

    /// Per-invitation reply timeout in seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Answer 64-character challenges with MD5-hashed credentials
    /// directly, skipping the SHA-256 attempt.
    #[arg(long)]
    pub force_md5: bool,

    /// Treat a truncated final confirmation as a failure.
    #[arg(long)]
    pub strict: bool,

    /// Progress rendering style.
    #[arg(long, value_enum)]
    pub progress: Option<ProgressMode>,
}

/// Progress rendering styles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum ProgressMode {
    /// Carriage-return-updated bar with byte rate and elapsed time.
    Bar,
    /// One tick character per chunk.
    Ticks,
}

/// CLI-level failures that map to specific exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Missing or unusable user input.
    #[error("{0}")]
    Usage(String),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // NO_COLOR and TTY detection (clig.dev best practice)
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

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
        "espota v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Upload(args) => commands::upload::cmd_upload(cli, &config, args),
        Commands::Info { firmware, json } => commands::info::cmd_info(firmware, *json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        }
    }
}

/// Map an error chain to the process exit status.
///
/// Usage problems (including a zero-length image) exit 2, interruption
/// exits 130, everything else is a runtime failure.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return match cli_err {
                CliError::Usage(_) => 2,
            };
        }
        if let Some(lib_err) = cause.downcast_ref::<espota::Error>() {
            return match lib_err {
                espota::Error::Interrupted => 130,
                espota::Error::InvalidImage(_) => 2,
                _ => 1,
            };
        }
    }
    1
}
