//! Upload command implementation.

use anyhow::{Context, Result};
use console::style;
use espota::{FirmwareImage, UploadCommand, UploadJob, UploadOutcome, Uploader};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::env;
use std::io::Write as _;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, CliError, ProgressMode, UploadArgs, use_fancy_output};

/// Seconds to wait for each invitation reply when nothing is configured.
const DEFAULT_INVITE_TIMEOUT_SECS: u64 = 10;

/// Upload command implementation.
pub(crate) fn cmd_upload(cli: &Cli, config: &Config, args: &UploadArgs) -> Result<()> {
    let address = args
        .address
        .clone()
        .or_else(|| config.device.address.clone())
        .ok_or_else(|| {
            CliError::Usage(
                "no device address given (use --address, ESPOTA_ADDRESS, or the config file)"
                    .to_string(),
            )
        })?;
    let port = args
        .port
        .or(config.device.port)
        .unwrap_or(espota::protocol::DEFAULT_DEVICE_PORT);
    let password = resolve_password(cli, config, args)?;

    let spiffs = args.spiffs || config.upload.spiffs;
    let strict = args.strict || config.upload.strict;
    let timeout = args
        .timeout
        .or(config.upload.timeout)
        .unwrap_or(DEFAULT_INVITE_TIMEOUT_SECS);
    let progress_mode = args
        .progress
        .or_else(|| config.upload.progress_mode())
        .unwrap_or(ProgressMode::Bar);

    // Stage the image (digest the whole file up front)
    if !cli.quiet {
        eprintln!(
            "{} Staging {}",
            style("📦").cyan(),
            style(args.firmware.display()).bold()
        );
    }
    let image = FirmwareImage::open(&args.firmware)
        .with_context(|| format!("cannot stage {}", args.firmware.display()))?;
    let size = image.size();
    if !cli.quiet {
        eprintln!(
            "{} {} ({} bytes, md5 {})",
            style("ℹ").blue(),
            image.filename(),
            size,
            image.md5_hex()
        );
    }

    crate::install_interrupt_handler();

    let mut job = UploadJob::new(address.clone(), image)
        .with_device_port(port)
        .with_bind_addr(args.bind.clone())
        .with_password(password)
        .with_invite_timeout(Duration::from_secs(timeout))
        .with_force_md5(args.force_md5)
        .with_strict(strict);
    if spiffs {
        job = job.with_command(UploadCommand::Spiffs);
    }
    if let Some(host_port) = args.host_port {
        job = job.with_host_port(host_port);
    }

    let uploader = Uploader::new(job).context("cannot bind the connect-back listener")?;
    debug!("Connect-back listener bound to port {}", uploader.host_port());
    if !cli.quiet {
        eprintln!(
            "{} Uploading to {}:{} (connect-back port {})",
            style("📡").cyan(),
            style(&address).green(),
            port,
            uploader.host_port()
        );
    }

    let reporter = ProgressReporter::new(progress_mode, size, cli.quiet);
    let result = uploader.run(&mut |sent, _total| reporter.update(sent));
    reporter.finish();

    match result? {
        UploadOutcome::Confirmed => {
            if !cli.quiet {
                eprintln!("{} Upload confirmed", style("🎉").green().bold());
            }
        }
        UploadOutcome::Degraded(last) => {
            eprintln!(
                "{} Device never sent the final OK (last reply: {last:?}); assuming it rebooted into the new firmware",
                style("⚠").yellow()
            );
        }
    }

    Ok(())
}

/// Resolve the OTA password: flag value, prompt, environment, config,
/// in that order. Missing everywhere means an unauthenticated upload.
fn resolve_password(cli: &Cli, config: &Config, args: &UploadArgs) -> Result<String> {
    match &args.auth {
        Some(Some(password)) => Ok(password.clone()),
        Some(None) => {
            if cli.non_interactive {
                return Err(CliError::Usage(
                    "--auth needs a value in non-interactive mode".to_string(),
                )
                .into());
            }
            let password = dialoguer::Password::new()
                .with_prompt("OTA password")
                .allow_empty_password(true)
                .interact()
                .context("failed to read the password prompt")?;
            Ok(password)
        }
        None => {
            if let Ok(password) = env::var("ESPOTA_PASSWORD") {
                return Ok(password);
            }
            Ok(config.device.password.clone().unwrap_or_default())
        }
    }
}

/// Terminal progress rendering for the streaming phase.
enum ProgressReporter {
    Hidden,
    Bar(ProgressBar),
    Ticks,
}

impl ProgressReporter {
    fn new(mode: ProgressMode, total: u64, quiet: bool) -> Self {
        if quiet {
            return Self::Hidden;
        }
        match mode {
            ProgressMode::Bar => {
                if !use_fancy_output() {
                    return Self::Hidden;
                }
                let pb = ProgressBar::new(total);
                #[allow(clippy::unwrap_used)] // Static template string
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template(
                            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
                        )
                        .unwrap()
                        .progress_chars("#>-"),
                );
                pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                Self::Bar(pb)
            }
            ProgressMode::Ticks => Self::Ticks,
        }
    }

    fn update(&self, sent: u64) {
        match self {
            Self::Hidden => {}
            Self::Bar(pb) => pb.set_position(sent),
            Self::Ticks => {
                eprint!(".");
                let _ = std::io::stderr().flush();
            }
        }
    }

    fn finish(&self) {
        match self {
            Self::Hidden => {}
            Self::Bar(pb) => pb.finish_and_clear(),
            Self::Ticks => eprintln!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    // UploadArgs is not Clone, so parse twice to own both pieces.
    fn parse(argv: &[&str]) -> (Cli, UploadArgs) {
        let cli = Cli::try_parse_from(argv).unwrap();
        let owned = Cli::try_parse_from(argv).unwrap();
        let crate::Commands::Upload(args) = owned.command else {
            panic!("Expected Upload command");
        };
        (cli, args)
    }

    #[test]
    fn test_password_from_flag_wins_over_config() {
        let (cli, args) = parse(&["espota", "upload", "fw.bin", "--auth", "flagpw"]);
        let mut config = Config::default();
        config.device.password = Some("configpw".to_string());

        let password = resolve_password(&cli, &config, &args).unwrap();
        assert_eq!(password, "flagpw");
    }

    #[test]
    fn test_password_from_config_when_flag_absent() {
        let (cli, args) = parse(&["espota", "upload", "fw.bin"]);
        let mut config = Config::default();
        config.device.password = Some("configpw".to_string());

        // ESPOTA_PASSWORD would shadow the config value; the test
        // environment does not set it.
        if env::var("ESPOTA_PASSWORD").is_err() {
            let password = resolve_password(&cli, &config, &args).unwrap();
            assert_eq!(password, "configpw");
        }
    }

    #[test]
    fn test_password_defaults_to_empty() {
        let (cli, args) = parse(&["espota", "upload", "fw.bin"]);
        if env::var("ESPOTA_PASSWORD").is_err() {
            let password = resolve_password(&cli, &Config::default(), &args).unwrap();
            assert_eq!(password, "");
        }
    }

    #[test]
    fn test_prompt_refused_when_non_interactive() {
        let (cli, args) = parse(&["espota", "--non-interactive", "upload", "fw.bin", "--auth"]);
        let err = resolve_password(&cli, &Config::default(), &args).unwrap_err();
        assert_eq!(crate::exit_code_for(&err), 2);
    }

    #[test]
    fn test_quiet_reporter_is_hidden() {
        let reporter = ProgressReporter::new(ProgressMode::Bar, 1024, true);
        assert!(matches!(reporter, ProgressReporter::Hidden));
    }

    #[test]
    fn test_ticks_reporter_survives_quiet_off() {
        let reporter = ProgressReporter::new(ProgressMode::Ticks, 1024, false);
        assert!(matches!(reporter, ProgressReporter::Ticks));
    }
}
