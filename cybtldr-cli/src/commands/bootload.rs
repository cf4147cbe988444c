//! Program, erase and verify command implementations.

use anyhow::{Context, Result};
use console::style;
use cybtldr::transport::DEFAULT_BAUD_RATE;
use cybtldr::{
    AbortHandle, Action, Bootloader, Error, FirmwareImage, NativeTransport, Progress, SecurityKey,
    SerialConfig, TransferConfig,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, CliError, get_port, use_fancy_output, was_interrupted};

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Security key from the command line or the configuration.
fn resolve_key(cli: &Cli, config: &Config) -> Result<Option<SecurityKey>> {
    let Some(text) = cli
        .key
        .as_deref()
        .or(config.bootload.security_key.as_deref())
    else {
        return Ok(None);
    };

    text.parse()
        .map(Some)
        .map_err(|e| CliError::Usage(format!("invalid security key: {e}")).into())
}

/// Serial settings: command line first, then configuration, then defaults.
fn serial_config(cli: &Cli, config: &Config, port: &str) -> SerialConfig {
    let baud = cli
        .baud
        .or(config.port.baud)
        .unwrap_or(DEFAULT_BAUD_RATE);
    let mut serial = SerialConfig::new(port, baud);

    if let Some(size) = cli.max_transfer.or(config.port.max_transfer_size) {
        serial = serial.with_max_transfer_size(size);
    }
    if let Some(ms) = config.port.timeout_ms {
        serial = serial.with_timeout(Duration::from_millis(ms));
    }
    serial
}

/// Polling settings: command line first, then configuration, then defaults.
fn transfer_config(cli: &Cli, config: &Config) -> TransferConfig {
    let mut transfer = TransferConfig::default();

    if let Some(polls) = cli.max_polls.or(config.transfer.max_polls) {
        transfer = transfer.with_max_polls(polls);
    }
    if let Some(ms) = config.transfer.poll_interval_ms {
        transfer = transfer.with_poll_interval(Duration::from_millis(ms));
    }
    transfer.with_deadline(
        cli.deadline_ms
            .or(config.transfer.deadline_ms)
            .map(Duration::from_millis),
    )
}

/// Map a failed session to the CLI error classes.
///
/// Every library failure names its composed code so scripts can branch on it.
fn session_error(action: Action, err: Error) -> anyhow::Error {
    let code = err.code();
    if matches!(err, Error::Aborted) {
        return CliError::Cancelled(format!("{action} aborted (code {code:#06x})")).into();
    }
    anyhow::Error::new(err).context(format!("{action} failed with code {code:#06x}"))
}

fn progress_bar(cli: &Cli, total: usize) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total as u64);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Run `action` over the image at `firmware`.
pub(crate) fn cmd_bootload(
    cli: &Cli,
    config: &mut Config,
    action: Action,
    firmware: &Path,
    app_id: Option<u8>,
    abort: &AbortHandle,
) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading image {}",
            style("📦").cyan(),
            firmware.display()
        );
    }

    let image = FirmwareImage::open(firmware)
        .with_context(|| format!("Failed to load image {}", firmware.display()))?;
    let version = image
        .version()
        .with_context(|| format!("Unsupported image {}", firmware.display()))?;
    debug!("Image format version {version}, {} lines", image.line_count());

    let key = resolve_key(cli, config)?;
    let app_id = app_id
        .or(config.bootload.app_id)
        .unwrap_or(0);

    let port = get_port(cli, config)?;
    let serial = serial_config(cli, config, &port);
    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            serial.port_name,
            serial.baud_rate
        );
    }

    ensure_not_interrupted()?;

    let mut bootloader = Bootloader::new(NativeTransport::new(serial))
        .with_transfer_config(transfer_config(cli, config))
        .with_abort_handle(abort.clone());

    let pb = progress_bar(cli, image.line_count());
    pb.set_message(action.to_string());

    let result = bootloader.run_action(
        action,
        &image,
        key.as_ref(),
        app_id,
        &mut |p: &Progress| {
            // A Ctrl+C that raced the session start must still stop the loop.
            if was_interrupted() {
                abort.abort();
            }
            pb.set_length(p.total_lines as u64);
            pb.set_position(p.line as u64);
        },
    );

    if let Err(err) = result {
        pb.abandon();
        return Err(session_error(action, err));
    }
    pb.finish_with_message("done");

    if !cli.quiet {
        let verb = match action {
            Action::Program => "Programming",
            Action::Erase => "Erase",
            Action::Verify => "Verification",
        };
        eprintln!("\n{} {verb} completed", style("✓").green().bold());
    }

    Ok(())
}
