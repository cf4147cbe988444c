//! cybtldr CLI - Command-line tool for the Cypress/Infineon bootloader.
//!
//! ## Features
//!
//! - Program, erase and verify `.cyacd` / `.cyacd2` images
//! - Offline image inspection
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use cybtldr::{AbortHandle, Action};
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use commands::bootload::cmd_bootload;
use commands::completions::{cmd_completions, cmd_completions_install};
use commands::info::{cmd_info, cmd_list_ports};
use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl+C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Check if Ctrl+C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Failures that map to a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation or setup; exit code 2.
    #[error("{0}")]
    Usage(String),
    /// Cancelled by the user; exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Exit code for an error that ended the program.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<CliError>())
        .map_or(1, CliError::exit_code)
}

/// cybtldr - Host tool for the Cypress/Infineon packet bootloader.
///
/// Environment variables:
///   CYBTLDR_PORT              - Default serial port
///   CYBTLDR_BAUD              - Default baud rate (default: 115200)
///   CYBTLDR_KEY               - Security key (12 hex digits)
///   CYBTLDR_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "cybtldr")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "CYBTLDR_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "CYBTLDR_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Bootloader security key (12 hex digits).
    #[arg(short, long, global = true, env = "CYBTLDR_KEY", hide_env_values = true)]
    pub(crate) key: Option<String>,

    /// Largest packet sent to the device at once.
    #[arg(long, global = true, value_name = "BYTES")]
    pub(crate) max_transfer: Option<usize>,

    /// Read polls per command before giving up.
    #[arg(long, global = true, value_name = "N")]
    pub(crate) max_polls: Option<u32>,

    /// Wall-clock limit for each command response.
    #[arg(long, global = true, value_name = "MS")]
    pub(crate) deadline_ms: Option<u64>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "CYBTLDR_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    pub(crate) confirm_port: bool,

    /// Offer all available ports (including unknown types).
    #[arg(long, global = true)]
    pub(crate) list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Program an image and verify it.
    Program {
        /// Path to the .cyacd or .cyacd2 image.
        firmware: PathBuf,

        /// Application slot (1 or 2) on dual-application bootloaders.
        #[arg(long)]
        app_id: Option<u8>,
    },

    /// Erase every row of an image.
    Erase {
        /// Path to the .cyacd or .cyacd2 image.
        firmware: PathBuf,

        /// Application slot (1 or 2) on dual-application bootloaders.
        #[arg(long)]
        app_id: Option<u8>,
    },

    /// Compare an image with the device.
    Verify {
        /// Path to the .cyacd or .cyacd2 image.
        firmware: PathBuf,

        /// Application slot (1 or 2) on dual-application bootloaders.
        #[arg(long)]
        app_id: Option<u8>,
    },

    /// Show information about an image.
    Info {
        /// Path to the .cyacd or .cyacd2 image.
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
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

fn init_logging(cli: &Cli) {
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
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    debug!(
        "cybtldr v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let abort = AbortHandle::default();
    let handler_abort = abort.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        INTERRUPTED.store(true, Ordering::SeqCst);
        handler_abort.abort();
    }) {
        debug!("Could not install Ctrl+C handler: {e}");
    }

    match run(&cli, &abort) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn run(cli: &Cli, abort: &AbortHandle) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Program { firmware, app_id } => {
            cmd_bootload(cli, &mut config, Action::Program, firmware, *app_id, abort)
        },
        Commands::Erase { firmware, app_id } => {
            cmd_bootload(cli, &mut config, Action::Erase, firmware, *app_id, abort)
        },
        Commands::Verify { firmware, app_id } => {
            cmd_bootload(cli, &mut config, Action::Verify, firmware, *app_id, abort)
        },
        Commands::Info { firmware, json } => cmd_info(firmware, *json),
        Commands::ListPorts { json } => cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g. `cybtldr completions bash`, \
                         or use `cybtldr completions --install`"
                            .to_string(),
                    )
                })?;
                cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Get serial port from CLI args, configuration or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive && cli.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_program() {
        let cli = Cli::try_parse_from([
            "cybtldr",
            "--port",
            "/dev/ttyACM0",
            "--baud",
            "57600",
            "--key",
            "0A0B0C0D0E0F",
            "program",
            "app.cyacd",
            "--app-id",
            "2",
        ])
        .unwrap();

        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(cli.baud, Some(57_600));
        assert_eq!(cli.key.as_deref(), Some("0A0B0C0D0E0F"));
        match cli.command {
            Commands::Program { firmware, app_id } => {
                assert_eq!(firmware, PathBuf::from("app.cyacd"));
                assert_eq!(app_id, Some(2));
            },
            _ => panic!("Expected Program command"),
        }
    }

    #[test]
    fn test_cli_parse_transfer_options() {
        let cli = Cli::try_parse_from([
            "cybtldr",
            "verify",
            "app.cyacd2",
            "--max-transfer",
            "57",
            "--max-polls",
            "500",
            "--deadline-ms",
            "2000",
        ])
        .unwrap();

        assert_eq!(cli.max_transfer, Some(57));
        assert_eq!(cli.max_polls, Some(500));
        assert_eq!(cli.deadline_ms, Some(2_000));
        assert!(matches!(cli.command, Commands::Verify { app_id: None, .. }));
    }

    #[test]
    fn test_cli_parse_erase_and_info() {
        let cli = Cli::try_parse_from(["cybtldr", "-q", "erase", "app.cyacd"]).unwrap();
        assert!(cli.quiet);
        assert!(matches!(cli.command, Commands::Erase { .. }));

        let cli = Cli::try_parse_from(["cybtldr", "info", "app.cyacd", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Info { json: true, .. }));
    }

    #[test]
    fn test_cli_program_requires_file() {
        assert!(Cli::try_parse_from(["cybtldr", "program"]).is_err());
    }

    #[test]
    fn test_cli_verbose_count() {
        let cli = Cli::try_parse_from(["cybtldr", "-vv", "list-ports"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["cybtldr", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions {
                shell: Some(Shell::Zsh),
                install: false
            }
        ));
    }

    #[test]
    fn test_exit_code_mapping() {
        let usage: anyhow::Error = CliError::Usage("bad".to_string()).into();
        assert_eq!(exit_code_for(&usage), 2);

        let cancelled: anyhow::Error = CliError::Cancelled("stop".to_string()).into();
        assert_eq!(exit_code_for(&cancelled.context("while programming")), 130);

        let other = anyhow::anyhow!("device failed");
        assert_eq!(exit_code_for(&other), 1);
    }
}
