//! hangwatch CLI - hang detection demo and trace tooling.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hangwatch_core::config::{HangwatchConfig, LogFormat};
use hangwatch_core::logging::init_logging;

/// hangwatch - detect, confirm and report primary-thread hangs.
#[derive(Parser)]
#[command(name = "hw")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a hangwatch TOML config file
    #[arg(short, long, global = true, env = "HANGWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty, json); overrides the config file
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stall a primary loop in-process and show the resulting hang report
    Demo {
        /// How long the injected task blocks the primary thread
        #[arg(long, default_value = "7000")]
        stall_ms: u64,

        /// Heartbeat age that raises a hang signal; overrides `[watchdog] stale_ms`
        #[arg(long)]
        stale_ms: Option<u64>,

        /// Pretend the process is in the background
        #[arg(long)]
        background: bool,

        /// Error-state JSON file to confirm with instead of the simulated one
        #[arg(long)]
        error_state: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Log a trace file line by line
    PrintTrace {
        /// Trace file to print
        file: PathBuf,
    },

    /// Validate and print the effective configuration
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<HangwatchConfig> {
    match path {
        Some(path) => Ok(HangwatchConfig::load_from(path)?),
        None => Ok(HangwatchConfig::default()),
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_ref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Demo {
            stall_ms,
            stale_ms,
            background,
            error_state,
            json,
        } => {
            if let Some(stale_ms) = stale_ms {
                config.watchdog.stale_ms = stale_ms;
                config.validate().map_err(hangwatch_core::Error::from)?;
            }
            commands::demo::run(
                &config,
                &commands::demo::DemoOptions {
                    stall_ms,
                    background,
                    error_state,
                    json,
                },
            )
        }
        Commands::PrintTrace { file } => commands::print_trace::run(&file),
        Commands::Config => commands::config::run(&config),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("Error: {err:#}");
        if let Some(remediation) = err
            .downcast_ref::<hangwatch_core::Error>()
            .and_then(hangwatch_core::Error::remediation)
        {
            eprint!("{}", remediation.render_plain());
        }
        std::process::exit(1);
    }
}
