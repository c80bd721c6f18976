//! Quarry CLI: runs the research MCP server over stdio or HTTP.

mod commands;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Quarry: web-grounded research tools for MCP clients
#[derive(Parser, Debug)]
#[command(name = "quarry", version, about, long_about = None)]
struct Cli {
    /// Serve MCP over HTTP instead of stdio
    #[arg(long)]
    http: bool,

    /// Host to bind in HTTP mode
    #[arg(long)]
    host: Option<String>,

    /// Port to bind in HTTP mode
    #[arg(long)]
    port: Option<u16>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Validate configuration and credentials, then exit
    Check,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default config file to the user config directory
    Init,
    /// Print the effective configuration (secrets masked)
    Show,
}

/// Dependencies that log too much at debug level.
const NOISY_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls"];

fn stderr_filter(verbose: u8, quiet: bool) -> anyhow::Result<EnvFilter> {
    let level = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let mut filter = if verbose == 0 && !quiet {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    } else {
        EnvFilter::new(level)
    };
    for target in NOISY_TARGETS {
        filter = filter.add_directive(format!("{target}=warn").parse()?);
    }
    Ok(filter)
}

fn log_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "quarry", "quarry")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Daily-rotated JSON log writer under `dir`, created if missing.
fn json_file_writer(dir: &Path) -> std::io::Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)?;
    let file_appender = tracing_appender::rolling::daily(dir, "quarry.log");
    Ok(tracing_appender::non_blocking(file_appender))
}

/// Human-readable logs on stderr plus a daily JSON log file.
///
/// Stdout is reserved for protocol traffic in stdio mode. When the log
/// directory cannot be created only stderr logging is set up.
fn init_logging(verbose: u8, quiet: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter(verbose, quiet)?);

    let dir = log_dir();
    let (json_layer, guard, file_error) = match json_file_writer(&dir) {
        Ok((writer, guard)) => {
            let mut file_filter = EnvFilter::new("debug");
            for target in NOISY_TARGETS {
                file_filter = file_filter.add_directive(format!("{target}=warn").parse()?);
            }
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(file_filter);
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    if let Some(e) = file_error {
        tracing::warn!(dir = %dir.display(), error = %e, "File logging disabled");
    }
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Values in .env win over the inherited environment.
    let _ = dotenvy::dotenv_override();

    let cli = Cli::parse();
    let _guard = init_logging(cli.verbose, cli.quiet)?;

    let mut config = quarry_core::load_config(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    match cli.command {
        Some(Commands::Check) => commands::check(&config).await,
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init => commands::config_init(),
            ConfigAction::Show => commands::config_show(&config),
        },
        None if cli.http => commands::serve_http(&config).await,
        None => commands::serve_stdio(&config).await,
    }
}
