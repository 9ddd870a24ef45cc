//! odrived: Object Drive daemon
//!
//! Usage:
//!   odrived [--config /etc/odrive/config.toml] [--log info] [--log-format json|text]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};

use odrive_core::config::OdriveConfig;
use odrived::daemon;

#[derive(Parser, Debug)]
#[command(name = "odrived", version, about = "Object Drive daemon")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(
        long,
        short = 'c',
        env = "ODRIVE_CONFIG",
        default_value = "/etc/odrive/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides server.log_level
    #[arg(long, env = "ODRIVE_LOG")]
    log: Option<String>,

    /// Log format; overrides server.log_format
    #[arg(long, env = "ODRIVE_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logging settings may come from the file, so read it before logging starts.
    let loaded = load_config(&cli.config).await;
    let (level, format) = match &loaded {
        Ok(Some(cfg)) => (
            cli.log
                .clone()
                .unwrap_or_else(|| cfg.server.log_level.clone()),
            cli.log_format
                .clone()
                .unwrap_or_else(|| parse_format(&cfg.server.log_format)),
        ),
        _ => (
            cli.log.clone().unwrap_or_else(|| "info".into()),
            cli.log_format.clone().unwrap_or(LogFormat::Json),
        ),
    };
    init_logging(&level, &format);

    let config = match loaded {
        Ok(Some(cfg)) => cfg,
        Ok(None) => {
            warn!(
                "config file not found: {}  (using defaults)",
                cli.config.display()
            );
            OdriveConfig::default()
        }
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "odrived starting"
    );

    match daemon::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = daemon::exit_code_for(&e);
            error!(exit_code = code, "fatal: {e:#}");
            ExitCode::from(code)
        }
    }
}

fn parse_format(raw: &str) -> LogFormat {
    if raw.eq_ignore_ascii_case("text") {
        LogFormat::Text
    } else {
        LogFormat::Json
    }
}

async fn load_config(path: &Path) -> Result<Option<OdriveConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
    let config = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
    Ok(Some(config))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
