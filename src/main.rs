// ABOUTME: Main entry point for the parley gateway server and its admin subcommands
// ABOUTME: Initializes logging, config, metrics, and stores, then serves the real-time channel

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use parley::auth::JwtTokenProvider;
use parley::config::{Config, LogFormat, LoggingConfig};
use parley::server::{self, AppState};

/// Multi-channel conversation gateway.
#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Multi-channel conversation gateway")]
struct Cli {
    /// Path to config.toml (defaults to the standard search order)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway server (default)
    Serve,
    /// Configuration utilities
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Token utilities for local testing
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Load and validate the configuration, then print it with secrets redacted
    Check,
}

#[derive(Subcommand, Debug)]
enum TokenAction {
    /// Issue a signed token for a subject
    Issue {
        subject: String,
        /// Issue a refresh token instead of an access token
        #[arg(long)]
        refresh: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load_from(cli.config.as_deref())?;
    let _guard = init_logging(&config.logging)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config).await,
        Command::Config {
            action: ConfigAction::Check,
        } => {
            let mut redacted = config.clone();
            if redacted.auth.jwt_secret.is_some() {
                redacted.auth.jwt_secret = Some("[REDACTED]".to_string());
            }
            let rendered = toml::to_string_pretty(&redacted).context("Failed to render config")?;
            println!("{}", rendered);
            Ok(())
        }
        Command::Token {
            action: TokenAction::Issue { subject, refresh },
        } => {
            if config.auth.jwt_secret.is_none() {
                anyhow::bail!("auth.jwt_secret must be set to issue tokens that a server will accept");
            }
            let provider = JwtTokenProvider::from_config(&config.auth);
            let token = if refresh {
                provider.issue_refresh_token(&subject)?
            } else {
                provider.issue_access_token(&subject)?
            };
            println!("{}", token);
            Ok(())
        }
    }
}

async fn run_server(config: Config) -> Result<()> {
    tracing::info!(
        bind = %config.bind_address(),
        data_dir = %config.storage.resolved_data_dir().display(),
        rate_limit = config.rate_limit.enabled,
        "Starting parley"
    );

    let metrics = match parley::metrics::init_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics recorder unavailable");
            None
        }
    };

    let state = AppState::initialize(config, metrics)?;
    server::serve(state).await
}

/// Console output always; a daily rolling file too when a log directory is
/// configured. The returned guard must outlive the process's logging.
fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());

    let console = match logging.format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
    };

    let (file_layer, guard) = match &logging.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir))?;
            let appender = tracing_appender::rolling::daily(dir, "parley.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();

    Ok(guard)
}
