//! # Claim Store Agent
//!
//! Service collecting claimed and tracked message bodies from local check-in
//! directories into the central claim store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use claimstore_config::{Config, ConfigLoader, FileSettingsSource};
use claimstore_core::{
    ClaimTokenRepository, FileSystemServant, InMemoryClaimTokenRepository, MessageBodyCollector,
    PostgresClaimTokenRepository,
};
use sqlx::postgres::PgPoolOptions;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "claimstore-agent")]
#[command(about = "Collects claimed and tracked message bodies into the central claim store")]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(long, short, global = true, env = "CLAIMSTORE_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the collector until SIGINT or SIGTERM (default)
    Run,
    /// Run the collector inline until Enter is pressed
    Debug,
    /// Run a single collection pass and exit
    CollectOnce,
    /// Load and validate the configuration, then exit
    CheckConfig,
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply claim token registry migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_file = claimstore_config::load_dotenv().context("failed to load .env file")?;
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,claimstore_core=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(path) = env_file {
        info!(path = %path.display(), "loaded .env file");
    }

    let config = load_config(cli.config.as_ref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_service(config).await,
        Command::Debug => run_debug(config).await,
        Command::CollectOnce => collect_once(config).await,
        Command::CheckConfig => {
            check_config(&config);
            Ok(())
        }
        Command::Db(DbCommand::Migrate) => run_db_migrate(&config).await,
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let loader = match path {
        Some(path) => ConfigLoader::from_env().with_path(path),
        None => ConfigLoader::from_env(),
    };
    loader.load().context("failed to load claim store configuration")
}

fn token_repository(config: &Config) -> anyhow::Result<Arc<dyn ClaimTokenRepository>> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(4)
                .connect_lazy(url)
                .context("invalid database URL")?;
            Ok(Arc::new(PostgresClaimTokenRepository::new(pool)))
        }
        None => {
            warn!("No database URL configured; claim tokens are kept in memory and will not be released from any database");
            Ok(Arc::new(InMemoryClaimTokenRepository::new()))
        }
    }
}

fn collector(config: &Config) -> anyhow::Result<MessageBodyCollector> {
    let servant = FileSystemServant::new(token_repository(config)?);
    Ok(MessageBodyCollector::new(
        Arc::new(FileSettingsSource::new(&config.path)),
        Arc::new(servant),
    ))
}

async fn run_service(config: Config) -> anyhow::Result<()> {
    let collector = collector(&config)?;
    collector
        .start()
        .await
        .context("failed to start message body collector")?;

    let halted = tokio::select! {
        _ = shutdown_signal() => false,
        _ = collector.halted() => true,
    };
    collector.stop().await;

    if halted {
        bail!("message body collection halted unexpectedly");
    }
    Ok(())
}

async fn run_debug(config: Config) -> anyhow::Result<()> {
    let collector = collector(&config)?;
    collector
        .start()
        .await
        .context("failed to start message body collector")?;
    println!("Claim store agent is running. Press Enter to stop.");

    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let halted = tokio::select! {
        result = stdin.read_line(&mut line) => {
            result.context("failed to read from stdin")?;
            false
        }
        _ = collector.halted() => true,
    };
    collector.stop().await;

    if halted {
        bail!("message body collection halted unexpectedly");
    }
    Ok(())
}

async fn collect_once(config: Config) -> anyhow::Result<()> {
    let report = collector(&config)?
        .collect_once()
        .await
        .context("collection pass failed")?;
    info!(
        collected = report.collected,
        awaiting_retry = report.awaiting_retry,
        "Collection pass completed"
    );
    Ok(())
}

fn check_config(config: &Config) {
    println!("Configuration: {}", config.path.display());
    println!("Check-in directories:");
    for directory in &config.agent.check_in_directories {
        println!("  {}", directory.display());
    }
    println!("Check-out directory: {}", config.agent.check_out_directory.display());
    println!("File lock timeout: {:?}", config.agent.file_lock_timeout);
    println!("Polling interval: {:?}", config.agent.polling_interval);
    println!("Claim threshold: {} bytes", config.capture.claim_threshold);
    println!(
        "Database: {}",
        if config.database_url.is_some() {
            "configured"
        } else {
            "not configured"
        }
    );
}

async fn run_db_migrate(config: &Config) -> anyhow::Result<()> {
    let Some(url) = &config.database_url else {
        bail!("no database URL configured; set DATABASE_URL or [database] url");
    };
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL for migration")?;
    claimstore_core::MIGRATOR
        .run(&pool)
        .await
        .context("failed to apply migrations")?;
    info!("Database migrations applied");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c, stopping"),
        _ = terminate => info!("Received SIGTERM, stopping"),
    }
}
