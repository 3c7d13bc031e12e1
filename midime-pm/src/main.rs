//! Pattern Matcher (midime-pm) - Main entry point
//!
//! Loads the corpus from the shared database and keeps neighbor lists current
//! until shut down.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use midime_common::config::{load_toml_config_or_default, RootFolderInitializer, RootFolderResolver};
use midime_common::db::init_database;
use midime_common::events::EventBus;
use midime_pm::corpus::EVENT_CAPACITY;
use midime_pm::{Corpus, MatcherConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Matcher config file name inside the root folder
const MATCHER_CONFIG_FILE: &str = "midime-pm.toml";

/// Command-line arguments for midime-pm
#[derive(Parser, Debug)]
#[command(name = "midime-pm")]
#[command(about = "Pattern matcher for MiDiMe")]
#[command(version)]
struct Args {
    /// Root folder holding the database
    #[arg(short, long, env = "MIDIME_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Matcher config file (defaults to midime-pm.toml in the root folder)
    #[arg(short, long, env = "MIDIME_PM_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let toml_config = load_toml_config_or_default();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("midime_pm={0},midime_common={0}", toml_config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting MiDiMe Pattern Matcher");

    let root_folder = RootFolderResolver::new(args.root_folder, toml_config).resolve();
    let initializer = RootFolderInitializer::new(root_folder.clone());
    initializer
        .ensure_directory_exists()
        .context("Failed to create root folder")?;
    info!("Root folder: {}", root_folder.display());

    let config_path = args
        .config
        .unwrap_or_else(|| root_folder.join(MATCHER_CONFIG_FILE));
    let config = MatcherConfig::load_or_default(&config_path).context("Failed to load matcher config")?;

    let pool = init_database(&initializer.database_path())
        .await
        .context("Failed to open database")?;

    let events = EventBus::new(EVENT_CAPACITY);
    spawn_event_logger(&events);

    let corpus = Corpus::load(pool, config, events)
        .await
        .context("Failed to load corpus")?;

    let cancel = CancellationToken::new();
    let precomputer = corpus.spawn_precomputer(cancel.clone());

    shutdown_signal().await;

    cancel.cancel();
    precomputer.await.context("Precomputer task failed")?;

    info!("Shutdown complete");
    Ok(())
}

/// Log corpus events until the bus closes
fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => tracing::debug!(?event, "Corpus event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
