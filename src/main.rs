use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use upbot::api::{Signer, UpbitClient};
use upbot::app::AppContext;
use upbot::config::Settings;
use upbot::db::PostgresStore;
use upbot::shutdown::stop_signal;
use upbot::store::{MemoryStore, Store};

#[derive(Parser, Debug)]
#[command(name = "upbot", about = "Automated Upbit trading agent")]
struct Cli {
    /// Configuration file (defaults to config/upbot.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log trading decisions without placing orders
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings =
        Settings::load(cli.config.as_deref(), cli.dry_run).context("Failed to load settings")?;

    tracing::info!(
        "🚀 upbot starting{}",
        if settings.execution.dry_run { " in dry-run mode" } else { "" }
    );

    let signer = Signer::new(
        settings.exchange.access_key.clone(),
        settings.exchange.secret_key.clone(),
    );
    let exchange = UpbitClient::new(settings.exchange.rest_url.clone(), signer)
        .context("Failed to build exchange client")?
        .with_market_filter(
            settings.exchange.quote_currency.clone(),
            settings.exchange.excluded_symbols.clone(),
        );

    let store = open_store(&settings).await;
    let mut app = AppContext::new(settings, Arc::new(exchange), store)
        .start()
        .await
        .context("Failed to start workers")?;

    let stop = stop_signal().context("Failed to install signal handlers")?;
    tracing::info!("Press Ctrl+C to stop...");

    tokio::select! {
        signal = stop => {
            tracing::info!("⚠️  Received {}, shutting down...", signal);
        }
        stopped = app.stopped() => {
            tracing::error!("Worker exited unexpectedly: {:?}", stopped);
        }
    }

    if !app.shutdown().await {
        tracing::warn!("Forced exit with workers still running");
    }
    tracing::info!("👋 upbot stopped");
    Ok(())
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("upbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Postgres when a URL is configured and reachable, memory otherwise
async fn open_store(settings: &Settings) -> Arc<dyn Store> {
    let url = settings
        .database
        .url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let Some(url) = url else {
        tracing::warn!("No database configured, state will not survive a restart");
        return Arc::new(MemoryStore::new());
    };

    match PostgresStore::connect(&url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Postgres ({}), continuing without persistence",
                e
            );
            Arc::new(MemoryStore::new())
        }
    }
}
