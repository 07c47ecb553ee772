use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::admin::{AdminHandle, EventLog};
use crate::api::{ExchangeApi, MarketFeed};
use crate::config::Settings;
use crate::execution::{CandleBuffer, ExecutionEngine};
use crate::models::PositionStatus;
use crate::performance::PerformanceReporter;
use crate::pipeline::{CandleRefresher, SignalPipeline};
use crate::risk::RiskGate;
use crate::shutdown::{Shutdown, ShutdownTrigger};
use crate::store::Store;
use crate::Result;

/// Order events kept for the admin handle
const EVENT_LOG_CAPACITY: usize = 500;

/// Everything the workers share, passed explicitly instead of through globals
pub struct AppContext {
    pub settings: Settings,
    pub exchange: Arc<dyn ExchangeApi>,
    pub store: Arc<dyn Store>,
}

impl AppContext {
    pub fn new(settings: Settings, exchange: Arc<dyn ExchangeApi>, store: Arc<dyn Store>) -> Self {
        Self {
            settings,
            exchange,
            store,
        }
    }

    /// Store configured strategies for markets that have none yet. Configs
    /// changed through the admin handle survive restarts.
    pub async fn seed_strategies(&self) -> Result<usize> {
        let mut seeded = 0;
        for config in &self.settings.strategies {
            if self.store.strategy_config(&config.market).await?.is_none() {
                self.store.upsert_strategy_config(config).await?;
                seeded += 1;
            }
        }
        if seeded > 0 {
            tracing::info!("Seeded {} strategy configs", seeded);
        }
        Ok(seeded)
    }

    /// Markets to stream: every enabled strategy plus anything still held
    pub async fn feed_markets(&self) -> Result<Vec<String>> {
        let mut markets: BTreeSet<String> = self
            .store
            .strategy_configs()
            .await?
            .into_iter()
            .filter(|c| c.enabled)
            .map(|c| c.market)
            .collect();
        for position in self.store.positions(Some(PositionStatus::Open)).await? {
            markets.insert(position.market);
        }
        Ok(markets.into_iter().collect())
    }

    /// Seed, warm up and spawn every worker
    pub async fn start(self) -> Result<RunningApp> {
        let settings = &self.settings;
        let trigger = ShutdownTrigger::new();
        let capacity = settings.pipeline.queue_capacity;

        self.seed_strategies().await?;
        if let Err(e) = refresh_markets(self.exchange.as_ref(), self.store.as_ref()).await {
            tracing::warn!("Initial market list refresh failed: {}", e);
        }

        let candles = CandleBuffer::new(settings.pipeline.candle_history as usize);
        let refresher = CandleRefresher::new(
            self.exchange.clone(),
            self.store.clone(),
            candles.clone(),
            settings.pipeline.candle_history,
            Duration::from_secs(settings.pipeline.candle_refresh_secs),
        );
        match refresher.refresh_once().await {
            Ok(count) => tracing::info!("Warmed up candles for {} markets", count),
            Err(e) => tracing::warn!("Candle warm-up failed: {}", e),
        }

        let markets = self.feed_markets().await?;
        if markets.is_empty() {
            tracing::warn!("⚠️  No enabled markets, the feed will stay idle");
        }

        let (tick_tx, tick_rx) = mpsc::channel(capacity);
        let (signal_tx, signal_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (command_tx, command_rx) = mpsc::channel(capacity);

        let events = EventLog::new(EVENT_LOG_CAPACITY);
        let admin = AdminHandle::new(self.store.clone(), command_tx, events.clone());
        let mut tasks = JoinSet::new();

        let feed = MarketFeed::new(settings.feed_config(markets));
        let shutdown = trigger.subscribe();
        tasks.spawn(async move {
            feed.run(tick_tx, shutdown).await;
            "market feed"
        });

        let pipeline = SignalPipeline::new(self.store.clone(), candles)
            .with_exit_retry(Duration::from_secs(settings.pipeline.exit_retry_secs));
        let shutdown = trigger.subscribe();
        tasks.spawn(async move {
            pipeline.run(tick_rx, signal_tx, shutdown).await;
            "signal pipeline"
        });

        let engine = ExecutionEngine::new(
            self.exchange.clone(),
            self.store.clone(),
            RiskGate::new(settings.risk.clone()),
            settings.engine_config(),
            event_tx,
            trigger.subscribe(),
        );
        tasks.spawn(async move {
            engine.run(signal_rx, command_rx).await;
            "execution engine"
        });

        let shutdown = trigger.subscribe();
        tasks.spawn(async move {
            refresher.run(shutdown).await;
            "candle refresher"
        });

        let exchange = self.exchange.clone();
        let store = self.store.clone();
        let interval = Duration::from_secs(settings.markets.refresh_secs);
        let shutdown = trigger.subscribe();
        tasks.spawn(async move {
            run_market_refresh(exchange, store, interval, shutdown).await;
            "market refresh"
        });

        let reporter = PerformanceReporter::new(
            self.store.clone(),
            Duration::from_secs(settings.performance.report_secs),
        );
        let shutdown = trigger.subscribe();
        tasks.spawn(async move {
            reporter.run(shutdown).await;
            "performance reporter"
        });

        let shutdown = trigger.subscribe();
        tasks.spawn(async move {
            events.run(event_rx, shutdown).await;
            "event log"
        });

        tracing::info!("🚀 upbot running with {} workers", tasks.len());

        Ok(RunningApp {
            admin,
            trigger,
            tasks,
            // Engine drain gets the full grace period; the rest is for the other workers
            timeout: settings.shutdown_timeout() + Duration::from_secs(1),
        })
    }
}

/// Fetch the tradable market list and persist it
pub async fn refresh_markets(exchange: &dyn ExchangeApi, store: &dyn Store) -> Result<usize> {
    let markets = exchange.list_markets().await?;
    store.save_markets(&markets).await?;
    tracing::info!("📋 {} markets listed", markets.len());
    Ok(markets.len())
}

async fn run_market_refresh(
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<dyn Store>,
    interval: Duration,
    mut shutdown: Shutdown,
) {
    while !shutdown.sleep_or_shutdown(interval).await {
        if let Err(e) = refresh_markets(exchange.as_ref(), store.as_ref()).await {
            tracing::warn!("Market list refresh failed: {}", e);
        }
    }
}

/// Handle on the spawned workers
pub struct RunningApp {
    admin: AdminHandle,
    trigger: ShutdownTrigger,
    tasks: JoinSet<&'static str>,
    timeout: Duration,
}

impl RunningApp {
    pub fn admin(&self) -> AdminHandle {
        self.admin.clone()
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Resolves when the first worker exits on its own
    pub async fn stopped(&mut self) -> Option<&'static str> {
        match self.tasks.join_next().await? {
            Ok(name) => Some(name),
            Err(e) => {
                tracing::error!("Worker task failed: {}", e);
                Some("unknown")
            }
        }
    }

    /// Signal every worker and wait for them, aborting whatever is still
    /// running once the timeout expires. Returns true on a clean stop.
    pub async fn shutdown(mut self) -> bool {
        tracing::info!("🛑 Shutting down, waiting up to {:?}", self.timeout);
        self.trigger.trigger();

        let tasks = &mut self.tasks;
        let finished = tokio::time::timeout(self.timeout, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(name) => tracing::debug!("{} stopped", name),
                    Err(e) => tracing::error!("Worker task failed: {}", e),
                }
            }
        })
        .await;

        if finished.is_err() {
            tracing::warn!(
                "{} workers still running after {:?}, aborting",
                self.tasks.len(),
                self.timeout
            );
            self.tasks.abort_all();
            return false;
        }

        tracing::info!("✅ Shutdown complete");
        true
    }
}
