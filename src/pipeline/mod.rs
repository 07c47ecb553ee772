// Market data → signals
pub mod refresh;

pub use refresh::CandleRefresher;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::StrategyError;
use crate::execution::candle_buffer::{bucket_start, CandleBuffer};
use crate::execution::position_manager::exit_trigger;
use crate::models::{Candle, Direction, MarketData, Position, Signal, StrategyConfig};
use crate::shutdown::Shutdown;
use crate::store::Store;
use crate::strategy::{EvaluationInput, Strategy, StrategyParams};
use crate::Result;

/// Strategy name on signals raised by the position monitor
pub const MONITOR_STRATEGY: &str = "position_monitor";

/// Wait before an exit that left the position open may be raised again
pub const DEFAULT_EXIT_RETRY: Duration = Duration::from_secs(30);

/// Exit signal already raised for an open position
#[derive(Debug, Clone, Copy)]
struct PendingExit {
    position_id: Uuid,
    raised_at: DateTime<Utc>,
}

struct CachedStrategy {
    params: StrategyParams,
    strategy: Box<dyn Strategy>,
}

/// Single consumer of the market-data queue
///
/// Per tick: fold the price into the candle history, mark the open position,
/// and either raise an exit for it or evaluate the market's strategy.
pub struct SignalPipeline {
    store: Arc<dyn Store>,
    candles: CandleBuffer,
    last_prices: HashMap<String, f64>,
    /// Position per market that already has an exit signal out
    exiting: HashMap<String, PendingExit>,
    exit_retry: chrono::Duration,
    strategies: HashMap<String, CachedStrategy>,
}

impl SignalPipeline {
    pub fn new(store: Arc<dyn Store>, candles: CandleBuffer) -> Self {
        Self {
            store,
            candles,
            last_prices: HashMap::new(),
            exiting: HashMap::new(),
            exit_retry: to_chrono(DEFAULT_EXIT_RETRY),
            strategies: HashMap::new(),
        }
    }

    /// How long an exit may go without closing the position before the
    /// monitor raises it again
    pub fn with_exit_retry(mut self, retry: Duration) -> Self {
        self.exit_retry = to_chrono(retry);
        self
    }

    pub fn candles(&self) -> &CandleBuffer {
        &self.candles
    }

    pub async fn run(
        mut self,
        mut ticks: mpsc::Receiver<MarketData>,
        signals: mpsc::Sender<Signal>,
        mut shutdown: Shutdown,
    ) {
        tracing::info!("📊 Signal pipeline running");

        loop {
            let tick = tokio::select! {
                _ = shutdown.wait() => break,
                tick = ticks.recv() => match tick {
                    Some(tick) => tick,
                    None => {
                        tracing::info!("Market data queue closed, stopping pipeline");
                        break;
                    }
                },
            };

            let produced = match self.process_tick(&tick).await {
                Ok(produced) => produced,
                Err(e) => {
                    tracing::warn!("Tick for {} not processed: {}", tick.market, e);
                    continue;
                }
            };

            for signal in produced {
                tokio::select! {
                    _ = shutdown.wait() => {
                        tracing::info!("Signal pipeline stopped");
                        return;
                    }
                    sent = signals.send(signal) => {
                        if sent.is_err() {
                            tracing::info!("Signal queue closed, stopping pipeline");
                            return;
                        }
                    }
                }
            }
        }

        tracing::info!("Signal pipeline stopped");
    }

    /// Signals produced by one tick
    pub async fn process_tick(&mut self, tick: &MarketData) -> Result<Vec<Signal>> {
        let Some(price) = tick.price() else {
            return Ok(Vec::new());
        };
        let market = tick.market.as_str();
        let at = tick.time();

        let config = self.store.strategy_config(market).await?;

        // History and previous price are read before the tick is folded in
        let previous_price = match self.last_prices.get(market) {
            Some(p) => Some(*p),
            None => self.candles.last_close(market).ok().flatten(),
        };
        let history = match &config {
            Some(config) => self.closed_candles(config, at),
            None => Vec::new(),
        };

        self.last_prices.insert(market.to_string(), price);
        if let Some(config) = &config {
            if let Err(e) = self
                .candles
                .apply_tick(market, config.timeframe, price, tick.volume(), at)
            {
                tracing::warn!("Candle buffer update failed for {}: {}", market, e);
            }
        }

        let position = self.store.update_position_price(market, price).await?;
        if let Some(position) = position.as_ref().filter(|p| p.is_open()) {
            self.rearm_stale_exit(market, position, at).await?;
        }
        if let Some(exit) = self.monitor(market, position.as_ref(), price, at) {
            return Ok(vec![exit]);
        }

        let Some(config) = config.filter(|c| c.enabled) else {
            return Ok(Vec::new());
        };

        let input = EvaluationInput {
            market,
            price,
            previous_price,
            candles: &history,
            timestamp: at,
        };
        let strategy = self.strategy_for(&config);

        match strategy.evaluate(&input) {
            Ok(signals) => {
                let min_confidence = config.min_confidence();
                Ok(signals
                    .into_iter()
                    .filter(|s| {
                        let keep = s.confidence() >= min_confidence;
                        if !keep {
                            tracing::debug!(
                                "{} {} signal below confidence {:.2} ({:.2})",
                                s.market(),
                                s.direction(),
                                min_confidence,
                                s.confidence()
                            );
                        }
                        keep
                    })
                    .collect())
            }
            Err(StrategyError::InsufficientData { have, need }) => {
                tracing::debug!("{}: {} candles, {} needed", market, have, need);
                Ok(Vec::new())
            }
            Err(e) => {
                tracing::warn!("⚠️  {} evaluation skipped: {}", market, e);
                Ok(Vec::new())
            }
        }
    }

    /// Completed candles: the one the tick falls into is still forming
    fn closed_candles(&self, config: &StrategyConfig, at: DateTime<Utc>) -> Vec<Candle> {
        let current = bucket_start(config.timeframe, at);
        self.candles
            .get_candles(&config.market)
            .unwrap_or_default()
            .into_iter()
            .filter(|c| c.timestamp < current)
            .collect()
    }

    fn strategy_for(&mut self, config: &StrategyConfig) -> &dyn Strategy {
        let cached = self
            .strategies
            .entry(config.market.clone())
            .or_insert_with(|| CachedStrategy {
                params: config.params.clone(),
                strategy: config.params.build(),
            });
        if cached.params != config.params {
            tracing::info!("{} strategy changed to {}", config.market, config.strategy_name());
            *cached = CachedStrategy {
                params: config.params.clone(),
                strategy: config.params.build(),
            };
        }
        cached.strategy.as_ref()
    }

    /// Forget an exit that was raised a while ago and left the position open
    /// with nothing in flight: it was rejected, blocked or canceled. An exit
    /// still being worked on keeps its reservation and stays armed.
    async fn rearm_stale_exit(
        &mut self,
        market: &str,
        position: &Position,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let Some(pending) = self.exiting.get(market).copied() else {
            return Ok(());
        };
        if pending.position_id != position.id || at - pending.raised_at < self.exit_retry {
            return Ok(());
        }

        let snapshot = self.store.risk_snapshot().await?;
        if snapshot
            .exposure(market)
            .is_some_and(|e| e.in_flight.is_some())
        {
            return Ok(());
        }

        tracing::warn!(
            "⚠️  Exit for {} raised at {} left the position open, re-arming",
            market,
            pending.raised_at
        );
        self.exiting.remove(market);
        Ok(())
    }

    /// Exit signal for an open position that reached its target or stop,
    /// raised once until it is re-armed
    fn monitor(
        &mut self,
        market: &str,
        position: Option<&Position>,
        price: f64,
        at: DateTime<Utc>,
    ) -> Option<Signal> {
        let Some(position) = position.filter(|p| p.is_open()) else {
            self.exiting.remove(market);
            return None;
        };
        if self
            .exiting
            .get(market)
            .is_some_and(|pending| pending.position_id == position.id)
        {
            return None;
        }

        let reason = exit_trigger(position, price)?;
        self.exiting.insert(
            market.to_string(),
            PendingExit {
                position_id: position.id,
                raised_at: at,
            },
        );

        tracing::info!(
            "🎯 {} hit {} at {} (entry {}, target {}, stop {})",
            market,
            reason,
            price,
            position.entry_price,
            position.profit_target,
            position.stop_loss
        );

        Some(
            Signal::new(MONITOR_STRATEGY, market, Direction::Sell, price, 1.0)
                .with_parameter("entry_price", position.entry_price)
                .with_parameter("profit_target", position.profit_target)
                .with_parameter("stop_loss", position.stop_loss)
                .with_exit_reason(reason)
                .at(at),
        )
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::position_manager::FillEffect;
    use crate::models::{ExitReason, Timeframe};
    use crate::shutdown::ShutdownTrigger;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn at(second: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::seconds(second)
    }

    fn threshold_config(market: &str) -> StrategyConfig {
        StrategyConfig::new(
            market,
            StrategyParams::Threshold {
                buy_threshold: 100.0,
                sell_threshold: 90.0,
            },
            Timeframe::Minutes(1),
        )
    }

    async fn pipeline_with(configs: &[StrategyConfig]) -> (SignalPipeline, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_equity(1_000_000.0));
        for config in configs {
            store.upsert_strategy_config(config).await.unwrap();
        }
        (
            SignalPipeline::new(store.clone(), CandleBuffer::new(100)),
            store,
        )
    }

    async fn open_position(store: &MemoryStore, market: &str, price: f64) {
        store
            .apply_fill(&FillEffect {
                market: market.to_string(),
                direction: Direction::Buy,
                price,
                volume: 1.0,
                fee: 0.0,
                exit_reason: None,
                profit_target_pct: 0.05,
                stop_loss_pct: 0.03,
                timestamp: at(0),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_threshold_cross_emits_buy() {
        let (mut pipeline, _store) = pipeline_with(&[threshold_config("KRW-BTC")]).await;

        let first = pipeline
            .process_tick(&MarketData::trade("KRW-BTC", 99.0, 1.0, at(1)))
            .await
            .unwrap();
        assert!(first.is_empty());

        let second = pipeline
            .process_tick(&MarketData::trade("KRW-BTC", 101.0, 1.0, at(2)))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].direction(), Direction::Buy);
        assert_eq!(second[0].parameters()["previous_price"], 99.0);

        assert_eq!(pipeline.candles().candle_count("KRW-BTC").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_or_disabled_market_is_quiet() {
        let mut disabled = threshold_config("KRW-ETH");
        disabled.enabled = false;
        let (mut pipeline, _store) = pipeline_with(&[disabled]).await;

        for (i, price) in [99.0, 101.0].into_iter().enumerate() {
            for market in ["KRW-ETH", "KRW-XRP"] {
                let signals = pipeline
                    .process_tick(&MarketData::trade(market, price, 1.0, at(i as i64)))
                    .await
                    .unwrap();
                assert!(signals.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn test_min_confidence_filters_signals() {
        let mut config = StrategyConfig::new(
            "KRW-BTC",
            StrategyParams::MaCross {
                short_period: 2,
                long_period: 3,
            },
            Timeframe::Minutes(1),
        );
        config.tuning.insert("min_confidence".to_string(), 0.99);
        let (mut pipeline, _store) = pipeline_with(&[config]).await;

        // Flat history, then a jump: golden cross with a small spread
        let history: Vec<_> = [100.0, 100.0, 100.0, 100.0]
            .iter()
            .enumerate()
            .map(|(i, &close)| crate::models::Candle {
                market: "KRW-BTC".to_string(),
                timeframe: Timeframe::Minutes(1),
                timestamp: at(0) - Duration::minutes(4 - i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
            })
            .collect();
        pipeline.candles().replace("KRW-BTC", history).unwrap();

        let signals = pipeline
            .process_tick(&MarketData::trade("KRW-BTC", 101.0, 1.0, at(1)))
            .await
            .unwrap();
        assert!(signals.is_empty());
    }

    #[tokio::test]
    async fn test_faulty_evaluation_is_skipped() {
        let config = StrategyConfig::new(
            "KRW-BTC",
            StrategyParams::Rsi {
                period: 2,
                oversold: 30.0,
                overbought: 70.0,
            },
            Timeframe::Minutes(1),
        );
        let (mut pipeline, _store) = pipeline_with(&[config]).await;

        let mut history = crate::strategy::test_support::candles(&[100.0, f64::NAN, 100.0]);
        for (i, candle) in history.iter_mut().enumerate() {
            candle.timestamp = at(0) - Duration::minutes(3 - i as i64);
        }
        pipeline.candles().replace("KRW-BTC", history).unwrap();

        let signals = pipeline
            .process_tick(&MarketData::trade("KRW-BTC", 101.0, 1.0, at(1)))
            .await
            .unwrap();
        assert!(signals.is_empty());
    }

    #[tokio::test]
    async fn test_monitor_exits_once_per_position() {
        let (mut pipeline, store) = pipeline_with(&[threshold_config("KRW-BTC")]).await;
        open_position(&store, "KRW-BTC", 200.0).await;

        let quiet = pipeline
            .process_tick(&MarketData::trade("KRW-BTC", 201.0, 1.0, at(1)))
            .await
            .unwrap();
        assert!(quiet.is_empty());

        let exit = pipeline
            .process_tick(&MarketData::trade("KRW-BTC", 211.0, 1.0, at(2)))
            .await
            .unwrap();
        assert_eq!(exit.len(), 1);
        assert_eq!(exit[0].strategy(), MONITOR_STRATEGY);
        assert_eq!(exit[0].direction(), Direction::Sell);
        assert_eq!(exit[0].exit_reason(), Some(ExitReason::Target));

        let again = pipeline
            .process_tick(&MarketData::trade("KRW-BTC", 212.0, 1.0, at(3)))
            .await
            .unwrap();
        assert!(again.is_empty());

        let position = store.open_position("KRW-BTC").await.unwrap().unwrap();
        assert_eq!(position.last_price, 212.0);
    }

    #[tokio::test]
    async fn test_stop_loss_exit() {
        let (mut pipeline, store) = pipeline_with(&[]).await;
        open_position(&store, "KRW-ETH", 100.0).await;

        let exit = pipeline
            .process_tick(&MarketData::trade("KRW-ETH", 96.5, 1.0, at(1)))
            .await
            .unwrap();
        assert_eq!(exit[0].exit_reason(), Some(ExitReason::Stop));
    }

    #[tokio::test]
    async fn test_failed_exit_is_raised_again() {
        let (pipeline, store) = pipeline_with(&[]).await;
        let mut pipeline = pipeline.with_exit_retry(std::time::Duration::from_secs(30));
        open_position(&store, "KRW-BTC", 100.0).await;

        let exit = pipeline
            .process_tick(&MarketData::trade("KRW-BTC", 96.0, 1.0, at(1)))
            .await
            .unwrap();
        assert_eq!(exit.len(), 1);

        // The sell never went out: position open, nothing reserved
        let soon = pipeline
            .process_tick(&MarketData::trade("KRW-BTC", 90.0, 1.0, at(10)))
            .await
            .unwrap();
        assert!(soon.is_empty());

        let retried = pipeline
            .process_tick(&MarketData::trade("KRW-BTC", 80.0, 1.0, at(31)))
            .await
            .unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].direction(), Direction::Sell);
        assert_eq!(retried[0].exit_reason(), Some(ExitReason::Stop));

        let quiet = pipeline
            .process_tick(&MarketData::trade("KRW-BTC", 79.0, 1.0, at(32)))
            .await
            .unwrap();
        assert!(quiet.is_empty());
    }

    #[tokio::test]
    async fn test_exit_in_flight_is_not_raised_again() {
        let (pipeline, store) = pipeline_with(&[]).await;
        let mut pipeline = pipeline.with_exit_retry(std::time::Duration::from_secs(30));
        open_position(&store, "KRW-BTC", 100.0).await;

        let exit = pipeline
            .process_tick(&MarketData::trade("KRW-BTC", 96.0, 1.0, at(1)))
            .await
            .unwrap();
        assert_eq!(exit.len(), 1);

        let candidate = crate::risk::OrderCandidate {
            market: "KRW-BTC".to_string(),
            direction: Direction::Sell,
            notional: 96.0,
            volume: Some(1.0),
        };
        let decision = store
            .reserve_risk(&crate::risk::RiskGate::default(), &candidate)
            .await
            .unwrap();
        assert!(decision.is_approved());

        let later = pipeline
            .process_tick(&MarketData::trade("KRW-BTC", 90.0, 1.0, at(120)))
            .await
            .unwrap();
        assert!(later.is_empty());

        store.release_reservation("KRW-BTC").await.unwrap();
        let retried = pipeline
            .process_tick(&MarketData::trade("KRW-BTC", 90.0, 1.0, at(121)))
            .await
            .unwrap();
        assert_eq!(retried.len(), 1);
    }

    #[tokio::test]
    async fn test_run_forwards_signals_until_shutdown() {
        let (pipeline, _store) = pipeline_with(&[threshold_config("KRW-BTC")]).await;
        let (tick_tx, tick_rx) = mpsc::channel(8);
        let (signal_tx, mut signal_rx) = mpsc::channel(8);
        let trigger = ShutdownTrigger::new();

        let handle = tokio::spawn(pipeline.run(tick_rx, signal_tx, trigger.subscribe()));

        tick_tx
            .send(MarketData::trade("KRW-BTC", 95.0, 1.0, at(1)))
            .await
            .unwrap();
        tick_tx
            .send(MarketData::trade("KRW-BTC", 100.0, 1.0, at(2)))
            .await
            .unwrap();

        let signal = tokio::time::timeout(std::time::Duration::from_secs(1), signal_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.direction(), Direction::Buy);

        trigger.trigger();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("pipeline should stop on shutdown")
            .unwrap();
    }
}
