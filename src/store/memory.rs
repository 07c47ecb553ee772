use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;

use super::Store;
use crate::error::StoreResult;
use crate::execution::position_manager::{self, FillEffect};
use crate::models::{
    BlockedSignal, Candle, DailyPerformance, Direction, Market, Order, PerformanceMetric,
    Position, PositionStatus, Signal, StrategyConfig, Timeframe, Trade,
};
use crate::risk::{OrderCandidate, RiskDecision, RiskGate, RiskSnapshot};

#[derive(Default)]
struct State {
    markets: Vec<Market>,
    candles: HashMap<(String, Timeframe), BTreeMap<DateTime<Utc>, Candle>>,
    signals: Vec<Signal>,
    blocked: Vec<BlockedSignal>,
    orders: Vec<Order>,
    trades: Vec<Trade>,
    trade_ids: HashSet<String>,
    positions: Vec<Position>,
    configs: BTreeMap<String, StrategyConfig>,
    equity: f64,
    reservations: HashMap<String, Direction>,
    daily: BTreeMap<(NaiveDate, String), DailyPerformance>,
    metrics: Vec<PerformanceMetric>,
}

impl State {
    fn open_position_mut(&mut self, market: &str) -> Option<&mut Position> {
        self.positions
            .iter_mut()
            .find(|p| p.market == market && p.is_open())
    }

    fn realized_today(&self) -> f64 {
        let today = Utc::now().date_naive();
        self.daily
            .range((today, String::new())..)
            .take_while(|((date, _), _)| *date == today)
            .map(|(_, day)| day.profit_amount)
            .sum()
    }

    fn snapshot(&self) -> RiskSnapshot {
        RiskSnapshot::build(
            self.equity,
            self.positions.iter(),
            &self.reservations,
            self.realized_today(),
        )
    }
}

/// Process-local store used when no database is configured, and in tests
///
/// One async mutex guards all state, which makes every operation atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_equity(equity: f64) -> Self {
        Self {
            state: Mutex::new(State {
                equity,
                ..Default::default()
            }),
        }
    }
}

fn newest_first<T: Clone>(items: &[T], limit: usize, keep: impl Fn(&T) -> bool) -> Vec<T> {
    items
        .iter()
        .rev()
        .filter(|item| keep(item))
        .take(limit)
        .cloned()
        .collect()
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_markets(&self, markets: &[Market]) -> StoreResult<()> {
        self.state.lock().await.markets = markets.to_vec();
        Ok(())
    }

    async fn markets(&self) -> StoreResult<Vec<Market>> {
        Ok(self.state.lock().await.markets.clone())
    }

    async fn save_candles(&self, candles: &[Candle]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        for candle in candles {
            state
                .candles
                .entry((candle.market.clone(), candle.timeframe))
                .or_default()
                .entry(candle.timestamp)
                .or_insert_with(|| candle.clone());
        }
        Ok(())
    }

    async fn recent_candles(
        &self,
        market: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> StoreResult<Vec<Candle>> {
        let state = self.state.lock().await;
        let Some(series) = state.candles.get(&(market.to_string(), timeframe)) else {
            return Ok(Vec::new());
        };
        let mut candles: Vec<Candle> = series.values().rev().take(limit).cloned().collect();
        candles.reverse();
        Ok(candles)
    }

    async fn save_signal(&self, signal: &Signal) -> StoreResult<()> {
        self.state.lock().await.signals.push(signal.clone());
        Ok(())
    }

    async fn signals(&self, market: Option<&str>, limit: usize) -> StoreResult<Vec<Signal>> {
        let state = self.state.lock().await;
        Ok(newest_first(&state.signals, limit, |s| {
            market.map_or(true, |m| s.market() == m)
        }))
    }

    async fn record_blocked(&self, blocked: &BlockedSignal) -> StoreResult<()> {
        self.state.lock().await.blocked.push(blocked.clone());
        Ok(())
    }

    async fn blocked_signals(&self, limit: usize) -> StoreResult<Vec<BlockedSignal>> {
        let state = self.state.lock().await;
        Ok(newest_first(&state.blocked, limit, |_| true))
    }

    async fn save_order(&self, order: &Order) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        match state.orders.iter_mut().find(|o| o.order_id == order.order_id) {
            Some(existing) => *existing = order.clone(),
            None => state.orders.push(order.clone()),
        }
        Ok(())
    }

    async fn replace_order(&self, old_id: &str, order: &Order) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .orders
            .retain(|o| o.order_id != old_id && o.order_id != order.order_id);
        state.orders.push(order.clone());
        Ok(())
    }

    async fn order(&self, order_id: &str) -> StoreResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state.orders.iter().find(|o| o.order_id == order_id).cloned())
    }

    async fn open_orders(&self) -> StoreResult<Vec<Order>> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .iter()
            .filter(|o| !o.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn orders(&self, limit: usize) -> StoreResult<Vec<Order>> {
        let state = self.state.lock().await;
        Ok(newest_first(&state.orders, limit, |_| true))
    }

    async fn save_trade(&self, trade: &Trade) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if !state.trade_ids.insert(trade.trade_id.clone()) {
            return Ok(false);
        }
        state.trades.push(trade.clone());
        Ok(true)
    }

    async fn trades_for_order(&self, order_id: &str) -> StoreResult<Vec<Trade>> {
        let state = self.state.lock().await;
        Ok(state
            .trades
            .iter()
            .filter(|t| t.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn open_position(&self, market: &str) -> StoreResult<Option<Position>> {
        let state = self.state.lock().await;
        Ok(state
            .positions
            .iter()
            .find(|p| p.market == market && p.is_open())
            .cloned())
    }

    async fn positions(&self, status: Option<PositionStatus>) -> StoreResult<Vec<Position>> {
        let state = self.state.lock().await;
        Ok(state
            .positions
            .iter()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect())
    }

    async fn update_position_price(
        &self,
        market: &str,
        price: f64,
    ) -> StoreResult<Option<Position>> {
        let mut state = self.state.lock().await;
        Ok(state.open_position_mut(market).map(|position| {
            position_manager::mark_price(position, price);
            position.clone()
        }))
    }

    async fn strategy_config(&self, market: &str) -> StoreResult<Option<StrategyConfig>> {
        Ok(self.state.lock().await.configs.get(market).cloned())
    }

    async fn strategy_configs(&self) -> StoreResult<Vec<StrategyConfig>> {
        Ok(self.state.lock().await.configs.values().cloned().collect())
    }

    async fn upsert_strategy_config(&self, config: &StrategyConfig) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .configs
            .insert(config.market.clone(), config.clone());
        Ok(())
    }

    async fn set_equity(&self, equity: f64) -> StoreResult<()> {
        self.state.lock().await.equity = equity;
        Ok(())
    }

    async fn risk_snapshot(&self) -> StoreResult<RiskSnapshot> {
        Ok(self.state.lock().await.snapshot())
    }

    async fn reserve_risk(
        &self,
        gate: &RiskGate,
        candidate: &OrderCandidate,
    ) -> StoreResult<RiskDecision> {
        let mut state = self.state.lock().await;
        let decision = gate.evaluate(&state.snapshot(), candidate);
        if decision.is_approved() {
            state
                .reservations
                .insert(candidate.market.clone(), candidate.direction);
        }
        Ok(decision)
    }

    async fn release_reservation(&self, market: &str) -> StoreResult<()> {
        self.state.lock().await.reservations.remove(market);
        Ok(())
    }

    async fn apply_fill(&self, fill: &FillEffect) -> StoreResult<Option<Position>> {
        let mut state = self.state.lock().await;
        state.reservations.remove(&fill.market);

        let existing = state.open_position_mut(&fill.market).cloned();
        let existing_id = existing.as_ref().map(|p| p.id);
        let outcome = position_manager::apply_fill(existing, fill);

        if let Some(position) = &outcome.position {
            match existing_id {
                Some(id) => {
                    if let Some(slot) = state.positions.iter_mut().find(|p| p.id == id) {
                        *slot = position.clone();
                    }
                }
                None => state.positions.push(position.clone()),
            }
        }

        if let Some(realized) = outcome.realized {
            let date = fill.timestamp.date_naive();
            state
                .daily
                .entry((date, fill.market.clone()))
                .or_insert_with(|| DailyPerformance::new(date, fill.market.clone()))
                .record_close(realized.amount, realized.percentage);
        }

        Ok(outcome.position)
    }

    async fn daily_performance(&self, date: NaiveDate) -> StoreResult<Vec<DailyPerformance>> {
        let state = self.state.lock().await;
        Ok(state
            .daily
            .values()
            .filter(|d| d.date == date)
            .cloned()
            .collect())
    }

    async fn save_performance_metric(&self, metric: &PerformanceMetric) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        match state.metrics.iter_mut().find(|m| {
            m.strategy_name == metric.strategy_name && m.market == metric.market
        }) {
            Some(existing) => *existing = metric.clone(),
            None => state.metrics.push(metric.clone()),
        }
        Ok(())
    }

    async fn performance_metrics(&self) -> StoreResult<Vec<PerformanceMetric>> {
        Ok(self.state.lock().await.metrics.clone())
    }
}
