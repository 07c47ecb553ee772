// Persistence boundary
pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::StoreResult;
use crate::execution::position_manager::FillEffect;
use crate::models::{
    BlockedSignal, Candle, DailyPerformance, Market, Order, PerformanceMetric, Position,
    PositionStatus, Signal, StrategyConfig, Timeframe, Trade,
};
use crate::risk::{OrderCandidate, RiskDecision, RiskGate, RiskSnapshot};

/// Durable state of the agent
///
/// `reserve_risk` and `apply_fill` are the two operations that must be
/// atomic against each other: the risk decision, the reservation and the
/// position update never interleave for one store.
#[async_trait]
pub trait Store: Send + Sync {
    // ============== Markets & candles ==============

    async fn save_markets(&self, markets: &[Market]) -> StoreResult<()>;

    async fn markets(&self) -> StoreResult<Vec<Market>>;

    /// Insert candles, ignoring ones already stored for the same interval
    async fn save_candles(&self, candles: &[Candle]) -> StoreResult<()>;

    /// Newest `limit` candles, returned oldest first
    async fn recent_candles(
        &self,
        market: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> StoreResult<Vec<Candle>>;

    // ============== Signals ==============

    async fn save_signal(&self, signal: &Signal) -> StoreResult<()>;

    /// Newest first
    async fn signals(&self, market: Option<&str>, limit: usize) -> StoreResult<Vec<Signal>>;

    async fn record_blocked(&self, blocked: &BlockedSignal) -> StoreResult<()>;

    /// Newest first
    async fn blocked_signals(&self, limit: usize) -> StoreResult<Vec<BlockedSignal>>;

    // ============== Orders & trades ==============

    /// Insert or update by `order_id`
    async fn save_order(&self, order: &Order) -> StoreResult<()>;

    /// Store `order` in place of the record kept under `old_id`, used when
    /// an order saved under its identifier turns out to have an exchange id
    async fn replace_order(&self, old_id: &str, order: &Order) -> StoreResult<()>;

    async fn order(&self, order_id: &str) -> StoreResult<Option<Order>>;

    /// Orders not yet in a terminal state
    async fn open_orders(&self) -> StoreResult<Vec<Order>>;

    /// Newest first
    async fn orders(&self, limit: usize) -> StoreResult<Vec<Order>>;

    /// Returns false if the trade id was already stored
    async fn save_trade(&self, trade: &Trade) -> StoreResult<bool>;

    async fn trades_for_order(&self, order_id: &str) -> StoreResult<Vec<Trade>>;

    // ============== Positions ==============

    async fn open_position(&self, market: &str) -> StoreResult<Option<Position>>;

    async fn positions(&self, status: Option<PositionStatus>) -> StoreResult<Vec<Position>>;

    /// Mark the open position for `market` to `price`
    async fn update_position_price(
        &self,
        market: &str,
        price: f64,
    ) -> StoreResult<Option<Position>>;

    // ============== Strategy configuration ==============

    async fn strategy_config(&self, market: &str) -> StoreResult<Option<StrategyConfig>>;

    async fn strategy_configs(&self) -> StoreResult<Vec<StrategyConfig>>;

    async fn upsert_strategy_config(&self, config: &StrategyConfig) -> StoreResult<()>;

    // ============== Risk ==============

    async fn set_equity(&self, equity: f64) -> StoreResult<()>;

    async fn risk_snapshot(&self) -> StoreResult<RiskSnapshot>;

    /// Evaluate `candidate` against a fresh snapshot and, when approved,
    /// reserve the market until `apply_fill` or `release_reservation`.
    async fn reserve_risk(
        &self,
        gate: &RiskGate,
        candidate: &OrderCandidate,
    ) -> StoreResult<RiskDecision>;

    async fn release_reservation(&self, market: &str) -> StoreResult<()>;

    /// Fold a settled fill into positions and daily results, releasing the
    /// market's reservation. Returns the touched position.
    async fn apply_fill(&self, fill: &FillEffect) -> StoreResult<Option<Position>>;

    // ============== Performance ==============

    async fn daily_performance(&self, date: NaiveDate) -> StoreResult<Vec<DailyPerformance>>;

    async fn save_performance_metric(&self, metric: &PerformanceMetric) -> StoreResult<()>;

    async fn performance_metrics(&self) -> StoreResult<Vec<PerformanceMetric>>;
}
