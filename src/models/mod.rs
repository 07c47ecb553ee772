// Shared data model
pub mod market;
pub mod order;
pub mod performance;
pub mod position;
pub mod signal;
pub mod strategy_config;

pub use market::{Candle, Market, MarketData, Ticker, Timeframe};
pub use order::{ExchangeOrderStatus, Order, OrderState, OrderType, Side, Trade};
pub use performance::{DailyPerformance, PerformanceMetric};
pub use position::{ExitReason, Position, PositionStatus};
pub use signal::{BlockedSignal, Direction, Signal};
pub use strategy_config::StrategyConfig;
