// Order execution and position bookkeeping
pub mod candle_buffer;
pub mod engine;
pub mod events;
pub mod position_manager;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use candle_buffer::CandleBuffer;
pub use engine::{account_equity, EngineCommand, EngineConfig, ExecutionEngine, Submission};
pub use events::OrderEvent;
pub use position_manager::{apply_fill, exit_trigger, FillEffect, FillOutcome, RealizedPnl};
pub use tracker::{ExitPlan, OrderTracker};

/// Order lifecycle state machine
pub mod order_state {
    pub use crate::models::order::OrderState;
}
