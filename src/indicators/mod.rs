// Price indicators used by the built-in strategies

pub mod moving_average;
pub mod rsi;

pub use moving_average::{calculate_sma, sma_cross, Cross};
pub use rsi::calculate_rsi;
