use super::{EvaluationInput, Strategy};
use crate::error::StrategyError;
use crate::models::{Direction, Signal};

/// Price threshold crossing strategy
///
/// Buys when price crosses up through `buy_threshold`
/// (previous < threshold <= current) and sells when it crosses down through
/// `sell_threshold` (previous > threshold >= current). Needs a previous
/// price; without one nothing fires.
#[derive(Debug, Clone)]
pub struct ThresholdStrategy {
    buy_threshold: f64,
    sell_threshold: f64,
}

impl ThresholdStrategy {
    pub fn new(buy_threshold: f64, sell_threshold: f64) -> Self {
        Self {
            buy_threshold,
            sell_threshold,
        }
    }

    fn signal(&self, input: &EvaluationInput, direction: Direction, threshold: f64) -> Signal {
        Signal::new(self.name(), input.market, direction, input.price, 1.0)
            .with_parameter("threshold", threshold)
            .with_parameter("previous_price", input.previous_price.unwrap_or(input.price))
            .at(input.timestamp)
    }
}

impl Strategy for ThresholdStrategy {
    fn evaluate(&self, input: &EvaluationInput) -> Result<Vec<Signal>, StrategyError> {
        input.check_finite()?;

        let Some(previous) = input.previous_price else {
            return Ok(Vec::new());
        };
        if !previous.is_finite() {
            return Err(StrategyError::ComputationFault(format!(
                "non-finite previous price for {}",
                input.market
            )));
        }

        let current = input.price;
        let mut signals = Vec::new();

        if previous < self.buy_threshold && self.buy_threshold <= current {
            tracing::debug!(
                "{} crossed up through {} ({} -> {})",
                input.market,
                self.buy_threshold,
                previous,
                current
            );
            signals.push(self.signal(input, Direction::Buy, self.buy_threshold));
        }
        if previous > self.sell_threshold && self.sell_threshold >= current {
            tracing::debug!(
                "{} crossed down through {} ({} -> {})",
                input.market,
                self.sell_threshold,
                previous,
                current
            );
            signals.push(self.signal(input, Direction::Sell, self.sell_threshold));
        }

        Ok(signals)
    }

    fn name(&self) -> &str {
        "threshold"
    }

    fn min_candles_required(&self) -> usize {
        0
    }
}
