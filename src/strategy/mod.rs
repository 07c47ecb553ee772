// Trading strategy module
pub mod ma_cross;
pub mod rsi;
pub mod threshold;

pub use ma_cross::MaCrossStrategy;
pub use rsi::RsiStrategy;
pub use threshold::ThresholdStrategy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StrategyError;
use crate::models::{Candle, Signal};

/// Everything a strategy may look at for one tick
#[derive(Debug, Clone)]
pub struct EvaluationInput<'a> {
    pub market: &'a str,
    /// Current price from the tick
    pub price: f64,
    /// Price of the previous tick, or the last candle close
    pub previous_price: Option<f64>,
    /// Candle history, oldest first
    pub candles: &'a [Candle],
    pub timestamp: DateTime<Utc>,
}

impl EvaluationInput<'_> {
    /// Candle closes with the current price appended
    pub fn closes_with_price(&self) -> Vec<f64> {
        let mut closes: Vec<f64> = self.candles.iter().map(|c| c.close).collect();
        closes.push(self.price);
        closes
    }

    /// Reject non-finite inputs before any math runs
    pub fn check_finite(&self) -> Result<(), StrategyError> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(StrategyError::ComputationFault(format!(
                "invalid price {} for {}",
                self.price, self.market
            )));
        }
        if let Some(candle) = self.candles.iter().find(|c| !c.close.is_finite()) {
            return Err(StrategyError::ComputationFault(format!(
                "non-finite close in candle at {}",
                candle.timestamp
            )));
        }
        Ok(())
    }
}

/// Base trait for all trading strategies
///
/// Evaluation is pure: no I/O, same input gives the same signals.
pub trait Strategy: Send + Sync {
    /// Zero or more signals for this tick
    fn evaluate(&self, input: &EvaluationInput) -> Result<Vec<Signal>, StrategyError>;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum candles required for this strategy
    fn min_candles_required(&self) -> usize;

    fn ensure_history(&self, input: &EvaluationInput) -> Result<(), StrategyError> {
        let need = self.min_candles_required();
        if input.candles.len() < need {
            return Err(StrategyError::InsufficientData {
                have: input.candles.len(),
                need,
            });
        }
        Ok(())
    }
}

/// Strategy selection with typed parameters, tagged by strategy name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyParams {
    Threshold {
        buy_threshold: f64,
        sell_threshold: f64,
    },
    MaCross {
        short_period: usize,
        long_period: usize,
    },
    Rsi {
        period: usize,
        oversold: f64,
        overbought: f64,
    },
}

impl StrategyParams {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyParams::Threshold { .. } => "threshold",
            StrategyParams::MaCross { .. } => "ma_cross",
            StrategyParams::Rsi { .. } => "rsi",
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match *self {
            StrategyParams::Threshold {
                buy_threshold,
                sell_threshold,
            } => {
                if !(buy_threshold.is_finite() && buy_threshold > 0.0) {
                    return Err(format!("buy_threshold must be positive, got {}", buy_threshold));
                }
                if !(sell_threshold.is_finite() && sell_threshold > 0.0) {
                    return Err(format!(
                        "sell_threshold must be positive, got {}",
                        sell_threshold
                    ));
                }
                Ok(())
            }
            StrategyParams::MaCross {
                short_period,
                long_period,
            } => {
                if short_period == 0 || short_period >= long_period {
                    return Err(format!(
                        "ma_cross needs 0 < short_period < long_period, got {} / {}",
                        short_period, long_period
                    ));
                }
                Ok(())
            }
            StrategyParams::Rsi {
                period,
                oversold,
                overbought,
            } => {
                if period < 2 {
                    return Err(format!("rsi period must be at least 2, got {}", period));
                }
                if !(0.0 < oversold && oversold < overbought && overbought < 100.0) {
                    return Err(format!(
                        "rsi needs 0 < oversold < overbought < 100, got {} / {}",
                        oversold, overbought
                    ));
                }
                Ok(())
            }
        }
    }

    /// Instantiate the strategy these parameters describe
    pub fn build(&self) -> Box<dyn Strategy> {
        match *self {
            StrategyParams::Threshold {
                buy_threshold,
                sell_threshold,
            } => Box::new(ThresholdStrategy::new(buy_threshold, sell_threshold)),
            StrategyParams::MaCross {
                short_period,
                long_period,
            } => Box::new(MaCrossStrategy::new(short_period, long_period)),
            StrategyParams::Rsi {
                period,
                oversold,
                overbought,
            } => Box::new(RsiStrategy::new(period, oversold, overbought)),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_tagged_by_name() {
        let params: StrategyParams = serde_json::from_str(
            r#"{"strategy":"ma_cross","short_period":5,"long_period":20}"#,
        )
        .unwrap();
        assert_eq!(params.name(), "ma_cross");
        assert_eq!(params.build().name(), "ma_cross");
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let result = serde_json::from_str::<StrategyParams>(r#"{"strategy":"martingale"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validation() {
        assert!(StrategyParams::MaCross {
            short_period: 20,
            long_period: 5
        }
        .validate()
        .is_err());
        assert!(StrategyParams::Rsi {
            period: 14,
            oversold: 70.0,
            overbought: 30.0
        }
        .validate()
        .is_err());
        assert!(StrategyParams::Threshold {
            buy_threshold: f64::NAN,
            sell_threshold: 1.0
        }
        .validate()
        .is_err());
        assert!(StrategyParams::Rsi {
            period: 14,
            oversold: 30.0,
            overbought: 70.0
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_non_finite_input_is_fault() {
        let candles = test_support::candles(&[1.0, f64::INFINITY]);
        let input = test_support::input(&candles, 1.0, None);
        assert!(matches!(
            input.check_finite(),
            Err(StrategyError::ComputationFault(_))
        ));

        let candles = test_support::candles(&[1.0]);
        let input = test_support::input(&candles, f64::NAN, None);
        assert!(input.check_finite().is_err());
    }
}
