use super::{EvaluationInput, Strategy};
use crate::error::StrategyError;
use crate::indicators::calculate_rsi;
use crate::models::{Direction, Signal};

/// RSI band strategy: buy below `oversold`, sell above `overbought`
#[derive(Debug, Clone)]
pub struct RsiStrategy {
    period: usize,
    oversold: f64,
    overbought: f64,
}

impl RsiStrategy {
    pub fn new(period: usize, oversold: f64, overbought: f64) -> Self {
        Self {
            period,
            oversold,
            overbought,
        }
    }
}

impl Strategy for RsiStrategy {
    fn evaluate(&self, input: &EvaluationInput) -> Result<Vec<Signal>, StrategyError> {
        input.check_finite()?;
        self.ensure_history(input)?;

        let prices = input.closes_with_price();
        let rsi = calculate_rsi(&prices, self.period).ok_or_else(|| {
            StrategyError::ComputationFault(format!(
                "cannot compute RSI({}) over {} prices",
                self.period,
                prices.len()
            ))
        })?;
        if !rsi.is_finite() {
            return Err(StrategyError::ComputationFault(format!(
                "RSI({}) is not finite",
                self.period
            )));
        }

        // Confidence grows with distance past the band edge
        let (direction, confidence) = if rsi < self.oversold {
            (Direction::Buy, 0.5 + 0.5 * (self.oversold - rsi) / self.oversold)
        } else if rsi > self.overbought {
            (
                Direction::Sell,
                0.5 + 0.5 * (rsi - self.overbought) / (100.0 - self.overbought),
            )
        } else {
            return Ok(Vec::new());
        };

        tracing::debug!("{} RSI({}) = {:.1}", input.market, self.period, rsi);

        Ok(vec![Signal::new(
            self.name(),
            input.market,
            direction,
            input.price,
            confidence,
        )
        .with_parameter("rsi", rsi)
        .at(input.timestamp)])
    }

    fn name(&self) -> &str {
        "rsi"
    }

    fn min_candles_required(&self) -> usize {
        self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{candles, input};

    fn strategy() -> RsiStrategy {
        RsiStrategy::new(5, 30.0, 70.0)
    }

    #[test]
    fn test_oversold_buys() {
        let history = candles(&[105.0, 104.0, 103.0, 102.0, 101.0]);
        let signals = strategy().evaluate(&input(&history, 100.0, None)).unwrap();

        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction(), Direction::Buy);
        assert_eq!(signals[0].parameters()["rsi"], 0.0);
        assert_eq!(signals[0].confidence(), 1.0);
    }

    #[test]
    fn test_overbought_sells() {
        let history = candles(&[100.0, 101.0, 102.0, 103.0, 104.0]);
        let signals = strategy().evaluate(&input(&history, 105.0, None)).unwrap();
        assert_eq!(signals[0].direction(), Direction::Sell);
    }

    #[test]
    fn test_neutral_band_is_quiet() {
        let history = candles(&[100.0, 101.0, 100.0, 101.0, 100.0]);
        let signals = strategy().evaluate(&input(&history, 101.0, None)).unwrap();
        assert!(signals.is_empty());
    }

    #[test]
    fn test_short_history_is_insufficient() {
        let history = candles(&[100.0, 101.0]);
        assert!(matches!(
            strategy().evaluate(&input(&history, 100.0, None)),
            Err(StrategyError::InsufficientData { have: 2, need: 5 })
        ));
    }
}
