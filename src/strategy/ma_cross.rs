use super::{EvaluationInput, Strategy};
use crate::error::StrategyError;
use crate::indicators::{calculate_sma, sma_cross, Cross};
use crate::models::{Direction, Signal};

/// Moving average crossover strategy
///
/// Golden cross of the short SMA over the long SMA buys, death cross sells.
/// The averages run over candle closes with the current price appended, so
/// a cross is detected on the tick that causes it.
#[derive(Debug, Clone)]
pub struct MaCrossStrategy {
    short_period: usize,
    long_period: usize,
}

impl MaCrossStrategy {
    pub fn new(short_period: usize, long_period: usize) -> Self {
        Self {
            short_period,
            long_period,
        }
    }
}

impl Strategy for MaCrossStrategy {
    fn evaluate(&self, input: &EvaluationInput) -> Result<Vec<Signal>, StrategyError> {
        input.check_finite()?;
        self.ensure_history(input)?;

        let prices = input.closes_with_price();
        let cross = sma_cross(&prices, self.short_period, self.long_period).ok_or_else(|| {
            StrategyError::ComputationFault(format!(
                "cannot compute SMA {}/{} over {} prices",
                self.short_period,
                self.long_period,
                prices.len()
            ))
        })?;

        let direction = match cross {
            Cross::Golden => Direction::Buy,
            Cross::Death => Direction::Sell,
            Cross::None => return Ok(Vec::new()),
        };

        let short = calculate_sma(&prices, self.short_period).unwrap_or(input.price);
        let long = calculate_sma(&prices, self.long_period).unwrap_or(input.price);
        // Wider spread between the averages = stronger cross
        let spread = ((short - long) / long).abs();
        let confidence = (0.5 + spread * 10.0).min(1.0);

        tracing::debug!(
            "{} {:?} cross: SMA{} {:.4} vs SMA{} {:.4}",
            input.market,
            cross,
            self.short_period,
            short,
            self.long_period,
            long
        );

        Ok(vec![Signal::new(
            self.name(),
            input.market,
            direction,
            input.price,
            confidence,
        )
        .with_parameter("short_sma", short)
        .with_parameter("long_sma", long)
        .at(input.timestamp)])
    }

    fn name(&self) -> &str {
        "ma_cross"
    }

    fn min_candles_required(&self) -> usize {
        self.long_period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{candles, input};

    #[test]
    fn test_golden_cross_on_current_price() {
        let history = candles(&[10.0; 5]);
        let signals = MaCrossStrategy::new(2, 5)
            .evaluate(&input(&history, 14.0, Some(10.0)))
            .unwrap();

        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction(), Direction::Buy);
        assert!(signals[0].confidence() >= 0.5);
        assert!(signals[0].parameters().contains_key("short_sma"));
    }

    #[test]
    fn test_death_cross_sells() {
        let history = candles(&[10.0; 5]);
        let signals = MaCrossStrategy::new(2, 5)
            .evaluate(&input(&history, 6.0, Some(10.0)))
            .unwrap();
        assert_eq!(signals[0].direction(), Direction::Sell);
    }

    #[test]
    fn test_no_cross_no_signal() {
        let history = candles(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let signals = MaCrossStrategy::new(2, 5)
            .evaluate(&input(&history, 7.0, Some(6.0)))
            .unwrap();
        assert!(signals.is_empty());
    }

    #[test]
    fn test_short_history_is_insufficient() {
        let history = candles(&[10.0; 3]);
        let result = MaCrossStrategy::new(2, 5).evaluate(&input(&history, 10.0, None));
        assert_eq!(
            result.unwrap_err(),
            StrategyError::InsufficientData { have: 3, need: 5 }
        );
    }
}
