/// Simple moving average of the last `period` values
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Crossing of a short average over a long one between the last two points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cross {
    /// Short average moved from below to above the long one
    Golden,
    /// Short average moved from above to below the long one
    Death,
    None,
}

/// Compare short/long SMAs on `prices` with and without the latest value.
///
/// Needs `long + 1` values.
pub fn sma_cross(prices: &[f64], short: usize, long: usize) -> Option<Cross> {
    if short == 0 || short >= long || prices.len() < long + 1 {
        return None;
    }

    let previous = &prices[..prices.len() - 1];
    let prev_short = calculate_sma(previous, short)?;
    let prev_long = calculate_sma(previous, long)?;
    let cur_short = calculate_sma(prices, short)?;
    let cur_long = calculate_sma(prices, long)?;

    let cross = if prev_short <= prev_long && cur_short > cur_long {
        Cross::Golden
    } else if prev_short >= prev_long && cur_short < cur_long {
        Cross::Death
    } else {
        Cross::None
    };
    Some(cross)
}
