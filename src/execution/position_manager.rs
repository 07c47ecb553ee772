use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Direction, ExitReason, Position, PositionStatus};

/// Quantities below this are treated as fully closed
const DUST: f64 = 1e-12;

/// Settled fill to fold into the position book
#[derive(Debug, Clone, PartialEq)]
pub struct FillEffect {
    pub market: String,
    pub direction: Direction,
    /// Volume-weighted fill price
    pub price: f64,
    pub volume: f64,
    pub fee: f64,
    /// Why a sell happened; `Signal` when not given
    pub exit_reason: Option<ExitReason>,
    /// Take-profit distance used when a buy opens a position
    pub profit_target_pct: f64,
    /// Stop-loss distance used when a buy opens a position
    pub stop_loss_pct: f64,
    pub timestamp: DateTime<Utc>,
}

/// Profit realized by a sell fill
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RealizedPnl {
    pub amount: f64,
    /// Return on the sold quantity's cost, in percent
    pub percentage: f64,
    /// The sell closed the position
    pub closed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillOutcome {
    /// Position after the fill (closed positions included)
    pub position: Option<Position>,
    pub realized: Option<RealizedPnl>,
}

/// Fold one fill into the market's open position, if any.
///
/// Buys open or average into the position; sells reduce it and close it
/// once nothing is left. A sell without an open position changes nothing.
pub fn apply_fill(existing: Option<Position>, fill: &FillEffect) -> FillOutcome {
    match (fill.direction, existing) {
        (Direction::Buy, None) => FillOutcome {
            position: Some(open_from_fill(fill)),
            realized: None,
        },
        (Direction::Buy, Some(mut position)) => {
            accumulate(&mut position, fill);
            FillOutcome {
                position: Some(position),
                realized: None,
            }
        }
        (Direction::Sell, Some(mut position)) => {
            let realized = reduce(&mut position, fill);
            FillOutcome {
                position: Some(position),
                realized: Some(realized),
            }
        }
        (Direction::Sell, None) => {
            tracing::warn!(
                "Sell fill for {} without an open position, ignoring",
                fill.market
            );
            FillOutcome {
                position: None,
                realized: None,
            }
        }
    }
}

fn open_from_fill(fill: &FillEffect) -> Position {
    let mut position = Position {
        id: Uuid::new_v4(),
        market: fill.market.clone(),
        entry_price: fill.price,
        entry_time: fill.timestamp,
        quantity: fill.volume,
        status: PositionStatus::Open,
        profit_target: 0.0,
        stop_loss: 0.0,
        last_price: fill.price,
        current_profit: 0.0,
        exit_price: None,
        exit_time: None,
        exit_reason: None,
        realized_pnl: None,
    };
    set_exit_levels(&mut position, fill.profit_target_pct, fill.stop_loss_pct);

    tracing::info!(
        "📈 Opened {} position: {:.8} @ {}",
        position.market,
        position.quantity,
        position.entry_price
    );
    position
}

fn accumulate(position: &mut Position, fill: &FillEffect) {
    let cost = position.entry_price * position.quantity + fill.price * fill.volume;
    position.quantity += fill.volume;
    position.entry_price = cost / position.quantity;
    set_exit_levels(position, fill.profit_target_pct, fill.stop_loss_pct);
    mark_price(position, fill.price);

    tracing::info!(
        "Accumulated {} {:.8} @ {} (avg: {}, total qty: {:.8})",
        position.market,
        fill.volume,
        fill.price,
        position.entry_price,
        position.quantity
    );
}

fn reduce(position: &mut Position, fill: &FillEffect) -> RealizedPnl {
    let sold = fill.volume.min(position.quantity);
    let amount = (fill.price - position.entry_price) * sold - fill.fee;
    let cost = position.entry_price * sold;
    let percentage = if cost > 0.0 { amount / cost * 100.0 } else { 0.0 };

    position.quantity -= sold;
    position.realized_pnl = Some(position.realized_pnl.unwrap_or(0.0) + amount);
    mark_price(position, fill.price);

    let closed = position.quantity <= DUST;
    if closed {
        position.quantity = 0.0;
        position.status = PositionStatus::Closed;
        position.exit_price = Some(fill.price);
        position.exit_time = Some(fill.timestamp);
        position.exit_reason = Some(fill.exit_reason.unwrap_or(ExitReason::Signal));
        position.current_profit = 0.0;

        tracing::info!(
            "📉 Closed {} position @ {} ({}): pnl {:.2}",
            position.market,
            fill.price,
            position.exit_reason.map(|r| r.as_str()).unwrap_or("SIGNAL"),
            position.realized_pnl.unwrap_or(0.0)
        );
    }

    RealizedPnl {
        amount,
        percentage,
        closed,
    }
}

/// Absolute exit prices from fractional distances around the entry
pub fn set_exit_levels(position: &mut Position, profit_target_pct: f64, stop_loss_pct: f64) {
    position.profit_target = position.entry_price * (1.0 + profit_target_pct);
    position.stop_loss = position.entry_price * (1.0 - stop_loss_pct);
}

/// Update last price and unrealized profit
pub fn mark_price(position: &mut Position, price: f64) {
    position.last_price = price;
    position.current_profit = (price - position.entry_price) * position.quantity;
}

/// Exit the current price calls for, if any
pub fn exit_trigger(position: &Position, price: f64) -> Option<ExitReason> {
    if !position.is_open() {
        return None;
    }
    if price >= position.profit_target {
        Some(ExitReason::Target)
    } else if price <= position.stop_loss {
        Some(ExitReason::Stop)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(direction: Direction, price: f64, volume: f64) -> FillEffect {
        FillEffect {
            market: "KRW-BTC".to_string(),
            direction,
            price,
            volume,
            fee: 0.0,
            exit_reason: None,
            profit_target_pct: 0.05,
            stop_loss_pct: 0.03,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_buy_opens_position_with_levels() {
        let outcome = apply_fill(None, &fill(Direction::Buy, 100.0, 2.0));
        let position = outcome.position.unwrap();

        assert!(position.is_open());
        assert_eq!(position.entry_price, 100.0);
        assert_eq!(position.quantity, 2.0);
        assert!((position.profit_target - 105.0).abs() < 1e-9);
        assert!((position.stop_loss - 97.0).abs() < 1e-9);
        assert!(outcome.realized.is_none());
    }

    #[test]
    fn test_second_buy_averages_entry() {
        let position = apply_fill(None, &fill(Direction::Buy, 100.0, 1.0)).position;
        let position = apply_fill(position, &fill(Direction::Buy, 110.0, 1.0))
            .position
            .unwrap();

        assert_eq!(position.quantity, 2.0);
        assert_eq!(position.entry_price, 105.0);
    }

    #[test]
    fn test_full_sell_closes_once() {
        let position = apply_fill(None, &fill(Direction::Buy, 100.0, 2.0)).position;
        let mut sell = fill(Direction::Sell, 110.0, 2.0);
        sell.exit_reason = Some(ExitReason::Target);
        sell.fee = 1.0;

        let outcome = apply_fill(position, &sell);
        let position = outcome.position.unwrap();
        let realized = outcome.realized.unwrap();

        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.exit_reason, Some(ExitReason::Target));
        assert_eq!(position.exit_price, Some(110.0));
        assert_eq!(realized.amount, 19.0);
        assert!(realized.closed);
        assert_eq!(position.realized_pnl, Some(19.0));
    }

    #[test]
    fn test_partial_sell_keeps_position_open() {
        let position = apply_fill(None, &fill(Direction::Buy, 100.0, 2.0)).position;
        let outcome = apply_fill(position, &fill(Direction::Sell, 90.0, 0.5));
        let position = outcome.position.unwrap();

        assert!(position.is_open());
        assert_eq!(position.quantity, 1.5);
        assert_eq!(outcome.realized.unwrap().amount, -5.0);
        assert!(!outcome.realized.unwrap().closed);
    }

    #[test]
    fn test_sell_without_position_is_noop() {
        let outcome = apply_fill(None, &fill(Direction::Sell, 100.0, 1.0));
        assert!(outcome.position.is_none());
        assert!(outcome.realized.is_none());
    }

    #[test]
    fn test_exit_triggers() {
        let position = apply_fill(None, &fill(Direction::Buy, 100.0, 1.0))
            .position
            .unwrap();

        assert_eq!(exit_trigger(&position, 105.0), Some(ExitReason::Target));
        assert_eq!(exit_trigger(&position, 96.0), Some(ExitReason::Stop));
        assert_eq!(exit_trigger(&position, 100.0), None);
    }

    #[test]
    fn test_mark_price_updates_profit() {
        let mut position = apply_fill(None, &fill(Direction::Buy, 100.0, 2.0))
            .position
            .unwrap();
        mark_price(&mut position, 103.0);
        assert_eq!(position.current_profit, 6.0);
        assert_eq!(position.notional(), 206.0);
    }
}
