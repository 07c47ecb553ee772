use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::models::{Direction, Position};

/// Portfolio limits applied to every opening order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskLimits {
    pub max_open_positions: usize,
    /// Largest single order as a fraction of equity
    pub max_position_fraction: f64,
    /// Trading stops for the day once losses reach this fraction of equity
    pub max_daily_loss_fraction: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_open_positions: 3,
            max_position_fraction: 0.2,
            max_daily_loss_fraction: 0.05,
        }
    }
}

impl RiskLimits {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_open_positions == 0 {
            return Err("max_open_positions must be at least 1".into());
        }
        for (name, value) in [
            ("max_position_fraction", self.max_position_fraction),
            ("max_daily_loss_fraction", self.max_daily_loss_fraction),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(format!("{} must be in (0, 1], got {}", name, value));
            }
        }
        Ok(())
    }
}

/// What the portfolio holds or is about to hold in one market
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketExposure {
    pub open_quantity: f64,
    pub notional: f64,
    /// Direction of an approved order that has not settled yet
    pub in_flight: Option<Direction>,
}

impl MarketExposure {
    pub fn has_position(&self) -> bool {
        self.open_quantity > 0.0
    }

    /// Counts against the open position limit
    fn occupies_slot(&self) -> bool {
        self.has_position() || self.in_flight == Some(Direction::Buy)
    }
}

/// Consistent view of the portfolio taken inside the store's critical section
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskSnapshot {
    pub equity: f64,
    pub exposures: HashMap<String, MarketExposure>,
    pub realized_pnl_today: f64,
    pub unrealized_pnl: f64,
}

impl RiskSnapshot {
    /// Assemble a snapshot from open positions and pending reservations
    pub fn build<'a>(
        equity: f64,
        open_positions: impl IntoIterator<Item = &'a Position>,
        reservations: &HashMap<String, Direction>,
        realized_pnl_today: f64,
    ) -> Self {
        let mut exposures: HashMap<String, MarketExposure> = HashMap::new();
        let mut unrealized_pnl = 0.0;

        for position in open_positions.into_iter().filter(|p| p.is_open()) {
            let exposure = exposures.entry(position.market.clone()).or_default();
            exposure.open_quantity += position.quantity;
            exposure.notional += position.notional();
            unrealized_pnl += (position.last_price - position.entry_price) * position.quantity;
        }
        for (market, direction) in reservations {
            exposures.entry(market.clone()).or_default().in_flight = Some(*direction);
        }

        Self {
            equity,
            exposures,
            realized_pnl_today,
            unrealized_pnl,
        }
    }

    pub fn exposure(&self, market: &str) -> Option<&MarketExposure> {
        self.exposures.get(market)
    }

    pub fn open_count(&self) -> usize {
        self.exposures.values().filter(|e| e.occupies_slot()).count()
    }

    /// Today's loss as a positive number (0 when in profit)
    pub fn daily_loss(&self) -> f64 {
        (-(self.realized_pnl_today + self.unrealized_pnl)).max(0.0)
    }
}

/// Order the engine wants to place
#[derive(Debug, Clone, PartialEq)]
pub struct OrderCandidate {
    pub market: String,
    pub direction: Direction,
    /// Quote amount at stake
    pub notional: f64,
    /// Base quantity, known for sells
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    OrderInFlight,
    PositionAlreadyOpen,
    NoPositionToClose,
    MaxPositions,
    PositionSize,
    DailyLoss,
    /// Sized order the exchange would refuse, such as a zero spend
    InvalidOrder,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::OrderInFlight => "order in flight",
            BlockReason::PositionAlreadyOpen => "position already open",
            BlockReason::NoPositionToClose => "no position to close",
            BlockReason::MaxPositions => "max positions",
            BlockReason::PositionSize => "position size",
            BlockReason::DailyLoss => "daily loss",
            BlockReason::InvalidOrder => "invalid order",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskDecision {
    Approved,
    Blocked(BlockReason),
}

impl RiskDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskDecision::Approved)
    }
}

/// Pre-trade risk checks. Rules run in order and the first failure wins:
///
/// 1. one position per market: no second entry, nothing to sell without one,
///    nothing while an order for the market is still in flight
/// 2. open position count
/// 3. order size against equity
/// 4. daily loss against equity
///
/// Closing orders only go through rule 1.
#[derive(Debug, Clone, Default)]
pub struct RiskGate {
    limits: RiskLimits,
}

impl RiskGate {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn evaluate(&self, snapshot: &RiskSnapshot, candidate: &OrderCandidate) -> RiskDecision {
        let exposure = snapshot.exposure(&candidate.market);

        if exposure.is_some_and(|e| e.in_flight.is_some()) {
            return RiskDecision::Blocked(BlockReason::OrderInFlight);
        }

        let has_position = exposure.is_some_and(|e| e.has_position());
        match (candidate.direction, has_position) {
            (Direction::Buy, true) => {
                return RiskDecision::Blocked(BlockReason::PositionAlreadyOpen);
            }
            (Direction::Sell, false) => {
                return RiskDecision::Blocked(BlockReason::NoPositionToClose);
            }
            (Direction::Sell, true) => return RiskDecision::Approved,
            (Direction::Buy, false) => {}
        }

        if snapshot.open_count() + 1 > self.limits.max_open_positions {
            return RiskDecision::Blocked(BlockReason::MaxPositions);
        }

        if candidate.notional > self.limits.max_position_fraction * snapshot.equity {
            return RiskDecision::Blocked(BlockReason::PositionSize);
        }

        let loss_limit = self.limits.max_daily_loss_fraction * snapshot.equity;
        if snapshot.daily_loss() >= loss_limit {
            return RiskDecision::Blocked(BlockReason::DailyLoss);
        }

        RiskDecision::Approved
    }
}
