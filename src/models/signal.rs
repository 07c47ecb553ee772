use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::{ExitReason, Side};

/// Trading direction of a signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// Exchange order side for this direction
    pub fn side(&self) -> Side {
        match self {
            Direction::Buy => Side::Bid,
            Direction::Sell => Side::Ask,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "BUY" => Some(Direction::Buy),
            "SELL" => Some(Direction::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy-derived trading recommendation
///
/// Fields are private: a signal is immutable once it has left the builder
/// methods below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    id: Uuid,
    strategy: String,
    market: String,
    direction: Direction,
    price: f64,
    confidence: f64,
    parameters: BTreeMap<String, f64>,
    exit_reason: Option<ExitReason>,
    timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        strategy: impl Into<String>,
        market: impl Into<String>,
        direction: Direction,
        price: f64,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy: strategy.into(),
            market: market.into(),
            direction,
            price,
            confidence: confidence.clamp(0.0, 1.0),
            parameters: BTreeMap::new(),
            exit_reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: f64) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_exit_reason(mut self, reason: ExitReason) -> Self {
        self.exit_reason = Some(reason);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Rebuild a stored signal
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: Uuid,
        strategy: String,
        market: String,
        direction: Direction,
        price: f64,
        confidence: f64,
        parameters: BTreeMap<String, f64>,
        exit_reason: Option<ExitReason>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            strategy,
            market,
            direction,
            price,
            confidence,
            parameters,
            exit_reason,
            timestamp,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    pub fn market(&self) -> &str {
        &self.market
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn parameters(&self) -> &BTreeMap<String, f64> {
        &self.parameters
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_reason
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Persisted record of a signal the risk gate refused
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockedSignal {
    pub signal_id: Uuid,
    pub market: String,
    pub direction: Direction,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}
