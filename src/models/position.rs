use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OPEN" => Some(PositionStatus::Open),
            "CLOSED" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExitReason {
    /// Profit target reached
    Target,
    /// Stop loss hit
    Stop,
    /// Operator command
    Manual,
    /// Strategy sell signal
    Signal,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Target => "TARGET",
            ExitReason::Stop => "STOP",
            ExitReason::Manual => "MANUAL",
            ExitReason::Signal => "SIGNAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "TARGET" => Some(ExitReason::Target),
            "STOP" => Some(ExitReason::Stop),
            "MANUAL" => Some(ExitReason::Manual),
            "SIGNAL" => Some(ExitReason::Signal),
            _ => None,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holding in a single market
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub id: Uuid,
    pub market: String,
    pub entry_price: f64, // Average entry price for accumulated fills
    pub entry_time: DateTime<Utc>,
    pub quantity: f64,
    pub status: PositionStatus,
    pub profit_target: f64, // Absolute price
    pub stop_loss: f64,     // Absolute price
    pub last_price: f64,
    pub current_profit: f64,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: Option<f64>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn notional(&self) -> f64 {
        self.last_price * self.quantity
    }
}
