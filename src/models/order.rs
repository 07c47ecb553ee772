use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::OrderStateError;

/// Exchange order side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy
    Bid,
    /// Sell
    Ask,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Ask => "ask",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bid" => Some(Side::Bid),
            "ask" => Some(Side::Ask),
            _ => None,
        }
    }
}

/// Order type as used inside the agent
///
/// A market buy is sent to the exchange as `ord_type=price` (total spend).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "limit" => Some(OrderType::Limit),
            "market" | "price" => Some(OrderType::Market),
            _ => None,
        }
    }
}

/// Order status as reported by the exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeOrderStatus {
    Wait,
    Watch,
    Done,
    Cancel,
}

impl ExchangeOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeOrderStatus::Wait => "WAIT",
            ExchangeOrderStatus::Watch => "WATCH",
            ExchangeOrderStatus::Done => "DONE",
            ExchangeOrderStatus::Cancel => "CANCEL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "wait" => Some(ExchangeOrderStatus::Wait),
            "watch" => Some(ExchangeOrderStatus::Watch),
            "done" => Some(ExchangeOrderStatus::Done),
            "cancel" => Some(ExchangeOrderStatus::Cancel),
            _ => None,
        }
    }
}

/// Internal order lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderState {
    /// Signal accepted and risk-approved, not yet submitted
    Pending,
    /// Accepted by the exchange, awaiting fills
    Submitted,
    PartiallyFilled,
    Filled,
    Canceled,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Canceled)
    }

    /// Validate a lifecycle move. Terminal states never move again.
    pub fn transition(self, to: OrderState) -> Result<OrderState, OrderStateError> {
        use OrderState::*;

        if self.is_terminal() {
            return Err(OrderStateError::Terminal { from: self, to });
        }

        match (self, to) {
            (Pending, Submitted) | (Pending, Canceled) => Ok(to),
            (Submitted, Submitted | PartiallyFilled | Filled | Canceled) => Ok(to),
            (PartiallyFilled, PartiallyFilled | Filled | Canceled) => Ok(to),
            _ => Err(OrderStateError::Illegal { from: self, to }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "PENDING",
            OrderState::Submitted => "SUBMITTED",
            OrderState::PartiallyFilled => "PARTIALLY_FILLED",
            OrderState::Filled => "FILLED",
            OrderState::Canceled => "CANCELED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(OrderState::Pending),
            "SUBMITTED" => Some(OrderState::Submitted),
            "PARTIALLY_FILLED" => Some(OrderState::PartiallyFilled),
            "FILLED" => Some(OrderState::Filled),
            "CANCELED" => Some(OrderState::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order tracked by the execution engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    /// Exchange order id, or the idempotency identifier when the exchange never accepted it
    pub order_id: String,
    pub market: String,
    pub side: Side,
    pub order_type: OrderType,
    /// Limit price, or total spend for a market buy
    pub price: Option<f64>,
    /// Requested volume; unknown up front for a market buy
    pub volume: Option<f64>,
    pub executed_volume: f64,
    pub exchange_status: Option<ExchangeOrderStatus>,
    pub state: OrderState,
    pub signal_id: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Order {
    pub fn pending(
        order_id: String,
        market: String,
        side: Side,
        order_type: OrderType,
        price: Option<f64>,
        volume: Option<f64>,
        signal_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id,
            market,
            side,
            order_type,
            price,
            volume,
            executed_volume: 0.0,
            exchange_status: None,
            state: OrderState::Pending,
            signal_id,
            failure_reason: None,
            created_at: now,
            last_updated: now,
        }
    }

    /// Move to `to`, rejecting illegal moves
    pub fn advance(&mut self, to: OrderState) -> Result<bool, OrderStateError> {
        let next = self.state.transition(to)?;
        let changed = next != self.state;
        self.state = next;
        self.last_updated = Utc::now();
        Ok(changed)
    }

    /// Record cumulative executed volume, never exceeding the requested volume
    pub fn record_execution(&mut self, executed: f64) {
        let executed = executed.max(0.0);
        self.executed_volume = match self.volume {
            Some(requested) if executed > requested => {
                tracing::warn!(
                    order_id = %self.order_id,
                    "Executed volume {} exceeds requested {}, clamping",
                    executed,
                    requested
                );
                requested
            }
            _ => executed,
        };
        self.last_updated = Utc::now();
    }

    /// Cancel with a reason (submission failure, abandoned tracking)
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), OrderStateError> {
        self.advance(OrderState::Canceled)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }
}

/// Single fill against an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub trade_id: String,
    pub market: String,
    pub order_id: String,
    pub price: f64,
    pub volume: f64,
    pub side: Side,
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
}
