use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{OrderState, Side};
use crate::risk::BlockReason;

/// Order lifecycle notifications published on the order-event queue
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrderEvent {
    Submitted {
        order_id: String,
        market: String,
        side: Side,
        at: DateTime<Utc>,
    },
    Updated {
        order_id: String,
        state: OrderState,
        executed_volume: f64,
        at: DateTime<Utc>,
    },
    Filled {
        order_id: String,
        market: String,
        side: Side,
        /// Volume-weighted fill price
        price: f64,
        volume: f64,
        at: DateTime<Utc>,
    },
    Canceled {
        order_id: String,
        market: String,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    Blocked {
        signal_id: Uuid,
        market: String,
        reason: BlockReason,
        at: DateTime<Utc>,
    },
}

impl OrderEvent {
    pub fn market(&self) -> Option<&str> {
        match self {
            OrderEvent::Submitted { market, .. }
            | OrderEvent::Filled { market, .. }
            | OrderEvent::Canceled { market, .. }
            | OrderEvent::Blocked { market, .. } => Some(market),
            OrderEvent::Updated { .. } => None,
        }
    }
}
