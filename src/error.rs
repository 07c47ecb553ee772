use thiserror::Error;

use crate::models::OrderState;

/// Top-level error for the trading agent
#[derive(Error, Debug)]
pub enum Error {
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("Order state error: {0}")]
    OrderState(#[from] OrderStateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),
}

/// Failures of the exchange protocol client
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Non-2xx response from the exchange
    #[error("Exchange returned {status}: {body}")]
    Protocol { status: u16, body: String },

    /// Malformed request, detected before any network call
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Successful response that did not contain the requested resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Order submission refused by the exchange
    #[error("Order rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// Streaming connection dropped or could not be established
    #[error("Connection lost: {0}")]
    TransientConnection(String),

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to decode exchange payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Failed to sign request: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

impl ExchangeError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ExchangeError::Protocol { status, .. } | ExchangeError::Rejected { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// The request may have reached the exchange and taken effect even
    /// though no answer came back: timeouts, dropped connections, 5xx and
    /// undecodable bodies.
    pub fn outcome_unknown(&self) -> bool {
        match self {
            ExchangeError::Transport(_)
            | ExchangeError::Decode(_)
            | ExchangeError::TransientConnection(_) => true,
            ExchangeError::Protocol { status, .. } | ExchangeError::Rejected { status, .. } => {
                *status >= 500
            }
            ExchangeError::InvalidArgument(_)
            | ExchangeError::NotFound(_)
            | ExchangeError::Signing(_) => false,
        }
    }
}

/// Strategy evaluation failures. Always logged and skipped by the pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrategyError {
    #[error("Insufficient data: {have} candles, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("Computation fault: {0}")]
    ComputationFault(String),
}

/// Illegal lifecycle transition of an order
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderStateError {
    #[error("Order is terminal ({from}), cannot move to {to}")]
    Terminal { from: OrderState, to: OrderState },

    #[error("Illegal order transition {from} -> {to}")]
    Illegal { from: OrderState, to: OrderState },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Invalid record: {0}")]
    Invalid(String),
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
