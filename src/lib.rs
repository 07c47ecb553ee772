// Core modules
pub mod admin;
pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod performance;
pub mod pipeline;
pub mod risk;
pub mod shutdown;
pub mod store;
pub mod strategy;

// Re-export commonly used types
pub use api::{ExchangeApi, UpbitClient};
pub use error::{Error, ExchangeError};
pub use models::*;
pub use store::Store;
pub use strategy::Strategy;

// Error handling
pub type Result<T> = std::result::Result<T, Error>;
