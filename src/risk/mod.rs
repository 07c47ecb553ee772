// Pre-trade risk management
pub mod gate;

pub use gate::{
    BlockReason, MarketExposure, OrderCandidate, RiskDecision, RiskGate, RiskLimits, RiskSnapshot,
};
