use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Timeframe;
use crate::strategy::StrategyParams;

/// Tuning keys accepted in `StrategyConfig::tuning`
pub const TUNING_KEYS: &[&str] = &["min_confidence", "order_fraction"];

/// Per-market strategy selection and risk thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyConfig {
    pub market: String,
    pub params: StrategyParams,
    pub timeframe: Timeframe,
    /// Take-profit distance from entry (0.05 = +5%)
    #[serde(default = "default_profit_target")]
    pub profit_target: f64,
    /// Stop-loss distance from entry (0.03 = -3%)
    #[serde(default = "default_stop_loss")]
    pub stop_loss: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Strategy-independent tuning values, validated against `TUNING_KEYS`
    #[serde(default)]
    pub tuning: BTreeMap<String, f64>,
}

fn default_enabled() -> bool {
    true
}

fn default_profit_target() -> f64 {
    0.05
}

fn default_stop_loss() -> f64 {
    0.03
}

impl StrategyConfig {
    pub fn new(market: impl Into<String>, params: StrategyParams, timeframe: Timeframe) -> Self {
        Self {
            market: market.into(),
            params,
            timeframe,
            profit_target: default_profit_target(),
            stop_loss: default_stop_loss(),
            enabled: true,
            tuning: BTreeMap::new(),
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.params.name()
    }

    /// Reject malformed configs at load time rather than at use time
    pub fn validate(&self) -> Result<(), String> {
        if self.market.is_empty() {
            return Err("market must not be empty".to_string());
        }
        if !(self.profit_target > 0.0 && self.profit_target.is_finite()) {
            return Err(format!(
                "{}: profit_target must be positive, got {}",
                self.market, self.profit_target
            ));
        }
        if !(self.stop_loss > 0.0 && self.stop_loss < 1.0) {
            return Err(format!(
                "{}: stop_loss must be in (0, 1), got {}",
                self.market, self.stop_loss
            ));
        }

        for (key, value) in &self.tuning {
            if !TUNING_KEYS.contains(&key.as_str()) {
                return Err(format!("{}: unknown tuning key '{}'", self.market, key));
            }
            if !value.is_finite() || *value < 0.0 || *value > 1.0 {
                return Err(format!(
                    "{}: tuning '{}' must be within [0, 1], got {}",
                    self.market, key, value
                ));
            }
        }

        self.params
            .validate()
            .map_err(|e| format!("{}: {}", self.market, e))
    }

    pub fn min_confidence(&self) -> f64 {
        self.tuning.get("min_confidence").copied().unwrap_or(0.0)
    }

    pub fn order_fraction(&self) -> Option<f64> {
        self.tuning.get("order_fraction").copied()
    }
}
