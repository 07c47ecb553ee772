use ::config::builder::DefaultState;
use ::config::{Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::api::feed::{FeedConfig, UPBIT_WS_URL};
use crate::api::upbit::UPBIT_API_BASE;
use crate::error::Error;
use crate::execution::EngineConfig;
use crate::models::StrategyConfig;
use crate::risk::RiskLimits;
use crate::Result;

pub const DEFAULT_CONFIG_PATH: &str = "config/upbot.toml";
const ENV_PREFIX: &str = "UPBOT";

/// Largest candle page the exchange serves
const MAX_CANDLE_HISTORY: u32 = 200;
const STREAM_TYPES: &[&str] = &["trade", "ticker", "orderbook"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub rest_url: String,
    pub ws_url: String,
    pub access_key: String,
    pub secret_key: String,
    pub quote_currency: String,
    /// Base symbols never listed, e.g. stablecoins
    pub excluded_symbols: Vec<String>,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            rest_url: UPBIT_API_BASE.to_string(),
            ws_url: UPBIT_WS_URL.to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            quote_currency: "KRW".to_string(),
            excluded_symbols: vec!["USDT".to_string(), "USDC".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub stream_types: Vec<String>,
    pub keepalive_secs: u64,
    pub enqueue_timeout_ms: u64,
    pub connect_timeout_secs: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            stream_types: vec!["trade".to_string()],
            keepalive_secs: 30,
            enqueue_timeout_ms: 500,
            connect_timeout_secs: 45,
            initial_backoff_ms: 1000,
            max_backoff_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    /// Candles kept per market, in memory and per refresh
    pub candle_history: u32,
    pub candle_refresh_secs: u64,
    /// Wait before the monitor raises again an exit that left its position open
    pub exit_retry_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            candle_history: 200,
            candle_refresh_secs: 60,
            exit_retry_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub poll_interval_ms: u64,
    pub max_poll_failures: u32,
    pub default_order_fraction: f64,
    /// 0 turns the periodic balance refresh off
    pub balance_refresh_secs: u64,
    pub dry_run: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_poll_failures: 5,
            default_order_fraction: 0.1,
            balance_refresh_secs: 60,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketSettings {
    pub refresh_secs: u64,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self { refresh_secs: 3600 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// No URL means the in-memory store
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
    pub report_secs: u64,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self { report_secs: 3600 }
    }
}

/// Process configuration
///
/// Layered as: built-in defaults, then the TOML file, then `UPBOT__*`
/// environment variables (`UPBOT__EXCHANGE__ACCESS_KEY`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub exchange: ExchangeSettings,
    pub feed: FeedSettings,
    pub pipeline: PipelineSettings,
    pub execution: ExecutionSettings,
    pub risk: RiskLimits,
    pub markets: MarketSettings,
    pub database: DatabaseSettings,
    pub performance: PerformanceSettings,
    pub shutdown_timeout_secs: u64,
    /// Seeded into the store for markets that have no config yet
    pub strategies: Vec<StrategyConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            exchange: ExchangeSettings::default(),
            feed: FeedSettings::default(),
            pipeline: PipelineSettings::default(),
            execution: ExecutionSettings::default(),
            risk: RiskLimits::default(),
            markets: MarketSettings::default(),
            database: DatabaseSettings::default(),
            performance: PerformanceSettings::default(),
            shutdown_timeout_secs: 10,
            strategies: Vec::new(),
        }
    }
}

impl Settings {
    /// Load from `path` (or the default location, which may be absent).
    /// `force_dry_run` wins over every other layer.
    pub fn load(path: Option<&Path>, force_dry_run: bool) -> Result<Self> {
        let file = path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
        tracing::info!("Loading configuration from {}", file.display());

        let builder = Config::builder()
            .add_source(File::from(file).required(path.is_some()))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("execution.dry_run", force_dry_run.then_some(true))
            .map_err(|e| Error::Config(e.to_string()))?;

        Self::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let settings: Settings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;
        settings.validate().map_err(Error::Config)?;
        Ok(settings)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        for (name, value) in [
            ("exchange.rest_url", &self.exchange.rest_url),
            ("exchange.ws_url", &self.exchange.ws_url),
        ] {
            url::Url::parse(value).map_err(|e| format!("{} is not a URL: {}", name, e))?;
        }
        if self.exchange.quote_currency.is_empty() {
            return Err("exchange.quote_currency must not be empty".into());
        }
        if !self.execution.dry_run
            && (self.exchange.access_key.is_empty() || self.exchange.secret_key.is_empty())
        {
            return Err("exchange credentials are required unless running dry".into());
        }

        if self.feed.stream_types.is_empty() {
            return Err("feed.stream_types must not be empty".into());
        }
        if let Some(unknown) = self
            .feed
            .stream_types
            .iter()
            .find(|t| !STREAM_TYPES.contains(&t.as_str()))
        {
            return Err(format!("unknown feed stream type '{}'", unknown));
        }
        if self.feed.initial_backoff_ms == 0
            || Duration::from_millis(self.feed.initial_backoff_ms)
                > Duration::from_secs(self.feed.max_backoff_secs)
        {
            return Err("feed backoff must satisfy 0 < initial <= max".into());
        }

        if self.pipeline.queue_capacity == 0 {
            return Err("pipeline.queue_capacity must be at least 1".into());
        }
        if !(1..=MAX_CANDLE_HISTORY).contains(&self.pipeline.candle_history) {
            return Err(format!(
                "pipeline.candle_history must be within 1..={}",
                MAX_CANDLE_HISTORY
            ));
        }

        if self.execution.poll_interval_ms == 0 || self.execution.max_poll_failures == 0 {
            return Err("execution polling must be positive".into());
        }
        let fraction = self.execution.default_order_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(format!(
                "execution.default_order_fraction must be in (0, 1], got {}",
                fraction
            ));
        }

        if self.shutdown_timeout_secs == 0 {
            return Err("shutdown_timeout_secs must be at least 1".into());
        }
        self.risk.validate()?;

        let mut markets = HashSet::new();
        for strategy in &self.strategies {
            strategy.validate()?;
            if !markets.insert(strategy.market.as_str()) {
                return Err(format!("duplicate strategy for {}", strategy.market));
            }
        }

        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        let refresh = self.execution.balance_refresh_secs;
        EngineConfig {
            poll_interval: Duration::from_millis(self.execution.poll_interval_ms),
            max_poll_failures: self.execution.max_poll_failures,
            default_order_fraction: self.execution.default_order_fraction,
            balance_refresh: (refresh > 0).then(|| Duration::from_secs(refresh)),
            quote_currency: self.exchange.quote_currency.clone(),
            shutdown_grace: self.shutdown_timeout(),
            dry_run: self.execution.dry_run,
        }
    }

    pub fn feed_config(&self, markets: Vec<String>) -> FeedConfig {
        FeedConfig {
            url: self.exchange.ws_url.clone(),
            markets,
            stream_types: self.feed.stream_types.clone(),
            keepalive: Duration::from_secs(self.feed.keepalive_secs),
            enqueue_timeout: Duration::from_millis(self.feed.enqueue_timeout_ms),
            connect_timeout: Duration::from_secs(self.feed.connect_timeout_secs),
            initial_backoff: Duration::from_millis(self.feed.initial_backoff_ms),
            max_backoff: Duration::from_secs(self.feed.max_backoff_secs),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
