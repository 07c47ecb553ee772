use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ExchangeError;

/// Exchange market (e.g. `KRW-BTC`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Market {
    #[serde(rename = "market")]
    pub market_id: String,
    #[serde(default)]
    pub korean_name: String,
    #[serde(default)]
    pub english_name: String,
    /// Quote currency prefix of the id, filled in after decoding
    #[serde(default)]
    pub market_type: String,
}

impl Market {
    /// Quote prefix of a market id (`KRW-BTC` -> `KRW`)
    pub fn quote_of(market_id: &str) -> &str {
        market_id.split('-').next().unwrap_or(market_id)
    }
}

/// Point-in-time price snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticker {
    #[serde(rename = "market")]
    pub market_id: String,
    pub trade_price: f64,
    #[serde(default)]
    pub opening_price: f64,
    #[serde(default)]
    pub high_price: f64,
    #[serde(default)]
    pub low_price: f64,
    #[serde(default)]
    pub prev_closing_price: f64,
    #[serde(default)]
    pub signed_change_rate: f64,
    #[serde(default)]
    pub acc_trade_volume_24h: f64,
    #[serde(default)]
    pub timestamp: i64,
}

/// OHLCV candle, oldest-first when held in a series
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub market: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Candle interval accepted by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    Minutes(u32),
    Days,
    Weeks,
    Months,
}

impl Timeframe {
    pub const MINUTE_UNITS: [u32; 8] = [1, 3, 5, 10, 15, 30, 60, 240];

    /// Parse `minutes/<unit>`, `days`, `weeks` or `months`
    pub fn parse(value: &str) -> Result<Self, ExchangeError> {
        match value {
            "days" => Ok(Timeframe::Days),
            "weeks" => Ok(Timeframe::Weeks),
            "months" => Ok(Timeframe::Months),
            other => {
                let unit = other
                    .strip_prefix("minutes/")
                    .and_then(|unit| unit.parse::<u32>().ok())
                    .filter(|unit| Self::MINUTE_UNITS.contains(unit))
                    .ok_or_else(|| {
                        ExchangeError::InvalidArgument(format!("unsupported timeframe: {}", value))
                    })?;
                Ok(Timeframe::Minutes(unit))
            }
        }
    }

    /// REST path segment below `/candles`
    pub fn path(&self) -> String {
        match self {
            Timeframe::Minutes(unit) => format!("minutes/{}", unit),
            Timeframe::Days => "days".to_string(),
            Timeframe::Weeks => "weeks".to_string(),
            Timeframe::Months => "months".to_string(),
        }
    }

    /// Approximate interval length in seconds (months counted as 30 days)
    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::Minutes(unit) => *unit as i64 * 60,
            Timeframe::Days => 86_400,
            Timeframe::Weeks => 7 * 86_400,
            Timeframe::Months => 30 * 86_400,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

impl TryFrom<String> for Timeframe {
    type Error = ExchangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Timeframe::parse(&value)
    }
}

impl From<Timeframe> for String {
    fn from(value: Timeframe) -> Self {
        value.path()
    }
}

/// One streamed update from the market-data connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketData {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "code")]
    pub market: String,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_volume: Option<f64>,
}

impl MarketData {
    /// Trade tick
    pub fn trade(market: &str, price: f64, volume: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: "trade".to_string(),
            market: market.to_string(),
            timestamp: timestamp.timestamp_millis(),
            trade_price: Some(price),
            trade_volume: Some(volume),
            bid: None,
            ask: None,
            bid_volume: None,
            ask_volume: None,
        }
    }

    /// Last trade price, or the bid/ask mid when only a quote is present
    pub fn price(&self) -> Option<f64> {
        self.trade_price.or(match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            (Some(bid), None) => Some(bid),
            (None, Some(ask)) => Some(ask),
            (None, None) => None,
        })
    }

    pub fn volume(&self) -> f64 {
        self.trade_volume.unwrap_or(0.0)
    }

    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_else(Utc::now)
    }
}
