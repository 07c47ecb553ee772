pub mod auth;
pub mod feed;
pub mod orders;
pub mod upbit;

pub use auth::{NonceSource, Signer, UuidNonce};
pub use feed::{Backoff, FeedConfig, MarketFeed, Subscription};
pub use orders::OrderRequest;
pub use upbit::UpbitClient;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ExchangeError, ExchangeResult};
use crate::models::{Candle, Market, Ticker, Timeframe, Trade};
use crate::models::{ExchangeOrderStatus, Side};

/// Operations the agent needs from the exchange.
///
/// Implemented by [`UpbitClient`]; tests substitute scripted fakes.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Tradable markets in the configured quote currency
    async fn list_markets(&self) -> ExchangeResult<Vec<Market>>;

    async fn get_tickers(&self, markets: &[String]) -> ExchangeResult<Vec<Ticker>>;

    async fn get_ticker(&self, market: &str) -> ExchangeResult<Ticker> {
        self.get_tickers(&[market.to_string()])
            .await?
            .into_iter()
            .find(|t| t.market_id == market)
            .ok_or_else(|| ExchangeError::NotFound(format!("ticker for {}", market)))
    }

    /// Candles oldest-first. `timeframe` is `minutes/<n>`, `days`, `weeks` or `months`.
    async fn get_candles(
        &self,
        market: &str,
        timeframe: &str,
        count: u32,
    ) -> ExchangeResult<Vec<Candle>>;

    async fn get_accounts(&self) -> ExchangeResult<Vec<Account>>;

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderResponse>;

    async fn get_order(&self, order_id: &str) -> ExchangeResult<OrderResponse>;

    /// Order placed with the given idempotency identifier, `None` when the
    /// exchange never received it
    async fn find_order(&self, identifier: &str) -> ExchangeResult<Option<OrderResponse>>;

    async fn get_order_trades(&self, order_id: &str) -> ExchangeResult<Vec<OrderTrade>>;

    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<OrderResponse>;
}

// ============== Wire Types ==============

/// Exchange account balance, amounts parsed from decimal strings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub currency: String,
    #[serde(deserialize_with = "amount::required")]
    pub balance: f64,
    #[serde(default, deserialize_with = "amount::required")]
    pub locked: f64,
    #[serde(default, deserialize_with = "amount::required")]
    pub avg_buy_price: f64,
    #[serde(default)]
    pub unit_currency: String,
}

/// Order as returned by create/get/cancel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderResponse {
    pub uuid: String,
    pub side: Side,
    pub ord_type: String,
    #[serde(default, deserialize_with = "amount::optional")]
    pub price: Option<f64>,
    pub state: ExchangeOrderStatus,
    pub market: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "amount::optional")]
    pub volume: Option<f64>,
    #[serde(default, deserialize_with = "amount::optional")]
    pub remaining_volume: Option<f64>,
    #[serde(default, deserialize_with = "amount::required")]
    pub executed_volume: f64,
    #[serde(default, deserialize_with = "amount::required")]
    pub paid_fee: f64,
    #[serde(default)]
    pub trades: Vec<OrderTrade>,
}

/// Fill entry inside an order detail
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderTrade {
    pub uuid: String,
    #[serde(deserialize_with = "amount::required")]
    pub price: f64,
    #[serde(deserialize_with = "amount::required")]
    pub volume: f64,
    #[serde(default, deserialize_with = "amount::required")]
    pub funds: f64,
    #[serde(default, deserialize_with = "amount::required")]
    pub fee: f64,
    #[serde(default)]
    pub side: Option<Side>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl OrderTrade {
    /// Internal trade record for this fill
    pub fn to_trade(&self, order: &OrderResponse) -> Trade {
        Trade {
            trade_id: self.uuid.clone(),
            market: order.market.clone(),
            order_id: order.uuid.clone(),
            price: self.price,
            volume: self.volume,
            side: self.side.unwrap_or(order.side),
            fee: self.fee,
            timestamp: self
                .created_at
                .as_deref()
                .and_then(parse_exchange_time)
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Candle as served by `/candles/*`
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CandleResponse {
    pub market: String,
    pub candle_date_time_utc: String,
    pub opening_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub trade_price: f64,
    pub candle_acc_trade_volume: f64,
}

impl CandleResponse {
    pub(crate) fn into_candle(self, timeframe: Timeframe) -> ExchangeResult<Candle> {
        let timestamp = NaiveDateTime::parse_from_str(&self.candle_date_time_utc, "%Y-%m-%dT%H:%M:%S")
            .map_err(|e| {
                ExchangeError::InvalidArgument(format!(
                    "bad candle time '{}': {}",
                    self.candle_date_time_utc, e
                ))
            })?
            .and_utc();

        Ok(Candle {
            market: self.market,
            timeframe,
            timestamp,
            open: self.opening_price,
            high: self.high_price,
            low: self.low_price,
            close: self.trade_price,
            volume: self.candle_acc_trade_volume,
        })
    }
}

/// Exchange timestamps come as RFC 3339 with offset (`2024-01-01T09:00:00+09:00`)
pub fn parse_exchange_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Upbit encodes most amounts as decimal strings; accept both strings and numbers.
pub(crate) mod amount {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    fn parse<E: serde::de::Error>(raw: Raw) -> Result<f64, E> {
        match raw {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) if s.trim().is_empty() => Ok(0.0),
            Raw::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| E::custom(format!("invalid amount '{}'", s))),
        }
    }

    pub fn required<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Option::<Raw>::deserialize(deserializer)? {
            Some(raw) => parse(raw),
            None => Ok(0.0),
        }
    }

    pub fn optional<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        Option::<Raw>::deserialize(deserializer)?
            .map(parse)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_amounts_parse_from_strings() {
        let json = r#"{"currency":"KRW","balance":"1000000.0","locked":"0.0",
            "avg_buy_price":"0","avg_buy_price_modified":false,"unit_currency":"KRW"}"#;
        let account: Account = serde_json::from_str(json).unwrap();
        assert_eq!(account.balance, 1_000_000.0);
        assert_eq!(account.locked, 0.0);
    }

    #[test]
    fn test_order_response_with_trades() {
        let json = r#"{
            "uuid": "9ca023a5",
            "side": "bid",
            "ord_type": "price",
            "price": "10000",
            "state": "done",
            "market": "KRW-BTC",
            "created_at": "2024-01-01T09:00:00+09:00",
            "volume": null,
            "remaining_volume": null,
            "executed_volume": "0.0002",
            "paid_fee": "5",
            "trades": [
                {"uuid": "t-1", "price": "50000000", "volume": "0.0002",
                 "funds": "10000", "side": "bid", "created_at": "2024-01-01T09:00:01+09:00"}
            ]
        }"#;
        let order: OrderResponse = serde_json::from_str(json).unwrap();

        assert_eq!(order.state, ExchangeOrderStatus::Done);
        assert_eq!(order.price, Some(10000.0));
        assert_eq!(order.volume, None);
        assert_eq!(order.executed_volume, 0.0002);

        let trade = order.trades[0].to_trade(&order);
        assert_eq!(trade.order_id, "9ca023a5");
        assert_eq!(trade.price, 50_000_000.0);
        assert_eq!(trade.timestamp.to_rfc3339(), "2024-01-01T00:00:01+00:00");
    }

    #[test]
    fn test_bad_amount_is_decode_error() {
        let json = r#"{"currency":"KRW","balance":"abc"}"#;
        assert!(serde_json::from_str::<Account>(json).is_err());
    }

    #[test]
    fn test_candle_conversion() {
        let raw = CandleResponse {
            market: "KRW-BTC".to_string(),
            candle_date_time_utc: "2024-01-01T00:05:00".to_string(),
            opening_price: 1.0,
            high_price: 2.0,
            low_price: 0.5,
            trade_price: 1.5,
            candle_acc_trade_volume: 10.0,
        };
        let candle = raw.into_candle(Timeframe::Minutes(5)).unwrap();
        assert_eq!(candle.close, 1.5);
        assert_eq!(candle.timestamp.to_rfc3339(), "2024-01-01T00:05:00+00:00");
    }
}
