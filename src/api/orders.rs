use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ExchangeError, ExchangeResult};
use crate::models::{OrderType, Side};

/// Validated order submission.
///
/// Which fields are sent depends on (side, type):
/// - limit: price and volume
/// - market buy (`ord_type=price`): price only, the total amount to spend
/// - market sell (`ord_type=market`): volume only
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    market: String,
    side: Side,
    order_type: OrderType,
    volume: Option<f64>,
    price: Option<f64>,
    identifier: String,
}

fn positive(name: &str, value: Option<f64>) -> ExchangeResult<f64> {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => Ok(v),
        Some(v) => Err(ExchangeError::InvalidArgument(format!(
            "{} must be positive, got {}",
            name, v
        ))),
        None => Err(ExchangeError::InvalidArgument(format!("{} is required", name))),
    }
}

impl OrderRequest {
    /// Build a request, keeping only the fields the (side, type) pair uses
    pub fn new(
        market: impl Into<String>,
        side: Side,
        order_type: OrderType,
        volume: Option<f64>,
        price: Option<f64>,
    ) -> ExchangeResult<Self> {
        let market = market.into();
        if market.is_empty() {
            return Err(ExchangeError::InvalidArgument("market is required".into()));
        }

        let (volume, price) = match (side, order_type) {
            (_, OrderType::Limit) => (
                Some(positive("volume", volume)?),
                Some(positive("price", price)?),
            ),
            (Side::Bid, OrderType::Market) => (None, Some(positive("price", price)?)),
            (Side::Ask, OrderType::Market) => (Some(positive("volume", volume)?), None),
        };

        Ok(Self {
            market,
            side,
            order_type,
            volume,
            price,
            identifier: Uuid::new_v4().to_string(),
        })
    }

    /// Market buy spending `spend` in quote currency
    pub fn market_buy(market: impl Into<String>, spend: f64) -> ExchangeResult<Self> {
        Self::new(market, Side::Bid, OrderType::Market, None, Some(spend))
    }

    /// Market sell of `volume` base units
    pub fn market_sell(market: impl Into<String>, volume: f64) -> ExchangeResult<Self> {
        Self::new(market, Side::Ask, OrderType::Market, Some(volume), None)
    }

    pub fn limit(
        market: impl Into<String>,
        side: Side,
        volume: f64,
        price: f64,
    ) -> ExchangeResult<Self> {
        Self::new(market, side, OrderType::Limit, Some(volume), Some(price))
    }

    pub fn market(&self) -> &str {
        &self.market
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn order_type(&self) -> OrderType {
        self.order_type
    }

    pub fn volume(&self) -> Option<f64> {
        self.volume
    }

    pub fn price(&self) -> Option<f64> {
        self.price
    }

    /// Idempotency identifier, fresh per request
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn wire_ord_type(&self) -> &'static str {
        match (self.side, self.order_type) {
            (_, OrderType::Limit) => "limit",
            (Side::Bid, OrderType::Market) => "price",
            (Side::Ask, OrderType::Market) => "market",
        }
    }

    /// Parameters in submission order; the same set is hashed for signing
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("market", self.market.clone()),
            ("side", self.side.as_str().to_string()),
        ];
        if let Some(volume) = self.volume {
            params.push(("volume", format_amount(volume)));
        }
        if let Some(price) = self.price {
            params.push(("price", format_amount(price)));
        }
        params.push(("ord_type", self.wire_ord_type().to_string()));
        params.push(("identifier", self.identifier.clone()));
        params
    }

    /// JSON body with string-encoded amounts
    pub fn body(&self) -> Value {
        let map: Map<String, Value> = self
            .params()
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::String(v)))
            .collect();
        Value::Object(map)
    }
}

/// Plain decimal notation, shortest exact representation
pub fn format_amount(value: f64) -> String {
    format!("{}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(request: &OrderRequest) -> Vec<&'static str> {
        request.params().into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn test_limit_buy_has_price_and_volume() {
        let request = OrderRequest::limit("KRW-BTC", Side::Bid, 0.01, 50_000_000.0).unwrap();
        assert_eq!(request.wire_ord_type(), "limit");
        assert_eq!(
            keys(&request),
            vec!["market", "side", "volume", "price", "ord_type", "identifier"]
        );
    }

    #[test]
    fn test_limit_sell_has_price_and_volume() {
        let request = OrderRequest::limit("KRW-BTC", Side::Ask, 0.01, 51_000_000.0).unwrap();
        let body = request.body();
        assert_eq!(body["side"], "ask");
        assert_eq!(body["volume"], "0.01");
        assert_eq!(body["price"], "51000000");
    }

    #[test]
    fn test_market_buy_is_price_only() {
        let request = OrderRequest::new(
            "KRW-BTC",
            Side::Bid,
            OrderType::Market,
            Some(3.0),
            Some(10_000.0),
        )
        .unwrap();

        assert_eq!(request.wire_ord_type(), "price");
        assert_eq!(request.volume(), None);
        let body = request.body();
        assert_eq!(body["price"], "10000");
        assert!(body.get("volume").is_none());
    }

    #[test]
    fn test_market_sell_is_volume_only() {
        let request = OrderRequest::new(
            "KRW-BTC",
            Side::Ask,
            OrderType::Market,
            Some(0.5),
            Some(123.0),
        )
        .unwrap();

        assert_eq!(request.wire_ord_type(), "market");
        assert_eq!(request.price(), None);
        let body = request.body();
        assert_eq!(body["volume"], "0.5");
        assert!(body.get("price").is_none());
    }

    #[test]
    fn test_missing_fields_rejected() {
        assert!(matches!(
            OrderRequest::new("KRW-BTC", Side::Bid, OrderType::Limit, None, Some(1.0)),
            Err(ExchangeError::InvalidArgument(_))
        ));
        assert!(OrderRequest::market_buy("KRW-BTC", 0.0).is_err());
        assert!(OrderRequest::market_sell("KRW-BTC", f64::NAN).is_err());
        assert!(OrderRequest::market_sell("", 1.0).is_err());
    }

    #[test]
    fn test_identifier_is_fresh_and_signed() {
        let a = OrderRequest::market_buy("KRW-BTC", 5000.0).unwrap();
        let b = OrderRequest::market_buy("KRW-BTC", 5000.0).unwrap();
        assert_ne!(a.identifier(), b.identifier());

        let params = a.params();
        assert!(params
            .iter()
            .any(|(k, v)| *k == "identifier" && v == a.identifier()));
        assert_eq!(a.body()["identifier"], a.identifier());
    }

    #[test]
    fn test_amounts_never_use_exponent() {
        assert_eq!(format_amount(0.00000123), "0.00000123");
        assert_eq!(format_amount(1e21), "1000000000000000000000");
    }
}
