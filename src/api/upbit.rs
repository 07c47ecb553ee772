use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

use super::auth::{canonical_query, Signer};
use super::{Account, CandleResponse, ExchangeApi, OrderRequest, OrderResponse, OrderTrade};
use crate::error::{ExchangeError, ExchangeResult};
use crate::models::{Candle, Market, Ticker, Timeframe};

pub const UPBIT_API_BASE: &str = "https://api.upbit.com/v1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// REST client for the Upbit exchange
///
/// Public endpoints go out unsigned; private endpoints carry a bearer JWT
/// whose `query_hash` covers exactly the parameters sent.
#[derive(Clone, Debug)]
pub struct UpbitClient {
    client: Client,
    base_url: String,
    signer: Signer,
    quote_currency: String,
    excluded_symbols: Vec<String>,
}

impl UpbitClient {
    pub fn new(base_url: impl Into<String>, signer: Signer) -> ExchangeResult<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signer,
            quote_currency: "KRW".to_string(),
            excluded_symbols: vec!["USDT".to_string(), "USDC".to_string()],
        })
    }

    /// Restrict `list_markets` to one quote currency, minus excluded symbols
    pub fn with_market_filter(
        mut self,
        quote_currency: impl Into<String>,
        excluded_symbols: Vec<String>,
    ) -> Self {
        self.quote_currency = quote_currency.into();
        self.excluded_symbols = excluded_symbols;
        self
    }

    fn url(&self, path: &str, params: &[(&str, String)]) -> String {
        if params.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, canonical_query(params))
        }
    }

    /// Send a request. GET/DELETE put `params` in the query string, POST in the JSON body.
    async fn send(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        body: Option<&Value>,
        signed: bool,
    ) -> ExchangeResult<Response> {
        let url = match body {
            Some(_) => self.url(path, &[]),
            None => self.url(path, params),
        };

        let mut request = self.client.request(method, &url);
        if signed {
            request = request.header("Authorization", self.signer.authorization(params)?);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        Ok(request.send().await?)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> ExchangeResult<T> {
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Decode a 2xx body, otherwise `Protocol{status, body}`
    async fn expect_success<T: DeserializeOwned>(response: Response) -> ExchangeResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Protocol {
                status: status.as_u16(),
                body,
            });
        }
        Self::decode(response).await
    }
}

#[async_trait]
impl ExchangeApi for UpbitClient {
    async fn list_markets(&self) -> ExchangeResult<Vec<Market>> {
        let response = self.send(Method::GET, "/market/all", &[], None, false).await?;
        let markets: Vec<Market> = Self::expect_success(response).await?;

        let filtered: Vec<Market> = markets
            .into_iter()
            .map(|mut market| {
                market.market_type = Market::quote_of(&market.market_id).to_string();
                market
            })
            .filter(|market| market.market_type == self.quote_currency)
            .filter(|market| {
                !self
                    .excluded_symbols
                    .iter()
                    .any(|symbol| market.market_id.contains(symbol.as_str()))
            })
            .collect();

        tracing::debug!(
            "Fetched {} {} markets",
            filtered.len(),
            self.quote_currency
        );
        Ok(filtered)
    }

    async fn get_tickers(&self, markets: &[String]) -> ExchangeResult<Vec<Ticker>> {
        if markets.is_empty() {
            return Err(ExchangeError::InvalidArgument(
                "at least one market is required".into(),
            ));
        }
        let params = [("markets", markets.join(","))];
        let response = self.send(Method::GET, "/ticker", &params, None, false).await?;
        Self::expect_success(response).await
    }

    async fn get_candles(
        &self,
        market: &str,
        timeframe: &str,
        count: u32,
    ) -> ExchangeResult<Vec<Candle>> {
        let timeframe = Timeframe::parse(timeframe)?;
        if count == 0 || count > 200 {
            return Err(ExchangeError::InvalidArgument(format!(
                "candle count must be within 1..=200, got {}",
                count
            )));
        }

        let path = format!("/candles/{}", timeframe.path());
        let params = [("market", market.to_string()), ("count", count.to_string())];
        let response = self.send(Method::GET, &path, &params, None, false).await?;
        let raw: Vec<CandleResponse> = Self::expect_success(response).await?;

        // Exchange returns newest first
        let mut candles = raw
            .into_iter()
            .map(|c| c.into_candle(timeframe))
            .collect::<ExchangeResult<Vec<_>>>()?;
        candles.reverse();
        Ok(candles)
    }

    async fn get_accounts(&self) -> ExchangeResult<Vec<Account>> {
        let response = self.send(Method::GET, "/accounts", &[], None, true).await?;
        Self::expect_success(response).await
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderResponse> {
        let params = request.params();
        let body = request.body();
        let response = self
            .send(Method::POST, "/orders", &params, Some(&body), true)
            .await?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                market = %request.market(),
                "Order rejected with {}: {}",
                status.as_u16(),
                body
            );
            return Err(ExchangeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Self::decode(response).await
    }

    async fn get_order(&self, order_id: &str) -> ExchangeResult<OrderResponse> {
        let params = [("uuid", order_id.to_string())];
        let response = self.send(Method::GET, "/order", &params, None, true).await?;
        Self::expect_success(response).await
    }

    async fn find_order(&self, identifier: &str) -> ExchangeResult<Option<OrderResponse>> {
        let params = [("identifier", identifier.to_string())];
        let response = self.send(Method::GET, "/order", &params, None, true).await?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!("No order with identifier {}", identifier);
            return Ok(None);
        }
        Self::expect_success(response).await.map(Some)
    }

    async fn get_order_trades(&self, order_id: &str) -> ExchangeResult<Vec<OrderTrade>> {
        Ok(self.get_order(order_id).await?.trades)
    }

    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<OrderResponse> {
        let params = [("uuid", order_id.to_string())];
        let response = self
            .send(Method::DELETE, "/order", &params, None, true)
            .await?;
        Self::expect_success(response).await
    }
}
