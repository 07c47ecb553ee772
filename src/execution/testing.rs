//! Scripted exchange for engine and tracker tests

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::api::{Account, ExchangeApi, OrderRequest, OrderResponse, OrderTrade};
use crate::error::{ExchangeError, ExchangeResult};
use crate::models::{Candle, ExchangeOrderStatus, Market, Side, Ticker};

pub fn order_response(uuid: &str, side: Side, state: ExchangeOrderStatus) -> OrderResponse {
    OrderResponse {
        uuid: uuid.to_string(),
        side,
        ord_type: "price".to_string(),
        price: None,
        state,
        market: "KRW-BTC".to_string(),
        created_at: None,
        volume: None,
        remaining_volume: None,
        executed_volume: 0.0,
        paid_fee: 0.0,
        trades: Vec::new(),
    }
}

pub fn trade(uuid: &str, price: f64, volume: f64) -> OrderTrade {
    OrderTrade {
        uuid: uuid.to_string(),
        price,
        volume,
        funds: price * volume,
        fee: 0.0,
        side: None,
        created_at: None,
    }
}

/// Fills every created order at `fill_price` unless a script says otherwise
pub struct FakeExchange {
    scripts: Mutex<HashMap<String, VecDeque<OrderResponse>>>,
    /// Exchange id per idempotency identifier of accepted orders
    identifiers: Mutex<HashMap<String, String>>,
    created: Mutex<Vec<OrderRequest>>,
    canceled: Mutex<Vec<String>>,
    accounts: Mutex<Vec<Account>>,
    candles: Mutex<Vec<Candle>>,
    fill_price: Mutex<f64>,
    failing_creates: AtomicUsize,
    timed_out_creates: AtomicUsize,
    lost_creates: AtomicUsize,
    failing_polls: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeExchange {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            identifiers: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            canceled: Mutex::new(Vec::new()),
            accounts: Mutex::new(Vec::new()),
            candles: Mutex::new(Vec::new()),
            fill_price: Mutex::new(100.0),
            failing_creates: AtomicUsize::new(0),
            timed_out_creates: AtomicUsize::new(0),
            lost_creates: AtomicUsize::new(0),
            failing_polls: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Responses returned by successive `get_order` calls; the last one repeats
    pub fn script(&self, order_id: &str, responses: Vec<OrderResponse>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(order_id.to_string(), responses.into());
    }

    pub fn set_fill_price(&self, price: f64) {
        *self.fill_price.lock().unwrap() = price;
    }

    pub fn set_accounts(&self, accounts: Vec<Account>) {
        *self.accounts.lock().unwrap() = accounts;
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        *self.candles.lock().unwrap() = candles;
    }

    pub fn fail_creates(&self, count: usize) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    /// Accept the next `count` orders but answer with a connection error
    pub fn time_out_creates(&self, count: usize) {
        self.timed_out_creates.store(count, Ordering::SeqCst);
    }

    /// Drop the next `count` orders before they reach the book
    pub fn lose_creates(&self, count: usize) {
        self.lost_creates.store(count, Ordering::SeqCst);
    }

    /// Applies to lookups by identifier as well
    pub fn fail_polls(&self, count: usize) {
        self.failing_polls.store(count, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<OrderRequest> {
        self.created.lock().unwrap().clone()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.canceled.lock().unwrap().clone()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn filled(&self, uuid: &str, request: &OrderRequest) -> OrderResponse {
        let price = *self.fill_price.lock().unwrap();
        let volume = match request.side() {
            Side::Bid => request.volume().unwrap_or_else(|| request.price().unwrap_or(0.0) / price),
            Side::Ask => request.volume().unwrap_or(0.0),
        };
        let mut response = order_response(uuid, request.side(), ExchangeOrderStatus::Done);
        response.market = request.market().to_string();
        response.executed_volume = volume;
        response.trades = vec![trade(&format!("{}-t", uuid), price, volume)];
        response
    }
}

#[async_trait]
impl ExchangeApi for FakeExchange {
    async fn list_markets(&self) -> ExchangeResult<Vec<Market>> {
        Ok(vec![Market {
            market_id: "KRW-BTC".to_string(),
            korean_name: "비트코인".to_string(),
            english_name: "Bitcoin".to_string(),
            market_type: "KRW".to_string(),
        }])
    }

    async fn get_tickers(&self, markets: &[String]) -> ExchangeResult<Vec<Ticker>> {
        let price = *self.fill_price.lock().unwrap();
        Ok(markets
            .iter()
            .map(|m| Ticker {
                market_id: m.clone(),
                trade_price: price,
                opening_price: price,
                high_price: price,
                low_price: price,
                prev_closing_price: price,
                signed_change_rate: 0.0,
                acc_trade_volume_24h: 0.0,
                timestamp: 0,
            })
            .collect())
    }

    async fn get_candles(
        &self,
        market: &str,
        _timeframe: &str,
        count: u32,
    ) -> ExchangeResult<Vec<Candle>> {
        let candles = self.candles.lock().unwrap();
        let matching: Vec<Candle> = candles.iter().filter(|c| c.market == market).cloned().collect();
        let skip = matching.len().saturating_sub(count as usize);
        Ok(matching.into_iter().skip(skip).collect())
    }

    async fn get_accounts(&self) -> ExchangeResult<Vec<Account>> {
        Ok(self.accounts.lock().unwrap().clone())
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderResponse> {
        if Self::take_failure(&self.failing_creates) {
            return Err(ExchangeError::Rejected {
                status: 400,
                body: "insufficient_funds".to_string(),
            });
        }
        if Self::take_failure(&self.lost_creates) {
            return Err(ExchangeError::TransientConnection("connection reset".to_string()));
        }

        let uuid = format!("ex-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.created.lock().unwrap().push(request.clone());
        self.identifiers
            .lock()
            .unwrap()
            .insert(request.identifier().to_string(), uuid.clone());

        let filled = self.filled(&uuid, request);
        self.scripts
            .lock()
            .unwrap()
            .entry(uuid.clone())
            .or_insert_with(|| VecDeque::from(vec![filled]));

        if Self::take_failure(&self.timed_out_creates) {
            return Err(ExchangeError::TransientConnection("request timed out".to_string()));
        }

        let mut response = order_response(&uuid, request.side(), ExchangeOrderStatus::Wait);
        response.market = request.market().to_string();
        Ok(response)
    }

    async fn get_order(&self, order_id: &str) -> ExchangeResult<OrderResponse> {
        if Self::take_failure(&self.failing_polls) {
            return Err(ExchangeError::TransientConnection("poll failed".to_string()));
        }

        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::NotFound(order_id.to_string()))?;
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        response.ok_or_else(|| ExchangeError::NotFound(order_id.to_string()))
    }

    async fn find_order(&self, identifier: &str) -> ExchangeResult<Option<OrderResponse>> {
        if Self::take_failure(&self.failing_polls) {
            return Err(ExchangeError::TransientConnection("lookup failed".to_string()));
        }
        let uuid = self.identifiers.lock().unwrap().get(identifier).cloned();
        match uuid {
            Some(uuid) => self.get_order(&uuid).await.map(Some),
            None => Ok(None),
        }
    }

    async fn get_order_trades(&self, order_id: &str) -> ExchangeResult<Vec<OrderTrade>> {
        Ok(self.get_order(order_id).await?.trades)
    }

    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<OrderResponse> {
        self.canceled.lock().unwrap().push(order_id.to_string());
        let mut response = order_response(order_id, Side::Bid, ExchangeOrderStatus::Cancel);
        self.scripts
            .lock()
            .unwrap()
            .insert(order_id.to_string(), VecDeque::from(vec![response.clone()]));
        response.state = ExchangeOrderStatus::Wait;
        Ok(response)
    }
}
