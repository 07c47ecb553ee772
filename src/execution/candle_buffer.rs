use crate::models::{Candle, Timeframe};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

/// Thread-safe in-memory buffer for candle data
///
/// Maintains a rolling window of candles for each market. Ticks extend the
/// newest candle or open the next one; refreshes from the exchange replace
/// the whole window.
#[derive(Clone)]
pub struct CandleBuffer {
    data: Arc<RwLock<HashMap<String, VecDeque<Candle>>>>,
    max_candles: usize,
}

/// Start of the interval that contains `at`
pub fn bucket_start(timeframe: Timeframe, at: DateTime<Utc>) -> DateTime<Utc> {
    let width = timeframe.seconds().max(1);
    let secs = at.timestamp().div_euclid(width) * width;
    Utc.timestamp_opt(secs, 0).single().unwrap_or(at)
}

impl CandleBuffer {
    /// Create a new candle buffer
    ///
    /// # Arguments
    /// * `max_candles` - Maximum number of candles to keep per market
    pub fn new(max_candles: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_candles,
        }
    }

    /// Add a candle for a market
    ///
    /// If the buffer is full, removes the oldest candle
    pub fn add_candle(&self, candle: Candle) -> Result<(), String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;

        let candles = data.entry(candle.market.clone()).or_default();
        candles.push_back(candle);
        while candles.len() > self.max_candles {
            candles.pop_front();
        }

        Ok(())
    }

    /// Replace a market's history (oldest first), keeping the newest `max_candles`
    pub fn replace(&self, market: &str, candles: Vec<Candle>) -> Result<(), String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;

        let skip = candles.len().saturating_sub(self.max_candles);
        data.insert(market.to_string(), candles.into_iter().skip(skip).collect());
        Ok(())
    }

    /// Fold a tick into the current candle, opening a new one when the
    /// tick falls into a later interval. Ticks older than the newest candle
    /// are ignored.
    pub fn apply_tick(
        &self,
        market: &str,
        timeframe: Timeframe,
        price: f64,
        volume: f64,
        at: DateTime<Utc>,
    ) -> Result<(), String> {
        let start = bucket_start(timeframe, at);
        let mut data = self.data.write().map_err(|e| e.to_string())?;
        let candles = data.entry(market.to_string()).or_default();

        match candles.back_mut() {
            Some(last) if last.timestamp == start => {
                last.high = last.high.max(price);
                last.low = last.low.min(price);
                last.close = price;
                last.volume += volume;
            }
            Some(last) if last.timestamp > start => {}
            _ => {
                candles.push_back(Candle {
                    market: market.to_string(),
                    timeframe,
                    timestamp: start,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume,
                });
                while candles.len() > self.max_candles {
                    candles.pop_front();
                }
            }
        }

        Ok(())
    }

    /// Get all candles for a market
    pub fn get_candles(&self, market: &str) -> Result<Vec<Candle>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;

        Ok(data
            .get(market)
            .map(|deque| deque.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Get the N most recent candles for a market
    pub fn get_recent_candles(&self, market: &str, n: usize) -> Result<Vec<Candle>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;

        Ok(data
            .get(market)
            .map(|deque| deque.iter().rev().take(n).rev().cloned().collect())
            .unwrap_or_default())
    }

    pub fn last_close(&self, market: &str) -> Result<Option<f64>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.get(market).and_then(|d| d.back()).map(|c| c.close))
    }

    pub fn candle_count(&self, market: &str) -> Result<usize, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.get(market).map(|d| d.len()).unwrap_or(0))
    }
}
