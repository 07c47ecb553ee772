use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Summary of closed positions for one strategy/market pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetric {
    pub strategy_name: String,
    pub market: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub profit_percentage: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
}

/// Per-day, per-market realized results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyPerformance {
    pub date: NaiveDate,
    pub market: String,
    pub profit_percentage: f64,
    pub profit_amount: f64,
    pub trade_count: u32,
    pub win_count: u32,
}

impl DailyPerformance {
    pub fn new(date: NaiveDate, market: impl Into<String>) -> Self {
        Self {
            date,
            market: market.into(),
            profit_percentage: 0.0,
            profit_amount: 0.0,
            trade_count: 0,
            win_count: 0,
        }
    }

    /// Fold one closed position into the day
    ///
    /// `pnl_pct` is the position's return in percent; the day's percentage
    /// is the sum of per-trade returns.
    pub fn record_close(&mut self, pnl: f64, pnl_pct: f64) {
        self.profit_amount += pnl;
        self.profit_percentage += pnl_pct;
        self.trade_count += 1;
        if pnl > 0.0 {
            self.win_count += 1;
        }
    }
}
