use std::sync::Arc;
use std::time::Duration;

use crate::models::{PerformanceMetric, Position, PositionStatus};
use crate::shutdown::Shutdown;
use crate::store::Store;
use crate::Result;

/// Per-trade return in percent, from entry to exit price
fn trade_return_pct(position: &Position) -> Option<f64> {
    let exit_price = position.exit_price?;
    if position.entry_price <= 0.0 {
        return None;
    }
    Some((exit_price - position.entry_price) / position.entry_price * 100.0)
}

/// Maximum peak-to-trough decline of the compounded return curve, in percent
fn calculate_drawdown(returns: &[f64]) -> f64 {
    let mut value = 100.0;
    let mut peak = value;
    let mut max_dd: f64 = 0.0;

    for r in returns {
        value *= 1.0 + r / 100.0;
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            max_dd = max_dd.max((peak - value) / peak * 100.0);
        }
    }

    max_dd
}

/// Sharpe ratio over per-trade returns, risk-free rate 0
fn calculate_sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns
        .iter()
        .map(|r| {
            let diff = r - mean;
            diff * diff
        })
        .sum::<f64>()
        / returns.len() as f64;

    let std_dev = variance.sqrt();
    if std_dev > 0.0 {
        mean / std_dev
    } else {
        0.0
    }
}

impl PerformanceMetric {
    /// Summarize the closed positions of one market, oldest first.
    /// `None` when nothing has closed yet.
    pub fn from_positions(
        strategy_name: &str,
        market: &str,
        positions: &[Position],
    ) -> Option<Self> {
        let mut closed: Vec<&Position> = positions
            .iter()
            .filter(|p| p.market == market && p.status == PositionStatus::Closed)
            .collect();
        closed.sort_by_key(|p| p.exit_time);

        let returns: Vec<f64> = closed.iter().filter_map(|p| trade_return_pct(p)).collect();
        if returns.is_empty() {
            return None;
        }

        let winning_trades = closed
            .iter()
            .filter(|p| p.realized_pnl.unwrap_or(0.0) > 0.0)
            .count();
        let compounded = returns
            .iter()
            .fold(1.0, |acc, r| acc * (1.0 + r / 100.0));

        Some(Self {
            strategy_name: strategy_name.to_string(),
            market: market.to_string(),
            start_time: closed.first().map(|p| p.entry_time)?,
            end_time: closed.last().and_then(|p| p.exit_time)?,
            total_trades: returns.len(),
            winning_trades,
            profit_percentage: (compounded - 1.0) * 100.0,
            max_drawdown: calculate_drawdown(&returns),
            sharpe_ratio: calculate_sharpe_ratio(&returns),
        })
    }
}

/// Recomputes per-market performance summaries on an interval
pub struct PerformanceReporter {
    store: Arc<dyn Store>,
    interval: Duration,
}

impl PerformanceReporter {
    pub fn new(store: Arc<dyn Store>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub async fn report_once(&self) -> Result<Vec<PerformanceMetric>> {
        let closed = self.store.positions(Some(PositionStatus::Closed)).await?;
        let mut metrics = Vec::new();

        for config in self.store.strategy_configs().await? {
            let Some(metric) =
                PerformanceMetric::from_positions(config.strategy_name(), &config.market, &closed)
            else {
                continue;
            };
            self.store.save_performance_metric(&metric).await?;

            tracing::info!(
                "📈 {} / {}: {} trades, {} wins, {:.2}% return, {:.2}% max drawdown",
                metric.strategy_name,
                metric.market,
                metric.total_trades,
                metric.winning_trades,
                metric.profit_percentage,
                metric.max_drawdown
            );
            metrics.push(metric);
        }

        Ok(metrics)
    }

    pub async fn run(self, mut shutdown: Shutdown) {
        loop {
            if shutdown.sleep_or_shutdown(self.interval).await {
                break;
            }
            if let Err(e) = self.report_once().await {
                tracing::warn!("Performance report failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExitReason;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use uuid::Uuid;

    fn closed(market: &str, day: u32, entry: f64, exit: f64) -> Position {
        let entry_time = Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap();
        Position {
            id: Uuid::new_v4(),
            market: market.to_string(),
            entry_price: entry,
            entry_time,
            quantity: 0.0,
            status: PositionStatus::Closed,
            profit_target: entry * 1.05,
            stop_loss: entry * 0.97,
            last_price: exit,
            current_profit: 0.0,
            exit_price: Some(exit),
            exit_time: Some(entry_time + ChronoDuration::hours(1)),
            exit_reason: Some(ExitReason::Signal),
            realized_pnl: Some(exit - entry),
        }
    }

    #[test]
    fn test_no_closed_positions() {
        assert!(PerformanceMetric::from_positions("rsi", "KRW-BTC", &[]).is_none());
    }

    #[test]
    fn test_summary_of_trades() {
        let positions = vec![
            closed("KRW-BTC", 1, 100.0, 110.0),
            closed("KRW-BTC", 2, 100.0, 90.0),
            closed("KRW-BTC", 3, 100.0, 105.0),
            closed("KRW-ETH", 1, 100.0, 50.0),
        ];

        let metric = PerformanceMetric::from_positions("rsi", "KRW-BTC", &positions).unwrap();
        assert_eq!(metric.total_trades, 3);
        assert_eq!(metric.winning_trades, 2);
        // 1.10 * 0.90 * 1.05 = 1.0395
        assert!((metric.profit_percentage - 3.95).abs() < 1e-9);
        // Peak 110 after trade one, trough 99 after trade two
        assert!((metric.max_drawdown - 10.0).abs() < 1e-9);
        assert!(metric.sharpe_ratio > 0.0);
        assert_eq!(metric.start_time, positions[0].entry_time);
    }

    #[test]
    fn test_drawdown_without_losses_is_zero() {
        assert_eq!(calculate_drawdown(&[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(calculate_sharpe_ratio(&[2.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_report_saves_metrics() {
        use crate::execution::position_manager::FillEffect;
        use crate::models::{Direction, StrategyConfig, Timeframe};
        use crate::store::MemoryStore;
        use crate::strategy::StrategyParams;

        let store = Arc::new(MemoryStore::new());
        store
            .upsert_strategy_config(&StrategyConfig::new(
                "KRW-BTC",
                StrategyParams::Threshold {
                    buy_threshold: 100.0,
                    sell_threshold: 90.0,
                },
                Timeframe::Minutes(1),
            ))
            .await
            .unwrap();

        for (direction, price) in [(Direction::Buy, 100.0), (Direction::Sell, 120.0)] {
            store
                .apply_fill(&FillEffect {
                    market: "KRW-BTC".to_string(),
                    direction,
                    price,
                    volume: 1.0,
                    fee: 0.0,
                    exit_reason: None,
                    profit_target_pct: 0.05,
                    stop_loss_pct: 0.03,
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }

        let reporter = PerformanceReporter::new(store.clone(), std::time::Duration::from_secs(60));
        let metrics = reporter.report_once().await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert!((metrics[0].profit_percentage - 20.0).abs() < 1e-9);
        assert_eq!(store.performance_metrics().await.unwrap(), metrics);
    }
}
