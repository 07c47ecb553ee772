use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::events::OrderEvent;
use super::position_manager::FillEffect;
use crate::api::{ExchangeApi, OrderResponse, OrderTrade};
use crate::models::{
    Direction, ExchangeOrderStatus, ExitReason, Order, OrderState, OrderType, Side,
    StrategyConfig,
};
use crate::shutdown::Shutdown;
use crate::store::Store;
use crate::Result;

/// Exit levels and reason applied when a tracked order settles
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitPlan {
    pub profit_target_pct: f64,
    pub stop_loss_pct: f64,
    pub exit_reason: Option<ExitReason>,
}

impl Default for ExitPlan {
    fn default() -> Self {
        Self {
            profit_target_pct: 0.05,
            stop_loss_pct: 0.03,
            exit_reason: None,
        }
    }
}

impl ExitPlan {
    pub fn for_config(config: Option<&StrategyConfig>, exit_reason: Option<ExitReason>) -> Self {
        let defaults = Self::default();
        Self {
            profit_target_pct: config.map_or(defaults.profit_target_pct, |c| c.profit_target),
            stop_loss_pct: config.map_or(defaults.stop_loss_pct, |c| c.stop_loss),
            exit_reason,
        }
    }
}

/// Volume-weighted price and total volume of a set of fills
pub fn weighted_fill(trades: &[OrderTrade]) -> Option<(f64, f64)> {
    let volume: f64 = trades.iter().map(|t| t.volume).sum();
    if volume <= 0.0 {
        return None;
    }
    let notional: f64 = trades.iter().map(|t| t.price * t.volume).sum();
    Some((notional / volume, volume))
}

/// Fill figures taken from the order itself when the exchange sent no
/// trades. A market buy quotes its total spend, so the unit price is
/// spend over executed volume; a market sell quotes no price at all.
pub fn order_fill(order: &Order, response: &OrderResponse) -> Option<(f64, f64)> {
    let volume = response.executed_volume.max(order.executed_volume);
    if volume <= 0.0 {
        return None;
    }
    let quoted = response.price.or(order.price)?;
    match (order.order_type, order.side) {
        (OrderType::Limit, _) => Some((quoted, volume)),
        (OrderType::Market, Side::Bid) => Some((quoted / volume, volume)),
        (OrderType::Market, Side::Ask) => None,
    }
}

/// Internal state the exchange report calls for
///
/// A market buy finishes as `cancel` with its spend used up, so a canceled
/// order that executed anything is settled as filled.
pub fn target_state(response: &OrderResponse) -> OrderState {
    let executed = response.executed_volume > 0.0;
    match response.state {
        ExchangeOrderStatus::Done => OrderState::Filled,
        ExchangeOrderStatus::Cancel if executed => OrderState::Filled,
        ExchangeOrderStatus::Cancel => OrderState::Canceled,
        ExchangeOrderStatus::Wait | ExchangeOrderStatus::Watch if executed => {
            OrderState::PartiallyFilled
        }
        ExchangeOrderStatus::Wait | ExchangeOrderStatus::Watch => OrderState::Submitted,
    }
}

fn direction_of(side: Side) -> Direction {
    match side {
        Side::Bid => Direction::Buy,
        Side::Ask => Direction::Sell,
    }
}

/// Polls one submitted order until it settles
#[derive(Clone)]
pub struct OrderTracker {
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<dyn Store>,
    events: mpsc::Sender<OrderEvent>,
    poll_interval: Duration,
    max_failures: u32,
}

impl OrderTracker {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        store: Arc<dyn Store>,
        events: mpsc::Sender<OrderEvent>,
        poll_interval: Duration,
        max_failures: u32,
    ) -> Self {
        Self {
            exchange,
            store,
            events,
            poll_interval,
            max_failures: max_failures.max(1),
        }
    }

    async fn emit(&self, event: OrderEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Order event queue closed, dropping event");
        }
    }

    /// Track `order` until it reaches a terminal state.
    ///
    /// On shutdown the order gets one last poll and is left for startup
    /// reconciliation if it is still open.
    pub async fn track(&self, mut order: Order, plan: ExitPlan, mut shutdown: Shutdown) -> Result<Order> {
        let mut failures = 0u32;

        loop {
            let stopping = shutdown.sleep_or_shutdown(self.poll_interval).await;

            match self.exchange.get_order(&order.order_id).await {
                Ok(response) => {
                    failures = 0;
                    if self.observe(&mut order, &response, plan).await? {
                        return Ok(order);
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        order_id = %order.order_id,
                        "Order poll failed ({}/{}): {}",
                        failures,
                        self.max_failures,
                        e
                    );
                    if failures >= self.max_failures {
                        // The exchange may still fill it: the reservation stays
                        // so the market is not traded twice.
                        order.fail(format!("tracking abandoned: {}", e))?;
                        self.store.save_order(&order).await?;
                        tracing::error!(
                            order_id = %order.order_id,
                            market = %order.market,
                            "Gave up tracking order after {} failed polls",
                            failures
                        );
                        self.emit(OrderEvent::Canceled {
                            order_id: order.order_id.clone(),
                            market: order.market.clone(),
                            reason: order.failure_reason.clone(),
                            at: Utc::now(),
                        })
                        .await;
                        return Ok(order);
                    }
                }
            }

            if stopping {
                tracing::info!(
                    order_id = %order.order_id,
                    "Shutdown with order still {}, leaving it for reconciliation",
                    order.state
                );
                return Ok(order);
            }
        }
    }

    /// Settle a submission whose outcome is unknown. The order is stored
    /// `Pending` under its idempotency identifier with the market still
    /// reserved. Once the exchange shows it, it is re-keyed to the exchange
    /// id and tracked; if the exchange never received it, it is failed and
    /// the reservation released. Repeated lookup failures leave it for
    /// startup reconciliation.
    pub async fn resolve(
        &self,
        mut order: Order,
        plan: ExitPlan,
        mut shutdown: Shutdown,
    ) -> Result<Order> {
        let identifier = order.order_id.clone();
        let mut failures = 0u32;

        loop {
            let stopping = shutdown.sleep_or_shutdown(self.poll_interval).await;

            match self.exchange.find_order(&identifier).await {
                Ok(Some(response)) => {
                    order.order_id = response.uuid.clone();
                    order.exchange_status = Some(response.state);
                    order.advance(OrderState::Submitted)?;
                    self.store.replace_order(&identifier, &order).await?;
                    tracing::info!(
                        "🔎 Order {} on {} found on the exchange as {}",
                        identifier,
                        order.market,
                        order.order_id
                    );
                    self.emit(OrderEvent::Submitted {
                        order_id: order.order_id.clone(),
                        market: order.market.clone(),
                        side: order.side,
                        at: Utc::now(),
                    })
                    .await;

                    if self.observe(&mut order, &response, plan).await? || stopping {
                        return Ok(order);
                    }
                    return self.track(order, plan, shutdown).await;
                }
                Ok(None) => {
                    order.fail("never reached the exchange")?;
                    self.store.save_order(&order).await?;
                    self.store.release_reservation(&order.market).await?;
                    tracing::warn!(
                        "Order {} on {} never reached the exchange, reservation released",
                        identifier,
                        order.market
                    );
                    self.emit(OrderEvent::Canceled {
                        order_id: order.order_id.clone(),
                        market: order.market.clone(),
                        reason: order.failure_reason.clone(),
                        at: Utc::now(),
                    })
                    .await;
                    return Ok(order);
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        order_id = %identifier,
                        "Order lookup failed ({}/{}): {}",
                        failures,
                        self.max_failures,
                        e
                    );
                    if failures >= self.max_failures {
                        tracing::error!(
                            order_id = %identifier,
                            market = %order.market,
                            "Order outcome still unknown, left for reconciliation"
                        );
                        return Ok(order);
                    }
                }
            }

            if stopping {
                tracing::info!(
                    order_id = %identifier,
                    "Shutdown with order outcome unknown, leaving it for reconciliation"
                );
                return Ok(order);
            }
        }
    }

    /// Fold one exchange report into the order. Returns true once terminal.
    async fn observe(
        &self,
        order: &mut Order,
        response: &OrderResponse,
        plan: ExitPlan,
    ) -> Result<bool> {
        for trade in &response.trades {
            self.store.save_trade(&trade.to_trade(response)).await?;
        }

        order.exchange_status = Some(response.state);
        order.record_execution(response.executed_volume);

        let target = target_state(response);
        let changed = order.advance(target)?;
        self.store.save_order(order).await?;

        match target {
            OrderState::Filled => {
                self.settle(order, response, plan).await?;
                Ok(true)
            }
            OrderState::Canceled => {
                self.store.release_reservation(&order.market).await?;
                tracing::info!(order_id = %order.order_id, "Order canceled without fills");
                self.emit(OrderEvent::Canceled {
                    order_id: order.order_id.clone(),
                    market: order.market.clone(),
                    reason: Some("canceled on exchange".to_string()),
                    at: Utc::now(),
                })
                .await;
                Ok(true)
            }
            _ => {
                if changed {
                    self.emit(OrderEvent::Updated {
                        order_id: order.order_id.clone(),
                        state: order.state,
                        executed_volume: order.executed_volume,
                        at: Utc::now(),
                    })
                    .await;
                }
                Ok(false)
            }
        }
    }

    async fn settle(&self, order: &Order, response: &OrderResponse, plan: ExitPlan) -> Result<()> {
        let trades = if response.trades.is_empty() {
            self.exchange.get_order_trades(&order.order_id).await?
        } else {
            response.trades.clone()
        };

        let fill = weighted_fill(&trades).or_else(|| order_fill(order, response));
        let (price, volume) = match fill {
            Some(fill) => fill,
            None => {
                let ticker = self.exchange.get_ticker(&order.market).await?;
                tracing::warn!(
                    order_id = %order.order_id,
                    "No fill detail, settling at last trade price {}",
                    ticker.trade_price
                );
                (
                    ticker.trade_price,
                    response.executed_volume.max(order.executed_volume),
                )
            }
        };

        let fill = FillEffect {
            market: order.market.clone(),
            direction: direction_of(order.side),
            price,
            volume,
            fee: response.paid_fee,
            exit_reason: plan.exit_reason,
            profit_target_pct: plan.profit_target_pct,
            stop_loss_pct: plan.stop_loss_pct,
            timestamp: Utc::now(),
        };
        self.store.apply_fill(&fill).await?;

        tracing::info!(
            "✅ Order {} filled: {} {:.8} {} @ {}",
            order.order_id,
            order.side.as_str(),
            volume,
            order.market,
            price
        );

        self.emit(OrderEvent::Filled {
            order_id: order.order_id.clone(),
            market: order.market.clone(),
            side: order.side,
            price,
            volume,
            at: Utc::now(),
        })
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::{order_response, trade, FakeExchange};
    use crate::models::{OrderType, PositionStatus};
    use crate::risk::{OrderCandidate, RiskGate};
    use crate::shutdown::ShutdownTrigger;
    use crate::store::MemoryStore;

    fn submitted(order_id: &str, side: Side) -> Order {
        let mut order = Order::pending(
            order_id.to_string(),
            "KRW-BTC".to_string(),
            side,
            OrderType::Market,
            Some(10_000.0),
            None,
            None,
        );
        order.advance(OrderState::Submitted).unwrap();
        order
    }

    fn tracker(
        exchange: Arc<FakeExchange>,
        store: Arc<MemoryStore>,
    ) -> (OrderTracker, mpsc::Receiver<OrderEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            OrderTracker::new(exchange, store, tx, Duration::from_millis(5), 3),
            rx,
        )
    }

    #[test]
    fn test_weighted_fill() {
        let trades = vec![trade("t1", 100.0, 1.0), trade("t2", 110.0, 3.0)];
        let (price, volume) = weighted_fill(&trades).unwrap();
        assert_eq!(volume, 4.0);
        assert!((price - 107.5).abs() < 1e-9);
        assert!(weighted_fill(&[]).is_none());
    }

    #[test]
    fn test_target_state_mapping() {
        let mut response = order_response("o-1", Side::Bid, ExchangeOrderStatus::Wait);
        assert_eq!(target_state(&response), OrderState::Submitted);

        response.executed_volume = 0.5;
        assert_eq!(target_state(&response), OrderState::PartiallyFilled);

        response.state = ExchangeOrderStatus::Cancel;
        assert_eq!(target_state(&response), OrderState::Filled);

        response.executed_volume = 0.0;
        assert_eq!(target_state(&response), OrderState::Canceled);
    }

    #[tokio::test]
    async fn test_fill_opens_position_at_vwap() {
        let exchange = Arc::new(FakeExchange::new());
        let store = Arc::new(MemoryStore::with_equity(100_000.0));

        let mut partial = order_response("o-1", Side::Bid, ExchangeOrderStatus::Wait);
        partial.executed_volume = 1.0;
        partial.trades = vec![trade("t1", 100.0, 1.0)];
        let mut done = order_response("o-1", Side::Bid, ExchangeOrderStatus::Done);
        done.executed_volume = 4.0;
        done.trades = vec![trade("t1", 100.0, 1.0), trade("t2", 110.0, 3.0)];
        exchange.script("o-1", vec![partial, done]);

        let (tracker, mut events) = tracker(exchange, store.clone());
        let trigger = ShutdownTrigger::new();
        let order = tracker
            .track(submitted("o-1", Side::Bid), ExitPlan::default(), trigger.subscribe())
            .await
            .unwrap();

        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.executed_volume, 4.0);
        assert_eq!(store.trades_for_order("o-1").await.unwrap().len(), 2);

        let position = store.open_position("KRW-BTC").await.unwrap().unwrap();
        assert!((position.entry_price - 107.5).abs() < 1e-9);
        assert_eq!(position.quantity, 4.0);

        assert!(matches!(
            events.recv().await,
            Some(OrderEvent::Updated {
                state: OrderState::PartiallyFilled,
                ..
            })
        ));
        assert!(matches!(events.recv().await, Some(OrderEvent::Filled { .. })));
    }

    #[tokio::test]
    async fn test_market_buy_without_trades_uses_spend_per_unit() {
        let exchange = Arc::new(FakeExchange::new());
        let store = Arc::new(MemoryStore::with_equity(1_000_000.0));

        let mut done = order_response("o-6", Side::Bid, ExchangeOrderStatus::Done);
        done.price = Some(100_000.0);
        done.executed_volume = 1_000.0;
        exchange.script("o-6", vec![done]);

        let (tracker, _events) = tracker(exchange, store.clone());
        let trigger = ShutdownTrigger::new();
        let order = tracker
            .track(submitted("o-6", Side::Bid), ExitPlan::default(), trigger.subscribe())
            .await
            .unwrap();
        assert_eq!(order.state, OrderState::Filled);

        let position = store.open_position("KRW-BTC").await.unwrap().unwrap();
        assert!((position.entry_price - 100.0).abs() < 1e-9);
        assert_eq!(position.quantity, 1_000.0);
        assert!((position.notional() - 100_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_order_fill_by_order_type() {
        let mut response = order_response("o-7", Side::Bid, ExchangeOrderStatus::Done);
        response.price = Some(50.0);
        response.executed_volume = 2.0;

        let mut limit = submitted("o-7", Side::Bid);
        limit.order_type = OrderType::Limit;
        assert_eq!(order_fill(&limit, &response), Some((50.0, 2.0)));
        assert_eq!(
            order_fill(&submitted("o-7", Side::Bid), &response),
            Some((25.0, 2.0))
        );

        response.side = Side::Ask;
        response.price = None;
        assert_eq!(order_fill(&submitted("o-7", Side::Ask), &response), None);
    }

    #[tokio::test]
    async fn test_market_sell_without_trades_settles_at_ticker() {
        let exchange = Arc::new(FakeExchange::new());
        exchange.set_fill_price(95.0);
        let store = Arc::new(MemoryStore::with_equity(100_000.0));
        store
            .apply_fill(&FillEffect {
                market: "KRW-BTC".to_string(),
                direction: Direction::Buy,
                price: 100.0,
                volume: 2.0,
                fee: 0.0,
                exit_reason: None,
                profit_target_pct: 0.05,
                stop_loss_pct: 0.03,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let mut done = order_response("o-8", Side::Ask, ExchangeOrderStatus::Done);
        done.executed_volume = 2.0;
        exchange.script("o-8", vec![done]);

        let (tracker, _events) = tracker(exchange, store.clone());
        let trigger = ShutdownTrigger::new();
        let mut order = submitted("o-8", Side::Ask);
        order.price = None;
        tracker
            .track(order, ExitPlan::default(), trigger.subscribe())
            .await
            .unwrap();

        let closed = store.positions(Some(PositionStatus::Closed)).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].realized_pnl, Some(-10.0));
    }

    fn unconfirmed(identifier: &str) -> Order {
        Order::pending(
            identifier.to_string(),
            "KRW-BTC".to_string(),
            Side::Bid,
            OrderType::Market,
            Some(10_000.0),
            None,
            None,
        )
    }

    #[tokio::test]
    async fn test_resolve_unknown_identifier_releases_reservation() {
        let exchange = Arc::new(FakeExchange::new());
        let store = Arc::new(MemoryStore::with_equity(100_000.0));
        let gate = RiskGate::default();
        let candidate = OrderCandidate {
            market: "KRW-BTC".to_string(),
            direction: Direction::Buy,
            notional: 10_000.0,
            volume: None,
        };
        assert!(store.reserve_risk(&gate, &candidate).await.unwrap().is_approved());
        store.save_order(&unconfirmed("id-lost")).await.unwrap();

        let (tracker, mut events) = tracker(exchange, store.clone());
        let trigger = ShutdownTrigger::new();
        let order = tracker
            .resolve(unconfirmed("id-lost"), ExitPlan::default(), trigger.subscribe())
            .await
            .unwrap();

        assert_eq!(order.state, OrderState::Canceled);
        assert_eq!(
            store.order("id-lost").await.unwrap().unwrap().state,
            OrderState::Canceled
        );
        assert!(store.reserve_risk(&gate, &candidate).await.unwrap().is_approved());
        assert!(matches!(events.recv().await, Some(OrderEvent::Canceled { .. })));
    }

    #[tokio::test]
    async fn test_resolve_keeps_reservation_while_lookups_fail() {
        let exchange = Arc::new(FakeExchange::new());
        exchange.fail_polls(10);
        let store = Arc::new(MemoryStore::with_equity(100_000.0));
        let gate = RiskGate::default();
        let candidate = OrderCandidate {
            market: "KRW-BTC".to_string(),
            direction: Direction::Buy,
            notional: 10_000.0,
            volume: None,
        };
        assert!(store.reserve_risk(&gate, &candidate).await.unwrap().is_approved());

        let (tracker, _events) = tracker(exchange, store.clone());
        let trigger = ShutdownTrigger::new();
        let order = tracker
            .resolve(unconfirmed("id-unknown"), ExitPlan::default(), trigger.subscribe())
            .await
            .unwrap();

        assert_eq!(order.state, OrderState::Pending);
        assert_eq!(
            store.reserve_risk(&gate, &candidate).await.unwrap(),
            crate::risk::RiskDecision::Blocked(crate::risk::BlockReason::OrderInFlight)
        );
    }

    #[tokio::test]
    async fn test_cancel_without_fills_releases_reservation() {
        let exchange = Arc::new(FakeExchange::new());
        let store = Arc::new(MemoryStore::with_equity(100_000.0));
        let gate = RiskGate::default();
        let candidate = OrderCandidate {
            market: "KRW-BTC".to_string(),
            direction: Direction::Buy,
            notional: 1_000.0,
            volume: None,
        };
        assert!(store.reserve_risk(&gate, &candidate).await.unwrap().is_approved());

        exchange.script(
            "o-2",
            vec![order_response("o-2", Side::Bid, ExchangeOrderStatus::Cancel)],
        );
        let (tracker, mut events) = tracker(exchange, store.clone());
        let trigger = ShutdownTrigger::new();
        let order = tracker
            .track(submitted("o-2", Side::Bid), ExitPlan::default(), trigger.subscribe())
            .await
            .unwrap();

        assert_eq!(order.state, OrderState::Canceled);
        assert!(store.open_position("KRW-BTC").await.unwrap().is_none());
        assert!(store.reserve_risk(&gate, &candidate).await.unwrap().is_approved());
        assert!(matches!(events.recv().await, Some(OrderEvent::Canceled { .. })));
    }

    #[tokio::test]
    async fn test_sell_fill_closes_with_exit_reason() {
        let exchange = Arc::new(FakeExchange::new());
        let store = Arc::new(MemoryStore::with_equity(100_000.0));
        store
            .apply_fill(&FillEffect {
                market: "KRW-BTC".to_string(),
                direction: Direction::Buy,
                price: 100.0,
                volume: 2.0,
                fee: 0.0,
                exit_reason: None,
                profit_target_pct: 0.05,
                stop_loss_pct: 0.03,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let mut done = order_response("o-3", Side::Ask, ExchangeOrderStatus::Done);
        done.executed_volume = 2.0;
        done.trades = vec![trade("t3", 96.0, 2.0)];
        exchange.script("o-3", vec![done]);

        let (tracker, _events) = tracker(exchange, store.clone());
        let trigger = ShutdownTrigger::new();
        let plan = ExitPlan {
            exit_reason: Some(ExitReason::Stop),
            ..Default::default()
        };
        tracker
            .track(submitted("o-3", Side::Ask), plan, trigger.subscribe())
            .await
            .unwrap();

        let closed = store.positions(Some(PositionStatus::Closed)).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_reason, Some(ExitReason::Stop));
        assert_eq!(closed[0].realized_pnl, Some(-8.0));
    }

    #[tokio::test]
    async fn test_gives_up_after_repeated_poll_failures() {
        let exchange = Arc::new(FakeExchange::new());
        exchange.fail_polls(10);
        let store = Arc::new(MemoryStore::new());

        let (tracker, mut events) = tracker(exchange, store.clone());
        let trigger = ShutdownTrigger::new();
        let order = tracker
            .track(submitted("o-4", Side::Bid), ExitPlan::default(), trigger.subscribe())
            .await
            .unwrap();

        assert_eq!(order.state, OrderState::Canceled);
        assert!(order
            .failure_reason
            .as_deref()
            .unwrap()
            .starts_with("tracking abandoned"));
        assert_eq!(
            store.order("o-4").await.unwrap().unwrap().state,
            OrderState::Canceled
        );
        assert!(matches!(events.recv().await, Some(OrderEvent::Canceled { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_leaves_open_order() {
        let exchange = Arc::new(FakeExchange::new());
        exchange.script(
            "o-5",
            vec![order_response("o-5", Side::Bid, ExchangeOrderStatus::Wait)],
        );
        let store = Arc::new(MemoryStore::new());
        let (tracker, _events) = tracker(exchange, store.clone());

        let trigger = ShutdownTrigger::new();
        trigger.trigger();
        let order = tokio::time::timeout(
            Duration::from_secs(1),
            tracker.track(submitted("o-5", Side::Bid), ExitPlan::default(), trigger.subscribe()),
        )
        .await
        .expect("tracker should stop on shutdown")
        .unwrap();

        assert_eq!(order.state, OrderState::Submitted);
        assert_eq!(order.exchange_status, Some(ExchangeOrderStatus::Wait));
    }
}
