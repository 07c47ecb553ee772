use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use super::events::OrderEvent;
use super::tracker::{ExitPlan, OrderTracker};
use crate::api::{Account, ExchangeApi, OrderRequest};
use crate::error::{Error, ExchangeError, OrderStateError};
use crate::models::{
    BlockedSignal, Direction, ExitReason, Order, OrderState, Signal, StrategyConfig,
};
use crate::risk::{BlockReason, OrderCandidate, RiskDecision, RiskGate};
use crate::shutdown::Shutdown;
use crate::store::Store;
use crate::Result;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub max_poll_failures: u32,
    /// Share of equity spent by a buy when the market's config sets none
    pub default_order_fraction: f64,
    /// `None` disables the periodic equity refresh
    pub balance_refresh: Option<Duration>,
    pub quote_currency: String,
    /// How long open trackers get to reconcile after shutdown
    pub shutdown_grace: Duration,
    /// Log decisions without placing orders
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_poll_failures: 5,
            default_order_fraction: 0.1,
            balance_refresh: Some(Duration::from_secs(60)),
            quote_currency: "KRW".to_string(),
            shutdown_grace: Duration::from_secs(10),
            dry_run: false,
        }
    }
}

/// What became of a signal or manual order
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Placed(Order),
    /// No answer from the exchange; the order is being looked up by its identifier
    Unconfirmed(Order),
    Blocked(BlockReason),
    DryRun,
}

/// Operator requests routed into the engine
#[derive(Debug)]
pub enum EngineCommand {
    ManualOrder {
        market: String,
        direction: Direction,
        /// Quote amount for a buy; defaults to the usual sizing
        spend: Option<f64>,
        reply: oneshot::Sender<Result<Submission>>,
    },
    Cancel {
        order_id: String,
        reply: oneshot::Sender<Result<Order>>,
    },
}

/// Equity in quote currency: cash plus holdings valued at their average buy price
pub fn account_equity(accounts: &[Account], quote_currency: &str) -> f64 {
    accounts
        .iter()
        .map(|a| {
            let held = a.balance + a.locked;
            if a.currency == quote_currency {
                held
            } else if a.unit_currency.is_empty() || a.unit_currency == quote_currency {
                held * a.avg_buy_price
            } else {
                0.0
            }
        })
        .sum()
}

/// Turns signals into risk-checked exchange orders
pub struct ExecutionEngine {
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<dyn Store>,
    gate: RiskGate,
    config: EngineConfig,
    events: mpsc::Sender<OrderEvent>,
    tracker: OrderTracker,
    trackers: JoinSet<()>,
    shutdown: Shutdown,
}

impl ExecutionEngine {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        store: Arc<dyn Store>,
        gate: RiskGate,
        config: EngineConfig,
        events: mpsc::Sender<OrderEvent>,
        shutdown: Shutdown,
    ) -> Self {
        let tracker = OrderTracker::new(
            exchange.clone(),
            store.clone(),
            events.clone(),
            config.poll_interval,
            config.max_poll_failures,
        );
        Self {
            exchange,
            store,
            gate,
            config,
            events,
            tracker,
            trackers: JoinSet::new(),
            shutdown,
        }
    }

    /// Consume signals and commands until shutdown or until the signal queue closes
    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<Signal>,
        mut commands: mpsc::Receiver<EngineCommand>,
    ) {
        if let Err(e) = self.reconcile().await {
            tracing::error!("Startup reconciliation failed: {}", e);
        }

        let mut shutdown = self.shutdown.clone();
        let mut balance_timer = self.config.balance_refresh.map(tokio::time::interval);
        let mut commands_open = true;

        tracing::info!(
            "💹 Execution engine running{}",
            if self.config.dry_run { " (dry run)" } else { "" }
        );

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => {
                        tracing::info!("Signal queue closed, stopping engine");
                        break;
                    }
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => commands_open = false,
                },
                _ = async {
                    match balance_timer.as_mut() {
                        Some(timer) => timer.tick().await,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Err(e) = self.refresh_equity().await {
                        tracing::warn!("Balance refresh failed: {}", e);
                    }
                },
                Some(joined) = self.trackers.join_next(), if !self.trackers.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Order tracker task failed: {}", e);
                    }
                }
            }
        }

        self.drain().await;
        tracing::info!("Execution engine stopped");
    }

    async fn drain(&mut self) {
        if self.trackers.is_empty() {
            return;
        }
        tracing::info!("Waiting for {} order trackers", self.trackers.len());

        let trackers = &mut self.trackers;
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while trackers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                "Order trackers still running after {:?}, aborting",
                self.config.shutdown_grace
            );
            self.trackers.abort_all();
        }
    }

    async fn emit(&self, event: OrderEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Order event queue closed, dropping event");
        }
    }

    /// Resume tracking of orders left open by a previous run and drop
    /// reservations that no open order backs.
    pub async fn reconcile(&mut self) -> Result<()> {
        let open = self.store.open_orders().await?;
        let mut tracked = HashSet::new();

        for order in open {
            let config = self.store.strategy_config(&order.market).await?;
            let plan = ExitPlan::for_config(config.as_ref(), None);
            tracked.insert(order.market.clone());

            // Only submissions without an exchange answer are stored Pending
            if order.state == OrderState::Pending {
                tracing::info!(
                    "🔄 Looking up unconfirmed order {} on {}",
                    order.order_id,
                    order.market
                );
                self.spawn_resolver(order, plan);
                continue;
            }

            tracing::info!(
                "🔄 Resuming order {} on {} ({})",
                order.order_id,
                order.market,
                order.state
            );
            self.spawn_tracker(order, plan);
        }

        let snapshot = self.store.risk_snapshot().await?;
        for (market, exposure) in &snapshot.exposures {
            if exposure.in_flight.is_some() && !tracked.contains(market) {
                tracing::warn!("Releasing stale reservation for {}", market);
                self.store.release_reservation(market).await?;
            }
        }
        Ok(())
    }

    pub async fn refresh_equity(&self) -> Result<f64> {
        let accounts = self.exchange.get_accounts().await?;
        let equity = account_equity(&accounts, &self.config.quote_currency);
        self.store.set_equity(equity).await?;
        tracing::debug!("Equity refreshed: {:.0} {}", equity, self.config.quote_currency);
        Ok(equity)
    }

    async fn handle_signal(&mut self, signal: Signal) {
        if let Err(e) = self.store.save_signal(&signal).await {
            tracing::error!("Failed to persist signal {}: {}", signal.id(), e);
            return;
        }

        match self.execute(&signal, None).await {
            Ok(Submission::Placed(order)) => {
                tracing::info!(
                    "📤 {} {} order {} submitted ({})",
                    signal.direction(),
                    signal.market(),
                    order.order_id,
                    signal.strategy()
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!(
                "Signal {} for {} not executed: {}",
                signal.id(),
                signal.market(),
                e
            ),
        }
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::ManualOrder {
                market,
                direction,
                spend,
                reply,
            } => {
                let result = self.manual_order(&market, direction, spend).await;
                let _ = reply.send(result);
            }
            EngineCommand::Cancel { order_id, reply } => {
                let result = self.cancel(&order_id).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn manual_order(
        &mut self,
        market: &str,
        direction: Direction,
        spend: Option<f64>,
    ) -> Result<Submission> {
        let ticker = self.exchange.get_ticker(market).await?;
        let mut signal = Signal::new("manual", market, direction, ticker.trade_price, 1.0);
        if direction == Direction::Sell {
            signal = signal.with_exit_reason(ExitReason::Manual);
        }
        if let Some(spend) = spend {
            signal = signal.with_parameter("spend", spend);
        }

        self.store.save_signal(&signal).await?;
        tracing::info!("🖐️  Manual {} order for {}", direction, market);
        self.execute(&signal, spend).await
    }

    async fn cancel(&self, order_id: &str) -> Result<Order> {
        let mut order = self
            .store
            .order(order_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound(format!("order {}", order_id)))?;

        if order.state.is_terminal() {
            return Err(OrderStateError::Terminal {
                from: order.state,
                to: OrderState::Canceled,
            }
            .into());
        }

        let response = self.exchange.cancel_order(order_id).await?;
        order.exchange_status = Some(response.state);
        tracing::info!("Cancel requested for order {} on {}", order_id, order.market);
        Ok(order)
    }

    /// Size, risk-check and submit one signal
    async fn execute(&mut self, signal: &Signal, spend: Option<f64>) -> Result<Submission> {
        let config = self.store.strategy_config(signal.market()).await?;
        let candidate = self.size(signal, config.as_ref(), spend).await?;

        if let RiskDecision::Blocked(reason) =
            self.store.reserve_risk(&self.gate, &candidate).await?
        {
            self.block(signal, reason).await?;
            return Ok(Submission::Blocked(reason));
        }

        let request = match Self::build_request(&candidate) {
            Ok(request) => request,
            Err(e) => {
                self.store.release_reservation(&candidate.market).await?;
                let detail = format!("{}: {}", BlockReason::InvalidOrder, e);
                self.record_block(signal, BlockReason::InvalidOrder, detail).await?;
                return Ok(Submission::Blocked(BlockReason::InvalidOrder));
            }
        };

        if self.config.dry_run {
            tracing::info!(
                "[dry-run] would place {} {} (price: {:?}, volume: {:?})",
                request.wire_ord_type(),
                request.market(),
                request.price(),
                request.volume()
            );
            self.store.release_reservation(&candidate.market).await?;
            return Ok(Submission::DryRun);
        }

        let mut order = Order::pending(
            request.identifier().to_string(),
            request.market().to_string(),
            request.side(),
            request.order_type(),
            request.price(),
            request.volume(),
            Some(signal.id()),
        );

        let plan = ExitPlan::for_config(config.as_ref(), signal.exit_reason());
        match self.exchange.create_order(&request).await {
            Ok(response) => {
                order.order_id = response.uuid.clone();
                order.exchange_status = Some(response.state);
                order.advance(OrderState::Submitted)?;
                self.store.save_order(&order).await?;

                self.emit(OrderEvent::Submitted {
                    order_id: order.order_id.clone(),
                    market: order.market.clone(),
                    side: order.side,
                    at: Utc::now(),
                })
                .await;

                self.spawn_tracker(order.clone(), plan);
                Ok(Submission::Placed(order))
            }
            Err(e) if e.outcome_unknown() => {
                // The market stays reserved until the lookup settles it
                self.store.save_order(&order).await?;
                tracing::warn!(
                    "⚠️  No answer for {} order {}: {}, looking it up",
                    order.market,
                    order.order_id,
                    e
                );
                self.spawn_resolver(order.clone(), plan);
                Ok(Submission::Unconfirmed(order))
            }
            Err(e) => {
                order.fail(e.to_string())?;
                self.store.save_order(&order).await?;
                self.store.release_reservation(&order.market).await?;
                tracing::error!("❌ Order for {} failed: {}", order.market, e);

                self.emit(OrderEvent::Canceled {
                    order_id: order.order_id.clone(),
                    market: order.market.clone(),
                    reason: order.failure_reason.clone(),
                    at: Utc::now(),
                })
                .await;
                Err(e.into())
            }
        }
    }

    async fn size(
        &self,
        signal: &Signal,
        config: Option<&StrategyConfig>,
        spend: Option<f64>,
    ) -> Result<OrderCandidate> {
        let market = signal.market().to_string();

        match signal.direction() {
            Direction::Buy => {
                let notional = match spend {
                    Some(spend) => spend,
                    None => {
                        let fraction = config
                            .and_then(|c| c.order_fraction())
                            .unwrap_or(self.config.default_order_fraction);
                        fraction * self.store.risk_snapshot().await?.equity
                    }
                };
                Ok(OrderCandidate {
                    market,
                    direction: Direction::Buy,
                    notional,
                    volume: None,
                })
            }
            Direction::Sell => {
                let volume = self
                    .store
                    .open_position(&market)
                    .await?
                    .map(|p| p.quantity);
                Ok(OrderCandidate {
                    market,
                    direction: Direction::Sell,
                    notional: volume.unwrap_or(0.0) * signal.price(),
                    volume,
                })
            }
        }
    }

    fn build_request(candidate: &OrderCandidate) -> Result<OrderRequest> {
        let request = match candidate.direction {
            Direction::Buy => OrderRequest::market_buy(&candidate.market, candidate.notional),
            Direction::Sell => {
                OrderRequest::market_sell(&candidate.market, candidate.volume.unwrap_or(0.0))
            }
        };
        request.map_err(Error::from)
    }

    async fn block(&self, signal: &Signal, reason: BlockReason) -> Result<()> {
        self.record_block(signal, reason, reason.to_string()).await
    }

    async fn record_block(
        &self,
        signal: &Signal,
        reason: BlockReason,
        detail: String,
    ) -> Result<()> {
        let blocked = BlockedSignal {
            signal_id: signal.id(),
            market: signal.market().to_string(),
            direction: signal.direction(),
            reason: detail,
            timestamp: Utc::now(),
        };
        self.store.record_blocked(&blocked).await?;
        tracing::info!(
            "🚫 {} {} blocked: {}",
            signal.direction(),
            signal.market(),
            blocked.reason
        );

        self.emit(OrderEvent::Blocked {
            signal_id: signal.id(),
            market: blocked.market,
            reason,
            at: blocked.timestamp,
        })
        .await;
        Ok(())
    }

    fn spawn_resolver(&mut self, order: Order, plan: ExitPlan) {
        let tracker = self.tracker.clone();
        let shutdown = self.shutdown.clone();
        self.trackers.spawn(async move {
            let order_id = order.order_id.clone();
            if let Err(e) = tracker.resolve(order, plan, shutdown).await {
                tracing::error!(order_id = %order_id, "Order lookup failed: {}", e);
            }
        });
    }

    fn spawn_tracker(&mut self, order: Order, plan: ExitPlan) {
        let tracker = self.tracker.clone();
        let shutdown = self.shutdown.clone();
        self.trackers.spawn(async move {
            let order_id = order.order_id.clone();
            if let Err(e) = tracker.track(order, plan, shutdown).await {
                tracing::error!(order_id = %order_id, "Order tracking failed: {}", e);
            }
        });
    }
}
