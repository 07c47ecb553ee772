use chrono::NaiveDate;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::execution::{EngineCommand, OrderEvent, Submission};
use crate::models::{
    BlockedSignal, DailyPerformance, Direction, Order, PerformanceMetric, Position,
    PositionStatus, Signal, StrategyConfig,
};
use crate::shutdown::Shutdown;
use crate::store::Store;
use crate::Result;

/// Bounded log of the most recent order events
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<VecDeque<OrderEvent>>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, event: OrderEvent) {
        let Ok(mut events) = self.events.lock() else {
            tracing::warn!("Event log lock poisoned, dropping event");
            return;
        };
        events.push_back(event);
        while events.len() > self.capacity {
            events.pop_front();
        }
    }

    /// Newest first
    pub fn recent(&self, limit: usize) -> Vec<OrderEvent> {
        match self.events.lock() {
            Ok(events) => events.iter().rev().take(limit).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Drain the order-event queue into the log until shutdown or until
    /// every sender is gone
    pub async fn run(self, mut events: mpsc::Receiver<OrderEvent>, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        tracing::debug!("Order event: {:?}", event);
                        self.record(event);
                    }
                    None => break,
                },
            }
        }
    }
}

/// In-process administrative API
///
/// Reads go straight to the store; anything that touches orders goes
/// through the execution engine's command channel.
#[derive(Clone)]
pub struct AdminHandle {
    store: Arc<dyn Store>,
    commands: mpsc::Sender<EngineCommand>,
    events: EventLog,
}

impl AdminHandle {
    pub fn new(
        store: Arc<dyn Store>,
        commands: mpsc::Sender<EngineCommand>,
        events: EventLog,
    ) -> Self {
        Self {
            store,
            commands,
            events,
        }
    }

    pub async fn orders(&self, limit: usize) -> Result<Vec<Order>> {
        Ok(self.store.orders(limit).await?)
    }

    pub async fn open_orders(&self) -> Result<Vec<Order>> {
        Ok(self.store.open_orders().await?)
    }

    pub async fn positions(&self, status: Option<PositionStatus>) -> Result<Vec<Position>> {
        Ok(self.store.positions(status).await?)
    }

    pub async fn signals(&self, market: Option<&str>, limit: usize) -> Result<Vec<Signal>> {
        Ok(self.store.signals(market, limit).await?)
    }

    pub async fn blocked_signals(&self, limit: usize) -> Result<Vec<BlockedSignal>> {
        Ok(self.store.blocked_signals(limit).await?)
    }

    pub fn recent_events(&self, limit: usize) -> Vec<OrderEvent> {
        self.events.recent(limit)
    }

    pub async fn strategy_configs(&self) -> Result<Vec<StrategyConfig>> {
        Ok(self.store.strategy_configs().await?)
    }

    /// Validate and store a market's strategy configuration. The pipeline
    /// picks it up on the next tick.
    pub async fn upsert_strategy_config(&self, config: StrategyConfig) -> Result<()> {
        config.validate().map_err(Error::Config)?;
        self.store.upsert_strategy_config(&config).await?;
        tracing::info!(
            "⚙️  Strategy for {} set to {} ({})",
            config.market,
            config.strategy_name(),
            if config.enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub async fn daily_performance(&self, date: NaiveDate) -> Result<Vec<DailyPerformance>> {
        Ok(self.store.daily_performance(date).await?)
    }

    pub async fn performance_metrics(&self) -> Result<Vec<PerformanceMetric>> {
        Ok(self.store.performance_metrics().await?)
    }

    /// Place an order outside the strategy flow; it still passes the risk gate
    pub async fn manual_order(
        &self,
        market: &str,
        direction: Direction,
        spend: Option<f64>,
    ) -> Result<Submission> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::ManualOrder {
            market: market.to_string(),
            direction,
            spend,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| Error::EngineUnavailable("engine dropped the request".into()))?
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<Order> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Cancel {
            order_id: order_id.to_string(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| Error::EngineUnavailable("engine dropped the request".into()))?
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::EngineUnavailable("engine is not running".into()))
    }
}
