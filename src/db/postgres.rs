use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use std::collections::{BTreeMap, HashMap};

use crate::error::{StoreError, StoreResult};
use crate::execution::position_manager::{self, FillEffect};
use crate::models::{
    BlockedSignal, Candle, DailyPerformance, Direction, ExchangeOrderStatus, ExitReason, Market,
    Order, OrderState, OrderType, PerformanceMetric, Position, PositionStatus, Side, Signal,
    StrategyConfig, Timeframe, Trade,
};
use crate::risk::{OrderCandidate, RiskDecision, RiskGate, RiskSnapshot};
use crate::store::Store;
use crate::strategy::StrategyParams;

/// Advisory lock serializing risk reservations and fill effects
const RISK_LOCK_KEY: i64 = 0x7570_626f_7400;

/// Postgres-backed store
pub struct PostgresStore {
    pool: PgPool,
}

// ============== Row helpers ==============

fn num(row: &PgRow, column: &str) -> StoreResult<f64> {
    let value: Decimal = row.try_get(column)?;
    value
        .to_f64()
        .ok_or_else(|| StoreError::Corrupt(format!("{} = {} is not representable", column, value)))
}

fn opt_num(row: &PgRow, column: &str) -> StoreResult<Option<f64>> {
    let value: Option<Decimal> = row.try_get(column)?;
    value
        .map(|v| {
            v.to_f64()
                .ok_or_else(|| StoreError::Corrupt(format!("{} = {} is not representable", column, v)))
        })
        .transpose()
}

fn parsed<T>(value: &str, what: &str, parse: impl Fn(&str) -> Option<T>) -> StoreResult<T> {
    parse(value).ok_or_else(|| StoreError::Corrupt(format!("invalid {} '{}'", what, value)))
}

fn candle_from_row(row: &PgRow) -> StoreResult<Candle> {
    let timeframe: String = row.try_get("timeframe")?;
    Ok(Candle {
        market: row.try_get("market")?,
        timeframe: Timeframe::parse(&timeframe).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        timestamp: row.try_get("ts")?,
        open: num(row, "open")?,
        high: num(row, "high")?,
        low: num(row, "low")?,
        close: num(row, "close")?,
        volume: num(row, "volume")?,
    })
}

fn signal_from_row(row: &PgRow) -> StoreResult<Signal> {
    let direction: String = row.try_get("direction")?;
    let exit_reason: Option<String> = row.try_get("exit_reason")?;
    let parameters: Json<BTreeMap<String, f64>> = row.try_get("parameters")?;

    Ok(Signal::restore(
        row.try_get("id")?,
        row.try_get("strategy")?,
        row.try_get("market")?,
        parsed(&direction, "direction", Direction::parse)?,
        num(row, "price")?,
        row.try_get("confidence")?,
        parameters.0,
        exit_reason
            .as_deref()
            .map(|r| parsed(r, "exit reason", ExitReason::parse))
            .transpose()?,
        row.try_get("created_at")?,
    ))
}

fn blocked_from_row(row: &PgRow) -> StoreResult<BlockedSignal> {
    let direction: String = row.try_get("direction")?;
    Ok(BlockedSignal {
        signal_id: row.try_get("signal_id")?,
        market: row.try_get("market")?,
        direction: parsed(&direction, "direction", Direction::parse)?,
        reason: row.try_get("reason")?,
        timestamp: row.try_get("created_at")?,
    })
}

fn order_from_row(row: &PgRow) -> StoreResult<Order> {
    let side: String = row.try_get("side")?;
    let order_type: String = row.try_get("order_type")?;
    let state: String = row.try_get("state")?;
    let exchange_status: Option<String> = row.try_get("exchange_status")?;

    Ok(Order {
        order_id: row.try_get("order_id")?,
        market: row.try_get("market")?,
        side: parsed(&side, "side", Side::parse)?,
        order_type: parsed(&order_type, "order type", OrderType::parse)?,
        price: opt_num(row, "price")?,
        volume: opt_num(row, "volume")?,
        executed_volume: num(row, "executed_volume")?,
        exchange_status: exchange_status
            .as_deref()
            .map(|s| parsed(s, "exchange status", ExchangeOrderStatus::parse))
            .transpose()?,
        state: parsed(&state, "order state", OrderState::parse)?,
        signal_id: row.try_get("signal_id")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn trade_from_row(row: &PgRow) -> StoreResult<Trade> {
    let side: String = row.try_get("side")?;
    Ok(Trade {
        trade_id: row.try_get("trade_id")?,
        market: row.try_get("market")?,
        order_id: row.try_get("order_id")?,
        price: num(row, "price")?,
        volume: num(row, "volume")?,
        side: parsed(&side, "side", Side::parse)?,
        fee: num(row, "fee")?,
        timestamp: row.try_get("ts")?,
    })
}

fn position_from_row(row: &PgRow) -> StoreResult<Position> {
    let status: String = row.try_get("status")?;
    let exit_reason: Option<String> = row.try_get("exit_reason")?;

    Ok(Position {
        id: row.try_get("id")?,
        market: row.try_get("market")?,
        entry_price: num(row, "entry_price")?,
        entry_time: row.try_get("entry_time")?,
        quantity: num(row, "quantity")?,
        status: parsed(&status, "position status", PositionStatus::parse)?,
        profit_target: num(row, "profit_target")?,
        stop_loss: num(row, "stop_loss")?,
        last_price: num(row, "last_price")?,
        current_profit: num(row, "current_profit")?,
        exit_price: opt_num(row, "exit_price")?,
        exit_time: row.try_get("exit_time")?,
        exit_reason: exit_reason
            .as_deref()
            .map(|r| parsed(r, "exit reason", ExitReason::parse))
            .transpose()?,
        realized_pnl: opt_num(row, "realized_pnl")?,
    })
}

fn config_from_row(row: &PgRow) -> StoreResult<StrategyConfig> {
    let params: Json<StrategyParams> = row.try_get("params")?;
    let tuning: Json<BTreeMap<String, f64>> = row.try_get("tuning")?;
    let timeframe: String = row.try_get("timeframe")?;

    Ok(StrategyConfig {
        market: row.try_get("market")?,
        params: params.0,
        timeframe: Timeframe::parse(&timeframe).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        profit_target: row.try_get("profit_target")?,
        stop_loss: row.try_get("stop_loss")?,
        enabled: row.try_get("enabled")?,
        tuning: tuning.0,
    })
}

fn daily_from_row(row: &PgRow) -> StoreResult<DailyPerformance> {
    let trade_count: i32 = row.try_get("trade_count")?;
    let win_count: i32 = row.try_get("win_count")?;
    Ok(DailyPerformance {
        date: row.try_get("date")?,
        market: row.try_get("market")?,
        profit_percentage: row.try_get("profit_percentage")?,
        profit_amount: num(row, "profit_amount")?,
        trade_count: trade_count.max(0) as u32,
        win_count: win_count.max(0) as u32,
    })
}

const POSITION_COLUMNS: &str = "id, market, entry_price, entry_time, quantity, status, \
     profit_target, stop_loss, last_price, current_profit, exit_price, exit_time, \
     exit_reason, realized_pnl";

const ORDER_COLUMNS: &str = "order_id, market, side, order_type, price, volume, \
     executed_volume, exchange_status, state, signal_id, failure_reason, created_at, last_updated";

impl PostgresStore {
    /// Connect to Postgres and run migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_risk(conn: &mut PgConnection) -> StoreResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(RISK_LOCK_KEY)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn load_snapshot(conn: &mut PgConnection) -> StoreResult<RiskSnapshot> {
        let equity = match sqlx::query("SELECT equity FROM account_state WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await?
        {
            Some(row) => num(&row, "equity")?,
            None => 0.0,
        };

        let positions = sqlx::query(&format!(
            "SELECT {} FROM positions WHERE status = 'OPEN'",
            POSITION_COLUMNS
        ))
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(position_from_row)
        .collect::<StoreResult<Vec<_>>>()?;

        let mut reservations = HashMap::new();
        for row in sqlx::query("SELECT market, direction FROM risk_reservations")
            .fetch_all(&mut *conn)
            .await?
        {
            let market: String = row.try_get("market")?;
            let direction: String = row.try_get("direction")?;
            reservations.insert(market, parsed(&direction, "direction", Direction::parse)?);
        }

        let today = Utc::now().date_naive();
        let realized: Option<Decimal> = sqlx::query_scalar(
            "SELECT SUM(profit_amount) FROM daily_performance WHERE date = $1",
        )
        .bind(today)
        .fetch_one(&mut *conn)
        .await?;
        let realized_today = realized.and_then(|d| d.to_f64()).unwrap_or(0.0);

        Ok(RiskSnapshot::build(
            equity,
            positions.iter(),
            &reservations,
            realized_today,
        ))
    }

    async fn write_position(conn: &mut PgConnection, position: &Position) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, market, entry_price, entry_time, quantity, status,
                profit_target, stop_loss, last_price, current_profit,
                exit_price, exit_time, exit_reason, realized_pnl
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                entry_price = EXCLUDED.entry_price,
                quantity = EXCLUDED.quantity,
                status = EXCLUDED.status,
                profit_target = EXCLUDED.profit_target,
                stop_loss = EXCLUDED.stop_loss,
                last_price = EXCLUDED.last_price,
                current_profit = EXCLUDED.current_profit,
                exit_price = EXCLUDED.exit_price,
                exit_time = EXCLUDED.exit_time,
                exit_reason = EXCLUDED.exit_reason,
                realized_pnl = EXCLUDED.realized_pnl
            "#,
        )
        .bind(position.id)
        .bind(&position.market)
        .bind(position.entry_price)
        .bind(position.entry_time)
        .bind(position.quantity)
        .bind(position.status.as_str())
        .bind(position.profit_target)
        .bind(position.stop_loss)
        .bind(position.last_price)
        .bind(position.current_profit)
        .bind(position.exit_price)
        .bind(position.exit_time)
        .bind(position.exit_reason.map(|r| r.as_str()))
        .bind(position.realized_pnl)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    async fn clear_all(&self) -> StoreResult<()> {
        sqlx::query(
            "TRUNCATE markets, candles, signals, blocked_signals, orders, trades, positions, \
             strategy_configs, account_state, risk_reservations, daily_performance, \
             performance_metrics",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn save_markets(&self, markets: &[Market]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for market in markets {
            sqlx::query(
                r#"
                INSERT INTO markets (market_id, korean_name, english_name, market_type)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (market_id) DO UPDATE SET
                    korean_name = EXCLUDED.korean_name,
                    english_name = EXCLUDED.english_name,
                    market_type = EXCLUDED.market_type,
                    updated_at = NOW()
                "#,
            )
            .bind(&market.market_id)
            .bind(&market.korean_name)
            .bind(&market.english_name)
            .bind(&market.market_type)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!("Saved {} markets to Postgres", markets.len());
        Ok(())
    }

    async fn markets(&self) -> StoreResult<Vec<Market>> {
        let rows = sqlx::query(
            "SELECT market_id, korean_name, english_name, market_type FROM markets ORDER BY market_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Market {
                    market_id: row.try_get("market_id")?,
                    korean_name: row.try_get("korean_name")?,
                    english_name: row.try_get("english_name")?,
                    market_type: row.try_get("market_type")?,
                })
            })
            .collect()
    }

    async fn save_candles(&self, candles: &[Candle]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for candle in candles {
            sqlx::query(
                r#"
                INSERT INTO candles (market, timeframe, ts, open, high, low, close, volume)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (market, timeframe, ts) DO NOTHING
                "#,
            )
            .bind(&candle.market)
            .bind(candle.timeframe.path())
            .bind(candle.timestamp)
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .bind(candle.volume)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn recent_candles(
        &self,
        market: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> StoreResult<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT market, timeframe, ts, open, high, low, close, volume
            FROM candles
            WHERE market = $1 AND timeframe = $2
            ORDER BY ts DESC
            LIMIT $3
            "#,
        )
        .bind(market)
        .bind(timeframe.path())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut candles = rows
            .iter()
            .map(candle_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        candles.reverse();
        Ok(candles)
    }

    async fn save_signal(&self, signal: &Signal) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO signals (
                id, strategy, market, direction, price, confidence,
                parameters, exit_reason, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(signal.id())
        .bind(signal.strategy())
        .bind(signal.market())
        .bind(signal.direction().as_str())
        .bind(signal.price())
        .bind(signal.confidence())
        .bind(Json(signal.parameters()))
        .bind(signal.exit_reason().map(|r| r.as_str()))
        .bind(signal.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn signals(&self, market: Option<&str>, limit: usize) -> StoreResult<Vec<Signal>> {
        let rows = sqlx::query(
            r#"
            SELECT id, strategy, market, direction, price, confidence,
                   parameters, exit_reason, created_at
            FROM signals
            WHERE ($1::TEXT IS NULL OR market = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(market)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(signal_from_row).collect()
    }

    async fn record_blocked(&self, blocked: &BlockedSignal) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO blocked_signals (signal_id, market, direction, reason, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(blocked.signal_id)
        .bind(&blocked.market)
        .bind(blocked.direction.as_str())
        .bind(&blocked.reason)
        .bind(blocked.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn blocked_signals(&self, limit: usize) -> StoreResult<Vec<BlockedSignal>> {
        let rows = sqlx::query(
            r#"
            SELECT signal_id, market, direction, reason, created_at
            FROM blocked_signals
            ORDER BY id DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(blocked_from_row).collect()
    }

    async fn save_order(&self, order: &Order) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                order_id, market, side, order_type, price, volume, executed_volume,
                exchange_status, state, signal_id, failure_reason, created_at, last_updated
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (order_id) DO UPDATE SET
                executed_volume = EXCLUDED.executed_volume,
                exchange_status = EXCLUDED.exchange_status,
                state = EXCLUDED.state,
                failure_reason = EXCLUDED.failure_reason,
                last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(&order.order_id)
        .bind(&order.market)
        .bind(order.side.as_str())
        .bind(order.order_type.as_str())
        .bind(order.price)
        .bind(order.volume)
        .bind(order.executed_volume)
        .bind(order.exchange_status.map(|s| s.as_str()))
        .bind(order.state.as_str())
        .bind(order.signal_id)
        .bind(&order.failure_reason)
        .bind(order.created_at)
        .bind(order.last_updated)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Saved order {} ({})", order.order_id, order.state);
        Ok(())
    }

    async fn replace_order(&self, old_id: &str, order: &Order) -> StoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE orders SET
                order_id = $2,
                executed_volume = $3,
                exchange_status = $4,
                state = $5,
                failure_reason = $6,
                last_updated = $7
            WHERE order_id = $1
            "#,
        )
        .bind(old_id)
        .bind(&order.order_id)
        .bind(order.executed_volume)
        .bind(order.exchange_status.map(|s| s.as_str()))
        .bind(order.state.as_str())
        .bind(&order.failure_reason)
        .bind(order.last_updated)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return self.save_order(order).await;
        }
        tracing::debug!("Order {} is now {}", old_id, order.order_id);
        Ok(())
    }

    async fn order(&self, order_id: &str) -> StoreResult<Option<Order>> {
        sqlx::query(&format!(
            "SELECT {} FROM orders WHERE order_id = $1",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(order_from_row)
        .transpose()
    }

    async fn open_orders(&self) -> StoreResult<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE state NOT IN ('FILLED', 'CANCELED') ORDER BY created_at",
            ORDER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn orders(&self, limit: usize) -> StoreResult<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders ORDER BY created_at DESC LIMIT $1",
            ORDER_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn save_trade(&self, trade: &Trade) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (trade_id, market, order_id, price, volume, side, fee, ts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (trade_id) DO NOTHING
            "#,
        )
        .bind(&trade.trade_id)
        .bind(&trade.market)
        .bind(&trade.order_id)
        .bind(trade.price)
        .bind(trade.volume)
        .bind(trade.side.as_str())
        .bind(trade.fee)
        .bind(trade.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn trades_for_order(&self, order_id: &str) -> StoreResult<Vec<Trade>> {
        let rows = sqlx::query(
            r#"
            SELECT trade_id, market, order_id, price, volume, side, fee, ts
            FROM trades
            WHERE order_id = $1
            ORDER BY ts
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trade_from_row).collect()
    }

    async fn open_position(&self, market: &str) -> StoreResult<Option<Position>> {
        sqlx::query(&format!(
            "SELECT {} FROM positions WHERE market = $1 AND status = 'OPEN'",
            POSITION_COLUMNS
        ))
        .bind(market)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(position_from_row)
        .transpose()
    }

    async fn positions(&self, status: Option<PositionStatus>) -> StoreResult<Vec<Position>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM positions WHERE ($1::TEXT IS NULL OR status = $1) ORDER BY entry_time",
            POSITION_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        let positions = rows
            .iter()
            .map(position_from_row)
            .collect::<StoreResult<Vec<_>>>()?;

        tracing::debug!("Loaded {} positions from Postgres", positions.len());
        Ok(positions)
    }

    async fn update_position_price(
        &self,
        market: &str,
        price: f64,
    ) -> StoreResult<Option<Position>> {
        sqlx::query(&format!(
            r#"
            UPDATE positions
            SET last_price = $2, current_profit = ($2 - entry_price) * quantity
            WHERE market = $1 AND status = 'OPEN'
            RETURNING {}
            "#,
            POSITION_COLUMNS
        ))
        .bind(market)
        .bind(price)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(position_from_row)
        .transpose()
    }

    async fn strategy_config(&self, market: &str) -> StoreResult<Option<StrategyConfig>> {
        sqlx::query(
            r#"
            SELECT market, params, timeframe, profit_target, stop_loss, enabled, tuning
            FROM strategy_configs
            WHERE market = $1
            "#,
        )
        .bind(market)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(config_from_row)
        .transpose()
    }

    async fn strategy_configs(&self) -> StoreResult<Vec<StrategyConfig>> {
        let rows = sqlx::query(
            r#"
            SELECT market, params, timeframe, profit_target, stop_loss, enabled, tuning
            FROM strategy_configs
            ORDER BY market
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(config_from_row).collect()
    }

    async fn upsert_strategy_config(&self, config: &StrategyConfig) -> StoreResult<()> {
        config.validate().map_err(StoreError::Invalid)?;

        sqlx::query(
            r#"
            INSERT INTO strategy_configs (
                market, params, timeframe, profit_target, stop_loss, enabled, tuning
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (market) DO UPDATE SET
                params = EXCLUDED.params,
                timeframe = EXCLUDED.timeframe,
                profit_target = EXCLUDED.profit_target,
                stop_loss = EXCLUDED.stop_loss,
                enabled = EXCLUDED.enabled,
                tuning = EXCLUDED.tuning,
                updated_at = NOW()
            "#,
        )
        .bind(&config.market)
        .bind(Json(&config.params))
        .bind(config.timeframe.path())
        .bind(config.profit_target)
        .bind(config.stop_loss)
        .bind(config.enabled)
        .bind(Json(&config.tuning))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_equity(&self, equity: f64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO account_state (id, equity) VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET equity = EXCLUDED.equity, updated_at = NOW()
            "#,
        )
        .bind(equity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn risk_snapshot(&self) -> StoreResult<RiskSnapshot> {
        let mut conn = self.pool.acquire().await?;
        Self::load_snapshot(&mut conn).await
    }

    async fn reserve_risk(
        &self,
        gate: &RiskGate,
        candidate: &OrderCandidate,
    ) -> StoreResult<RiskDecision> {
        let mut tx = self.pool.begin().await?;
        Self::lock_risk(&mut tx).await?;

        let snapshot = Self::load_snapshot(&mut tx).await?;
        let decision = gate.evaluate(&snapshot, candidate);

        if decision.is_approved() {
            sqlx::query(
                r#"
                INSERT INTO risk_reservations (market, direction) VALUES ($1, $2)
                ON CONFLICT (market) DO UPDATE SET direction = EXCLUDED.direction, created_at = NOW()
                "#,
            )
            .bind(&candidate.market)
            .bind(candidate.direction.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(decision)
    }

    async fn release_reservation(&self, market: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM risk_reservations WHERE market = $1")
            .bind(market)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn apply_fill(&self, fill: &FillEffect) -> StoreResult<Option<Position>> {
        let mut tx = self.pool.begin().await?;
        Self::lock_risk(&mut tx).await?;

        sqlx::query("DELETE FROM risk_reservations WHERE market = $1")
            .bind(&fill.market)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query(&format!(
            "SELECT {} FROM positions WHERE market = $1 AND status = 'OPEN' FOR UPDATE",
            POSITION_COLUMNS
        ))
        .bind(&fill.market)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(position_from_row)
        .transpose()?;

        let outcome = position_manager::apply_fill(existing, fill);

        if let Some(position) = &outcome.position {
            Self::write_position(&mut tx, position).await?;
        }

        if let Some(realized) = outcome.realized {
            let win = i32::from(realized.amount > 0.0);
            sqlx::query(
                r#"
                INSERT INTO daily_performance (
                    date, market, profit_percentage, profit_amount, trade_count, win_count
                )
                VALUES ($1, $2, $3, $4, 1, $5)
                ON CONFLICT (date, market) DO UPDATE SET
                    profit_percentage = daily_performance.profit_percentage + EXCLUDED.profit_percentage,
                    profit_amount = daily_performance.profit_amount + EXCLUDED.profit_amount,
                    trade_count = daily_performance.trade_count + 1,
                    win_count = daily_performance.win_count + EXCLUDED.win_count
                "#,
            )
            .bind(fill.timestamp.date_naive())
            .bind(&fill.market)
            .bind(realized.percentage)
            .bind(realized.amount)
            .bind(win)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(outcome.position)
    }

    async fn daily_performance(&self, date: NaiveDate) -> StoreResult<Vec<DailyPerformance>> {
        let rows = sqlx::query(
            r#"
            SELECT date, market, profit_percentage, profit_amount, trade_count, win_count
            FROM daily_performance
            WHERE date = $1
            ORDER BY market
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(daily_from_row).collect()
    }

    async fn save_performance_metric(&self, metric: &PerformanceMetric) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO performance_metrics (
                strategy_name, market, start_time, end_time, total_trades, winning_trades,
                profit_percentage, max_drawdown, sharpe_ratio
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (strategy_name, market) DO UPDATE SET
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                total_trades = EXCLUDED.total_trades,
                winning_trades = EXCLUDED.winning_trades,
                profit_percentage = EXCLUDED.profit_percentage,
                max_drawdown = EXCLUDED.max_drawdown,
                sharpe_ratio = EXCLUDED.sharpe_ratio
            "#,
        )
        .bind(&metric.strategy_name)
        .bind(&metric.market)
        .bind(metric.start_time)
        .bind(metric.end_time)
        .bind(metric.total_trades as i32)
        .bind(metric.winning_trades as i32)
        .bind(metric.profit_percentage)
        .bind(metric.max_drawdown)
        .bind(metric.sharpe_ratio)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn performance_metrics(&self) -> StoreResult<Vec<PerformanceMetric>> {
        let rows = sqlx::query(
            r#"
            SELECT strategy_name, market, start_time, end_time, total_trades, winning_trades,
                   profit_percentage, max_drawdown, sharpe_ratio
            FROM performance_metrics
            ORDER BY strategy_name, market
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let total: i32 = row.try_get("total_trades")?;
                let winning: i32 = row.try_get("winning_trades")?;
                let start_time: DateTime<Utc> = row.try_get("start_time")?;
                Ok(PerformanceMetric {
                    strategy_name: row.try_get("strategy_name")?,
                    market: row.try_get("market")?,
                    start_time,
                    end_time: row.try_get("end_time")?,
                    total_trades: total.max(0) as usize,
                    winning_trades: winning.max(0) as usize,
                    profit_percentage: row.try_get("profit_percentage")?,
                    max_drawdown: row.try_get("max_drawdown")?,
                    sharpe_ratio: row.try_get("sharpe_ratio")?,
                })
            })
            .collect()
    }
}
