use chrono::{DateTime, Utc};

use crate::error::{is_unique_violation, EngineError};
use crate::types::*;

pub type StoreResult<T> = Result<T, EngineError>;

const POSITION_COLUMNS: &str = "id, user_id, symbol, amount, entry_price, current_price, take_profit, \
     stop_loss, status, exit_price, exit_reason, entry_time, exit_time, profit_loss, \
     primary_order_id, take_profit_order_id, stop_loss_order_id, fill_qty, fill_notional, \
     last_checked_at";

/// Outcome of trying to write a new active position.
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted(Position),
    /// The partial unique index already holds an active row for this pair.
    Conflict,
}

/// Raw `bot_settings` row; validated by the settings resolver.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BotSettingsRow {
    pub timeframe: String,
    pub profit_percentage: f64,
    pub loss_percentage: f64,
    pub confirmation_bars: i64,
    pub trade_amount: f64,
}

/// Persisted trading state: positions, EMA readings, signals, unfilled-order
/// alerts, per-symbol bot state and per-user settings.
///
/// Status changes are conditional updates (`WHERE status = ...`), so a write
/// that lost a race affects zero rows and reports `false`.
#[derive(Clone)]
pub struct PositionStore {
    pub(crate) db_pool: sqlx::AnyPool,
}

impl PositionStore {
    pub fn new(db_pool: sqlx::AnyPool) -> Self {
        Self { db_pool }
    }

    pub fn pool(&self) -> &sqlx::AnyPool {
        &self.db_pool
    }

    /// Create tables and indexes if missing.
    pub async fn init_tables(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                amount REAL NOT NULL,
                entry_price REAL NOT NULL,
                current_price REAL,
                take_profit REAL NOT NULL,
                stop_loss REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                exit_price REAL,
                exit_reason TEXT,
                entry_time TEXT NOT NULL,
                exit_time TEXT,
                profit_loss REAL,
                primary_order_id TEXT,
                take_profit_order_id TEXT,
                stop_loss_order_id TEXT,
                fill_qty REAL,
                fill_notional REAL,
                last_checked_at TEXT
            )",
        )
        .execute(&self.db_pool)
        .await?;

        // At most one active position per (user, symbol)
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_one_active
             ON positions(user_id, symbol) WHERE status IN ('open', 'pending')",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)")
            .execute(&self.db_pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ema_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                period INTEGER NOT NULL,
                value REAL NOT NULL,
                timestamp TEXT NOT NULL
            )",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ema_symbol_period ON ema_readings(symbol, period, timestamp)",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trading_signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                price REAL NOT NULL,
                ema5 REAL NOT NULL,
                ema8 REAL NOT NULL,
                ema22 REAL NOT NULL,
                timestamp TEXT NOT NULL
            )",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS unfilled_order_alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id INTEGER NOT NULL,
                order_id TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                timeout_duration INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(position_id, order_id)
            )",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS bot_state (
                symbol TEXT PRIMARY KEY,
                running INTEGER NOT NULL DEFAULT 1,
                last_run_at TEXT,
                error_message TEXT,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS bot_settings (
                user_id INTEGER PRIMARY KEY,
                timeframe TEXT NOT NULL DEFAULT '5m',
                profit_percentage REAL NOT NULL DEFAULT 2.0,
                loss_percentage REAL NOT NULL DEFAULT 1.0,
                confirmation_bars INTEGER NOT NULL DEFAULT 3,
                trade_amount REAL NOT NULL DEFAULT 1000.0,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tracked_symbols (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(user_id, symbol)
            )",
        )
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Positions
    // -----------------------------------------------------------------------

    /// Insert a position. A unique-index rejection is a lost race, not an error.
    pub async fn insert_position(&self, new: &NewPosition) -> StoreResult<InsertOutcome> {
        let result = sqlx::query_as::<_, (i64,)>(
            "INSERT INTO positions
             (user_id, symbol, amount, entry_price, take_profit, stop_loss, status,
              entry_time, primary_order_id, fill_qty, fill_notional)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(new.user_id)
        .bind(&new.symbol)
        .bind(new.amount)
        .bind(new.entry_price)
        .bind(new.take_profit)
        .bind(new.stop_loss)
        .bind(new.status.as_str())
        .bind(new.entry_time.to_rfc3339())
        .bind(new.primary_order_id.as_deref())
        .bind(new.fill_qty)
        .bind(new.fill_notional)
        .fetch_one(&self.db_pool)
        .await;

        match result {
            Ok((id,)) => {
                let position = self
                    .get_position(id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("position {}", id)))?;
                Ok(InsertOutcome::Inserted(position))
            }
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_position(&self, id: i64) -> StoreResult<Option<Position>> {
        let row: Option<PositionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM positions WHERE id = ?",
            POSITION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await?;
        row.map(PositionRow::into_position).transpose()
    }

    /// The `open` or `pending` position for a pair, if any.
    pub async fn active_position(&self, user_id: i64, symbol: &str) -> StoreResult<Option<Position>> {
        let row: Option<PositionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM positions
             WHERE user_id = ? AND symbol = ? AND status IN ('open', 'pending')
             LIMIT 1",
            POSITION_COLUMNS
        ))
        .bind(user_id)
        .bind(symbol)
        .fetch_optional(&self.db_pool)
        .await?;
        row.map(PositionRow::into_position).transpose()
    }

    /// Every position for a pair, oldest first.
    pub async fn positions_for(&self, user_id: i64, symbol: &str) -> StoreResult<Vec<Position>> {
        let rows: Vec<PositionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM positions WHERE user_id = ? AND symbol = ? ORDER BY id",
            POSITION_COLUMNS
        ))
        .bind(user_id)
        .bind(symbol)
        .fetch_all(&self.db_pool)
        .await?;
        rows.into_iter().map(PositionRow::into_position).collect()
    }

    /// Open positions for a symbol, optionally scoped to one user.
    pub async fn open_positions(&self, symbol: &str, user_id: Option<i64>) -> StoreResult<Vec<Position>> {
        let rows: Vec<PositionRow> = match user_id {
            Some(user_id) => {
                sqlx::query_as(&format!(
                    "SELECT {} FROM positions
                     WHERE symbol = ? AND user_id = ? AND status = 'open' ORDER BY id",
                    POSITION_COLUMNS
                ))
                .bind(symbol)
                .bind(user_id)
                .fetch_all(&self.db_pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {} FROM positions WHERE symbol = ? AND status = 'open' ORDER BY id",
                    POSITION_COLUMNS
                ))
                .bind(symbol)
                .fetch_all(&self.db_pool)
                .await?
            }
        };
        rows.into_iter().map(PositionRow::into_position).collect()
    }

    /// Symbols with at least one open position, for any user.
    pub async fn open_symbols(&self) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT symbol FROM positions WHERE status = 'open' ORDER BY symbol",
        )
        .fetch_all(&self.db_pool)
        .await?;
        Ok(rows.into_iter().map(|(symbol,)| symbol).collect())
    }

    pub async fn pending_positions(&self) -> StoreResult<Vec<Position>> {
        let rows: Vec<PositionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM positions WHERE status = 'pending' ORDER BY id",
            POSITION_COLUMNS
        ))
        .fetch_all(&self.db_pool)
        .await?;
        rows.into_iter().map(PositionRow::into_position).collect()
    }

    /// `pending -> open` with the broker's fill data. `false` if the position
    /// was no longer pending.
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_filled(
        &self,
        id: i64,
        entry_price: f64,
        fill_qty: f64,
        fill_notional: f64,
        take_profit: f64,
        stop_loss: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE positions
             SET status = 'open', entry_price = ?, fill_qty = ?, fill_notional = ?,
                 take_profit = ?, stop_loss = ?, last_checked_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(entry_price)
        .bind(fill_qty)
        .bind(fill_notional)
        .bind(take_profit)
        .bind(stop_loss)
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.db_pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// `pending -> cancelled`.
    pub async fn mark_cancelled(&self, id: i64, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE positions SET status = 'cancelled', last_checked_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.db_pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Any active state `-> error`.
    pub async fn mark_error(&self, id: i64, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE positions SET status = 'error', last_checked_at = ?
             WHERE id = ? AND status IN ('open', 'pending')",
        )
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.db_pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record the reconciler's visit without changing anything else.
    pub async fn touch_checked(&self, id: i64, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE positions SET last_checked_at = ? WHERE id = ?")
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    /// Store safety order IDs. IDs already set are kept.
    pub async fn set_safety_orders(
        &self,
        id: i64,
        take_profit_order_id: Option<&str>,
        stop_loss_order_id: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE positions
             SET take_profit_order_id = COALESCE(take_profit_order_id, ?),
                 stop_loss_order_id = COALESCE(stop_loss_order_id, ?)
             WHERE id = ?",
        )
        .bind(take_profit_order_id)
        .bind(stop_loss_order_id)
        .bind(id)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    pub async fn update_current_price(&self, id: i64, price: f64) -> StoreResult<()> {
        sqlx::query("UPDATE positions SET current_price = ? WHERE id = ?")
            .bind(price)
            .bind(id)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    /// `open -> closed_profit | closed_loss`. Returns the closed position, or
    /// `None` when it was no longer open.
    pub async fn close_position(
        &self,
        id: i64,
        fill: ExitFill,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Position>> {
        let result = sqlx::query(
            "UPDATE positions
             SET status = ?, exit_price = ?, exit_reason = ?, exit_time = ?,
                 profit_loss = ?, current_price = ?
             WHERE id = ? AND status = 'open'",
        )
        .bind(fill.status.as_str())
        .bind(fill.exit_price)
        .bind(reason.as_str())
        .bind(now.to_rfc3339())
        .bind(fill.profit_loss)
        .bind(fill.exit_price)
        .bind(id)
        .execute(&self.db_pool)
        .await?;

        if result.rows_affected() != 1 {
            return Ok(None);
        }
        self.get_position(id).await
    }

    // -----------------------------------------------------------------------
    // EMA readings and signals
    // -----------------------------------------------------------------------

    /// Append one reading per period, all with the same timestamp.
    pub async fn record_ema_readings(
        &self,
        symbol: &str,
        readings: &[(usize, f64)],
        timestamp: DateTime<Utc>,
    ) -> StoreResult<()> {
        let ts = timestamp.to_rfc3339();
        let mut tx = self.db_pool.begin().await?;
        for (period, value) in readings {
            sqlx::query(
                "INSERT INTO ema_readings (symbol, period, value, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(symbol)
            .bind(*period as i64)
            .bind(*value)
            .bind(&ts)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Most recent readings for one period, oldest first.
    pub async fn recent_ema_readings(
        &self,
        symbol: &str,
        period: usize,
        limit: usize,
    ) -> StoreResult<Vec<EmaReading>> {
        let rows: Vec<(String, i64, f64, String)> = sqlx::query_as(
            "SELECT symbol, period, value, timestamp FROM ema_readings
             WHERE symbol = ? AND period = ?
             ORDER BY id DESC LIMIT ?",
        )
        .bind(symbol)
        .bind(period as i64)
        .bind(limit as i64)
        .fetch_all(&self.db_pool)
        .await?;

        let mut readings = rows
            .into_iter()
            .map(|(symbol, period, value, ts)| {
                Ok(EmaReading {
                    symbol,
                    period,
                    value,
                    timestamp: parse_ts(&ts)?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        readings.reverse();
        Ok(readings)
    }

    pub async fn record_signal(&self, signal: &TradingSignal) -> StoreResult<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO trading_signals
             (user_id, symbol, signal_type, price, ema5, ema8, ema22, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(signal.user_id)
        .bind(&signal.symbol)
        .bind(signal.signal_type.as_str())
        .bind(signal.price)
        .bind(signal.ema5)
        .bind(signal.ema8)
        .bind(signal.ema22)
        .bind(signal.timestamp.to_rfc3339())
        .fetch_one(&self.db_pool)
        .await?;
        Ok(id)
    }

    pub async fn signals_for(&self, symbol: &str) -> StoreResult<Vec<TradingSignal>> {
        let rows: Vec<(i64, i64, String, String, f64, f64, f64, f64, String)> = sqlx::query_as(
            "SELECT id, user_id, symbol, signal_type, price, ema5, ema8, ema22, timestamp
             FROM trading_signals WHERE symbol = ? ORDER BY id",
        )
        .bind(symbol)
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(|(id, user_id, symbol, kind, price, ema5, ema8, ema22, ts)| {
                Ok(TradingSignal {
                    id: Some(id),
                    user_id,
                    symbol,
                    signal_type: if kind == "sell" {
                        SignalType::Sell
                    } else {
                        SignalType::Buy
                    },
                    price,
                    ema5,
                    ema8,
                    ema22,
                    timestamp: parse_ts(&ts)?,
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Unfilled-order alerts
    // -----------------------------------------------------------------------

    /// Insert an alert unless one already exists for `(position, order)`.
    /// Returns the new alert, or `None` if it was a duplicate.
    pub async fn insert_unfilled_alert(
        &self,
        position: &Position,
        order_id: &str,
        timeout_duration: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UnfilledOrderAlert>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO unfilled_order_alerts
             (position_id, order_id, user_id, symbol, timeout_duration, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(position_id, order_id) DO NOTHING
             RETURNING id",
        )
        .bind(position.id)
        .bind(order_id)
        .bind(position.user_id)
        .bind(&position.symbol)
        .bind(timeout_duration)
        .bind(now.to_rfc3339())
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(row.map(|(id,)| UnfilledOrderAlert {
            id,
            position_id: position.id,
            order_id: order_id.to_string(),
            user_id: position.user_id,
            symbol: position.symbol.clone(),
            timeout_duration,
            created_at: now,
        }))
    }

    pub async fn unfilled_alerts(&self) -> StoreResult<Vec<UnfilledOrderAlert>> {
        let rows: Vec<(i64, i64, String, i64, String, i64, String)> = sqlx::query_as(
            "SELECT id, position_id, order_id, user_id, symbol, timeout_duration, created_at
             FROM unfilled_order_alerts ORDER BY id",
        )
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(|(id, position_id, order_id, user_id, symbol, timeout_duration, ts)| {
                Ok(UnfilledOrderAlert {
                    id,
                    position_id,
                    order_id,
                    user_id,
                    symbol,
                    timeout_duration,
                    created_at: parse_ts(&ts)?,
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Bot state, settings, tracked symbols
    // -----------------------------------------------------------------------

    pub async fn bot_state(&self, symbol: &str) -> StoreResult<Option<BotState>> {
        let row: Option<(String, i64, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT symbol, running, last_run_at, error_message FROM bot_state WHERE symbol = ?",
        )
        .bind(symbol)
        .fetch_optional(&self.db_pool)
        .await?;

        row.map(|(symbol, running, last_run_at, error_message)| {
            Ok(BotState {
                symbol,
                running: running != 0,
                last_run_at: last_run_at.as_deref().map(parse_ts).transpose()?,
                error_message,
            })
        })
        .transpose()
    }

    pub async fn set_running(&self, symbol: &str, running: bool, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO bot_state (symbol, running, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(symbol) DO UPDATE SET running = excluded.running, updated_at = excluded.updated_at",
        )
        .bind(symbol)
        .bind(running as i64)
        .bind(now.to_rfc3339())
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    /// Last-write-wins bookkeeping after a scheduler pass over `symbol`.
    pub async fn record_run(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO bot_state (symbol, running, last_run_at, error_message, updated_at)
             VALUES (?, 1, ?, ?, ?)
             ON CONFLICT(symbol) DO UPDATE SET
                last_run_at = excluded.last_run_at,
                error_message = excluded.error_message,
                updated_at = excluded.updated_at",
        )
        .bind(symbol)
        .bind(now.to_rfc3339())
        .bind(error_message)
        .bind(now.to_rfc3339())
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    pub async fn bot_settings(&self, user_id: i64) -> StoreResult<Option<BotSettingsRow>> {
        let row: Option<BotSettingsRow> = sqlx::query_as(
            "SELECT timeframe, profit_percentage, loss_percentage, confirmation_bars, trade_amount
             FROM bot_settings WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.db_pool)
        .await?;
        Ok(row)
    }

    pub async fn save_bot_settings(
        &self,
        user_id: i64,
        settings: &BotSettingsRow,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO bot_settings
             (user_id, timeframe, profit_percentage, loss_percentage, confirmation_bars, trade_amount, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                timeframe = excluded.timeframe,
                profit_percentage = excluded.profit_percentage,
                loss_percentage = excluded.loss_percentage,
                confirmation_bars = excluded.confirmation_bars,
                trade_amount = excluded.trade_amount,
                updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(&settings.timeframe)
        .bind(settings.profit_percentage)
        .bind(settings.loss_percentage)
        .bind(settings.confirmation_bars)
        .bind(settings.trade_amount)
        .bind(now.to_rfc3339())
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    pub async fn track_symbol(&self, user_id: i64, symbol: &str, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO tracked_symbols (user_id, symbol, created_at) VALUES (?, ?, ?)
             ON CONFLICT(user_id, symbol) DO NOTHING",
        )
        .bind(user_id)
        .bind(symbol)
        .bind(now.to_rfc3339())
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    /// Every `(user_id, symbol)` pair being tracked.
    pub async fn tracked_pairs(&self) -> StoreResult<Vec<(i64, String)>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT user_id, symbol FROM tracked_symbols ORDER BY symbol, user_id")
                .fetch_all(&self.db_pool)
                .await?;
        Ok(rows)
    }
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Validation(format!("bad timestamp '{}': {}", s, e)))
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct PositionRow {
    id: i64,
    user_id: i64,
    symbol: String,
    amount: f64,
    entry_price: f64,
    current_price: Option<f64>,
    take_profit: f64,
    stop_loss: f64,
    status: String,
    exit_price: Option<f64>,
    exit_reason: Option<String>,
    entry_time: String,
    exit_time: Option<String>,
    profit_loss: Option<f64>,
    primary_order_id: Option<String>,
    take_profit_order_id: Option<String>,
    stop_loss_order_id: Option<String>,
    fill_qty: Option<f64>,
    fill_notional: Option<f64>,
    last_checked_at: Option<String>,
}

impl PositionRow {
    fn into_position(self) -> StoreResult<Position> {
        Ok(Position {
            id: self.id,
            user_id: self.user_id,
            symbol: self.symbol,
            amount: self.amount,
            entry_price: self.entry_price,
            current_price: self.current_price,
            take_profit: self.take_profit,
            stop_loss: self.stop_loss,
            status: self.status.parse::<PositionStatus>().map_err(EngineError::Validation)?,
            exit_price: self.exit_price,
            exit_reason: self
                .exit_reason
                .map(|r| r.parse::<ExitReason>())
                .transpose()
                .map_err(EngineError::Validation)?,
            entry_time: parse_ts(&self.entry_time)?,
            exit_time: self.exit_time.as_deref().map(parse_ts).transpose()?,
            profit_loss: self.profit_loss,
            primary_order_id: self.primary_order_id,
            take_profit_order_id: self.take_profit_order_id,
            stop_loss_order_id: self.stop_loss_order_id,
            fill_qty: self.fill_qty,
            fill_notional: self.fill_notional,
            last_checked_at: self.last_checked_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

#[cfg(test)]
pub(crate) async fn memory_store() -> PositionStore {
    sqlx::any::install_default_drivers();
    let pool = sqlx::any::AnyPoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory SQLite");
    let store = PositionStore::new(pool);
    store.init_tables().await.expect("schema");
    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 15, 0, 0).unwrap()
    }

    fn pending(user_id: i64, symbol: &str) -> NewPosition {
        NewPosition {
            user_id,
            symbol: symbol.to_string(),
            amount: 1000.0,
            entry_price: 100.0,
            take_profit: 102.0,
            stop_loss: 99.0,
            status: PositionStatus::Pending,
            entry_time: t0(),
            primary_order_id: Some("ord-1".to_string()),
            fill_qty: None,
            fill_notional: None,
        }
    }

    async fn inserted(store: &PositionStore, new: &NewPosition) -> Position {
        match store.insert_position(new).await.unwrap() {
            InsertOutcome::Inserted(p) => p,
            InsertOutcome::Conflict => panic!("unexpected conflict"),
        }
    }

    #[tokio::test]
    async fn second_active_position_conflicts() {
        let store = memory_store().await;
        let first = inserted(&store, &pending(1, "AAPL")).await;
        assert_eq!(first.status, PositionStatus::Pending);
        assert_eq!(first.entry_time, t0());

        assert!(matches!(
            store.insert_position(&pending(1, "AAPL")).await.unwrap(),
            InsertOutcome::Conflict
        ));

        // Other users and other symbols are independent
        inserted(&store, &pending(2, "AAPL")).await;
        inserted(&store, &pending(1, "MSFT")).await;
    }

    #[tokio::test]
    async fn terminal_positions_free_the_slot() {
        let store = memory_store().await;
        let first = inserted(&store, &pending(1, "AAPL")).await;
        assert!(store.mark_cancelled(first.id, t0()).await.unwrap());

        let second = inserted(&store, &pending(1, "AAPL")).await;
        assert_ne!(first.id, second.id);
        assert_eq!(store.positions_for(1, "AAPL").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn transitions_are_conditional() {
        let store = memory_store().await;
        let p = inserted(&store, &pending(1, "AAPL")).await;

        assert!(store
            .mark_filled(p.id, 100.5, 9.95, 1000.0, 102.51, 99.495, t0())
            .await
            .unwrap());
        // Already open: a second fill or a cancel changes nothing
        assert!(!store
            .mark_filled(p.id, 101.0, 9.9, 1000.0, 103.0, 100.0, t0())
            .await
            .unwrap());
        assert!(!store.mark_cancelled(p.id, t0()).await.unwrap());

        let open = store.get_position(p.id).await.unwrap().unwrap();
        assert_eq!(open.status, PositionStatus::Open);
        assert_eq!(open.entry_price, 100.5);
        assert_eq!(open.fill_qty, Some(9.95));

        let fill = ExitFill::compute(open.entry_price, open.amount, 103.0);
        let closed = store
            .close_position(p.id, fill, ExitReason::TakeProfit, t0() + Duration::minutes(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.status, PositionStatus::ClosedProfit);
        assert_eq!(closed.exit_reason, Some(ExitReason::TakeProfit));
        assert!(store
            .close_position(p.id, fill, ExitReason::TakeProfit, t0())
            .await
            .unwrap()
            .is_none());
        assert!(!store.mark_error(p.id, t0()).await.unwrap());
    }

    #[tokio::test]
    async fn safety_order_ids_are_set_once() {
        let store = memory_store().await;
        let p = inserted(&store, &pending(1, "AAPL")).await;
        store.set_safety_orders(p.id, Some("tp-1"), Some("sl-1")).await.unwrap();
        store.set_safety_orders(p.id, Some("tp-2"), None).await.unwrap();
        let p = store.get_position(p.id).await.unwrap().unwrap();
        assert_eq!(p.take_profit_order_id.as_deref(), Some("tp-1"));
        assert_eq!(p.stop_loss_order_id.as_deref(), Some("sl-1"));
    }

    #[tokio::test]
    async fn unfilled_alert_is_unique_per_order() {
        let store = memory_store().await;
        let p = inserted(&store, &pending(1, "AAPL")).await;
        assert!(store.insert_unfilled_alert(&p, "ord-1", 120, t0()).await.unwrap().is_some());
        assert!(store.insert_unfilled_alert(&p, "ord-1", 180, t0()).await.unwrap().is_none());
        assert_eq!(store.unfilled_alerts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ema_readings_come_back_oldest_first() {
        let store = memory_store().await;
        store
            .record_ema_readings("AAPL", &[(5, 1.0), (8, 2.0), (22, 3.0)], t0())
            .await
            .unwrap();
        store
            .record_ema_readings("AAPL", &[(5, 1.5), (8, 2.5), (22, 3.5)], t0() + Duration::minutes(5))
            .await
            .unwrap();

        let fives = store.recent_ema_readings("AAPL", 5, 10).await.unwrap();
        assert_eq!(fives.iter().map(|r| r.value).collect::<Vec<_>>(), vec![1.0, 1.5]);
        assert_eq!(store.recent_ema_readings("AAPL", 22, 1).await.unwrap()[0].value, 3.5);
    }

    #[tokio::test]
    async fn bot_state_last_write_wins() {
        let store = memory_store().await;
        assert!(store.bot_state("AAPL").await.unwrap().is_none());

        store.record_run("AAPL", t0(), Some("feed down")).await.unwrap();
        store.set_running("AAPL", false, t0()).await.unwrap();
        store.record_run("AAPL", t0() + Duration::minutes(1), None).await.unwrap();

        let state = store.bot_state("AAPL").await.unwrap().unwrap();
        assert!(!state.running);
        assert_eq!(state.last_run_at, Some(t0() + Duration::minutes(1)));
        assert_eq!(state.error_message, None);
    }

    #[tokio::test]
    async fn open_symbols_span_users_and_skip_pending() {
        let store = memory_store().await;
        let mut open = pending(1, "MSFT");
        open.status = PositionStatus::Open;
        inserted(&store, &open).await;
        open.user_id = 2;
        inserted(&store, &open).await;
        inserted(&store, &pending(1, "AAPL")).await;

        assert_eq!(store.open_symbols().await.unwrap(), vec!["MSFT".to_string()]);
    }

    #[tokio::test]
    async fn tracked_pairs_are_deduplicated() {
        let store = memory_store().await;
        store.track_symbol(1, "MSFT", t0()).await.unwrap();
        store.track_symbol(1, "AAPL", t0()).await.unwrap();
        store.track_symbol(1, "AAPL", t0()).await.unwrap();
        assert_eq!(
            store.tracked_pairs().await.unwrap(),
            vec![(1, "AAPL".to_string()), (1, "MSFT".to_string())]
        );
    }
}
