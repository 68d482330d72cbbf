use std::sync::Arc;
use std::time::Duration;

use broker_trait::{is_not_found, BrokerClient, BrokerOrder, FillState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use market_data::{Sleeper, TokioSleeper};
use notification_service::{Notification, NotificationKind, NotificationService};
use tokio::task::JoinHandle;
use trading_core::{Clock, SystemClock};

use crate::error::EngineError;
use crate::orders::place_safety_orders;
use crate::store::PositionStore;
use crate::types::{Position, PositionStatus, UnfilledOrderAlert};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_UNFILLED_TIMEOUT_SECS: i64 = 120;
const DEFAULT_MISSING_ORDER_LIMIT: u32 = 5;

/// What one reconciliation poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStep {
    /// Promoted `pending -> open` and placed the safety orders
    Filled,
    Cancelled,
    StillPending,
    /// Broker query failed; the position was not touched
    QueryFailed,
    /// The broker does not know the order ID
    OrderMissing,
    /// Position was no longer pending (another writer got there first)
    Settled,
}

impl ReconcileStep {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ReconcileStep::Filled | ReconcileStep::Cancelled | ReconcileStep::Settled
        )
    }
}

/// Watches pending entries until the broker reports them filled or dead,
/// and sweeps for entries that have stayed unfilled too long.
#[derive(Clone)]
pub struct OrderReconciler {
    store: PositionStore,
    broker: Arc<dyn BrokerClient>,
    notifier: NotificationService,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    poll_interval: Duration,
    unfilled_timeout: chrono::Duration,
    /// Consecutive `OrderMissing` polls before the position is marked `error`
    missing_order_limit: u32,
    /// position_id -> order_id for every live watcher
    watching: Arc<DashMap<i64, String>>,
}

impl OrderReconciler {
    pub fn new(
        store: PositionStore,
        broker: Arc<dyn BrokerClient>,
        notifier: NotificationService,
    ) -> Self {
        Self {
            store,
            broker,
            notifier,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            poll_interval: DEFAULT_POLL_INTERVAL,
            unfilled_timeout: chrono::Duration::seconds(DEFAULT_UNFILLED_TIMEOUT_SECS),
            missing_order_limit: DEFAULT_MISSING_ORDER_LIMIT,
            watching: Arc::new(DashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_unfilled_timeout(mut self, timeout: chrono::Duration) -> Self {
        self.unfilled_timeout = timeout;
        self
    }

    pub fn with_missing_order_limit(mut self, limit: u32) -> Self {
        self.missing_order_limit = limit.max(1);
        self
    }

    pub fn is_watching(&self, position_id: i64) -> bool {
        self.watching.contains_key(&position_id)
    }

    pub fn watch_count(&self) -> usize {
        self.watching.len()
    }

    /// Poll the broker once for `order_id` and apply the result to the
    /// position.
    pub async fn check_once(
        &self,
        position_id: i64,
        order_id: &str,
    ) -> Result<ReconcileStep, EngineError> {
        let position = self
            .store
            .get_position(position_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("position {}", position_id)))?;
        if !position.status.can_transition_to(PositionStatus::Open) {
            return Ok(ReconcileStep::Settled);
        }

        let order = match self.broker.get_order(order_id).await {
            Ok(order) => order,
            Err(e) if is_not_found(&e) => {
                tracing::warn!(position_id, order_id = %order_id, "Broker has no such order: {:#}", e);
                return Ok(ReconcileStep::OrderMissing);
            }
            Err(e) => {
                tracing::warn!(
                    position_id,
                    order_id = %order_id,
                    "Order status query failed, will retry: {:#}",
                    e
                );
                return Ok(ReconcileStep::QueryFailed);
            }
        };

        let now = self.clock.now();
        match order.fill_state() {
            FillState::Filled if order.is_filled() => self.promote(&position, &order).await,
            FillState::Filled => {
                tracing::warn!(
                    position_id,
                    order_id = %order_id,
                    "Order reported filled without fill price/qty yet"
                );
                self.store.touch_checked(position_id, now).await?;
                Ok(ReconcileStep::StillPending)
            }
            FillState::Dead => {
                if self.store.mark_cancelled(position_id, now).await? {
                    tracing::info!(
                        position_id,
                        order_id = %order_id,
                        "Entry order {} for {}, position cancelled",
                        order.status,
                        position.symbol
                    );
                    self.notifier.notify(
                        Notification::new(
                            NotificationKind::OrderCancelled,
                            format!("Buy order for {} was {}", position.symbol, order.status),
                        )
                        .for_symbol(&position.symbol)
                        .for_user(position.user_id),
                    );
                    Ok(ReconcileStep::Cancelled)
                } else {
                    Ok(ReconcileStep::Settled)
                }
            }
            FillState::Working => {
                tracing::debug!(position_id, order_id = %order_id, "Order still {}", order.status);
                self.store.touch_checked(position_id, now).await?;
                Ok(ReconcileStep::StillPending)
            }
        }
    }

    /// `pending -> open` with the broker's fill, then the deferred safety
    /// orders. Only the caller whose conditional update wins places them.
    async fn promote(
        &self,
        position: &Position,
        order: &BrokerOrder,
    ) -> Result<ReconcileStep, EngineError> {
        let (Some(fill_price), Some(fill_qty)) =
            (order.filled_avg_price_f64(), order.filled_quantity_f64())
        else {
            return Ok(ReconcileStep::StillPending);
        };
        let fill_notional = fill_price * fill_qty;

        // Keep the distances chosen at signal time, re-anchored on the fill.
        let (take_profit, stop_loss) = if position.entry_price > 0.0 {
            (
                fill_price * position.take_profit / position.entry_price,
                fill_price * position.stop_loss / position.entry_price,
            )
        } else {
            (position.take_profit, position.stop_loss)
        };

        let won = self
            .store
            .mark_filled(
                position.id,
                fill_price,
                fill_qty,
                fill_notional,
                take_profit,
                stop_loss,
                self.clock.now(),
            )
            .await?;
        if !won {
            return Ok(ReconcileStep::Settled);
        }

        tracing::info!(
            position_id = position.id,
            order_id = %order.id,
            "Entry filled: {} x{:.4} @ ${:.2}",
            position.symbol,
            fill_qty,
            fill_price
        );

        let safety = place_safety_orders(
            self.broker.as_ref(),
            &position.symbol,
            fill_qty,
            take_profit,
            stop_loss,
        )
        .await;
        self.store
            .set_safety_orders(
                position.id,
                safety.take_profit_order_id.as_deref(),
                safety.stop_loss_order_id.as_deref(),
            )
            .await?;

        self.notifier.notify(
            Notification::new(
                NotificationKind::PositionOpened,
                format!(
                    "Bought {:.4} {} @ ${:.2} (TP ${:.2} / SL ${:.2})",
                    fill_qty, position.symbol, fill_price, take_profit, stop_loss
                ),
            )
            .for_symbol(&position.symbol)
            .for_user(position.user_id),
        );
        Ok(ReconcileStep::Filled)
    }

    /// Poll every `poll_interval` until the position settles. Query failures
    /// and database hiccups keep the loop alive; an order the broker keeps
    /// reporting as unknown moves the position to `error`.
    pub async fn watch(&self, position_id: i64, order_id: String) {
        let mut missing = 0;
        loop {
            self.sleeper.sleep(self.poll_interval).await;
            match self.check_once(position_id, &order_id).await {
                Ok(step) if step.is_final() => break,
                Ok(ReconcileStep::OrderMissing) => {
                    missing += 1;
                    if missing < self.missing_order_limit {
                        continue;
                    }
                    match self.give_up(position_id, &order_id).await {
                        Ok(_) => break,
                        Err(e) => tracing::warn!(
                            position_id,
                            order_id = %order_id,
                            "Could not mark position as error: {}",
                            e
                        ),
                    }
                }
                Ok(_) => missing = 0,
                Err(EngineError::NotFound(_)) => {
                    tracing::warn!(position_id, order_id = %order_id, "Position vanished, stopping watch");
                    break;
                }
                Err(e) => {
                    tracing::warn!(position_id, order_id = %order_id, "Reconcile step failed: {}", e);
                }
            }
        }
        self.watching.remove(&position_id);
    }

    /// `pending -> error` for an entry whose order cannot be found. Returns
    /// whether this call made the transition.
    async fn give_up(&self, position_id: i64, order_id: &str) -> Result<bool, EngineError> {
        if !self.store.mark_error(position_id, self.clock.now()).await? {
            return Ok(false);
        }
        let Some(position) = self.store.get_position(position_id).await? else {
            return Ok(true);
        };
        tracing::error!(
            position_id,
            order_id = %order_id,
            "Order unknown to the broker after {} checks, position {} marked error",
            self.missing_order_limit,
            position.symbol
        );
        self.notifier.notify(
            Notification::new(
                NotificationKind::Error,
                format!(
                    "Buy order {} for {} is unknown to the broker; position needs attention",
                    order_id, position.symbol
                ),
            )
            .for_symbol(&position.symbol)
            .for_user(position.user_id)
            .persistent(),
        );
        Ok(true)
    }

    /// Start a watcher on its own task unless one already runs for this
    /// position.
    pub fn spawn_watch(&self, position_id: i64, order_id: String) -> Option<JoinHandle<()>> {
        match self.watching.entry(position_id) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                slot.insert(order_id.clone());
            }
        }

        let reconciler = self.clone();
        Some(tokio::spawn(async move {
            reconciler.watch(position_id, order_id).await;
        }))
    }

    /// Re-attach watchers to every pending position, e.g. after a restart.
    pub async fn resume_pending(&self) -> Result<usize, EngineError> {
        let mut resumed = 0;
        for position in self.store.pending_positions().await? {
            match position.primary_order_id {
                Some(order_id) => {
                    if self.spawn_watch(position.id, order_id).is_some() {
                        resumed += 1;
                    }
                }
                None => tracing::warn!(
                    position_id = position.id,
                    "Pending position for {} has no order id, nothing to reconcile",
                    position.symbol
                ),
            }
        }
        if resumed > 0 {
            tracing::info!("Resumed reconciliation for {} pending position(s)", resumed);
        }
        Ok(resumed)
    }

    /// Raise one alert per pending entry that has been unfilled for at least
    /// the timeout. Returns only alerts created by this sweep.
    pub async fn sweep_unfilled(&self) -> Result<Vec<UnfilledOrderAlert>, EngineError> {
        let now = self.clock.now();
        let mut raised = Vec::new();

        for position in self.store.pending_positions().await? {
            let Some(order_id) = position.primary_order_id.as_deref() else {
                continue;
            };
            let elapsed = now - position.entry_time;
            if elapsed < self.unfilled_timeout {
                continue;
            }

            let Some(alert) = self
                .store
                .insert_unfilled_alert(&position, order_id, elapsed.num_seconds(), now)
                .await?
            else {
                continue;
            };

            tracing::warn!(
                position_id = position.id,
                order_id = %order_id,
                "Buy order for {} unfilled after {}s",
                position.symbol,
                alert.timeout_duration
            );
            self.notifier.notify(
                Notification::new(
                    NotificationKind::UnfilledOrder,
                    format!(
                        "Buy order for {} has not filled after {}s",
                        position.symbol, alert.timeout_duration
                    ),
                )
                .for_symbol(&position.symbol)
                .for_user(position.user_id)
                .persistent(),
            );
            raised.push(alert);
        }

        Ok(raised)
    }
}
