use std::collections::HashSet;
use std::sync::Arc;

use broker_trait::{BrokerClient, NotionalOrderRequest};
use dashmap::DashMap;
use market_data::MarketDataFetcher;
use notification_service::{Notification, NotificationKind, NotificationService};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use technical_analysis::{confirmed_above, is_uptrend, StrategyEmas, FAST_PERIOD, MID_PERIOD, SLOW_PERIOD};
use tokio::sync::{Mutex, Semaphore};
use trading_core::{Clock, FetchError, MarketClosedReason, SystemClock};

use crate::error::EngineError;
use crate::exit_monitor::ExitMonitor;
use crate::orders::place_safety_orders;
use crate::reconciler::OrderReconciler;
use crate::settings::{SettingsResolver, TradingSettings};
use crate::store::{InsertOutcome, PositionStore};
use crate::types::{NewPosition, Position, PositionStatus, SignalType, TradingSignal};

const DEFAULT_MAX_CONCURRENT_CYCLES: usize = 8;

/// Why a cycle stopped before signal detection.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// `bot_state.running` is false for the symbol
    Paused,
    MarketClosed(MarketClosedReason),
    FeedUnavailable { attempts: u32 },
    InsufficientHistory { bars: usize },
}

/// Result of the buy path for one `(user, symbol)`.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Created(Position),
    /// The recheck under the slot lock found an active position
    AlreadyActive { existing_id: i64 },
    /// The unique index rejected our row; another writer holds the slot
    LostRace { existing_id: Option<i64> },
    Failed(EngineError),
}

#[derive(Debug)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    NoSignal { exits_closed: usize },
    Executed(ExecutionOutcome),
    /// Signal recorded, buy path handed to its own task
    Dispatched,
}

impl CycleOutcome {
    /// A confirmed buy signal fired this cycle.
    pub fn ran_signal(&self) -> bool {
        matches!(self, CycleOutcome::Executed(_) | CycleOutcome::Dispatched)
    }
}

/// Tally of one batch of cycles.
#[derive(Debug, Default, Clone)]
pub struct BatchReport {
    pub attempted: usize,
    pub signals: usize,
    pub positions_created: usize,
    pub skipped: usize,
    pub failed: usize,
    /// `(user_id, symbol, error)` for every pair that failed
    pub errors: Vec<(i64, String, String)>,
}

/// Drives one poll for a `(user, symbol)`: fetch, EMAs, signal, and the
/// buy path under an exclusive per-pair lock.
#[derive(Clone)]
pub struct TradeCoordinator {
    store: PositionStore,
    fetcher: MarketDataFetcher,
    resolver: SettingsResolver,
    broker: Arc<dyn BrokerClient>,
    reconciler: OrderReconciler,
    exit_monitor: ExitMonitor,
    notifier: NotificationService,
    clock: Arc<dyn Clock>,
    /// One entry per `(user, symbol)` that has traded; pruned by the
    /// scheduler when a pair stops being tracked.
    slot_locks: Arc<DashMap<(i64, String), Arc<Mutex<()>>>>,
    async_execution: bool,
    max_concurrent_cycles: usize,
}

impl TradeCoordinator {
    pub fn new(
        store: PositionStore,
        fetcher: MarketDataFetcher,
        broker: Arc<dyn BrokerClient>,
        reconciler: OrderReconciler,
        exit_monitor: ExitMonitor,
        notifier: NotificationService,
    ) -> Self {
        Self {
            resolver: SettingsResolver::new(store.clone()),
            store,
            fetcher,
            broker,
            reconciler,
            exit_monitor,
            notifier,
            clock: Arc::new(SystemClock),
            slot_locks: Arc::new(DashMap::new()),
            async_execution: false,
            max_concurrent_cycles: DEFAULT_MAX_CONCURRENT_CYCLES,
        }
    }

    pub fn with_resolver(mut self, resolver: SettingsResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_async_execution(mut self, enabled: bool) -> Self {
        self.async_execution = enabled;
        self
    }

    pub fn with_max_concurrent_cycles(mut self, max: usize) -> Self {
        self.max_concurrent_cycles = max.max(1);
        self
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    pub fn reconciler(&self) -> &OrderReconciler {
        &self.reconciler
    }

    pub fn exit_monitor(&self) -> &ExitMonitor {
        &self.exit_monitor
    }

    /// Drop slot locks for pairs outside `tracked`. A lock that is held or
    /// awaited right now is kept.
    pub fn prune_slot_locks(&self, tracked: &[(i64, String)]) {
        let live: HashSet<&(i64, String)> = tracked.iter().collect();
        self.slot_locks
            .retain(|key, lock| live.contains(key) || Arc::strong_count(lock) > 1);
    }

    pub fn slot_lock_count(&self) -> usize {
        self.slot_locks.len()
    }

    /// One poll for `(user_id, symbol)`.
    ///
    /// Market-closed and exhausted-feed conditions are reported as
    /// `Skipped`, not errors. Settings, database and non-retryable feed
    /// failures are `Err` and abort this pair only.
    pub async fn run_cycle(&self, symbol: &str, user_id: i64) -> Result<CycleOutcome, EngineError> {
        if let Some(state) = self.store.bot_state(symbol).await? {
            if !state.running {
                tracing::debug!(symbol = %symbol, user_id, "Bot paused, skipping cycle");
                return Ok(CycleOutcome::Skipped(SkipReason::Paused));
            }
        }

        let settings = self.resolver.resolve(user_id).await?;

        let closes = match self.fetcher.fetch_recent_closes(symbol, settings.timeframe).await {
            Ok(closes) => closes,
            Err(FetchError::MarketClosed(reason)) => {
                tracing::info!(symbol = %symbol, user_id, "Market closed ({}), skipping cycle", reason);
                return Ok(CycleOutcome::Skipped(SkipReason::MarketClosed(reason)));
            }
            Err(FetchError::Exhausted {
                attempts,
                last_error,
            }) => {
                tracing::warn!(
                    symbol = %symbol,
                    user_id,
                    "Market data unavailable after {} attempts: {}",
                    attempts,
                    last_error
                );
                return Ok(CycleOutcome::Skipped(SkipReason::FeedUnavailable { attempts }));
            }
            Err(e) => return Err(e.into()),
        };

        let (Some(emas), Some(price)) = (StrategyEmas::from_closes(&closes.closes), closes.latest()) else {
            tracing::info!(
                symbol = %symbol,
                user_id,
                "Only {} closes, need {} for EMA-{}",
                closes.closes.len(),
                SLOW_PERIOD,
                SLOW_PERIOD
            );
            return Ok(CycleOutcome::Skipped(SkipReason::InsufficientHistory {
                bars: closes.closes.len(),
            }));
        };
        let (ema5, ema8, ema22) = emas.latest();

        // Audit trail only; a failed write never blocks trading.
        if let Err(e) = self
            .store
            .record_ema_readings(
                symbol,
                &[(FAST_PERIOD, ema5), (MID_PERIOD, ema8), (SLOW_PERIOD, ema22)],
                closes.timestamp,
            )
            .await
        {
            tracing::warn!(symbol = %symbol, user_id, "Failed to record EMA readings: {}", e);
        }

        let signal = is_uptrend(ema5, ema8, ema22)
            && confirmed_above(&emas.ema5.values, &emas.ema8.values, settings.confirmation_bars);

        if !signal {
            tracing::debug!(
                symbol = %symbol,
                user_id,
                "No signal: EMA5 {:.4} EMA8 {:.4} EMA22 {:.4}",
                ema5,
                ema8,
                ema22
            );
            let exits_closed = self
                .exit_monitor
                .check_exits_at(symbol, Some(user_id), price)
                .await?;
            return Ok(CycleOutcome::NoSignal { exits_closed });
        }

        let signal_id = self
            .store
            .record_signal(&TradingSignal {
                id: None,
                user_id,
                symbol: symbol.to_string(),
                signal_type: SignalType::Buy,
                price,
                ema5,
                ema8,
                ema22,
                timestamp: closes.timestamp,
            })
            .await?;
        tracing::info!(
            symbol = %symbol,
            user_id,
            "Buy signal #{} @ ${:.2} (EMA5 {:.4} > EMA8 {:.4} > EMA22 {:.4})",
            signal_id,
            price,
            ema5,
            ema8,
            ema22
        );
        self.notifier.notify(
            Notification::new(
                NotificationKind::SignalDetected,
                format!("Buy signal for {} @ ${:.2}", symbol, price),
            )
            .for_symbol(symbol)
            .for_user(user_id),
        );

        if self.async_execution {
            let coordinator = self.clone();
            let symbol = symbol.to_string();
            tokio::spawn(async move {
                let outcome = coordinator.execute_buy(user_id, &symbol, price, &settings).await;
                tracing::debug!(symbol = %symbol, user_id, "Async execution finished: {:?}", outcome);
            });
            return Ok(CycleOutcome::Dispatched);
        }

        Ok(CycleOutcome::Executed(
            self.execute_buy(user_id, symbol, price, &settings).await,
        ))
    }

    /// Buy path, serialised per `(user_id, symbol)`.
    pub async fn execute_buy(
        &self,
        user_id: i64,
        symbol: &str,
        reference_price: f64,
        settings: &TradingSettings,
    ) -> ExecutionOutcome {
        let slot = self
            .slot_locks
            .entry((user_id, symbol.to_string()))
            .or_default()
            .value()
            .clone();
        let _guard = slot.lock().await;

        match self.buy_locked(user_id, symbol, reference_price, settings).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(symbol = %symbol, user_id, "Buy failed: {}", e);
                self.notifier.notify(
                    Notification::new(
                        NotificationKind::Error,
                        format!("Buy for {} failed: {}", symbol, e),
                    )
                    .for_symbol(symbol)
                    .for_user(user_id),
                );
                ExecutionOutcome::Failed(e)
            }
        }
    }

    async fn buy_locked(
        &self,
        user_id: i64,
        symbol: &str,
        reference_price: f64,
        settings: &TradingSettings,
    ) -> Result<ExecutionOutcome, EngineError> {
        if let Some(existing) = self.store.active_position(user_id, symbol).await? {
            tracing::info!(
                symbol = %symbol,
                user_id,
                "Position {} already {}, not buying again",
                existing.id,
                existing.status
            );
            return Ok(ExecutionOutcome::AlreadyActive {
                existing_id: existing.id,
            });
        }

        let notional = Decimal::from_f64(settings.trade_amount)
            .filter(|n| *n > Decimal::ZERO)
            .ok_or_else(|| {
                EngineError::Validation(format!("bad trade amount {}", settings.trade_amount))
            })?
            .round_dp(2);

        let order = self
            .broker
            .place_market_order(
                NotionalOrderRequest::buy(symbol, notional)
                    .with_client_order_id(uuid::Uuid::new_v4().to_string()),
            )
            .await
            .map_err(EngineError::broker)?;

        let filled = order.is_filled();
        let entry_price = match order.filled_avg_price_f64() {
            Some(p) if filled => p,
            _ => reference_price,
        };
        let take_profit = settings.take_profit_price(entry_price);
        let stop_loss = settings.stop_loss_price(entry_price);
        let fill_qty = if filled { order.filled_quantity_f64() } else { None };

        tracing::info!(
            symbol = %symbol,
            user_id,
            "Market buy ${} submitted: order {} ({})",
            notional,
            order.id,
            order.status
        );

        let new = NewPosition {
            user_id,
            symbol: symbol.to_string(),
            amount: settings.trade_amount,
            entry_price,
            take_profit,
            stop_loss,
            status: if filled {
                PositionStatus::Open
            } else {
                PositionStatus::Pending
            },
            entry_time: self.clock.now(),
            primary_order_id: Some(order.id.clone()),
            fill_qty,
            fill_notional: fill_qty.map(|q| q * entry_price),
        };

        let inserted = match self.store.insert_position(&new).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.release_order(symbol, user_id, &order.id, fill_qty).await;
                return Err(e);
            }
        };

        let position = match inserted {
            InsertOutcome::Inserted(position) => position,
            InsertOutcome::Conflict => {
                let existing_id = self
                    .store
                    .active_position(user_id, symbol)
                    .await?
                    .map(|p| p.id);
                tracing::warn!(
                    symbol = %symbol,
                    user_id,
                    "Lost the race for the active slot (held by {:?})",
                    existing_id
                );
                self.release_order(symbol, user_id, &order.id, fill_qty).await;
                return Ok(ExecutionOutcome::LostRace { existing_id });
            }
        };

        self.notifier.notify(
            Notification::new(
                NotificationKind::OrderPlaced,
                format!("Bought ${} of {} (order {})", notional, symbol, order.id),
            )
            .for_symbol(symbol)
            .for_user(user_id),
        );

        match fill_qty {
            Some(qty) => {
                let safety =
                    place_safety_orders(self.broker.as_ref(), symbol, qty, take_profit, stop_loss)
                        .await;
                if let Err(e) = self
                    .store
                    .set_safety_orders(
                        position.id,
                        safety.take_profit_order_id.as_deref(),
                        safety.stop_loss_order_id.as_deref(),
                    )
                    .await
                {
                    tracing::error!(
                        symbol = %symbol,
                        user_id,
                        "Safety orders {:?} placed but not recorded on position {}: {}",
                        safety,
                        position.id,
                        e
                    );
                }
                self.notifier.notify(
                    Notification::new(
                        NotificationKind::PositionOpened,
                        format!(
                            "Bought {:.4} {} @ ${:.2} (TP ${:.2} / SL ${:.2})",
                            qty, symbol, entry_price, take_profit, stop_loss
                        ),
                    )
                    .for_symbol(symbol)
                    .for_user(user_id),
                );
                let refreshed = self.store.get_position(position.id).await?;
                Ok(ExecutionOutcome::Created(refreshed.unwrap_or(position)))
            }
            None => {
                self.reconciler.spawn_watch(position.id, order.id.clone());
                Ok(ExecutionOutcome::Created(position))
            }
        }
    }

    /// Undo a buy that ended up without a position row: cancel it while it
    /// is still working, sell the shares back once it has filled.
    async fn release_order(&self, symbol: &str, user_id: i64, order_id: &str, fill_qty: Option<f64>) {
        match fill_qty {
            Some(qty) => self.unwind_fill(symbol, user_id, order_id, qty).await,
            None => self.cancel_orphan(symbol, user_id, order_id).await,
        }
    }

    async fn unwind_fill(&self, symbol: &str, user_id: i64, order_id: &str, qty: f64) {
        let sold = match Decimal::from_f64(qty).filter(|q| *q > Decimal::ZERO) {
            Some(shares) => self.broker.place_market_sell(symbol, shares.round_dp(9)).await,
            None => Err(anyhow::anyhow!("bad fill quantity {}", qty)),
        };
        match sold {
            Ok(exit) => tracing::warn!(
                symbol = %symbol,
                user_id,
                "Sold back {:.4} shares from untracked order {} (order {})",
                qty,
                order_id,
                exit.id
            ),
            Err(e) => {
                tracing::error!(
                    symbol = %symbol,
                    user_id,
                    "Filled order {} has no position and could not be sold back: {:#}",
                    order_id,
                    e
                );
                self.notifier.notify(
                    Notification::new(
                        NotificationKind::Error,
                        format!(
                            "{:.4} shares of {} from order {} are untracked; close them manually",
                            qty, symbol, order_id
                        ),
                    )
                    .for_symbol(symbol)
                    .for_user(user_id)
                    .persistent(),
                );
            }
        }
    }

    async fn cancel_orphan(&self, symbol: &str, user_id: i64, order_id: &str) {
        match self.broker.cancel_order(order_id).await {
            Ok(()) => tracing::info!(symbol = %symbol, user_id, "Cancelled orphaned order {}", order_id),
            Err(e) => tracing::error!(
                symbol = %symbol,
                user_id,
                "Orphaned order {} could not be cancelled: {:#}",
                order_id,
                e
            ),
        }
    }

    /// Run many cycles concurrently. One pair's failure never stops the
    /// others; each symbol's `bot_state` records the outcome.
    pub async fn run_batch(&self, pairs: Vec<(i64, String)>) -> BatchReport {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_cycles));
        let mut handles = Vec::with_capacity(pairs.len());

        for (user_id, symbol) in pairs {
            let sem = Arc::clone(&semaphore);
            let coordinator = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire().await;
                let result = coordinator.run_cycle(&symbol, user_id).await;
                (user_id, symbol, result)
            }));
        }

        let mut report = BatchReport::default();
        for handle in handles {
            report.attempted += 1;
            let (user_id, symbol, result) = match handle.await {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!("Cycle task panicked: {}", e);
                    report.failed += 1;
                    continue;
                }
            };

            let error = match result {
                Ok(outcome) => {
                    if outcome.ran_signal() {
                        report.signals += 1;
                    }
                    match outcome {
                        CycleOutcome::Skipped(_) => {
                            report.skipped += 1;
                            None
                        }
                        CycleOutcome::Executed(ExecutionOutcome::Created(_)) => {
                            report.positions_created += 1;
                            None
                        }
                        CycleOutcome::Executed(ExecutionOutcome::Failed(e)) => Some(e.to_string()),
                        _ => None,
                    }
                }
                Err(e) => {
                    tracing::error!(symbol = %symbol, user_id, "Cycle failed: {}", e);
                    Some(e.to_string())
                }
            };

            if let Err(e) = self
                .store
                .record_run(&symbol, self.clock.now(), error.as_deref())
                .await
            {
                tracing::warn!(symbol = %symbol, "Failed to record bot state: {}", e);
            }
            if let Some(message) = error {
                report.failed += 1;
                report.errors.push((user_id, symbol, message));
            }
        }

        report
    }
}
