use std::collections::HashMap;
use std::sync::Arc;

use broker_trait::BrokerClient;
use market_data::MarketDataFetcher;
use notification_service::{Notification, NotificationKind, NotificationService};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use trading_core::{Clock, SystemClock};

use crate::error::EngineError;
use crate::settings::{SettingsResolver, TradingSettings};
use crate::store::PositionStore;
use crate::types::{ExitFill, ExitReason, Position, PositionStatus};

/// Take-profit / stop-loss decision for one position.
///
/// `pnl_pct = (latest - entry) / entry`; at or above `profit_threshold` is a
/// take-profit, at or below `-loss_threshold` a stop-loss.
pub fn evaluate_exit(
    entry_price: f64,
    latest_close: f64,
    profit_threshold: f64,
    loss_threshold: f64,
) -> Option<ExitReason> {
    if entry_price <= 0.0 || !latest_close.is_finite() {
        return None;
    }
    let pnl_pct = (latest_close - entry_price) / entry_price;
    if pnl_pct >= profit_threshold {
        Some(ExitReason::TakeProfit)
    } else if pnl_pct <= -loss_threshold {
        Some(ExitReason::StopLoss)
    } else {
        None
    }
}

/// Closes open positions that crossed their per-user thresholds.
#[derive(Clone)]
pub struct ExitMonitor {
    store: PositionStore,
    broker: Arc<dyn BrokerClient>,
    fetcher: MarketDataFetcher,
    resolver: SettingsResolver,
    notifier: NotificationService,
    clock: Arc<dyn Clock>,
}

impl ExitMonitor {
    pub fn new(
        store: PositionStore,
        broker: Arc<dyn BrokerClient>,
        fetcher: MarketDataFetcher,
        resolver: SettingsResolver,
        notifier: NotificationService,
    ) -> Self {
        Self {
            store,
            broker,
            fetcher,
            resolver,
            notifier,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    /// Fetch the latest close for `symbol` and close whatever hit its
    /// thresholds. Returns whether anything was closed.
    pub async fn check_exits(&self, symbol: &str, user_id: Option<i64>) -> Result<bool, EngineError> {
        Ok(self.close_triggered(symbol, user_id).await? > 0)
    }

    /// Like `check_exits`, returning how many positions were closed.
    pub async fn close_triggered(&self, symbol: &str, user_id: Option<i64>) -> Result<usize, EngineError> {
        let positions = self.store.open_positions(symbol, user_id).await?;
        let Some(first) = positions.first() else {
            return Ok(0);
        };

        let timeframe = self.resolver.resolve(user_id.unwrap_or(first.user_id)).await?.timeframe;
        let closes = self.fetcher.fetch_recent_closes(symbol, timeframe).await?;
        let latest = closes
            .latest()
            .ok_or_else(|| EngineError::Validation(format!("no closes returned for {}", symbol)))?;

        self.check_exits_at(symbol, user_id, latest).await
    }

    /// Evaluate open positions for `symbol` against an already-known close.
    /// A position whose broker exit fails stays open for the next check.
    pub async fn check_exits_at(
        &self,
        symbol: &str,
        user_id: Option<i64>,
        latest_close: f64,
    ) -> Result<usize, EngineError> {
        let positions = self.store.open_positions(symbol, user_id).await?;
        let mut settings_by_user: HashMap<i64, TradingSettings> = HashMap::new();
        let mut closed = 0;

        for position in positions {
            let settings = match settings_by_user.get(&position.user_id) {
                Some(settings) => settings.clone(),
                None => match self.resolver.resolve(position.user_id).await {
                    Ok(settings) => {
                        settings_by_user.insert(position.user_id, settings.clone());
                        settings
                    }
                    Err(e) => {
                        tracing::warn!(
                            symbol = %symbol,
                            user_id = position.user_id,
                            "Skipping exit check for position {}: {}",
                            position.id,
                            e
                        );
                        continue;
                    }
                },
            };

            self.store.update_current_price(position.id, latest_close).await?;

            let Some(reason) = evaluate_exit(
                position.entry_price,
                latest_close,
                settings.profit_threshold(),
                settings.loss_threshold(),
            ) else {
                continue;
            };

            tracing::info!(
                symbol = %symbol,
                user_id = position.user_id,
                "{} hit for position {}: entry ${:.2}, last ${:.2}",
                reason.as_str(),
                position.id,
                position.entry_price,
                latest_close
            );

            match self.exit_position(&position, latest_close, reason).await {
                Ok(Some(_)) => closed += 1,
                Ok(None) => {}
                Err(e) => tracing::error!(
                    symbol = %symbol,
                    user_id = position.user_id,
                    "Exit for position {} failed, left open: {}",
                    position.id,
                    e
                ),
            }
        }

        Ok(closed)
    }

    /// Close an open position at the caller's price, e.g. from a dashboard.
    pub async fn close_manually(&self, position_id: i64, exit_price: f64) -> Result<Position, EngineError> {
        if !(exit_price.is_finite() && exit_price > 0.0) {
            return Err(EngineError::Validation(format!("exit price must be positive, got {}", exit_price)));
        }
        let position = self
            .store
            .get_position(position_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("position {}", position_id)))?;
        if !position.status.can_transition_to(PositionStatus::ClosedProfit) {
            return Err(EngineError::Validation(format!(
                "position {} is {}, only open positions can be closed",
                position_id, position.status
            )));
        }

        match self.exit_position(&position, exit_price, ExitReason::Manual).await? {
            Some(closed) => Ok(closed),
            None => Err(EngineError::ConcurrencyConflict {
                user_id: position.user_id,
                symbol: position.symbol.clone(),
            }),
        }
    }

    /// Flatten at the broker, then record the exit. `None` when another
    /// writer closed the row first.
    async fn exit_position(
        &self,
        position: &Position,
        reference_price: f64,
        reason: ExitReason,
    ) -> Result<Option<Position>, EngineError> {
        let (exit_price, reason) = self.flatten(position, reference_price, reason).await?;
        let fill = ExitFill::compute(position.entry_price, position.amount, exit_price);

        let Some(closed) = self
            .store
            .close_position(position.id, fill, reason, self.clock.now())
            .await?
        else {
            return Ok(None);
        };

        tracing::info!(
            symbol = %closed.symbol,
            user_id = closed.user_id,
            "Closed position {} ({}) @ ${:.2}, P/L ${:.2}",
            closed.id,
            reason.as_str(),
            exit_price,
            fill.profit_loss
        );
        self.notifier.notify(
            Notification::new(
                NotificationKind::PositionClosed,
                format!(
                    "Sold {} @ ${:.2} ({}), P/L ${:.2}",
                    closed.symbol,
                    exit_price,
                    reason.as_str(),
                    fill.profit_loss
                ),
            )
            .for_symbol(&closed.symbol)
            .for_user(closed.user_id),
        );
        Ok(Some(closed))
    }

    /// Get the position's shares out of the broker account and return the
    /// realised exit price and reason.
    async fn flatten(
        &self,
        position: &Position,
        reference_price: f64,
        reason: ExitReason,
    ) -> Result<(f64, ExitReason), EngineError> {
        // A resting safety leg may have already done the exit.
        let legs = [
            (position.take_profit_order_id.as_deref(), ExitReason::TakeProfit),
            (position.stop_loss_order_id.as_deref(), ExitReason::StopLoss),
        ];
        for (order_id, leg_reason) in legs {
            let Some(order_id) = order_id else { continue };
            match self.broker.get_order(order_id).await {
                Ok(order) if order.is_filled() => {
                    self.cancel_legs(position, Some(order_id)).await;
                    let price = order.filled_avg_price_f64().unwrap_or(reference_price);
                    return Ok((price, leg_reason));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Could not query safety order {}: {:#}", order_id, e),
            }
        }

        self.cancel_legs(position, None).await;

        let qty = position
            .fill_qty
            .and_then(Decimal::from_f64)
            .filter(|q| *q > Decimal::ZERO);
        let order = match qty {
            Some(qty) => self
                .broker
                .place_market_sell(&position.symbol, qty.round_dp(9))
                .await
                .map_err(EngineError::broker)?,
            None => {
                // Unknown share count: clear the book and liquidate the symbol.
                self.broker
                    .cancel_open_orders(&position.symbol)
                    .await
                    .map_err(EngineError::broker)?;
                self.broker
                    .close_position(&position.symbol)
                    .await
                    .map_err(EngineError::broker)?
            }
        };

        let exit_price = order
            .filled_avg_price_f64()
            .filter(|p| *p > 0.0)
            .unwrap_or(reference_price);
        Ok((exit_price, reason))
    }

    async fn cancel_legs(&self, position: &Position, except: Option<&str>) {
        let legs = [
            position.take_profit_order_id.as_deref(),
            position.stop_loss_order_id.as_deref(),
        ];
        for order_id in legs.into_iter().flatten() {
            if Some(order_id) == except {
                continue;
            }
            if let Err(e) = self.broker.cancel_order(order_id).await {
                tracing::debug!("Cancel of safety order {} failed: {:#}", order_id, e);
            }
        }
    }
}
