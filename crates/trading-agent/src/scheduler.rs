use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{self, Interval, MissedTickBehavior};
use trading_core::{Clock, SystemClock};

use crate::coordinator::{BatchReport, TradeCoordinator};
use crate::error::EngineError;
use crate::exit_monitor::ExitMonitor;
use crate::settings::{SettingsResolver, TradingSettings};

/// What one scheduler tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub cycles: Option<BatchReport>,
    pub alerts_raised: usize,
    /// Positions closed by the exit sweep (not by cycles)
    pub exits_closed: usize,
}

/// Tick source for the main loop. A tick that falls behind (a slow batch)
/// is delayed rather than fired in a burst afterwards.
pub fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Decides which tracked `(user, symbol)` pairs are due on each tick and
/// runs them as one batch. Each pair is polled at its user's timeframe;
/// the unfilled-order sweep and the exit sweep over every symbol with open
/// positions run on their own intervals.
pub struct Scheduler {
    coordinator: TradeCoordinator,
    resolver: SettingsResolver,
    clock: Arc<dyn Clock>,
    sweep_interval: chrono::Duration,
    exit_interval: chrono::Duration,
    last_polled: HashMap<(i64, String), DateTime<Utc>>,
    last_sweep: Option<DateTime<Utc>>,
    last_exit_sweep: Option<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(coordinator: TradeCoordinator) -> Self {
        Self {
            resolver: SettingsResolver::new(coordinator.store().clone()),
            coordinator,
            clock: Arc::new(SystemClock),
            sweep_interval: chrono::Duration::seconds(60),
            exit_interval: chrono::Duration::seconds(60),
            last_polled: HashMap::new(),
            last_sweep: None,
            last_exit_sweep: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_resolver(mut self, resolver: SettingsResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_sweep_interval(mut self, interval: chrono::Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_exit_interval(mut self, interval: chrono::Duration) -> Self {
        self.exit_interval = interval;
        self
    }

    /// Pairs whose poll interval has elapsed at `now`. Marks them polled.
    pub async fn due_pairs(&mut self, now: DateTime<Utc>) -> Result<Vec<(i64, String)>, EngineError> {
        let tracked = self.coordinator.store().tracked_pairs().await?;

        let live: HashSet<&(i64, String)> = tracked.iter().collect();
        self.last_polled.retain(|key, _| live.contains(key));
        self.coordinator.prune_slot_locks(&tracked);

        let mut due = Vec::new();
        for (user_id, symbol) in &tracked {
            // Broken settings still get polled so the cycle records the error.
            let interval = match self.resolver.resolve(*user_id).await {
                Ok(settings) => settings.timeframe.poll_interval(),
                Err(_) => TradingSettings::default().timeframe.poll_interval(),
            };
            let key = (*user_id, symbol.clone());
            let is_due = self
                .last_polled
                .get(&key)
                .map_or(true, |last| now - *last >= interval);
            if is_due {
                self.last_polled.insert(key.clone(), now);
                due.push(key);
            }
        }
        Ok(due)
    }

    pub async fn tick(&mut self) -> Result<TickReport, EngineError> {
        let now = self.clock.now();
        let mut report = TickReport::default();

        let due = self.due_pairs(now).await?;
        if !due.is_empty() {
            let batch = self.coordinator.run_batch(due).await;
            tracing::info!(
                "Cycle batch: {} run, {} signals, {} positions, {} skipped, {} failed",
                batch.attempted,
                batch.signals,
                batch.positions_created,
                batch.skipped,
                batch.failed
            );
            report.cycles = Some(batch);
        }

        let sweep_due = self
            .last_sweep
            .map_or(true, |last| now - last >= self.sweep_interval);
        if sweep_due {
            self.last_sweep = Some(now);
            report.alerts_raised = self.coordinator.reconciler().sweep_unfilled().await?.len();
        }

        let exits_due = self
            .last_exit_sweep
            .map_or(true, |last| now - last >= self.exit_interval);
        if exits_due {
            self.last_exit_sweep = Some(now);
            report.exits_closed = sweep_exits(self.coordinator.exit_monitor()).await?;
        }

        Ok(report)
    }
}

/// Exit check for every symbol with open positions, tracked or not. One
/// symbol's failure is logged and does not stop the others.
async fn sweep_exits(exits: &ExitMonitor) -> Result<usize, EngineError> {
    let mut closed = 0;
    for symbol in exits.store().open_symbols().await? {
        match exits.close_triggered(&symbol, None).await {
            Ok(n) => closed += n,
            Err(EngineError::MarketClosed(reason)) => {
                tracing::debug!(symbol = %symbol, "Exit sweep skipped, market closed ({})", reason);
            }
            Err(e) => tracing::warn!(symbol = %symbol, "Exit sweep failed: {}", e),
        }
    }
    if closed > 0 {
        tracing::info!("Exit sweep closed {} position(s)", closed);
    }
    Ok(closed)
}
