//! EMA-crossover trading engine: per-user settings, position state,
//! signal detection and the buy path, order reconciliation and exits.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod exit_monitor;
pub mod orders;
pub mod reconciler;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod types;


pub use config::AgentConfig;
pub use coordinator::{BatchReport, CycleOutcome, ExecutionOutcome, SkipReason, TradeCoordinator};
pub use error::EngineError;
pub use exit_monitor::{evaluate_exit, ExitMonitor};
pub use orders::{place_safety_orders, SafetyOrders};
pub use reconciler::{OrderReconciler, ReconcileStep};
pub use scheduler::{ticker, Scheduler, TickReport};
pub use settings::{SettingsResolver, TradingSettings};
pub use store::{BotSettingsRow, InsertOutcome, PositionStore};
pub use types::*;
