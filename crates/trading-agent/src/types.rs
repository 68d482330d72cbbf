use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a position.
///
/// `pending -> open -> closed_profit | closed_loss`, `pending -> cancelled`,
/// and any non-terminal state `-> error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Pending,
    Open,
    ClosedProfit,
    ClosedLoss,
    Cancelled,
    Error,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "pending",
            PositionStatus::Open => "open",
            PositionStatus::ClosedProfit => "closed_profit",
            PositionStatus::ClosedLoss => "closed_loss",
            PositionStatus::Cancelled => "cancelled",
            PositionStatus::Error => "error",
        }
    }

    /// Counts against the one-active-position-per-(user, symbol) rule.
    pub fn is_active(&self) -> bool {
        matches!(self, PositionStatus::Pending | PositionStatus::Open)
    }

    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        matches!(
            (self, next),
            (Pending, Open)
                | (Pending, Cancelled)
                | (Open, ClosedProfit)
                | (Open, ClosedLoss)
                | (Pending, Error)
                | (Open, Error)
        )
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PositionStatus::Pending),
            "open" => Ok(PositionStatus::Open),
            "closed_profit" => Ok(PositionStatus::ClosedProfit),
            "closed_loss" => Ok(PositionStatus::ClosedLoss),
            "cancelled" => Ok(PositionStatus::Cancelled),
            "error" => Ok(PositionStatus::Error),
            other => Err(format!("unknown position status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::Manual => "manual",
        }
    }
}

impl FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "take_profit" => Ok(ExitReason::TakeProfit),
            "stop_loss" => Ok(ExitReason::StopLoss),
            "manual" => Ok(ExitReason::Manual),
            other => Err(format!("unknown exit reason '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Buy,
    Sell,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Buy => "buy",
            SignalType::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub user_id: i64,
    pub symbol: String,
    /// Notional dollars committed at entry
    pub amount: f64,
    pub entry_price: f64,
    pub current_price: Option<f64>,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub profit_loss: Option<f64>,
    pub primary_order_id: Option<String>,
    pub take_profit_order_id: Option<String>,
    pub stop_loss_order_id: Option<String>,
    pub fill_qty: Option<f64>,
    pub fill_notional: Option<f64>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Everything needed to insert a position row.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub user_id: i64,
    pub symbol: String,
    pub amount: f64,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub status: PositionStatus,
    pub entry_time: DateTime<Utc>,
    pub primary_order_id: Option<String>,
    pub fill_qty: Option<f64>,
    pub fill_notional: Option<f64>,
}

/// Result of closing a position: exit fields computed from entry and exit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitFill {
    pub exit_price: f64,
    pub status: PositionStatus,
    pub profit_loss: f64,
}

impl ExitFill {
    /// `closed_profit` only when the exit beats the entry; P&L is scaled by
    /// the number of shares the notional amount bought.
    pub fn compute(entry_price: f64, amount: f64, exit_price: f64) -> Self {
        let status = if exit_price > entry_price {
            PositionStatus::ClosedProfit
        } else {
            PositionStatus::ClosedLoss
        };
        let profit_loss = if entry_price > 0.0 {
            (exit_price - entry_price) * (amount / entry_price)
        } else {
            0.0
        };
        Self {
            exit_price,
            status,
            profit_loss,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaReading {
    pub symbol: String,
    pub period: i64,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSignal {
    pub id: Option<i64>,
    pub user_id: i64,
    pub symbol: String,
    pub signal_type: SignalType,
    pub price: f64,
    pub ema5: f64,
    pub ema8: f64,
    pub ema22: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnfilledOrderAlert {
    pub id: i64,
    pub position_id: i64,
    pub order_id: String,
    pub user_id: i64,
    pub symbol: String,
    /// Seconds the order had been unfilled when the alert was raised
    pub timeout_duration: i64,
    pub created_at: DateTime<Utc>,
}

/// Advisory per-symbol run control. Last write wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotState {
    pub symbol: String,
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}
