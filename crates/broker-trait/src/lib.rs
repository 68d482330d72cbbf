use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Unified broker types (broker-agnostic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerOrderSide {
    Buy,
    Sell,
}

/// Market order sized in dollars; the broker decides the share quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotionalOrderRequest {
    pub symbol: String,
    pub notional: Decimal,
    pub side: BrokerOrderSide,
    pub client_order_id: Option<String>,
}

impl NotionalOrderRequest {
    pub fn buy(symbol: impl Into<String>, notional: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            notional,
            side: BrokerOrderSide::Buy,
            client_order_id: None,
        }
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }
}

/// Resting exit order: a limit (take-profit) or stop (stop-loss) sell for a
/// known share quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitOrderRequest {
    pub symbol: String,
    pub qty: Decimal,
    pub price: Decimal,
    pub side: BrokerOrderSide,
}

impl ExitOrderRequest {
    pub fn sell(symbol: impl Into<String>, qty: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            price: price.round_dp(2),
            side: BrokerOrderSide::Sell,
        }
    }
}

/// Where an order is in its lifecycle, collapsed from broker status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillState {
    Filled,
    /// Cancelled, rejected or expired: will never fill
    Dead,
    Working,
}

/// Non-success HTTP response from a broker API. Carried inside
/// `anyhow::Error` so callers can tell a permanent refusal from a
/// transport hiccup.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{context} (HTTP {status}): {message}")]
pub struct BrokerApiError {
    pub status: u16,
    pub context: String,
    pub message: String,
}

impl BrokerApiError {
    pub fn new(status: u16, context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            context: context.into(),
            message: message.into(),
        }
    }
}

/// The broker does not know the order (or other resource) at all.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<BrokerApiError>()
        .is_some_and(|e| e.status == 404)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub id: String,
    pub client_order_id: String,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub symbol: String,
    pub qty: Option<String>,
    pub notional: Option<String>,
    pub filled_qty: Option<String>,
    pub filled_avg_price: Option<String>,
    pub order_type: String,
    pub side: String,
    pub status: String,
}

impl BrokerOrder {
    pub fn filled_quantity_decimal(&self) -> Option<Decimal> {
        self.filled_qty
            .as_ref()
            .and_then(|s| Decimal::from_str(s).ok())
    }

    pub fn filled_avg_price_decimal(&self) -> Option<Decimal> {
        self.filled_avg_price
            .as_ref()
            .and_then(|s| Decimal::from_str(s).ok())
    }

    pub fn filled_quantity_f64(&self) -> Option<f64> {
        self.filled_quantity_decimal().and_then(|d| d.to_f64())
    }

    pub fn filled_avg_price_f64(&self) -> Option<f64> {
        self.filled_avg_price_decimal().and_then(|d| d.to_f64())
    }

    pub fn fill_state(&self) -> FillState {
        match self.status.as_str() {
            "filled" => FillState::Filled,
            "canceled" | "cancelled" | "rejected" | "expired" | "done_for_day" => FillState::Dead,
            _ => FillState::Working,
        }
    }

    /// Filled with a usable average price and quantity.
    pub fn is_filled(&self) -> bool {
        self.fill_state() == FillState::Filled
            && self.filled_avg_price_f64().is_some_and(|p| p > 0.0)
            && self.filled_quantity_f64().is_some_and(|q| q > 0.0)
    }
}

// ---------------------------------------------------------------------------
// Broker trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Submit a notional (dollar-sized) market order
    async fn place_market_order(&self, order: NotionalOrderRequest) -> Result<BrokerOrder>;

    /// Submit a limit order (take-profit leg)
    async fn place_limit_order(&self, order: ExitOrderRequest) -> Result<BrokerOrder>;

    /// Submit a stop order (stop-loss leg)
    async fn place_stop_order(&self, order: ExitOrderRequest) -> Result<BrokerOrder>;

    /// Market sell of an exact share quantity
    async fn place_market_sell(&self, symbol: &str, qty: Decimal) -> Result<BrokerOrder>;

    /// Get an order by ID
    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder>;

    /// Cancel an order by ID
    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// Cancel every open order for a symbol; returns how many were cancelled
    async fn cancel_open_orders(&self, symbol: &str) -> Result<usize>;

    /// Close an entire position at market
    async fn close_position(&self, symbol: &str) -> Result<BrokerOrder>;

    /// Whether this is a paper/simulated account
    fn is_paper(&self) -> bool;

    /// Broker name for logging
    fn broker_name(&self) -> &str;
}
