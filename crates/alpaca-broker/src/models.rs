use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc, // Good til canceled
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notional: Option<String>, // Dollar amount instead of quantity
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// Dollar-sized market order. Fractional notional orders must be DAY orders.
    pub fn notional_market(symbol: String, notional: String, side: OrderSide) -> Self {
        Self {
            symbol,
            qty: None,
            notional: Some(notional),
            side,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
            limit_price: None,
            stop_price: None,
            client_order_id: None,
        }
    }

    /// Share-sized market order.
    pub fn qty_market(symbol: String, qty: String, side: OrderSide) -> Self {
        Self {
            symbol,
            qty: Some(qty),
            notional: None,
            side,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
            limit_price: None,
            stop_price: None,
            client_order_id: None,
        }
    }

    pub fn limit(symbol: String, qty: String, limit_price: String, side: OrderSide) -> Self {
        Self {
            symbol,
            qty: Some(qty),
            notional: None,
            side,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Gtc,
            limit_price: Some(limit_price),
            stop_price: None,
            client_order_id: None,
        }
    }

    pub fn stop(symbol: String, qty: String, stop_price: String, side: OrderSide) -> Self {
        Self {
            symbol,
            qty: Some(qty),
            notional: None,
            side,
            order_type: OrderType::Stop,
            time_in_force: TimeInForce::Gtc,
            limit_price: None,
            stop_price: Some(stop_price),
            client_order_id: None,
        }
    }

    /// Alpaca only accepts fractional share quantities on DAY orders.
    pub fn day_if_fractional(mut self) -> Self {
        let fractional = self
            .qty
            .as_deref()
            .and_then(|q| q.parse::<f64>().ok())
            .is_some_and(|q| q.fract() != 0.0);
        if fractional {
            self.time_in_force = TimeInForce::Day;
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: String,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub symbol: String,
    #[serde(rename = "qty")]
    pub quantity: Option<String>,
    pub notional: Option<String>,
    #[serde(rename = "filled_qty")]
    pub filled_quantity: Option<String>,
    pub filled_avg_price: Option<String>,
    pub order_type: String,
    pub side: String,
    pub limit_price: Option<String>,
    pub stop_price: Option<String>,
    pub status: String,
}

/// One bar from the market data v2 API (`t`, `o`, `h`, `l`, `c`, `v`).
#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaBar {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BarsResponse {
    #[serde(default)]
    pub bars: Option<Vec<AlpacaBar>>,
    pub symbol: Option<String>,
    pub next_page_token: Option<String>,
}
