use crate::models::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use broker_trait::{BrokerApiError, BrokerClient, BrokerOrder, BrokerOrderSide, ExitOrderRequest, NotionalOrderRequest};
use reqwest::{header, Client, Url};
use rust_decimal::Decimal;
use std::time::Duration;

pub const PAPER_BASE_URL: &str = "https://paper-api.alpaca.markets";

pub struct AlpacaClient {
    client: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
}

impl AlpacaClient {
    /// Create a new Alpaca client
    pub fn new(api_key: String, secret_key: String, base_url: String) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            secret_key,
        })
    }

    /// Create client from environment variables.
    /// Accepts both APCA_API_KEY_ID / APCA_API_SECRET_KEY (standard Alpaca names)
    /// and ALPACA_API_KEY / ALPACA_SECRET_KEY as fallbacks.
    pub fn from_env() -> Result<Self> {
        let (api_key, secret_key) = credentials_from_env()?;
        let base_url =
            std::env::var("ALPACA_BASE_URL").unwrap_or_else(|_| PAPER_BASE_URL.to_string());

        Self::new(api_key, secret_key, base_url)
    }

    /// Get authorization headers
    fn auth_headers(&self) -> Result<header::HeaderMap> {
        auth_headers(&self.api_key, &self.secret_key)
    }

    /// Submit an order
    pub async fn submit_order(&self, order: OrderRequest) -> Result<Order> {
        let url = format!("{}/v2/orders", self.base_url);

        tracing::info!("Submitting order to Alpaca: {:?}", order);

        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers()?)
            .json(&order)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response, "Alpaca order failed").await);
        }

        let order_response = response.json::<Order>().await?;
        tracing::info!(
            "Order submitted successfully: {} ({})",
            order_response.id,
            order_response.status
        );
        Ok(order_response)
    }

    /// Get an order by ID
    pub async fn get_order(&self, order_id: &str) -> Result<Order> {
        let url = endpoint(&self.base_url, &["v2", "orders", order_id]).map_err(|e| anyhow!(e))?;

        let response = self
            .client
            .get(url)
            .headers(self.auth_headers()?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response, "Failed to get order").await);
        }

        let order = response.json::<Order>().await?;
        Ok(order)
    }

    /// Open orders for one symbol
    pub async fn get_open_orders(&self, symbol: &str) -> Result<Vec<Order>> {
        let url = format!("{}/v2/orders", self.base_url);

        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers()?)
            .query(&[("status", "open"), ("symbols", symbol)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response, "Failed to get orders").await);
        }

        let orders = response.json::<Vec<Order>>().await?;
        Ok(orders)
    }

    /// Cancel an order
    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let url = endpoint(&self.base_url, &["v2", "orders", order_id]).map_err(|e| anyhow!(e))?;

        let response = self
            .client
            .delete(url)
            .headers(self.auth_headers()?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response, "Failed to cancel order").await);
        }

        tracing::info!("Order {} canceled successfully", order_id);
        Ok(())
    }

    /// Cancel every open order on `symbol`, returning how many were cancelled.
    /// Orders that finish between listing and cancelling are skipped.
    pub async fn cancel_open_orders(&self, symbol: &str) -> Result<usize> {
        let open = self.get_open_orders(symbol).await?;
        let mut cancelled = 0;
        for order in open {
            match self.cancel_order(&order.id).await {
                Ok(()) => cancelled += 1,
                Err(e) => tracing::warn!("Could not cancel order {} on {}: {}", order.id, symbol, e),
            }
        }
        Ok(cancelled)
    }

    /// Close a position (sell all shares)
    pub async fn close_position(&self, symbol: &str) -> Result<Order> {
        let url = endpoint(&self.base_url, &["v2", "positions", symbol]).map_err(|e| anyhow!(e))?;

        let response = self
            .client
            .delete(url)
            .headers(self.auth_headers()?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response, "Failed to close position").await);
        }

        let order = response.json::<Order>().await?;
        tracing::info!("Position {} closed successfully", symbol);
        Ok(order)
    }

    /// Check if this client is connected to the paper trading environment
    pub fn is_paper(&self) -> bool {
        is_paper_url(&self.base_url)
    }

    /// Get the base URL (for logging/diagnostics)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// `base_url` with `segments` appended, each percent-encoded so a symbol
/// such as `BRK/B` stays a single path segment.
pub(crate) fn endpoint(base_url: &str, segments: &[&str]) -> std::result::Result<Url, String> {
    let mut url =
        Url::parse(base_url).map_err(|e| format!("invalid base URL {}: {}", base_url, e))?;
    url.path_segments_mut()
        .map_err(|_| format!("base URL {} cannot take a path", base_url))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Turn a non-success response into a `BrokerApiError` keeping the status.
async fn api_error(response: reqwest::Response, context: &str) -> anyhow::Error {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    anyhow::Error::new(BrokerApiError::new(status, context, body))
}

pub fn credentials_from_env() -> Result<(String, String)> {
    let api_key = std::env::var("APCA_API_KEY_ID")
        .or_else(|_| std::env::var("ALPACA_API_KEY"))
        .map_err(|_| anyhow!("APCA_API_KEY_ID (or ALPACA_API_KEY) not set"))?;
    let secret_key = std::env::var("APCA_API_SECRET_KEY")
        .or_else(|_| std::env::var("ALPACA_SECRET_KEY"))
        .map_err(|_| anyhow!("APCA_API_SECRET_KEY (or ALPACA_SECRET_KEY) not set"))?;
    Ok((api_key, secret_key))
}

pub(crate) fn auth_headers(api_key: &str, secret_key: &str) -> Result<header::HeaderMap> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        "APCA-API-KEY-ID",
        header::HeaderValue::from_str(api_key)
            .map_err(|_| anyhow!("API key contains invalid header characters"))?,
    );
    headers.insert(
        "APCA-API-SECRET-KEY",
        header::HeaderValue::from_str(secret_key)
            .map_err(|_| anyhow!("Secret key contains invalid header characters"))?,
    );
    Ok(headers)
}

pub fn is_paper_url(base_url: &str) -> bool {
    base_url.contains("paper-api")
}

// ---------------------------------------------------------------------------
// Conversion helpers: Alpaca types -> unified BrokerClient types
// ---------------------------------------------------------------------------

fn side_to_alpaca(side: BrokerOrderSide) -> OrderSide {
    match side {
        BrokerOrderSide::Buy => OrderSide::Buy,
        BrokerOrderSide::Sell => OrderSide::Sell,
    }
}

fn order_to_broker(o: Order) -> BrokerOrder {
    BrokerOrder {
        id: o.id,
        client_order_id: o.client_order_id,
        created_at: o.created_at,
        filled_at: o.filled_at,
        symbol: o.symbol,
        qty: o.quantity,
        notional: o.notional,
        filled_qty: o.filled_quantity,
        filled_avg_price: o.filled_avg_price,
        order_type: o.order_type,
        side: o.side,
        status: o.status,
    }
}

#[async_trait]
impl BrokerClient for AlpacaClient {
    async fn place_market_order(&self, order: NotionalOrderRequest) -> Result<BrokerOrder> {
        let mut request = OrderRequest::notional_market(
            order.symbol,
            order.notional.round_dp(2).to_string(),
            side_to_alpaca(order.side),
        );
        request.client_order_id = order.client_order_id;
        self.submit_order(request).await.map(order_to_broker)
    }

    async fn place_limit_order(&self, order: ExitOrderRequest) -> Result<BrokerOrder> {
        let request = OrderRequest::limit(
            order.symbol,
            order.qty.to_string(),
            order.price.to_string(),
            side_to_alpaca(order.side),
        )
        .day_if_fractional();
        self.submit_order(request).await.map(order_to_broker)
    }

    async fn place_stop_order(&self, order: ExitOrderRequest) -> Result<BrokerOrder> {
        let request = OrderRequest::stop(
            order.symbol,
            order.qty.to_string(),
            order.price.to_string(),
            side_to_alpaca(order.side),
        )
        .day_if_fractional();
        self.submit_order(request).await.map(order_to_broker)
    }

    async fn place_market_sell(&self, symbol: &str, qty: Decimal) -> Result<BrokerOrder> {
        let request = OrderRequest::qty_market(symbol.to_string(), qty.to_string(), OrderSide::Sell);
        self.submit_order(request).await.map(order_to_broker)
    }

    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder> {
        self.get_order(order_id).await.map(order_to_broker)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.cancel_order(order_id).await
    }

    async fn cancel_open_orders(&self, symbol: &str) -> Result<usize> {
        self.cancel_open_orders(symbol).await
    }

    async fn close_position(&self, symbol: &str) -> Result<BrokerOrder> {
        self.close_position(symbol).await.map(order_to_broker)
    }

    fn is_paper(&self) -> bool {
        self.is_paper()
    }

    fn broker_name(&self) -> &str {
        "alpaca"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[test]
    fn paper_detection() {
        assert!(is_paper_url(PAPER_BASE_URL));
        assert!(!is_paper_url("https://api.alpaca.markets"));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = AlpacaClient::new(
            "key".to_string(),
            "secret".to_string(),
            format!("{}/", PAPER_BASE_URL),
        )
        .unwrap();
        assert_eq!(client.base_url(), PAPER_BASE_URL);
        assert!(client.is_paper());
    }

    #[test]
    fn invalid_header_characters_are_errors() {
        assert!(auth_headers("bad\nkey", "secret").is_err());
        assert!(auth_headers("key", "secret").is_ok());
    }

    #[tokio::test]
    #[ignore] // Only run with valid credentials
    async fn test_notional_order_round_trip() {
        let client = AlpacaClient::from_env().unwrap();

        let order = NotionalOrderRequest::buy("AAPL", Decimal::from_str("5").unwrap());
        let result = client.place_market_order(order).await.unwrap();

        println!("Order submitted: {}", result.id);
        println!("Status: {}", result.status);

        let fetched = BrokerClient::get_order(&client, &result.id).await.unwrap();
        assert_eq!(fetched.id, result.id);
    }
}
