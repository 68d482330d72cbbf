use crate::client::{auth_headers, credentials_from_env, endpoint};
use crate::models::BarsResponse;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header::HeaderMap, Client};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use trading_core::{Bar, BarPage, BarRequest, BarSource, FetchError, Timeframe};

pub const DATA_BASE_URL: &str = "https://data.alpaca.markets";

/// Sliding-window request limiter shared by clones of the data client.
#[derive(Clone)]
struct RateLimiter {
    timestamps: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            timestamps: Arc::new(Mutex::new(VecDeque::new())),
            max_requests: max_requests.max(1),
            window,
        }
    }

    async fn acquire(&self) {
        loop {
            let mut ts = self.timestamps.lock().await;
            let now = Instant::now();

            while let Some(&front) = ts.front() {
                if now.duration_since(front) >= self.window {
                    ts.pop_front();
                } else {
                    break;
                }
            }

            if ts.len() < self.max_requests {
                ts.push_back(now);
                return;
            }

            let sleep_dur = match ts.front() {
                Some(&oldest) => {
                    (oldest + self.window).saturating_duration_since(now) + Duration::from_millis(50)
                }
                None => Duration::from_millis(50),
            };
            drop(ts);
            tracing::debug!(
                "Rate limiter: waiting {:.1}s for Alpaca data slot",
                sleep_dur.as_secs_f64()
            );
            tokio::time::sleep(sleep_dur).await;
        }
    }
}

/// Historical bars from the Alpaca market data v2 API.
#[derive(Clone)]
pub struct AlpacaDataClient {
    client: Client,
    base_url: String,
    feed: String,
    headers: HeaderMap,
    rate_limiter: RateLimiter,
}

impl AlpacaDataClient {
    pub fn new(api_key: &str, secret_key: &str, base_url: String, feed: String) -> Result<Self> {
        // Free plan allows 200 requests per minute
        let rate_limit: usize = std::env::var("ALPACA_DATA_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(200);

        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            feed,
            headers: auth_headers(api_key, secret_key)?,
            rate_limiter: RateLimiter::new(rate_limit, Duration::from_secs(60)),
        })
    }

    pub fn from_env() -> Result<Self> {
        let (api_key, secret_key) = credentials_from_env()?;
        let base_url =
            std::env::var("ALPACA_DATA_URL").unwrap_or_else(|_| DATA_BASE_URL.to_string());
        let feed = std::env::var("ALPACA_DATA_FEED").unwrap_or_else(|_| "iex".to_string());
        Self::new(&api_key, &secret_key, base_url, feed)
    }

    fn query(&self, request: &BarRequest) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("timeframe", alpaca_timeframe(request.timeframe).to_string()),
            ("limit", request.limit.clamp(1, 10_000).to_string()),
            ("sort", "desc".to_string()),
            ("feed", self.feed.clone()),
        ];
        if let Some(start) = request.start {
            query.push(("start", start.to_rfc3339()));
        }
        if let Some(end) = request.end {
            query.push(("end", end.to_rfc3339()));
        }
        if let Some(token) = &request.page_token {
            query.push(("page_token", token.clone()));
        }
        query
    }
}

/// Alpaca's timeframe notation.
pub fn alpaca_timeframe(timeframe: Timeframe) -> &'static str {
    match timeframe {
        Timeframe::Minute1 => "1Min",
        Timeframe::Minute5 => "5Min",
        Timeframe::Minute15 => "15Min",
        Timeframe::Minute30 => "30Min",
        Timeframe::Hour1 => "1Hour",
        Timeframe::Hour4 => "4Hour",
        Timeframe::Day1 => "1Day",
    }
}

fn quota_remaining(headers: &HeaderMap) -> Option<u32> {
    headers
        .get("X-RateLimit-Remaining")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn to_bars(response: BarsResponse) -> Vec<Bar> {
    response
        .bars
        .unwrap_or_default()
        .into_iter()
        .map(|b| Bar {
            timestamp: b.timestamp,
            open: b.open,
            high: b.high,
            low: b.low,
            close: b.close,
            volume: b.volume,
        })
        .collect()
}

#[async_trait]
impl BarSource for AlpacaDataClient {
    async fn get_bars(&self, request: &BarRequest) -> Result<BarPage, FetchError> {
        let url = endpoint(&self.base_url, &["v2", "stocks", &request.symbol, "bars"]).map_err(
            |message| FetchError::Upstream {
                message,
                status: None,
                retryable: false,
                rate_limited: false,
            },
        )?;

        self.rate_limiter.acquire().await;
        let response = self
            .client
            .get(url)
            .headers(self.headers.clone())
            .query(&self.query(request))
            .send()
            .await
            .map_err(|e| FetchError::from_message(e.to_string()))?;

        let status = response.status();
        let quota = quota_remaining(response.headers());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status.as_u16(), &body));
        }

        let body = response
            .json::<BarsResponse>()
            .await
            .map_err(|e| FetchError::malformed(e.to_string()))?;

        Ok(BarPage {
            next_page_token: body.next_page_token.clone().filter(|t| !t.is_empty()),
            bars: to_bars(body),
            quota_remaining: quota,
        })
    }

    fn source_name(&self) -> &str {
        "alpaca-data"
    }
}
