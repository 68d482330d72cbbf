use std::sync::Arc;

use trading_core::{
    Bar, BarRequest, BarSource, Clock, FetchError, RecentCloses, SystemClock, Timeframe,
};

use crate::backoff::{RetryPolicy, Sleeper, TokioSleeper};
use crate::calendar::MarketCalendar;

const DEFAULT_BAR_LIMIT: usize = 100;
const MAX_PAGES: usize = 20;
const LOW_QUOTA_WARNING: u32 = 10;

/// Fetches recent closing prices with market-hours gating and retry.
///
/// Blocks the calling task for the whole retry schedule, including the
/// backoff sleeps; each symbol's poll runs on its own task.
#[derive(Clone)]
pub struct MarketDataFetcher {
    source: Arc<dyn BarSource>,
    calendar: MarketCalendar,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    bar_limit: usize,
}

impl MarketDataFetcher {
    pub fn new(source: Arc<dyn BarSource>) -> Self {
        Self {
            source,
            calendar: MarketCalendar::new(),
            policy: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(SystemClock),
            bar_limit: DEFAULT_BAR_LIMIT,
        }
    }

    pub fn with_calendar(mut self, calendar: MarketCalendar) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_bar_limit(mut self, bar_limit: usize) -> Self {
        self.bar_limit = bar_limit.max(1);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Recent closes for `symbol`, oldest first.
    ///
    /// Returns `FetchError::MarketClosed` without touching the network on
    /// weekends and holidays, a non-retryable `Upstream` error immediately,
    /// and `FetchError::Exhausted` once every attempt has failed.
    pub async fn fetch_recent_closes(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<RecentCloses, FetchError> {
        let now = self.clock.now();
        self.calendar.check(now).map_err(FetchError::MarketClosed)?;

        let max_attempts = self.policy.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.fetch_once(symbol, timeframe).await {
                Ok(closes) => {
                    if attempt > 1 {
                        tracing::info!(
                            symbol = %symbol,
                            "Market data recovered on attempt {}/{}",
                            attempt,
                            max_attempts
                        );
                    }
                    return Ok(closes);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt < max_attempts {
                        let delay =
                            self.policy
                                .delay_for(attempt, e.is_rate_limit(), &mut rand::thread_rng());
                        tracing::warn!(
                            symbol = %symbol,
                            "Market data attempt {}/{} failed ({}), retrying in {:.1}s",
                            attempt,
                            max_attempts,
                            e,
                            delay.as_secs_f64()
                        );
                        self.sleeper.sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(FetchError::Exhausted {
            attempts: max_attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".to_string()),
        })
    }

    async fn fetch_once(&self, symbol: &str, timeframe: Timeframe) -> Result<RecentCloses, FetchError> {
        let now = self.clock.now();
        let mut request = BarRequest::new(symbol, timeframe, self.bar_limit);
        request.start = Some(now - timeframe.lookback(self.bar_limit));

        let mut bars: Vec<Bar> = Vec::new();
        for _ in 0..MAX_PAGES {
            let page = self.source.get_bars(&request).await?;

            if let Some(remaining) = page.quota_remaining {
                if remaining <= LOW_QUOTA_WARNING {
                    tracing::warn!(
                        "{} quota nearly exhausted: {} requests remaining",
                        self.source.source_name(),
                        remaining
                    );
                } else {
                    tracing::debug!("{} quota remaining: {}", self.source.source_name(), remaining);
                }
            }

            bars.extend(page.bars);
            match page.next_page_token {
                Some(token) if bars.len() < self.bar_limit => request.page_token = Some(token),
                _ => break,
            }
        }

        to_recent_closes(symbol, bars, self.bar_limit, now)
    }
}

/// Sort oldest first, drop duplicate timestamps, keep the newest `limit`.
fn to_recent_closes(
    symbol: &str,
    mut bars: Vec<Bar>,
    limit: usize,
    fetched_at: chrono::DateTime<chrono::Utc>,
) -> Result<RecentCloses, FetchError> {
    if let Some(bad) = bars.iter().find(|b| !b.close.is_finite() || b.close <= 0.0) {
        return Err(FetchError::malformed(format!(
            "{} bar at {} has close {}",
            symbol, bad.timestamp, bad.close
        )));
    }

    bars.sort_by_key(|b| b.timestamp);
    bars.dedup_by_key(|b| b.timestamp);
    if bars.len() > limit {
        bars.drain(..bars.len() - limit);
    }

    Ok(RecentCloses {
        symbol: symbol.to_string(),
        timestamp: bars.last().map(|b| b.timestamp).unwrap_or(fetched_at),
        closes: bars.into_iter().map(|b| b.close).collect(),
    })
}
