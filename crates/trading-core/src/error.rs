use std::fmt;
use thiserror::Error;

/// Why the market is considered closed for a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketClosedReason {
    Weekend,
    Holiday(&'static str),
    OutsideSession,
}

impl fmt::Display for MarketClosedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketClosedReason::Weekend => f.write_str("weekend"),
            MarketClosedReason::Holiday(name) => write!(f, "holiday ({})", name),
            MarketClosedReason::OutsideSession => f.write_str("outside regular session"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// Not retried and not a failure: the caller should simply skip the cycle.
    #[error("market closed: {0}")]
    MarketClosed(MarketClosedReason),

    /// A single request failed. `retryable` and `rate_limited` are decided
    /// where the failure is observed, not by matching the message later.
    #[error("market data request failed: {message}")]
    Upstream {
        message: String,
        status: Option<u16>,
        retryable: bool,
        rate_limited: bool,
    },

    /// Every allowed attempt failed.
    #[error("market data unavailable after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl FetchError {
    /// Classify an HTTP error response.
    ///
    /// 429 is a rate limit; 408 and 5xx are transient; anything else
    /// (401/403/404/422, ...) is a permanent request problem. A body that
    /// reads like a rate-limit message marks the error as rate limited even
    /// when the provider used another status code.
    pub fn from_status(status: u16, body: &str) -> Self {
        let rate_limited = status == 429 || looks_rate_limited(body);
        let retryable = rate_limited || status == 408 || (500..=599).contains(&status);
        FetchError::Upstream {
            message: format!("HTTP {}: {}", status, body.trim()),
            status: Some(status),
            retryable,
            rate_limited,
        }
    }

    /// Classify a failure that only comes with text (transport errors,
    /// wrapped client errors). Transport failures are transient by default.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        FetchError::Upstream {
            rate_limited: looks_rate_limited(&message),
            retryable: true,
            status: None,
            message,
        }
    }

    /// A response that arrived but could not be decoded. Retried: providers
    /// occasionally return truncated bodies under load.
    pub fn malformed(message: impl Into<String>) -> Self {
        FetchError::Upstream {
            message: format!("malformed response: {}", message.into()),
            status: None,
            retryable: true,
            rate_limited: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Upstream { retryable: true, .. })
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, FetchError::Upstream { rate_limited: true, .. })
    }

    pub fn is_market_closed(&self) -> bool {
        matches!(self, FetchError::MarketClosed(_))
    }
}

/// Text patterns providers use for throttling: "rate limit", "too many
/// requests", and a bare "429" status echoed in the body.
fn looks_rate_limited(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate-limit")
        || lower.contains("too many requests")
        || lower.contains("429")
}
