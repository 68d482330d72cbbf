use thiserror::Error;
use trading_core::{FetchError, MarketClosedReason};

/// Failure of one symbol's cycle, a reconciliation step or an exit.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("market closed: {0}")]
    MarketClosed(MarketClosedReason),

    #[error("market data unavailable after {attempts} attempts: {last_error}")]
    FetchExhausted { attempts: u32, last_error: String },

    /// The provider refused the request outright (bad symbol, credentials).
    #[error("market data request rejected: {0}")]
    FetchRejected(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("active position already exists for user {user_id} on {symbol}")]
    ConcurrencyConflict { user_id: i64, symbol: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

impl EngineError {
    pub fn broker(err: anyhow::Error) -> Self {
        EngineError::Broker(format!("{:#}", err))
    }
}

impl From<FetchError> for EngineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::MarketClosed(reason) => EngineError::MarketClosed(reason),
            FetchError::Exhausted {
                attempts,
                last_error,
            } => EngineError::FetchExhausted {
                attempts,
                last_error,
            },
            other @ FetchError::Upstream { .. } => EngineError::FetchRejected(other.to_string()),
        }
    }
}

/// True when a database error is the partial unique index on active
/// positions rejecting a second row.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.is_unique_violation() || db.message().contains("UNIQUE constraint failed")
        }
        _ => false,
    }
}
