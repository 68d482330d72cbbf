//! Market-data acquisition: US market calendar, retry policy and the
//! resilient close-price fetcher used by the trading cycle.

pub mod backoff;
pub mod calendar;
pub mod fetcher;

pub use backoff::{RetryPolicy, Sleeper, TokioSleeper};
pub use calendar::{easter_sunday, holiday_on, holidays, MarketCalendar};
pub use fetcher::MarketDataFetcher;
