use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// OHLCV bar data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One page of bars as returned by a market-data provider.
#[derive(Debug, Clone, Default)]
pub struct BarPage {
    pub bars: Vec<Bar>,
    pub next_page_token: Option<String>,
    /// Remaining request quota reported by the provider, if any
    pub quota_remaining: Option<u32>,
}

/// Parameters for a single bar request.
#[derive(Debug, Clone)]
pub struct BarRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub limit: usize,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub page_token: Option<String>,
}

impl BarRequest {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe, limit: usize) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            limit,
            start: None,
            end: None,
            page_token: None,
        }
    }
}

/// Closing prices for a symbol, oldest first.
#[derive(Debug, Clone)]
pub struct RecentCloses {
    pub symbol: String,
    pub closes: Vec<f64>,
    /// Timestamp of the newest bar (or fetch time when no bars came back)
    pub timestamp: DateTime<Utc>,
}

impl RecentCloses {
    pub fn latest(&self) -> Option<f64> {
        self.closes.last().copied()
    }
}

/// Bar timeframe supported by the polling scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
}

impl Timeframe {
    pub fn to_minutes(&self) -> i64 {
        match self {
            Timeframe::Minute1 => 1,
            Timeframe::Minute5 => 5,
            Timeframe::Minute15 => 15,
            Timeframe::Minute30 => 30,
            Timeframe::Hour1 => 60,
            Timeframe::Hour4 => 240,
            Timeframe::Day1 => 1440,
        }
    }

    /// Short form used in settings and persisted rows ("5m", "1h", ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Minute1 => "1m",
            Timeframe::Minute5 => "5m",
            Timeframe::Minute15 => "15m",
            Timeframe::Minute30 => "30m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour4 => "4h",
            Timeframe::Day1 => "1d",
        }
    }

    /// How often a symbol on this timeframe is polled.
    pub fn poll_interval(&self) -> Duration {
        Duration::minutes(self.to_minutes())
    }

    /// Calendar window wide enough to contain `bars` bars of this timeframe,
    /// allowing for nights, weekends and holidays.
    pub fn lookback(&self, bars: usize) -> Duration {
        let bars = bars.max(1) as i64;
        match self {
            Timeframe::Day1 => Duration::days(bars * 2 + 7),
            _ => {
                // ~6.5 trading hours a day; pad for closed sessions
                let trading_minutes_per_day = 390;
                let days = (bars * self.to_minutes()) / trading_minutes_per_day + 1;
                Duration::days(days * 2 + 4)
            }
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1m" | "1min" => Ok(Timeframe::Minute1),
            "5m" | "5min" => Ok(Timeframe::Minute5),
            "15m" | "15min" => Ok(Timeframe::Minute15),
            "30m" | "30min" => Ok(Timeframe::Minute30),
            "1h" | "1hour" => Ok(Timeframe::Hour1),
            "4h" | "4hour" => Ok(Timeframe::Hour4),
            "1d" | "1day" | "daily" => Ok(Timeframe::Day1),
            other => Err(format!("unknown timeframe '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_round_trips_short_form() {
        for tf in [
            Timeframe::Minute1,
            Timeframe::Minute5,
            Timeframe::Minute15,
            Timeframe::Minute30,
            Timeframe::Hour1,
            Timeframe::Hour4,
            Timeframe::Day1,
        ] {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
    }

    #[test]
    fn timeframe_rejects_unknown() {
        assert!("2m".parse::<Timeframe>().is_err());
        assert!("".parse::<Timeframe>().is_err());
    }

    #[test]
    fn lookback_covers_requested_bars() {
        // 100 five-minute bars need at least two trading sessions
        assert!(Timeframe::Minute5.lookback(100) >= Duration::days(2));
        assert!(Timeframe::Day1.lookback(100) >= Duration::days(140));
    }
}
