use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Standard EMA smoothing factor (α = 2 / (period + 1)).
pub const DEFAULT_SMOOTHING: f64 = 2.0;

/// Periods tracked by the crossover strategy.
pub const FAST_PERIOD: usize = 5;
pub const MID_PERIOD: usize = 8;
pub const SLOW_PERIOD: usize = 22;
pub const STRATEGY_PERIODS: [usize; 3] = [FAST_PERIOD, MID_PERIOD, SLOW_PERIOD];

/// Simple Moving Average
pub fn sma(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return vec![];
    }

    let mut result = Vec::with_capacity(data.len() - period + 1);
    for i in period - 1..data.len() {
        let sum: f64 = data[i + 1 - period..=i].iter().sum();
        result.push(sum / period as f64);
    }
    result
}

/// Exponential Moving Average series.
///
/// `data` must be oldest first. The first element is the SMA of the first
/// `period` prices; every later price `p` moves the average by
/// `(p - ema) * α`. The result has `data.len() - period + 1` elements, or
/// none when there is not enough history.
pub fn ema_with_smoothing(data: &[f64], period: usize, smoothing: f64) -> Vec<f64> {
    let seed = match sma(data, period).first() {
        Some(&seed) => seed,
        None => return vec![],
    };

    let multiplier = smoothing / (period as f64 + 1.0);
    let mut result = Vec::with_capacity(data.len() - period + 1);
    result.push(seed);

    let mut current = seed;
    for &price in &data[period..] {
        current = (price - current) * multiplier + current;
        result.push(current);
    }

    result
}

/// Exponential Moving Average series with the standard smoothing factor.
pub fn ema(data: &[f64], period: usize) -> Vec<f64> {
    ema_with_smoothing(data, period, DEFAULT_SMOOTHING)
}

/// Latest EMA value, or `None` when `prices` is shorter than `period`.
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    calculate_ema_with_smoothing(prices, period, DEFAULT_SMOOTHING)
}

pub fn calculate_ema_with_smoothing(prices: &[f64], period: usize, smoothing: f64) -> Option<f64> {
    ema_with_smoothing(prices, period, smoothing).last().copied()
}

/// EMA sequence for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaSeries {
    pub latest: f64,
    pub values: Vec<f64>,
}

/// EMA sequences for several periods over the same prices.
///
/// All or nothing: if the prices cannot seed the longest requested period,
/// no period gets a series.
pub fn calculate_ema_series(prices: &[f64], periods: &[usize]) -> BTreeMap<usize, EmaSeries> {
    let mut out = BTreeMap::new();

    let longest = match periods.iter().max() {
        Some(&p) if p > 0 => p,
        _ => return out,
    };
    if prices.len() < longest || periods.contains(&0) {
        return out;
    }

    for &period in periods {
        let values = ema(prices, period);
        if let Some(&latest) = values.last() {
            out.insert(period, EmaSeries { latest, values });
        }
    }

    out
}

/// The three strategy EMAs for one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyEmas {
    pub ema5: EmaSeries,
    pub ema8: EmaSeries,
    pub ema22: EmaSeries,
}

impl StrategyEmas {
    /// Compute EMA-5/8/22, or `None` when history is too short for EMA-22.
    pub fn from_closes(closes: &[f64]) -> Option<Self> {
        let mut series = calculate_ema_series(closes, &STRATEGY_PERIODS);
        Some(Self {
            ema5: series.remove(&FAST_PERIOD)?,
            ema8: series.remove(&MID_PERIOD)?,
            ema22: series.remove(&SLOW_PERIOD)?,
        })
    }

    /// Latest values as `(ema5, ema8, ema22)`.
    pub fn latest(&self) -> (f64, f64, f64) {
        (self.ema5.latest, self.ema8.latest, self.ema22.latest)
    }
}
