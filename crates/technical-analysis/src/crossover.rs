//! Trend predicates over EMA sequences.
//!
//! Every sequence is oldest first. Sequences of different lengths (EMA-5 is
//! longer than EMA-8 for the same closes) are aligned on their newest
//! element.

/// Bars a crossover must hold before it counts.
pub const DEFAULT_CONFIRMATION_BARS: usize = 3;

/// Bullish alignment: fast above mid above slow. Ties are not a trend.
pub fn is_uptrend(ema5: f64, ema8: f64, ema22: f64) -> bool {
    ema5 > ema8 && ema8 > ema22
}

/// `fast` crossed above `slow` and stayed there for the last three bars.
pub fn is_confirmed_crossover(fast: &[f64], slow: &[f64]) -> bool {
    confirmed_above(fast, slow, DEFAULT_CONFIRMATION_BARS)
}

/// Three-series form: EMA-5 over EMA-8 must be a confirmed crossover, and
/// EMA-8 over EMA-22 must follow the same pattern whenever EMA-22 has
/// enough history to judge.
pub fn is_confirmed_crossover_with_trend(ema5: &[f64], ema8: &[f64], ema22: &[f64]) -> bool {
    confirmed_crossover_with_trend(ema5, ema8, ema22, DEFAULT_CONFIRMATION_BARS)
}

pub fn confirmed_crossover_with_trend(
    ema5: &[f64],
    ema8: &[f64],
    ema22: &[f64],
    bars: usize,
) -> bool {
    if !confirmed_above(ema5, ema8, bars) {
        return false;
    }
    if ema8.len() < bars || ema22.len() < bars {
        // Not enough slow history: that half of the check is skipped.
        return true;
    }
    confirmed_above(ema8, ema22, bars)
}

/// `fast > slow` on each of the last `bars` aligned pairs, and, when one
/// more pair exists before them, `fast <= slow` on that pair.
///
/// With exactly `bars` pairs of history the prior bar cannot be checked and
/// the window alone decides.
pub fn confirmed_above(fast: &[f64], slow: &[f64], bars: usize) -> bool {
    if bars == 0 || fast.len() < bars || slow.len() < bars {
        return false;
    }

    let pairs = fast.len().min(slow.len());
    let fast = &fast[fast.len() - pairs..];
    let slow = &slow[slow.len() - pairs..];

    let window_start = pairs - bars;
    let held = fast[window_start..]
        .iter()
        .zip(&slow[window_start..])
        .all(|(f, s)| f > s);
    if !held {
        return false;
    }

    match window_start.checked_sub(1) {
        Some(prior) => fast[prior] <= slow[prior],
        None => true,
    }
}
