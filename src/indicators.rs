//! Series primitives for feature engineering. Every function returns a
//! vector aligned with its input and uses NaN as the undefined sentinel:
//! warm-up rows, rows inside unfillable gaps and degenerate divisions all
//! come back as NaN, never as a fabricated zero.

pub const EPSILON: f64 = 1e-12;

pub fn checked_div(numerator: f64, denominator: f64) -> f64 {
    if numerator.is_finite() && denominator.is_finite() && denominator.abs() > EPSILON {
        numerator / denominator
    } else {
        f64::NAN
    }
}

pub struct FillOutcome {
    pub values: Vec<f64>,
    /// Positions bridged from the last real observation.
    pub filled: usize,
    /// Positions left undefined: leading gaps or runs past the limit.
    pub remaining: usize,
}

/// Forward-fills missing values, bridging at most `limit` consecutive rows
/// from the last real observation. Non-finite inputs count as missing.
pub fn forward_fill_bounded(values: &[f64], limit: usize) -> FillOutcome {
    let mut filled = values.to_vec();
    let mut filled_count = 0usize;
    let mut remaining = 0usize;
    let mut last_real: Option<f64> = None;
    let mut gap = 0usize;

    for i in 0..filled.len() {
        if values[i].is_finite() {
            last_real = Some(values[i]);
            gap = 0;
        } else {
            filled[i] = f64::NAN;
            gap += 1;
            match last_real {
                Some(value) if gap <= limit => {
                    filled[i] = value;
                    filled_count += 1;
                }
                _ => remaining += 1,
            }
        }
    }

    FillOutcome {
        values: filled,
        filled: filled_count,
        remaining,
    }
}

/// Counts finite values inside the trailing window ending at each row.
/// Partial windows at the start of the series count what exists.
pub fn rolling_finite_counts(values: &[f64], window: usize) -> Vec<usize> {
    let mut counts = Vec::with_capacity(values.len());
    let mut in_window = 0usize;
    for i in 0..values.len() {
        if values[i].is_finite() {
            in_window += 1;
        }
        if i >= window && values[i - window].is_finite() {
            in_window -= 1;
        }
        counts.push(in_window);
    }
    counts
}

/// Mean of the finite values in each full trailing window. NaN until a
/// full window is available or when the window holds no finite value.
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 || values.len() < window {
        return out;
    }
    for i in (window - 1)..values.len() {
        let window_start = i + 1 - window;
        let mut sum = 0.0;
        let mut count = 0usize;
        for value in &values[window_start..=i] {
            if value.is_finite() {
                sum += value;
                count += 1;
            }
        }
        if count > 0 {
            out[i] = sum / count as f64;
        }
    }
    out
}

/// Population standard deviation over the finite values in each full
/// trailing window. Needs at least two finite values.
pub fn rolling_std(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 || values.len() < window {
        return out;
    }
    for i in (window - 1)..values.len() {
        let window_start = i + 1 - window;
        let finite: Vec<f64> = values[window_start..=i]
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        if finite.len() < 2 {
            continue;
        }
        let mean = finite.iter().sum::<f64>() / finite.len() as f64;
        let variance =
            finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / finite.len() as f64;
        out[i] = variance.sqrt();
    }
    out
}

pub fn rolling_max(values: &[f64], window: usize) -> Vec<f64> {
    rolling_extreme(values, window, |acc, v| if v > acc { v } else { acc })
}

pub fn rolling_min(values: &[f64], window: usize) -> Vec<f64> {
    rolling_extreme(values, window, |acc, v| if v < acc { v } else { acc })
}

fn rolling_extreme(values: &[f64], window: usize, pick: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 || values.len() < window {
        return out;
    }
    for i in (window - 1)..values.len() {
        let window_start = i + 1 - window;
        let mut acc = f64::NAN;
        for value in &values[window_start..=i] {
            if value.is_finite() {
                acc = if acc.is_finite() { pick(acc, *value) } else { *value };
            }
        }
        out[i] = acc;
    }
    out
}

/// Values moved `periods` rows later; the head stays undefined. Used for
/// baselines that must end strictly before the current row.
pub fn shift(values: &[f64], periods: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    for i in periods..values.len() {
        out[i] = values[i - periods];
    }
    out
}

/// Percent change against the value `periods` rows earlier, scaled by 100.
pub fn percent_change(values: &[f64], periods: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    for i in periods..values.len() {
        let prev = values[i - periods];
        let cur = values[i];
        if prev.is_finite() && cur.is_finite() && prev.abs() > EPSILON {
            out[i] = (cur - prev) / prev * 100.0;
        }
    }
    out
}

pub fn calculate_sma(values: &[f64], period: usize) -> Vec<f64> {
    rolling_mean(values, period)
}

/// EMA seeded with the mean of the first `period` finite values, then
/// updated recursively. Rows with missing input stay undefined while the
/// running state carries across them.
pub fn calculate_ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 {
        return out;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut seed_sum = 0.0;
    let mut seed_count = 0usize;
    let mut ema: Option<f64> = None;

    for i in 0..values.len() {
        let value = values[i];
        if !value.is_finite() {
            continue;
        }
        match ema {
            None => {
                seed_sum += value;
                seed_count += 1;
                if seed_count == period {
                    let seeded = seed_sum / period as f64;
                    ema = Some(seeded);
                    out[i] = seeded;
                }
            }
            Some(prev) => {
                let next = value * multiplier + prev * (1.0 - multiplier);
                ema = Some(next);
                out[i] = next;
            }
        }
    }
    out
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Wilder RSI. Needs `period` finite one-day deltas before its first
/// value, so on a dense series rsi_14 starts on bar 15.
pub fn calculate_rsi(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 {
        return out;
    }
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    let mut warm_deltas = 0usize;
    let mut seeded = false;

    for i in 1..values.len() {
        let prev = values[i - 1];
        let cur = values[i];
        if !prev.is_finite() || !cur.is_finite() {
            continue;
        }
        let delta = cur - prev;
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        if !seeded {
            avg_gain += gain;
            avg_loss += loss;
            warm_deltas += 1;
            if warm_deltas == period {
                avg_gain /= period as f64;
                avg_loss /= period as f64;
                seeded = true;
                out[i] = rsi_from_avgs(avg_gain, avg_loss);
            }
        } else {
            avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
            avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
            out[i] = rsi_from_avgs(avg_gain, avg_loss);
        }
    }
    out
}

pub fn calculate_macd(
    values: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let fast_ema = calculate_ema(values, fast_period);
    let slow_ema = calculate_ema(values, slow_period);

    let macd_line: Vec<f64> = (0..values.len())
        .map(|i| {
            if fast_ema[i].is_finite() && slow_ema[i].is_finite() {
                fast_ema[i] - slow_ema[i]
            } else {
                f64::NAN
            }
        })
        .collect();

    let signal_line = calculate_ema(&macd_line, signal_period);

    let histogram: Vec<f64> = (0..values.len())
        .map(|i| {
            if macd_line[i].is_finite() && signal_line[i].is_finite() {
                macd_line[i] - signal_line[i]
            } else {
                f64::NAN
            }
        })
        .collect();

    (macd_line, signal_line, histogram)
}

/// Position of the close inside the Bollinger band, 0 at the lower band
/// and 1 at the upper. A collapsed band reads as the neutral 0.5.
pub fn calculate_bollinger_percent_b(
    values: &[f64],
    period: usize,
    std_multiplier: f64,
) -> Vec<f64> {
    let middle = rolling_mean(values, period);
    let std = rolling_std(values, period);
    let mut out = vec![f64::NAN; values.len()];

    for i in 0..values.len() {
        if !values[i].is_finite() || !middle[i].is_finite() || !std[i].is_finite() {
            continue;
        }
        let band_width = 2.0 * std_multiplier * std[i];
        out[i] = if band_width <= EPSILON {
            0.5
        } else {
            let lower = middle[i] - std_multiplier * std[i];
            (values[i] - lower) / band_width
        };
    }
    out
}

pub fn calculate_stochastic(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    period: usize,
    smooth: usize,
) -> (Vec<f64>, Vec<f64>) {
    let highest = rolling_max(highs, period);
    let lowest = rolling_min(lows, period);
    let mut k = vec![f64::NAN; closes.len()];

    for i in 0..closes.len() {
        if !closes[i].is_finite() || !highest[i].is_finite() || !lowest[i].is_finite() {
            continue;
        }
        let range = highest[i] - lowest[i];
        k[i] = if range <= EPSILON {
            50.0
        } else {
            100.0 * (closes[i] - lowest[i]) / range
        };
    }

    let d = rolling_mean(&k, smooth);
    (k, d)
}

pub fn calculate_williams_r(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    period: usize,
) -> Vec<f64> {
    let highest = rolling_max(highs, period);
    let lowest = rolling_min(lows, period);
    let mut out = vec![f64::NAN; closes.len()];

    for i in 0..closes.len() {
        if !closes[i].is_finite() || !highest[i].is_finite() || !lowest[i].is_finite() {
            continue;
        }
        let range = highest[i] - lowest[i];
        out[i] = if range <= EPSILON {
            -50.0
        } else {
            -100.0 * (highest[i] - closes[i]) / range
        };
    }
    out
}

pub fn calculate_cci(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let typical: Vec<f64> = (0..closes.len())
        .map(|i| {
            if highs[i].is_finite() && lows[i].is_finite() && closes[i].is_finite() {
                (highs[i] + lows[i] + closes[i]) / 3.0
            } else {
                f64::NAN
            }
        })
        .collect();
    let typical_mean = rolling_mean(&typical, period);
    let mut out = vec![f64::NAN; closes.len()];
    if period == 0 || closes.len() < period {
        return out;
    }

    for i in (period - 1)..closes.len() {
        if !typical[i].is_finite() || !typical_mean[i].is_finite() {
            continue;
        }
        let window_start = i + 1 - period;
        let mut deviation_sum = 0.0;
        let mut count = 0usize;
        for value in &typical[window_start..=i] {
            if value.is_finite() {
                deviation_sum += (value - typical_mean[i]).abs();
                count += 1;
            }
        }
        if count == 0 {
            continue;
        }
        let mean_deviation = deviation_sum / count as f64;
        out[i] = if mean_deviation <= EPSILON {
            0.0
        } else {
            (typical[i] - typical_mean[i]) / (0.015 * mean_deviation)
        };
    }
    out
}

pub fn calculate_atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let mut true_range = vec![f64::NAN; closes.len()];

    // True range needs the previous close, so the first bar stays undefined
    for i in 1..closes.len() {
        if highs[i].is_finite() && lows[i].is_finite() && closes[i - 1].is_finite() {
            true_range[i] = (highs[i] - lows[i])
                .max((highs[i] - closes[i - 1]).abs())
                .max((lows[i] - closes[i - 1]).abs());
        }
    }

    rolling_mean(&true_range, period)
}
