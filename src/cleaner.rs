use dashmap::DashMap;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use statrs::statistics::{Data, OrderStatistics};
use std::collections::BTreeMap;

use crate::config::CleanerConfig;
use crate::indicators::{
    calculate_atr, calculate_bollinger_percent_b, calculate_cci, calculate_ema, calculate_macd,
    calculate_rsi, calculate_sma, calculate_stochastic, calculate_williams_r, checked_div,
    forward_fill_bounded, percent_change, rolling_finite_counts, rolling_mean, rolling_std, shift,
};
use crate::models::{DataRow, Dataset};

const OPEN: &str = "open";
const HIGH: &str = "high";
const LOW: &str = "low";
const CLOSE: &str = "close";
const VOLUME: &str = "volume";

/// Turns raw per-symbol OHLCV rows into a dense, fully finite feature
/// table without ever letting future bars leak into a row. The cleaner is
/// total: malformed series degrade to undefined values, undefined values
/// degrade to medians, and the summary reports what happened.
pub struct FeatureCleaner {
    config: CleanerConfig,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanSummary {
    pub rows: usize,
    pub symbols: usize,
    pub input_features: usize,
    pub output_features: usize,
    pub forward_filled: usize,
    pub unfillable: usize,
    pub pruned_features: Vec<String>,
    pub imputed_values: usize,
    pub reimputed_values: usize,
    pub sparse_derived_features: Vec<String>,
    pub skipped_feature_groups: Vec<String>,
}

struct SymbolColumns {
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
    filled: usize,
    remaining: usize,
}

impl FeatureCleaner {
    pub fn new(config: CleanerConfig) -> Self {
        Self { config }
    }

    pub fn clean(&self, dataset: &Dataset) -> (Dataset, CleanSummary) {
        let mut summary = CleanSummary {
            rows: dataset.len(),
            input_features: dataset.feature_names.len(),
            ..CleanSummary::default()
        };
        if dataset.is_empty() {
            return (
                Dataset::new(dataset.feature_names.clone(), Vec::new()),
                summary,
            );
        }

        let mut ordered = dataset.clone();
        ordered.sort_chronologically();

        let mut by_symbol: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, row) in ordered.rows.iter().enumerate() {
            by_symbol.entry(row.symbol.clone()).or_default().push(index);
        }
        let symbol_indices: Vec<(String, Vec<usize>)> = by_symbol.into_iter().collect();
        summary.symbols = symbol_indices.len();
        summary.skipped_feature_groups = skipped_groups(&ordered.feature_names);

        let workers = std::cmp::min(
            symbol_indices.len(),
            std::cmp::max(1, num_cpus::get()),
        );
        debug!(
            "cleaning {} rows across {} symbols ({} workers)",
            ordered.len(),
            symbol_indices.len(),
            workers
        );

        // Steps 1-4 run per symbol: bounded forward-fill, guarded
        // indicators, lag-safe volume features and isnan companions.
        let blocks: DashMap<String, SymbolColumns> = DashMap::new();
        let config = &self.config;
        let ordered_ref = &ordered;
        symbol_indices.par_iter().for_each(|(symbol, indices)| {
            let raw_series: Vec<Vec<f64>> = (0..ordered_ref.feature_names.len())
                .map(|column| {
                    indices
                        .iter()
                        .map(|&g| {
                            ordered_ref.rows[g]
                                .features
                                .get(column)
                                .copied()
                                .unwrap_or(f64::NAN)
                        })
                        .collect()
                })
                .collect();
            let block = build_symbol_columns(config, &ordered_ref.feature_names, &raw_series);
            blocks.insert(symbol.clone(), block);
        });

        // Deterministic assembly in symbol order
        let row_count = ordered.len();
        let mut names: Vec<String> = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();
        for (symbol, indices) in &symbol_indices {
            let block = match blocks.remove(symbol) {
                Some((_, block)) => block,
                None => continue,
            };
            if names.is_empty() {
                names = block.names.clone();
                columns = vec![vec![f64::NAN; row_count]; names.len()];
            }
            summary.forward_filled += block.filled;
            summary.unfillable += block.remaining;
            for (c, column) in block.columns.iter().enumerate() {
                for (local, &global) in indices.iter().enumerate() {
                    columns[c][global] = column[local];
                }
            }
        }

        // Step 5: dataset-wide pruning of mostly-undefined columns
        let mut kept_names: Vec<String> = Vec::new();
        let mut kept_columns: Vec<Vec<f64>> = Vec::new();
        for (name, column) in names.into_iter().zip(columns.into_iter()) {
            let missing = column.iter().filter(|v| !v.is_finite()).count();
            let fraction = missing as f64 / row_count as f64;
            if fraction > self.config.prune_missing_fraction {
                debug!(
                    "pruning feature {} with {} missing",
                    name,
                    format_percentage(missing, row_count)
                );
                summary.pruned_features.push(name);
            } else {
                kept_names.push(name);
                kept_columns.push(column);
            }
        }

        // Step 6: median imputation of everything still undefined
        for column in kept_columns.iter_mut() {
            summary.imputed_values += impute_with_median(column);
        }

        // Step 7: derived features over the now-dense columns, still
        // restricted to causal windows
        let mut sparse_derived = Vec::new();
        let derived = self.build_derived(&kept_names, &kept_columns, &symbol_indices, row_count);
        for (name, column) in derived {
            let missing = column.iter().filter(|v| !v.is_finite()).count();
            if missing as f64 / row_count as f64 > self.config.prune_missing_fraction {
                warn!(
                    "derived feature {} is mostly undefined ({})",
                    name,
                    format_percentage(missing, row_count)
                );
                sparse_derived.push(name.clone());
            }
            kept_names.push(name);
            kept_columns.push(column);
        }
        summary.sparse_derived_features = sparse_derived;

        // Step 8: sanitize infinities, then re-impute
        for column in kept_columns.iter_mut() {
            for value in column.iter_mut() {
                if value.is_infinite() {
                    *value = f64::NAN;
                }
            }
            summary.reimputed_values += impute_with_median(column);
        }

        let rows: Vec<DataRow> = ordered
            .rows
            .iter()
            .enumerate()
            .map(|(g, row)| DataRow {
                symbol: row.symbol.clone(),
                event_date: row.event_date,
                features: kept_columns.iter().map(|column| column[g]).collect(),
                event_type: row.event_type,
                target_return: row.target_return,
                origin: row.origin,
            })
            .collect();

        summary.output_features = kept_names.len();
        info!(
            "cleaned {} rows for {} symbols: {} -> {} features, filled {}, imputed {}, pruned {}",
            summary.rows,
            summary.symbols,
            summary.input_features,
            summary.output_features,
            summary.forward_filled,
            summary.imputed_values,
            summary.pruned_features.len()
        );

        (Dataset::new(kept_names, rows), summary)
    }

    fn build_derived(
        &self,
        kept_names: &[String],
        kept_columns: &[Vec<f64>],
        symbol_indices: &[(String, Vec<usize>)],
        row_count: usize,
    ) -> Vec<(String, Vec<f64>)> {
        let config = &self.config;
        let index_of = |name: &str| kept_names.iter().position(|n| n == name);
        let mut derived: Vec<(String, Vec<f64>)> = Vec::new();

        if let (Some(high), Some(low)) = (index_of(HIGH), index_of(LOW)) {
            let column: Vec<f64> = (0..row_count)
                .map(|g| checked_div(kept_columns[high][g], kept_columns[low][g]))
                .collect();
            derived.push(("high_low_ratio".to_string(), column));
        }
        if let (Some(close), Some(open)) = (index_of(CLOSE), index_of(OPEN)) {
            let column: Vec<f64> = (0..row_count)
                .map(|g| checked_div(kept_columns[close][g], kept_columns[open][g]))
                .collect();
            derived.push(("close_open_ratio".to_string(), column));
        }
        if let Some(close) = index_of(CLOSE) {
            for &window in &config.sma_windows {
                if let Some(sma) = index_of(&format!("sma_{}", window)) {
                    let column: Vec<f64> = (0..row_count)
                        .map(|g| checked_div(kept_columns[close][g], kept_columns[sma][g]))
                        .collect();
                    derived.push((format!("close_sma_{}_ratio", window), column));
                }
            }

            // Momentum, volatility and gap need per-symbol series again
            let mut momentum: Vec<Vec<f64>> = config
                .momentum_periods
                .iter()
                .map(|_| vec![f64::NAN; row_count])
                .collect();
            let mut volatility: Vec<Vec<f64>> = config
                .volatility_windows
                .iter()
                .map(|_| vec![f64::NAN; row_count])
                .collect();
            let open = index_of(OPEN);
            let mut gap: Option<Vec<f64>> = open.map(|_| vec![f64::NAN; row_count]);

            for (_, indices) in symbol_indices {
                let closes: Vec<f64> = indices.iter().map(|&g| kept_columns[close][g]).collect();
                for (slot, &period) in config.momentum_periods.iter().enumerate() {
                    let series = percent_change(&closes, period);
                    for (local, &global) in indices.iter().enumerate() {
                        momentum[slot][global] = series[local];
                    }
                }
                let returns = percent_change(&closes, 1);
                for (slot, &window) in config.volatility_windows.iter().enumerate() {
                    let series = rolling_std(&returns, window);
                    for (local, &global) in indices.iter().enumerate() {
                        volatility[slot][global] = series[local];
                    }
                }
                if let (Some(open), Some(gap)) = (open, gap.as_mut()) {
                    let opens: Vec<f64> = indices.iter().map(|&g| kept_columns[open][g]).collect();
                    let prev_close = shift(&closes, 1);
                    for (local, &global) in indices.iter().enumerate() {
                        gap[global] =
                            checked_div(opens[local] - prev_close[local], prev_close[local])
                                * 100.0;
                    }
                }
            }

            for (slot, &period) in config.momentum_periods.iter().enumerate() {
                derived.push((format!("momentum_{}", period), std::mem::take(&mut momentum[slot])));
            }
            for (slot, &window) in config.volatility_windows.iter().enumerate() {
                derived.push((
                    format!("volatility_{}", window),
                    std::mem::take(&mut volatility[slot]),
                ));
            }
            if let Some(gap) = gap {
                derived.push(("gap_pct".to_string(), gap));
            }
        }

        derived
    }
}

/// Applies the real-observation guard: the value at row `i` survives only
/// when the trailing `window` rows hold at least `min_periods` real
/// (pre-fill) observations.
fn apply_min_periods(
    values: Vec<f64>,
    presence: &[f64],
    window: usize,
    min_periods: usize,
) -> Vec<f64> {
    let counts = rolling_finite_counts(presence, window);
    values
        .into_iter()
        .enumerate()
        .map(|(i, value)| if counts[i] >= min_periods { value } else { f64::NAN })
        .collect()
}

fn build_symbol_columns(
    config: &CleanerConfig,
    input_names: &[String],
    raw_series: &[Vec<f64>],
) -> SymbolColumns {
    let rows = raw_series.first().map(|series| series.len()).unwrap_or(0);
    let mut names: Vec<String> = Vec::with_capacity(input_names.len() * 2);
    let mut columns: Vec<Vec<f64>> = Vec::with_capacity(input_names.len() * 2);
    let mut filled = 0usize;
    let mut remaining = 0usize;

    // Step 1: bounded forward-fill of every input column
    for (name, series) in input_names.iter().zip(raw_series) {
        let outcome = forward_fill_bounded(series, config.forward_fill_limit);
        filled += outcome.filled;
        remaining += outcome.remaining;
        names.push(name.clone());
        columns.push(outcome.values);
    }

    let input_index = |name: &str| input_names.iter().position(|n| n == name);
    let prefill = |name: &str| input_index(name).map(|i| raw_series[i].clone());
    let close_prefill = prefill(CLOSE);
    let high_prefill = prefill(HIGH);
    let low_prefill = prefill(LOW);
    let volume_prefill = prefill(VOLUME);
    let close = input_index(CLOSE).map(|i| columns[i].clone());
    let high = input_index(HIGH).map(|i| columns[i].clone());
    let low = input_index(LOW).map(|i| columns[i].clone());
    let volume = input_index(VOLUME).map(|i| columns[i].clone());

    // Step 2: indicators guarded by real-observation counts
    let indicator_start = names.len();
    if let (Some(close_prefill), Some(close)) = (&close_prefill, &close) {
        for &window in &config.sma_windows {
            names.push(format!("sma_{}", window));
            columns.push(apply_min_periods(
                calculate_sma(close, window),
                close_prefill,
                window,
                config.min_periods(window),
            ));
        }
        for &window in &config.ema_windows {
            names.push(format!("ema_{}", window));
            columns.push(apply_min_periods(
                calculate_ema(close, window),
                close_prefill,
                window,
                config.min_periods(window),
            ));
        }

        let rsi_window = config.rsi_period + 1;
        names.push(format!("rsi_{}", config.rsi_period));
        columns.push(apply_min_periods(
            calculate_rsi(close, config.rsi_period),
            close_prefill,
            rsi_window,
            config.min_periods(rsi_window),
        ));

        let (macd_line, macd_signal, macd_histogram) = calculate_macd(
            close,
            config.macd_fast,
            config.macd_slow,
            config.macd_signal,
        );
        let line_window = config.macd_slow;
        let signal_window = config.macd_slow + config.macd_signal - 1;
        names.push("macd_line".to_string());
        columns.push(apply_min_periods(
            macd_line,
            close_prefill,
            line_window,
            config.min_periods(line_window),
        ));
        names.push("macd_signal".to_string());
        columns.push(apply_min_periods(
            macd_signal,
            close_prefill,
            signal_window,
            config.min_periods(signal_window),
        ));
        names.push("macd_histogram".to_string());
        columns.push(apply_min_periods(
            macd_histogram,
            close_prefill,
            signal_window,
            config.min_periods(signal_window),
        ));

        names.push(format!("bollinger_pct_b_{}", config.bollinger_period));
        columns.push(apply_min_periods(
            calculate_bollinger_percent_b(close, config.bollinger_period, config.bollinger_std),
            close_prefill,
            config.bollinger_period,
            config.min_periods(config.bollinger_period),
        ));
    }

    if let (Some(high), Some(low), Some(close)) = (&high, &low, &close) {
        // Range indicators need every leg of the bar to be real
        let presence: Vec<f64> = (0..rows)
            .map(|i| {
                let real = high_prefill.as_ref().map_or(false, |s| s[i].is_finite())
                    && low_prefill.as_ref().map_or(false, |s| s[i].is_finite())
                    && close_prefill.as_ref().map_or(false, |s| s[i].is_finite());
                if real {
                    1.0
                } else {
                    f64::NAN
                }
            })
            .collect();

        let (stoch_k, stoch_d) = calculate_stochastic(
            high,
            low,
            close,
            config.stochastic_period,
            config.stochastic_smooth,
        );
        let k_window = config.stochastic_period;
        let d_window = config.stochastic_period + config.stochastic_smooth - 1;
        names.push(format!("stochastic_k_{}", config.stochastic_period));
        columns.push(apply_min_periods(
            stoch_k,
            &presence,
            k_window,
            config.min_periods(k_window),
        ));
        names.push(format!("stochastic_d_{}", config.stochastic_period));
        columns.push(apply_min_periods(
            stoch_d,
            &presence,
            d_window,
            config.min_periods(d_window),
        ));

        names.push(format!("williams_r_{}", config.williams_period));
        columns.push(apply_min_periods(
            calculate_williams_r(high, low, close, config.williams_period),
            &presence,
            config.williams_period,
            config.min_periods(config.williams_period),
        ));

        names.push(format!("cci_{}", config.cci_period));
        columns.push(apply_min_periods(
            calculate_cci(high, low, close, config.cci_period),
            &presence,
            config.cci_period,
            config.min_periods(config.cci_period),
        ));

        let atr_window = config.atr_period + 1;
        names.push(format!("atr_{}", config.atr_period));
        columns.push(apply_min_periods(
            calculate_atr(high, low, close, config.atr_period),
            &presence,
            atr_window,
            config.min_periods(atr_window),
        ));
    }
    let indicator_end = names.len();

    // Step 3: volume features against baselines that end one row earlier
    if let (Some(volume_prefill), Some(volume)) = (&volume_prefill, &volume) {
        let shifted = shift(volume, 1);
        let shifted_presence = shift(volume_prefill, 1);
        for &window in &config.volume_ratio_windows {
            let baseline = rolling_mean(&shifted, window);
            let ratio: Vec<f64> = (0..rows)
                .map(|i| checked_div(volume[i], baseline[i]))
                .collect();
            let ratio = apply_min_periods(
                ratio,
                &shifted_presence,
                window,
                config.min_periods(window),
            );
            let spike: Vec<f64> = ratio
                .iter()
                .map(|r| {
                    if r.is_finite() {
                        f64::from(u8::from(*r >= config.volume_spike_ratio))
                    } else {
                        f64::NAN
                    }
                })
                .collect();
            names.push(format!("volume_ratio_{}", window));
            columns.push(ratio);
            names.push(format!("volume_spike_{}", window));
            columns.push(spike);
        }

        let fast = rolling_mean(&shifted, config.volume_trend_fast);
        let slow = rolling_mean(&shifted, config.volume_trend_slow);
        let trend: Vec<f64> = (0..rows).map(|i| checked_div(fast[i], slow[i])).collect();
        names.push("volume_trend".to_string());
        columns.push(apply_min_periods(
            trend,
            &shifted_presence,
            config.volume_trend_slow,
            config.min_periods(config.volume_trend_slow),
        ));
    }

    // Step 4: missingness companions for every guarded indicator
    for index in indicator_start..indicator_end {
        let companion: Vec<f64> = columns[index]
            .iter()
            .map(|v| if v.is_finite() { 0.0 } else { 1.0 })
            .collect();
        let name = format!("{}_isnan", names[index]);
        names.push(name);
        columns.push(companion);
    }

    SymbolColumns {
        names,
        columns,
        filled,
        remaining,
    }
}

fn impute_with_median(column: &mut [f64]) -> usize {
    let finite: Vec<f64> = column.iter().copied().filter(|v| v.is_finite()).collect();
    let mut count = 0usize;
    if finite.is_empty() {
        warn!("imputing all-undefined column with 0.0");
        for value in column.iter_mut() {
            if !value.is_finite() {
                *value = 0.0;
                count += 1;
            }
        }
        return count;
    }
    let mut data = Data::new(finite);
    let median = data.median();
    for value in column.iter_mut() {
        if !value.is_finite() {
            *value = median;
            count += 1;
        }
    }
    count
}

fn skipped_groups(input_names: &[String]) -> Vec<String> {
    let has = |name: &str| input_names.iter().any(|n| n == name);
    let mut skipped = Vec::new();
    if !has(CLOSE) {
        skipped.push("price_indicators".to_string());
    }
    if !(has(HIGH) && has(LOW) && has(CLOSE)) {
        skipped.push("range_indicators".to_string());
    }
    if !has(VOLUME) {
        skipped.push("volume_features".to_string());
    }
    if !(has(OPEN) && has(CLOSE)) {
        skipped.push("gap_pct".to_string());
    }
    skipped
}

fn format_percentage(count: usize, total: usize) -> String {
    if total == 0 {
        return format!("{} (0.00%)", count);
    }
    let percent = count as f64 / total as f64 * 100.0;
    format!("{} ({:.2}%)", count, percent)
}
