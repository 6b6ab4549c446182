use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::config::BalancerConfig;
use crate::models::{DataRow, Dataset, EventType, HardNegativeKind, RowOrigin};

/// Passes over the candidate pool before the synthesizer gives up on an
/// unfilled budget. Later passes re-clone the same anchors with a higher
/// variant counter.
const MAX_VARIANT_PASSES: u32 = 4;

/// Augments rare-event datasets with hard negatives cloned from real
/// near-miss rows. The natural positive rate is preserved to within the
/// configured tolerance; no synthetic positives are ever created.
pub struct DatasetBalancer {
    config: BalancerConfig,
    seed: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSummary {
    pub rows_before: usize,
    pub rows_after: usize,
    pub positives: usize,
    pub positive_rate_before: f64,
    pub positive_rate_after: f64,
    pub budget: usize,
    pub added_almost_moon: usize,
    pub added_failed_breakout: usize,
    pub added_fake_volume: usize,
}

impl DatasetBalancer {
    pub fn new(config: BalancerConfig, seed: u64) -> Self {
        Self { config, seed }
    }

    pub fn balance(&self, dataset: &Dataset, target: EventType) -> (Dataset, BalanceSummary) {
        let rows_before = dataset.len();
        let positives = dataset.positive_count(target);
        let rate_before = dataset.positive_rate(target);
        let budget = self.hard_negative_budget(positives, rows_before, rate_before);

        let mut summary = BalanceSummary {
            rows_before,
            rows_after: rows_before,
            positives,
            positive_rate_before: rate_before,
            positive_rate_after: rate_before,
            budget,
            ..BalanceSummary::default()
        };
        if rows_before == 0 || budget == 0 {
            return (dataset.clone(), summary);
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut pools = self.candidate_pools(dataset, target);
        for pool in pools.iter_mut() {
            pool.shuffle(&mut rng);
        }
        debug!(
            "hard negative candidates: almost_moon={}, failed_breakout={}, fake_volume={}, budget={}",
            pools[0].len(),
            pools[1].len(),
            pools[2].len(),
            budget
        );

        // Round-robin across the three kinds so no single pattern
        // dominates the synthetic block
        let mut synthetic: Vec<DataRow> = Vec::with_capacity(budget);
        let mut cursors = [0usize; 3];
        let mut pass = 0u32;
        'outer: while synthetic.len() < budget && pass < MAX_VARIANT_PASSES {
            let mut progressed = false;
            for (slot, kind) in HardNegativeKind::ALL.iter().enumerate() {
                if synthetic.len() >= budget {
                    break 'outer;
                }
                if cursors[slot] >= pools[slot].len() {
                    continue;
                }
                let row_index = pools[slot][cursors[slot]];
                cursors[slot] += 1;
                progressed = true;
                let clone = self.jitter_clone(
                    &mut rng,
                    &dataset.feature_names,
                    &dataset.rows[row_index],
                    *kind,
                    pass,
                );
                match kind {
                    HardNegativeKind::AlmostMoon => summary.added_almost_moon += 1,
                    HardNegativeKind::FailedBreakout => summary.added_failed_breakout += 1,
                    HardNegativeKind::FakeVolume => summary.added_fake_volume += 1,
                }
                synthetic.push(clone);
            }
            if !progressed {
                pass += 1;
                cursors = [0; 3];
                if pools.iter().all(|pool| pool.is_empty()) {
                    break;
                }
            }
        }

        if synthetic.is_empty() {
            info!("no hard negative candidates found, dataset unchanged");
            return (dataset.clone(), summary);
        }

        let mut balanced = dataset.clone();
        balanced.rows.extend(synthetic);
        balanced.sort_chronologically();

        summary.rows_after = balanced.len();
        summary.positive_rate_after = balanced.positive_rate(target);
        info!(
            "added {} hard negatives ({} almost, {} breakout, {} volume): positive rate {:.4} -> {:.4}",
            summary.rows_after - summary.rows_before,
            summary.added_almost_moon,
            summary.added_failed_breakout,
            summary.added_fake_volume,
            summary.positive_rate_before,
            summary.positive_rate_after
        );

        (balanced, summary)
    }

    /// Largest synthetic count that keeps the positive rate within the
    /// absolute tolerance: positives / (rows + budget) >= rate - tolerance.
    fn hard_negative_budget(&self, positives: usize, rows: usize, rate: f64) -> usize {
        if rows == 0 {
            return 0;
        }
        let floor_rate = rate - self.config.positive_rate_tolerance;
        if positives == 0 || floor_rate <= 0.0 {
            return self.config.max_hard_negatives;
        }
        let max_rows = (positives as f64 / floor_rate).floor() as usize;
        max_rows
            .saturating_sub(rows)
            .min(self.config.max_hard_negatives)
    }

    /// Candidate row indices per kind, in dataset order. A row qualifies
    /// for at most one kind, tested in the order of `HardNegativeKind::ALL`.
    fn candidate_pools(&self, dataset: &Dataset, target: EventType) -> [Vec<usize>; 3] {
        let config = &self.config;
        let momentum_index = dataset.feature_index(&config.momentum_feature);
        let volume_index = dataset.feature_index(&config.volume_feature);
        if momentum_index.is_none() {
            warn!(
                "feature {} not found, skipping failed_breakout candidates",
                config.momentum_feature
            );
        }
        if volume_index.is_none() {
            warn!(
                "feature {} not found, skipping fake_volume candidates",
                config.volume_feature
            );
        }

        let almost_floor = config.label_return_threshold * config.almost_fraction;
        let mut pools: [Vec<usize>; 3] = [Vec::new(), Vec::new(), Vec::new()];

        for (index, row) in dataset.rows.iter().enumerate() {
            if row.event_type == target || row.origin.is_synthetic() {
                continue;
            }
            let oriented = oriented_return(target, row.target_return);

            if oriented >= almost_floor && oriented < config.label_return_threshold {
                pools[0].push(index);
                continue;
            }
            if let Some(momentum) = momentum_index.and_then(|i| row.feature(i)) {
                if momentum >= config.breakout_momentum_min
                    && oriented <= config.breakout_return_cap
                {
                    pools[1].push(index);
                    continue;
                }
            }
            if let Some(volume_ratio) = volume_index.and_then(|i| row.feature(i)) {
                if volume_ratio >= config.fake_volume_ratio_min
                    && oriented.abs() <= config.fake_volume_move_cap
                {
                    pools[2].push(index);
                }
            }
        }

        pools
    }

    /// Clones a real near-miss row, perturbing every continuous feature a
    /// little. Binary features (spike flags, isnan companions) are copied
    /// verbatim so they stay binary.
    fn jitter_clone(
        &self,
        rng: &mut StdRng,
        feature_names: &[String],
        row: &DataRow,
        kind: HardNegativeKind,
        variant: u32,
    ) -> DataRow {
        let config = &self.config;
        let mut features = row.features.clone();
        for (index, value) in features.iter_mut().enumerate() {
            if !value.is_finite() {
                continue;
            }
            let name = feature_names
                .get(index)
                .map(|n| n.as_str())
                .unwrap_or_default();
            if name.ends_with("_isnan") || name.starts_with("volume_spike") {
                continue;
            }
            let original = *value;
            let magnitude = (original * config.jitter_relative)
                .abs()
                .max(config.jitter_absolute);
            let mut jittered = original + rng.gen_range(-magnitude..=magnitude);
            if (0.0..=1.0).contains(&original) {
                jittered = jittered.clamp(0.0, 1.0);
            }
            *value = jittered;
        }

        DataRow {
            symbol: row.symbol.clone(),
            event_date: row.event_date,
            features,
            event_type: row.event_type,
            target_return: row.target_return,
            origin: RowOrigin::Synthetic { kind, variant },
        }
    }
}

/// Signed return pointed toward the target event, so "almost" bands mean
/// the same thing whether the pipeline hunts moons or rugs.
fn oriented_return(target: EventType, target_return: f64) -> f64 {
    match target {
        EventType::Rug => -target_return,
        _ => target_return,
    }
}
