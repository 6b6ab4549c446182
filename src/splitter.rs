use log::{debug, warn};

use crate::config::SplitConfig;
use crate::models::Dataset;

/// One purged fold. Indices point into the dataset's row vector.
#[derive(Debug, Clone)]
pub struct Split {
    pub fold: usize,
    pub train_indices: Vec<usize>,
    pub test_indices: Vec<usize>,
    /// Rows dropped from the end of the train window as the embargo gap.
    pub embargoed_rows: usize,
}

#[derive(Debug, Clone)]
pub struct SplitReport {
    pub splits: Vec<Split>,
    /// Set when date ordering carried no information and the split fell
    /// back to plain row order.
    pub chronological_fallback: bool,
    pub dropped_folds: usize,
    pub embargo_rows: usize,
}

/// Walk-forward cross-validation for time-ordered rows. Fold i tests on
/// the window [(i+1)/(k+1), (i+2)/(k+1)) of the chronologically sorted
/// rows and trains on everything strictly before it, minus an embargo gap
/// so labels with a forward horizon cannot leak backwards.
pub struct PurgedCrossValidator {
    config: SplitConfig,
}

impl PurgedCrossValidator {
    pub fn new(config: SplitConfig) -> Self {
        Self { config }
    }

    pub fn with_params(k_folds: usize, embargo_fraction: f64) -> Self {
        Self::new(SplitConfig {
            k_folds,
            embargo_fraction,
        })
    }

    pub fn split(&self, dataset: &Dataset) -> SplitReport {
        let order = chronological_order(dataset);
        let fallback = !has_date_variation(dataset);
        if fallback && dataset.len() > 1 {
            warn!("rows carry no usable date ordering, falling back to row order");
        }
        self.split_ordered(dataset.len(), order, fallback, true)
    }

    /// Plain chronological split without the embargo gap. Used as the
    /// last resort when every purged fold turns out single-class.
    pub fn split_chronological(&self, dataset: &Dataset) -> SplitReport {
        let order = chronological_order(dataset);
        self.split_ordered(dataset.len(), order, true, false)
    }

    fn split_ordered(
        &self,
        rows: usize,
        order: Vec<usize>,
        fallback: bool,
        embargoed: bool,
    ) -> SplitReport {
        let k = self.config.k_folds;
        let embargo_rows = if embargoed {
            (rows as f64 * self.config.embargo_fraction).floor() as usize
        } else {
            0
        };

        let mut splits = Vec::with_capacity(k);
        let mut dropped = 0usize;
        for fold in 0..k {
            let start = rows * (fold + 1) / (k + 1);
            let end = rows * (fold + 2) / (k + 1);
            let train_end = start.saturating_sub(embargo_rows);
            let train_indices: Vec<usize> = order[..train_end].to_vec();
            let test_indices: Vec<usize> = order[start..end].to_vec();
            if train_indices.is_empty() || test_indices.is_empty() {
                debug!(
                    "dropping fold {}: train={} test={} rows",
                    fold,
                    train_indices.len(),
                    test_indices.len()
                );
                dropped += 1;
                continue;
            }
            splits.push(Split {
                fold,
                train_indices,
                test_indices,
                embargoed_rows: start - train_end,
            });
        }

        if dropped > 0 {
            warn!("dropped {} of {} folds with empty windows", dropped, k);
        }

        SplitReport {
            splits,
            chronological_fallback: fallback,
            dropped_folds: dropped,
            embargo_rows,
        }
    }
}

/// Stable chronological permutation of row indices. Ties keep their
/// original relative order.
fn chronological_order(dataset: &Dataset) -> Vec<usize> {
    let mut order: Vec<usize> = (0..dataset.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = &dataset.rows[a];
        let rb = &dataset.rows[b];
        (ra.event_date, &ra.symbol).cmp(&(rb.event_date, &rb.symbol))
    });
    order
}

fn has_date_variation(dataset: &Dataset) -> bool {
    let mut dates = dataset.rows.iter().map(|row| row.event_date);
    match dates.next() {
        Some(first) => dates.any(|date| date != first),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataRow, EventType, RowOrigin};
    use chrono::NaiveDate;

    fn dated_dataset(rows: usize) -> Dataset {
        let base = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let rows = (0..rows)
            .map(|i| DataRow {
                symbol: "AAA".to_string(),
                event_date: base + chrono::Duration::days(i as i64),
                features: vec![i as f64],
                event_type: EventType::None,
                target_return: 0.0,
                origin: RowOrigin::Natural,
            })
            .collect();
        Dataset::new(vec!["f".to_string()], rows)
    }

    #[test]
    fn five_folds_over_a_thousand_rows_embargo_ten_each() {
        let dataset = dated_dataset(1000);
        let validator = PurgedCrossValidator::with_params(5, 0.01);
        let report = validator.split(&dataset);

        assert_eq!(report.splits.len(), 5);
        assert_eq!(report.dropped_folds, 0);
        assert!(!report.chronological_fallback);
        assert_eq!(report.embargo_rows, 10);

        let expected_windows = [(166, 333), (333, 500), (500, 666), (666, 833), (833, 1000)];
        for (split, (start, end)) in report.splits.iter().zip(expected_windows) {
            assert_eq!(split.embargoed_rows, 10);
            assert_eq!(split.test_indices.len(), end - start);
            assert_eq!(split.train_indices.len(), start - 10);
        }
    }

    #[test]
    fn train_rows_end_strictly_before_embargoed_test_window() {
        let dataset = dated_dataset(400);
        let validator = PurgedCrossValidator::with_params(4, 0.01);
        let report = validator.split(&dataset);
        assert!(!report.splits.is_empty());

        for split in &report.splits {
            let max_train_date = split
                .train_indices
                .iter()
                .map(|&i| dataset.rows[i].event_date)
                .max()
                .unwrap();
            let min_test_date = split
                .test_indices
                .iter()
                .map(|&i| dataset.rows[i].event_date)
                .min()
                .unwrap();
            let gap = (min_test_date - max_train_date).num_days();
            assert!(
                gap as usize > split.embargoed_rows,
                "fold {} gap {} with embargo {}",
                split.fold,
                gap,
                split.embargoed_rows
            );
        }
    }

    #[test]
    fn unsorted_input_is_split_in_date_order() {
        let mut dataset = dated_dataset(300);
        dataset.rows.reverse();
        let validator = PurgedCrossValidator::with_params(3, 0.0);
        let report = validator.split(&dataset);

        for split in &report.splits {
            let max_train_date = split
                .train_indices
                .iter()
                .map(|&i| dataset.rows[i].event_date)
                .max()
                .unwrap();
            let min_test_date = split
                .test_indices
                .iter()
                .map(|&i| dataset.rows[i].event_date)
                .min()
                .unwrap();
            assert!(max_train_date < min_test_date);
        }
    }

    #[test]
    fn tiny_dataset_drops_empty_folds_instead_of_panicking() {
        let dataset = dated_dataset(4);
        let validator = PurgedCrossValidator::with_params(5, 0.01);
        let report = validator.split(&dataset);

        assert!(report.splits.len() + report.dropped_folds == 5);
        assert!(report.dropped_folds > 0);
        for split in &report.splits {
            assert!(!split.train_indices.is_empty());
            assert!(!split.test_indices.is_empty());
        }
    }

    #[test]
    fn single_date_triggers_chronological_fallback_flag() {
        let date = NaiveDate::from_ymd_opt(2023, 6, 1).unwrap();
        let rows = (0..100)
            .map(|i| DataRow {
                symbol: format!("S{}", i),
                event_date: date,
                features: vec![i as f64],
                event_type: EventType::None,
                target_return: 0.0,
                origin: RowOrigin::Natural,
            })
            .collect();
        let dataset = Dataset::new(vec!["f".to_string()], rows);
        let validator = PurgedCrossValidator::with_params(4, 0.01);
        let report = validator.split(&dataset);

        assert!(report.chronological_fallback);
        assert!(!report.splits.is_empty());
    }

    #[test]
    fn chronological_split_skips_the_embargo() {
        let dataset = dated_dataset(500);
        let validator = PurgedCrossValidator::with_params(5, 0.01);
        let report = validator.split_chronological(&dataset);

        assert!(report.chronological_fallback);
        assert_eq!(report.embargo_rows, 0);
        for split in &report.splits {
            assert_eq!(split.embargoed_rows, 0);
        }
    }
}
