use statrs::statistics::Statistics;

use crate::models::{
    ClassDistribution, Dataset, EventHistogram, EventType, FeatureProfile, FoldAggregate,
    FoldMetrics,
};

/// Fraction of rows classified correctly at the 0.5 threshold.
pub fn accuracy(probabilities: &[f64], labels: &[u8]) -> f64 {
    if probabilities.is_empty() || probabilities.len() != labels.len() {
        return 0.0;
    }
    let correct = probabilities
        .iter()
        .zip(labels)
        .filter(|(p, &label)| u8::from(**p >= 0.5) == label)
        .count();
    correct as f64 / probabilities.len() as f64
}

/// Rank-based ROC AUC with tied scores sharing their average rank.
/// Returns None when either class is absent, since the curve is
/// undefined there.
pub fn roc_auc(scores: &[f64], labels: &[u8]) -> Option<f64> {
    if scores.is_empty() || scores.len() != labels.len() {
        return None;
    }
    let positives = labels.iter().filter(|&&label| label == 1).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut positive_rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // 1-based ranks; a tied run shares its average rank.
        let average_rank = (i + j + 2) as f64 / 2.0;
        for &row in &order[i..=j] {
            if labels[row] == 1 {
                positive_rank_sum += average_rank;
            }
        }
        i = j + 1;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// Mean squared distance between predicted probabilities and labels.
pub fn brier_score(probabilities: &[f64], labels: &[u8]) -> f64 {
    if probabilities.is_empty() || probabilities.len() != labels.len() {
        return 0.0;
    }
    let sum: f64 = probabilities
        .iter()
        .zip(labels)
        .map(|(p, &label)| {
            let diff = p - label as f64;
            diff * diff
        })
        .sum();
    sum / probabilities.len() as f64
}

/// Column summaries over the defined (finite) values of every feature,
/// in schema order. Fully undefined columns report zeros.
pub fn feature_profiles(dataset: &Dataset) -> Vec<FeatureProfile> {
    dataset
        .feature_names
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let defined: Vec<f64> = dataset
                .column(index)
                .into_iter()
                .filter(|value| value.is_finite())
                .collect();
            profile_column(name, &defined)
        })
        .collect()
}

fn profile_column(name: &str, defined: &[f64]) -> FeatureProfile {
    if defined.is_empty() {
        return FeatureProfile {
            feature: name.to_string(),
            defined: 0,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            std: 0.0,
        };
    }
    FeatureProfile {
        feature: name.to_string(),
        defined: defined.len(),
        min: defined.iter().copied().fold(f64::INFINITY, f64::min),
        max: defined.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        mean: defined.mean(),
        std: if defined.len() > 1 {
            defined.std_dev()
        } else {
            0.0
        },
    }
}

/// Label counts per event type, before any binary target is chosen.
pub fn event_histogram(dataset: &Dataset) -> EventHistogram {
    let mut histogram = EventHistogram {
        moon: 0,
        rug: 0,
        none: 0,
    };
    for row in &dataset.rows {
        match row.event_type {
            EventType::Moon => histogram.moon += 1,
            EventType::Rug => histogram.rug += 1,
            EventType::None => histogram.none += 1,
        }
    }
    histogram
}

pub fn class_distribution(labels: &[u8]) -> ClassDistribution {
    let positives = labels.iter().filter(|&&label| label == 1).count();
    let negatives = labels.len() - positives;
    let positive_rate = if labels.is_empty() {
        0.0
    } else {
        positives as f64 / labels.len() as f64
    };
    ClassDistribution {
        positives,
        negatives,
        positive_rate,
    }
}

/// Population standard deviation; the spread of ensemble votes uses the
/// full population, not a sample estimate.
pub fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.population_std_dev()
}

/// Summarizes the evaluated folds. AUC statistics cover only the folds
/// where AUC was defined; they stay 0.0 when no fold had both classes.
pub fn aggregate_folds(fold_metrics: &[FoldMetrics], degenerate_folds: usize) -> Option<FoldAggregate> {
    if fold_metrics.is_empty() {
        return None;
    }
    let accuracies: Vec<f64> = fold_metrics.iter().map(|f| f.accuracy).collect();
    let aucs: Vec<f64> = fold_metrics.iter().filter_map(|f| f.auc).collect();

    let accuracy_mean = accuracies.clone().mean();
    let accuracy_std = if accuracies.len() > 1 {
        accuracies.std_dev()
    } else {
        0.0
    };
    let (auc_mean, auc_std) = if aucs.is_empty() {
        (0.0, 0.0)
    } else {
        let mean = aucs.clone().mean();
        let std = if aucs.len() > 1 { aucs.std_dev() } else { 0.0 };
        (mean, std)
    };

    Some(FoldAggregate {
        folds: fold_metrics.len(),
        degenerate_folds,
        accuracy_mean,
        accuracy_std,
        auc_mean,
        auc_std,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataRow, RowOrigin};
    use chrono::NaiveDate;

    #[test]
    fn accuracy_counts_the_half_threshold_as_positive() {
        let probabilities = [0.9, 0.5, 0.1, 0.4];
        let labels = [1, 1, 0, 1];
        assert!((accuracy(&probabilities, &labels) - 0.75).abs() < 1e-9);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn auc_is_one_for_perfect_ranking_and_zero_when_inverted() {
        let labels = [0, 0, 1, 1];
        assert_eq!(roc_auc(&[0.1, 0.2, 0.8, 0.9], &labels), Some(1.0));
        assert_eq!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &labels), Some(0.0));
    }

    #[test]
    fn auc_shares_rank_across_ties() {
        // Of the four positive/negative pairs, three are concordant and
        // the tie at 0.5 contributes half: (3 + 0.5) / 4.
        let scores = [0.1, 0.5, 0.5, 0.9];
        let labels = [0, 0, 1, 1];
        let auc = roc_auc(&scores, &labels).unwrap();
        assert!((auc - 0.875).abs() < 1e-9);
    }

    #[test]
    fn auc_is_undefined_with_a_single_class() {
        assert_eq!(roc_auc(&[0.1, 0.9], &[1, 1]), None);
        assert_eq!(roc_auc(&[0.1, 0.9], &[0, 0]), None);
        assert_eq!(roc_auc(&[], &[]), None);
    }

    #[test]
    fn brier_score_penalizes_confident_misses() {
        let score = brier_score(&[1.0, 0.0], &[0, 1]);
        assert!((score - 1.0).abs() < 1e-9);
        let calibrated = brier_score(&[0.8, 0.2], &[1, 0]);
        assert!((calibrated - 0.04).abs() < 1e-9);
    }

    #[test]
    fn distribution_reports_counts_and_rate() {
        let distribution = class_distribution(&[1, 0, 0, 0]);
        assert_eq!(distribution.positives, 1);
        assert_eq!(distribution.negatives, 3);
        assert!((distribution.positive_rate - 0.25).abs() < 1e-9);
    }

    #[test]
    fn aggregate_skips_undefined_aucs_and_handles_single_folds() {
        let folds = vec![
            FoldMetrics {
                fold: 0,
                train_rows: 100,
                test_rows: 50,
                embargoed_rows: 1,
                accuracy: 0.8,
                auc: Some(0.7),
            },
            FoldMetrics {
                fold: 1,
                train_rows: 150,
                test_rows: 50,
                embargoed_rows: 1,
                accuracy: 0.6,
                auc: None,
            },
        ];
        let aggregate = aggregate_folds(&folds, 1).unwrap();
        assert_eq!(aggregate.folds, 2);
        assert_eq!(aggregate.degenerate_folds, 1);
        assert!((aggregate.accuracy_mean - 0.7).abs() < 1e-9);
        assert!((aggregate.auc_mean - 0.7).abs() < 1e-9);
        assert_eq!(aggregate.auc_std, 0.0);

        assert!(aggregate_folds(&[], 0).is_none());
    }

    #[test]
    fn vote_spread_uses_the_population_formula() {
        assert!((population_std(&[0.2, 0.4]) - 0.1).abs() < 1e-9);
        assert_eq!(population_std(&[0.5]), 0.0);
        assert_eq!(population_std(&[]), 0.0);
    }

    fn profiled_row(day: u32, event: EventType, features: Vec<f64>) -> DataRow {
        DataRow {
            symbol: "AAA".to_string(),
            event_date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            features,
            event_type: event,
            target_return: 0.0,
            origin: RowOrigin::Natural,
        }
    }

    #[test]
    fn profiles_skip_undefined_values_and_zero_empty_columns() {
        let dataset = Dataset::new(
            vec!["a".to_string(), "b".to_string()],
            vec![
                profiled_row(1, EventType::None, vec![1.0, f64::NAN]),
                profiled_row(2, EventType::None, vec![f64::NAN, f64::NAN]),
                profiled_row(3, EventType::None, vec![3.0, f64::NAN]),
            ],
        );
        let profiles = feature_profiles(&dataset);

        assert_eq!(profiles[0].feature, "a");
        assert_eq!(profiles[0].defined, 2);
        assert!((profiles[0].min - 1.0).abs() < 1e-9);
        assert!((profiles[0].max - 3.0).abs() < 1e-9);
        assert!((profiles[0].mean - 2.0).abs() < 1e-9);
        assert!((profiles[0].std - std::f64::consts::SQRT_2).abs() < 1e-9);

        assert_eq!(profiles[1].defined, 0);
        assert_eq!(profiles[1].mean, 0.0);
        assert_eq!(profiles[1].std, 0.0);
    }

    #[test]
    fn histogram_counts_every_event_type() {
        let dataset = Dataset::new(
            vec!["a".to_string()],
            vec![
                profiled_row(1, EventType::Moon, vec![1.0]),
                profiled_row(2, EventType::None, vec![2.0]),
                profiled_row(3, EventType::Rug, vec![3.0]),
                profiled_row(4, EventType::None, vec![4.0]),
            ],
        );
        let histogram = event_histogram(&dataset);
        assert_eq!(histogram.moon, 1);
        assert_eq!(histogram.rug, 1);
        assert_eq!(histogram.none, 2);
    }
}
