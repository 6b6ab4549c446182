use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::calibration::IsotonicCalibrator;
use crate::config::{ClassWeightMode, ClassWeights, SplitConfig, TrainerConfig, TrainerMode};
use crate::errors::{QualityFlag, StageError};
use crate::learner::boosted::{BoostedConfig, BoostedTrees};
use crate::learner::forest::{BaggedForest, ForestConfig};
use crate::learner::{BaseLearner, BaseLearnerKind};
use crate::metrics;
use crate::models::{Dataset, EventType, FeatureImportance, FoldMetrics, TrainingMetrics};
use crate::splitter::{PurgedCrossValidator, Split};

const TOP_IMPORTANCES: usize = 10;

/// Fitted ensemble with its calibration curve. This is the unit the
/// artifact store serializes, so everything here must round-trip
/// through bincode bit for bit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibratedModel {
    pub feature_names: Vec<String>,
    learners: Vec<BaseLearner>,
    calibrator: Option<IsotonicCalibrator>,
}

impl CalibratedModel {
    /// Mean of the base learner votes before calibration.
    pub fn raw_score(&self, row: &[f64]) -> f64 {
        let votes = self.votes(row);
        mean_vote(&votes)
    }

    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        self.calibrate(self.raw_score(row))
    }

    /// Calibrated probability plus how much the base learners agreed on
    /// it. Agreement is 1 minus the spread of the votes, so a single
    /// learner always reports full agreement.
    pub fn predict_with_agreement(&self, row: &[f64]) -> (f64, f64) {
        let votes = self.votes(row);
        let probability = self.calibrate(mean_vote(&votes));
        let agreement = (1.0 - metrics::population_std(&votes)).clamp(0.0, 1.0);
        (probability, agreement)
    }

    pub fn learner_kinds(&self) -> Vec<BaseLearnerKind> {
        self.learners.iter().map(|learner| learner.kind()).collect()
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrator.is_some()
    }

    fn votes(&self, row: &[f64]) -> Vec<f64> {
        self.learners
            .iter()
            .map(|learner| learner.predict_proba(row))
            .collect()
    }

    fn calibrate(&self, raw: f64) -> f64 {
        let value = match &self.calibrator {
            Some(calibrator) => calibrator.predict(raw),
            None => raw,
        };
        value.clamp(0.0, 1.0)
    }

    /// Importance shares averaged across learners, renormalized to 1.
    pub fn feature_importances(&self) -> Vec<f64> {
        let width = self.feature_names.len();
        let mut totals = vec![0.0; width];
        for learner in &self.learners {
            for (slot, share) in totals.iter_mut().zip(learner.feature_importances()) {
                *slot += share;
            }
        }
        let total: f64 = totals.iter().sum();
        if total > 0.0 {
            for slot in &mut totals {
                *slot /= total;
            }
        }
        totals
    }
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub model: CalibratedModel,
    pub metrics: TrainingMetrics,
}

/// Fits the configured base learners, evaluates them across purged
/// folds and calibrates the voted score. One instance trains one target
/// event with one seed.
pub struct EnsembleTrainer {
    config: TrainerConfig,
    target: EventType,
    seed: u64,
}

impl EnsembleTrainer {
    pub fn new(config: TrainerConfig, target: EventType, seed: u64) -> Self {
        Self {
            config,
            target,
            seed,
        }
    }

    pub fn train(
        &self,
        dataset: &Dataset,
        split_config: &SplitConfig,
        class_weights: Option<ClassWeights>,
    ) -> Result<TrainOutcome, StageError> {
        if dataset.is_empty() {
            return Err(StageError::EmptyDataset);
        }
        let kinds = self.learner_kinds()?;

        let labels = dataset.labels(self.target);
        let features: Vec<Vec<f64>> = dataset.rows.iter().map(|row| row.features.clone()).collect();
        let weights = self.resolve_weights(&labels, class_weights);
        let distribution = metrics::class_distribution(&labels);
        info!(
            "training {} model for {} on {} rows ({} positives), learners: {:?}",
            self.config.mode.as_str(),
            self.target.as_str(),
            dataset.len(),
            distribution.positives,
            kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>()
        );

        let validator = PurgedCrossValidator::new(split_config.clone());
        let eval_report = validator.split(dataset);
        let calibration_validator = PurgedCrossValidator::with_params(
            self.config.calibration_folds,
            self.config.calibration_embargo_fraction,
        );
        let calibration_report = calibration_validator.split(dataset);

        let bar = ProgressBar::new(
            (eval_report.splits.len() + calibration_report.splits.len() + 1) as u64,
        );
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .unwrap()
                .progress_chars("#>-"),
        );

        let mut flags: Vec<QualityFlag> = Vec::new();
        if eval_report.chronological_fallback {
            push_flag(&mut flags, QualityFlag::ChronologicalFallback);
        }

        // Walk-forward evaluation on the purged folds.
        let mut fold_metrics =
            self.evaluate_folds(&features, &labels, &weights, &kinds, &eval_report.splits, &bar);
        let mut degenerate = count_degenerate(&fold_metrics);

        // When every fold came back single-class the purged windows carry
        // no signal; retry on the plain chronological split before giving
        // up on fold metrics entirely.
        let all_degenerate =
            fold_metrics.is_empty() || degenerate == fold_metrics.len();
        if all_degenerate && !eval_report.chronological_fallback && dataset.len() > 1 {
            warn!("every purged fold was single-class, re-evaluating on a chronological split");
            let fallback_report = validator.split_chronological(dataset);
            bar.inc_length(fallback_report.splits.len() as u64);
            let fallback_metrics = self.evaluate_folds(
                &features,
                &labels,
                &weights,
                &kinds,
                &fallback_report.splits,
                &bar,
            );
            if !fallback_metrics.is_empty() {
                fold_metrics = fallback_metrics;
                degenerate = count_degenerate(&fold_metrics);
                push_flag(&mut flags, QualityFlag::ChronologicalFallback);
            }
        }
        if degenerate > 0 {
            push_flag(&mut flags, QualityFlag::DegenerateFolds);
        }
        if self.config.mode == TrainerMode::Single {
            self.check_fold_stability(&fold_metrics, &mut flags);
        }

        // Calibration curve from pooled out-of-fold votes.
        let calibrator = self.fit_calibrator(
            &features,
            &labels,
            &weights,
            &kinds,
            &calibration_report.splits,
            &bar,
        );
        if calibrator.is_none() {
            warn!("isotonic calibration unavailable, serving raw ensemble scores");
            push_flag(&mut flags, QualityFlag::CalibrationFallback);
        }

        // Final model on the full training window.
        let learners: Vec<BaseLearner> = kinds
            .iter()
            .map(|&kind| self.fit_kind(kind, &features, &labels, &weights))
            .collect();
        bar.inc(1);
        bar.finish_with_message("Training completed");

        let model = CalibratedModel {
            feature_names: dataset.feature_names.clone(),
            learners,
            calibrator,
        };

        let metrics = self.build_metrics(dataset, &model, &features, &labels, fold_metrics, flags);
        Ok(TrainOutcome { model, metrics })
    }

    fn learner_kinds(&self) -> Result<Vec<BaseLearnerKind>, StageError> {
        let kinds = match self.config.mode {
            TrainerMode::Ensemble => self.config.capabilities.enabled_kinds(),
            TrainerMode::Single => {
                if self.config.capabilities.is_enabled(self.config.single_learner) {
                    vec![self.config.single_learner]
                } else {
                    Vec::new()
                }
            }
        };
        if kinds.is_empty() {
            return Err(StageError::NoLearnersEnabled);
        }
        Ok(kinds)
    }

    fn resolve_weights(&self, labels: &[u8], explicit: Option<ClassWeights>) -> Vec<f64> {
        let (negative, positive) = match explicit {
            Some(weights) => (weights.negative, weights.positive),
            None => match self.config.class_weight_mode {
                ClassWeightMode::Natural => (1.0, 1.0),
                ClassWeightMode::Balanced => {
                    let total = labels.len() as f64;
                    let positives =
                        labels.iter().filter(|&&label| label == 1).count() as f64;
                    let negatives = total - positives;
                    (
                        if negatives > 0.0 { total / (2.0 * negatives) } else { 1.0 },
                        if positives > 0.0 { total / (2.0 * positives) } else { 1.0 },
                    )
                }
            },
        };
        labels
            .iter()
            .map(|&label| if label == 1 { positive } else { negative })
            .collect()
    }

    // Folds are independent fits, so they fan out across the rayon pool.
    // Every fold derives its randomness from the same trainer seed and
    // the collected order follows the split order, keeping the result
    // identical at any thread count.
    fn evaluate_folds(
        &self,
        features: &[Vec<f64>],
        labels: &[u8],
        weights: &[f64],
        kinds: &[BaseLearnerKind],
        splits: &[Split],
        bar: &ProgressBar,
    ) -> Vec<FoldMetrics> {
        splits
            .par_iter()
            .filter_map(|split| {
                if split.train_indices.is_empty() || split.test_indices.is_empty() {
                    bar.inc(1);
                    return None;
                }
                let (train_features, train_labels, train_weights) =
                    subset(features, labels, weights, &split.train_indices);
                let learners: Vec<BaseLearner> = kinds
                    .iter()
                    .map(|&kind| {
                        self.fit_kind(kind, &train_features, &train_labels, &train_weights)
                    })
                    .collect();

                let probabilities: Vec<f64> = split
                    .test_indices
                    .iter()
                    .map(|&row| vote(&learners, &features[row]))
                    .collect();
                let test_labels: Vec<u8> =
                    split.test_indices.iter().map(|&row| labels[row]).collect();

                let accuracy = metrics::accuracy(&probabilities, &test_labels);
                let auc = metrics::roc_auc(&probabilities, &test_labels);
                debug!(
                    "fold {}: train {} test {} embargoed {} accuracy {:.4} auc {:?}",
                    split.fold,
                    split.train_indices.len(),
                    split.test_indices.len(),
                    split.embargoed_rows,
                    accuracy,
                    auc
                );
                bar.inc(1);
                Some(FoldMetrics {
                    fold: split.fold,
                    train_rows: split.train_indices.len(),
                    test_rows: split.test_indices.len(),
                    embargoed_rows: split.embargoed_rows,
                    accuracy,
                    auc,
                })
            })
            .collect()
    }

    /// Pools out-of-fold votes from a short internal walk-forward pass
    /// and fits the isotonic curve on them. Fitting on training-window
    /// votes directly would reward overfit learners with a steeper
    /// curve.
    fn fit_calibrator(
        &self,
        features: &[Vec<f64>],
        labels: &[u8],
        weights: &[f64],
        kinds: &[BaseLearnerKind],
        splits: &[Split],
        bar: &ProgressBar,
    ) -> Option<IsotonicCalibrator> {
        let mut pooled: Vec<(f64, f64, f64)> = Vec::new();
        for split in splits {
            if split.train_indices.is_empty() || split.test_indices.is_empty() {
                bar.inc(1);
                continue;
            }
            let (train_features, train_labels, train_weights) =
                subset(features, labels, weights, &split.train_indices);
            let learners: Vec<BaseLearner> = kinds
                .iter()
                .map(|&kind| self.fit_kind(kind, &train_features, &train_labels, &train_weights))
                .collect();
            for &row in &split.test_indices {
                pooled.push((
                    vote(&learners, &features[row]),
                    labels[row] as f64,
                    weights[row],
                ));
            }
            bar.inc(1);
        }
        if pooled.is_empty() {
            return None;
        }
        IsotonicCalibrator::fit(&pooled)
    }

    fn fit_kind(
        &self,
        kind: BaseLearnerKind,
        features: &[Vec<f64>],
        labels: &[u8],
        weights: &[f64],
    ) -> BaseLearner {
        let targets: Vec<f64> = labels.iter().map(|&label| label as f64).collect();
        match kind {
            BaseLearnerKind::Bagged => {
                let config = ForestConfig {
                    n_trees: self.config.n_trees,
                    max_depth: self.config.max_depth,
                    min_samples_split: self.config.min_samples_split,
                    min_samples_leaf: self.config.min_samples_leaf,
                    max_features: self.config.max_features,
                    seed: self.seed,
                };
                BaseLearner::Bagged(BaggedForest::fit(config, features, &targets, weights))
            }
            BaseLearnerKind::Boosted => {
                let config = BoostedConfig {
                    n_rounds: self.config.boost_rounds,
                    learning_rate: self.config.boost_learning_rate,
                    max_depth: self.config.boost_max_depth,
                    min_samples_split: self.config.min_samples_split,
                    min_samples_leaf: self.config.min_samples_leaf,
                    subsample: self.config.boost_subsample,
                    // Offset keeps the boosting sample stream independent
                    // of the forest bootstraps.
                    seed: self.seed.wrapping_add(1),
                };
                BaseLearner::Boosted(BoostedTrees::fit(config, features, &targets, weights))
            }
        }
    }

    fn check_fold_stability(&self, fold_metrics: &[FoldMetrics], flags: &mut Vec<QualityFlag>) {
        let aucs: Vec<f64> = fold_metrics.iter().filter_map(|f| f.auc).collect();
        if aucs.len() < 2 {
            return;
        }
        let mean = aucs.iter().sum::<f64>() / aucs.len() as f64;
        let std = metrics::population_std(&aucs);
        if mean > 0.0 && std > self.config.instability_ratio * mean {
            warn!(
                "fold AUC dispersion {:.4} exceeds {:.0}% of the mean {:.4}",
                std,
                self.config.instability_ratio * 100.0,
                mean
            );
            push_flag(flags, QualityFlag::UnstableFolds);
        }
    }

    fn build_metrics(
        &self,
        dataset: &Dataset,
        model: &CalibratedModel,
        features: &[Vec<f64>],
        labels: &[u8],
        fold_metrics: Vec<FoldMetrics>,
        mut flags: Vec<QualityFlag>,
    ) -> TrainingMetrics {
        let mut probabilities = Vec::with_capacity(features.len());
        let mut agreements = Vec::with_capacity(features.len());
        for row in features {
            let (probability, agreement) = model.predict_with_agreement(row);
            probabilities.push(probability);
            agreements.push(agreement);
        }

        let training_accuracy = metrics::accuracy(&probabilities, labels);
        let training_auc = metrics::roc_auc(&probabilities, labels);
        if training_auc.is_none() {
            warn!("training AUC undefined, a single class remains after balancing");
            push_flag(&mut flags, QualityFlag::AucUndefined);
        }
        let brier = metrics::brier_score(&probabilities, labels);

        let agreement_mean = if agreements.is_empty() {
            1.0
        } else {
            agreements.iter().sum::<f64>() / agreements.len() as f64
        };
        let agreement_min = agreements.iter().copied().fold(1.0, f64::min);

        let top_importances = self.audit_importances(dataset, model, &mut flags);
        let fold_aggregate =
            metrics::aggregate_folds(&fold_metrics, count_degenerate(&fold_metrics));

        TrainingMetrics {
            train_rows: dataset.len(),
            class_distribution: metrics::class_distribution(labels),
            training_accuracy,
            training_auc: training_auc.unwrap_or(0.0),
            training_auc_defined: training_auc.is_some(),
            brier_score: brier,
            agreement_mean,
            agreement_min,
            fold_metrics,
            fold_aggregate,
            top_importances,
            flags,
        }
    }

    fn audit_importances(
        &self,
        dataset: &Dataset,
        model: &CalibratedModel,
        flags: &mut Vec<QualityFlag>,
    ) -> Vec<FeatureImportance> {
        let shares = model.feature_importances();
        let mut ranked: Vec<(usize, f64)> = shares
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, share)| *share > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        if let Some(&(index, share)) = ranked.first() {
            if share > self.config.importance_flag_threshold {
                let name = dataset
                    .feature_names
                    .get(index)
                    .map(String::as_str)
                    .unwrap_or("?");
                warn!(
                    "feature {} holds {:.1}% of the importance mass, check for leakage",
                    name,
                    share * 100.0
                );
                push_flag(flags, QualityFlag::HighImportanceConcentration);
            }
        }

        ranked
            .into_iter()
            .take(TOP_IMPORTANCES)
            .map(|(index, share)| FeatureImportance {
                feature: dataset
                    .feature_names
                    .get(index)
                    .cloned()
                    .unwrap_or_default(),
                share,
            })
            .collect()
    }
}

fn subset(
    features: &[Vec<f64>],
    labels: &[u8],
    weights: &[f64],
    indices: &[usize],
) -> (Vec<Vec<f64>>, Vec<u8>, Vec<f64>) {
    let mut sub_features = Vec::with_capacity(indices.len());
    let mut sub_labels = Vec::with_capacity(indices.len());
    let mut sub_weights = Vec::with_capacity(indices.len());
    for &row in indices {
        sub_features.push(features[row].clone());
        sub_labels.push(labels[row]);
        sub_weights.push(weights[row]);
    }
    (sub_features, sub_labels, sub_weights)
}

fn vote(learners: &[BaseLearner], row: &[f64]) -> f64 {
    let votes: Vec<f64> = learners
        .iter()
        .map(|learner| learner.predict_proba(row))
        .collect();
    mean_vote(&votes)
}

fn mean_vote(votes: &[f64]) -> f64 {
    if votes.is_empty() {
        return 0.5;
    }
    votes.iter().sum::<f64>() / votes.len() as f64
}

fn count_degenerate(fold_metrics: &[FoldMetrics]) -> usize {
    fold_metrics.iter().filter(|f| f.auc.is_none()).count()
}

fn push_flag(flags: &mut Vec<QualityFlag>, flag: QualityFlag) {
    if !flags.contains(&flag) {
        flags.push(flag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataRow, RowOrigin};
    use chrono::NaiveDate;

    fn synthetic_dataset(rows: usize) -> Dataset {
        let feature_names = vec!["signal".to_string(), "noise".to_string()];
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let rows: Vec<DataRow> = (0..rows)
            .map(|i| {
                let positive = i % 5 == 0;
                let signal = if positive { 2.0 } else { -2.0 };
                let noise = ((i * 31) % 17) as f64 / 17.0 - 0.5;
                DataRow {
                    symbol: "TEST".to_string(),
                    event_date: start + chrono::Duration::days(i as i64),
                    features: vec![signal + noise * 0.2, noise],
                    event_type: if positive { EventType::Moon } else { EventType::None },
                    target_return: if positive { 0.6 } else { 0.0 },
                    origin: RowOrigin::Natural,
                }
            })
            .collect();
        Dataset::new(feature_names, rows)
    }

    fn quiet_config() -> TrainerConfig {
        TrainerConfig {
            n_trees: 15,
            max_depth: 4,
            boost_rounds: 15,
            ..TrainerConfig::default()
        }
    }

    fn split_config() -> SplitConfig {
        SplitConfig {
            k_folds: 3,
            embargo_fraction: 0.01,
        }
    }

    #[test]
    fn empty_dataset_is_a_fatal_error() {
        let trainer = EnsembleTrainer::new(quiet_config(), EventType::Moon, 42);
        let dataset = Dataset::new(vec!["a".to_string()], Vec::new());
        assert!(matches!(
            trainer.train(&dataset, &split_config(), None),
            Err(StageError::EmptyDataset)
        ));
    }

    #[test]
    fn disabling_every_learner_is_a_fatal_error() {
        let mut config = quiet_config();
        config.capabilities.bagged = false;
        config.capabilities.boosted = false;
        let trainer = EnsembleTrainer::new(config, EventType::Moon, 42);
        assert!(matches!(
            trainer.train(&synthetic_dataset(60), &split_config(), None),
            Err(StageError::NoLearnersEnabled)
        ));
    }

    #[test]
    fn ensemble_mode_trains_both_families_and_scores_the_signal() {
        let trainer = EnsembleTrainer::new(quiet_config(), EventType::Moon, 42);
        let dataset = synthetic_dataset(120);
        let outcome = trainer.train(&dataset, &split_config(), None).unwrap();

        let kinds = outcome.model.learner_kinds();
        assert_eq!(kinds.len(), 2);
        assert!(outcome.metrics.training_auc_defined);
        assert!(outcome.metrics.training_auc > 0.9);

        let positive = outcome.model.predict_proba(&[2.0, 0.0]);
        let negative = outcome.model.predict_proba(&[-2.0, 0.0]);
        assert!(positive > negative);
    }

    #[test]
    fn single_mode_uses_one_learner_and_reports_full_agreement() {
        let mut config = quiet_config();
        config.mode = TrainerMode::Single;
        config.single_learner = BaseLearnerKind::Boosted;
        let trainer = EnsembleTrainer::new(config, EventType::Moon, 42);
        let outcome = trainer
            .train(&synthetic_dataset(120), &split_config(), None)
            .unwrap();

        assert_eq!(
            outcome.model.learner_kinds(),
            vec![BaseLearnerKind::Boosted]
        );
        assert_eq!(outcome.metrics.agreement_mean, 1.0);
        assert_eq!(outcome.metrics.agreement_min, 1.0);
    }

    #[test]
    fn same_seed_reproduces_identical_predictions() {
        let dataset = synthetic_dataset(100);
        let first = EnsembleTrainer::new(quiet_config(), EventType::Moon, 7)
            .train(&dataset, &split_config(), None)
            .unwrap();
        let second = EnsembleTrainer::new(quiet_config(), EventType::Moon, 7)
            .train(&dataset, &split_config(), None)
            .unwrap();

        for row in &dataset.rows {
            assert_eq!(
                first.model.predict_proba(&row.features),
                second.model.predict_proba(&row.features)
            );
        }
        assert_eq!(
            first.metrics.training_accuracy,
            second.metrics.training_accuracy
        );
    }

    #[test]
    fn single_class_dataset_flags_undefined_auc_instead_of_failing() {
        let mut dataset = synthetic_dataset(60);
        for row in &mut dataset.rows {
            row.event_type = EventType::None;
        }
        let trainer = EnsembleTrainer::new(quiet_config(), EventType::Moon, 42);
        let outcome = trainer.train(&dataset, &split_config(), None).unwrap();

        assert!(!outcome.metrics.training_auc_defined);
        assert_eq!(outcome.metrics.training_auc, 0.0);
        assert!(outcome.metrics.flags.contains(&QualityFlag::AucUndefined));
        assert!(outcome
            .metrics
            .flags
            .contains(&QualityFlag::CalibrationFallback));
    }

    #[test]
    fn balanced_weights_double_the_minority_weight() {
        let trainer = EnsembleTrainer::new(
            TrainerConfig {
                class_weight_mode: ClassWeightMode::Balanced,
                ..quiet_config()
            },
            EventType::Moon,
            42,
        );
        // 4 rows, 1 positive: positives get 4/(2*1) = 2, negatives 4/6.
        let weights = trainer.resolve_weights(&[1, 0, 0, 0], None);
        assert!((weights[0] - 2.0).abs() < 1e-9);
        assert!((weights[1] - 4.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn explicit_weights_override_the_weight_mode() {
        let trainer = EnsembleTrainer::new(quiet_config(), EventType::Moon, 42);
        let weights = trainer.resolve_weights(
            &[1, 0],
            Some(ClassWeights {
                negative: 0.5,
                positive: 8.0,
            }),
        );
        assert_eq!(weights, vec![8.0, 0.5]);
    }
}
