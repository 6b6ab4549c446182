use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::tree::{DecisionTree, TreeConfig, TreeTask};

const PROBABILITY_FLOOR: f64 = 1e-6;
// The probability floor caps how close fitted scores can sit to the
// labels, so residuals below this are noise and end the round loop.
const CONVERGENCE_TOLERANCE: f64 = 1e-5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostedConfig {
    pub n_rounds: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Fraction of rows each round trains on; 1.0 uses every row.
    pub subsample: f64,
    pub seed: u64,
}

/// Gradient boosted trees on the logit scale. Rounds are sequential by
/// nature; any per-round sampling derives its seed as seed + round so a
/// rerun with the same seed replays the same model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostedTrees {
    config: BoostedConfig,
    base_score: f64,
    trees: Vec<DecisionTree>,
}

impl BoostedTrees {
    pub fn fit(
        config: BoostedConfig,
        features: &[Vec<f64>],
        labels: &[f64],
        weights: &[f64],
    ) -> Self {
        let n_rows = features.len();
        if n_rows == 0 || config.n_rounds == 0 {
            return Self {
                config,
                base_score: 0.0,
                trees: Vec::new(),
            };
        }

        let weight_sum: f64 = weights.iter().sum();
        let positive_weight: f64 = labels
            .iter()
            .zip(weights)
            .map(|(label, weight)| label * weight)
            .sum();
        let rate = if weight_sum > 0.0 {
            (positive_weight / weight_sum).clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR)
        } else {
            0.5
        };
        let base_score = (rate / (1.0 - rate)).ln();

        let tree_config = TreeConfig {
            task: TreeTask::Regression,
            max_depth: config.max_depth,
            min_samples_split: config.min_samples_split,
            min_samples_leaf: config.min_samples_leaf,
            max_features: None,
        };
        let sample_size = if config.subsample < 1.0 {
            ((n_rows as f64 * config.subsample).floor() as usize).max(1)
        } else {
            n_rows
        };

        let mut scores = vec![base_score; n_rows];
        let mut trees = Vec::with_capacity(config.n_rounds);
        let mut residuals = vec![0.0; n_rows];
        let mut round_features = Vec::with_capacity(sample_size);
        let mut round_residuals = Vec::with_capacity(sample_size);
        let mut round_weights = Vec::with_capacity(sample_size);

        for round in 0..config.n_rounds {
            let mut converged = true;
            for i in 0..n_rows {
                residuals[i] = labels[i] - sigmoid(scores[i]);
                if residuals[i].abs() > CONVERGENCE_TOLERANCE {
                    converged = false;
                }
            }
            if converged {
                break;
            }

            let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(round as u64));
            round_features.clear();
            round_residuals.clear();
            round_weights.clear();
            if sample_size < n_rows {
                let mut order: Vec<usize> = (0..n_rows).collect();
                order.shuffle(&mut rng);
                order.truncate(sample_size);
                for &i in &order {
                    round_features.push(features[i].clone());
                    round_residuals.push(residuals[i]);
                    round_weights.push(weights[i]);
                }
            } else {
                round_features.extend(features.iter().cloned());
                round_residuals.extend_from_slice(&residuals);
                round_weights.extend_from_slice(weights);
            }

            let mut tree = DecisionTree::new(tree_config.clone());
            tree.fit(&round_features, &round_residuals, &round_weights, &mut rng);
            for (score, row) in scores.iter_mut().zip(features) {
                *score += config.learning_rate * tree.predict(row);
            }
            trees.push(tree);
        }

        Self {
            config,
            base_score,
            trees,
        }
    }

    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        let mut score = self.base_score;
        for tree in &self.trees {
            score += self.config.learning_rate * tree.predict(row);
        }
        sigmoid(score)
    }

    /// Gain-based importances summed across rounds and normalized to 1.
    pub fn feature_importances(&self) -> Vec<f64> {
        let n_features = self
            .trees
            .first()
            .map(|tree| tree.importances().len())
            .unwrap_or(0);
        let mut totals = vec![0.0; n_features];
        for tree in &self.trees {
            for (slot, gain) in totals.iter_mut().zip(tree.importances()) {
                *slot += gain;
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

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imbalanced_separable() -> (Vec<Vec<f64>>, Vec<f64>, Vec<f64>) {
        let mut features = Vec::new();
        let mut labels = Vec::new();
        for i in 0..100 {
            let positive = i % 10 == 0;
            let signal = if positive { 3.0 } else { -3.0 };
            let noise = ((i * 13) % 7) as f64 / 7.0 - 0.5;
            features.push(vec![signal + noise, noise]);
            labels.push(if positive { 1.0 } else { 0.0 });
        }
        let weights = vec![1.0; labels.len()];
        (features, labels, weights)
    }

    fn small_config() -> BoostedConfig {
        BoostedConfig {
            n_rounds: 30,
            learning_rate: 0.2,
            max_depth: 3,
            min_samples_split: 2,
            min_samples_leaf: 1,
            subsample: 1.0,
            seed: 42,
        }
    }

    #[test]
    fn base_score_reflects_the_minority_rate() {
        let (features, labels, weights) = imbalanced_separable();
        let model = BoostedTrees::fit(small_config(), &features, &labels, &weights);
        // 10% positives puts the prior logit well below zero.
        assert!(model.base_score < -1.0);
    }

    #[test]
    fn boosting_separates_the_classes() {
        let (features, labels, weights) = imbalanced_separable();
        let model = BoostedTrees::fit(small_config(), &features, &labels, &weights);

        assert!(model.predict_proba(&[3.0, 0.0]) > 0.7);
        assert!(model.predict_proba(&[-3.0, 0.0]) < 0.1);
    }

    #[test]
    fn identical_seeds_replay_the_same_model() {
        let (features, labels, weights) = imbalanced_separable();
        let config = BoostedConfig {
            subsample: 0.7,
            ..small_config()
        };
        let first = BoostedTrees::fit(config.clone(), &features, &labels, &weights);
        let second = BoostedTrees::fit(config, &features, &labels, &weights);

        for row in &features {
            assert_eq!(first.predict_proba(row), second.predict_proba(row));
        }
    }

    #[test]
    fn pure_targets_stop_adding_rounds() {
        let features = vec![vec![1.0]; 20];
        let labels = vec![1.0; 20];
        let weights = vec![1.0; 20];
        let model = BoostedTrees::fit(small_config(), &features, &labels, &weights);

        // The prior already sits at the clamped ceiling, so residuals
        // stay below tolerance and the round loop exits immediately.
        assert!(model.trees.is_empty());
        assert!(model.predict_proba(&[1.0]) > 0.99);
    }

    #[test]
    fn empty_training_set_predicts_a_neutral_probability() {
        let model = BoostedTrees::fit(small_config(), &[], &[], &[]);
        assert!((model.predict_proba(&[0.0]) - 0.5).abs() < 1e-12);
    }
}
