use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::tree::{DecisionTree, TreeConfig, TreeTask};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestConfig {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Per-split feature subset; None falls back to sqrt(n_features).
    pub max_features: Option<usize>,
    pub seed: u64,
}

/// Bagged classification forest. Each tree draws its own bootstrap
/// sample and feature subsets from a seed derived as seed + tree index,
/// so results do not depend on how rayon schedules the builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaggedForest {
    config: ForestConfig,
    trees: Vec<DecisionTree>,
    n_features: usize,
}

impl BaggedForest {
    pub fn fit(
        config: ForestConfig,
        features: &[Vec<f64>],
        labels: &[f64],
        weights: &[f64],
    ) -> Self {
        let n_rows = features.len();
        let n_features = features.first().map(|row| row.len()).unwrap_or(0);
        if n_rows == 0 || config.n_trees == 0 {
            return Self {
                config,
                trees: Vec::new(),
                n_features,
            };
        }

        let max_features = config
            .max_features
            .unwrap_or_else(|| ((n_features as f64).sqrt().round() as usize).max(1))
            .min(n_features.max(1));
        let tree_config = TreeConfig {
            task: TreeTask::Classification,
            max_depth: config.max_depth,
            min_samples_split: config.min_samples_split,
            min_samples_leaf: config.min_samples_leaf,
            max_features: Some(max_features),
        };

        let trees: Vec<DecisionTree> = (0..config.n_trees)
            .into_par_iter()
            .map(|tree_index| {
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(tree_index as u64));
                let mut sample_features = Vec::with_capacity(n_rows);
                let mut sample_labels = Vec::with_capacity(n_rows);
                let mut sample_weights = Vec::with_capacity(n_rows);
                for _ in 0..n_rows {
                    let row = rng.gen_range(0..n_rows);
                    sample_features.push(features[row].clone());
                    sample_labels.push(labels[row]);
                    sample_weights.push(weights[row]);
                }
                let mut tree = DecisionTree::new(tree_config.clone());
                tree.fit(&sample_features, &sample_labels, &sample_weights, &mut rng);
                tree
            })
            .collect();

        Self {
            config,
            trees,
            n_features,
        }
    }

    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.5;
        }
        let sum: f64 = self.trees.iter().map(|tree| tree.predict(row)).sum();
        sum / self.trees.len() as f64
    }

    /// Gain-based importances summed across trees and normalized to 1.
    pub fn feature_importances(&self) -> Vec<f64> {
        let mut totals = vec![0.0; self.n_features];
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

#[cfg(test)]
mod tests {
    use super::*;

    fn noisy_separable() -> (Vec<Vec<f64>>, Vec<f64>, Vec<f64>) {
        let mut features = Vec::new();
        let mut labels = Vec::new();
        for i in 0..120 {
            let positive = i % 3 == 0;
            let signal = if positive { 2.0 } else { -2.0 };
            let noise = ((i * 37) % 11) as f64 / 11.0 - 0.5;
            features.push(vec![signal + noise, noise, (i % 7) as f64]);
            labels.push(if positive { 1.0 } else { 0.0 });
        }
        let weights = vec![1.0; labels.len()];
        (features, labels, weights)
    }

    fn small_config() -> ForestConfig {
        ForestConfig {
            n_trees: 25,
            max_depth: 6,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            seed: 42,
        }
    }

    #[test]
    fn separates_signal_from_noise() {
        let (features, labels, weights) = noisy_separable();
        let forest = BaggedForest::fit(small_config(), &features, &labels, &weights);

        assert!(forest.predict_proba(&[2.0, 0.0, 3.0]) > 0.7);
        assert!(forest.predict_proba(&[-2.0, 0.0, 3.0]) < 0.3);
    }

    #[test]
    fn identical_seeds_give_identical_predictions() {
        let (features, labels, weights) = noisy_separable();
        let first = BaggedForest::fit(small_config(), &features, &labels, &weights);
        let second = BaggedForest::fit(small_config(), &features, &labels, &weights);

        for row in &features {
            assert_eq!(first.predict_proba(row), second.predict_proba(row));
        }
    }

    #[test]
    fn importances_are_normalized_and_favor_the_signal() {
        let (features, labels, weights) = noisy_separable();
        let forest = BaggedForest::fit(small_config(), &features, &labels, &weights);

        let importances = forest.feature_importances();
        let total: f64 = importances.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(importances[0] > importances[1]);
        assert!(importances[0] > importances[2]);
    }

    #[test]
    fn empty_training_set_predicts_a_neutral_probability() {
        let forest = BaggedForest::fit(small_config(), &[], &[], &[]);
        assert_eq!(forest.predict_proba(&[1.0, 2.0, 3.0]), 0.5);
        assert!(forest.feature_importances().is_empty());
    }
}
