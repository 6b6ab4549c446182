use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

const MIN_GAIN: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeTask {
    /// Targets are 0/1 labels; leaves hold the weighted positive fraction.
    Classification,
    /// Targets are residuals; leaves hold the weighted mean.
    Regression,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    pub task: TreeTask,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features considered per split; None tries every feature.
    pub max_features: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub feature_index: usize,
    pub threshold: f64,
    pub value: f64,
    pub samples: usize,
    pub left: Option<Box<TreeNode>>,
    pub right: Option<Box<TreeNode>>,
}

impl TreeNode {
    fn leaf(value: f64, samples: usize) -> Self {
        Self {
            feature_index: 0,
            threshold: 0.0,
            value,
            samples,
            left: None,
            right: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

/// Weighted CART tree with midpoint thresholds. Rows flow left when the
/// feature value is at or below the threshold; undefined values flow
/// right so prediction never panics on a malformed row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    config: TreeConfig,
    root: Option<Box<TreeNode>>,
    importances: Vec<f64>,
    n_features: usize,
}

struct SplitCandidate {
    feature_index: usize,
    threshold: f64,
    gain: f64,
}

impl DecisionTree {
    pub fn new(config: TreeConfig) -> Self {
        Self {
            config,
            root: None,
            importances: Vec::new(),
            n_features: 0,
        }
    }

    pub fn fit(
        &mut self,
        features: &[Vec<f64>],
        targets: &[f64],
        weights: &[f64],
        rng: &mut StdRng,
    ) {
        self.n_features = features.first().map(|row| row.len()).unwrap_or(0);
        self.importances = vec![0.0; self.n_features];
        if features.is_empty() {
            self.root = None;
            return;
        }
        let indices: Vec<usize> = (0..features.len()).collect();
        self.root = Some(self.build_node(features, targets, weights, indices, 0, rng));
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut node = match &self.root {
            Some(node) => node.as_ref(),
            None => return self.default_value(),
        };
        loop {
            if node.is_leaf() {
                return node.value;
            }
            let goes_left = row
                .get(node.feature_index)
                .map_or(false, |v| v.is_finite() && *v <= node.threshold);
            let next = if goes_left { &node.left } else { &node.right };
            match next {
                Some(child) => node = child.as_ref(),
                None => return node.value,
            }
        }
    }

    /// Total impurity gain attributed to each feature, unnormalized.
    pub fn importances(&self) -> &[f64] {
        &self.importances
    }

    fn default_value(&self) -> f64 {
        match self.config.task {
            TreeTask::Classification => 0.5,
            TreeTask::Regression => 0.0,
        }
    }

    fn build_node(
        &mut self,
        features: &[Vec<f64>],
        targets: &[f64],
        weights: &[f64],
        indices: Vec<usize>,
        depth: usize,
        rng: &mut StdRng,
    ) -> Box<TreeNode> {
        let (weight_sum, value) = weighted_value(targets, weights, &indices);
        let samples = indices.len();
        let impurity = self.impurity(targets, weights, &indices, weight_sum, value);

        if depth >= self.config.max_depth
            || samples < self.config.min_samples_split
            || impurity <= MIN_GAIN
        {
            return Box::new(TreeNode::leaf(value, samples));
        }

        let candidate = match self.best_split(features, targets, weights, &indices, impurity, rng)
        {
            Some(candidate) => candidate,
            None => return Box::new(TreeNode::leaf(value, samples)),
        };

        let (left_indices, right_indices): (Vec<usize>, Vec<usize>) =
            indices.into_iter().partition(|&i| {
                features[i]
                    .get(candidate.feature_index)
                    .map_or(false, |v| v.is_finite() && *v <= candidate.threshold)
            });
        if left_indices.is_empty() || right_indices.is_empty() {
            return Box::new(TreeNode::leaf(value, samples));
        }

        self.importances[candidate.feature_index] += candidate.gain * weight_sum;

        let left = self.build_node(features, targets, weights, left_indices, depth + 1, rng);
        let right = self.build_node(features, targets, weights, right_indices, depth + 1, rng);
        Box::new(TreeNode {
            feature_index: candidate.feature_index,
            threshold: candidate.threshold,
            value,
            samples,
            left: Some(left),
            right: Some(right),
        })
    }

    fn impurity(
        &self,
        targets: &[f64],
        weights: &[f64],
        indices: &[usize],
        weight_sum: f64,
        value: f64,
    ) -> f64 {
        if weight_sum <= 0.0 {
            return 0.0;
        }
        match self.config.task {
            TreeTask::Classification => 2.0 * value * (1.0 - value),
            TreeTask::Regression => {
                let mean_square = indices
                    .iter()
                    .map(|&i| weights[i] * targets[i] * targets[i])
                    .sum::<f64>()
                    / weight_sum;
                (mean_square - value * value).max(0.0)
            }
        }
    }

    fn best_split(
        &self,
        features: &[Vec<f64>],
        targets: &[f64],
        weights: &[f64],
        indices: &[usize],
        parent_impurity: f64,
        rng: &mut StdRng,
    ) -> Option<SplitCandidate> {
        let mut feature_order: Vec<usize> = (0..self.n_features).collect();
        let tried = match self.config.max_features {
            Some(limit) if limit < self.n_features => {
                feature_order.shuffle(rng);
                limit
            }
            _ => self.n_features,
        };

        let mut best: Option<SplitCandidate> = None;
        for &feature_index in feature_order.iter().take(tried) {
            let mut rows: Vec<(f64, f64, f64)> = indices
                .iter()
                .filter_map(|&i| {
                    features[i]
                        .get(feature_index)
                        .filter(|v| v.is_finite())
                        .map(|v| (*v, targets[i], weights[i]))
                })
                .collect();
            if rows.len() < 2 * self.config.min_samples_leaf {
                continue;
            }
            rows.sort_by(|a, b| a.0.total_cmp(&b.0));

            let total_weight: f64 = rows.iter().map(|r| r.2).sum();
            let total_wy: f64 = rows.iter().map(|r| r.2 * r.1).sum();
            let total_wyy: f64 = rows.iter().map(|r| r.2 * r.1 * r.1).sum();
            if total_weight <= 0.0 {
                continue;
            }

            let mut left_weight = 0.0;
            let mut left_wy = 0.0;
            let mut left_wyy = 0.0;
            for split_at in 0..rows.len() - 1 {
                let (value, target, weight) = rows[split_at];
                left_weight += weight;
                left_wy += weight * target;
                left_wyy += weight * target * target;

                let next_value = rows[split_at + 1].0;
                if next_value <= value {
                    continue;
                }
                let left_count = split_at + 1;
                let right_count = rows.len() - left_count;
                if left_count < self.config.min_samples_leaf
                    || right_count < self.config.min_samples_leaf
                {
                    continue;
                }
                let right_weight = total_weight - left_weight;
                if left_weight <= 0.0 || right_weight <= 0.0 {
                    continue;
                }

                let left_impurity = self.partition_impurity(left_weight, left_wy, left_wyy);
                let right_impurity = self.partition_impurity(
                    right_weight,
                    total_wy - left_wy,
                    total_wyy - left_wyy,
                );
                let weighted_child = (left_weight * left_impurity
                    + right_weight * right_impurity)
                    / total_weight;
                let gain = parent_impurity - weighted_child;
                if gain <= MIN_GAIN {
                    continue;
                }
                if best.as_ref().map_or(true, |b| gain > b.gain) {
                    best = Some(SplitCandidate {
                        feature_index,
                        threshold: (value + next_value) / 2.0,
                        gain,
                    });
                }
            }
        }
        best
    }

    fn partition_impurity(&self, weight: f64, wy: f64, wyy: f64) -> f64 {
        let mean = wy / weight;
        match self.config.task {
            TreeTask::Classification => 2.0 * mean * (1.0 - mean),
            TreeTask::Regression => (wyy / weight - mean * mean).max(0.0),
        }
    }
}

fn weighted_value(targets: &[f64], weights: &[f64], indices: &[usize]) -> (f64, f64) {
    let mut weight_sum = 0.0;
    let mut weighted_target = 0.0;
    for &i in indices {
        weight_sum += weights[i];
        weighted_target += weights[i] * targets[i];
    }
    if weight_sum <= 0.0 {
        (0.0, 0.0)
    } else {
        (weight_sum, weighted_target / weight_sum)
    }
}
