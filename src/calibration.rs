use serde::{Deserialize, Serialize};

/// Isotonic mapping from raw ensemble scores to calibrated
/// probabilities. Fitting pools adjacent violators on weighted label
/// means; prediction interpolates linearly between the fitted knots and
/// clamps beyond the observed score range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsotonicCalibrator {
    thresholds: Vec<f64>,
    values: Vec<f64>,
}

struct Block {
    value: f64,
    weight: f64,
    first_score: f64,
    last_score: f64,
}

impl IsotonicCalibrator {
    /// Fits on (score, label, weight) triples. Returns None when the
    /// inputs cannot support a calibration curve: fewer than two
    /// distinct scores, or every label in one class.
    pub fn fit(points: &[(f64, f64, f64)]) -> Option<Self> {
        let mut usable: Vec<(f64, f64, f64)> = points
            .iter()
            .filter(|(score, _, weight)| score.is_finite() && *weight > 0.0)
            .copied()
            .collect();
        if usable.is_empty() {
            return None;
        }
        let has_positive = usable.iter().any(|(_, label, _)| *label >= 0.5);
        let has_negative = usable.iter().any(|(_, label, _)| *label < 0.5);
        if !has_positive || !has_negative {
            return None;
        }
        usable.sort_by(|a, b| a.0.total_cmp(&b.0));

        // Equal scores collapse into one point so thresholds stay
        // strictly increasing.
        let mut merged: Vec<(f64, f64, f64)> = Vec::with_capacity(usable.len());
        for (score, label, weight) in usable {
            match merged.last_mut() {
                Some((last_score, last_label, last_weight)) if *last_score == score => {
                    let total = *last_weight + weight;
                    *last_label = (*last_label * *last_weight + label * weight) / total;
                    *last_weight = total;
                }
                _ => merged.push((score, label, weight)),
            }
        }
        if merged.len() < 2 {
            return None;
        }

        let mut blocks: Vec<Block> = Vec::with_capacity(merged.len());
        for (score, label_mean, weight) in merged {
            blocks.push(Block {
                value: label_mean,
                weight,
                first_score: score,
                last_score: score,
            });
            while blocks.len() >= 2 {
                let last = blocks.len() - 1;
                if blocks[last - 1].value <= blocks[last].value {
                    break;
                }
                let violator = match blocks.pop() {
                    Some(block) => block,
                    None => break,
                };
                let target = match blocks.last_mut() {
                    Some(block) => block,
                    None => break,
                };
                let total = target.weight + violator.weight;
                target.value =
                    (target.value * target.weight + violator.value * violator.weight) / total;
                target.weight = total;
                target.last_score = violator.last_score;
            }
        }

        let mut thresholds = Vec::new();
        let mut values = Vec::new();
        for block in &blocks {
            thresholds.push(block.first_score);
            values.push(block.value);
            if block.last_score > block.first_score {
                thresholds.push(block.last_score);
                values.push(block.value);
            }
        }
        Some(Self { thresholds, values })
    }

    pub fn predict(&self, score: f64) -> f64 {
        if self.thresholds.is_empty() {
            return score.clamp(0.0, 1.0);
        }
        let first = self.thresholds[0];
        if !(score > first) {
            return self.values[0];
        }
        let last_index = self.thresholds.len() - 1;
        if score >= self.thresholds[last_index] {
            return self.values[last_index];
        }
        let upper = self.thresholds.partition_point(|&t| t <= score);
        let t0 = self.thresholds[upper - 1];
        let t1 = self.thresholds[upper];
        let v0 = self.values[upper - 1];
        let v1 = self.values[upper];
        let span = t1 - t0;
        if span <= 0.0 {
            return v1;
        }
        v0 + (v1 - v0) * (score - t0) / span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_weighted(points: &[(f64, f64)]) -> Vec<(f64, f64, f64)> {
        points.iter().map(|&(s, l)| (s, l, 1.0)).collect()
    }

    #[test]
    fn pools_adjacent_violators_into_one_level() {
        let calibrator =
            IsotonicCalibrator::fit(&unit_weighted(&[(0.1, 1.0), (0.2, 0.0), (0.3, 1.0)]))
                .unwrap();

        assert!((calibrator.predict(0.15) - 0.5).abs() < 1e-9);
        assert!((calibrator.predict(0.25) - 0.75).abs() < 1e-9);
        assert!((calibrator.predict(0.05) - 0.5).abs() < 1e-9);
        assert!((calibrator.predict(0.9) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn output_is_monotone_over_a_score_sweep() {
        let points = unit_weighted(&[
            (0.05, 0.0),
            (0.15, 0.0),
            (0.25, 1.0),
            (0.35, 0.0),
            (0.45, 1.0),
            (0.55, 1.0),
            (0.65, 0.0),
            (0.75, 1.0),
            (0.85, 1.0),
            (0.95, 1.0),
        ]);
        let calibrator = IsotonicCalibrator::fit(&points).unwrap();

        let mut previous = f64::NEG_INFINITY;
        for step in 0..=100 {
            let probability = calibrator.predict(step as f64 / 100.0);
            assert!(probability >= previous - 1e-12);
            assert!((0.0..=1.0).contains(&probability));
            previous = probability;
        }
    }

    #[test]
    fn single_class_inputs_cannot_be_calibrated() {
        assert!(IsotonicCalibrator::fit(&unit_weighted(&[(0.1, 1.0), (0.5, 1.0)])).is_none());
        assert!(IsotonicCalibrator::fit(&unit_weighted(&[(0.1, 0.0), (0.5, 0.0)])).is_none());
    }

    #[test]
    fn a_single_distinct_score_cannot_be_calibrated() {
        let points = unit_weighted(&[(0.4, 1.0), (0.4, 0.0), (0.4, 1.0)]);
        assert!(IsotonicCalibrator::fit(&points).is_none());
    }

    #[test]
    fn weights_shift_the_pooled_level() {
        let calibrator =
            IsotonicCalibrator::fit(&[(0.1, 1.0, 1.0), (0.2, 0.0, 3.0)]).unwrap();
        // The violating pair pools to the weighted mean 0.25 everywhere.
        assert!((calibrator.predict(0.0) - 0.25).abs() < 1e-9);
        assert!((calibrator.predict(0.15) - 0.25).abs() < 1e-9);
        assert!((calibrator.predict(1.0) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn tied_scores_merge_before_pooling() {
        let points = vec![(0.5, 1.0, 1.0), (0.5, 0.0, 1.0), (0.7, 1.0, 1.0)];
        let calibrator = IsotonicCalibrator::fit(&points).unwrap();

        assert!((calibrator.predict(0.5) - 0.5).abs() < 1e-9);
        assert!((calibrator.predict(0.6) - 0.75).abs() < 1e-9);
        assert!((calibrator.predict(0.7) - 1.0).abs() < 1e-9);
    }
}
