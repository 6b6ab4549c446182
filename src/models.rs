use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

use crate::errors::{QualityFlag, StageError};

/// One daily OHLCV bar for a symbol. Any field may be missing in raw feeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Moon,
    Rug,
    None,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Moon => "moon",
            EventType::Rug => "rug",
            EventType::None => "none",
        }
    }
}

impl FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "moon" => Ok(EventType::Moon),
            "rug" => Ok(EventType::Rug),
            "none" => Ok(EventType::None),
            _ => Err(anyhow!("Unknown event type '{}'", s)),
        }
    }
}

/// Outcome label for one (symbol, date) anchor, produced by the labeling
/// job upstream of this pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLabel {
    pub symbol: String,
    pub event_date: NaiveDate,
    pub event_type: EventType,
    /// Realized forward return over the labeling horizon, as a fraction.
    pub target_return: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardNegativeKind {
    AlmostMoon,
    FailedBreakout,
    FakeVolume,
}

impl HardNegativeKind {
    pub const ALL: [HardNegativeKind; 3] = [
        HardNegativeKind::AlmostMoon,
        HardNegativeKind::FailedBreakout,
        HardNegativeKind::FakeVolume,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HardNegativeKind::AlmostMoon => "almost_moon",
            HardNegativeKind::FailedBreakout => "failed_breakout",
            HardNegativeKind::FakeVolume => "fake_volume",
        }
    }
}

/// Where a training row came from. Natural rows keep the (symbol, date)
/// anchor unique; synthetic rows replicate an anchor and are told apart
/// by their variant counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RowOrigin {
    Natural,
    Synthetic { kind: HardNegativeKind, variant: u32 },
}

impl RowOrigin {
    pub fn is_synthetic(&self) -> bool {
        matches!(self, RowOrigin::Synthetic { .. })
    }

    /// Deterministic ordering key so sorts are stable across runs.
    fn order_key(&self) -> (u8, u8, u32) {
        match self {
            RowOrigin::Natural => (0, 0, 0),
            RowOrigin::Synthetic { kind, variant } => {
                let kind_rank = match kind {
                    HardNegativeKind::AlmostMoon => 0,
                    HardNegativeKind::FailedBreakout => 1,
                    HardNegativeKind::FakeVolume => 2,
                };
                (1, kind_rank, *variant)
            }
        }
    }
}

/// One training example: the feature vector for a (symbol, date) anchor
/// plus its label. Feature values use NaN as the undefined sentinel until
/// the cleaner has imputed them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRow {
    pub symbol: String,
    pub event_date: NaiveDate,
    pub features: Vec<f64>,
    pub event_type: EventType,
    pub target_return: f64,
    pub origin: RowOrigin,
}

impl DataRow {
    pub fn feature(&self, index: usize) -> Option<f64> {
        self.features.get(index).copied().filter(|v| v.is_finite())
    }
}

/// Dense feature table: `feature_names[i]` names column `i` of every row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub rows: Vec<DataRow>,
}

impl Dataset {
    pub fn new(feature_names: Vec<String>, rows: Vec<DataRow>) -> Self {
        Self {
            feature_names,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn feature_index(&self, name: &str) -> Option<usize> {
        self.feature_names.iter().position(|n| n == name)
    }

    /// Copies column `index` in row order. Missing entries come back as NaN.
    pub fn column(&self, index: usize) -> Vec<f64> {
        self.rows
            .iter()
            .map(|row| row.features.get(index).copied().unwrap_or(f64::NAN))
            .collect()
    }

    /// Binary labels against the configured target event.
    pub fn labels(&self, target: EventType) -> Vec<u8> {
        self.rows
            .iter()
            .map(|row| u8::from(row.event_type == target))
            .collect()
    }

    pub fn positive_count(&self, target: EventType) -> usize {
        self.rows
            .iter()
            .filter(|row| row.event_type == target)
            .count()
    }

    pub fn positive_rate(&self, target: EventType) -> f64 {
        if self.rows.is_empty() {
            return 0.0;
        }
        self.positive_count(target) as f64 / self.rows.len() as f64
    }

    /// Stable chronological order: date first, then symbol, then origin so
    /// synthetic replicas land right after their natural sibling.
    pub fn sort_chronologically(&mut self) {
        self.rows.sort_by(|a, b| {
            (a.event_date, &a.symbol, a.origin.order_key()).cmp(&(
                b.event_date,
                &b.symbol,
                b.origin.order_key(),
            ))
        });
    }

    /// Schema check run at stage boundaries: every row must carry exactly
    /// one value per feature name and no two rows may share an identity.
    pub fn validate(&self) -> Result<(), StageError> {
        let width = self.feature_names.len();
        for (i, row) in self.rows.iter().enumerate() {
            if row.features.len() != width {
                return Err(StageError::InvalidSchema(format!(
                    "row {} for {} has {} features, expected {}",
                    i,
                    row.symbol,
                    row.features.len(),
                    width
                )));
            }
        }

        let mut seen = HashSet::with_capacity(self.rows.len());
        for row in &self.rows {
            let key = (row.symbol.clone(), row.event_date, row.origin.order_key());
            if !seen.insert(key) {
                return Err(StageError::InvalidSchema(format!(
                    "duplicate row identity for {} on {}",
                    row.symbol, row.event_date
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassDistribution {
    pub positives: usize,
    pub negatives: usize,
    pub positive_rate: f64,
}

/// Column summary over the defined values of one feature, reported in
/// the clean stage summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureProfile {
    pub feature: String,
    pub defined: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHistogram {
    pub moon: usize,
    pub rug: usize,
    pub none: usize,
}

/// Held-out evaluation results for one purged fold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoldMetrics {
    pub fold: usize,
    pub train_rows: usize,
    pub test_rows: usize,
    pub embargoed_rows: usize,
    pub accuracy: f64,
    pub auc: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoldAggregate {
    pub folds: usize,
    pub degenerate_folds: usize,
    pub accuracy_mean: f64,
    pub accuracy_std: f64,
    pub auc_mean: f64,
    pub auc_std: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureImportance {
    pub feature: String,
    pub share: f64,
}

/// Metrics block persisted with every model artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingMetrics {
    pub train_rows: usize,
    pub class_distribution: ClassDistribution,
    pub training_accuracy: f64,
    /// Headline AUC; 0.0 when undefined, see `training_auc_defined`.
    pub training_auc: f64,
    pub training_auc_defined: bool,
    pub brier_score: f64,
    pub agreement_mean: f64,
    pub agreement_min: f64,
    pub fold_metrics: Vec<FoldMetrics>,
    pub fold_aggregate: Option<FoldAggregate>,
    pub top_importances: Vec<FeatureImportance>,
    pub flags: Vec<QualityFlag>,
}

/// Metadata written next to the serialized model binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub artifact_id: String,
    pub model_name: String,
    pub created_at: DateTime<Utc>,
    pub seed: u64,
    pub mode: String,
    pub target_event: EventType,
    pub calibration: String,
    pub learner_kinds: Vec<String>,
    pub feature_names: Vec<String>,
    pub metrics: TrainingMetrics,
}
