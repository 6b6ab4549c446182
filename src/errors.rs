use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal pipeline errors. Any of these aborts the current stage before it
/// writes output; recoverable conditions are reported as [`QualityFlag`]s
/// on the artifact metadata instead.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("dataset schema invalid: {0}")]
    InvalidSchema(String),

    #[error("dataset is empty, nothing to process")]
    EmptyDataset,

    #[error("no base learners enabled in trainer capabilities")]
    NoLearnersEnabled,

    #[error("dataset snapshot version mismatch (found {found}, expected {expected})")]
    SnapshotVersion { found: u32, expected: u32 },

    #[error("model artifact version mismatch (found {found}, expected {expected})")]
    ArtifactVersion { found: u32, expected: u32 },

    #[error("model artifact store corrupted: {0}")]
    StoreCorruption(String),
}

/// Non-fatal conditions observed while training. They travel with the
/// artifact metadata so downstream consumers can see how much to trust
/// the reported metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    /// Validation AUC could not be computed because only one class was present.
    AucUndefined,
    /// One or more evaluation folds contained a single class.
    DegenerateFolds,
    /// Every purged fold was single-class; metrics fall back to a plain
    /// chronological split.
    ChronologicalFallback,
    /// Isotonic calibration could not be fitted; raw scores are served.
    CalibrationFallback,
    /// A single feature dominates the importance distribution.
    HighImportanceConcentration,
    /// Fold metric dispersion exceeded the configured instability ratio.
    UnstableFolds,
    /// A derived feature column was mostly undefined and filled from medians.
    SparseDerivedFeatures,
}

impl QualityFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityFlag::AucUndefined => "auc_undefined",
            QualityFlag::DegenerateFolds => "degenerate_folds",
            QualityFlag::ChronologicalFallback => "chronological_fallback",
            QualityFlag::CalibrationFallback => "calibration_fallback",
            QualityFlag::HighImportanceConcentration => "high_importance_concentration",
            QualityFlag::UnstableFolds => "unstable_folds",
            QualityFlag::SparseDerivedFeatures => "sparse_derived_features",
        }
    }
}
