use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use std::path::Path;

use crate::artifact::ModelArtifactStore;
use crate::config::{ClassWeights, PipelineConfig};
use crate::errors::QualityFlag;
use crate::models::{ArtifactMetadata, EventType, TrainingMetrics};
use crate::snapshot;
use crate::trainer::{EnsembleTrainer, TrainOutcome};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TrainStageSummary<'a> {
    artifact_id: &'a str,
    model_name: &'a str,
    mode: &'a str,
    target_event: &'a str,
    seed: u64,
    calibration: &'a str,
    learner_kinds: &'a [String],
    metrics: &'a TrainingMetrics,
}

/// Trains the ensemble on a balanced dataset snapshot and persists the
/// resulting artifact, moving the `CURRENT` pointer to it.
pub fn run(
    config: &PipelineConfig,
    input_path: &Path,
    class_weights: Option<ClassWeights>,
) -> Result<()> {
    let dataset = snapshot::load_dataset(input_path)?;
    let target = config.target_event();
    let seed = config.seed();
    info!(
        "training {} model on {} rows from {} (seed {})",
        target.as_str(),
        dataset.len(),
        input_path.display(),
        seed
    );

    let trainer = EnsembleTrainer::new(config.trainer.clone(), target, seed);
    let outcome = trainer.train(&dataset, &config.split, class_weights)?;

    let mut metadata = build_metadata(config, target, seed, &outcome);
    let store = ModelArtifactStore::new(&config.store.root);
    let artifact_id = store.save(&config.store.model_name, &outcome.model, &mut metadata)?;

    report(&metadata, &artifact_id);

    let stage_summary = TrainStageSummary {
        artifact_id: &artifact_id,
        model_name: &config.store.model_name,
        mode: &metadata.mode,
        target_event: target.as_str(),
        seed,
        calibration: &metadata.calibration,
        learner_kinds: &metadata.learner_kinds,
        metrics: &metadata.metrics,
    };
    match serde_json::to_string(&stage_summary) {
        Ok(payload) => println!("MOONFORGE_TRAIN_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize train summary: {err}"),
    }
    Ok(())
}

pub fn build_metadata(
    config: &PipelineConfig,
    target: EventType,
    seed: u64,
    outcome: &TrainOutcome,
) -> ArtifactMetadata {
    let calibration = if outcome.model.is_calibrated() {
        "isotonic"
    } else {
        "identity"
    };
    ArtifactMetadata {
        artifact_id: String::new(),
        model_name: String::new(),
        created_at: Utc::now(),
        seed,
        mode: config.trainer.mode.as_str().to_string(),
        target_event: target,
        calibration: calibration.to_string(),
        learner_kinds: outcome
            .model
            .learner_kinds()
            .iter()
            .map(|kind| kind.as_str().to_string())
            .collect(),
        feature_names: outcome.model.feature_names.clone(),
        metrics: outcome.metrics.clone(),
    }
}

pub fn report(metadata: &ArtifactMetadata, artifact_id: &str) {
    let metrics = &metadata.metrics;
    info!(
        "trained {} ({}) on {} rows: accuracy {:.4}, brier {:.4}, agreement {:.4}",
        artifact_id,
        metadata.mode,
        metrics.train_rows,
        metrics.training_accuracy,
        metrics.brier_score,
        metrics.agreement_mean
    );
    if metrics.training_auc_defined {
        info!("training AUC {:.4}", metrics.training_auc);
    } else {
        warn!("training AUC is undefined, dataset holds a single class");
    }
    for fold in &metrics.fold_metrics {
        let auc = match fold.auc {
            Some(value) => format!("{:.4}", value),
            None => "undefined".to_string(),
        };
        info!(
            "fold {}: train {} test {} embargoed {} accuracy {:.4} auc {}",
            fold.fold, fold.train_rows, fold.test_rows, fold.embargoed_rows, fold.accuracy, auc
        );
    }
    if let Some(aggregate) = &metrics.fold_aggregate {
        info!(
            "fold AUC {:.4} +/- {:.4} over {} fold(s), {} degenerate",
            aggregate.auc_mean, aggregate.auc_std, aggregate.folds, aggregate.degenerate_folds
        );
    }
    for flag in &metrics.flags {
        warn!("quality flag raised: {}", flag.as_str());
    }
    if metrics
        .flags
        .contains(&QualityFlag::HighImportanceConcentration)
    {
        if let Some(top) = metrics.top_importances.first() {
            warn!(
                "feature '{}' carries {:.1}% of the importance mass",
                top.feature,
                top.share * 100.0
            );
        }
    }
    println!("artifact {artifact_id}");
}
