use anyhow::Result;
use log::warn;
use serde::Serialize;

use crate::artifact::ModelArtifactStore;
use crate::config::PipelineConfig;
use crate::models::ArtifactMetadata;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InspectStageSummary<'a> {
    model_name: &'a str,
    current: bool,
    metadata: &'a ArtifactMetadata,
}

/// Prints the metadata of a stored artifact. Without an explicit id the
/// `CURRENT` pointer decides which one; `--list` enumerates all of them.
pub fn run(config: &PipelineConfig, artifact_id: Option<&str>, list: bool) -> Result<()> {
    let store = ModelArtifactStore::new(&config.store.root);
    let model_name = &config.store.model_name;

    if list {
        let ids = store.list(model_name)?;
        if ids.is_empty() {
            println!("no artifacts stored for model '{model_name}'");
            return Ok(());
        }
        let current = store.current_artifact_id(model_name).ok();
        for id in &ids {
            let marker = if current.as_deref() == Some(id.as_str()) {
                " (current)"
            } else {
                ""
            };
            println!("{id}{marker}");
        }
        return Ok(());
    }

    let resolved = match artifact_id {
        Some(id) => id.to_string(),
        None => store.current_artifact_id(model_name)?,
    };
    let is_current = store
        .current_artifact_id(model_name)
        .map(|current| current == resolved)
        .unwrap_or(false);
    let metadata = store.load_metadata(model_name, &resolved)?;

    println!("artifact:     {}", metadata.artifact_id);
    println!("model:        {}", metadata.model_name);
    println!("created:      {}", metadata.created_at.to_rfc3339());
    println!("mode:         {}", metadata.mode);
    println!("target:       {}", metadata.target_event.as_str());
    println!("seed:         {}", metadata.seed);
    println!("calibration:  {}", metadata.calibration);
    println!("learners:     {}", metadata.learner_kinds.join(", "));
    println!("features:     {}", metadata.feature_names.len());

    let metrics = &metadata.metrics;
    println!("train rows:   {}", metrics.train_rows);
    println!("accuracy:     {:.4}", metrics.training_accuracy);
    if metrics.training_auc_defined {
        println!("auc:          {:.4}", metrics.training_auc);
    } else {
        println!("auc:          undefined");
    }
    println!("brier:        {:.4}", metrics.brier_score);
    println!(
        "agreement:    {:.4} mean, {:.4} min",
        metrics.agreement_mean, metrics.agreement_min
    );
    if let Some(aggregate) = &metrics.fold_aggregate {
        println!(
            "folds:        {} ({} degenerate), auc {:.4} +/- {:.4}",
            aggregate.folds, aggregate.degenerate_folds, aggregate.auc_mean, aggregate.auc_std
        );
    }
    if !metrics.top_importances.is_empty() {
        println!("top features:");
        for importance in &metrics.top_importances {
            println!("  {:<24} {:.4}", importance.feature, importance.share);
        }
    }
    if metrics.flags.is_empty() {
        println!("flags:        none");
    } else {
        let names: Vec<&str> = metrics.flags.iter().map(|flag| flag.as_str()).collect();
        println!("flags:        {}", names.join(", "));
    }

    let stage_summary = InspectStageSummary {
        model_name,
        current: is_current,
        metadata: &metadata,
    };
    match serde_json::to_string(&stage_summary) {
        Ok(payload) => println!("MOONFORGE_INSPECT_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize inspect summary: {err}"),
    }
    Ok(())
}
