use anyhow::Result;
use log::{info, warn};
use serde::Serialize;
use std::path::Path;

use crate::artifact::ModelArtifactStore;
use crate::balancer::{BalanceSummary, DatasetBalancer};
use crate::cleaner::{CleanSummary, FeatureCleaner};
use crate::config::PipelineConfig;
use crate::errors::QualityFlag;
use crate::snapshot;
use crate::trainer::EnsembleTrainer;

use super::train;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PipelineStageSummary<'a> {
    artifact_id: &'a str,
    model_name: &'a str,
    target_event: &'a str,
    seed: u64,
    input_bars: usize,
    input_labels: usize,
    clean: &'a CleanSummary,
    balance: &'a BalanceSummary,
    flags: Vec<&'a str>,
}

/// Runs the whole chain in one process: assemble, clean, balance, train
/// and persist. Intermediate snapshots land in `dataset_dir` when given.
pub fn run(
    config: &PipelineConfig,
    bars_path: &Path,
    labels_path: Option<&Path>,
    dataset_dir: Option<&Path>,
) -> Result<()> {
    let bars = snapshot::load_bars_json(bars_path)?;
    let labels = match labels_path {
        Some(path) => snapshot::load_labels_json(path)?,
        None => {
            warn!("no label file given, every row becomes a plain negative");
            Vec::new()
        }
    };
    let target = config.target_event();
    let seed = config.seed();
    info!(
        "running pipeline on {} bars and {} labels toward {} events (seed {})",
        bars.len(),
        labels.len(),
        target.as_str(),
        seed
    );

    let raw = snapshot::assemble(&bars, &labels)?;

    let cleaner = FeatureCleaner::new(config.cleaner.clone());
    let (clean, clean_summary) = cleaner.clean(&raw);
    if let Some(dir) = dataset_dir {
        snapshot::save_dataset(&dir.join("clean.bin"), &clean)?;
    }

    let balancer = DatasetBalancer::new(config.balancer.clone(), seed);
    let (balanced, balance_summary) = balancer.balance(&clean, target);
    if let Some(dir) = dataset_dir {
        snapshot::save_dataset(&dir.join("balanced.bin"), &balanced)?;
    }

    let trainer = EnsembleTrainer::new(config.trainer.clone(), target, seed);
    let mut outcome = trainer.train(&balanced, &config.split, None)?;

    // The trainer never sees the cleaner report, so the sparse-feature
    // flag crosses over here before the metrics are frozen into metadata.
    if !clean_summary.sparse_derived_features.is_empty()
        && !outcome
            .metrics
            .flags
            .contains(&QualityFlag::SparseDerivedFeatures)
    {
        outcome.metrics.flags.push(QualityFlag::SparseDerivedFeatures);
    }

    let mut metadata = train::build_metadata(config, target, seed, &outcome);
    let store = ModelArtifactStore::new(&config.store.root);
    let artifact_id = store.save(&config.store.model_name, &outcome.model, &mut metadata)?;

    train::report(&metadata, &artifact_id);

    let flags: Vec<&str> = metadata
        .metrics
        .flags
        .iter()
        .map(|flag| flag.as_str())
        .collect();
    let stage_summary = PipelineStageSummary {
        artifact_id: &artifact_id,
        model_name: &config.store.model_name,
        target_event: target.as_str(),
        seed,
        input_bars: bars.len(),
        input_labels: labels.len(),
        clean: &clean_summary,
        balance: &balance_summary,
        flags,
    };
    match serde_json::to_string(&stage_summary) {
        Ok(payload) => println!("MOONFORGE_PIPELINE_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize pipeline summary: {err}"),
    }
    Ok(())
}
