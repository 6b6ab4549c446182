use anyhow::Result;
use log::{info, warn};
use serde::Serialize;
use std::path::Path;

use crate::cleaner::{CleanSummary, FeatureCleaner};
use crate::config::PipelineConfig;
use crate::metrics;
use crate::models::{EventHistogram, FeatureProfile};
use crate::snapshot;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CleanStageSummary<'a> {
    input_bars: usize,
    input_labels: usize,
    output_path: String,
    clean: &'a CleanSummary,
    classes: EventHistogram,
    features: Vec<FeatureProfile>,
}

/// Assembles raw bars and labels into a feature table, runs the cleaner
/// and writes the result as a dataset snapshot.
pub fn run(
    config: &PipelineConfig,
    bars_path: &Path,
    labels_path: Option<&Path>,
    output_path: &Path,
) -> Result<()> {
    let bars = snapshot::load_bars_json(bars_path)?;
    let labels = match labels_path {
        Some(path) => snapshot::load_labels_json(path)?,
        None => {
            warn!("no label file given, every row becomes a plain negative");
            Vec::new()
        }
    };
    info!(
        "assembling {} bars and {} labels from {}",
        bars.len(),
        labels.len(),
        bars_path.display()
    );

    let raw = snapshot::assemble(&bars, &labels)?;
    let cleaner = FeatureCleaner::new(config.cleaner.clone());
    let (clean, summary) = cleaner.clean(&raw);
    snapshot::save_dataset(output_path, &clean)?;

    let stage_summary = CleanStageSummary {
        input_bars: bars.len(),
        input_labels: labels.len(),
        output_path: output_path.display().to_string(),
        clean: &summary,
        classes: metrics::event_histogram(&clean),
        features: metrics::feature_profiles(&clean),
    };
    match serde_json::to_string(&stage_summary) {
        Ok(payload) => println!("MOONFORGE_CLEAN_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize clean summary: {err}"),
    }
    Ok(())
}
