use anyhow::Result;
use log::{info, warn};
use serde::Serialize;
use std::path::Path;

use crate::config::PipelineConfig;
use crate::snapshot;
use crate::splitter::PurgedCrossValidator;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FoldLine {
    fold: usize,
    train_rows: usize,
    embargoed_rows: usize,
    test_rows: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FoldsStageSummary {
    rows: usize,
    k_folds: usize,
    embargo_fraction: f64,
    chronological_fallback: bool,
    dropped_folds: usize,
    folds: Vec<FoldLine>,
}

/// Prints the purged cross-validation layout for a dataset snapshot without
/// training anything. Useful for sanity-checking embargo widths.
pub fn run(config: &PipelineConfig, input_path: &Path) -> Result<()> {
    let dataset = snapshot::load_dataset(input_path)?;
    info!(
        "computing purged folds over {} rows from {}",
        dataset.len(),
        input_path.display()
    );

    let validator = PurgedCrossValidator::new(config.split.clone());
    let report = validator.split(&dataset);

    if report.chronological_fallback {
        warn!("dataset has too few rows per fold, fell back to a chronological holdout");
    }
    if report.dropped_folds > 0 {
        warn!("dropped {} empty fold(s)", report.dropped_folds);
    }

    let mut lines = Vec::with_capacity(report.splits.len());
    for split in &report.splits {
        println!(
            "fold {:>2}: train {:>6} rows, embargoed {:>4}, test {:>6} rows",
            split.fold,
            split.train_indices.len(),
            split.embargoed_rows,
            split.test_indices.len()
        );
        lines.push(FoldLine {
            fold: split.fold,
            train_rows: split.train_indices.len(),
            embargoed_rows: split.embargoed_rows,
            test_rows: split.test_indices.len(),
        });
    }

    let stage_summary = FoldsStageSummary {
        rows: dataset.len(),
        k_folds: config.split.k_folds,
        embargo_fraction: config.split.embargo_fraction,
        chronological_fallback: report.chronological_fallback,
        dropped_folds: report.dropped_folds,
        folds: lines,
    };
    match serde_json::to_string(&stage_summary) {
        Ok(payload) => println!("MOONFORGE_FOLDS_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize folds summary: {err}"),
    }
    Ok(())
}
