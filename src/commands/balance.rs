use anyhow::Result;
use log::{info, warn};
use serde::Serialize;
use std::path::Path;

use crate::balancer::{BalanceSummary, DatasetBalancer};
use crate::config::PipelineConfig;
use crate::snapshot;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BalanceStageSummary<'a> {
    target_event: &'a str,
    seed: u64,
    output_path: String,
    balance: &'a BalanceSummary,
}

/// Loads a cleaned dataset snapshot, injects hard negatives for the target
/// event and writes the balanced snapshot.
pub fn run(config: &PipelineConfig, input_path: &Path, output_path: &Path) -> Result<()> {
    let dataset = snapshot::load_dataset(input_path)?;
    let target = config.target_event();
    let seed = config.seed();
    info!(
        "balancing {} rows toward {} events from {}",
        dataset.len(),
        target.as_str(),
        input_path.display()
    );

    let balancer = DatasetBalancer::new(config.balancer.clone(), seed);
    let (balanced, summary) = balancer.balance(&dataset, target);
    snapshot::save_dataset(output_path, &balanced)?;

    let stage_summary = BalanceStageSummary {
        target_event: target.as_str(),
        seed,
        output_path: output_path.display().to_string(),
        balance: &summary,
    };
    match serde_json::to_string(&stage_summary) {
        Ok(payload) => println!("MOONFORGE_BALANCE_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize balance summary: {err}"),
    }
    Ok(())
}
