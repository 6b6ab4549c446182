use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::info;
use moonforge::commands::{balance, clean, folds, inspect, pipeline, train};
use moonforge::config::{ClassWeights, PipelineConfig};
use std::path::PathBuf;

const DEFAULT_CLEAN_DATASET_FILE: &str = "datasets/clean.bin";
const DEFAULT_BALANCED_DATASET_FILE: &str = "datasets/balanced.bin";

#[derive(Parser)]
#[command(name = "moonforge")]
#[command(about = "A leakage-safe training pipeline for rare crypto price events")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble, clean, balance and train in one process
    Pipeline {
        /// Path to the OHLCV bars JSON file
        bars: PathBuf,
        /// Path to the event labels JSON file
        #[arg(long, value_name = "PATH")]
        labels: Option<PathBuf>,
        /// Path to a pipeline config JSON file
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Directory for intermediate dataset snapshots
        #[arg(long = "dataset-dir", value_name = "DIR")]
        dataset_dir: Option<PathBuf>,
        /// Random seed override
        #[arg(long)]
        seed: Option<u64>,
        /// Target event override (moon or rug)
        #[arg(long)]
        target: Option<String>,
    },
    /// Assemble bars and labels into a cleaned dataset snapshot
    Clean {
        /// Path to the OHLCV bars JSON file
        bars: PathBuf,
        /// Path to the event labels JSON file
        #[arg(long, value_name = "PATH")]
        labels: Option<PathBuf>,
        /// Destination snapshot (defaults to datasets/clean.bin)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Path to a pipeline config JSON file
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// Inject hard negatives into a cleaned dataset snapshot
    Balance {
        /// Source snapshot (defaults to datasets/clean.bin)
        input: Option<PathBuf>,
        /// Destination snapshot (defaults to datasets/balanced.bin)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Path to a pipeline config JSON file
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Random seed override
        #[arg(long)]
        seed: Option<u64>,
        /// Target event override (moon or rug)
        #[arg(long)]
        target: Option<String>,
    },
    /// Train the ensemble on a balanced snapshot and store the artifact
    Train {
        /// Source snapshot (defaults to datasets/balanced.bin)
        input: Option<PathBuf>,
        /// Path to a pipeline config JSON file
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Random seed override
        #[arg(long)]
        seed: Option<u64>,
        /// Target event override (moon or rug)
        #[arg(long)]
        target: Option<String>,
        /// Trainer mode override (ensemble or single)
        #[arg(long)]
        mode: Option<String>,
        /// Explicit positive class weight, requires --weight-negative
        #[arg(long = "weight-positive")]
        weight_positive: Option<f64>,
        /// Explicit negative class weight, requires --weight-positive
        #[arg(long = "weight-negative")]
        weight_negative: Option<f64>,
    },
    /// Print the purged cross-validation layout for a dataset snapshot
    Folds {
        /// Source snapshot (defaults to datasets/balanced.bin)
        input: Option<PathBuf>,
        /// Path to a pipeline config JSON file
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Fold count override
        #[arg(long = "k-folds")]
        k_folds: Option<usize>,
        /// Embargo fraction override
        #[arg(long)]
        embargo: Option<f64>,
    },
    /// Show metadata for a stored artifact (CURRENT when no id is given)
    Inspect {
        /// Artifact id to inspect
        artifact_id: Option<String>,
        /// Path to a pipeline config JSON file
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// List every stored artifact id instead
        #[arg(long)]
        list: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    info!("Starting moonforge. Event models are research tools, not trading advice.");

    match command {
        Commands::Pipeline {
            bars,
            labels,
            config,
            dataset_dir,
            seed,
            target,
        } => {
            let mut config = PipelineConfig::load_or_default(config.as_deref())?;
            apply_overrides(&mut config, seed, target.as_deref(), None)?;
            config.validate()?;
            pipeline::run(&config, &bars, labels.as_deref(), dataset_dir.as_deref())?;
        }
        Commands::Clean {
            bars,
            labels,
            output,
            config,
        } => {
            let config = PipelineConfig::load_or_default(config.as_deref())?;
            config.validate()?;
            let output_path = resolve_dataset_path(output, DEFAULT_CLEAN_DATASET_FILE);
            clean::run(&config, &bars, labels.as_deref(), &output_path)?;
        }
        Commands::Balance {
            input,
            output,
            config,
            seed,
            target,
        } => {
            let mut config = PipelineConfig::load_or_default(config.as_deref())?;
            apply_overrides(&mut config, seed, target.as_deref(), None)?;
            config.validate()?;
            let input_path = resolve_dataset_path(input, DEFAULT_CLEAN_DATASET_FILE);
            let output_path = resolve_dataset_path(output, DEFAULT_BALANCED_DATASET_FILE);
            balance::run(&config, &input_path, &output_path)?;
        }
        Commands::Train {
            input,
            config,
            seed,
            target,
            mode,
            weight_positive,
            weight_negative,
        } => {
            let mut config = PipelineConfig::load_or_default(config.as_deref())?;
            apply_overrides(&mut config, seed, target.as_deref(), mode.as_deref())?;
            config.validate()?;
            let weights = explicit_weights(weight_positive, weight_negative)?;
            let input_path = resolve_dataset_path(input, DEFAULT_BALANCED_DATASET_FILE);
            train::run(&config, &input_path, weights)?;
        }
        Commands::Folds {
            input,
            config,
            k_folds,
            embargo,
        } => {
            let mut config = PipelineConfig::load_or_default(config.as_deref())?;
            if let Some(k) = k_folds {
                config.split.k_folds = k;
            }
            if let Some(fraction) = embargo {
                config.split.embargo_fraction = fraction;
            }
            config.validate()?;
            let input_path = resolve_dataset_path(input, DEFAULT_BALANCED_DATASET_FILE);
            folds::run(&config, &input_path)?;
        }
        Commands::Inspect {
            artifact_id,
            config,
            list,
        } => {
            let config = PipelineConfig::load_or_default(config.as_deref())?;
            config.validate()?;
            inspect::run(&config, artifact_id.as_deref(), list)?;
        }
    }

    Ok(())
}

fn apply_overrides(
    config: &mut PipelineConfig,
    seed: Option<u64>,
    target: Option<&str>,
    mode: Option<&str>,
) -> Result<()> {
    if let Some(seed) = seed {
        config.seed = Some(seed);
    }
    if let Some(target) = target {
        config.target_event = Some(target.parse()?);
    }
    if let Some(mode) = mode {
        config.trainer.mode = mode.parse()?;
    }
    Ok(())
}

fn explicit_weights(positive: Option<f64>, negative: Option<f64>) -> Result<Option<ClassWeights>> {
    match (positive, negative) {
        (Some(positive), Some(negative)) => {
            let weights = ClassWeights { negative, positive };
            weights.validate()?;
            Ok(Some(weights))
        }
        (None, None) => Ok(None),
        _ => Err(anyhow!(
            "--weight-positive and --weight-negative must be given together"
        )),
    }
}

fn resolve_dataset_path(cli_value: Option<PathBuf>, default: &str) -> PathBuf {
    if let Some(path) = cli_value {
        return path;
    }

    PathBuf::from(default)
}
