use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use moonforge::artifact::ModelArtifactStore;
use moonforge::cleaner::FeatureCleaner;
use moonforge::commands::{balance, clean, folds, inspect, pipeline, train};
use moonforge::config::{CleanerConfig, PipelineConfig};
use moonforge::errors::QualityFlag;
use moonforge::models::{Bar, EventLabel, EventType, RowOrigin};
use moonforge::snapshot;
use moonforge::trainer::EnsembleTrainer;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use uuid::Uuid;

const PIPELINE_DAYS: i64 = 240;
const MOON_STRIDE: usize = 17;
const NEAR_MISS_STRIDE: usize = 11;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn temp_workspace(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "moonforge-it-{}-{}",
        tag,
        Uuid::new_v4().simple()
    ));
    fs::create_dir_all(&dir).expect("temp workspace");
    dir
}

fn baseline_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 2).expect("valid date")
}

struct SymbolSeed {
    symbol: &'static str,
    base_price: f64,
    drift: f64,
}

const UNIVERSE: &[SymbolSeed] = &[
    SymbolSeed {
        symbol: "AAA",
        base_price: 90.0,
        drift: 0.05,
    },
    SymbolSeed {
        symbol: "BBB",
        base_price: 45.0,
        drift: 0.03,
    },
    SymbolSeed {
        symbol: "CCC",
        base_price: 12.0,
        drift: 0.02,
    },
    SymbolSeed {
        symbol: "DDD",
        base_price: 6.5,
        drift: 0.01,
    },
];

/// Deterministic wave-shaped daily bars across the whole universe. The
/// same inputs always produce the same bars, so tests can compare runs.
fn synthetic_bars(total_days: i64) -> Vec<Bar> {
    let baseline = baseline_start_date();
    let mut bars = Vec::new();
    for day in 0..total_days {
        let date = baseline + chrono::Duration::days(day);
        let day_f = day as f64;
        for (idx, seed) in UNIVERSE.iter().enumerate() {
            let idx_f = idx as f64 + 1.0;
            let fast_wave = (day_f / (5.0 + idx_f)).sin();
            let slow_wave = (day_f / (30.0 + idx_f * 0.8) + idx_f * 0.2).cos();
            let close =
                (seed.base_price + day_f * seed.drift + fast_wave * 2.2 + slow_wave * 3.6).max(0.5);
            let range = 0.8 + fast_wave.abs() * 1.4 + slow_wave.abs() * 0.9;
            let open = (close - fast_wave * range * 0.4).max(0.4);
            let volume =
                50_000.0 + idx_f * 9_000.0 + 20_000.0 * (fast_wave.abs() + slow_wave.abs());
            bars.push(Bar {
                symbol: seed.symbol.to_string(),
                date,
                open: Some(open),
                high: Some(close + range),
                low: Some((close - range).max(0.25)),
                close: Some(close),
                volume: Some(volume),
            });
        }
    }
    bars
}

/// Labels every 17th bar as a moon and every 11th as a sub-threshold
/// near miss, which feeds the balancer's almost-moon candidate pool.
fn synthetic_labels(bars: &[Bar]) -> Vec<EventLabel> {
    let mut labels = Vec::new();
    for (i, bar) in bars.iter().enumerate() {
        if i % MOON_STRIDE == MOON_STRIDE - 1 {
            labels.push(EventLabel {
                symbol: bar.symbol.clone(),
                event_date: bar.date,
                event_type: EventType::Moon,
                target_return: 0.40,
            });
        } else if i % NEAR_MISS_STRIDE == NEAR_MISS_STRIDE - 1 {
            labels.push(EventLabel {
                symbol: bar.symbol.clone(),
                event_date: bar.date,
                event_type: EventType::None,
                target_return: 0.18,
            });
        }
    }
    labels
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_string(value).context("failed to serialize test input")?;
    fs::write(path, payload).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Default pipeline config shrunk to test-friendly model sizes.
fn fast_config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.seed = Some(7);
    config.trainer.n_trees = 24;
    config.trainer.max_depth = 6;
    config.trainer.boost_rounds = 20;
    config.store.root = root.join("artifacts");
    config
}

#[test]
fn spike_series_defines_indicators_after_warmup() -> Result<()> {
    ensure_test_env();

    // Flat at 100 with a +25% jump on day 100 that fully retraces by day 110
    let baseline = baseline_start_date();
    let mut bars = Vec::new();
    for day in 0..120i64 {
        let close = if day < 100 {
            100.0
        } else if day < 110 {
            125.0 - 2.5 * (day - 100) as f64
        } else {
            100.0
        };
        bars.push(Bar {
            symbol: "AAA".to_string(),
            date: baseline + chrono::Duration::days(day),
            open: Some(close),
            high: Some(close + 1.0),
            low: Some(close - 1.0),
            close: Some(close),
            volume: Some(1_000.0),
        });
    }

    let raw = snapshot::assemble(&bars, &[])?;
    let cleaner = FeatureCleaner::new(CleanerConfig::default());
    let (cleaned, summary) = cleaner.clean(&raw);

    assert_eq!(cleaned.len(), 120);
    assert_eq!(summary.unfillable, 0);
    for row in &cleaned.rows {
        for value in &row.features {
            assert!(value.is_finite());
        }
    }

    let companion = cleaned
        .feature_index("rsi_14_isnan")
        .ok_or_else(|| anyhow!("rsi_14_isnan column missing"))?;
    for (i, row) in cleaned.rows.iter().enumerate() {
        let expected = if i < 14 { 1.0 } else { 0.0 };
        assert_eq!(row.features[companion], expected, "row {}", i);
    }

    let momentum = cleaned
        .feature_index("momentum_10")
        .ok_or_else(|| anyhow!("momentum_10 column missing"))?;
    let spike = cleaned.rows[100].features[momentum];
    assert!(spike > 20.0, "expected a spike at the jump, got {}", spike);
    let quiet = cleaned.rows[60].features[momentum];
    assert!(quiet.abs() < 1.0, "expected flat momentum, got {}", quiet);
    Ok(())
}

#[test]
fn pipeline_command_trains_saves_and_reloads_bit_identical() -> Result<()> {
    ensure_test_env();
    let workspace = temp_workspace("pipeline");
    let bars = synthetic_bars(PIPELINE_DAYS);
    let labels = synthetic_labels(&bars);
    let bars_path = workspace.join("bars.json");
    let labels_path = workspace.join("labels.json");
    write_json(&bars_path, &bars)?;
    write_json(&labels_path, &labels)?;

    let config = fast_config(&workspace);
    let dataset_dir = workspace.join("datasets");
    pipeline::run(&config, &bars_path, Some(&labels_path), Some(&dataset_dir))?;

    let cleaned = snapshot::load_dataset(&dataset_dir.join("clean.bin"))?;
    let balanced = snapshot::load_dataset(&dataset_dir.join("balanced.bin"))?;
    assert_eq!(cleaned.len(), bars.len());
    assert!(balanced.len() > cleaned.len(), "no hard negatives injected");
    assert_eq!(balanced.feature_names, cleaned.feature_names);

    let store = ModelArtifactStore::new(&config.store.root);
    let (model, metadata) = store.load_current(&config.store.model_name)?;
    assert_eq!(metadata.mode, "ensemble");
    assert_eq!(metadata.seed, 7);
    assert_eq!(metadata.target_event, EventType::Moon);
    assert_eq!(
        metadata.learner_kinds,
        vec!["bagged".to_string(), "boosted".to_string()]
    );
    assert_eq!(metadata.feature_names, balanced.feature_names);
    assert_eq!(metadata.metrics.train_rows, balanced.len());

    // Retraining from the stored snapshot with the same seed must agree
    // with the persisted model on every probed row, bit for bit.
    let trainer = EnsembleTrainer::new(config.trainer.clone(), EventType::Moon, config.seed());
    let outcome = trainer
        .train(&balanced, &config.split, None)
        .map_err(|err| anyhow!("retrain failed: {err}"))?;
    for row in balanced.rows.iter().step_by(37) {
        let reloaded = model.predict_proba(&row.features);
        let retrained = outcome.model.predict_proba(&row.features);
        assert_eq!(reloaded.to_bits(), retrained.to_bits());
        assert!((0.0..=1.0).contains(&reloaded));
    }

    fs::remove_dir_all(&workspace).ok();
    Ok(())
}

#[test]
fn stage_commands_chain_through_snapshots() -> Result<()> {
    ensure_test_env();
    let workspace = temp_workspace("stages");
    let bars = synthetic_bars(180);
    let labels = synthetic_labels(&bars);
    let bars_path = workspace.join("bars.json");
    let labels_path = workspace.join("labels.json");
    write_json(&bars_path, &bars)?;
    write_json(&labels_path, &labels)?;

    let config = fast_config(&workspace);
    let clean_path = workspace.join("clean.bin");
    let balanced_path = workspace.join("balanced.bin");

    clean::run(&config, &bars_path, Some(&labels_path), &clean_path)?;
    balance::run(&config, &clean_path, &balanced_path)?;
    folds::run(&config, &balanced_path)?;
    train::run(&config, &balanced_path, None)?;

    let store = ModelArtifactStore::new(&config.store.root);
    let current = store.current_artifact_id(&config.store.model_name)?;
    inspect::run(&config, Some(&current), false)?;
    inspect::run(&config, None, true)?;

    let cleaned = snapshot::load_dataset(&clean_path)?;
    let balanced = snapshot::load_dataset(&balanced_path)?;
    let rate_before = cleaned.positive_rate(EventType::Moon);
    let rate_after = balanced.positive_rate(EventType::Moon);
    assert!(rate_after <= rate_before);
    assert!(
        rate_before - rate_after <= config.balancer.positive_rate_tolerance + 1e-9,
        "positive rate drifted from {:.4} to {:.4}",
        rate_before,
        rate_after
    );
    assert!(balanced
        .rows
        .iter()
        .any(|row| matches!(row.origin, RowOrigin::Synthetic { .. })));

    fs::remove_dir_all(&workspace).ok();
    Ok(())
}

#[test]
fn unlabeled_data_flags_undefined_auc_but_still_ships_an_artifact() -> Result<()> {
    ensure_test_env();
    let workspace = temp_workspace("flags");
    let bars = synthetic_bars(120);
    let bars_path = workspace.join("bars.json");
    write_json(&bars_path, &bars)?;

    let config = fast_config(&workspace);
    let dataset_dir = workspace.join("datasets");
    pipeline::run(&config, &bars_path, None, Some(&dataset_dir))?;

    let store = ModelArtifactStore::new(&config.store.root);
    let (model, metadata) = store.load_current(&config.store.model_name)?;
    let metrics = &metadata.metrics;
    assert!(!metrics.training_auc_defined);
    assert_eq!(metrics.training_auc, 0.0);
    assert!(metrics.flags.contains(&QualityFlag::AucUndefined));
    assert!(metrics.flags.contains(&QualityFlag::CalibrationFallback));
    assert_eq!(metadata.calibration, "identity");
    assert!(!model.is_calibrated());

    // Raw scores still behave like probabilities without a calibrator
    let cleaned = snapshot::load_dataset(&dataset_dir.join("clean.bin"))?;
    for row in cleaned.rows.iter().step_by(23) {
        let probability = model.predict_proba(&row.features);
        assert!((0.0..=1.0).contains(&probability));
    }

    fs::remove_dir_all(&workspace).ok();
    Ok(())
}

#[test]
fn same_seed_pipeline_runs_produce_identical_models() -> Result<()> {
    ensure_test_env();
    let workspace = temp_workspace("determinism");
    let bars = synthetic_bars(200);
    let labels = synthetic_labels(&bars);
    let bars_path = workspace.join("bars.json");
    let labels_path = workspace.join("labels.json");
    write_json(&bars_path, &bars)?;
    write_json(&labels_path, &labels)?;

    let mut first = fast_config(&workspace);
    first.store.root = workspace.join("store-a");
    let mut second = fast_config(&workspace);
    second.store.root = workspace.join("store-b");

    let dataset_dir = workspace.join("datasets");
    pipeline::run(&first, &bars_path, Some(&labels_path), Some(&dataset_dir))?;
    pipeline::run(&second, &bars_path, Some(&labels_path), None)?;

    let (model_a, metadata_a) =
        ModelArtifactStore::new(&first.store.root).load_current(&first.store.model_name)?;
    let (model_b, metadata_b) =
        ModelArtifactStore::new(&second.store.root).load_current(&second.store.model_name)?;
    assert_eq!(
        metadata_a.metrics.training_accuracy,
        metadata_b.metrics.training_accuracy
    );
    assert_eq!(metadata_a.metrics.brier_score, metadata_b.metrics.brier_score);

    let probe = snapshot::load_dataset(&dataset_dir.join("balanced.bin"))?;
    for row in probe.rows.iter().step_by(29) {
        let a = model_a.predict_proba(&row.features);
        let b = model_b.predict_proba(&row.features);
        assert_eq!(a.to_bits(), b.to_bits());

        let (probability, agreement) = model_a.predict_with_agreement(&row.features);
        assert!((0.0..=1.0).contains(&probability));
        assert!((0.0..=1.0).contains(&agreement));
    }

    fs::remove_dir_all(&workspace).ok();
    Ok(())
}

#[test]
fn single_mode_train_command_records_one_learner() -> Result<()> {
    ensure_test_env();
    let workspace = temp_workspace("single");
    let bars = synthetic_bars(160);
    let labels = synthetic_labels(&bars);

    let raw = snapshot::assemble(&bars, &labels)?;
    let cleaner = FeatureCleaner::new(CleanerConfig::default());
    let (cleaned, _) = cleaner.clean(&raw);
    let snapshot_path = workspace.join("clean.bin");
    snapshot::save_dataset(&snapshot_path, &cleaned)?;

    let mut config = fast_config(&workspace);
    config.trainer.mode = "single".parse()?;
    train::run(&config, &snapshot_path, None)?;

    let store = ModelArtifactStore::new(&config.store.root);
    let (model, metadata) = store.load_current(&config.store.model_name)?;
    assert_eq!(metadata.mode, "single");
    assert_eq!(metadata.learner_kinds, vec!["bagged".to_string()]);
    assert_eq!(model.learner_kinds().len(), 1);
    assert_eq!(metadata.metrics.agreement_mean, 1.0);

    fs::remove_dir_all(&workspace).ok();
    Ok(())
}
