use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use uuid::Uuid;

use crate::errors::StageError;
use crate::models::{Bar, DataRow, Dataset, EventLabel, EventType, RowOrigin};

pub const DATASET_SNAPSHOT_VERSION: u32 = 1;

/// Raw price columns every assembled dataset starts from. The cleaner
/// appends its indicator and derived columns after these.
pub const BASE_FEATURES: [&str; 5] = ["open", "high", "low", "close", "volume"];

/// On-disk form of a dataset between pipeline stages.
#[derive(Debug, Serialize, Deserialize)]
struct DatasetSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    feature_names: Vec<String>,
    rows: Vec<DataRow>,
}

/// Writes the dataset to a temp file next to the target and renames it
/// into place, so a crashed stage never leaves a half-written snapshot.
pub fn save_dataset(path: &Path, dataset: &Dataset) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let snapshot = DatasetSnapshot {
        version: DATASET_SNAPSHOT_VERSION,
        generated_at: Utc::now(),
        feature_names: dataset.feature_names.clone(),
        rows: dataset.rows.clone(),
    };

    let temp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    let file =
        File::create(&temp).with_context(|| format!("failed to create {}", temp.display()))?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, &snapshot)
        .with_context(|| format!("failed to serialize dataset into {}", temp.display()))?;
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", temp.display()))?;
    fs::rename(&temp, path).with_context(|| {
        format!(
            "failed to move snapshot {} into {}",
            temp.display(),
            path.display()
        )
    })?;
    info!(
        "saved dataset snapshot {} ({} rows, {} features)",
        path.display(),
        dataset.len(),
        dataset.feature_names.len()
    );
    Ok(())
}

pub fn load_dataset(path: &Path) -> Result<Dataset> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let snapshot: DatasetSnapshot = bincode::deserialize_from(BufReader::new(file))
        .with_context(|| format!("failed to decode {}", path.display()))?;
    if snapshot.version != DATASET_SNAPSHOT_VERSION {
        return Err(StageError::SnapshotVersion {
            found: snapshot.version,
            expected: DATASET_SNAPSHOT_VERSION,
        }
        .into());
    }
    let dataset = Dataset::new(snapshot.feature_names, snapshot.rows);
    dataset.validate()?;
    Ok(dataset)
}

pub fn load_bars_json(path: &Path) -> Result<Vec<Bar>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn load_labels_json(path: &Path) -> Result<Vec<EventLabel>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

/// Joins raw bars with event labels into the initial feature table.
/// Bars without a label become plain negatives; labels without a bar
/// are dropped with a warning since there is nothing to featurize.
pub fn assemble(bars: &[Bar], labels: &[EventLabel]) -> Result<Dataset, StageError> {
    let mut label_index: HashMap<(&str, NaiveDate), &EventLabel> = HashMap::new();
    for label in labels {
        let key = (label.symbol.as_str(), label.event_date);
        if label_index.insert(key, label).is_some() {
            return Err(StageError::InvalidSchema(format!(
                "duplicate label for {} on {}",
                label.symbol, label.event_date
            )));
        }
    }

    let feature_names: Vec<String> = BASE_FEATURES.iter().map(|s| s.to_string()).collect();
    let mut rows = Vec::with_capacity(bars.len());
    let mut unlabeled = 0usize;
    for bar in bars {
        let (event_type, target_return) =
            match label_index.remove(&(bar.symbol.as_str(), bar.date)) {
                Some(label) => (label.event_type, label.target_return),
                None => {
                    unlabeled += 1;
                    (EventType::None, 0.0)
                }
            };
        rows.push(DataRow {
            symbol: bar.symbol.clone(),
            event_date: bar.date,
            features: vec![
                bar.open.unwrap_or(f64::NAN),
                bar.high.unwrap_or(f64::NAN),
                bar.low.unwrap_or(f64::NAN),
                bar.close.unwrap_or(f64::NAN),
                bar.volume.unwrap_or(f64::NAN),
            ],
            event_type,
            target_return,
            origin: RowOrigin::Natural,
        });
    }
    for (symbol, date) in label_index.keys() {
        warn!("label for {} on {} matches no bar, dropping it", symbol, date);
    }
    if unlabeled > 0 {
        warn!(
            "{} of {} bars had no label, defaulting them to no event",
            unlabeled,
            bars.len()
        );
    }

    let mut dataset = Dataset::new(feature_names, rows);
    dataset.sort_chronologically();
    dataset.validate()?;
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(symbol: &str, day: u32, close: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            open: Some(close - 0.5),
            high: Some(close + 1.0),
            low: Some(close - 1.0),
            close: Some(close),
            volume: Some(1_000.0),
        }
    }

    fn label(symbol: &str, day: u32, event_type: EventType) -> EventLabel {
        EventLabel {
            symbol: symbol.to_string(),
            event_date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            event_type,
            target_return: 0.6,
        }
    }

    #[test]
    fn assemble_joins_labels_and_defaults_to_no_event() {
        let bars = vec![bar("AAA", 1, 10.0), bar("AAA", 2, 11.0), bar("BBB", 1, 5.0)];
        let labels = vec![label("AAA", 2, EventType::Moon)];

        let dataset = assemble(&bars, &labels).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.feature_names, BASE_FEATURES.to_vec());

        let moon_rows: Vec<_> = dataset
            .rows
            .iter()
            .filter(|row| row.event_type == EventType::Moon)
            .collect();
        assert_eq!(moon_rows.len(), 1);
        assert_eq!(moon_rows[0].symbol, "AAA");
        assert_eq!(moon_rows[0].target_return, 0.6);
    }

    #[test]
    fn assemble_turns_missing_fields_into_undefined_values() {
        let mut incomplete = bar("AAA", 1, 10.0);
        incomplete.volume = None;
        incomplete.high = None;

        let dataset = assemble(&[incomplete], &[]).unwrap();
        let row = &dataset.rows[0];
        assert!(row.features[1].is_nan());
        assert!(row.features[4].is_nan());
        assert!(row.features[3].is_finite());
    }

    #[test]
    fn assemble_rejects_duplicate_labels() {
        let labels = vec![label("AAA", 1, EventType::Moon), label("AAA", 1, EventType::Rug)];
        let error = assemble(&[bar("AAA", 1, 10.0)], &labels).unwrap_err();
        assert!(matches!(error, StageError::InvalidSchema(_)));
    }

    #[test]
    fn assemble_output_is_chronologically_sorted() {
        let bars = vec![bar("BBB", 5, 5.0), bar("AAA", 5, 10.0), bar("AAA", 1, 9.0)];
        let dataset = assemble(&bars, &[]).unwrap();

        let order: Vec<(NaiveDate, String)> = dataset
            .rows
            .iter()
            .map(|row| (row.event_date, row.symbol.clone()))
            .collect();
        let mut expected = order.clone();
        expected.sort();
        assert_eq!(order, expected);
    }

    #[test]
    fn snapshot_round_trips_and_rejects_foreign_versions() {
        let dataset = assemble(&[bar("AAA", 1, 10.0), bar("AAA", 2, 11.0)], &[]).unwrap();
        let dir = std::env::temp_dir().join(format!("moonforge-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dataset.bin");

        save_dataset(&path, &dataset).unwrap();
        let loaded = load_dataset(&path).unwrap();
        assert_eq!(loaded.len(), dataset.len());
        assert_eq!(loaded.feature_names, dataset.feature_names);

        let snapshot = DatasetSnapshot {
            version: DATASET_SNAPSHOT_VERSION + 9,
            generated_at: Utc::now(),
            feature_names: dataset.feature_names.clone(),
            rows: dataset.rows.clone(),
        };
        let mut writer = BufWriter::new(File::create(&path).unwrap());
        bincode::serialize_into(&mut writer, &snapshot).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let error = load_dataset(&path).unwrap_err().to_string();
        assert!(error.contains("snapshot version mismatch"), "{}", error);

        fs::remove_dir_all(dir).unwrap();
    }
}
