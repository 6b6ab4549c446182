use anyhow::{Context, Result};
use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::errors::StageError;
use crate::models::ArtifactMetadata;
use crate::trainer::CalibratedModel;

pub const MODEL_ARTIFACT_VERSION: u32 = 1;

const CURRENT_POINTER: &str = "CURRENT";

/// Versioned wrapper around the serialized model so loads can refuse
/// binaries written by an incompatible build.
#[derive(Debug, Serialize, Deserialize)]
struct ModelArtifactEnvelope {
    version: u32,
    model: CalibratedModel,
}

/// Filesystem layout: `<root>/<model name>/<artifact id>/` holding
/// `model.bin` plus `metadata.json`, and a `CURRENT` pointer file next
/// to the artifact directories. Every publish is staged in a dot-prefixed
/// directory and renamed into place, so readers never observe a partial
/// artifact.
pub struct ModelArtifactStore {
    root: PathBuf,
}

impl ModelArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Persists the model and its metadata, returning the new artifact
    /// id. The id is also written into `metadata.artifact_id` and the
    /// `CURRENT` pointer moves to it.
    pub fn save(
        &self,
        model_name: &str,
        model: &CalibratedModel,
        metadata: &mut ArtifactMetadata,
    ) -> Result<String> {
        let artifact_id = new_artifact_id();
        metadata.artifact_id = artifact_id.clone();
        metadata.model_name = model_name.to_string();

        let model_dir = self.root.join(model_name);
        fs::create_dir_all(&model_dir)
            .with_context(|| format!("failed to create model directory {}", model_dir.display()))?;

        let staging = model_dir.join(format!(".staging-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&staging)
            .with_context(|| format!("failed to create staging directory {}", staging.display()))?;

        let envelope = ModelArtifactEnvelope {
            version: MODEL_ARTIFACT_VERSION,
            model: model.clone(),
        };
        let model_path = staging.join("model.bin");
        let file = File::create(&model_path)
            .with_context(|| format!("failed to create {}", model_path.display()))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &envelope)
            .with_context(|| format!("failed to serialize model into {}", model_path.display()))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush {}", model_path.display()))?;

        let metadata_path = staging.join("metadata.json");
        let metadata_json = serde_json::to_string_pretty(metadata)
            .context("failed to serialize artifact metadata")?;
        fs::write(&metadata_path, metadata_json)
            .with_context(|| format!("failed to write {}", metadata_path.display()))?;

        let final_dir = model_dir.join(&artifact_id);
        fs::rename(&staging, &final_dir).with_context(|| {
            format!(
                "failed to publish staged artifact {} as {}",
                staging.display(),
                final_dir.display()
            )
        })?;

        self.update_current_pointer(&model_dir, &artifact_id)?;
        info!(
            "saved model artifact {}/{} ({} learners)",
            model_name,
            artifact_id,
            metadata.learner_kinds.len()
        );
        Ok(artifact_id)
    }

    pub fn load(
        &self,
        model_name: &str,
        artifact_id: &str,
    ) -> Result<(CalibratedModel, ArtifactMetadata)> {
        let artifact_dir = self.root.join(model_name).join(artifact_id);
        let metadata = self.load_metadata_from(&artifact_dir)?;

        let model_path = artifact_dir.join("model.bin");
        let file = File::open(&model_path)
            .with_context(|| format!("failed to open {}", model_path.display()))?;
        let envelope: ModelArtifactEnvelope = bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("failed to decode {}", model_path.display()))?;
        if envelope.version != MODEL_ARTIFACT_VERSION {
            return Err(StageError::ArtifactVersion {
                found: envelope.version,
                expected: MODEL_ARTIFACT_VERSION,
            }
            .into());
        }
        if envelope.model.feature_names != metadata.feature_names {
            return Err(StageError::StoreCorruption(format!(
                "feature names in {} disagree with metadata.json",
                model_path.display()
            ))
            .into());
        }
        Ok((envelope.model, metadata))
    }

    /// Loads whatever the `CURRENT` pointer names.
    pub fn load_current(&self, model_name: &str) -> Result<(CalibratedModel, ArtifactMetadata)> {
        let artifact_id = self.current_artifact_id(model_name)?;
        self.load(model_name, &artifact_id)
    }

    pub fn current_artifact_id(&self, model_name: &str) -> Result<String> {
        let pointer = self.root.join(model_name).join(CURRENT_POINTER);
        let contents = fs::read_to_string(&pointer)
            .with_context(|| format!("failed to read {}", pointer.display()))?;
        let artifact_id = contents.trim().to_string();
        if artifact_id.is_empty() {
            return Err(StageError::StoreCorruption(format!(
                "{} names no artifact",
                pointer.display()
            ))
            .into());
        }
        Ok(artifact_id)
    }

    pub fn load_metadata(&self, model_name: &str, artifact_id: &str) -> Result<ArtifactMetadata> {
        self.load_metadata_from(&self.root.join(model_name).join(artifact_id))
    }

    /// Artifact ids for one model, newest first. Staging leftovers and
    /// the pointer file are skipped.
    pub fn list(&self, model_name: &str) -> Result<Vec<String>> {
        let model_dir = self.root.join(model_name);
        if !model_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&model_dir)
            .with_context(|| format!("failed to read {}", model_dir.display()))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to read entry in {}", model_dir.display()))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            ids.push(name);
        }
        ids.sort_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    fn load_metadata_from(&self, artifact_dir: &Path) -> Result<ArtifactMetadata> {
        let metadata_path = artifact_dir.join("metadata.json");
        let contents = fs::read_to_string(&metadata_path)
            .with_context(|| format!("failed to read {}", metadata_path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", metadata_path.display()))
    }

    fn update_current_pointer(&self, model_dir: &Path, artifact_id: &str) -> Result<()> {
        let temp = model_dir.join(format!(".current-{}", Uuid::new_v4().simple()));
        fs::write(&temp, artifact_id)
            .with_context(|| format!("failed to write {}", temp.display()))?;
        let pointer = model_dir.join(CURRENT_POINTER);
        fs::rename(&temp, &pointer)
            .with_context(|| format!("failed to move pointer to {}", pointer.display()))?;
        Ok(())
    }
}

fn new_artifact_id() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", stamp, &suffix[..8])
}
