//! Snapshot checkpoints and their manifest.

use chrono::{DateTime, Utc};
use deepseis_core::persistence::{atomic_write, atomic_write_json, load_json};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::MlError;
use crate::models::{ModelState, SegmentationModel};
use crate::training::evaluator::{EvaluationObserver, EvaluationReport};
use crate::training::state::TrainingState;

pub const MANIFEST_FILE: &str = "checkpoints.json";

/// A saved model snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub model: String,
    pub snapshot: u64,
    pub epoch: usize,
    pub iteration: u64,
    pub miou: f64,
    pub path: PathBuf,
    /// SHA-256 of the file contents.
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// `<model>_snapshot<k>model_<miou>.json`, mIoU to four decimals.
pub fn snapshot_file_name(model: &str, snapshot: u64, miou: f64) -> String {
    format!("{model}_snapshot{snapshot}model_{miou:.4}.json")
}

/// Checkpoint manager for one model directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    base_dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(base_dir: PathBuf, max_checkpoints: usize) -> Self {
        Self {
            base_dir,
            max_checkpoints: max_checkpoints.max(1),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn manifest_path(&self) -> PathBuf {
        self.base_dir.join(MANIFEST_FILE)
    }

    /// Manifest entries, oldest first.
    pub fn list(&self) -> Result<Vec<Checkpoint>, MlError> {
        let path = self.manifest_path();
        Ok(load_json(&path)
            .map_err(|e| corrupt(&path, e))?
            .unwrap_or_default())
    }

    /// The checkpoint with the highest mIoU.
    pub fn best(&self) -> Result<Option<Checkpoint>, MlError> {
        let checkpoints = self.list()?;
        Ok(checkpoints.into_iter().max_by(|a, b| {
            a.miou
                .partial_cmp(&b.miou)
                .unwrap_or(std::cmp::Ordering::Equal)
        }))
    }

    /// Write `state` as a snapshot and record it in the manifest.
    ///
    /// A snapshot whose file name already exists overwrites it, and its manifest entry is
    /// replaced.
    pub fn save(
        &self,
        state: &ModelState,
        snapshot: u64,
        epoch: usize,
        iteration: u64,
        miou: f64,
    ) -> Result<Checkpoint, MlError> {
        std::fs::create_dir_all(&self.base_dir)?;
        let path = self
            .base_dir
            .join(snapshot_file_name(&state.model, snapshot, miou));

        let payload = serde_json::to_vec_pretty(state)?;
        atomic_write(&path, &payload)?;
        let hash = format!("{:x}", Sha256::digest(&payload));

        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            model: state.model.clone(),
            snapshot,
            epoch,
            iteration,
            miou,
            path: path.clone(),
            hash,
            size_bytes: payload.len() as u64,
            created_at: Utc::now(),
        };

        let mut checkpoints = self.list()?;
        checkpoints.retain(|c| c.path != path);
        checkpoints.push(checkpoint.clone());

        // Enforce max_checkpoints by removing oldest entries.
        while checkpoints.len() > self.max_checkpoints {
            checkpoints.remove(0);
        }

        atomic_write_json(&self.manifest_path(), &checkpoints)?;
        tracing::info!(
            path = %path.display(),
            snapshot,
            epoch,
            miou,
            "Saved checkpoint"
        );

        Ok(checkpoint)
    }

    /// Read a model state from a checkpoint file.
    pub fn load_state(path: &Path) -> Result<ModelState, MlError> {
        load_json(path)
            .map_err(|e| corrupt(path, e))?
            .ok_or_else(|| MlError::data_not_found("checkpoint", path))
    }

    /// Re-hash a checkpoint file and compare it with the manifest.
    pub fn verify(&self, checkpoint: &Checkpoint) -> Result<bool, MlError> {
        let bytes = std::fs::read(&checkpoint.path)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)) == checkpoint.hash)
    }
}

/// Undecodable checkpoint payloads are checkpoint errors; other I/O failures pass through.
fn corrupt(path: &Path, err: std::io::Error) -> MlError {
    if err.kind() == std::io::ErrorKind::InvalidData {
        MlError::checkpoint(format!("{}: {err}", path.display()))
    } else {
        MlError::Io(err)
    }
}

/// Saves a snapshot after an evaluation whenever `iteration % snapshot_duration == 0`.
#[derive(Debug, Clone)]
pub struct SnapshotHandler {
    manager: CheckpointManager,
    snapshot_duration: u64,
}

impl SnapshotHandler {
    pub fn new(manager: CheckpointManager, snapshot_duration: u64) -> Self {
        Self {
            manager,
            snapshot_duration: snapshot_duration.max(1),
        }
    }

    pub fn snapshot_duration(&self) -> u64 {
        self.snapshot_duration
    }
}

impl EvaluationObserver for SnapshotHandler {
    fn name(&self) -> &str {
        "snapshot_handler"
    }

    fn on_evaluation(
        &mut self,
        state: &TrainingState,
        model: &dyn SegmentationModel,
        report: &EvaluationReport,
    ) -> Result<(), MlError> {
        if state.iteration == 0 || state.iteration % self.snapshot_duration != 0 {
            return Ok(());
        }
        let snapshot = state.iteration / self.snapshot_duration;
        self.manager.save(
            &model.state(),
            snapshot,
            state.epoch,
            state.iteration,
            report.metrics.mean_iou,
        )?;
        Ok(())
    }
}
