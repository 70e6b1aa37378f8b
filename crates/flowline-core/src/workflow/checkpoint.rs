//! Durable checkpoint manager.
//!
//! Wraps a `CheckpointStore` with the snapshot format: serialization, format
//! versioning, and the checks that decide whether a stored checkpoint can
//! resume against the current document. A checkpoint is either applied in
//! full or rejected; there is no partial reconciliation.

use flowline_types::checkpoint::{CHECKPOINT_FORMAT_VERSION, Checkpoint, StepMarker};
use flowline_types::error::RepositoryError;
use flowline_types::run::ErrorKind;
use flowline_types::workflow::{StepKind, StepRecord, WorkflowDocument};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::repository::checkpoint::CheckpointStore;

// ---------------------------------------------------------------------------
// CheckpointError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("no checkpoint found for run {0}")]
    NotFound(Uuid),

    #[error("checkpoint for run {run_id} cannot be resumed: {reason}; start a fresh run instead")]
    Corrupt { run_id: Uuid, reason: String },

    #[error("checkpoint storage error: {0}")]
    Io(#[from] RepositoryError),

    #[error("checkpoint serialization error: {0}")]
    Serialization(String),
}

impl CheckpointError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckpointError::Corrupt { .. } => ErrorKind::CheckpointCorrupt,
            _ => ErrorKind::CheckpointIo,
        }
    }

    fn corrupt(run_id: Uuid, reason: impl Into<String>) -> Self {
        CheckpointError::Corrupt {
            run_id,
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

/// Hex SHA-256 of a step record's JSON form.
///
/// Any edit to the step (including its nested steps) changes the digest.
pub fn step_digest(step: &StepRecord) -> String {
    let mut hasher = Sha256::new();
    // StepRecord contains only maps with string keys, so this cannot fail.
    hasher.update(serde_json::to_vec(step).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

pub fn step_marker(step: &StepRecord) -> StepMarker {
    StepMarker {
        name: step.name.clone(),
        digest: step_digest(step),
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Generic over `S: CheckpointStore` so it works with any backend
/// (filesystem, SQLite, in-memory).
pub struct CheckpointManager<S: CheckpointStore> {
    store: S,
}

impl<S: CheckpointStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Serialize and persist a checkpoint, replacing any previous one.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let body = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        self.store
            .save(checkpoint.run_id, &checkpoint.workflow_name, &body)
            .await?;

        tracing::debug!(
            run_id = %checkpoint.run_id,
            completed = checkpoint.completed_step_path.len(),
            loop_progress = checkpoint.loop_progress.is_some(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Load and decode the checkpoint for `run_id`.
    pub async fn load(&self, run_id: Uuid) -> Result<Checkpoint, CheckpointError> {
        let body = self
            .store
            .load(run_id)
            .await?
            .ok_or(CheckpointError::NotFound(run_id))?;

        let checkpoint: Checkpoint = serde_json::from_str(&body)
            .map_err(|e| CheckpointError::corrupt(run_id, format!("unreadable snapshot: {e}")))?;

        if checkpoint.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointError::corrupt(
                run_id,
                format!(
                    "unsupported format version {} (expected {CHECKPOINT_FORMAT_VERSION})",
                    checkpoint.format_version
                ),
            ));
        }
        if checkpoint.run_id != run_id {
            return Err(CheckpointError::corrupt(
                run_id,
                format!("snapshot belongs to run {}", checkpoint.run_id),
            ));
        }
        Ok(checkpoint)
    }
}

/// Check that `checkpoint` describes a prefix of `doc`'s top-level steps.
///
/// Returns the index of the first step still to run.
pub fn verify_resumable(checkpoint: &Checkpoint, doc: &WorkflowDocument) -> Result<usize, CheckpointError> {
    let run_id = checkpoint.run_id;

    if checkpoint.workflow_name != doc.name {
        return Err(CheckpointError::corrupt(
            run_id,
            format!(
                "snapshot is for workflow '{}', not '{}'",
                checkpoint.workflow_name, doc.name
            ),
        ));
    }

    let path = &checkpoint.completed_step_path;
    if path.len() > doc.steps.len() {
        return Err(CheckpointError::corrupt(
            run_id,
            format!(
                "{} steps recorded but the document has only {}",
                path.len(),
                doc.steps.len()
            ),
        ));
    }

    for (i, (marker, step)) in path.iter().zip(&doc.steps).enumerate() {
        if marker.name != step.name {
            return Err(CheckpointError::corrupt(
                run_id,
                format!(
                    "step {i} was '{}' but the document now has '{}'",
                    marker.name, step.name
                ),
            ));
        }
        if marker.digest != step_digest(step) {
            return Err(CheckpointError::corrupt(
                run_id,
                format!("step '{}' changed since the checkpoint was written", step.name),
            ));
        }
        if !checkpoint.context.step_outputs.contains_key(&marker.name) {
            return Err(CheckpointError::corrupt(
                run_id,
                format!("no recorded output for completed step '{}'", marker.name),
            ));
        }
    }

    if let Some(progress) = &checkpoint.loop_progress {
        let resumable = match doc.steps.get(path.len()) {
            Some(StepRecord {
                name,
                kind: StepKind::Loop { parallel: false, .. },
                ..
            }) => *name == progress.step,
            _ => false,
        };
        if !resumable {
            return Err(CheckpointError::corrupt(
                run_id,
                format!("loop progress for '{}' does not match the next step", progress.step),
            ));
        }
        if progress.outputs.len() != progress.next_iteration as usize {
            return Err(CheckpointError::corrupt(
                run_id,
                format!(
                    "loop '{}' records {} outputs for {} iterations",
                    progress.step,
                    progress.outputs.len(),
                    progress.next_iteration
                ),
            ));
        }
    }

    Ok(path.len())
}
