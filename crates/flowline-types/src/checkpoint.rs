//! Durable checkpoint snapshot format.
//!
//! A checkpoint is self-describing: it carries its format version, the
//! workflow it belongs to, the ordered list of top-level steps already
//! applied (each with a digest of the step record it came from), and a
//! snapshot of the run context taken at exactly that point.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Current snapshot format version.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// A resumable snapshot of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub run_id: Uuid,
    pub workflow_name: String,
    /// Top-level steps applied so far, in document order.
    pub completed_step_path: Vec<StepMarker>,
    /// Partial progress through the top-level loop that follows the last
    /// completed step, if one was interrupted mid-iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_progress: Option<LoopProgress>,
    pub context: ContextSnapshot,
    pub created_at: DateTime<Utc>,
}

/// Identifies one applied step and the exact record it was run from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMarker {
    pub name: String,
    /// Hex SHA-256 of the step record's JSON form.
    pub digest: String,
}

/// Iterations already finished for a top-level sequential loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopProgress {
    pub step: String,
    pub next_iteration: u32,
    /// Per-iteration outputs, index order.
    pub outputs: Vec<Value>,
}

/// Serializable copy of the top-level run context.
///
/// `BTreeMap` keeps key order deterministic so identical contexts always
/// serialize to identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub inputs: BTreeMap<String, Value>,
    pub step_outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Checkpoint {
    /// Names of the completed top-level steps.
    pub fn completed_names(&self) -> impl Iterator<Item = &str> {
        self.completed_step_path.iter().map(|m| m.name.as_str())
    }
}
