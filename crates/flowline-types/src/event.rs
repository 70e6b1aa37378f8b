//! Run lifecycle events published by the coordinator.
//!
//! Events are emitted in order on a broadcast bus. Consumers see each event
//! at most once; there is no replay beyond what checkpoints provide.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::run::ErrorRecord;

/// A single lifecycle event.
///
/// Internally tagged for JSON output:
/// ```json
/// { "type": "step_completed", "run_id": "...", "name": "greet", "path": "greet", "duration_ms": 12 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
        resumed: bool,
    },
    StepStarted {
        run_id: Uuid,
        name: String,
        /// Slash-separated path including loop indices, e.g. `each[2]/fetch`.
        path: String,
        attempt: u32,
    },
    StepCompleted {
        run_id: Uuid,
        name: String,
        path: String,
        duration_ms: u64,
    },
    StepFailed {
        run_id: Uuid,
        name: String,
        path: String,
        error: ErrorRecord,
        will_retry: bool,
    },
    StepSkipped {
        run_id: Uuid,
        name: String,
        path: String,
    },
    CheckpointWritten {
        run_id: Uuid,
        completed_steps: usize,
    },
    RunCompleted {
        run_id: Uuid,
        outputs: Value,
        duration_ms: u64,
    },
    RunFailed {
        run_id: Uuid,
        error: ErrorRecord,
    },
    RunCancelled {
        run_id: Uuid,
    },
}

impl RunEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepCompleted { run_id, .. }
            | RunEvent::StepFailed { run_id, .. }
            | RunEvent::StepSkipped { run_id, .. }
            | RunEvent::CheckpointWritten { run_id, .. }
            | RunEvent::RunCompleted { run_id, .. }
            | RunEvent::RunFailed { run_id, .. }
            | RunEvent::RunCancelled { run_id } => *run_id,
        }
    }

    /// Whether this event ends the run's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::RunCompleted { .. } | RunEvent::RunFailed { .. } | RunEvent::RunCancelled { .. }
        )
    }
}
