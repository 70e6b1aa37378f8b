//! Run-level result and error records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Final or current status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a single step.
///
/// `Pending -> Running -> {Succeeded, Failed, Skipped}`. `Skipped` is only
/// reached by steps in an unchosen branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Category of a failure, carried through to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed expression syntax.
    Grammar,
    /// Schema or reference defect in the document.
    Validation,
    /// Missing or malformed run input.
    Input,
    /// A referenced path does not exist in the context.
    UnresolvedPath,
    /// A value had the wrong type for the operation.
    TypeMismatch,
    /// A step handler or capability reported failure.
    StepExecution,
    /// An attempt exceeded its timeout.
    Timeout,
    /// Checkpoint storage could not be written or read.
    CheckpointIo,
    /// A stored checkpoint does not match the current document.
    CheckpointCorrupt,
    /// The run was cancelled.
    Cancelled,
}

impl ErrorKind {
    /// Whether a step retry policy may re-attempt after this kind of failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::UnresolvedPath
                | ErrorKind::TypeMismatch
                | ErrorKind::StepExecution
                | ErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Grammar => "grammar",
            ErrorKind::Validation => "validation",
            ErrorKind::Input => "input",
            ErrorKind::UnresolvedPath => "unresolved_path",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::StepExecution => "step_execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CheckpointIo => "checkpoint_io",
            ErrorKind::CheckpointCorrupt => "checkpoint_corrupt",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A user-facing failure: the innermost error kind and message, plus the
/// path of the step that failed (`outer/inner[2]/leaf`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step: None,
        }
    }

    /// Attach the failing step path if none is recorded yet.
    pub fn at_step(mut self, step: impl Into<String>) -> Self {
        if self.step.is_none() {
            self.step = Some(step.into());
        }
        self
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step {
            Some(step) => write!(f, "step '{step}' failed ({}): {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Outcome of one step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default)]
    pub output: Value,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}
