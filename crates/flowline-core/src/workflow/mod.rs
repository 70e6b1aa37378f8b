//! Workflow engine core: schema loading, step execution, and durable runs.
//!
//! - `definition` -- YAML parsing, all-errors validation, input checking
//! - `context` -- layered run context with loop frames
//! - `capability` -- callable/agent ports and the handler map
//! - `retry` -- bounded exponential backoff policy
//! - `step_runner` -- per-attempt dispatch with retry, timeout, cancellation
//! - `flow` -- branch, loop, checkpoint and subworkflow handlers
//! - `checkpoint` -- snapshot format and resume verification
//! - `executor` -- run coordinator

pub mod capability;
pub mod checkpoint;
pub mod context;
pub mod definition;
pub mod executor;
pub mod flow;
pub mod retry;
pub mod step_runner;

pub use capability::{BoxCapability, Capability, CapabilityError, HandlerMap, from_fn};
pub use checkpoint::{CheckpointError, CheckpointManager};
pub use context::RunContext;
pub use definition::{
    LoadedWorkflow, ValidationErrors, ValidationIssue, WorkflowError, load_workflow_file,
    parse_workflow_yaml, serialize_workflow_yaml, validate_inputs,
};
pub use executor::{ExecutorError, RunCoordinator, RunHandle, RunResult, WorkflowExecutor};
pub use step_runner::{StepError, StepRunner};
