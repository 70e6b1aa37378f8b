//! Workflow document types.
//!
//! A `WorkflowDocument` is the typed form of a YAML workflow file: metadata,
//! declared inputs, an ordered list of step records, and declared outputs.
//! Expressions are kept as raw strings here; compilation happens in
//! `flowline-core` when the document is loaded.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Document
// ---------------------------------------------------------------------------

/// A parsed workflow document.
///
/// Immutable once loaded. One document drives one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    /// Document format version (`major.minor`).
    pub version: String,
    /// Workflow name, lowercase with hyphens.
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Declared inputs keyed by input name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputDeclaration>,
    /// Ordered top-level steps.
    pub steps: Vec<StepRecord>,
    /// Output templates evaluated against the final run context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

/// Declaration of a single workflow input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDeclaration {
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Value type an input accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl InputType {
    /// Whether `value` is acceptable for this type.
    ///
    /// `number` accepts integers; `any` accepts everything including null.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Integer => value.is_i64() || value.is_u64(),
            InputType::Number => value.is_number(),
            InputType::Boolean => value.is_boolean(),
            InputType::Array => value.is_array(),
            InputType::Object => value.is_object(),
            InputType::Any => true,
        }
    }
}

impl std::fmt::Display for InputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InputType::String => "string",
            InputType::Integer => "integer",
            InputType::Number => "number",
            InputType::Boolean => "boolean",
            InputType::Array => "array",
            InputType::Object => "object",
            InputType::Any => "any",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Step Record
// ---------------------------------------------------------------------------

/// A single named step.
///
/// The kind discriminator and kind-specific fields sit at the same level as
/// the common fields:
/// ```yaml
/// - name: greet
///   kind: callable
///   callable: concat
///   args: { parts: ["Hello, ", "${{ inputs.name }}"] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Unique among siblings, non-empty.
    pub name: String,
    /// Per-attempt timeout in seconds (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// Kind-specific step payload, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a registered callable with templated arguments.
    #[serde(alias = "python")]
    Callable {
        callable: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        args: Value,
    },
    /// Hand a templated task to a named agent.
    Agent {
        agent: String,
        task: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        args: Value,
    },
    /// Declarative assertions over the run context.
    Validation { checks: Vec<ValidationCheck> },
    /// Conditional selection of one of two step lists.
    Branch {
        when: String,
        #[serde(default)]
        then: Vec<StepRecord>,
        #[serde(
            default,
            rename = "else",
            skip_serializing_if = "Option::is_none"
        )]
        otherwise: Option<Vec<StepRecord>>,
    },
    /// Bounded iteration over a sequence or a count.
    Loop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        over: Option<String>,
        max_iterations: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        break_when: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        parallel: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<u32>,
        steps: Vec<StepRecord>,
    },
    /// Explicit durability barrier.
    Checkpoint,
    /// Nested workflow run with an isolated context.
    Subworkflow {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workflow: Option<Box<WorkflowDocument>>,
        /// Path relative to the parent document; inlined into `workflow` by the file loader.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        inputs: BTreeMap<String, Value>,
    },
}

impl StepKind {
    /// Short tag used in logs and events.
    pub fn tag(&self) -> &'static str {
        match self {
            StepKind::Callable { .. } => "callable",
            StepKind::Agent { .. } => "agent",
            StepKind::Validation { .. } => "validation",
            StepKind::Branch { .. } => "branch",
            StepKind::Loop { .. } => "loop",
            StepKind::Checkpoint => "checkpoint",
            StepKind::Subworkflow { .. } => "subworkflow",
        }
    }
}

/// One assertion inside a validation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub name: String,
    /// Condition expression; the check passes when it is truthy.
    pub that: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Per-step retry policy: bounded attempts with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
