//! Workflow document loading and validation.
//!
//! Loading runs in three passes:
//! 1. structural decoding of the YAML into `WorkflowDocument` (serde),
//!    plus a scan of the raw mapping for keys no field accepts,
//! 2. per-step invariant checks (names, discriminator-specific fields),
//! 3. cross-reference checks for every expression in the document.
//!
//! Unknown keys and passes 2 and 3 collect every defect before failing, so a single load
//! reports the complete list. Every template and condition string is
//! compiled exactly once here and cached for the run.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flowline_types::workflow::{InputDeclaration, StepKind, StepRecord, WorkflowDocument};
use serde_json::Value;
use thiserror::Error;

use crate::expression::{Accessor, Node, ReferenceKind, TemplateCache};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur while loading a workflow document.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML decoding or structural shape failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// One or more schema or reference defects.
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A file subworkflow (transitively) includes itself.
    #[error("subworkflow cycle: {0}")]
    SubworkflowCycle(String),
}

/// One defect, tagged with the document path where it was found
/// (e.g. `steps.each.steps.fetch.args`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Every defect found in a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ValidationErrors {
    pub issues: Vec<ValidationIssue>,
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "workflow has {} validation error(s)", self.issues.len())?;
        for issue in &self.issues {
            write!(f, "\n  - {issue}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LoadedWorkflow
// ---------------------------------------------------------------------------

/// A validated document together with its compiled templates.
#[derive(Debug, Clone)]
pub struct LoadedWorkflow {
    pub document: Arc<WorkflowDocument>,
    pub templates: Arc<TemplateCache>,
}

impl LoadedWorkflow {
    pub fn name(&self) -> &str {
        &self.document.name
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Load and validate a document from raw bytes.
///
/// `file:` subworkflows cannot be resolved without a base directory; use
/// [`load_workflow_file`] for documents that contain them.
pub fn load(bytes: &[u8]) -> Result<LoadedWorkflow, WorkflowError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| WorkflowError::ParseError(format!("document is not UTF-8: {e}")))?;
    parse_workflow_yaml(text)
}

/// Parse a YAML string into a validated workflow.
pub fn parse_workflow_yaml(yaml: &str) -> Result<LoadedWorkflow, WorkflowError> {
    let mut issues = Vec::new();
    let document = decode(yaml, "", &mut issues)?;
    finish(document, issues)
}

/// Serialize a document back to YAML.
pub fn serialize_workflow_yaml(doc: &WorkflowDocument) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(doc).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Decode a document rooted at `prefix`. Keys serde would silently drop
/// are recorded in `issues`.
fn decode(
    yaml: &str,
    prefix: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Result<WorkflowDocument, WorkflowError> {
    let document = serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    let raw: serde_yaml_ng::Value =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    document_keys(&raw, prefix, issues);
    Ok(document)
}

/// Validate a decoded document; `issues` from decoding are reported with
/// the validator's own.
fn finish(document: WorkflowDocument, mut issues: Vec<ValidationIssue>) -> Result<LoadedWorkflow, WorkflowError> {
    let templates = match validate_document(&document) {
        Ok(templates) if issues.is_empty() => templates,
        Ok(_) => return Err(ValidationErrors { issues }.into()),
        Err(mut errors) => {
            issues.append(&mut errors.issues);
            return Err(ValidationErrors { issues }.into());
        }
    };
    Ok(LoadedWorkflow {
        document: Arc::new(document),
        templates: Arc::new(templates),
    })
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Load a workflow file, inlining `file:` subworkflows relative to the file
/// that references them, then validate the result.
pub fn load_workflow_file(path: &Path) -> Result<LoadedWorkflow, WorkflowError> {
    let mut issues = Vec::new();
    let mut document = decode(&std::fs::read_to_string(path)?, "", &mut issues)?;
    let base = path.parent().unwrap_or(Path::new("."));
    let mut includes = Includes {
        stack: vec![path.canonicalize()?],
        issues,
    };
    includes.resolve(&mut document.steps, "steps", base)?;
    finish(document, includes.issues)
}

/// State for inlining `file:` subworkflows: the chain of files being
/// loaded (for cycle detection) and the key issues of each decoded file.
struct Includes {
    stack: Vec<PathBuf>,
    issues: Vec<ValidationIssue>,
}

impl Includes {
    fn resolve(&mut self, steps: &mut [StepRecord], path: &str, base: &Path) -> Result<(), WorkflowError> {
        for (i, step) in steps.iter_mut().enumerate() {
            let step_path = step_path(path, i, &step.name);
            match &mut step.kind {
                StepKind::Branch { then, otherwise, .. } => {
                    self.resolve(then, &join(&step_path, "then"), base)?;
                    if let Some(otherwise) = otherwise {
                        self.resolve(otherwise, &join(&step_path, "else"), base)?;
                    }
                }
                StepKind::Loop { steps, .. } => self.resolve(steps, &join(&step_path, "steps"), base)?,
                StepKind::Subworkflow { workflow, file, .. } => {
                    let nested_path = join(&step_path, "workflow");
                    match (workflow.as_mut(), file.as_deref()) {
                        (Some(inline), _) => self.resolve(&mut inline.steps, &join(&nested_path, "steps"), base)?,
                        (None, Some(file)) => {
                            let target = base.join(file);
                            let canonical = target.canonicalize()?;
                            if self.stack.contains(&canonical) {
                                return Err(WorkflowError::SubworkflowCycle(format!(
                                    "'{}' includes itself",
                                    target.display()
                                )));
                            }
                            let text = std::fs::read_to_string(&target)?;
                            let mut nested = decode(&text, &nested_path, &mut self.issues)?;
                            let nested_base = target.parent().unwrap_or(Path::new(".")).to_path_buf();
                            self.stack.push(canonical);
                            self.resolve(&mut nested.steps, &join(&nested_path, "steps"), &nested_base)?;
                            self.stack.pop();
                            tracing::debug!(file = %target.display(), "inlined subworkflow file");
                            *workflow = Some(Box::new(nested));
                        }
                        (None, None) => {}
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unknown keys
// ---------------------------------------------------------------------------

const DOCUMENT_KEYS: &[&str] = &["version", "name", "description", "inputs", "steps", "outputs"];
const INPUT_KEYS: &[&str] = &["type", "required", "default", "description"];
const STEP_KEYS: &[&str] = &["name", "kind", "timeout_secs", "retry"];
const RETRY_KEYS: &[&str] = &["max_attempts", "initial_backoff_ms", "backoff_multiplier", "max_backoff_ms"];
const CHECK_KEYS: &[&str] = &["name", "that", "message"];

/// Keys a step of the given kind carries besides [`STEP_KEYS`].
fn kind_keys(kind: &str) -> Option<&'static [&'static str]> {
    Some(match kind {
        "callable" | "python" => &["callable", "args"],
        "agent" => &["agent", "task", "args"],
        "validation" => &["checks"],
        "branch" => &["when", "then", "else"],
        "loop" => &["over", "max_iterations", "break_when", "parallel", "max_concurrency", "steps"],
        "checkpoint" => &[],
        "subworkflow" => &["workflow", "file", "inputs"],
        _ => return None,
    })
}

fn unknown_key(key: &serde_yaml_ng::Value, path: &str, issues: &mut Vec<ValidationIssue>) {
    let message = match key.as_str() {
        Some(key) => format!("unknown key '{key}'"),
        None => "keys must be strings".to_string(),
    };
    issues.push(ValidationIssue {
        path: path.to_string(),
        message,
    });
}

fn mapping_keys(map: &serde_yaml_ng::Mapping, allowed: &[&str], path: &str, issues: &mut Vec<ValidationIssue>) {
    for key in map.keys() {
        if !key.as_str().is_some_and(|k| allowed.contains(&k)) {
            unknown_key(key, path, issues);
        }
    }
}

fn document_keys(raw: &serde_yaml_ng::Value, prefix: &str, issues: &mut Vec<ValidationIssue>) {
    let Some(map) = raw.as_mapping() else {
        return;
    };
    mapping_keys(map, DOCUMENT_KEYS, if prefix.is_empty() { "document" } else { prefix }, issues);

    if let Some(inputs) = map.get("inputs").and_then(serde_yaml_ng::Value::as_mapping) {
        for (name, decl) in inputs {
            if let (Some(name), Some(decl)) = (name.as_str(), decl.as_mapping()) {
                mapping_keys(decl, INPUT_KEYS, &join(prefix, &format!("inputs.{name}")), issues);
            }
        }
    }
    if let Some(steps) = map.get("steps") {
        step_list_keys(steps, &join(prefix, "steps"), issues);
    }
}

fn step_list_keys(raw: &serde_yaml_ng::Value, path: &str, issues: &mut Vec<ValidationIssue>) {
    let Some(list) = raw.as_sequence() else {
        return;
    };
    for (i, step) in list.iter().enumerate() {
        let Some(map) = step.as_mapping() else {
            continue;
        };
        let name = map.get("name").and_then(serde_yaml_ng::Value::as_str).unwrap_or("");
        let kind = map.get("kind").and_then(serde_yaml_ng::Value::as_str).unwrap_or("");
        let Some(allowed) = kind_keys(kind) else {
            continue;
        };
        let path = step_path(path, i, name);

        for key in map.keys() {
            let known = key
                .as_str()
                .is_some_and(|k| STEP_KEYS.contains(&k) || allowed.contains(&k));
            if !known {
                unknown_key(key, &path, issues);
            }
        }
        if let Some(retry) = map.get("retry").and_then(serde_yaml_ng::Value::as_mapping) {
            mapping_keys(retry, RETRY_KEYS, &join(&path, "retry"), issues);
        }

        match kind {
            "branch" => {
                for field in ["then", "else"] {
                    if let Some(body) = map.get(field) {
                        step_list_keys(body, &join(&path, field), issues);
                    }
                }
            }
            "loop" => {
                if let Some(body) = map.get("steps") {
                    step_list_keys(body, &join(&path, "steps"), issues);
                }
            }
            "validation" => {
                let checks = map.get("checks").and_then(serde_yaml_ng::Value::as_sequence);
                for (j, check) in checks.into_iter().flatten().enumerate() {
                    if let Some(check) = check.as_mapping() {
                        mapping_keys(check, CHECK_KEYS, &format!("{path}.checks[{j}]"), issues);
                    }
                }
            }
            "subworkflow" => {
                if let Some(nested) = map.get("workflow") {
                    document_keys(nested, &join(&path, "workflow"), issues);
                }
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Run inputs
// ---------------------------------------------------------------------------

/// Check supplied run inputs against the document's declarations.
///
/// Missing required inputs and type mismatches are reported together.
/// Declared defaults fill absent optional inputs; undeclared extras are
/// kept as supplied.
pub fn validate_inputs(
    doc: &WorkflowDocument,
    mut supplied: BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, ValidationErrors> {
    let mut issues = Vec::new();

    for (name, decl) in &doc.inputs {
        match supplied.get(name) {
            Some(value) if !decl.input_type.accepts(value) => issues.push(ValidationIssue {
                path: format!("inputs.{name}"),
                message: format!(
                    "expected {}, got {}",
                    decl.input_type,
                    crate::expression::eval::type_name(value)
                ),
            }),
            Some(_) => {}
            None => match &decl.default {
                Some(default) => {
                    supplied.insert(name.clone(), default.clone());
                }
                None if decl.required => issues.push(ValidationIssue {
                    path: format!("inputs.{name}"),
                    message: "required input was not provided".to_string(),
                }),
                None => {}
            },
        }
    }

    if issues.is_empty() {
        Ok(supplied)
    } else {
        Err(ValidationErrors { issues })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a document and compile all of its templates and conditions.
pub fn validate_document(doc: &WorkflowDocument) -> Result<TemplateCache, ValidationErrors> {
    let cache = TemplateCache::new();
    let mut validator = Validator {
        cache: &cache,
        issues: Vec::new(),
    };
    validator.document(doc, "");

    if validator.issues.is_empty() {
        Ok(cache)
    } else {
        Err(ValidationErrors {
            issues: validator.issues,
        })
    }
}

/// `^[a-z][a-z0-9-]*$`
pub fn is_valid_workflow_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// `^\d+\.\d+$`
pub fn is_valid_version(version: &str) -> bool {
    match version.split_once('.') {
        Some((major, minor)) => {
            !major.is_empty()
                && !minor.is_empty()
                && major.chars().all(|c| c.is_ascii_digit())
                && minor.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// `/` and brackets are reserved for step paths like `each[2]/fetch`.
fn is_valid_step_name(name: &str) -> bool {
    !name.contains(['/', '[', ']'])
}

/// What expressions at a given point in the document may reference.
#[derive(Clone)]
struct Visibility<'d> {
    inputs: &'d BTreeMap<String, InputDeclaration>,
    /// Steps whose outputs exist before this point: preceding siblings plus
    /// the preceding siblings of every enclosing step.
    steps: Vec<String>,
    in_loop: bool,
}

struct Validator<'c> {
    cache: &'c TemplateCache,
    issues: Vec<ValidationIssue>,
}

fn join(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

/// `steps.fetch`, or `steps[3]` for a step without a name.
fn step_path(list: &str, i: usize, name: &str) -> String {
    if name.is_empty() {
        format!("{list}[{i}]")
    } else {
        format!("{list}.{name}")
    }
}

impl Validator<'_> {
    fn issue(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            path: path.into(),
            message: message.into(),
        });
    }

    fn document(&mut self, doc: &WorkflowDocument, prefix: &str) {
        if !is_valid_workflow_name(&doc.name) {
            self.issue(
                join(prefix, "name"),
                format!("workflow name '{}' must match ^[a-z][a-z0-9-]*$", doc.name),
            );
        }
        if !is_valid_version(&doc.version) {
            self.issue(
                join(prefix, "version"),
                format!("version '{}' must match ^\\d+\\.\\d+$", doc.version),
            );
        }

        for (name, decl) in &doc.inputs {
            let path = join(prefix, &format!("inputs.{name}"));
            if name.is_empty() {
                self.issue(path.clone(), "input name must not be empty");
            }
            match &decl.default {
                Some(_) if decl.required => {
                    self.issue(path, "a required input may not declare a default");
                }
                Some(default) if !decl.input_type.accepts(default) => {
                    self.issue(
                        path,
                        format!("default value does not match declared type '{}'", decl.input_type),
                    );
                }
                _ => {}
            }
        }

        let steps_path = join(prefix, "steps");
        if doc.steps.is_empty() {
            self.issue(steps_path.clone(), "workflow must have at least one step");
        }
        let top = Visibility {
            inputs: &doc.inputs,
            steps: Vec::new(),
            in_loop: false,
        };
        self.steps(&doc.steps, &steps_path, &top);

        let after_all = Visibility {
            inputs: &doc.inputs,
            steps: doc.steps.iter().map(|s| s.name.clone()).collect(),
            in_loop: false,
        };
        for (name, template) in &doc.outputs {
            let path = join(prefix, &format!("outputs.{name}"));
            self.template(template, &path, &after_all);
        }
    }

    fn steps(&mut self, steps: &[StepRecord], path: &str, outer: &Visibility<'_>) {
        let mut seen = HashSet::new();
        let mut here = outer.clone();

        for (i, step) in steps.iter().enumerate() {
            let step_path = step_path(path, i, &step.name);

            if step.name.is_empty() {
                self.issue(step_path.clone(), "step name must not be empty");
            } else if !is_valid_step_name(&step.name) {
                self.issue(
                    step_path.clone(),
                    format!(
                        "step name '{}' may not contain '/', '[' or ']'",
                        step.name
                    ),
                );
            }
            if !step.name.is_empty() && !seen.insert(step.name.as_str()) {
                self.issue(
                    step_path.clone(),
                    format!("duplicate step name '{}' among siblings", step.name),
                );
            }

            self.step(step, &step_path, &here);
            here.steps.push(step.name.clone());
        }
    }

    fn step(&mut self, step: &StepRecord, path: &str, vis: &Visibility<'_>) {
        if step.timeout_secs == Some(0) {
            self.issue(join(path, "timeout_secs"), "timeout must be > 0");
        }
        if let Some(retry) = &step.retry {
            if retry.max_attempts == 0 {
                self.issue(join(path, "retry.max_attempts"), "max_attempts must be >= 1");
            }
            if !(retry.backoff_multiplier >= 1.0) {
                self.issue(
                    join(path, "retry.backoff_multiplier"),
                    "backoff_multiplier must be >= 1.0",
                );
            }
        }

        match &step.kind {
            StepKind::Callable { callable, args } => {
                if callable.trim().is_empty() {
                    self.issue(join(path, "callable"), "callable name must not be empty");
                }
                self.args(args, &join(path, "args"), vis);
            }
            StepKind::Agent { agent, task, args } => {
                if agent.trim().is_empty() {
                    self.issue(join(path, "agent"), "agent name must not be empty");
                }
                self.template(task, &join(path, "task"), vis);
                self.args(args, &join(path, "args"), vis);
            }
            StepKind::Validation { checks } => {
                if checks.is_empty() {
                    self.issue(join(path, "checks"), "validation step must declare at least one check");
                }
                let mut names = HashSet::new();
                for (i, check) in checks.iter().enumerate() {
                    let check_path = format!("{path}.checks[{i}]");
                    if check.name.trim().is_empty() {
                        self.issue(check_path.clone(), "check name must not be empty");
                    } else if !names.insert(check.name.as_str()) {
                        self.issue(check_path.clone(), format!("duplicate check name '{}'", check.name));
                    }
                    self.condition(&check.that, &join(&check_path, "that"), vis);
                }
            }
            StepKind::Branch { when, then, otherwise } => {
                self.condition(when, &join(path, "when"), vis);
                self.steps(then, &join(path, "then"), vis);
                if let Some(otherwise) = otherwise {
                    self.steps(otherwise, &join(path, "else"), vis);
                }
            }
            StepKind::Loop {
                over,
                max_iterations,
                break_when,
                max_concurrency,
                steps,
                ..
            } => {
                if *max_iterations == 0 {
                    self.issue(join(path, "max_iterations"), "max_iterations must be >= 1");
                }
                if *max_concurrency == Some(0) {
                    self.issue(join(path, "max_concurrency"), "max_concurrency must be >= 1");
                }
                if let Some(over) = over {
                    self.condition(over, &join(path, "over"), vis);
                }
                if steps.is_empty() {
                    self.issue(join(path, "steps"), "loop body must have at least one step");
                }
                let body = Visibility {
                    in_loop: true,
                    ..vis.clone()
                };
                self.steps(steps, &join(path, "steps"), &body);

                if let Some(break_when) = break_when {
                    // Evaluated after this loop's frame is popped, with the body
                    // outputs visible; an enclosing loop's frame is still there.
                    let mut after = vis.clone();
                    after.steps.extend(steps.iter().map(|s| s.name.clone()));
                    self.condition(break_when, &join(path, "break_when"), &after);
                }
            }
            StepKind::Checkpoint => {}
            StepKind::Subworkflow { workflow, file, inputs } => {
                for (name, value) in inputs {
                    self.args(value, &format!("{path}.inputs.{name}"), vis);
                }
                match workflow {
                    Some(nested) => {
                        for (name, decl) in &nested.inputs {
                            if decl.required && !inputs.contains_key(name) {
                                self.issue(
                                    join(path, "inputs"),
                                    format!("missing required subworkflow input '{name}'"),
                                );
                            }
                        }
                        self.document(nested, &join(path, "workflow"));
                    }
                    None if file.is_some() => self.issue(
                        join(path, "file"),
                        "file subworkflows must be loaded from a workflow file",
                    ),
                    None => self.issue(
                        path.to_string(),
                        "subworkflow must declare either 'workflow' or 'file'",
                    ),
                }
            }
        }
    }

    fn template(&mut self, raw: &str, path: &str, vis: &Visibility<'_>) {
        match self.cache.get_or_compile(raw) {
            Ok(template) => {
                for node in template.expressions() {
                    self.references(node, path, vis);
                }
            }
            Err(e) => self.issue(path.to_string(), e.to_string()),
        }
    }

    fn condition(&mut self, raw: &str, path: &str, vis: &Visibility<'_>) {
        match self.cache.condition(raw) {
            Ok(node) => self.references(&node, path, vis),
            Err(e) => self.issue(path.to_string(), e.to_string()),
        }
    }

    fn args(&mut self, value: &Value, path: &str, vis: &Visibility<'_>) {
        match value {
            Value::String(s) => self.template(s, path, vis),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.args(item, &format!("{path}[{i}]"), vis);
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    self.args(item, &join(path, key), vis);
                }
            }
            _ => {}
        }
    }

    fn references(&mut self, node: &Node, path: &str, vis: &Visibility<'_>) {
        for expr in node.references() {
            match &expr.kind {
                ReferenceKind::Input => {
                    let name = match expr.path.first() {
                        Some(Accessor::Field(name) | Accessor::Key(name)) => name,
                        _ => continue,
                    };
                    if !vis.inputs.contains_key(name) {
                        self.issue(path.to_string(), format!("references undeclared input '{name}'"));
                    }
                }
                ReferenceKind::Step { id } => {
                    if !vis.steps.iter().any(|s| s == id) {
                        self.issue(
                            path.to_string(),
                            format!("references step '{id}' which has not run at this point"),
                        );
                    }
                }
                ReferenceKind::Item | ReferenceKind::Index => {
                    if !vis.in_loop {
                        self.issue(
                            path.to_string(),
                            format!("'{}' is only available inside a loop body", expr.raw),
                        );
                    }
                }
                ReferenceKind::Literal(_) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn issues(yaml: &str) -> Vec<ValidationIssue> {
        match parse_workflow_yaml(yaml) {
            Err(WorkflowError::Validation(errors)) => errors.issues,
            Err(other) => panic!("expected validation errors, got {other}"),
            Ok(_) => panic!("expected validation errors, document loaded"),
        }
    }

    fn has_issue(issues: &[ValidationIssue], path: &str, fragment: &str) -> bool {
        issues
            .iter()
            .any(|i| i.path == path && i.message.contains(fragment))
    }

    const VALID: &str = r#"
version: "1.0"
name: greet
inputs:
  name: { type: string, required: true }
  items: { type: array, default: [1, 2, 3] }
steps:
  - name: greet
    kind: callable
    callable: concat
    args: { parts: ["Hello, ", "${{ inputs.name }}"] }
  - name: each
    kind: loop
    over: "${{ inputs.items }}"
    max_iterations: 5
    break_when: "${{ steps.body.output }}"
    steps:
      - name: body
        kind: callable
        callable: echo
        args: { value: "${{ item }}", at: "${{ index }}", prior: "${{ steps.greet.output }}" }
outputs:
  greeting: "${{ steps.greet.output }}"
"#;

    #[test]
    fn test_valid_document_loads_and_caches_templates() {
        let loaded = parse_workflow_yaml(VALID).unwrap();
        assert_eq!(loaded.name(), "greet");
        // args templates + output template (the output template repeats "prior")
        assert!(loaded.templates.len() >= 5);
        assert!(loaded.templates.condition("${{ inputs.items }}").is_ok());
    }

    #[test]
    fn test_serialize_load_roundtrip() {
        let loaded = parse_workflow_yaml(VALID).unwrap();
        let yaml = serialize_workflow_yaml(&loaded.document).unwrap();
        let again = parse_workflow_yaml(&yaml).unwrap();
        assert_eq!(*loaded.document, *again.document);
    }

    #[test]
    fn test_collects_all_errors() {
        let yaml = r#"
version: "1"
name: Bad_Name
inputs:
  token: { type: string, required: true, default: "x" }
  retries: { type: integer, default: "three" }
steps:
  - name: first
    kind: callable
    callable: echo
    args: { v: "${{ inputs.missing }}" }
  - name: first
    kind: agent
    agent: reviewer
    task: "${{ steps.later.output }}"
  - name: bad-expr
    kind: callable
    callable: echo
    args: { v: "${{ env.HOME }}" }
  - name: later
    kind: loop
    max_iterations: 0
    steps: []
outputs:
  x: "${{ item }}"
"#;
        let issues = issues(yaml);
        assert!(has_issue(&issues, "name", "must match"));
        assert!(has_issue(&issues, "version", "must match"));
        assert!(has_issue(&issues, "inputs.token", "may not declare a default"));
        assert!(has_issue(&issues, "inputs.retries", "does not match declared type"));
        assert!(has_issue(&issues, "steps.first.args.v", "undeclared input 'missing'"));
        assert!(has_issue(&issues, "steps.first", "duplicate step name"));
        assert!(has_issue(&issues, "steps.first.task", "step 'later'"));
        assert!(has_issue(&issues, "steps.bad-expr.args.v", "unknown reference root"));
        assert!(has_issue(&issues, "steps.later.max_iterations", ">= 1"));
        assert!(has_issue(&issues, "steps.later.steps", "at least one step"));
        assert!(has_issue(&issues, "outputs.x", "only available inside a loop"));
        assert_eq!(issues.len(), 11);
    }

    #[test]
    fn test_sibling_names_may_repeat_in_nested_lists() {
        let yaml = r#"
version: "1.0"
name: nested
steps:
  - name: work
    kind: callable
    callable: echo
  - name: maybe
    kind: branch
    when: "true"
    then:
      - name: work
        kind: callable
        callable: echo
        args: { prior: "${{ steps.work.output }}" }
    else:
      - name: work
        kind: checkpoint
"#;
        assert!(parse_workflow_yaml(yaml).is_ok());
    }

    #[test]
    fn test_branch_body_cannot_see_enclosing_later_steps() {
        let yaml = r#"
version: "1.0"
name: scope
steps:
  - name: maybe
    kind: branch
    when: "${{ steps.after.output }}"
    then:
      - name: inner
        kind: callable
        callable: echo
  - name: after
    kind: callable
    callable: echo
    args: { v: "${{ steps.inner.output }}" }
"#;
        let issues = issues(yaml);
        assert!(has_issue(&issues, "steps.maybe.when", "step 'after'"));
        assert!(has_issue(&issues, "steps.after.args.v", "step 'inner'"));
    }

    #[test]
    fn test_break_when_cannot_use_item() {
        let yaml = r#"
version: "1.0"
name: loops
steps:
  - name: each
    kind: loop
    max_iterations: 3
    break_when: "item.done"
    steps:
      - name: body
        kind: callable
        callable: echo
"#;
        let issues = issues(yaml);
        assert!(has_issue(&issues, "steps.each.break_when", "only available inside a loop"));
    }

    #[test]
    fn test_inner_break_when_sees_outer_item() {
        let yaml = r#"
version: "1.0"
name: nested
inputs:
  rows: { type: array, required: true }
steps:
  - name: outer
    kind: loop
    over: "${{ inputs.rows }}"
    max_iterations: 10
    steps:
      - name: inner
        kind: loop
        max_iterations: 3
        break_when: "${{ item.stop }}"
        steps:
          - { name: body, kind: callable, callable: echo, args: "${{ index }}" }
"#;
        assert!(parse_workflow_yaml(yaml).is_ok());
    }

    #[test]
    fn test_quoted_step_reference_loads() {
        let yaml = r#"
version: "1.0"
name: spaced
steps:
  - { name: fetch data, kind: callable, callable: echo, args: [1, 2] }
  - name: count
    kind: callable
    callable: length
    args: "${{ steps['fetch data'].output }}"
"#;
        let loaded = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(loaded.document.steps[0].name, "fetch data");
    }

    #[test]
    fn test_step_names_reserve_path_characters() {
        let yaml = r#"
version: "1.0"
name: reserved
steps:
  - { name: "a/b", kind: callable, callable: echo }
  - { name: "c[0]", kind: callable, callable: echo }
"#;
        let issues = issues(yaml);
        assert!(has_issue(&issues, "steps.a/b", "may not contain"));
        assert!(has_issue(&issues, "steps.c[0]", "may not contain"));
    }

    #[test]
    fn test_misspelled_keys_are_reported() {
        let yaml = r#"
version: "1.0"
name: typos
descripton: top-level typo
inputs:
  rows: { type: array, requird: true }
steps:
  - name: each
    kind: loop
    over: "${{ inputs.rows }}"
    max_iterations: 3
    break_wen: "${{ steps.body.output }}"
    retry: { max_attempt: 2 }
    steps:
      - { name: body, kind: callable, callable: echo, arg: 1 }
  - name: check
    kind: validation
    checks:
      - { name: ok, that: "${{ steps.each.output }}", mesage: "empty" }
  - name: nested
    kind: subworkflow
    workflow:
      version: "1.0"
      name: inner
      steps:
        - { name: only, kind: callable, callable: echo, timeout: 5 }
"#;
        let issues = issues(yaml);
        assert!(has_issue(&issues, "document", "unknown key 'descripton'"));
        assert!(has_issue(&issues, "inputs.rows", "unknown key 'requird'"));
        assert!(has_issue(&issues, "steps.each", "unknown key 'break_wen'"));
        assert!(has_issue(&issues, "steps.each.retry", "unknown key 'max_attempt'"));
        assert!(has_issue(&issues, "steps.each.steps.body", "unknown key 'arg'"));
        assert!(has_issue(&issues, "steps.check.checks[0]", "unknown key 'mesage'"));
        assert!(has_issue(&issues, "steps.nested.workflow.steps.only", "unknown key 'timeout'"));
        assert_eq!(issues.len(), 7);
    }

    #[test]
    fn test_key_of_another_kind_is_unknown() {
        let yaml = r#"
version: "1.0"
name: mixed
steps:
  - { name: pick, kind: branch, when: "true", then: [], steps: [] }
  - { name: "", kind: callable, callable: echo, parallel: true }
"#;
        let issues = issues(yaml);
        assert!(has_issue(&issues, "steps.pick", "unknown key 'steps'"));
        assert!(has_issue(&issues, "steps[1]", "unknown key 'parallel'"));
        assert!(has_issue(&issues, "steps[1]", "must not be empty"));
    }

    #[test]
    fn test_subworkflow_inline_is_validated() {
        let yaml = r#"
version: "1.0"
name: parent
steps:
  - name: nested
    kind: subworkflow
    inputs: {}
    workflow:
      version: "1.0"
      name: child
      inputs:
        who: { type: string, required: true }
      steps:
        - name: hi
          kind: callable
          callable: echo
          args: { v: "${{ inputs.nobody }}" }
"#;
        let issues = issues(yaml);
        assert!(has_issue(&issues, "steps.nested.inputs", "missing required subworkflow input 'who'"));
        assert!(has_issue(
            &issues,
            "steps.nested.workflow.steps.hi.args.v",
            "undeclared input 'nobody'"
        ));
    }

    #[test]
    fn test_structural_error_is_parse_error() {
        let yaml = "version: \"1.0\"\nname: x\nsteps: 5\n";
        assert!(matches!(parse_workflow_yaml(yaml), Err(WorkflowError::ParseError(_))));
        assert!(matches!(load(&[0xff, 0xfe]), Err(WorkflowError::ParseError(_))));
    }

    #[test]
    fn test_name_and_version_patterns() {
        assert!(is_valid_workflow_name("deploy-2"));
        assert!(!is_valid_workflow_name("2deploy"));
        assert!(!is_valid_workflow_name("Deploy"));
        assert!(!is_valid_workflow_name(""));
        assert!(is_valid_version("10.2"));
        assert!(!is_valid_version("1"));
        assert!(!is_valid_version("1.2.3"));
        assert!(!is_valid_version("a.1"));
    }

    #[test]
    fn test_load_workflow_file_inlines_subworkflows() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("lib")).unwrap();
        std::fs::write(
            tmp.path().join("lib/child.yaml"),
            r#"
version: "1.0"
name: child
inputs:
  who: { type: string, required: true }
steps:
  - name: hi
    kind: callable
    callable: echo
    args: { v: "${{ inputs.who }}" }
outputs:
  said: "${{ steps.hi.output }}"
"#,
        )
        .unwrap();
        let parent = tmp.path().join("parent.yaml");
        std::fs::write(
            &parent,
            r#"
version: "1.0"
name: parent
steps:
  - name: nested
    kind: subworkflow
    file: lib/child.yaml
    inputs: { who: "Ada" }
"#,
        )
        .unwrap();

        let loaded = load_workflow_file(&parent).unwrap();
        match &loaded.document.steps[0].kind {
            StepKind::Subworkflow { workflow: Some(child), .. } => {
                assert_eq!(child.name, "child");
            }
            other => panic!("expected resolved subworkflow, got {other:?}"),
        }
    }

    #[test]
    fn test_load_workflow_file_reports_keys_in_included_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("child.yaml"),
            r#"
version: "1.0"
name: child
steps:
  - { name: hi, kind: callable, callable: echo, timeout: 5 }
"#,
        )
        .unwrap();
        let parent = tmp.path().join("parent.yaml");
        std::fs::write(
            &parent,
            r#"
version: "1.0"
name: parent
steps:
  - { name: nested, kind: subworkflow, file: child.yaml, input: {} }
"#,
        )
        .unwrap();

        let Err(WorkflowError::Validation(errors)) = load_workflow_file(&parent) else {
            panic!("expected validation errors");
        };
        assert!(has_issue(&errors.issues, "steps.nested", "unknown key 'input'"));
        assert!(has_issue(
            &errors.issues,
            "steps.nested.workflow.steps.hi",
            "unknown key 'timeout'"
        ));
        assert_eq!(errors.issues.len(), 2);
    }

    #[test]
    fn test_load_workflow_file_detects_cycles() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("self.yaml");
        std::fs::write(
            &path,
            r#"
version: "1.0"
name: looped
steps:
  - name: again
    kind: subworkflow
    file: self.yaml
"#,
        )
        .unwrap();
        assert!(matches!(
            load_workflow_file(&path),
            Err(WorkflowError::SubworkflowCycle(_))
        ));
    }

    #[test]
    fn test_validate_inputs_applies_defaults_and_keeps_extras() {
        let loaded = parse_workflow_yaml(VALID).unwrap();
        let mut supplied = BTreeMap::new();
        supplied.insert("name".to_string(), serde_json::json!("Ada"));
        supplied.insert("extra".to_string(), serde_json::json!(true));

        let inputs = validate_inputs(&loaded.document, supplied).unwrap();
        assert_eq!(inputs["items"], serde_json::json!([1, 2, 3]));
        assert_eq!(inputs["extra"], serde_json::json!(true));
    }

    #[test]
    fn test_validate_inputs_reports_missing_and_mistyped() {
        let loaded = parse_workflow_yaml(VALID).unwrap();
        let mut supplied = BTreeMap::new();
        supplied.insert("items".to_string(), serde_json::json!("not a list"));

        let errors = validate_inputs(&loaded.document, supplied).unwrap_err();
        assert_eq!(errors.issues.len(), 2);
        assert!(has_issue(&errors.issues, "inputs.name", "required input"));
        assert!(has_issue(&errors.issues, "inputs.items", "expected array, got string"));
    }

    #[test]
    fn test_file_subworkflow_from_bytes_is_rejected() {
        let yaml = r#"
version: "1.0"
name: parent
steps:
  - name: nested
    kind: subworkflow
    file: child.yaml
"#;
        let issues = issues(yaml);
        assert!(has_issue(&issues, "steps.nested.file", "loaded from a workflow file"));
    }
}
