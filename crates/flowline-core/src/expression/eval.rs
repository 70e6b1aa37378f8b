//! Expression evaluation against a run-time scope.
//!
//! References resolve strictly: a missing key, index, input, or step output
//! is an `EvalError::UnresolvedPath`, never a silent null.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::EvalError;
use super::ast::{Accessor, BoolOp, Expression, Node, ReferenceKind};

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// One active loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopFrame {
    /// Current element, or `null` for count-only loops.
    pub item: Value,
    pub index: u64,
}

/// What an expression can see while it is evaluated.
pub trait EvalScope {
    /// A run input by name.
    fn input(&self, name: &str) -> Option<&Value>;

    /// The recorded output of a visible step.
    fn step_output(&self, id: &str) -> Option<&Value>;

    /// The innermost active loop frame.
    fn loop_frame(&self) -> Option<&LoopFrame>;
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate an AST node to a concrete value.
///
/// `and`/`or` short-circuit left to right and yield booleans; a ternary
/// evaluates its condition and then exactly one value slot.
pub fn evaluate(node: &Node, scope: &dyn EvalScope) -> Result<Value, EvalError> {
    match node {
        Node::Reference(expr) => resolve(expr, scope),
        Node::Boolean(b) => {
            for operand in &b.operands {
                let truthy = is_truthy(&evaluate(operand, scope)?);
                match b.op {
                    BoolOp::And if !truthy => return Ok(Value::Bool(false)),
                    BoolOp::Or if truthy => return Ok(Value::Bool(true)),
                    _ => {}
                }
            }
            Ok(Value::Bool(b.op == BoolOp::And))
        }
        Node::Ternary(t) => {
            if is_truthy(&evaluate(&t.condition, scope)?) {
                evaluate(&t.value_if_true, scope)
            } else {
                evaluate(&t.value_if_false, scope)
            }
        }
    }
}

fn resolve(expr: &Expression, scope: &dyn EvalScope) -> Result<Value, EvalError> {
    let value = match &expr.kind {
        ReferenceKind::Literal(v) => v.clone(),
        ReferenceKind::Index => {
            let frame = scope
                .loop_frame()
                .ok_or_else(|| unresolved(expr, "'index' used outside a loop"))?;
            Value::from(frame.index)
        }
        ReferenceKind::Item => {
            let frame = scope
                .loop_frame()
                .ok_or_else(|| unresolved(expr, "'item' used outside a loop"))?;
            walk(expr, &frame.item, &expr.path)?.clone()
        }
        ReferenceKind::Step { id } => {
            let output = scope
                .step_output(id)
                .ok_or_else(|| unresolved(expr, format!("step '{id}' has no recorded output")))?;
            walk(expr, output, &expr.path)?.clone()
        }
        ReferenceKind::Input => {
            let (name, rest) = match expr.path.split_first() {
                Some((Accessor::Field(name) | Accessor::Key(name), rest)) => (name, rest),
                _ => return Err(unresolved(expr, "missing input name")),
            };
            let input = scope
                .input(name)
                .ok_or_else(|| unresolved(expr, format!("input '{name}' was not provided")))?;
            walk(expr, input, rest)?.clone()
        }
    };

    if !expr.negated {
        return Ok(value);
    }
    match value {
        Value::Bool(b) => Ok(Value::Bool(!b)),
        other => Err(EvalError::TypeMismatch {
            raw: expr.raw.clone(),
            detail: format!("'not' requires a boolean, got {}", type_name(&other)),
        }),
    }
}

fn walk<'v>(expr: &Expression, base: &'v Value, path: &[Accessor]) -> Result<&'v Value, EvalError> {
    let mut current = base;
    for accessor in path {
        current = match (accessor, current) {
            (Accessor::Field(key) | Accessor::Key(key), Value::Object(map)) => map
                .get(key)
                .ok_or_else(|| unresolved(expr, format!("key '{key}' not found")))?,
            (Accessor::Index(i), Value::Array(items)) => {
                let len = items.len() as i64;
                let idx = if *i < 0 { len + i } else { *i };
                if idx < 0 || idx >= len {
                    return Err(unresolved(
                        expr,
                        format!("index {i} out of bounds for array of length {len}"),
                    ));
                }
                &items[idx as usize]
            }
            (Accessor::Field(key) | Accessor::Key(key), other) => {
                return Err(EvalError::TypeMismatch {
                    raw: expr.raw.clone(),
                    detail: format!("cannot read key '{key}' from {}", type_name(other)),
                });
            }
            (Accessor::Index(i), other) => {
                return Err(EvalError::TypeMismatch {
                    raw: expr.raw.clone(),
                    detail: format!("cannot index [{i}] into {}", type_name(other)),
                });
            }
        };
    }
    Ok(current)
}

fn unresolved(expr: &Expression, detail: impl Into<String>) -> EvalError {
    EvalError::UnresolvedPath {
        raw: expr.raw.clone(),
        detail: detail.into(),
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a value for substitution into template text.
///
/// Strings are inserted verbatim; arrays and objects as compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
