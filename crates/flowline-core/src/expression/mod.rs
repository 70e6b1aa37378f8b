//! The `${{ }}` expression language.
//!
//! - `lexer` -- tokenizer with byte offsets
//! - `parser` -- recursive-descent parser producing a `ParseTree`
//! - `ast` -- folds parse trees into the three-node typed AST
//! - `eval` -- resolves AST nodes against an `EvalScope`
//! - `template` -- literal text with embedded `${{ }}` spans

pub mod ast;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod template;

pub use ast::{Accessor, BoolOp, BooleanExpression, Expression, Node, ReferenceKind, TernaryExpression};
pub use eval::{EvalScope, LoopFrame, evaluate, is_truthy, stringify};
pub use template::{Template, TemplateCache};

use flowline_types::run::ErrorKind;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Malformed expression syntax.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid expression `{raw}` at offset {offset}: {message}")]
pub struct GrammarError {
    /// The text being parsed.
    pub raw: String,
    /// Approximate byte offset of the problem within `raw`.
    pub offset: usize,
    pub message: String,
}

impl GrammarError {
    pub fn new(raw: &str, offset: usize, message: impl Into<String>) -> Self {
        Self {
            raw: raw.to_string(),
            offset,
            message: message.into(),
        }
    }
}

/// Failure to evaluate a well-formed expression against a context.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// A key or index along the reference path does not exist.
    #[error("unresolved path in `{raw}`: {detail}")]
    UnresolvedPath { raw: String, detail: String },

    /// A value had the wrong type for the operation applied to it.
    #[error("type mismatch in `{raw}`: {detail}")]
    TypeMismatch { raw: String, detail: String },

    /// A template span failed to parse.
    #[error(transparent)]
    Grammar(#[from] GrammarError),
}

impl EvalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EvalError::UnresolvedPath { .. } => ErrorKind::UnresolvedPath,
            EvalError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            EvalError::Grammar(_) => ErrorKind::Grammar,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Parse and build an expression (the text between `${{` and `}}`).
pub fn compile(raw: &str) -> Result<Node, GrammarError> {
    let tree = parser::parse(raw)?;
    Ok(ast::build(raw, &tree))
}

/// Compile a condition field: either a single `${{ expr }}` span or a bare
/// expression.
pub fn compile_condition(text: &str) -> Result<Node, GrammarError> {
    let trimmed = text.trim();
    if let Some(inner) = template::single_span(trimmed) {
        return compile(inner);
    }
    if trimmed.contains("${{") {
        return Err(GrammarError::new(
            text,
            0,
            "condition must be a single `${{ }}` expression",
        ));
    }
    compile(trimmed)
}

/// Compile and evaluate `raw` in one step. Mostly useful in tests.
pub fn evaluate_str(raw: &str, scope: &dyn EvalScope) -> Result<Value, EvalError> {
    let node = compile(raw)?;
    evaluate(&node, scope)
}
