//! Template strings: literal text with zero or more `${{ expr }}` spans.
//!
//! Each span is parsed and built independently when the template is
//! compiled. Rendering evaluates spans left to right; the first failing span
//! aborts the whole render, so partial substitutions are never returned.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use super::eval::{EvalScope, evaluate, stringify};
use super::{EvalError, GrammarError, Node, compile, compile_condition};

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Expr(Node),
}

/// A compiled template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Compile `text`, parsing every embedded span.
    pub fn parse(text: &str) -> Result<Self, GrammarError> {
        let mut segments = Vec::new();
        let mut rest = text;
        let mut consumed = 0;

        while let Some(open) = rest.find(OPEN) {
            if open > 0 {
                segments.push(Segment::Text(rest[..open].to_string()));
            }
            let inner_start = open + OPEN.len();
            let close = find_close(&rest[inner_start..]).ok_or_else(|| {
                GrammarError::new(text, consumed + open, "unterminated `${{` (missing `}}`)")
            })?;
            let inner = &rest[inner_start..inner_start + close];
            segments.push(Segment::Expr(compile(inner)?));

            let advance = inner_start + close + CLOSE.len();
            consumed += advance;
            rest = &rest[advance..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self {
            raw: text.to_string(),
            segments,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether the template contains no expressions.
    pub fn is_literal(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Text(_)))
    }

    /// The compiled expressions in source order.
    pub fn expressions(&self) -> impl Iterator<Item = &Node> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Expr(node) => Some(node),
            Segment::Text(_) => None,
        })
    }

    /// Substitute every span and return the resulting string.
    pub fn render(&self, scope: &dyn EvalScope) -> Result<String, EvalError> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr(node) => out.push_str(&stringify(&evaluate(node, scope)?)),
            }
        }
        Ok(out)
    }

    /// Evaluate to a JSON value.
    ///
    /// A template consisting of exactly one span yields the raw value of that
    /// expression (so `"${{ steps.fetch.output }}"` can pass an object along);
    /// anything else renders to a string.
    pub fn evaluate(&self, scope: &dyn EvalScope) -> Result<Value, EvalError> {
        match self.segments.as_slice() {
            [Segment::Expr(node)] => evaluate(node, scope),
            _ => Ok(Value::String(self.render(scope)?)),
        }
    }
}

/// Offset of the closing `}}` in `s`, ignoring braces inside quoted strings.
fn find_close(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(_) if b == b'\\' => i += 1,
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if bytes[i..].starts_with(CLOSE.as_bytes()) => return Some(i),
            None => {}
        }
        i += 1;
    }
    None
}

/// The inner text if `text` is exactly one `${{ ... }}` span.
pub fn single_span(text: &str) -> Option<&str> {
    let inner = text.strip_prefix(OPEN)?;
    let close = find_close(inner)?;
    (close + CLOSE.len() == inner.len()).then(|| &inner[..close])
}

// ---------------------------------------------------------------------------
// TemplateCache
// ---------------------------------------------------------------------------

/// Compiled templates and conditions keyed by their raw text.
///
/// Populated once when a document is loaded; the step runner only reads.
#[derive(Debug, Default)]
pub struct TemplateCache {
    templates: DashMap<String, Arc<Template>>,
    conditions: DashMap<String, Arc<Node>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the compiled template for `raw`, compiling on first use.
    pub fn get_or_compile(&self, raw: &str) -> Result<Arc<Template>, GrammarError> {
        if let Some(template) = self.templates.get(raw) {
            return Ok(Arc::clone(template.value()));
        }
        let template = Arc::new(Template::parse(raw)?);
        self.templates.insert(raw.to_string(), Arc::clone(&template));
        Ok(template)
    }

    /// Return the compiled condition (`when`, `over`, `break_when`, checks).
    pub fn condition(&self, raw: &str) -> Result<Arc<Node>, GrammarError> {
        if let Some(node) = self.conditions.get(raw) {
            return Ok(Arc::clone(node.value()));
        }
        let node = Arc::new(compile_condition(raw)?);
        self.conditions.insert(raw.to_string(), Arc::clone(&node));
        Ok(node)
    }

    /// Number of cached templates (conditions are not counted).
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Render every string inside a JSON value as a template.
    ///
    /// Object keys are left as-is; non-string scalars are copied.
    pub fn render_value(&self, value: &Value, scope: &dyn EvalScope) -> Result<Value, EvalError> {
        match value {
            Value::String(s) => self.get_or_compile(s)?.evaluate(scope),
            Value::Array(items) => items
                .iter()
                .map(|v| self.render_value(v, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, v) in map {
                    out.insert(key.clone(), self.render_value(v, scope)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}
