//! Typed expression AST and the parse-tree folding that produces it.
//!
//! The AST has exactly three node types:
//! - `Expression` -- a single reference (or literal) with an optional negation
//! - `BooleanExpression` -- a flat `and`/`or` operand list
//! - `TernaryExpression` -- `value_if_true if condition else value_if_false`
//!
//! Negation never appears as its own node: `not ref` sets `negated` on the
//! leaf, and `not` over a group is pushed down with De Morgan's laws.

use serde_json::Value;

use super::parser::{ParseTree, RefRoot};

// ---------------------------------------------------------------------------
// Node types
// ---------------------------------------------------------------------------

/// One path step applied to a resolved value.
#[derive(Debug, Clone, PartialEq)]
pub enum Accessor {
    /// `.name`
    Field(String),
    /// `[3]` or `[-1]`
    Index(i64),
    /// `['some key']`
    Key(String),
}

impl std::fmt::Display for Accessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Accessor::Field(name) => write!(f, ".{name}"),
            Accessor::Index(i) => write!(f, "[{i}]"),
            Accessor::Key(key) => write!(f, "[{key:?}]"),
        }
    }
}

/// What a reference resolves against.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceKind {
    /// `inputs.<name>...`; the first path accessor names the input.
    Input,
    /// `steps.<id>.output...`
    Step { id: String },
    /// `item...` (top of the loop-frame stack)
    Item,
    /// `index`
    Index,
    /// A literal constant; `path` is always empty.
    Literal(Value),
}

/// A single reference expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    /// Source text of the reference, used in error messages.
    pub raw: String,
    pub kind: ReferenceKind,
    pub path: Vec<Accessor>,
    pub negated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

impl BoolOp {
    fn flip(self) -> Self {
        match self {
            BoolOp::And => BoolOp::Or,
            BoolOp::Or => BoolOp::And,
        }
    }
}

/// `a and b and c` / `a or b or c` as a single flat node.
#[derive(Debug, Clone, PartialEq)]
pub struct BooleanExpression {
    pub op: BoolOp,
    pub operands: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TernaryExpression {
    pub condition: Box<Node>,
    pub value_if_true: Box<Node>,
    pub value_if_false: Box<Node>,
}

/// Any AST node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Reference(Expression),
    Boolean(BooleanExpression),
    Ternary(TernaryExpression),
}

impl Node {
    /// Every reference leaf, ternary conditions before their values.
    pub fn references(&self) -> Vec<&Expression> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Expression>) {
        match self {
            Node::Reference(expr) => out.push(expr),
            Node::Boolean(b) => b.operands.iter().for_each(|n| n.collect_references(out)),
            Node::Ternary(t) => {
                t.condition.collect_references(out);
                t.value_if_true.collect_references(out);
                t.value_if_false.collect_references(out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Fold a parse tree into the typed AST. `source` is the text the tree was
/// parsed from; leaf `raw` fields are slices of it.
pub fn build(source: &str, tree: &ParseTree) -> Node {
    fold(source, tree, false)
}

fn fold(source: &str, tree: &ParseTree, negate: bool) -> Node {
    match tree {
        ParseTree::Reference { root, accessors, span } => {
            let kind = match root {
                RefRoot::Inputs => ReferenceKind::Input,
                RefRoot::Step(id) => ReferenceKind::Step { id: id.clone() },
                RefRoot::Item => ReferenceKind::Item,
                RefRoot::Index => ReferenceKind::Index,
            };
            Node::Reference(Expression {
                raw: span.slice(source).to_string(),
                kind,
                path: accessors.clone(),
                negated: negate,
            })
        }
        ParseTree::Literal { value, span } => Node::Reference(Expression {
            raw: span.slice(source).to_string(),
            kind: ReferenceKind::Literal(value.clone()),
            path: Vec::new(),
            negated: negate,
        }),
        ParseTree::Group { inner, .. } => fold(source, inner, negate),
        ParseTree::Not { operand, .. } => fold(source, operand, !negate),
        ParseTree::Binary { op, lhs, rhs, .. } => {
            // not (a and b) == (not a) or (not b)
            let op = if negate { op.flip() } else { *op };
            let mut operands = Vec::new();
            for side in [lhs.as_ref(), rhs.as_ref()] {
                match fold(source, side, negate) {
                    Node::Boolean(inner) if inner.op == op => operands.extend(inner.operands),
                    other => operands.push(other),
                }
            }
            Node::Boolean(BooleanExpression { op, operands })
        }
        ParseTree::Ternary {
            value_if_true,
            condition,
            value_if_false,
            ..
        } => Node::Ternary(TernaryExpression {
            condition: Box::new(fold(source, condition, false)),
            value_if_true: Box::new(fold(source, value_if_true, negate)),
            value_if_false: Box::new(fold(source, value_if_false, negate)),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::compile;

    fn reference(node: &Node) -> &Expression {
        match node {
            Node::Reference(e) => e,
            other => panic!("expected reference, got {other:?}"),
        }
    }

    #[test]
    fn test_not_folds_into_leaf() {
        let node = compile("not inputs.flag").unwrap();
        let expr = reference(&node);
        assert!(expr.negated);
        assert_eq!(expr.kind, ReferenceKind::Input);
        assert_eq!(expr.path, vec![Accessor::Field("flag".into())]);
        assert_eq!(expr.raw, "inputs.flag");
    }

    #[test]
    fn test_double_not_cancels() {
        let node = compile("not not index").unwrap();
        assert!(!reference(&node).negated);
    }

    #[test]
    fn test_and_chain_is_flat() {
        let node = compile("inputs.a and inputs.b and (inputs.c and inputs.d)").unwrap();
        match node {
            Node::Boolean(b) => {
                assert_eq!(b.op, BoolOp::And);
                assert_eq!(b.operands.len(), 4);
            }
            other => panic!("expected boolean, got {other:?}"),
        }
    }

    #[test]
    fn test_mixed_ops_keep_precedence() {
        let node = compile("inputs.a or inputs.b and inputs.c").unwrap();
        match node {
            Node::Boolean(b) => {
                assert_eq!(b.op, BoolOp::Or);
                assert_eq!(b.operands.len(), 2);
                assert!(matches!(&b.operands[1], Node::Boolean(inner) if inner.op == BoolOp::And));
            }
            other => panic!("expected boolean, got {other:?}"),
        }
    }

    #[test]
    fn test_de_morgan_pushdown() {
        let node = compile("not (inputs.a and inputs.b)").unwrap();
        match node {
            Node::Boolean(b) => {
                assert_eq!(b.op, BoolOp::Or);
                assert!(b.operands.iter().all(|n| reference(n).negated));
            }
            other => panic!("expected boolean, got {other:?}"),
        }
    }

    #[test]
    fn test_ternary_nests_right() {
        let node = compile("'a' if inputs.x else 'b' if inputs.y else 'c'").unwrap();
        match node {
            Node::Ternary(t) => {
                assert_eq!(
                    reference(&t.value_if_true).kind,
                    ReferenceKind::Literal(Value::from("a"))
                );
                assert!(matches!(*t.value_if_false, Node::Ternary(_)));
            }
            other => panic!("expected ternary, got {other:?}"),
        }
    }

    #[test]
    fn test_references_collects_all_leaves() {
        let node = compile("steps.a.output if inputs.x or item.y else index").unwrap();
        let raws: Vec<_> = node.references().iter().map(|e| e.raw.clone()).collect();
        assert_eq!(raws, vec!["inputs.x", "item.y", "steps.a.output", "index"]);
    }
}
