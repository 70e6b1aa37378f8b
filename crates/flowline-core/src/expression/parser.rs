//! Recursive-descent parser for expressions.
//!
//! ```text
//! expr      := or_expr ( "if" or_expr "else" expr )?
//! or_expr   := and_expr ( "or" and_expr )*
//! and_expr  := unary ( "and" unary )*
//! unary     := "not" unary | primary
//! primary   := "(" expr ")" | reference | literal
//! reference := "inputs" accessor+
//!            | "steps" ( "." ident | "[" string "]" ) "." "output" accessor*
//!            | "item" accessor*
//!            | "index"
//! accessor  := "." ident | "[" integer "]" | "[" string "]"
//! ```
//!
//! The parser only checks syntax. Whether `inputs.foo` names a declared
//! input is decided later, by the schema validator or at evaluation time.
//!
//! Tree depth (parentheses, `not`, chained operators and ternaries) is capped
//! at [`MAX_DEPTH`]; deeper input is a `GrammarError`.

use serde_json::Value;

use super::GrammarError;
use super::ast::{Accessor, BoolOp};
use super::lexer::{Token, TokenKind, tokenize};

/// Byte range of a node in the expression source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn slice<'a>(&self, source: &'a str) -> &'a str {
        source.get(self.start..self.end).unwrap_or(source).trim()
    }
}

/// The root a reference is resolved against.
#[derive(Debug, Clone, PartialEq)]
pub enum RefRoot {
    Inputs,
    Step(String),
    Item,
    Index,
}

/// Concrete syntax tree, one node per grammar production.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseTree {
    Reference {
        root: RefRoot,
        accessors: Vec<Accessor>,
        span: Span,
    },
    Literal {
        value: Value,
        span: Span,
    },
    Not {
        operand: Box<ParseTree>,
        span: Span,
    },
    Binary {
        op: BoolOp,
        lhs: Box<ParseTree>,
        rhs: Box<ParseTree>,
        span: Span,
    },
    Ternary {
        value_if_true: Box<ParseTree>,
        condition: Box<ParseTree>,
        value_if_false: Box<ParseTree>,
        span: Span,
    },
    Group {
        inner: Box<ParseTree>,
        span: Span,
    },
}

impl ParseTree {
    pub fn span(&self) -> Span {
        match self {
            ParseTree::Reference { span, .. }
            | ParseTree::Literal { span, .. }
            | ParseTree::Not { span, .. }
            | ParseTree::Binary { span, .. }
            | ParseTree::Ternary { span, .. }
            | ParseTree::Group { span, .. } => *span,
        }
    }
}

const KEYWORDS: &[&str] = &["and", "or", "not", "if", "else"];

/// Deepest parse tree accepted.
pub const MAX_DEPTH: usize = 256;

/// Parse the text between `${{` and `}}`.
pub fn parse(source: &str) -> Result<ParseTree, GrammarError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
        depth: 0,
    };

    if parser.at_eof() {
        return Err(GrammarError::new(source, 0, "empty expression"));
    }

    let tree = parser.expr()?;
    if !parser.at_eof() {
        let token = parser.peek();
        return Err(GrammarError::new(
            source,
            token.offset,
            format!("unexpected {} after expression", token.kind.describe()),
        ));
    }
    Ok(tree)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    // -- token helpers --

    fn peek(&self) -> &Token {
        // tokenize always ends with Eof, and `advance` never moves past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn prev_end(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|t| t.end)
            .unwrap_or(0)
    }

    fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Ident(w) if w == word)
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.is_keyword(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> GrammarError {
        GrammarError::new(self.source, offset, message)
    }

    fn descend(&mut self, offset: usize) -> Result<(), GrammarError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error(offset, "expression nested too deeply"));
        }
        Ok(())
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, GrammarError> {
        let token = self.peek().clone();
        if token.kind == kind {
            Ok(self.advance())
        } else {
            Err(self.error(
                token.offset,
                format!("expected {what}, found {}", token.kind.describe()),
            ))
        }
    }

    // -- productions --

    fn expr(&mut self) -> Result<ParseTree, GrammarError> {
        self.descend(self.peek().offset)?;
        let tree = self.conditional();
        self.depth -= 1;
        tree
    }

    fn conditional(&mut self) -> Result<ParseTree, GrammarError> {
        let value = self.or_expr()?;
        if !self.eat_keyword("if") {
            return Ok(value);
        }
        let condition = self.or_expr()?;
        if !self.eat_keyword("else") {
            let token = self.peek();
            return Err(self.error(
                token.offset,
                format!("expected 'else' in conditional, found {}", token.kind.describe()),
            ));
        }
        let otherwise = self.expr()?;
        let span = Span {
            start: value.span().start,
            end: otherwise.span().end,
        };
        Ok(ParseTree::Ternary {
            value_if_true: Box::new(value),
            condition: Box::new(condition),
            value_if_false: Box::new(otherwise),
            span,
        })
    }

    // Each chained operator nests the tree one level deeper on the left.
    fn or_expr(&mut self) -> Result<ParseTree, GrammarError> {
        let base = self.depth;
        let mut lhs = self.and_expr()?;
        while self.is_keyword("or") {
            let op = self.advance();
            self.descend(op.offset)?;
            let rhs = self.and_expr()?;
            lhs = binary(BoolOp::Or, lhs, rhs);
        }
        self.depth = base;
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<ParseTree, GrammarError> {
        let base = self.depth;
        let mut lhs = self.unary()?;
        while self.is_keyword("and") {
            let op = self.advance();
            self.descend(op.offset)?;
            let rhs = self.unary()?;
            lhs = binary(BoolOp::And, lhs, rhs);
        }
        self.depth = base;
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<ParseTree, GrammarError> {
        if self.is_keyword("not") {
            let start = self.advance().offset;
            self.descend(start)?;
            let operand = self.unary();
            self.depth -= 1;
            let operand = operand?;
            let end = operand.span().end;
            return Ok(ParseTree::Not {
                operand: Box::new(operand),
                span: Span { start, end },
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<ParseTree, GrammarError> {
        let token = self.advance();
        let start = token.offset;
        match token.kind {
            TokenKind::LParen => {
                let inner = self.expr()?;
                if self.peek().kind != TokenKind::RParen {
                    return Err(self.error(start, "unbalanced parenthesis"));
                }
                self.advance();
                Ok(ParseTree::Group {
                    inner: Box::new(inner),
                    span: Span { start, end: self.prev_end() },
                })
            }
            TokenKind::Int(n) => Ok(self.literal(Value::from(n), start)),
            TokenKind::Str(s) => Ok(self.literal(Value::String(s), start)),
            TokenKind::Ident(word) => match word.as_str() {
                "true" => Ok(self.literal(Value::Bool(true), start)),
                "false" => Ok(self.literal(Value::Bool(false), start)),
                "null" => Ok(self.literal(Value::Null, start)),
                "inputs" => self.input_reference(start),
                "steps" => self.step_reference(start),
                "item" => {
                    let accessors = self.accessors()?;
                    Ok(self.reference(RefRoot::Item, accessors, start))
                }
                "index" => {
                    if matches!(self.peek().kind, TokenKind::Dot | TokenKind::LBracket) {
                        return Err(self.error(self.peek().offset, "'index' does not take accessors"));
                    }
                    Ok(self.reference(RefRoot::Index, Vec::new(), start))
                }
                w if KEYWORDS.contains(&w) => {
                    Err(self.error(start, format!("expected expression, found '{w}'")))
                }
                other => Err(self.error(
                    start,
                    format!(
                        "unknown reference root '{other}' (expected inputs, steps, item or index)"
                    ),
                )),
            },
            TokenKind::Eof => Err(self.error(start, "unexpected end of expression")),
            other => Err(self.error(
                start,
                format!("expected expression, found {}", other.describe()),
            )),
        }
    }

    fn input_reference(&mut self, start: usize) -> Result<ParseTree, GrammarError> {
        let accessors = self.accessors()?;
        match accessors.first() {
            Some(Accessor::Field(_)) | Some(Accessor::Key(_)) => {
                Ok(self.reference(RefRoot::Inputs, accessors, start))
            }
            Some(Accessor::Index(_)) => Err(self.error(start, "input name must be a field or quoted key")),
            None => Err(self.error(self.peek().offset, "expected input name after 'inputs'")),
        }
    }

    fn step_reference(&mut self, start: usize) -> Result<ParseTree, GrammarError> {
        let token = self.advance();
        let id = match token.kind {
            TokenKind::Dot => match self.advance().kind {
                TokenKind::Ident(id) => id,
                other => {
                    return Err(self.error(
                        token.end,
                        format!("expected step id, found {}", other.describe()),
                    ));
                }
            },
            TokenKind::LBracket => {
                let id = match self.advance().kind {
                    TokenKind::Str(id) => id,
                    other => {
                        return Err(self.error(
                            token.end,
                            format!("expected quoted step id, found {}", other.describe()),
                        ));
                    }
                };
                self.expect(TokenKind::RBracket, "']'")
                    .map_err(|_| self.error(token.offset, "unbalanced bracket"))?;
                id
            }
            other => {
                return Err(self.error(
                    token.offset,
                    format!("expected step id after 'steps', found {}", other.describe()),
                ));
            }
        };

        let dot = self.peek().offset;
        let has_output = self.expect(TokenKind::Dot, "'.output'").is_ok()
            && matches!(self.advance().kind, TokenKind::Ident(ref w) if w == "output");
        if !has_output {
            return Err(self.error(dot, format!("expected '.output' after step id '{id}'")));
        }

        let accessors = self.accessors()?;
        Ok(self.reference(RefRoot::Step(id), accessors, start))
    }

    fn accessors(&mut self) -> Result<Vec<Accessor>, GrammarError> {
        let mut accessors = Vec::new();
        loop {
            match self.peek().kind {
                TokenKind::Dot => {
                    let dot = self.advance();
                    match self.advance().kind {
                        TokenKind::Ident(name) => accessors.push(Accessor::Field(name)),
                        other => {
                            return Err(self.error(
                                dot.end,
                                format!("expected field name after '.', found {}", other.describe()),
                            ));
                        }
                    }
                }
                TokenKind::LBracket => {
                    let open = self.advance();
                    let accessor = match self.advance().kind {
                        TokenKind::Int(i) => Accessor::Index(i),
                        TokenKind::Str(key) => Accessor::Key(key),
                        other => {
                            return Err(self.error(
                                open.end,
                                format!(
                                    "expected integer or quoted key inside brackets, found {}",
                                    other.describe()
                                ),
                            ));
                        }
                    };
                    if self.peek().kind != TokenKind::RBracket {
                        return Err(self.error(open.offset, "unbalanced bracket"));
                    }
                    self.advance();
                    accessors.push(accessor);
                }
                _ => return Ok(accessors),
            }
        }
    }

    fn reference(&self, root: RefRoot, accessors: Vec<Accessor>, start: usize) -> ParseTree {
        ParseTree::Reference {
            root,
            accessors,
            span: Span { start, end: self.prev_end() },
        }
    }

    fn literal(&self, value: Value, start: usize) -> ParseTree {
        ParseTree::Literal {
            value,
            span: Span { start, end: self.prev_end() },
        }
    }
}

fn binary(op: BoolOp, lhs: ParseTree, rhs: ParseTree) -> ParseTree {
    let span = Span {
        start: lhs.span().start,
        end: rhs.span().end,
    };
    ParseTree::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        span,
    }
}
