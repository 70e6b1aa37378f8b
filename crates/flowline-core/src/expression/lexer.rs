//! Tokenizer for the `${{ }}` expression language.
//!
//! Words are emitted as `Ident` regardless of whether they are keywords; the
//! parser decides from position whether `not`, `and`, `if` etc. act as
//! operators or as field names (`steps.not.output` is a valid reference).

use super::GrammarError;

/// A lexical token with its byte range in the expression source.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),
    Str(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Eof,
}

impl TokenKind {
    /// Human-readable description used in grammar errors.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(s) => format!("'{s}'"),
            TokenKind::Int(n) => format!("integer {n}"),
            TokenKind::Str(s) => format!("string {s:?}"),
            TokenKind::Dot => "'.'".to_string(),
            TokenKind::LBracket => "'['".to_string(),
            TokenKind::RBracket => "']'".to_string(),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::Eof => "end of expression".to_string(),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Split `source` into tokens, ending with a single `Eof`.
pub fn tokenize(source: &str) -> Result<Vec<Token>, GrammarError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    macro_rules! push {
        ($kind:expr, $offset:expr) => {{
            let end = chars.peek().map(|&(o, _)| o).unwrap_or(source.len());
            tokens.push(Token { kind: $kind, offset: $offset, end });
        }};
    }

    while let Some(&(offset, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '.' => {
                chars.next();
                push!(TokenKind::Dot, offset);
            }
            '[' => {
                chars.next();
                push!(TokenKind::LBracket, offset);
            }
            ']' => {
                chars.next();
                push!(TokenKind::RBracket, offset);
            }
            '(' => {
                chars.next();
                push!(TokenKind::LParen, offset);
            }
            ')' => {
                chars.next();
                push!(TokenKind::RParen, offset);
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some((_, 'n')) => value.push('\n'),
                            Some((_, 't')) => value.push('\t'),
                            Some((_, other)) => value.push(other),
                            None => break,
                        },
                        ch if ch == quote => {
                            closed = true;
                            break;
                        }
                        ch => value.push(ch),
                    }
                }
                if !closed {
                    return Err(GrammarError::new(source, offset, "unterminated string literal"));
                }
                push!(TokenKind::Str(value), offset);
            }
            '-' | '0'..='9' => {
                let mut text = String::new();
                if c == '-' {
                    text.push('-');
                    chars.next();
                }
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_digit() {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if text == "-" {
                    return Err(GrammarError::new(source, offset, "expected digits after '-'"));
                }
                if let Some(&(_, next)) = chars.peek() {
                    if is_ident_start(next) {
                        return Err(GrammarError::new(
                            source,
                            offset,
                            format!("invalid number literal '{text}{next}'"),
                        ));
                    }
                }
                let value = text.parse::<i64>().map_err(|_| {
                    GrammarError::new(source, offset, format!("integer literal '{text}' out of range"))
                })?;
                push!(TokenKind::Int(value), offset);
            }
            c if is_ident_start(c) => {
                let mut word = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if is_ident_continue(ch) {
                        word.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                push!(TokenKind::Ident(word), offset);
            }
            other => {
                return Err(GrammarError::new(
                    source,
                    offset,
                    format!("unexpected character '{other}'"),
                ));
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        offset: source.len(),
        end: source.len(),
    });
    Ok(tokens)
}
