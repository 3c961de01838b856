//! The boolean filter DSL used by record queries.
//!
//! The language is small and fixed; every expression the server issues
//! is supported literally:
//!
//! ```text
//! key.blacklist != null && (exploitHwid = {:exploitHwid})
//! subscription.key.bolo == true && userId = {:userId}
//! project = {:projectId} && game = {:gameId}
//! ```
//!
//! - paths traverse relation fields (`key.blacklist` reads `blacklist`
//!   off the key record referenced by the row's `key` field)
//! - `=` and `==` are the same operator; `!=` negates it
//! - `{:name}` placeholders bind to [`Params`]
//! - `null` compares against unset-or-empty, matching how the store
//!   models optional text fields; `!= false` on a boolean field means
//!   "is true"
//!
//! Relation fields are declared in a static schema rather than guessed
//! from data, so a typo in a path is an error instead of a silent
//! non-match.

use thiserror::Error;

use super::{Params, Record, Value};

/// Filter parse or evaluation failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    /// The expression text did not parse.
    #[error("filter syntax error near offset {position}: {message}")]
    Syntax {
        /// What went wrong.
        message: String,
        /// Byte offset while lexing, token index while parsing.
        position: usize,
    },

    /// A `{:name}` placeholder had no bound parameter.
    #[error("missing filter parameter {0}")]
    MissingParam(String),

    /// A path traversed a field that is not a declared relation.
    #[error("{collection}.{field} is not a relation")]
    UnknownRelation {
        /// Collection the path started from.
        collection: String,
        /// Field that was expected to be a relation.
        field: String,
    },
}

/// Relation schema: which fields of which collection point at another
/// collection.
fn relation_target(collection: &str, field: &str) -> Option<&'static str> {
    match (collection, field) {
        ("keys", "project") | ("scripts", "project") => Some("projects"),
        ("analytics", "key") | ("fingerprints", "key") | ("subscriptions", "key") => Some("keys"),
        ("sessions", "subscription") | ("joins", "subscription") => Some("subscriptions"),
        _ => None,
    }
}

/// Record lookup used while traversing relation paths.
pub(crate) trait RelationResolver {
    /// Fetch a record by collection and id, if present.
    fn resolve(&self, collection: &str, id: &str) -> Option<Record>;
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(Vec<String>),
    Param(String),
    Null,
    True,
    False,
    Eq,
    Ne,
    And,
    Or,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
enum Rhs {
    Param(String),
    Null,
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Cmp {
        path: Vec<String>,
        op: CmpOp,
        rhs: Rhs,
    },
}

/// A parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    expr: Expr,
}

impl Filter {
    /// Parse an expression.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Syntax`] with the offending byte offset.
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let tokens = lex(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(FilterError::Syntax {
                message: "unexpected trailing tokens".to_owned(),
                position: input.len(),
            });
        }
        Ok(Self { expr })
    }

    /// Evaluate the filter against one record.
    pub(crate) fn matches(
        &self,
        record: &Record,
        params: &Params,
        resolver: &dyn RelationResolver,
    ) -> Result<bool, FilterError> {
        eval(&self.expr, record, params, resolver)
    }
}

fn lex(input: &str) -> Result<Vec<Token>, FilterError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    let syntax = |message: &str, position: usize| FilterError::Syntax {
        message: message.to_owned(),
        position,
    };

    while pos < bytes.len() {
        match bytes[pos] {
            b' ' | b'\t' | b'\n' | b'\r' => pos += 1,
            b'(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            b')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            b'=' => {
                // `=` and `==` are both equality.
                pos += if bytes.get(pos + 1) == Some(&b'=') { 2 } else { 1 };
                tokens.push(Token::Eq);
            }
            b'!' => {
                if bytes.get(pos + 1) != Some(&b'=') {
                    return Err(syntax("expected '=' after '!'", pos));
                }
                tokens.push(Token::Ne);
                pos += 2;
            }
            b'&' => {
                if bytes.get(pos + 1) != Some(&b'&') {
                    return Err(syntax("expected '&&'", pos));
                }
                tokens.push(Token::And);
                pos += 2;
            }
            b'|' => {
                if bytes.get(pos + 1) != Some(&b'|') {
                    return Err(syntax("expected '||'", pos));
                }
                tokens.push(Token::Or);
                pos += 2;
            }
            b'{' => {
                if bytes.get(pos + 1) != Some(&b':') {
                    return Err(syntax("expected '{:' placeholder", pos));
                }
                let start = pos + 2;
                let mut end = start;
                while end < bytes.len() && bytes[end] != b'}' {
                    end += 1;
                }
                if end == bytes.len() {
                    return Err(syntax("unterminated placeholder", pos));
                }
                tokens.push(Token::Param(input[start..end].to_owned()));
                pos = end + 1;
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let start = pos;
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_' || bytes[pos] == b'.')
                {
                    pos += 1;
                }
                let word = &input[start..pos];
                tokens.push(match word {
                    "null" => Token::Null,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Path(word.split('.').map(str::to_owned).collect()),
                });
            }
            other => {
                return Err(syntax(&format!("unexpected character {:?}", other as char), pos));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: &str) -> FilterError {
        FilterError::Syntax {
            message: message.to_owned(),
            position: self.pos,
        }
    }

    fn parse_or(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_atom()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            let right = self.parse_atom()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_atom(&mut self) -> Result<Expr, FilterError> {
        match self.bump() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(Token::Path(path)) => {
                let op = match self.bump() {
                    Some(Token::Eq) => CmpOp::Eq,
                    Some(Token::Ne) => CmpOp::Ne,
                    _ => return Err(self.error("expected comparison operator")),
                };
                let rhs = match self.bump() {
                    Some(Token::Param(name)) => Rhs::Param(name),
                    Some(Token::Null) => Rhs::Null,
                    Some(Token::True) => Rhs::Bool(true),
                    Some(Token::False) => Rhs::Bool(false),
                    _ => return Err(self.error("expected placeholder or literal")),
                };
                Ok(Expr::Cmp { path, op, rhs })
            }
            _ => Err(self.error("expected comparison or '('")),
        }
    }
}

fn eval(
    expr: &Expr,
    record: &Record,
    params: &Params,
    resolver: &dyn RelationResolver,
) -> Result<bool, FilterError> {
    match expr {
        Expr::Or(left, right) => {
            Ok(eval(left, record, params, resolver)? || eval(right, record, params, resolver)?)
        }
        Expr::And(left, right) => {
            Ok(eval(left, record, params, resolver)? && eval(right, record, params, resolver)?)
        }
        Expr::Cmp { path, op, rhs } => {
            let lhs = lookup(record, path, resolver)?;
            let equal = match rhs {
                Rhs::Null => is_null_like(lhs.as_ref()),
                Rhs::Bool(expected) => is_truthy(lhs.as_ref()) == *expected,
                Rhs::Param(name) => {
                    let bound = params
                        .get(name)
                        .ok_or_else(|| FilterError::MissingParam(name.clone()))?;
                    values_equal(lhs.as_ref(), bound)
                }
            };
            Ok(match op {
                CmpOp::Eq => equal,
                CmpOp::Ne => !equal,
            })
        }
    }
}

/// Walk a dotted path from a record, traversing declared relations.
///
/// A dangling relation id or an unset relation field resolves to no
/// value rather than an error; only undeclared relations fail.
fn lookup(
    record: &Record,
    path: &[String],
    resolver: &dyn RelationResolver,
) -> Result<Option<Value>, FilterError> {
    let mut current = record.clone();

    for (index, segment) in path.iter().enumerate() {
        let last = index == path.len() - 1;

        if segment == "id" {
            return Ok(last.then(|| Value::Str(current.id.clone())));
        }

        if last {
            return Ok(current.get(segment).cloned());
        }

        let target = relation_target(&current.collection, segment).ok_or_else(|| {
            FilterError::UnknownRelation {
                collection: current.collection.clone(),
                field: segment.clone(),
            }
        })?;

        let Some(Value::Str(id)) = current.get(segment) else {
            return Ok(None);
        };
        let Some(next) = resolver.resolve(target, id) else {
            return Ok(None);
        };
        current = next;
    }

    Ok(None)
}

/// Unset fields and empty strings both count as null, matching how the
/// store models optional text fields like `blacklist`.
fn is_null_like(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Str(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::Bool(true)))
}

fn values_equal(lhs: Option<&Value>, rhs: &Value) -> bool {
    match lhs {
        None | Some(Value::Null) => is_null_like(Some(rhs)),
        Some(Value::Bool(a)) => matches!(rhs, Value::Bool(b) if a == b),
        Some(Value::Str(a)) => matches!(rhs, Value::Str(b) if a == b),
        Some(Value::I64(a)) => match rhs {
            Value::I64(b) => a == b,
            Value::F64(b) => (*a as f64) == *b,
            _ => false,
        },
        Some(Value::F64(a)) => match rhs {
            Value::F64(b) => a == b,
            Value::I64(b) => *a == (*b as f64),
            _ => false,
        },
        Some(Value::StrList(a)) => matches!(rhs, Value::StrList(b) if a == b),
        Some(Value::U64List(a)) => matches!(rhs, Value::U64List(b) if a == b),
    }
}
