//! Breakpoint condition expressions.
//!
//! A deliberately small grammar: boolean combinations of comparisons over
//! literals and dotted identifier paths. The same engine backs `evaluate`
//! requests and hover lookups, so results are full values, not just booleans.

use thiserror::Error;

use crate::vm::ObjectId;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Condition parse or evaluation failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CondError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unresolved name: {0}")]
    UnresolvedName(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

// ── Values ───────────────────────────────────────────────────────────────────

/// A value produced while evaluating a condition.
#[derive(Debug, Clone, PartialEq)]
pub enum CondValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    /// A remote reference; equality is by remote identity.
    Ref { id: ObjectId, class_name: String },
}

impl CondValue {
    /// Render for `evaluate`/hover output.
    pub fn display(&self) -> String {
        match self {
            CondValue::Null => "null".into(),
            CondValue::Bool(b) => b.to_string(),
            CondValue::Int(n) => n.to_string(),
            CondValue::Double(d) => d.to_string(),
            CondValue::Str(s) => format!("\"{s}\""),
            CondValue::Ref { class_name, id } => format!("{class_name}@{id}"),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            CondValue::Int(n) => Some(*n as f64),
            CondValue::Double(d) => Some(*d),
            _ => None,
        }
    }
}

/// Name resolution for a suspended frame: visible locals first, then the
/// fields of `this`, else unresolved.
pub trait EvalScope {
    fn resolve(&self, path: &[String]) -> Result<CondValue, CondError>;
}

// ── Tokens ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Double(f64),
    Str(String),
    True,
    False,
    Null,
    AndAnd,
    OrOr,
    EqEq,
    NotEq,
    Ge,
    Le,
    Gt,
    Lt,
    Bang,
    Dot,
}

fn tokenize(input: &str) -> Result<Vec<Token>, CondError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '&' => {
                chars.next();
                match chars.next() {
                    Some('&') => tokens.push(Token::AndAnd),
                    _ => return Err(CondError::Parse("expected '&&'".into())),
                }
            }
            '|' => {
                chars.next();
                match chars.next() {
                    Some('|') => tokens.push(Token::OrOr),
                    _ => return Err(CondError::Parse("expected '||'".into())),
                }
            }
            '=' => {
                chars.next();
                match chars.next() {
                    Some('=') => tokens.push(Token::EqEq),
                    _ => return Err(CondError::Parse("expected '=='".into())),
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => {
                                return Err(CondError::Parse("unterminated string".into()))
                            }
                        },
                        Some(other) => text.push(other),
                        None => return Err(CondError::Parse("unterminated string".into())),
                    }
                }
                tokens.push(Token::Str(text));
            }
            '0'..='9' => {
                let mut text = String::new();
                let mut is_double = false;
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        text.push(d);
                        chars.next();
                    } else if d == '.' {
                        // Only consume the dot when a digit follows, so a
                        // trailing `.field` stays a path separator.
                        let mut ahead = chars.clone();
                        ahead.next();
                        match ahead.peek() {
                            Some(n) if n.is_ascii_digit() => {
                                is_double = true;
                                text.push('.');
                                chars.next();
                            }
                            _ => break,
                        }
                    } else {
                        break;
                    }
                }
                if is_double {
                    let value: f64 = text
                        .parse()
                        .map_err(|_| CondError::Parse(format!("bad number: {text}")))?;
                    tokens.push(Token::Double(value));
                } else {
                    let value: i64 = text
                        .parse()
                        .map_err(|_| CondError::Parse(format!("bad number: {text}")))?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut text = String::new();
                while let Some(&i) = chars.peek() {
                    if i.is_alphanumeric() || i == '_' || i == '$' {
                        text.push(i);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match text.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(text),
                });
            }
            other => return Err(CondError::Parse(format!("unexpected character: {other:?}"))),
        }
    }
    Ok(tokens)
}

// ── AST & parser ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    And,
    Or,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(CondValue),
    Path(Vec<String>),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

struct TokenStream {
    tokens: Vec<Token>,
    pos: usize,
}

impl TokenStream {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }
}

/// A parsed condition, retaining its source text for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    ast: Expr,
}

/// Parse a condition expression.
pub fn parse(input: &str) -> Result<Condition, CondError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(CondError::Parse("empty condition".into()));
    }
    let mut stream = TokenStream { tokens, pos: 0 };
    let ast = parse_logical(&mut stream)?;
    if stream.peek().is_some() {
        return Err(CondError::Parse("trailing input after expression".into()));
    }
    Ok(Condition {
        source: input.to_string(),
        ast,
    })
}

fn parse_logical(stream: &mut TokenStream) -> Result<Expr, CondError> {
    let mut lhs = parse_comparison(stream)?;
    while let Some(op) = match stream.peek() {
        Some(Token::AndAnd) => Some(BinOp::And),
        Some(Token::OrOr) => Some(BinOp::Or),
        _ => None,
    } {
        stream.next();
        let rhs = parse_comparison(stream)?;
        lhs = Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        };
    }
    Ok(lhs)
}

fn parse_comparison(stream: &mut TokenStream) -> Result<Expr, CondError> {
    let lhs = parse_unary(stream)?;
    let op = match stream.peek() {
        Some(Token::EqEq) => Some(BinOp::Eq),
        Some(Token::NotEq) => Some(BinOp::Ne),
        Some(Token::Gt) => Some(BinOp::Gt),
        Some(Token::Lt) => Some(BinOp::Lt),
        Some(Token::Ge) => Some(BinOp::Ge),
        Some(Token::Le) => Some(BinOp::Le),
        _ => None,
    };
    match op {
        Some(op) => {
            stream.next();
            let rhs = parse_unary(stream)?;
            Ok(Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            })
        }
        None => Ok(lhs),
    }
}

fn parse_unary(stream: &mut TokenStream) -> Result<Expr, CondError> {
    if stream.peek() == Some(&Token::Bang) {
        stream.next();
        let inner = parse_unary(stream)?;
        return Ok(Expr::Not(Box::new(inner)));
    }
    parse_primary(stream)
}

fn parse_primary(stream: &mut TokenStream) -> Result<Expr, CondError> {
    match stream.next() {
        Some(Token::Int(n)) => Ok(Expr::Literal(CondValue::Int(n))),
        Some(Token::Double(d)) => Ok(Expr::Literal(CondValue::Double(d))),
        Some(Token::Str(s)) => Ok(Expr::Literal(CondValue::Str(s))),
        Some(Token::True) => Ok(Expr::Literal(CondValue::Bool(true))),
        Some(Token::False) => Ok(Expr::Literal(CondValue::Bool(false))),
        Some(Token::Null) => Ok(Expr::Literal(CondValue::Null)),
        Some(Token::Ident(first)) => {
            let mut path = vec![first];
            while stream.peek() == Some(&Token::Dot) {
                stream.next();
                match stream.next() {
                    Some(Token::Ident(part)) => path.push(part),
                    _ => return Err(CondError::Parse("expected identifier after '.'".into())),
                }
            }
            Ok(Expr::Path(path))
        }
        other => Err(CondError::Parse(format!("unexpected token: {other:?}"))),
    }
}

// ── Evaluation ───────────────────────────────────────────────────────────────

impl Condition {
    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to a boolean; non-boolean results are errors.
    pub fn evaluate(&self, scope: &dyn EvalScope) -> Result<bool, CondError> {
        match eval(&self.ast, scope)? {
            CondValue::Bool(b) => Ok(b),
            other => Err(CondError::TypeMismatch(format!(
                "condition produced {}, expected boolean",
                other.display()
            ))),
        }
    }

    /// Evaluate to a value (for `evaluate` requests and hovers).
    pub fn evaluate_value(&self, scope: &dyn EvalScope) -> Result<CondValue, CondError> {
        eval(&self.ast, scope)
    }
}

fn eval(expr: &Expr, scope: &dyn EvalScope) -> Result<CondValue, CondError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => scope.resolve(path),
        Expr::Not(inner) => match eval(inner, scope)? {
            CondValue::Bool(b) => Ok(CondValue::Bool(!b)),
            other => Err(CondError::TypeMismatch(format!(
                "cannot negate {}",
                other.display()
            ))),
        },
        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, scope),
    }
}

fn eval_binary(
    op: BinOp,
    lhs: &Expr,
    rhs: &Expr,
    scope: &dyn EvalScope,
) -> Result<CondValue, CondError> {
    match op {
        BinOp::And | BinOp::Or => {
            let left = match eval(lhs, scope)? {
                CondValue::Bool(b) => b,
                other => {
                    return Err(CondError::TypeMismatch(format!(
                        "logical operand is {}",
                        other.display()
                    )))
                }
            };
            // Short-circuit.
            if op == BinOp::And && !left {
                return Ok(CondValue::Bool(false));
            }
            if op == BinOp::Or && left {
                return Ok(CondValue::Bool(true));
            }
            match eval(rhs, scope)? {
                CondValue::Bool(b) => Ok(CondValue::Bool(b)),
                other => Err(CondError::TypeMismatch(format!(
                    "logical operand is {}",
                    other.display()
                ))),
            }
        }
        BinOp::Eq => Ok(CondValue::Bool(values_equal(
            &eval(lhs, scope)?,
            &eval(rhs, scope)?,
        ))),
        BinOp::Ne => Ok(CondValue::Bool(!values_equal(
            &eval(lhs, scope)?,
            &eval(rhs, scope)?,
        ))),
        BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => {
            let left = eval(lhs, scope)?;
            let right = eval(rhs, scope)?;
            let (a, b) = match (left.as_number(), right.as_number()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(CondError::TypeMismatch(format!(
                        "cannot order {} and {}",
                        left.display(),
                        right.display()
                    )))
                }
            };
            let result = match op {
                BinOp::Gt => a > b,
                BinOp::Lt => a < b,
                BinOp::Ge => a >= b,
                BinOp::Le => a <= b,
                _ => unreachable!(),
            };
            Ok(CondValue::Bool(result))
        }
    }
}

/// Equality per the condition rules: numeric widening across int/double,
/// content equality for strings, remote identity for references.
fn values_equal(left: &CondValue, right: &CondValue) -> bool {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return a == b;
    }
    match (left, right) {
        (CondValue::Null, CondValue::Null) => true,
        (CondValue::Bool(a), CondValue::Bool(b)) => a == b,
        (CondValue::Str(a), CondValue::Str(b)) => a == b,
        (CondValue::Ref { id: a, .. }, CondValue::Ref { id: b, .. }) => a == b,
        _ => false,
    }
}
