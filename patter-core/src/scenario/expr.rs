//! Condition expression language for scenario graphs.
//!
//! Grammar (closed; scenarios are pure data and cannot execute code):
//!
//! ```text
//! expr       := or_expr
//! or_expr    := and_expr ( "or" and_expr )*
//! and_expr   := unary ( "and" unary )*
//! unary      := "not" unary | "exists" IDENT | comparison
//! comparison := operand ( cmp_op operand )?
//! cmp_op     := "==" | "!=" | ">" | "<" | ">=" | "<=" | "contains" | "in"
//! operand    := IDENT | literal | list | "(" expr ")"
//! literal    := 'single-quoted string' | number | "true" | "false"
//! list       := "[" ( literal ( "," literal )* )? "]"
//! ```
//!
//! Expressions are parsed when a scenario is loaded; a malformed expression
//! is a load-time error. At runtime only missing variables and type
//! mismatches can occur, and those evaluate to `false` at the condition
//! level (logged by the caller as a condition error).

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Exists(String),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
    In,
    And,
    Or,
}

/// Load-time parse failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub position: usize,
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "parse error at {}: {}", self.position, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Runtime evaluation failure; the caller treats these as `false`.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    MissingVariable(String),
    TypeMismatch(String),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingVariable(name) => write!(f, "variable '{name}' is not set"),
            Self::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
        }
    }
}

impl std::error::Error for EvalError {}

// ── Lexer ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    And,
    Or,
    Not,
    Contains,
    In,
    Exists,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Tok)>, ParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push((i, Tok::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Tok::RParen));
                i += 1;
            }
            '[' => {
                tokens.push((i, Tok::LBracket));
                i += 1;
            }
            ']' => {
                tokens.push((i, Tok::RBracket));
                i += 1;
            }
            ',' => {
                tokens.push((i, Tok::Comma));
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((i, Tok::Eq));
                    i += 2;
                } else {
                    return Err(ParseError {
                        position: i,
                        message: "expected '==' (assignment is not supported)".into(),
                    });
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((i, Tok::Ne));
                    i += 2;
                } else {
                    return Err(ParseError {
                        position: i,
                        message: "expected '!=' (use 'not' for negation)".into(),
                    });
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((i, Tok::Ge));
                    i += 2;
                } else {
                    tokens.push((i, Tok::Gt));
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((i, Tok::Le));
                    i += 2;
                } else {
                    tokens.push((i, Tok::Lt));
                    i += 1;
                }
            }
            '\'' => {
                let start = i;
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some('\\') if matches!(chars.get(i + 1), Some('\'') | Some('\\')) => {
                            s.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(ParseError {
                                position: start,
                                message: "unterminated string literal".into(),
                            });
                        }
                    }
                }
                tokens.push((start, Tok::Str(s)));
            }
            '-' | '0'..='9' => {
                let start = i;
                if c == '-' {
                    i += 1;
                    if !matches!(chars.get(i), Some('0'..='9')) {
                        return Err(ParseError {
                            position: start,
                            message: "expected digits after '-'".into(),
                        });
                    }
                }
                while matches!(chars.get(i), Some('0'..='9')) {
                    i += 1;
                }
                if chars.get(i) == Some(&'.') && matches!(chars.get(i + 1), Some('0'..='9')) {
                    i += 1;
                    while matches!(chars.get(i), Some('0'..='9')) {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let num = text.parse::<f64>().map_err(|_| ParseError {
                    position: start,
                    message: format!("invalid number '{text}'"),
                })?;
                tokens.push((start, Tok::Num(num)));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while matches!(chars.get(i), Some(ch) if ch.is_alphanumeric() || *ch == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let tok = match word.as_str() {
                    "and" => Tok::And,
                    "or" => Tok::Or,
                    "not" => Tok::Not,
                    "contains" => Tok::Contains,
                    "in" => Tok::In,
                    "exists" => Tok::Exists,
                    "true" => Tok::True,
                    "false" => Tok::False,
                    _ => Tok::Ident(word),
                };
                tokens.push((start, tok));
            }
            _ => {
                return Err(ParseError {
                    position: i,
                    message: format!("unexpected character '{c}'"),
                });
            }
        }
    }

    Ok(tokens)
}

// ── Parser ──────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(usize, Tok)>,
    pos: usize,
    input_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(p, _)| *p)
            .unwrap_or(self.input_len)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            position: self.position(),
            message: message.into(),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Tok::Or) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Tok::And) {
            self.next();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Tok::Not) => {
                self.next();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some(Tok::Exists) => {
                self.next();
                match self.next() {
                    Some(Tok::Ident(name)) => Ok(Expr::Exists(name)),
                    _ => Err(self.error("'exists' must be followed by a variable name")),
                }
            }
            _ => self.parse_comparison(),
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_operand()?;
        let op = match self.peek() {
            Some(Tok::Eq) => BinOp::Eq,
            Some(Tok::Ne) => BinOp::Ne,
            Some(Tok::Gt) => BinOp::Gt,
            Some(Tok::Lt) => BinOp::Lt,
            Some(Tok::Ge) => BinOp::Ge,
            Some(Tok::Le) => BinOp::Le,
            Some(Tok::Contains) => BinOp::Contains,
            Some(Tok::In) => BinOp::In,
            _ => return Ok(lhs),
        };
        self.next();
        let rhs = self.parse_operand()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_operand(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some(Tok::Ident(name)) => Ok(Expr::Var(name)),
            Some(Tok::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Tok::Num(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Tok::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Tok::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Tok::LParen) => {
                let inner = self.parse_expr()?;
                if self.next() != Some(Tok::RParen) {
                    return Err(self.error("expected ')'"));
                }
                Ok(inner)
            }
            Some(Tok::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Tok::RBracket) {
                    self.next();
                    return Ok(Expr::Literal(Value::Array(items)));
                }
                loop {
                    match self.next() {
                        Some(Tok::Str(s)) => items.push(Value::String(s)),
                        Some(Tok::Num(n)) => items.push(number_value(n)),
                        Some(Tok::True) => items.push(Value::Bool(true)),
                        Some(Tok::False) => items.push(Value::Bool(false)),
                        _ => return Err(self.error("expected a literal inside the list")),
                    }
                    match self.next() {
                        Some(Tok::Comma) => continue,
                        Some(Tok::RBracket) => break,
                        _ => return Err(self.error("expected ',' or ']'")),
                    }
                }
                Ok(Expr::Literal(Value::Array(items)))
            }
            _ => Err(self.error("expected a value")),
        }
    }
}

/// Represent whole numbers as JSON integers so they render without a
/// fractional part.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

impl Expr {
    /// Parse an expression string. Fails on malformed input; call at
    /// scenario load time.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(ParseError {
                position: 0,
                message: "empty expression".into(),
            });
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            input_len: input.len(),
        };
        let expr = parser.parse_expr()?;
        if parser.peek().is_some() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    /// Evaluate against collected data, expecting a boolean result.
    pub fn eval_bool(&self, data: &Map<String, Value>) -> Result<bool, EvalError> {
        match self.eval(data)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::TypeMismatch(format!(
                "condition evaluated to {other} instead of a boolean"
            ))),
        }
    }

    fn eval(&self, data: &Map<String, Value>) -> Result<Value, EvalError> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Var(name) => data
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::MissingVariable(name.clone())),
            Self::Exists(name) => Ok(Value::Bool(
                data.get(name).is_some_and(|v| !is_empty_value(v)),
            )),
            Self::Not(inner) => {
                let b = inner.eval_bool(data)?;
                Ok(Value::Bool(!b))
            }
            Self::Binary { op, lhs, rhs } => match op {
                BinOp::And => {
                    // Short-circuit.
                    if !lhs.eval_bool(data)? {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(rhs.eval_bool(data)?))
                }
                BinOp::Or => {
                    if lhs.eval_bool(data)? {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(rhs.eval_bool(data)?))
                }
                BinOp::Eq => Ok(Value::Bool(values_equal(&lhs.eval(data)?, &rhs.eval(data)?))),
                BinOp::Ne => Ok(Value::Bool(!values_equal(
                    &lhs.eval(data)?,
                    &rhs.eval(data)?,
                ))),
                BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => {
                    let a = require_number(&lhs.eval(data)?)?;
                    let b = require_number(&rhs.eval(data)?)?;
                    let result = match op {
                        BinOp::Gt => a > b,
                        BinOp::Lt => a < b,
                        BinOp::Ge => a >= b,
                        BinOp::Le => a <= b,
                        _ => unreachable!(),
                    };
                    Ok(Value::Bool(result))
                }
                BinOp::Contains => {
                    let hay = lhs.eval(data)?;
                    let needle = rhs.eval(data)?;
                    Ok(Value::Bool(value_contains(&hay, &needle)?))
                }
                BinOp::In => {
                    let needle = lhs.eval(data)?;
                    let hay = rhs.eval(data)?;
                    Ok(Value::Bool(value_contains(&hay, &needle)?))
                }
            },
        }
    }
}

/// Best-effort numeric coercion: numbers pass through, numeric strings
/// parse, everything else is an error.
fn coerce_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn require_number(v: &Value) -> Result<f64, EvalError> {
    coerce_number(v).ok_or_else(|| EvalError::TypeMismatch(format!("{v} is not a number")))
}

/// Equality after best-effort numeric coercion, so `'17' == 17` holds.
fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (coerce_number(a), coerce_number(b)) {
        return x == y;
    }
    a == b
}

fn value_contains(hay: &Value, needle: &Value) -> Result<bool, EvalError> {
    match hay {
        Value::String(s) => match needle {
            Value::String(n) => Ok(s.contains(n.as_str())),
            other => Ok(s.contains(&value_to_plain_string(other))),
        },
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        other => Err(EvalError::TypeMismatch(format!(
            "{other} supports neither 'contains' nor 'in'"
        ))),
    }
}

fn value_to_plain_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Emptiness used by `exists`: absent, null, "" and [] are empty; numbers
/// and booleans are not.
pub fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Number(_) | Value::Bool(_) => false,
    }
}
