//! Safe expression interpreter for condition nodes
//!
//! `custom_expression` conditions evaluate a small boolean expression
//! language over node inputs and execution variables. The interpreter is a
//! hand-rolled tokenizer, Pratt parser, and tree walker with a fixed operator
//! set (arithmetic, comparison, `and`/`or`/`not`, `in`/`not in`) and a fixed
//! function whitelist. Anything outside that surface is rejected at parse
//! time; there is no escape hatch into the host language.
//!
//! Values are `serde_json::Value`. Truthiness follows the conventions of the
//! data model: `null`, `false`, `0`, `""`, `[]`, and `{}` are falsy,
//! everything else is truthy. Unknown variables evaluate to `null` so
//! comparisons against absent inputs behave predictably.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Functions callable from expressions. Fixed allowlist; attribute calls and
/// anything with side effects are unrepresentable.
const ALLOWED_FUNCTIONS: &[&str] = &[
    "len", "abs", "min", "max", "sum", "all", "any", "round", "bool", "int", "float", "str",
];

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("function '{0}' is not allowed")]
    UnknownFunction(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
}

// ---- tokens ----------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Int(i64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            '[' => {
                tokens.push((i, Token::LBracket));
                i += 1;
            }
            ']' => {
                tokens.push((i, Token::RBracket));
                i += 1;
            }
            ',' => {
                tokens.push((i, Token::Comma));
                i += 1;
            }
            '.' => {
                tokens.push((i, Token::Dot));
                i += 1;
            }
            '+' => {
                tokens.push((i, Token::Plus));
                i += 1;
            }
            '-' => {
                tokens.push((i, Token::Minus));
                i += 1;
            }
            '*' => {
                tokens.push((i, Token::Star));
                i += 1;
            }
            '/' => {
                tokens.push((i, Token::Slash));
                i += 1;
            }
            '%' => {
                tokens.push((i, Token::Percent));
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = bytes.get(i + 1).map(|b| *b as char);
                let token = match (c, next) {
                    ('=', Some('=')) => {
                        i += 2;
                        Token::Eq
                    }
                    ('!', Some('=')) => {
                        i += 2;
                        Token::Ne
                    }
                    ('<', Some('=')) => {
                        i += 2;
                        Token::Le
                    }
                    ('>', Some('=')) => {
                        i += 2;
                        Token::Ge
                    }
                    ('<', _) => {
                        i += 1;
                        Token::Lt
                    }
                    ('>', _) => {
                        i += 1;
                        Token::Gt
                    }
                    _ => {
                        return Err(ExprError::Syntax {
                            offset: i,
                            message: format!("unexpected character '{c}'"),
                        })
                    }
                };
                tokens.push((i, token));
            }
            '\'' | '"' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut s = String::new();
                loop {
                    match bytes.get(i) {
                        Some(b) if *b as char == quote => {
                            i += 1;
                            break;
                        }
                        Some(b'\\') => {
                            let escaped = bytes.get(i + 1).map(|b| *b as char).ok_or(
                                ExprError::Syntax {
                                    offset: i,
                                    message: "unterminated escape".to_string(),
                                },
                            )?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                            i += 2;
                        }
                        Some(b) => {
                            s.push(*b as char);
                            i += 1;
                        }
                        None => {
                            return Err(ExprError::Syntax {
                                offset: start,
                                message: "unterminated string literal".to_string(),
                            })
                        }
                    }
                }
                tokens.push((start, Token::Str(s)));
            }
            '0'..='9' => {
                let start = i;
                let mut is_float = false;
                while i < bytes.len()
                    && (bytes[i].is_ascii_digit()
                        || (bytes[i] == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)))
                {
                    if bytes[i] == b'.' {
                        is_float = true;
                    }
                    i += 1;
                }
                let text = &input[start..i];
                if is_float {
                    let n = text.parse::<f64>().map_err(|_| ExprError::Syntax {
                        offset: start,
                        message: format!("bad number '{text}'"),
                    })?;
                    tokens.push((start, Token::Number(n)));
                } else {
                    let n = text.parse::<i64>().map_err(|_| ExprError::Syntax {
                        offset: start,
                        message: format!("bad number '{text}'"),
                    })?;
                    tokens.push((start, Token::Int(n)));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                let word = &input[start..i];
                let token = match word {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "true" | "True" => Token::True,
                    "false" | "False" => Token::False,
                    "null" | "None" => Token::Null,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push((start, token));
            }
            other => {
                return Err(ExprError::Syntax {
                    offset: i,
                    message: format!("unexpected character '{other}'"),
                })
            }
        }
    }

    Ok(tokens)
}

// ---- AST -------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Not,
    Neg,
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(usize::MAX)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, token: Token) -> Result<(), ExprError> {
        if self.peek() == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ExprError::Syntax {
                offset: self.offset(),
                message: format!("expected {token:?}"),
            })
        }
    }

    /// Pratt parser entry point: `or` has the lowest binding power.
    fn parse_expr(&mut self, min_bp: u8) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_prefix()?;

        loop {
            let (op, bp) = match self.peek() {
                Some(Token::Or) => (BinOp::Or, 1),
                Some(Token::And) => (BinOp::And, 2),
                Some(Token::Eq) => (BinOp::Eq, 4),
                Some(Token::Ne) => (BinOp::Ne, 4),
                Some(Token::Lt) => (BinOp::Lt, 4),
                Some(Token::Le) => (BinOp::Le, 4),
                Some(Token::Gt) => (BinOp::Gt, 4),
                Some(Token::Ge) => (BinOp::Ge, 4),
                Some(Token::In) => (BinOp::In, 4),
                Some(Token::Not) => {
                    // `not` mid-expression only forms `not in`.
                    if self.tokens.get(self.pos + 1).map(|(_, t)| t) == Some(&Token::In) {
                        (BinOp::NotIn, 4)
                    } else {
                        break;
                    }
                }
                Some(Token::Plus) => (BinOp::Add, 6),
                Some(Token::Minus) => (BinOp::Sub, 6),
                Some(Token::Star) => (BinOp::Mul, 7),
                Some(Token::Slash) => (BinOp::Div, 7),
                Some(Token::Percent) => (BinOp::Mod, 7),
                _ => break,
            };

            if bp < min_bp {
                break;
            }
            self.pos += 1;
            if op == BinOp::NotIn {
                self.pos += 1; // consume the `in` after `not`
            }

            let rhs = self.parse_expr(bp + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        let expr = match self.advance() {
            Some(Token::Int(n)) => Expr::Literal(Value::from(n)),
            Some(Token::Number(n)) => Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            ),
            Some(Token::Str(s)) => Expr::Literal(Value::String(s)),
            Some(Token::True) => Expr::Literal(Value::Bool(true)),
            Some(Token::False) => Expr::Literal(Value::Bool(false)),
            Some(Token::Null) => Expr::Literal(Value::Null),
            Some(Token::Not) => {
                let inner = self.parse_expr(3)?;
                Expr::Unary(UnaryOp::Not, Box::new(inner))
            }
            Some(Token::Minus) => {
                let inner = self.parse_expr(8)?;
                Expr::Unary(UnaryOp::Neg, Box::new(inner))
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr(0)?;
                self.expect(Token::RParen)?;
                inner
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.parse_expr(0)?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket)?;
                Expr::List(items)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    if !ALLOWED_FUNCTIONS.contains(&name.as_str()) {
                        return Err(ExprError::UnknownFunction(name));
                    }
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr(0)?);
                            if self.peek() == Some(&Token::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    Expr::Call(name, args)
                } else {
                    Expr::Var(name)
                }
            }
            other => {
                return Err(ExprError::Syntax {
                    offset,
                    message: format!("unexpected token {other:?}"),
                })
            }
        };

        self.parse_postfix(expr)
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> Result<Expr, ExprError> {
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.advance() {
                        Some(Token::Ident(attr)) => {
                            expr = Expr::Attr(Box::new(expr), attr);
                        }
                        _ => {
                            return Err(ExprError::Syntax {
                                offset: self.offset(),
                                message: "expected attribute name after '.'".to_string(),
                            })
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.parse_expr(0)?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }
}

// ---- evaluation ------------------------------------------------------------

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (left, right) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

fn eval(expr: &Expr, scope: &BTreeMap<String, Value>) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => Ok(scope.get(name).cloned().unwrap_or(Value::Null)),
        Expr::Attr(base, attr) => {
            let value = eval(base, scope)?;
            Ok(value.get(attr).cloned().unwrap_or(Value::Null))
        }
        Expr::Index(base, index) => {
            let value = eval(base, scope)?;
            let idx = eval(index, scope)?;
            match (&value, &idx) {
                (Value::Array(items), Value::Number(n)) => Ok(n
                    .as_u64()
                    .and_then(|i| items.get(i as usize))
                    .cloned()
                    .unwrap_or(Value::Null)),
                (Value::Object(map), Value::String(k)) => {
                    Ok(map.get(k).cloned().unwrap_or(Value::Null))
                }
                _ => Err(ExprError::Type(format!(
                    "cannot index {} with {}",
                    type_name(&value),
                    type_name(&idx)
                ))),
            }
        }
        Expr::List(items) => {
            let values = items
                .iter()
                .map(|e| eval(e, scope))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(values))
        }
        Expr::Unary(op, inner) => {
            let value = eval(inner, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => as_number(&value)
                    .map(|n| number_value(-n))
                    .ok_or_else(|| ExprError::Type(format!("cannot negate {}", type_name(&value)))),
            }
        }
        Expr::Binary(op, lhs, rhs) => eval_binary(*op == BinOp::And, op, lhs, rhs, scope),
        Expr::Call(name, args) => {
            let values = args
                .iter()
                .map(|e| eval(e, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call_function(name, values)
        }
    }
}

fn eval_binary(
    short_circuit_and: bool,
    op: &BinOp,
    lhs: &Expr,
    rhs: &Expr,
    scope: &BTreeMap<String, Value>,
) -> Result<Value, ExprError> {
    // and/or short-circuit on the left value's truthiness.
    if matches!(op, BinOp::And | BinOp::Or) {
        let left = eval(lhs, scope)?;
        let left_truthy = truthy(&left);
        if short_circuit_and && !left_truthy {
            return Ok(Value::Bool(false));
        }
        if !short_circuit_and && left_truthy {
            return Ok(Value::Bool(true));
        }
        let right = eval(rhs, scope)?;
        return Ok(Value::Bool(truthy(&right)));
    }

    let left = eval(lhs, scope)?;
    let right = eval(rhs, scope)?;

    match op {
        BinOp::Eq => Ok(Value::Bool(left == right)),
        BinOp::Ne => Ok(Value::Bool(left != right)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(&left, &right).ok_or_else(|| {
                ExprError::Type(format!(
                    "cannot compare {} with {}",
                    type_name(&left),
                    type_name(&right)
                ))
            })?;
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::In | BinOp::NotIn => {
            let contained = match &right {
                Value::Array(items) => items.contains(&left),
                Value::Object(map) => left.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
                Value::String(s) => left.as_str().map(|sub| s.contains(sub)).unwrap_or(false),
                _ => {
                    return Err(ExprError::Type(format!(
                        "'in' requires a collection, got {}",
                        type_name(&right)
                    )))
                }
            };
            Ok(Value::Bool(if *op == BinOp::In { contained } else { !contained }))
        }
        BinOp::Add => {
            if let (Value::String(a), Value::String(b)) = (&left, &right) {
                return Ok(Value::String(format!("{a}{b}")));
            }
            arith(&left, &right, |a, b| Ok(a + b))
        }
        BinOp::Sub => arith(&left, &right, |a, b| Ok(a - b)),
        BinOp::Mul => arith(&left, &right, |a, b| Ok(a * b)),
        BinOp::Div => arith(&left, &right, |a, b| {
            if b == 0.0 {
                Err(ExprError::DivisionByZero)
            } else {
                Ok(a / b)
            }
        }),
        BinOp::Mod => arith(&left, &right, |a, b| {
            if b == 0.0 {
                Err(ExprError::DivisionByZero)
            } else {
                Ok(a % b)
            }
        }),
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn arith(
    left: &Value,
    right: &Value,
    f: impl Fn(f64, f64) -> Result<f64, ExprError>,
) -> Result<Value, ExprError> {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => f(a, b).map(number_value),
        _ => Err(ExprError::Type(format!(
            "arithmetic requires numbers, got {} and {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn call_function(name: &str, mut args: Vec<Value>) -> Result<Value, ExprError> {
    let arity = |n: usize| -> Result<(), ExprError> {
        if args.len() == n {
            Ok(())
        } else {
            Err(ExprError::Type(format!("{name}() takes {n} argument(s), got {}", args.len())))
        }
    };

    match name {
        "len" => {
            arity(1)?;
            let n = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(ExprError::Type(format!("len() of {}", type_name(other))))
                }
            };
            Ok(Value::from(n))
        }
        "abs" => {
            arity(1)?;
            as_number(&args[0])
                .map(|n| number_value(n.abs()))
                .ok_or_else(|| ExprError::Type("abs() requires a number".to_string()))
        }
        "round" => {
            arity(1)?;
            as_number(&args[0])
                .map(|n| number_value(n.round()))
                .ok_or_else(|| ExprError::Type("round() requires a number".to_string()))
        }
        "min" | "max" => {
            let items = if args.len() == 1 {
                match args.remove(0) {
                    Value::Array(a) => a,
                    other => vec![other],
                }
            } else {
                args
            };
            if items.is_empty() {
                return Err(ExprError::Type(format!("{name}() of empty sequence")));
            }
            let mut best = items[0].clone();
            for item in &items[1..] {
                let ordering = compare(item, &best).ok_or_else(|| {
                    ExprError::Type(format!("{name}() arguments are not comparable"))
                })?;
                let take = if name == "min" { ordering.is_lt() } else { ordering.is_gt() };
                if take {
                    best = item.clone();
                }
            }
            Ok(best)
        }
        "sum" => {
            arity(1)?;
            let items = args[0]
                .as_array()
                .ok_or_else(|| ExprError::Type("sum() requires an array".to_string()))?;
            let mut total = 0.0;
            for item in items {
                total += as_number(item)
                    .ok_or_else(|| ExprError::Type("sum() over non-numbers".to_string()))?;
            }
            Ok(number_value(total))
        }
        "all" => {
            arity(1)?;
            let items = args[0]
                .as_array()
                .ok_or_else(|| ExprError::Type("all() requires an array".to_string()))?;
            Ok(Value::Bool(items.iter().all(truthy)))
        }
        "any" => {
            arity(1)?;
            let items = args[0]
                .as_array()
                .ok_or_else(|| ExprError::Type("any() requires an array".to_string()))?;
            Ok(Value::Bool(items.iter().any(truthy)))
        }
        "bool" => {
            arity(1)?;
            Ok(Value::Bool(truthy(&args[0])))
        }
        "int" => {
            arity(1)?;
            let n = match &args[0] {
                Value::String(s) => s.trim().parse::<f64>().ok(),
                other => as_number(other),
            };
            n.map(|f| Value::from(f as i64))
                .ok_or_else(|| ExprError::Type("int() conversion failed".to_string()))
        }
        "float" => {
            arity(1)?;
            let n = match &args[0] {
                Value::String(s) => s.trim().parse::<f64>().ok(),
                other => as_number(other),
            };
            n.and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
                .ok_or_else(|| ExprError::Type("float() conversion failed".to_string()))
        }
        "str" => {
            arity(1)?;
            let s = match &args[0] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok(Value::String(s))
        }
        _ => Err(ExprError::UnknownFunction(name.to_string())),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Evaluate an expression against a variable scope.
pub fn evaluate(expression: &str, scope: &BTreeMap<String, Value>) -> Result<Value, ExprError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(ExprError::Syntax { offset: 0, message: "empty expression".to_string() });
    }
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_expr(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Syntax {
            offset: parser.offset(),
            message: "trailing input after expression".to_string(),
        });
    }
    eval(&ast, scope)
}

/// Evaluate an expression to a boolean via truthiness.
pub fn evaluate_bool(
    expression: &str,
    scope: &BTreeMap<String, Value>,
) -> Result<bool, ExprError> {
    evaluate(expression, scope).map(|v| truthy(&v))
}

/// Convenience scope builder from a JSON object.
pub fn scope_from_object(value: &Value) -> BTreeMap<String, Value> {
    value
        .as_object()
        .map(|m: &Map<String, Value>| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_comparisons() {
        let s = scope(&[("x", json!(5))]);
        assert!(!evaluate_bool("x > 10", &s).unwrap());
        assert!(evaluate_bool("x > 1 and x < 10", &s).unwrap());
        assert!(evaluate_bool("x == 5", &s).unwrap());
        assert!(evaluate_bool("x != 4", &s).unwrap());
        assert!(evaluate_bool("x >= 5 and x <= 5", &s).unwrap());
    }

    #[test]
    fn test_arithmetic() {
        let s = scope(&[("a", json!(7)), ("b", json!(2))]);
        assert_eq!(evaluate("a + b", &s).unwrap(), json!(9));
        assert_eq!(evaluate("a % b", &s).unwrap(), json!(1));
        assert_eq!(evaluate("a / b", &s).unwrap(), json!(3.5));
        assert_eq!(evaluate("-a + 1", &s).unwrap(), json!(-6));
        assert_eq!(evaluate_bool("a * b > 10", &s), Ok(true));
    }

    #[test]
    fn test_division_by_zero_errors() {
        assert_eq!(evaluate("1 / 0", &scope(&[])), Err(ExprError::DivisionByZero));
    }

    #[test]
    fn test_membership() {
        let s = scope(&[("tags", json!(["a", "b"])), ("name", json!("dipeo"))]);
        assert!(evaluate_bool("'a' in tags", &s).unwrap());
        assert!(evaluate_bool("'z' not in tags", &s).unwrap());
        assert!(evaluate_bool("'pe' in name", &s).unwrap());
        assert!(evaluate_bool("'x' in [1, 'x']", &s).unwrap());
    }

    #[test]
    fn test_attribute_and_index_access() {
        let s = scope(&[("user", json!({"profile": {"age": 30}, "roles": ["admin"]}))]);
        assert!(evaluate_bool("user.profile.age >= 18", &s).unwrap());
        assert_eq!(evaluate("user.roles[0]", &s).unwrap(), json!("admin"));
        // Missing attributes resolve to null, not an error.
        assert!(!evaluate_bool("user.profile.missing", &s).unwrap());
    }

    #[test]
    fn test_whitelisted_functions() {
        let s = scope(&[("items", json!([1, 2, 3]))]);
        assert_eq!(evaluate("len(items)", &s).unwrap(), json!(3));
        assert_eq!(evaluate("sum(items)", &s).unwrap(), json!(6));
        assert_eq!(evaluate("min(items)", &s).unwrap(), json!(1));
        assert_eq!(evaluate("max(4, 9)", &s).unwrap(), json!(9));
        assert_eq!(evaluate("abs(0 - 4)", &s).unwrap(), json!(4));
        assert!(evaluate_bool("all(items)", &s).unwrap());
        assert!(evaluate_bool("any([0, 1])", &s).unwrap());
        assert_eq!(evaluate("int('42')", &s).unwrap(), json!(42));
        assert_eq!(evaluate("str(42)", &s).unwrap(), json!("42"));
    }

    #[test]
    fn test_unlisted_function_is_rejected() {
        assert_eq!(
            evaluate("open('/etc/passwd')", &scope(&[])),
            Err(ExprError::UnknownFunction("open".to_string()))
        );
        assert_eq!(
            evaluate("eval('1')", &scope(&[])),
            Err(ExprError::UnknownFunction("eval".to_string()))
        );
    }

    #[test]
    fn test_syntax_errors_are_rejected() {
        assert!(matches!(evaluate("x >", &scope(&[])), Err(ExprError::Syntax { .. })));
        assert!(matches!(evaluate("(1 + 2", &scope(&[])), Err(ExprError::Syntax { .. })));
        assert!(matches!(evaluate("1 2", &scope(&[])), Err(ExprError::Syntax { .. })));
        assert!(matches!(evaluate("", &scope(&[])), Err(ExprError::Syntax { .. })));
        assert!(matches!(evaluate("x @ y", &scope(&[])), Err(ExprError::Syntax { .. })));
    }

    #[test]
    fn test_unknown_variable_is_null() {
        assert!(!evaluate_bool("missing", &scope(&[])).unwrap());
        assert!(evaluate_bool("missing == null", &scope(&[])).unwrap());
    }

    #[test]
    fn test_short_circuit() {
        // The right side would error (division by zero) if evaluated.
        let s = scope(&[]);
        assert!(!evaluate_bool("false and (1 / 0)", &s).unwrap());
        assert!(evaluate_bool("true or (1 / 0)", &s).unwrap());
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(!truthy(&json!({})));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([0])));
        assert!(truthy(&json!(0.5)));
    }
}
