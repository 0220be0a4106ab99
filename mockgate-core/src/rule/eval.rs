//! Evaluation of compiled expressions against a decoded request.

use regex::Regex;
use serde_json::Value as Json;
use std::cmp::Ordering;

use super::RuleError;
use super::parser::{BinaryOp, Expr, Function, Literal, UnaryOp, split_path};

/// Runtime value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Val {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Val>),
    Object(serde_json::Map<String, Json>),
}

impl Val {
    fn from_json(json: &Json) -> Val {
        match json {
            Json::Null => Val::Null,
            Json::Bool(b) => Val::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Val::Int(i),
                None => Val::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            // 64-bit fields render as decimal strings.
            Json::String(s) => match s.parse::<i64>() {
                Ok(i) => Val::Int(i),
                Err(_) => Val::Str(s.clone()),
            },
            Json::Array(items) => Val::List(items.iter().map(Val::from_json).collect()),
            Json::Object(map) => Val::Object(map.clone()),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Val::Null => "null",
            Val::Bool(_) => "bool",
            Val::Int(_) => "int",
            Val::Float(_) => "float",
            Val::Str(_) => "string",
            Val::List(_) => "list",
            Val::Object(_) => "object",
        }
    }
}

fn type_error(op: &str, lhs: &Val, rhs: &Val) -> RuleError {
    RuleError::Eval {
        message: format!("cannot apply {op} to {} and {}", lhs.type_name(), rhs.type_name()),
    }
}

/// Resolve a path of segments against the request root. Missing keys and
/// out-of-range indices resolve to `None`.
pub(crate) fn resolve<'a>(root: &'a Json, segments: &[String]) -> Option<Resolved<'a>> {
    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        match current {
            Json::Object(map) => current = map.get(segment)?,
            Json::Array(items) if segment == "#" && i + 1 == segments.len() => {
                return Some(Resolved::Length(items.len()));
            }
            Json::Array(items) => current = items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        }
    }
    Some(Resolved::Value(current))
}

pub(crate) enum Resolved<'a> {
    Value(&'a Json),
    Length(usize),
}

pub(crate) struct Evaluator<'a> {
    root: &'a Json,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(root: &'a Json) -> Self {
        Self { root }
    }

    pub(crate) fn eval(&self, expr: &Expr) -> Result<Val, RuleError> {
        match expr {
            Expr::Literal(literal) => Ok(match literal {
                Literal::Null => Val::Null,
                Literal::Bool(b) => Val::Bool(*b),
                Literal::Int(i) => Val::Int(*i),
                Literal::Float(f) => Val::Float(*f),
                Literal::Str(s) => Val::Str(s.clone()),
            }),
            Expr::Path(segments) => Ok(self.lookup(segments)),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Val::List),
            Expr::Unary(UnaryOp::Not, inner) => match self.eval(inner)? {
                Val::Bool(b) => Ok(Val::Bool(!b)),
                other => Err(RuleError::Eval {
                    message: format!("cannot negate {}", other.type_name()),
                }),
            },
            Expr::Unary(UnaryOp::Neg, inner) => match self.eval(inner)? {
                Val::Int(i) => i.checked_neg().map(Val::Int).ok_or_else(overflow),
                Val::Float(f) => Ok(Val::Float(-f)),
                other => Err(RuleError::Eval {
                    message: format!("cannot negate {}", other.type_name()),
                }),
            },
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                if !self.truth(lhs)? {
                    return Ok(Val::Bool(false));
                }
                Ok(Val::Bool(self.truth(rhs)?))
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                if self.truth(lhs)? {
                    return Ok(Val::Bool(true));
                }
                Ok(Val::Bool(self.truth(rhs)?))
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(*op, lhs, rhs)
            }
            Expr::Regex(lhs, regex) => match self.eval(lhs)? {
                Val::Str(s) => Ok(Val::Bool(regex.is_match(&s))),
                Val::Int(i) => Ok(Val::Bool(regex.is_match(&i.to_string()))),
                other => Err(RuleError::Eval {
                    message: format!("cannot match {} against a regex", other.type_name()),
                }),
            },
            Expr::Call(function, args) => {
                let arg = match args.first() {
                    Some(arg) => self.eval(arg)?,
                    None => Val::Null,
                };
                self.call(*function, arg)
            }
        }
    }

    fn truth(&self, expr: &Expr) -> Result<bool, RuleError> {
        match self.eval(expr)? {
            Val::Bool(b) => Ok(b),
            other => Err(RuleError::Eval {
                message: format!("expected bool, got {}", other.type_name()),
            }),
        }
    }

    fn lookup(&self, segments: &[String]) -> Val {
        match resolve(self.root, segments) {
            Some(Resolved::Value(json)) => Val::from_json(json),
            Some(Resolved::Length(n)) => Val::Int(n as i64),
            None => Val::Null,
        }
    }

    fn call(&self, function: Function, arg: Val) -> Result<Val, RuleError> {
        match (function, arg) {
            (Function::Json, Val::Str(path)) => Ok(self.lookup(&split_path(&path))),
            (Function::Has, Val::Str(path)) => Ok(Val::Bool(!matches!(
                self.lookup(&split_path(&path)),
                Val::Null
            ))),
            (Function::Len, Val::Str(s)) => Ok(Val::Int(s.chars().count() as i64)),
            (Function::Len, Val::List(items)) => Ok(Val::Int(items.len() as i64)),
            (Function::Len, Val::Object(map)) => Ok(Val::Int(map.len() as i64)),
            (Function::Len, Val::Null) => Ok(Val::Int(0)),
            (function, arg) => Err(RuleError::Eval {
                message: format!("{function:?} does not accept {}", arg.type_name()),
            }),
        }
    }
}

fn overflow() -> RuleError {
    RuleError::Eval {
        message: "integer overflow".into(),
    }
}

fn binary(op: BinaryOp, lhs: Val, rhs: Val) -> Result<Val, RuleError> {
    match op {
        BinaryOp::Eq => Ok(Val::Bool(equals(&lhs, &rhs))),
        BinaryOp::Ne => Ok(Val::Bool(!equals(&lhs, &rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&lhs, &rhs).ok_or_else(|| type_error("comparison", &lhs, &rhs))?;
            Ok(Val::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::In => match &rhs {
            Val::List(items) => Ok(Val::Bool(items.iter().any(|item| equals(&lhs, item)))),
            Val::Str(haystack) => match &lhs {
                Val::Str(needle) => Ok(Val::Bool(haystack.contains(needle.as_str()))),
                _ => Err(type_error("in", &lhs, &rhs)),
            },
            Val::Object(map) => match &lhs {
                Val::Str(key) => Ok(Val::Bool(map.contains_key(key))),
                _ => Err(type_error("in", &lhs, &rhs)),
            },
            _ => Err(type_error("in", &lhs, &rhs)),
        },
        BinaryOp::Match => match (&lhs, &rhs) {
            (Val::Str(s), Val::Str(pattern)) => {
                let regex = Regex::new(pattern).map_err(|e| RuleError::Eval {
                    message: format!("invalid regex: {e}"),
                })?;
                Ok(Val::Bool(regex.is_match(s)))
            }
            _ => Err(type_error("=~", &lhs, &rhs)),
        },
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, lhs, rhs)
        }
        BinaryOp::And | BinaryOp::Or => Err(type_error("logical operator", &lhs, &rhs)),
    }
}

fn equals(lhs: &Val, rhs: &Val) -> bool {
    match (lhs, rhs) {
        (Val::Int(a), Val::Float(b)) | (Val::Float(b), Val::Int(a)) => (*a as f64) == *b,
        (Val::Int(a), Val::Str(s)) | (Val::Str(s), Val::Int(a)) => s.parse::<i64>() == Ok(*a),
        (a, b) => a == b,
    }
}

fn compare(lhs: &Val, rhs: &Val) -> Option<Ordering> {
    match (lhs, rhs) {
        (Val::Int(a), Val::Int(b)) => Some(a.cmp(b)),
        (Val::Int(a), Val::Float(b)) => (*a as f64).partial_cmp(b),
        (Val::Float(a), Val::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Val::Float(a), Val::Float(b)) => a.partial_cmp(b),
        (Val::Str(a), Val::Str(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn arithmetic(op: BinaryOp, lhs: Val, rhs: Val) -> Result<Val, RuleError> {
    match (lhs, rhs) {
        (Val::Int(a), Val::Int(b)) => {
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div if b == 0 => return Err(division_by_zero()),
                BinaryOp::Div => a.checked_div(b),
                BinaryOp::Rem if b == 0 => return Err(division_by_zero()),
                _ => a.checked_rem(b),
            };
            result.map(Val::Int).ok_or_else(overflow)
        }
        (Val::Str(a), Val::Str(b)) if op == BinaryOp::Add => Ok(Val::Str(a + &b)),
        (lhs @ (Val::Int(_) | Val::Float(_)), rhs @ (Val::Int(_) | Val::Float(_))) => {
            let (a, b) = (as_float(&lhs), as_float(&rhs));
            Ok(Val::Float(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div if b == 0.0 => return Err(division_by_zero()),
                BinaryOp::Div => a / b,
                _ => return Err(type_error("%", &lhs, &rhs)),
            }))
        }
        (lhs, rhs) => Err(type_error("arithmetic", &lhs, &rhs)),
    }
}

fn as_float(v: &Val) -> f64 {
    match v {
        Val::Int(i) => *i as f64,
        Val::Float(f) => *f,
        _ => f64::NAN,
    }
}

fn division_by_zero() -> RuleError {
    RuleError::Eval {
        message: "division by zero".into(),
    }
}
