//! Precedence-climbing parser producing an [`Expr`] tree.

use regex::Regex;

use super::RuleError;
use super::lexer::{Spanned, Token};

#[derive(Debug, Clone)]
pub(crate) enum Expr {
    Literal(Literal),
    /// Variable path, already split into unescaped segments.
    Path(Vec<String>),
    List(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `=~` against a pattern known at compile time.
    Regex(Box<Expr>, Regex),
    Call(Function, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Function {
    Json,
    Has,
    Len,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "json" => Some(Self::Json),
            "has" => Some(Self::Has),
            "len" => Some(Self::Len),
            _ => None,
        }
    }
}

/// Split a path on unescaped dots, restoring `\.` to a literal dot.
pub(crate) fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'.') => {
                current.push('.');
                chars.next();
            }
            '.' => segments.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    segments.push(current);
    segments
}

pub(crate) struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
}

impl Parser {
    pub(crate) fn new(tokens: Vec<Spanned>, source_len: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            end: source_len,
        }
    }

    pub(crate) fn parse(mut self) -> Result<Expr, RuleError> {
        let expr = self.expression(0)?;
        match self.tokens.get(self.pos) {
            None => Ok(expr),
            Some(extra) => Err(RuleError::Syntax {
                position: extra.pos,
                message: format!("unexpected trailing {:?}", extra.token),
            }),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |s| s.pos)
    }

    fn error(&self, message: impl Into<String>) -> RuleError {
        RuleError::Syntax {
            position: self.position(),
            message: message.into(),
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), RuleError> {
        if self.peek() == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {token:?}")))
        }
    }

    fn infix(&self) -> Option<(BinaryOp, u8)> {
        let op = match self.peek()? {
            Token::Or => (BinaryOp::Or, 1),
            Token::And => (BinaryOp::And, 2),
            Token::Eq => (BinaryOp::Eq, 3),
            Token::Ne => (BinaryOp::Ne, 3),
            Token::Lt => (BinaryOp::Lt, 3),
            Token::Le => (BinaryOp::Le, 3),
            Token::Gt => (BinaryOp::Gt, 3),
            Token::Ge => (BinaryOp::Ge, 3),
            Token::Match => (BinaryOp::Match, 3),
            Token::In => (BinaryOp::In, 3),
            Token::Plus => (BinaryOp::Add, 4),
            Token::Minus => (BinaryOp::Sub, 4),
            Token::Star => (BinaryOp::Mul, 5),
            Token::Slash => (BinaryOp::Div, 5),
            Token::Percent => (BinaryOp::Rem, 5),
            _ => return None,
        };
        Some(op)
    }

    fn expression(&mut self, min_prec: u8) -> Result<Expr, RuleError> {
        let mut lhs = self.unary()?;
        while let Some((op, prec)) = self.infix() {
            if prec <= min_prec {
                break;
            }
            let op_pos = self.position();
            self.pos += 1;
            let rhs = self.expression(prec)?;
            lhs = match (op, rhs) {
                (BinaryOp::Match, Expr::Literal(Literal::Str(pattern))) => {
                    let regex = Regex::new(&pattern).map_err(|e| RuleError::Syntax {
                        position: op_pos,
                        message: format!("invalid regex: {e}"),
                    })?;
                    Expr::Regex(Box::new(lhs), regex)
                }
                (op, rhs) => Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, RuleError> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)))
            }
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(match self.unary()? {
                    Expr::Literal(Literal::Int(v)) => Expr::Literal(Literal::Int(-v)),
                    Expr::Literal(Literal::Float(v)) => Expr::Literal(Literal::Float(-v)),
                    other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
                })
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, RuleError> {
        let Some(token) = self.peek().cloned() else {
            return Err(self.error("unexpected end of expression"));
        };
        self.pos += 1;
        match token {
            Token::Int(v) => Ok(Expr::Literal(Literal::Int(v))),
            Token::Float(v) => Ok(Expr::Literal(Literal::Float(v))),
            Token::Str(s) => Ok(Expr::Literal(Literal::Str(s))),
            Token::True => Ok(Expr::Literal(Literal::Bool(true))),
            Token::False => Ok(Expr::Literal(Literal::Bool(false))),
            Token::Null => Ok(Expr::Literal(Literal::Null)),
            Token::LBracket => Ok(Expr::List(self.items(Token::RBracket)?)),
            Token::LParen => {
                let mut items = self.items(Token::RParen)?;
                if items.len() == 1 {
                    Ok(items.remove(0))
                } else {
                    Ok(Expr::List(items))
                }
            }
            Token::Ident(name) if self.peek() == Some(&Token::LParen) => {
                self.pos -= 1;
                let function = Function::lookup(&name)
                    .ok_or_else(|| self.error(format!("unknown function {name:?}")))?;
                self.pos += 2;
                let args = self.items(Token::RParen)?;
                self.call(function, args)
            }
            Token::Ident(name) => Ok(Expr::Path(split_path(&name))),
            other => {
                self.pos -= 1;
                Err(self.error(format!("unexpected {other:?}")))
            }
        }
    }

    /// Comma-separated expressions up to `close`, which is consumed.
    fn items(&mut self, close: Token) -> Result<Vec<Expr>, RuleError> {
        let mut items = Vec::new();
        if self.peek() == Some(&close) {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(self.expression(0)?);
            if self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                continue;
            }
            self.expect(close)?;
            return Ok(items);
        }
    }

    fn call(&self, function: Function, mut args: Vec<Expr>) -> Result<Expr, RuleError> {
        if args.len() != 1 {
            return Err(self.error(format!("{function:?} takes exactly one argument")));
        }
        // Literal paths are split once here rather than on every evaluation.
        match (function, args.remove(0)) {
            (Function::Json, Expr::Literal(Literal::Str(path))) => Ok(Expr::Path(split_path(&path))),
            (function, arg) => Ok(Expr::Call(function, vec![arg])),
        }
    }
}
