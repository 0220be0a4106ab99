//! Case rule expressions.
//!
//! A rule is a boolean expression over the JSON view of a request, e.g.
//! `json("id") == 5 && user.name =~ "^a"`. Rules are compiled once when a
//! snapshot is built; evaluation only walks the tree.
//!
//! Paths address the request by field name (`a.b`), list index (`a.0`) and
//! list length (`a.#`). A literal dot inside a key is written `\.`.

mod eval;
mod lexer;
mod parser;

use serde_json::Value as Json;
use std::fmt;
use thiserror::Error;

use eval::{Evaluator, Val};
use parser::{Expr, Parser};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuleError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("evaluation failed: {message}")]
    Eval { message: String },
}

/// A compiled rule expression.
#[derive(Clone)]
pub struct Rule {
    source: String,
    expr: Expr,
}

impl Rule {
    /// Parse `source` into an expression tree.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::Syntax` for lexical or grammar errors, including
    /// regex literals that fail to compile.
    pub fn compile(source: &str) -> Result<Self, RuleError> {
        let tokens = lexer::tokenize(source)?;
        let expr = Parser::new(tokens, source.len()).parse()?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a request view. Non-boolean results are errors.
    pub fn evaluate(&self, request: &Json) -> Result<bool, RuleError> {
        match Evaluator::new(request).eval(&self.expr)? {
            Val::Bool(b) => Ok(b),
            other => Err(RuleError::Eval {
                message: format!("rule produced {other:?}, expected bool"),
            }),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Rule").field(&self.source).finish()
    }
}
