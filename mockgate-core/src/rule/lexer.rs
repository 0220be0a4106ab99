//! Tokenizer for rule expressions.

use super::RuleError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    /// Identifier or dotted variable path, escapes still in place.
    Ident(String),
    True,
    False,
    Null,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Or,
    And,
    Not,
    In,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

/// A token and the byte offset it starts at.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub pos: usize,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, RuleError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let peek = chars.get(i + 1).map(|(_, c)| *c);
        let (token, width) = match (c, peek) {
            ('|', Some('|')) => (Token::Or, 2),
            ('&', Some('&')) => (Token::And, 2),
            ('=', Some('=')) => (Token::Eq, 2),
            ('=', Some('~')) => (Token::Match, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('!', _) => (Token::Not, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('"' | '\'', _) => {
                let (text, consumed) = string_literal(&chars, i, source)?;
                (Token::Str(text), consumed)
            }
            (c, _) if c.is_ascii_digit() => {
                let (token, consumed) = number(&chars, i, source)?;
                (token, consumed)
            }
            (c, _) if c.is_alphabetic() || c == '_' => {
                let (text, consumed) = identifier(&chars, i);
                let token = match text.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" | "nil" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    _ => Token::Ident(text),
                };
                (token, consumed)
            }
            (c, _) => {
                return Err(RuleError::Syntax {
                    position: pos,
                    message: format!("unexpected character {c:?}"),
                });
            }
        };
        tokens.push(Spanned { token, pos });
        i += width;
    }
    Ok(tokens)
}

fn string_literal(chars: &[(usize, char)], start: usize, source: &str) -> Result<(String, usize), RuleError> {
    let quote = chars[start].1;
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            return Ok((out, i - start + 1));
        }
        if c == '\\' {
            match chars.get(i + 1).map(|(_, c)| *c) {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('\\') => out.push('\\'),
                Some(q @ ('"' | '\'')) => out.push(q),
                // Any other escape (notably `\.` in paths) is kept verbatim.
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => break,
            }
            i += 2;
            continue;
        }
        out.push(c);
        i += 1;
    }
    Err(RuleError::Syntax {
        position: chars[start].0,
        message: format!("unterminated string in {source:?}"),
    })
}

fn number(chars: &[(usize, char)], start: usize, source: &str) -> Result<(Token, usize), RuleError> {
    let mut i = start;
    let mut is_float = false;
    while i < chars.len() {
        let c = chars[i].1;
        if c.is_ascii_digit() {
            i += 1;
        } else if c == '.' && !is_float && chars.get(i + 1).is_some_and(|(_, d)| d.is_ascii_digit()) {
            is_float = true;
            i += 1;
        } else if (c == 'e' || c == 'E') && i > start {
            is_float = true;
            i += 1;
            if chars.get(i).is_some_and(|(_, s)| *s == '+' || *s == '-') {
                i += 1;
            }
        } else {
            break;
        }
    }
    let begin = chars[start].0;
    let end = chars.get(i).map_or(source.len(), |(p, _)| *p);
    let text = &source[begin..end];
    let invalid = || RuleError::Syntax {
        position: begin,
        message: format!("invalid number {text:?}"),
    };
    let token = if is_float {
        Token::Float(text.parse().map_err(|_| invalid())?)
    } else {
        match text.parse::<i64>() {
            Ok(v) => Token::Int(v),
            // Beyond i64 range: keep magnitude as a float.
            Err(_) => Token::Float(text.parse().map_err(|_| invalid())?),
        }
    };
    Ok((token, i - start))
}

fn identifier(chars: &[(usize, char)], start: usize) -> (String, usize) {
    let mut out = String::new();
    let mut i = start;
    while i < chars.len() {
        let c = chars[i].1;
        if c.is_alphanumeric() || c == '_' || c == '.' || c == '#' {
            out.push(c);
            i += 1;
        } else if c == '\\' && chars.get(i + 1).is_some_and(|(_, n)| *n == '.') {
            out.push_str("\\.");
            i += 2;
        } else {
            break;
        }
    }
    (out, i - start)
}
