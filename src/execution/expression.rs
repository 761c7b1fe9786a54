//! Conditions and Policy Expressions
//!
//! The expression language belongs to the workflow compiler; the engine
//! only needs boolean answers, so evaluation sits behind [`Evaluator`].
//! [`BasicEvaluator`] understands the status vocabulary the compiler emits
//! (`passed`, `failed`, step references, `!`, `&&`, `||`, parentheses).

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use super::state::StepStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("expression is empty")]
    Empty,

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),
}

/// Values an expression can refer to.
#[derive(Debug, Clone, Copy)]
pub struct ExprContext<'a> {
    /// Status the bare `passed`/`failed` keywords test
    pub status: StepStatus,
    /// Status of every known step
    pub steps: &'a HashMap<String, StepStatus>,
}

/// Boolean expression evaluation.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expr: &str, ctx: &ExprContext<'_>) -> Result<bool, ExpressionError>;

    /// Rejects expressions that can never evaluate, before anything runs.
    /// Symbols are not resolved: steps may not exist yet.
    fn check(&self, _expr: &str) -> Result<(), ExpressionError> {
        Ok(())
    }
}

/// Default evaluator for status expressions.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicEvaluator;

impl Evaluator for BasicEvaluator {
    fn evaluate(&self, expr: &str, ctx: &ExprContext<'_>) -> Result<bool, ExpressionError> {
        parse(expr, Some(ctx))
    }

    fn check(&self, expr: &str) -> Result<(), ExpressionError> {
        parse(expr, None).map(|_| ())
    }
}

/// Parses and evaluates `expr`. Without a context every symbol is false.
fn parse(expr: &str, ctx: Option<&ExprContext<'_>>) -> Result<bool, ExpressionError> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Err(ExpressionError::Empty);
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        ctx,
    };
    let value = parser.or()?;
    match parser.tokens.get(parser.pos) {
        None => Ok(value),
        Some(token) => Err(ExpressionError::UnexpectedToken(token.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Not,
    And,
    Or,
    Open,
    Close,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Ident(s) => f.write_str(s),
            Token::Not => f.write_str("!"),
            Token::And => f.write_str("&&"),
            Token::Or => f.write_str("||"),
            Token::Open => f.write_str("("),
            Token::Close => f.write_str(")"),
        }
    }
}

fn tokenize(expr: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '&' | '|' => {
                chars.next();
                if chars.next() != Some(c) {
                    return Err(ExpressionError::UnexpectedToken(c.to_string()));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
            }
            c if is_ident_char(c) => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek().filter(|c| is_ident_char(**c)) {
                    ident.push(c);
                    chars.next();
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(ExpressionError::UnexpectedToken(other.to_string())),
        }
    }
    Ok(tokens)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '<' | '>')
}

struct Parser<'t, 'c> {
    tokens: &'t [Token],
    pos: usize,
    ctx: Option<&'t ExprContext<'c>>,
}

impl Parser<'_, '_> {
    fn or(&mut self) -> Result<bool, ExpressionError> {
        let mut value = self.and()?;
        while self.eat(&Token::Or) {
            let rhs = self.and()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn and(&mut self) -> Result<bool, ExpressionError> {
        let mut value = self.unary()?;
        while self.eat(&Token::And) {
            let rhs = self.unary()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<bool, ExpressionError> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(!self.unary()?)
            }
            Some(Token::Open) => {
                self.pos += 1;
                let value = self.or()?;
                if !self.eat(&Token::Close) {
                    return Err(ExpressionError::UnexpectedEnd);
                }
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                self.atom(&name)
            }
            Some(other) => Err(ExpressionError::UnexpectedToken(other.to_string())),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.tokens.get(self.pos) == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn atom(&self, name: &str) -> Result<bool, ExpressionError> {
        match name {
            "true" | "always" => return Ok(true),
            "false" | "never" => return Ok(false),
            _ => {}
        }
        let Some(ctx) = self.ctx else {
            return Ok(false);
        };
        if let Some(value) = status_keyword(name, ctx.status) {
            return Ok(value);
        }
        if let Some(status) = ctx.steps.get(name) {
            return Ok(status.is_success());
        }
        if let Some((reference, keyword)) = name.rsplit_once('.') {
            if let Some(status) = ctx.steps.get(reference) {
                if let Some(value) = status_keyword(keyword, *status) {
                    return Ok(value);
                }
            }
        }
        Err(ExpressionError::UnknownSymbol(name.to_string()))
    }
}

fn status_keyword(keyword: &str, status: StepStatus) -> Option<bool> {
    let value = match keyword {
        "passed" | "success" => status.is_success(),
        "failed" | "failure" | "error" => status.is_failure(),
        "timeout" => status == StepStatus::Timeout,
        "aborted" => status == StepStatus::Aborted,
        "skipped" => status == StepStatus::Skipped,
        "running" => status == StepStatus::Running,
        _ => return None,
    };
    Some(value)
}

/// Parses a timeout expression such as `30s`, `1h30m`, `250ms` or a bare
/// number of seconds.
pub fn parse_duration(expr: &str) -> Result<Duration, ExpressionError> {
    let trimmed = expr.trim();
    let invalid = || ExpressionError::InvalidDuration(expr.to_string());
    if trimmed.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let amount: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount * 60),
            "h" => Duration::from_secs(amount * 3600),
            _ => return Err(invalid()),
        };
        total += unit;
        rest = &rest[unit_len..];
    }
    Ok(total)
}
