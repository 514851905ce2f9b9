//! Sandboxed condition expressions.
//!
//! The language is deliberately small:
//!
//! ```text
//! expr    := or
//! or      := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | compare
//! compare := primary (("==" | "!=" | "<" | "<=" | ">" | ">=") primary)?
//! primary := number | string | true | false | null | path | "(" expr ")"
//! path    := ["$"] ident ("." ident | "[" digits "]")*
//! ```
//!
//! Paths read from the evaluation scope; unknown paths are `null`. Nothing
//! else (calls, assignment, arithmetic) is expressible.

use super::resolve::get_path;
use crate::errors::ExpressionError;
use std::cmp::Ordering;

/// Maximum nesting of unary operators and parentheses.
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    LParen,
    RParen,
    Not,
    And,
    Or,
    Cmp(CmpOp),
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(serde_json::Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

fn syntax(position: usize, reason: impl Into<String>) -> ExpressionError {
    ExpressionError::Syntax {
        position,
        reason: reason.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        let next = chars.get(i + 1).map(|&(_, c)| c);

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let (token, width) = match (c, next) {
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('=', Some('=')) => (Token::Cmp(CmpOp::Eq), 2),
            ('!', Some('=')) => (Token::Cmp(CmpOp::Ne), 2),
            ('<', Some('=')) => (Token::Cmp(CmpOp::Le), 2),
            ('>', Some('=')) => (Token::Cmp(CmpOp::Ge), 2),
            ('<', _) => (Token::Cmp(CmpOp::Lt), 1),
            ('>', _) => (Token::Cmp(CmpOp::Gt), 1),
            ('!', _) => (Token::Not, 1),
            ('"' | '\'', _) => {
                let mut value = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => return Err(syntax(pos, "unterminated string")),
                        Some(&(_, ch)) if ch == c => break,
                        Some(&(_, '\\')) => {
                            let Some(&(_, escaped)) = chars.get(j + 1) else {
                                return Err(syntax(pos, "unterminated string"));
                            };
                            value.push(escaped);
                            j += 2;
                        }
                        Some(&(_, ch)) => {
                            value.push(ch);
                            j += 1;
                        }
                    }
                }
                (Token::Str(value), j + 1 - i)
            }
            (c, _) if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let mut j = i + 1;
                while chars
                    .get(j)
                    .is_some_and(|&(_, ch)| ch.is_ascii_digit() || ch == '.')
                {
                    j += 1;
                }
                let end = chars.get(j).map_or(input.len(), |&(p, _)| p);
                let number = input[pos..end]
                    .parse::<f64>()
                    .map_err(|_| syntax(pos, format!("invalid number '{}'", &input[pos..end])))?;
                (Token::Number(number), j - i)
            }
            (c, _) if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut j = i + 1;
                let mut depth = 0usize;
                while let Some(&(_, ch)) = chars.get(j) {
                    let accepted = match ch {
                        '[' => {
                            depth += 1;
                            true
                        }
                        ']' if depth > 0 => {
                            depth -= 1;
                            true
                        }
                        ch if depth > 0 => ch != ']',
                        ch => ch.is_alphanumeric() || ch == '_' || ch == '.',
                    };
                    if !accepted {
                        break;
                    }
                    j += 1;
                }
                if depth > 0 {
                    return Err(syntax(pos, "unclosed '['"));
                }
                let end = chars.get(j).map_or(input.len(), |&(p, _)| p);
                let word = &input[pos..end];
                let token = match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word.trim_start_matches('$').to_string()),
                };
                (token, j - i)
            }
            _ => return Err(syntax(pos, format!("unexpected character '{c}'"))),
        };

        tokens.push((pos, token));
        i += width;
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(p, _)| *p)
    }

    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExpressionError::TooDeep { max: MAX_DEPTH });
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.primary()?;
        if let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let position = self.position();
        let Some((_, token)) = self.tokens.get(self.pos).cloned() else {
            return Err(syntax(position, "unexpected end of expression"));
        };
        self.pos += 1;
        let expr = match token {
            Token::Number(n) => Expr::Literal(serde_json::json!(n)),
            Token::Str(s) => Expr::Literal(serde_json::Value::String(s)),
            Token::True => Expr::Literal(serde_json::Value::Bool(true)),
            Token::False => Expr::Literal(serde_json::Value::Bool(false)),
            Token::Null => Expr::Literal(serde_json::Value::Null),
            Token::Ident(path) => Expr::Path(path),
            Token::LParen => {
                self.descend()?;
                let inner = self.or()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(syntax(self.position(), "expected ')'"));
                }
                self.pos += 1;
                self.depth -= 1;
                inner
            }
            other => return Err(syntax(position, format!("unexpected token {other:?}"))),
        };
        Ok(expr)
    }
}

fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn loosely_equal(left: &serde_json::Value, right: &serde_json::Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn order(left: &serde_json::Value, right: &serde_json::Value) -> Result<Ordering, ExpressionError> {
    let ordering = match (left, right) {
        (serde_json::Value::Number(a), serde_json::Value::Number(b)) => {
            a.as_f64().partial_cmp(&b.as_f64())
        }
        (serde_json::Value::String(a), serde_json::Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    ordering.ok_or_else(|| ExpressionError::Incomparable {
        left: type_name(left).to_string(),
        right: type_name(right).to_string(),
    })
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// Parses an expression.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Syntax`] for malformed input and
    /// [`ExpressionError::TooDeep`] past [`MAX_DEPTH`] nesting levels.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let mut parser = Parser {
            tokens: tokenize(source)?,
            pos: 0,
            end: source.len(),
            depth: 0,
        };
        let root = parser.or()?;
        if parser.pos < parser.tokens.len() {
            return Err(syntax(parser.position(), "unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Returns the source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates to a boolean against `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Incomparable`] when an ordering comparison
    /// mixes types.
    pub fn evaluate(&self, scope: &serde_json::Value) -> Result<bool, ExpressionError> {
        eval(&self.root, scope).map(|v| truthy(&v))
    }
}

fn eval(expr: &Expr, scope: &serde_json::Value) -> Result<serde_json::Value, ExpressionError> {
    let value = match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path(path) => get_path(scope, path).cloned().unwrap_or(serde_json::Value::Null),
        Expr::Not(inner) => serde_json::Value::Bool(!truthy(&eval(inner, scope)?)),
        Expr::And(l, r) => {
            serde_json::Value::Bool(truthy(&eval(l, scope)?) && truthy(&eval(r, scope)?))
        }
        Expr::Or(l, r) => {
            serde_json::Value::Bool(truthy(&eval(l, scope)?) || truthy(&eval(r, scope)?))
        }
        Expr::Compare(op, l, r) => {
            let (left, right) = (eval(l, scope)?, eval(r, scope)?);
            let result = match op {
                CmpOp::Eq => loosely_equal(&left, &right),
                CmpOp::Ne => !loosely_equal(&left, &right),
                CmpOp::Lt => order(&left, &right)? == Ordering::Less,
                CmpOp::Le => order(&left, &right)? != Ordering::Greater,
                CmpOp::Gt => order(&left, &right)? == Ordering::Greater,
                CmpOp::Ge => order(&left, &right)? != Ordering::Less,
            };
            serde_json::Value::Bool(result)
        }
    };
    Ok(value)
}

/// Parses and evaluates in one go.
///
/// # Errors
///
/// See [`Expression::parse`] and [`Expression::evaluate`].
pub fn evaluate(source: &str, scope: &serde_json::Value) -> Result<bool, ExpressionError> {
    Expression::parse(source)?.evaluate(scope)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> serde_json::Value {
        serde_json::json!({
            "score": 0.82,
            "count": 3,
            "status": "ready",
            "user": {"roles": ["admin", "dev"], "active": true},
            "empty": ""
        })
    }

    #[test]
    fn test_comparisons() {
        let s = scope();
        assert!(evaluate("score > 0.8", &s).unwrap());
        assert!(evaluate("count >= 3 && count <= 3", &s).unwrap());
        assert!(evaluate("count == 3.0", &s).unwrap());
        assert!(evaluate("status == 'ready'", &s).unwrap());
        assert!(evaluate("status != \"done\"", &s).unwrap());
        assert!(!evaluate("count < -1", &s).unwrap());
    }

    #[test]
    fn test_paths_and_dollar_prefix() {
        let s = scope();
        assert!(evaluate("user.roles[0] == 'admin'", &s).unwrap());
        assert!(evaluate("$user.active", &s).unwrap());
        assert!(evaluate("missing == null", &s).unwrap());
        assert!(!evaluate("missing", &s).unwrap());
    }

    #[test]
    fn test_logic_and_grouping() {
        let s = scope();
        assert!(evaluate("!(count > 5) && (empty || status == 'ready')", &s).unwrap());
        assert!(evaluate("false || true && true", &s).unwrap());
        assert!(!evaluate("!!empty", &s).unwrap());
    }

    #[test]
    fn test_code_is_not_executable() {
        let s = scope();
        assert!(matches!(
            evaluate("process.exit(1)", &s),
            Err(ExpressionError::Syntax { .. })
        ));
        assert!(matches!(evaluate("count = 4", &s), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(evaluate("count + 1 > 2", &s), Err(ExpressionError::Syntax { .. })));
    }

    #[test]
    fn test_syntax_errors_report_position() {
        let err = Expression::parse("count > ").unwrap_err();
        assert_eq!(
            err,
            ExpressionError::Syntax {
                position: 8,
                reason: "unexpected end of expression".to_string()
            }
        );
        assert!(Expression::parse("(count > 1").is_err());
        assert!(Expression::parse("'open").is_err());
        assert!(Expression::parse("count > 1 2").is_err());
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}true{}", "(".repeat(MAX_DEPTH + 1), ")".repeat(MAX_DEPTH + 1));
        assert_eq!(
            Expression::parse(&deep).unwrap_err(),
            ExpressionError::TooDeep { max: MAX_DEPTH }
        );
        let ok = format!("{}true{}", "(".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH));
        assert!(evaluate(&ok, &scope()).unwrap());
    }

    #[test]
    fn test_incomparable_types() {
        let err = evaluate("status > 1", &scope()).unwrap_err();
        assert_eq!(
            err,
            ExpressionError::Incomparable {
                left: "string".to_string(),
                right: "number".to_string()
            }
        );
    }
}
