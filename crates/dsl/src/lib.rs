//! Side-effect-free boolean expression language for rule conditions.
//!
//! Expressions compare context attributes against literals and combine
//! comparisons with `and`/`or`/`not`:
//!
//! ```
//! use dsl::Evaluator;
//! use warden_core::model::Context;
//!
//! let mut ctx = Context::default();
//! ctx.user_id = Some("user123".into());
//! ctx.prompt_length = Some(1500);
//!
//! let eval = Evaluator::new();
//! assert!(eval.evaluate("user_id == 'user123' and prompt_length > 1000", &ctx).unwrap());
//! assert!(eval.evaluate("", &ctx).unwrap());
//! ```
//!
//! Unresolved identifiers evaluate to null rather than failing, so rules can
//! reference attributes a given request does not carry.

#![deny(unsafe_code)]

mod lexer;
mod parser;
mod value;

pub use parser::{CmpOp, Expr};
pub use value::Value;

use lexer::tokenize;
use regex::Regex;
use warden_core::error::RuleError;
use warden_core::model::Context;

/// Parses and evaluates condition expressions against a [`Context`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Evaluator;

impl Evaluator {
    /// Construct an evaluator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Evaluate `expression` against `ctx`.
    ///
    /// An empty or whitespace expression is true. Malformed expressions and
    /// runtime comparison failures both yield a DSL syntax error (`E001`)
    /// carrying the offending expression.
    pub fn evaluate(&self, expression: &str, ctx: &Context) -> Result<bool, RuleError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Ok(true);
        }
        let tokens = tokenize(trimmed).map_err(|m| RuleError::dsl(m, expression))?;
        let expr = parser::parse(&tokens).map_err(|m| RuleError::dsl(m, expression))?;
        let value = eval_expr(&expr, ctx).map_err(|m| RuleError::dsl(m, expression))?;
        Ok(value.is_truthy())
    }

    /// Syntactically validate `expression` without a context.
    ///
    /// Returns an empty list for valid expressions. Never fails: every
    /// problem is reported as an issue string. At minimum, unbalanced
    /// parentheses, empty operands around `and`/`or`, and a dangling `not`
    /// are detected.
    #[must_use]
    pub fn validate_expression(&self, expression: &str) -> Vec<String> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let mut issues = Vec::new();
        if !parens_balanced(trimmed) {
            issues.push("Unbalanced parentheses".to_string());
        }

        let tokens = match tokenize(trimmed) {
            Ok(tokens) => tokens,
            Err(message) => {
                issues.push(message);
                return issues;
            }
        };

        use lexer::Token;
        for (i, tok) in tokens.iter().enumerate() {
            match tok {
                Token::And | Token::Or => {
                    let name = if *tok == Token::And { "and" } else { "or" };
                    let left_empty = i == 0
                        || matches!(
                            tokens[i - 1],
                            Token::And | Token::Or | Token::Not | Token::LParen | Token::Comma
                        );
                    let right_empty = i + 1 == tokens.len()
                        || matches!(
                            tokens[i + 1],
                            Token::And | Token::Or | Token::RParen | Token::Comma
                        );
                    if left_empty {
                        issues.push(format!("Empty operand on left side of '{name}'"));
                    }
                    if right_empty {
                        issues.push(format!("Empty operand on right side of '{name}'"));
                    }
                }
                Token::Not => {
                    let dangling = i + 1 == tokens.len()
                        || matches!(tokens[i + 1], Token::RParen | Token::And | Token::Or);
                    if dangling {
                        issues.push("Dangling 'not' with no operand".to_string());
                    }
                }
                _ => {}
            }
        }

        if issues.is_empty() {
            if let Err(message) = parser::parse(&tokens) {
                issues.push(message);
            }
        }
        issues
    }
}

/// Paren balance over the raw text, ignoring quoted strings.
fn parens_balanced(expr: &str) -> bool {
    let mut depth: i64 = 0;
    let mut quote: Option<char> = None;
    for c in expr.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        return false;
                    }
                }
                _ => {}
            },
        }
    }
    depth == 0
}

fn eval_expr(expr: &Expr, ctx: &Context) -> Result<Value, String> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => Ok(resolve(ctx, name)),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expr(item, ctx)?);
            }
            Ok(Value::List(out))
        }
        Expr::Not(inner) => Ok(Value::Bool(!eval_expr(inner, ctx)?.is_truthy())),
        Expr::And(lhs, rhs) => {
            if !eval_expr(lhs, ctx)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval_expr(rhs, ctx)?.is_truthy()))
        }
        Expr::Or(lhs, rhs) => {
            if eval_expr(lhs, ctx)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval_expr(rhs, ctx)?.is_truthy()))
        }
        Expr::Compare { op, lhs, rhs } => {
            let left = eval_expr(lhs, ctx)?;
            let right = eval_expr(rhs, ctx)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, String> {
    use std::cmp::Ordering;
    match op {
        CmpOp::Eq => Ok(left.loose_eq(right)),
        CmpOp::Ne => Ok(!left.loose_eq(right)),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ord = left.try_cmp(right).ok_or_else(|| {
                format!("Cannot order {} and {}", left.kind(), right.kind())
            })?;
            Ok(match op {
                CmpOp::Lt => ord == Ordering::Less,
                CmpOp::Le => ord != Ordering::Greater,
                CmpOp::Gt => ord == Ordering::Greater,
                CmpOp::Ge => ord != Ordering::Less,
                _ => unreachable!(),
            })
        }
        CmpOp::In => membership(left, right),
        CmpOp::NotIn => membership(left, right).map(|m| !m),
        CmpOp::Contains => containment(left, right),
        CmpOp::StartsWith => {
            Ok(left.to_display_string().starts_with(&right.to_display_string()))
        }
        CmpOp::EndsWith => Ok(left.to_display_string().ends_with(&right.to_display_string())),
        CmpOp::Matches => {
            let pattern = right.to_display_string();
            // Anchored at the start of the subject, like a prefix match.
            let re = Regex::new(&format!("^(?:{pattern})"))
                .map_err(|e| format!("Invalid pattern in 'matches': {e}"))?;
            Ok(re.is_match(&left.to_display_string()))
        }
    }
}

/// Membership of `left` in `right` (the `in` operator).
fn membership(left: &Value, right: &Value) -> Result<bool, String> {
    match right {
        Value::List(items) => Ok(items.iter().any(|item| item.loose_eq(left))),
        Value::Str(haystack) => match left {
            Value::Str(needle) => Ok(haystack.contains(needle.as_str())),
            other => Err(format!("Cannot search for {} in a string", other.kind())),
        },
        Value::Map(map) => match left {
            Value::Str(key) => Ok(map.contains_key(key)),
            other => Err(format!("Cannot search for {} in a map", other.kind())),
        },
        other => Err(format!("Right side of 'in' must be a list or string, got {}", other.kind())),
    }
}

/// Containment of `right` in `left` (the `contains` operator).
fn containment(left: &Value, right: &Value) -> Result<bool, String> {
    match left {
        Value::List(items) => Ok(items.iter().any(|item| item.loose_eq(right))),
        Value::Str(haystack) => match right {
            Value::Str(needle) => Ok(haystack.contains(needle.as_str())),
            other => Err(format!("Cannot search a string for {}", other.kind())),
        },
        Value::Map(map) => match right {
            Value::Str(key) => Ok(map.contains_key(key)),
            other => Err(format!("Cannot search a map for {}", other.kind())),
        },
        other => Err(format!("Left side of 'contains' must be a list or string, got {}", other.kind())),
    }
}

/// Resolve an identifier against the context: named field first, then a
/// `custom_attributes` key, then a dotted path rooted at either. Unresolved
/// identifiers yield null.
fn resolve(ctx: &Context, key: &str) -> Value {
    if let Some(v) = named_field(ctx, key) {
        return v;
    }
    if let Some(v) = ctx.custom_attributes.get(key) {
        return Value::from_json(v);
    }
    if key.contains('.') {
        let mut parts = key.split('.');
        let head = parts.next().unwrap_or_default();
        let mut current = match named_field(ctx, head) {
            Some(v) => v,
            None => match ctx.custom_attributes.get(head) {
                Some(v) => Value::from_json(v),
                None => return Value::Null,
            },
        };
        for part in parts {
            current = match current {
                Value::Map(map) => match map.get(part) {
                    Some(v) => Value::from_json(v),
                    None => return Value::Null,
                },
                _ => return Value::Null,
            };
        }
        return current;
    }
    Value::Null
}

fn named_field(ctx: &Context, key: &str) -> Option<Value> {
    let opt_str = |s: &Option<String>| {
        s.as_ref().map_or(Value::Null, |v| Value::Str(v.clone()))
    };
    match key {
        "user_id" => Some(opt_str(&ctx.user_id)),
        "project_id" => Some(opt_str(&ctx.project_id)),
        "session_id" => Some(opt_str(&ctx.session_id)),
        "model_name" => Some(opt_str(&ctx.model_name)),
        "timestamp" => Some(opt_str(&ctx.timestamp)),
        "prompt_length" => Some(ctx.prompt_length.map_or(Value::Null, Value::Int)),
        "custom_attributes" => Some(Value::Map(ctx.custom_attributes.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Context {
        let mut ctx = Context::default();
        ctx.user_id = Some("user123".into());
        ctx.project_id = Some("project456".into());
        ctx.model_name = Some("gpt-4".into());
        ctx.prompt_length = Some(1500);
        ctx.custom_attributes = serde_json::from_value(json!({
            "environment": "production",
            "user_role": "admin",
            "available_models": ["gpt-4", "gpt-3.5-turbo", "claude"],
            "user_clearance_level": 5
        }))
        .unwrap();
        ctx
    }

    #[test]
    fn resolution_prefers_named_fields() {
        assert_eq!(resolve(&ctx(), "user_id"), Value::Str("user123".into()));
        assert_eq!(resolve(&ctx(), "user_role"), Value::Str("admin".into()));
        assert_eq!(resolve(&ctx(), "missing_field"), Value::Null);
    }

    #[test]
    fn dotted_path_resolution() {
        assert_eq!(
            resolve(&ctx(), "custom_attributes.environment"),
            Value::Str("production".into())
        );
        assert_eq!(resolve(&ctx(), "custom_attributes.missing"), Value::Null);
        assert_eq!(resolve(&ctx(), "user_id.anything"), Value::Null);
    }

    #[test]
    fn validation_is_quiet_for_valid_input() {
        let eval = Evaluator::new();
        assert!(eval.validate_expression("user_id in ['a','b']").is_empty());
        assert!(eval.validate_expression("").is_empty());
        assert!(eval
            .validate_expression("(a == 1 and b == 2) or not c == 3")
            .is_empty());
    }

    #[test]
    fn validation_reports_the_three_minimum_cases() {
        let eval = Evaluator::new();
        let issues = eval.validate_expression("(user_id == 'x'");
        assert!(issues.iter().any(|i| i.to_lowercase().contains("parentheses")), "{issues:?}");

        let issues = eval.validate_expression("user_id == 'x' and ");
        assert!(issues.iter().any(|i| i.to_lowercase().contains("empty operand")), "{issues:?}");

        let issues = eval.validate_expression("user_id == 'x' and not");
        assert!(issues.iter().any(|i| i.to_lowercase().contains("not")), "{issues:?}");
    }
}
