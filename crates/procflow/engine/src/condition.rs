//! Condition evaluator: pure `field operator literal` expressions
//!
//! Evaluates branch gates and condition nodes against the run context.
//! It is deterministic and side-effect-free — the engine may re-run
//! an evaluation idempotently. Malformed expressions evaluate to
//! `true` (fail-open): a broken gate must never dam a run.

use chrono::{DateTime, NaiveDate};
use procflow_types::RunContext;

/// Evaluates condition expressions; never errors, never panics
#[derive(Clone, Copy, Debug, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate an expression against the run context.
    ///
    /// Supported operators: `==`, `!=`, `>`, `<`. Ordering operators
    /// compare numerically first, then as dates; incomparable values
    /// compare false. An expression with no recognizable operator is
    /// fail-open `true`.
    pub fn evaluate(&self, expression: &str, context: &RunContext) -> bool {
        let verdict = self.evaluate_inner(expression, context);
        tracing::trace!(expression, verdict, "condition evaluated");
        verdict
    }

    fn evaluate_inner(&self, expression: &str, context: &RunContext) -> bool {
        let expression = expression.trim();
        if expression.is_empty() {
            return true;
        }

        // Two-character operators first, so `!=` never parses as `=`.
        if let Some((field, literal)) = expression.split_once("==") {
            let actual = context.get(field.trim()).unwrap_or_default();
            return actual == clean(literal);
        }
        if let Some((field, literal)) = expression.split_once("!=") {
            let actual = context.get(field.trim()).unwrap_or_default();
            return actual != clean(literal);
        }
        if let Some((field, literal)) = expression.split_once('>') {
            return match context.get(field.trim()) {
                Some(actual) => {
                    compare(&actual, &clean(literal)) == Some(std::cmp::Ordering::Greater)
                }
                None => false,
            };
        }
        if let Some((field, literal)) = expression.split_once('<') {
            return match context.get(field.trim()) {
                Some(actual) => {
                    compare(&actual, &clean(literal)) == Some(std::cmp::Ordering::Less)
                }
                None => false,
            };
        }

        // No recognizable operator: fail open.
        true
    }
}

fn clean(literal: &str) -> String {
    literal.trim().trim_matches('"').trim_matches('\'').to_string()
}

/// Order two values numerically, then as timestamps, then as dates.
/// `None` when no common interpretation exists.
fn compare(left: &str, right: &str) -> Option<std::cmp::Ordering> {
    if let (Ok(a), Ok(b)) = (left.parse::<f64>(), right.parse::<f64>()) {
        return a.partial_cmp(&b);
    }
    if let (Ok(a), Ok(b)) = (
        DateTime::parse_from_rfc3339(left),
        DateTime::parse_from_rfc3339(right),
    ) {
        return Some(a.cmp(&b));
    }
    if let (Ok(a), Ok(b)) = (
        NaiveDate::parse_from_str(left, "%Y-%m-%d"),
        NaiveDate::parse_from_str(right, "%Y-%m-%d"),
    ) {
        return Some(a.cmp(&b));
    }
    None
}
