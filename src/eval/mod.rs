//! Expression Evaluation
//!
//! Actions carry expressions (loop bounds, conditions, return values) and
//! scripts as plain text. This module is the seam between those actions and
//! whatever language evaluates them.
//!
//! - [`Evaluator`]: the three operations the engine relies on
//! - [`Scope`]: per-thread variables, cloned into spawned threads
//! - [`CelEvaluator`]: the default, Common Expression Language

pub mod cel;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use cel::CelEvaluator;

/// An evaluation failure with a diagnostic message.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("error evaluating '{expression}': {message}")]
pub struct EvalError {
    pub expression: String,
    pub message: String,
}

impl EvalError {
    pub fn new(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            message: message.into(),
        }
    }
}

/// Variables visible to one logical thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    vars: BTreeMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// External expression and script evaluator.
pub trait Evaluator: Send + Sync {
    /// Evaluates an expression to a structured value.
    fn eval_value(&self, expr: &str, scope: &Scope) -> Result<Value, EvalError>;

    /// Evaluates an expression to its string form.
    fn eval_string(&self, expr: &str, scope: &Scope) -> Result<String, EvalError> {
        self.eval_value(expr, scope).map(|v| value_to_string(&v))
    }

    /// Executes statements, possibly assigning variables.
    fn exec(&self, script: &str, scope: &mut Scope) -> Result<(), EvalError>;
}

/// String form of a value: strings unquoted, everything else as JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truthiness used by `if`, `while` and `until`.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_set_get() {
        let mut scope = Scope::new();
        scope.set("x", json!(3));
        assert_eq!(scope.get("x"), Some(&json!(3)));
        assert_eq!(scope.remove("x"), Some(json!(3)));
        assert!(scope.is_empty());
    }

    #[test]
    fn test_scope_clone_is_independent() {
        let mut parent = Scope::new();
        parent.set("x", json!(1));
        let mut child = parent.clone();
        child.set("x", json!(2));
        assert_eq!(parent.get("x"), Some(&json!(1)));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!(1.5)));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!({"a": 1})));
    }

    #[test]
    fn test_value_to_string() {
        assert_eq!(value_to_string(&json!("plain")), "plain");
        assert_eq!(value_to_string(&json!(42)), "42");
        assert_eq!(value_to_string(&json!([1, 2])), "[1,2]");
    }
}
