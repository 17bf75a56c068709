//! CEL Evaluator
//!
//! Expressions are Common Expression Language, compiled and run with
//! `cel_interpreter` against the variables of the current [`Scope`].
//!
//! - Literals: `42`, `1.5`, `'text'`, `true`/`false`/`null`, `[1, 2]`,
//!   `{'k': 1}`
//! - Variables and indexing: `items[0]`, `config['host']`, `config.host`
//! - Operators: `+ - * / %`, `== != < <= > >=`, `&& || !`, `a ? b : c`
//! - Statements (scripts only): `name = expr`, separated by newlines or `;`

use std::collections::HashMap;
use std::sync::Arc;

use cel_interpreter::objects::{Key, Map as CelMap};
use cel_interpreter::{Context, Program, Value as CelValue};
use serde_json::{Map, Number, Value};

use super::{EvalError, Evaluator, Scope};

/// Deepest bracket nesting accepted before compiling.
pub const MAX_NESTING: usize = 64;

/// Most operator characters accepted in one expression.
pub const MAX_OPERATORS: usize = 512;

/// The default [`Evaluator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CelEvaluator;

impl CelEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for CelEvaluator {
    fn eval_value(&self, expr: &str, scope: &Scope) -> Result<Value, EvalError> {
        evaluate(expr, scope).map_err(|m| EvalError::new(expr, m))
    }

    fn exec(&self, script: &str, scope: &mut Scope) -> Result<(), EvalError> {
        for statement in split_statements(script) {
            let stmt = statement.trim();
            if stmt.is_empty() || stmt.starts_with('#') {
                continue;
            }
            match split_assignment(stmt) {
                Some((name, rhs)) => {
                    let value = evaluate(rhs, scope).map_err(|m| EvalError::new(stmt, m))?;
                    scope.set(name, value);
                }
                None => {
                    evaluate(stmt, scope).map_err(|m| EvalError::new(stmt, m))?;
                }
            }
        }
        Ok(())
    }
}

fn evaluate(expr: &str, scope: &Scope) -> Result<Value, String> {
    check_complexity(expr)?;

    let program = Program::compile(expr).map_err(|e| e.to_string())?;

    let mut context = Context::default();
    for (name, value) in scope.iter() {
        context.add_variable_from_value(name, to_cel(value));
    }

    let result = program.execute(&context).map_err(|e| e.to_string())?;
    from_cel(&result)
}

/// Rejects expressions nested or chained deeply enough to exhaust the
/// stack while parsing or evaluating.
fn check_complexity(expr: &str) -> Result<(), String> {
    let mut depth = 0usize;
    let mut deepest = 0usize;
    let mut operators = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in expr.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            '(' | '[' | '{' => {
                depth += 1;
                deepest = deepest.max(depth);
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            '+' | '-' | '*' | '/' | '%' | '!' | '<' | '>' | '=' | '&' | '|' | '?' => {
                operators += 1
            }
            _ => {}
        }
    }

    if deepest > MAX_NESTING {
        return Err(format!(
            "expression nests {} levels deep, the limit is {}",
            deepest, MAX_NESTING
        ));
    }
    if operators > MAX_OPERATORS {
        return Err(format!(
            "expression has {} operators, the limit is {}",
            operators, MAX_OPERATORS
        ));
    }
    Ok(())
}

fn to_cel(value: &Value) -> CelValue {
    match value {
        Value::Null => CelValue::Null,
        Value::Bool(b) => CelValue::Bool(*b),
        // Integers that fit stay signed so `n + 1` type-checks.
        Value::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => CelValue::Int(i),
            (None, Some(u)) => CelValue::UInt(u),
            _ => CelValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => CelValue::String(Arc::new(s.clone())),
        Value::Array(items) => CelValue::List(Arc::new(items.iter().map(to_cel).collect())),
        Value::Object(map) => {
            let entries: HashMap<Key, CelValue> = map
                .iter()
                .map(|(k, v)| (Key::String(Arc::new(k.clone())), to_cel(v)))
                .collect();
            CelValue::Map(CelMap {
                map: Arc::new(entries),
            })
        }
    }
}

fn from_cel(value: &CelValue) -> Result<Value, String> {
    Ok(match value {
        CelValue::Null => Value::Null,
        CelValue::Bool(b) => Value::Bool(*b),
        CelValue::Int(i) => Value::from(*i),
        CelValue::UInt(u) => Value::from(*u),
        CelValue::Float(f) => Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| format!("{} is not a finite number", f))?,
        CelValue::String(s) => Value::String(s.as_str().to_string()),
        CelValue::List(items) => Value::Array(
            items
                .iter()
                .map(from_cel)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        CelValue::Map(map) => {
            let mut object = Map::new();
            for (key, item) in map.map.iter() {
                let name = match key {
                    Key::String(s) => s.as_str().to_string(),
                    Key::Int(i) => i.to_string(),
                    Key::Bool(b) => b.to_string(),
                    other => return Err(format!("unsupported map key {:?}", other)),
                };
                object.insert(name, from_cel(item)?);
            }
            Value::Object(object)
        }
        other => return Err(format!("unsupported result {:?}", other)),
    })
}

/// Splits a script on newlines and `;` outside string literals.
fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in script.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
                current.push(ch);
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                '\n' | ';' => statements.push(std::mem::take(&mut current)),
                _ => current.push(ch),
            },
        }
    }
    statements.push(current);
    statements
}

/// `name = expr` yields the name and the right-hand side. `==` is a
/// comparison, not an assignment.
fn split_assignment(stmt: &str) -> Option<(&str, &str)> {
    let ident_len = stmt
        .char_indices()
        .take_while(|(i, c)| {
            c.is_ascii_alphabetic() || *c == '_' || (*i > 0 && c.is_ascii_digit())
        })
        .count();
    if ident_len == 0 {
        return None;
    }
    let (name, rest) = stmt.split_at(ident_len);
    let rest = rest.trim_start();
    if rest.starts_with('=') && !rest.starts_with("==") {
        Some((name, rest[1..].trim()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &str) -> Result<Value, EvalError> {
        CelEvaluator.eval_value(expr, &Scope::new())
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval("42").unwrap(), json!(42));
        assert_eq!(eval("1.5").unwrap(), json!(1.5));
        assert_eq!(eval("'hi'").unwrap(), json!("hi"));
        assert_eq!(eval("true").unwrap(), json!(true));
        assert_eq!(eval("null").unwrap(), json!(null));
        assert_eq!(eval("[1, 'a']").unwrap(), json!([1, "a"]));
        assert_eq!(eval("{'k': [1]}").unwrap(), json!({"k": [1]}));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), json!(7));
        assert_eq!(eval("(1 + 2) * 3").unwrap(), json!(9));
        assert_eq!(eval("7 % 4").unwrap(), json!(3));
        assert_eq!(eval("-3 + 1").unwrap(), json!(-2));
        assert_eq!(eval("'a' + 'b'").unwrap(), json!("ab"));
        assert_eq!(eval("[1] + [2]").unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(eval("1 < 2 && 3 > 4").unwrap(), json!(false));
        assert_eq!(eval("1 < 2 || 3 > 4").unwrap(), json!(true));
        assert_eq!(eval("!(1 == 1)").unwrap(), json!(false));
        assert_eq!(eval("'b' in ['a', 'b']").unwrap(), json!(true));
        assert_eq!(eval("2 > 1 ? 'yes' : 'no'").unwrap(), json!("yes"));
    }

    #[test]
    fn test_variables_and_indexing() {
        let mut scope = Scope::new();
        scope.set("items", json!([10, 20, 30]));
        scope.set("config", json!({"host": "db1", "port": 5432}));
        scope.set("n", json!(2));
        let ev = CelEvaluator;

        assert_eq!(ev.eval_value("items[n]", &scope).unwrap(), json!(30));
        assert_eq!(ev.eval_value("config['host']", &scope).unwrap(), json!("db1"));
        assert_eq!(ev.eval_value("config.port + n", &scope).unwrap(), json!(5434));
        assert_eq!(ev.eval_value("size(items)", &scope).unwrap(), json!(3));
    }

    #[test]
    fn test_errors_name_the_expression() {
        let err = eval("nope + 1").unwrap_err();
        assert_eq!(err.expression, "nope + 1");
        assert!(eval("1 +").is_err());
        assert!(eval("[1][5]").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let expr = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        let err = eval(&expr).unwrap_err();
        assert!(err.message.contains("nests 200000 levels"));

        let chain = vec!["1"; 100_000].join(" + ");
        let err = eval(&chain).unwrap_err();
        assert!(err.message.contains("operators"));
    }

    #[test]
    fn test_nesting_within_limit_evaluates() {
        let expr = format!("{}1{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert_eq!(eval(&expr).unwrap(), json!(1));
    }

    #[test]
    fn test_brackets_in_strings_are_not_counted() {
        let text = "(".repeat(MAX_NESTING * 2);
        assert_eq!(eval(&format!("'{}'", text)).unwrap(), json!(text));
    }

    #[test]
    fn test_exec_assignments() {
        let mut scope = Scope::new();
        CelEvaluator
            .exec("a = 1\nb = a + 1; label = 'a;b'\n# note\n", &mut scope)
            .unwrap();
        assert_eq!(scope.get("a"), Some(&json!(1)));
        assert_eq!(scope.get("b"), Some(&json!(2)));
        assert_eq!(scope.get("label"), Some(&json!("a;b")));
    }

    #[test]
    fn test_exec_equality_is_not_assignment() {
        let mut scope = Scope::new();
        scope.set("a", json!(1));
        CelEvaluator.exec("a == 2", &mut scope).unwrap();
        assert_eq!(scope.get("a"), Some(&json!(1)));
        assert_eq!(split_assignment("x_1 = 3"), Some(("x_1", "3")));
        assert_eq!(split_assignment("x >= 3"), None);
        assert_eq!(split_assignment("1 = 3"), None);
    }

    #[test]
    fn test_exec_reports_failing_statement() {
        let mut scope = Scope::new();
        let err = CelEvaluator.exec("a = 1; b = nope", &mut scope).unwrap_err();
        assert_eq!(err.expression, "b = nope");
        assert_eq!(scope.get("a"), Some(&json!(1)));
    }
}
