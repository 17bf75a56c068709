//! Functions
//!
//! A `function` element defines a named body in a job's function table; a
//! `call` looks the name up at run time and pushes an invocation. Arguments
//! are visible to the body as `ARGS` and a `return` inside the body stores
//! its value in `RESULT`.

use std::sync::Arc;

use log::debug;
use serde_json::{json, Value};

use super::factory::{ActionFactory, ParseContext};
use super::{Action, ActionMeta, ActionOutcome};
use crate::condition::{Condition, ConditionKind};
use crate::execution::thread::ThreadContext;
use crate::workflow::model::Node;
use crate::workflow::validator::{Arity, NodeShape, ParseError};

/// Variable holding the value of the last function return.
pub const RESULT_VAR: &str = "RESULT";

/// Variable holding the arguments of the running function.
pub const ARGS_VAR: &str = "ARGS";

/// Signal raised when a call names an undefined function.
pub const FUNCTION_DOES_NOT_EXIST: &str = "FunctionDoesNotExist";

/// A named function body; the template lives in the job's function table
/// and each call runs an instance of it.
#[derive(Debug)]
pub struct FunctionAction {
    meta: Arc<ActionMeta>,
    name: String,
    body: Arc<dyn Action>,
    args: Value,
    saved_args: Option<Value>,
    started: bool,
}

impl FunctionAction {
    pub fn new(meta: Arc<ActionMeta>, name: impl Into<String>, body: Arc<dyn Action>) -> Self {
        Self {
            meta,
            name: name.into(),
            body,
            args: Value::Null,
            saved_args: None,
            started: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A fresh invocation bound to `args`.
    pub fn instantiate(&self, args: Value) -> Box<dyn Action> {
        Box::new(FunctionAction {
            meta: Arc::clone(&self.meta),
            name: self.name.clone(),
            body: Arc::clone(&self.body),
            args,
            saved_args: None,
            started: false,
        })
    }

    fn shape() -> NodeShape {
        NodeShape::new("function")
            .required(&["name"])
            .children(Arity::Exactly(1))
    }

    /// Grammar line for `function` elements.
    pub fn grammar() -> String {
        Self::shape().grammar()
    }

    /// Builds a function definition from a `function` node.
    pub fn parse(node: &Node, ctx: &ParseContext<'_>) -> Result<Self, ParseError> {
        Self::shape().check(node, &ctx.location(node))?;
        let name = ctx.required(node, "name")?;
        let body = ctx.build(&node.children[0])?;
        Ok(Self::new(ctx.meta(node), name, body))
    }

    /// Restores the caller's arguments and leaves the stack.
    fn exit(&mut self, ctx: &mut ThreadContext<'_>) {
        match self.saved_args.take() {
            Some(previous) => ctx.set_var(ARGS_VAR, previous),
            None => {
                ctx.scope_mut().remove(ARGS_VAR);
            }
        }
        ctx.pop_action();
    }
}

impl Action for FunctionAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        if self.started {
            self.exit(ctx);
            return ActionOutcome::Proceed;
        }
        self.started = true;
        self.saved_args = ctx.scope().get(ARGS_VAR).cloned();
        ctx.set_var(ARGS_VAR, self.args.clone());
        ctx.set_var(RESULT_VAR, Value::Null);
        ctx.push_action(self.body.clone_action());
        ActionOutcome::Proceed
    }

    fn handle_condition(&mut self, ctx: &mut ThreadContext<'_>, condition: &Condition) -> ActionOutcome {
        if let ConditionKind::Return(value) = condition.kind() {
            debug!("Function {} returned {}", self.name, value);
            ctx.remove_condition(condition.id());
            ctx.set_var(RESULT_VAR, value.clone());
        }
        self.exit(ctx);
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        self.instantiate(Value::Null)
    }

    fn info(&self) -> String {
        format!("function {}", self.name)
    }

    fn function_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

#[derive(Debug, Clone)]
enum FunctionRef {
    /// Name fixed when the tree was built
    Literal(String),
    /// Expression evaluated at call time
    Expr(String),
}

/// Invokes a function from the job's function table.
#[derive(Debug, Clone)]
pub struct CallAction {
    meta: Arc<ActionMeta>,
    function: FunctionRef,
    args: Option<String>,
}

impl CallAction {
    /// A call to a known function name.
    pub fn direct(function: String, args: Option<String>) -> Self {
        Self {
            meta: Arc::new(ActionMeta::new("call")),
            function: FunctionRef::Literal(function),
            args,
        }
    }
}

impl Action for CallAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        let name = match &self.function {
            FunctionRef::Literal(name) => name.clone(),
            FunctionRef::Expr(expr) => match ctx.eval_string(expr) {
                Ok(name) => name,
                Err(e) => return ctx.fail(&self.meta, e),
            },
        };
        let args = match &self.args {
            Some(expr) => match ctx.eval_value(expr) {
                Ok(args) => args,
                Err(e) => return ctx.fail(&self.meta, e),
            },
            None => Value::Null,
        };

        ctx.pop_action();
        match ctx.function(&name) {
            Some(function) => ctx.push_action(function.instantiate(args)),
            None => ctx.raise_signal(
                FUNCTION_DOES_NOT_EXIST,
                json!({ "function": name }),
                &self.meta.location(),
            ),
        }
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }

    fn info(&self) -> String {
        match &self.function {
            FunctionRef::Literal(name) | FunctionRef::Expr(name) => format!("call {}", name),
        }
    }
}

pub struct CallFactory;

impl CallFactory {
    fn shape() -> NodeShape {
        NodeShape::new("call")
            .required(&["function"])
            .optional(&["args"])
    }
}

impl ActionFactory for CallFactory {
    fn element(&self) -> &str {
        "call"
    }

    fn grammar(&self) -> String {
        Self::shape().grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        Self::shape().check(node, &ctx.location(node))?;
        Ok(Arc::new(CallAction {
            meta: ctx.meta(node),
            function: FunctionRef::Expr(ctx.required(node, "function")?),
            args: node.get("args").map(str::to_string),
        }))
    }
}
