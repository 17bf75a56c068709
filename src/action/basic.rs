//! Leaf Actions
//!
//! Single-step actions: `nop`, `break`, `continue`, `return`, `throw`,
//! `rethrow`, `script`, `raise` and `signalhandler`. Each one pops itself on
//! its first execution.

use std::sync::Arc;

use serde_json::Value;

use super::factory::{ActionFactory, ParseContext};
use super::{Action, ActionMeta, ActionOutcome};
use crate::condition::{Condition, ConditionKind};
use crate::execution::thread::ThreadContext;
use crate::workflow::model::Node;
use crate::workflow::validator::{Arity, NodeShape, ParseError, ParseErrorKind};

/// Does nothing.
#[derive(Debug, Clone)]
pub struct NopAction {
    meta: Arc<ActionMeta>,
}

impl NopAction {
    pub fn new(meta: Arc<ActionMeta>) -> Self {
        Self { meta }
    }

    #[cfg(test)]
    pub(crate) fn bare() -> Self {
        Self::new(Arc::new(ActionMeta::new("nop")))
    }
}

impl Action for NopAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        ctx.pop_action();
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

/// Raises Break or Continue for the enclosing loop.
#[derive(Debug, Clone)]
pub struct LoopControlAction {
    meta: Arc<ActionMeta>,
    kind: ConditionKind,
}

/// `break`
pub type BreakAction = LoopControlAction;

impl LoopControlAction {
    pub fn breaking(meta: Arc<ActionMeta>) -> Self {
        Self {
            meta,
            kind: ConditionKind::Break,
        }
    }

    pub fn continuing(meta: Arc<ActionMeta>) -> Self {
        Self {
            meta,
            kind: ConditionKind::Continue,
        }
    }

    #[cfg(test)]
    pub(crate) fn bare() -> Self {
        Self::breaking(Arc::new(ActionMeta::new("break")))
    }
}

impl Action for LoopControlAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        ctx.pop_action();
        ctx.add_condition(Condition::new(self.kind.clone(), self.meta.location()));
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

/// Returns from the enclosing function with an optional value.
#[derive(Debug, Clone)]
pub struct ReturnAction {
    meta: Arc<ActionMeta>,
    value: Option<String>,
}

impl ReturnAction {
    pub fn new(meta: Arc<ActionMeta>, value: Option<String>) -> Self {
        Self { meta, value }
    }
}

impl Action for ReturnAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        let value = match &self.value {
            Some(expr) => match ctx.eval_value(expr) {
                Ok(value) => value,
                Err(e) => return ctx.fail(&self.meta, e),
            },
            None => Value::Null,
        };
        ctx.pop_action();
        ctx.add_condition(Condition::new(ConditionKind::Return(value), self.meta.location()));
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

/// Raises a named exception.
#[derive(Debug, Clone)]
pub struct ThrowAction {
    meta: Arc<ActionMeta>,
    exception: String,
    data: Option<String>,
}

impl ThrowAction {
    pub fn new(meta: Arc<ActionMeta>, exception: impl Into<String>, data: Option<String>) -> Self {
        Self {
            meta,
            exception: exception.into(),
            data,
        }
    }
}

impl Action for ThrowAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        let name = match ctx.eval_string(&self.exception) {
            Ok(name) => name,
            Err(e) => return ctx.fail(&self.meta, e),
        };
        let data = match &self.data {
            Some(expr) => match ctx.eval_value(expr) {
                Ok(data) => data,
                Err(e) => return ctx.fail(&self.meta, e),
            },
            None => Value::Null,
        };
        ctx.pop_action();
        ctx.raise_exception(&name, data, &self.meta.location());
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }

    fn info(&self) -> String {
        format!("throw {}", self.exception)
    }
}

/// Re-raises the exception caught by the enclosing `catch`.
#[derive(Debug, Clone)]
pub struct RethrowAction {
    meta: Arc<ActionMeta>,
}

impl Action for RethrowAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        ctx.pop_action();
        ctx.add_condition(Condition::new(ConditionKind::Rethrow, self.meta.location()));
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

/// Executes statements against the thread's scope.
#[derive(Debug, Clone)]
pub struct ScriptAction {
    meta: Arc<ActionMeta>,
    script: String,
}

impl ScriptAction {
    pub fn new(meta: Arc<ActionMeta>, script: impl Into<String>) -> Self {
        Self {
            meta,
            script: script.into(),
        }
    }
}

impl Action for ScriptAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        if let Err(e) = ctx.exec(&self.script) {
            return ctx.fail(&self.meta, e);
        }
        ctx.pop_action();
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }

    fn details(&self) -> String {
        format!("{}: {}", self.meta.location(), self.script.lines().next().unwrap_or(""))
    }
}

/// Raises a named signal.
#[derive(Debug, Clone)]
pub struct RaiseAction {
    meta: Arc<ActionMeta>,
    signal: String,
}

impl RaiseAction {
    pub fn new(meta: Arc<ActionMeta>, signal: impl Into<String>) -> Self {
        Self {
            meta,
            signal: signal.into(),
        }
    }
}

impl Action for RaiseAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        let signal = match ctx.eval_string(&self.signal) {
            Ok(signal) => signal,
            Err(e) => return ctx.fail(&self.meta, e),
        };
        ctx.pop_action();
        ctx.raise_signal(&signal, Value::Null, &self.meta.location());
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

/// Registers a handler for a signal on the running thread.
#[derive(Debug, Clone)]
pub struct SignalHandlerAction {
    meta: Arc<ActionMeta>,
    signal: String,
    body: Arc<dyn Action>,
}

impl SignalHandlerAction {
    pub fn new(meta: Arc<ActionMeta>, signal: impl Into<String>, body: Arc<dyn Action>) -> Self {
        Self {
            meta,
            signal: signal.into(),
            body,
        }
    }
}

impl Action for SignalHandlerAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        let signal = match ctx.eval_string(&self.signal) {
            Ok(signal) => signal,
            Err(e) => return ctx.fail(&self.meta, e),
        };
        ctx.register_signal_handler(&signal, Arc::clone(&self.body));
        ctx.pop_action();
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

/// Runs a registered handler with its signal marked in progress.
#[derive(Debug)]
pub(crate) struct SignalDispatch {
    meta: Arc<ActionMeta>,
    signal: String,
    handler: Arc<dyn Action>,
    entered: bool,
}

impl SignalDispatch {
    pub(crate) fn new(signal: &str, handler: Arc<dyn Action>) -> Self {
        let meta = ActionMeta {
            element: "signal".to_string(),
            ..handler.meta().clone()
        };
        Self {
            meta: Arc::new(meta),
            signal: signal.to_string(),
            handler,
            entered: false,
        }
    }
}

impl Action for SignalDispatch {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        if !self.entered {
            self.entered = true;
            ctx.enter_signal(&self.signal);
            ctx.push_action(self.handler.clone_action());
        } else {
            ctx.leave_signal(&self.signal);
            ctx.pop_action();
        }
        ActionOutcome::Proceed
    }

    fn handle_condition(&mut self, ctx: &mut ThreadContext<'_>, _condition: &Condition) -> ActionOutcome {
        if self.entered {
            ctx.leave_signal(&self.signal);
        }
        ctx.pop_action();
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(SignalDispatch {
            meta: Arc::clone(&self.meta),
            signal: self.signal.clone(),
            handler: Arc::clone(&self.handler),
            entered: false,
        })
    }

    fn info(&self) -> String {
        format!("signal {}", self.signal)
    }
}

pub struct NopFactory;

impl ActionFactory for NopFactory {
    fn element(&self) -> &str {
        "nop"
    }

    fn grammar(&self) -> String {
        NodeShape::new("nop").grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        NodeShape::new("nop").check(node, &ctx.location(node))?;
        Ok(Arc::new(NopAction::new(ctx.meta(node))))
    }
}

pub struct BreakFactory;

impl ActionFactory for BreakFactory {
    fn element(&self) -> &str {
        "break"
    }

    fn grammar(&self) -> String {
        NodeShape::new("break").grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        NodeShape::new("break").check(node, &ctx.location(node))?;
        Ok(Arc::new(LoopControlAction::breaking(ctx.meta(node))))
    }
}

pub struct ContinueFactory;

impl ActionFactory for ContinueFactory {
    fn element(&self) -> &str {
        "continue"
    }

    fn grammar(&self) -> String {
        NodeShape::new("continue").grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        NodeShape::new("continue").check(node, &ctx.location(node))?;
        Ok(Arc::new(LoopControlAction::continuing(ctx.meta(node))))
    }
}

pub struct ReturnFactory;

impl ReturnFactory {
    fn shape() -> NodeShape {
        NodeShape::new("return").optional(&["value"])
    }
}

impl ActionFactory for ReturnFactory {
    fn element(&self) -> &str {
        "return"
    }

    fn grammar(&self) -> String {
        Self::shape().grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        Self::shape().check(node, &ctx.location(node))?;
        let value = node.get("value").map(str::to_string);
        Ok(Arc::new(ReturnAction::new(ctx.meta(node), value)))
    }
}

pub struct ThrowFactory;

impl ThrowFactory {
    fn shape() -> NodeShape {
        NodeShape::new("throw").required(&["exception"]).optional(&["data"])
    }
}

impl ActionFactory for ThrowFactory {
    fn element(&self) -> &str {
        "throw"
    }

    fn grammar(&self) -> String {
        Self::shape().grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        Self::shape().check(node, &ctx.location(node))?;
        let exception = ctx.required(node, "exception")?;
        let data = node.get("data").map(str::to_string);
        Ok(Arc::new(ThrowAction::new(ctx.meta(node), exception, data)))
    }
}

pub struct RethrowFactory;

impl ActionFactory for RethrowFactory {
    fn element(&self) -> &str {
        "rethrow"
    }

    fn grammar(&self) -> String {
        NodeShape::new("rethrow").grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        NodeShape::new("rethrow").check(node, &ctx.location(node))?;
        Ok(Arc::new(RethrowAction { meta: ctx.meta(node) }))
    }
}

pub struct ScriptFactory;

impl ActionFactory for ScriptFactory {
    fn element(&self) -> &str {
        "script"
    }

    fn grammar(&self) -> String {
        "<!ELEMENT script (#PCDATA)>".to_string()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        NodeShape::new("script").check(node, &ctx.location(node))?;
        match node.text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Ok(Arc::new(ScriptAction::new(ctx.meta(node), text))),
            _ => Err(ctx.error(
                node,
                ParseErrorKind::InvalidAttribute {
                    attribute: "text".to_string(),
                    reason: "script body is empty".to_string(),
                },
            )),
        }
    }
}

pub struct RaiseFactory;

impl RaiseFactory {
    fn shape() -> NodeShape {
        NodeShape::new("raise").required(&["signal"])
    }
}

impl ActionFactory for RaiseFactory {
    fn element(&self) -> &str {
        "raise"
    }

    fn grammar(&self) -> String {
        Self::shape().grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        Self::shape().check(node, &ctx.location(node))?;
        let signal = ctx.required(node, "signal")?;
        Ok(Arc::new(RaiseAction::new(ctx.meta(node), signal)))
    }
}

pub struct SignalHandlerFactory;

impl SignalHandlerFactory {
    fn shape() -> NodeShape {
        NodeShape::new("signalhandler")
            .required(&["signal"])
            .children(Arity::Exactly(1))
    }
}

impl ActionFactory for SignalHandlerFactory {
    fn element(&self) -> &str {
        "signalhandler"
    }

    fn grammar(&self) -> String {
        Self::shape().grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        Self::shape().check(node, &ctx.location(node))?;
        let signal = ctx.required(node, "signal")?;
        let body = ctx.build(&node.children[0])?;
        Ok(Arc::new(SignalHandlerAction::new(ctx.meta(node), signal, body)))
    }
}
