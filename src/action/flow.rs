//! Structured Control Flow
//!
//! `sequence`, `if`, `loop`, `iterate`, `try` with `catch` and `finally`.
//! Loop control and exception handling are driven by conditions: the body
//! unwinds on its own and the enclosing action consumes the condition in
//! `handle_condition`.

use std::sync::Arc;

use log::debug;
use serde_json::Value;

use super::factory::{ActionFactory, ParseContext};
use super::{Action, ActionMeta, ActionOutcome};
use crate::condition::{Condition, ConditionKind, ExceptionInfo};
use crate::eval::EvalError;
use crate::execution::thread::ThreadContext;
use crate::workflow::model::Node;
use crate::workflow::validator::{Arity, NodeShape, ParseError, ParseErrorKind};

/// Runs its children in order, one per cycle.
#[derive(Debug, Clone)]
pub struct SequenceAction {
    meta: Arc<ActionMeta>,
    children: Arc<Vec<Arc<dyn Action>>>,
    next: usize,
}

impl SequenceAction {
    pub fn new(meta: Arc<ActionMeta>, children: Vec<Arc<dyn Action>>) -> Self {
        Self {
            meta,
            children: Arc::new(children),
            next: 0,
        }
    }
}

impl Action for SequenceAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        match self.children.get(self.next) {
            Some(child) => {
                self.next += 1;
                ctx.push_action(child.clone_action());
            }
            None => ctx.pop_action(),
        }
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(SequenceAction {
            meta: Arc::clone(&self.meta),
            children: Arc::clone(&self.children),
            next: 0,
        })
    }

    fn details(&self) -> String {
        format!("{} step {}/{}", self.meta.location(), self.next, self.children.len())
    }
}

/// Picks one of two branches.
#[derive(Debug, Clone)]
pub struct IfAction {
    meta: Arc<ActionMeta>,
    expr: String,
    then: Arc<dyn Action>,
    otherwise: Option<Arc<dyn Action>>,
}

impl Action for IfAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        let taken = match ctx.eval_bool(&self.expr) {
            Ok(taken) => taken,
            Err(e) => return ctx.fail(&self.meta, e),
        };
        ctx.pop_action();
        if taken {
            ctx.push_action(self.then.clone_action());
        } else if let Some(otherwise) = &self.otherwise {
            ctx.push_action(otherwise.clone_action());
        }
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }

    fn info(&self) -> String {
        format!("if {}", self.expr)
    }
}

#[derive(Debug)]
struct LoopSpec {
    var: Option<String>,
    from: String,
    to: Option<String>,
    by: String,
    while_: Option<String>,
    until: Option<String>,
    body: Arc<dyn Action>,
}

impl LoopSpec {
    fn bounds(&self, ctx: &ThreadContext<'_>) -> Result<(i64, Option<i64>, i64), EvalError> {
        let from = ctx.eval_int(&self.from)?;
        let to = match &self.to {
            Some(expr) => Some(ctx.eval_int(expr)?),
            None => None,
        };
        let by = ctx.eval_int(&self.by)?;
        if by == 0 {
            return Err(EvalError::new(&self.by, "loop step must not be zero"));
        }
        Ok((from, to, by))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Init,
    Top,
    Bottom,
}

/// Counted and conditional loop.
///
/// `from` defaults to 1 and `by` to 1; without `to` the loop runs until
/// `while` is false, `until` is true, or a Break arrives.
#[derive(Debug)]
pub struct LoopAction {
    meta: Arc<ActionMeta>,
    spec: Arc<LoopSpec>,
    state: LoopState,
    index: i64,
    end: Option<i64>,
    step: i64,
}

impl LoopAction {
    fn finished(&self) -> bool {
        match self.end {
            Some(end) if self.step >= 0 => self.index > end,
            Some(end) => self.index < end,
            None => false,
        }
    }

    fn bind_index(&self, ctx: &mut ThreadContext<'_>) {
        if let Some(var) = &self.spec.var {
            ctx.set_var(var, Value::from(self.index));
        }
    }
}

impl Action for LoopAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        match self.state {
            LoopState::Init => {
                match self.spec.bounds(ctx) {
                    Ok((from, to, by)) => {
                        self.index = from;
                        self.end = to;
                        self.step = by;
                        self.state = LoopState::Top;
                    }
                    Err(e) => return ctx.fail(&self.meta, e),
                }
                self.execute(ctx)
            }
            LoopState::Top => {
                if self.finished() {
                    ctx.pop_action();
                    return ActionOutcome::Proceed;
                }
                self.bind_index(ctx);
                if let Some(expr) = &self.spec.while_ {
                    match ctx.eval_bool(expr) {
                        Ok(true) => {}
                        Ok(false) => {
                            ctx.pop_action();
                            return ActionOutcome::Proceed;
                        }
                        Err(e) => return ctx.fail(&self.meta, e),
                    }
                }
                self.state = LoopState::Bottom;
                ctx.push_action(self.spec.body.clone_action());
                ActionOutcome::Proceed
            }
            LoopState::Bottom => {
                if let Some(expr) = &self.spec.until {
                    match ctx.eval_bool(expr) {
                        Ok(false) => {}
                        Ok(true) => {
                            ctx.pop_action();
                            return ActionOutcome::Proceed;
                        }
                        Err(e) => return ctx.fail(&self.meta, e),
                    }
                }
                match self.index.checked_add(self.step) {
                    Some(next) => {
                        self.index = next;
                        self.state = LoopState::Top;
                    }
                    // Stepping past the integer range ends the loop.
                    None => ctx.pop_action(),
                }
                ActionOutcome::Proceed
            }
        }
    }

    fn handle_condition(&mut self, ctx: &mut ThreadContext<'_>, condition: &Condition) -> ActionOutcome {
        match condition.kind() {
            ConditionKind::Continue => {
                ctx.remove_condition(condition.id());
                self.state = LoopState::Bottom;
            }
            ConditionKind::Break => {
                ctx.remove_condition(condition.id());
                ctx.pop_action();
            }
            _ => ctx.pop_action(),
        }
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(LoopAction {
            meta: Arc::clone(&self.meta),
            spec: Arc::clone(&self.spec),
            state: LoopState::Init,
            index: 0,
            end: None,
            step: 1,
        })
    }

    fn details(&self) -> String {
        format!("{} index={} state={:?}", self.meta.location(), self.index, self.state)
    }
}

#[derive(Debug)]
struct IterateSpec {
    var: String,
    list: String,
    indexvar: Option<String>,
    body: Arc<dyn Action>,
}

/// Runs its body once per item of a list, in order.
#[derive(Debug)]
pub struct IterateAction {
    meta: Arc<ActionMeta>,
    spec: Arc<IterateSpec>,
    items: Option<Vec<Value>>,
    next: usize,
}

impl Action for IterateAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        if self.items.is_none() {
            match ctx.eval_list(&self.spec.list) {
                Ok(items) => self.items = Some(items),
                Err(e) => return ctx.fail(&self.meta, e),
            }
        }
        let item = self.items.as_ref().and_then(|items| items.get(self.next)).cloned();
        match item {
            Some(item) => {
                ctx.set_var(&self.spec.var, item);
                if let Some(indexvar) = &self.spec.indexvar {
                    ctx.set_var(indexvar, Value::from(self.next));
                }
                self.next += 1;
                ctx.push_action(self.spec.body.clone_action());
            }
            None => ctx.pop_action(),
        }
        ActionOutcome::Proceed
    }

    fn handle_condition(&mut self, ctx: &mut ThreadContext<'_>, condition: &Condition) -> ActionOutcome {
        match condition.kind() {
            ConditionKind::Continue => {
                ctx.remove_condition(condition.id());
            }
            ConditionKind::Break => {
                ctx.remove_condition(condition.id());
                ctx.pop_action();
            }
            _ => ctx.pop_action(),
        }
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(IterateAction {
            meta: Arc::clone(&self.meta),
            spec: Arc::clone(&self.spec),
            items: None,
            next: 0,
        })
    }

    fn details(&self) -> String {
        let total = self.items.as_ref().map_or(0, Vec::len);
        format!("{} item {}/{}", self.meta.location(), self.next, total)
    }
}

/// One `catch` element of a `try`.
#[derive(Debug)]
struct CatchClause {
    meta: Arc<ActionMeta>,
    exception: String,
    var: Option<String>,
    typevar: Option<String>,
    body: Arc<dyn Action>,
}

/// Runs a body and dispatches matching exceptions to catch clauses.
#[derive(Debug)]
pub struct TryAction {
    meta: Arc<ActionMeta>,
    body: Arc<dyn Action>,
    catches: Arc<Vec<Arc<CatchClause>>>,
    started: bool,
}

impl Action for TryAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        if self.started {
            ctx.pop_action();
        } else {
            self.started = true;
            ctx.push_action(self.body.clone_action());
        }
        ActionOutcome::Proceed
    }

    fn handle_condition(&mut self, ctx: &mut ThreadContext<'_>, condition: &Condition) -> ActionOutcome {
        ctx.pop_action();
        let Some(info) = condition.exception_info() else {
            return ActionOutcome::Proceed;
        };
        for clause in self.catches.iter() {
            let pattern = match ctx.eval_string(&clause.exception) {
                Ok(pattern) => pattern,
                Err(e) => return ctx.fail(&clause.meta, e),
            };
            if info.matches(&pattern) {
                debug!("{} caught by {}", info.name, clause.meta.location());
                ctx.remove_condition(condition.id());
                ctx.push_action(Box::new(CatchAction {
                    clause: Arc::clone(clause),
                    info: info.clone(),
                    started: false,
                }));
                break;
            }
        }
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(TryAction {
            meta: Arc::clone(&self.meta),
            body: Arc::clone(&self.body),
            catches: Arc::clone(&self.catches),
            started: false,
        })
    }
}

/// Body of a catch clause, run with the caught exception bound.
#[derive(Debug)]
pub struct CatchAction {
    clause: Arc<CatchClause>,
    info: ExceptionInfo,
    started: bool,
}

impl Action for CatchAction {
    fn meta(&self) -> &ActionMeta {
        &self.clause.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        if self.started {
            ctx.pop_action();
            return ActionOutcome::Proceed;
        }
        self.started = true;
        if let Some(var) = &self.clause.var {
            ctx.set_var(var, self.info.data.clone());
        }
        if let Some(typevar) = &self.clause.typevar {
            ctx.set_var(typevar, Value::String(self.info.name.clone()));
        }
        ctx.push_action(self.clause.body.clone_action());
        ActionOutcome::Proceed
    }

    fn handle_condition(&mut self, ctx: &mut ThreadContext<'_>, condition: &Condition) -> ActionOutcome {
        ctx.pop_action();
        if matches!(condition.kind(), ConditionKind::Rethrow) {
            ctx.remove_condition(condition.id());
            ctx.add_condition(Condition::new(
                ConditionKind::Exception(self.info.clone()),
                condition.source(),
            ));
        }
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(CatchAction {
            clause: Arc::clone(&self.clause),
            info: self.info.clone(),
            started: false,
        })
    }

    fn info(&self) -> String {
        format!("catch {}", self.info.name)
    }
}

#[derive(Debug)]
enum FinallyState {
    Init,
    Body,
    Cleanup,
    Done,
}

/// Runs a cleanup body after the protected body, however it ends.
///
/// Conditions the protected body unwinds with are set aside while the
/// cleanup runs and raised again afterwards. A stopping thread skips the
/// cleanup.
#[derive(Debug)]
pub struct FinallyAction {
    meta: Arc<ActionMeta>,
    body: Arc<dyn Action>,
    cleanup: Arc<dyn Action>,
    state: FinallyState,
    saved: Vec<Condition>,
}

impl FinallyAction {
    fn restore(&mut self, ctx: &mut ThreadContext<'_>) {
        for condition in self.saved.drain(..) {
            ctx.add_condition(condition);
        }
    }
}

impl Action for FinallyAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        match self.state {
            FinallyState::Init => {
                self.state = FinallyState::Body;
                ctx.push_action(self.body.clone_action());
            }
            FinallyState::Body => {
                self.state = FinallyState::Cleanup;
                ctx.push_action(self.cleanup.clone_action());
            }
            FinallyState::Cleanup | FinallyState::Done => {
                self.state = FinallyState::Done;
                self.restore(ctx);
                ctx.pop_action();
            }
        }
        ActionOutcome::Proceed
    }

    fn handle_condition(&mut self, ctx: &mut ThreadContext<'_>, condition: &Condition) -> ActionOutcome {
        let stopping = matches!(condition.kind(), ConditionKind::Terminate | ConditionKind::HardHold);
        if let (FinallyState::Body, false) = (&self.state, stopping) {
            self.saved = ctx.remove_conditions(|c| {
                !c.kind().is_hold() && !matches!(c.kind(), ConditionKind::Terminate | ConditionKind::HardHold)
            });
            debug!(
                "{}: running cleanup with {} condition(s) set aside",
                self.meta.location(),
                self.saved.len()
            );
            self.state = FinallyState::Cleanup;
            ctx.push_action(self.cleanup.clone_action());
            return ActionOutcome::Proceed;
        }
        // The cleanup itself failed, or the thread is stopping.
        self.state = FinallyState::Done;
        self.restore(ctx);
        ctx.pop_action();
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(FinallyAction {
            meta: Arc::clone(&self.meta),
            body: Arc::clone(&self.body),
            cleanup: Arc::clone(&self.cleanup),
            state: FinallyState::Init,
            saved: Vec::new(),
        })
    }

    fn details(&self) -> String {
        format!("{} finally state={:?}", self.meta.location(), self.state)
    }
}

pub struct SequenceFactory;

impl SequenceFactory {
    fn shape() -> NodeShape {
        NodeShape::new("sequence").children(Arity::AtLeast(0))
    }
}

impl ActionFactory for SequenceFactory {
    fn element(&self) -> &str {
        "sequence"
    }

    fn grammar(&self) -> String {
        Self::shape().grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        Self::shape().check(node, &ctx.location(node))?;
        let children = ctx.build_all(&node.children)?;
        Ok(Arc::new(SequenceAction::new(ctx.meta(node), children)))
    }
}

pub struct IfFactory;

impl IfFactory {
    fn shape() -> NodeShape {
        NodeShape::new("if")
            .required(&["expr"])
            .children(Arity::Between(1, 2))
    }
}

impl ActionFactory for IfFactory {
    fn element(&self) -> &str {
        "if"
    }

    fn grammar(&self) -> String {
        Self::shape().grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        Self::shape().check(node, &ctx.location(node))?;
        let then = ctx.build(&node.children[0])?;
        let otherwise = match node.children.get(1) {
            Some(child) => Some(ctx.build(child)?),
            None => None,
        };
        Ok(Arc::new(IfAction {
            meta: ctx.meta(node),
            expr: ctx.required(node, "expr")?,
            then,
            otherwise,
        }))
    }
}

pub struct LoopFactory;

impl LoopFactory {
    fn shape() -> NodeShape {
        NodeShape::new("loop")
            .optional(&["var", "from", "to", "by", "while", "until"])
            .children(Arity::Exactly(1))
    }
}

impl ActionFactory for LoopFactory {
    fn element(&self) -> &str {
        "loop"
    }

    fn grammar(&self) -> String {
        Self::shape().grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        Self::shape().check(node, &ctx.location(node))?;
        let attr = |name: &str| node.get(name).map(str::to_string);
        let spec = LoopSpec {
            var: attr("var"),
            from: attr("from").unwrap_or_else(|| "1".to_string()),
            to: attr("to"),
            by: attr("by").unwrap_or_else(|| "1".to_string()),
            while_: attr("while"),
            until: attr("until"),
            body: ctx.build(&node.children[0])?,
        };
        Ok(Arc::new(LoopAction {
            meta: ctx.meta(node),
            spec: Arc::new(spec),
            state: LoopState::Init,
            index: 0,
            end: None,
            step: 1,
        }))
    }
}

pub struct IterateFactory;

impl IterateFactory {
    fn shape() -> NodeShape {
        NodeShape::new("iterate")
            .required(&["var", "in"])
            .optional(&["indexvar"])
            .children(Arity::Exactly(1))
    }
}

impl ActionFactory for IterateFactory {
    fn element(&self) -> &str {
        "iterate"
    }

    fn grammar(&self) -> String {
        Self::shape().grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        Self::shape().check(node, &ctx.location(node))?;
        let spec = IterateSpec {
            var: ctx.required(node, "var")?,
            list: ctx.required(node, "in")?,
            indexvar: node.get("indexvar").map(str::to_string),
            body: ctx.build(&node.children[0])?,
        };
        Ok(Arc::new(IterateAction {
            meta: ctx.meta(node),
            spec: Arc::new(spec),
            items: None,
            next: 0,
        }))
    }
}

pub struct TryFactory;

impl TryFactory {
    fn catch_shape() -> NodeShape {
        NodeShape::new("catch")
            .required(&["exception"])
            .optional(&["var", "typevar"])
            .children(Arity::Exactly(1))
    }

    fn finally_shape() -> NodeShape {
        NodeShape::new("finally").children(Arity::Exactly(1))
    }
}

impl ActionFactory for TryFactory {
    fn element(&self) -> &str {
        "try"
    }

    fn grammar(&self) -> String {
        format!(
            "{}\n{}\n{}",
            "<!ELEMENT try ((%action;), ((catch+, finally?) | finally))>",
            Self::catch_shape().grammar(),
            Self::finally_shape().grammar()
        )
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        NodeShape::new("try")
            .children(Arity::AtLeast(2))
            .check(node, &ctx.location(node))?;
        let (body_node, mut handlers) = node.children.split_at(1);
        if matches!(body_node[0].element.as_str(), "catch" | "finally") {
            return Err(ctx.error(node, ParseErrorKind::UnexpectedChild(body_node[0].element.clone())));
        }
        let mut body = ctx.build(&body_node[0])?;

        let mut finally_node = None;
        if let Some((last, rest)) = handlers.split_last() {
            if last.element == "finally" {
                Self::finally_shape().check(last, &ctx.location(last))?;
                finally_node = Some(last);
                handlers = rest;
            }
        }

        let mut catches = Vec::with_capacity(handlers.len());
        for catch in handlers {
            if catch.element != "catch" {
                return Err(ctx.error(node, ParseErrorKind::UnexpectedChild(catch.element.clone())));
            }
            Self::catch_shape().check(catch, &ctx.location(catch))?;
            catches.push(Arc::new(CatchClause {
                meta: ctx.meta(catch),
                exception: ctx.required(catch, "exception")?,
                var: catch.get("var").map(str::to_string),
                typevar: catch.get("typevar").map(str::to_string),
                body: ctx.build(&catch.children[0])?,
            }));
        }

        if !catches.is_empty() {
            body = Arc::new(TryAction {
                meta: ctx.meta(node),
                body,
                catches: Arc::new(catches),
                started: false,
            });
        }
        match finally_node {
            Some(finally) => Ok(Arc::new(FinallyAction {
                meta: ctx.meta(finally),
                body,
                cleanup: ctx.build(&finally.children[0])?,
                state: FinallyState::Init,
                saved: Vec::new(),
            })),
            None => Ok(body),
        }
    }
}
