//! Blocks
//!
//! `block` names a region of the tree so other branches, or whoever controls
//! the job, can hold, release or stop it while it runs. `hold`, `release`
//! and `terminate` act on a block by name, defaulting to the innermost block
//! around them.
//!
//! Names nest: block `b` inside block `a` is `a.b`. Holding a block holds
//! the thread it runs on together with that thread's descendants; stopping
//! a block unwinds it and lets its thread carry on after it.

use std::sync::Arc;

use log::debug;
use serde_json::Value;

use super::factory::{ActionFactory, ParseContext};
use super::{Action, ActionMeta, ActionOutcome};
use crate::condition::{Condition, ConditionKind};
use crate::execution::job::block_stop_source;
use crate::execution::thread::ThreadContext;
use crate::workflow::model::Node;
use crate::workflow::validator::{Arity, NodeShape, ParseError};

/// Full name of the innermost running block.
pub const CURRENT_BLOCK_VAR: &str = "CURRENT_BLOCK";

/// Signal raised when a block name is already running in the job.
pub const DUPLICATE_BLOCK: &str = "DuplicateBlockName";

/// Signal raised when a control action names a block that is not running.
pub const UNKNOWN_BLOCK: &str = "BlockDoesNotExist";

#[derive(Debug)]
struct BlockSpec {
    name: String,
    body: Arc<dyn Action>,
}

#[derive(Debug)]
enum BlockState {
    Init,
    Running { name: String, outer: Option<Value> },
    Done,
}

/// Runs its body as a named, externally controllable block.
#[derive(Debug)]
pub struct BlockAction {
    meta: Arc<ActionMeta>,
    spec: Arc<BlockSpec>,
    state: BlockState,
}

impl BlockAction {
    fn enter(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        let name = match ctx.eval_string(&self.spec.name) {
            Ok(name) => name,
            Err(e) => return ctx.fail(&self.meta, e),
        };
        let outer = ctx.scope().get(CURRENT_BLOCK_VAR).cloned();
        let full = match &outer {
            Some(Value::String(parent)) => format!("{}.{}", parent, name),
            _ => name,
        };

        if !ctx.job().enter_block(&full, ctx.thread_id()) {
            self.state = BlockState::Done;
            ctx.pop_action();
            ctx.raise_signal(DUPLICATE_BLOCK, Value::String(full), &self.meta.location());
            return ActionOutcome::Proceed;
        }
        ctx.set_var(CURRENT_BLOCK_VAR, Value::String(full.clone()));
        ctx.push_action(self.spec.body.clone_action());
        self.state = BlockState::Running { name: full, outer };
        ActionOutcome::Proceed
    }

    /// Unregisters the block and restores the outer block name.
    fn leave(&mut self, ctx: &mut ThreadContext<'_>) -> Option<String> {
        let BlockState::Running { name, outer } = std::mem::replace(&mut self.state, BlockState::Done)
        else {
            return None;
        };
        ctx.job().leave_block(&name);
        match outer {
            Some(value) => ctx.set_var(CURRENT_BLOCK_VAR, value),
            None => {
                ctx.scope_mut().remove(CURRENT_BLOCK_VAR);
            }
        }
        Some(name)
    }
}

impl Action for BlockAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        if let BlockState::Init = self.state {
            return self.enter(ctx);
        }
        self.leave(ctx);
        ctx.pop_action();
        ActionOutcome::Proceed
    }

    fn handle_condition(&mut self, ctx: &mut ThreadContext<'_>, condition: &Condition) -> ActionOutcome {
        let left = self.leave(ctx);
        ctx.pop_action();
        if let Some(name) = left {
            let stops_this_block = matches!(condition.kind(), ConditionKind::Terminate)
                && condition.source() == block_stop_source(&name);
            if stops_this_block {
                debug!("Block {} terminated", name);
                ctx.remove_condition(condition.id());
            }
        }
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(BlockAction {
            meta: Arc::clone(&self.meta),
            spec: Arc::clone(&self.spec),
            state: BlockState::Init,
        })
    }

    fn details(&self) -> String {
        match &self.state {
            BlockState::Running { name, .. } => format!("{} block {}", self.meta.location(), name),
            _ => self.meta.location(),
        }
    }
}

/// What a control action does to its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Hold,
    Release,
    Terminate,
}

impl BlockOp {
    pub fn element(self) -> &'static str {
        match self {
            Self::Hold => "hold",
            Self::Release => "release",
            Self::Terminate => "terminate",
        }
    }
}

/// `hold`, `release` or `terminate` applied to a named block.
#[derive(Debug, Clone)]
pub struct BlockControlAction {
    meta: Arc<ActionMeta>,
    op: BlockOp,
    block: Option<String>,
}

impl Action for BlockControlAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        let name = match &self.block {
            Some(expr) => match ctx.eval_string(expr) {
                Ok(name) => name,
                Err(e) => return ctx.fail(&self.meta, e),
            },
            None => match ctx.scope().get(CURRENT_BLOCK_VAR) {
                Some(Value::String(name)) => name.clone(),
                _ => String::new(),
            },
        };
        ctx.pop_action();

        let job = Arc::clone(ctx.job());
        let applied = match self.op {
            BlockOp::Hold => job.hold_block(&name),
            BlockOp::Release => job.release_block(&name),
            BlockOp::Terminate => job.terminate_block(&name),
        };
        if !applied {
            ctx.raise_signal(UNKNOWN_BLOCK, Value::String(name), &self.meta.location());
        }
        ActionOutcome::Proceed
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }

    fn info(&self) -> String {
        format!("{} {}", self.op.element(), self.block.as_deref().unwrap_or("<current>"))
    }
}

pub struct BlockFactory;

impl BlockFactory {
    fn shape() -> NodeShape {
        NodeShape::new("block")
            .required(&["name"])
            .children(Arity::Exactly(1))
    }
}

impl ActionFactory for BlockFactory {
    fn element(&self) -> &str {
        "block"
    }

    fn grammar(&self) -> String {
        Self::shape().grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        Self::shape().check(node, &ctx.location(node))?;
        let spec = BlockSpec {
            name: ctx.required(node, "name")?,
            body: ctx.build(&node.children[0])?,
        };
        Ok(Arc::new(BlockAction {
            meta: ctx.meta(node),
            spec: Arc::new(spec),
            state: BlockState::Init,
        }))
    }
}

/// Builds `hold`, `release` or `terminate`.
pub struct BlockControlFactory {
    op: BlockOp,
}

impl BlockControlFactory {
    pub fn new(op: BlockOp) -> Self {
        Self { op }
    }

    fn shape(&self) -> NodeShape {
        NodeShape::new(self.op.element()).optional(&["block"])
    }
}

impl ActionFactory for BlockControlFactory {
    fn element(&self) -> &str {
        self.op.element()
    }

    fn grammar(&self) -> String {
        self.shape().grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        self.shape().check(node, &ctx.location(node))?;
        Ok(Arc::new(BlockControlAction {
            meta: ctx.meta(node),
            op: self.op,
            block: node.get("block").map(str::to_string),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::factory::FactoryRegistry;
    use crate::execution::job::tests::{detached_job, drain};
    use crate::execution::job::{Job, JobStatus};
    use crate::execution::pool::Message;
    use crate::execution::thread::{ThreadEndCode, ThreadState};
    use crossbeam::channel::Receiver;
    use serde_json::json;

    fn start(node: Node) -> (Arc<Job>, Receiver<Message>) {
        let registry = FactoryRegistry::with_builtins();
        let ctx = ParseContext::new(&registry, "block.yaml", "local");
        let action = ctx.build(&node).unwrap();
        let (job, rx) = detached_job();
        job.start(action.clone_action()).unwrap();
        drain(&rx);
        (job, rx)
    }

    fn script(text: &str) -> Node {
        Node::new("script").text(text)
    }

    fn block(name: &str, body: Node) -> Node {
        Node::new("block").attr("name", format!("'{}'", name)).child(body)
    }

    #[test]
    fn test_nested_block_names() {
        let (job, _rx) = start(
            Node::new("sequence")
                .child(block("outer", block("inner", script("RESULT = CURRENT_BLOCK"))))
                .child(script("after = 1")),
        );
        let outcome = job.outcome().unwrap();
        assert_eq!(outcome.status, JobStatus::Normal);
        assert_eq!(outcome.result, json!("outer.inner"));
        assert!(job.blocks().is_empty());
    }

    #[test]
    fn test_terminate_stops_only_the_block() {
        let body = Node::new("sequence")
            .child(Node::new("terminate"))
            .child(script("RESULT = 'unreached'"));
        let (job, _rx) = start(
            Node::new("sequence")
                .child(block("work", body))
                .child(script("RESULT = 'after'")),
        );
        let outcome = job.outcome().unwrap();
        assert_eq!(outcome.status, JobStatus::Normal);
        assert_eq!(outcome.end_code, Some(ThreadEndCode::Ok));
        assert_eq!(outcome.result, json!("after"));
    }

    #[test]
    fn test_terminate_named_outer_block() {
        let inner = block(
            "inner",
            Node::new("terminate").attr("block", "'outer'"),
        );
        let (job, _rx) = start(
            Node::new("sequence")
                .child(block(
                    "outer",
                    Node::new("sequence")
                        .child(inner)
                        .child(script("RESULT = 'unreached'")),
                ))
                .child(script("RESULT = 'after'")),
        );
        let outcome = job.outcome().unwrap();
        assert_eq!(outcome.status, JobStatus::Normal);
        assert_eq!(outcome.result, json!("after"));
        assert!(job.blocks().is_empty());
    }

    #[test]
    fn test_hold_parks_block_until_released() {
        let body = Node::new("sequence")
            .child(Node::new("hold"))
            .child(script("RESULT = 'released'"));
        let (job, rx) = start(block("work", body));

        assert!(!job.is_complete());
        assert_eq!(job.blocks(), vec!["work".to_string()]);
        let root = job.root().unwrap();
        assert_eq!(root.state(), ThreadState::Suspended);

        assert!(job.release_block("work"));
        drain(&rx);
        assert_eq!(job.outcome().unwrap().result, json!("released"));
        assert!(job.blocks().is_empty());
    }

    #[test]
    fn test_release_of_unknown_block_raises() {
        let (job, _rx) = start(Node::new("release").attr("block", "'missing'"));
        let outcome = job.outcome().unwrap();
        assert_eq!(outcome.status, JobStatus::Abnormal);
        let info = outcome.unhandled[0].exception_info().unwrap();
        assert_eq!(info.name, UNKNOWN_BLOCK);
        assert_eq!(info.data, json!("missing"));
    }

    #[test]
    fn test_hold_outside_any_block_raises() {
        let (job, _rx) = start(Node::new("hold"));
        let outcome = job.outcome().unwrap();
        assert_eq!(outcome.unhandled[0].exception_info().unwrap().name, UNKNOWN_BLOCK);
    }

    #[test]
    fn test_control_grammar() {
        let factory = BlockControlFactory::new(BlockOp::Terminate);
        assert_eq!(factory.element(), "terminate");
        assert!(factory.grammar().contains("<!ELEMENT terminate"));
        assert!(BlockFactory.grammar().contains("<!ELEMENT block"));
    }
}
