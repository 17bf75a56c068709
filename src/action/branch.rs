//! Concurrent Branches
//!
//! `parallel` runs each child on its own logical thread; `paralleliterate`
//! runs one copy of its body per list item. The spawning thread parks on a
//! HardHold until every branch has finished, so inherited exceptions and
//! returns from the branches are serviced before it moves on.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::factory::{ActionFactory, ParseContext};
use super::{Action, ActionMeta, ActionOutcome};
use crate::condition::{Condition, ConditionId};
use crate::execution::thread::{LogicalThread, ThreadContext, ThreadEndCode, ThreadId};
use crate::workflow::model::Node;
use crate::workflow::validator::{Arity, NodeShape, ParseError};

/// Signal raised when a branch cannot get a thread.
pub const MAX_THREADS_EXCEEDED: &str = "MaxThreadsExceeded";

type Branch = (Box<dyn Action>, Vec<(String, Value)>);

/// Branch threads started by one execution of a branching action.
#[derive(Debug)]
struct BranchGroup {
    live: Arc<Mutex<BTreeSet<ThreadId>>>,
    children: Vec<Weak<LogicalThread>>,
    hard_hold: ConditionId,
    terminating: bool,
}

impl BranchGroup {
    /// Parks the running thread and spawns one child per branch.
    ///
    /// On a spawn failure the already started branches are stopped and the
    /// error is raised as a signal. Returns `None` when nothing was started.
    fn start(ctx: &mut ThreadContext<'_>, meta: &ActionMeta, branches: Vec<Branch>) -> Option<Self> {
        let hold = Condition::hard_hold(meta.location());
        let hard_hold = hold.id();
        ctx.add_condition(hold);

        let live = Arc::new(Mutex::new(BTreeSet::new()));
        let mut children = Vec::with_capacity(branches.len());
        let mut failure = None;
        {
            // Held across the loop so no branch can report back before all
            // of its siblings are recorded.
            let mut guard = live.lock();
            for (action, bindings) in branches {
                let listener = branch_listener(&live, ctx.thread(), hard_hold);
                match ctx.spawn_child(action, bindings, listener) {
                    Ok(child) => {
                        guard.insert(child.id());
                        children.push(Arc::downgrade(&child));
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        let Some(err) = failure else {
            debug!(
                "Job {} thread {}: started {} branches at {}",
                ctx.job().number(),
                ctx.thread().hierarchy(),
                children.len(),
                meta.location()
            );
            return Some(Self {
                live,
                children,
                hard_hold,
                terminating: false,
            });
        };

        warn!(
            "Job {} thread {}: {} at {}",
            ctx.job().number(),
            ctx.thread().hierarchy(),
            err,
            meta.location()
        );
        let mut group = Self {
            live,
            children,
            hard_hold,
            terminating: false,
        };
        group.stop();
        let started = !group.children.is_empty();
        if !started {
            ctx.remove_condition(hard_hold);
            ctx.pop_action();
        }
        ctx.raise_signal(
            MAX_THREADS_EXCEEDED,
            json!({ "message": err.to_string() }),
            &meta.location(),
        );
        started.then_some(group)
    }

    fn is_done(&self) -> bool {
        self.live.lock().is_empty()
    }

    /// Stops every branch still running.
    fn stop(&mut self) {
        self.terminating = true;
        for child in self.children.iter().filter_map(Weak::upgrade) {
            child.terminate(ThreadEndCode::StoppedByParent);
        }
    }

    /// Common condition handling for branching actions.
    fn handle(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        if self.is_done() {
            ctx.remove_condition(self.hard_hold);
            ctx.pop_action();
            return ActionOutcome::Proceed;
        }
        if !self.terminating {
            self.stop();
        }
        ActionOutcome::Suspend
    }

    fn advance(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        if self.is_done() {
            ctx.remove_condition(self.hard_hold);
            ctx.pop_action();
            ActionOutcome::Proceed
        } else {
            ActionOutcome::Suspend
        }
    }
}

fn branch_listener(
    live: &Arc<Mutex<BTreeSet<ThreadId>>>,
    parent: &Arc<LogicalThread>,
    hard_hold: ConditionId,
) -> Box<dyn FnOnce(&Arc<LogicalThread>, ThreadEndCode) + Send> {
    let live = Arc::clone(live);
    let parent = Arc::downgrade(parent);
    Box::new(move |child, end_code| {
        let all_done = {
            let mut live = live.lock();
            live.remove(&child.id());
            live.is_empty()
        };
        debug!("Branch thread {} finished ({})", child.hierarchy(), end_code);
        if all_done {
            if let Some(parent) = parent.upgrade() {
                parent.remove_condition(hard_hold);
                parent.schedule();
            }
        }
    })
}

/// Runs each child action on its own thread.
#[derive(Debug)]
pub struct ParallelAction {
    meta: Arc<ActionMeta>,
    branches: Arc<Vec<Arc<dyn Action>>>,
    group: Option<BranchGroup>,
}

impl ParallelAction {
    pub fn new(meta: Arc<ActionMeta>, branches: Vec<Arc<dyn Action>>) -> Self {
        Self {
            meta,
            branches: Arc::new(branches),
            group: None,
        }
    }
}

impl Action for ParallelAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        if let Some(group) = &mut self.group {
            return group.advance(ctx);
        }
        let branches = self
            .branches
            .iter()
            .map(|b| (b.clone_action(), Vec::new()))
            .collect();
        self.group = BranchGroup::start(ctx, &self.meta, branches);
        ActionOutcome::Proceed
    }

    fn handle_condition(&mut self, ctx: &mut ThreadContext<'_>, _condition: &Condition) -> ActionOutcome {
        match &mut self.group {
            Some(group) => group.handle(ctx),
            None => {
                ctx.pop_action();
                ActionOutcome::Proceed
            }
        }
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(ParallelAction {
            meta: Arc::clone(&self.meta),
            branches: Arc::clone(&self.branches),
            group: None,
        })
    }

    fn details(&self) -> String {
        let live = self.group.as_ref().map_or(0, |g| g.live.lock().len());
        format!("{} live branches {}/{}", self.meta.location(), live, self.branches.len())
    }
}

#[derive(Debug)]
struct ParallelIterateSpec {
    var: String,
    list: String,
    indexvar: Option<String>,
    body: Arc<dyn Action>,
}

/// Runs one copy of its body per list item, each on its own thread.
#[derive(Debug)]
pub struct ParallelIterateAction {
    meta: Arc<ActionMeta>,
    spec: Arc<ParallelIterateSpec>,
    group: Option<BranchGroup>,
}

impl Action for ParallelIterateAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        if let Some(group) = &mut self.group {
            return group.advance(ctx);
        }
        let items = match ctx.eval_list(&self.spec.list) {
            Ok(items) => items,
            Err(e) => return ctx.fail(&self.meta, e),
        };
        if items.is_empty() {
            ctx.pop_action();
            return ActionOutcome::Proceed;
        }
        let branches = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let mut bindings = vec![(self.spec.var.clone(), item)];
                if let Some(indexvar) = &self.spec.indexvar {
                    bindings.push((indexvar.clone(), Value::from(index)));
                }
                (self.spec.body.clone_action(), bindings)
            })
            .collect();
        self.group = BranchGroup::start(ctx, &self.meta, branches);
        ActionOutcome::Proceed
    }

    fn handle_condition(&mut self, ctx: &mut ThreadContext<'_>, _condition: &Condition) -> ActionOutcome {
        match &mut self.group {
            Some(group) => group.handle(ctx),
            None => {
                ctx.pop_action();
                ActionOutcome::Proceed
            }
        }
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(ParallelIterateAction {
            meta: Arc::clone(&self.meta),
            spec: Arc::clone(&self.spec),
            group: None,
        })
    }
}

pub struct ParallelFactory;

impl ParallelFactory {
    fn shape() -> NodeShape {
        NodeShape::new("parallel").children(Arity::AtLeast(1))
    }
}

impl ActionFactory for ParallelFactory {
    fn element(&self) -> &str {
        "parallel"
    }

    fn grammar(&self) -> String {
        Self::shape().grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        Self::shape().check(node, &ctx.location(node))?;
        let branches = ctx.build_all(&node.children)?;
        Ok(Arc::new(ParallelAction::new(ctx.meta(node), branches)))
    }
}

pub struct ParallelIterateFactory;

impl ParallelIterateFactory {
    fn shape() -> NodeShape {
        NodeShape::new("paralleliterate")
            .required(&["var", "in"])
            .optional(&["indexvar"])
            .children(Arity::Exactly(1))
    }
}

impl ActionFactory for ParallelIterateFactory {
    fn element(&self) -> &str {
        "paralleliterate"
    }

    fn grammar(&self) -> String {
        Self::shape().grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        Self::shape().check(node, &ctx.location(node))?;
        let spec = ParallelIterateSpec {
            var: ctx.required(node, "var")?,
            list: ctx.required(node, "in")?,
            indexvar: node.get("indexvar").map(str::to_string),
            body: ctx.build(&node.children[0])?,
        };
        Ok(Arc::new(ParallelIterateAction {
            meta: ctx.meta(node),
            spec: Arc::new(spec),
            group: None,
        }))
    }
}
