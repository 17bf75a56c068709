//! Actions
//!
//! An action is one node of a parsed workflow tree. Factories build read-only
//! templates (`Arc<dyn Action>`); a thread only ever runs private copies made
//! with [`Action::clone_action`], so one template can run in many branches at
//! once.
//!
//! # Stack protocol
//!
//! A thread calls `execute` on its top action when no condition is pending,
//! and `handle_condition` when one is. An action:
//! - pushes children to descend into the tree,
//! - pops itself (via the context) when it has nothing left to do,
//! - raises conditions to talk to the actions below it,
//! - returns [`ActionOutcome::Suspend`] to wait for an external wake.
//!
//! # Modules
//!
//! - [`factory`]: factory trait, registry and parse context
//! - [`basic`]: leaf actions (`nop`, `break`, `throw`, `script`, ...)
//! - [`flow`]: structured control flow (`sequence`, `loop`, `try`, ...)
//! - [`branch`]: concurrent branches (`parallel`, `paralleliterate`)
//! - [`function`]: function definitions and `call`
//! - [`timer`]: `timer` and `delay`
//! - [`block`]: named blocks and `hold`, `release`, `terminate`

pub mod basic;
pub mod block;
pub mod branch;
pub mod factory;
pub mod flow;
pub mod function;
pub mod timer;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::execution::thread::ThreadContext;

pub use factory::{ActionFactory, FactoryRegistry, ParseContext, RegistryError};

/// What the thread should do after an action call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Keep the thread runnable.
    Proceed,
    /// Park the thread until something wakes it.
    Suspend,
}

/// Static metadata shared by a template and all of its clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMeta {
    /// Element name the action was built from
    pub element: String,
    /// Identifier of the defining document
    pub document: String,
    /// Machine the document came from
    pub machine: String,
    /// Line of the element in the document, when known
    pub line: Option<u32>,
}

impl ActionMeta {
    pub fn new(element: impl Into<String>) -> Self {
        Self {
            element: element.into(),
            document: String::new(),
            machine: String::new(),
            line: None,
        }
    }

    pub fn with_document(mut self, document: impl Into<String>, machine: impl Into<String>) -> Self {
        self.document = document.into();
        self.machine = machine.into();
        self
    }

    pub fn with_line(mut self, line: Option<u32>) -> Self {
        self.line = line;
        self
    }

    /// Source location used for condition sources and diagnostics.
    pub fn location(&self) -> String {
        let document = if self.document.is_empty() {
            "<inline>"
        } else {
            self.document.as_str()
        };
        match self.line {
            Some(line) => format!("{}:{} <{}>", document, line, self.element),
            None => format!("{} <{}>", document, self.element),
        }
    }
}

impl fmt::Display for ActionMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.location())
    }
}

/// A resumable node of the action tree.
pub trait Action: Send + Sync + fmt::Debug {
    fn meta(&self) -> &ActionMeta;

    /// Runs one step.
    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome;

    /// Reacts to a pending condition while this action is on top.
    ///
    /// The default pops the action and leaves the condition for the
    /// actions below.
    fn handle_condition(&mut self, ctx: &mut ThreadContext<'_>, condition: &Condition) -> ActionOutcome {
        let _ = condition;
        ctx.pop_action();
        ActionOutcome::Proceed
    }

    /// Independent copy sharing static metadata, with fresh execution state.
    fn clone_action(&self) -> Box<dyn Action>;

    /// One-line summary for thread listings.
    fn info(&self) -> String {
        self.meta().element.clone()
    }

    /// Longer diagnostic description including execution state.
    fn details(&self) -> String {
        self.meta().location()
    }

    /// Name of the function this action is an invocation of, if any.
    fn function_name(&self) -> Option<&str> {
        None
    }
}
