//! Condition Model
//!
//! Conditions are the signals actions use to talk to the actions that
//! enclose them: loop control, returns, exceptions, holds and termination.
//! They travel up a thread's action stack instead of unwinding the real
//! call stack, which lets a thread be held mid-unwind or hand an exception
//! to its parent thread.
//!
//! # Priorities
//!
//! | kind | priority |
//! |------|----------|
//! | Hold | 1000 |
//! | Break, Continue, Return, Exception, Rethrow, TimerExpired | 400 |
//! | Terminate | 100 |
//! | HardHold | 50 |
//!
//! The highest priority pending condition is serviced first.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Priority of a Hold condition.
pub const HOLD_PRIORITY: u32 = 1000;

/// Priority shared by loop control, returns, exceptions and timer expiry.
pub const SIGNAL_PRIORITY: u32 = 400;

/// Priority of a Terminate condition.
pub const TERMINATE_PRIORITY: u32 = 100;

/// Priority of a HardHold condition.
pub const HARD_HOLD_PRIORITY: u32 = 50;

static NEXT_CONDITION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a single raised condition.
///
/// Copies made when a condition is inherited by a child thread keep the id,
/// so releasing a hold by id reaches every copy.
pub type ConditionId = u64;

/// Payload of an Exception condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// Exception name, dotted names form a hierarchy (`Net.Timeout`)
    pub name: String,
    /// Arbitrary data attached by the thrower
    pub data: Value,
    /// Function call stack captured when the exception was raised
    pub stack_trace: Vec<String>,
}

impl ExceptionInfo {
    pub fn new(name: impl Into<String>, data: Value, stack_trace: Vec<String>) -> Self {
        Self {
            name: name.into(),
            data,
            stack_trace,
        }
    }

    /// Returns true if a catch pattern matches this exception name.
    ///
    /// `...` matches everything, otherwise the pattern must equal the name
    /// or be one of its dotted prefixes.
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == "..." || pattern == self.name {
            return true;
        }
        self.name
            .strip_prefix(pattern)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false)
    }
}

/// The closed set of condition kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum ConditionKind {
    Break,
    Continue,
    Return(Value),
    Exception(ExceptionInfo),
    Rethrow,
    Hold,
    HardHold,
    Terminate,
    TimerExpired,
}

impl ConditionKind {
    /// Fixed priority of this kind.
    pub fn priority(&self) -> u32 {
        match self {
            Self::Hold => HOLD_PRIORITY,
            Self::Break
            | Self::Continue
            | Self::Return(_)
            | Self::Exception(_)
            | Self::Rethrow
            | Self::TimerExpired => SIGNAL_PRIORITY,
            Self::Terminate => TERMINATE_PRIORITY,
            Self::HardHold => HARD_HOLD_PRIORITY,
        }
    }

    /// Whether a freshly raised condition of this kind is inheritable.
    ///
    /// Values that must reach the enclosing thread when a branch ends
    /// (returns, exceptions) are inheritable. Loop control and
    /// thread-scoped signals stay local.
    pub fn inheritable_by_default(&self) -> bool {
        matches!(self, Self::Return(_) | Self::Exception(_) | Self::Rethrow)
    }

    /// Short name used in logs and introspection.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Break => "Break",
            Self::Continue => "Continue",
            Self::Return(_) => "Return",
            Self::Exception(_) => "Exception",
            Self::Rethrow => "Rethrow",
            Self::Hold => "Hold",
            Self::HardHold => "HardHold",
            Self::Terminate => "Terminate",
            Self::TimerExpired => "TimerExpired",
        }
    }

    /// Hold kinds park the thread instead of being handed to an action.
    pub fn is_hold(&self) -> bool {
        matches!(self, Self::Hold | Self::HardHold)
    }
}

/// A signal raised during execution.
///
/// Conditions are immutable once built; the builder methods consume and
/// return the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    id: ConditionId,
    kind: ConditionKind,
    source: String,
    inheritable: bool,
}

impl Condition {
    /// Creates a condition with a fresh id and the kind's default
    /// inheritability.
    pub fn new(kind: ConditionKind, source: impl Into<String>) -> Self {
        let inheritable = kind.inheritable_by_default();
        Self {
            id: NEXT_CONDITION_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            source: source.into(),
            inheritable,
        }
    }

    pub fn hold(source: impl Into<String>) -> Self {
        Self::new(ConditionKind::Hold, source)
    }

    pub fn hard_hold(source: impl Into<String>) -> Self {
        Self::new(ConditionKind::HardHold, source)
    }

    pub fn terminate(source: impl Into<String>) -> Self {
        Self::new(ConditionKind::Terminate, source)
    }

    pub fn exception(
        name: impl Into<String>,
        data: Value,
        stack_trace: Vec<String>,
        source: impl Into<String>,
    ) -> Self {
        Self::new(
            ConditionKind::Exception(ExceptionInfo::new(name, data, stack_trace)),
            source,
        )
    }

    /// Overrides the default inheritability.
    pub fn with_inheritable(mut self, inheritable: bool) -> Self {
        self.inheritable = inheritable;
        self
    }

    pub fn id(&self) -> ConditionId {
        self.id
    }

    pub fn kind(&self) -> &ConditionKind {
        &self.kind
    }

    pub fn priority(&self) -> u32 {
        self.kind.priority()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_inheritable(&self) -> bool {
        self.inheritable
    }

    /// Exception payload, if this is an Exception.
    pub fn exception_info(&self) -> Option<&ExceptionInfo> {
        match &self.kind {
            ConditionKind::Exception(info) => Some(info),
            _ => None,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: Source={}, Priority={}",
            self.kind.name(),
            self.source,
            self.priority()
        )?;
        if let ConditionKind::Exception(info) = &self.kind {
            write!(f, ", Name={}", info.name)?;
        }
        Ok(())
    }
}

/// Pending conditions of one thread, kept in service order.
///
/// Ordered by descending priority, then by raise order.
#[derive(Debug, Clone, Default)]
pub struct ConditionStack {
    pending: Vec<Condition>,
}

impl ConditionStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a condition in priority order.
    ///
    /// Returns false if a condition with the same id is already pending.
    pub fn push(&mut self, condition: Condition) -> bool {
        if self.pending.iter().any(|c| c.id == condition.id) {
            return false;
        }
        let priority = condition.priority();
        let at = self
            .pending
            .iter()
            .position(|c| c.priority() < priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(at, condition);
        true
    }

    /// The condition to service next.
    pub fn top(&self) -> Option<&Condition> {
        self.pending.first()
    }

    pub fn remove(&mut self, id: ConditionId) -> Option<Condition> {
        let at = self.pending.iter().position(|c| c.id == id)?;
        Some(self.pending.remove(at))
    }

    /// Removes every condition matching the predicate.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<Condition>
    where
        F: FnMut(&Condition) -> bool,
    {
        let mut removed = Vec::new();
        self.pending.retain(|c| {
            if pred(c) {
                removed.push(c.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn contains(&self, id: ConditionId) -> bool {
        self.pending.iter().any(|c| c.id == id)
    }

    /// Copies of the conditions a spawned child inherits.
    pub fn inheritable(&self) -> ConditionStack {
        ConditionStack {
            pending: self
                .pending
                .iter()
                .filter(|c| c.inheritable)
                .cloned()
                .collect(),
        }
    }

    pub fn drain(&mut self) -> Vec<Condition> {
        std::mem::take(&mut self.pending)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
