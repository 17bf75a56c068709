//! Logical Threads
//!
//! A logical thread is one stack-based path of execution inside a job. Many
//! logical threads share a few OS worker threads: a worker calls
//! [`LogicalThread::resume`], which performs exactly one unit of work and
//! then either re-queues the thread, parks it, or completes it.
//!
//! # States
//!
//! ```text
//! Init -> Runnable -> Running -> Runnable ...
//!                        |  \-> Suspended -> Runnable ...
//!                        \----> Complete
//! ```
//!
//! Only the `Init/Suspended -> Runnable` transition enqueues a thread, and
//! only a worker moves it from `Runnable` to `Running`, so a thread is never
//! queued or run twice at the same time. A wake that arrives while the
//! thread is running is remembered and re-queues it when the cycle ends.
//!
//! # Locks
//!
//! - `core`: action stack, scope and signal state; held for a whole cycle
//! - `conditions`: the pending condition stack
//! - `sched`: state, wake flag, generation, end code, listeners, children
//!
//! `conditions` and `sched` are only held for short, non-reentrant sections,
//! and no lock is held while completion listeners run.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::job::{Job, SpawnError};
use super::timed_events::TimedEventQueue;
use crate::action::function::FunctionAction;
use crate::action::{Action, ActionMeta, ActionOutcome};
use crate::condition::{Condition, ConditionId, ConditionKind, ConditionStack};
use crate::eval::{is_truthy, EvalError, Scope};

/// Identifier of a thread, unique within its job.
pub type ThreadId = u32;

/// Id of the thread every job starts with.
pub const ROOT_THREAD_ID: ThreadId = 1;

/// Name of the exception raised for evaluation failures.
pub const EVALUATION_ERROR: &str = "EvaluationError";

/// How long introspection waits for a running cycle before giving up.
const SNAPSHOT_WAIT: Duration = Duration::from_millis(250);

/// Scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadState {
    Init,
    Runnable,
    Running,
    Suspended,
    Complete,
}

/// Why a thread stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadEndCode {
    /// The action stack ran out normally
    Ok,
    /// A signal arrived while the same signal was being handled
    DuplicateSignal,
    /// An ancestor or an external request stopped the thread
    StoppedByParent,
}

impl ThreadEndCode {
    /// Numeric code reported to status collaborators.
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::DuplicateSignal => 1,
            Self::StoppedByParent => 2,
        }
    }
}

impl fmt::Display for ThreadEndCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::DuplicateSignal => "DUPLICATE_SIGNAL",
            Self::StoppedByParent => "STOPPED_BY_PARENT",
        };
        f.write_str(name)
    }
}

/// Callback fired once when a thread completes.
pub type ThreadCompleteListener = Box<dyn FnOnce(&Arc<LogicalThread>, ThreadEndCode) + Send>;

/// State owned by whichever worker is running the thread.
pub(crate) struct ThreadCore {
    actions: Vec<Box<dyn Action>>,
    scope: Scope,
    signal_handlers: HashMap<String, Arc<dyn Action>>,
    signal_stack: Vec<String>,
}

impl ThreadCore {
    pub(crate) fn new(scope: Scope) -> Self {
        Self {
            actions: Vec::new(),
            scope,
            signal_handlers: HashMap::new(),
            signal_stack: Vec::new(),
        }
    }
}

struct SchedState {
    state: ThreadState,
    wake_pending: bool,
    generation: u64,
    end_code: ThreadEndCode,
    listeners: Vec<ThreadCompleteListener>,
    children: BTreeSet<ThreadId>,
}

enum Cycle {
    Again,
    Park,
    Finished,
}

/// One independent path of execution within a job.
pub struct LogicalThread {
    id: ThreadId,
    hierarchy: String,
    job: Arc<Job>,
    parent: Option<Weak<LogicalThread>>,
    parent_id: Option<ThreadId>,
    started_at: DateTime<Local>,
    core: Mutex<ThreadCore>,
    conditions: Mutex<ConditionStack>,
    sched: Mutex<SchedState>,
}

impl LogicalThread {
    pub(crate) fn new(
        job: Arc<Job>,
        id: ThreadId,
        parent: Option<&Arc<LogicalThread>>,
        core: ThreadCore,
        conditions: ConditionStack,
    ) -> Arc<Self> {
        let hierarchy = match parent {
            Some(p) => format!("{}.{}", p.hierarchy, id),
            None => id.to_string(),
        };
        Arc::new(Self {
            id,
            hierarchy,
            job,
            parent: parent.map(Arc::downgrade),
            parent_id: parent.map(|p| p.id),
            started_at: Local::now(),
            core: Mutex::new(core),
            conditions: Mutex::new(conditions),
            sched: Mutex::new(SchedState {
                state: ThreadState::Init,
                wake_pending: false,
                generation: 0,
                end_code: ThreadEndCode::Ok,
                listeners: Vec::new(),
                children: BTreeSet::new(),
            }),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Dotted ancestry, e.g. `1.3.7`.
    pub fn hierarchy(&self) -> &str {
        &self.hierarchy
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn parent(&self) -> Option<Arc<LogicalThread>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn parent_id(&self) -> Option<ThreadId> {
        self.parent_id
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn state(&self) -> ThreadState {
        self.sched.lock().state
    }

    pub fn is_complete(&self) -> bool {
        self.state() == ThreadState::Complete
    }

    /// End code recorded so far; final once the thread is complete.
    pub fn end_code(&self) -> ThreadEndCode {
        self.sched.lock().end_code
    }

    /// Ids of live child threads.
    pub fn children(&self) -> Vec<ThreadId> {
        self.sched.lock().children.iter().copied().collect()
    }

    pub fn add_condition(&self, condition: Condition) -> bool {
        self.conditions.lock().push(condition)
    }

    pub fn remove_condition(&self, id: ConditionId) -> Option<Condition> {
        self.conditions.lock().remove(id)
    }

    pub fn remove_conditions_where<F>(&self, pred: F) -> Vec<Condition>
    where
        F: FnMut(&Condition) -> bool,
    {
        self.conditions.lock().remove_where(pred)
    }

    /// Snapshot of pending conditions in service order.
    pub fn conditions(&self) -> Vec<Condition> {
        self.conditions.lock().iter().cloned().collect()
    }

    /// Value of a variable in the thread's scope.
    pub fn variable(&self, name: &str) -> Option<Value> {
        self.core.lock().scope.get(name).cloned()
    }

    /// Registers a listener fired once with the end code.
    ///
    /// A listener added after completion fires immediately.
    pub fn add_completion_notifiee(self: &Arc<Self>, listener: ThreadCompleteListener) {
        let end_code = {
            let mut sched = self.sched.lock();
            if sched.state != ThreadState::Complete {
                sched.listeners.push(listener);
                return;
            }
            sched.end_code
        };
        listener(self, end_code);
    }

    /// Makes the thread runnable if it is waiting or not yet started.
    pub fn schedule(self: &Arc<Self>) {
        self.schedule_if(None);
    }

    /// Handle that wakes this thread once, unless it is stopped first.
    pub fn waker(self: &Arc<Self>) -> Waker {
        Waker {
            thread: Arc::downgrade(self),
            generation: self.sched.lock().generation,
        }
    }

    fn schedule_if(self: &Arc<Self>, generation: Option<u64>) -> bool {
        let enqueue = {
            let mut sched = self.sched.lock();
            if let Some(expected) = generation {
                if sched.generation != expected {
                    return false;
                }
            }
            match sched.state {
                ThreadState::Init | ThreadState::Suspended => {
                    sched.state = ThreadState::Runnable;
                    true
                }
                ThreadState::Running => {
                    sched.wake_pending = true;
                    false
                }
                ThreadState::Runnable => false,
                ThreadState::Complete => return false,
            }
        };
        if enqueue {
            self.enqueue();
        }
        true
    }

    fn enqueue(self: &Arc<Self>) {
        if !self.job.runtime().scheduler.enqueue(Arc::clone(self)) {
            warn!(
                "Job {} thread {}: scheduler closed, thread not queued",
                self.job.number(),
                self.hierarchy
            );
        }
    }

    /// Cooperatively stops the thread.
    ///
    /// Injects a Terminate condition, records the end code (the first stop
    /// request wins) and invalidates outstanding wakers.
    pub fn terminate(self: &Arc<Self>, code: ThreadEndCode) {
        {
            let mut sched = self.sched.lock();
            if sched.state == ThreadState::Complete {
                return;
            }
            if sched.end_code == ThreadEndCode::Ok {
                sched.end_code = code;
            }
            sched.generation += 1;
        }
        {
            let mut conditions = self.conditions.lock();
            let pending = conditions
                .iter()
                .any(|c| matches!(c.kind(), ConditionKind::Terminate));
            if !pending {
                conditions.push(Condition::terminate(format!("Thread {}", self.hierarchy)));
            }
        }
        debug!(
            "Job {} thread {}: terminate requested ({})",
            self.job.number(),
            self.hierarchy,
            code
        );
        self.schedule();
    }

    /// Injects a condition and wakes the thread, invalidating outstanding
    /// wakers. The end code is left alone.
    pub fn interrupt(self: &Arc<Self>, condition: Condition) {
        {
            let mut sched = self.sched.lock();
            if sched.state == ThreadState::Complete {
                return;
            }
            sched.generation += 1;
        }
        debug!(
            "Job {} thread {}: interrupted by {}",
            self.job.number(),
            self.hierarchy,
            condition
        );
        self.add_condition(condition);
        self.schedule();
    }

    /// Runs one unit of work. Called by pool workers only.
    pub fn resume(self: &Arc<Self>) {
        if !self.begin_cycle() {
            return;
        }
        match self.run_cycle() {
            Cycle::Again => self.end_cycle(false),
            Cycle::Park => self.end_cycle(true),
            Cycle::Finished => self.complete(),
        }
    }

    fn begin_cycle(&self) -> bool {
        let mut sched = self.sched.lock();
        if sched.state != ThreadState::Runnable {
            error!(
                "Job {} thread {} dequeued while {:?}; refusing to run it",
                self.job.number(),
                self.hierarchy,
                sched.state
            );
            return false;
        }
        sched.state = ThreadState::Running;
        sched.wake_pending = false;
        true
    }

    fn run_cycle(self: &Arc<Self>) -> Cycle {
        let mut core = self.core.lock();

        if core.actions.is_empty() {
            return if self.sched.lock().children.is_empty() {
                Cycle::Finished
            } else {
                Cycle::Park
            };
        }

        let pending = self.conditions.lock().top().cloned();
        if let Some(condition) = &pending {
            if condition.kind().is_hold() {
                debug!(
                    "Job {} thread {} held by {}",
                    self.job.number(),
                    self.hierarchy,
                    condition
                );
                return Cycle::Park;
            }
        }

        let Some(mut action) = core.actions.pop() else {
            return Cycle::Finished;
        };
        let base = core.actions.len();

        let (outcome, popped) = {
            let mut ctx = ThreadContext {
                thread: self,
                core: &mut core,
                popped: false,
            };
            let outcome = match &pending {
                Some(condition) => action.handle_condition(&mut ctx, condition),
                None => action.execute(&mut ctx),
            };
            (outcome, ctx.popped)
        };

        if !popped {
            core.actions.insert(base, action);
        }

        match outcome {
            ActionOutcome::Proceed => Cycle::Again,
            ActionOutcome::Suspend => Cycle::Park,
        }
    }

    fn end_cycle(self: &Arc<Self>, park: bool) {
        let requeue = {
            let mut sched = self.sched.lock();
            if park && !sched.wake_pending {
                sched.state = ThreadState::Suspended;
                false
            } else {
                sched.wake_pending = false;
                sched.state = ThreadState::Runnable;
                true
            }
        };
        if requeue {
            self.enqueue();
        }
    }

    fn complete(self: &Arc<Self>) {
        let (end_code, listeners) = {
            let mut sched = self.sched.lock();
            sched.state = ThreadState::Complete;
            sched.generation += 1;
            (sched.end_code, std::mem::take(&mut sched.listeners))
        };

        let leftovers = self.conditions.lock().drain();
        let parent = self.parent();
        let mut handed_up = false;
        for condition in leftovers {
            if !condition.is_inheritable() {
                debug!(
                    "Job {} thread {}: dropping local condition {}",
                    self.job.number(),
                    self.hierarchy,
                    condition
                );
                continue;
            }
            match &parent {
                Some(p) => {
                    debug!(
                        "Job {} thread {}: passing {} to thread {}",
                        self.job.number(),
                        self.hierarchy,
                        condition,
                        p.hierarchy
                    );
                    handed_up |= p.add_condition(condition);
                }
                None => self.job.record_unhandled(condition),
            }
        }
        if let (true, Some(p)) = (handed_up, &parent) {
            p.schedule();
        }

        debug!(
            "Job {} thread {} complete ({})",
            self.job.number(),
            self.hierarchy,
            end_code
        );

        for listener in listeners {
            listener(self, end_code);
        }
        if let Some(p) = &parent {
            p.child_finished(self.id);
        }
        self.job.thread_finished(self, end_code);
    }

    fn child_finished(self: &Arc<Self>, child: ThreadId) {
        let all_done = {
            let mut sched = self.sched.lock();
            sched.children.remove(&child);
            sched.children.is_empty()
        };
        if all_done {
            self.schedule();
        }
    }

    /// Ends a thread whose action panicked on a worker.
    pub(crate) fn recover_from_panic(self: &Arc<Self>, message: String) {
        if self.is_complete() {
            error!(
                "Job {} thread {}: panic after completion: {}",
                self.job.number(),
                self.hierarchy,
                message
            );
            return;
        }
        error!(
            "Job {} thread {}: action panicked: {}",
            self.job.number(),
            self.hierarchy,
            message
        );
        self.core.lock().actions.clear();
        self.add_condition(Condition::exception(
            "ActionPanicked",
            Value::String(message),
            Vec::new(),
            format!("Thread {}", self.hierarchy),
        ));
        for child in self.children() {
            if let Some(thread) = self.job.thread(child) {
                thread.terminate(ThreadEndCode::StoppedByParent);
            }
        }
        self.complete();
    }

    /// Creates, admits and links a child thread without starting it.
    pub(crate) fn create_child(
        self: &Arc<Self>,
        core: &ThreadCore,
        bindings: Vec<(String, Value)>,
    ) -> Result<Arc<LogicalThread>, SpawnError> {
        let mut scope = core.scope.clone();
        for (name, value) in bindings {
            scope.set(name, value);
        }
        let child_core = ThreadCore {
            actions: Vec::new(),
            scope,
            signal_handlers: core.signal_handlers.clone(),
            signal_stack: Vec::new(),
        };
        let inherited = self.conditions.lock().inheritable();

        let child = self.job.admit_thread(true, |id| {
            LogicalThread::new(Arc::clone(&self.job), id, Some(self), child_core, inherited)
        })?;
        self.sched.lock().children.insert(child.id);

        debug!(
            "Job {} thread {} spawned thread {}",
            self.job.number(),
            self.hierarchy,
            child.hierarchy
        );
        Ok(child)
    }

    /// Pushes the first action of a fresh thread.
    pub(crate) fn push_initial(&self, action: Box<dyn Action>) {
        let mut core = self.core.lock();
        self.push_onto(&mut core, action);
    }

    pub(crate) fn set_variable(&self, name: &str, value: Value) {
        self.core.lock().scope.set(name, value);
    }

    fn push_onto(&self, core: &mut ThreadCore, action: Box<dyn Action>) {
        if let Some(breakpoint) = self.job.breakpoint_hit(action.as_ref()) {
            info!(
                "Job {} thread {} stopped at breakpoint {} ({})",
                self.job.number(),
                self.hierarchy,
                breakpoint,
                action.meta().location()
            );
            self.add_condition(Condition::hold(format!("Breakpoint {}", breakpoint)));
        }
        core.actions.push(action);
    }

    /// Read-only summary; does not wait long for a running cycle.
    pub fn summary(&self) -> ThreadSummary {
        let state = self.state();
        let (current_action, call_stack) = match self.core.try_lock_for(SNAPSHOT_WAIT) {
            Some(core) => (
                core.actions.last().map(|a| a.info()),
                call_stack_of(&core.actions),
            ),
            None => (None, Vec::new()),
        };
        ThreadSummary {
            id: self.id,
            parent: self.parent_id,
            hierarchy: self.hierarchy.clone(),
            state,
            started_at: self.started_at,
            current_action,
            call_stack,
        }
    }

    /// Read-only view of the stacks and variables.
    pub fn detail(&self) -> ThreadDetail {
        let summary = self.summary();
        let conditions = self.conditions().iter().map(Condition::to_string).collect();
        let (actions, variables) = match self.core.try_lock_for(SNAPSHOT_WAIT) {
            Some(core) => (
                core.actions
                    .iter()
                    .rev()
                    .map(|a| ActionSnapshot {
                        element: a.meta().element.clone(),
                        location: a.meta().location(),
                        info: a.info(),
                        details: a.details(),
                    })
                    .collect(),
                core.scope.clone(),
            ),
            None => (Vec::new(), Scope::new()),
        };
        ThreadDetail {
            summary,
            actions,
            conditions,
            variables,
        }
    }
}

impl fmt::Debug for LogicalThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalThread")
            .field("job", &self.job.number())
            .field("hierarchy", &self.hierarchy)
            .field("state", &self.state())
            .finish()
    }
}

fn call_stack_of(actions: &[Box<dyn Action>]) -> Vec<String> {
    actions
        .iter()
        .filter_map(|a| a.function_name().map(str::to_string))
        .collect()
}

/// One-shot wake handle for a suspended thread.
///
/// Waking is a no-op once the thread was terminated or completed after the
/// handle was created.
#[derive(Debug)]
pub struct Waker {
    thread: Weak<LogicalThread>,
    generation: u64,
}

impl Waker {
    /// Makes the thread runnable; returns false if the handle is stale.
    pub fn wake(self) -> bool {
        match self.thread.upgrade() {
            Some(thread) => {
                let woken = thread.schedule_if(Some(self.generation));
                if !woken {
                    debug!("Ignoring stale wake for thread {}", thread.hierarchy);
                }
                woken
            }
            None => false,
        }
    }
}

/// Summary row for thread listings.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSummary {
    pub id: ThreadId,
    pub parent: Option<ThreadId>,
    pub hierarchy: String,
    pub state: ThreadState,
    pub started_at: DateTime<Local>,
    pub current_action: Option<String>,
    pub call_stack: Vec<String>,
}

/// One action on a thread's stack.
#[derive(Debug, Clone, Serialize)]
pub struct ActionSnapshot {
    pub element: String,
    pub location: String,
    pub info: String,
    pub details: String,
}

/// Full view of one thread, innermost action first.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadDetail {
    #[serde(flatten)]
    pub summary: ThreadSummary,
    pub actions: Vec<ActionSnapshot>,
    pub conditions: Vec<String>,
    pub variables: Scope,
}

/// What an action sees of its thread while it runs.
pub struct ThreadContext<'a> {
    thread: &'a Arc<LogicalThread>,
    core: &'a mut ThreadCore,
    popped: bool,
}

impl<'a> ThreadContext<'a> {
    pub fn thread(&self) -> &Arc<LogicalThread> {
        self.thread
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread.id
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.thread.job
    }

    /// Pushes an action above the running one.
    pub fn push_action(&mut self, action: Box<dyn Action>) {
        self.thread.push_onto(self.core, action);
    }

    /// Removes the running action from the stack once it returns.
    pub fn pop_action(&mut self) {
        self.popped = true;
    }

    /// Number of actions below the running one.
    pub fn depth(&self) -> usize {
        self.core.actions.len()
    }

    pub fn add_condition(&self, condition: Condition) -> bool {
        self.thread.add_condition(condition)
    }

    pub fn remove_condition(&self, id: ConditionId) -> Option<Condition> {
        self.thread.remove_condition(id)
    }

    pub fn remove_conditions<F>(&self, pred: F) -> Vec<Condition>
    where
        F: FnMut(&Condition) -> bool,
    {
        self.thread.remove_conditions_where(pred)
    }

    pub fn scope(&self) -> &Scope {
        &self.core.scope
    }

    pub fn scope_mut(&mut self) -> &mut Scope {
        &mut self.core.scope
    }

    pub fn set_var(&mut self, name: &str, value: Value) {
        self.core.scope.set(name, value);
    }

    pub fn eval_value(&self, expr: &str) -> Result<Value, EvalError> {
        self.job().evaluator().eval_value(expr, &self.core.scope)
    }

    pub fn eval_string(&self, expr: &str) -> Result<String, EvalError> {
        self.job().evaluator().eval_string(expr, &self.core.scope)
    }

    pub fn eval_bool(&self, expr: &str) -> Result<bool, EvalError> {
        self.eval_value(expr).map(|v| is_truthy(&v))
    }

    /// Evaluates to an integer, accepting integral floats and numeric text.
    pub fn eval_int(&self, expr: &str) -> Result<i64, EvalError> {
        let value = self.eval_value(expr)?;
        let int = match &value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        int.ok_or_else(|| EvalError::new(expr, format!("expected an integer, got {}", value)))
    }

    /// Evaluates to a list; a map yields its keys.
    pub fn eval_list(&self, expr: &str) -> Result<Vec<Value>, EvalError> {
        match self.eval_value(expr)? {
            Value::Array(items) => Ok(items),
            Value::Object(map) => Ok(map.keys().cloned().map(Value::String).collect()),
            other => Err(EvalError::new(expr, format!("expected a list, got {}", other))),
        }
    }

    pub fn exec(&mut self, script: &str) -> Result<(), EvalError> {
        let evaluator = Arc::clone(self.job().evaluator());
        evaluator.exec(script, &mut self.core.scope)
    }

    /// Names of the functions currently on the stack, outermost first.
    pub fn call_stack(&self) -> Vec<String> {
        call_stack_of(&self.core.actions)
    }

    /// Raises an Exception carrying the current call stack.
    pub fn raise_exception(&mut self, name: &str, data: Value, source: &str) {
        let stack_trace = self.call_stack();
        self.add_condition(Condition::exception(name, data, stack_trace, source));
    }

    /// Pops the running action and raises an evaluation error for it.
    pub fn fail(&mut self, meta: &ActionMeta, err: EvalError) -> ActionOutcome {
        warn!(
            "Job {} thread {}: {} at {}",
            self.job().number(),
            self.thread.hierarchy,
            err,
            meta.location()
        );
        self.pop_action();
        let data = json!({ "expression": err.expression, "message": err.message });
        self.raise_exception(EVALUATION_ERROR, data, &meta.location());
        ActionOutcome::Proceed
    }

    /// Dispatches a named signal.
    ///
    /// A registered handler is pushed; without one the signal becomes an
    /// Exception of the same name. Raising a signal that is already being
    /// handled stops the thread with [`ThreadEndCode::DuplicateSignal`].
    pub fn raise_signal(&mut self, signal: &str, data: Value, source: &str) {
        if self.core.signal_stack.iter().any(|s| s == signal) {
            error!(
                "Job {} thread {}: signal {} raised while already being handled",
                self.job().number(),
                self.thread.hierarchy,
                signal
            );
            self.thread.terminate(ThreadEndCode::DuplicateSignal);
            return;
        }
        match self.core.signal_handlers.get(signal).cloned() {
            Some(handler) => {
                debug!(
                    "Job {} thread {}: handling signal {}",
                    self.job().number(),
                    self.thread.hierarchy,
                    signal
                );
                self.push_action(Box::new(crate::action::basic::SignalDispatch::new(
                    signal, handler,
                )));
            }
            None => self.raise_exception(signal, data, source),
        }
    }

    pub fn register_signal_handler(&mut self, signal: &str, handler: Arc<dyn Action>) {
        self.core.signal_handlers.insert(signal.to_string(), handler);
    }

    pub(crate) fn enter_signal(&mut self, signal: &str) {
        self.core.signal_stack.push(signal.to_string());
    }

    pub(crate) fn leave_signal(&mut self, signal: &str) {
        if let Some(at) = self.core.signal_stack.iter().rposition(|s| s == signal) {
            self.core.signal_stack.remove(at);
        }
    }

    pub fn function(&self, name: &str) -> Option<Arc<FunctionAction>> {
        self.job().function(name)
    }

    /// Starts a child thread running `action`.
    ///
    /// The child gets a copy of this thread's scope plus `bindings`, its
    /// signal handlers and its inheritable conditions. `on_complete` is
    /// registered before the child can run.
    pub fn spawn_child(
        &mut self,
        action: Box<dyn Action>,
        bindings: Vec<(String, Value)>,
        on_complete: ThreadCompleteListener,
    ) -> Result<Arc<LogicalThread>, SpawnError> {
        let child = self.thread.create_child(self.core, bindings)?;
        child.add_completion_notifiee(on_complete);
        child.push_initial(action);
        child.schedule();
        Ok(child)
    }

    pub fn waker(&self) -> Waker {
        self.thread.waker()
    }

    pub fn timers(&self) -> &TimedEventQueue {
        &self.job().runtime().timers
    }
}
