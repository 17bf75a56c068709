//! Jobs
//!
//! A job is one execution of a definition. It owns the table of live
//! logical threads, collects the root thread's result and the conditions
//! nobody handled, and completes exactly once when its last thread ends.
//!
//! External control (hold, release, terminate, breakpoints) and read-only
//! introspection also go through the job.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::engine::Runtime;
use super::thread::{
    LogicalThread, ThreadCore, ThreadDetail, ThreadEndCode, ThreadId, ThreadSummary,
    ROOT_THREAD_ID,
};
use crate::action::function::{FunctionAction, RESULT_VAR};
use crate::action::Action;
use crate::condition::{Condition, ConditionKind, ConditionStack};
use crate::eval::{Evaluator, Scope};
use crate::monitoring::ThreadTimeline;
use crate::workflow::model::JobDefinition;

/// Engine-wide job identifier.
pub type JobNumber = u64;

/// Callback fired once when a job completes.
pub type JobCompleteListener = Box<dyn FnOnce(&Arc<Job>) + Send>;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Complete,
}

/// Final verdict of a completed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Root thread ended OK with nothing left unhandled
    Normal,
    /// Stopped by an external request
    Terminated,
    /// Unhandled conditions, or the root thread did not end OK
    Abnormal,
    /// No root end code was recorded
    Unknown,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "NORMAL",
            Self::Terminated => "TERMINATED",
            Self::Abnormal => "ABNORMAL",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Everything known about a job once it has completed.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub end_code: Option<ThreadEndCode>,
    pub result: Value,
    pub unhandled: Vec<Condition>,
    pub started_at: Option<DateTime<Local>>,
    pub ended_at: DateTime<Local>,
}

/// Why a thread could not be created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpawnError {
    #[error("job {job} reached its limit of {limit} live threads")]
    JobLimit { job: JobNumber, limit: usize },
    #[error("engine reached its limit of {limit} live threads")]
    Capacity { limit: usize },
    #[error("job {0} is not accepting new threads")]
    NotRunning(JobNumber),
}

/// Where a breakpoint stops a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakpointTarget {
    /// Entry of a named function
    Function(String),
    /// An element on a document line; any document when none is given
    Line { document: Option<String>, line: u32 },
}

impl BreakpointTarget {
    fn matches(&self, action: &dyn Action) -> bool {
        match self {
            Self::Function(name) => action.function_name() == Some(name.as_str()),
            Self::Line { document, line } => {
                let meta = action.meta();
                meta.line == Some(*line)
                    && document.as_deref().map_or(true, |d| d == meta.document)
            }
        }
    }
}

/// A registered breakpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    pub id: u32,
    pub target: BreakpointTarget,
}

struct ThreadTable {
    live: BTreeMap<ThreadId, Arc<LogicalThread>>,
    next_id: ThreadId,
}

/// Source tag of the Terminate condition that stops a block.
pub(crate) fn block_stop_source(name: &str) -> String {
    format!("Block {}", name)
}

/// One running execution of a definition.
pub struct Job {
    number: JobNumber,
    definition: JobDefinition,
    runtime: Arc<Runtime>,
    created_at: DateTime<Local>,
    state: Mutex<JobState>,
    started: Mutex<Option<(DateTime<Local>, Instant)>>,
    threads: Mutex<ThreadTable>,
    /// Threads own their job, so the job only observes its root.
    root: OnceCell<Weak<LogicalThread>>,
    root_end: Mutex<Option<ThreadEndCode>>,
    result: Mutex<Option<Value>>,
    unhandled: Mutex<Vec<Condition>>,
    terminated: AtomicBool,
    outcome: OnceCell<JobOutcome>,
    listeners: Mutex<Vec<JobCompleteListener>>,
    done: Mutex<bool>,
    done_signal: Condvar,
    breakpoints: Mutex<Vec<Breakpoint>>,
    next_breakpoint: AtomicU32,
    timeline: Mutex<ThreadTimeline>,
    /// Running blocks by full name, with the thread each one runs on
    blocks: Mutex<BTreeMap<String, ThreadId>>,
}

impl Job {
    pub(crate) fn new(number: JobNumber, definition: JobDefinition, runtime: Arc<Runtime>) -> Arc<Self> {
        Arc::new(Self {
            number,
            definition,
            runtime,
            created_at: Local::now(),
            state: Mutex::new(JobState::Pending),
            started: Mutex::new(None),
            threads: Mutex::new(ThreadTable {
                live: BTreeMap::new(),
                next_id: ROOT_THREAD_ID,
            }),
            root: OnceCell::new(),
            root_end: Mutex::new(None),
            result: Mutex::new(None),
            unhandled: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
            outcome: OnceCell::new(),
            listeners: Mutex::new(Vec::new()),
            done: Mutex::new(false),
            done_signal: Condvar::new(),
            breakpoints: Mutex::new(Vec::new()),
            next_breakpoint: AtomicU32::new(1),
            timeline: Mutex::new(ThreadTimeline::new()),
            blocks: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn number(&self) -> JobNumber {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn document(&self) -> &str {
        &self.definition.document
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub fn state(&self) -> JobState {
        *self.state.lock()
    }

    pub fn is_complete(&self) -> bool {
        self.state() == JobState::Complete
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// The root thread while it is alive.
    pub fn root(&self) -> Option<Arc<LogicalThread>> {
        self.root.get().and_then(Weak::upgrade)
    }

    /// Final outcome; `None` until the job completes.
    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.get()
    }

    /// Result value recorded so far.
    pub fn result(&self) -> Option<Value> {
        self.result.lock().clone()
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn evaluator(&self) -> &Arc<dyn Evaluator> {
        &self.runtime.evaluator
    }

    pub fn function(&self, name: &str) -> Option<Arc<FunctionAction>> {
        self.definition.functions.get(name).cloned()
    }

    pub fn function_names(&self) -> Vec<String> {
        self.definition.functions.keys().cloned().collect()
    }

    /// Creates the root thread running `action` and makes it runnable.
    ///
    /// The root's slot in the global thread budget must already be held
    /// by the caller.
    pub fn start(self: &Arc<Self>, action: Box<dyn Action>) -> Result<Arc<LogicalThread>, SpawnError> {
        {
            let mut state = self.state.lock();
            if *state != JobState::Pending {
                return Err(SpawnError::NotRunning(self.number));
            }
            *state = JobState::Running;
        }
        *self.started.lock() = Some((Local::now(), Instant::now()));

        let mut scope = Scope::new();
        scope.set("JOB_NUMBER", Value::from(self.number));
        scope.set("JOB_NAME", Value::String(self.definition.name.clone()));

        let root = self.admit_thread(false, |id| {
            LogicalThread::new(
                Arc::clone(self),
                id,
                None,
                ThreadCore::new(scope),
                ConditionStack::new(),
            )
        })?;
        let _ = self.root.set(Arc::downgrade(&root));

        info!("Job {} '{}' started", self.number, self.definition.name);
        root.push_initial(action);
        root.schedule();
        Ok(root)
    }

    /// Registers a new thread under the table lock, enforcing limits.
    pub(crate) fn admit_thread<F>(&self, acquire_budget: bool, build: F) -> Result<Arc<LogicalThread>, SpawnError>
    where
        F: FnOnce(ThreadId) -> Arc<LogicalThread>,
    {
        let thread = {
            let mut table = self.threads.lock();
            if *self.state.lock() != JobState::Running {
                return Err(SpawnError::NotRunning(self.number));
            }
            let limit = self.runtime.max_threads_per_job;
            if limit != 0 && table.live.len() >= limit {
                return Err(SpawnError::JobLimit {
                    job: self.number,
                    limit,
                });
            }
            if acquire_budget && !self.runtime.budget.try_acquire() {
                return Err(SpawnError::Capacity {
                    limit: self.runtime.budget.limit(),
                });
            }
            let id = table.next_id;
            table.next_id += 1;
            let thread = build(id);
            table.live.insert(id, Arc::clone(&thread));
            thread
        };
        self.timeline.lock().thread_started(thread.hierarchy());
        Ok(thread)
    }

    /// Bookkeeping for a thread that just completed.
    pub(crate) fn thread_finished(self: &Arc<Self>, thread: &Arc<LogicalThread>, end_code: ThreadEndCode) {
        if thread.id() == ROOT_THREAD_ID {
            *self.root_end.lock() = Some(end_code);
            let mut result = self.result.lock();
            if result.is_none() {
                *result = thread.variable(RESULT_VAR);
            }
        }

        self.timeline
            .lock()
            .thread_finished(thread.hierarchy(), end_code);

        let empty = {
            let mut table = self.threads.lock();
            if table.live.remove(&thread.id()).is_some() {
                self.runtime.budget.release();
            }
            table.live.is_empty()
        };
        if empty {
            self.complete();
        }
    }

    /// Keeps a condition that reached the root without being handled.
    ///
    /// A Return that gets this far carries the job's result instead.
    pub(crate) fn record_unhandled(&self, condition: Condition) {
        if let ConditionKind::Return(value) = condition.kind() {
            let mut result = self.result.lock();
            if result.is_none() {
                *result = Some(value.clone());
            }
            return;
        }
        warn!("Job {}: unhandled condition {}", self.number, condition);
        self.unhandled.lock().push(condition);
    }

    fn status(&self) -> JobStatus {
        if self.is_terminated() {
            return JobStatus::Terminated;
        }
        match *self.root_end.lock() {
            None => JobStatus::Unknown,
            Some(code) if code != ThreadEndCode::Ok => JobStatus::Abnormal,
            Some(_) if !self.unhandled.lock().is_empty() => JobStatus::Abnormal,
            Some(_) => JobStatus::Normal,
        }
    }

    fn complete(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == JobState::Complete {
                return;
            }
            *state = JobState::Complete;
        }

        let outcome = JobOutcome {
            status: self.status(),
            end_code: *self.root_end.lock(),
            result: self.result().unwrap_or(Value::Null),
            unhandled: self.unhandled.lock().clone(),
            started_at: self.started.lock().map(|(at, _)| at),
            ended_at: Local::now(),
        };
        let elapsed = self.started.lock().map(|(_, at)| at.elapsed()).unwrap_or_default();
        info!(
            "Job {} '{}' complete: {} in {:.2?}",
            self.number, self.definition.name, outcome.status, elapsed
        );
        let _ = self.outcome.set(outcome);

        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener(self);
        }

        *self.done.lock() = true;
        self.done_signal.notify_all();
    }

    /// Completes a job whose threads did not wind down in time.
    ///
    /// Remaining threads are dropped from the table and their budget
    /// slots returned; they may still run once more but can no longer
    /// spawn or complete the job again.
    pub(crate) fn force_complete(self: &Arc<Self>) {
        let abandoned = {
            let mut table = self.threads.lock();
            std::mem::take(&mut table.live)
        };
        for _ in &abandoned {
            self.runtime.budget.release();
        }
        warn!(
            "Job {}: forcing completion with {} live thread(s)",
            self.number,
            abandoned.len()
        );
        self.complete();
    }

    /// Registers a listener fired once when the job completes.
    ///
    /// A listener added after completion fires immediately.
    pub fn add_completion_notifiee(self: &Arc<Self>, listener: JobCompleteListener) {
        {
            let mut listeners = self.listeners.lock();
            if self.outcome.get().is_none() {
                listeners.push(listener);
                return;
            }
        }
        listener(self);
    }

    /// Blocks until the job has completed and its listeners have run.
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.done_signal.wait(&mut done);
        }
    }

    /// Like [`Job::wait`] with a timeout; returns whether the job is done.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.done_signal.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }

    /// Stops the whole job.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        if let Some(root) = self.root() {
            info!("Job {}: terminate requested", self.number);
            root.terminate(ThreadEndCode::StoppedByParent);
        }
    }

    /// Stops one thread and, through its actions, its descendants.
    pub fn terminate_thread(&self, id: ThreadId) -> bool {
        match self.thread(id) {
            Some(thread) => {
                thread.terminate(ThreadEndCode::StoppedByParent);
                true
            }
            None => false,
        }
    }

    /// Holds a thread and all of its live descendants.
    pub fn hold(&self, id: ThreadId) -> bool {
        let lineage = self.lineage(id);
        if lineage.is_empty() {
            return false;
        }
        let hold = Condition::hold(format!("Job {} hold", self.number)).with_inheritable(true);
        for thread in &lineage {
            thread.add_condition(hold.clone());
        }
        info!("Job {}: held {} thread(s) from {}", self.number, lineage.len(), id);
        true
    }

    /// Removes holds from a thread and its live descendants.
    pub fn release(&self, id: ThreadId) -> bool {
        let lineage = self.lineage(id);
        if lineage.is_empty() {
            return false;
        }
        for thread in &lineage {
            let removed = thread.remove_conditions_where(|c| matches!(c.kind(), ConditionKind::Hold));
            if !removed.is_empty() {
                thread.schedule();
            }
        }
        info!("Job {}: released thread {}", self.number, id);
        true
    }

    fn lineage(&self, id: ThreadId) -> Vec<Arc<LogicalThread>> {
        let Some(head) = self.thread(id) else {
            return Vec::new();
        };
        let prefix = format!("{}.", head.hierarchy());
        let mut lineage: Vec<_> = self
            .threads
            .lock()
            .live
            .values()
            .filter(|t| t.hierarchy().starts_with(&prefix))
            .cloned()
            .collect();
        lineage.insert(0, head);
        lineage
    }

    /// Registers a running block. Fails when the name is taken.
    pub(crate) fn enter_block(&self, name: &str, thread: ThreadId) -> bool {
        let mut blocks = self.blocks.lock();
        if blocks.contains_key(name) {
            return false;
        }
        debug!("Job {}: block {} entered on thread {}", self.number, name, thread);
        blocks.insert(name.to_string(), thread);
        true
    }

    pub(crate) fn leave_block(&self, name: &str) {
        if self.blocks.lock().remove(name).is_some() {
            debug!("Job {}: block {} left", self.number, name);
        }
    }

    /// Names of the blocks currently running.
    pub fn blocks(&self) -> Vec<String> {
        self.blocks.lock().keys().cloned().collect()
    }

    pub fn block_thread(&self, name: &str) -> Option<ThreadId> {
        self.blocks.lock().get(name).copied()
    }

    /// Holds the thread running a block, with its descendants.
    pub fn hold_block(&self, name: &str) -> bool {
        self.block_thread(name).map_or(false, |id| self.hold(id))
    }

    pub fn release_block(&self, name: &str) -> bool {
        self.block_thread(name).map_or(false, |id| self.release(id))
    }

    /// Stops a block. The block consumes the Terminate and its thread
    /// carries on after it.
    pub fn terminate_block(&self, name: &str) -> bool {
        let Some(thread) = self.block_thread(name).and_then(|id| self.thread(id)) else {
            return false;
        };
        info!("Job {}: terminating block {}", self.number, name);
        thread.interrupt(Condition::terminate(block_stop_source(name)));
        true
    }

    pub fn add_breakpoint(&self, target: BreakpointTarget) -> u32 {
        let id = self.next_breakpoint.fetch_add(1, Ordering::Relaxed);
        debug!("Job {}: breakpoint {} at {:?}", self.number, id, target);
        self.breakpoints.lock().push(Breakpoint { id, target });
        id
    }

    pub fn remove_breakpoint(&self, id: u32) -> bool {
        let mut breakpoints = self.breakpoints.lock();
        let before = breakpoints.len();
        breakpoints.retain(|b| b.id != id);
        breakpoints.len() != before
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.lock().clone()
    }

    pub(crate) fn breakpoint_hit(&self, action: &dyn Action) -> Option<u32> {
        self.breakpoints
            .lock()
            .iter()
            .find(|b| b.target.matches(action))
            .map(|b| b.id)
    }

    pub fn thread(&self, id: ThreadId) -> Option<Arc<LogicalThread>> {
        self.threads.lock().live.get(&id).cloned()
    }

    pub fn live_thread_count(&self) -> usize {
        self.threads.lock().live.len()
    }

    pub fn threads(&self) -> Vec<ThreadSummary> {
        let live: Vec<_> = self.threads.lock().live.values().cloned().collect();
        live.iter().map(|t| t.summary()).collect()
    }

    pub fn thread_detail(&self, id: ThreadId) -> Option<ThreadDetail> {
        self.thread(id).map(|t| t.detail())
    }

    pub fn call_stack(&self, id: ThreadId) -> Option<Vec<String>> {
        self.thread(id).map(|t| t.summary().call_stack)
    }

    pub fn timeline(&self) -> ThreadTimeline {
        self.timeline.lock().clone()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("number", &self.number)
            .field("name", &self.definition.name)
            .field("state", &self.state())
            .finish()
    }
}
