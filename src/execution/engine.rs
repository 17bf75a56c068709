//! Workflow Execution Engine
//!
//! The engine owns everything a job needs at run time:
//! - the factory registry used to build definitions from documents
//! - the worker pool and its run queue
//! - the timer thread
//! - the engine-wide thread budget and the table of active jobs
//!
//! Jobs are submitted from a [`JobDefinition`] or a document tree and run
//! asynchronously; callers wait on the returned [`Job`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;

use super::config::{ConfigError, EngineConfig};
use super::job::{Job, JobNumber, SpawnError};
use super::pool::{Scheduler, ThreadBudget, WorkerPool};
use super::result::JobResult;
use super::timed_events::TimedEventQueue;
use crate::action::factory::{ActionFactory, FactoryRegistry, ParseContext, RegistryError};
use crate::action::flow::SequenceAction;
use crate::action::function::CallAction;
use crate::action::{Action, ActionMeta};
use crate::eval::{CelEvaluator, Evaluator};
use crate::workflow::model::{JobDefinition, Node};
use crate::workflow::parser::build_definition;
use crate::workflow::validator::ParseError;

/// Shared run-time services every job and thread reaches through its job.
pub(crate) struct Runtime {
    pub(crate) scheduler: Scheduler,
    pub(crate) evaluator: Arc<dyn Evaluator>,
    pub(crate) timers: TimedEventQueue,
    pub(crate) budget: ThreadBudget,
    pub(crate) max_threads_per_job: usize,
}

/// Engine construction failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot start engine threads: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Why a job could not be submitted.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("engine is shutting down")]
    ShuttingDown,
    #[error("engine reached its limit of {limit} live threads")]
    Capacity { limit: usize },
    #[error("job {job_number}: start function '{function}' does not exist")]
    UnknownFunction { job_number: JobNumber, function: String },
    #[error("job {job_number}: cannot start root thread: {source}")]
    Spawn {
        job_number: JobNumber,
        #[source]
        source: SpawnError,
    },
    #[error("job {job_number}: {source}")]
    Build {
        job_number: JobNumber,
        #[source]
        source: ParseError,
    },
}

/// Serializable error record for a submission that got a job number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub job_number: JobNumber,
    pub error_message: String,
}

impl SubmitError {
    /// Job number assigned before the failure, if any.
    pub fn job_number(&self) -> Option<JobNumber> {
        match self {
            Self::UnknownFunction { job_number, .. }
            | Self::Build { job_number, .. }
            | Self::Spawn { job_number, .. } => Some(*job_number),
            Self::ShuttingDown | Self::Capacity { .. } => None,
        }
    }

    /// Numeric status for callers that report return codes.
    pub fn status_code(&self) -> u32 {
        match self {
            Self::ShuttingDown => 33,
            Self::Build { .. } => 47,
            Self::UnknownFunction { .. } => 48,
            Self::Capacity { .. } => 58,
            Self::Spawn { .. } => 59,
        }
    }

    pub fn payload(&self) -> Option<ErrorPayload> {
        self.job_number().map(|job_number| ErrorPayload {
            job_number,
            error_message: self.to_string(),
        })
    }
}

type JobTable = Arc<Mutex<BTreeMap<JobNumber, Arc<Job>>>>;

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use actiontree::execution::{Engine, EngineConfig};
/// use actiontree::workflow::parser::load_document;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Engine::new(EngineConfig::default().with_workers(4))?;
///     let document = load_document("nightly.yaml")?;
///
///     let job = engine.submit_document(&document, "nightly.yaml")?;
///     job.wait();
///     println!("{:?}", job.outcome().map(|o| o.status));
///     Ok(())
/// }
/// ```
pub struct Engine {
    config: EngineConfig,
    registry: RwLock<FactoryRegistry>,
    runtime: Arc<Runtime>,
    pool: Mutex<WorkerPool>,
    jobs: JobTable,
    next_job: AtomicU64,
    shutting_down: AtomicBool,
}

impl Engine {
    /// Starts an engine with the built-in actions and the default evaluator.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_parts(config, FactoryRegistry::with_builtins(), Arc::new(CelEvaluator::new()))
    }

    /// Starts an engine with a custom registry and evaluator.
    pub fn with_parts(
        config: EngineConfig,
        registry: FactoryRegistry,
        evaluator: Arc<dyn Evaluator>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let pool = WorkerPool::new(config.workers)?;
        let timers = TimedEventQueue::start()?;
        let runtime = Arc::new(Runtime {
            scheduler: pool.scheduler().clone(),
            evaluator,
            timers,
            budget: ThreadBudget::new(config.max_live_threads),
            max_threads_per_job: config.max_threads_per_job,
        });

        info!(
            "Engine started (workers: {}, max live threads: {}, max threads per job: {})",
            config.workers, config.max_live_threads, config.max_threads_per_job
        );

        Ok(Self {
            config,
            registry: RwLock::new(registry),
            runtime,
            pool: Mutex::new(pool),
            jobs: Arc::new(Mutex::new(BTreeMap::new())),
            next_job: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registers an extension factory.
    pub fn register_factory(&self, factory: Arc<dyn ActionFactory>) -> Result<(), RegistryError> {
        self.registry.write().register(factory)
    }

    /// Registered element names.
    pub fn elements(&self) -> Vec<String> {
        self.registry
            .read()
            .elements()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Combined grammar documentation of the registered elements.
    pub fn grammar(&self) -> String {
        self.registry.read().grammar()
    }

    /// Builds and submits a document tree.
    pub fn submit_document(&self, document: &Node, name: &str) -> Result<Arc<Job>, SubmitError> {
        let job_number = self.reserve()?;
        let definition = {
            let registry = self.registry.read();
            let ctx = ParseContext::new(&registry, name, self.config.machine.clone());
            build_definition(document, &ctx)
        };
        match definition {
            Ok(definition) => self.launch(job_number, definition),
            Err(source) => {
                self.runtime.budget.release();
                warn!("Job {}: document rejected: {}", job_number, source);
                Err(SubmitError::Build { job_number, source })
            }
        }
    }

    /// Submits a job and starts its root thread.
    ///
    /// Fails without assigning a job number when the engine is at capacity.
    pub fn submit(&self, definition: JobDefinition) -> Result<Arc<Job>, SubmitError> {
        let job_number = self.reserve()?;
        self.launch(job_number, definition)
    }

    /// Claims the root thread's budget slot and a job number.
    fn reserve(&self) -> Result<JobNumber, SubmitError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(SubmitError::ShuttingDown);
        }
        if !self.runtime.budget.try_acquire() {
            warn!(
                "Submission rejected: {} live threads at limit {}",
                self.runtime.budget.live(),
                self.runtime.budget.limit()
            );
            return Err(SubmitError::Capacity {
                limit: self.runtime.budget.limit(),
            });
        }
        Ok(self.next_job.fetch_add(1, Ordering::Relaxed))
    }

    fn launch(&self, job_number: JobNumber, definition: JobDefinition) -> Result<Arc<Job>, SubmitError> {
        let root_action = match build_root(&definition) {
            Ok(action) => action,
            Err(function) => {
                self.runtime.budget.release();
                warn!("Job {}: start function '{}' does not exist", job_number, function);
                return Err(SubmitError::UnknownFunction { job_number, function });
            }
        };

        let job = Job::new(job_number, definition, Arc::clone(&self.runtime));
        self.jobs.lock().insert(job_number, Arc::clone(&job));

        let jobs = Arc::clone(&self.jobs);
        let result_dir = self.config.result_dir.clone();
        job.add_completion_notifiee(Box::new(move |job| {
            jobs.lock().remove(&job.number());
            if let (Some(dir), Some(record)) = (&result_dir, JobResult::from_job(job)) {
                if let Err(e) = record.save(dir) {
                    error!("Job {}: failed to save result: {}", job.number(), e);
                }
            }
        }));

        if let Err(source) = job.start(root_action) {
            self.jobs.lock().remove(&job_number);
            self.runtime.budget.release();
            error!("Job {}: cannot start root thread: {}", job_number, source);
            return Err(SubmitError::Spawn { job_number, source });
        }
        Ok(job)
    }

    /// An active (not yet completed) job.
    pub fn job(&self, number: JobNumber) -> Option<Arc<Job>> {
        self.jobs.lock().get(&number).cloned()
    }

    /// Numbers of all active jobs.
    pub fn jobs(&self) -> Vec<JobNumber> {
        self.jobs.lock().keys().copied().collect()
    }

    /// Live logical threads across all jobs.
    pub fn live_threads(&self) -> usize {
        self.runtime.budget.live()
    }

    pub fn terminate_job(&self, number: JobNumber) -> bool {
        match self.job(number) {
            Some(job) => {
                job.terminate();
                true
            }
            None => false,
        }
    }

    /// Stops accepting jobs, winds down active ones, then stops the workers
    /// and the timer thread.
    ///
    /// Active jobs are terminated and given the configured grace period.
    /// Jobs still running after that are completed as they stand, so their
    /// listeners fire and waiters return.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let active: Vec<Arc<Job>> = self.jobs.lock().values().cloned().collect();
        if !active.is_empty() {
            warn!("Shutting down with {} active job(s)", active.len());
            for job in &active {
                job.terminate();
            }
            let deadline = Instant::now() + self.config.shutdown_grace();
            for job in &active {
                let left = deadline.saturating_duration_since(Instant::now());
                if !job.wait_timeout(left) {
                    job.force_complete();
                }
            }
        }
        self.pool.lock().shutdown();
        self.runtime.timers.shutdown();
        info!("Engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Root action of a job: the prologue, then the start function call.
///
/// Fails with the name of a start function that is not defined.
fn build_root(definition: &JobDefinition) -> Result<Box<dyn Action>, String> {
    let mut children: Vec<Arc<dyn Action>> = definition.prologue.clone();
    if let Some(start) = &definition.start_function {
        if !definition.functions.contains_key(start) {
            return Err(start.clone());
        }
        children.push(Arc::new(CallAction::direct(
            start.clone(),
            definition.start_args.clone(),
        )));
    }
    let meta = ActionMeta::new("job").with_document(definition.document.clone(), definition.machine.clone());
    Ok(Box::new(SequenceAction::new(Arc::new(meta), children)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::basic::NopAction;
    use crate::execution::job::JobStatus;
    use std::time::Duration;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default().with_workers(2)).unwrap()
    }

    #[test]
    fn test_submit_empty_definition() {
        let engine = engine();
        let job = engine.submit(JobDefinition::new("empty")).unwrap();
        assert!(job.wait_timeout(Duration::from_secs(5)));
        assert_eq!(job.outcome().unwrap().status, JobStatus::Normal);
        assert!(engine.job(job.number()).is_none());
        assert_eq!(engine.live_threads(), 0);
    }

    #[test]
    fn test_job_numbers_increase() {
        let engine = engine();
        let first = engine.submit(JobDefinition::new("a")).unwrap();
        let second = engine.submit(JobDefinition::new("b")).unwrap();
        assert!(second.number() > first.number());
        first.wait();
        second.wait();
    }

    #[test]
    fn test_unknown_start_function() {
        let engine = engine();
        let err = engine
            .submit(JobDefinition::new("bad").with_start("missing", None))
            .unwrap_err();
        assert_eq!(err.status_code(), 48);
        let payload = err.payload().unwrap();
        assert_eq!(payload.job_number, err.job_number().unwrap());
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json["errorMessage"].as_str().unwrap().contains("missing"));
        assert_eq!(engine.live_threads(), 0);
    }

    #[test]
    fn test_capacity_error_has_no_payload() {
        let err = SubmitError::Capacity { limit: 1 };
        assert!(err.payload().is_none());
        assert_eq!(err.status_code(), 58);
    }

    #[test]
    fn test_spawn_error_keeps_job_number() {
        let err = SubmitError::Spawn {
            job_number: 7,
            source: SpawnError::NotRunning(7),
        };
        assert_eq!(err.status_code(), 59);
        assert_ne!(err.status_code(), SubmitError::ShuttingDown.status_code());
        let payload = err.payload().unwrap();
        assert_eq!(payload.job_number, 7);
        assert!(payload.error_message.contains("cannot start root thread"));
    }

    #[test]
    fn test_register_extension_factory() {
        let engine = Engine::with_parts(
            EngineConfig::default().with_workers(1),
            FactoryRegistry::new(),
            Arc::new(CelEvaluator::new()),
        )
        .unwrap();
        assert!(engine.elements().is_empty());
        engine
            .register_factory(Arc::new(crate::action::basic::NopFactory))
            .unwrap();
        assert_eq!(engine.elements(), vec!["nop".to_string()]);
        assert!(engine.grammar().contains("<!ELEMENT nop EMPTY>"));
    }

    #[test]
    fn test_submit_after_shutdown() {
        let engine = engine();
        engine.shutdown();
        let err = engine
            .submit(JobDefinition::from_action("late", Arc::new(NopAction::bare())))
            .unwrap_err();
        assert!(matches!(err, SubmitError::ShuttingDown));
    }
}
