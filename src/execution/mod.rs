//! Workflow Execution Module
//!
//! Runs action trees on logical threads multiplexed over a worker pool.
//!
//! # Architecture
//!
//! - [`engine`]: submission, registries and engine lifecycle
//! - [`job`]: one execution of a definition, its threads and its outcome
//! - [`thread`]: logical threads and the context actions run in
//! - [`pool`]: worker threads, run queue and thread budget
//! - [`timed_events`]: delayed callbacks for timers and delays
//! - [`config`]: engine settings
//! - [`result`]: persisted job results

pub mod config;
pub mod engine;
pub mod job;
pub mod pool;
pub mod result;
pub mod thread;
pub mod timed_events;

pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineError, ErrorPayload, SubmitError};
pub use job::{
    Breakpoint, BreakpointTarget, Job, JobCompleteListener, JobNumber, JobOutcome, JobState,
    JobStatus, SpawnError,
};
pub use result::JobResult;
pub use thread::{
    LogicalThread, ThreadCompleteListener, ThreadContext, ThreadDetail, ThreadEndCode, ThreadId,
    ThreadState, ThreadSummary, Waker, ROOT_THREAD_ID,
};
