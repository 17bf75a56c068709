//! ActionTree - Workflow Execution Engine
//!
//! Interprets declarative workflow documents as trees of actions. Each job
//! runs on one or more logical threads that are multiplexed over a fixed
//! pool of workers; control flow between actions (loops, returns,
//! exceptions, holds and termination) travels as prioritized conditions.
//!
//! # Architecture
//!
//! The library is organized into six modules:
//!
//! - [`workflow`]: document trees, YAML loading and structural validation
//! - [`action`]: the action trait, factories and every built-in action
//! - [`condition`]: condition kinds, priorities and per-thread stacks
//! - [`eval`]: the expression evaluator and variable scopes
//! - [`execution`]: engine, jobs, logical threads and the worker pool
//! - [`monitoring`]: per-thread execution timeline
//!
//! # Example
//!
//! ```rust,no_run
//! use actiontree::{load_document, Engine, EngineConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(EngineConfig::default().with_workers(4))?;
//!     let document = load_document("nightly.yaml")?;
//!
//!     let job = engine.submit_document(&document, "nightly.yaml")?;
//!     job.wait();
//!
//!     if let Some(outcome) = job.outcome() {
//!         println!("{}: {}", outcome.status, outcome.result);
//!     }
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod condition;
pub mod eval;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use action::{Action, ActionFactory, ActionMeta, ActionOutcome, FactoryRegistry, ParseContext};
pub use condition::{Condition, ConditionKind, ExceptionInfo};
pub use eval::{CelEvaluator, Evaluator, Scope};
pub use execution::{Engine, EngineConfig, Job, JobOutcome, JobStatus, SubmitError, ThreadEndCode};
pub use workflow::model::{JobDefinition, Node};
pub use workflow::parser::load_document;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "ActionTree";
