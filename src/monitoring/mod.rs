//! Monitoring Module
//!
//! Per-job execution timeline of logical threads.
//!
//! # Components
//!
//! - [`ThreadTimeline`]: thread start/end timing, durations and Gantt charts

pub mod timeline;

pub use timeline::{ThreadSpan, ThreadTimeline};
