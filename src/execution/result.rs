//! Job Result Persistence
//!
//! When a result directory is configured, the engine writes one JSON record
//! per completed job to `{result_dir}/job-{number}.json`.

use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::{Job, JobNumber, JobStatus};
use super::thread::ThreadEndCode;
use crate::condition::Condition;

/// Persisted summary of a completed job.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JobResult {
    pub job_number: JobNumber,
    pub job_name: String,
    pub document: String,
    pub status: JobStatus,
    pub end_code: Option<ThreadEndCode>,
    pub result: Value,
    pub unhandled: Vec<Condition>,
    pub started_at: Option<DateTime<Local>>,
    pub ended_at: DateTime<Local>,

    /// Run time of each thread by timeline name, e.g. `T1.2`
    pub thread_durations_ms: BTreeMap<String, u64>,
}

impl JobResult {
    /// Builds the record for a completed job; `None` while it is running.
    pub fn from_job(job: &Job) -> Option<Self> {
        let outcome = job.outcome()?;
        Some(Self {
            job_number: job.number(),
            job_name: job.name().to_string(),
            document: job.document().to_string(),
            status: outcome.status,
            end_code: outcome.end_code,
            result: outcome.result.clone(),
            unhandled: outcome.unhandled.clone(),
            started_at: outcome.started_at,
            ended_at: outcome.ended_at,
            thread_durations_ms: job.timeline().durations(),
        })
    }

    pub fn file_name(job_number: JobNumber) -> String {
        format!("job-{}.json", job_number)
    }

    /// Writes the record into `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, Box<dyn Error>> {
        fs::create_dir_all(dir)?;

        let path = dir.join(Self::file_name(self.job_number));
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;

        info!("Saved result of job {} to {}", self.job_number, path.display());
        Ok(path)
    }

    /// Reads the record of a job from `dir`.
    pub fn load(dir: &Path, job_number: JobNumber) -> Result<Self, Box<dyn Error>> {
        let path = dir.join(Self::file_name(job_number));
        let content = fs::read_to_string(&path)?;
        let result: JobResult = serde_json::from_str(&content)?;
        Ok(result)
    }
}
