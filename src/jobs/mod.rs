//! Job coordinator: the shared table that hands each batch to exactly one
//! worker per pipeline stage.

pub mod postgres;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::error::{DedupError, Result};

pub use postgres::PgJobStore;
pub use sqlite::SqliteJobStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Extract,
    Filter,
    Dedup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Filter => "filter",
            Stage::Dedup => "dedup",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "download" => Ok(Stage::Download),
            "extract" => Ok(Stage::Extract),
            "filter" => Ok(Stage::Filter),
            "dedup" => Ok(Stage::Dedup),
            other => Err(DedupError::Config(format!("unknown stage '{}'", other))),
        }
    }
}

/// Per-stage job state. Stored as a small integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Finished,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Finished,
        JobState::Failed,
    ];

    pub fn code(self) -> i16 {
        match self {
            JobState::Pending => 0,
            JobState::Processing => 1,
            JobState::Finished => 2,
            JobState::Failed => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        JobState::ALL.into_iter().find(|s| s.code() == code)
    }

    /// The four permitted moves. FINISHED and FAILED are terminal.
    pub fn can_transition_to(self, to: JobState) -> bool {
        matches!(
            (self, to),
            (JobState::Pending, JobState::Processing)
                | (JobState::Processing, JobState::Finished)
                | (JobState::Processing, JobState::Failed)
                | (JobState::Processing, JobState::Pending)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Job {
    pub id: i64,
    pub uri: String,
    pub stage: Stage,
    pub state: JobState,
    pub worker_id: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Row of `dedup_results`, written together with FINISHED.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DedupStats {
    pub unique_docs: u64,
    pub duplicate_docs: u64,
    /// Removed by a document filter before fingerprinting (counted in
    /// `duplicate_docs` too).
    pub filtered_docs: u64,
    /// Entries that were not valid documents and were dropped.
    pub rejected_docs: u64,
    pub unique_bytes: u64,
    pub duplicate_bytes: u64,
    pub source_digest: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: u64,
    pub processing: u64,
    pub finished: u64,
    pub failed: u64,
}

impl StateCounts {
    pub(crate) fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Pending => self.pending += n,
            JobState::Processing => self.processing += n,
            JobState::Finished => self.finished += n,
            JobState::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.finished + self.failed
    }
}

pub trait JobStore: Send + Sync {
    /// Id of the worker called `name`, registering it on first use.
    fn register_worker(&self, name: &str) -> Result<i64>;

    /// Adds a PENDING job; false when `(uri, stage)` already exists.
    fn enqueue(&self, stage: Stage, uri: &str) -> Result<bool>;

    /// Atomically moves one PENDING job of `stage` to PROCESSING for
    /// `worker_id`, skipping rows other workers are claiming. `None` when no
    /// job is pending. Never waits on another worker's claim.
    fn claim(&self, stage: Stage, worker_id: i64) -> Result<Option<Job>>;

    fn finish(&self, job: &Job, worker_id: i64, stats: &DedupStats) -> Result<()>;

    fn fail(&self, job: &Job, worker_id: i64, error: &str) -> Result<()>;

    /// Returns a job held by `worker_id` to PENDING.
    fn cancel(&self, job: &Job, worker_id: i64) -> Result<()>;

    /// Operator release of a PROCESSING job, whichever worker holds it.
    fn release(&self, job_id: i64) -> Result<()>;

    fn counts(&self, stage: Stage) -> Result<StateCounts>;

    fn get(&self, job_id: i64) -> Result<Option<Job>>;

    fn result(&self, job_id: i64) -> Result<Option<DedupStats>>;
}

pub fn open_jobs(store: &StoreConfig) -> Result<Arc<dyn JobStore>> {
    Ok(match store {
        StoreConfig::Sqlite { path } => Arc::new(SqliteJobStore::open(path)?),
        StoreConfig::Postgres { url, pool_size } => Arc::new(PgJobStore::connect(url, *pool_size)?),
    })
}

pub(crate) fn parse_state(code: i16) -> Result<JobState> {
    JobState::from_code(code).ok_or_else(|| DedupError::Store(format!("unknown job state code {}", code)))
}

pub(crate) fn parse_stage(name: &str) -> Result<Stage> {
    name.parse()
        .map_err(|_| DedupError::Store(format!("unknown stage '{}'", name)))
}

pub(crate) fn rejected_transition(job_id: i64, current: Option<JobState>, to: JobState) -> DedupError {
    DedupError::InvalidTransition {
        job_id,
        from: current,
        to,
    }
}
