//! The dedup worker loop: claim a batch, classify it, commit its outputs,
//! and settle the job.
//!
//! Commit sequence for one batch:
//!
//! 1. stage the unique and duplicate partitions beside their final paths,
//! 2. boundary check: an interrupt here removes the staged files and returns
//!    the job to PENDING,
//! 3. commit the index records in one transaction (the commit point),
//! 4. publish the staged partitions, then move the source batch under the
//!    processed root,
//! 5. mark the job FINISHED together with its result row.
//!
//! After step 3 the batch only moves forward; an interrupt is honoured once
//! the job is settled.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::config::AppConfig;
use crate::dedup::BatchDeduplicator;
use crate::document::{read_partition, Batch};
use crate::error::{DedupError, Result};
use crate::index::lookup::LookupPool;
use crate::index::{open_index, CrossBatchChecker, DuplicateIndex};
use crate::jobs::{open_jobs, DedupStats, Job, JobState, JobStore, Stage};
use crate::retry::RetryPolicy;
use crate::writer::{CommitStage, PartitionWriter, StagedCommit};

type StageHook = Box<dyn Fn(CommitStage) -> Result<()> + Send + Sync>;

const IDLE_TICK: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct BatchReport {
    pub job_id: i64,
    pub uri: String,
    pub stats: DedupStats,
    pub elapsed: Duration,
}

/// How a claimed job was settled.
#[derive(Clone, Debug)]
pub enum JobOutcome {
    Finished(BatchReport),
    /// Found already committed by an earlier attempt and only marked finished.
    Recovered(BatchReport),
    Failed { job_id: i64, error: String },
    /// Interrupted before the commit point and returned to PENDING.
    Released { job_id: i64 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub finished: usize,
    pub failed: usize,
    pub released: usize,
}

/// Result of steps 1 to 3.
struct Committed {
    stats: DedupStats,
    staged: StagedCommit,
}

pub struct DedupWorker {
    jobs: Arc<dyn JobStore>,
    checker: CrossBatchChecker,
    dedup: BatchDeduplicator,
    writer: PartitionWriter,
    retry: RetryPolicy,
    lookup_workers: usize,
    cancel: CancelToken,
    worker_id: i64,
    name: String,
    hook: Option<StageHook>,
}

impl DedupWorker {
    /// Opens both stores from configuration, retrying while they are
    /// unreachable.
    pub fn open(config: &AppConfig, cancel: CancelToken) -> Result<Self> {
        let retry = RetryPolicy::from_config(&config.worker);
        let jobs = retry.run("open job store", || open_jobs(&config.store))?;
        let index = retry.run("open duplicate index", || {
            open_index(&config.store, config.dedup.num_bands)
        })?;
        Self::new(config, jobs, index, cancel)
    }

    pub fn new(
        config: &AppConfig,
        jobs: Arc<dyn JobStore>,
        index: Arc<dyn DuplicateIndex>,
        cancel: CancelToken,
    ) -> Result<Self> {
        config.dedup.validate()?;
        config.worker.validate()?;
        if index.num_bands() != config.dedup.num_bands {
            return Err(DedupError::Config(format!(
                "index has {} bands, configuration asks for {}",
                index.num_bands(),
                config.dedup.num_bands
            )));
        }

        let retry = RetryPolicy::from_config(&config.worker);
        let worker_id = retry.run("register worker", || jobs.register_worker(&config.worker.name))?;
        info!(worker = %config.worker.name, worker_id, "worker registered");

        Ok(Self {
            checker: CrossBatchChecker::new(index, &config.dedup, &config.paths.unique_root),
            dedup: BatchDeduplicator::new(&config.dedup, config.worker.signature_threads())?,
            writer: PartitionWriter::new(config.paths.clone()),
            lookup_workers: config.worker.lookup_workers,
            name: config.worker.name.clone(),
            jobs,
            retry,
            cancel,
            worker_id,
            hook: None,
        })
    }

    /// Runs `hook` at every commit boundary. An error at
    /// [`CommitStage::PartitionsWritten`] aborts the batch; later errors are
    /// logged and the commit rolls forward.
    pub fn with_stage_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(CommitStage) -> Result<()> + Send + Sync + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }

    /// Processes jobs until the queue is empty (or, with `poll`, until
    /// interrupted). Returns an error only when the job store stays
    /// unreachable past the retry budget.
    pub fn run(&self, poll: Option<Duration>) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        loop {
            if self.cancel.is_cancelled() {
                info!(worker = %self.name, "interrupted, stopping");
                break;
            }
            match self.run_once()? {
                Some(JobOutcome::Finished(_)) | Some(JobOutcome::Recovered(_)) => summary.finished += 1,
                Some(JobOutcome::Failed { .. }) => summary.failed += 1,
                Some(JobOutcome::Released { .. }) => summary.released += 1,
                None => match poll {
                    Some(interval) => self.idle(interval),
                    None => {
                        info!(worker = %self.name, "no pending jobs");
                        break;
                    }
                },
            }
        }
        info!(
            worker = %self.name,
            finished = summary.finished,
            failed = summary.failed,
            released = summary.released,
            "worker done"
        );
        Ok(summary)
    }

    fn idle(&self, interval: Duration) {
        let until = Instant::now() + interval;
        while Instant::now() < until && !self.cancel.is_cancelled() {
            std::thread::sleep(IDLE_TICK.min(interval));
        }
    }

    /// Claims and settles at most one job.
    pub fn run_once(&self) -> Result<Option<JobOutcome>> {
        let claimed = self
            .retry
            .run("claim job", || self.jobs.claim(Stage::Dedup, self.worker_id))?;
        match claimed {
            Some(job) => self.process(job).map(Some),
            None => Ok(None),
        }
    }

    fn process(&self, job: Job) -> Result<JobOutcome> {
        let start = Instant::now();
        info!(job_id = job.id, uri = %job.uri, "processing batch");

        if self.writer.is_finalized(&job.uri) {
            return self.recover(job, start);
        }

        let committed = match self.retry.run("deduplicate batch", || self.commit_batch(&job)) {
            Ok(committed) => committed,
            Err(DedupError::Interrupted) => {
                self.cancel.cancel();
                self.retry
                    .run("release job", || self.jobs.cancel(&job, self.worker_id))?;
                warn!(job_id = job.id, uri = %job.uri, "interrupted before commit, job returned to pending");
                return Ok(JobOutcome::Released { job_id: job.id });
            }
            Err(e) => return self.fail(&job, e.to_string()),
        };

        // Past the commit point: roll forward only.
        if let Err(e) = self.retry.run("publish partitions", || self.writer.publish(&committed.staged)) {
            return self.fail(
                &job,
                format!("batch committed but partitions could not be published: {}", e),
            );
        }
        if let Err(e) = self.retry.run("move source batch", || self.writer.finalize(&job.uri)) {
            return self.fail(
                &job,
                format!("batch committed but source could not be moved to processed: {}", e),
            );
        }
        self.after_commit(CommitStage::SourceMoved);

        let stats = committed.stats;
        self.settle_finished(&job, &stats)?;
        let report = BatchReport {
            job_id: job.id,
            uri: job.uri.clone(),
            stats,
            elapsed: start.elapsed(),
        };
        info!(
            job_id = job.id,
            uri = %job.uri,
            unique = report.stats.unique_docs,
            duplicate = report.stats.duplicate_docs,
            "batch finished in {:?}",
            report.elapsed
        );
        Ok(JobOutcome::Finished(report))
    }

    /// Steps 1 to 3. Leaves nothing behind when it fails.
    fn commit_batch(&self, job: &Job) -> Result<Committed> {
        self.cancel.check()?;
        let paths = self.writer.paths();
        let batch = Batch::load(&paths.input_root, &job.uri)?;

        self.checker.cache().clear();
        let lookups = LookupPool::new(
            &self.checker,
            self.lookup_workers,
            self.retry.clone(),
            self.cancel.clone(),
        );
        let outcome = self.dedup.run(&batch, Some(&lookups))?;

        let staged = self.writer.stage(&batch, &outcome.removed())?;
        let committed = self.boundary(CommitStage::PartitionsWritten).and_then(|()| {
            self.checker
                .index()
                .replace_sources(&outcome.source_paths, &outcome.index_records)
        });
        if let Err(e) = committed {
            self.writer.rollback(&staged);
            return Err(e);
        }
        self.after_commit(CommitStage::IndexCommitted);

        Ok(Committed {
            stats: DedupStats {
                unique_docs: staged.unique_count as u64,
                duplicate_docs: staged.duplicate_count as u64,
                filtered_docs: outcome.filtered.len() as u64,
                rejected_docs: batch.rejected as u64,
                unique_bytes: staged.unique_bytes,
                duplicate_bytes: staged.duplicate_bytes,
                source_digest: batch.digest,
            },
            staged,
        })
    }

    fn boundary(&self, stage: CommitStage) -> Result<()> {
        self.cancel.check()?;
        match &self.hook {
            Some(hook) => hook(stage),
            None => Ok(()),
        }
    }

    fn after_commit(&self, stage: CommitStage) {
        if let Some(hook) = &self.hook {
            match hook(stage) {
                Ok(()) => {}
                Err(DedupError::Interrupted) => {
                    warn!(?stage, "interrupt after commit point, settling the batch first");
                    self.cancel.cancel();
                }
                Err(e) => warn!(?stage, error = %e, "stage hook failed after commit point"),
            }
        }
    }

    fn settle_finished(&self, job: &Job, stats: &DedupStats) -> Result<()> {
        let result = self
            .retry
            .run("finish job", || self.jobs.finish(job, self.worker_id, stats));
        match result {
            // an earlier attempt went through but its reply was lost
            Err(DedupError::InvalidTransition {
                from: Some(JobState::Finished),
                ..
            }) => Ok(()),
            other => other,
        }
    }

    fn fail(&self, job: &Job, message: String) -> Result<JobOutcome> {
        error!(job_id = job.id, uri = %job.uri, error = %message, "batch failed");
        self.retry
            .run("mark job failed", || self.jobs.fail(job, self.worker_id, &message))?;
        Ok(JobOutcome::Failed {
            job_id: job.id,
            error: message,
        })
    }

    /// The source already sits under the processed root, so an earlier
    /// attempt passed the commit point. Rebuild the result row from the
    /// partitions and finish.
    fn recover(&self, job: Job, start: Instant) -> Result<JobOutcome> {
        warn!(job_id = job.id, uri = %job.uri, "batch already committed, finishing without reprocessing");
        let stats = match self.committed_stats(&job.uri) {
            Ok(stats) => stats,
            Err(e) => return self.fail(&job, e.to_string()),
        };
        self.settle_finished(&job, &stats)?;
        Ok(JobOutcome::Recovered(BatchReport {
            job_id: job.id,
            uri: job.uri,
            stats,
            elapsed: start.elapsed(),
        }))
    }

    fn committed_stats(&self, uri: &str) -> Result<DedupStats> {
        let paths = self.writer.paths();
        let batch = Batch::load(&paths.processed_root, uri)?;
        // filter counts are not recoverable from the partitions
        let mut stats = DedupStats {
            rejected_docs: batch.rejected as u64,
            source_digest: batch.digest,
            ..DedupStats::default()
        };
        for rel in &batch.files {
            let (count, bytes) = partition_size(&paths.unique_root.join(rel))?;
            stats.unique_docs += count;
            stats.unique_bytes += bytes;
            let (count, bytes) = partition_size(&paths.duplicate_root.join(rel))?;
            stats.duplicate_docs += count;
            stats.duplicate_bytes += bytes;
        }
        Ok(stats)
    }
}

fn partition_size(path: &Path) -> Result<(u64, u64)> {
    let records = read_partition(path)?;
    Ok((records.len() as u64, fs::metadata(path)?.len()))
}
