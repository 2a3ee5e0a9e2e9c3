use chrono::{DateTime, Utc};
use r2d2::Pool as R2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::Path;
use tracing::info;

use super::{
    parse_stage, parse_state, rejected_transition, DedupStats, Job, JobState, JobStore, Stage, StateCounts,
};
use crate::error::Result;
use crate::index::sqlite::sqlite_pool;

const JOB_COLUMNS: &str = "id, uri, stage, state, worker_id, started_at, finished_at, last_error";

type JobRow = (
    i64,
    String,
    String,
    i16,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<String>,
);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn to_job(row: JobRow) -> Result<Job> {
    let (id, uri, stage, state, worker_id, started_at, finished_at, last_error) = row;
    Ok(Job {
        id,
        uri,
        stage: parse_stage(&stage)?,
        state: parse_state(state)?,
        worker_id,
        started_at: started_at.and_then(DateTime::<Utc>::from_timestamp_micros),
        finished_at: finished_at.and_then(DateTime::<Utc>::from_timestamp_micros),
        last_error,
    })
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// Job table in a SQLite file, for workers sharing one machine.
///
/// SQLite has no row locks, so a claim is one `UPDATE .. RETURNING` inside an
/// immediate transaction: claimers serialize on the write lock for a single
/// statement and never wait on another worker's open work.
pub struct SqliteJobStore {
    pool: R2Pool<SqliteConnectionManager>,
}

impl SqliteJobStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let pool = sqlite_pool(path.as_ref())?;
        {
            let conn = pool.get()?;
            conn.execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS workers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                registered_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pipeline_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uri TEXT NOT NULL,
                stage TEXT NOT NULL,
                state INTEGER NOT NULL DEFAULT 0,
                worker_id INTEGER REFERENCES workers(id),
                started_at INTEGER,
                finished_at INTEGER,
                last_error TEXT,
                UNIQUE (uri, stage)
            );
            CREATE INDEX IF NOT EXISTS pipeline_jobs_claim ON pipeline_jobs(stage, state, id);
            CREATE TABLE IF NOT EXISTS dedup_results (
                job_id INTEGER PRIMARY KEY REFERENCES pipeline_jobs(id),
                worker_id INTEGER NOT NULL REFERENCES workers(id),
                unique_docs INTEGER NOT NULL,
                duplicate_docs INTEGER NOT NULL,
                filtered_docs INTEGER NOT NULL,
                rejected_docs INTEGER NOT NULL,
                unique_bytes INTEGER NOT NULL,
                duplicate_bytes INTEGER NOT NULL,
                source_digest TEXT NOT NULL,
                deduped_at INTEGER NOT NULL
            );
        "#,
            )?;
        }
        Ok(Self { pool })
    }

    fn current_state(&self, conn: &rusqlite::Connection, job_id: i64) -> Result<Option<JobState>> {
        let code: Option<i16> = conn
            .query_row("SELECT state FROM pipeline_jobs WHERE id = ?1", [job_id], |row| {
                row.get(0)
            })
            .optional()?;
        code.map(parse_state).transpose()
    }

    /// Moves a PROCESSING job held by `worker_id` to `to`.
    fn leave_processing(
        &self,
        job: &Job,
        worker_id: i64,
        to: JobState,
        last_error: Option<&str>,
        stats: Option<&DedupStats>,
    ) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let finished_at = (to != JobState::Pending).then(now_micros);
        let updated = if to == JobState::Pending {
            tx.execute(
                "UPDATE pipeline_jobs SET state = ?1, worker_id = NULL, started_at = NULL \
                 WHERE id = ?2 AND state = ?3 AND worker_id = ?4",
                params![to.code(), job.id, JobState::Processing.code(), worker_id],
            )?
        } else {
            tx.execute(
                "UPDATE pipeline_jobs SET state = ?1, finished_at = ?2, last_error = ?3 \
                 WHERE id = ?4 AND state = ?5 AND worker_id = ?6",
                params![
                    to.code(),
                    finished_at,
                    last_error,
                    job.id,
                    JobState::Processing.code(),
                    worker_id
                ],
            )?
        };
        if updated == 0 {
            let current = self.current_state(&tx, job.id)?;
            return Err(rejected_transition(job.id, current, to));
        }

        if let Some(stats) = stats {
            tx.execute(
                "INSERT OR REPLACE INTO dedup_results (job_id, worker_id, unique_docs, duplicate_docs, \
                 filtered_docs, rejected_docs, unique_bytes, duplicate_bytes, source_digest, deduped_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    job.id,
                    worker_id,
                    stats.unique_docs as i64,
                    stats.duplicate_docs as i64,
                    stats.filtered_docs as i64,
                    stats.rejected_docs as i64,
                    stats.unique_bytes as i64,
                    stats.duplicate_bytes as i64,
                    stats.source_digest,
                    finished_at.unwrap_or_else(now_micros),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl JobStore for SqliteJobStore {
    fn register_worker(&self, name: &str) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO workers (name, registered_at) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
            params![name, now_micros()],
        )?;
        Ok(conn.query_row("SELECT id FROM workers WHERE name = ?1", [name], |row| row.get(0))?)
    }

    fn enqueue(&self, stage: Stage, uri: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let inserted = conn.execute(
            "INSERT INTO pipeline_jobs (uri, stage, state) VALUES (?1, ?2, ?3) \
             ON CONFLICT(uri, stage) DO NOTHING",
            params![uri, stage.as_str(), JobState::Pending.code()],
        )?;
        Ok(inserted > 0)
    }

    fn claim(&self, stage: Stage, worker_id: i64) -> Result<Option<Job>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = tx
            .query_row(
                &format!(
                    "UPDATE pipeline_jobs \
                     SET state = ?1, worker_id = ?2, started_at = ?3, finished_at = NULL, last_error = NULL \
                     WHERE id = (SELECT id FROM pipeline_jobs WHERE stage = ?4 AND state = ?5 ORDER BY id LIMIT 1) \
                       AND state = ?5 \
                     RETURNING {}",
                    JOB_COLUMNS
                ),
                params![
                    JobState::Processing.code(),
                    worker_id,
                    now_micros(),
                    stage.as_str(),
                    JobState::Pending.code()
                ],
                read_row,
            )
            .optional()?;
        tx.commit()?;

        let job = row.map(to_job).transpose()?;
        if let Some(job) = &job {
            info!(job_id = job.id, uri = %job.uri, worker_id, "claimed job");
        }
        Ok(job)
    }

    fn finish(&self, job: &Job, worker_id: i64, stats: &DedupStats) -> Result<()> {
        self.leave_processing(job, worker_id, JobState::Finished, None, Some(stats))
    }

    fn fail(&self, job: &Job, worker_id: i64, error: &str) -> Result<()> {
        self.leave_processing(job, worker_id, JobState::Failed, Some(error), None)
    }

    fn cancel(&self, job: &Job, worker_id: i64) -> Result<()> {
        self.leave_processing(job, worker_id, JobState::Pending, None, None)
    }

    fn release(&self, job_id: i64) -> Result<()> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE pipeline_jobs SET state = ?1, worker_id = NULL, started_at = NULL \
             WHERE id = ?2 AND state = ?3",
            params![JobState::Pending.code(), job_id, JobState::Processing.code()],
        )?;
        if updated == 0 {
            let current = self.current_state(&conn, job_id)?;
            return Err(rejected_transition(job_id, current, JobState::Pending));
        }
        Ok(())
    }

    fn counts(&self, stage: Stage) -> Result<StateCounts> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare_cached("SELECT state, COUNT(*) FROM pipeline_jobs WHERE stage = ?1 GROUP BY state")?;
        let rows = stmt.query_map([stage.as_str()], |row| Ok((row.get::<_, i16>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = StateCounts::default();
        for row in rows {
            let (code, n) = row?;
            counts.add(parse_state(code)?, n as u64);
        }
        Ok(counts)
    }

    fn get(&self, job_id: i64) -> Result<Option<Job>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM pipeline_jobs WHERE id = ?1", JOB_COLUMNS),
                [job_id],
                read_row,
            )
            .optional()?;
        row.map(to_job).transpose()
    }

    fn result(&self, job_id: i64) -> Result<Option<DedupStats>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                "SELECT unique_docs, duplicate_docs, filtered_docs, rejected_docs, unique_bytes, \
                 duplicate_bytes, source_digest FROM dedup_results WHERE job_id = ?1",
                [job_id],
                |row| {
                    Ok(DedupStats {
                        unique_docs: row.get::<_, i64>(0)? as u64,
                        duplicate_docs: row.get::<_, i64>(1)? as u64,
                        filtered_docs: row.get::<_, i64>(2)? as u64,
                        rejected_docs: row.get::<_, i64>(3)? as u64,
                        unique_bytes: row.get::<_, i64>(4)? as u64,
                        duplicate_bytes: row.get::<_, i64>(5)? as u64,
                        source_digest: row.get(6)?,
                    })
                },
            )
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DedupError;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, SqliteJobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::open(dir.path().join("jobs.sqlite3")).unwrap();
        (dir, store)
    }

    #[test]
    fn claim_on_empty_table_returns_none() {
        let (_dir, store) = store();
        let worker = store.register_worker("w1").unwrap();
        assert!(store.claim(Stage::Dedup, worker).unwrap().is_none());
    }

    #[test]
    fn workers_register_once() {
        let (_dir, store) = store();
        let a = store.register_worker("w1").unwrap();
        let b = store.register_worker("w2").unwrap();
        assert_ne!(a, b);
        assert_eq!(store.register_worker("w1").unwrap(), a);
    }

    #[test]
    fn enqueue_is_idempotent_per_stage() {
        let (_dir, store) = store();
        assert!(store.enqueue(Stage::Dedup, "seg/a.json").unwrap());
        assert!(!store.enqueue(Stage::Dedup, "seg/a.json").unwrap());
        assert!(store.enqueue(Stage::Filter, "seg/a.json").unwrap());
        assert_eq!(store.counts(Stage::Dedup).unwrap().pending, 1);
    }

    #[test]
    fn claim_only_sees_its_stage() {
        let (_dir, store) = store();
        let worker = store.register_worker("w1").unwrap();
        store.enqueue(Stage::Filter, "a.json").unwrap();
        assert!(store.claim(Stage::Dedup, worker).unwrap().is_none());
        store.enqueue(Stage::Dedup, "a.json").unwrap();

        let job = store.claim(Stage::Dedup, worker).unwrap().unwrap();
        assert_eq!(job.stage, Stage::Dedup);
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.worker_id, Some(worker));
        assert!(job.started_at.is_some());
        assert!(store.claim(Stage::Dedup, worker).unwrap().is_none());
    }

    #[test]
    fn concurrent_claimers_take_each_job_once() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let jobs = 60;
        for i in 0..jobs {
            store.enqueue(Stage::Dedup, &format!("seg/{:03}.json", i)).unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|w| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let worker = store.register_worker(&format!("w{}", w)).unwrap();
                    let mut claimed = Vec::new();
                    while let Some(job) = store.claim(Stage::Dedup, worker).unwrap() {
                        assert_eq!(job.worker_id, Some(worker));
                        claimed.push(job.id);
                    }
                    claimed
                })
            })
            .collect();

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        let distinct: BTreeSet<i64> = all.iter().copied().collect();
        assert_eq!(all.len(), jobs);
        assert_eq!(distinct.len(), jobs);
        assert_eq!(store.counts(Stage::Dedup).unwrap().processing, jobs as u64);
    }

    #[test]
    fn finish_records_results() {
        let (_dir, store) = store();
        let worker = store.register_worker("w1").unwrap();
        store.enqueue(Stage::Dedup, "a.json").unwrap();
        let job = store.claim(Stage::Dedup, worker).unwrap().unwrap();

        let stats = DedupStats {
            unique_docs: 3,
            duplicate_docs: 2,
            filtered_docs: 1,
            rejected_docs: 0,
            unique_bytes: 300,
            duplicate_bytes: 200,
            source_digest: "abc".into(),
        };
        store.finish(&job, worker, &stats).unwrap();
        let done = store.get(job.id).unwrap().unwrap();
        assert_eq!(done.state, JobState::Finished);
        assert!(done.finished_at.is_some());
        assert_eq!(store.result(job.id).unwrap(), Some(stats));
    }

    #[test]
    fn rejects_transitions_out_of_terminal_states() {
        let (_dir, store) = store();
        let worker = store.register_worker("w1").unwrap();
        store.enqueue(Stage::Dedup, "a.json").unwrap();
        let job = store.claim(Stage::Dedup, worker).unwrap().unwrap();
        store.fail(&job, worker, "boom").unwrap();
        assert_eq!(store.get(job.id).unwrap().unwrap().last_error.as_deref(), Some("boom"));

        let err = store.cancel(&job, worker).unwrap_err();
        assert!(matches!(
            err,
            DedupError::InvalidTransition {
                from: Some(JobState::Failed),
                to: JobState::Pending,
                ..
            }
        ));
        assert!(store.finish(&job, worker, &DedupStats::default()).is_err());
        assert!(store.release(job.id).is_err());
        assert!(store.claim(Stage::Dedup, worker).unwrap().is_none());
    }

    #[test]
    fn only_the_holder_can_settle_a_job() {
        let (_dir, store) = store();
        let holder = store.register_worker("w1").unwrap();
        let other = store.register_worker("w2").unwrap();
        store.enqueue(Stage::Dedup, "a.json").unwrap();
        let job = store.claim(Stage::Dedup, holder).unwrap().unwrap();

        assert!(store.finish(&job, other, &DedupStats::default()).is_err());
        store.cancel(&job, holder).unwrap();
        let back = store.get(job.id).unwrap().unwrap();
        assert_eq!(back.state, JobState::Pending);
        assert_eq!(back.worker_id, None);

        let again = store.claim(Stage::Dedup, other).unwrap().unwrap();
        assert_eq!(again.id, job.id);
        store.release(job.id).unwrap();
        assert_eq!(store.counts(Stage::Dedup).unwrap().pending, 1);
    }
}
