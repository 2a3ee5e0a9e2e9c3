use chrono::{DateTime, Utc};
use tokio::runtime::Runtime;
use tokio_postgres::Row;
use tracing::info;

use super::{
    parse_stage, parse_state, rejected_transition, DedupStats, Job, JobState, JobStore, Stage, StateCounts,
};
use crate::error::Result;
use crate::index::postgres::{pg_pool, PgPool};

const JOB_COLUMNS: &str = "id, uri, stage, state, worker_id, started_at, finished_at, last_error";

fn to_job(row: &Row) -> Result<Job> {
    Ok(Job {
        id: row.get(0),
        uri: row.get(1),
        stage: parse_stage(row.get(2))?,
        state: parse_state(row.get(3))?,
        worker_id: row.get(4),
        started_at: row.get::<_, Option<DateTime<Utc>>>(5),
        finished_at: row.get::<_, Option<DateTime<Utc>>>(6),
        last_error: row.get(7),
    })
}

/// Job table in PostgreSQL, for workers spread over several machines.
/// Claims lock the chosen row with `FOR UPDATE SKIP LOCKED`, so concurrent
/// claimers step over each other's rows instead of queueing behind them.
pub struct PgJobStore {
    rt: Runtime,
    pool: PgPool,
}

impl PgJobStore {
    pub fn connect(url: &str, pool_size: u32) -> Result<Self> {
        let (rt, pool) = pg_pool(url, pool_size)?;
        rt.block_on(async {
            let conn = pool.get().await?;
            conn.batch_execute(
                r#"
            CREATE TABLE IF NOT EXISTS workers (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                registered_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE TABLE IF NOT EXISTS pipeline_jobs (
                id BIGSERIAL PRIMARY KEY,
                uri TEXT NOT NULL,
                stage TEXT NOT NULL,
                state SMALLINT NOT NULL DEFAULT 0,
                worker_id BIGINT REFERENCES workers(id),
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ,
                last_error TEXT,
                UNIQUE (uri, stage)
            );
            CREATE INDEX IF NOT EXISTS pipeline_jobs_claim ON pipeline_jobs(stage, state, id);
            CREATE TABLE IF NOT EXISTS dedup_results (
                job_id BIGINT PRIMARY KEY REFERENCES pipeline_jobs(id),
                worker_id BIGINT NOT NULL REFERENCES workers(id),
                unique_docs BIGINT NOT NULL,
                duplicate_docs BIGINT NOT NULL,
                filtered_docs BIGINT NOT NULL,
                rejected_docs BIGINT NOT NULL,
                unique_bytes BIGINT NOT NULL,
                duplicate_bytes BIGINT NOT NULL,
                source_digest TEXT NOT NULL,
                deduped_at TIMESTAMPTZ NOT NULL
            );
        "#,
            )
            .await?;
            Ok::<_, crate::error::DedupError>(())
        })?;
        Ok(Self { rt, pool })
    }

    fn leave_processing(
        &self,
        job: &Job,
        worker_id: i64,
        to: JobState,
        last_error: Option<&str>,
        stats: Option<&DedupStats>,
    ) -> Result<()> {
        self.rt.block_on(async {
            let mut conn = self.pool.get().await?;
            let tx = conn.transaction().await?;
            let updated = if to == JobState::Pending {
                tx.execute(
                    "UPDATE pipeline_jobs SET state = $1, worker_id = NULL, started_at = NULL \
                     WHERE id = $2 AND state = $3 AND worker_id = $4",
                    &[&to.code(), &job.id, &JobState::Processing.code(), &worker_id],
                )
                .await?
            } else {
                tx.execute(
                    "UPDATE pipeline_jobs SET state = $1, finished_at = NOW(), last_error = $2 \
                     WHERE id = $3 AND state = $4 AND worker_id = $5",
                    &[&to.code(), &last_error, &job.id, &JobState::Processing.code(), &worker_id],
                )
                .await?
            };
            if updated == 0 {
                let current = tx
                    .query_opt("SELECT state FROM pipeline_jobs WHERE id = $1", &[&job.id])
                    .await?
                    .map(|row| parse_state(row.get(0)))
                    .transpose()?;
                return Err(rejected_transition(job.id, current, to));
            }

            if let Some(stats) = stats {
                tx.execute(
                    "INSERT INTO dedup_results (job_id, worker_id, unique_docs, duplicate_docs, \
                     filtered_docs, rejected_docs, unique_bytes, duplicate_bytes, source_digest, deduped_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW()) \
                     ON CONFLICT (job_id) DO UPDATE SET worker_id = EXCLUDED.worker_id, \
                     unique_docs = EXCLUDED.unique_docs, duplicate_docs = EXCLUDED.duplicate_docs, \
                     filtered_docs = EXCLUDED.filtered_docs, rejected_docs = EXCLUDED.rejected_docs, \
                     unique_bytes = EXCLUDED.unique_bytes, duplicate_bytes = EXCLUDED.duplicate_bytes, \
                     source_digest = EXCLUDED.source_digest, deduped_at = EXCLUDED.deduped_at",
                    &[
                        &job.id,
                        &worker_id,
                        &(stats.unique_docs as i64),
                        &(stats.duplicate_docs as i64),
                        &(stats.filtered_docs as i64),
                        &(stats.rejected_docs as i64),
                        &(stats.unique_bytes as i64),
                        &(stats.duplicate_bytes as i64),
                        &stats.source_digest,
                    ],
                )
                .await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }
}

impl JobStore for PgJobStore {
    fn register_worker(&self, name: &str) -> Result<i64> {
        self.rt.block_on(async {
            let conn = self.pool.get().await?;
            conn.execute(
                "INSERT INTO workers (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
                &[&name],
            )
            .await?;
            let row = conn
                .query_one("SELECT id FROM workers WHERE name = $1", &[&name])
                .await?;
            Ok(row.get(0))
        })
    }

    fn enqueue(&self, stage: Stage, uri: &str) -> Result<bool> {
        self.rt.block_on(async {
            let conn = self.pool.get().await?;
            let inserted = conn
                .execute(
                    "INSERT INTO pipeline_jobs (uri, stage, state) VALUES ($1, $2, $3) \
                     ON CONFLICT (uri, stage) DO NOTHING",
                    &[&uri, &stage.as_str(), &JobState::Pending.code()],
                )
                .await?;
            Ok(inserted > 0)
        })
    }

    fn claim(&self, stage: Stage, worker_id: i64) -> Result<Option<Job>> {
        let job = self.rt.block_on(async {
            let conn = self.pool.get().await?;
            let row = conn
                .query_opt(
                    format!(
                        "UPDATE pipeline_jobs \
                         SET state = $1, worker_id = $2, started_at = NOW(), finished_at = NULL, last_error = NULL \
                         WHERE id = ( \
                             SELECT id FROM pipeline_jobs WHERE stage = $3 AND state = $4 \
                             ORDER BY id LIMIT 1 FOR UPDATE SKIP LOCKED) \
                         RETURNING {}",
                        JOB_COLUMNS
                    )
                    .as_str(),
                    &[
                        &JobState::Processing.code(),
                        &worker_id,
                        &stage.as_str(),
                        &JobState::Pending.code(),
                    ],
                )
                .await?;
            row.as_ref().map(to_job).transpose()
        })?;

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
        self.rt.block_on(async {
            let conn = self.pool.get().await?;
            let updated = conn
                .execute(
                    "UPDATE pipeline_jobs SET state = $1, worker_id = NULL, started_at = NULL \
                     WHERE id = $2 AND state = $3",
                    &[&JobState::Pending.code(), &job_id, &JobState::Processing.code()],
                )
                .await?;
            if updated == 0 {
                let current = conn
                    .query_opt("SELECT state FROM pipeline_jobs WHERE id = $1", &[&job_id])
                    .await?
                    .map(|row| parse_state(row.get(0)))
                    .transpose()?;
                return Err(rejected_transition(job_id, current, JobState::Pending));
            }
            Ok(())
        })
    }

    fn counts(&self, stage: Stage) -> Result<StateCounts> {
        self.rt.block_on(async {
            let conn = self.pool.get().await?;
            let rows = conn
                .query(
                    "SELECT state, COUNT(*) FROM pipeline_jobs WHERE stage = $1 GROUP BY state",
                    &[&stage.as_str()],
                )
                .await?;
            let mut counts = StateCounts::default();
            for row in rows {
                let n: i64 = row.get(1);
                counts.add(parse_state(row.get(0))?, n as u64);
            }
            Ok(counts)
        })
    }

    fn get(&self, job_id: i64) -> Result<Option<Job>> {
        self.rt.block_on(async {
            let conn = self.pool.get().await?;
            let row = conn
                .query_opt(
                    format!("SELECT {} FROM pipeline_jobs WHERE id = $1", JOB_COLUMNS).as_str(),
                    &[&job_id],
                )
                .await?;
            row.as_ref().map(to_job).transpose()
        })
    }

    fn result(&self, job_id: i64) -> Result<Option<DedupStats>> {
        self.rt.block_on(async {
            let conn = self.pool.get().await?;
            let row = conn
                .query_opt(
                    "SELECT unique_docs, duplicate_docs, filtered_docs, rejected_docs, unique_bytes, \
                     duplicate_bytes, source_digest FROM dedup_results WHERE job_id = $1",
                    &[&job_id],
                )
                .await?;
            Ok(row.map(|row| DedupStats {
                unique_docs: row.get::<_, i64>(0) as u64,
                duplicate_docs: row.get::<_, i64>(1) as u64,
                filtered_docs: row.get::<_, i64>(2) as u64,
                rejected_docs: row.get::<_, i64>(3) as u64,
                unique_bytes: row.get::<_, i64>(4) as u64,
                duplicate_bytes: row.get::<_, i64>(5) as u64,
                source_digest: row.get(6),
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::thread;

    const URL_VAR: &str = "DEDUP_TEST_PG_URL";

    /// A store on the server named by `DEDUP_TEST_PG_URL`, with an empty job
    /// table. `None` when the variable is unset.
    fn store() -> Option<PgJobStore> {
        let Ok(url) = std::env::var(URL_VAR) else {
            eprintln!("{} not set, skipping postgres job store test", URL_VAR);
            return None;
        };
        let store = PgJobStore::connect(&url, 16).unwrap();
        store.rt.block_on(async {
            let conn = store.pool.get().await.unwrap();
            conn.batch_execute("TRUNCATE dedup_results, pipeline_jobs RESTART IDENTITY CASCADE")
                .await
                .unwrap();
        });
        Some(store)
    }

    #[test]
    fn concurrent_claimers_take_each_job_once() {
        let Some(store) = store() else { return };
        let worker = store.register_worker("pg-test-idle").unwrap();
        assert_eq!(store.claim(Stage::Dedup, worker).unwrap(), None);

        const JOBS: usize = 200;
        const CLAIMERS: usize = 8;
        for i in 0..JOBS {
            assert!(store.enqueue(Stage::Dedup, &format!("seg/{:04}.json", i)).unwrap());
        }

        let claimed: Vec<Vec<i64>> = thread::scope(|s| {
            let handles: Vec<_> = (0..CLAIMERS)
                .map(|n| {
                    let store = &store;
                    s.spawn(move || {
                        let worker = store.register_worker(&format!("pg-test-{}", n)).unwrap();
                        let mut ids = Vec::new();
                        while let Some(job) = store.claim(Stage::Dedup, worker).unwrap() {
                            assert_eq!(job.state, JobState::Processing);
                            assert_eq!(job.worker_id, Some(worker));
                            ids.push(job.id);
                        }
                        ids
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let all: Vec<i64> = claimed.into_iter().flatten().collect();
        let distinct: BTreeSet<i64> = all.iter().copied().collect();
        assert_eq!(all.len(), JOBS);
        assert_eq!(distinct.len(), JOBS);

        let counts = store.counts(Stage::Dedup).unwrap();
        assert_eq!(counts.processing, JOBS as u64);
        assert_eq!(counts.pending, 0);
        assert_eq!(store.claim(Stage::Dedup, worker).unwrap(), None);
    }
}
