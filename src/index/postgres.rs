use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use tokio::runtime::Runtime;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

use super::{hash_columns, DuplicateIndex, IndexRecord};
use crate::error::{DedupError, Result};

pub(crate) type PgPool = Pool<PostgresConnectionManager<NoTls>>;

// Rows per multi-row INSERT; keeps the bind count well below the protocol limit.
const INSERT_CHUNK: usize = 1000;

/// Builds a runtime and a connection pool for synchronous callers.
pub(crate) fn pg_pool(url: &str, pool_size: u32) -> Result<(Runtime, PgPool)> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    let manager = PostgresConnectionManager::new_from_stringlike(url, NoTls)?;
    let pool = rt.block_on(async { Pool::builder().max_size(pool_size).build(manager).await })?;
    Ok((rt, pool))
}

/// Duplicate index in PostgreSQL, shared by workers on any number of machines.
pub struct PgIndex {
    rt: Runtime,
    pool: PgPool,
    num_bands: usize,
    select_sql: String,
}

impl PgIndex {
    pub fn connect(url: &str, pool_size: u32, num_bands: usize) -> Result<Self> {
        let (rt, pool) = pg_pool(url, pool_size)?;
        rt.block_on(async {
            let conn = pool.get().await?;
            init_schema(&conn, num_bands).await
        })?;

        let columns = hash_columns(num_bands);
        let band_filter = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ${}", c, i + 2))
            .collect::<Vec<_>>()
            .join(" OR ");
        let select_sql = format!(
            "SELECT path, local_id, url, {}, insertion_tag FROM idx_records \
             WHERE insertion_tag <= $1 AND ({})",
            columns.join(", "),
            band_filter
        );

        Ok(Self {
            rt,
            pool,
            num_bands,
            select_sql,
        })
    }

    fn check_bands(&self, band_hashes: &[i64]) -> Result<()> {
        if band_hashes.len() != self.num_bands {
            return Err(DedupError::Config(format!(
                "index has {} bands, got {} band hashes",
                self.num_bands,
                band_hashes.len()
            )));
        }
        Ok(())
    }

    /// Deletes the records of `replaced` and inserts `records` under one fresh
    /// tag in one transaction.
    fn commit_records(&self, replaced: &[String], records: &[IndexRecord]) -> Result<i64> {
        for record in records {
            self.check_bands(&record.band_hashes)?;
        }
        let columns = hash_columns(self.num_bands).join(", ");

        self.rt.block_on(async {
            let mut conn = self.pool.get().await?;
            let tx = conn.transaction().await?;
            // Serializes committers so tags become visible in order.
            tx.batch_execute("LOCK TABLE idx_commits IN EXCLUSIVE MODE").await?;

            if !replaced.is_empty() {
                tx.execute("DELETE FROM idx_records WHERE path = ANY($1)", &[&replaced])
                    .await?;
            }
            let row = tx
                .query_one(
                    "INSERT INTO idx_commits (records, committed_at) VALUES ($1, NOW()) RETURNING tag",
                    &[&(records.len() as i64)],
                )
                .await?;
            let tag: i64 = row.get(0);

            let per_row = self.num_bands + 4;
            for chunk in records.chunks(INSERT_CHUNK) {
                let mut query = format!(
                    "INSERT INTO idx_records (path, local_id, url, {}, insertion_tag) VALUES ",
                    columns
                );
                let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * per_row);
                for (i, record) in chunk.iter().enumerate() {
                    if i > 0 {
                        query.push(',');
                    }
                    let placeholders = (1..=per_row)
                        .map(|p| format!("${}", i * per_row + p))
                        .collect::<Vec<_>>()
                        .join(", ");
                    query.push_str(&format!("({})", placeholders));

                    params.push(&record.source_path);
                    params.push(&record.local_id);
                    params.push(&record.url);
                    for h in &record.band_hashes {
                        params.push(h);
                    }
                    params.push(&tag);
                }
                tx.execute(&query, &params).await?;
            }

            tx.commit().await?;
            Ok(tag)
        })
    }
}

async fn init_schema(client: &tokio_postgres::Client, num_bands: usize) -> Result<()> {
    let columns = hash_columns(num_bands);
    client
        .batch_execute(
            r#"
        CREATE TABLE IF NOT EXISTS idx_globals (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
    "#,
        )
        .await?;

    client
        .execute(
            "INSERT INTO idx_globals (key, value) VALUES ('num_bands', $1) ON CONFLICT DO NOTHING",
            &[&num_bands.to_string()],
        )
        .await?;
    let stored: String = client
        .query_one("SELECT value FROM idx_globals WHERE key = 'num_bands'", &[])
        .await?
        .get(0);
    if stored != num_bands.to_string() {
        return Err(DedupError::Config(format!(
            "index was built with {} bands, configuration asks for {}",
            stored, num_bands
        )));
    }

    let column_defs = columns
        .iter()
        .map(|c| format!("{} BIGINT NOT NULL,", c))
        .collect::<Vec<_>>()
        .join("\n            ");
    let column_indexes = columns
        .iter()
        .map(|c| format!("CREATE INDEX IF NOT EXISTS idx_records_{0} ON idx_records({0});", c))
        .collect::<Vec<_>>()
        .join("\n        ");
    client
        .batch_execute(&format!(
            r#"
        CREATE TABLE IF NOT EXISTS idx_commits (
            tag BIGSERIAL PRIMARY KEY,
            records BIGINT NOT NULL,
            committed_at TIMESTAMPTZ NOT NULL
        );
        CREATE TABLE IF NOT EXISTS idx_records (
            id BIGSERIAL PRIMARY KEY,
            path TEXT NOT NULL,
            local_id TEXT NOT NULL,
            url TEXT NOT NULL,
            {}
            insertion_tag BIGINT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_records_path ON idx_records(path);
        {}
    "#,
            column_defs, column_indexes
        ))
        .await?;
    Ok(())
}

impl DuplicateIndex for PgIndex {
    fn num_bands(&self) -> usize {
        self.num_bands
    }

    fn current_tag(&self) -> Result<i64> {
        self.rt.block_on(async {
            let conn = self.pool.get().await?;
            let row = conn
                .query_one("SELECT COALESCE(MAX(tag), 0)::BIGINT FROM idx_commits", &[])
                .await?;
            Ok(row.get(0))
        })
    }

    fn lookup(&self, band_hashes: &[i64], as_of: i64) -> Result<Vec<IndexRecord>> {
        self.check_bands(band_hashes)?;
        let bands = self.num_bands;

        self.rt.block_on(async {
            let conn = self.pool.get().await?;
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(bands + 1);
            params.push(&as_of);
            for h in band_hashes {
                params.push(h);
            }

            let rows = conn.query(self.select_sql.as_str(), &params).await?;
            Ok(rows
                .iter()
                .map(|row| IndexRecord {
                    source_path: row.get(0),
                    local_id: row.get(1),
                    url: row.get(2),
                    band_hashes: (0..bands).map(|b| row.get::<_, i64>(3 + b)).collect(),
                    insertion_tag: row.get(3 + bands),
                })
                .collect())
        })
    }

    fn replace_sources(&self, source_paths: &[String], records: &[IndexRecord]) -> Result<i64> {
        self.commit_records(source_paths, records)
    }

    fn insert(&self, record: &IndexRecord) -> Result<i64> {
        self.commit_records(&[], std::slice::from_ref(record))
    }

    fn remove_source(&self, source_path: &str) -> Result<usize> {
        self.rt.block_on(async {
            let conn = self.pool.get().await?;
            let n = conn
                .execute("DELETE FROM idx_records WHERE path = $1", &[&source_path])
                .await?;
            Ok(n as usize)
        })
    }

    fn len(&self) -> Result<usize> {
        self.rt.block_on(async {
            let conn = self.pool.get().await?;
            let n: i64 = conn
                .query_one("SELECT COUNT(*) FROM idx_records", &[])
                .await?
                .get(0);
            Ok(n as usize)
        })
    }
}
