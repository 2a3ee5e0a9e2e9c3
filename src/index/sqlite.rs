use r2d2::Pool as R2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OptionalExtension;
use std::path::Path;
use std::time::Duration;

use super::{hash_columns, DuplicateIndex, IndexRecord};
use crate::error::{DedupError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn sqlite_pool(path: &Path) -> Result<R2Pool<SqliteConnectionManager>> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(())
    });
    Ok(R2Pool::new(manager)?)
}

/// Duplicate index in a SQLite file, shared by the threads of one machine.
pub struct SqliteIndex {
    pool: R2Pool<SqliteConnectionManager>,
    num_bands: usize,
    select_sql: String,
    insert_sql: String,
}

impl SqliteIndex {
    pub fn open<P: AsRef<Path>>(path: P, num_bands: usize) -> Result<Self> {
        let pool = sqlite_pool(path.as_ref())?;
        {
            let conn = pool.get()?;
            init_schema(&conn, num_bands)?;
        }

        let columns = hash_columns(num_bands);
        let band_filter = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", c, i + 2))
            .collect::<Vec<_>>()
            .join(" OR ");
        let select_sql = format!(
            "SELECT path, local_id, url, {}, insertion_tag FROM idx_records \
             WHERE insertion_tag <= ?1 AND ({})",
            columns.join(", "),
            band_filter
        );
        let placeholders = (0..num_bands + 4).map(|_| "?").collect::<Vec<_>>().join(", ");
        let insert_sql = format!(
            "INSERT INTO idx_records (path, local_id, url, {}, insertion_tag) VALUES ({})",
            columns.join(", "),
            placeholders
        );

        Ok(Self {
            pool,
            num_bands,
            select_sql,
            insert_sql,
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

    fn insert_records(
        &self,
        tx: &rusqlite::Transaction,
        records: &[IndexRecord],
        tag: i64,
    ) -> Result<()> {
        let mut stmt = tx.prepare_cached(&self.insert_sql)?;
        for record in records {
            self.check_bands(&record.band_hashes)?;
            let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(self.num_bands + 4);
            params.push(&record.source_path);
            params.push(&record.local_id);
            params.push(&record.url);
            for h in &record.band_hashes {
                params.push(h);
            }
            params.push(&tag);
            stmt.execute(params.as_slice())?;
        }
        Ok(())
    }
}

fn init_schema(conn: &rusqlite::Connection, num_bands: usize) -> Result<()> {
    let columns = hash_columns(num_bands);
    let column_defs = columns
        .iter()
        .map(|c| format!("{} INTEGER NOT NULL,", c))
        .collect::<Vec<_>>()
        .join("\n        ");
    let column_indexes = columns
        .iter()
        .map(|c| format!("CREATE INDEX IF NOT EXISTS idx_records_{0} ON idx_records({0});", c))
        .collect::<Vec<_>>()
        .join("\n    ");

    conn.execute_batch(
        r#"
    CREATE TABLE IF NOT EXISTS idx_globals (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    "#,
    )?;

    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM idx_globals WHERE key = 'num_bands'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match stored {
        Some(v) if v != num_bands.to_string() => {
            return Err(DedupError::Config(format!(
                "index was built with {} bands, configuration asks for {}",
                v, num_bands
            )))
        }
        Some(_) => {}
        None => {
            conn.execute(
                "INSERT OR IGNORE INTO idx_globals (key, value) VALUES ('num_bands', ?1)",
                [num_bands.to_string()],
            )?;
        }
    }

    conn.execute_batch(&format!(
        r#"
    CREATE TABLE IF NOT EXISTS idx_commits (
        tag INTEGER PRIMARY KEY AUTOINCREMENT,
        records INTEGER NOT NULL,
        committed_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS idx_records (
        id INTEGER PRIMARY KEY,
        path TEXT NOT NULL,
        local_id TEXT NOT NULL,
        url TEXT NOT NULL,
        {}
        insertion_tag INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_records_path ON idx_records(path);
    {}
    "#,
        column_defs, column_indexes
    ))?;
    Ok(())
}

fn new_tag(tx: &rusqlite::Transaction, records: usize) -> Result<i64> {
    tx.execute(
        "INSERT INTO idx_commits (records, committed_at) VALUES (?1, ?2)",
        rusqlite::params![records as i64, chrono::Utc::now().timestamp_micros()],
    )?;
    Ok(tx.last_insert_rowid())
}

impl DuplicateIndex for SqliteIndex {
    fn num_bands(&self) -> usize {
        self.num_bands
    }

    fn current_tag(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        let tag: i64 = conn.query_row("SELECT COALESCE(MAX(tag), 0) FROM idx_commits", [], |row| {
            row.get(0)
        })?;
        Ok(tag)
    }

    fn lookup(&self, band_hashes: &[i64], as_of: i64) -> Result<Vec<IndexRecord>> {
        self.check_bands(band_hashes)?;
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare_cached(&self.select_sql)?;

        let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(band_hashes.len() + 1);
        params.push(&as_of);
        for h in band_hashes {
            params.push(h);
        }

        let bands = self.num_bands;
        let rows = stmt.query_map(params.as_slice(), |row| {
            let mut hashes = Vec::with_capacity(bands);
            for b in 0..bands {
                hashes.push(row.get::<_, i64>(3 + b)?);
            }
            Ok(IndexRecord {
                source_path: row.get(0)?,
                local_id: row.get(1)?,
                url: row.get(2)?,
                band_hashes: hashes,
                insertion_tag: row.get(3 + bands)?,
            })
        })?;

        let mut records = Vec::new();
        for r in rows {
            records.push(r?);
        }
        Ok(records)
    }

    fn replace_sources(&self, source_paths: &[String], records: &[IndexRecord]) -> Result<i64> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        for path in source_paths {
            tx.execute("DELETE FROM idx_records WHERE path = ?1", [path])?;
        }
        let tag = new_tag(&tx, records.len())?;
        self.insert_records(&tx, records, tag)?;
        tx.commit()?;
        Ok(tag)
    }

    fn insert(&self, record: &IndexRecord) -> Result<i64> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let tag = new_tag(&tx, 1)?;
        self.insert_records(&tx, std::slice::from_ref(record), tag)?;
        tx.commit()?;
        Ok(tag)
    }

    fn remove_source(&self, source_path: &str) -> Result<usize> {
        let conn = self.pool.get()?;
        Ok(conn.execute("DELETE FROM idx_records WHERE path = ?1", [source_path])?)
    }

    fn len(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM idx_records", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, local_id: &str, hashes: Vec<i64>) -> IndexRecord {
        IndexRecord::new(path.into(), local_id.into(), format!("u://{}", local_id), hashes)
    }

    #[test]
    fn lookup_matches_any_band() {
        let dir = tempfile::tempdir().unwrap();
        let index = SqliteIndex::open(dir.path().join("idx.sqlite3"), 3).unwrap();
        assert_eq!(index.current_tag().unwrap(), 0);

        index
            .replace_source(
                "a.json",
                &[record("a.json", "1", vec![10, 20, 30]), record("a.json", "2", vec![11, 21, 31])],
            )
            .unwrap();
        let tag = index.current_tag().unwrap();
        assert!(tag > 0);

        let hits = index.lookup(&[99, 21, 99], tag).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].local_id, "2");
        assert_eq!(hits[0].band_hashes, vec![11, 21, 31]);
        assert_eq!(hits[0].insertion_tag, tag);

        assert!(index.lookup(&[1, 2, 3], tag).unwrap().is_empty());
    }

    #[test]
    fn lookup_ignores_records_committed_after_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let index = SqliteIndex::open(dir.path().join("idx.sqlite3"), 2).unwrap();
        index.insert(&record("a.json", "1", vec![5, 6])).unwrap();
        let snapshot = index.current_tag().unwrap();
        index.insert(&record("b.json", "1", vec![5, 7])).unwrap();

        let hits = index.lookup(&[5, 0], snapshot).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_path, "a.json");
        assert_eq!(index.lookup(&[5, 0], index.current_tag().unwrap()).unwrap().len(), 2);
    }

    #[test]
    fn replace_source_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let index = SqliteIndex::open(dir.path().join("idx.sqlite3"), 2).unwrap();
        let records = vec![record("a.json", "1", vec![1, 2]), record("a.json", "2", vec![3, 4])];
        let first = index.replace_source("a.json", &records).unwrap();
        let second = index.replace_source("a.json", &records).unwrap();
        assert!(second > first);
        assert_eq!(index.len().unwrap(), 2);

        assert_eq!(index.remove_source("a.json").unwrap(), 2);
        assert_eq!(index.len().unwrap(), 0);
    }

    #[test]
    fn replace_sources_commits_files_together() {
        let dir = tempfile::tempdir().unwrap();
        let index = SqliteIndex::open(dir.path().join("idx.sqlite3"), 2).unwrap();
        index.replace_source("seg/a.json", &[record("seg/a.json", "9", vec![9, 9])]).unwrap();

        let paths = vec!["seg/a.json".to_string(), "seg/b.json".to_string()];
        let tag = index
            .replace_sources(
                &paths,
                &[record("seg/a.json", "1", vec![1, 2]), record("seg/b.json", "1", vec![1, 3])],
            )
            .unwrap();
        let hits = index.lookup(&[1, 0], tag).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|r| r.insertion_tag == tag));
        assert!(index.lookup(&[9, 9], tag).unwrap().is_empty());
    }

    #[test]
    fn refuses_mismatched_band_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.sqlite3");
        let index = SqliteIndex::open(&path, 4).unwrap();
        assert!(index.lookup(&[1, 2], 0).is_err());
        drop(index);
        assert!(matches!(
            SqliteIndex::open(&path, 5),
            Err(DedupError::Config(_))
        ));
    }
}
