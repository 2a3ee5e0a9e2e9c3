//! Cross-batch duplicate index.
//!
//! The index maps band keys of every accepted-unique document to a reference
//! (batch path + local id) to where its text lives. It never stores text.

pub mod checker;
pub mod lookup;
pub mod postgres;
pub mod sqlite;

use std::sync::Arc;

use crate::config::StoreConfig;
use crate::error::Result;

pub use checker::{CrossBatchChecker, SourceCache};
pub use postgres::PgIndex;
pub use sqlite::SqliteIndex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexRecord {
    /// Batch file path relative to the output roots.
    pub source_path: String,
    pub local_id: String,
    pub url: String,
    pub band_hashes: Vec<i64>,
    /// Commit sequence value; assigned by the store on insert.
    pub insertion_tag: i64,
}

impl IndexRecord {
    pub fn new(source_path: String, local_id: String, url: String, band_hashes: Vec<i64>) -> Self {
        Self {
            source_path,
            local_id,
            url,
            band_hashes,
            insertion_tag: 0,
        }
    }
}

pub trait DuplicateIndex: Send + Sync {
    fn num_bands(&self) -> usize;

    /// Highest insertion tag committed so far (0 for an empty index).
    fn current_tag(&self) -> Result<i64>;

    /// Records with `insertion_tag <= as_of` that share at least one band key
    /// with `band_hashes`. Over-matching is expected; callers confirm.
    fn lookup(&self, band_hashes: &[i64], as_of: i64) -> Result<Vec<IndexRecord>>;

    /// Replaces every record of `source_paths` with `records` under one new
    /// insertion tag, atomically. Returns the tag. Repeating the call with
    /// the same arguments leaves the same records behind.
    fn replace_sources(&self, source_paths: &[String], records: &[IndexRecord]) -> Result<i64>;

    fn replace_source(&self, source_path: &str, records: &[IndexRecord]) -> Result<i64> {
        self.replace_sources(&[source_path.to_string()], records)
    }

    /// Appends a single record under a new insertion tag.
    fn insert(&self, record: &IndexRecord) -> Result<i64>;

    /// Deletes every record of `source_path`; returns how many were removed.
    fn remove_source(&self, source_path: &str) -> Result<usize>;

    fn len(&self) -> Result<usize>;
}

pub fn open_index(store: &StoreConfig, num_bands: usize) -> Result<Arc<dyn DuplicateIndex>> {
    Ok(match store {
        StoreConfig::Sqlite { path } => Arc::new(SqliteIndex::open(path, num_bands)?),
        StoreConfig::Postgres { url, pool_size } => {
            Arc::new(PgIndex::connect(url, *pool_size, num_bands)?)
        }
    })
}

pub(crate) fn hash_columns(num_bands: usize) -> Vec<String> {
    (0..num_bands).map(|b| format!("hash_{}", b)).collect()
}
