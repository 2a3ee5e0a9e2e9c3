//! Near-duplicate removal for crawled text batches.
//!
//! Workers claim batches from a shared job table, fingerprint documents with
//! MinHash/LSH, confirm candidates with exact Jaccard similarity, check the
//! survivors against a persistent cross-batch index and commit unique and
//! duplicate partitions atomically.

pub mod cancel;
pub mod config;
pub mod dedup;
pub mod document;
pub mod error;
pub mod index;
pub mod jobs;
pub mod lsh;
pub mod minhash;
pub mod retry;
pub mod similarity;
pub mod worker;
pub mod writer;

#[cfg(feature = "python")]
mod python;

pub use config::{AppConfig, DedupConfig};
pub use dedup::{BatchDeduplicator, DedupOutcome};
pub use error::{DedupError, Result};
pub use worker::{DedupWorker, JobOutcome, RunSummary};
