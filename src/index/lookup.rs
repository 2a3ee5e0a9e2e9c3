//! Parallel cross-batch lookups.
//!
//! Lookups are dominated by store round trips, so they run on their own fixed
//! set of threads rather than the signature pool. Work is handed out as
//! contiguous id ranges over a bounded channel.

use flume::bounded as flume_bounded;
use rustc_hash::FxHashSet;
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;
use tracing::{debug, error};

use super::checker::CrossBatchChecker;
use crate::cancel::CancelToken;
use crate::document::Document;
use crate::error::Result;
use crate::minhash::Signature;
use crate::retry::RetryPolicy;

/// Documents per work item handed to a lookup thread.
const RANGE_SIZE: usize = 64;

pub struct LookupPool<'a> {
    checker: &'a CrossBatchChecker,
    workers: usize,
    retry: RetryPolicy,
    cancel: CancelToken,
}

impl<'a> LookupPool<'a> {
    pub fn new(checker: &'a CrossBatchChecker, workers: usize, retry: RetryPolicy, cancel: CancelToken) -> Self {
        Self {
            checker,
            workers: workers.max(1),
            retry,
            cancel,
        }
    }

    pub fn checker(&self) -> &CrossBatchChecker {
        self.checker
    }

    /// Ids of `docs` that duplicate a record committed at or before `as_of`.
    /// Any range that still fails after its retries fails the whole call, so
    /// a batch is never committed on partial lookup results.
    pub fn cross_batch_duplicates(
        &self,
        docs: &[(&Document, &Signature)],
        batch_paths: &FxHashSet<String>,
        as_of: i64,
    ) -> Result<BTreeSet<u64>> {
        if docs.is_empty() {
            return Ok(BTreeSet::new());
        }
        let start = Instant::now();
        let (tx_range, rx_range) = flume_bounded::<Range<usize>>(self.workers * 2);
        let (tx_result, rx_result) = flume::unbounded::<Result<Vec<u64>>>();
        let failed = AtomicBool::new(false);

        thread::scope(|s| {
            for _ in 0..self.workers {
                let rx = rx_range.clone();
                let tx = tx_result.clone();
                let failed = &failed;
                s.spawn(move || {
                    while let Ok(range) = rx.recv() {
                        if failed.load(Ordering::Relaxed) {
                            continue;
                        }
                        let found = self.check_range(&docs[range.clone()], batch_paths, as_of);
                        if let Err(e) = &found {
                            error!(first = range.start, last = range.end - 1, error = %e, "lookup range failed");
                            failed.store(true, Ordering::Relaxed);
                        }
                        let _ = tx.send(found);
                    }
                });
            }
            drop(rx_range);
            drop(tx_result);

            let mut offset = 0;
            while offset < docs.len() {
                if failed.load(Ordering::Relaxed) {
                    break;
                }
                let end = (offset + RANGE_SIZE).min(docs.len());
                if tx_range.send(offset..end).is_err() {
                    break;
                }
                offset = end;
            }
            drop(tx_range);
        });

        let mut duplicates = BTreeSet::new();
        for found in rx_result.drain() {
            duplicates.extend(found?);
        }
        debug!(
            documents = docs.len(),
            duplicates = duplicates.len(),
            "cross-batch lookups took {:?}",
            start.elapsed()
        );
        Ok(duplicates)
    }

    fn check_range(
        &self,
        docs: &[(&Document, &Signature)],
        batch_paths: &FxHashSet<String>,
        as_of: i64,
    ) -> Result<Vec<u64>> {
        self.cancel.check()?;
        self.retry.run("index lookup", || {
            let mut found = Vec::new();
            for (doc, signature) in docs {
                if self.checker.is_duplicate(doc, signature, batch_paths, as_of)? {
                    found.push(doc.global_id);
                }
            }
            Ok(found)
        })
    }
}
