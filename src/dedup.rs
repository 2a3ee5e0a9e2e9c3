//! Batch deduplication: filters, then within-batch MinHash/LSH with exact
//! verification, then the cross-batch index check for the survivors.

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::DedupConfig;
use crate::document::filters::rejected_by;
use crate::document::{Batch, Document};
use crate::error::{DedupError, Result};
use crate::index::checker::source_key;
use crate::index::lookup::LookupPool;
use crate::index::IndexRecord;
use crate::lsh::candidate_pairs;
use crate::minhash::{Signature, SignatureEngine};
use crate::similarity::SimilarityVerifier;

/// Classification of one batch, by global id.
#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// Removed by a document filter before fingerprinting.
    pub filtered: BTreeSet<u64>,
    pub within_batch: BTreeSet<u64>,
    pub cross_batch: BTreeSet<u64>,
    /// Every file of the batch, as index keys.
    pub source_paths: Vec<String>,
    /// One record per surviving document, ready for the index commit.
    pub index_records: Vec<IndexRecord>,
}

impl DedupOutcome {
    /// Ids that go to the duplicate partition.
    pub fn removed(&self) -> BTreeSet<u64> {
        self.filtered
            .iter()
            .chain(&self.within_batch)
            .chain(&self.cross_batch)
            .copied()
            .collect()
    }
}

pub struct BatchDeduplicator {
    config: DedupConfig,
    engine: SignatureEngine,
    verifier: SimilarityVerifier,
    pool: rayon::ThreadPool,
}

impl BatchDeduplicator {
    /// `threads` sizes the pool used for signatures and verification.
    pub fn new(config: &DedupConfig, threads: usize) -> Result<Self> {
        let engine = SignatureEngine::new(config)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("dedup-sig-{}", i))
            .build()
            .map_err(|e| DedupError::Config(format!("cannot build signature pool: {}", e)))?;
        Ok(Self {
            config: config.clone(),
            engine,
            verifier: SimilarityVerifier::new(config),
            pool,
        })
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    pub fn engine(&self) -> &SignatureEngine {
        &self.engine
    }

    /// Signatures of `docs` (index-aligned) and the ids marked duplicate
    /// within the set.
    pub fn within_batch(&self, docs: &[&Document]) -> (Vec<Signature>, BTreeSet<u64>) {
        let start = Instant::now();
        let signatures = self.engine.signatures(&self.pool, docs);
        debug!(documents = docs.len(), "signatures took {:?}", start.elapsed());

        let start = Instant::now();
        let with_ids: Vec<(u64, &Signature)> = docs
            .iter()
            .zip(&signatures)
            .map(|(d, s)| (d.global_id, s))
            .collect();
        let pairs = candidate_pairs(&with_ids, self.engine.num_bands());
        let by_id: FxHashMap<u64, &Document> = docs.iter().map(|d| (d.global_id, *d)).collect();
        let duplicates = self.verifier.verify(&self.pool, &pairs, &by_id);
        debug!(
            candidates = pairs.len(),
            duplicates = duplicates.len(),
            "verification took {:?}",
            start.elapsed()
        );

        (signatures, duplicates)
    }

    /// Classifies every document of `batch`. Cross-batch lookups start only
    /// after within-batch resolution, and nothing is written anywhere.
    pub fn run(&self, batch: &Batch, lookups: Option<&LookupPool>) -> Result<DedupOutcome> {
        let mut outcome = DedupOutcome {
            source_paths: batch.files.iter().map(|f| source_key(f)).collect(),
            ..DedupOutcome::default()
        };

        let mut kept: Vec<&Document> = Vec::with_capacity(batch.documents.len());
        for doc in &batch.documents {
            match rejected_by(&self.config.filters, doc) {
                Some(filter) => {
                    debug!(local_id = %doc.local_id, ?filter, "document filtered");
                    outcome.filtered.insert(doc.global_id);
                }
                None => kept.push(doc),
            }
        }

        let (signatures, within) = self.within_batch(&kept);
        outcome.within_batch = within;

        let survivors: Vec<(&Document, &Signature)> = kept
            .iter()
            .copied()
            .zip(&signatures)
            .filter(|(d, _)| !outcome.within_batch.contains(&d.global_id))
            .collect();

        if let Some(lookups) = lookups {
            let as_of = lookups.checker().snapshot()?;
            let own: FxHashSet<String> = outcome.source_paths.iter().cloned().collect();
            outcome.cross_batch = lookups.cross_batch_duplicates(&survivors, &own, as_of)?;
        }

        outcome.index_records = survivors
            .iter()
            .filter(|(d, _)| !outcome.cross_batch.contains(&d.global_id))
            .map(|(d, s)| {
                IndexRecord::new(
                    source_key(&d.source_file),
                    d.local_id.clone(),
                    d.url.clone(),
                    s.band_hashes.clone(),
                )
            })
            .collect();

        info!(
            uri = %batch.uri,
            documents = batch.documents.len(),
            filtered = outcome.filtered.len(),
            within_batch = outcome.within_batch.len(),
            cross_batch = outcome.cross_batch.len(),
            unique = outcome.index_records.len(),
            "batch classified"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::filters::DocumentFilter;
    use serde_json::json;
    use std::fs;

    fn load(value: serde_json::Value) -> (tempfile::TempDir, Batch) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.json"), serde_json::to_vec(&value).unwrap()).unwrap();
        let batch = Batch::load(dir.path(), "a.json").unwrap();
        (dir, batch)
    }

    #[test]
    fn near_duplicate_pair_keeps_the_first() {
        let config = DedupConfig {
            char_ngram: 2,
            num_seeds: 20,
            num_bands: 4,
            ..DedupConfig::default()
        };
        let (_dir, batch) = load(json!({
            "1": {"url": "u://1", "data": "saab"},
            "2": {"url": "u://2", "data": "saac"},
            "3": {"url": "u://3", "data": "xyz123"},
        }));
        let dedup = BatchDeduplicator::new(&config, 2).unwrap();
        let outcome = dedup.run(&batch, None).unwrap();

        assert!(outcome.filtered.is_empty());
        assert_eq!(outcome.within_batch, BTreeSet::from([1]));
        assert!(outcome.cross_batch.is_empty());
        let kept: Vec<_> = outcome.index_records.iter().map(|r| r.local_id.as_str()).collect();
        assert_eq!(kept, vec!["1", "3"]);
        assert_eq!(outcome.source_paths, vec!["a.json".to_string()]);

        // the pair collides in every band, "xyz123" in none
        let sigs: Vec<_> = ["saab", "saac", "xyz123"]
            .iter()
            .map(|t| dedup.engine().signature(t))
            .collect();
        assert_eq!(sigs[0], sigs[1]);
        assert!(sigs[0].band_hashes.iter().zip(&sigs[2].band_hashes).all(|(a, b)| a != b));
    }

    #[test]
    fn filtered_documents_are_removed_before_fingerprinting() {
        let config = DedupConfig {
            filters: vec![DocumentFilter::MinLength { min_chars: 6 }],
            ..DedupConfig::default()
        };
        let (_dir, batch) = load(json!({
            "1": {"url": "u://1", "data": "short"},
            "2": {"url": "u://2", "data": "long enough to survive"},
            "3": {"url": "u://3", "data": "long enough to survive"},
        }));
        let dedup = BatchDeduplicator::new(&config, 1).unwrap();
        let outcome = dedup.run(&batch, None).unwrap();

        assert_eq!(outcome.filtered, BTreeSet::from([0]));
        assert_eq!(outcome.within_batch, BTreeSet::from([2]));
        assert_eq!(outcome.removed(), BTreeSet::from([0, 2]));
        assert_eq!(outcome.index_records.len(), 1);
    }

    #[test]
    fn within_batch_result_is_reproducible() {
        // five unrelated bodies, each repeated eight times
        let texts: Vec<String> = (0..40u64)
            .map(|i| {
                (0..6u64)
                    .map(|k| format!("{:016x}", xxhash_rust::xxh3::xxh3_64_with_seed(&(i % 5).to_le_bytes(), k)))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();
        let docs: Vec<Document> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                Document::new(i as u64, "a.json".into(), i.to_string(), format!("u://{}", i), t.clone())
            })
            .collect();
        let refs: Vec<&Document> = docs.iter().collect();

        let dedup = BatchDeduplicator::new(&DedupConfig::default(), 4).unwrap();
        let (sigs, first) = dedup.within_batch(&refs);
        let (_, second) = dedup.within_batch(&refs);
        assert_eq!(first, second);
        assert_eq!(sigs.len(), 40);
        // exact copies of ids 0..5 are always caught
        assert!((5..40).all(|i| first.contains(&i)));
        assert!((0..5).all(|i| !first.contains(&i)));
    }
}
