//! Candidate generation by LSH banding.

use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

use crate::minhash::Signature;

/// Unordered document pair, normalised so that `id_a < id_b`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CandidatePair {
    pub id_a: u64,
    pub id_b: u64,
}

impl CandidatePair {
    /// Returns `None` for a self-pair.
    pub fn new(x: u64, y: u64) -> Option<Self> {
        match x.cmp(&y) {
            std::cmp::Ordering::Less => Some(Self { id_a: x, id_b: y }),
            std::cmp::Ordering::Greater => Some(Self { id_a: y, id_b: x }),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// Every pair of documents that share a bucket in at least one band. Pairs
/// found in several bands appear once.
pub fn candidate_pairs(signatures: &[(u64, &Signature)], num_bands: usize) -> BTreeSet<CandidatePair> {
    let mut pairs = BTreeSet::new();

    for band in 0..num_bands {
        let mut buckets: FxHashMap<i64, Vec<u64>> = FxHashMap::default();
        for (id, sig) in signatures {
            if let Some(key) = sig.band_hashes.get(band) {
                buckets.entry(*key).or_default().push(*id);
            }
        }

        for ids in buckets.values().filter(|ids| ids.len() > 1) {
            for (i, &x) in ids.iter().enumerate() {
                for &y in &ids[i + 1..] {
                    if let Some(pair) = CandidatePair::new(x, y) {
                        pairs.insert(pair);
                    }
                }
            }
        }
    }

    pairs
}
