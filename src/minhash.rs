//! Signature engine: character shingles, seeded MinHash and LSH banding.
//!
//! Hashing goes through xxh3 with explicit seeds so signatures are stable
//! across processes and machines; band keys written to the persistent index
//! by one run must be reproducible by every later run.

use rayon::prelude::*;
use rustc_hash::FxHashSet;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::config::DedupConfig;
use crate::document::Document;
use crate::error::Result;

const LCG_MUL: u64 = 6364136223846793005;
const LCG_INC: u64 = 1442695040888963407;

/// Band keys of one document, one per band.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Signature {
    pub band_hashes: Vec<i64>,
}

/// Set of hashed character n-grams.
pub type ShingleSet = FxHashSet<u64>;

/// Hashes the `char_ngram`-wide windows of `text` that start before its last
/// `char_ngram` characters, so the final window is never taken. Texts no
/// longer than the window contribute a single shingle; empty text has none.
pub fn shingles(text: &str, char_ngram: usize) -> ShingleSet {
    let mut set = ShingleSet::default();
    if text.is_empty() {
        return set;
    }

    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let num_chars = boundaries.len() - 1;

    if num_chars <= char_ngram {
        set.insert(xxh3_64_with_seed(text.as_bytes(), 0));
        return set;
    }

    set.reserve(num_chars - char_ngram);
    for start in 0..(num_chars - char_ngram) {
        let window = &text[boundaries[start]..boundaries[start + char_ngram]];
        set.insert(xxh3_64_with_seed(window.as_bytes(), 0));
    }
    set
}

#[derive(Clone, Debug)]
pub struct SignatureEngine {
    char_ngram: usize,
    num_bands: usize,
    rows_per_band: usize,
    mask: u64,
    seeds: Vec<u64>,
}

impl SignatureEngine {
    pub fn new(config: &DedupConfig) -> Result<Self> {
        config.validate()?;

        let mut seeds = Vec::with_capacity(config.num_seeds);
        let mut state = config.seed;
        for _ in 0..config.num_seeds {
            state = state.wrapping_mul(LCG_MUL).wrapping_add(LCG_INC);
            seeds.push(state);
        }

        let mask = if config.hash_width >= 8 {
            u64::MAX
        } else {
            (1u64 << (config.hash_width * 8)) - 1
        };

        Ok(Self {
            char_ngram: config.char_ngram,
            num_bands: config.num_bands,
            rows_per_band: config.rows_per_band(),
            mask,
            seeds,
        })
    }

    pub fn char_ngram(&self) -> usize {
        self.char_ngram
    }

    pub fn num_bands(&self) -> usize {
        self.num_bands
    }

    pub fn shingles(&self, text: &str) -> ShingleSet {
        shingles(text, self.char_ngram)
    }

    /// Full MinHash vector of `num_seeds` values.
    pub fn minhash(&self, shingles: &ShingleSet) -> Vec<u64> {
        let mut mins = vec![self.mask; self.seeds.len()];
        for shingle in shingles {
            let bytes = shingle.to_le_bytes();
            for (slot, &seed) in mins.iter_mut().zip(&self.seeds) {
                let h = xxh3_64_with_seed(&bytes, seed) & self.mask;
                if h < *slot {
                    *slot = h;
                }
            }
        }
        mins
    }

    /// Collapses each contiguous group of `rows_per_band` values into one key.
    pub fn band_hashes(&self, values: &[u64]) -> Vec<i64> {
        values
            .chunks(self.rows_per_band)
            .take(self.num_bands)
            .enumerate()
            .map(|(band, rows)| {
                let mut bytes = Vec::with_capacity(rows.len() * 8);
                for v in rows {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                xxh3_64_with_seed(&bytes, band as u64) as i64
            })
            .collect()
    }

    pub fn signature(&self, text: &str) -> Signature {
        let values = self.minhash(&self.shingles(text));
        Signature {
            band_hashes: self.band_hashes(&values),
        }
    }

    /// Signatures for `docs`, index-aligned, computed on `pool` in disjoint
    /// contiguous shards.
    pub fn signatures(&self, pool: &rayon::ThreadPool, docs: &[&Document]) -> Vec<Signature> {
        if docs.is_empty() {
            return Vec::new();
        }
        let shard = docs.len().div_ceil(pool.current_num_threads().max(1)).max(1);
        pool.install(|| {
            docs.par_chunks(shard)
                .flat_map_iter(|chunk| chunk.iter().map(|d| self.signature(&d.text)))
                .collect()
        })
    }
}
