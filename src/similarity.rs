//! Exact Jaccard verification of LSH candidates.

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::collections::{BTreeSet, HashSet};

use crate::config::{DedupConfig, ToleranceClass};
use crate::document::Document;
use crate::lsh::CandidatePair;
use crate::minhash::{shingles, ShingleSet};

/// |A ∩ B| / |A ∪ B|; defined as 0.0 when either set is empty.
pub fn jaccard(a: &ShingleSet, b: &ShingleSet) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let intersection = small.iter().filter(|s| large.contains(s)).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Picks the duplicate threshold for a pair from the URLs of both sides.
#[derive(Clone, Debug)]
pub struct ThresholdPolicy {
    default: f64,
    classes: Vec<ToleranceClass>,
}

impl ThresholdPolicy {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            default: config.jaccard_threshold,
            classes: config.tolerance_classes.clone(),
        }
    }

    /// The first class matched by both URLs supplies the threshold.
    pub fn threshold_for(&self, url_a: &str, url_b: &str) -> f64 {
        self.classes
            .iter()
            .find(|class| matches_class(class, url_a) && matches_class(class, url_b))
            .map_or(self.default, |class| class.threshold)
    }

    pub fn is_duplicate(&self, similarity: f64, url_a: &str, url_b: &str) -> bool {
        similarity > self.threshold_for(url_a, url_b)
    }
}

fn matches_class(class: &ToleranceClass, url: &str) -> bool {
    class.patterns.iter().any(|p| url.contains(p.as_str()))
}

/// Verifies candidate pairs against exact shingle-set similarity.
#[derive(Clone, Debug)]
pub struct SimilarityVerifier {
    char_ngram: usize,
    policy: ThresholdPolicy,
}

impl SimilarityVerifier {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            char_ngram: config.char_ngram,
            policy: ThresholdPolicy::new(config),
        }
    }

    pub fn policy(&self) -> &ThresholdPolicy {
        &self.policy
    }

    pub fn char_ngram(&self) -> usize {
        self.char_ngram
    }

    /// Returns the ids marked duplicate. For every accepted pair the later id
    /// (`id_b`) is marked, so the earliest document of a cluster survives.
    pub fn verify(
        &self,
        pool: &rayon::ThreadPool,
        pairs: &BTreeSet<CandidatePair>,
        docs: &FxHashMap<u64, &Document>,
    ) -> BTreeSet<u64> {
        if pairs.is_empty() {
            return BTreeSet::new();
        }

        let involved: Vec<u64> = pairs
            .iter()
            .flat_map(|p| [p.id_a, p.id_b])
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        pool.install(|| {
            let shingle_sets: FxHashMap<u64, ShingleSet> = involved
                .par_iter()
                .filter_map(|id| docs.get(id).map(|d| (*id, shingles(&d.text, self.char_ngram))))
                .collect();

            let pairs: Vec<&CandidatePair> = pairs.iter().collect();
            pairs
                .par_iter()
                .filter_map(|pair| {
                    let (doc_a, doc_b) = (docs.get(&pair.id_a)?, docs.get(&pair.id_b)?);
                    let sim = jaccard(shingle_sets.get(&pair.id_a)?, shingle_sets.get(&pair.id_b)?);
                    self.policy
                        .is_duplicate(sim, &doc_a.url, &doc_b.url)
                        .then_some(pair.id_b)
                })
                .collect::<Vec<u64>>()
                .into_iter()
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn set(text: &str, n: usize) -> ShingleSet {
        shingles(text, n)
    }

    fn doc(id: u64, url: &str, text: &str) -> Document {
        Document::new(id, PathBuf::from("a.json"), id.to_string(), url.into(), text.into())
    }

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    #[test]
    fn jaccard_is_symmetric_and_reflexive() {
        let a = set("the quick brown fox", 3);
        let b = set("the quick brown cat", 3);
        assert_eq!(jaccard(&a, &b), jaccard(&b, &a));
        assert_eq!(jaccard(&a, &a), 1.0);
        assert!(jaccard(&a, &b) > 0.0 && jaccard(&a, &b) < 1.0);
    }

    #[test]
    fn jaccard_of_empty_sets_is_zero() {
        let empty = ShingleSet::default();
        assert_eq!(jaccard(&empty, &empty), 0.0);
        assert_eq!(jaccard(&set("abc", 2), &empty), 0.0);
    }

    #[test]
    fn jaccard_of_example_pair() {
        let sim = jaccard(&set("saab", 2), &set("saac", 2));
        assert_eq!(sim, 1.0);
        // {ab, bc, cd} vs {ab, bc, cx}
        let sim = jaccard(&set("abcde", 2), &set("abcxy", 2));
        assert!((sim - 0.5).abs() < 1e-12);
    }

    #[test]
    fn tolerance_class_needs_both_urls() {
        let policy = ThresholdPolicy::new(&DedupConfig::default());
        assert_eq!(policy.threshold_for("https://baike.example/a", "https://zh.wiki.example/b"), 0.8);
        assert_eq!(policy.threshold_for("https://baike.example/a", "https://news.example/b"), 0.5);
        assert!(policy.is_duplicate(0.6, "https://news.example", "https://blog.example"));
        assert!(!policy.is_duplicate(0.6, "https://wiki.a", "https://wiki.b"));
        assert!(!policy.is_duplicate(0.5, "https://news.example", "https://blog.example"));
    }

    #[test]
    fn keeps_the_earlier_document() {
        let config = DedupConfig {
            char_ngram: 2,
            jaccard_threshold: 0.3,
            ..DedupConfig::default()
        };
        let verifier = SimilarityVerifier::new(&config);
        let docs = vec![doc(1, "u://1", "saab"), doc(2, "u://2", "saac"), doc(3, "u://3", "xyz123")];
        let by_id: FxHashMap<u64, &Document> = docs.iter().map(|d| (d.global_id, d)).collect();
        let pairs: BTreeSet<CandidatePair> = [CandidatePair::new(2, 1), CandidatePair::new(1, 3)]
            .into_iter()
            .flatten()
            .collect();

        let dups = verifier.verify(&pool(), &pairs, &by_id);
        assert_eq!(dups, BTreeSet::from([2]));
    }

    #[test]
    fn verification_is_reproducible() {
        let verifier = SimilarityVerifier::new(&DedupConfig {
            char_ngram: 3,
            ..DedupConfig::default()
        });
        let docs: Vec<Document> = (0..6)
            .map(|i| doc(i, &format!("u://{}", i), &format!("shared body text {}", i % 2)))
            .collect();
        let by_id: FxHashMap<u64, &Document> = docs.iter().map(|d| (d.global_id, d)).collect();
        let mut pairs = BTreeSet::new();
        for x in 0..6 {
            for y in (x + 1)..6 {
                pairs.insert(CandidatePair::new(x, y).unwrap());
            }
        }
        let first = verifier.verify(&pool(), &pairs, &by_id);
        let second = verifier.verify(&pool(), &pairs, &by_id);
        assert_eq!(first, second);
        assert_eq!(first, BTreeSet::from([1, 2, 3, 4, 5]));
    }
}
