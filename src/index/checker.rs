use dashmap::DashMap;
use rustc_hash::FxHashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use super::{DuplicateIndex, IndexRecord};
use crate::config::DedupConfig;
use crate::document::{read_partition, Document, PartitionFile};
use crate::error::{DedupError, Result};
use crate::minhash::{shingles, Signature};
use crate::similarity::{jaccard, ThresholdPolicy};

/// Index key for a batch file path.
pub fn source_key(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Unique partitions loaded on demand, shared by the lookup threads.
pub struct SourceCache {
    root: PathBuf,
    files: DashMap<String, Arc<PartitionFile>>,
}

impl SourceCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: DashMap::new(),
        }
    }

    /// `Ok(None)` when the partition no longer exists or cannot be parsed.
    pub fn get(&self, source_path: &str) -> Result<Option<Arc<PartitionFile>>> {
        if let Some(file) = self.files.get(source_path) {
            return Ok(Some(file.clone()));
        }
        match read_partition(&self.root.join(source_path)) {
            Ok(file) => {
                let file = Arc::new(file);
                self.files.insert(source_path.to_string(), file.clone());
                Ok(Some(file))
            }
            Err(DedupError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e @ DedupError::Data { .. }) => {
                warn!(source = source_path, error = %e, "unreadable unique partition");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&self) {
        self.files.clear();
    }
}

/// Decides whether a provisionally unique document duplicates something
/// already accepted by an earlier batch.
pub struct CrossBatchChecker {
    index: Arc<dyn DuplicateIndex>,
    policy: ThresholdPolicy,
    char_ngram: usize,
    cache: SourceCache,
}

impl CrossBatchChecker {
    pub fn new(index: Arc<dyn DuplicateIndex>, config: &DedupConfig, unique_root: &Path) -> Self {
        Self {
            index,
            policy: ThresholdPolicy::new(config),
            char_ngram: config.char_ngram,
            cache: SourceCache::new(unique_root),
        }
    }

    pub fn index(&self) -> &Arc<dyn DuplicateIndex> {
        &self.index
    }

    pub fn cache(&self) -> &SourceCache {
        &self.cache
    }

    /// Commit tag that bounds every lookup of the batch about to be checked.
    pub fn snapshot(&self) -> Result<i64> {
        self.index.current_tag()
    }

    pub fn lookup(&self, signature: &Signature, as_of: i64) -> Result<Vec<IndexRecord>> {
        self.index.lookup(&signature.band_hashes, as_of)
    }

    /// True when `doc` matches any candidate outside `batch_paths` above the
    /// threshold chosen for the pair. Records of the batch's own files are
    /// self-matches and never count.
    pub fn confirm(
        &self,
        doc: &Document,
        batch_paths: &FxHashSet<String>,
        candidates: &[IndexRecord],
    ) -> Result<bool> {
        let mut own: Option<_> = None;

        for record in candidates {
            if batch_paths.contains(&record.source_path) {
                continue;
            }
            let Some(file) = self.cache.get(&record.source_path)? else {
                warn!(
                    source = %record.source_path,
                    local_id = %record.local_id,
                    "indexed document has no stored text, skipping"
                );
                continue;
            };
            let Some(other) = file.get(&record.local_id) else {
                warn!(
                    source = %record.source_path,
                    local_id = %record.local_id,
                    "indexed document missing from its partition, skipping"
                );
                continue;
            };

            let own_set = own.get_or_insert_with(|| shingles(&doc.text, self.char_ngram));
            let sim = jaccard(own_set, &shingles(&other.data, self.char_ngram));
            if self.policy.is_duplicate(sim, &doc.url, &record.url) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Lookup followed by confirm.
    pub fn is_duplicate(
        &self,
        doc: &Document,
        signature: &Signature,
        batch_paths: &FxHashSet<String>,
        as_of: i64,
    ) -> Result<bool> {
        let candidates = self.lookup(signature, as_of)?;
        if candidates.is_empty() {
            return Ok(false);
        }
        self.confirm(doc, batch_paths, &candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{write_partition, DocumentRecord};
    use crate::index::SqliteIndex;
    use crate::minhash::SignatureEngine;

    const TEXT: &str = "an article body long enough to shingle properly";

    fn setup() -> (tempfile::TempDir, CrossBatchChecker, SignatureEngine) {
        let dir = tempfile::tempdir().unwrap();
        let config = DedupConfig::default();
        let index = Arc::new(SqliteIndex::open(dir.path().join("idx.sqlite3"), config.num_bands).unwrap());
        let checker = CrossBatchChecker::new(index, &config, &dir.path().join("unique"));
        (dir, checker, SignatureEngine::new(&config).unwrap())
    }

    fn store(dir: &Path, checker: &CrossBatchChecker, engine: &SignatureEngine, path: &str, text: &str) {
        let mut file = PartitionFile::new();
        file.insert(
            "1".into(),
            DocumentRecord {
                url: format!("u://{}", path),
                date: None,
                content_length: None,
                data: text.into(),
                data_length: None,
            },
        );
        write_partition(&dir.join("unique").join(path), &file).unwrap();
        let record = IndexRecord::new(
            path.into(),
            "1".into(),
            format!("u://{}", path),
            engine.signature(text).band_hashes,
        );
        checker.index().replace_source(path, &[record]).unwrap();
    }

    fn doc(path: &str, text: &str) -> Document {
        Document::new(0, PathBuf::from(path), "1".into(), "u://new".into(), text.into())
    }

    #[test]
    fn detects_document_from_an_earlier_batch() {
        let (dir, checker, engine) = setup();
        store(dir.path(), &checker, &engine, "old/a.json", TEXT);
        let as_of = checker.snapshot().unwrap();

        let d = doc("new/b.json", TEXT);
        let paths = FxHashSet::from_iter([source_key(&d.source_file)]);
        assert!(checker
            .is_duplicate(&d, &engine.signature(TEXT), &paths, as_of)
            .unwrap());

        let other = "completely unrelated content about something else";
        let d = doc("new/b.json", other);
        assert!(!checker
            .is_duplicate(&d, &engine.signature(other), &paths, as_of)
            .unwrap());
    }

    #[test]
    fn ignores_records_of_its_own_batch() {
        let (dir, checker, engine) = setup();
        store(dir.path(), &checker, &engine, "seg/a.json", TEXT);
        let as_of = checker.snapshot().unwrap();

        let d = doc("seg/a.json", TEXT);
        let paths = FxHashSet::from_iter([source_key(&d.source_file)]);
        assert!(!checker
            .is_duplicate(&d, &engine.signature(TEXT), &paths, as_of)
            .unwrap());
    }

    #[test]
    fn skips_records_without_text() {
        let (dir, checker, engine) = setup();
        store(dir.path(), &checker, &engine, "old/a.json", TEXT);
        std::fs::remove_file(dir.path().join("unique/old/a.json")).unwrap();
        let as_of = checker.snapshot().unwrap();

        let d = doc("new/b.json", TEXT);
        let paths = FxHashSet::from_iter([source_key(&d.source_file)]);
        assert!(!checker
            .is_duplicate(&d, &engine.signature(TEXT), &paths, as_of)
            .unwrap());
        assert!(checker.cache().is_empty());
    }
}
