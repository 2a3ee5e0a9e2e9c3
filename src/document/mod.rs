//! Batch files and the documents they hold.
//!
//! A batch file is a JSON object mapping local document ids to
//! [`DocumentRecord`]s, optionally zstd-compressed (`.zst` suffix). A job uri
//! names either one batch file or a directory of them, relative to the input
//! root; outputs reuse the same relative paths under the output roots.

pub mod filters;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{DedupError, Result};

pub const BATCH_PATTERNS: [&str; 2] = ["*.json", "*.json.zst"];

/// On-disk shape of one document. Fields not listed here (for example
/// fingerprints cached by older tooling) are dropped on rewrite.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DocumentRecord {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_length: Option<u64>,
}

pub type RawBatch = BTreeMap<String, serde_json::Value>;
pub type PartitionFile = BTreeMap<String, DocumentRecord>;

#[derive(Clone, Debug)]
pub struct Document {
    pub global_id: u64,
    /// Batch file path relative to the input root.
    pub source_file: PathBuf,
    pub local_id: String,
    pub url: String,
    pub text: String,
    pub text_length: usize,
    pub date: Option<String>,
    pub content_length: Option<u64>,
    pub data_length: Option<u64>,
}

impl Document {
    pub fn new(
        global_id: u64,
        source_file: PathBuf,
        local_id: String,
        url: String,
        text: String,
    ) -> Self {
        let text_length = text.chars().count();
        Self {
            global_id,
            source_file,
            local_id,
            url,
            text,
            text_length,
            date: None,
            content_length: None,
            data_length: None,
        }
    }

    fn from_record(
        global_id: u64,
        source_file: PathBuf,
        local_id: String,
        record: DocumentRecord,
    ) -> Self {
        let mut doc = Self::new(global_id, source_file, local_id, record.url, record.data);
        doc.date = record.date;
        doc.content_length = record.content_length;
        doc.data_length = record.data_length;
        doc
    }

    pub fn to_record(&self) -> DocumentRecord {
        DocumentRecord {
            url: self.url.clone(),
            date: self.date.clone(),
            content_length: self.content_length,
            data: self.text.clone(),
            data_length: self.data_length,
        }
    }
}

/// All documents of one job, with `global_id`s assigned in file then
/// local-id order so that a retried job numbers its documents identically.
#[derive(Debug)]
pub struct Batch {
    pub uri: String,
    pub files: Vec<PathBuf>,
    pub documents: Vec<Document>,
    /// Entries that could not be parsed as documents.
    pub rejected: usize,
    /// blake3 over the raw bytes of every file, in load order.
    pub digest: String,
}

impl Batch {
    pub fn load(input_root: &Path, uri: &str) -> Result<Self> {
        let files = batch_files(input_root, uri)?;
        let mut hasher = blake3::Hasher::new();
        let mut documents = Vec::new();
        let mut rejected = 0usize;

        for rel in &files {
            let path = input_root.join(rel);
            let bytes = fs::read(&path)?;
            hasher.update(&bytes);
            let raw = decode_batch(&path, &bytes)?;

            let mut entries: Vec<(String, serde_json::Value)> = raw.into_iter().collect();
            entries.sort_by(|a, b| cmp_local_ids(&a.0, &b.0));

            for (local_id, value) in entries {
                match serde_json::from_value::<DocumentRecord>(value) {
                    Ok(record) => {
                        let global_id = documents.len() as u64;
                        documents.push(Document::from_record(
                            global_id,
                            rel.clone(),
                            local_id,
                            record,
                        ));
                    }
                    Err(e) => {
                        warn!(file = %path.display(), local_id = %local_id, error = %e, "rejecting malformed document");
                        rejected += 1;
                    }
                }
            }
        }

        debug!(uri, files = files.len(), documents = documents.len(), "batch loaded");
        Ok(Self {
            uri: uri.to_string(),
            files,
            documents,
            rejected,
            digest: hasher.finalize().to_hex().to_string(),
        })
    }
}

/// Resolves a job uri to the sorted list of batch files it covers, relative
/// to `input_root`.
pub fn batch_files(input_root: &Path, uri: &str) -> Result<Vec<PathBuf>> {
    let target = input_root.join(uri);
    if target.is_file() {
        return Ok(vec![PathBuf::from(uri)]);
    }
    if !target.is_dir() {
        return Err(DedupError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("batch {} not found", target.display()),
        )));
    }

    let mut files = discover_batches(&target)?
        .into_iter()
        .map(|p| Path::new(uri).join(p))
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

/// Every batch file below `root`, as sorted paths relative to `root`.
pub fn discover_batches(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for pattern in BATCH_PATTERNS {
        let full = format!(
            "{}/**/{}",
            glob::Pattern::escape(&root.to_string_lossy()),
            pattern
        );
        let entries = glob::glob(&full).map_err(|e| DedupError::data(root, e.to_string()))?;
        for entry in entries.flatten() {
            if let Ok(rel) = entry.strip_prefix(root) {
                found.push(rel.to_path_buf());
            }
        }
    }
    found.sort();
    found.dedup();
    Ok(found)
}

fn is_compressed(path: &Path) -> bool {
    path.extension().map_or(false, |e| e == "zst")
}

fn decode_batch(path: &Path, bytes: &[u8]) -> Result<RawBatch> {
    let json = if is_compressed(path) {
        zstd::stream::decode_all(bytes).map_err(|e| DedupError::data(path, e.to_string()))?
    } else {
        bytes.to_vec()
    };
    serde_json::from_slice(&json).map_err(|e| DedupError::data(path, e.to_string()))
}

pub fn read_partition(path: &Path) -> Result<PartitionFile> {
    let bytes = fs::read(path)?;
    let json = if is_compressed(path) {
        zstd::stream::decode_all(bytes.as_slice()).map_err(|e| DedupError::data(path, e.to_string()))?
    } else {
        bytes
    };
    serde_json::from_slice(&json).map_err(|e| DedupError::data(path, e.to_string()))
}

/// Writes `records` to `path` through a temporary sibling and a rename, so
/// readers never observe a half-written file. Returns the bytes written.
pub fn write_partition(path: &Path, records: &PartitionFile) -> Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec(records)?;
    let payload = if is_compressed(path) {
        zstd::stream::encode_all(json.as_slice(), 3)?
    } else {
        json
    };

    let tmp = temp_sibling(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(payload.len() as u64)
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Numeric ids sort numerically and before non-numeric ones.
fn cmp_local_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
