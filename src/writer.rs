//! Partition writer: splits a batch into unique and duplicate partitions and
//! moves the source out of the input tree once the batch is committed.
//!
//! Partitions are first written beside their final paths under a `.staged-`
//! prefix. Only [`PartitionWriter::publish`], run after the index commit,
//! renames them into place, so an aborted attempt never touches partitions a
//! previous committed attempt left behind.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::PathsConfig;
use crate::document::{write_partition, Batch, PartitionFile};
use crate::error::Result;

const STAGED_PREFIX: &str = ".staged-";

/// Boundaries of the commit sequence, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitStage {
    /// Both partitions of every file are staged; nothing visible has changed.
    PartitionsWritten,
    /// Index records are committed. The batch can only roll forward now.
    IndexCommitted,
    /// The source batch sits under the processed root.
    SourceMoved,
}

/// A partition written under its staging name, and where it goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedFile {
    pub staged: PathBuf,
    pub target: PathBuf,
}

/// Partitions written for one batch, not yet published.
#[derive(Debug, Default)]
pub struct StagedCommit {
    pub files: Vec<StagedFile>,
    pub unique_count: usize,
    pub duplicate_count: usize,
    pub unique_bytes: u64,
    pub duplicate_bytes: u64,
}

/// Staging name of `target`. The prefix keeps the extension, and with it the
/// compression choice, intact.
fn staged_path(target: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(STAGED_PREFIX);
    name.push(target.file_name().unwrap_or_default());
    target.with_file_name(name)
}

#[derive(Clone, Debug)]
pub struct PartitionWriter {
    paths: PathsConfig,
}

impl PartitionWriter {
    pub fn new(paths: PathsConfig) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &PathsConfig {
        &self.paths
    }

    /// Writes one unique and one duplicate partition per source file, staged
    /// beside the same relative path as the source. `removed` holds every
    /// global id that does not belong in the unique side.
    pub fn stage(&self, batch: &Batch, removed: &BTreeSet<u64>) -> Result<StagedCommit> {
        let mut staged = StagedCommit::default();

        for rel in &batch.files {
            let mut unique = PartitionFile::new();
            let mut duplicate = PartitionFile::new();
            for doc in batch.documents.iter().filter(|d| &d.source_file == rel) {
                if removed.contains(&doc.global_id) {
                    duplicate.insert(doc.local_id.clone(), doc.to_record());
                } else {
                    unique.insert(doc.local_id.clone(), doc.to_record());
                }
            }

            let result = self.write_pair(rel, &unique, &duplicate, &mut staged);
            if let Err(e) = result {
                self.rollback(&staged);
                return Err(e);
            }
            staged.unique_count += unique.len();
            staged.duplicate_count += duplicate.len();
        }

        debug!(
            uri = %batch.uri,
            unique = staged.unique_count,
            duplicate = staged.duplicate_count,
            "partitions staged"
        );
        Ok(staged)
    }

    fn write_pair(
        &self,
        rel: &Path,
        unique: &PartitionFile,
        duplicate: &PartitionFile,
        staged: &mut StagedCommit,
    ) -> Result<()> {
        let target = self.paths.unique_root.join(rel);
        let file = StagedFile {
            staged: staged_path(&target),
            target,
        };
        staged.unique_bytes += write_partition(&file.staged, unique)?;
        staged.files.push(file);

        let target = self.paths.duplicate_root.join(rel);
        let file = StagedFile {
            staged: staged_path(&target),
            target,
        };
        staged.duplicate_bytes += write_partition(&file.staged, duplicate)?;
        staged.files.push(file);
        Ok(())
    }

    /// Renames staged partitions onto their final paths. Each rename replaces
    /// the target atomically; a file already published by an earlier call is
    /// skipped, so the call can be repeated.
    pub fn publish(&self, staged: &StagedCommit) -> Result<()> {
        for file in &staged.files {
            if !file.staged.exists() && file.target.exists() {
                continue;
            }
            fs::rename(&file.staged, &file.target)?;
        }
        Ok(())
    }

    /// Removes the staged partitions of an uncommitted batch. Published
    /// partitions are never touched. Best effort: failures are logged, and a
    /// later attempt overwrites the same staging paths anyway.
    pub fn rollback(&self, staged: &StagedCommit) {
        for file in &staged.files {
            match fs::remove_file(&file.staged) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %file.staged.display(), error = %e, "could not remove staged partition"),
            }
        }
    }

    /// Moves the source of `uri` under the processed root. Succeeds without
    /// doing anything when an earlier attempt already moved it.
    pub fn finalize(&self, uri: &str) -> Result<()> {
        let source = self.paths.input_root.join(uri);
        let target = self.paths.processed_root.join(uri);

        if !source.exists() && target.exists() {
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.is_dir() && source.is_dir() {
            // a previous attempt moved part of a directory batch
            merge_dir(&source, &target)?;
        } else {
            move_path(&source, &target)?;
        }
        info!(uri, to = %target.display(), "source batch moved to processed");
        Ok(())
    }

    /// True when `uri` was moved out of the input tree by a finished commit.
    pub fn is_finalized(&self, uri: &str) -> bool {
        !self.paths.input_root.join(uri).exists() && self.paths.processed_root.join(uri).exists()
    }
}

fn merge_dir(source: &Path, target: &Path) -> Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let dest = target.join(entry.file_name());
        if entry.file_type()?.is_dir() && dest.is_dir() {
            merge_dir(&entry.path(), &dest)?;
        } else {
            move_path(&entry.path(), &dest)?;
        }
    }
    fs::remove_dir(source)?;
    Ok(())
}

/// `fs::rename`, falling back to copy and delete when the processed root
/// lives on another filesystem.
fn move_path(source: &Path, target: &Path) -> Result<()> {
    match fs::rename(source, target) {
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            debug!(from = %source.display(), to = %target.display(), "rename crosses devices, copying");
            copy_then_remove(source, target)
        }
        other => Ok(other?),
    }
}

/// Copies `source` (file or directory tree) to `target`, then deletes it.
/// The copy lands under a staging name first so `target` never holds a
/// partial tree.
fn copy_then_remove(source: &Path, target: &Path) -> Result<()> {
    let tmp = staged_path(target);
    if tmp.is_dir() {
        fs::remove_dir_all(&tmp)?;
    }
    copy_tree(source, &tmp)?;
    fs::rename(&tmp, target)?;
    if source.is_dir() {
        fs::remove_dir_all(source)?;
    } else {
        fs::remove_file(source)?;
    }
    Ok(())
}

fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    if !source.is_dir() {
        fs::copy(source, target)?;
        return Ok(());
    }
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        copy_tree(&entry.path(), &target.join(entry.file_name()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::read_partition;
    use serde_json::json;

    fn setup() -> (tempfile::TempDir, PartitionWriter, Batch) {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig::under(dir.path());
        let seg = paths.input_root.join("seg");
        fs::create_dir_all(&seg).unwrap();
        fs::write(
            seg.join("a.json"),
            serde_json::to_vec(&json!({
                "1": {"url": "u://1", "data": "first document"},
                "2": {"url": "u://2", "data": "second document"},
            }))
            .unwrap(),
        )
        .unwrap();
        fs::write(
            seg.join("b.json"),
            serde_json::to_vec(&json!({"1": {"url": "u://b1", "data": "third"}})).unwrap(),
        )
        .unwrap();
        let batch = Batch::load(&paths.input_root, "seg").unwrap();
        (dir, PartitionWriter::new(paths), batch)
    }

    #[test]
    fn stage_splits_by_source_file() {
        let (_dir, writer, batch) = setup();
        let staged = writer.stage(&batch, &BTreeSet::from([1])).unwrap();
        assert_eq!(staged.unique_count, 2);
        assert_eq!(staged.duplicate_count, 1);
        assert_eq!(staged.files.len(), 4);

        let paths = writer.paths();
        assert!(!paths.unique_root.join("seg/a.json").exists());
        assert!(paths.unique_root.join("seg/.staged-a.json").exists());
        writer.publish(&staged).unwrap();
        writer.publish(&staged).unwrap();
        assert!(!paths.unique_root.join("seg/.staged-a.json").exists());

        let unique_a = read_partition(&paths.unique_root.join("seg/a.json")).unwrap();
        let dup_a = read_partition(&paths.duplicate_root.join("seg/a.json")).unwrap();
        assert_eq!(unique_a.keys().collect::<Vec<_>>(), vec!["1"]);
        assert_eq!(dup_a["2"].data, "second document");
        let dup_b = read_partition(&paths.duplicate_root.join("seg/b.json")).unwrap();
        assert!(dup_b.is_empty());
    }

    #[test]
    fn rollback_removes_partitions() {
        let (_dir, writer, batch) = setup();
        let staged = writer.stage(&batch, &BTreeSet::new()).unwrap();
        writer.rollback(&staged);
        assert!(staged.files.iter().all(|f| !f.staged.exists() && !f.target.exists()));
        assert!(writer.paths().input_root.join("seg/a.json").exists());
    }

    #[test]
    fn rollback_keeps_partitions_of_an_earlier_commit() {
        let (_dir, writer, batch) = setup();
        let committed = writer.stage(&batch, &BTreeSet::new()).unwrap();
        writer.publish(&committed).unwrap();

        // a later attempt on the same batch aborts before its commit point
        let retry = writer.stage(&batch, &BTreeSet::from([0, 1, 2])).unwrap();
        writer.rollback(&retry);

        let unique = read_partition(&writer.paths().unique_root.join("seg/a.json")).unwrap();
        assert_eq!(unique.keys().collect::<Vec<_>>(), vec!["1", "2"]);
        assert!(retry.files.iter().all(|f| !f.staged.exists()));
    }

    #[test]
    fn compressed_partitions_stay_compressed_when_staged() {
        let target = Path::new("/out/seg/a.json.zst");
        assert_eq!(staged_path(target), Path::new("/out/seg/.staged-a.json.zst"));
    }

    #[test]
    fn cross_device_fallback_moves_a_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in/seg");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("a.json"), b"{}").unwrap();
        fs::write(source.join("sub/b.json"), b"{}").unwrap();
        let target = dir.path().join("done/seg");
        fs::create_dir_all(target.parent().unwrap()).unwrap();

        copy_then_remove(&source, &target).unwrap();
        assert!(!source.exists());
        assert!(target.join("a.json").exists());
        assert!(target.join("sub/b.json").exists());
        assert!(!dir.path().join("done/.staged-seg").exists());
    }

    #[test]
    fn finalize_moves_source_once() {
        let (_dir, writer, _batch) = setup();
        assert!(!writer.is_finalized("seg"));
        writer.finalize("seg").unwrap();
        assert!(writer.is_finalized("seg"));
        assert!(writer.paths().processed_root.join("seg/b.json").exists());
        writer.finalize("seg").unwrap();
    }

    #[test]
    fn finalize_completes_a_partial_move() {
        let (_dir, writer, _batch) = setup();
        let paths = writer.paths().clone();
        fs::create_dir_all(paths.processed_root.join("seg")).unwrap();
        fs::rename(
            paths.input_root.join("seg/a.json"),
            paths.processed_root.join("seg/a.json"),
        )
        .unwrap();

        writer.finalize("seg").unwrap();
        assert!(!paths.input_root.join("seg").exists());
        assert!(paths.processed_root.join("seg/a.json").exists());
        assert!(paths.processed_root.join("seg/b.json").exists());
    }
}
