//! Repository checks and restore verification.

use crate::bup::{Bup, FsckMode};
use crate::types::{Excludes, StageStatus};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Runs `bup fsck`, repairing if asked. When the first pass fails the
/// repository is checked again, since fsck may have found and fixed an error.
pub async fn check_repository(bup: &Bup, repair: bool) -> StageStatus {
    let mode = if repair { FsckMode::Repair } else { FsckMode::Check };
    if bup.fsck(mode).await {
        return StageStatus::Passed;
    }
    if bup.fsck(FsckMode::Check).await {
        info!("repository passed the second fsck");
        StageStatus::Passed
    } else {
        warn!("fsck determined there was an error and could not fix it");
        StageStatus::Failed
    }
}

pub async fn generate_parity(bup: &Bup) -> StageStatus {
    let ok = bup.fsck(FsckMode::Parity).await;
    if !ok {
        warn!("could not generate par2 parity blocks");
    }
    StageStatus::from_success(ok)
}

/// Differences between a source tree and its restored copy.
///
/// Paths are relative to the tree roots. Only regular files and symlinks are
/// compared; directories, ownership and timestamps are not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDiff {
    pub source_files: u64,
    pub source_bytes: u64,
    pub only_in_source: Vec<PathBuf>,
    pub only_in_backup: Vec<PathBuf>,
    pub mismatched: Vec<PathBuf>,
}

impl TreeDiff {
    pub fn is_clean(&self) -> bool {
        self.only_in_source.is_empty()
            && self.only_in_backup.is_empty()
            && self.mismatched.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.is_clean() {
            format!(
                "{} files ({} bytes) identical",
                self.source_files, self.source_bytes
            )
        } else {
            format!(
                "{} files compared: {} missing from backup, {} only in backup, {} differ",
                self.source_files,
                self.only_in_source.len(),
                self.only_in_backup.len(),
                self.mismatched.len()
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    File { size: u64, hash: blake3::Hash },
    Symlink(PathBuf),
}

/// Walks `root` without crossing filesystems, like `bup index --one-file-system`.
/// `skip` receives each path relative to `root` and whether it is a directory.
fn scan_tree(
    root: &Path,
    skip: &dyn Fn(&Path, bool) -> bool,
) -> Result<BTreeMap<PathBuf, Entry>> {
    let mut entries = BTreeMap::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .same_file_system(true)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .map(|rel| {
                    rel.as_os_str().is_empty() || !skip(rel, entry.file_type().is_dir())
                })
                .unwrap_or(true)
        });

    for entry in walker {
        let entry = entry.map_err(|e| Error::Other(format!("walking {}: {}", root.display(), e)))?;
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => continue,
        };
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            entries.insert(rel, Entry::Symlink(target));
        } else if file_type.is_file() {
            let mut file = File::open(entry.path())?;
            let mut hasher = blake3::Hasher::new();
            let size = std::io::copy(&mut file, &mut hasher)?;
            entries.insert(
                rel,
                Entry::File {
                    size,
                    hash: hasher.finalize(),
                },
            );
        }
    }

    Ok(entries)
}

/// Compares the files under `source` with those under `restored`.
/// Excludes are matched against the absolute paths under `logical_roots`.
pub fn compare_trees(
    source: &Path,
    restored: &Path,
    excludes: &Excludes,
    logical_roots: &[&Path],
) -> Result<TreeDiff> {
    let skip = |rel: &Path, is_dir: bool| {
        logical_roots
            .iter()
            .any(|root| excludes.matches(&root.join(rel), is_dir))
    };
    let source_entries = scan_tree(source, &skip)?;
    let restored_entries = scan_tree(restored, &skip)?;

    let mut diff = TreeDiff::default();
    for (path, entry) in &source_entries {
        if let Entry::File { size, .. } = entry {
            diff.source_files += 1;
            diff.source_bytes += size;
        }
        match restored_entries.get(path) {
            None => diff.only_in_source.push(path.clone()),
            Some(other) if other != entry => diff.mismatched.push(path.clone()),
            Some(_) => {}
        }
    }
    diff.only_in_backup = restored_entries
        .keys()
        .filter(|path| !source_entries.contains_key(*path))
        .cloned()
        .collect();

    debug!("compared {} with {}: {}", source.display(), restored.display(), diff.summary());
    Ok(diff)
}

/// Restores the latest commit of `branch` into a scratch directory and
/// compares it byte for byte with `backup_path`.
pub async fn verify_restore(
    bup: &Bup,
    branch: &str,
    source: &Path,
    backup_path: &Path,
    excludes: &Excludes,
) -> Result<TreeDiff> {
    let scratch = tempfile::Builder::new()
        .prefix("bupcron-verify-")
        .tempdir()?;

    if !bup.restore(branch, scratch.path()).await {
        return Err(Error::Other(format!("bup restore of {} failed", branch)));
    }

    let source = source.to_path_buf();
    let backup_path = backup_path.to_path_buf();
    let excludes = excludes.clone();
    let restored = scratch.path().to_path_buf();
    let diff = tokio::task::spawn_blocking(move || {
        compare_trees(&backup_path, &restored, &excludes, &[&source, &backup_path])
    })
    .await
    .map_err(|e| Error::Other(format!("verification task failed: {}", e)))??;

    // scratch is removed here
    drop(scratch);
    Ok(diff)
}
