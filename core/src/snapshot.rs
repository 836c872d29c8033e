//! Filesystem snapshots taken around the backup of one path.

use crate::Result;
use crate::types::SnapshotMethod;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::error;

/// What was created to back up a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Nothing was created, the live filesystem is read.
    Live,
    Lvm {
        vg: String,
        lv: String,
        /// `/dev/<vg>/snap<lv>`
        device: PathBuf,
        mountpoint: PathBuf,
    },
    Vss {
        shadow_id: String,
        mountpoint: PathBuf,
    },
}

impl SnapshotKind {
    pub fn describe(&self) -> String {
        match self {
            Self::Live => "live filesystem".to_string(),
            Self::Lvm { device, mountpoint, .. } => {
                format!("{} mounted on {}", device.display(), mountpoint.display())
            }
            Self::Vss {
                shadow_id,
                mountpoint,
            } => format!("shadow copy {} exposed on {}", shadow_id, mountpoint.display()),
        }
    }
}

/// A snapshot in use for one source path.
///
/// Handed back to [`SnapshotProvider::release`] once the path is backed up,
/// which consumes it.
#[must_use = "a snapshot handle must be released"]
#[derive(Debug)]
pub struct SnapshotHandle {
    source: PathBuf,
    backup_path: PathBuf,
    kind: Option<SnapshotKind>,
}

impl SnapshotHandle {
    pub fn live(source: &Path) -> Self {
        Self::new(source, source.to_path_buf(), SnapshotKind::Live)
    }

    pub fn new(source: &Path, backup_path: PathBuf, kind: SnapshotKind) -> Self {
        Self {
            source: source.to_path_buf(),
            backup_path,
            kind: Some(kind),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Where bup should read the data from.
    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn is_live(&self) -> bool {
        matches!(self.kind, Some(SnapshotKind::Live) | None)
    }

    pub fn kind(&self) -> &SnapshotKind {
        self.kind.as_ref().unwrap_or(&SnapshotKind::Live)
    }

    /// Disarms the handle for release.
    pub fn finish(mut self) -> SnapshotKind {
        self.kind.take().unwrap_or(SnapshotKind::Live)
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        match &self.kind {
            Some(SnapshotKind::Live) | None => {}
            Some(kind) => error!(
                "snapshot of {} was never released: {}",
                self.source.display(),
                kind.describe()
            ),
        }
    }
}

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    fn method(&self) -> SnapshotMethod;

    /// Takes a snapshot of the filesystem holding `source`.
    ///
    /// Providers fall back to a live handle, with a warning, when the path
    /// cannot be snapshotted. An error means the run cannot go on.
    async fn acquire(&self, source: &Path) -> Result<SnapshotHandle>;

    /// Undoes everything `acquire` did. Returns false when something was
    /// left behind.
    async fn release(&self, handle: SnapshotHandle) -> bool;
}

/// Backs up the live filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshot;

#[async_trait]
impl SnapshotProvider for NoSnapshot {
    fn method(&self) -> SnapshotMethod {
        SnapshotMethod::None
    }

    async fn acquire(&self, source: &Path) -> Result<SnapshotHandle> {
        Ok(SnapshotHandle::live(source))
    }

    async fn release(&self, handle: SnapshotHandle) -> bool {
        handle.finish();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_snapshot_reads_live_path() {
        let provider = NoSnapshot;
        let handle = provider.acquire(Path::new("/home")).await.unwrap();
        assert!(handle.is_live());
        assert_eq!(handle.backup_path(), Path::new("/home"));
        assert!(provider.release(handle).await);
    }

    #[test]
    fn test_finish_returns_kind() {
        let kind = SnapshotKind::Lvm {
            vg: "vg0".to_string(),
            lv: "home".to_string(),
            device: PathBuf::from("/dev/vg0/snaphome"),
            mountpoint: PathBuf::from("/media/bup/vg0-home"),
        };
        let handle = SnapshotHandle::new(
            Path::new("/home/user"),
            PathBuf::from("/media/bup/vg0-home/user"),
            kind.clone(),
        );
        assert!(!handle.is_live());
        assert_eq!(handle.finish(), kind);
    }
}
