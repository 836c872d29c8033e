//! Volume Shadow Copy snapshots under Cygwin, driven through `vshadow`.
//!
//! Paths are converted between Cygwin and Windows forms with `cygpath`.

use crate::mounts;
use async_trait::async_trait;
use bupcron_core::command::{CommandRunner, CommandSpec};
use bupcron_core::snapshot::{SnapshotHandle, SnapshotKind, SnapshotProvider};
use bupcron_core::{Error, Result, SnapshotMethod, SnapshotOptions};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Extracts the id from `* SNAPSHOT ID = {5a698842-f325-404a-83e7-6a7fa08760a1}`.
pub fn parse_shadow_id(output: &str) -> Option<String> {
    let rx = Regex::new(r"\* SNAPSHOT ID = (\{[0-9A-Fa-f-]{36}\})").ok()?;
    rx.captures(output).map(|caps| caps[1].to_string())
}

pub struct VssSnapshot {
    runner: Arc<dyn CommandRunner>,
    mount_pattern: String,
}

impl VssSnapshot {
    pub fn new(runner: Arc<dyn CommandRunner>, options: &SnapshotOptions) -> Self {
        Self {
            runner,
            mount_pattern: options.mount_pattern.clone(),
        }
    }

    async fn cygpath(&self, flag: &str, path: &str) -> Result<String> {
        let cmd = CommandSpec::new("cygpath").args([flag, path]);
        Ok(self.runner.output(&cmd).await?.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn to_windows(&self, path: &Path) -> Result<String> {
        self.cygpath("-aw", &path.to_string_lossy()).await
    }

    /// Errors when a shadow copy is still exposed on `mountpoint`. The only way
    /// to unmount one is to delete it, which is left to the operator.
    async fn fail_if_mounted(&self, mountpoint: &Path) -> Result<()> {
        let output = self.runner.output(&CommandSpec::new("vshadow").arg("-q")).await?;
        let winmount = self.to_windows(mountpoint).await?;
        let rx = Regex::new(&format!(
            r"(?im)^   - Exposed locally as: {}",
            regex::escape(&winmount)
        ))
        .map_err(|e| Error::Snapshot(e.to_string()))?;
        if rx.is_match(&output) {
            return Err(Error::AlreadyMounted(winmount));
        }
        Ok(())
    }

    async fn remove_mountpoint(&self, mountpoint: &Path) -> Result<()> {
        if mountpoint.exists() {
            self.fail_if_mounted(mountpoint).await?;
            debug!("removing directory {}", mountpoint.display());
            std::fs::remove_dir(mountpoint)?;
        }
        Ok(())
    }

    async fn drop_shadow(&self, shadow_id: &str) -> bool {
        let cmd = CommandSpec::new("vshadow").arg(format!("-ds={}", shadow_id));
        let dropped = self.runner.check(&cmd).await;
        if !dropped {
            warn!("failed to drop snapshot {}", shadow_id);
        }
        dropped
    }

    async fn create(&self, device: &str) -> Option<String> {
        debug!("creating snapshot on {}", device);
        let cmd = CommandSpec::new("vshadow").args(["-p", device]);
        match self.runner.output(&cmd).await {
            Ok(output) => {
                let id = parse_shadow_id(&output);
                if id.is_none() {
                    warn!("vss snapshot failed, no snapshot id in vshadow output");
                }
                id
            }
            Err(e) => {
                warn!("vss snapshot failed: {}", e);
                None
            }
        }
    }

    /// Exposes a created shadow copy on `mountpoint`. On error the caller
    /// still owns the shadow copy.
    async fn expose(&self, shadow_id: &str, mountpoint: &Path) -> Result<()> {
        debug!("making sure mountpoint {} exists", mountpoint.display());
        std::fs::create_dir_all(mountpoint)?;
        let mut winmount = self.to_windows(mountpoint).await?;
        // a drive letter is exposed as `X:`, not `X:\`
        if winmount.len() == 3 {
            winmount.pop();
        }

        let expose = CommandSpec::new("vshadow").arg(format!("-el={},{}", shadow_id, winmount));
        if !self.runner.check(&expose).await {
            return Err(Error::Snapshot(format!("vshadow could not expose {}", shadow_id)));
        }
        Ok(())
    }

    async fn snapshot(&self, source: &Path) -> Result<Option<SnapshotHandle>> {
        let winpath = self.to_windows(source).await?;
        let device: String = winpath.chars().take(2).collect();
        let fs_root = PathBuf::from(self.cygpath("-a", &device).await?.trim_end_matches('/'));
        let drive = device.trim_end_matches(':').to_ascii_lowercase();
        let mountpoint = mounts::expand_pattern(&self.mount_pattern, "vss", &drive);

        // a leftover exposure point must be dropped by hand
        self.remove_mountpoint(&mountpoint).await?;

        let Some(shadow_id) = self.create(&device).await else {
            warn!(
                "failed to create snapshot for {}, skipping snapshotting",
                source.display()
            );
            return Ok(None);
        };
        debug!("shadow copy created: {}", shadow_id);

        if let Err(e) = self.expose(&shadow_id, &mountpoint).await {
            warn!(
                "failed to mount snapshot {} on {}, skipping snapshotting: {}",
                shadow_id,
                mountpoint.display(),
                e
            );
            self.drop_shadow(&shadow_id).await;
            let _ = std::fs::remove_dir(&mountpoint);
            return Ok(None);
        }

        let backup_path = match source.strip_prefix(&fs_root) {
            Ok(relative) if !relative.as_os_str().is_empty() => mountpoint.join(relative),
            _ => mountpoint.clone(),
        };
        Ok(Some(SnapshotHandle::new(
            source,
            backup_path,
            SnapshotKind::Vss {
                shadow_id,
                mountpoint,
            },
        )))
    }
}

#[async_trait]
impl SnapshotProvider for VssSnapshot {
    fn method(&self) -> SnapshotMethod {
        SnapshotMethod::Vss
    }

    async fn acquire(&self, source: &Path) -> Result<SnapshotHandle> {
        if self.mount_pattern.contains(' ') {
            return Err(Error::Snapshot(format!(
                "mount point '{}' cannot contain a space",
                self.mount_pattern
            )));
        }
        Ok(self
            .snapshot(source)
            .await?
            .unwrap_or_else(|| SnapshotHandle::live(source)))
    }

    async fn release(&self, handle: SnapshotHandle) -> bool {
        match handle.finish() {
            SnapshotKind::Vss {
                shadow_id,
                mountpoint,
            } => {
                let dropped = self.drop_shadow(&shadow_id).await;
                match self.remove_mountpoint(&mountpoint).await {
                    Ok(()) => dropped,
                    Err(e) => {
                        warn!("{}", e);
                        false
                    }
                }
            }
            _ => true,
        }
    }
}
