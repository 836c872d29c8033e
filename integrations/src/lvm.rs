//! LVM snapshots: `lvcreate --snapshot`, mounted read-only for the backup.

use crate::mounts::{self, MountEntry};
use async_trait::async_trait;
use bupcron_core::command::{CommandRunner, CommandSpec};
use bupcron_core::snapshot::{SnapshotHandle, SnapshotKind, SnapshotProvider};
use bupcron_core::{Result, SnapshotMethod, SnapshotOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct LvmSnapshot {
    runner: Arc<dyn CommandRunner>,
    size: String,
    mount_pattern: String,
    verbosity: u8,
}

impl LvmSnapshot {
    pub fn new(runner: Arc<dyn CommandRunner>, options: &SnapshotOptions, verbosity: u8) -> Self {
        Self {
            runner,
            size: options.size.clone(),
            mount_pattern: options.mount_pattern.clone(),
            verbosity,
        }
    }

    fn with_verbosity(&self, cmd: CommandSpec) -> CommandSpec {
        match self.verbosity {
            0 => cmd.arg("--quiet"),
            v if v >= 3 => cmd.arg("--verbose"),
            _ => cmd,
        }
    }

    async fn find_mount(&self, path: &Path) -> Option<MountEntry> {
        let output = match self.runner.output(&CommandSpec::new("mount")).await {
            Ok(output) => output,
            Err(e) => {
                warn!("cannot list mounts: {}", e);
                return None;
            }
        };
        mounts::find_mount(path, &mounts::parse_mount_output(&output)).cloned()
    }

    /// Volume group and logical volume of `device`, `None` when it is not an LV.
    async fn find_vg_lv(&self, device: &str) -> Option<(String, String)> {
        let cmd = CommandSpec::new("lvs").args(["--noheadings", "-o", "vg_name,lv_name", device]);
        let output = self.runner.output(&cmd).await.ok()?;
        let mut fields = output.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(vg), Some(lv)) => Some((vg.to_string(), lv.to_string())),
            _ => None,
        }
    }

    /// Unmounts and drops whatever is left of a snapshot.
    async fn cleanup(&self, device: &Path, mountpoint: &Path) -> bool {
        let mut clean = true;

        if mounts::is_mountpoint(mountpoint) {
            debug!("umounting {}", mountpoint.display());
            let umount = CommandSpec::new("umount").arg(mountpoint.to_string_lossy());
            if !self.runner.check(&umount).await {
                warn!("failed to umount {}", mountpoint.display());
                clean = false;
            }
        }

        if mountpoint.is_dir() {
            debug!("removing directory {}", mountpoint.display());
            if let Err(e) = std::fs::remove_dir(mountpoint) {
                debug!("cannot remove {}: {}", mountpoint.display(), e);
            }
        }

        if mounts::is_block_device(device) {
            debug!("dropping snapshot {}", device.display());
            let lvremove = self.with_verbosity(
                CommandSpec::new("lvremove")
                    .arg("--force")
                    .arg(device.to_string_lossy()),
            );
            if !self.runner.check(&lvremove).await {
                warn!("failed to drop snapshot {}", device.display());
                clean = false;
            }
        }

        clean
    }

    async fn snapshot(&self, source: &Path) -> Option<SnapshotHandle> {
        let real = std::fs::canonicalize(source).unwrap_or_else(|_| source.to_path_buf());

        let Some(mount) = self.find_mount(&real).await else {
            warn!(
                "Could not find mountpoint for {}, skipping snapshotting",
                source.display()
            );
            return None;
        };
        let Some((vg, lv)) = self.find_vg_lv(&mount.device).await else {
            warn!(
                "{} is not a LVM mountpoint, skipping snapshotting",
                source.display()
            );
            return None;
        };

        let snapname = format!("snap{}", lv);
        let device = PathBuf::from(format!("/dev/{}/{}", vg, snapname));
        let mountpoint = mounts::expand_pattern(&self.mount_pattern, &vg, &lv);

        // leftovers from an interrupted run
        self.cleanup(&device, &mountpoint).await;

        debug!("creating snapshot {}", snapname);
        let lvcreate = self.with_verbosity(CommandSpec::new("lvcreate").args([
            "--size",
            self.size.as_str(),
            "--snapshot",
            "--permission",
            "r",
            "--name",
            snapname.as_str(),
            mount.device.as_str(),
        ]));
        if !self.runner.check(&lvcreate).await {
            warn!("failed to create snapshot {}/{}, skipping snapshotting", vg, lv);
            return None;
        }

        debug!("making sure mountpoint {} exists", mountpoint.display());
        if let Err(e) = std::fs::create_dir_all(&mountpoint) {
            warn!(
                "cannot create mountpoint {}: {}, skipping snapshotting",
                mountpoint.display(),
                e
            );
            self.cleanup(&device, &mountpoint).await;
            return None;
        }

        let mount_cmd = CommandSpec::new("mount").args([
            "-o".to_string(),
            "ro".to_string(),
            device.to_string_lossy().into_owned(),
            mountpoint.to_string_lossy().into_owned(),
        ]);
        if !self.runner.check(&mount_cmd).await {
            warn!(
                "failed to mount snapshot {} on {}, skipping snapshotting",
                snapname,
                mountpoint.display()
            );
            self.cleanup(&device, &mountpoint).await;
            return None;
        }

        let relative = real.strip_prefix(&mount.mountpoint).unwrap_or(Path::new(""));
        let backup_path = if relative.as_os_str().is_empty() {
            mountpoint.clone()
        } else {
            mountpoint.join(relative)
        };

        Some(SnapshotHandle::new(
            source,
            backup_path,
            SnapshotKind::Lvm {
                vg,
                lv,
                device,
                mountpoint,
            },
        ))
    }
}

#[async_trait]
impl SnapshotProvider for LvmSnapshot {
    fn method(&self) -> SnapshotMethod {
        SnapshotMethod::Lvm
    }

    async fn acquire(&self, source: &Path) -> Result<SnapshotHandle> {
        Ok(self
            .snapshot(source)
            .await
            .unwrap_or_else(|| SnapshotHandle::live(source)))
    }

    async fn release(&self, handle: SnapshotHandle) -> bool {
        match handle.finish() {
            SnapshotKind::Lvm {
                device, mountpoint, ..
            } => self.cleanup(&device, &mountpoint).await,
            _ => true,
        }
    }
}
