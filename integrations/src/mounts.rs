//! Mount table lookups shared by the snapshot providers.

use regex::Regex;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static MOUNT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+) on (.+) type (\S+)").expect("mount line regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
}

/// Parses the output of `mount(8)`: `DEVICE on MOUNTPOINT type FSTYPE (OPTIONS)`.
pub fn parse_mount_output(output: &str) -> Vec<MountEntry> {
    output
        .lines()
        .filter_map(|line| MOUNT_LINE.captures(line))
        .map(|caps| MountEntry {
            device: caps[1].to_string(),
            mountpoint: PathBuf::from(&caps[2]),
            fstype: caps[3].to_string(),
        })
        .collect()
}

/// The mount holding `path`: the entry with the longest mountpoint that is
/// an ancestor of `path`. Later entries win on ties, as the kernel stacks them.
pub fn find_mount<'a>(path: &Path, mounts: &'a [MountEntry]) -> Option<&'a MountEntry> {
    mounts
        .iter()
        .filter(|entry| path.starts_with(&entry.mountpoint))
        .max_by_key(|entry| entry.mountpoint.components().count())
}

/// Whether `path` is the root of a mounted filesystem.
pub fn is_mountpoint(path: &Path) -> bool {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return false;
    };
    if meta.file_type().is_symlink() {
        return false;
    }
    match fs::metadata(path.join("..")) {
        Ok(parent) => meta.dev() != parent.dev() || meta.ino() == parent.ino(),
        Err(_) => false,
    }
}

pub fn is_block_device(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.file_type().is_block_device())
        .unwrap_or(false)
}

/// Substitutes `{vg}` and `{lv}` in a mount pattern. Patterns written with
/// two `%s` get them replaced in order instead.
pub fn expand_pattern(pattern: &str, vg: &str, lv: &str) -> PathBuf {
    if pattern.contains("{vg}") || pattern.contains("{lv}") {
        PathBuf::from(pattern.replace("{vg}", vg).replace("{lv}", lv))
    } else {
        PathBuf::from(pattern.replacen("%s", vg, 1).replacen("%s", lv, 1))
    }
}
