use crate::repository::Remote;
use crate::verify::TreeDiff;
use chrono::{DateTime, Local};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_SNAPSHOT_SIZE: &str = "1G";
pub const DEFAULT_MOUNT_PATTERN: &str = "/media/bup/{vg}-{lv}";
pub const PIDFILE_NAME: &str = ".bupcron.pid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMethod {
    #[default]
    None,
    Lvm,
    Vss,
}

impl FromStr for SnapshotMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "no" => Ok(Self::None),
            "lvm" => Ok(Self::Lvm),
            "vss" => Ok(Self::Vss),
            other => Err(format!(
                "unknown snapshot method '{}', expected one of: none, lvm, vss",
                other
            )),
        }
    }
}

impl fmt::Display for SnapshotMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Lvm => "lvm",
            Self::Vss => "vss",
        };
        f.write_str(name)
    }
}

/// Severity threshold for a log destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" | "critical" => Ok(Self::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exclusion rules handed to `bup index`.
#[derive(Debug, Clone, Default)]
pub struct Excludes {
    pub paths: Vec<String>,
    pub patterns: Vec<Regex>,
    pub from_files: Vec<PathBuf>,
    pub rx_from_files: Vec<PathBuf>,
}

impl Excludes {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
            && self.patterns.is_empty()
            && self.from_files.is_empty()
            && self.rx_from_files.is_empty()
    }

    /// Whether `path` is covered by an exclude path or matches an exclude pattern.
    /// Patterns see directories with a trailing `/`, as `bup index` does.
    pub fn matches(&self, path: &Path, is_dir: bool) -> bool {
        let mut text = path.to_string_lossy().into_owned();
        if is_dir && !text.ends_with('/') {
            text.push('/');
        }
        let by_path = self.paths.iter().any(|excluded| {
            let excluded = Path::new(excluded.trim_end_matches('/'));
            !excluded.as_os_str().is_empty() && path.starts_with(excluded)
        });
        by_path || self.patterns.iter().any(|rx| rx.is_match(&text))
    }

    /// Folds the contents of the `--exclude-from` and `--exclude-rx-from` files
    /// into plain paths and patterns, one entry per non-empty line.
    pub fn expanded(&self) -> crate::Result<Self> {
        let mut expanded = Self {
            paths: self.paths.clone(),
            patterns: self.patterns.clone(),
            from_files: Vec::new(),
            rx_from_files: Vec::new(),
        };

        for file in &self.from_files {
            let content = std::fs::read_to_string(file)?;
            expanded.paths.extend(
                content
                    .lines()
                    .filter(|line| !line.trim().is_empty())
                    .map(str::to_string),
            );
        }

        for file in &self.rx_from_files {
            let content = std::fs::read_to_string(file)?;
            for line in content.lines().filter(|line| !line.trim().is_empty()) {
                expanded.patterns.push(compile_pattern(line)?);
            }
        }

        Ok(expanded)
    }
}

pub fn compile_pattern(pattern: &str) -> crate::Result<Regex> {
    Regex::new(pattern).map_err(|e| crate::Error::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotOptions {
    pub method: SnapshotMethod,
    /// Size of the LVM snapshot volume, as understood by `lvcreate --size`.
    pub size: String,
    /// Where the snapshot gets mounted; `{vg}` and `{lv}` are substituted.
    pub mount_pattern: String,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            method: SnapshotMethod::None,
            size: DEFAULT_SNAPSHOT_SIZE.to_string(),
            mount_pattern: DEFAULT_MOUNT_PATTERN.to_string(),
        }
    }
}

/// Extra jobs run around `bup save`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tasks {
    pub clear: bool,
    pub check: bool,
    pub repair: bool,
    pub parity: bool,
    pub verify: bool,
    pub stats: bool,
}

/// A fully resolved backup job. Built once per run from configuration.
#[derive(Debug, Clone)]
pub struct Job {
    /// Base of the generated branch names, defaults to the hostname.
    pub name: String,
    /// Full branch name, overrides the generated one.
    pub branch_name: Option<String>,
    pub paths: Vec<PathBuf>,
    pub repository: PathBuf,
    pub remote: Option<Remote>,
    pub excludes: Excludes,
    pub snapshot: SnapshotOptions,
    pub tasks: Tasks,
    pub verbosity: u8,
    pub pidfile: PathBuf,
}

impl Job {
    /// Branch used for the given source path: `<name>-<path with / replaced by _>`.
    pub fn branch_for(&self, source: &Path) -> String {
        match &self.branch_name {
            Some(branch) => branch.clone(),
            None => format!(
                "{}-{}",
                self.name,
                source.to_string_lossy().replace('/', "_")
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub verbosity: u8,
    pub debug: bool,
    pub logfile: Option<PathBuf>,
    pub syslog: Option<LogLevel>,
}

/// Everything a run needs: the job plus how to report on it.
#[derive(Debug, Clone)]
pub struct Settings {
    pub job: Job,
    pub logging: LogSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Skipped,
    Passed,
    Failed,
}

impl StageStatus {
    pub fn from_success(ok: bool) -> Self {
        if ok { Self::Passed } else { Self::Failed }
    }

    pub fn failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Skipped => "skipped",
            Self::Passed => "passed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What happened to one source path during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchOutcome {
    pub source: PathBuf,
    pub backup_path: PathBuf,
    pub branch: String,
    pub snapshot: StageStatus,
    pub release: StageStatus,
    pub index: StageStatus,
    pub save: StageStatus,
    pub check: StageStatus,
    pub parity: StageStatus,
    pub verify: StageStatus,
    pub stats: StageStatus,
    pub files: Option<u64>,
    pub bytes: Option<u64>,
    pub diff: Option<TreeDiff>,
    pub duration_secs: f64,
}

impl BranchOutcome {
    pub fn new(source: &Path, branch: String) -> Self {
        Self {
            source: source.to_path_buf(),
            backup_path: source.to_path_buf(),
            branch,
            snapshot: StageStatus::Skipped,
            release: StageStatus::Skipped,
            index: StageStatus::Skipped,
            save: StageStatus::Skipped,
            check: StageStatus::Skipped,
            parity: StageStatus::Skipped,
            verify: StageStatus::Skipped,
            stats: StageStatus::Skipped,
            files: None,
            bytes: None,
            diff: None,
            duration_secs: 0.0,
        }
    }

    /// Parity generation is best effort and never fails a branch.
    pub fn succeeded(&self) -> bool {
        self.index == StageStatus::Passed
            && self.save == StageStatus::Passed
            && !self.snapshot.failed()
            && !self.release.failed()
            && !self.check.failed()
            && !self.verify.failed()
            && !self.stats.failed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

/// Summary of a whole run, one entry per source path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    pub started: DateTime<Local>,
    pub duration_secs: f64,
    pub initialized: bool,
    pub cleared: bool,
    pub branches: Vec<BranchOutcome>,
    pub repository_size_before: Option<u64>,
    pub repository_size_after: Option<u64>,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::Success => 0,
            RunStatus::Failed => 1,
        }
    }

    pub fn failed_branches(&self) -> impl Iterator<Item = &BranchOutcome> {
        self.branches.iter().filter(|b| !b.succeeded())
    }

    /// Writes the result as pretty-printed JSON.
    pub fn write_report(&self, path: &Path) -> crate::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
