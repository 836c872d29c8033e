//! Repository statistics, recorded as git notes on the saved branches.

use crate::command::{CommandRunner, CommandSpec};
use crate::repository::BupRepository;
use crate::types::BranchOutcome;
use crate::{Error, Result};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info};

const DU_EXCLUDES: [&str; 3] = ["--exclude=*.midx", "--exclude=*.bloom", "--exclude=*.par2"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versions {
    pub bup: String,
    pub git: String,
}

impl Versions {
    /// Parses the output of `bup --version; git --version`.
    fn parse(output: &str) -> Result<Self> {
        let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
        let bup = lines.next().unwrap_or_default().to_string();
        let git = lines
            .next()
            .and_then(|line| line.strip_prefix("git version "))
            .ok_or_else(|| Error::UnexpectedOutput {
                program: "git".to_string(),
                message: format!("no git version in {:?}", output),
            })?
            .to_string();
        Ok(Self { bup, git })
    }
}

pub fn parse_du(output: &str) -> Result<u64> {
    output
        .split_whitespace()
        .next()
        .and_then(|size| size.parse().ok())
        .ok_or_else(|| Error::UnexpectedOutput {
            program: "du".to_string(),
            message: format!("cannot read a size from {:?}", output.trim()),
        })
}

/// Formats a byte count with binary prefixes, e.g. `1.5KiB`.
pub fn format_bytes(bytes: i64) -> String {
    let mut num = bytes as f64;
    for unit in ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"] {
        if num.abs() < 1024.0 {
            return format!("{:.1}{}B", num, unit);
        }
        num /= 1024.0;
    }
    format!("{:.1}YiB", num)
}

/// Tracks repository size across a run and versions of the tools involved.
pub struct StatsRecorder {
    runner: Arc<dyn CommandRunner>,
    repo: BupRepository,
    sizes: Vec<u64>,
    local: Versions,
    remote: Option<Versions>,
}

impl StatsRecorder {
    /// Reads tool versions and takes the initial size measurement.
    pub async fn collect(runner: Arc<dyn CommandRunner>, repo: BupRepository) -> Result<Self> {
        let bup = runner.output(&CommandSpec::new("bup").arg("--version")).await?;
        let git = runner.output(&CommandSpec::new("git").arg("--version")).await?;
        let local = Versions::parse(&format!("{}\n{}", bup.trim(), git.trim()))?;

        let remote = match repo.remote() {
            Some(remote) => {
                let cmd = CommandSpec::new("ssh").args([
                    "-T",
                    remote.host.as_str(),
                    "bup --version ; git --version",
                ]);
                Some(Versions::parse(&runner.output(&cmd).await?)?)
            }
            None => None,
        };

        let mut recorder = Self {
            runner,
            repo,
            sizes: Vec::new(),
            local,
            remote,
        };
        let size = recorder.disk_usage().await?;
        recorder.sizes.push(size);
        Ok(recorder)
    }

    pub fn du_command(&self) -> CommandSpec {
        let mut args: Vec<String> = vec!["-bs".to_string()];
        args.extend(DU_EXCLUDES.iter().map(|s| s.to_string()));
        args.push(self.repo.pack_dir());
        self.repo.command_on_storage("du", &args)
    }

    pub async fn disk_usage(&self) -> Result<u64> {
        let output = self.runner.output(&self.du_command()).await?;
        parse_du(&output)
    }

    pub fn note_command(&self, branch: &str, body: String) -> CommandSpec {
        let args = [
            "--git-dir".to_string(),
            self.repo.storage_path(),
            "notes".to_string(),
            "add".to_string(),
            "-F".to_string(),
            "-".to_string(),
            branch.to_string(),
        ];
        self.repo.command_on_storage("git", &args).stdin(body)
    }

    /// Measures the repository again and attaches a note describing the
    /// branch to its latest commit.
    pub async fn record(&mut self, outcome: &BranchOutcome) -> Result<()> {
        let size = self.disk_usage().await?;
        self.sizes.push(size);

        let cmd = self.note_command(&outcome.branch, self.note(outcome));
        debug!("saving note on {}", outcome.branch);
        let output = self.runner.run(&cmd).await?;
        if !output.success() {
            return Err(Error::UnexpectedOutput {
                program: "git".to_string(),
                message: format!(
                    "failed to save bup note: `{}{}` ({:?})",
                    output.stdout.trim(),
                    output.stderr.trim(),
                    output.code
                ),
            });
        }
        info!("{}", self.last_diff());
        Ok(())
    }

    pub fn first_size(&self) -> Option<u64> {
        self.sizes.first().copied()
    }

    pub fn last_size(&self) -> Option<u64> {
        self.sizes.last().copied()
    }

    fn last_pair(&self) -> (u64, u64) {
        let after = self.last_size().unwrap_or_default();
        let before = match self.sizes.len() {
            0 | 1 => after,
            n => self.sizes[n - 2],
        };
        (before, after)
    }

    pub fn note(&self, outcome: &BranchOutcome) -> String {
        let (before, after) = self.last_pair();
        let diff = after as i64 - before as i64;
        let mut note = String::new();

        let _ = writeln!(note, "Repository size\n");
        let _ = writeln!(note, "* Before: {} ({} bytes)", format_bytes(before as i64), before);
        let _ = writeln!(note, "* After: {} ({} bytes)", format_bytes(after as i64), after);
        let _ = writeln!(note, "* Diff: {} ({} bytes)", format_bytes(diff), diff);

        let _ = writeln!(note, "\nLocal versions\n");
        write_versions(&mut note, &self.local);
        if let Some(remote) = &self.remote {
            let _ = writeln!(note, "\nRemote versions\n");
            write_versions(&mut note, remote);
        }

        let _ = writeln!(note, "\nBackup of {}\n", outcome.source.display());
        let _ = writeln!(note, "* Duration: {:.1}s", outcome.duration_secs);
        if let Some(files) = outcome.files {
            let _ = writeln!(note, "* Files: {}", files);
        }
        if let Some(bytes) = outcome.bytes {
            let _ = writeln!(note, "* Bytes: {} ({} bytes)", format_bytes(bytes as i64), bytes);
        }
        if let Some(diff) = &outcome.diff {
            let _ = writeln!(note, "* Verification: {}", diff.summary());
        }
        note
    }

    pub fn last_diff(&self) -> String {
        let (before, after) = self.last_pair();
        format!(
            "repository size change: {}",
            format_bytes(after as i64 - before as i64)
        )
    }

    pub fn summary(&self) -> String {
        let before = self.first_size().unwrap_or_default();
        let after = self.last_size().unwrap_or_default();
        let diff = after as i64 - before as i64;
        let mut summary = format!(
            "total repository size (before/after/diff): {}/{}/{} ({}/{}/{}), versions (bup/git): {}/{}",
            format_bytes(before as i64),
            format_bytes(after as i64),
            format_bytes(diff),
            before,
            after,
            diff,
            self.local.bup,
            self.local.git
        );
        if let Some(remote) = &self.remote {
            let _ = write!(summary, ", remote versions (bup/git): {}/{}", remote.bup, remote.git);
        }
        summary
    }
}

fn write_versions(out: &mut String, versions: &Versions) {
    let _ = writeln!(out, "* bupcron: {}", env!("CARGO_PKG_VERSION"));
    let _ = writeln!(out, "*     bup: {}", versions.bup);
    let _ = writeln!(out, "*     git: {}", versions.git);
}
