use crate::command::{CommandSpec, shell_line};
use crate::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A remote bup repository reached over ssh, written `HOST:PATH`
/// (e.g. `bup@example.com:repos/repo.bup`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub host: String,
    pub path: String,
}

impl FromStr for Remote {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((host, path)) if !host.is_empty() && !path.is_empty() => Ok(Self {
                host: host.to_string(),
                path: path.to_string(),
            }),
            _ => Err(Error::InvalidRemote(s.to_string())),
        }
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.path)
    }
}

/// Where the bup repository lives.
///
/// The local directory is always present: it is `BUP_DIR` for bup itself
/// and holds the index and pidfile even when saving to a remote.
/// Maintenance commands (fsck, du, git notes) run wherever the packs are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BupRepository {
    local: PathBuf,
    remote: Option<Remote>,
}

impl BupRepository {
    pub fn new<P: AsRef<Path>>(local: P, remote: Option<Remote>) -> Self {
        Self {
            local: local.as_ref().to_path_buf(),
            remote,
        }
    }

    pub fn local_path(&self) -> &Path {
        &self.local
    }

    pub fn remote(&self) -> Option<&Remote> {
        self.remote.as_ref()
    }

    pub fn exists_locally(&self) -> bool {
        self.local.exists()
    }

    /// Path of the repository on the host holding the packs.
    pub fn storage_path(&self) -> String {
        match &self.remote {
            Some(remote) => remote.path.clone(),
            None => self.local.to_string_lossy().into_owned(),
        }
    }

    pub fn pack_dir(&self) -> String {
        let base = self.storage_path();
        format!("{}/objects/pack", base.trim_end_matches('/'))
    }

    /// Builds a command running `program args` on the host holding the packs:
    /// directly for a local repository, through `ssh -T HOST` otherwise.
    pub fn command_on_storage(&self, program: &str, args: &[String]) -> CommandSpec {
        match &self.remote {
            Some(remote) => CommandSpec::new("ssh")
                .args(["-T", remote.host.as_str()])
                .arg(shell_line(std::iter::once(program).chain(args.iter().map(String::as_str)))),
            None => CommandSpec::new(program).args(args.iter().cloned()),
        }
    }

    pub fn describe(&self) -> String {
        match &self.remote {
            Some(remote) => format!("{} (remote {})", self.local.display(), remote),
            None => self.local.display().to_string(),
        }
    }
}
