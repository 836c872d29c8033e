use crate::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Pidfile guarding against two runs on the same repository.
///
/// The file is removed when the lock is dropped.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        // one retry after clearing a stale pidfile
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(file) => return Self::claim(path, file),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let content = match fs::read_to_string(path) {
                        Ok(content) => content,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    };
                    let pid = content.trim();
                    if pid.parse::<u32>().map(process_alive).unwrap_or(false) {
                        return Err(Error::AlreadyRunning {
                            path: path.to_path_buf(),
                            pid: pid.to_string(),
                        });
                    }
                    warn!("removing stale pidfile {} (pid '{}')", path.display(), pid);
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                            return Err(Error::AlreadyRunning {
                                path: path.to_path_buf(),
                                pid: pid.to_string(),
                            });
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Other(format!(
            "could not take the lock at {}",
            path.display()
        )))
    }

    /// Writes our pid into the freshly created `file`. The guard exists
    /// before the write, so a failed write still removes the file.
    fn claim(path: &Path, mut file: impl Write) -> Result<Self> {
        let lock = Self {
            path: path.to_path_buf(),
        };
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        debug!("wrote pidfile {}", path.display());
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("failed to remove pidfile {}: {}", self.path.display(), e);
        }
    }
}

fn process_alive(pid: u32) -> bool {
    if Path::new("/proc/self").exists() {
        return Path::new("/proc").join(pid.to_string()).exists();
    }
    // no procfs: kill -0 reports "not permitted" for live processes of other users
    match Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
    {
        Ok(output) => {
            output.status.success()
                || String::from_utf8_lossy(&output.stderr).contains("not permitted")
        }
        Err(_) => false,
    }
}
