//! Thin wrappers around the bup subcommands a run needs.

use crate::command::{CommandRunner, CommandSpec};
use crate::repository::BupRepository;
use crate::types::Excludes;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsckMode {
    /// `fsck --quick`
    Check,
    /// `fsck --repair`
    Repair,
    /// `fsck --generate`, after making sure par2 works
    Parity,
}

pub struct Bup {
    runner: Arc<dyn CommandRunner>,
    repo: BupRepository,
    verbosity: u8,
}

impl Bup {
    pub fn new(runner: Arc<dyn CommandRunner>, repo: BupRepository, verbosity: u8) -> Self {
        Self {
            runner,
            repo,
            verbosity,
        }
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn repository(&self) -> &BupRepository {
        &self.repo
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }

    fn command(&self, subcommand: &str) -> CommandSpec {
        CommandSpec::new("bup")
            .arg(subcommand)
            .env("BUP_DIR", self.repo.local_path().to_string_lossy())
    }

    pub fn init_command(&self) -> CommandSpec {
        let mut cmd = self.command("init");
        if let Some(remote) = self.repo.remote() {
            cmd = cmd.args(["-r".to_string(), remote.to_string()]);
        }
        cmd
    }

    pub async fn init(&self) -> bool {
        info!("initializing bup's dir {}", self.repo.describe());
        self.runner.check(&self.init_command()).await
    }

    pub async fn clear_index(&self) -> bool {
        info!("clearing the index");
        self.runner.check(&self.command("index").arg("--clear")).await
    }

    pub fn index_command(&self, path: &Path, excludes: &Excludes) -> CommandSpec {
        let mut cmd = self.command("index");
        if self.verbosity >= 3 {
            cmd = cmd.arg("--verbose");
        }
        cmd = cmd
            .args(excludes.paths.iter().map(|p| format!("--exclude={}", p)))
            .args(
                excludes
                    .patterns
                    .iter()
                    .map(|rx| format!("--exclude-rx={}", rx.as_str())),
            )
            .args(
                excludes
                    .from_files
                    .iter()
                    .map(|f| format!("--exclude-from={}", f.display())),
            )
            .args(
                excludes
                    .rx_from_files
                    .iter()
                    .map(|f| format!("--exclude-rx-from={}", f.display())),
            );
        cmd.arg("--one-file-system")
            .arg(path.to_string_lossy())
    }

    pub async fn index(&self, path: &Path, excludes: &Excludes) -> bool {
        info!("indexing {}", path.display());
        self.runner.check(&self.index_command(path, excludes)).await
    }

    /// `graft` is passed as `--graft` when it contains `=`, as `--strip-path` otherwise.
    pub fn save_command(&self, paths: &[&Path], branch: &str, graft: &str) -> CommandSpec {
        let mut cmd = self.command("save");
        if self.verbosity == 0 {
            cmd = cmd.arg("--quiet");
        } else if self.verbosity >= 3 {
            cmd = cmd.arg("--verbose");
        }
        if let Some(remote) = self.repo.remote() {
            cmd = cmd.args(["-r".to_string(), remote.to_string()]);
        }
        cmd = cmd.args(["--name", branch]);
        cmd = if graft.contains('=') {
            cmd.args(["--graft", graft])
        } else {
            cmd.args(["--strip-path", graft])
        };
        // tree and commit ids only help when someone reads the output
        if self.verbosity >= 2 {
            cmd = cmd.args(["--tree", "--commit"]);
        }
        cmd.args(paths.iter().map(|p| p.to_string_lossy().into_owned()))
    }

    pub async fn save(&self, paths: &[&Path], branch: &str, graft: &str) -> bool {
        let shown: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        info!("saving {} as {}", shown.join(" "), branch);
        self.runner
            .check(&self.save_command(paths, branch, graft))
            .await
    }

    pub fn fsck_command(&self, flag: &str) -> CommandSpec {
        let mut args = Vec::new();
        if self.repo.remote().is_some() {
            args.push("-d".to_string());
            args.push(self.repo.storage_path());
        }
        args.push("fsck".to_string());
        if self.verbosity >= 3 {
            args.push("--verbose".to_string());
        }
        args.push(flag.to_string());
        self.repo
            .command_on_storage("bup", &args)
            .env("BUP_DIR", self.repo.local_path().to_string_lossy())
    }

    pub async fn fsck(&self, mode: FsckMode) -> bool {
        match mode {
            FsckMode::Check => {
                info!("verifying bup repository");
                self.runner.check(&self.fsck_command("--quick")).await
            }
            FsckMode::Repair => {
                info!("repairing repository");
                self.runner.check(&self.fsck_command("--repair")).await
            }
            FsckMode::Parity => {
                if !self.runner.check(&self.fsck_command("--par2-ok")).await {
                    warn!("bup reports par2(1) as not working, no recovery blocks written");
                    return false;
                }
                info!("generating par2(1) recovery blocks");
                self.runner.check(&self.fsck_command("--generate")).await
            }
        }
    }

    /// Restores the latest commit of `branch` into `target`.
    pub fn restore_command(&self, branch: &str, target: &Path) -> CommandSpec {
        let mut cmd = self.command("restore");
        if let Some(remote) = self.repo.remote() {
            cmd = cmd.args(["-r".to_string(), remote.to_string()]);
        }
        if self.verbosity == 0 {
            cmd = cmd.arg("--quiet");
        }
        cmd.args(["-C".to_string(), target.to_string_lossy().into_owned()])
            .arg(format!("/{}/latest/.", branch))
    }

    pub async fn restore(&self, branch: &str, target: &Path) -> bool {
        info!("restoring {} into {}", branch, target.display());
        self.runner
            .check(&self.restore_command(branch, target))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ScriptedRunner;
    use crate::types::compile_pattern;
    use std::path::PathBuf;

    fn bup(runner: Arc<ScriptedRunner>, remote: Option<&str>, verbosity: u8) -> Bup {
        let repo = BupRepository::new("/srv/bup", remote.map(|r| r.parse().unwrap()));
        Bup::new(runner, repo, verbosity)
    }

    #[test]
    fn test_index_command_passes_every_exclude_kind() {
        let bup = bup(Arc::new(ScriptedRunner::new()), None, 0);
        let excludes = Excludes {
            paths: vec!["/home/user/.cache".to_string()],
            patterns: vec![compile_pattern(r"/\.git/").unwrap()],
            from_files: vec![PathBuf::from("/etc/bup/excludes")],
            rx_from_files: vec![PathBuf::from("/etc/bup/excludes-rx")],
        };

        let cmd = bup.index_command(Path::new("/home"), &excludes);
        assert_eq!(
            cmd.args,
            vec![
                "index",
                "--exclude=/home/user/.cache",
                r"--exclude-rx=/\.git/",
                "--exclude-from=/etc/bup/excludes",
                "--exclude-rx-from=/etc/bup/excludes-rx",
                "--one-file-system",
                "/home",
            ]
        );
        assert!(cmd.env.contains(&("BUP_DIR".to_string(), "/srv/bup".to_string())));
    }

    #[test]
    fn test_save_command_quiet_by_default() {
        let bup = bup(Arc::new(ScriptedRunner::new()), None, 0);
        let cmd = bup.save_command(&[Path::new("/home")], "host-_home", "/home");
        assert_eq!(
            cmd.to_string(),
            "bup save --quiet --name host-_home --strip-path /home /home"
        );
    }

    #[test]
    fn test_save_command_remote_graft_and_verbose() {
        let bup = bup(Arc::new(ScriptedRunner::new()), Some("bup@nas:repo.bup"), 3);
        let cmd = bup.save_command(
            &[Path::new("/media/bup/vg0-home/user")],
            "host-_home_user",
            "/media/bup/vg0-home=/home",
        );
        assert_eq!(
            cmd.to_string(),
            "bup save --verbose -r bup@nas:repo.bup --name host-_home_user \
             --graft /media/bup/vg0-home=/home --tree --commit /media/bup/vg0-home/user"
        );
    }

    #[test]
    fn test_remote_fsck_runs_over_ssh() {
        let bup = bup(Arc::new(ScriptedRunner::new()), Some("bup@nas:repo.bup"), 0);
        let cmd = bup.fsck_command("--quick");
        assert_eq!(cmd.program, "ssh");
        assert_eq!(cmd.args, vec!["-T", "bup@nas", "bup -d repo.bup fsck --quick"]);
    }

    #[tokio::test]
    async fn test_parity_requires_working_par2() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("bup fsck --par2-ok", 1);
        let bup = bup(runner.clone(), None, 0);

        assert!(!bup.fsck(FsckMode::Parity).await);
        assert_eq!(runner.count("bup fsck --generate"), 0);
    }

    #[tokio::test]
    async fn test_parity_generates_recovery_blocks() {
        let runner = Arc::new(ScriptedRunner::new());
        let bup = bup(runner.clone(), None, 0);

        assert!(bup.fsck(FsckMode::Parity).await);
        assert_eq!(
            runner.commands(),
            vec!["bup fsck --par2-ok", "bup fsck --generate"]
        );
    }

    #[test]
    fn test_restore_command_targets_latest_commit() {
        let bup = bup(Arc::new(ScriptedRunner::new()), None, 1);
        let cmd = bup.restore_command("host-_home", Path::new("/tmp/verify"));
        assert_eq!(
            cmd.to_string(),
            "bup restore -C /tmp/verify /host-_home/latest/."
        );
    }
}
