//! One backup run: repository setup, then each source path in turn.

use crate::bup::Bup;
use crate::command::CommandRunner;
use crate::lock::PidLock;
use crate::repository::BupRepository;
use crate::snapshot::{SnapshotHandle, SnapshotProvider};
use crate::stats::StatsRecorder;
use crate::types::{
    BranchOutcome, Excludes, Job, RunResult, RunStatus, SnapshotMethod, StageStatus,
};
use crate::verify;
use crate::{Error, Result};
use chrono::Local;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Per-run state shared by the branches.
struct RunContext {
    bup: Bup,
    stats: Option<StatsRecorder>,
    /// Excludes with the `*_from` files read, when verification is on.
    verify_excludes: Option<std::result::Result<Excludes, String>>,
}

pub struct BackupRunner {
    job: Job,
    commands: Arc<dyn CommandRunner>,
    snapshots: Box<dyn SnapshotProvider>,
}

impl BackupRunner {
    pub fn new(
        job: Job,
        commands: Arc<dyn CommandRunner>,
        snapshots: Box<dyn SnapshotProvider>,
    ) -> Self {
        Self {
            job,
            commands,
            snapshots,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Runs the whole job. Branch failures are reported in the result;
    /// an `Err` means the run could not take place at all.
    pub async fn run(&self) -> Result<RunResult> {
        let started = Local::now();
        let timer = Instant::now();
        let job = &self.job;
        let repo = BupRepository::new(&job.repository, job.remote.clone());
        let bup = Bup::new(self.commands.clone(), repo.clone(), job.verbosity);

        let mut initialized = false;
        if !repo.exists_locally() {
            if !bup.init().await {
                return Err(Error::InitFailed {
                    path: job.repository.clone(),
                });
            }
            initialized = true;
        }

        let _lock = PidLock::acquire(&job.pidfile)?;

        let mut cleared = false;
        if job.tasks.clear && !initialized {
            cleared = bup.clear_index().await;
            if !cleared {
                warn!("failed to clear the index");
            }
        }

        let stats = if job.tasks.stats {
            match StatsRecorder::collect(self.commands.clone(), repo).await {
                Ok(recorder) => Some(recorder),
                Err(e) => {
                    warn!("cannot collect repository statistics: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let verify_excludes = job
            .tasks
            .verify
            .then(|| job.excludes.expanded().map_err(|e| e.to_string()));

        let mut ctx = RunContext {
            bup,
            stats,
            verify_excludes,
        };
        let repository_size_before = ctx.stats.as_ref().and_then(|s| s.first_size());

        let mut branches = Vec::new();
        for path in &job.paths {
            if job.excludes.matches(path, path.is_dir()) {
                warn!("{} is excluded, not backing it up", path.display());
                continue;
            }
            let outcome = self.backup_one(&mut ctx, path).await;
            if outcome.succeeded() {
                info!(
                    "backup of {} completed in {:.1}s",
                    path.display(),
                    outcome.duration_secs
                );
            } else {
                error!("backup of {} failed", path.display());
            }
            branches.push(outcome);
        }

        if let Some(stats) = &ctx.stats {
            info!("{}", stats.summary());
        }

        if branches.is_empty() {
            error!("every source path is excluded, nothing was backed up");
        }
        let status = if !branches.is_empty() && branches.iter().all(BranchOutcome::succeeded) {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };

        Ok(RunResult {
            status,
            started,
            duration_secs: timer.elapsed().as_secs_f64(),
            initialized,
            cleared,
            branches,
            repository_size_before,
            repository_size_after: ctx.stats.as_ref().and_then(|s| s.last_size()),
        })
    }

    async fn backup_one(&self, ctx: &mut RunContext, path: &Path) -> BranchOutcome {
        let timer = Instant::now();
        let mut outcome = BranchOutcome::new(path, self.job.branch_for(path));

        let handle = match self.snapshots.acquire(path).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("cannot snapshot {}: {}", path.display(), e);
                outcome.snapshot = StageStatus::Failed;
                outcome.duration_secs = timer.elapsed().as_secs_f64();
                return outcome;
            }
        };
        let live = handle.is_live();
        if self.snapshots.method() != SnapshotMethod::None {
            outcome.snapshot = if live {
                StageStatus::Skipped
            } else {
                StageStatus::Passed
            };
        }

        self.run_stages(ctx, &handle, &mut outcome, timer).await;

        let released = self.snapshots.release(handle).await;
        if !live {
            outcome.release = StageStatus::from_success(released);
        }
        outcome.duration_secs = timer.elapsed().as_secs_f64();
        outcome
    }

    async fn run_stages(
        &self,
        ctx: &mut RunContext,
        handle: &SnapshotHandle,
        outcome: &mut BranchOutcome,
        timer: Instant,
    ) {
        let tasks = self.job.tasks;
        let backup_path = handle.backup_path();
        outcome.backup_path = backup_path.to_path_buf();

        outcome.index = StageStatus::from_success(
            ctx.bup.index(backup_path, &self.job.excludes).await,
        );
        if outcome.index.failed() {
            error!("Skipping save because index failed!");
            return;
        }

        let graft = backup_path.to_string_lossy();
        outcome.save = StageStatus::from_success(
            ctx.bup.save(&[backup_path], &outcome.branch, &graft).await,
        );
        if outcome.save.failed() {
            error!("bup save failed on {}", backup_path.display());
        }

        if tasks.check {
            outcome.check = verify::check_repository(&ctx.bup, tasks.repair).await;
        }
        if tasks.parity {
            outcome.parity = verify::generate_parity(&ctx.bup).await;
        }

        if outcome.save != StageStatus::Passed {
            return;
        }

        if let Some(excludes) = &ctx.verify_excludes {
            outcome.verify = match excludes {
                Ok(excludes) => {
                    match verify::verify_restore(
                        &ctx.bup,
                        &outcome.branch,
                        handle.source(),
                        backup_path,
                        excludes,
                    )
                    .await
                    {
                        Ok(diff) => {
                            let status = StageStatus::from_success(diff.is_clean());
                            if diff.is_clean() {
                                info!("verified {}: {}", outcome.branch, diff.summary());
                            } else {
                                warn!("verification of {} failed: {}", outcome.branch, diff.summary());
                            }
                            outcome.files = Some(diff.source_files);
                            outcome.bytes = Some(diff.source_bytes);
                            outcome.diff = Some(diff);
                            status
                        }
                        Err(e) => {
                            warn!("cannot verify {}: {}", outcome.branch, e);
                            StageStatus::Failed
                        }
                    }
                }
                Err(e) => {
                    warn!("cannot read exclude lists for verification: {}", e);
                    StageStatus::Failed
                }
            };
        }

        if tasks.stats {
            outcome.duration_secs = timer.elapsed().as_secs_f64();
            outcome.stats = match ctx.stats.as_mut() {
                Some(stats) => match stats.record(outcome).await {
                    Ok(()) => StageStatus::Passed,
                    Err(e) => {
                        warn!("failed to record statistics for {}: {}", outcome.branch, e);
                        StageStatus::Failed
                    }
                },
                None => StageStatus::Failed,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, ScriptedRunner};
    use crate::snapshot::{NoSnapshot, SnapshotKind};
    use crate::types::{SnapshotOptions, Tasks};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Pretends to snapshot every path, recording acquire and release.
    #[derive(Default)]
    struct RecordingProvider {
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SnapshotProvider for RecordingProvider {
        fn method(&self) -> SnapshotMethod {
            SnapshotMethod::Lvm
        }

        async fn acquire(&self, source: &Path) -> Result<SnapshotHandle> {
            self.events
                .lock()
                .unwrap()
                .push(format!("acquire {}", source.display()));
            Ok(SnapshotHandle::new(
                source,
                source.to_path_buf(),
                SnapshotKind::Lvm {
                    vg: "vg0".to_string(),
                    lv: "root".to_string(),
                    device: PathBuf::from("/dev/vg0/snaproot"),
                    mountpoint: PathBuf::from("/media/bup/vg0-root"),
                },
            ))
        }

        async fn release(&self, handle: SnapshotHandle) -> bool {
            self.events
                .lock()
                .unwrap()
                .push(format!("release {}", handle.source().display()));
            handle.finish();
            true
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        job: Job,
    }

    fn fixture(paths: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repository = dir.path().join("repo");
        std::fs::create_dir(&repository).unwrap();
        let job = Job {
            name: "host".to_string(),
            branch_name: None,
            paths: paths.iter().map(PathBuf::from).collect(),
            pidfile: dir.path().join("bupcron.pid"),
            repository,
            remote: None,
            excludes: Excludes::default(),
            snapshot: SnapshotOptions::default(),
            tasks: Tasks::default(),
            verbosity: 0,
        };
        Fixture { dir, job }
    }

    #[tokio::test]
    async fn test_successful_run() {
        let fx = fixture(&["/home", "/etc"]);
        let runner = Arc::new(ScriptedRunner::new());
        let result = BackupRunner::new(fx.job, runner.clone(), Box::new(NoSnapshot))
            .run()
            .await
            .unwrap();

        assert!(result.succeeded());
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.branches.len(), 2);
        assert_eq!(result.branches[0].branch, "host-_home");
        assert_eq!(result.branches[1].branch, "host-_etc");
        assert_eq!(runner.count("bup index"), 2);
        assert_eq!(runner.count("bup save"), 2);
        assert!(!result.initialized);
        assert!(!fx.dir.path().join("bupcron.pid").exists());
    }

    #[tokio::test]
    async fn test_failed_save_fails_run_and_still_releases() {
        let fx = fixture(&["/home", "/etc"]);
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("bup save --quiet --name host-_home", 1);
        let provider = RecordingProvider::default();
        let events = provider.events.clone();

        let result = BackupRunner::new(fx.job, runner.clone(), Box::new(provider))
            .run()
            .await
            .unwrap();

        assert_eq!(result.exit_code(), 1);
        let failed: Vec<_> = result.failed_branches().map(|b| b.branch.clone()).collect();
        assert_eq!(failed, vec!["host-_home"]);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["acquire /home", "release /home", "acquire /etc", "release /etc"]
        );
        assert_eq!(result.branches[0].release, StageStatus::Passed);
    }

    #[tokio::test]
    async fn test_failed_index_skips_save() {
        let fx = fixture(&["/home"]);
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("bup index", 1);
        let provider = RecordingProvider::default();
        let events = provider.events.clone();

        let result = BackupRunner::new(fx.job, runner.clone(), Box::new(provider))
            .run()
            .await
            .unwrap();

        assert!(!result.succeeded());
        assert_eq!(runner.count("bup save"), 0);
        assert_eq!(result.branches[0].save, StageStatus::Skipped);
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_clear_runs_before_index() {
        let mut fx = fixture(&["/home"]);
        fx.job.tasks.clear = true;
        let runner = Arc::new(ScriptedRunner::new());

        let result = BackupRunner::new(fx.job, runner.clone(), Box::new(NoSnapshot))
            .run()
            .await
            .unwrap();

        assert!(result.cleared);
        let clear = runner.position("bup index --clear").unwrap();
        let index = runner.position("bup index --one-file-system").unwrap();
        assert!(clear < index);
    }

    #[tokio::test]
    async fn test_failed_clear_is_only_a_warning() {
        let mut fx = fixture(&["/home"]);
        fx.job.tasks.clear = true;
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("bup index --clear", 1);

        let result = BackupRunner::new(fx.job, runner, Box::new(NoSnapshot))
            .run()
            .await
            .unwrap();
        assert!(!result.cleared);
        assert!(result.succeeded());
    }

    #[tokio::test]
    async fn test_new_repository_is_initialized_and_not_cleared() {
        let mut fx = fixture(&["/home"]);
        fx.job.repository = fx.dir.path().join("new-repo");
        fx.job.tasks.clear = true;
        let runner = Arc::new(ScriptedRunner::new());

        let result = BackupRunner::new(fx.job, runner.clone(), Box::new(NoSnapshot))
            .run()
            .await
            .unwrap();

        assert!(result.initialized);
        assert_eq!(runner.position("bup init"), Some(0));
        assert_eq!(runner.count("bup index --clear"), 0);
    }

    #[tokio::test]
    async fn test_failed_init_aborts() {
        let mut fx = fixture(&["/home"]);
        fx.job.repository = fx.dir.path().join("new-repo");
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("bup init", 1);

        let err = BackupRunner::new(fx.job, runner.clone(), Box::new(NoSnapshot))
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(runner.count("bup index"), 0);
    }

    #[tokio::test]
    async fn test_held_lock_aborts() {
        let fx = fixture(&["/home"]);
        std::fs::write(&fx.job.pidfile, std::process::id().to_string()).unwrap();
        let runner = Arc::new(ScriptedRunner::new());

        let err = BackupRunner::new(fx.job, runner.clone(), Box::new(NoSnapshot))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning { .. }));
        assert_eq!(err.exit_code(), 2);
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_excluded_source_is_skipped() {
        let mut fx = fixture(&["/home", "/home/user/.cache"]);
        fx.job.excludes.paths = vec!["/home/user/.cache".to_string()];
        let runner = Arc::new(ScriptedRunner::new());

        let result = BackupRunner::new(fx.job, runner.clone(), Box::new(NoSnapshot))
            .run()
            .await
            .unwrap();

        assert_eq!(result.branches.len(), 1);
        assert_eq!(result.branches[0].source, PathBuf::from("/home"));
        assert!(runner.commands()[0].contains("--exclude=/home/user/.cache"));
    }

    #[tokio::test]
    async fn test_all_sources_excluded_fails_run() {
        let mut fx = fixture(&["/home/user/.cache"]);
        fx.job.excludes.paths = vec!["/home/user".to_string()];
        let runner = Arc::new(ScriptedRunner::new());

        let result = BackupRunner::new(fx.job, runner.clone(), Box::new(NoSnapshot))
            .run()
            .await
            .unwrap();

        assert!(result.branches.is_empty());
        assert!(!result.succeeded());
        assert_eq!(result.exit_code(), 1);
        assert_eq!(runner.count("bup save"), 0);
    }

    #[tokio::test]
    async fn test_unfixable_check_fails_branch() {
        let mut fx = fixture(&["/home"]);
        fx.job.tasks.check = true;
        fx.job.tasks.repair = true;
        fx.job.tasks.parity = true;
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("bup fsck --repair", 1);
        runner.fail("bup fsck --quick", 1);
        runner.fail("bup fsck --par2-ok", 1);

        let result = BackupRunner::new(fx.job, runner.clone(), Box::new(NoSnapshot))
            .run()
            .await
            .unwrap();

        let branch = &result.branches[0];
        assert_eq!(branch.check, StageStatus::Failed);
        assert_eq!(branch.parity, StageStatus::Failed);
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn test_parity_failure_does_not_fail_branch() {
        let mut fx = fixture(&["/home"]);
        fx.job.tasks.parity = true;
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("bup fsck --par2-ok", 1);

        let result = BackupRunner::new(fx.job, runner, Box::new(NoSnapshot))
            .run()
            .await
            .unwrap();
        assert_eq!(result.branches[0].parity, StageStatus::Failed);
        assert!(result.succeeded());
    }

    #[tokio::test]
    async fn test_stats_note_per_saved_branch() {
        let mut fx = fixture(&["/home", "/etc"]);
        fx.job.tasks.stats = true;
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("bup --version", CommandOutput::ok("0.33.3\n"));
        runner.respond("git --version", CommandOutput::ok("git version 2.45.2\n"));
        runner.respond("du", CommandOutput::ok("4096\tobjects/pack\n"));
        runner.fail("bup save --quiet --name host-_etc", 1);

        let result = BackupRunner::new(fx.job, runner.clone(), Box::new(NoSnapshot))
            .run()
            .await
            .unwrap();

        assert_eq!(runner.count("git --git-dir"), 1);
        assert_eq!(result.branches[0].stats, StageStatus::Passed);
        assert_eq!(result.branches[1].stats, StageStatus::Skipped);
        assert_eq!(result.repository_size_before, Some(4096));
        assert_eq!(result.repository_size_after, Some(4096));
    }

    #[tokio::test]
    async fn test_unavailable_stats_fail_branch() {
        let mut fx = fixture(&["/home"]);
        fx.job.tasks.stats = true;
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("bup --version", 127);

        let result = BackupRunner::new(fx.job, runner, Box::new(NoSnapshot))
            .run()
            .await
            .unwrap();
        assert_eq!(result.branches[0].stats, StageStatus::Failed);
        assert_eq!(result.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_verify_compares_restored_tree() {
        let source = tempfile::tempdir().unwrap();
        let source_path = source.path().to_string_lossy().into_owned();
        let mut fx = fixture(&[source_path.as_str()]);
        fx.job.tasks.verify = true;
        let runner = Arc::new(ScriptedRunner::new());

        let result = BackupRunner::new(fx.job, runner.clone(), Box::new(NoSnapshot))
            .run()
            .await
            .unwrap();

        let branch = &result.branches[0];
        assert_eq!(branch.verify, StageStatus::Passed);
        assert_eq!(branch.files, Some(0));
        assert_eq!(runner.count("bup restore"), 1);
    }

    #[tokio::test]
    async fn test_verify_reports_missing_files() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("data.txt"), "payload").unwrap();
        let source_path = source.path().to_string_lossy().into_owned();
        let mut fx = fixture(&[source_path.as_str()]);
        fx.job.tasks.verify = true;
        // the scripted restore writes nothing
        let runner = Arc::new(ScriptedRunner::new());

        let result = BackupRunner::new(fx.job, runner, Box::new(NoSnapshot))
            .run()
            .await
            .unwrap();

        let branch = &result.branches[0];
        assert_eq!(branch.verify, StageStatus::Failed);
        let diff = branch.diff.as_ref().unwrap();
        assert_eq!(diff.only_in_source, vec![PathBuf::from("data.txt")]);
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn test_branch_name_override() {
        let mut fx = fixture(&["/home"]);
        fx.job.branch_name = Some("nightly".to_string());
        let runner = Arc::new(ScriptedRunner::new());

        BackupRunner::new(fx.job, runner.clone(), Box::new(NoSnapshot))
            .run()
            .await
            .unwrap();
        assert_eq!(runner.count("bup save --quiet --name nightly"), 1);
    }
}
