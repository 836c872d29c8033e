use bupcron_core::{
    BackupRunner, CommandRunner, ConfigLayer, ConfigLoader, ProcessRunner, RunResult, Settings,
};
use clap::{ArgAction, Args};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::logging;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Args, Debug, Default)]
pub struct BackupCommand {
    #[arg(
        value_name = "PATH",
        help = "Paths to back up; @FILE reads settings from FILE"
    )]
    paths: Vec<PathBuf>,

    #[arg(short = 'p', long = "path", value_name = "PATH", help = "Add a path to back up")]
    path: Vec<PathBuf>,

    #[arg(
        short = 'd',
        long,
        value_name = "DIR",
        help = "Bup repository, defaults to $BUP_DIR"
    )]
    repository: Option<PathBuf>,

    #[arg(short, long, value_name = "HOST:PATH", help = "Save to a remote repository over ssh")]
    remote: Option<String>,

    #[arg(short, long, help = "Base of the branch names, defaults to the hostname")]
    name: Option<String>,

    #[arg(short, long, help = "Branch to save to, overrides --name")]
    branch_name: Option<String>,

    #[arg(short = 'x', long, value_name = "PATH", help = "Exclude a path, passed to bup index")]
    exclude: Vec<String>,

    #[arg(long, value_name = "PATTERN", help = "Exclude paths matching a regular expression")]
    exclude_rx: Vec<String>,

    #[arg(long, value_name = "FILE", help = "Read --exclude paths from FILE")]
    exclude_from: Vec<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Read --exclude-rx patterns from FILE")]
    exclude_rx_from: Vec<PathBuf>,

    #[arg(long, help = "Clear the index before indexing (bup index --clear)")]
    clear: bool,

    #[arg(long, help = "Generate par2 recovery blocks after the backup")]
    parity: bool,

    #[arg(long, help = "Run bup fsck --quick after each backup")]
    check: bool,

    #[arg(long, help = "Repair the repository if fsck fails, implies --check")]
    repair: bool,

    #[arg(long, help = "Restore each saved branch and compare it with the source")]
    verify: bool,

    #[arg(
        short = 's',
        long,
        value_name = "METHOD",
        num_args = 0..=1,
        default_missing_value = "lvm",
        help = "Snapshot the filesystem before the backup: none, lvm or vss (lvm when no value)"
    )]
    snapshot: Option<String>,

    #[arg(short = 'z', long, help = "Size of the LVM snapshot [default: 1G]")]
    size: Option<String>,

    #[arg(
        short = 'm',
        long,
        value_name = "PATTERN",
        help = "Where snapshots are mounted, {vg} and {lv} are substituted [default: /media/bup/{vg}-{lv}]"
    )]
    mountpoint: Option<String>,

    #[arg(long, help = "Record repository size and versions as a git note on each branch")]
    stats: bool,

    #[arg(short = 'c', long = "config", value_name = "FILE", help = "Read settings from a TOML file")]
    config: Vec<PathBuf>,

    #[arg(short, long, action = ArgAction::Count, help = "More output: -v for steps, -vv for commands")]
    verbose: u8,

    #[arg(short = 'D', long, help = "Show the full error chain when aborting")]
    debug: bool,

    #[arg(
        short = 'l',
        long,
        value_name = "FILE",
        help = "Log to FILE instead of stdout; FILE is appended to and never rotated, use logrotate"
    )]
    logfile: Option<PathBuf>,

    #[arg(
        long,
        value_name = "LEVEL",
        num_args = 0..=1,
        default_missing_value = "info",
        help = "Also log to syslog at LEVEL (info when no value)"
    )]
    syslog: Option<String>,

    #[arg(long, value_name = "FILE", help = "Lock file, defaults to <repository>/.bupcron.pid")]
    pidfile: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Write a JSON report of the run to FILE")]
    report: Option<PathBuf>,
}

fn flag(set: bool) -> Option<bool> {
    set.then_some(true)
}

impl BackupCommand {
    /// The command line as the topmost configuration layer.
    pub fn to_layer(&self) -> ConfigLayer {
        ConfigLayer {
            paths: self.paths.iter().chain(&self.path).cloned().collect(),
            repository: self.repository.clone(),
            remote: self.remote.clone(),
            name: self.name.clone(),
            branch_name: self.branch_name.clone(),
            exclude: self.exclude.clone(),
            exclude_rx: self.exclude_rx.clone(),
            exclude_from: self.exclude_from.clone(),
            exclude_rx_from: self.exclude_rx_from.clone(),
            clear: flag(self.clear),
            check: flag(self.check),
            repair: flag(self.repair),
            parity: flag(self.parity),
            verify: flag(self.verify),
            stats: flag(self.stats),
            snapshot: self.snapshot.clone(),
            size: self.size.clone(),
            mountpoint: self.mountpoint.clone(),
            verbose: (self.verbose > 0).then_some(self.verbose),
            debug: flag(self.debug),
            logfile: self.logfile.clone(),
            syslog: self.syslog.clone(),
            pidfile: self.pidfile.clone(),
        }
    }

    pub async fn run(&self) -> ExitCode {
        let timer = Instant::now();

        let settings = match ConfigLoader::new().load(&self.config, self.to_layer()) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("bupcron: {}", e);
                return ExitCode::from(e.exit_code());
            }
        };

        let _guard = match logging::init(&settings.logging) {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("bupcron: {:#}", e);
                return ExitCode::from(2);
            }
        };

        info!("bupcron {} starting", VERSION);
        let debug = settings.logging.debug;

        let code = match execute(settings).await {
            Ok(result) => {
                if let Some(path) = &self.report {
                    if let Err(e) = result.write_report(path) {
                        warn!("cannot write report to {}: {}", path.display(), e);
                    }
                }
                if !result.succeeded() {
                    warn!("one or more backups failed to complete");
                }
                result.exit_code()
            }
            Err(e) => {
                let code = e.exit_code();
                if debug {
                    error!("aborted: {:?}", anyhow::Error::from(e));
                } else {
                    error!("aborted: {}", e);
                    eprintln!("bupcron: {}", e);
                }
                code
            }
        };

        info!(
            "bupcron {} completed, elapsed: {:.1}s",
            VERSION,
            timer.elapsed().as_secs_f64()
        );
        ExitCode::from(code)
    }
}

async fn execute(settings: Settings) -> bupcron_core::Result<RunResult> {
    let commands: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    let snapshots = bupcron_integrations::provider(
        &settings.job.snapshot,
        commands.clone(),
        settings.job.verbosity,
    );
    BackupRunner::new(settings.job, commands, snapshots)
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        backup: BackupCommand,
    }

    fn parse(args: &[&str]) -> BackupCommand {
        TestCli::parse_from(std::iter::once("bupcron").chain(args.iter().copied())).backup
    }

    #[test]
    fn test_paths_and_path_options_are_merged() {
        let layer = parse(&["/home", "-p", "/etc", "-d", "/srv/bup"]).to_layer();
        assert_eq!(layer.paths, vec![PathBuf::from("/home"), PathBuf::from("/etc")]);
        assert_eq!(layer.repository, Some(PathBuf::from("/srv/bup")));
    }

    #[test]
    fn test_snapshot_without_value_means_lvm() {
        let layer = parse(&["-s", "-d", "/srv/bup", "/home"]).to_layer();
        assert_eq!(layer.snapshot.as_deref(), Some("lvm"));

        let layer = parse(&["--snapshot=vss", "/home"]).to_layer();
        assert_eq!(layer.snapshot.as_deref(), Some("vss"));
    }

    #[test]
    fn test_syslog_without_value_means_info() {
        let layer = parse(&["--syslog", "-v", "/home"]).to_layer();
        assert_eq!(layer.syslog.as_deref(), Some("info"));
        assert_eq!(layer.verbose, Some(1));
    }

    #[test]
    fn test_unset_flags_do_not_override_files() {
        let layer = parse(&["/home"]).to_layer();
        assert_eq!(layer.clear, None);
        assert_eq!(layer.verbose, None);
        assert_eq!(layer.snapshot, None);

        let layer = parse(&["--clear", "--repair", "-vvv", "/home"]).to_layer();
        assert_eq!(layer.clear, Some(true));
        assert_eq!(layer.repair, Some(true));
        assert_eq!(layer.verbose, Some(3));
    }
}
