//! Layered configuration: TOML files, then the command line.

use crate::repository::Remote;
use crate::types::{
    DEFAULT_MOUNT_PATTERN, DEFAULT_SNAPSHOT_SIZE, Excludes, Job, LogLevel, LogSettings,
    PIDFILE_NAME, Settings, SnapshotMethod, SnapshotOptions, Tasks, compile_pattern,
};
use crate::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One source of settings. Every field is optional so layers can be stacked.
///
/// Keys follow the long command-line options with `_` for `-`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    #[serde(alias = "path", deserialize_with = "one_or_many")]
    pub paths: Vec<PathBuf>,
    pub repository: Option<PathBuf>,
    pub remote: Option<String>,
    pub name: Option<String>,
    pub branch_name: Option<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub exclude: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub exclude_rx: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub exclude_from: Vec<PathBuf>,
    #[serde(deserialize_with = "one_or_many")]
    pub exclude_rx_from: Vec<PathBuf>,
    pub clear: Option<bool>,
    pub check: Option<bool>,
    pub repair: Option<bool>,
    pub parity: Option<bool>,
    pub verify: Option<bool>,
    pub stats: Option<bool>,
    pub snapshot: Option<String>,
    pub size: Option<String>,
    pub mountpoint: Option<String>,
    pub verbose: Option<u8>,
    pub debug: Option<bool>,
    pub logfile: Option<PathBuf>,
    pub syslog: Option<String>,
    pub pidfile: Option<PathBuf>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

fn pick<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

impl ConfigLayer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml(&content).map_err(|message| Error::ConfigParse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Stacks `other` on top: its scalars win, its lists are appended.
    pub fn merge(&mut self, other: ConfigLayer) {
        self.paths.extend(other.paths);
        self.exclude.extend(other.exclude);
        self.exclude_rx.extend(other.exclude_rx);
        self.exclude_from.extend(other.exclude_from);
        self.exclude_rx_from.extend(other.exclude_rx_from);

        pick(&mut self.repository, other.repository);
        pick(&mut self.remote, other.remote);
        pick(&mut self.name, other.name);
        pick(&mut self.branch_name, other.branch_name);
        pick(&mut self.clear, other.clear);
        pick(&mut self.check, other.check);
        pick(&mut self.repair, other.repair);
        pick(&mut self.parity, other.parity);
        pick(&mut self.verify, other.verify);
        pick(&mut self.stats, other.stats);
        pick(&mut self.snapshot, other.snapshot);
        pick(&mut self.size, other.size);
        pick(&mut self.mountpoint, other.mountpoint);
        pick(&mut self.verbose, other.verbose);
        pick(&mut self.debug, other.debug);
        pick(&mut self.logfile, other.logfile);
        pick(&mut self.syslog, other.syslog);
        pick(&mut self.pidfile, other.pidfile);
    }

    /// Removes `@FILE` entries from the paths and returns the files they name.
    pub fn take_config_references(&mut self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        self.paths.retain(|path| match path.to_str().and_then(|p| p.strip_prefix('@')) {
            Some(file) if !file.is_empty() => {
                files.push(PathBuf::from(file));
                false
            }
            _ => true,
        });
        files
    }
}

/// System-wide file, then the per-user ones.
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/bupcron.toml")];
    if let Some(base) = directories::BaseDirs::new() {
        paths.push(base.home_dir().join(".bupcron.toml"));
    }
    if let Some(project) = directories::ProjectDirs::from("", "", "bupcron") {
        paths.push(project.config_dir().join("config.toml"));
    }
    paths
}

pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    bup_dir: Option<PathBuf>,
    hostname: Option<String>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            search_paths: default_search_paths(),
            bup_dir: std::env::var_os("BUP_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            hostname: hostname::get()
                .ok()
                .map(|h| h.to_string_lossy().into_owned()),
        }
    }

    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    pub fn with_bup_dir(mut self, bup_dir: Option<PathBuf>) -> Self {
        self.bup_dir = bup_dir;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Merges the search path files, the explicitly named files and finally
    /// the command line, then validates the result.
    pub fn load(&self, explicit: &[PathBuf], mut cli: ConfigLayer) -> Result<Settings> {
        let mut merged = ConfigLayer::default();

        for path in &self.search_paths {
            if path.is_file() {
                debug!("reading configuration from {}", path.display());
                merged.merge(ConfigLayer::from_file(path)?);
            }
        }

        let mut files = explicit.to_vec();
        files.extend(cli.take_config_references());
        for path in &files {
            debug!("reading configuration from {}", path.display());
            merged.merge(ConfigLayer::from_file(path)?);
        }

        merged.merge(cli);
        self.resolve(merged)
    }

    pub fn resolve(&self, layer: ConfigLayer) -> Result<Settings> {
        let repository = layer
            .repository
            .or_else(|| self.bup_dir.clone())
            .ok_or_else(|| {
                Error::InvalidConfig(
                    "repository is required, pass -d/--repository or set BUP_DIR".to_string(),
                )
            })?;

        if layer.paths.is_empty() {
            return Err(Error::InvalidConfig("no paths to back up".to_string()));
        }
        if layer.name.is_some() && layer.branch_name.is_some() {
            return Err(Error::InvalidConfig(
                "the options --name and --branch-name cannot be used together".to_string(),
            ));
        }

        let patterns = layer
            .exclude_rx
            .iter()
            .map(|p| compile_pattern(p))
            .collect::<Result<Vec<_>>>()?;

        let remote = layer
            .remote
            .as_deref()
            .map(str::parse::<Remote>)
            .transpose()?;

        let method = match layer.snapshot.as_deref() {
            Some(method) => method.parse::<SnapshotMethod>().map_err(Error::InvalidConfig)?,
            None => SnapshotMethod::None,
        };

        let syslog = layer
            .syslog
            .as_deref()
            .map(|level| level.parse::<LogLevel>().map_err(Error::InvalidConfig))
            .transpose()?;

        let repair = layer.repair.unwrap_or(false);
        let tasks = Tasks {
            clear: layer.clear.unwrap_or(false),
            check: layer.check.unwrap_or(false) || repair,
            repair,
            parity: layer.parity.unwrap_or(false),
            verify: layer.verify.unwrap_or(false),
            stats: layer.stats.unwrap_or(false),
        };

        let verbosity = layer.verbose.unwrap_or(0);
        let pidfile = layer
            .pidfile
            .unwrap_or_else(|| repository.join(PIDFILE_NAME));
        let name = layer
            .name
            .or_else(|| self.hostname.clone())
            .unwrap_or_else(|| "localhost".to_string());

        let job = Job {
            name,
            branch_name: layer.branch_name,
            paths: layer.paths,
            repository,
            remote,
            excludes: Excludes {
                paths: layer.exclude,
                patterns,
                from_files: layer.exclude_from,
                rx_from_files: layer.exclude_rx_from,
            },
            snapshot: SnapshotOptions {
                method,
                size: layer
                    .size
                    .unwrap_or_else(|| DEFAULT_SNAPSHOT_SIZE.to_string()),
                mount_pattern: layer
                    .mountpoint
                    .unwrap_or_else(|| DEFAULT_MOUNT_PATTERN.to_string()),
            },
            tasks,
            verbosity,
            pidfile,
        };

        Ok(Settings {
            job,
            logging: LogSettings {
                verbosity,
                debug: layer.debug.unwrap_or(false),
                logfile: layer.logfile,
                syslog,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn loader() -> ConfigLoader {
        ConfigLoader::new()
            .with_search_paths(Vec::new())
            .with_bup_dir(None)
            .with_hostname("host")
    }

    fn cli(paths: &[&str], repository: Option<&str>) -> ConfigLayer {
        ConfigLayer {
            paths: paths.iter().map(PathBuf::from).collect(),
            repository: repository.map(PathBuf::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_toml_layer() {
        let layer = ConfigLayer::from_toml(
            r#"
            path = "/home"
            repository = "/srv/bup"
            exclude = ["/home/user/.cache"]
            exclude_rx = '\.tmp$'
            snapshot = "LVM"
            size = "2G"
            check = true
            syslog = "warning"
            "#,
        )
        .unwrap();

        assert_eq!(layer.paths, vec![PathBuf::from("/home")]);
        assert_eq!(layer.exclude_rx, vec![r"\.tmp$".to_string()]);
        assert_eq!(layer.snapshot.as_deref(), Some("LVM"));
        assert_eq!(layer.check, Some(true));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(ConfigLayer::from_toml("reposiotry = \"/srv/bup\"").is_err());
    }

    #[test]
    fn test_merge_overrides_scalars_and_extends_lists() {
        let mut base = ConfigLayer {
            paths: vec![PathBuf::from("/etc")],
            repository: Some(PathBuf::from("/srv/bup")),
            size: Some("1G".to_string()),
            ..Default::default()
        };
        base.merge(ConfigLayer {
            paths: vec![PathBuf::from("/home")],
            size: Some("4G".to_string()),
            ..Default::default()
        });

        assert_eq!(base.paths, vec![PathBuf::from("/etc"), PathBuf::from("/home")]);
        assert_eq!(base.repository, Some(PathBuf::from("/srv/bup")));
        assert_eq!(base.size.as_deref(), Some("4G"));
    }

    #[test]
    fn test_defaults() {
        let settings = loader().load(&[], cli(&["/home"], Some("/srv/bup"))).unwrap();
        let job = settings.job;

        assert_eq!(job.name, "host");
        assert_eq!(job.pidfile, PathBuf::from("/srv/bup/.bupcron.pid"));
        assert_eq!(job.snapshot, SnapshotOptions::default());
        assert_eq!(job.tasks, Tasks::default());
        assert_eq!(settings.logging, LogSettings::default());
    }

    #[test]
    fn test_repository_from_bup_dir() {
        let settings = loader()
            .with_bup_dir(Some(PathBuf::from("/root/.bup")))
            .load(&[], cli(&["/home"], None))
            .unwrap();
        assert_eq!(settings.job.repository, PathBuf::from("/root/.bup"));
    }

    #[test]
    fn test_missing_repository_is_an_error() {
        let err = loader().load(&[], cli(&["/home"], None)).unwrap_err();
        assert!(err.to_string().contains("repository is required"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_missing_paths_is_an_error() {
        assert!(matches!(
            loader().load(&[], cli(&[], Some("/srv/bup"))),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_name_and_branch_name_conflict() {
        let mut layer = cli(&["/home"], Some("/srv/bup"));
        layer.name = Some("laptop".to_string());
        layer.branch_name = Some("nightly".to_string());
        assert!(loader().load(&[], layer).is_err());
    }

    #[test]
    fn test_repair_implies_check() {
        let mut layer = cli(&["/home"], Some("/srv/bup"));
        layer.repair = Some(true);
        let tasks = loader().load(&[], layer).unwrap().job.tasks;
        assert!(tasks.check);
        assert!(tasks.repair);
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let mut layer = cli(&["/home"], Some("/srv/bup"));
        layer.exclude_rx = vec!["(unclosed".to_string()];
        assert!(matches!(
            loader().load(&[], layer),
            Err(Error::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let mut layer = cli(&["/home"], Some("/srv/bup"));
        layer.snapshot = Some("zfs".to_string());
        assert!(loader().load(&[], layer).is_err());

        let mut layer = cli(&["/home"], Some("/srv/bup"));
        layer.remote = Some("nas".to_string());
        assert!(matches!(
            loader().load(&[], layer),
            Err(Error::InvalidRemote(_))
        ));
    }

    #[test]
    fn test_files_layer_in_order_under_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let system = dir.path().join("system.toml");
        let user = dir.path().join("user.toml");
        let missing = dir.path().join("missing.toml");
        let extra = dir.path().join("extra.toml");
        fs::write(&system, "repository = \"/srv/bup\"\npaths = [\"/etc\"]\nsize = \"1G\"\n").unwrap();
        fs::write(&user, "size = \"2G\"\nstats = true\n").unwrap();
        fs::write(&extra, "paths = \"/var\"\nsnapshot = \"lvm\"\n").unwrap();

        let mut command_line = cli(&["/home"], None);
        command_line.size = Some("3G".to_string());
        command_line.paths.push(PathBuf::from(format!("@{}", extra.display())));

        let settings = loader()
            .with_search_paths(vec![system, missing, user])
            .load(&[], command_line)
            .unwrap();
        let job = settings.job;

        assert_eq!(job.repository, PathBuf::from("/srv/bup"));
        assert_eq!(
            job.paths,
            vec![PathBuf::from("/etc"), PathBuf::from("/var"), PathBuf::from("/home")]
        );
        assert_eq!(job.snapshot.size, "3G");
        assert_eq!(job.snapshot.method, SnapshotMethod::Lvm);
        assert!(job.tasks.stats);
    }

    #[test]
    fn test_malformed_file_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "paths = [\n").unwrap();

        let err = loader()
            .load(&[broken.clone()], cli(&["/home"], Some("/srv/bup")))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigParse { ref path, .. } if *path == broken));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = loader()
            .load(
                &[PathBuf::from("/nonexistent/bupcron.toml")],
                cli(&["/home"], Some("/srv/bup")),
            )
            .unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }
}
