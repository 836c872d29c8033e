use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to parse config file {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid exclude pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Invalid remote address '{0}', expected HOST:PATH")]
    InvalidRemote(String),

    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected output from {program}: {message}")]
    UnexpectedOutput { program: String, message: String },

    #[error("Failed to initialize bup repository at {path}")]
    InitFailed { path: PathBuf },

    #[error("Process already running in {path} as pid {pid}")]
    AlreadyRunning { path: PathBuf, pid: String },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error(
        "A snapshot is already mounted at {0}; identify it with `vshadow -q` and drop it with `vshadow -ds={{SNAPSHOT_ID}}`"
    )]
    AlreadyMounted(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Process exit code reported to the scheduler when a run aborts with this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::InitFailed { .. } => 3,
            _ => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
