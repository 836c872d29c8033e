pub mod bup;
pub mod command;
pub mod config;
pub mod error;
pub mod lock;
pub mod repository;
pub mod runner;
pub mod snapshot;
pub mod stats;
pub mod types;
pub mod verify;

pub use command::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use config::{ConfigLayer, ConfigLoader};
pub use error::{Error, Result};
pub use repository::{BupRepository, Remote};
pub use runner::BackupRunner;
pub use snapshot::{NoSnapshot, SnapshotHandle, SnapshotKind, SnapshotProvider};
pub use types::*;
