//! Operating system snapshot providers.

pub mod lvm;
pub mod mounts;
pub mod vss;

use bupcron_core::command::CommandRunner;
use bupcron_core::snapshot::{NoSnapshot, SnapshotProvider};
use bupcron_core::{SnapshotMethod, SnapshotOptions};
use std::sync::Arc;

pub use lvm::LvmSnapshot;
pub use vss::VssSnapshot;

/// Builds the provider for the configured snapshot method.
pub fn provider(
    options: &SnapshotOptions,
    runner: Arc<dyn CommandRunner>,
    verbosity: u8,
) -> Box<dyn SnapshotProvider> {
    match options.method {
        SnapshotMethod::None => Box::new(NoSnapshot),
        SnapshotMethod::Lvm => Box::new(LvmSnapshot::new(runner, options, verbosity)),
        SnapshotMethod::Vss => Box::new(VssSnapshot::new(runner, options)),
    }
}
