mod commands;
mod logging;

use clap::Parser;
use commands::backup::BackupCommand;
use std::process::ExitCode;

const COPYRIGHT: &str = "\
bupcron: bup index and save for cron jobs, with filesystem snapshots,
repository checks and statistics.

Copyright (C) bupcron Contributors

Licensed under either of the Apache License, Version 2.0 or the MIT
license, at your option. This program comes with ABSOLUTELY NO WARRANTY.";

#[derive(Parser)]
#[command(
    name = "bupcron",
    version,
    about = "Run bup backups from cron",
    long_about = "Indexes and saves paths with bup, optionally from a filesystem snapshot, \
                  then checks the repository and records statistics.\n\n\
                  Settings are read from /etc/bupcron.toml, ~/.bupcron.toml and \
                  ~/.config/bupcron/config.toml, then from --config and @FILE arguments; \
                  command line options come last.\n\n\
                  Exit status: 0 on success, 1 when a backup failed, 2 when the run \
                  aborted, 3 when the repository could not be initialized."
)]
struct Cli {
    #[command(flatten)]
    backup: BackupCommand,

    #[arg(long, help = "Print copyright and license information and exit")]
    copyright: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.copyright {
        println!("{}", COPYRIGHT);
        return ExitCode::SUCCESS;
    }

    cli.backup.run().await
}
