//! Log destinations: stdout or a log file, plus syslog.

use anyhow::{Context, Result};
use bupcron_core::{LogLevel, LogSettings};
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps the file writer running; flushes on drop.
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

/// Filter directives for the bupcron crates at `level`.
fn directives(level: &str) -> String {
    format!(
        "bupcron_cli={0},bupcron_core={0},bupcron_integrations={0}",
        level
    )
}

/// Console level: warnings by default, `-v` for info, `-vv` and up for debug.
pub fn console_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

fn is_stdout(path: &Path) -> bool {
    path == Path::new("-") || path == Path::new("/dev/stdout")
}

pub fn init(settings: &LogSettings) -> Result<LogGuard> {
    let logfile = settings.logfile.as_deref().filter(|path| !is_stdout(path));

    let console = match logfile {
        None => {
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(directives(console_level(settings.verbosity))));
            Some(
                fmt::layer()
                    .with_writer(io::stdout)
                    .with_target(false)
                    .with_filter(filter),
            )
        }
        Some(_) => None,
    };

    let (file, guard) = match logfile {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("invalid log file {}", path.display()))?;
            std::fs::create_dir_all(directory)
                .with_context(|| format!("cannot create log directory {}", directory.display()))?;

            // rotation is left to logrotate; the file name stays fixed
            let appender = tracing_appender::rolling::never(directory, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_filter(EnvFilter::new(directives("debug")));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let syslog = match settings.syslog {
        Some(level) => {
            let writer = syslog::Syslog::connect("bupcron")
                .context("cannot connect to syslog at /dev/log")?;
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_level(false)
                    .without_time()
                    .with_filter(EnvFilter::new(directives(level.as_str()))),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .with(syslog)
        .try_init()
        .context("logging already initialized")?;

    tracing::debug!(
        "logging configured: console {}, file {:?}, syslog {:?}",
        if logfile.is_none() { console_level(settings.verbosity) } else { "off" },
        logfile,
        settings.syslog.map(|l: LogLevel| l.as_str())
    );

    Ok(LogGuard { _guard: guard })
}

pub mod syslog {
    //! Minimal RFC 3164 writer over the local `/dev/log` socket.

    use std::io::{self, Write};
    use std::os::unix::net::UnixDatagram;
    use std::sync::Arc;
    use tracing::{Level, Metadata};
    use tracing_subscriber::fmt::MakeWriter;

    /// `user` facility.
    const FACILITY: u8 = 1;

    pub fn severity(level: &Level) -> u8 {
        match *level {
            Level::ERROR => 3,
            Level::WARN => 4,
            Level::INFO => 6,
            _ => 7,
        }
    }

    pub fn priority(level: &Level) -> u8 {
        FACILITY * 8 + severity(level)
    }

    #[derive(Clone)]
    pub struct Syslog {
        socket: Arc<UnixDatagram>,
        ident: String,
    }

    impl Syslog {
        pub fn connect(ident: &str) -> io::Result<Self> {
            let socket = UnixDatagram::unbound()?;
            socket.connect("/dev/log")?;
            Ok(Self::with_socket(socket, ident))
        }

        pub fn with_socket(socket: UnixDatagram, ident: &str) -> Self {
            Self {
                socket: Arc::new(socket),
                ident: ident.to_string(),
            }
        }

        fn record(&self, level: &Level) -> Record {
            Record {
                socket: self.socket.clone(),
                header: format!(
                    "<{}>{}[{}]: ",
                    priority(level),
                    self.ident,
                    std::process::id()
                ),
                buf: Vec::new(),
            }
        }
    }

    impl<'a> MakeWriter<'a> for Syslog {
        type Writer = Record;

        fn make_writer(&'a self) -> Self::Writer {
            self.record(&Level::INFO)
        }

        fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
            self.record(meta.level())
        }
    }

    /// One syslog message, sent when dropped.
    pub struct Record {
        socket: Arc<UnixDatagram>,
        header: String,
        buf: Vec<u8>,
    }

    impl Write for Record {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.buf.extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for Record {
        fn drop(&mut self) {
            let body = String::from_utf8_lossy(&self.buf);
            let body = body.trim_end();
            if body.is_empty() {
                return;
            }
            let message = format!("{}{}", self.header, body);
            // nowhere left to report a failure
            let _ = self.socket.send(message.as_bytes());
        }
    }

}
