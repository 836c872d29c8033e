//! Subprocess execution.
//!
//! Every external program bupcron drives (bup, git, ssh, du, the LVM tools)
//! goes through a [`CommandRunner`], so the whole run can be replayed in tests
//! with canned exit codes.

use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// A program invocation: argv, extra environment and optional stdin payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    /// Keep stdout in [`CommandOutput::stdout`]; otherwise it is only logged.
    pub capture: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            capture: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the command to completion. A non-zero exit is not an error here;
    /// only failing to start or talk to the process is.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Runs the command and reports whether it exited successfully, logging
    /// the failure otherwise.
    async fn check(&self, spec: &CommandSpec) -> bool {
        match self.run(spec).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                warn!(command = %spec, code = ?output.code, "command failed");
                false
            }
            Err(e) => {
                warn!(command = %spec, error = %e, "command failed");
                false
            }
        }
    }

    /// Runs the command and returns its stdout, turning a non-zero exit into an error.
    async fn output(&self, spec: &CommandSpec) -> Result<String> {
        let captured = spec.clone().capture();
        let output = self.run(&captured).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(Error::UnexpectedOutput {
                program: spec.program.clone(),
                message: format!(
                    "`{}` exited with {:?}: {}",
                    spec,
                    output.code,
                    output.stderr.trim()
                ),
            })
        }
    }
}

/// Lines of stderr kept for error messages; the rest is only logged.
const STDERR_TAIL: usize = 50;

/// Runs commands as real child processes.
///
/// Output is logged line by line as it arrives: stdout and stderr at debug
/// level (visible with `-vv`), and the stderr tail again at warn level when
/// the command failed. Stdout is kept only for captured commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

/// Reads `pipe` until EOF, handing each line (with its newline) to `each`.
/// Invalid UTF-8 is replaced rather than treated as an error.
async fn for_each_line<R, F>(pipe: Option<R>, mut each: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let Some(pipe) = pipe else {
        return Ok(());
    };
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        each(&String::from_utf8_lossy(&buf));
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!("calling command `{}`", spec);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let program = spec.program.as_str();
        let stdin = child.stdin.take();
        let mut stdout = String::new();
        let mut stderr = VecDeque::with_capacity(STDERR_TAIL);

        let write_stdin = async {
            if let (Some(input), Some(mut pipe)) = (&spec.stdin, stdin) {
                pipe.write_all(input).await?;
                // dropping the pipe closes it
            }
            Ok::<_, std::io::Error>(())
        };
        let read_stdout = for_each_line(child.stdout.take(), |line| {
            debug!(program = %program, "{}", line.trim_end());
            if spec.capture {
                stdout.push_str(line);
            }
        });
        let read_stderr = for_each_line(child.stderr.take(), |line| {
            let line = line.trim_end();
            debug!(program = %program, "{}", line);
            if stderr.len() == STDERR_TAIL {
                stderr.pop_front();
            }
            stderr.push_back(line.to_string());
        });
        tokio::try_join!(write_stdin, read_stdout, read_stderr)?;

        let status = child.wait().await?;
        let result = CommandOutput {
            code: status.code(),
            stdout,
            stderr: stderr.into_iter().collect::<Vec<_>>().join("\n"),
        };

        if !result.success() {
            for line in result.stderr.lines() {
                warn!(program = %program, "{}", line);
            }
        }

        Ok(result)
    }
}

/// Quotes `arg` for display or for a remote shell when it contains
/// characters the shell would interpret.
pub fn quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Joins an argv into one shell command line, e.g. for `ssh HOST <line>`.
pub fn shell_line<I, S>(argv: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    argv.into_iter()
        .map(|a| quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(any(test, feature = "testing"))]
pub use scripted::ScriptedRunner;

#[cfg(any(test, feature = "testing"))]
mod scripted {
    use super::*;
    use std::sync::Mutex;

    /// Records every invocation and answers from canned responses.
    ///
    /// A response applies to commands whose display form starts with the
    /// registered prefix; the most recently registered match wins. Anything
    /// unmatched succeeds with empty output.
    #[derive(Debug, Default)]
    pub struct ScriptedRunner {
        calls: Mutex<Vec<CommandSpec>>,
        responses: Mutex<Vec<(String, CommandOutput)>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, prefix: &str, output: CommandOutput) -> &Self {
            self.responses
                .lock()
                .unwrap()
                .push((prefix.to_string(), output));
            self
        }

        pub fn fail(&self, prefix: &str, code: i32) -> &Self {
            self.respond(prefix, CommandOutput::failed(code))
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        /// Display form of every recorded invocation, in order.
        pub fn commands(&self) -> Vec<String> {
            self.calls().iter().map(|c| c.to_string()).collect()
        }

        pub fn position(&self, prefix: &str) -> Option<usize> {
            self.commands().iter().position(|c| c.starts_with(prefix))
        }

        pub fn count(&self, prefix: &str) -> usize {
            self.commands()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            let line = spec.to_string();
            let responses = self.responses.lock().unwrap();
            Ok(responses
                .iter()
                .rev()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, output)| output.clone())
                .unwrap_or_else(|| CommandOutput::ok("")))
        }
    }
}
