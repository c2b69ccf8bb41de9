//! Child process execution.
//!
//! Build steps stream their output line by line into an [`OutputSink`].
//! stdout and stderr are drained by two concurrent tasks so a child that
//! fills one pipe never blocks on the other; the parent waits for both
//! drains to reach end-of-stream before reporting.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use lamina_common::{LaminaError, LaminaResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Number of trailing output lines kept for error reports.
const TAIL_LINES: usize = 40;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Receives the output of a streamed child, one line at a time.
pub trait OutputSink: Send + Sync {
    /// Called for every complete (or final, unterminated) line.
    fn line(&self, stream: Stream, line: &str);
}

/// Discards all output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn line(&self, _stream: Stream, _line: &str) {}
}

/// A printable command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandLine {
    /// Start a command line for `program`.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append `--flag path`.
    #[must_use]
    pub fn path_arg(self, flag: &str, path: &Path) -> Self {
        self.arg(flag).arg(path.as_os_str())
    }

    /// The program.
    #[must_use]
    pub fn program(&self) -> &OsString {
        &self.program
    }

    /// The arguments.
    #[must_use]
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.kill_on_drop(true);
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Output of a captured child.
#[derive(Debug, Clone)]
pub struct Captured {
    /// Exit status.
    pub status: ExitStatus,
    /// Everything written to stdout.
    pub stdout: String,
    /// Everything written to stderr.
    pub stderr: String,
}

impl Captured {
    /// Whether the child exited successfully.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Convert a failed run into [`LaminaError::Command`].
    ///
    /// # Errors
    ///
    /// Returns an error if the child exited unsuccessfully.
    pub fn check(self, command: &CommandLine) -> LaminaResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(self.into_error(command))
        }
    }

    /// Describe this run as a [`LaminaError::Command`].
    #[must_use]
    pub fn into_error(self, command: &CommandLine) -> LaminaError {
        let mut output = self.status.to_string();
        for text in [&self.stdout, &self.stderr] {
            let text = text.trim_end();
            if !text.is_empty() {
                output.push('\n');
                output.push_str(text);
            }
        }
        LaminaError::Command {
            command: command.to_string(),
            output,
        }
    }
}

fn spawn_error(command: &CommandLine, err: &std::io::Error) -> LaminaError {
    LaminaError::Command {
        command: command.to_string(),
        output: format!("failed to execute: {err}"),
    }
}

/// Run a child to completion and capture its output.
///
/// A non-zero exit is not an error here; see [`Captured::check`].
///
/// # Errors
///
/// Returns an error if the child cannot be spawned.
pub async fn run_captured(command: &CommandLine) -> LaminaResult<Captured> {
    tracing::debug!(command = %command, "Running command");

    let output = command
        .to_command()
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| spawn_error(command, &e))?;

    Ok(Captured {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

async fn drain<R>(reader: R, stream: Stream, sink: Arc<dyn OutputSink>) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut tail = VecDeque::with_capacity(TAIL_LINES);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                sink.line(stream, line);
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
            }
            Err(e) => {
                tracing::warn!(error = %e, ?stream, "Failed to read child output");
                break;
            }
        }
    }

    tail
}

/// Run a child, streaming its output into `sink`.
///
/// # Errors
///
/// Returns [`LaminaError::Command`] with the tail of the output if the
/// child cannot be spawned or exits unsuccessfully.
pub async fn run_streamed(command: &CommandLine, sink: Arc<dyn OutputSink>) -> LaminaResult<()> {
    tracing::debug!(command = %command, "Running command");

    let mut child = command
        .to_command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(command, &e))?;

    let stdout = child.stdout.take().map(|out| {
        tokio::spawn(drain(out, Stream::Stdout, Arc::clone(&sink)))
    });
    let stderr = child.stderr.take().map(|err| {
        tokio::spawn(drain(err, Stream::Stderr, Arc::clone(&sink)))
    });

    let status = child.wait().await?;

    let mut tail = Vec::new();
    for handle in [stdout, stderr].into_iter().flatten() {
        match handle.await {
            Ok(lines) => tail.extend(lines),
            Err(e) => tracing::warn!(error = %e, "Output drain task failed"),
        }
    }

    if status.success() {
        Ok(())
    } else {
        let mut output = status.to_string();
        for line in tail {
            output.push('\n');
            output.push_str(&line);
        }
        Err(LaminaError::Command {
            command: command.to_string(),
            output,
        })
    }
}
