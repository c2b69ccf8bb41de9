//! Nested build output.
//!
//! A build prints a `# STEP` header per instruction; everything a step
//! runs is indented one tab per nesting level:
//!
//! ```text
//! # RUN (pacman) (-Syu)
//! systemd-nspawn (-M) (web) (pacman) (-Syu)...
//!     :: Synchronizing package databases...
//! ```
//!
//! This is user-facing output and separate from `tracing` logs.

use std::sync::{Arc, Mutex, PoisonError};

use console::{Term, style};
use lamina_host::process::{OutputSink, Stream};

/// What a line is, for styling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Step header.
    Header,
    /// Progress or child stdout.
    Text,
    /// Child stderr.
    Diagnostic,
    /// Something went wrong but the build continues.
    Warning,
}

/// Destination of build output.
pub trait LineWriter: Send + Sync {
    /// Write one already indented line.
    fn write_line(&self, kind: LineKind, line: &str);
}

/// Styled output on the terminal's stderr.
#[derive(Debug, Clone)]
pub struct TermWriter {
    term: Term,
}

impl TermWriter {
    /// Write to stderr.
    #[must_use]
    pub fn stderr() -> Self {
        Self {
            term: Term::stderr(),
        }
    }
}

impl LineWriter for TermWriter {
    fn write_line(&self, kind: LineKind, line: &str) {
        let styled = match kind {
            LineKind::Header => style(line).for_stderr().bold().to_string(),
            LineKind::Text => line.to_string(),
            LineKind::Diagnostic => style(line).for_stderr().dim().to_string(),
            LineKind::Warning => style(line).for_stderr().yellow().to_string(),
        };
        if let Err(e) = self.term.write_line(&styled) {
            tracing::debug!(error = %e, "Cannot write build output");
        }
    }
}

/// Keeps output in memory.
#[derive(Debug, Default)]
pub struct Transcript {
    lines: Mutex<Vec<String>>,
}

impl Transcript {
    /// Everything written so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LineWriter for Transcript {
    fn write_line(&self, _kind: LineKind, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
    }
}

/// A level of build output.
#[derive(Clone)]
pub struct Task {
    out: Arc<dyn LineWriter>,
    depth: usize,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("depth", &self.depth).finish_non_exhaustive()
    }
}

impl Task {
    /// Top-level task writing to `out`.
    #[must_use]
    pub fn new(out: Arc<dyn LineWriter>) -> Self {
        Self { out, depth: 0 }
    }

    /// Top-level task on stderr.
    #[must_use]
    pub fn stderr() -> Self {
        Self::new(Arc::new(TermWriter::stderr()))
    }

    fn write(&self, kind: LineKind, text: &str) {
        let indent = "\t".repeat(self.depth);
        self.out.write_line(kind, &format!("{indent}{text}"));
    }

    /// `# title`, preceded by a blank line.
    pub fn header(&self, title: &str) {
        self.out.write_line(LineKind::Text, "");
        self.write(LineKind::Header, &format!("# {title}"));
    }

    /// A line at this level.
    pub fn print(&self, text: &str) {
        self.write(LineKind::Text, text);
    }

    /// A warning at this level.
    pub fn warn(&self, text: &str) {
        self.write(LineKind::Warning, &format!("Warning: {text}"));
    }

    /// Announce `description` and return a task one level deeper.
    #[must_use]
    pub fn subtask(&self, description: &str) -> Self {
        self.print(&format!("{description}..."));
        Self {
            out: Arc::clone(&self.out),
            depth: self.depth + 1,
        }
    }

    /// This task as a sink for child output.
    #[must_use]
    pub fn sink(&self) -> Arc<dyn OutputSink> {
        Arc::new(self.clone())
    }
}

impl OutputSink for Task {
    fn line(&self, stream: Stream, line: &str) {
        match stream {
            Stream::Stdout => self.write(LineKind::Text, line),
            Stream::Stderr => self.write(LineKind::Diagnostic, line),
        }
    }
}
