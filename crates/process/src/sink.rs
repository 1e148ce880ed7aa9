//! Destinations for lines read from supervised processes

use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use tracing::info;

/// Which standard stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Receives every line of every supervised process
///
/// Called concurrently from the drain tasks of all live processes. Lines
/// of one stream of one process arrive in order.
pub trait OutputSink: Send + Sync {
    /// Handle one line, without its trailing newline
    fn line(&self, label: &str, stream: StreamKind, line: &str);
}

/// Shared sink handle
pub type SinkHandle = Arc<dyn OutputSink>;

/// Forwards lines unmodified to the launcher's own stdout/stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioSink;

impl OutputSink for StdioSink {
    fn line(&self, _label: &str, stream: StreamKind, line: &str) {
        // A closed launcher stdout must not stop the drain
        let _ = match stream {
            StreamKind::Stdout => writeln!(std::io::stdout().lock(), "{}", line),
            StreamKind::Stderr => writeln!(std::io::stderr().lock(), "{}", line),
        };
    }
}

/// Emits lines as structured tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn line(&self, label: &str, stream: StreamKind, line: &str) {
        info!(target: "user_script", process = %label, stream = %stream, "{}", line);
    }
}

/// One line retained by a [`MemorySink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedLine {
    pub label: String,
    pub stream: StreamKind,
    pub line: String,
}

/// Keeps every line in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<CapturedLine>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all captured lines, in arrival order
    pub fn lines(&self) -> Vec<CapturedLine> {
        self.lines.lock().clone()
    }

    /// Lines of one stream of one process
    pub fn stream(&self, label: &str, stream: StreamKind) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|l| l.label == label && l.stream == stream)
            .map(|l| l.line.clone())
            .collect()
    }

    /// Number of captured lines
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

impl OutputSink for MemorySink {
    fn line(&self, label: &str, stream: StreamKind, line: &str) {
        self.lines.lock().push(CapturedLine {
            label: label.to_string(),
            stream,
            line: line.to_string(),
        });
    }
}
