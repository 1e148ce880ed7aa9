//! Bounded stderr ring buffer

use std::collections::VecDeque;

/// The last stderr lines of one process, bounded in lines and in bytes
#[derive(Debug, Clone)]
pub struct StderrTail {
    lines: VecDeque<String>,
    capacity: usize,
    max_bytes: usize,
    bytes: usize,
    total: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            max_bytes: usize::MAX,
            bytes: 0,
            total: 0,
        }
    }

    /// Also bound the retained text to `max_bytes`
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Append a line, evicting the oldest ones when full
    ///
    /// A single line longer than the byte bound keeps only its end.
    pub fn push(&mut self, line: impl Into<String>) {
        self.total += 1;
        if self.capacity == 0 || self.max_bytes == 0 {
            return;
        }
        let mut line = line.into();
        if line.len() > self.max_bytes {
            let mut cut = line.len() - self.max_bytes;
            while !line.is_char_boundary(cut) {
                cut += 1;
            }
            line.drain(..cut);
        }

        if self.lines.len() == self.capacity {
            self.pop_front();
        }
        // Each retained line is counted with its separator, one more byte
        // than the joined message
        let budget = self.max_bytes.saturating_add(1);
        while !self.lines.is_empty() && self.bytes + line.len() + 1 > budget {
            self.pop_front();
        }
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
    }

    fn pop_front(&mut self) {
        if let Some(evicted) = self.lines.pop_front() {
            self.bytes -= evicted.len() + 1;
        }
    }

    /// Retained lines, oldest first
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines seen over the lifetime of the process, retained or not
    pub fn total_lines(&self) -> usize {
        self.total
    }

    /// Retained lines joined with newlines
    pub fn to_message(&self) -> String {
        self.lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// First signature (in configuration order) contained in the tail
    pub fn find_signature<'a>(&self, signatures: &'a [String]) -> Option<&'a str> {
        signatures
            .iter()
            .filter(|s| !s.is_empty())
            .find(|s| self.lines.iter().any(|l| l.contains(s.as_str())))
            .map(String::as_str)
    }
}
