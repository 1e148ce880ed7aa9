//! Bounded line splitting of process output

/// Splits a byte stream into lines of at most `max_line_bytes` bytes
///
/// `\n`, `\r` and `\r\n` each end a line, so carriage-return progress
/// updates come out as separate lines. Bytes past the limit are dropped
/// up to the next line break.
#[derive(Debug)]
pub struct LineSplitter {
    max_line_bytes: usize,
    line: Vec<u8>,
    truncated: bool,
    after_cr: bool,
}

impl LineSplitter {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            line: Vec::with_capacity(max_line_bytes.min(1024)),
            truncated: false,
            after_cr: false,
        }
    }

    /// Feed one chunk, calling `emit` with every line it completes
    pub fn push<F>(&mut self, chunk: &[u8], mut emit: F)
    where
        F: FnMut(&[u8], bool),
    {
        let mut rest = chunk;
        while !rest.is_empty() {
            if self.after_cr {
                self.after_cr = false;
                if rest[0] == b'\n' {
                    rest = &rest[1..];
                    continue;
                }
            }
            match rest.iter().position(|&b| b == b'\n' || b == b'\r') {
                Some(i) => {
                    self.append(&rest[..i]);
                    self.after_cr = rest[i] == b'\r';
                    self.end_line(&mut emit);
                    rest = &rest[i + 1..];
                }
                None => {
                    self.append(rest);
                    break;
                }
            }
        }
    }

    /// Emit the unterminated last line, if any
    pub fn finish<F>(&mut self, mut emit: F)
    where
        F: FnMut(&[u8], bool),
    {
        if !self.line.is_empty() || self.truncated {
            self.end_line(&mut emit);
        }
    }

    fn append(&mut self, bytes: &[u8]) {
        let room = self.max_line_bytes.saturating_sub(self.line.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.line.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn end_line<F>(&mut self, emit: &mut F)
    where
        F: FnMut(&[u8], bool),
    {
        emit(&self.line, self.truncated);
        self.line.clear();
        self.truncated = false;
    }
}
