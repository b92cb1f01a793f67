use crate::services::line_buffer::LineBuffer;
use regex::Regex;
use serde::Serialize;

/// Upper bound on an unterminated stdout line kept in memory by the relay
pub const MAX_PENDING_LINE_BYTES: usize = 64 * 1024;

/// One progress notification from a running worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Completion percentage in `0.0..=100.0`
    pub progress: f64,
    pub message: String,
}

/// Recognises `PROGRESS <pct>[%] [message]` lines
#[derive(Debug, Clone)]
pub struct ProgressParser {
    pattern: Regex,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(r"^\s*PROGRESS\s+(?P<pct>\d+(?:\.\d+)?)%?(?:\s+(?P<msg>.*?))?\s*$")
                .expect("Invalid progress regex"),
        }
    }

    /// Parse a single line; `None` for anything that is not a progress report
    pub fn parse(&self, line: &str) -> Option<ProgressEvent> {
        let caps = self.pattern.captures(line)?;
        let progress: f64 = caps.name("pct")?.as_str().parse().ok()?;
        if !(0.0..=100.0).contains(&progress) {
            return None;
        }

        Some(ProgressEvent {
            progress,
            message: caps
                .name("msg")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        })
    }

    pub fn is_progress_line(&self, line: &str) -> bool {
        self.parse(line).is_some()
    }
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns raw worker stdout into ordered [`ProgressEvent`]s.
///
/// Lines that are not progress reports are dropped here; they remain part of
/// the buffered stdout delivered with the exit outcome. Once closed the relay
/// yields nothing, whatever it is fed.
#[derive(Debug)]
pub struct ProgressRelay {
    lines: LineBuffer,
    parser: ProgressParser,
    closed: bool,
}

impl ProgressRelay {
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::new(Some(MAX_PENDING_LINE_BYTES)),
            parser: ProgressParser::new(),
            closed: false,
        }
    }

    /// Feed one stdout chunk; returns the events completed by it, in order
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<ProgressEvent> {
        if self.closed {
            return Vec::new();
        }

        let lines = self.lines.push(chunk);
        let events = self.collect(lines);

        let overflowed = self.lines.consume_overflowed_bytes();
        if overflowed > 0 {
            tracing::debug!("Dropped {} bytes of an overlong worker output line", overflowed);
        }

        events
    }

    /// Flush a final unterminated line, then close
    pub fn finish(&mut self) -> Vec<ProgressEvent> {
        if self.closed {
            return Vec::new();
        }

        let tail = self.lines.flush();
        self.closed = true;
        self.collect(tail)
    }

    /// Stop emitting immediately; anything still buffered is discarded
    pub fn close(&mut self) {
        self.closed = true;
        let _ = self.lines.flush();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn collect(&self, lines: impl IntoIterator<Item = String>) -> Vec<ProgressEvent> {
        lines
            .into_iter()
            .filter_map(|line| self.parser.parse(&line))
            .collect()
    }
}

impl Default for ProgressRelay {
    fn default() -> Self {
        Self::new()
    }
}
