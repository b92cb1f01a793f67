/// Incremental line splitter for raw process output.
///
/// Works on bytes so multi-byte UTF-8 sequences split across reads are only
/// decoded once the whole line has arrived. `\n`, `\r\n` and a lone `\r` all
/// terminate a line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    max_buffer_bytes: Option<usize>,
    overflowed_bytes: usize,
}

impl LineBuffer {
    pub fn new(max_buffer_bytes: Option<usize>) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer_bytes,
            overflowed_bytes: 0,
        }
    }

    /// Append a chunk and return every line it completed, in order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        loop {
            let Some(idx) = self.buffer.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                break;
            };

            // A trailing '\r' may be the first half of "\r\n"; wait for more input
            if self.buffer[idx] == b'\r' && idx + 1 == self.buffer.len() {
                break;
            }

            let line = String::from_utf8_lossy(&self.buffer[..idx]).into_owned();
            let mut advance = 1;
            if self.buffer[idx] == b'\r' && self.buffer.get(idx + 1) == Some(&b'\n') {
                advance = 2;
            }
            self.buffer.drain(..idx + advance);
            lines.push(line);
        }

        if let Some(max) = self.max_buffer_bytes {
            if self.buffer.len() > max {
                let excess = self.buffer.len() - max;
                self.buffer.drain(..excess);
                self.overflowed_bytes = self.overflowed_bytes.saturating_add(excess);
            }
        }

        lines
    }

    pub fn consume_overflowed_bytes(&mut self) -> usize {
        std::mem::take(&mut self.overflowed_bytes)
    }

    /// Take whatever is left as a final, unterminated line
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.strip_suffix(b"\r").unwrap_or(&rest);
        if rest.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(rest).into_owned())
        }
    }
}
