//! Shoutcast content-type sniffer
//!
//! Some Shoutcast servers omit the HTTP `Content-Type` header and instead
//! prepend an HTTP-like header block (`Content-Type: audio/mpeg\r\n\r\n`)
//! to the body. When the file type had to be defaulted, the engine runs the
//! leading chunks through this sniffer and reopens the parser with the
//! corrected type on a match.

/// Result of feeding one chunk through the sniffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffResult {
    /// Inline `Content-Type` value, if one was found in this chunk
    pub content_type: Option<String>,
    /// True once sniffing is over (terminator reached, or the leading
    /// chunk does not look like a header block)
    pub finished: bool,
}

/// Incremental scanner for an inline header block ahead of audio frames.
///
/// Scans complete `\r\n`-terminated lines, splitting each at the first `:`
/// and matching the key case-insensitively. An empty line (the `\r\n\r\n`
/// terminator) ends sniffing. A first chunk containing neither a
/// `Content-Type` line nor a terminator is taken to be plain audio data
/// and ends sniffing immediately.
pub struct ShoutcastSniffer {
    buffer: Vec<u8>,
    scanned: usize,
    first_chunk: bool,
    finished: bool,
}

impl Default for ShoutcastSniffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ShoutcastSniffer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            first_chunk: true,
            finished: false,
        }
    }

    /// Whether sniffing is over
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Feed one chunk of body bytes.
    pub fn sniff(&mut self, chunk: &[u8]) -> SniffResult {
        if self.finished {
            return SniffResult {
                content_type: None,
                finished: true,
            };
        }

        self.buffer.extend_from_slice(chunk);

        let mut content_type = None;
        while let Some(pos) = find_crlf(&self.buffer[self.scanned..]) {
            let line = &self.buffer[self.scanned..self.scanned + pos];
            self.scanned += pos + 2;

            if line.is_empty() {
                // \r\n\r\n terminator
                self.finished = true;
                break;
            }

            if let Some(value) = header_value(line, "content-type") {
                content_type = Some(value);
            }
        }

        // A leading chunk with no recognizable header content is audio data
        if self.first_chunk && !self.finished && content_type.is_none() {
            self.finished = true;
        }
        self.first_chunk = false;

        SniffResult {
            content_type,
            finished: self.finished,
        }
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Split a header line at the first `:` and return the value when the key
/// matches case-insensitively.
fn header_value(line: &[u8], key: &str) -> Option<String> {
    let text = std::str::from_utf8(line).ok()?;
    let (name, value) = text.split_once(':')?;
    if name.trim().eq_ignore_ascii_case(key) {
        Some(value.trim().to_string())
    } else {
        None
    }
}
