//! Message framing for byte-stream transports.
//!
//! Two on-wire conventions are supported:
//!
//! ```text
//! newline:         {"jsonrpc":"2.0",...}\n
//! content-length:  Content-Length: <n>\r\n\r\n{"jsonrpc":"2.0",...}
//! ```
//!
//! [`FrameDecoder`] reassembles complete messages out of arbitrarily
//! fragmented reads. Completed frames are evicted from the buffer as soon as
//! they are emitted, so the buffer only ever holds undelivered bytes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest frame accepted by default (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Largest header block accepted in content-length mode.
const MAX_HEADER_LEN: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Framing convention for a byte-stream transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// One JSON document per line.
    #[default]
    Newline,
    /// `Content-Length` header block followed by the JSON body.
    ContentLength,
}

impl Framing {
    /// Encode a message into the bytes to write.
    pub fn encode(&self, message: &str) -> Vec<u8> {
        match self {
            Self::Newline => {
                let mut out = Vec::with_capacity(message.len() + 1);
                out.extend_from_slice(message.as_bytes());
                out.push(b'\n');
                out
            }
            Self::ContentLength => {
                let header = format!("Content-Length: {}\r\n\r\n", message.len());
                let mut out = Vec::with_capacity(header.len() + message.len());
                out.extend_from_slice(header.as_bytes());
                out.extend_from_slice(message.as_bytes());
                out
            }
        }
    }

    /// Create a decoder for this framing.
    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(*self)
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Newline => write!(f, "newline"),
            Self::ContentLength => write!(f, "content-length"),
        }
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "newline" | "ndjson" | "line" => Ok(Self::Newline),
            "content-length" | "content_length" | "lsp" => Ok(Self::ContentLength),
            other => Err(format!("unknown framing '{other}'")),
        }
    }
}

/// A single frame could not be extracted.
///
/// Frame errors never poison the decoder: the offending bytes are dropped and
/// decoding resumes with the next frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The frame body is not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// The content-length header block is malformed.
    #[error("invalid frame header: {0}")]
    InvalidHeader(String),

    /// The frame exceeds the configured maximum size.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge {
        /// Observed (or declared) frame length.
        len: usize,
        /// Configured limit.
        max: usize,
    },
}

/// Bytes that must be thrown away before decoding can resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discard {
    Nothing,
    Bytes(usize),
    UntilNewline,
}

/// Incremental decoder turning a fragmented byte stream into messages.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    buffer: Vec<u8>,
    max_frame_len: usize,
    discard: Discard,
    /// Prefix of `buffer` already searched for a newline.
    scanned: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default frame limit.
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            discard: Discard::Nothing,
            scanned: 0,
        }
    }

    /// Set the maximum accepted frame length.
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// The framing this decoder understands.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Number of undelivered bytes currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Feed bytes and return every message completed by them, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<String, FrameError>> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    fn next_frame(&mut self) -> Option<Result<String, FrameError>> {
        match self.framing {
            Framing::Newline => self.next_line(),
            Framing::ContentLength => self.next_block(),
        }
    }

    fn next_line(&mut self) -> Option<Result<String, FrameError>> {
        loop {
            let found = self.buffer[self.scanned..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|offset| self.scanned + offset);

            let Some(pos) = found else {
                if self.discard == Discard::UntilNewline {
                    self.buffer.clear();
                    self.scanned = 0;
                    return None;
                }
                self.scanned = self.buffer.len();
                if self.buffer.len() > self.max_frame_len {
                    let len = self.buffer.len();
                    self.buffer.clear();
                    self.scanned = 0;
                    self.discard = Discard::UntilNewline;
                    return Some(Err(FrameError::TooLarge {
                        len,
                        max: self.max_frame_len,
                    }));
                }
                return None;
            };

            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.scanned = 0;
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if self.discard == Discard::UntilNewline {
                // Tail of an oversize line that was already reported.
                self.discard = Discard::Nothing;
                continue;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if line.len() > self.max_frame_len {
                return Some(Err(FrameError::TooLarge {
                    len: line.len(),
                    max: self.max_frame_len,
                }));
            }
            return Some(String::from_utf8(line).map_err(|_| FrameError::InvalidUtf8));
        }
    }

    fn next_block(&mut self) -> Option<Result<String, FrameError>> {
        if let Discard::Bytes(remaining) = self.discard {
            let n = remaining.min(self.buffer.len());
            self.buffer.drain(..n);
            if remaining > n {
                self.discard = Discard::Bytes(remaining - n);
                return None;
            }
            self.discard = Discard::Nothing;
        }

        // Tolerate stray line breaks between frames.
        let leading = self
            .buffer
            .iter()
            .take_while(|&&b| b == b'\r' || b == b'\n')
            .count();
        if leading > 0 {
            self.buffer.drain(..leading);
        }

        let Some(header_end) = find(&self.buffer, HEADER_TERMINATOR) else {
            if self.buffer.len() > MAX_HEADER_LEN {
                self.buffer.clear();
                return Some(Err(FrameError::InvalidHeader(
                    "header block too long".to_string(),
                )));
            }
            return None;
        };
        let body_start = header_end + HEADER_TERMINATOR.len();

        let declared = match parse_content_length(&self.buffer[..header_end]) {
            Ok(len) => len,
            Err(err) => {
                self.buffer.drain(..body_start);
                return Some(Err(err));
            }
        };

        if declared > self.max_frame_len {
            self.buffer.drain(..body_start);
            let n = declared.min(self.buffer.len());
            self.buffer.drain(..n);
            if declared > n {
                self.discard = Discard::Bytes(declared - n);
            }
            return Some(Err(FrameError::TooLarge {
                len: declared,
                max: self.max_frame_len,
            }));
        }

        if self.buffer.len() < body_start + declared {
            return None;
        }

        let frame: Vec<u8> = self.buffer.drain(..body_start + declared).collect();
        Some(String::from_utf8(frame[body_start..].to_vec()).map_err(|_| FrameError::InvalidUtf8))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_content_length(header: &[u8]) -> Result<usize, FrameError> {
    let header = std::str::from_utf8(header)
        .map_err(|_| FrameError::InvalidHeader("header is not UTF-8".to_string()))?;

    let mut length = None;
    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            return Err(FrameError::InvalidHeader(format!("malformed line '{line}'")));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let parsed = value.trim().parse::<usize>().map_err(|e| {
                FrameError::InvalidHeader(format!("invalid Content-Length '{}': {e}", value.trim()))
            })?;
            length = Some(parsed);
        }
    }

    length.ok_or_else(|| FrameError::InvalidHeader("missing Content-Length".to_string()))
}
