//! KISS framing: byte-stuffed frames between host and TNC.
//!
//! Only command 0 (data) is surfaced; TNC parameter frames on other commands
//! are consumed and dropped. The decoder is incremental so it can sit
//! directly on a TCP byte stream.

use crate::error::FramingError;

pub const FEND: u8 = 0xC0;
pub const FESC: u8 = 0xDB;
pub const TFEND: u8 = 0xDC;
pub const TFESC: u8 = 0xDD;

/// KISS data-frame command nibble.
const CMD_DATA: u8 = 0x00;

/// Encode one data frame for the given KISS port.
///
/// Layout: FEND, command byte `(port << 4) | 0`, stuffed payload, FEND.
pub fn encode(port: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(FEND);
    stuff_byte(&mut out, (port & 0x0F) << 4 | CMD_DATA);
    for &b in payload {
        stuff_byte(&mut out, b);
    }
    out.push(FEND);
    out
}

fn stuff_byte(out: &mut Vec<u8>, b: u8) {
    match b {
        FEND => out.extend_from_slice(&[FESC, TFEND]),
        FESC => out.extend_from_slice(&[FESC, TFESC]),
        other => out.push(other),
    }
}

/// Incremental KISS decoder.
///
/// Feed raw bytes with [`Decoder::push`]; complete data frames come back as
/// `(port, payload)` pairs. Frames with a malformed escape or a non-data
/// command byte are dropped silently (the counter lives with the caller).
/// Call [`Decoder::finish`] at stream end to detect a truncated frame.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
    in_frame: bool,
    escaped: bool,
    bad_escape: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume bytes, returning every complete data frame they close out.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut frames = Vec::new();
        for &b in bytes {
            if b == FEND {
                if self.in_frame {
                    if let Some(frame) = self.take_frame() {
                        frames.push(frame);
                    }
                }
                // Consecutive FENDs delimit empty frames; just stay armed.
                self.in_frame = true;
                continue;
            }
            if !self.in_frame {
                // Noise before the first FEND (stale bytes on reconnect).
                continue;
            }
            if self.escaped {
                self.escaped = false;
                match b {
                    TFEND => self.buf.push(FEND),
                    TFESC => self.buf.push(FESC),
                    _ => self.bad_escape = true,
                }
            } else if b == FESC {
                self.escaped = true;
            } else {
                self.buf.push(b);
            }
        }
        frames
    }

    fn take_frame(&mut self) -> Option<(u8, Vec<u8>)> {
        let bad = std::mem::take(&mut self.bad_escape);
        self.escaped = false;
        let content = std::mem::take(&mut self.buf);

        if bad || content.is_empty() {
            return None;
        }
        let cmd_byte = content[0];
        if cmd_byte & 0x0F != CMD_DATA {
            return None;
        }
        let port = cmd_byte >> 4;
        Some((port, content[1..].to_vec()))
    }

    /// Signal end-of-stream. Errors if bytes were buffered mid-frame.
    pub fn finish(&self) -> Result<(), FramingError> {
        if self.in_frame && (!self.buf.is_empty() || self.escaped) {
            return Err(FramingError::KissTruncated);
        }
        Ok(())
    }

    /// Drop any partial frame state. Used when the TNC connection is
    /// re-established and the stream position is unknown.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.in_frame = false;
        self.escaped = false;
        self.bad_escape = false;
    }
}
