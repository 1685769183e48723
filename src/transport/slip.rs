//! SLIP (RFC 1055) framing for the stream transport.

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Wraps a payload in END delimiters, escaping END and ESC bytes.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(END);
    for &byte in payload {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            other => out.push(other),
        }
    }
    out.push(END);
    out
}

/// Byte-at-a-time frame reassembly.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    buffer: Vec<u8>,
    escaped: bool,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte, returning a complete frame when an unescaped END
    /// closes a non-empty buffer.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        if self.escaped {
            self.escaped = false;
            let unescaped = match byte {
                ESC_END => END,
                ESC_ESC => ESC,
                // Protocol violation: keep the byte as-is.
                other => other,
            };
            self.buffer.push(unescaped);
            return None;
        }

        match byte {
            END if self.buffer.is_empty() => None,
            END => Some(std::mem::take(&mut self.buffer)),
            ESC => {
                self.escaped = true;
                None
            }
            other => {
                self.buffer.push(other);
                None
            }
        }
    }
}

/// Reads SLIP frames from a byte stream.
pub struct SlipReader<R> {
    reader: BufReader<R>,
    decoder: SlipDecoder,
}

impl<R: AsyncRead + Unpin> SlipReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            decoder: SlipDecoder::new(),
        }
    }

    /// Next complete frame, or `None` once the stream has ended.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            let byte = match self.reader.read_u8().await {
                Ok(byte) => byte,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            };
            if let Some(frame) = self.decoder.push(byte) {
                return Ok(Some(frame));
            }
        }
    }
}
