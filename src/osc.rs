//! OSC message codec.
//!
//! Only the argument types the server exchanges are supported: `s`, `i`, `f`
//! and `b`. Bundles are read one level deep; anything nested further is
//! skipped.

use crate::error::OscError;

const BUNDLE_TAG: &str = "#bundle";

#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int(i32),
    Float(f32),
    String(String),
    Blob(Vec<u8>),
}

impl OscArg {
    fn tag(&self) -> char {
        match self {
            OscArg::Int(_) => 'i',
            OscArg::Float(_) => 'f',
            OscArg::String(_) => 's',
            OscArg::Blob(_) => 'b',
        }
    }

    /// Text content of a string or blob argument.
    pub fn as_text(&self) -> Option<String> {
        match self {
            OscArg::String(s) => Some(s.clone()),
            OscArg::Blob(bytes) => String::from_utf8(bytes.clone()).ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: OscArg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_message(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OscPacket {
    Message(OscMessage),
    Bundle(Vec<OscMessage>),
}

impl OscPacket {
    pub fn into_messages(self) -> Vec<OscMessage> {
        match self {
            OscPacket::Message(message) => vec![message],
            OscPacket::Bundle(messages) => messages,
        }
    }
}

/// Length of a string field once null-terminated and padded to 4 bytes.
pub fn padded_len(content_len: usize) -> usize {
    (content_len + 4) & !3
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    let pad = padded_len(s.len()) - s.len();
    buf.extend(std::iter::repeat_n(0u8, pad));
}

fn write_blob(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
    let pad = (4 - bytes.len() % 4) % 4;
    buf.extend(std::iter::repeat_n(0u8, pad));
}

pub fn encode_message(message: &OscMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    write_string(&mut buf, &message.address);

    let mut tags = String::with_capacity(message.args.len() + 1);
    tags.push(',');
    tags.extend(message.args.iter().map(OscArg::tag));
    write_string(&mut buf, &tags);

    for arg in &message.args {
        match arg {
            OscArg::Int(v) => buf.extend_from_slice(&v.to_be_bytes()),
            OscArg::Float(v) => buf.extend_from_slice(&v.to_be_bytes()),
            OscArg::String(s) => write_string(&mut buf, s),
            OscArg::Blob(bytes) => write_blob(&mut buf, bytes),
        }
    }
    buf
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], OscError> {
        if self.remaining() < n {
            return Err(OscError::UnexpectedEnd(what));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn word(&mut self, what: &'static str) -> Result<[u8; 4], OscError> {
        let mut word = [0u8; 4];
        word.copy_from_slice(self.take(4, what)?);
        Ok(word)
    }

    fn string(&mut self) -> Result<String, OscError> {
        let rest = &self.bytes[self.pos..];
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(OscError::MissingTerminator)?;
        let text = std::str::from_utf8(&rest[..len])
            .map_err(|_| OscError::InvalidUtf8)?
            .to_string();
        self.take(padded_len(len), "string padding")?;
        Ok(text)
    }

    fn blob(&mut self) -> Result<Vec<u8>, OscError> {
        let len = u32::from_be_bytes(self.word("blob size")?) as usize;
        let bytes = self.take(len, "blob")?.to_vec();
        self.take((4 - len % 4) % 4, "blob padding")?;
        Ok(bytes)
    }
}

pub fn decode_message(bytes: &[u8]) -> Result<OscMessage, OscError> {
    let mut reader = Reader::new(bytes);
    let address = reader.string()?;
    if !address.starts_with('/') {
        return Err(OscError::InvalidAddress(address));
    }

    // Packets without a type tag string carry no arguments.
    if reader.remaining() == 0 || reader.bytes[reader.pos] != b',' {
        return Ok(OscMessage { address, args: Vec::new() });
    }
    let tags = reader.string()?;

    let mut args = Vec::with_capacity(tags.len() - 1);
    for tag in tags.chars().skip(1) {
        let arg = match tag {
            'i' => OscArg::Int(i32::from_be_bytes(reader.word("int")?)),
            'f' => OscArg::Float(f32::from_be_bytes(reader.word("float")?)),
            's' => OscArg::String(reader.string()?),
            'b' => OscArg::Blob(reader.blob()?),
            other => {
                log::trace!("Skipping unsupported OSC type tag '{}'", other);
                continue;
            }
        };
        args.push(arg);
    }
    Ok(OscMessage { address, args })
}

fn decode_bundle(bytes: &[u8]) -> Result<Vec<OscMessage>, OscError> {
    let mut reader = Reader::new(bytes);
    reader.string()?;
    reader.take(8, "bundle timetag")?;

    let mut messages = Vec::new();
    while reader.remaining() >= 4 {
        let size = i32::from_be_bytes(reader.word("bundle element size")?);
        if size <= 0 || size as usize > reader.remaining() {
            log::warn!("Bundle element size {} is malformed, stopping", size);
            break;
        }
        let element = reader.take(size as usize, "bundle element")?;
        if element.starts_with(BUNDLE_TAG.as_bytes()) {
            log::warn!("Skipping nested OSC bundle");
            continue;
        }
        match decode_message(element) {
            Ok(message) => messages.push(message),
            Err(e) => log::warn!("Skipping malformed bundle element: {}", e),
        }
    }
    Ok(messages)
}

pub fn decode_packet(bytes: &[u8]) -> Result<OscPacket, OscError> {
    let is_bundle = bytes.len() >= 8 && &bytes[..8] == b"#bundle\0";
    if is_bundle {
        decode_bundle(bytes).map(OscPacket::Bundle)
    } else {
        decode_message(bytes).map(OscPacket::Message)
    }
}
