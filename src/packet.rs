//! Wire-format packets and payload batches.
//!
//! A packet travels as `<type-digit><body>` in text form. Batches of
//! packets share one HTTP body, joined by the ASCII record separator.
//! Binary data inside a text body is base64-encoded and flagged with a
//! leading `b` in place of the type digit.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;

/// Wire protocol version spoken by this server.
pub const PROTOCOL: u8 = 4;

/// Separator between packets in a text-mode payload body (ASCII RS).
pub const RECORD_SEPARATOR: char = '\x1e';

// ---------------------------------------------------------------------------
// Packet types
// ---------------------------------------------------------------------------

/// The seven packet types with a wire digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    Upgrade,
    Noop,
}

impl PacketType {
    pub(crate) fn to_digit(self) -> char {
        match self {
            Self::Open => '0',
            Self::Close => '1',
            Self::Ping => '2',
            Self::Pong => '3',
            Self::Message => '4',
            Self::Upgrade => '5',
            Self::Noop => '6',
        }
    }

    pub(crate) fn from_digit(c: char) -> Result<Self, ParseError> {
        match c {
            '0' => Ok(Self::Open),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping),
            '3' => Ok(Self::Pong),
            '4' => Ok(Self::Message),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            other => Err(ParseError::UnknownType(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Message => "message",
            Self::Upgrade => "upgrade",
            Self::Noop => "noop",
        }
    }
}

// ---------------------------------------------------------------------------
// Packet data and options
// ---------------------------------------------------------------------------

/// Opaque packet body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PacketData {
    #[default]
    None,
    Text(String),
    Binary(Vec<u8>),
}

impl PacketData {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl From<&str> for PacketData {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for PacketData {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for PacketData {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(b)
    }
}

/// Advisory per-packet options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketOptions {
    /// Hint that the carrying response may be compressed.
    pub compress: bool,
    /// Pre-serialized websocket text frame, written verbatim when present.
    pub ws_pre_encoded: Option<String>,
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketType,
    pub data: PacketData,
    pub options: PacketOptions,
}

impl Packet {
    pub fn new(kind: PacketType, data: impl Into<PacketData>) -> Self {
        Self {
            kind,
            data: data.into(),
            options: PacketOptions::default(),
        }
    }

    pub fn open(handshake_json: String) -> Self {
        Self::new(PacketType::Open, handshake_json)
    }

    pub fn close() -> Self {
        Self::new(PacketType::Close, PacketData::None)
    }

    pub fn ping() -> Self {
        Self::new(PacketType::Ping, PacketData::None)
    }

    pub fn pong(data: impl Into<PacketData>) -> Self {
        Self::new(PacketType::Pong, data)
    }

    pub fn message(data: impl Into<PacketData>) -> Self {
        Self::new(PacketType::Message, data)
    }

    pub fn noop() -> Self {
        Self::new(PacketType::Noop, PacketData::None)
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.options.compress = compress;
        self
    }

    /// Encode into the text wire form.
    pub fn encode_text(&self) -> String {
        match &self.data {
            PacketData::Binary(bytes) => {
                let mut out = String::with_capacity(1 + (bytes.len() * 4 / 3) + 4);
                out.push('b');
                BASE64.encode_string(bytes, &mut out);
                out
            }
            PacketData::Text(text) => {
                let mut out = String::with_capacity(1 + text.len());
                out.push(self.kind.to_digit());
                out.push_str(text);
                out
            }
            PacketData::None => self.kind.to_digit().to_string(),
        }
    }

    /// Decode a single packet from its text wire form.
    pub fn decode_text(raw: &str) -> Result<Self, ParseError> {
        let mut chars = raw.chars();
        let head = chars.next().ok_or(ParseError::Empty)?;
        if head == 'b' {
            let bytes = BASE64
                .decode(chars.as_str())
                .map_err(|_| ParseError::Base64)?;
            return Ok(Self::new(PacketType::Message, bytes));
        }
        let kind = PacketType::from_digit(head)?;
        let rest = chars.as_str();
        let data = if rest.is_empty() {
            PacketData::None
        } else {
            PacketData::Text(rest.to_string())
        };
        Ok(Self {
            kind,
            data,
            options: PacketOptions::default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Payload batches
// ---------------------------------------------------------------------------

/// Encode an ordered batch of packets into one text body.
pub fn encode_payload(packets: &[Packet]) -> String {
    let mut out = String::new();
    for (i, packet) in packets.iter().enumerate() {
        if i > 0 {
            out.push(RECORD_SEPARATOR);
        }
        out.push_str(&packet.encode_text());
    }
    out
}

/// Decode one HTTP body into its ordered batch of packets.
pub fn decode_payload(body: &[u8]) -> Result<Vec<Packet>, ParseError> {
    let text = std::str::from_utf8(body).map_err(|_| ParseError::Utf8)?;
    if text.is_empty() {
        return Err(ParseError::Empty);
    }
    text.split(RECORD_SEPARATOR).map(Packet::decode_text).collect()
}

/// Decode failure. Surfaces to the session as a `"parse error"` close.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown packet type `{0}`")]
    UnknownType(char),
    #[error("empty packet")]
    Empty,
    #[error("invalid base64 payload")]
    Base64,
    #[error("payload is not valid UTF-8")]
    Utf8,
}

// ---------------------------------------------------------------------------
// Handshake body
// ---------------------------------------------------------------------------

/// JSON body of the open packet.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPayload {
    pub sid: String,
    pub upgrades: Vec<&'static str>,
    pub ping_interval: u128,
    pub ping_timeout: u128,
    pub max_payload: usize,
}
