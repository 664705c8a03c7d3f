//! Fixed-width frame headers.
//!
//! Every request carries a 40-byte header of five 8-byte ASCII fields, every
//! reply a 24-byte header of three:
//!
//! ```text
//! request:
//! +------------+---------------+-----------+----------+---------+
//! | message id | connection id | target id | function | length  |
//! |  8 bytes   |    8 bytes    |  8 bytes  | 8 bytes  | 8 bytes |
//! +------------+---------------+-----------+----------+---------+
//!
//! reply:
//! +------------+---------+---------+
//! | message id | status  | length  |
//! |  8 bytes   | 8 bytes | 8 bytes |
//! +------------+---------+---------+
//! ```
//!
//! The message id is where the dialects differ. The File dialect sends a
//! rotating tag letter followed by spaces and zero-pads its length field; the
//! JDBC dialect and the HELLO/START control exchanges send a constant 8-byte
//! magic and space-pad the length. The server echoes the message id back, which
//! is how a desynchronized stream is detected.

use crate::error::ProtocolError;
use crate::status::StatusCode;
use crate::MAX_PAYLOAD_SIZE;
use bytes::BufMut;
use std::fmt;

/// Width of every header field.
pub const FIELD_WIDTH: usize = 8;

/// Size of a request header (5 fields).
pub const REQUEST_HEADER_SIZE: usize = 5 * FIELD_WIDTH;

/// Size of a reply header (3 fields).
pub const REPLY_HEADER_SIZE: usize = 3 * FIELD_WIDTH;

/// Constant message id of the JDBC dialect.
pub const JDBC_MAGIC: [u8; 8] = *b"12345678";

/// Message id of the File dialect's HELLO and START exchanges.
pub const CONTROL_MAGIC: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

/// Client dialect spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Profile {
    /// Sequential/indexed file access. Rotating tag, byte-safe tunnel on
    /// modern servers.
    #[default]
    File,
    /// SQL access. Constant magic id, payload bytes sent verbatim.
    Jdbc,
}

impl Profile {
    /// Message id used for the HELLO and START exchanges.
    pub fn control_id(self) -> MessageId {
        match self {
            Profile::File => MessageId::Magic(CONTROL_MAGIC),
            Profile::Jdbc => MessageId::Magic(JDBC_MAGIC),
        }
    }

    /// Keyword naming the kind of target in the CONNECT payload.
    pub fn connect_keyword(self) -> &'static str {
        match self {
            Profile::File => "FILE",
            Profile::Jdbc => "DATABASE",
        }
    }

    /// Whether the live stream is tunnelled through the byte-safe codec for a
    /// server of the given major version.
    pub fn uses_byte_safe(self, major_version: i32) -> bool {
        self == Profile::File && major_version >= 3
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::File => write!(f, "file"),
            Profile::Jdbc => write!(f, "jdbc"),
        }
    }
}

impl std::str::FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "fs" => Ok(Profile::File),
            "jdbc" | "sql" => Ok(Profile::Jdbc),
            other => Err(format!("unknown profile: {}", other)),
        }
    }
}

/// An 8-byte, left-justified, space-padded ASCII header field.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Field([u8; FIELD_WIDTH]);

impl Field {
    /// An all-space field.
    pub const BLANK: Field = Field([b' '; FIELD_WIDTH]);

    /// Creates a field from text, failing if it does not fit.
    pub fn new(name: &'static str, value: &str) -> Result<Self, ProtocolError> {
        let bytes = value.as_bytes();
        if bytes.len() > FIELD_WIDTH {
            return Err(ProtocolError::FieldOverflow {
                field: name,
                len: bytes.len(),
                max: FIELD_WIDTH,
            });
        }
        let mut field = [b' '; FIELD_WIDTH];
        field[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(field))
    }

    /// Wraps raw field bytes as received from the server.
    pub fn from_bytes(bytes: [u8; FIELD_WIDTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FIELD_WIDTH] {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.iter().all(|&b| b == b' ')
    }

    /// Field text with surrounding spaces removed.
    pub fn trimmed(&self) -> String {
        String::from_utf8_lossy(&self.0).trim().to_string()
    }
}

impl Default for Field {
    fn default() -> Self {
        Self::BLANK
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Field({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// The correlation value written into the first header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    /// One tag byte followed by spaces. Only the tag is echo-checked.
    Tag(u8),
    /// A constant 8-byte magic, echo-checked in full.
    Magic([u8; FIELD_WIDTH]),
}

impl MessageId {
    pub fn to_bytes(self) -> [u8; FIELD_WIDTH] {
        match self {
            MessageId::Tag(tag) => {
                let mut bytes = [b' '; FIELD_WIDTH];
                bytes[0] = tag;
                bytes
            }
            MessageId::Magic(magic) => magic,
        }
    }

    /// Checks the message id the server echoed back.
    pub fn verify_echo(self, echo: &[u8; FIELD_WIDTH]) -> Result<(), ProtocolError> {
        let matches = match self {
            MessageId::Tag(tag) => echo[0] == tag,
            MessageId::Magic(magic) => *echo == magic,
        };
        if matches {
            return Ok(());
        }
        let (expected, actual) = match self {
            MessageId::Tag(tag) => (
                String::from_utf8_lossy(&[tag]).into_owned(),
                String::from_utf8_lossy(&echo[..1]).into_owned(),
            ),
            MessageId::Magic(magic) => (
                String::from_utf8_lossy(&magic).into_owned(),
                String::from_utf8_lossy(echo).into_owned(),
            ),
        };
        Err(ProtocolError::Desync { expected, actual })
    }

    fn length_pad(self) -> u8 {
        match self {
            MessageId::Tag(_) => b'0',
            MessageId::Magic(_) => b' ',
        }
    }
}

/// Rotating File-dialect tag: 'A'..='Z', then back to 'A'.
///
/// A fresh tag sits at 'Z' so that the first request goes out as 'A'.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceTag(u8);

impl SequenceTag {
    pub fn new() -> Self {
        Self(b'Z')
    }

    /// The tag most recently handed out.
    pub fn current(&self) -> u8 {
        self.0
    }

    /// Moves to the next tag and returns it.
    pub fn advance(&mut self) -> u8 {
        self.0 = if self.0 >= b'Z' { b'A' } else { self.0 + 1 };
        self.0
    }
}

impl Default for SequenceTag {
    fn default() -> Self {
        Self::new()
    }
}

/// A 40-byte request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub id: MessageId,
    pub connection_id: Field,
    pub target: Field,
    pub function: Field,
}

impl RequestHeader {
    pub fn new(id: MessageId, function: &str) -> Result<Self, ProtocolError> {
        Ok(Self {
            id,
            connection_id: Field::BLANK,
            target: Field::BLANK,
            function: Field::new("function", function)?,
        })
    }

    pub fn with_connection_id(mut self, connection_id: Field) -> Self {
        self.connection_id = connection_id;
        self
    }

    pub fn with_target(mut self, target: Field) -> Self {
        self.target = target;
        self
    }

    /// Writes the header for a payload of `payload_len` logical bytes.
    pub fn encode(&self, payload_len: usize, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        let length = length_field(payload_len, self.id.length_pad())?;
        dst.put_slice(&self.id.to_bytes());
        dst.put_slice(self.connection_id.as_bytes());
        dst.put_slice(self.target.as_bytes());
        dst.put_slice(self.function.as_bytes());
        dst.put_slice(&length);
        Ok(())
    }
}

/// A parsed 24-byte reply header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyHeader {
    /// Message id echoed by the server.
    pub echo: [u8; FIELD_WIDTH],
    pub status: StatusCode,
    /// Logical payload length.
    pub length: usize,
}

impl ReplyHeader {
    /// Parses a reply header. Parsing never fails; the length field is
    /// scanned leniently and validation of the echo is left to the caller.
    pub fn parse(buf: &[u8; REPLY_HEADER_SIZE]) -> Self {
        let mut echo = [0u8; FIELD_WIDTH];
        echo.copy_from_slice(&buf[..FIELD_WIDTH]);
        Self {
            echo,
            status: StatusCode::from_field(&buf[FIELD_WIDTH..2 * FIELD_WIDTH]),
            length: parse_length(&buf[2 * FIELD_WIDTH..]),
        }
    }
}

/// Scans a decimal length field, skipping any non-digit bytes.
pub fn parse_length(field: &[u8]) -> usize {
    field
        .iter()
        .filter(|b| b.is_ascii_digit())
        .fold(0usize, |acc, &b| {
            acc.saturating_mul(10).saturating_add(usize::from(b - b'0'))
        })
}

fn length_field(len: usize, pad: u8) -> Result<[u8; FIELD_WIDTH], ProtocolError> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FieldOverflow {
            field: "length",
            len: len.to_string().len(),
            max: FIELD_WIDTH,
        });
    }
    let digits = len.to_string();
    let mut field = [pad; FIELD_WIDTH];
    field[FIELD_WIDTH - digits.len()..].copy_from_slice(digits.as_bytes());
    Ok(field)
}
