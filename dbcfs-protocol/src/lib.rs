//! # dbcfs-protocol
//!
//! Wire protocol implementation for DB/C FS.
//!
//! This crate provides:
//! - Fixed-width request/reply headers shared by the File and JDBC dialects
//! - Incremental frame encoder/decoder with reusable buffers
//! - The byte-safe tunnel used by the File dialect on modern servers
//! - Sequence tags, status codes and protocol constants
//!
//! It performs no I/O; the client crate drives it over a socket.

pub mod bytesafe;
pub mod codec;
pub mod error;
pub mod frame;
pub mod status;

pub use bytesafe::{ByteSafe, Raw, Transcode};
pub use codec::{FrameDecoder, FrameEncoder, Reply};
pub use error::ProtocolError;
pub use frame::{
    Field, MessageId, Profile, ReplyHeader, RequestHeader, SequenceTag, CONTROL_MAGIC,
    FIELD_WIDTH, JDBC_MAGIC, REPLY_HEADER_SIZE, REQUEST_HEADER_SIZE,
};
pub use status::StatusCode;

/// Default plain-text server port.
pub const DEFAULT_PORT: u16 = 9584;

/// Default TLS server port.
pub const DEFAULT_SECURE_PORT: u16 = 9585;

/// Prefix of the greeting returned by the version probe.
pub const GREETING_PREFIX: &str = "DB/C FS ";

/// Largest payload an 8-digit decimal length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = 99_999_999;

/// Function mnemonics interpreted by the protocol core itself.
pub mod function {
    /// Version probe.
    pub const HELLO: &str = "HELLO";
    /// Ask the server to start a session process (servers >= 3).
    pub const START: &str = "START";
    /// Authenticate and attach to a file set or database.
    pub const CONNECT: &str = "CONNECT";
    /// End the session.
    pub const DISCNCT: &str = "DISCNCT";
    /// Client heartbeat. Sent bare, without a header.
    pub const ALIVEACK: &str = "ALIVEACK";
}
