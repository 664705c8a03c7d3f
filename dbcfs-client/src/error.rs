//! Client error types.

use dbcfs_protocol::ProtocolError;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("server error {code}: {message}")]
    ServerError { code: String, message: String },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Broad classification of a [`ClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The socket failed or was closed. Fatal.
    Transport,
    /// Replies no longer line up with requests. Fatal.
    ProtocolDesync,
    /// The server rejected a request. The connection stays usable.
    Server,
    /// The connection could not be established.
    Handshake,
    /// The caller asked for something invalid. Nothing was sent.
    Usage,
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Io(_) | ClientError::ConnectionClosed | ClientError::NotConnected => {
                ErrorKind::Transport
            }
            ClientError::Protocol(e) if e.is_desync() => ErrorKind::ProtocolDesync,
            ClientError::Protocol(_) => ErrorKind::Usage,
            ClientError::ServerError { .. } => ErrorKind::Server,
            ClientError::Handshake(_) | ClientError::TlsHandshake(_) => ErrorKind::Handshake,
            ClientError::TlsConfig(_) | ClientError::Config(_) => ErrorKind::Usage,
        }
    }

    /// Returns whether the connection that produced this error is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::ProtocolDesync)
    }

    pub(crate) fn handshake(msg: impl Into<String>) -> Self {
        ClientError::Handshake(msg.into())
    }
}
