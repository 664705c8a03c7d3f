//! # dbcfs-client
//!
//! Client library for DB/C FS servers.
//!
//! This crate provides:
//! - Version probe and connection bootstrap for legacy and modern servers
//! - Optional anonymous TLS on control and live sockets
//! - One-at-a-time request/response exchanges guarded by a connection lock
//! - Background keep-alive heartbeats at the server-dictated interval
//! - Connection settings from YAML, environment variables or a JDBC-style URL

pub mod channel;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod keepalive;
pub mod settings;
pub mod stream;
pub mod tls;

pub use channel::RpcChannel;
pub use connection::{Connection, ConnectionConfig, DataPort, Exchange};
pub use dbcfs_protocol::{Profile, Reply, StatusCode};
pub use error::{ClientError, ErrorKind};
pub use handshake::{parse_major_version, select_bootstrap, BootstrapPath, Greeting};
pub use settings::{ClientSettings, ConfigError};
pub use tls::{SecureTransport, TlsMode};

#[cfg(test)]
pub(crate) mod testing;
