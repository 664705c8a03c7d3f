//! Version probe and connection bootstrap.
//!
//! Establishing a session takes three steps:
//!
//! 1. **Probe**: a short-lived socket sends `HELLO` and reads the greeting,
//!    which carries the server version.
//! 2. **Bootstrap**: servers before version 3 take the session on the service
//!    port directly. Later servers are first asked to `START` a session
//!    process, which either connects back to a port the client listens on or
//!    names a port for the client to connect to.
//! 3. **Connect**: `CONNECT` authenticates and attaches to the file set or
//!    database. Its reply carries the connection id and, optionally, the
//!    heartbeat interval.

use crate::channel::RpcChannel;
use crate::connection::{ConnectionConfig, DataPort};
use crate::error::ClientError;
use crate::stream::ClientStream;
use crate::tls::SecureTransport;
use dbcfs_protocol::{function, Field, Profile, GREETING_PREFIX};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Progress of a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Probing,
    Bootstrapping,
    Established,
    Failed,
}

/// How the live socket is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPath {
    /// Connect straight to the service port.
    Legacy,
    /// Ask the server to START a session process first.
    Modern,
}

/// Chooses the bootstrap for a server major version. Unknown versions (-1)
/// are treated as legacy.
pub fn select_bootstrap(major_version: i32) -> BootstrapPath {
    if major_version >= 3 {
        BootstrapPath::Modern
    } else {
        BootstrapPath::Legacy
    }
}

/// Extracts the major version from version text such as `"DB/C FS 16.1"`.
///
/// The number runs from after the last space up to the first `.` (or the end
/// of the text). Returns -1 if it does not parse.
pub fn parse_major_version(text: &str) -> i32 {
    let start = text.rfind(' ').map_or(0, |i| i + 1);
    let tail = &text[start..];
    let end = tail.find('.').unwrap_or(tail.len());
    tail[..end].trim().parse().unwrap_or(-1)
}

/// The server's answer to `HELLO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// Full greeting text.
    pub text: String,
    /// Version text following the greeting prefix.
    pub version: String,
    pub major_version: i32,
}

impl Greeting {
    pub fn parse(text: &str) -> Result<Self, ClientError> {
        let Some(version) = text.strip_prefix(GREETING_PREFIX) else {
            return Err(ClientError::handshake(format!(
                "'HELLO' response invalid: {}",
                text
            )));
        };
        Ok(Self {
            text: text.to_string(),
            version: version.to_string(),
            major_version: parse_major_version(text),
        })
    }
}

/// Identity and heartbeat settings returned by `CONNECT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub connection_id: Field,
    /// Heartbeat interval, if the server wants heartbeats.
    pub keepalive: Option<Duration>,
}

impl SessionInfo {
    /// Parses a `CONNECT` reply payload.
    ///
    /// The first 8 bytes are the connection id. A 16-byte payload carries the
    /// heartbeat interval in seconds in bytes 8..16; an interval of 0 disables
    /// heartbeats.
    pub fn parse(payload: &[u8]) -> Result<Self, ClientError> {
        let mut id = [b' '; 8];
        let n = payload.len().min(8);
        id[..n].copy_from_slice(&payload[..n]);

        let keepalive = if payload.len() == 16 {
            let text = String::from_utf8_lossy(&payload[8..16]);
            let secs: u64 = text.trim().parse().map_err(|_| {
                ClientError::handshake(format!("invalid heartbeat interval: {:?}", text))
            })?;
            (secs > 0).then(|| Duration::from_secs(secs))
        } else {
            None
        };

        Ok(Self {
            connection_id: Field::from_bytes(id),
            keepalive,
        })
    }
}

/// A connected and authenticated session, ready to be wrapped in a
/// [`crate::Connection`].
#[derive(Debug)]
pub struct Established {
    pub channel: RpcChannel<ClientStream>,
    pub greeting: Greeting,
    pub session: SessionInfo,
}

/// Drives one connection attempt through the handshake states.
#[derive(Debug)]
pub struct Handshake<'a> {
    config: &'a ConnectionConfig,
    tls: Option<SecureTransport>,
    state: HandshakeState,
}

impl<'a> Handshake<'a> {
    pub fn new(config: &'a ConnectionConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let tls = if config.encrypt {
            Some(SecureTransport::new(&config.tls_mode)?)
        } else {
            None
        };
        Ok(Self {
            config,
            tls,
            state: HandshakeState::Probing,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Runs all three steps.
    pub async fn run(mut self) -> Result<Established, ClientError> {
        let greeting = self.probe().await?;
        let stream = self.bootstrap(&greeting).await?;
        let (channel, session) = self.connect(stream, &greeting).await?;
        Ok(Established {
            channel,
            greeting,
            session,
        })
    }

    /// Sends `HELLO` on a short-lived control socket.
    pub async fn probe(&mut self) -> Result<Greeting, ClientError> {
        let result = self.probe_inner().await;
        let greeting = self.track(result)?;
        tracing::debug!(
            "server {} greeting {:?}, major version {}",
            self.config.host,
            greeting.text,
            greeting.major_version
        );
        self.state = HandshakeState::Bootstrapping;
        Ok(greeting)
    }

    async fn probe_inner(&self) -> Result<Greeting, ClientError> {
        let stream = self.open(self.config.service_port()).await?;
        let mut control = RpcChannel::control(stream, self.config.profile);
        control.send("", function::HELLO, b"").await?;
        let reply = control.recv().await.map_err(|e| match e {
            ClientError::ServerError { message, .. } => {
                ClientError::handshake(format!("'HELLO' rejected: {}", message))
            }
            other => other,
        })?;
        control.close().await;
        Greeting::parse(&reply.payload_str())
    }

    /// Obtains the live socket.
    pub async fn bootstrap(&mut self, greeting: &Greeting) -> Result<ClientStream, ClientError> {
        let result = match select_bootstrap(greeting.major_version) {
            BootstrapPath::Legacy => {
                tracing::debug!("legacy bootstrap");
                self.open(self.config.service_port()).await
            }
            BootstrapPath::Modern => self.start().await,
        };
        let stream = self.track(result)?;
        if let (Ok(local), Ok(peer)) = (stream.local_addr(), stream.peer_addr()) {
            tracing::debug!("live socket {} -> {}, tls={}", local, peer, stream.is_tls());
        }
        Ok(stream)
    }

    async fn start(&self) -> Result<ClientStream, ClientError> {
        let config = self.config;
        let listener = match config.data_port {
            DataPort::ServerAssigned => None,
            DataPort::Ephemeral => Some(TcpListener::bind(("0.0.0.0", 0)).await?),
            DataPort::Listen(port) => Some(TcpListener::bind(("0.0.0.0", port)).await?),
        };
        let (local_port, acceptor) = match listener {
            Some(listener) => {
                let port = listener.local_addr()?.port();
                tracing::debug!("waiting for server connect-back on port {}", port);
                (port, Some(spawn_acceptor(listener, config.accept_timeout)))
            }
            None => (0, None),
        };

        let result = self.request_start(local_port).await;
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                if let Some(acceptor) = acceptor {
                    acceptor.abort();
                }
                return Err(e);
            }
        };

        let tcp = match acceptor {
            Some(acceptor) => acceptor
                .await
                .map_err(|e| ClientError::handshake(format!("accept task failed: {}", e)))??,
            None => {
                let port: u16 = reply.trim().parse().map_err(|_| {
                    ClientError::handshake(format!("invalid session port in START reply: {:?}", reply))
                })?;
                tracing::debug!("server assigned session port {}", port);
                self.connect_tcp(port).await?
            }
        };
        self.secure(tcp).await
    }

    /// Sends `START` and returns the reply payload.
    async fn request_start(&self, local_port: u16) -> Result<String, ClientError> {
        let config = self.config;
        let stream = self.open(config.service_port()).await?;
        let mut control = RpcChannel::control(stream, config.profile);
        let payload = format!("{} {}", local_port, config.user);
        control
            .send("", function::START, payload.as_bytes())
            .await?;
        let reply = match control.recv().await {
            Ok(reply) if reply.status.is_ok() => reply,
            Ok(reply) => return Err(start_rejected(config, &reply.payload_str())),
            Err(ClientError::ServerError { message, .. }) => {
                return Err(start_rejected(config, &message))
            }
            Err(e) => return Err(e),
        };
        control.close().await;
        Ok(reply.payload_str())
    }

    /// Sends `CONNECT` over the live socket.
    pub async fn connect(
        &mut self,
        stream: ClientStream,
        greeting: &Greeting,
    ) -> Result<(RpcChannel<ClientStream>, SessionInfo), ClientError> {
        let result = self.connect_inner(stream, greeting).await;
        let established = self.track(result)?;
        self.state = HandshakeState::Established;
        Ok(established)
    }

    async fn connect_inner(
        &self,
        stream: ClientStream,
        greeting: &Greeting,
    ) -> Result<(RpcChannel<ClientStream>, SessionInfo), ClientError> {
        let config = self.config;
        let mut channel = RpcChannel::session(stream, config.profile, greeting.major_version);
        let payload = connect_payload(config, greeting.major_version);
        channel
            .send("", function::CONNECT, payload.as_bytes())
            .await?;
        let reply = match channel.recv().await {
            Ok(reply) if reply.status.is_ok() => reply,
            Ok(reply) => return Err(connect_rejected(config, &reply.payload_str())),
            Err(ClientError::ServerError { message, .. }) => {
                return Err(connect_rejected(config, &message))
            }
            Err(e) => return Err(e),
        };
        let session = SessionInfo::parse(&reply.payload)?;
        channel.set_connection_id(session.connection_id);
        Ok((channel, session))
    }

    fn track<T>(&mut self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(e) = &result {
            tracing::debug!("handshake failed in {:?}: {}", self.state, e);
            self.state = HandshakeState::Failed;
        }
        result
    }

    async fn connect_tcp(&self, port: u16) -> Result<TcpStream, ClientError> {
        let addr = (self.config.host.as_str(), port);
        let stream = with_timeout(self.config.connect_timeout, TcpStream::connect(addr)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn secure(&self, tcp: TcpStream) -> Result<ClientStream, ClientError> {
        match &self.tls {
            Some(tls) => tls.wrap(tcp, &self.config.host).await,
            None => Ok(ClientStream::from(tcp)),
        }
    }

    async fn open(&self, port: u16) -> Result<ClientStream, ClientError> {
        let tcp = self.connect_tcp(port).await?;
        self.secure(tcp).await
    }
}

/// Builds `"<user> <password> <FILE|DATABASE> <target>[ CLIENT]"`.
pub fn connect_payload(config: &ConnectionConfig, major_version: i32) -> String {
    let mut payload = format!(
        "{} {} {} {}",
        config.user,
        config.password,
        config.profile.connect_keyword(),
        config.database
    );
    if requests_heartbeats(config, major_version) {
        payload.push_str(" CLIENT");
    }
    payload
}

fn requests_heartbeats(config: &ConnectionConfig, major_version: i32) -> bool {
    config.keepalive && !(config.profile == Profile::Jdbc && major_version < 3)
}

fn start_rejected(config: &ConnectionConfig, message: &str) -> ClientError {
    ClientError::handshake(format!(
        "unable to START server:port {}/{}: {}",
        config.host,
        config.service_port(),
        message
    ))
}

fn connect_rejected(config: &ConnectionConfig, message: &str) -> ClientError {
    ClientError::handshake(format!(
        "unable to connect to server/database {}/{}: {}",
        config.host, config.database, message
    ))
}

fn spawn_acceptor(
    listener: TcpListener,
    timeout: Option<Duration>,
) -> JoinHandle<Result<TcpStream, ClientError>> {
    tokio::spawn(async move {
        let (stream, peer) = with_timeout(timeout, listener.accept()).await?;
        tracing::debug!("accepted session connection from {}", peer);
        stream.set_nodelay(true)?;
        Ok(stream)
    })
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "timed out"))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        read_request, serve_hello, serve_hello_tls, tls_acceptor, write_reply, LEGACY_GREETING,
    };

    #[test]
    fn test_parse_major_version() {
        assert_eq!(parse_major_version("DB/C FS 4.2"), 4);
        assert_eq!(parse_major_version("DB/C FS 3"), 3);
        assert_eq!(parse_major_version("DB/C FS 16.1.2"), 16);
        assert_eq!(parse_major_version("HELLO WORLD"), -1);
        assert_eq!(parse_major_version(""), -1);
    }

    #[test]
    fn test_select_bootstrap() {
        assert_eq!(select_bootstrap(-1), BootstrapPath::Legacy);
        assert_eq!(select_bootstrap(2), BootstrapPath::Legacy);
        assert_eq!(select_bootstrap(3), BootstrapPath::Modern);
        assert_eq!(select_bootstrap(16), BootstrapPath::Modern);
        assert_eq!(
            select_bootstrap(parse_major_version("HELLO WORLD")),
            BootstrapPath::Legacy
        );
    }

    #[test]
    fn test_greeting_parse() {
        let greeting = Greeting::parse("DB/C FS 16.1").unwrap();
        assert_eq!(greeting.version, "16.1");
        assert_eq!(greeting.major_version, 16);

        let err = Greeting::parse("HELLO WORLD").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Handshake);
        assert!(err.to_string().contains("HELLO WORLD"));
    }

    #[test]
    fn test_session_info() {
        let info = SessionInfo::parse(b"CID00001").unwrap();
        assert_eq!(info.connection_id.as_bytes(), b"CID00001");
        assert_eq!(info.keepalive, None);

        let info = SessionInfo::parse(b"CID00001      30").unwrap();
        assert_eq!(info.keepalive, Some(Duration::from_secs(30)));

        let info = SessionInfo::parse(b"CID00001       0").unwrap();
        assert_eq!(info.keepalive, None);

        let err = SessionInfo::parse(b"CID00001   soon ").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Handshake);
    }

    #[test]
    fn test_connect_payload() {
        let config = ConnectionConfig::new("localhost")
            .with_credentials("alice", "secret")
            .with_database("orders");
        assert_eq!(
            connect_payload(&config, 16),
            "alice secret FILE orders CLIENT"
        );

        let config = config.with_keepalive(false);
        assert_eq!(connect_payload(&config, 16), "alice secret FILE orders");

        let jdbc = ConnectionConfig::new("localhost")
            .with_profile(Profile::Jdbc)
            .with_credentials("DEFAULTUSER", "PASSWORD")
            .with_database("DEFAULT");
        assert_eq!(
            connect_payload(&jdbc, 6),
            "DEFAULTUSER PASSWORD DATABASE DEFAULT CLIENT"
        );
        assert_eq!(
            connect_payload(&jdbc, 2),
            "DEFAULTUSER PASSWORD DATABASE DEFAULT"
        );
    }

    #[test]
    fn test_handshake_rejects_encryption_without_tls() {
        let config = ConnectionConfig::new("localhost")
            .with_encryption(true)
            .with_tls_enabled(false);
        let err = Handshake::new(&config).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Usage);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let acceptor = tls_acceptor();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            serve_hello_tls(&listener, &acceptor, LEGACY_GREETING).await;
            let (sock, _) = listener.accept().await.unwrap();
            let mut sock = acceptor.accept(sock).await.unwrap();
            let connect = read_request(&mut sock, false).await.unwrap();
            assert_eq!(connect.function, "CONNECT");
            write_reply(&mut sock, &connect.id, "OK", b"CID00021", false)
                .await
                .unwrap();
        });

        let config = ConnectionConfig::new("127.0.0.1")
            .with_port(port)
            .with_credentials("alice", "secret")
            .with_database("orders")
            .with_encryption(true);
        let mut handshake = Handshake::new(&config).unwrap();
        assert_eq!(handshake.state(), HandshakeState::Probing);

        let greeting = handshake.probe().await.unwrap();
        assert_eq!(greeting.major_version, 2);
        assert_eq!(handshake.state(), HandshakeState::Bootstrapping);

        let stream = handshake.bootstrap(&greeting).await.unwrap();
        assert!(stream.is_tls());
        assert_eq!(stream.peer_addr().unwrap().port(), port);
        assert_eq!(handshake.state(), HandshakeState::Bootstrapping);

        let (channel, session) = handshake.connect(stream, &greeting).await.unwrap();
        assert_eq!(handshake.state(), HandshakeState::Established);
        assert_eq!(channel.connection_id().as_bytes(), b"CID00021");
        assert_eq!(session.keepalive, None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_state_failed_on_bad_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            serve_hello(&listener, "HELLO WORLD").await;
        });

        let config = ConnectionConfig::new("127.0.0.1").with_port(port);
        let mut handshake = Handshake::new(&config).unwrap();
        assert!(handshake.probe().await.is_err());
        assert_eq!(handshake.state(), HandshakeState::Failed);
        server.await.unwrap();
    }
}
