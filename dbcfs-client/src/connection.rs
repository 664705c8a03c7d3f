//! Connection management.

use crate::channel::RpcChannel;
use crate::error::ClientError;
use crate::handshake::{Greeting, Handshake, SessionInfo};
use crate::keepalive::{KeepAliveExit, KeepAliveTask};
use crate::stream::ClientStream;
use crate::tls::TlsMode;
use dbcfs_protocol::{function, Profile, Reply, DEFAULT_PORT, DEFAULT_SECURE_PORT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Where the session socket of a modern server comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataPort {
    /// Listen on an OS-chosen port for the server to connect back.
    #[default]
    Ephemeral,
    /// Connect to the port named in the server's START reply.
    ServerAssigned,
    /// Listen on this port for the server to connect back.
    Listen(u16),
}

impl DataPort {
    /// Maps the drivers' `localport` value: -1 ephemeral, 0 server-assigned,
    /// anything else a fixed port.
    pub fn from_local_port(value: i64) -> Result<Self, ClientError> {
        match value {
            -1 => Ok(DataPort::Ephemeral),
            0 => Ok(DataPort::ServerAssigned),
            n => u16::try_from(n)
                .map(DataPort::Listen)
                .map_err(|_| ClientError::Config(format!("invalid local port: {}", n))),
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server host name or address.
    pub host: String,
    /// Service port. Defaults to 9584, or 9585 with encryption.
    pub port: Option<u16>,
    pub profile: Profile,
    pub user: String,
    pub password: String,
    /// File set (File profile) or database (JDBC profile) to attach to.
    pub database: String,
    /// Wrap every socket in TLS.
    pub encrypt: bool,
    /// Whether this build may use TLS at all.
    pub tls_enabled: bool,
    pub tls_mode: TlsMode,
    pub data_port: DataPort,
    /// Ask the server for client heartbeats.
    pub keepalive: bool,
    pub connect_timeout: Option<Duration>,
    /// Bound on waiting for the server to connect back. Unbounded by default.
    pub accept_timeout: Option<Duration>,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            profile: Profile::File,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            encrypt: false,
            tls_enabled: true,
            tls_mode: TlsMode::Anonymous,
            data_port: DataPort::Ephemeral,
            keepalive: true,
            connect_timeout: None,
            accept_timeout: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_encryption(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    pub fn with_tls_enabled(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }

    pub fn with_tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls_mode = mode;
        self
    }

    pub fn with_data_port(mut self, data_port: DataPort) -> Self {
        self.data_port = data_port;
        self
    }

    pub fn with_keepalive(mut self, keepalive: bool) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = Some(timeout);
        self
    }

    /// Port used for the probe, START and legacy sessions.
    pub fn service_port(&self) -> u16 {
        match (self.port, self.encrypt) {
            (Some(port), _) => port,
            (None, true) => DEFAULT_SECURE_PORT,
            (None, false) => DEFAULT_PORT,
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.host.is_empty() {
            return Err(ClientError::Config("server host is required".into()));
        }
        if self.encrypt && !self.tls_enabled {
            return Err(ClientError::Config(
                "encryption requested but TLS support is disabled".into(),
            ));
        }
        if self.user.contains(' ') || self.database.contains(' ') {
            return Err(ClientError::Config(
                "user and database names cannot contain spaces".into(),
            ));
        }
        Ok(())
    }
}

/// An established session with a DB/C FS server.
///
/// Requests are serialized: each [`Exchange`] holds the connection lock from
/// its send until its reply has been read, and heartbeats take the same lock.
#[derive(Debug)]
pub struct Connection {
    channel: Arc<Mutex<RpcChannel<ClientStream>>>,
    greeting: Greeting,
    session: SessionInfo,
    profile: Profile,
    /// Stops the keep-alive task.
    stop: watch::Sender<bool>,
    /// Cancels socket I/O in progress.
    cancel: watch::Sender<bool>,
    keepalive: parking_lot::Mutex<Option<JoinHandle<KeepAliveExit>>>,
    closed: AtomicBool,
    failed: AtomicBool,
}

impl Connection {
    /// Performs the full handshake and starts heartbeats if the server asked
    /// for them.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        tracing::debug!(
            "connecting to {}:{} ({})",
            config.host,
            config.service_port(),
            config.profile
        );
        let established = Handshake::new(&config)?.run().await?;

        let (stop, stop_rx) = watch::channel(false);
        let (cancel, cancel_rx) = watch::channel(false);
        let channel = Arc::new(Mutex::new(established.channel.with_shutdown(cancel_rx)));
        let keepalive = established
            .session
            .keepalive
            .map(|interval| KeepAliveTask::spawn(Arc::clone(&channel), interval, stop_rx));

        tracing::info!(
            "connection established, server={}, user={}, db={}, version={}",
            config.host,
            config.user,
            config.database,
            established.greeting.version
        );

        Ok(Self {
            channel,
            greeting: established.greeting,
            session: established.session,
            profile: config.profile,
            stop,
            cancel,
            keepalive: parking_lot::Mutex::new(keepalive),
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        })
    }

    /// Takes the connection lock for one send/recv pair.
    pub async fn lock(&self) -> Result<Exchange<'_>, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let channel = self.channel.lock().await;
        Ok(Exchange {
            channel,
            connection: self,
        })
    }

    /// Sends one request and returns its reply.
    pub async fn call(
        &self,
        target: &str,
        function: &str,
        payload: &[u8],
    ) -> Result<Reply, ClientError> {
        let mut exchange = self.lock().await?;
        exchange.send(target, function, payload).await?;
        exchange.recv().await
    }

    /// Ends the session.
    ///
    /// Stops heartbeats, sends `DISCNCT` if no other exchange is in progress,
    /// and closes the socket. An exchange blocked on another task fails with
    /// [`ClientError::ConnectionClosed`].
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!("closing connection");
        self.stop_keepalive().await;

        let mut channel = match self.channel.try_lock() {
            Ok(channel) => channel,
            Err(_) => {
                tracing::debug!("exchange in progress, cancelling it");
                self.cancel.send_replace(true);
                self.channel.lock().await
            }
        };

        if channel.is_open() && !*self.cancel.borrow() {
            let result = match channel.send("", function::DISCNCT, b"").await {
                Ok(()) => channel.recv().await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!("disconnect failed: {}", e);
            }
        }
        channel.close().await;
        self.cancel.send_replace(true);

        tracing::info!("connection closed");
        Ok(())
    }

    async fn stop_keepalive(&self) {
        self.stop.send_replace(true);
        let handle = self.keepalive.lock().take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(exit) => tracing::debug!("keep-alive exited: {:?}", exit),
                Err(e) => tracing::warn!("keep-alive task failed: {}", e),
            }
        }
    }

    fn on_fatal(&self, err: &ClientError) {
        if err.is_fatal() && !self.failed.swap(true, Ordering::SeqCst) {
            tracing::warn!("connection lost: {}", err);
            self.stop.send_replace(true);
        }
    }

    pub fn is_connected(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) || self.failed.load(Ordering::SeqCst) {
            return false;
        }
        if self.keepalive_lost() {
            if !self.failed.swap(true, Ordering::SeqCst) {
                tracing::warn!("connection lost: heartbeats stopped");
            }
            return false;
        }
        true
    }

    /// The keep-alive task only finishes on its own when a heartbeat could
    /// not be sent.
    fn keepalive_lost(&self) -> bool {
        self.keepalive
            .lock()
            .as_ref()
            .is_some_and(JoinHandle::is_finished)
    }

    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    pub fn major_version(&self) -> i32 {
        self.greeting.major_version
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Server-assigned connection id.
    pub fn connection_id(&self) -> String {
        self.session.connection_id.trimmed()
    }

    /// Heartbeat interval, if heartbeats are running.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.session.keepalive
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        self.cancel.send_replace(true);
    }
}

/// Exclusive use of a connection for one request/reply pair.
///
/// Dropping the guard releases the connection lock.
#[derive(Debug)]
pub struct Exchange<'a> {
    channel: MutexGuard<'a, RpcChannel<ClientStream>>,
    connection: &'a Connection,
}

impl Exchange<'_> {
    pub async fn send(
        &mut self,
        target: &str,
        function: &str,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        let result = self.channel.send(target, function, payload).await;
        self.observe(result)
    }

    pub async fn recv(&mut self) -> Result<Reply, ClientError> {
        let result = self.channel.recv().await;
        self.observe(result)
    }

    fn observe<T>(&self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(e) = &result {
            self.connection.on_fatal(e);
        }
        result
    }
}
