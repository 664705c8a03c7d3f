//! One-at-a-time request/reply exchange over a session socket.
//!
//! The channel owns the socket and all framing state. It is not shared
//! directly; [`crate::Connection`] keeps it behind a mutex and hands out an
//! exclusive [`crate::Exchange`] for each send/recv pair.

use crate::error::ClientError;
use crate::stream::ClientStream;
use dbcfs_protocol::{
    function, ByteSafe, Field, FrameDecoder, FrameEncoder, MessageId, Profile, Raw, Reply,
    RequestHeader, SequenceTag, Transcode,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Bytes reserved ahead of each socket read.
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
enum IdSource {
    Sequence(SequenceTag),
    Constant(MessageId),
}

impl IdSource {
    fn next(&mut self) -> MessageId {
        match self {
            IdSource::Sequence(tag) => MessageId::Tag(tag.advance()),
            IdSource::Constant(id) => *id,
        }
    }

    fn current(&self) -> MessageId {
        match self {
            IdSource::Sequence(tag) => MessageId::Tag(tag.current()),
            IdSource::Constant(id) => *id,
        }
    }
}

/// Socket plus framing state for one session.
///
/// After a fatal error the socket is dropped and every later call fails with
/// [`ClientError::NotConnected`].
#[derive(Debug)]
pub struct RpcChannel<S = ClientStream> {
    stream: Option<S>,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    ids: IdSource,
    connection_id: Field,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<S> RpcChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Channel for a live session against a server of `major_version`.
    pub fn session(stream: S, profile: Profile, major_version: i32) -> Self {
        let byte_safe = profile.uses_byte_safe(major_version);
        let transcoder = || -> Box<dyn Transcode> {
            if byte_safe {
                Box::new(ByteSafe)
            } else {
                Box::new(Raw)
            }
        };
        let ids = match profile {
            Profile::File => IdSource::Sequence(SequenceTag::new()),
            Profile::Jdbc => IdSource::Constant(profile.control_id()),
        };
        Self::build(stream, ids, transcoder(), transcoder())
    }

    /// Channel for the HELLO and START exchanges on a control socket.
    pub fn control(stream: S, profile: Profile) -> Self {
        Self::build(
            stream,
            IdSource::Constant(profile.control_id()),
            Box::new(Raw),
            Box::new(Raw),
        )
    }

    fn build(
        stream: S,
        ids: IdSource,
        encode: Box<dyn Transcode>,
        decode: Box<dyn Transcode>,
    ) -> Self {
        Self {
            stream: Some(stream),
            encoder: FrameEncoder::new(encode),
            decoder: FrameDecoder::new(decode),
            ids,
            connection_id: Field::BLANK,
            shutdown: None,
        }
    }

    /// Makes in-flight I/O fail with [`ClientError::ConnectionClosed`] once
    /// `true` is published on `shutdown`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Stamps the server-assigned connection id into later headers.
    pub fn set_connection_id(&mut self, connection_id: Field) {
        self.connection_id = connection_id;
    }

    pub fn connection_id(&self) -> &Field {
        &self.connection_id
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Encodes and writes one request.
    ///
    /// An argument that does not fit its header field is rejected before
    /// anything is written and leaves the channel usable.
    pub async fn send(
        &mut self,
        target: &str,
        function: &str,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        if self.stream.is_none() {
            return Err(ClientError::NotConnected);
        }
        let mut ids = self.ids.clone();
        let header = RequestHeader::new(ids.next(), function)?
            .with_connection_id(self.connection_id)
            .with_target(Field::new("target", target)?);
        let bytes = self.encoder.encode(&header, payload)?;
        self.ids = ids;
        tracing::debug!(
            function,
            payload_len = payload.len(),
            wire_len = bytes.len(),
            "send"
        );

        let Some(stream) = self.stream.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        let result = tokio::select! {
            r = write_flush(stream, bytes) => r.map_err(ClientError::Io),
            _ = closed(&mut self.shutdown) => Err(ClientError::ConnectionClosed),
        };
        self.check(result)
    }

    /// Reads one reply and checks that it answers the last request.
    ///
    /// An `ERR` status is returned as [`ClientError::ServerError`]; any other
    /// status is left for the caller to interpret.
    pub async fn recv(&mut self) -> Result<Reply, ClientError> {
        let reply = loop {
            match self.decoder.decode_reply() {
                Ok(Some(reply)) => break reply,
                Ok(None) => {}
                Err(e) => return self.check(Err(e.into())),
            }

            let Some(stream) = self.stream.as_mut() else {
                return Err(ClientError::NotConnected);
            };
            let buf = self.decoder.read_buf();
            buf.reserve(READ_CHUNK);
            let result = tokio::select! {
                r = stream.read_buf(buf) => r.map_err(ClientError::Io),
                _ = closed(&mut self.shutdown) => Err(ClientError::ConnectionClosed),
            };
            match self.check(result)? {
                0 => {
                    tracing::debug!("connection closed by server mid-reply");
                    return self.check(Err(ClientError::ConnectionClosed));
                }
                n => tracing::trace!("read {} bytes", n),
            }
        };

        let expected = self.ids.current();
        if let Err(e) = expected.verify_echo(&reply.echo) {
            return self.check(Err(e.into()));
        }
        tracing::debug!(status = %reply.status, payload_len = reply.payload.len(), "recv");

        if reply.status.is_error() {
            return Err(ClientError::ServerError {
                code: reply.status.error_code().unwrap_or_default().to_string(),
                message: reply.payload_str(),
            });
        }
        Ok(reply)
    }

    /// Writes the bare heartbeat mnemonic. The server sends nothing back.
    pub async fn heartbeat(&mut self) -> Result<(), ClientError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        let bytes = self.encoder.encode_bare(function::ALIVEACK.as_bytes());
        let result = tokio::select! {
            r = write_flush(stream, bytes) => r.map_err(ClientError::Io),
            _ = closed(&mut self.shutdown) => Err(ClientError::ConnectionClosed),
        };
        self.check(result)
    }

    /// Shuts the socket down. Later calls fail with `NotConnected`.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.decoder.clear();
    }

    /// Drops the socket if `result` is a fatal error.
    fn check<T>(&mut self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(e) = &result {
            if e.is_fatal() && self.stream.is_some() {
                tracing::debug!("channel failed: {}", e);
                self.stream = None;
                self.decoder.clear();
            }
        }
        result
    }
}

async fn write_flush<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(bytes).await?;
    stream.flush().await
}

/// Resolves once shutdown has been requested, or never without a receiver.
async fn closed(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            let _ = rx.wait_for(|stop| *stop).await;
        }
        None => std::future::pending().await,
    }
}
