//! Encoder and decoder for DB/C FS frames.
//!
//! Both sides own their scratch buffers for the lifetime of a connection.
//! Buffers are cleared between messages, never shrunk.

use crate::bytesafe::{Raw, Transcode};
use crate::error::ProtocolError;
use crate::frame::{ReplyHeader, RequestHeader, FIELD_WIDTH, REPLY_HEADER_SIZE};
use crate::status::StatusCode;
use bytes::{Bytes, BytesMut};

const INITIAL_CAPACITY: usize = 4096;

/// A fully received reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Message id echoed by the server.
    pub echo: [u8; FIELD_WIDTH],
    pub status: StatusCode,
    pub payload: Bytes,
}

impl Reply {
    /// Payload as text, with invalid UTF-8 replaced.
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Encodes requests into wire bytes.
#[derive(Debug)]
pub struct FrameEncoder {
    transcoder: Box<dyn Transcode>,
    plain: BytesMut,
    wire: BytesMut,
}

impl FrameEncoder {
    pub fn new(transcoder: Box<dyn Transcode>) -> Self {
        Self {
            transcoder,
            plain: BytesMut::with_capacity(INITIAL_CAPACITY),
            wire: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Encodes a header and payload, returning the bytes to write.
    ///
    /// On error nothing is produced.
    pub fn encode(
        &mut self,
        header: &RequestHeader,
        payload: &[u8],
    ) -> Result<&[u8], ProtocolError> {
        self.plain.clear();
        self.wire.clear();
        header.encode(payload.len(), &mut self.plain)?;
        self.plain.extend_from_slice(payload);
        self.transcoder.encode(&self.plain, &mut self.wire);
        Ok(&self.wire)
    }

    /// Encodes headerless bytes, such as the heartbeat mnemonic.
    pub fn encode_bare(&mut self, data: &[u8]) -> &[u8] {
        self.wire.clear();
        self.transcoder.encode(data, &mut self.wire);
        &self.wire
    }

    /// Current capacity of the wire buffer.
    pub fn capacity(&self) -> usize {
        self.wire.capacity()
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(Box::new(Raw))
    }
}

/// Decodes replies from wire bytes.
///
/// The reply header is decoded first; its length field then says how many
/// more logical bytes make up the payload.
#[derive(Debug)]
pub struct FrameDecoder {
    transcoder: Box<dyn Transcode>,
    raw: BytesMut,
    decoded: BytesMut,
    header: Option<ReplyHeader>,
}

impl FrameDecoder {
    pub fn new(transcoder: Box<dyn Transcode>) -> Self {
        Self {
            transcoder,
            raw: BytesMut::with_capacity(INITIAL_CAPACITY),
            decoded: BytesMut::with_capacity(INITIAL_CAPACITY),
            header: None,
        }
    }

    /// Appends received wire bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.raw.extend_from_slice(data);
    }

    /// Buffer for reading wire bytes into directly.
    pub fn read_buf(&mut self) -> &mut BytesMut {
        &mut self.raw
    }

    /// Attempts to decode the next reply.
    ///
    /// Returns `Ok(None)` until enough bytes have arrived.
    pub fn decode_reply(&mut self) -> Result<Option<Reply>, ProtocolError> {
        let header = match self.header.take() {
            Some(header) => header,
            None => {
                self.transcoder
                    .decode(&mut self.raw, &mut self.decoded, REPLY_HEADER_SIZE)?;
                if self.decoded.len() < REPLY_HEADER_SIZE {
                    return Ok(None);
                }
                let mut buf = [0u8; REPLY_HEADER_SIZE];
                buf.copy_from_slice(&self.decoded[..REPLY_HEADER_SIZE]);
                ReplyHeader::parse(&buf)
            }
        };

        let total = REPLY_HEADER_SIZE + header.length;
        self.transcoder
            .decode(&mut self.raw, &mut self.decoded, total)?;
        if self.decoded.len() < total {
            self.header = Some(header);
            return Ok(None);
        }

        let payload = Bytes::copy_from_slice(&self.decoded[REPLY_HEADER_SIZE..total]);
        self.decoded.clear();
        Ok(Some(Reply {
            echo: header.echo,
            status: header.status,
            payload,
        }))
    }

    /// Number of undecoded wire bytes buffered.
    pub fn buffered(&self) -> usize {
        self.raw.len()
    }

    /// Discards all buffered state.
    pub fn clear(&mut self) {
        self.raw.clear();
        self.decoded.clear();
        self.header = None;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(Box::new(Raw))
    }
}
