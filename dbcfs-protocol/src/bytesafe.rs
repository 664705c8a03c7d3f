//! Byte-safe tunnel for the File dialect.
//!
//! Modern servers expect the File dialect's stream to be a modified UTF-8
//! text stream in which the byte 0 never appears. Every payload byte is
//! therefore mapped to the code point of the same value:
//!
//! ```text
//! 0x01..=0x7F  ->  one byte, unchanged
//! 0x00         ->  C0 80              (overlong, keeps NUL off the wire)
//! 0x80..=0xFF  ->  C2 80 ..= C3 BF
//! ```
//!
//! Transcoding is a pipeline stage between the frame codec and the socket,
//! expressed by the [`Transcode`] trait. [`Raw`] passes bytes through for the
//! dialects that do not tunnel.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

/// A reversible byte transform applied to everything written to and read from
/// a connection.
pub trait Transcode: Send + Sync + fmt::Debug {
    /// Appends the wire form of `src` to `dst`.
    fn encode(&self, src: &[u8], dst: &mut BytesMut);

    /// Decodes wire bytes from `src` into `dst` until `dst` holds `want` bytes
    /// or `src` runs out of complete sequences.
    ///
    /// Consumed input is removed from `src`. An incomplete trailing sequence is
    /// left in place for the next call.
    fn decode(&self, src: &mut BytesMut, dst: &mut BytesMut, want: usize)
        -> Result<(), ProtocolError>;
}

/// Identity transcoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Raw;

impl Transcode for Raw {
    fn encode(&self, src: &[u8], dst: &mut BytesMut) {
        dst.extend_from_slice(src);
    }

    fn decode(
        &self,
        src: &mut BytesMut,
        dst: &mut BytesMut,
        want: usize,
    ) -> Result<(), ProtocolError> {
        let n = want.saturating_sub(dst.len()).min(src.len());
        dst.extend_from_slice(&src.split_to(n));
        Ok(())
    }
}

/// The File dialect's overlong two-byte tunnel.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteSafe;

impl Transcode for ByteSafe {
    fn encode(&self, src: &[u8], dst: &mut BytesMut) {
        dst.reserve(encoded_len(src));
        for &b in src {
            encode_byte(b, dst);
        }
    }

    fn decode(
        &self,
        src: &mut BytesMut,
        dst: &mut BytesMut,
        want: usize,
    ) -> Result<(), ProtocolError> {
        let mut pos = 0;
        while dst.len() < want && pos < src.len() {
            let lead = src[pos];
            let width = sequence_width(lead)?;
            if src.len() - pos < width {
                break;
            }
            dst.put_u8(decode_sequence(&src[pos..pos + width]));
            pos += width;
        }
        src.advance(pos);
        Ok(())
    }
}

/// Writes the tunnelled form of a single byte.
pub fn encode_byte(b: u8, dst: &mut impl BufMut) {
    if b != 0 && b <= 0x7F {
        dst.put_u8(b);
    } else {
        dst.put_u8(0xC0 | (b >> 6));
        dst.put_u8(0x80 | (b & 0x3F));
    }
}

/// Number of wire bytes `src` occupies once tunnelled.
pub fn encoded_len(src: &[u8]) -> usize {
    src.iter()
        .map(|&b| if b != 0 && b <= 0x7F { 1 } else { 2 })
        .sum()
}

/// Decodes a complete tunnelled buffer.
///
/// Unlike [`ByteSafe::decode`], a trailing partial sequence is an error here.
pub fn decode_all(src: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut input = BytesMut::from(src);
    let mut out = BytesMut::with_capacity(src.len());
    ByteSafe.decode(&mut input, &mut out, usize::MAX)?;
    if !input.is_empty() {
        return Err(ProtocolError::TruncatedSequence);
    }
    Ok(out.to_vec())
}

fn sequence_width(lead: u8) -> Result<usize, ProtocolError> {
    match lead {
        0x00..=0x7F => Ok(1),
        0xC0..=0xDF => Ok(2),
        0xE0..=0xEF => Ok(3),
        other => Err(ProtocolError::InvalidSequence(other)),
    }
}

/// Reconstructs the code point of one sequence, keeping its low 8 bits.
/// Three-byte sequences are never produced for byte input but are accepted.
fn decode_sequence(seq: &[u8]) -> u8 {
    let cont = |b: u8| u32::from(b).wrapping_sub(0x80);
    let value = match *seq {
        [b] => u32::from(b),
        [lead, c1] => ((u32::from(lead) - 0xC0) << 6).wrapping_add(cont(c1)),
        [lead, c1, c2] => ((u32::from(lead) - 0xE0) << 12)
            .wrapping_add(cont(c1) << 6)
            .wrapping_add(cont(c2)),
        _ => 0,
    };
    value as u8
}
