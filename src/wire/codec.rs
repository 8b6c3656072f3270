// wire/codec.rs - Length-prefixed Frame Codec

//! Every frame on an ACN stream is `u32 big-endian length || payload`.
//!
//! The pure functions ([`encode`], [`decode`], [`decode_frame`]) are what the
//! stream codecs ([`RawFrameCodec`], [`AcnCodec`]) are built from. A reader
//! that sees [`CodecError::Incomplete`] keeps buffering; every other error is
//! a protocol error that ends the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::message::{AcnMessage, StatusCode};
use crate::proto;

/// Protocol version written on every outgoing message
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Size of the length header
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload accepted on any stream (3 MiB)
pub const MAX_FRAME_LEN: usize = 3 * 1024 * 1024;

/// Errors produced while framing or decoding ACN messages
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Incomplete frame: {needed} more bytes required")]
    Incomplete { needed: usize },

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Frame declares {declared} bytes but {available} are present")]
    TrailingBytes { declared: usize, available: usize },

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Message carries no performative")]
    EmptyPayload,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Status reported to the remote side for this failure
    pub fn status_code(&self) -> StatusCode {
        match self {
            CodecError::EmptyPayload => StatusCode::ErrorUnexpectedPayload,
            CodecError::UnsupportedVersion(_) => StatusCode::ErrorUnsupportedVersion,
            CodecError::Incomplete { .. }
            | CodecError::FrameTooLarge { .. }
            | CodecError::TrailingBytes { .. }
            | CodecError::Malformed(_)
            | CodecError::Io(_) => StatusCode::ErrorDecode,
        }
    }

    /// True when the reader should wait for more bytes
    pub fn is_incomplete(&self) -> bool {
        matches!(self, CodecError::Incomplete { .. })
    }
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// Serialize a message without the length header
pub fn encode_payload(msg: &AcnMessage) -> Vec<u8> {
    msg.clone().into_proto(PROTOCOL_VERSION).encode_to_vec()
}

/// Length of the payload [`encode_payload`] would produce
pub fn payload_len(msg: &AcnMessage) -> usize {
    msg.clone().into_proto(PROTOCOL_VERSION).encoded_len()
}

/// Deserialize a payload (no length header) into exactly one message
pub fn decode_payload(payload: &[u8]) -> Result<AcnMessage, CodecError> {
    let raw = proto::AcnMessage::decode(payload).map_err(|e| CodecError::Malformed(e.to_string()))?;
    if !raw.version.is_empty() && major(&raw.version) != major(PROTOCOL_VERSION) {
        return Err(CodecError::UnsupportedVersion(raw.version));
    }
    AcnMessage::from_proto(raw)
}

/// Encode a message as a complete frame
pub fn encode(msg: &AcnMessage) -> Vec<u8> {
    let payload = encode_payload(msg);
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Read the declared payload length from the start of `buf`.
///
/// Returns `Incomplete` when the header itself is not yet available.
pub fn peek_frame_len(buf: &[u8], max_frame_len: usize) -> Result<usize, CodecError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(CodecError::Incomplete {
            needed: FRAME_HEADER_LEN - buf.len(),
        });
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max_frame_len {
        return Err(CodecError::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }
    Ok(len)
}

/// Decode one frame from the start of `buf`, returning the message and the
/// number of bytes consumed. Extra bytes after the frame are left alone.
pub fn decode_frame(buf: &[u8]) -> Result<(AcnMessage, usize), CodecError> {
    let len = peek_frame_len(buf, MAX_FRAME_LEN)?;
    let total = FRAME_HEADER_LEN + len;
    if buf.len() < total {
        return Err(CodecError::Incomplete {
            needed: total - buf.len(),
        });
    }
    let msg = decode_payload(&buf[FRAME_HEADER_LEN..total])?;
    Ok((msg, total))
}

/// Decode exactly one frame; the declared length must match the input length
pub fn decode(bytes: &[u8]) -> Result<AcnMessage, CodecError> {
    let len = peek_frame_len(bytes, MAX_FRAME_LEN)?;
    let available = bytes.len() - FRAME_HEADER_LEN;
    if available > len {
        return Err(CodecError::TrailingBytes {
            declared: len,
            available,
        });
    }
    let (msg, _) = decode_frame(bytes)?;
    Ok(msg)
}

/// Stream codec yielding raw frame payloads
#[derive(Clone, Debug)]
pub struct RawFrameCodec {
    max_frame_len: usize,
}

impl RawFrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

impl Default for RawFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RawFrameCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, CodecError> {
        let len = match peek_frame_len(src, self.max_frame_len) {
            Ok(len) => len,
            Err(CodecError::Incomplete { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let total = FRAME_HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(FRAME_HEADER_LEN);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for RawFrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        if item.len() > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len: item.len(),
                max: self.max_frame_len,
            });
        }
        dst.reserve(FRAME_HEADER_LEN + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Stream codec yielding decoded [`AcnMessage`]s
#[derive(Clone, Debug, Default)]
pub struct AcnCodec {
    frames: RawFrameCodec,
}

impl AcnCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for AcnCodec {
    type Item = AcnMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<AcnMessage>, CodecError> {
        match self.frames.decode(src)? {
            Some(frame) => decode_payload(&frame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<AcnMessage> for AcnCodec {
    type Error = CodecError;

    fn encode(&mut self, item: AcnMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = item.into_proto(PROTOCOL_VERSION).encode_to_vec();
        self.frames.encode(Bytes::from(payload), dst)
    }
}
