// wire/mod.rs - ACN Wire Protocol

//! Message taxonomy and framing shared by clients and peer nodes.
//!
//! - **Messages**: [`AcnMessage`] is a closed enum over the five performatives
//! - **Codec**: 4-byte big-endian length prefix over a protobuf payload
//!
//! # Example
//!
//! ```ignore
//! use acn::wire::{codec, AcnMessage, Status};
//!
//! let frame = codec::encode(&AcnMessage::Status(Status::success()));
//! let msg = codec::decode(&frame)?;
//! ```

pub mod codec;
mod message;

pub use codec::{AcnCodec, CodecError, MAX_FRAME_LEN, PROTOCOL_VERSION, RawFrameCodec};
pub use message::{AcnMessage, AgentRecord, Envelope, Status, StatusCode};
