//! Frame codec.
//!
//! Events travel either as JSON in text frames or as MessagePack in binary
//! frames. Both sides decode whichever arrives; a server answers in the
//! format the client last used.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Maximum encoded frame size accepted by the decoder (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encoding used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON in text frames.
    #[default]
    Json,
    /// MessagePack (named fields) in binary frames.
    MessagePack,
}

/// A transport-agnostic frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// The format implied by the frame kind.
    pub fn format(&self) -> WireFormat {
        match self {
            Frame::Text(_) => WireFormat::Json,
            Frame::Binary(_) => WireFormat::MessagePack,
        }
    }

    fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }
}

/// Encodes a value into a frame of the given format.
pub fn encode<T: Serialize>(format: WireFormat, value: &T) -> Result<Frame> {
    match format {
        WireFormat::Json => Ok(Frame::Text(serde_json::to_string(value)?)),
        WireFormat::MessagePack => Ok(Frame::Binary(rmp_serde::to_vec_named(value)?)),
    }
}

/// Decodes a frame, picking the format from the frame kind.
pub fn decode<T: DeserializeOwned>(frame: &Frame) -> Result<T> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    match frame {
        Frame::Text(text) => Ok(serde_json::from_str(text)?),
        Frame::Binary(bytes) => Ok(rmp_serde::from_slice(bytes)?),
    }
}
