//! Wire frame model shared by the send and receive paths.
//!
//! Every frame is a fixed header plus an optional payload. DATA frames
//! carry application bytes (possibly one segment of a larger message),
//! FEEDBACK carries the peer's cumulative consumed-byte count, RST and
//! CLOSE tear the stream down abnormally / gracefully.

pub mod codec;

pub use codec::{cut_messages, decode_frame, encode_frame, encode_single, FRAME_HEADER_LEN};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::StreamId;

/// Frame type discriminants as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data = 0x01,
    Feedback = 0x02,
    Rst = 0x03,
    Close = 0x04,
    /// Anything this implementation does not know; rejected at dispatch.
    Unknown = 0x00,
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x01 => FrameType::Data,
            0x02 => FrameType::Feedback,
            0x03 => FrameType::Rst,
            0x04 => FrameType::Close,
            _ => FrameType::Unknown,
        }
    }
}

/// Fixed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Destination stream: the peer's id for outbound frames, ours for
    /// inbound ones.
    pub stream_id: StreamId,

    /// The originating stream on the sender's side.
    pub source_stream_id: StreamId,

    /// DATA only: this payload is a non-terminal segment of a larger
    /// message.
    pub has_continuation: bool,
}

impl FrameHeader {
    pub fn new(stream_id: StreamId, source_stream_id: StreamId) -> Self {
        Self {
            stream_id,
            source_stream_id,
            has_continuation: false,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data { header: FrameHeader, payload: Bytes },
    Feedback { header: FrameHeader, consumed_size: u64 },
    Rst { header: FrameHeader },
    Close { header: FrameHeader },
    /// Unrecognized type byte; payload is skipped, header preserved for
    /// logging.
    Unknown { frame_type: u8, header: FrameHeader },
}

impl Frame {
    pub fn header(&self) -> &FrameHeader {
        match self {
            Frame::Data { header, .. }
            | Frame::Feedback { header, .. }
            | Frame::Rst { header }
            | Frame::Close { header }
            | Frame::Unknown { header, .. } => header,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Data { .. } => FrameType::Data,
            Frame::Feedback { .. } => FrameType::Feedback,
            Frame::Rst { .. } => FrameType::Rst,
            Frame::Close { .. } => FrameType::Close,
            Frame::Unknown { .. } => FrameType::Unknown,
        }
    }
}

/// Handshake record exchanged when a stream is established. Carried in the
/// RPC request/response metadata by the surrounding RPC layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// The sender's id for this stream; the receiver uses it as the
    /// destination of everything it emits back.
    pub stream_id: StreamId,

    /// The sender runs with a bounded window and expects cumulative
    /// FEEDBACK frames.
    pub need_feedback: bool,

    /// The sender registered a handler and accepts inbound data.
    pub writable: bool,

    /// Additional streams spawned by the same accept call; cleared on the
    /// settings handed to each spawned copy.
    pub extra_stream_ids: Vec<StreamId>,
}
