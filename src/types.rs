//! Small shared types.

/// Process-unique identifier of a stream.
///
/// Ids are allocated from a process-wide counter and resolved back to live
/// streams through the registry; they stay valid until the stream closes.
pub type StreamId = u64;

/// A batch of stream ids, in creation order.
pub type StreamIds = Vec<StreamId>;

/// Sentinel id that never names a live stream.
pub const INVALID_STREAM_ID: StreamId = u64::MAX;
