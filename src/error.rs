//! Error types for stream operations.

use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors surfaced by the stream layer.
///
/// Only loss of transport or protocol integrity closes a stream;
/// [`StreamError::WindowFull`] and [`StreamError::TimedOut`] are retry hints
/// that leave the stream untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The send window has no credit left; retry after waiting for
    /// writability.
    #[error("stream write window is full")]
    WindowFull,

    /// The id does not name a live stream (never created, or already
    /// closed and recycled).
    #[error("unknown or closed stream")]
    InvalidStream,

    /// The stream has not finished its handshake yet.
    #[error("stream is not connected")]
    NotConnected,

    /// The remote side registered no handler and refuses data.
    #[error("remote side of the stream is not writable")]
    NotWritable,

    /// The peer reset the stream or the shared connection failed.
    #[error("connection reset")]
    ConnectionReset,

    /// A wait deadline elapsed before the window opened.
    #[error("deadline exceeded")]
    TimedOut,

    /// The first inbound payload of a client stream was not a parsable
    /// RPC response.
    #[error("malformed rpc response")]
    Protocol,

    /// The per-stream consumer queue rejected a submission.
    #[error("consumer queue closed")]
    QueueClosed,

    /// Inbound bytes ended in the middle of a frame.
    #[error("truncated frame")]
    Truncated,

    /// Inbound frame carried a type byte this implementation does not know.
    #[error("unknown frame type {0:#04x}")]
    UnknownFrameType(u8),
}

impl StreamError {
    /// errno-style code carried in close reasons and handler callbacks.
    pub fn code(&self) -> i32 {
        match self {
            StreamError::WindowFull => 11,          // EAGAIN
            StreamError::InvalidStream => 22,       // EINVAL
            StreamError::NotConnected => 107,       // ENOTCONN
            StreamError::NotWritable => 9,          // EBADF
            StreamError::ConnectionReset => 104,    // ECONNRESET
            StreamError::TimedOut => 110,           // ETIMEDOUT
            StreamError::Protocol => 71,            // EPROTO
            StreamError::QueueClosed => 125,        // ECANCELED
            StreamError::Truncated => 74,           // EBADMSG
            StreamError::UnknownFrameType(_) => 74, // EBADMSG
        }
    }

    /// Whether a write should be retried after waiting for the window.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::WindowFull)
    }
}
