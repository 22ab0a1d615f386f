//! The shared connection underneath every stream.
//!
//! Streams never touch the wire directly: they hand encoded frames to a
//! [`HostSocket`], which wraps the byte-out half of the RPC connection and
//! carries the state all its streams share: the unconsumed-bytes accountant
//! driving the dynamic window policy, and the registry of stream ids
//! multiplexed on it.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{Result, StreamError};
use crate::frames::{codec, Frame};
use crate::stream::{self, Stream};
use crate::types::StreamId;

/// Byte-out half of the shared reliable connection.
///
/// Implemented by the RPC socket in production and by capture mocks in
/// tests. Each call carries one or more complete frames and must be written
/// atomically with respect to other calls.
pub trait FrameSink: Send + Sync + 'static {
    fn send(&self, frames: Bytes) -> io::Result<()>;
}

/// One reliable connection shared by many streams.
pub struct HostSocket {
    sink: Box<dyn FrameSink>,
    /// DATA bytes written but not yet consumed across every stream on this
    /// socket. Compared against the process-wide cap to shrink or grow
    /// per-stream windows.
    unconsumed: AtomicI64,
    streams: Mutex<HashSet<StreamId>>,
}

impl HostSocket {
    pub fn new(sink: impl FrameSink) -> Arc<Self> {
        Arc::new(Self {
            sink: Box::new(sink),
            unconsumed: AtomicI64::new(0),
            streams: Mutex::new(HashSet::new()),
        })
    }

    /// Submit an encoded frame batch to the connection.
    pub(crate) fn write_frames(&self, frames: Bytes) -> io::Result<()> {
        self.sink.send(frames)
    }

    pub(crate) fn unconsumed(&self) -> &AtomicI64 {
        &self.unconsumed
    }

    /// Current unconsumed-byte total across all streams on this socket.
    pub fn unconsumed_bytes(&self) -> i64 {
        self.unconsumed.load(Ordering::Relaxed)
    }

    pub(crate) fn add_stream(&self, id: StreamId) {
        self.streams.lock().unwrap().insert(id);
    }

    pub(crate) fn remove_stream(&self, id: StreamId) {
        self.streams.lock().unwrap().remove(&id);
    }

    /// Number of streams currently attached.
    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// Fail every stream multiplexed on this socket. Called by the owner
    /// when the underlying connection is lost.
    pub fn fail_all(&self, reason: &str) {
        let ids: Vec<StreamId> = self.streams.lock().unwrap().iter().copied().collect();
        debug!(streams = ids.len(), reason, "host socket failed");
        for id in ids {
            Stream::set_failed(id, StreamError::ConnectionReset, reason);
        }
    }
}

/// Route one inbound frame to its destination stream.
///
/// Frames for ids that no longer resolve are dropped silently (the stream
/// was already recycled). Unknown frame types are logged and rejected.
pub fn dispatch_frame(host: &Arc<HostSocket>, frame: Frame) -> Result<()> {
    if let Frame::Unknown { frame_type, header } = &frame {
        warn!(
            frame_type,
            stream = header.stream_id,
            "received frame of unknown type"
        );
        return Err(StreamError::UnknownFrameType(*frame_type));
    }
    match stream::address(frame.header().stream_id) {
        Some(stream) => stream.on_received(host, frame),
        None => {
            debug!(
                stream = frame.header().stream_id,
                "frame for an unknown stream, dropped"
            );
            Ok(())
        }
    }
}

/// Decode and dispatch every complete frame in `buf`, leaving any trailing
/// partial frame in place for the next read.
pub fn dispatch_buffer(host: &Arc<HostSocket>, buf: &mut Bytes) -> Result<()> {
    while let Some(frame) = codec::decode_frame(buf)? {
        dispatch_frame(host, frame)?;
    }
    Ok(())
}
