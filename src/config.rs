//! Stream options and process-wide runtime flags.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::warn;

use crate::stream::StreamHandler;

/// Default upper bound on the per-stream send window.
pub const DEFAULT_MAX_BUF_SIZE: i64 = 2 * 1024 * 1024;

/// Default cap on messages delivered per `on_received_messages` call.
pub const DEFAULT_MESSAGES_IN_BATCH: usize = 128;

/// Default segmentation threshold for outbound DATA payloads.
pub const DEFAULT_WRITE_MAX_SEGMENT_SIZE: u64 = 512 * 1024 * 1024;

/// Per-stream configuration, fixed at creation time.
#[derive(Clone)]
pub struct StreamOptions {
    /// Upper bound on the send window in bytes; 0 disables flow control.
    pub max_buf_size: i64,

    /// Floor the window may be clamped to under shared-socket pressure.
    /// Ignored (reset to 0 with a warning) if larger than `max_buf_size`.
    pub min_buf_size: i64,

    /// Fire `on_idle_timeout` after this much wall time without inbound
    /// payload; negative disables the idle timer.
    pub idle_timeout_ms: i64,

    /// Maximum messages delivered per `on_received_messages` call.
    pub messages_in_batch: usize,

    /// Receive-side callback bundle. `None` makes the stream write-only:
    /// the peer is told `writable = false` and refuses data for it.
    pub handler: Option<Arc<dyn StreamHandler>>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_buf_size: DEFAULT_MAX_BUF_SIZE,
            min_buf_size: 0,
            idle_timeout_ms: -1,
            messages_in_batch: DEFAULT_MESSAGES_IN_BATCH,
            handler: None,
        }
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("max_buf_size", &self.max_buf_size)
            .field("min_buf_size", &self.min_buf_size)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .field("messages_in_batch", &self.messages_in_batch)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl StreamOptions {
    /// Apply the documented fixups: an out-of-range `min_buf_size` is reset
    /// to 0 rather than rejected.
    pub(crate) fn normalized(mut self) -> Self {
        if self.max_buf_size > 0 && self.min_buf_size > self.max_buf_size {
            warn!(
                min_buf_size = self.min_buf_size,
                max_buf_size = self.max_buf_size,
                "min_buf_size is larger than max_buf_size, resetting it to 0"
            );
            self.min_buf_size = 0;
        }
        self
    }
}

/// Per-call write options.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamWriteOptions {
    /// Hand the socket submission to a background task instead of writing
    /// inline. A failed background write fails the stream rather than the
    /// write call.
    pub write_in_background: bool,
}

/// Process-wide tunables, mirroring the command-line surface of the
/// original system. Read at stream creation, on every write, and when
/// feedback is applied.
#[derive(Debug)]
pub struct RuntimeFlags {
    write_max_segment_size: AtomicU64,
    socket_max_streams_unconsumed_bytes: AtomicI64,
}

static FLAGS: Lazy<RuntimeFlags> = Lazy::new(|| RuntimeFlags {
    write_max_segment_size: AtomicU64::new(DEFAULT_WRITE_MAX_SEGMENT_SIZE),
    socket_max_streams_unconsumed_bytes: AtomicI64::new(0),
});

/// The process-wide flag set.
pub fn flags() -> &'static RuntimeFlags {
    &FLAGS
}

impl RuntimeFlags {
    /// Outbound payloads above this size are split into continuation runs.
    pub fn write_max_segment_size(&self) -> u64 {
        self.write_max_segment_size.load(Ordering::Relaxed)
    }

    /// Set the segmentation threshold. Must be positive.
    pub fn set_write_max_segment_size(&self, value: u64) -> std::result::Result<(), String> {
        if value == 0 {
            return Err("write_max_segment_size must be positive".into());
        }
        self.write_max_segment_size.store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Cap on unconsumed DATA bytes across every stream of one socket;
    /// values <= 0 disable the dynamic window policy.
    pub fn socket_max_streams_unconsumed_bytes(&self) -> i64 {
        self.socket_max_streams_unconsumed_bytes.load(Ordering::Relaxed)
    }

    /// Enable or disable the dynamic window policy.
    pub fn set_socket_max_streams_unconsumed_bytes(&self, value: i64) {
        self.socket_max_streams_unconsumed_bytes
            .store(value, Ordering::Relaxed);
    }
}
