//! # streamux: multiplexed message streams over one RPC connection
//!
//! This crate layers any number of independent, bidirectional,
//! message-oriented streams on top of a single reliable byte connection.
//! Each stream delivers ordered messages in both directions with
//! credit-based backpressure, idle-timeout detection, and graceful or
//! abortive close.
//!
//! ## Architecture Overview
//!
//! ```text
//! streamux/
//! ├── error         - unified error enum with errno-style codes
//! ├── config        - per-stream options and process-wide runtime flags
//! ├── frames        - wire frames (DATA / FEEDBACK / RST / CLOSE), codec,
//! │                   segmentation and coalescing
//! ├── flow_control  - the sliding write window and writability waiters
//! ├── host          - the shared connection: FrameSink, HostSocket, dispatch
//! ├── stream        - stream lifecycle, write path, consumer pipeline
//! └── api           - free-function surface: create/accept/write/wait/close
//! ```
//!
//! ## Data Flow
//!
//! Send side: payload → window admission → segmentation into DATA frames →
//! host socket. Receive side: host socket → [`dispatch_frame`] → per-stream
//! reassembly → ordered consumer task → [`StreamHandler::on_received_messages`]
//! → cumulative FEEDBACK back to the sender.
//!
//! The sole backpressure channel is the credit window: writes fail with
//! [`StreamError::WindowFull`] when the peer has not consumed enough, and
//! [`stream_wait`] parks the writer until credit returns. Under shared-socket
//! pressure the window shrinks toward `min_buf_size` and grows back toward
//! `max_buf_size` as the peer catches up.
//!
//! ## Usage Sketch
//!
//! ```rust,ignore
//! use streamux::{Controller, StreamOptions, stream_create, stream_write};
//!
//! let mut ctrl = Controller::new();
//! let ids = stream_create(&mut ctrl, 1, &StreamOptions::default(), None)?;
//! // ... RPC handshake carries fill_settings() to the peer ...
//! match stream_write(ids[0], payload) {
//!     Ok(()) => {}
//!     Err(e) if e.is_retryable() => { /* stream_wait, then retry */ }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod error;
pub(crate) mod flow_control;
pub mod frames;
pub mod host;
pub mod stream;
pub mod types;

pub use api::{
    stream_accept, stream_close, stream_create, stream_wait, stream_wait_with, stream_write,
    stream_write_opts, Controller,
};
pub use config::{flags, RuntimeFlags, StreamOptions, StreamWriteOptions};
pub use error::{Result, StreamError};
pub use frames::{Frame, FrameHeader, FrameType, StreamSettings};
pub use host::{dispatch_buffer, dispatch_frame, FrameSink, HostSocket};
pub use stream::{
    address, ConnectCallback, RpcResponseHead, Stream, StreamHandler, WritableCallback,
};
pub use types::{StreamId, StreamIds, INVALID_STREAM_ID};
