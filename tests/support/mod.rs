//! Shared fixtures for the integration suite: a frame-capturing sink, a
//! recording handler, and small helpers for wiring a stream to a mock
//! connection.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use streamux::frames::codec::decode_frame;
use streamux::{
    address, dispatch_frame, Controller, Frame, FrameHeader, FrameSink, HostSocket,
    RpcResponseHead, StreamError, StreamHandler, StreamId, StreamOptions, StreamSettings,
};

/// Install a test-friendly tracing subscriber once per process.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Sink that records every buffer handed to the connection.
#[derive(Clone, Default)]
pub struct CaptureSink {
    written: Arc<Mutex<Vec<Bytes>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, as one contiguous byte run.
    pub fn raw(&self) -> Bytes {
        let mut joined = BytesMut::new();
        for buf in self.written.lock().unwrap().iter() {
            joined.extend_from_slice(buf);
        }
        joined.freeze()
    }

    /// Decode everything written so far without consuming it.
    pub fn frames(&self) -> Vec<Frame> {
        let mut joined = BytesMut::new();
        for buf in self.written.lock().unwrap().iter() {
            joined.extend_from_slice(buf);
        }
        let mut buf = joined.freeze();
        let mut frames = Vec::new();
        while let Some(frame) = decode_frame(&mut buf).expect("sink holds malformed frames") {
            frames.push(frame);
        }
        assert!(buf.is_empty(), "sink holds a partial frame");
        frames
    }

    /// Number of socket writes (not frames) performed.
    pub fn write_count(&self) -> usize {
        self.written.lock().unwrap().len()
    }

    pub fn data_frames(&self) -> Vec<(FrameHeader, Bytes)> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Data { header, payload } => Some((header, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn feedback_values(&self) -> Vec<u64> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Feedback { consumed_size, .. } => Some(consumed_size),
                _ => None,
            })
            .collect()
    }

    pub fn close_frames(&self) -> Vec<FrameHeader> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Close { header } => Some(header),
                _ => None,
            })
            .collect()
    }
}

impl FrameSink for CaptureSink {
    fn send(&self, frames: Bytes) -> io::Result<()> {
        self.written.lock().unwrap().push(frames);
        Ok(())
    }
}

/// Sink that refuses every write, simulating a dead connection.
pub struct FailSink;

impl FrameSink for FailSink {
    fn send(&self, _frames: Bytes) -> io::Result<()> {
        Err(io::ErrorKind::BrokenPipe.into())
    }
}

/// Everything a handler observed, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Messages(Vec<Bytes>),
    IdleTimeout,
    Failed(StreamError, String),
    Closed,
}

#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn closed(&self) -> bool {
        self.events().iter().any(|e| matches!(e, Event::Closed))
    }

    pub fn idle_timeouts(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::IdleTimeout))
            .count()
    }

    pub fn messages(&self) -> Vec<Bytes> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                Event::Messages(m) => Some(m.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn message_bytes(&self) -> usize {
        self.messages().iter().map(|m| m.len()).sum()
    }
}

impl StreamHandler for RecordingHandler {
    fn on_received_messages(&self, _id: StreamId, messages: &[Bytes]) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Messages(messages.to_vec()));
    }

    fn on_idle_timeout(&self, _id: StreamId) {
        self.events.lock().unwrap().push(Event::IdleTimeout);
    }

    fn on_failed(&self, _id: StreamId, error: &StreamError, reason: &str) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Failed(error.clone(), reason.to_string()));
    }

    fn on_closed(&self, _id: StreamId) {
        self.events.lock().unwrap().push(Event::Closed);
    }
}

pub fn settings(stream_id: StreamId, need_feedback: bool, writable: bool) -> StreamSettings {
    StreamSettings {
        stream_id,
        need_feedback,
        writable,
        extra_stream_ids: Vec::new(),
    }
}

/// Create one client-side stream and complete its handshake against `host`.
pub fn client_stream(
    host: &Arc<HostSocket>,
    options: &StreamOptions,
    remote: StreamSettings,
    rpc_response: Option<Box<dyn RpcResponseHead>>,
) -> StreamId {
    init_tracing();
    let mut ctrl = Controller::new();
    let ids = streamux::stream_create(&mut ctrl, 1, options, rpc_response).unwrap();
    let stream = address(ids[0]).unwrap();
    stream.set_host_socket(host);
    stream.set_connected(Some(remote)).unwrap();
    ids[0]
}

/// Accept one server-side stream from `remote` and complete its handshake.
pub fn server_stream(
    host: &Arc<HostSocket>,
    options: &StreamOptions,
    remote: StreamSettings,
) -> StreamId {
    init_tracing();
    let mut ctrl = Controller::new();
    ctrl.set_remote_stream_settings(remote);
    let ids = streamux::stream_accept(&mut ctrl, options).unwrap();
    let stream = address(ids[0]).unwrap();
    stream.set_host_socket(host);
    stream.set_connected(None).unwrap();
    ids[0]
}

/// Inject an inbound DATA frame.
pub fn inject_data(
    host: &Arc<HostSocket>,
    dest: StreamId,
    source: StreamId,
    payload: impl Into<Bytes>,
    has_continuation: bool,
) {
    dispatch_frame(
        host,
        Frame::Data {
            header: FrameHeader {
                stream_id: dest,
                source_stream_id: source,
                has_continuation,
            },
            payload: payload.into(),
        },
    )
    .unwrap();
}

/// Inject an inbound FEEDBACK frame.
pub fn inject_feedback(host: &Arc<HostSocket>, dest: StreamId, source: StreamId, consumed: u64) {
    dispatch_frame(
        host,
        Frame::Feedback {
            header: FrameHeader::new(dest, source),
            consumed_size: consumed,
        },
    )
    .unwrap();
}

/// Poll until `cond` holds, yielding to the runtime in between.
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
