//! Public API surface: the free-function interface the RPC layer and
//! applications program against.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::error;

use crate::config::{StreamOptions, StreamWriteOptions};
use crate::error::{Result, StreamError};
use crate::frames::StreamSettings;
use crate::stream::{address, RpcResponseHead, Stream, WritableCallback};
use crate::types::{StreamId, StreamIds};

/// The slice of the RPC call state that stream establishment needs: which
/// streams ride on this call, and (on the accept side) the peer's
/// handshake settings. The full RPC controller is an external
/// collaborator; this models only its stream plumbing.
#[derive(Default)]
pub struct Controller {
    request_streams: StreamIds,
    response_streams: StreamIds,
    remote_stream_settings: Option<StreamSettings>,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the peer's handshake record, as parsed from the request
    /// metadata by the RPC layer.
    pub fn set_remote_stream_settings(&mut self, settings: StreamSettings) {
        self.remote_stream_settings = Some(settings);
    }

    pub fn has_remote_stream(&self) -> bool {
        self.remote_stream_settings.is_some()
    }

    /// Streams created on this call (client side), in creation order.
    pub fn request_streams(&self) -> &[StreamId] {
        &self.request_streams
    }

    /// Streams accepted on this call (server side), in creation order.
    pub fn response_streams(&self) -> &[StreamId] {
        &self.response_streams
    }
}

/// Create `count` client-side streams riding on one RPC call.
///
/// Only the first stream parses the RPC response tail; `rpc_response` is
/// attached to it. Partial failure closes every stream already created.
pub fn stream_create(
    ctrl: &mut Controller,
    count: usize,
    options: &StreamOptions,
    rpc_response: Option<Box<dyn RpcResponseHead>>,
) -> Result<StreamIds> {
    if !ctrl.request_streams.is_empty() {
        error!("request streams were already created on this call");
        return Err(StreamError::InvalidStream);
    }
    if count == 0 {
        return Err(StreamError::InvalidStream);
    }
    let mut head = rpc_response;
    let mut ids = StreamIds::with_capacity(count);
    for _ in 0..count {
        match Stream::create(options.clone(), None, head.take()) {
            Ok(id) => ids.push(id),
            Err(err) => {
                error!(created = ids.len(), %err, "failed to create stream");
                Stream::shutdown_many(&ids, "failed to create a sibling stream");
                return Err(err);
            }
        }
    }
    ctrl.request_streams = ids.clone();
    Ok(ids)
}

/// Accept the stream(s) announced by the peer's handshake settings.
///
/// The first stream takes the settings as-is; every id in
/// `extra_stream_ids` spawns an additional stream sharing the same
/// settings, with the list cleared on the spawned copies.
pub fn stream_accept(ctrl: &mut Controller, options: &StreamOptions) -> Result<StreamIds> {
    if !ctrl.response_streams.is_empty() {
        error!("response streams were already created on this call");
        return Err(StreamError::InvalidStream);
    }
    let remote = match ctrl.remote_stream_settings.clone() {
        Some(remote) => remote,
        None => {
            error!("no stream along with this request");
            return Err(StreamError::InvalidStream);
        }
    };
    let mut ids = StreamIds::with_capacity(1 + remote.extra_stream_ids.len());
    match Stream::create(options.clone(), Some(remote.clone()), None) {
        Ok(id) => ids.push(id),
        Err(err) => {
            error!(%err, "failed to accept stream");
            return Err(err);
        }
    }
    for &extra_id in &remote.extra_stream_ids {
        let mut settings = remote.clone();
        settings.stream_id = extra_id;
        settings.extra_stream_ids.clear();
        match Stream::create(options.clone(), Some(settings), None) {
            Ok(id) => ids.push(id),
            Err(err) => {
                error!(accepted = ids.len(), %err, "failed to accept extra stream");
                Stream::shutdown_many(&ids, "failed to accept a sibling stream");
                return Err(err);
            }
        }
    }
    ctrl.response_streams = ids.clone();
    Ok(ids)
}

/// Write one message to a stream.
///
/// `Err(WindowFull)` means the send window is out of credit: wait for
/// writability and retry. An id that no longer resolves yields
/// `Err(InvalidStream)`.
pub fn stream_write(id: StreamId, payload: Bytes) -> Result<()> {
    stream_write_opts(id, payload, &StreamWriteOptions::default())
}

pub fn stream_write_opts(
    id: StreamId,
    payload: Bytes,
    options: &StreamWriteOptions,
) -> Result<()> {
    let stream = address(id).ok_or(StreamError::InvalidStream)?;
    stream.write_opts(payload, options)
}

/// Park the caller until `id` is writable, its stream closes, or `timeout`
/// elapses.
pub async fn stream_wait(id: StreamId, timeout: Option<Duration>) -> Result<()> {
    let stream = address(id).ok_or(StreamError::InvalidStream)?;
    let deadline = timeout.map(|t| Instant::now() + t);
    stream.wait(deadline).await
}

/// Callback form of [`stream_wait`]: `on_writable` runs on a fresh task
/// with the outcome, including `Err(InvalidStream)` for ids that no longer
/// resolve.
pub fn stream_wait_with(id: StreamId, timeout: Option<Duration>, on_writable: WritableCallback) {
    match address(id) {
        Some(stream) => {
            let deadline = timeout.map(|t| Instant::now() + t);
            stream.wait_with(deadline, on_writable);
        }
        None => {
            tokio::spawn(async move { on_writable(id, Err(StreamError::InvalidStream)) });
        }
    }
}

/// Gracefully close a stream. Unknown ids are ignored.
pub fn stream_close(id: StreamId) {
    Stream::shutdown(id, "local close");
}
