//! Stream objects: lifecycle, connect, the write path, and close semantics.
//!
//! A stream is created *pending*, becomes *connected* once the RPC
//! handshake delivers the peer's [`StreamSettings`], and ends *closed*,
//! whether locally, by a peer RST/CLOSE frame, or by host-socket failure. Two
//! mutexes guard disjoint state (connect/lifecycle and the congestion
//! window); neither is ever held across a suspension point or a user
//! callback.

pub(crate) mod consumer;
pub(crate) mod registry;

pub use registry::address;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::config::{flags, StreamOptions, StreamWriteOptions};
use crate::error::{Result, StreamError};
use crate::flow_control::{FlowController, WaitDecision};
use crate::frames::{codec, Frame, FrameHeader, StreamSettings};
use crate::host::HostSocket;
use crate::types::StreamId;

/// Callback bundle observing the receive side of a stream.
///
/// All callbacks run on the stream's consumer task, one at a time, in
/// order. `on_closed` is the last callback a stream ever makes;
/// `on_failed` (abnormal close only) strictly precedes it.
pub trait StreamHandler: Send + Sync + 'static {
    /// Ordered, batched message delivery. The buffers belong to the
    /// pipeline and are reclaimed when the call returns.
    fn on_received_messages(&self, id: StreamId, messages: &[Bytes]);

    /// No payload arrived within `idle_timeout_ms`.
    fn on_idle_timeout(&self, _id: StreamId) {}

    /// The stream closed abnormally.
    fn on_failed(&self, _id: StreamId, _error: &StreamError, _reason: &str) {}

    /// Terminal callback, fired exactly once.
    fn on_closed(&self, id: StreamId);
}

/// Completion for [`Stream::connect`]: invoked exactly once with the final
/// outcome, on a fresh task.
pub type ConnectCallback = Box<dyn FnOnce(StreamId, Result<()>) + Send + 'static>;

/// Completion for the callback form of waiting: `Ok(())` means writable.
pub type WritableCallback = Box<dyn FnOnce(StreamId, Result<()>) + Send + 'static>;

/// Consumer of the first inbound payload on a client-created stream: the
/// tail of the RPC response, which belongs to the RPC dispatcher rather
/// than the user handler. A parse failure closes the stream with
/// [`StreamError::Protocol`].
pub trait RpcResponseHead: Send + 'static {
    fn handle(self: Box<Self>, id: StreamId, payload: Bytes) -> Result<()>;
}

impl<F> RpcResponseHead for F
where
    F: FnOnce(StreamId, Bytes) -> Result<()> + Send + 'static,
{
    fn handle(self: Box<Self>, id: StreamId, payload: Bytes) -> Result<()> {
        (*self)(id, payload)
    }
}

/// Work item on the per-stream consumer queue.
pub(crate) enum ConsumerItem {
    /// A fully reassembled application message.
    Message(Bytes),
    /// Synthetic tick from the idle timer; only observable when a drain
    /// delivers no message bytes.
    IdleTick,
}

struct ConnectState {
    connected: bool,
    connect_registered: bool,
    connect_cb: Option<ConnectCallback>,
    connect_outcome: Option<Result<()>>,
    remote: Option<StreamSettings>,
    error: Option<StreamError>,
    error_text: String,
}

/// One logical, bidirectional, ordered message channel multiplexed over a
/// shared connection.
pub struct Stream {
    id: StreamId,
    options: StreamOptions,
    host: OnceCell<Arc<HostSocket>>,
    flow: FlowController,
    state: Mutex<ConnectState>,
    closed: AtomicBool,
    /// Write-side failure latch: set on close so in-flight submissions
    /// stop reaching the sink.
    failed: AtomicBool,
    local_consumed: AtomicU64,
    /// Reassembly buffer for a multi-frame message; touched only from the
    /// dispatch path.
    pending: Mutex<Option<BytesMut>>,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<ConsumerItem>>>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    /// Serializes segment runs from concurrent writers.
    emit_lock: Mutex<()>,
}

/// Run a user callback on a fresh task, falling back to inline execution
/// when no runtime is reachable.
fn spawn_callback(f: impl FnOnce() + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { f() });
        }
        Err(_) => f(),
    }
}

impl Stream {
    /// Allocate a stream and start its consumer pipeline.
    ///
    /// `remote_settings` is provided on the accept (server) side; on the
    /// create (client) side it arrives later through
    /// [`Stream::set_connected`]. `rpc_response` marks the client stream
    /// whose first inbound payload is the RPC response tail.
    pub fn create(
        options: StreamOptions,
        remote_settings: Option<StreamSettings>,
        rpc_response: Option<Box<dyn RpcResponseHead>>,
    ) -> Result<StreamId> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| StreamError::QueueClosed)?;
        let options = options.normalized();
        let max_buf_size = options.max_buf_size.max(0) as u64;
        let min_buf_size = options.min_buf_size.max(0) as u64;
        let initial = if flags().socket_max_streams_unconsumed_bytes() > 0 && min_buf_size > 0 {
            min_buf_size
        } else {
            max_buf_size
        };

        let id = registry::allocate_id();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let stream = Arc::new(Stream {
            id,
            flow: FlowController::new(id, initial, min_buf_size, max_buf_size),
            state: Mutex::new(ConnectState {
                connected: false,
                connect_registered: false,
                connect_cb: None,
                connect_outcome: None,
                remote: remote_settings,
                error: None,
                error_text: String::new(),
            }),
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            local_consumed: AtomicU64::new(0),
            pending: Mutex::new(None),
            queue_tx: Mutex::new(Some(queue_tx)),
            idle_timer: Mutex::new(None),
            emit_lock: Mutex::new(()),
            host: OnceCell::new(),
            options,
        });
        registry::insert(stream.clone());
        runtime.spawn(consumer::run(stream, queue_rx, rpc_response));
        Ok(id)
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The abnormal close reason, if any.
    pub fn error(&self) -> Option<(StreamError, String)> {
        let st = self.state.lock().unwrap();
        st.error.clone().map(|e| (e, st.error_text.clone()))
    }

    /// Cumulative DATA payload bytes handed to the socket while the window
    /// was active.
    pub fn produced(&self) -> u64 {
        self.flow.produced()
    }

    /// Cumulative bytes the peer acknowledged via FEEDBACK.
    pub fn remote_consumed(&self) -> u64 {
        self.flow.remote_consumed()
    }

    /// Current admission window; 0 means flow control is off.
    pub fn cur_buf_size(&self) -> u64 {
        self.flow.cur_buf_size()
    }

    /// Cumulative bytes delivered to the local handler.
    pub fn local_consumed(&self) -> u64 {
        self.local_consumed.load(Ordering::Relaxed)
    }

    /// Associate the stream with the shared connection. The first call
    /// wins; later calls are no-ops, so the dispatch path can invoke this
    /// unconditionally.
    pub fn set_host_socket(&self, host: &Arc<HostSocket>) {
        self.host.get_or_init(|| {
            host.add_stream(self.id);
            host.clone()
        });
    }

    /// The handshake record announced to the peer.
    pub fn fill_settings(&self) -> StreamSettings {
        StreamSettings {
            stream_id: self.id,
            need_feedback: self.flow.cur_buf_size() > 0,
            writable: self.options.handler.is_some(),
            extra_stream_ids: Vec::new(),
        }
    }

    /// Register the connect completion. Must be called at most once; fires
    /// immediately (on a fresh task) if the outcome is already known.
    pub fn connect(&self, on_connect: ConnectCallback) -> Result<()> {
        let ready = {
            let mut st = self.state.lock().unwrap();
            if st.connect_registered {
                return Err(StreamError::InvalidStream);
            }
            st.connect_registered = true;
            match st.connect_outcome.clone() {
                Some(outcome) => Some((on_connect, outcome)),
                None => {
                    st.connect_cb = Some(on_connect);
                    None
                }
            }
        };
        if let Some((cb, outcome)) = ready {
            let id = self.id;
            spawn_callback(move || cb(id, outcome));
        }
        Ok(())
    }

    /// Mark the stream connected, merging the peer's settings when they
    /// were not supplied at creation. Fires the pending connect callback
    /// and, on the server side (settings known since creation), starts the
    /// idle timer; the client side starts it after the first inbound
    /// payload.
    pub fn set_connected(self: &Arc<Self>, remote_settings: Option<StreamSettings>) -> Result<()> {
        let server_side = remote_settings.is_none();
        let connect_cb = {
            let mut st = self.state.lock().unwrap();
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            if st.connected {
                return Err(StreamError::InvalidStream);
            }
            match remote_settings {
                Some(settings) => {
                    if st.remote.is_some() {
                        return Err(StreamError::InvalidStream);
                    }
                    st.remote = Some(settings);
                }
                None => {
                    if st.remote.is_none() {
                        return Err(StreamError::NotConnected);
                    }
                }
            }
            debug_assert!(self.host.get().is_some());
            st.connected = true;
            st.connect_outcome = Some(Ok(()));
            debug!(
                stream = self.id,
                remote_stream = st.remote.as_ref().map(|r| r.stream_id),
                "stream connected"
            );
            st.connect_cb.take()
        };
        if let Some(cb) = connect_cb {
            let id = self.id;
            spawn_callback(move || cb(id, Ok(())));
        }
        if server_side {
            self.start_idle_timer();
        }
        Ok(())
    }

    /// Write one message, gated by the send window.
    ///
    /// [`StreamError::WindowFull`] is the retry hint: wait for writability
    /// and try again.
    pub fn write(self: &Arc<Self>, payload: Bytes) -> Result<()> {
        self.write_opts(payload, &StreamWriteOptions::default())
    }

    pub fn write_opts(self: &Arc<Self>, payload: Bytes, options: &StreamWriteOptions) -> Result<()> {
        let len = payload.len();
        let counted = self.flow.admit(len)?;
        match self.emit_data(payload, options) {
            Ok(()) => {
                if flags().socket_max_streams_unconsumed_bytes() > 0 {
                    if let Some(host) = self.host.get() {
                        host.unconsumed().fetch_add(len as i64, Ordering::Relaxed);
                    }
                }
                Ok(())
            }
            Err(err) => {
                if counted {
                    self.flow.rollback(len);
                }
                Err(err)
            }
        }
    }

    fn emit_data(self: &Arc<Self>, payload: Bytes, options: &StreamWriteOptions) -> Result<()> {
        let host = self.host.get().ok_or(StreamError::NotConnected)?.clone();
        if self.failed.load(Ordering::SeqCst) {
            return Err(StreamError::ConnectionReset);
        }
        let remote = {
            let st = self.state.lock().unwrap();
            st.remote.clone().ok_or(StreamError::NotConnected)?
        };
        if !remote.writable {
            warn!(
                stream = self.id,
                remote_stream = remote.stream_id,
                "remote side of the stream has no handler"
            );
            return Err(StreamError::NotWritable);
        }
        let max_segment = flags().write_max_segment_size() as usize;
        let mut writes = Vec::new();
        codec::cut_messages(remote.stream_id, self.id, vec![payload], max_segment, &mut writes);

        if options.write_in_background {
            let stream = self.clone();
            tokio::spawn(async move {
                if let Err(err) = stream.submit_writes(&host, writes) {
                    warn!(stream = stream.id, %err, "background stream write failed");
                    stream.close(
                        Some(StreamError::ConnectionReset),
                        "background write to the host socket failed",
                    );
                }
            });
            Ok(())
        } else {
            self.submit_writes(&host, writes)
        }
    }

    fn submit_writes(&self, host: &HostSocket, writes: Vec<Bytes>) -> Result<()> {
        let _serialized = self.emit_lock.lock().unwrap();
        for buf in writes {
            if self.failed.load(Ordering::SeqCst) {
                return Err(StreamError::ConnectionReset);
            }
            host.write_frames(buf).map_err(|err| {
                warn!(stream = self.id, %err, "failed to write to the host socket");
                StreamError::ConnectionReset
            })?;
        }
        Ok(())
    }

    /// Park until the window has credit, the deadline fires, or the stream
    /// closes. Resolves immediately when flow control is off or the window
    /// already has space.
    pub async fn wait(&self, deadline: Option<Instant>) -> Result<()> {
        let parked = match self.flow.wait() {
            WaitDecision::Resolved(result) => return result,
            WaitDecision::Parked(rx) => rx,
        };
        match deadline {
            Some(deadline) => match time::timeout_at(deadline, parked).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(StreamError::ConnectionReset),
                Err(_) => Err(StreamError::TimedOut),
            },
            None => parked.await.unwrap_or(Err(StreamError::ConnectionReset)),
        }
    }

    /// Callback form of [`Stream::wait`]: runs `on_writable` on a fresh
    /// task once the outcome is known.
    pub fn wait_with(self: &Arc<Self>, deadline: Option<Instant>, on_writable: WritableCallback) {
        let stream = self.clone();
        tokio::spawn(async move {
            let result = stream.wait(deadline).await;
            on_writable(stream.id, result);
        });
    }

    /// Inbound frame from the dispatch path.
    pub fn on_received(self: &Arc<Self>, host: &Arc<HostSocket>, frame: Frame) -> Result<()> {
        self.set_host_socket(host);
        match frame {
            Frame::Feedback { consumed_size, .. } => {
                self.apply_feedback(consumed_size);
                Ok(())
            }
            Frame::Data { header, payload } => {
                let message = {
                    let mut pending = self.pending.lock().unwrap();
                    match pending.take() {
                        Some(mut buf) => {
                            buf.extend_from_slice(&payload);
                            if header.has_continuation {
                                *pending = Some(buf);
                                None
                            } else {
                                Some(buf.freeze())
                            }
                        }
                        None if header.has_continuation => {
                            *pending = Some(BytesMut::from(payload.as_ref()));
                            None
                        }
                        None => Some(payload),
                    }
                };
                if let Some(message) = message {
                    // A rejected push means the queue already stopped; the
                    // close below is then a no-op.
                    if let Err(err) = self.push_consumer(ConsumerItem::Message(message)) {
                        self.close(Some(err), "failed to push into the consumer queue");
                    }
                }
                Ok(())
            }
            Frame::Rst { .. } => {
                debug!(stream = self.id, "received RST frame");
                self.close(Some(StreamError::ConnectionReset), "received RST frame");
                Ok(())
            }
            Frame::Close { .. } => {
                debug!(stream = self.id, "received CLOSE frame");
                self.close(None, "received CLOSE frame");
                Ok(())
            }
            Frame::Unknown { frame_type, .. } => {
                warn!(stream = self.id, frame_type, "received unknown frame");
                Err(StreamError::UnknownFrameType(frame_type))
            }
        }
    }

    fn apply_feedback(&self, consumed_size: u64) {
        let cap = flags().socket_max_streams_unconsumed_bytes();
        match self.host.get() {
            Some(host) if cap > 0 => self
                .flow
                .on_feedback(consumed_size, Some((host.unconsumed(), cap))),
            _ => self.flow.on_feedback(consumed_size, None),
        }
    }

    /// Close the stream. Idempotent: the first caller wins and its reason
    /// is preserved. `error = None` is a graceful close; the handler then
    /// observes only `on_closed`.
    pub fn close(&self, error: Option<StreamError>, reason: &str) {
        // Latch the write side first so in-flight submissions stop.
        self.failed.store(true, Ordering::SeqCst);
        let (was_connected, remote_id, connect_cb) = {
            let mut st = self.state.lock().unwrap();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            st.error = error;
            st.error_text = reason.to_string();
            let mut cb = None;
            if !st.connected && st.connect_outcome.is_none() {
                st.connect_outcome = Some(Err(StreamError::ConnectionReset));
                cb = st.connect_cb.take();
            }
            (
                st.connected,
                st.remote.as_ref().map(|r| r.stream_id),
                cb,
            )
        };
        debug!(
            stream = self.id,
            connected = was_connected,
            reason,
            "closing stream"
        );
        if let Some(cb) = connect_cb {
            let id = self.id;
            spawn_callback(move || cb(id, Err(StreamError::ConnectionReset)));
        }
        // Parked waiters observe the reset before the rest of the teardown.
        self.flow.fail_waiters();
        // One best-effort CLOSE frame, only if the stream ever connected.
        if let Some(host) = self.host.get() {
            if was_connected {
                if let Some(remote_id) = remote_id {
                    let frame = Frame::Close {
                        header: FrameHeader::new(remote_id, self.id),
                    };
                    if let Err(err) = host.write_frames(codec::encode_single(&frame)) {
                        debug!(stream = self.id, %err, "failed to send CLOSE frame");
                    }
                }
            }
            host.remove_stream(self.id);
        }
        registry::remove(self.id);
        self.stop_idle_timer();
        // Dropping the sender stops the consumer queue; its stopped branch
        // finishes the teardown.
        self.queue_tx.lock().unwrap().take();
    }

    /// Resolve `id` and close it abnormally. Unknown ids are silently
    /// ignored (the stream was already recycled).
    pub fn set_failed(id: StreamId, error: StreamError, reason: &str) {
        if let Some(stream) = address(id) {
            stream.close(Some(error), reason);
        }
    }

    /// Close a batch of streams with one pre-formatted reason.
    pub fn set_failed_many(ids: &[StreamId], error: StreamError, reason: &str) {
        for &id in ids {
            Self::set_failed(id, error.clone(), reason);
        }
    }

    /// Resolve `id` and close it gracefully.
    pub fn shutdown(id: StreamId, reason: &str) {
        if let Some(stream) = address(id) {
            stream.close(None, reason);
        }
    }

    pub fn shutdown_many(ids: &[StreamId], reason: &str) {
        for &id in ids {
            Self::shutdown(id, reason);
        }
    }

    pub(crate) fn push_consumer(&self, item: ConsumerItem) -> Result<()> {
        match self.queue_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(item).map_err(|_| StreamError::QueueClosed),
            None => Err(StreamError::QueueClosed),
        }
    }

    pub(crate) fn start_idle_timer(self: &Arc<Self>) {
        if self.options.idle_timeout_ms < 0 {
            return;
        }
        let delay = Duration::from_millis(self.options.idle_timeout_ms as u64);
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(stream) = weak.upgrade() {
                let _ = stream.push_consumer(ConsumerItem::IdleTick);
            }
        });
        // A handle is single-use per arm cycle; replace-and-abort keeps a
        // racing stop from observing a stale one.
        if let Some(stale) = self.idle_timer.lock().unwrap().replace(handle) {
            stale.abort();
        }
    }

    pub(crate) fn stop_idle_timer(&self) {
        if self.options.idle_timeout_ms < 0 {
            return;
        }
        if let Some(armed) = self.idle_timer.lock().unwrap().take() {
            armed.abort();
        }
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn StreamHandler>> {
        self.options.handler.clone()
    }

    pub(crate) fn messages_in_batch(&self) -> usize {
        self.options.messages_in_batch.max(1)
    }

    pub(crate) fn remote_need_feedback(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .remote
            .as_ref()
            .map(|r| r.need_feedback)
            .unwrap_or(false)
    }

    pub(crate) fn add_local_consumed(&self, bytes: u64) {
        self.local_consumed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Emit one cumulative FEEDBACK frame. Best effort: a crowded socket
    /// only delays the next update.
    pub(crate) fn send_feedback(&self) {
        let remote_id = {
            let st = self.state.lock().unwrap();
            match st.remote.as_ref() {
                Some(remote) => remote.stream_id,
                None => return,
            }
        };
        let host = match self.host.get() {
            Some(host) => host,
            None => return,
        };
        let frame = Frame::Feedback {
            header: FrameHeader::new(remote_id, self.id),
            consumed_size: self.local_consumed.load(Ordering::Relaxed),
        };
        if let Err(err) = host.write_frames(codec::encode_single(&frame)) {
            warn!(stream = self.id, %err, "failed to send FEEDBACK frame");
        }
    }
}
