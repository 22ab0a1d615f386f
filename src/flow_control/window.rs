//! The sliding write window.
//!
//! All bookkeeping lives behind one mutex: `produced` (bytes handed to the
//! socket), `remote_consumed` (cumulative bytes the peer acknowledged via
//! FEEDBACK), the current admission window, and the parked writability
//! waiters. The lock is never held across a suspension point or a user
//! callback; waiters detached under the lock are resumed after it is
//! released.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::{Result, StreamError};
use crate::types::StreamId;

type WaiterTx = oneshot::Sender<Result<()>>;

/// Outcome of a wait attempt: either resolved on the spot or parked on a
/// single-fire completion.
pub(crate) enum WaitDecision {
    Resolved(Result<()>),
    Parked(oneshot::Receiver<Result<()>>),
}

#[derive(Debug)]
struct WindowState {
    produced: u64,
    remote_consumed: u64,
    cur_buf_size: u64,
    closed: bool,
}

pub(crate) struct FlowController {
    stream_id: StreamId,
    min_buf_size: u64,
    max_buf_size: u64,
    state: Mutex<WindowState>,
    waiters: Mutex<Vec<WaiterTx>>,
}

impl FlowController {
    pub(crate) fn new(
        stream_id: StreamId,
        initial_buf_size: u64,
        min_buf_size: u64,
        max_buf_size: u64,
    ) -> Self {
        Self {
            stream_id,
            min_buf_size,
            max_buf_size,
            state: Mutex::new(WindowState {
                produced: 0,
                remote_consumed: 0,
                cur_buf_size: initial_buf_size,
                closed: false,
            }),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Admit `len` payload bytes if the window has credit.
    ///
    /// Returns whether the bytes were counted against the window (false
    /// when flow control is disabled); a counted admission must be rolled
    /// back with [`FlowController::rollback`] if the subsequent socket
    /// submit fails.
    pub(crate) fn admit(&self, len: usize) -> Result<bool> {
        let mut st = self.state.lock().unwrap();
        if st.cur_buf_size == 0 {
            return Ok(false);
        }
        if st.produced >= st.remote_consumed + st.cur_buf_size {
            let (produced, consumed, window) = (st.produced, st.remote_consumed, st.cur_buf_size);
            drop(st);
            debug!(
                stream = self.stream_id,
                produced,
                remote_consumed = consumed,
                gap = produced - consumed,
                cur_buf_size = window,
                "stream window is full"
            );
            return Err(StreamError::WindowFull);
        }
        st.produced += len as u64;
        Ok(true)
    }

    /// Undo a counted admission after a failed submit.
    pub(crate) fn rollback(&self, len: usize) {
        let mut st = self.state.lock().unwrap();
        st.produced = st.produced.saturating_sub(len as u64);
    }

    /// Apply a cumulative FEEDBACK value.
    ///
    /// Stale values (`new_consumed <= remote_consumed`) are ignored. When
    /// `accountant` is provided (the shared-socket unconsumed-bytes counter
    /// and its cap), the window is adjusted: shrunk to `min_buf_size` (or
    /// halved) while the socket is crowded, doubled up to `max_buf_size`
    /// while the stream stays full at the new consumed value. Waiters are
    /// resumed when the window transitions from full to open.
    pub(crate) fn on_feedback(&self, new_consumed: u64, accountant: Option<(&AtomicI64, i64)>) {
        let resumable = {
            let mut st = self.state.lock().unwrap();
            if st.cur_buf_size == 0 {
                debug!(
                    stream = self.stream_id,
                    "feedback on a stream without flow control, ignored"
                );
                return;
            }
            if st.remote_consumed >= new_consumed {
                return;
            }
            let was_full = st.produced >= st.remote_consumed + st.cur_buf_size;

            if let Some((unconsumed, cap)) = accountant {
                let delta = (new_consumed - st.remote_consumed) as i64;
                let outstanding = unconsumed.fetch_sub(delta, Ordering::Relaxed) - delta;
                if outstanding > cap {
                    st.cur_buf_size = if self.min_buf_size > 0 {
                        self.min_buf_size
                    } else {
                        // Never let the shrink hit zero: a zero window means
                        // unbounded admission, the opposite of backing off.
                        (st.cur_buf_size / 2).max(1)
                    };
                    info!(
                        stream = self.stream_id,
                        cur_buf_size = st.cur_buf_size,
                        "stream consumers on the shared socket are crowded, cutting the window"
                    );
                } else if st.produced >= new_consumed + st.cur_buf_size
                    && (self.max_buf_size == 0 || st.cur_buf_size < self.max_buf_size)
                {
                    st.cur_buf_size =
                        if self.max_buf_size > 0 && st.cur_buf_size * 2 > self.max_buf_size {
                            self.max_buf_size
                        } else {
                            st.cur_buf_size * 2
                        };
                }
            }

            st.remote_consumed = new_consumed;
            let is_full = st.produced >= st.remote_consumed + st.cur_buf_size;
            if was_full && !is_full {
                std::mem::take(&mut *self.waiters.lock().unwrap())
            } else {
                Vec::new()
            }
        };
        for waiter in resumable {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Resolve immediately if the window has credit (or flow control is
    /// off), otherwise park a single-fire waiter.
    pub(crate) fn wait(&self) -> WaitDecision {
        let st = self.state.lock().unwrap();
        if st.closed {
            return WaitDecision::Resolved(Err(StreamError::ConnectionReset));
        }
        if st.cur_buf_size == 0 || st.produced < st.remote_consumed + st.cur_buf_size {
            return WaitDecision::Resolved(Ok(()));
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().push(tx);
        WaitDecision::Parked(rx)
    }

    /// Mark the window closed and resume every parked waiter with
    /// `ConnectionReset`. Waiters parking afterwards resolve immediately
    /// with the same status.
    pub(crate) fn fail_waiters(&self) {
        let parked = {
            let mut st = self.state.lock().unwrap();
            st.closed = true;
            std::mem::take(&mut *self.waiters.lock().unwrap())
        };
        for waiter in parked {
            let _ = waiter.send(Err(StreamError::ConnectionReset));
        }
    }

    pub(crate) fn produced(&self) -> u64 {
        self.state.lock().unwrap().produced
    }

    pub(crate) fn remote_consumed(&self) -> u64 {
        self.state.lock().unwrap().remote_consumed
    }

    pub(crate) fn cur_buf_size(&self) -> u64 {
        self.state.lock().unwrap().cur_buf_size
    }
}
