//! The per-stream consumer task.
//!
//! Exactly one task drains a stream's queue, so handler callbacks are
//! serialized and strictly FIFO. The task also owns the two pieces of
//! receive-side state that never need a lock: the one-shot RPC-response
//! head and the running batch buffer.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use super::{ConsumerItem, RpcResponseHead, Stream};
use crate::error::StreamError;

pub(crate) async fn run(
    stream: Arc<Stream>,
    mut queue: mpsc::UnboundedReceiver<ConsumerItem>,
    mut rpc_head: Option<Box<dyn RpcResponseHead>>,
) {
    let batch_limit = stream.messages_in_batch();
    let mut items: Vec<ConsumerItem> = Vec::with_capacity(batch_limit);
    let mut messages: Vec<Bytes> = Vec::with_capacity(batch_limit);

    loop {
        items.clear();
        let received = queue.recv_many(&mut items, batch_limit).await;
        if received == 0 {
            break;
        }
        stream.stop_idle_timer();
        if stream.is_closed() {
            // A stopped queue supersedes anything still in flight,
            // including a late idle tick.
            continue;
        }

        messages.clear();
        let mut has_idle_tick = false;
        let mut delivered: u64 = 0;
        for item in items.drain(..) {
            match item {
                ConsumerItem::IdleTick => has_idle_tick = true,
                ConsumerItem::Message(payload) => {
                    if let Some(head) = rpc_head.take() {
                        if let Err(err) = head.handle(stream.id(), payload) {
                            warn!(stream = stream.id(), %err, "failed to parse the rpc response");
                            stream.close(
                                Some(StreamError::Protocol),
                                "failed to parse the rpc response",
                            );
                            break;
                        }
                        continue;
                    }
                    delivered += payload.len() as u64;
                    messages.push(payload);
                }
            }
        }
        if stream.is_closed() {
            continue;
        }

        if let Some(handler) = stream.handler() {
            if has_idle_tick && delivered == 0 {
                handler.on_idle_timeout(stream.id());
            }
            if !messages.is_empty() {
                handler.on_received_messages(stream.id(), &messages);
            }
        }
        messages.clear();

        // Feedback goes out only after the handler returned the bytes.
        if delivered > 0 && stream.remote_need_feedback() {
            stream.add_local_consumed(delivered);
            stream.send_feedback();
        }
        stream.start_idle_timer();
    }

    // Stopped-queue branch, observed exactly once: the consumer owns the
    // final strong handle and finishes the teardown.
    if let Some(handler) = stream.handler() {
        if let Some((error, reason)) = stream.error() {
            handler.on_failed(stream.id(), &error, &reason);
        }
        handler.on_closed(stream.id());
    }
}
