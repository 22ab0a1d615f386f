//! Process-wide stream arena.
//!
//! Streams publish themselves behind a numeric id; anything holding the id
//! can resolve a typed handle that keeps the entry alive. Entries are
//! removed when the stream closes, so resolution failure is the
//! "already recycled" signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use super::Stream;
use crate::types::StreamId;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

static STREAMS: Lazy<Mutex<HashMap<StreamId, Arc<Stream>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub(crate) fn allocate_id() -> StreamId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn insert(stream: Arc<Stream>) {
    STREAMS.lock().unwrap().insert(stream.id(), stream);
}

pub(crate) fn remove(id: StreamId) -> Option<Arc<Stream>> {
    STREAMS.lock().unwrap().remove(&id)
}

/// Resolve an id to a live stream handle.
pub fn address(id: StreamId) -> Option<Arc<Stream>> {
    STREAMS.lock().unwrap().get(&id).cloned()
}
