// SPDX-License-Identifier: MPL-2.0

//! Stream bookkeeping: integer stream id to per-stream state.

use alloc::{collections::BTreeMap, sync::Arc};

use spin::Mutex;

/// Per-stream state.
#[derive(Debug)]
pub struct Stream {
    pub sid: u32,
    /// Whether faulting transactions of this stream stall and await a
    /// resume command instead of aborting.
    pub can_stall: bool,
}

/// Unique-key lookup table for attached streams, under one coarse lock.
/// Lookups are rare (stall handling and configuration), so a plain
/// ordered map suffices.
pub(crate) struct StreamTable {
    streams: Mutex<BTreeMap<u32, Arc<Stream>>>,
}

impl StreamTable {
    pub(crate) const fn new() -> Self {
        Self {
            streams: Mutex::new(BTreeMap::new()),
        }
    }

    /// Attaches a stream, returning the state it replaced, if any.
    pub(crate) fn attach(&self, stream: Stream) -> Option<Arc<Stream>> {
        self.streams.lock().insert(stream.sid, Arc::new(stream))
    }

    /// Detaches a stream, returning its state if it was attached.
    pub(crate) fn detach(&self, sid: u32) -> Option<Arc<Stream>> {
        self.streams.lock().remove(&sid)
    }

    pub(crate) fn get(&self, sid: u32) -> Option<Arc<Stream>> {
        self.streams.lock().get(&sid).cloned()
    }
}
