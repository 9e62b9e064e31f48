//! Channel pool: a fixed 65,536-slot table indexed by channel id
//!
//! Ids come from the wire, not from the pool. An id is either on the free
//! list or occupies an active slot, never both. Only the dispatcher mutates
//! the pool, so it needs no locking.

use super::channel::{ChannelState, ChannelWriter, LogicalChannel};
use super::frame::ChannelId;
use super::{ChannelSettings, MAX_CHANNELS};
use crate::transport::{FrameSink, Lease};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

const NIL: u32 = u32::MAX;

/// Intrusive doubly-linked list of free channel ids
///
/// Links are stored in parallel arrays indexed by id, so removing an
/// arbitrary id is O(1).
#[derive(Debug)]
pub struct FreeList {
    prev: Vec<u32>,
    next: Vec<u32>,
    linked: Vec<bool>,
    head: u32,
    tail: u32,
    len: usize,
}

impl FreeList {
    /// Create a list holding every id in `0..capacity`
    pub fn full(capacity: usize) -> Self {
        let mut list = Self {
            prev: vec![NIL; capacity],
            next: vec![NIL; capacity],
            linked: vec![false; capacity],
            head: NIL,
            tail: NIL,
            len: 0,
        };
        for id in 0..capacity {
            list.push_back(id as u32);
        }
        list
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, id: u32) -> bool {
        self.linked.get(id as usize).copied().unwrap_or(false)
    }

    /// Unlink `id`; false if it was not on the list
    pub fn remove(&mut self, id: u32) -> bool {
        if !self.contains(id) {
            return false;
        }
        let idx = id as usize;
        let (p, n) = (self.prev[idx], self.next[idx]);

        if p == NIL {
            self.head = n;
        } else {
            self.next[p as usize] = n;
        }
        if n == NIL {
            self.tail = p;
        } else {
            self.prev[n as usize] = p;
        }

        self.prev[idx] = NIL;
        self.next[idx] = NIL;
        self.linked[idx] = false;
        self.len -= 1;
        true
    }

    /// Append `id`; false if it was already on the list
    pub fn push_back(&mut self, id: u32) -> bool {
        let idx = id as usize;
        if idx >= self.linked.len() || self.linked[idx] {
            return false;
        }

        self.prev[idx] = self.tail;
        self.next[idx] = NIL;
        if self.tail == NIL {
            self.head = id;
        } else {
            self.next[self.tail as usize] = id;
        }
        self.tail = id;
        self.linked[idx] = true;
        self.len += 1;
        true
    }
}

/// Pool-side handle of an active channel
#[derive(Debug)]
pub struct ChannelHandle {
    inbox: mpsc::UnboundedSender<Bytes>,
    lease: Lease,
    state: watch::Receiver<ChannelState>,
}

impl ChannelHandle {
    /// Current state of the channel
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Queue a payload for the channel; false if its task no longer consumes
    pub fn deliver(&self, payload: Bytes) -> bool {
        self.inbox.send(payload).is_ok()
    }
}

/// Fixed table of logical channels plus the free list
pub struct ChannelPool {
    slots: Vec<Option<ChannelHandle>>,
    free: FreeList,
    sink: Arc<dyn FrameSink>,
    settings: ChannelSettings,
    allocations: u64,
}

impl ChannelPool {
    /// Create a pool with every id free
    pub fn new(sink: Arc<dyn FrameSink>, settings: ChannelSettings) -> Self {
        Self {
            slots: (0..MAX_CHANNELS).map(|_| None).collect(),
            free: FreeList::full(MAX_CHANNELS),
            sink,
            settings,
            allocations: 0,
        }
    }

    /// Return the active channel for `id`, allocating it if free
    ///
    /// Allocation spawns the channel task with a fresh inbound queue and
    /// lease. An already active id is returned unchanged. Must be called from
    /// within a Tokio runtime.
    pub fn allocate_or_lookup(&mut self, id: ChannelId) -> &ChannelHandle {
        let free = &mut self.free;
        let sink = &self.sink;
        let settings = &self.settings;
        let allocations = &mut self.allocations;

        self.slots[id as usize].get_or_insert_with(|| {
            free.remove(id as u32);
            *allocations += 1;
            debug!("Channel {} allocated (allocation #{})", id, allocations);
            spawn_channel(id, Arc::clone(sink), settings.clone())
        })
    }

    /// Return `id` to the free list and close its queue
    ///
    /// Returns false, changing nothing, if `id` is already free.
    pub fn release(&mut self, id: ChannelId) -> bool {
        let Some(handle) = self.slots[id as usize].take() else {
            trace!("Close for free channel {} ignored", id);
            return false;
        };

        handle.lease.revoke();
        drop(handle);
        self.free.push_back(id as u32);
        debug!("Channel {} released", id);
        true
    }

    /// Get an active channel
    pub fn get(&self, id: ChannelId) -> Option<&ChannelHandle> {
        self.slots[id as usize].as_ref()
    }

    /// Whether `id` is active
    pub fn is_active(&self, id: ChannelId) -> bool {
        self.slots[id as usize].is_some()
    }

    /// Number of active channels
    pub fn active_count(&self) -> usize {
        MAX_CHANNELS - self.free.len()
    }

    /// Number of free ids
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Total channel tasks spawned so far
    pub fn allocations(&self) -> u64 {
        self.allocations
    }
}

fn spawn_channel(
    id: ChannelId,
    sink: Arc<dyn FrameSink>,
    settings: ChannelSettings,
) -> ChannelHandle {
    let lease = Lease::new();
    let (inbox, inbox_rx) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(ChannelState::AwaitingGreeting);

    let writer = ChannelWriter::new(id, lease.clone(), sink);
    let channel = LogicalChannel::new(writer, state_tx, settings);
    tokio::spawn(channel.run(inbox_rx));

    ChannelHandle {
        inbox,
        lease,
        state,
    }
}
