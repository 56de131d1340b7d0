//! Long-poll watches.
//!
//! A watch collects change notifications for the items it is subscribed to.
//! Notifications accumulate in a pending list; a poll moves them into a
//! committed batch stamped with a sequence number, and the batch is handed
//! out again on every poll until the client acknowledges that sequence.
//!
//! A client with nothing to read parks a [`WatchSink`] on the watch. The
//! next notification fires the sink once and disarms it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use ahash::RandomState;
use slab::Slab;

use crate::clock::deadline;

/// Number of ids tried before `create` gives up.
const WATCH_ID_ATTEMPTS: usize = 100;

/// Why a watch was notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEvent {
    /// The item's data was replaced or mutated.
    DataUpdated,
    /// The item was deleted.
    Deleted,
    /// The item's group was flushed.
    Flushed,
    /// The item expired.
    Expired,
    /// The item's flags or expiration changed.
    BaseInfoUpdated,
}

impl WatchEvent {
    /// Short lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataUpdated => "data_updated",
            Self::Deleted => "deleted",
            Self::Flushed => "flushed",
            Self::Expired => "expired",
            Self::BaseInfoUpdated => "base_info_updated",
        }
    }
}

/// One notification: the item's cache id at the time and the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchUpdate {
    /// Cache id of the item when the event happened.
    pub cache_id: u64,
    /// What happened.
    pub event: WatchEvent,
}

/// A committed batch of notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchBatch {
    /// Sequence to acknowledge on the next poll.
    pub sequence: u32,
    /// The notifications.
    pub updates: Vec<WatchUpdate>,
}

/// Result of polling a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchPoll {
    /// Nothing to deliver; the sink is armed.
    Waiting,
    /// Notifications to deliver.
    Ready(WatchBatch),
}

/// Receiver of watch wake-ups, typically a client connection.
pub trait WatchSink: Send + Sync {
    /// Called once when an armed watch gets a notification, or when the
    /// sink is superseded by another poll.
    fn on_watch_notify(&self, watch_id: u32);
}

/// Generation-checked handle to a registered sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkHandle {
    slot: usize,
    generation: u32,
}

struct SinkEntry {
    generation: u32,
    sink: Arc<dyn WatchSink>,
}

/// Registry of live sinks. Handles to unregistered sinks resolve to nothing,
/// even after their slot is reused.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: Slab<SinkEntry>,
    /// Generation counter for handles to detect stale references.
    next_generation: u32,
}

impl SinkRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink.
    pub fn register(&mut self, sink: Arc<dyn WatchSink>) -> SinkHandle {
        let entry = self.sinks.vacant_entry();
        let slot = entry.key();
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        entry.insert(SinkEntry { generation, sink });
        SinkHandle { slot, generation }
    }

    /// Unregister a sink. Returns false for stale handles.
    pub fn unregister(&mut self, handle: SinkHandle) -> bool {
        match self.sinks.get(handle.slot) {
            Some(entry) if entry.generation == handle.generation => {
                self.sinks.remove(handle.slot);
                true
            }
            _ => false,
        }
    }

    /// Resolve a handle.
    pub fn get(&self, handle: SinkHandle) -> Option<Arc<dyn WatchSink>> {
        self.sinks
            .get(handle.slot)
            .filter(|entry| entry.generation == handle.generation)
            .map(|entry| entry.sink.clone())
    }

    /// Number of registered sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sinks are registered.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

/// A sink to wake once the manager lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Wakeup {
    pub sink: SinkHandle,
    pub watch_id: u32,
}

/// A single watch.
#[derive(Debug)]
pub struct Watch {
    id: u32,
    expire_time: u32,
    sequence: u32,
    committed: Vec<WatchUpdate>,
    pending: Vec<WatchUpdate>,
    sink: Option<SinkHandle>,
}

impl Watch {
    fn new(id: u32, expire_time: u32) -> Self {
        Self {
            id,
            expire_time,
            sequence: 0,
            committed: Vec::new(),
            pending: Vec::new(),
            sink: None,
        }
    }

    /// Watch id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Absolute time after which the watch is discarded.
    pub fn expire_time(&self) -> u32 {
        self.expire_time
    }

    /// Sequence of the committed batch.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Notifications not yet committed.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        if self.sequence == 0 {
            self.sequence = 1;
        }
        self.sequence
    }

    fn commit(&mut self) -> WatchBatch {
        self.committed = std::mem::take(&mut self.pending);
        WatchBatch {
            sequence: self.next_sequence(),
            updates: self.committed.clone(),
        }
    }

    /// Poll the watch, arming `sink` if there is nothing to deliver.
    ///
    /// An unacknowledged committed batch is redelivered. Acknowledging its
    /// sequence drops it and moves on to pending notifications. A sink that
    /// gets replaced by a different one is returned so it can be woken.
    pub(crate) fn check_and_set(
        &mut self,
        sink: SinkHandle,
        ack_sequence: u32,
        expire_time: u32,
    ) -> (WatchPoll, Option<SinkHandle>) {
        self.expire_time = expire_time;

        if !self.committed.is_empty() {
            if ack_sequence != self.sequence {
                let batch = WatchBatch {
                    sequence: self.sequence,
                    updates: self.committed.clone(),
                };
                return (WatchPoll::Ready(batch), None);
            }
            self.committed.clear();
        }

        if !self.pending.is_empty() {
            return (WatchPoll::Ready(self.commit()), None);
        }

        let replaced = self.sink.replace(sink).filter(|&old| old != sink);
        (WatchPoll::Waiting, replaced)
    }

    /// Disarm `sink`, committing pending notifications if no batch is
    /// outstanding.
    pub(crate) fn check_and_clear(&mut self, sink: SinkHandle) -> Option<WatchBatch> {
        if self.sink != Some(sink) {
            return None;
        }
        self.sink = None;
        if self.committed.is_empty() && !self.pending.is_empty() {
            Some(self.commit())
        } else {
            None
        }
    }

    /// Record a notification. Returns the armed sink, now disarmed, if any.
    pub(crate) fn notify(&mut self, update: WatchUpdate) -> Option<SinkHandle> {
        self.pending.push(update);
        self.sink.take()
    }
}

/// All watches, keyed by id.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    watches: HashMap<u32, Watch, RandomState>,
    last_id: u32,
}

impl WatchRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a watch expiring at `expire_time`. Returns `None` when no free
    /// id was found.
    pub fn create(&mut self, expire_time: u32) -> Option<u32> {
        for _ in 0..WATCH_ID_ATTEMPTS {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id == 0 {
                self.last_id = 1;
            }
            if !self.watches.contains_key(&self.last_id) {
                self.watches
                    .insert(self.last_id, Watch::new(self.last_id, expire_time));
                return Some(self.last_id);
            }
        }
        None
    }

    /// Whether a watch exists.
    pub fn contains(&self, watch_id: u32) -> bool {
        self.watches.contains_key(&watch_id)
    }

    /// Look up a watch.
    pub fn get(&self, watch_id: u32) -> Option<&Watch> {
        self.watches.get(&watch_id)
    }

    pub(crate) fn get_mut(&mut self, watch_id: u32) -> Option<&mut Watch> {
        self.watches.get_mut(&watch_id)
    }

    /// Number of watches.
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    /// Whether there are no watches.
    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Drop every watch whose expiry is at or before `now`. Returns how many
    /// were dropped.
    pub fn expire(&mut self, now: u32) -> usize {
        let before = self.watches.len();
        self.watches.retain(|_, watch| watch.expire_time > now);
        before - self.watches.len()
    }

    /// Deliver `update` to every watch in `subscribers`, pruning ids that no
    /// longer exist. Sinks that must be woken are appended to `wakeups`.
    pub(crate) fn notify_all(
        &mut self,
        subscribers: &mut BTreeSet<u32>,
        update: WatchUpdate,
        wakeups: &mut Vec<Wakeup>,
    ) -> usize {
        let mut delivered = 0;
        subscribers.retain(|&watch_id| match self.watches.get_mut(&watch_id) {
            Some(watch) => {
                if let Some(sink) = watch.notify(update) {
                    wakeups.push(Wakeup { sink, watch_id });
                }
                delivered += 1;
                true
            }
            None => false,
        });
        delivered
    }
}

/// Expiry of a watch polled at `now` with a maximum idle interval.
#[inline]
pub(crate) fn watch_deadline(now: u32, max_interval: u32) -> u32 {
    deadline(now, max_interval)
}
