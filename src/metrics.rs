//! Process-wide cache metrics.

use metriken::{metric, Counter, Gauge};

// Operation counters

/// Get operations.
#[metric(name = "cache_gets", description = "Total GET operations")]
pub static GETS: Counter = Counter::new();

/// Gets that found the key.
#[metric(name = "cache_hits", description = "GET operations that found the key")]
pub static HITS: Counter = Counter::new();

/// Gets that missed.
#[metric(name = "cache_misses", description = "GET operations that missed")]
pub static MISSES: Counter = Counter::new();

/// Items stored by a write.
#[metric(
    name = "cache_sets",
    description = "Items stored by add, set, replace, append, prepend and delta"
)]
pub static SETS: Counter = Counter::new();

/// Items deleted.
#[metric(name = "cache_deletes", description = "Items removed by DELETE")]
pub static DELETES: Counter = Counter::new();

/// Items expired.
#[metric(name = "cache_expirations", description = "Items removed by expiration")]
pub static EXPIRATIONS: Counter = Counter::new();

/// Group flushes.
#[metric(name = "cache_flushes", description = "Total FLUSH operations")]
pub static FLUSHES: Counter = Counter::new();

/// Allocations refused at the ceiling.
#[metric(
    name = "cache_out_of_memory",
    description = "Allocations refused at the memory ceiling"
)]
pub static OUT_OF_MEMORY: Counter = Counter::new();

// Watch counters

/// Notifications delivered to watches.
#[metric(
    name = "watch_notifications",
    description = "Notifications delivered to watches"
)]
pub static WATCH_NOTIFICATIONS: Counter = Counter::new();

/// Sink wake-ups fired.
#[metric(name = "watch_wakeups", description = "Sink wake-ups fired")]
pub static WATCH_WAKEUPS: Counter = Counter::new();

// Gauges

/// Linked items.
#[metric(name = "cache_items", description = "Number of linked items")]
pub static ITEMS: Gauge = Gauge::new();

/// Bytes held by item buffers.
#[metric(
    name = "cache_memory_used",
    description = "Bytes held by live and pooled item buffers"
)]
pub static MEMORY_USED: Gauge = Gauge::new();

/// Live watches.
#[metric(name = "watches_active", description = "Number of live watches")]
pub static WATCHES: Gauge = Gauge::new();
