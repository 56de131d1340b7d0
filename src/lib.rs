//! xixibase: the in-memory core of a memcached-style cache server.
//!
//! This crate provides:
//!
//! - **Size classes**: geometric slab classes with bounded free lists and a
//!   hard memory ceiling
//! - **Items**: key/data/ext records in a reference-counted arena, versioned
//!   by a monotonic cache id
//! - **Expiration**: a 34-bucket logarithmic wheel swept once per second,
//!   plus lazy expiry on lookup
//! - **Watches**: long-poll change notification with acknowledged,
//!   redeliverable batches
//! - **Manager**: [`CacheManager`], the single façade for all operations
//!
//! # Architecture
//!
//! ```text
//!                 +------------------------------+
//!                 |         CacheManager         |
//!                 |      (one mutex, Inner)      |
//!                 +------------------------------+
//!                   |        |         |        |
//!                   v        v         v        v
//!             +--------+ +-------+ +-------+ +---------+
//!             | Hash   | | Item  | | Exp.  | | Watch   |
//!             | Index  | | Arena | | Wheel | | Registry|
//!             +--------+ +-------+ +-------+ +---------+
//!                            |
//!                            v
//!                     +--------------+
//!                     | SlabAllocator|
//!                     +--------------+
//! ```
//!
//! # Example
//!
//! ```ignore
//! use xixibase::CacheManager;
//!
//! let cache = CacheManager::builder().memory_limit(64 * 1024 * 1024).build();
//!
//! let item = cache.new_item(0, b"greeting", b"hello", b"", 0, 0)?;
//! let cache_id = cache.add(item, 0)?;
//!
//! let found = cache.get(0, b"greeting", 0)?;
//! assert_eq!(found.data(), b"hello");
//! assert_eq!(found.cache_id(), cache_id);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Ambient
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod signal;
pub mod stats;

// Storage
pub mod allocator;
pub mod class;
pub mod expiration;
pub mod hashtable;
pub mod item;

// Watches
pub mod watch;

// Façade
pub mod loader;
pub mod manager;
pub mod ticker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{CacheError, CacheResult, ConfigError};
pub use item::{Item, MAX_KEY_LEN};
pub use loader::{FileLoader, MimeTypes};
pub use manager::{
    CacheManager, CacheManagerBuilder, DeltaResult, FlushSummary, ItemBase, ItemMeta, ItemRef,
    PendingItem,
};
pub use stats::{GroupStats, NoopStats, StatsCollector};
pub use ticker::Ticker;
pub use watch::{SinkHandle, WatchBatch, WatchEvent, WatchPoll, WatchSink, WatchUpdate};
