//! The cache manager.
//!
//! [`CacheManager`] owns every piece of cache state behind one mutex: the
//! allocator, the item arena, the hash index, the expiration wheel and the
//! watch registry. Each public operation takes the lock once, so it is
//! atomic with respect to every other operation.
//!
//! # References
//!
//! An item carries a reference count. Linking into the index holds one
//! reference; every [`ItemRef`] handed to a reader holds another. An item
//! leaves the arena and returns its buffer to the allocator when the count
//! reaches zero, so a reader keeps seeing consistent data even after the key
//! was replaced or deleted.
//!
//! # Sinks
//!
//! Watch sinks are woken after the lock is released, so a sink may call
//! back into the manager.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;
use tracing::{debug, error, info, trace};

use crate::allocator::SlabAllocator;
use crate::class::SlabClasses;
use crate::clock::{absolute, remaining, Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::expiration::{bucket_for, ExpirationWheel, BUCKET_COUNT};
use crate::hashtable::{HashIndex, DEFAULT_HASHTABLE_POWER};
use crate::item::{item_size, Item, ItemId, MAX_KEY_LEN};
use crate::metrics;
use crate::stats::{NoopStats, Outcome, StatsCollector, StatsEvent, StatsOp};
use crate::watch::{
    watch_deadline, SinkHandle, SinkRegistry, Wakeup, WatchBatch, WatchEvent, WatchPoll,
    WatchRegistry, WatchSink, WatchUpdate,
};

/// Metadata snapshot of an item, taken when a reference was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemMeta {
    /// Group namespace.
    pub group_id: u32,
    /// Size class.
    pub class_id: u8,
    /// Version stamp.
    pub cache_id: u64,
    /// User flags.
    pub flags: u32,
    /// Seconds until expiration, `0` for never.
    pub expiration: u32,
    /// Data length.
    pub data_len: usize,
    /// Ext length.
    pub ext_len: usize,
}

/// Result of [`CacheManager::get_base`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemBase {
    /// Version stamp.
    pub cache_id: u64,
    /// User flags.
    pub flags: u32,
    /// Seconds until expiration, `0` for never.
    pub expiration: u32,
    /// Extension bytes.
    pub ext: Vec<u8>,
}

/// Result of [`CacheManager::delta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaResult {
    /// The new numeric value.
    pub value: i64,
    /// The item's new cache id.
    pub cache_id: u64,
}

/// Result of [`CacheManager::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Items removed.
    pub count: u32,
    /// Sum of their total sizes.
    pub bytes: u64,
}

/// Builder for [`CacheManager`].
pub struct CacheManagerBuilder {
    memory_limit: usize,
    item_size_min: usize,
    item_size_max: usize,
    growth_factor: f64,
    hashtable_power: u8,
    clock: Option<Arc<dyn Clock>>,
    stats: Option<Arc<dyn StatsCollector>>,
}

impl Default for CacheManagerBuilder {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl CacheManagerBuilder {
    /// Create a builder with default sizing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder from the `[cache]` configuration section.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            memory_limit: config.memory_limit,
            item_size_min: config.item_size_min,
            item_size_max: config.item_size_max,
            growth_factor: config.growth_factor,
            hashtable_power: config.hashtable_power,
            clock: None,
            stats: None,
        }
    }

    /// Ceiling on bytes held by item buffers.
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Payload size of the smallest class.
    pub fn item_size_min(mut self, bytes: usize) -> Self {
        self.item_size_min = bytes;
        self
    }

    /// Payload size of the largest class.
    pub fn item_size_max(mut self, bytes: usize) -> Self {
        self.item_size_max = bytes;
        self
    }

    /// Growth factor between classes.
    pub fn growth_factor(mut self, factor: f64) -> Self {
        self.growth_factor = factor;
        self
    }

    /// Initial hash index size as a power of two.
    pub fn hashtable_power(mut self, power: u8) -> Self {
        self.hashtable_power = power;
        self
    }

    /// Time source. Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Statistics collector. Defaults to [`NoopStats`].
    pub fn stats(mut self, stats: Arc<dyn StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Build the manager.
    pub fn build(self) -> CacheManager {
        let classes = SlabClasses::new(self.item_size_min, self.item_size_max, self.growth_factor);
        info!(
            classes = classes.len(),
            smallest = classes.size_of(crate::class::CLASS_ID_MIN),
            largest = classes.largest(),
            memory_limit = self.memory_limit,
            "cache manager initialized"
        );

        let stats = self.stats.unwrap_or_else(|| Arc::new(NoopStats));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let power = if self.hashtable_power == 0 {
            DEFAULT_HASHTABLE_POWER
        } else {
            self.hashtable_power
        };

        let inner = Inner {
            allocator: SlabAllocator::new(classes, self.memory_limit),
            items: Slab::new(),
            index: HashIndex::new(power),
            wheel: ExpirationWheel::new(),
            watches: WatchRegistry::new(),
            sinks: SinkRegistry::new(),
            wakeups: Vec::new(),
            last_cache_id: 0,
            stats: stats.clone(),
        };

        CacheManager {
            inner: Mutex::new(inner),
            clock,
            stats,
            last_check: AtomicU32::new(0),
        }
    }
}

/// The cache manager.
pub struct CacheManager {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    stats: Arc<dyn StatsCollector>,
    /// Second of the last expiration sweep.
    last_check: AtomicU32,
}

struct Inner {
    allocator: SlabAllocator,
    items: Slab<Item>,
    index: HashIndex,
    wheel: ExpirationWheel,
    watches: WatchRegistry,
    sinks: SinkRegistry,
    /// Sinks to wake once the lock is dropped.
    wakeups: Vec<Wakeup>,
    last_cache_id: u64,
    stats: Arc<dyn StatsCollector>,
}

impl Inner {
    fn record(&self, op: StatsOp, outcome: Outcome, group_id: u32) {
        self.stats.record(StatsEvent::new(op, outcome, group_id));
    }

    fn record_item(&self, op: StatsOp, outcome: Outcome, item: &Item) {
        self.stats.record(
            StatsEvent::new(op, outcome, item.group_id).with_item(item.class_id, item.total_size()),
        );
    }

    fn next_cache_id(&mut self) -> u64 {
        self.last_cache_id = self.last_cache_id.wrapping_add(1);
        if self.last_cache_id == 0 {
            self.last_cache_id = 1;
        }
        self.last_cache_id
    }

    fn update_memory_gauge(&self) {
        metrics::MEMORY_USED.set(self.allocator.memory_used() as i64);
    }

    /// Allocate an unlinked item holding one (caller) reference.
    #[allow(clippy::too_many_arguments)]
    fn alloc(
        &mut self,
        group_id: u32,
        key: &[u8],
        flags: u32,
        expire_time: u32,
        data_size: usize,
        ext_size: usize,
    ) -> CacheResult<Item> {
        if key.len() > MAX_KEY_LEN {
            return Err(CacheError::KeyTooLong);
        }
        let class_id = self
            .allocator
            .classify(item_size(key.len(), data_size, ext_size))?;
        let buf = self.allocator.allocate(class_id).inspect_err(|_| {
            metrics::OUT_OF_MEMORY.increment();
        })?;
        self.update_memory_gauge();

        let hash = self.index.hash(group_id, key);
        Ok(Item::new(
            class_id,
            buf,
            group_id,
            hash,
            key,
            flags,
            expire_time,
            data_size,
            ext_size,
        ))
    }

    /// Drop the caller reference of an item that never entered the arena.
    fn discard(&mut self, mut item: Item) {
        debug_assert_eq!(item.ref_count, 1);
        item.ref_count = 0;
        self.allocator.release(item);
        self.update_memory_gauge();
    }

    fn insert(&mut self, item: Item) -> ItemId {
        ItemId(self.items.insert(item))
    }

    /// Find a live item and take a reference to it. An item whose expiration
    /// has passed is unlinked on the spot and treated as absent.
    fn do_get(&mut self, group_id: u32, key: &[u8], now: u32) -> Option<ItemId> {
        let hash = self.index.hash(group_id, key);
        let id = self.index.find(hash, group_id, key, &self.items)?;

        let expire_time = self.items[id.0].expire_time;
        if expire_time != 0 && expire_time <= now {
            trace!(group_id, "lazily expiring item");
            metrics::EXPIRATIONS.increment();
            self.do_unlink(id, WatchEvent::Expired);
            return None;
        }

        self.items[id.0].ref_count += 1;
        Some(id)
    }

    /// Make an arena item reachable: index it, stamp a fresh cache id and
    /// place it in its expiration bucket.
    fn do_link(&mut self, id: ItemId, now: u32) -> u64 {
        let cache_id = self.next_cache_id();
        let item = &mut self.items[id.0];
        item.cache_id = cache_id;
        item.last_update_time = now;
        item.ref_count += 1;
        let (hash, expire_time) = (item.hash, item.expire_time);

        self.record_item(StatsOp::Link, Outcome::Success, &self.items[id.0]);
        self.index.insert(hash, id);
        self.wheel
            .push_back(&mut self.items, bucket_for(now, expire_time), id);
        metrics::ITEMS.increment();
        cache_id
    }

    /// Make an item unreachable and notify its watchers. The linkage
    /// reference is left for the caller to dispose of.
    fn detach(&mut self, id: ItemId, event: WatchEvent) {
        let item = &self.items[id.0];
        if !item.is_linked() {
            error!(?id, "detaching an item that is not linked");
            debug_assert!(false, "detaching an item that is not linked");
            return;
        }

        self.record_item(StatsOp::Unlink, Outcome::Success, item);
        let hash = item.hash;
        self.index.remove(hash, id);
        self.wheel.remove(&mut self.items, id);

        let item = &mut self.items[id.0];
        let update = WatchUpdate {
            cache_id: item.cache_id,
            event,
        };
        if let Some(mut watchers) = item.watchers.take() {
            let delivered = self
                .watches
                .notify_all(&mut watchers, update, &mut self.wakeups);
            metrics::WATCH_NOTIFICATIONS.add(delivered as u64);
        }
        metrics::ITEMS.decrement();
    }

    fn do_unlink(&mut self, id: ItemId, event: WatchEvent) {
        self.detach(id, event);
        self.release(id);
    }

    /// Unlink `old` (notifying `DataUpdated`) and link `new` in its place.
    fn do_replace(&mut self, old: ItemId, new: ItemId, now: u32) -> u64 {
        self.do_unlink(old, WatchEvent::DataUpdated);
        self.do_link(new, now)
    }

    /// Drop one reference; the last one returns the buffer to the allocator.
    fn release(&mut self, id: ItemId) {
        let item = &mut self.items[id.0];
        if item.ref_count == 0 {
            error!(?id, "releasing an item with no references");
            debug_assert!(false, "releasing an item with no references");
            return;
        }
        item.ref_count -= 1;
        if item.ref_count == 0 {
            let item = self.items.remove(id.0);
            self.allocator.release(item);
            self.update_memory_gauge();
        }
    }

    /// Notify the watchers of a linked item without unlinking it.
    fn notify(&mut self, id: ItemId, event: WatchEvent) {
        let item = &mut self.items[id.0];
        let update = WatchUpdate {
            cache_id: item.cache_id,
            event,
        };
        if let Some(mut watchers) = item.watchers.take() {
            let delivered = self
                .watches
                .notify_all(&mut watchers, update, &mut self.wakeups);
            metrics::WATCH_NOTIFICATIONS.add(delivered as u64);
            if !watchers.is_empty() {
                self.items[id.0].watchers = Some(watchers);
            }
        }
    }

    fn meta(&self, id: ItemId, now: u32) -> ItemMeta {
        let item = &self.items[id.0];
        ItemMeta {
            group_id: item.group_id,
            class_id: item.class_id,
            cache_id: item.cache_id,
            flags: item.flags,
            expiration: remaining(now, item.expire_time),
            data_len: item.data().len(),
            ext_len: item.ext().len(),
        }
    }

    /// Check a non-zero watch id.
    fn watch_ok(&self, watch_id: u32) -> bool {
        watch_id == 0 || self.watches.contains(watch_id)
    }

    fn relocate(&mut self, id: ItemId, now: u32) {
        let bucket = bucket_for(now, self.items[id.0].expire_time);
        self.wheel.relocate(&mut self.items, id, bucket);
    }

    fn expire_items(&mut self, now: u32) -> usize {
        let expired = self.wheel.sweep(&mut self.items, now);
        for &id in &expired {
            self.do_unlink(id, WatchEvent::Expired);
        }
        metrics::EXPIRATIONS.add(expired.len() as u64);
        expired.len()
    }

    fn take_wakeups(&mut self) -> Vec<(Arc<dyn WatchSink>, u32)> {
        let Inner { wakeups, sinks, .. } = self;
        wakeups
            .drain(..)
            .filter_map(|wakeup| sinks.get(wakeup.sink).map(|sink| (sink, wakeup.watch_id)))
            .collect()
    }
}

/// A new, unlinked item being filled in by the caller.
///
/// Obtained from [`CacheManager::alloc_item`] and consumed by one of the
/// store operations. Dropping it returns its buffer to the allocator.
pub struct PendingItem<'a> {
    manager: &'a CacheManager,
    /// `None` only once consumed or dropped.
    item: Option<Item>,
    cache_id: u64,
}

impl<'a> PendingItem<'a> {
    fn item(&self) -> &Item {
        let Some(item) = &self.item else {
            unreachable!("pending item used after it was consumed");
        };
        item
    }

    fn item_mut(&mut self) -> &mut Item {
        let Some(item) = &mut self.item else {
            unreachable!("pending item used after it was consumed");
        };
        item
    }

    /// The key.
    pub fn key(&self) -> &[u8] {
        self.item().key()
    }

    /// The data bytes.
    pub fn data(&self) -> &[u8] {
        self.item().data()
    }

    /// Mutable data bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.item_mut().data_mut()
    }

    /// The ext bytes.
    pub fn ext(&self) -> &[u8] {
        self.item().ext()
    }

    /// Mutable ext bytes.
    pub fn ext_mut(&mut self) -> &mut [u8] {
        self.item_mut().ext_mut()
    }

    /// Group namespace.
    pub fn group_id(&self) -> u32 {
        self.item().group_id()
    }

    /// Size class.
    pub fn class_id(&self) -> u8 {
        self.item().class_id()
    }

    /// Accounted size.
    pub fn total_size(&self) -> usize {
        self.item().total_size()
    }

    /// Require the stored item to carry `cache_id` (`0` means unconditional).
    pub fn set_cache_id(&mut self, cache_id: u64) {
        self.cache_id = cache_id;
    }

    /// Builder form of [`set_cache_id`](Self::set_cache_id).
    pub fn with_cache_id(mut self, cache_id: u64) -> Self {
        self.cache_id = cache_id;
        self
    }

    /// Hand the item over to `manager`. An item allocated by another manager
    /// is refused and its buffer goes back to the manager that owns it.
    fn into_parts(mut self, manager: &CacheManager) -> CacheResult<(Item, u64)> {
        if !std::ptr::eq(self.manager, manager) {
            error!("item allocated by another manager");
            return Err(CacheError::ForeignItem);
        }
        match self.item.take() {
            Some(item) => Ok((item, self.cache_id)),
            None => unreachable!("pending item used after it was consumed"),
        }
    }
}

impl Drop for PendingItem<'_> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.manager.inner.lock().discard(item);
        }
    }
}

impl std::fmt::Debug for PendingItem<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = f.debug_struct("PendingItem");
        if let Some(item) = &self.item {
            out.field("group_id", &item.group_id())
                .field("class_id", &item.class_id())
                .field("key_len", &item.key().len())
                .field("data_len", &item.data().len())
                .field("ext_len", &item.ext().len());
        }
        out.field("cache_id", &self.cache_id).finish()
    }
}

/// A counted reference to a stored item.
///
/// The item stays readable until this is dropped, even if the key is
/// replaced or removed in the meantime.
pub struct ItemRef<'a> {
    manager: &'a CacheManager,
    id: ItemId,
    meta: ItemMeta,
}

impl<'a> ItemRef<'a> {
    /// Metadata captured when the reference was taken.
    pub fn meta(&self) -> &ItemMeta {
        &self.meta
    }

    /// Version stamp.
    pub fn cache_id(&self) -> u64 {
        self.meta.cache_id
    }

    /// User flags.
    pub fn flags(&self) -> u32 {
        self.meta.flags
    }

    /// Seconds until expiration, `0` for never.
    pub fn expiration(&self) -> u32 {
        self.meta.expiration
    }

    /// Run `f` against the item under the manager lock. `f` must not call
    /// back into the manager.
    pub fn read<R>(&self, f: impl FnOnce(&Item) -> R) -> R {
        let inner = self.manager.inner.lock();
        f(&inner.items[self.id.0])
    }

    /// Copy of the data bytes.
    pub fn data(&self) -> Vec<u8> {
        self.read(|item| item.data().to_vec())
    }

    /// Copy of the ext bytes.
    pub fn ext(&self) -> Vec<u8> {
        self.read(|item| item.ext().to_vec())
    }

    /// Copy of the key.
    pub fn key(&self) -> Vec<u8> {
        self.read(|item| item.key().to_vec())
    }
}

impl Drop for ItemRef<'_> {
    fn drop(&mut self) {
        self.manager.inner.lock().release(self.id);
    }
}

impl std::fmt::Debug for ItemRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemRef")
            .field("id", &self.id)
            .field("meta", &self.meta)
            .finish()
    }
}

impl CacheManager {
    /// Start building a manager.
    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::new()
    }

    /// Run `f` under the lock, then wake any sinks it triggered.
    fn locked<R>(&self, f: impl FnOnce(&mut Inner, u32) -> R) -> R {
        let now = self.clock.now();
        let (result, wakeups) = {
            let mut inner = self.inner.lock();
            let result = f(&mut inner, now);
            (result, inner.take_wakeups())
        };
        for (sink, watch_id) in wakeups {
            metrics::WATCH_WAKEUPS.increment();
            sink.on_watch_notify(watch_id);
        }
        result
    }

    /// Current time according to the manager's clock.
    pub fn now(&self) -> u32 {
        self.clock.now()
    }

    /// Allocate an item for `key` with room for `data_size` + `ext_size`
    /// bytes. `expiration` is relative seconds, `0` for never.
    pub fn alloc_item(
        &self,
        group_id: u32,
        key: &[u8],
        flags: u32,
        expiration: u32,
        data_size: usize,
        ext_size: usize,
    ) -> CacheResult<PendingItem<'_>> {
        let item = self.locked(|inner, now| {
            inner.alloc(
                group_id,
                key,
                flags,
                absolute(now, expiration),
                data_size,
                ext_size,
            )
        })?;
        Ok(PendingItem {
            manager: self,
            item: Some(item),
            cache_id: 0,
        })
    }

    /// Allocate an item and copy `data` and `ext` into it.
    pub fn new_item(
        &self,
        group_id: u32,
        key: &[u8],
        data: &[u8],
        ext: &[u8],
        flags: u32,
        expiration: u32,
    ) -> CacheResult<PendingItem<'_>> {
        let mut item = self.alloc_item(group_id, key, flags, expiration, data.len(), ext.len())?;
        item.data_mut().copy_from_slice(data);
        item.ext_mut().copy_from_slice(ext);
        Ok(item)
    }

    /// Whether an item of this shape fits in some size class.
    pub fn item_size_ok(&self, key_len: usize, data_len: usize, ext_len: usize) -> bool {
        key_len <= MAX_KEY_LEN
            && self
                .inner
                .lock()
                .allocator
                .size_ok(item_size(key_len, data_len, ext_len))
    }

    /// Read an item. A non-zero `watch_id` subscribes that watch to it.
    pub fn get(&self, group_id: u32, key: &[u8], watch_id: u32) -> CacheResult<ItemRef<'_>> {
        metrics::GETS.increment();
        let (id, meta) = self.locked(|inner, now| {
            let Some(id) = inner.do_get(group_id, key, now) else {
                trace!(group_id, "get miss");
                inner.record(StatsOp::Get, Outcome::Miss, group_id);
                metrics::MISSES.increment();
                return Err(CacheError::NotFound);
            };

            let outcome = match subscribe(inner, id, watch_id) {
                Ok(outcome) => outcome,
                Err(err) => {
                    inner.record_item(StatsOp::Get, Outcome::WatchMiss, &inner.items[id.0]);
                    inner.release(id);
                    return Err(err);
                }
            };

            trace!(group_id, "get hit");
            inner.record_item(StatsOp::Get, hit(outcome), &inner.items[id.0]);
            metrics::HITS.increment();
            Ok((id, inner.meta(id, now)))
        })?;

        Ok(ItemRef {
            manager: self,
            id,
            meta,
        })
    }

    /// Read an item and reset its expiration to `expiration` seconds from
    /// now (`0` for never).
    pub fn get_touch(
        &self,
        group_id: u32,
        key: &[u8],
        watch_id: u32,
        expiration: u32,
    ) -> CacheResult<ItemRef<'_>> {
        metrics::GETS.increment();
        let (id, meta) = self.locked(|inner, now| {
            let Some(id) = inner.do_get(group_id, key, now) else {
                inner.record(StatsOp::GetTouch, Outcome::Miss, group_id);
                metrics::MISSES.increment();
                return Err(CacheError::NotFound);
            };

            let outcome = match subscribe(inner, id, watch_id) {
                Ok(outcome) => outcome,
                Err(err) => {
                    inner.record_item(StatsOp::GetTouch, Outcome::WatchMiss, &inner.items[id.0]);
                    inner.release(id);
                    return Err(err);
                }
            };

            inner.items[id.0].expire_time = absolute(now, expiration);
            inner.relocate(id, now);
            inner.record_item(StatsOp::GetTouch, hit(outcome), &inner.items[id.0]);
            metrics::HITS.increment();
            Ok((id, inner.meta(id, now)))
        })?;

        Ok(ItemRef {
            manager: self,
            id,
            meta,
        })
    }

    /// Read only an item's metadata and ext bytes.
    pub fn get_base(&self, group_id: u32, key: &[u8]) -> CacheResult<ItemBase> {
        self.locked(|inner, now| {
            let Some(id) = inner.do_get(group_id, key, now) else {
                inner.record(StatsOp::GetBase, Outcome::Miss, group_id);
                return Err(CacheError::NotFound);
            };
            let item = &inner.items[id.0];
            let base = ItemBase {
                cache_id: item.cache_id,
                flags: item.flags,
                expiration: remaining(now, item.expire_time),
                ext: item.ext().to_vec(),
            };
            inner.record_item(StatsOp::GetBase, Outcome::Hit, item);
            inner.release(id);
            Ok(base)
        })
    }

    /// Store `item` only if its key is absent. Returns the new cache id.
    pub fn add(&self, item: PendingItem<'_>, watch_id: u32) -> CacheResult<u64> {
        let (new, _) = item.into_parts(self)?;
        self.locked(|inner, now| {
            if let Some(old) = inner.do_get(new.group_id, new.key(), now) {
                inner.release(old);
                inner.record_item(StatsOp::Add, Outcome::Fail, &new);
                inner.discard(new);
                return Err(CacheError::Exists);
            }
            if !inner.watch_ok(watch_id) {
                inner.record_item(StatsOp::Add, Outcome::WatchMiss, &new);
                inner.discard(new);
                return Err(CacheError::WatchNotFound);
            }

            inner.record_item(StatsOp::Add, stored(watch_id), &new);
            let id = inner.insert(new);
            if watch_id != 0 {
                inner.items[id.0].add_watch(watch_id);
            }
            let cache_id = inner.do_link(id, now);
            inner.release(id);
            metrics::SETS.increment();
            Ok(cache_id)
        })
    }

    /// Store `item`, replacing any existing value. A non-zero cache id on
    /// the item must match the stored one.
    pub fn set(&self, item: PendingItem<'_>, watch_id: u32) -> CacheResult<u64> {
        let (new, expected) = item.into_parts(self)?;
        self.locked(|inner, now| {
            let old = inner.do_get(new.group_id, new.key(), now);
            if let Some(old) = old {
                if expected != 0 && expected != inner.items[old.0].cache_id {
                    inner.release(old);
                    inner.record_item(StatsOp::Set, Outcome::Mismatch, &new);
                    inner.discard(new);
                    return Err(CacheError::Mismatch);
                }
            }
            if !inner.watch_ok(watch_id) {
                if let Some(old) = old {
                    inner.release(old);
                }
                inner.record_item(StatsOp::Set, Outcome::WatchMiss, &new);
                inner.discard(new);
                return Err(CacheError::WatchNotFound);
            }

            inner.record_item(StatsOp::Set, stored(watch_id), &new);
            let id = inner.insert(new);
            let cache_id = match old {
                Some(old) => {
                    let cache_id = inner.do_replace(old, id, now);
                    inner.release(old);
                    cache_id
                }
                None => inner.do_link(id, now),
            };
            // added after the replace so the new watch misses the old item's update
            if watch_id != 0 {
                inner.items[id.0].add_watch(watch_id);
            }
            inner.release(id);
            metrics::SETS.increment();
            Ok(cache_id)
        })
    }

    /// Store `item` only if its key is present.
    pub fn replace(&self, item: PendingItem<'_>, watch_id: u32) -> CacheResult<u64> {
        let (new, expected) = item.into_parts(self)?;
        self.locked(|inner, now| {
            let Some(old) = inner.do_get(new.group_id, new.key(), now) else {
                inner.record(StatsOp::Replace, Outcome::Miss, new.group_id);
                inner.discard(new);
                return Err(CacheError::NotFound);
            };
            let failure = if expected != 0 && expected != inner.items[old.0].cache_id {
                Some((Outcome::Mismatch, CacheError::Mismatch))
            } else if !inner.watch_ok(watch_id) {
                Some((Outcome::WatchMiss, CacheError::WatchNotFound))
            } else {
                None
            };
            if let Some((outcome, err)) = failure {
                inner.release(old);
                inner.record_item(StatsOp::Replace, outcome, &new);
                inner.discard(new);
                return Err(err);
            }

            inner.record_item(StatsOp::Replace, stored(watch_id), &new);
            let id = inner.insert(new);
            let cache_id = inner.do_replace(old, id, now);
            if watch_id != 0 {
                inner.items[id.0].add_watch(watch_id);
            }
            inner.release(old);
            inner.release(id);
            metrics::SETS.increment();
            Ok(cache_id)
        })
    }

    /// Append `item`'s data to the stored value.
    pub fn append(&self, item: PendingItem<'_>, watch_id: u32) -> CacheResult<u64> {
        self.concat(item, watch_id, StatsOp::Append)
    }

    /// Prepend `item`'s data to the stored value.
    pub fn prepend(&self, item: PendingItem<'_>, watch_id: u32) -> CacheResult<u64> {
        self.concat(item, watch_id, StatsOp::Prepend)
    }

    fn concat(&self, item: PendingItem<'_>, watch_id: u32, op: StatsOp) -> CacheResult<u64> {
        let (part, expected) = item.into_parts(self)?;
        self.locked(|inner, now| {
            let Some(old) = inner.do_get(part.group_id, part.key(), now) else {
                inner.record(op, Outcome::Miss, part.group_id);
                inner.discard(part);
                return Err(CacheError::NotFound);
            };
            let failure = if expected != 0 && expected != inner.items[old.0].cache_id {
                Some((Outcome::Mismatch, CacheError::Mismatch))
            } else if !inner.watch_ok(watch_id) {
                Some((Outcome::WatchMiss, CacheError::WatchNotFound))
            } else {
                None
            };
            if let Some((outcome, err)) = failure {
                inner.release(old);
                inner.record_item(op, outcome, &part);
                inner.discard(part);
                return Err(err);
            }

            let (flags, expire_time, old_data_len, ext_len) = {
                let item = &inner.items[old.0];
                (item.flags, item.expire_time, item.data().len(), item.ext().len())
            };
            let joined = inner.alloc(
                part.group_id,
                part.key(),
                flags,
                expire_time,
                old_data_len + part.data().len(),
                ext_len,
            );
            let mut joined = match joined {
                Ok(joined) => joined,
                Err(err) => {
                    inner.release(old);
                    inner.record_item(op, refused(err), &part);
                    inner.discard(part);
                    return Err(err);
                }
            };

            let prefix_len = if op == StatsOp::Prepend {
                part.data().len()
            } else {
                old_data_len
            };
            {
                let src = &inner.items[old.0];
                let (head, tail) = joined.data_mut().split_at_mut(prefix_len);
                if op == StatsOp::Prepend {
                    head.copy_from_slice(part.data());
                    tail.copy_from_slice(src.data());
                } else {
                    head.copy_from_slice(src.data());
                    tail.copy_from_slice(part.data());
                }
                joined.ext_mut().copy_from_slice(src.ext());
            }

            inner.record_item(op, stored(watch_id), &part);
            inner.discard(part);
            let id = inner.insert(joined);
            let cache_id = inner.do_replace(old, id, now);
            if watch_id != 0 {
                inner.items[id.0].add_watch(watch_id);
            }
            inner.release(old);
            inner.release(id);
            metrics::SETS.increment();
            Ok(cache_id)
        })
    }

    /// Delete a key. A non-zero `cache_id` must match.
    pub fn remove(&self, group_id: u32, key: &[u8], cache_id: u64) -> CacheResult<()> {
        self.locked(|inner, now| {
            let Some(id) = inner.do_get(group_id, key, now) else {
                inner.record(StatsOp::Delete, Outcome::Miss, group_id);
                return Err(CacheError::NotFound);
            };
            let result = if cache_id == 0 || cache_id == inner.items[id.0].cache_id {
                inner.record_item(StatsOp::Delete, Outcome::Success, &inner.items[id.0]);
                inner.do_unlink(id, WatchEvent::Deleted);
                metrics::DELETES.increment();
                Ok(())
            } else {
                inner.record_item(StatsOp::Delete, Outcome::Mismatch, &inner.items[id.0]);
                Err(CacheError::Mismatch)
            };
            inner.release(id);
            result
        })
    }

    /// Add (`incr`) or subtract `delta` to a value stored as a decimal
    /// integer. Data that does not parse counts as `0`.
    pub fn delta(
        &self,
        group_id: u32,
        key: &[u8],
        incr: bool,
        delta: i64,
        cache_id: u64,
    ) -> CacheResult<DeltaResult> {
        let op = if incr { StatsOp::Incr } else { StatsOp::Decr };
        self.locked(|inner, now| {
            let Some(id) = inner.do_get(group_id, key, now) else {
                inner.record(op, Outcome::Miss, group_id);
                return Err(CacheError::NotFound);
            };
            if cache_id != 0 && cache_id != inner.items[id.0].cache_id {
                inner.record_item(op, Outcome::Mismatch, &inner.items[id.0]);
                inner.release(id);
                return Err(CacheError::Mismatch);
            }

            let current = parse_i64(inner.items[id.0].data());
            let value = if incr {
                current.wrapping_add(delta)
            } else {
                current.wrapping_sub(delta)
            };
            let digits = value.to_string();

            let result = if digits.len() == inner.items[id.0].data().len() {
                let cache_id = inner.next_cache_id();
                let item = &mut inner.items[id.0];
                item.data_mut().copy_from_slice(digits.as_bytes());
                item.cache_id = cache_id;
                item.last_update_time = now;
                inner.notify(id, WatchEvent::DataUpdated);
                Ok(cache_id)
            } else {
                let (flags, expire_time, ext_len) = {
                    let item = &inner.items[id.0];
                    (item.flags, item.expire_time, item.ext().len())
                };
                let key = inner.items[id.0].key().to_vec();
                match inner.alloc(group_id, &key, flags, expire_time, digits.len(), ext_len) {
                    Ok(mut fresh) => {
                        fresh.data_mut().copy_from_slice(digits.as_bytes());
                        fresh.ext_mut().copy_from_slice(inner.items[id.0].ext());
                        let new_id = inner.insert(fresh);
                        let cache_id = inner.do_replace(id, new_id, now);
                        inner.release(new_id);
                        Ok(cache_id)
                    }
                    Err(err) => Err(err),
                }
            };

            match result {
                Ok(cache_id) => {
                    inner.record(op, Outcome::Success, group_id);
                    inner.release(id);
                    metrics::SETS.increment();
                    Ok(DeltaResult { value, cache_id })
                }
                Err(err) => {
                    inner.record(op, refused(err), group_id);
                    inner.release(id);
                    Err(err)
                }
            }
        })
    }

    /// Change an item's flags. Returns the new cache id.
    pub fn update_flags(
        &self,
        group_id: u32,
        key: &[u8],
        flags: u32,
        cache_id: u64,
    ) -> CacheResult<u64> {
        self.update_base(group_id, key, cache_id, StatsOp::UpdateFlags, |item, _| {
            item.flags = flags;
        })
    }

    /// Change an item's expiration (relative seconds, `0` for never).
    /// Returns the new cache id.
    pub fn update_expiration(
        &self,
        group_id: u32,
        key: &[u8],
        expiration: u32,
        cache_id: u64,
    ) -> CacheResult<u64> {
        self.update_base(
            group_id,
            key,
            cache_id,
            StatsOp::UpdateExpiration,
            |item, now| {
                item.expire_time = absolute(now, expiration);
            },
        )
    }

    fn update_base(
        &self,
        group_id: u32,
        key: &[u8],
        cache_id: u64,
        op: StatsOp,
        apply: impl FnOnce(&mut Item, u32),
    ) -> CacheResult<u64> {
        self.locked(|inner, now| {
            let Some(id) = inner.do_get(group_id, key, now) else {
                inner.record(op, Outcome::Miss, group_id);
                return Err(CacheError::NotFound);
            };
            if cache_id != 0 && cache_id != inner.items[id.0].cache_id {
                inner.record_item(op, Outcome::Mismatch, &inner.items[id.0]);
                inner.release(id);
                return Err(CacheError::Mismatch);
            }

            let new_cache_id = inner.next_cache_id();
            let item = &mut inner.items[id.0];
            apply(item, now);
            item.cache_id = new_cache_id;
            inner.relocate(id, now);
            inner.notify(id, WatchEvent::BaseInfoUpdated);
            inner.record_item(op, Outcome::Success, &inner.items[id.0]);
            inner.release(id);
            Ok(new_cache_id)
        })
    }

    /// Remove every item of a group. Buffers not pinned by a reader return
    /// to the allocator at once.
    pub fn flush(&self, group_id: u32) -> FlushSummary {
        let summary = self.locked(|inner, _| {
            let mut summary = FlushSummary::default();
            for bucket in 0..BUCKET_COUNT as u8 {
                for id in inner.wheel.bucket_items(&inner.items, bucket) {
                    let item = &inner.items[id.0];
                    if item.group_id != group_id {
                        continue;
                    }
                    summary.count += 1;
                    summary.bytes += item.total_size() as u64;
                    inner.do_unlink(id, WatchEvent::Flushed);
                }
            }
            inner.record(StatsOp::Flush, Outcome::Success, group_id);
            summary
        });
        metrics::FLUSHES.increment();
        debug!(group_id, count = summary.count, bytes = summary.bytes, "flushed group");
        summary
    }

    /// Run the expiration sweep, at most once per clock second: expire
    /// watches, then expire items.
    pub fn check_expired(&self) {
        let now = self.clock.now();
        if self.last_check.swap(now, Ordering::AcqRel) == now {
            return;
        }
        self.locked(|inner, now| {
            let watches = inner.watches.expire(now);
            let items = inner.expire_items(now);
            metrics::WATCHES.set(inner.watches.len() as i64);
            if watches + items > 0 {
                debug!(watches, items, "expiration sweep");
            }
        });
    }

    /// Create a watch that lives `max_interval` seconds past each poll.
    /// Returns `None` if no free id was found.
    pub fn create_watch(&self, group_id: u32, max_interval: u32) -> Option<u32> {
        self.locked(|inner, now| {
            let watch_id = inner.watches.create(watch_deadline(now, max_interval))?;
            inner.record(StatsOp::CreateWatch, Outcome::Success, group_id);
            metrics::WATCHES.set(inner.watches.len() as i64);
            Some(watch_id)
        })
    }

    /// Poll a watch. Returns its outstanding batch, or arms `sink` to be
    /// woken by the next notification. Polling extends the watch's life by
    /// `max_interval` seconds.
    pub fn check_watch_and_set_callback(
        &self,
        sink: SinkHandle,
        group_id: u32,
        watch_id: u32,
        ack_sequence: u32,
        max_interval: u32,
    ) -> CacheResult<WatchPoll> {
        self.locked(|inner, now| {
            let Some(watch) = inner.watches.get_mut(watch_id) else {
                inner.record(StatsOp::CheckWatch, Outcome::Miss, group_id);
                return Err(CacheError::WatchNotFound);
            };
            let (poll, replaced) =
                watch.check_and_set(sink, ack_sequence, watch_deadline(now, max_interval));
            if let Some(old) = replaced {
                inner.wakeups.push(Wakeup {
                    sink: old,
                    watch_id,
                });
            }
            inner.record(StatsOp::CheckWatch, Outcome::Hit, group_id);
            Ok(poll)
        })
    }

    /// Disarm `sink` from a watch, collecting pending notifications if no
    /// batch is outstanding.
    pub fn check_watch_and_clear_callback(
        &self,
        sink: SinkHandle,
        watch_id: u32,
    ) -> CacheResult<Option<WatchBatch>> {
        self.locked(|inner, _| {
            inner
                .watches
                .get_mut(watch_id)
                .map(|watch| watch.check_and_clear(sink))
                .ok_or(CacheError::WatchNotFound)
        })
    }

    /// Register a sink for watch wake-ups.
    pub fn register_sink(&self, sink: Arc<dyn WatchSink>) -> SinkHandle {
        self.inner.lock().sinks.register(sink)
    }

    /// Unregister a sink. Wake-ups aimed at it are dropped.
    pub fn unregister_sink(&self, handle: SinkHandle) -> bool {
        self.inner.lock().sinks.unregister(handle)
    }

    /// Track a group separately in statistics.
    pub fn add_stats_group(&self, group_id: u32) -> bool {
        self.stats.add_group(group_id)
    }

    /// Stop tracking a group in statistics.
    pub fn remove_stats_group(&self, group_id: u32) -> bool {
        self.stats.remove_group(group_id)
    }

    /// Render statistics for a group (or all groups) and optionally a class.
    pub fn stats_report(&self, group_id: Option<u32>, class_id: Option<u8>) -> String {
        self.stats.report(group_id, class_id)
    }

    /// Bytes held by live and pooled buffers.
    pub fn memory_used(&self) -> usize {
        self.inner.lock().allocator.memory_used()
    }

    /// The memory ceiling.
    pub fn memory_limit(&self) -> usize {
        self.inner.lock().allocator.memory_limit()
    }

    /// Bytes held by pooled buffers.
    pub fn pooled_bytes(&self) -> usize {
        self.inner.lock().allocator.pooled_bytes()
    }

    /// Number of linked items.
    pub fn item_count(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Number of items in the arena, linked or not.
    pub fn arena_len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Number of live watches.
    pub fn watch_count(&self) -> usize {
        self.inner.lock().watches.len()
    }

    /// Number of size classes.
    pub fn class_count(&self) -> usize {
        self.inner.lock().allocator.classes().len()
    }

    /// Install a freshly loaded item unless the key appeared meanwhile, in
    /// which case the loaded item is discarded and the existing one returned.
    pub(crate) fn install(&self, item: PendingItem<'_>, watch_id: u32) -> CacheResult<ItemRef<'_>> {
        let (new, _) = item.into_parts(self)?;
        let (id, meta) = self.locked(|inner, now| {
            if let Some(old) = inner.do_get(new.group_id, new.key(), now) {
                inner.discard(new);
                return Ok((old, inner.meta(old, now)));
            }
            if !inner.watch_ok(watch_id) {
                inner.discard(new);
                return Err(CacheError::WatchNotFound);
            }
            let id = inner.insert(new);
            if watch_id != 0 {
                inner.items[id.0].add_watch(watch_id);
            }
            inner.do_link(id, now);
            Ok((id, inner.meta(id, now)))
        })?;

        Ok(ItemRef {
            manager: self,
            id,
            meta,
        })
    }

    /// Verify internal consistency. Intended for tests.
    pub fn check_invariants(&self) -> Result<(), String> {
        let inner = self.inner.lock();

        let mut linked = 0;
        let mut live_bytes = 0;
        for (index, item) in inner.items.iter() {
            let id = ItemId(index);
            if item.ref_count == 0 {
                return Err(format!("{id:?} in arena with no references"));
            }
            if item.is_linked() != inner.index.contains(item.hash, id) {
                return Err(format!("{id:?} bucket and index membership disagree"));
            }
            if item.is_linked() {
                linked += 1;
            }
            live_bytes += inner.allocator.classes().size_of(item.class_id);
        }

        if linked != inner.index.len() || linked != inner.wheel.len() {
            return Err(format!(
                "linked {linked}, indexed {}, bucketed {}",
                inner.index.len(),
                inner.wheel.len()
            ));
        }

        let accounted = live_bytes + inner.allocator.pooled_bytes();
        if accounted != inner.allocator.memory_used() {
            return Err(format!(
                "memory_used {} but live + pooled = {accounted}",
                inner.allocator.memory_used()
            ));
        }
        if inner.allocator.memory_used() > inner.allocator.memory_limit() {
            return Err("memory ceiling exceeded".to_string());
        }
        Ok(())
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CacheManager")
            .field("items", &inner.index.len())
            .field("memory_used", &inner.allocator.memory_used())
            .field("memory_limit", &inner.allocator.memory_limit())
            .field("watches", &inner.watches.len())
            .finish()
    }
}

/// Subscribe `watch_id` (if non-zero) to a referenced item.
fn subscribe(inner: &mut Inner, id: ItemId, watch_id: u32) -> CacheResult<bool> {
    if watch_id == 0 {
        return Ok(false);
    }
    if !inner.watches.contains(watch_id) {
        return Err(CacheError::WatchNotFound);
    }
    inner.items[id.0].add_watch(watch_id);
    Ok(true)
}

#[inline]
fn hit(watched: bool) -> Outcome {
    if watched {
        Outcome::HitWatch
    } else {
        Outcome::Hit
    }
}

#[inline]
fn stored(watch_id: u32) -> Outcome {
    if watch_id != 0 {
        Outcome::SuccessWatch
    } else {
        Outcome::Success
    }
}

/// Outcome recorded for a failed allocation.
#[inline]
fn refused(err: CacheError) -> Outcome {
    match err {
        CacheError::OutOfMemory => Outcome::OutOfMemory,
        _ => Outcome::TooLarge,
    }
}

/// Parse stored data as a decimal integer, `0` if it is not one.
fn parse_i64(data: &[u8]) -> i64 {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager() -> (CacheManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1000));
        let manager = CacheManager::builder()
            .memory_limit(4 * 1024 * 1024)
            .item_size_max(64 * 1024)
            .clock(clock.clone())
            .build();
        (manager, clock)
    }

    fn store(manager: &CacheManager, key: &[u8], data: &[u8]) -> u64 {
        let item = manager.new_item(0, key, data, b"", 0, 0).unwrap();
        manager.set(item, 0).unwrap()
    }

    #[test]
    fn test_linked_item_holds_one_reference() {
        let (manager, _) = manager();
        store(&manager, b"k", b"v");

        let inner = manager.inner.lock();
        assert_eq!(inner.items.len(), 1);
        let (_, item) = inner.items.iter().next().unwrap();
        assert_eq!(item.ref_count, 1);
        assert!(item.is_linked());
    }

    #[test]
    fn test_reader_pins_replaced_item() {
        let (manager, _) = manager();
        store(&manager, b"k", b"old");

        let reader = manager.get(0, b"k", 0).unwrap();
        store(&manager, b"k", b"new");
        assert_eq!(manager.arena_len(), 2);
        assert_eq!(manager.item_count(), 1);
        assert_eq!(reader.data(), b"old");
        manager.check_invariants().unwrap();

        drop(reader);
        assert_eq!(manager.arena_len(), 1);
        assert_eq!(manager.get(0, b"k", 0).unwrap().data(), b"new");
        manager.check_invariants().unwrap();
    }

    #[test]
    fn test_dropped_pending_item_is_pooled() {
        let (manager, _) = manager();
        let item = manager.new_item(0, b"k", b"value", b"", 0, 0).unwrap();
        let class_id = item.class_id();
        let used = manager.memory_used();
        drop(item);

        assert_eq!(manager.arena_len(), 0);
        assert_eq!(manager.memory_used(), used);
        assert_eq!(manager.inner.lock().allocator.free_count(class_id), 1);
    }

    #[test]
    fn test_cache_ids_increase_and_skip_zero() {
        let (manager, _) = manager();
        let first = store(&manager, b"a", b"1");
        let second = store(&manager, b"b", b"2");
        assert!(first > 0);
        assert!(second > first);

        manager.inner.lock().last_cache_id = u64::MAX;
        let wrapped = store(&manager, b"c", b"3");
        assert_eq!(wrapped, 1);
    }

    #[test]
    fn test_flush_releases_linkage_reference() {
        let (manager, _) = manager();
        store(&manager, b"a", b"1");
        store(&manager, b"b", b"2");
        let reader = manager.get(0, b"b", 0).unwrap();

        let summary = manager.flush(0);
        assert_eq!(summary.count, 2);
        assert_eq!(manager.item_count(), 0);
        // only the pinned item is still in the arena
        assert_eq!(manager.arena_len(), 1);
        {
            let inner = manager.inner.lock();
            let (_, item) = inner.items.iter().next().unwrap();
            assert_eq!(item.ref_count, 1);
            assert!(!item.is_linked());
        }
        manager.check_invariants().unwrap();

        drop(reader);
        assert_eq!(manager.arena_len(), 0);
        manager.check_invariants().unwrap();
    }

    #[test]
    fn test_check_expired_once_per_second() {
        let (manager, clock) = manager();
        let item = manager.new_item(0, b"a", b"1", b"", 0, 1).unwrap();
        manager.add(item, 0).unwrap();
        manager.check_expired();

        clock.advance(1);
        manager.last_check.store(clock.now(), Ordering::Release);
        manager.check_expired();
        assert_eq!(manager.arena_len(), 1);

        clock.advance(1);
        manager.check_expired();
        assert_eq!(manager.arena_len(), 0);
    }

    #[test]
    fn test_in_place_delta_keeps_slot() {
        let (manager, _) = manager();
        let cache_id = store(&manager, b"n", b"10");

        let result = manager.delta(0, b"n", true, 5, cache_id).unwrap();
        assert_eq!(result.value, 15);
        assert!(result.cache_id > cache_id);
        assert_eq!(manager.arena_len(), 1);

        let item = manager.get(0, b"n", 0).unwrap();
        assert_eq!(item.data(), b"15");
        assert_eq!(item.cache_id(), result.cache_id);
    }

    #[test]
    fn test_resized_delta_relinks() {
        let (manager, _) = manager();
        store(&manager, b"n", b"9");

        let result = manager.delta(0, b"n", true, 1, 0).unwrap();
        assert_eq!(result.value, 10);
        assert_eq!(manager.get(0, b"n", 0).unwrap().data(), b"10");
        manager.check_invariants().unwrap();
    }

    #[test]
    fn test_parse_i64() {
        assert_eq!(parse_i64(b"42"), 42);
        assert_eq!(parse_i64(b"-7"), -7);
        assert_eq!(parse_i64(b" 8 "), 8);
        assert_eq!(parse_i64(b"abc"), 0);
        assert_eq!(parse_i64(&[0xff]), 0);
    }

    #[test]
    fn test_watch_miss_releases_reference() {
        let (manager, _) = manager();
        store(&manager, b"k", b"v");

        assert_eq!(manager.get(0, b"k", 77).unwrap_err(), CacheError::WatchNotFound);
        let inner = manager.inner.lock();
        let (_, item) = inner.items.iter().next().unwrap();
        assert_eq!(item.ref_count, 1);
    }

    #[test]
    fn test_get_touch_moves_bucket() {
        let (manager, _) = manager();
        let item = manager.new_item(0, b"k", b"v", b"", 0, 0).unwrap();
        manager.add(item, 0).unwrap();
        assert_eq!(
            manager.inner.lock().wheel.bucket_len(crate::expiration::NEVER_BUCKET),
            1
        );

        let touched = manager.get_touch(0, b"k", 0, 100).unwrap();
        assert_eq!(touched.expiration(), 100);
        drop(touched);

        let inner = manager.inner.lock();
        assert_eq!(inner.wheel.bucket_len(crate::expiration::NEVER_BUCKET), 0);
        assert_eq!(inner.wheel.bucket_len(bucket_for(1000, 1100)), 1);
    }

    #[test]
    fn test_install_returns_existing_item() {
        let (manager, _) = manager();
        let cache_id = store(&manager, b"k", b"first");

        let loaded = manager.new_item(0, b"k", b"second", b"", 0, 0).unwrap();
        let found = manager.install(loaded, 0).unwrap();
        assert_eq!(found.cache_id(), cache_id);
        assert_eq!(found.data(), b"first");
        drop(found);
        assert_eq!(manager.arena_len(), 1);
    }

    #[test]
    fn test_foreign_item_refused() {
        let (other, _) = manager();
        let (manager, _) = manager();
        let other_used = other.memory_used();

        let item = other.new_item(0, b"k", b"v", b"", 0, 0).unwrap();
        assert!(format!("{item:?}").contains("PendingItem"));
        assert_eq!(manager.set(item, 0).unwrap_err(), CacheError::ForeignItem);

        assert_eq!(manager.item_count(), 0);
        assert_eq!(manager.memory_used(), 0);
        assert_eq!(other.arena_len(), 0);
        assert!(other.memory_used() > other_used);
        other.check_invariants().unwrap();
        manager.check_invariants().unwrap();
    }

    #[test]
    fn test_delta_too_large_outcome() {
        use crate::item::item_size;
        use crate::stats::GroupStats;

        let stats = Arc::new(GroupStats::new());
        let manager = CacheManager::builder()
            .memory_limit(4 * 1024 * 1024)
            .item_size_max(64 * 1024)
            .clock(Arc::new(ManualClock::new(1000)))
            .stats(stats.clone())
            .build();

        // one digit of data fills the largest class exactly
        let largest = manager.inner.lock().allocator.classes().largest();
        let ext = vec![b'x'; largest - item_size(1, 1, 0)];
        let item = manager.new_item(0, b"n", b"9", &ext, 0, 0).unwrap();
        let cache_id = manager.set(item, 0).unwrap();

        assert_eq!(
            manager.delta(0, b"n", true, 1, 0).unwrap_err(),
            CacheError::TooLarge
        );
        assert_eq!(stats.count(None, StatsOp::Incr, Outcome::TooLarge), 1);
        assert_eq!(stats.count(None, StatsOp::Incr, Outcome::OutOfMemory), 0);

        let found = manager.get(0, b"n", 0).unwrap();
        assert_eq!(found.cache_id(), cache_id);
        assert_eq!(found.data(), b"9");
    }
}
