//! Cache item storage.
//!
//! An item owns one size-class buffer laid out as:
//!
//! ```text
//! +-----------+----------------+---------------+---------+
//! |    key    |      data      |      ext      | (slack) |
//! | key_len   |   data_size    |   ext_size    |         |
//! +-----------+----------------+---------------+---------+
//! ```
//!
//! Metadata lives in the [`Item`] struct itself; [`ITEM_HEADER_SIZE`] is the
//! per-item overhead charged against the memory ceiling for it.

use std::collections::BTreeSet;

/// Per-item overhead accounted in every size class.
pub const ITEM_HEADER_SIZE: usize = 48;

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 255;

/// Total accounted size of an item with the given payload.
#[inline]
pub fn item_size(key_len: usize, data_size: usize, ext_size: usize) -> usize {
    ITEM_HEADER_SIZE + key_len + data_size + ext_size
}

/// Handle to an item stored in the manager's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub(crate) usize);

/// Links of an item within an expiration bucket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BucketLink {
    pub bucket: Option<u8>,
    pub prev: Option<ItemId>,
    pub next: Option<ItemId>,
}

/// A cache entry.
#[derive(Debug)]
pub struct Item {
    pub(crate) group_id: u32,
    pub(crate) hash: u32,
    pub(crate) class_id: u8,
    pub(crate) flags: u32,
    pub(crate) expire_time: u32,
    pub(crate) last_update_time: u32,
    pub(crate) cache_id: u64,
    pub(crate) ref_count: u32,
    pub(crate) watchers: Option<BTreeSet<u32>>,
    pub(crate) link: BucketLink,
    key_len: usize,
    data_size: usize,
    ext_size: usize,
    buf: Box<[u8]>,
}

impl Item {
    /// Build an unlinked item over `buf`, copying the key in.
    ///
    /// The new item carries one reference, owned by the caller that
    /// allocated it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        class_id: u8,
        buf: Box<[u8]>,
        group_id: u32,
        hash: u32,
        key: &[u8],
        flags: u32,
        expire_time: u32,
        data_size: usize,
        ext_size: usize,
    ) -> Self {
        debug_assert!(key.len() + data_size + ext_size <= buf.len());
        let mut item = Self {
            group_id,
            hash,
            class_id,
            flags,
            expire_time,
            last_update_time: 0,
            cache_id: 0,
            ref_count: 1,
            watchers: None,
            link: BucketLink::default(),
            key_len: key.len(),
            data_size,
            ext_size,
            buf,
        };
        item.buf[..key.len()].copy_from_slice(key);
        item
    }

    /// Group namespace of the item.
    #[inline]
    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    /// Size class the item was allocated from.
    #[inline]
    pub fn class_id(&self) -> u8 {
        self.class_id
    }

    /// Opaque user flags.
    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Absolute expiration time, `0` for never.
    #[inline]
    pub fn expire_time(&self) -> u32 {
        self.expire_time
    }

    /// Time of the last link.
    #[inline]
    pub fn last_update_time(&self) -> u32 {
        self.last_update_time
    }

    /// Version stamp; `0` until linked.
    #[inline]
    pub fn cache_id(&self) -> u64 {
        self.cache_id
    }

    /// Number of outstanding references (linkage included).
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Whether the item is reachable from the hash index.
    #[inline]
    pub fn is_linked(&self) -> bool {
        self.link.bucket.is_some()
    }

    /// The key bytes.
    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.buf[..self.key_len]
    }

    /// The data bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        let start = self.key_len;
        &self.buf[start..start + self.data_size]
    }

    /// The extension bytes (e.g. a MIME type).
    #[inline]
    pub fn ext(&self) -> &[u8] {
        let start = self.key_len + self.data_size;
        &self.buf[start..start + self.ext_size]
    }

    #[inline]
    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        let start = self.key_len;
        &mut self.buf[start..start + self.data_size]
    }

    #[inline]
    pub(crate) fn ext_mut(&mut self) -> &mut [u8] {
        let start = self.key_len + self.data_size;
        &mut self.buf[start..start + self.ext_size]
    }

    /// Accounted size: header plus key, data and ext.
    #[inline]
    pub fn total_size(&self) -> usize {
        item_size(self.key_len, self.data_size, self.ext_size)
    }

    #[inline]
    pub(crate) fn matches(&self, group_id: u32, key: &[u8]) -> bool {
        self.group_id == group_id && self.key() == key
    }

    /// Subscribe a watch to changes of this item.
    pub(crate) fn add_watch(&mut self, watch_id: u32) {
        self.watchers.get_or_insert_with(BTreeSet::new).insert(watch_id);
    }

    /// Watch ids subscribed to this item.
    pub fn watchers(&self) -> impl Iterator<Item = u32> + '_ {
        self.watchers.iter().flat_map(|set| set.iter().copied())
    }

    /// Give the buffer back for pooling.
    pub(crate) fn into_buffer(self) -> Box<[u8]> {
        self.buf
    }
}
