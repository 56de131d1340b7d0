//! Hash index from `(group_id, key)` to item handles.
//!
//! Buckets are short chains of `(hash, ItemId)` pairs. The index stores no
//! keys: a hash match is confirmed through a [`KeyVerifier`] that looks the
//! candidate up in item storage.

use ahash::RandomState;
use slab::Slab;

use crate::item::{Item, ItemId};

/// Default number of buckets, as a power of two.
pub const DEFAULT_HASHTABLE_POWER: u8 = 16;

/// Confirms that a hash match is a real key match.
pub trait KeyVerifier {
    /// Whether the item behind `id` has this group and key.
    fn verify(&self, id: ItemId, group_id: u32, key: &[u8]) -> bool;
}

impl KeyVerifier for Slab<Item> {
    #[inline]
    fn verify(&self, id: ItemId, group_id: u32, key: &[u8]) -> bool {
        self.get(id.0).is_some_and(|item| item.matches(group_id, key))
    }
}

/// Chained hash index.
#[derive(Debug)]
pub struct HashIndex {
    hash_builder: RandomState,
    buckets: Vec<Vec<(u32, ItemId)>>,
    mask: usize,
    len: usize,
}

impl HashIndex {
    /// Create an index with `2^power` buckets. It doubles when the average
    /// chain exceeds two entries.
    pub fn new(power: u8) -> Self {
        #[cfg(test)]
        let hash_builder = RandomState::with_seeds(
            0xbb8c484891ec6c86,
            0x0522a25ae9c769f9,
            0xeed2797b9571bc75,
            0x4feb29c1fbbd59d0,
        );
        #[cfg(not(test))]
        let hash_builder = RandomState::new();

        let num_buckets = 1usize << power.min(30);
        Self {
            hash_builder,
            buckets: (0..num_buckets).map(|_| Vec::new()).collect(),
            mask: num_buckets - 1,
            len: 0,
        }
    }

    /// Hash a `(group_id, key)` pair.
    #[inline]
    pub fn hash(&self, group_id: u32, key: &[u8]) -> u32 {
        let hash = self.hash_builder.hash_one((group_id, key));
        (hash ^ (hash >> 32)) as u32
    }

    /// Number of indexed items.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the index is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of buckets.
    #[inline]
    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Look up an item by key.
    pub fn find(
        &self,
        hash: u32,
        group_id: u32,
        key: &[u8],
        verifier: &impl KeyVerifier,
    ) -> Option<ItemId> {
        self.buckets[hash as usize & self.mask]
            .iter()
            .find(|&&(h, id)| h == hash && verifier.verify(id, group_id, key))
            .map(|&(_, id)| id)
    }

    /// Index an item. The caller guarantees its key is not yet present.
    pub fn insert(&mut self, hash: u32, id: ItemId) {
        if self.len >= self.buckets.len() * 2 {
            self.grow();
        }
        self.buckets[hash as usize & self.mask].push((hash, id));
        self.len += 1;
    }

    /// Remove a specific item. Returns whether it was indexed.
    pub fn remove(&mut self, hash: u32, id: ItemId) -> bool {
        let chain = &mut self.buckets[hash as usize & self.mask];
        match chain.iter().position(|&(_, other)| other == id) {
            Some(pos) => {
                chain.swap_remove(pos);
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    /// Whether a specific item is indexed.
    pub fn contains(&self, hash: u32, id: ItemId) -> bool {
        self.buckets[hash as usize & self.mask]
            .iter()
            .any(|&(_, other)| other == id)
    }

    fn grow(&mut self) {
        let num_buckets = self.buckets.len() * 2;
        let mask = num_buckets - 1;
        let mut buckets: Vec<Vec<(u32, ItemId)>> = (0..num_buckets).map(|_| Vec::new()).collect();
        for (hash, id) in self.buckets.drain(..).flatten() {
            buckets[hash as usize & mask].push((hash, id));
        }
        self.buckets = buckets;
        self.mask = mask;
    }
}
