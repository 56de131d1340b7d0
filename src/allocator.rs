//! Size-class allocator with per-class free lists and a memory ceiling.
//!
//! Buffers are carved per item from the heap and recycled through a bounded
//! free list per class. `memory_used` counts every live or pooled buffer at
//! its full class size, so it never exceeds `memory_limit`.

use tracing::warn;

use crate::class::SlabClasses;
use crate::error::{CacheError, CacheResult};
use crate::item::{Item, ITEM_HEADER_SIZE};

/// The size-class allocator.
#[derive(Debug)]
pub struct SlabAllocator {
    /// Size class table.
    classes: SlabClasses,
    /// Pooled buffers, indexed by class id.
    free: Vec<Vec<Box<[u8]>>>,
    /// Hard ceiling on `memory_used`.
    memory_limit: usize,
    /// Bytes held by live and pooled buffers, at class size.
    memory_used: usize,
}

impl SlabAllocator {
    /// Create an allocator over `classes` bounded by `memory_limit` bytes.
    pub fn new(classes: SlabClasses, memory_limit: usize) -> Self {
        let free = (0..=classes.max_class_id()).map(|_| Vec::new()).collect();
        Self {
            classes,
            free,
            memory_limit,
            memory_used: 0,
        }
    }

    /// The class table.
    #[inline]
    pub fn classes(&self) -> &SlabClasses {
        &self.classes
    }

    /// Select the smallest class fitting `size` bytes (header included).
    #[inline]
    pub fn classify(&mut self, size: usize) -> CacheResult<u8> {
        self.classes.classify(size).ok_or(CacheError::TooLarge)
    }

    /// Whether `size` bytes (header included) fit in some class.
    #[inline]
    pub fn size_ok(&self, size: usize) -> bool {
        size <= self.classes.largest()
    }

    /// Obtain a buffer for `class_id`.
    ///
    /// Pooled buffers are reused first. A fresh buffer is only carved while
    /// the ceiling allows it; otherwise `OutOfMemory`.
    pub fn allocate(&mut self, class_id: u8) -> CacheResult<Box<[u8]>> {
        if let Some(buf) = self.free[class_id as usize].pop() {
            return Ok(buf);
        }

        let size = self.classes.size_of(class_id);
        if self.memory_used + size > self.memory_limit {
            warn!(
                class_id,
                size,
                memory_used = self.memory_used,
                memory_limit = self.memory_limit,
                "allocation refused at memory ceiling"
            );
            return Err(CacheError::OutOfMemory);
        }

        self.memory_used += size;
        Ok(vec![0u8; size - ITEM_HEADER_SIZE].into_boxed_slice())
    }

    /// Return an item's buffer.
    ///
    /// The item must be unlinked and unreferenced. The buffer is pooled if
    /// its class free list has room, otherwise it is dropped and its bytes
    /// are credited back.
    pub fn release(&mut self, item: Item) {
        debug_assert_eq!(item.ref_count(), 0, "released item still referenced");
        debug_assert!(!item.is_linked(), "released item still linked");

        let class_id = item.class_id();
        let buf = item.into_buffer();
        let list = &mut self.free[class_id as usize];
        if list.len() < self.classes.free_cap(class_id) {
            list.push(buf);
        } else {
            self.memory_used -= self.classes.size_of(class_id);
        }
    }

    /// Bytes held by live and pooled buffers.
    #[inline]
    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    /// The memory ceiling.
    #[inline]
    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    /// Number of pooled buffers in a class.
    pub fn free_count(&self, class_id: u8) -> usize {
        self.free.get(class_id as usize).map_or(0, Vec::len)
    }

    /// Bytes held by pooled buffers across all classes.
    pub fn pooled_bytes(&self) -> usize {
        self.free
            .iter()
            .enumerate()
            .map(|(id, list)| list.len() * self.classes.size_of(id as u8))
            .sum()
    }

    /// Statistics for a class.
    pub fn class_stats(&self, class_id: u8) -> Option<ClassStats> {
        if class_id == 0 || class_id > self.classes.max_class_id() {
            return None;
        }
        Some(ClassStats {
            class_id,
            slot_size: self.classes.size_of(class_id),
            free_count: self.free_count(class_id),
            free_cap: self.classes.free_cap(class_id),
        })
    }
}

/// Statistics for a size class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassStats {
    /// Class ID.
    pub class_id: u8,
    /// Slot size in bytes, header included.
    pub slot_size: usize,
    /// Pooled buffers.
    pub free_count: usize,
    /// Free list cap.
    pub free_cap: usize,
}
