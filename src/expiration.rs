//! Logarithmic expiration wheel.
//!
//! Linked items sit in one of 34 buckets, chosen by their remaining lifetime:
//!
//! ```text
//! Bucket 0..=31: remaining in [2^i, 2^(i+1))   checked every 2^i seconds
//! Bucket 32:     remaining == u32::MAX
//! Bucket 33:     never expires                 never swept
//! ```
//!
//! Each bucket is a doubly-linked list threaded through the items' own
//! [`BucketLink`](crate::item::BucketLink). When a bucket comes due, expired
//! items are reported back to the caller and the rest migrate to the bucket
//! matching their now-shorter remaining time.

use slab::Slab;

use crate::clock::deadline;
use crate::item::{Item, ItemId};

/// Number of buckets.
pub const BUCKET_COUNT: usize = 34;

/// Bucket for items with `expire_time == 0`.
pub const NEVER_BUCKET: u8 = 33;

/// Check interval of a bucket in seconds.
#[inline]
pub fn bucket_interval(bucket: u8) -> u32 {
    if bucket < 32 {
        1 << bucket
    } else {
        u32::MAX
    }
}

/// Bucket for an item expiring at `expire_time`, as seen at `now`.
#[inline]
pub fn bucket_for(now: u32, expire_time: u32) -> u8 {
    if expire_time == 0 {
        return NEVER_BUCKET;
    }
    if expire_time <= now {
        return 0;
    }
    let remaining = expire_time - now;
    if remaining == u32::MAX {
        32
    } else {
        (31 - remaining.leading_zeros()) as u8
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    head: Option<ItemId>,
    tail: Option<ItemId>,
    len: usize,
    next_check: u32,
}

/// The expiration wheel.
#[derive(Debug)]
pub struct ExpirationWheel {
    buckets: [Bucket; BUCKET_COUNT],
}

impl Default for ExpirationWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpirationWheel {
    /// Create an empty wheel; every bucket is due on the first sweep.
    pub fn new() -> Self {
        Self {
            buckets: [Bucket::default(); BUCKET_COUNT],
        }
    }

    /// Total items across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len).sum()
    }

    /// Whether the wheel holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items in one bucket.
    pub fn bucket_len(&self, bucket: u8) -> usize {
        self.buckets[bucket as usize].len
    }

    /// Next time a bucket is due.
    pub fn next_check(&self, bucket: u8) -> u32 {
        self.buckets[bucket as usize].next_check
    }

    /// Append an item to the back of a bucket.
    pub fn push_back(&mut self, items: &mut Slab<Item>, bucket: u8, id: ItemId) {
        debug_assert!(items[id.0].link.bucket.is_none(), "item already in a bucket");
        let b = &mut self.buckets[bucket as usize];
        let link = &mut items[id.0].link;
        link.bucket = Some(bucket);
        link.prev = b.tail;
        link.next = None;
        match b.tail {
            Some(tail) => items[tail.0].link.next = Some(id),
            None => b.head = Some(id),
        }
        b.tail = Some(id);
        b.len += 1;
    }

    /// Prepend an item to the front of a bucket.
    pub fn push_front(&mut self, items: &mut Slab<Item>, bucket: u8, id: ItemId) {
        debug_assert!(items[id.0].link.bucket.is_none(), "item already in a bucket");
        let b = &mut self.buckets[bucket as usize];
        let link = &mut items[id.0].link;
        link.bucket = Some(bucket);
        link.prev = None;
        link.next = b.head;
        match b.head {
            Some(head) => items[head.0].link.prev = Some(id),
            None => b.tail = Some(id),
        }
        b.head = Some(id);
        b.len += 1;
    }

    /// Detach an item from its bucket. Returns the bucket it was in.
    pub fn remove(&mut self, items: &mut Slab<Item>, id: ItemId) -> Option<u8> {
        let link = items[id.0].link;
        let bucket = link.bucket?;
        let b = &mut self.buckets[bucket as usize];

        match link.prev {
            Some(prev) => items[prev.0].link.next = link.next,
            None => b.head = link.next,
        }
        match link.next {
            Some(next) => items[next.0].link.prev = link.prev,
            None => b.tail = link.prev,
        }
        b.len -= 1;

        items[id.0].link = Default::default();
        Some(bucket)
    }

    /// Move an item to the front of `bucket`.
    pub fn relocate(&mut self, items: &mut Slab<Item>, id: ItemId, bucket: u8) {
        self.remove(items, id);
        self.push_front(items, bucket, id);
    }

    /// Items of one bucket, front to back.
    pub fn bucket_items(&self, items: &Slab<Item>, bucket: u8) -> Vec<ItemId> {
        let mut out = Vec::with_capacity(self.buckets[bucket as usize].len);
        let mut cursor = self.buckets[bucket as usize].head;
        while let Some(id) = cursor {
            out.push(id);
            cursor = items[id.0].link.next;
        }
        out
    }

    /// Sweep every bucket that is due at `now`.
    ///
    /// Returns the items whose expiration has passed; they remain in their
    /// bucket for the caller to unlink. Surviving items move to the bucket
    /// matching their remaining lifetime.
    pub fn sweep(&mut self, items: &mut Slab<Item>, now: u32) -> Vec<ItemId> {
        let mut expired = Vec::new();

        for bucket in 0..NEVER_BUCKET {
            let b = &mut self.buckets[bucket as usize];
            if now < b.next_check {
                continue;
            }
            b.next_check = deadline(now, bucket_interval(bucket));

            let mut cursor = b.head;
            while let Some(id) = cursor {
                let item = &items[id.0];
                cursor = item.link.next;

                if item.expire_time != 0 && item.expire_time <= now {
                    expired.push(id);
                    continue;
                }
                let target = bucket_for(now, item.expire_time);
                if target != bucket {
                    self.relocate(items, id, target);
                }
            }
        }

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(items: &mut Slab<Item>, expire_time: u32) -> ItemId {
        let buf = vec![0u8; 16].into_boxed_slice();
        ItemId(items.insert(Item::new(1, buf, 0, 0, b"k", 0, expire_time, 0, 0)))
    }

    #[test]
    fn test_bucket_for() {
        assert_eq!(bucket_for(100, 0), NEVER_BUCKET);
        assert_eq!(bucket_for(100, 100), 0);
        assert_eq!(bucket_for(100, 50), 0);
        assert_eq!(bucket_for(100, 101), 0);
        assert_eq!(bucket_for(100, 102), 1);
        assert_eq!(bucket_for(100, 103), 1);
        assert_eq!(bucket_for(100, 104), 2);
        assert_eq!(bucket_for(100, 100 + 1024), 10);
        assert_eq!(bucket_for(0, u32::MAX), 32);
        assert_eq!(bucket_for(1, u32::MAX), 31);
    }

    #[test]
    fn test_bucket_interval() {
        assert_eq!(bucket_interval(0), 1);
        assert_eq!(bucket_interval(10), 1024);
        assert_eq!(bucket_interval(31), 1 << 31);
        assert_eq!(bucket_interval(32), u32::MAX);
    }

    #[test]
    fn test_push_remove_order() {
        let mut items = Slab::new();
        let mut wheel = ExpirationWheel::new();
        let a = insert(&mut items, 0);
        let b = insert(&mut items, 0);
        let c = insert(&mut items, 0);

        wheel.push_back(&mut items, NEVER_BUCKET, a);
        wheel.push_back(&mut items, NEVER_BUCKET, b);
        wheel.push_front(&mut items, NEVER_BUCKET, c);
        assert_eq!(wheel.bucket_items(&items, NEVER_BUCKET), vec![c, a, b]);
        assert_eq!(wheel.len(), 3);

        assert_eq!(wheel.remove(&mut items, a), Some(NEVER_BUCKET));
        assert_eq!(wheel.bucket_items(&items, NEVER_BUCKET), vec![c, b]);
        assert_eq!(wheel.remove(&mut items, a), None);

        wheel.remove(&mut items, c);
        wheel.remove(&mut items, b);
        assert!(wheel.is_empty());
        assert!(items[b.0].link.bucket.is_none());
    }

    #[test]
    fn test_sweep_expires_and_migrates() {
        let mut items = Slab::new();
        let mut wheel = ExpirationWheel::new();
        let now = 1000;

        let short = insert(&mut items, now + 1);
        let long = insert(&mut items, now + 100);
        let never = insert(&mut items, 0);
        wheel.push_back(&mut items, bucket_for(now, now + 1), short);
        wheel.push_back(&mut items, bucket_for(now, now + 100), long);
        wheel.push_back(&mut items, NEVER_BUCKET, never);

        assert!(wheel.sweep(&mut items, now).is_empty());

        // 64 seconds later the long item has 36 left and belongs in bucket 5
        let expired = wheel.sweep(&mut items, now + 64);
        assert_eq!(expired, vec![short]);
        assert_eq!(items[long.0].link.bucket, Some(5));
        assert_eq!(items[never.0].link.bucket, Some(NEVER_BUCKET));

        // expired items stay in place until the caller removes them
        assert_eq!(items[short.0].link.bucket, Some(0));
    }

    #[test]
    fn test_sweep_respects_next_check() {
        let mut items = Slab::new();
        let mut wheel = ExpirationWheel::new();
        let now = 1000;
        wheel.sweep(&mut items, now);
        assert_eq!(wheel.next_check(0), now + 1);
        assert_eq!(wheel.next_check(4), now + 16);

        // bucket 4 holds remaining in [16, 32); not due at now + 15
        let id = insert(&mut items, now + 20);
        wheel.push_back(&mut items, 4, id);
        items[id.0].expire_time = now + 10;
        assert!(wheel.sweep(&mut items, now + 15).is_empty());
        assert_eq!(wheel.sweep(&mut items, now + 16), vec![id]);
    }
}
