//! Geometric slab size classes.
//!
//! Class sizes start at `ITEM_HEADER_SIZE + item_size_min` and grow by the
//! configured factor, each rounded up to [`CHUNK_ALIGN_BYTES`]. The last class
//! is always exactly `ITEM_HEADER_SIZE + item_size_max`. Class id `0` is
//! reserved as "no class".

use crate::item::ITEM_HEADER_SIZE;

/// Smallest valid class id.
pub const CLASS_ID_MIN: u8 = 1;

/// Largest class id the table may grow to.
pub const CLASS_ID_MAX: u8 = 200;

/// Class sizes are rounded up to this alignment.
pub const CHUNK_ALIGN_BYTES: usize = 8;

/// Upper bound on pooled buffers per class.
pub const FREE_LIST_MAX: usize = 1000;

/// Byte budget used to cap the free list of large classes.
pub const FREE_LIST_BUDGET: usize = 1024 * 1024;

#[inline]
fn align_up(size: usize) -> usize {
    (size + CHUNK_ALIGN_BYTES - 1) & !(CHUNK_ALIGN_BYTES - 1)
}

/// The size class table.
#[derive(Debug, Clone)]
pub struct SlabClasses {
    /// Indexed by class id; `sizes[0]` is unused and zero.
    sizes: Vec<usize>,
    free_caps: Vec<usize>,
    /// Class returned by the previous lookup, used as the scan start.
    hint: u8,
}

impl SlabClasses {
    /// Build the class table.
    ///
    /// `item_size_min`/`item_size_max` are payload sizes (key + data + ext);
    /// the header is added internally.
    pub fn new(item_size_min: usize, item_size_max: usize, factor: f64) -> Self {
        let largest = ITEM_HEADER_SIZE + item_size_max;
        let mut sizes = vec![0];

        let mut size = ITEM_HEADER_SIZE + item_size_min;
        let mut class_id = CLASS_ID_MIN;
        while class_id < CLASS_ID_MAX && size as f64 <= largest as f64 / factor {
            let aligned = align_up(size);
            if aligned >= largest || aligned <= *sizes.last().unwrap_or(&0) {
                break;
            }
            sizes.push(aligned);
            size = (aligned as f64 * factor) as usize;
            class_id += 1;
        }
        sizes.push(largest);

        let free_caps = sizes
            .iter()
            .map(|&size| {
                if size == 0 {
                    0
                } else {
                    FREE_LIST_MAX.min(FREE_LIST_BUDGET / size)
                }
            })
            .collect();

        Self {
            sizes,
            free_caps,
            hint: CLASS_ID_MIN,
        }
    }

    /// Id of the largest class.
    #[inline]
    pub fn max_class_id(&self) -> u8 {
        (self.sizes.len() - 1) as u8
    }

    /// Number of usable classes.
    #[inline]
    pub fn len(&self) -> usize {
        self.sizes.len() - 1
    }

    /// Always false; a table has at least the final class.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total slot size of a class (header included), or 0 for an unknown id.
    #[inline]
    pub fn size_of(&self, class_id: u8) -> usize {
        self.sizes.get(class_id as usize).copied().unwrap_or(0)
    }

    /// Free-list cap of a class.
    #[inline]
    pub fn free_cap(&self, class_id: u8) -> usize {
        self.free_caps.get(class_id as usize).copied().unwrap_or(0)
    }

    /// Largest total item size (header included) any class can hold.
    #[inline]
    pub fn largest(&self) -> usize {
        self.sizes[self.sizes.len() - 1]
    }

    /// Iterate `(class_id, size)` pairs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, usize)> + '_ {
        self.sizes
            .iter()
            .enumerate()
            .skip(CLASS_ID_MIN as usize)
            .map(|(id, &size)| (id as u8, size))
    }

    /// Find the smallest class holding `size` bytes (header included).
    ///
    /// The scan starts at the class of the previous lookup, since consecutive
    /// requests tend to be of similar size.
    pub fn classify(&mut self, size: usize) -> Option<u8> {
        let hint = self.hint as usize;
        let found = if size <= self.sizes[hint] {
            let mut id = hint;
            while id > CLASS_ID_MIN as usize && size <= self.sizes[id - 1] {
                id -= 1;
            }
            Some(id)
        } else {
            (hint + 1..self.sizes.len()).find(|&id| size <= self.sizes[id])
        };

        found.map(|id| {
            self.hint = id as u8;
            id as u8
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_classes() -> SlabClasses {
        SlabClasses::new(48, 1024 * 1024, 1.25)
    }

    #[test]
    fn test_first_and_last_class() {
        let classes = default_classes();
        assert_eq!(classes.size_of(CLASS_ID_MIN), align_up(ITEM_HEADER_SIZE + 48));
        assert_eq!(classes.largest(), ITEM_HEADER_SIZE + 1024 * 1024);
        assert_eq!(classes.size_of(classes.max_class_id()), classes.largest());
        assert_eq!(classes.size_of(0), 0);
    }

    #[test]
    fn test_sizes_strictly_increase_and_align() {
        let classes = default_classes();
        let sizes: Vec<usize> = classes.iter().map(|(_, size)| size).collect();
        for pair in sizes.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        for &size in &sizes[..sizes.len() - 1] {
            assert_eq!(size % CHUNK_ALIGN_BYTES, 0);
        }
    }

    #[test]
    fn test_free_caps() {
        let classes = default_classes();
        assert_eq!(classes.free_cap(CLASS_ID_MIN), FREE_LIST_MAX);
        let last = classes.max_class_id();
        assert_eq!(classes.free_cap(last), FREE_LIST_BUDGET / classes.largest());
        assert_eq!(classes.free_cap(0), 0);
    }

    #[test]
    fn test_classify_smallest_fit() {
        let mut classes = default_classes();
        for (id, size) in classes.clone().iter() {
            assert_eq!(classes.classify(size), Some(id));
            if id > CLASS_ID_MIN {
                let prev = classes.size_of(id - 1);
                assert_eq!(classes.classify(prev + 1), Some(id));
            }
        }
    }

    #[test]
    fn test_classify_is_monotonic_regardless_of_hint() {
        let mut classes = default_classes();
        let largest = classes.largest();

        // Prime the hint high, then ask for small sizes, and vice versa.
        assert_eq!(classes.classify(largest), Some(classes.max_class_id()));
        assert_eq!(classes.classify(1), Some(CLASS_ID_MIN));
        assert_eq!(classes.classify(largest), Some(classes.max_class_id()));

        let mut last = 0;
        for size in (1..largest).step_by(997) {
            let id = classes.classify(size).expect("fits");
            assert!(id >= last);
            assert!(classes.size_of(id) >= size);
            last = id;
        }
    }

    #[test]
    fn test_classify_too_large() {
        let mut classes = default_classes();
        let largest = classes.largest();
        assert_eq!(classes.classify(largest + 1), None);
    }

    #[test]
    fn test_min_equals_max_gives_single_class() {
        let classes = SlabClasses::new(1024, 1024, 1.25);
        assert_eq!(classes.len(), 1);
        assert_eq!(classes.largest(), ITEM_HEADER_SIZE + 1024);
    }
}
