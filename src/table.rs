//! One bucket array. Buckets hold the head of an intrusive chain of arena
//! keys; the entries themselves live in the dictionary's slot arena.

use slotmap::DefaultKey;

/// Smallest allocated table size. Allocated sizes are always powers of
/// two so a bucket index is `hash & mask()`.
pub(crate) const INITIAL_SIZE: usize = 4;

#[derive(Debug, Default)]
pub(crate) struct Table {
    pub(crate) buckets: Vec<Option<DefaultKey>>,
    pub(crate) used: usize,
}

impl Table {
    pub(crate) fn with_buckets(size: usize) -> Self {
        debug_assert!(size.is_power_of_two() && size >= INITIAL_SIZE);
        Table {
            buckets: vec![None; size],
            used: 0,
        }
    }

    /// Round a size hint up to an allocatable table size.
    pub(crate) fn next_size(hint: usize) -> usize {
        hint.next_power_of_two().max(INITIAL_SIZE)
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn is_allocated(&self) -> bool {
        !self.buckets.is_empty()
    }

    pub(crate) fn mask(&self) -> usize {
        debug_assert!(self.is_allocated());
        self.buckets.len() - 1
    }
}
