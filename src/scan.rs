//! Stateless cursor scan and random sampling.
//!
//! `scan` encodes all progress in the returned cursor, so there is no
//! session object and no allocation, and the table may be resized
//! arbitrarily between calls. The cursor's low bits index the smaller of
//! the live tables; instead of incrementing normally, the cursor is
//! bit-reversed, incremented, and reversed back, which counts in
//! most-significant-bit-first order. Buckets split and merge along their
//! high bits when a power-of-two table changes size, so this ordering
//! never skips a bucket that still holds unvisited pre-resize keys. The
//! price is that some keys can be visited more than once.

use rand::Rng;
use slotmap::DefaultKey;

use crate::dict::{Dict, Handle, TableState};
use crate::table::Table;

impl<K, V, S> Dict<K, V, S> {
    /// One scan step: visit every entry of the bucket the cursor points
    /// at (in both tables, while migrating) and return the next cursor.
    ///
    /// Start with `cursor == 0`; the scan is complete when 0 comes back.
    /// Every key present from before the first call until after the last
    /// is visited at least once; keys inserted or removed mid-scan may or
    /// may not be. Duplicate visits are possible after resizes.
    pub fn scan<F>(&self, cursor: usize, mut visit: F) -> usize
    where
        F: FnMut(&K, &V),
    {
        if self.slots.is_empty() {
            return 0;
        }

        let mut v = cursor;
        let (first, second) = self.state.tables();
        let m0;
        match second {
            None => {
                m0 = first.mask();
                self.emit_chain(first.buckets[v & m0], &mut visit);
            }
            Some(second) => {
                // Always walk the smaller table's bucket, then every
                // index in the larger table whose low bits match it.
                let (t0, t1) = if first.len() > second.len() {
                    (second, first)
                } else {
                    (first, second)
                };
                m0 = t0.mask();
                let m1 = t1.mask();

                self.emit_chain(t0.buckets[v & m0], &mut visit);
                loop {
                    self.emit_chain(t1.buckets[v & m1], &mut visit);
                    // Increment the bits above the smaller mask.
                    v = (((v | m0).wrapping_add(1)) & !m0) | (v & m0);
                    if v & (m0 ^ m1) == 0 {
                        break;
                    }
                }
            }
        }

        // Count upward in most-significant-bit-first order over the
        // smaller table's index bits.
        v |= !m0;
        v = v.reverse_bits();
        v = v.wrapping_add(1);
        v = v.reverse_bits();
        v
    }

    fn emit_chain<F>(&self, head: Option<DefaultKey>, visit: &mut F)
    where
        F: FnMut(&K, &V),
    {
        let mut cur = head;
        while let Some(k) = cur {
            let e = &self.slots[k];
            visit(&e.key, &e.value);
            cur = e.next;
        }
    }

    /// One entry picked from a random occupied bucket, then uniformly
    /// within that bucket's chain. Advances an active migration by one
    /// step. Longer chains are slightly favored; good enough for
    /// randomized eviction-style algorithms.
    pub fn sample(&mut self) -> Option<Handle> {
        if self.slots.is_empty() {
            return None;
        }
        if self.is_rehashing() {
            self.step_inner();
        }

        let mut rng = rand::thread_rng();
        let head = match &self.state {
            TableState::Migrating { old, new, cursor } => loop {
                // Buckets below the cursor are already drained, so draw
                // from the still-populated span of both tables.
                let span = old.len() + new.len() - *cursor;
                let h = *cursor + rng.gen_range(0..span);
                let bucket = if h >= old.len() {
                    new.buckets[h - old.len()]
                } else {
                    old.buckets[h]
                };
                if bucket.is_some() {
                    break bucket;
                }
            },
            TableState::Single(t) => loop {
                let h = rng.gen::<usize>() & t.mask();
                if t.buckets[h].is_some() {
                    break t.buckets[h];
                }
            },
        };

        let mut chain_len = 0;
        let mut cur = head;
        while let Some(k) = cur {
            chain_len += 1;
            cur = self.slots[k].next;
        }
        let mut pick = rng.gen_range(0..chain_len);
        let mut k = head.unwrap();
        while pick > 0 {
            k = self.slots[k].next.unwrap();
            pick -= 1;
        }
        Some(Handle::new(k))
    }

    /// Collect up to `count` entries by walking forward from a random
    /// bucket across the live tables. Much faster than calling
    /// [`Dict::sample`] in a loop, at the cost of clumped distribution;
    /// may return fewer than `count` entries and may repeat entries.
    pub fn sample_many(&mut self, count: usize) -> Vec<Handle> {
        let count = count.min(self.slots.len());
        if count == 0 {
            return Vec::new();
        }
        // Chip away at an active migration proportionally to the work
        // requested.
        for _ in 0..count {
            if self.is_rehashing() {
                self.step_inner();
            } else {
                break;
            }
        }
        let mut maxsteps = count.saturating_mul(10);
        let cursor = self.migration_cursor().unwrap_or(0);

        let mut rng = rand::thread_rng();
        let (first, second) = self.state.tables();
        let t1_len = second.map_or(0, Table::len);
        let mut maxmask = first.mask();
        if let Some(t1) = second {
            maxmask = maxmask.max(t1.mask());
        }

        let mut out = Vec::with_capacity(count);
        let mut i = rng.gen::<usize>() & maxmask;
        let mut empty_run = 0usize;
        while out.len() < count && maxsteps > 0 {
            maxsteps -= 1;
            for (j, t) in core::iter::once(first).chain(second).enumerate() {
                // Old-table buckets below the migration cursor are
                // drained; jump the index forward instead of walking
                // them (and clamp it when the new table is the smaller
                // one and the index fell off its end).
                if second.is_some() && j == 0 && i < cursor {
                    if i >= t1_len {
                        i = cursor;
                    }
                    continue;
                }
                if i >= t.len() {
                    continue;
                }
                match t.buckets[i] {
                    None => {
                        empty_run += 1;
                        if empty_run >= 5 && empty_run > count {
                            i = rng.gen::<usize>() & maxmask;
                            empty_run = 0;
                        }
                    }
                    Some(head) => {
                        empty_run = 0;
                        let mut cur = Some(head);
                        while let Some(k) = cur {
                            out.push(Handle::new(k));
                            if out.len() == count {
                                return out;
                            }
                            cur = self.slots[k].next;
                        }
                    }
                }
            }
            i = (i + 1) & maxmask;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn filled(n: u64) -> Dict<u64, u64> {
        let mut d = Dict::new();
        for i in 0..n {
            d.insert(i, i).unwrap();
        }
        d
    }

    fn scan_to_completion(d: &Dict<u64, u64>) -> HashSet<u64> {
        let mut seen = HashSet::new();
        let mut cursor = 0;
        loop {
            cursor = d.scan(cursor, |k, _| {
                seen.insert(*k);
            });
            if cursor == 0 {
                break;
            }
        }
        seen
    }

    #[test]
    fn scan_of_empty_dict_finishes_immediately() {
        let d: Dict<u64, u64> = Dict::new();
        assert_eq!(d.scan(0, |_, _| panic!("nothing to visit")), 0);
        // Any stale cursor also terminates on an empty dict.
        assert_eq!(d.scan(12345, |_, _| panic!("nothing to visit")), 0);
    }

    /// The cursor walks a 4-bucket table in reversed-bit order and wraps
    /// to 0 exactly at the end.
    #[test]
    fn cursor_sequence_is_high_bit_first() {
        let d = filled(3); // single 4-bucket table
        assert!(!d.is_rehashing());
        let mut cursors = Vec::new();
        let mut c = 0;
        loop {
            c = d.scan(c, |_, _| {});
            cursors.push(c);
            if c == 0 {
                break;
            }
        }
        assert_eq!(cursors, vec![2, 1, 3, 0]);
    }

    /// A full scan over a quiescent dictionary visits every key.
    #[test]
    fn full_scan_visits_every_key() {
        let mut d = filled(1000);
        while d.rehash(100) {}
        let seen = scan_to_completion(&d);
        assert_eq!(seen, (0..1000).collect());
    }

    /// Scanning mid-migration visits both tables' entries.
    #[test]
    fn scan_during_migration_covers_both_tables() {
        let d = filled(5); // migration started by the fifth insert
        assert!(d.is_rehashing());
        let seen = scan_to_completion(&d);
        assert_eq!(seen, (0..5).collect());
    }

    /// Keys present for the scan's whole duration are visited even when
    /// the table grows between scan calls.
    #[test]
    fn scan_survives_growth_between_calls() {
        let mut d = filled(64);
        while d.rehash(100) {}

        let mut seen = HashSet::new();
        let mut cursor = 0;
        let mut extra = 1000;
        loop {
            cursor = d.scan(cursor, |k, _| {
                seen.insert(*k);
            });
            if cursor == 0 {
                break;
            }
            // Grow the dictionary under the scan and let the migration
            // advance a little.
            for _ in 0..8 {
                d.insert(extra, extra).unwrap();
                extra += 1;
            }
            d.rehash(2);
        }
        for k in 0..64 {
            assert!(seen.contains(&k), "stable key {} missed by scan", k);
        }
    }

    /// Same guarantee across an explicit shrink.
    #[test]
    fn scan_survives_shrink_between_calls() {
        let mut d = filled(512);
        while d.rehash(100) {}
        for i in 64..512 {
            d.remove(&i).unwrap();
        }

        let mut seen = HashSet::new();
        let mut cursor = 0;
        let mut shrunk = false;
        loop {
            cursor = d.scan(cursor, |k, _| {
                seen.insert(*k);
            });
            if cursor == 0 {
                break;
            }
            if !shrunk {
                d.resize_to_fit().unwrap();
                shrunk = true;
            }
            d.rehash(1);
        }
        for k in 0..64 {
            assert!(seen.contains(&k), "stable key {} missed by scan", k);
        }
    }

    #[test]
    fn sample_returns_a_live_entry() {
        let mut d = filled(32);
        for _ in 0..64 {
            let h = d.sample().expect("nonempty");
            let k = *h.key(&d).expect("handle resolves");
            assert!(k < 32);
        }

        let mut empty: Dict<u64, u64> = Dict::new();
        assert!(empty.sample().is_none());
    }

    #[test]
    fn sample_works_mid_migration() {
        let mut d = filled(5);
        assert!(d.is_rehashing());
        for _ in 0..32 {
            let h = d.sample().expect("nonempty");
            assert!(h.key(&d).is_some());
        }
    }

    #[test]
    fn sample_many_is_bounded_and_live() {
        let mut d = filled(100);
        let got = d.sample_many(10);
        assert!(!got.is_empty());
        assert!(got.len() <= 10);
        for h in &got {
            assert!(h.key(&d).is_some(), "sampled handle must resolve");
        }

        // Requesting more than the population caps at the population.
        let got = d.sample_many(10_000);
        assert!(got.len() <= 100);

        let mut empty: Dict<u64, u64> = Dict::new();
        assert!(empty.sample_many(5).is_empty());
    }
}
