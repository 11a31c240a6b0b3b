//! Core dictionary: the table pair, the incremental rehashing engine, and
//! the mutation/lookup surface.
//!
//! All entries live in one `SlotMap` arena; the two bucket arrays only
//! hold arena keys, so migrating an entry between tables relinks indices
//! and never moves or reallocates the entry itself. Whether a migration is
//! in progress is a type-level fact (`TableState`), not a sentinel index.
//!
//! The debug reentry guard wraps exactly the windows where user code can
//! run against a probe in progress (`Hash`/`Eq` during lookups). Bucket
//! migration works from cached hashes and never calls back into user
//! code, so it runs unguarded.

use core::borrow::Borrow;
use core::cell::Cell;
use core::hash::{BuildHasher, Hash};
use std::time::Instant;

use slotmap::{DefaultKey, SlotMap};

use crate::guard::ReentryFlag;
use crate::hash::{int_hash_64, Murmur2State};
use crate::table::{Table, INITIAL_SIZE};

/// Grow even with resizing disabled once `used / size` exceeds this.
const FORCE_RESIZE_RATIO: usize = 5;

/// Stable, generational reference to one entry. Stays valid until that
/// entry is removed; never aliases a later insertion, even if the
/// physical slot is reused.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Handle(DefaultKey);

impl Handle {
    pub(crate) fn new(k: DefaultKey) -> Self {
        Handle(k)
    }

    pub(crate) fn raw(&self) -> DefaultKey {
        self.0
    }

    pub fn key<'a, K, V, S>(&self, d: &'a Dict<K, V, S>) -> Option<&'a K> {
        d.handle_key(*self)
    }

    pub fn value<'a, K, V, S>(&self, d: &'a Dict<K, V, S>) -> Option<&'a V> {
        d.handle_value(*self)
    }

    pub fn value_mut<'a, K, V, S>(&self, d: &'a mut Dict<K, V, S>) -> Option<&'a mut V> {
        d.handle_value_mut(*self)
    }
}

#[derive(Debug)]
pub(crate) struct Entry<K, V> {
    pub(crate) key: K,
    pub(crate) value: V,
    pub(crate) hash: u64,
    pub(crate) next: Option<DefaultKey>,
}

/// Either one live table, or an old table draining into a new one. The
/// migration cursor is the lowest old-table bucket not yet moved; every
/// bucket below it is empty.
pub(crate) enum TableState {
    Single(Table),
    Migrating {
        old: Table,
        new: Table,
        cursor: usize,
    },
}

impl TableState {
    /// The first (old or only) table, plus the migration target if one
    /// exists.
    pub(crate) fn tables(&self) -> (&Table, Option<&Table>) {
        match self {
            TableState::Single(t) => (t, None),
            TableState::Migrating { old, new, .. } => (old, Some(new)),
        }
    }

    fn tables_mut(&mut self) -> (&mut Table, Option<&mut Table>) {
        match self {
            TableState::Single(t) => (t, None),
            TableState::Migrating { old, new, .. } => (old, Some(new)),
        }
    }

    /// Where new entries go: the migration target while migrating.
    fn insert_table_mut(&mut self) -> &mut Table {
        match self {
            TableState::Single(t) => t,
            TableState::Migrating { new, .. } => new,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertError {
    KeyExists,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExpandError {
    /// A migration is already running, or the requested size cannot hold
    /// the current entries. Retry once the migration has drained.
    Busy,
    /// The request rounds to the size the table already has.
    InvalidSize,
}

/// Outcome of [`Dict::upsert`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Upsert {
    Inserted(Handle),
    Replaced(Handle),
}

/// A chained hash map that resizes in bounded increments.
///
/// Single-threaded: one logical owner drives the map. While a migration
/// is active, every probing or mutating call moves one bucket across, so
/// the cost of a resize is spread over ordinary traffic and no single
/// operation is ever proportional to the table size.
pub struct Dict<K, V, S = Murmur2State> {
    hasher: S,
    pub(crate) slots: SlotMap<DefaultKey, Entry<K, V>>,
    pub(crate) state: TableState,
    /// Open safe iterators. While nonzero, opportunistic rehash steps are
    /// suppressed; explicit `rehash`/`rehash_for` calls are not.
    paused: Cell<usize>,
    resize_enabled: bool,
    reentry: ReentryFlag,
}

impl<K, V> Dict<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_hasher(Murmur2State::default())
    }
}

impl<K, V> Default for Dict<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Dict<K, V, S> {
    /// Create an empty dictionary. No buckets are allocated until the
    /// first insertion.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            hasher,
            slots: SlotMap::with_key(),
            state: TableState::Single(Table::default()),
            paused: Cell::new(0),
            resize_enabled: true,
            reentry: ReentryFlag::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_rehashing(&self) -> bool {
        matches!(self.state, TableState::Migrating { .. })
    }

    /// Bucket count of the first (old or only) table.
    pub fn capacity(&self) -> usize {
        self.state.tables().0.len()
    }

    /// Bucket count of the migration target, while one exists.
    pub fn migration_capacity(&self) -> Option<usize> {
        self.state.tables().1.map(Table::len)
    }

    /// Lowest old-table bucket not yet migrated, while migrating.
    pub fn migration_cursor(&self) -> Option<usize> {
        match &self.state {
            TableState::Single(_) => None,
            TableState::Migrating { cursor, .. } => Some(*cursor),
        }
    }

    /// Allow load-factor-triggered resizing (the default).
    pub fn enable_resize(&mut self) {
        self.resize_enabled = true;
    }

    /// Suppress load-factor-triggered resizing, e.g. while a
    /// copy-on-write snapshot of the process is in flight and touching
    /// bucket memory would duplicate pages. Growth still happens once
    /// `used / size` exceeds the force ratio, to bound chain lengths.
    pub fn disable_resize(&mut self) {
        self.resize_enabled = false;
    }

    pub fn resize_enabled(&self) -> bool {
        self.resize_enabled
    }

    /// Schedule a resize to `size` buckets (rounded up to a power of two,
    /// minimum 4). The very first allocation takes effect immediately;
    /// any later request allocates the target table and starts a
    /// migration.
    pub fn expand(&mut self, size: usize) -> Result<(), ExpandError> {
        let TableState::Single(t) = &mut self.state else {
            return Err(ExpandError::Busy);
        };
        if t.used > size {
            return Err(ExpandError::Busy);
        }
        let real = Table::next_size(size);
        if real == t.len() {
            return Err(ExpandError::InvalidSize);
        }

        let fresh = Table::with_buckets(real);
        if !t.is_allocated() {
            // First allocation ever: nothing to migrate.
            *t = fresh;
            return Ok(());
        }
        let old = core::mem::take(t);
        self.state = TableState::Migrating {
            old,
            new: fresh,
            cursor: 0,
        };
        Ok(())
    }

    /// Shrink (or grow) to the smallest table that holds the current
    /// entries at a load factor near 1.
    pub fn resize_to_fit(&mut self) -> Result<(), ExpandError> {
        if !self.resize_enabled || self.is_rehashing() {
            return Err(ExpandError::Busy);
        }
        let minimal = self.slots.len().max(INITIAL_SIZE);
        self.expand(minimal)
    }

    fn expand_if_needed(&mut self) {
        let (allocated, len, used) = match &self.state {
            TableState::Migrating { .. } => return,
            TableState::Single(t) => (t.is_allocated(), t.len(), t.used),
        };
        if !allocated {
            let _ = self.expand(INITIAL_SIZE);
            return;
        }
        if used >= len && (self.resize_enabled || used / len > FORCE_RESIZE_RATIO) {
            let _ = self.expand(used * 2);
        }
    }

    /// Migrate up to `n` occupied buckets from the old table. Returns
    /// `true` while entries remain to be moved.
    ///
    /// At most `10 * n` empty buckets are skipped per call, so a sparse
    /// old table (after a shrink) cannot make a single call unbounded;
    /// such a call may return `true` without having moved anything.
    pub fn rehash(&mut self, n: usize) -> bool {
        let mut empty_visits = n.saturating_mul(10);
        let TableState::Migrating { old, new, cursor } = &mut self.state else {
            return false;
        };

        let mut budget = n;
        while budget > 0 && old.used != 0 {
            assert!(
                *cursor < old.len(),
                "migration cursor ran past the old table"
            );
            while old.buckets[*cursor].is_none() {
                *cursor += 1;
                empty_visits -= 1;
                if empty_visits == 0 {
                    return true;
                }
            }

            // Move the whole chain; each entry re-slots under the new
            // mask from its cached hash. Chain order is not preserved.
            let mut cur = old.buckets[*cursor].take();
            while let Some(k) = cur {
                let next = self.slots[k].next;
                let idx = (self.slots[k].hash as usize) & new.mask();
                let e = &mut self.slots[k];
                e.next = new.buckets[idx];
                new.buckets[idx] = Some(k);
                old.used -= 1;
                new.used += 1;
                cur = next;
            }
            *cursor += 1;
            budget -= 1;
        }

        if old.used == 0 {
            let done = core::mem::take(new);
            self.state = TableState::Single(done);
            return false;
        }
        true
    }

    /// Run `rehash(100)` in a loop until the migration completes or
    /// roughly `ms` milliseconds have elapsed. Returns the number of
    /// bucket-batch steps performed.
    pub fn rehash_for(&mut self, ms: u64) -> usize {
        let start = Instant::now();
        let mut batches = 0;
        while self.rehash(100) {
            batches += 100;
            if start.elapsed().as_millis() as u64 > ms {
                break;
            }
        }
        batches
    }

    /// One opportunistic migration step, skipped while safe iterators
    /// have the table pinned.
    pub(crate) fn step_inner(&mut self) {
        if self.paused.get() == 0 {
            self.rehash(1);
        }
    }

    pub(crate) fn pause_rehash(&self) {
        self.paused.set(self.paused.get() + 1);
    }

    pub(crate) fn resume_rehash(&self) {
        let n = self.paused.get();
        assert!(n > 0, "resume_rehash without a matching pause");
        self.paused.set(n - 1);
    }

    /// Order-sensitive digest of the structural fields of both tables.
    /// Any insert, delete, or resize changes it.
    pub(crate) fn fingerprint(&self) -> u64 {
        let (t0, t1) = self.state.tables();
        let parts = [
            t0.buckets.as_ptr() as u64,
            t0.len() as u64,
            t0.used as u64,
            t1.map_or(0, |t| t.buckets.as_ptr() as u64),
            t1.map_or(0, |t| t.len() as u64),
            t1.map_or(0, |t| t.used as u64),
        ];
        let mut h = 0u64;
        for p in parts {
            h = int_hash_64(h.wrapping_add(p));
        }
        h
    }

    /// Walk the bucket that must chain arena key `k` (by its cached
    /// hash) and return `(table, bucket, predecessor)`.
    fn locate_key(&self, hash: u64, k: DefaultKey) -> (usize, usize, Option<DefaultKey>) {
        let (first, second) = self.state.tables();
        for (ti, t) in core::iter::once(first).chain(second).enumerate() {
            if !t.is_allocated() {
                continue;
            }
            let idx = (hash as usize) & t.mask();
            let mut prev: Option<DefaultKey> = None;
            let mut cur = t.buckets[idx];
            while let Some(c) = cur {
                if c == k {
                    return (ti, idx, prev);
                }
                prev = Some(c);
                cur = self.slots[c].next;
            }
        }
        unreachable!("live arena entry not linked in any bucket");
    }

    fn unlink(&mut self, ti: usize, idx: usize, prev: Option<DefaultKey>, k: DefaultKey) -> (K, V) {
        let next = self.slots[k].next;
        let (first, second) = self.state.tables_mut();
        let t = if ti == 0 {
            first
        } else {
            second.expect("second table gone before unlink")
        };
        match prev {
            Some(p) => self.slots[p].next = next,
            None => t.buckets[idx] = next,
        }
        t.used -= 1;
        let e = self.slots.remove(k).unwrap();
        (e.key, e.value)
    }

    /// Remove the entry behind `handle`, unlinking it from whichever
    /// table currently chains it. Returns the owned pair, or `None` for
    /// a stale handle.
    pub fn remove_at(&mut self, handle: Handle) -> Option<(K, V)> {
        let k = handle.raw();
        let hash = self.slots.get(k)?.hash;
        let (ti, idx, prev) = self.locate_key(hash, k);
        Some(self.unlink(ti, idx, prev, k))
    }

    /// Release every entry and return to the unallocated state. The
    /// pause count is reset; detached iterators over the old contents
    /// must not be driven afterwards.
    pub fn clear(&mut self) {
        self.clear_with(|| {});
    }

    /// Like [`Dict::clear`], invoking `progress` once per 65 536 buckets
    /// visited so a very large clear can yield control between batches.
    pub fn clear_with<F: FnMut()>(&mut self, mut progress: F) {
        let _g = self.reentry.enter();
        let state = core::mem::replace(&mut self.state, TableState::Single(Table::default()));
        match state {
            TableState::Single(t) => Self::drain_table(&mut self.slots, t, &mut progress),
            TableState::Migrating { old, new, .. } => {
                Self::drain_table(&mut self.slots, old, &mut progress);
                Self::drain_table(&mut self.slots, new, &mut progress);
            }
        }
        debug_assert!(self.slots.is_empty());
        self.paused.set(0);
    }

    fn drain_table<F: FnMut()>(
        slots: &mut SlotMap<DefaultKey, Entry<K, V>>,
        t: Table,
        progress: &mut F,
    ) {
        let mut remaining = t.used;
        for (i, head) in t.buckets.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if i & 65535 == 0 {
                progress();
            }
            let mut cur = *head;
            while let Some(k) = cur {
                cur = slots[k].next;
                slots.remove(k);
                remaining -= 1;
            }
        }
    }

    /// Human-readable table diagnostics: sizes, load, and the chain
    /// length distribution of each live table.
    pub fn stats(&self) -> String {
        let mut out = String::new();
        let (first, second) = self.state.tables();
        self.table_stats(&mut out, first, 0);
        if let Some(t1) = second {
            self.table_stats(&mut out, t1, 1);
        }
        out
    }

    fn table_stats(&self, out: &mut String, t: &Table, id: usize) {
        use core::fmt::Write;

        let label = if id == 0 {
            "main hash table"
        } else {
            "rehashing target"
        };
        if t.used == 0 {
            let _ = writeln!(out, "Hash table {} ({}): empty", id, label);
            return;
        }

        const HISTOGRAM_BINS: usize = 50;
        let mut histogram = [0usize; HISTOGRAM_BINS];
        let mut occupied = 0usize;
        let mut max_chain = 0usize;
        let mut total_chain = 0usize;
        for head in &t.buckets {
            let mut chain = 0usize;
            let mut cur = *head;
            while let Some(k) = cur {
                chain += 1;
                cur = self.slots[k].next;
            }
            if chain == 0 {
                histogram[0] += 1;
                continue;
            }
            occupied += 1;
            histogram[chain.min(HISTOGRAM_BINS - 1)] += 1;
            max_chain = max_chain.max(chain);
            total_chain += chain;
        }

        let _ = writeln!(out, "Hash table {} stats ({}):", id, label);
        let _ = writeln!(out, " table size: {}", t.len());
        let _ = writeln!(out, " number of elements: {}", t.used);
        let _ = writeln!(out, " different slots: {}", occupied);
        let _ = writeln!(out, " max chain length: {}", max_chain);
        let _ = writeln!(
            out,
            " avg chain length (counted): {:.2}",
            total_chain as f64 / occupied as f64
        );
        let _ = writeln!(
            out,
            " avg chain length (computed): {:.2}",
            t.used as f64 / occupied as f64
        );
        let _ = writeln!(out, " Chain length distribution:");
        for (len, count) in histogram.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "   {}{}: {} ({:.2}%)",
                if len == HISTOGRAM_BINS - 1 { ">= " } else { "" },
                len,
                count,
                (*count as f64 / t.len() as f64) * 100.0
            );
        }
    }

    pub(crate) fn handle_key(&self, h: Handle) -> Option<&K> {
        self.slots.get(h.raw()).map(|e| &e.key)
    }

    pub(crate) fn handle_value(&self, h: Handle) -> Option<&V> {
        self.slots.get(h.raw()).map(|e| &e.value)
    }

    pub(crate) fn handle_value_mut(&mut self, h: Handle) -> Option<&mut V> {
        self.slots.get_mut(h.raw()).map(|e| &mut e.value)
    }

    /// Deep structural check used by the test suites.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let (first, second) = self.state.tables();
        let mut seen = std::collections::HashSet::new();
        let mut total = 0;
        for t in [Some(first), second].into_iter().flatten() {
            if t.is_allocated() {
                assert!(t.len().is_power_of_two() && t.len() >= INITIAL_SIZE);
            }
            let mut used = 0;
            for (i, head) in t.buckets.iter().enumerate() {
                let mut cur = *head;
                while let Some(k) = cur {
                    assert!(seen.insert(k), "entry linked from two buckets");
                    let e = &self.slots[k];
                    assert_eq!((e.hash as usize) & t.mask(), i, "entry in wrong bucket");
                    used += 1;
                    cur = e.next;
                }
            }
            assert_eq!(used, t.used, "per-table used count drifted");
            total += used;
        }
        assert_eq!(total, self.slots.len(), "arena and chains disagree");
        if let TableState::Migrating { old, cursor, .. } = &self.state {
            for i in 0..(*cursor).min(old.len()) {
                assert!(old.buckets[i].is_none(), "bucket below cursor not drained");
            }
        }
    }
}

impl<K, V, S> Dict<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn make_hash<Q>(&self, q: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        self.hasher.hash_one(q)
    }

    /// Walk the chains for `q` in the old table and, while migrating, the
    /// new one. Hashes are compared before keys so `Eq` only runs on
    /// plausible candidates.
    fn probe<Q>(&self, hash: u64, q: &Q) -> Option<DefaultKey>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let (first, second) = self.state.tables();
        for t in core::iter::once(first).chain(second) {
            if !t.is_allocated() {
                continue;
            }
            let idx = (hash as usize) & t.mask();
            let mut cur = t.buckets[idx];
            while let Some(k) = cur {
                let e = &self.slots[k];
                if e.hash == hash && e.key.borrow() == q {
                    return Some(k);
                }
                cur = e.next;
            }
        }
        None
    }

    fn link_new(&mut self, key: K, value: V, hash: u64) -> Handle {
        let target = self.state.insert_table_mut();
        let idx = (hash as usize) & target.mask();
        let k = self.slots.insert(Entry {
            key,
            value,
            hash,
            next: target.buckets[idx],
        });
        target.buckets[idx] = Some(k);
        target.used += 1;
        Handle::new(k)
    }

    /// Insert a new key, rejecting duplicates. The entry goes to the head
    /// of its bucket chain: recently added entries are found fastest.
    pub fn insert(&mut self, key: K, value: V) -> Result<Handle, InsertError> {
        self.insert_with(key, move || value)
    }

    /// Insert with a lazily built value: the slot is reserved first and
    /// `default` runs only if the key was absent. This is the way to
    /// store payloads that are expensive to build or must not be built
    /// on the duplicate path.
    pub fn insert_with<F>(&mut self, key: K, default: F) -> Result<Handle, InsertError>
    where
        F: FnOnce() -> V,
    {
        if self.is_rehashing() {
            self.step_inner();
        }
        self.expand_if_needed();
        let hash = {
            let _g = self.reentry.enter();
            let hash = self.make_hash(&key);
            if self.probe(hash, &key).is_some() {
                return Err(InsertError::KeyExists);
            }
            hash
        };
        Ok(self.link_new(key, default(), hash))
    }

    /// Return the existing entry for `key`, or insert one built by
    /// `default`. The boolean is `true` if an insertion happened.
    pub fn insert_or_get<F>(&mut self, key: K, default: F) -> (Handle, bool)
    where
        F: FnOnce() -> V,
    {
        if self.is_rehashing() {
            self.step_inner();
        }
        self.expand_if_needed();
        let (hash, existing) = {
            let _g = self.reentry.enter();
            let hash = self.make_hash(&key);
            (hash, self.probe(hash, &key))
        };
        if let Some(k) = existing {
            return (Handle::new(k), false);
        }
        (self.link_new(key, default(), hash), true)
    }

    /// Insert or replace. On replace the new value is installed before
    /// the old one is dropped, so a value that transitively references
    /// its predecessor stays alive across the swap.
    pub fn upsert(&mut self, key: K, value: V) -> Upsert {
        if self.is_rehashing() {
            self.step_inner();
        }
        self.expand_if_needed();
        let (hash, existing) = {
            let _g = self.reentry.enter();
            let hash = self.make_hash(&key);
            (hash, self.probe(hash, &key))
        };
        if let Some(k) = existing {
            let old = core::mem::replace(&mut self.slots[k].value, value);
            drop(old);
            return Upsert::Replaced(Handle::new(k));
        }
        Upsert::Inserted(self.link_new(key, value, hash))
    }

    /// Look up `q`, advancing an active migration by one step first.
    pub fn find<Q>(&mut self, q: &Q) -> Option<Handle>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if self.slots.is_empty() {
            return None;
        }
        if self.is_rehashing() {
            self.step_inner();
        }
        let _g = self.reentry.enter();
        let hash = self.make_hash(q);
        self.probe(hash, q).map(Handle::new)
    }

    /// Pure probe that never advances migration; usable through a shared
    /// reference.
    pub fn get<Q>(&self, q: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if self.slots.is_empty() {
            return None;
        }
        let _g = self.reentry.enter();
        let hash = self.make_hash(q);
        self.probe(hash, q).map(|k| &self.slots[k].value)
    }

    /// Mutable lookup; advances an active migration like [`Dict::find`].
    pub fn get_mut<Q>(&mut self, q: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if self.slots.is_empty() {
            return None;
        }
        if self.is_rehashing() {
            self.step_inner();
        }
        let k = {
            let _g = self.reentry.enter();
            let hash = self.make_hash(q);
            self.probe(hash, q)
        }?;
        Some(&mut self.slots[k].value)
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if self.slots.is_empty() {
            return false;
        }
        let _g = self.reentry.enter();
        let hash = self.make_hash(q);
        self.probe(hash, q).is_some()
    }

    /// Unlink and return the entry for `q`. Ownership moves to the
    /// caller, so this doubles as removal without running drop glue.
    pub fn remove<Q>(&mut self, q: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if self.slots.is_empty() {
            return None;
        }
        if self.is_rehashing() {
            self.step_inner();
        }
        let k = {
            let _g = self.reentry.enter();
            let hash = self.make_hash(q);
            self.probe(hash, q)
        }?;
        let hash = self.slots[k].hash;
        let (ti, idx, prev) = self.locate_key(hash, k);
        Some(self.unlink(ti, idx, prev, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::hash::Hasher;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Hasher whose output is the last u64 written, so tests can place
    /// keys in chosen buckets.
    #[derive(Clone, Default)]
    struct IdentityBuildHasher;
    struct IdentityHasher(u64);

    impl BuildHasher for IdentityBuildHasher {
        type Hasher = IdentityHasher;
        fn build_hasher(&self) -> IdentityHasher {
            IdentityHasher(0)
        }
    }

    impl Hasher for IdentityHasher {
        fn write(&mut self, _bytes: &[u8]) {}
        fn write_u64(&mut self, n: u64) {
            self.0 = n;
        }
        fn finish(&self) -> u64 {
            self.0
        }
    }

    /// Insert five entries, look each up, delete one, and confirm the
    /// count and the miss.
    #[test]
    fn insert_find_delete_roundtrip() {
        let mut d: Dict<String, u32> = Dict::new();
        for i in 0..5u32 {
            d.insert(format!("key-{}", i), i * 10).unwrap();
        }
        for i in 0..5u32 {
            assert_eq!(d.get(&format!("key-{}", i)), Some(&(i * 10)));
        }

        let (k, v) = d.remove("key-2").expect("present");
        assert_eq!((k.as_str(), v), ("key-2", 20));
        assert!(d.get("key-2").is_none());
        assert!(d.find(&"key-2".to_string()).is_none());
        assert_eq!(d.len(), 4);
        d.check_invariants();
    }

    /// Filling the initial table to its size triggers a migration on the
    /// next insert; single steps then converge to one doubled table.
    #[test]
    fn growth_starts_and_converges() {
        let mut d: Dict<u64, u64> = Dict::new();
        for i in 0..4 {
            d.insert(i, i).unwrap();
        }
        assert_eq!(d.capacity(), 4);
        assert!(!d.is_rehashing());

        d.insert(4, 4).unwrap();
        assert!(d.is_rehashing());
        assert_eq!(d.migration_capacity(), Some(8));
        // The insert could not step (the migration started within it),
        // so the cursor is still at the first bucket.
        assert_eq!(d.migration_cursor(), Some(0));

        let mut steps = 0;
        while d.rehash(1) {
            steps += 1;
            assert!(steps <= 64, "rehash failed to terminate");
        }
        assert!(!d.is_rehashing());
        assert_eq!(d.capacity(), 8);
        assert_eq!(d.migration_cursor(), None);
        for i in 0..5 {
            assert_eq!(d.get(&i), Some(&i));
        }
        d.check_invariants();
    }

    /// An entry inserted mid-migration lands in the target table and is
    /// findable before, during, and after completion.
    #[test]
    fn insert_during_migration_stays_findable() {
        let mut d: Dict<u64, &str> = Dict::new();
        for i in 0..5 {
            d.insert(i, "old").unwrap();
        }
        assert!(d.is_rehashing());

        d.insert(100, "new").unwrap();
        assert_eq!(d.get(&100), Some(&"new"));
        assert!(d.is_rehashing() || d.capacity() == 8);

        while d.is_rehashing() {
            assert_eq!(d.get(&100), Some(&"new"));
            d.rehash(1);
        }
        assert_eq!(d.get(&100), Some(&"new"));
        assert_eq!(d.len(), 6);
        d.check_invariants();
    }

    /// With resizing disabled, growth waits for the force ratio: no
    /// second table until used/size exceeds 5, then growth despite the
    /// flag.
    #[test]
    fn disabled_resize_defers_to_force_ratio() {
        let mut d: Dict<u64, u64> = Dict::new();
        d.insert(0, 0).unwrap(); // allocates the initial 4 buckets
        d.disable_resize();

        let mut first_migration_at = None;
        for i in 1..40 {
            d.insert(i, i).unwrap();
            if first_migration_at.is_none() && d.is_rehashing() {
                first_migration_at = Some(d.len());
            }
        }
        // used/size > 5 first holds at used == 24 (24 / 4 == 6); the
        // insert that saw 24 entries is the 25th.
        assert_eq!(first_migration_at, Some(25));
        d.check_invariants();

        // Ratio exactly at the threshold must not trigger growth.
        let mut e: Dict<u64, u64> = Dict::new();
        e.insert(0, 0).unwrap();
        e.disable_resize();
        for i in 1..20 {
            e.insert(i, i).unwrap();
        }
        assert_eq!(e.len(), 20); // used/size == 5
        assert!(!e.is_rehashing());
    }

    /// Repeated single steps over a sparse old table terminate within
    /// O(buckets) calls, and a single call skips at most 10 empties.
    #[test]
    fn sparse_rehash_is_bounded_per_call_and_terminates() {
        let mut d: Dict<u64, u64, IdentityBuildHasher> = Dict::with_hasher(IdentityBuildHasher);
        // Park four entries in high buckets of a 1024-bucket table.
        for k in [1000, 1001, 1002, 1003] {
            d.insert(k, k).unwrap();
        }
        d.expand(1024).unwrap();
        while d.rehash(100) {}
        assert_eq!(d.capacity(), 1024);

        // Shrink: the old table is 1024 buckets with 4 occupied near the
        // top.
        d.resize_to_fit().unwrap();
        assert!(d.is_rehashing());
        assert_eq!(d.migration_capacity(), Some(4));

        // First single step hits the empty-visit cap and moves nothing.
        assert!(d.rehash(1));
        assert_eq!(d.migration_cursor(), Some(10));
        assert_eq!(d.len(), 4);

        let mut calls = 1;
        while d.rehash(1) {
            calls += 1;
            assert!(calls <= 2 * 1024, "termination bound exceeded");
        }
        assert_eq!(d.capacity(), 4);
        for k in [1000, 1001, 1002, 1003] {
            assert_eq!(d.get(&k), Some(&k));
        }
        d.check_invariants();
    }

    #[test]
    fn expand_error_cases() {
        let mut d: Dict<u64, u64> = Dict::new();
        for i in 0..5 {
            d.insert(i, i).unwrap();
        }
        assert!(d.is_rehashing());
        assert_eq!(d.expand(64), Err(ExpandError::Busy));

        while d.rehash(100) {}
        assert_eq!(d.expand(8), Err(ExpandError::InvalidSize)); // already 8
        assert_eq!(d.expand(2), Err(ExpandError::Busy)); // cannot hold 5 entries
        assert_eq!(d.expand(64), Ok(()));
        while d.rehash(100) {}
        assert_eq!(d.capacity(), 64);
    }

    #[test]
    fn resize_to_fit_shrinks_and_respects_flag() {
        let mut d: Dict<u64, u64> = Dict::new();
        for i in 0..100 {
            d.insert(i, i).unwrap();
        }
        while d.rehash(100) {}
        let before = d.capacity();
        for i in 10..100 {
            d.remove(&i).unwrap();
        }

        d.disable_resize();
        assert_eq!(d.resize_to_fit(), Err(ExpandError::Busy));
        d.enable_resize();

        d.resize_to_fit().unwrap();
        assert!(d.is_rehashing());
        assert_eq!(d.resize_to_fit(), Err(ExpandError::Busy));
        while d.rehash(100) {}
        assert!(d.capacity() < before);
        assert_eq!(d.capacity(), 16); // 10 live entries
        for i in 0..10 {
            assert_eq!(d.get(&i), Some(&i));
        }
        d.check_invariants();
    }

    #[test]
    fn upsert_inserts_then_replaces() {
        let mut d: Dict<String, u32> = Dict::new();
        let ins = d.upsert("k".to_string(), 1);
        let h = match ins {
            Upsert::Inserted(h) => h,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(h.value(&d), Some(&1));

        match d.upsert("k".to_string(), 2) {
            Upsert::Replaced(h2) => {
                assert_eq!(h2, h, "replace keeps the entry and its handle");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(d.get("k"), Some(&2));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn upsert_drops_old_value_exactly_once() {
        struct Probe(Rc<Cell<u32>>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Rc::new(Cell::new(0));
        let mut d: Dict<&str, Probe> = Dict::new();
        d.upsert("k", Probe(drops.clone()));
        d.upsert("k", Probe(drops.clone()));
        assert_eq!(drops.get(), 1, "old value dropped on replace");
        drop(d);
        assert_eq!(drops.get(), 2, "remaining value dropped with the dict");
    }

    #[test]
    fn insert_with_runs_default_only_on_success() {
        let mut d: Dict<&str, String> = Dict::new();
        let calls = Cell::new(0);

        d.insert_with("k", || {
            calls.set(calls.get() + 1);
            "v".to_string()
        })
        .unwrap();
        assert_eq!(calls.get(), 1);

        let r = d.insert_with("k", || {
            calls.set(calls.get() + 1);
            "v2".to_string()
        });
        assert_eq!(r, Err(InsertError::KeyExists));
        assert_eq!(calls.get(), 1, "default must not run on duplicate");
        assert_eq!(d.get("k"), Some(&"v".to_string()));
    }

    #[test]
    fn insert_or_get_returns_existing_entry() {
        let mut d: Dict<&str, u32> = Dict::new();
        let (h1, inserted) = d.insert_or_get("k", || 1);
        assert!(inserted);
        let (h2, inserted) = d.insert_or_get("k", || 2);
        assert!(!inserted);
        assert_eq!(h1, h2);
        assert_eq!(d.get("k"), Some(&1));
    }

    #[test]
    fn remove_at_unlinks_by_handle_even_mid_migration() {
        let mut d: Dict<u64, u64> = Dict::new();
        for i in 0..5 {
            d.insert(i, i).unwrap();
        }
        assert!(d.is_rehashing());

        let h_old = d.find(&1).unwrap();
        let h_new = d.insert(50, 50).unwrap();
        assert_eq!(d.remove_at(h_old), Some((1, 1)));
        assert_eq!(d.remove_at(h_new), Some((50, 50)));
        assert_eq!(d.remove_at(h_new), None, "stale handle");
        assert_eq!(d.len(), 4);
        d.check_invariants();
    }

    /// A removed entry's handle never resolves again, even after the
    /// physical slot is reused.
    #[test]
    fn stale_handle_does_not_alias_new_entry() {
        let mut d: Dict<String, u32> = Dict::new();
        let h1 = d.insert("old".to_string(), 1).unwrap();
        d.remove("old").unwrap();
        let h2 = d.insert("new".to_string(), 2).unwrap();
        assert_ne!(h1, h2);
        assert!(h1.value(&d).is_none());
        assert_eq!(h2.value(&d), Some(&2));
    }

    #[test]
    fn clear_progress_fires_every_65536_buckets() {
        let mut d: Dict<u64, u64, IdentityBuildHasher> = Dict::with_hasher(IdentityBuildHasher);
        d.insert(70_000, 1).unwrap();
        d.expand(131_072).unwrap();
        while d.rehash(1000) {}
        assert_eq!(d.capacity(), 131_072);

        let mut calls = 0;
        d.clear_with(|| calls += 1);
        // Bucket 70 000 holds the only entry, so the walk covers buckets
        // 0 and 65 536 before draining finishes.
        assert_eq!(calls, 2);
        assert!(d.is_empty());
        assert_eq!(d.capacity(), 0);

        // Clearing an unallocated dict visits nothing.
        let mut calls = 0;
        d.clear_with(|| calls += 1);
        assert_eq!(calls, 0);
    }

    #[test]
    fn clear_resets_migration_state() {
        let mut d: Dict<u64, u64> = Dict::new();
        for i in 0..5 {
            d.insert(i, i).unwrap();
        }
        assert!(d.is_rehashing());
        d.clear();
        assert!(!d.is_rehashing());
        assert_eq!(d.len(), 0);
        d.insert(9, 9).unwrap();
        assert_eq!(d.capacity(), 4);
        d.check_invariants();
    }

    #[test]
    fn stats_reports_both_tables() {
        let mut d: Dict<u64, u64> = Dict::new();
        for i in 0..5 {
            d.insert(i, i).unwrap();
        }
        assert!(d.is_rehashing());
        let s = d.stats();
        assert!(s.contains("Hash table 0 stats (main hash table):"));
        assert!(s.contains("rehashing target"));
        assert!(s.contains("Chain length distribution:"));

        let empty: Dict<u64, u64> = Dict::new();
        assert!(empty.stats().contains("empty"));
    }

    /// Heavy collisions still resolve by key equality.
    #[test]
    fn collision_chains_resolve_by_equality() {
        #[derive(Clone, Default)]
        struct ConstBuildHasher;
        struct ConstHasher;
        impl BuildHasher for ConstBuildHasher {
            type Hasher = ConstHasher;
            fn build_hasher(&self) -> ConstHasher {
                ConstHasher
            }
        }
        impl Hasher for ConstHasher {
            fn write(&mut self, _bytes: &[u8]) {}
            fn finish(&self) -> u64 {
                0
            }
        }

        let mut d: Dict<String, u32, ConstBuildHasher> = Dict::with_hasher(ConstBuildHasher);
        for i in 0..20u32 {
            d.insert(format!("k{}", i), i).unwrap();
        }
        while d.rehash(100) {}
        for i in 0..20u32 {
            assert_eq!(d.get(&format!("k{}", i)), Some(&i));
        }
        assert_eq!(d.remove(&"k7".to_string()), Some(("k7".to_string(), 7)));
        assert!(d.get("k7").is_none());
        assert_eq!(d.len(), 19);
        d.check_invariants();
    }

    /// The arena count and a full chain walk always agree.
    #[test]
    fn used_matches_reachable_entries() {
        let mut d: Dict<u64, u64> = Dict::new();
        for i in 0..100 {
            d.insert(i, i).unwrap();
        }
        for i in (0..100).step_by(3) {
            d.remove(&i).unwrap();
        }
        let mut reachable = 0;
        let (first, second) = d.state.tables();
        for t in [Some(first), second].into_iter().flatten() {
            for head in &t.buckets {
                let mut cur = *head;
                while let Some(k) = cur {
                    reachable += 1;
                    cur = d.slots[k].next;
                }
            }
        }
        assert_eq!(reachable, d.len());
        d.check_invariants();
    }
}
