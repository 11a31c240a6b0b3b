//! rehashmap: a single-threaded hash map that resizes incrementally and
//! supports a stateless, resize-tolerant scan cursor.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: serve insert/lookup/delete/sample/scan on a large live table
//!   without ever blocking the owner for a full-table migration.
//! - Layers:
//!   - `Table`: one power-of-two bucket array; each bucket is the head of
//!     an intrusive chain of arena keys.
//!   - `Dict<K, V, S>`: the table pair. Either one table is live, or a
//!     migration is in progress and two are; the distinction is carried in
//!     the `TableState` enum rather than a sentinel index. All entries live
//!     in a single `SlotMap` arena so chain links are generational keys,
//!     never pointers.
//!   - Iteration and scanning: borrow-checked iterators for the common
//!     case; detached safe/unsafe iterators and the reverse-binary-counter
//!     `scan` cursor for callers that must interleave iteration with
//!     mutation.
//!
//! Constraints
//! - Single-threaded: one logical owner drives the map; there is no
//!   internal locking and nothing here is `Send` or `Sync` aware.
//! - Each entry caches its `u64` hash at insert time. Migration re-slots
//!   entries from the cached hash, so `K: Hash` is never invoked after
//!   insertion and rehashing never calls into user code.
//! - While a migration is active, every mutating or probing operation
//!   first moves one bucket across, unless a safe iterator has paused
//!   migration. Work is amortized; no single operation is O(table).
//! - Stable, generational handles: a removed entry's handle can never
//!   alias a later insertion, even if the physical slot is reused.
//!
//! Reentrancy policy
//! - Operations that run user code (`Hash`/`Eq` during probing) or leave
//!   the structure transiently inconsistent are guarded by a debug-only
//!   reentry flag; nested entry panics in debug builds and costs nothing
//!   in release builds.
//!
//! Notes and non-goals
//! - No thread-safety and no persistence of the table itself.
//! - Unsafe iterators detect structural mutation after the fact via a
//!   fingerprint; this is a misuse detector, not synchronization.
//! - Sampling is best-effort: `sample_many` may under-fill and may repeat
//!   entries. Callers that need distinct results deduplicate themselves.

mod dict;
mod dict_proptest;
mod guard;
pub mod hash;
mod iter;
mod scan;
mod table;

// Public surface
pub use dict::{Dict, ExpandError, Handle, InsertError, Upsert};
pub use hash::Murmur2State;
pub use iter::DictIter;
