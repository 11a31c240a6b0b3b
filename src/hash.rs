//! Hash function suite: integer mixes, seeded Murmur2 over bytes, a
//! case-insensitive byte hash, and a `BuildHasher` adapter so the suite
//! can drive the dictionary's generic hashing capability.

use core::hash::{BuildHasher, Hasher};
use core::sync::atomic::{AtomicU32, Ordering};

// Statics must be Sync even though the containers built on this suite are
// single-threaded, so the seed lives in a relaxed atomic.
static HASH_SEED: AtomicU32 = AtomicU32::new(5381);

/// Set the process-wide byte-hash seed. Affects hashers built afterwards;
/// a `Murmur2State` captures the seed at construction and keeps it.
pub fn set_hash_seed(seed: u32) {
    HASH_SEED.store(seed, Ordering::Relaxed);
}

/// The current process-wide byte-hash seed.
pub fn hash_seed() -> u32 {
    HASH_SEED.load(Ordering::Relaxed)
}

/// Thomas Wang's 32-bit integer mix.
pub fn int_hash_32(mut key: u32) -> u32 {
    key = key.wrapping_add(!(key << 15));
    key ^= key >> 10;
    key = key.wrapping_add(key << 3);
    key ^= key >> 6;
    key = key.wrapping_add(!(key << 11));
    key ^= key >> 16;
    key
}

/// Thomas Wang's 64-bit integer mix. Also the mixing step of the
/// structural fingerprint used by unchecked iterators.
pub fn int_hash_64(mut key: u64) -> u64 {
    key = (!key).wrapping_add(key << 21);
    key ^= key >> 24;
    key = key.wrapping_add(key << 3).wrapping_add(key << 8);
    key ^= key >> 14;
    key = key.wrapping_add(key << 2).wrapping_add(key << 4);
    key ^= key >> 28;
    key = key.wrapping_add(key << 31);
    key
}

/// MurmurHash2 over `data` with an explicit seed.
///
/// Little-endian 4-byte loads; the result therefore differs between
/// endiannesses, which is fine for in-memory tables and wrong for anything
/// persisted.
pub fn bytes_hash_seeded(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h: u32 = seed ^ (data.len() as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// MurmurHash2 over `data` with the process-wide seed.
pub fn bytes_hash(data: &[u8]) -> u32 {
    bytes_hash_seeded(data, hash_seed())
}

/// Case-insensitive byte hash (djb2 over ASCII-lowered bytes) with an
/// explicit seed.
pub fn case_bytes_hash_seeded(data: &[u8], seed: u32) -> u32 {
    let mut hash = seed;
    for &b in data {
        hash = hash
            .wrapping_mul(33)
            .wrapping_add(b.to_ascii_lowercase() as u32);
    }
    hash
}

/// Case-insensitive byte hash with the process-wide seed.
pub fn case_bytes_hash(data: &[u8]) -> u32 {
    case_bytes_hash_seeded(data, hash_seed())
}

/// `BuildHasher` over the Murmur2 byte hash. The seed is captured at
/// construction so a dictionary stays self-consistent even if the
/// process-wide seed is changed later.
#[derive(Clone, Debug)]
pub struct Murmur2State {
    seed: u32,
}

impl Murmur2State {
    pub fn new() -> Self {
        Self { seed: hash_seed() }
    }

    pub fn with_seed(seed: u32) -> Self {
        Self { seed }
    }
}

impl Default for Murmur2State {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildHasher for Murmur2State {
    type Hasher = Murmur2Hasher;

    fn build_hasher(&self) -> Murmur2Hasher {
        Murmur2Hasher {
            seed: self.seed,
            buf: Vec::new(),
        }
    }
}

/// Murmur2 needs the full input and its length up front, so writes are
/// buffered and the mix runs in `finish`.
pub struct Murmur2Hasher {
    seed: u32,
    buf: Vec<u8>,
}

impl Hasher for Murmur2Hasher {
    fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn finish(&self) -> u64 {
        bytes_hash_seeded(&self.buf, self.seed) as u64
    }
}
