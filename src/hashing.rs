//! Key hashing for shard routing and index probing.
//!
//! Both the map engine's shard routing and the index store's open-addressing
//! probe sequence must agree on the same hash of the same key bytes, or a
//! key written by one hash would be unfindable by the other. `std`'s default
//! `RandomState` reseeds every process start, which would desynchronize a
//! *persistent* index's on-disk probe chains from the hash that wrote them
//! across a restart. `rustc_hash`'s `FxHash` has no such seed, so it gives
//! identical results across runs for identical bytes.

use rustc_hash::FxHasher;
use std::hash::Hasher;

/// Hashes raw key bytes into a 64-bit value, stable across process restarts.
#[inline]
#[must_use]
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(key);
    hasher.finish()
}

/// Maps a hash to a starting probe index within a table of `capacity` slots.
///
/// Operates entirely in `u64`, so there is no analog of the "abs() of the
/// minimum integer" overflow hazard that signed hash codes invite.
#[inline]
#[must_use]
pub fn probe_start(hash: u64, capacity: u32) -> u32 {
    debug_assert!(capacity > 0, "capacity must be positive");
    (hash % u64::from(capacity)) as u32
}
