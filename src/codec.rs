//! The typed-value interface seam.
//!
//! `Map` itself only ever stores and retrieves raw bytes — it has no notion
//! of a value's logical type. A `Codec` is how a caller bridges a typed
//! value to the bytes `Map` actually persists. This crate declares the
//! trait but deliberately ships no implementations of it: serialization
//! format choices (bincode, JSON, a hand-rolled layout) belong to the
//! application embedding this store, not to the store itself.

/// Converts a value of type `T` to and from the byte representation a
/// [`crate::Map`] stores.
///
/// Implementations are expected to round-trip: `decode(&encode(&v)) == v`
/// for every `v` the application produces. `Map` does not enforce this; a
/// codec that fails to round-trip will simply hand back different values
/// than were stored.
pub trait Codec<T> {
    /// Encodes `value` to its on-disk byte representation.
    fn encode(&self, value: &T) -> Vec<u8>;

    /// Decodes `bytes` back into a value of type `T`.
    ///
    /// Implementations may panic on malformed input; `Map` only ever hands
    /// back bytes that were previously produced by `encode`, from the same
    /// codec, absent on-disk corruption.
    fn decode(&self, bytes: &[u8]) -> T;
}
