//! Error types for `hedgehog`.
//!
//! Mirrors the error taxonomy laid out in the design docs: I/O failures and
//! corrupt on-disk data are fatal, a full index table indicates a correctness
//! bug, and misuse/config problems are reported distinctly from I/O so a
//! caller can tell "your program did something invalid" from "the OS said
//! no". `NotFound` is deliberately absent from this enum — it is represented
//! as `Option::None` / `bool` at the call sites that can legitimately miss.

use thiserror::Error;

/// Result type alias for `hedgehog` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in `hedgehog` operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Open/map/flush/delete failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A key record or index header failed to parse as well-formed bytes.
    #[error("corrupt on-disk data: {0}")]
    Corrupt(String),

    /// A probe loop exceeded the table's capacity without finding a slot.
    ///
    /// In practice this is prevented by the 50% load-factor grow rule; seeing
    /// this indicates a bug, not a transient condition worth retrying.
    #[error("index full: unable to locate a free index entry")]
    IndexFull,

    /// A caller passed a position/offset/option combination the engine
    /// cannot satisfy (e.g. a cursor beyond a buffer's capacity).
    #[error("misuse: {0}")]
    Misuse(String),

    /// `MapOptions` failed validation before any I/O was attempted.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True if this error results from the caller's own misuse rather than
    /// an environmental failure (I/O) or a corrupted store.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Misuse(_) | Self::Config(_))
    }
}
