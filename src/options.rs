//! Construction-time configuration for [`crate::Map`].
//!
//! Unlike the multi-source (file + env + override) configuration loading
//! elsewhere in this lineage, a `Map` is configured once, programmatically,
//! at construction — there is no `hedgehog.toml` or `HEDGEHOG_*` environment
//! layer to merge, since an embedded store is wired up by the host
//! application rather than deployed standalone. Validation is still its own
//! step, producing [`Error::Config`] before any file I/O is attempted.

use crate::error::{Error, Result};
use std::path::PathBuf;

/// Default number of concurrency shards when unset.
const DEFAULT_CONCURRENCY_FACTOR: usize = 16;

/// Default size new persistent/ephemeral files are created at.
const DEFAULT_INITIAL_FILE_SIZE: u64 = 1024 * 1024;

/// Construction options for a [`crate::Map`].
#[derive(Debug, Clone)]
pub struct MapOptions {
    /// Directory backing persistent storage. Required when `is_persistent`
    /// is `true`; ignored otherwise.
    pub data_path: Option<PathBuf>,

    /// Base name used to derive this map's file names
    /// (`map-<name>-<shard>.hdg`, `idx-<name>-<shard>.hdg`).
    pub name: String,

    /// If `true`, data and index files live under `data_path` and survive
    /// process restarts. If `false`, they are anonymous and reclaimed on
    /// close.
    pub is_persistent: bool,

    /// Number of independent shards, each with its own lock, index store,
    /// and data buffer. Higher values reduce lock contention under
    /// concurrent access at the cost of more open file descriptors/mappings
    /// for persistent maps.
    pub concurrency_factor: usize,

    /// Initial size, in bytes, of each shard's data buffer and index file.
    pub initial_file_size: u64,

    /// Per-region cap passed to the segmented buffer. Overriding this is
    /// mainly useful for tests; production callers should leave it at the
    /// default.
    pub max_region_size: u64,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            data_path: None,
            name: "default".to_string(),
            is_persistent: false,
            concurrency_factor: DEFAULT_CONCURRENCY_FACTOR,
            initial_file_size: DEFAULT_INITIAL_FILE_SIZE,
            max_region_size: crate::buffer::DEFAULT_MAX_REGION_SIZE,
        }
    }
}

impl MapOptions {
    /// Validates this configuration, returning [`Error::Config`] describing
    /// the first problem found.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `concurrency_factor` is zero, `name` is
    /// empty, or `is_persistent` is set without a `data_path`.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_factor == 0 {
            return Err(Error::Config("concurrency_factor must be at least 1".to_string()));
        }
        if self.name.is_empty() {
            return Err(Error::Config("name must not be empty".to_string()));
        }
        if self.is_persistent && self.data_path.is_none() {
            return Err(Error::Config(
                "is_persistent requires a data_path".to_string(),
            ));
        }
        if self.initial_file_size == 0 {
            return Err(Error::Config(
                "initial_file_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
