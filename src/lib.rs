//! # hedgehog
//!
//! An embeddable, disk-backed key-value map with an in-memory map API and
//! optional durability.
//!
//! A [`Map`] behaves like a concurrent hash map — `put`, `get`, `remove`,
//! `keys`, `entries` — but every key and value lives in a memory-mapped
//! file rather than on the heap. Storage can be ephemeral (an anonymous
//! file reclaimed when the map is dropped) or persistent (named files under
//! a caller-supplied directory that survive process restarts).
//!
//! ## Quick start
//!
//! ```no_run
//! use hedgehog::{Map, MapOptions};
//!
//! let map = Map::open(MapOptions::default())?;
//! map.put(b"key", b"value")?;
//! assert_eq!(map.get(b"key")?, Some(b"value".to_vec()));
//! # Ok::<(), hedgehog::Error>(())
//! ```
//!
//! Persisting across restarts just adds a directory and a name:
//!
//! ```no_run
//! use hedgehog::{Map, MapOptions};
//! use std::path::PathBuf;
//!
//! let options = MapOptions {
//!     data_path: Some(PathBuf::from("./data")),
//!     name: "sessions".to_string(),
//!     is_persistent: true,
//!     ..MapOptions::default()
//! };
//! let map = Map::open(options)?;
//! map.put(b"session-1", b"...")?;
//! map.force()?;
//! # Ok::<(), hedgehog::Error>(())
//! ```
//!
//! `Map` operates on raw bytes. Typed values are bridged at the application
//! layer via [`Codec`]; this crate declares the trait but ships no
//! implementations of it.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod buffer;
pub mod codec;
pub mod error;
mod hashing;
mod index_store;
mod map;
pub mod options;

pub use codec::Codec;
pub use error::{Error, Result};
pub use map::Map;
pub use options::MapOptions;
