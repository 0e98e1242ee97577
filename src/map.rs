//! The embeddable disk-backed key-value map.
//!
//! A [`Map`] is a fixed number of independent *shards*, each owning its own
//! [`IndexStore`] and [`SegmentedBuffer`]. A key is routed to exactly one
//! shard by its hash, so concurrent operations on different shards never
//! contend on the same lock — the same trade-off
//! [`crate::hashing`]'s doc comment traces back to `ShardedIndex` in this
//! lineage's vector storage, generalized here from an in-memory `FxHashMap`
//! per shard to a full mmap-backed index + data buffer per shard.
//!
//! Operations that must see every key (`keys`, `entries`, `size`, `clear`,
//! `compact`, `force`) acquire every shard's lock, always in ascending shard
//! order, and release in descending order — the same fixed-order convention
//! that prevents deadlock wherever this codebase takes more than one lock at
//! a time.

use crate::buffer::SegmentedBuffer;
use crate::error::{Error, Result};
use crate::hashing::hash_key;
use crate::index_store::IndexStore;
use crate::options::MapOptions;
use parking_lot::Mutex;
use std::path::PathBuf;
use tracing::info;

struct Shard {
    index: IndexStore,
    data: SegmentedBuffer,
    data_path: Option<PathBuf>,
    is_persistent: bool,
    max_region_size: u64,
}

impl Shard {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some((offset, length)) = self.index.get(key)? else {
            return Ok(None);
        };
        let mut value = vec![0u8; length as usize];
        self.data.read_at(offset, &mut value)?;
        Ok(Some(value))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let needed = value.len() as u64;
        if self.data.position() + needed > self.data.capacity() {
            self.grow_data(needed)?;
        }
        let offset = self.data.put(value)?;
        let length =
            u32::try_from(value.len()).map_err(|_| Error::Misuse("value exceeds 4 GiB".into()))?;
        self.index.put(key, offset, length)
    }

    fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some((offset, length)) = self.index.remove(key)? else {
            return Ok(None);
        };
        let mut value = vec![0u8; length as usize];
        self.data.read_at(offset, &mut value)?;
        Ok(Some(value))
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.index.get(key)?.is_some())
    }

    fn contains_value(&self, value: &[u8]) -> Result<bool> {
        for (_, offset, length) in self.index.entries()? {
            if length as usize != value.len() {
                continue;
            }
            let mut stored = vec![0u8; length as usize];
            self.data.read_at(offset, &mut stored)?;
            if stored == value {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for (key, offset, length) in self.index.entries()? {
            let mut value = vec![0u8; length as usize];
            self.data.read_at(offset, &mut value)?;
            out.push((key, value));
        }
        Ok(out)
    }

    /// Grows the data buffer to make room for at least `additional` more
    /// bytes.
    ///
    /// A persistent shard's data file is simply extended in place: every
    /// existing offset stays valid, so no value moves and the index is
    /// untouched. An ephemeral shard has no path to reopen by name, so
    /// growing it means relocating every live value into a fresh, larger
    /// anonymous buffer and rewriting the index to the new offsets.
    fn grow_data(&mut self, additional: u64) -> Result<()> {
        let new_size = (self.data.capacity() + additional).max(self.data.capacity() * 2);
        info!(
            old_capacity = self.data.capacity(),
            new_size, "growing shard data buffer"
        );

        if self.is_persistent {
            let position = self.data.position();
            let mut new_data = SegmentedBuffer::open(
                self.data_path.as_deref(),
                new_size,
                true,
                self.max_region_size,
            )?;
            new_data.set_position(position);
            self.data = new_data;
            return Ok(());
        }

        let live = self.index.entries()?;
        let mut new_data = SegmentedBuffer::open(None, new_size, false, self.max_region_size)?;
        new_data.set_position(0);

        let mut relocated = Vec::with_capacity(live.len());
        for (key, old_offset, length) in &live {
            let mut value = vec![0u8; *length as usize];
            self.data.read_at(*old_offset, &mut value)?;
            let new_offset = new_data.put(&value)?;
            relocated.push((key.clone(), new_offset, *length));
        }

        // Same keys, only their offsets changed — overwriting in place
        // leaves the index's own capacity/load-factor state untouched.
        for (key, offset, length) in relocated {
            self.index.put(&key, offset, length)?;
        }
        self.data = new_data;
        Ok(())
    }

    fn force(&self) -> Result<()> {
        self.data.force()?;
        self.index.force()
    }

    /// Rewrites the data buffer to contain only live values, reclaiming
    /// space from removed keys and stale grow regions.
    ///
    /// A persistent shard is compacted into a sibling `.tmp` file, which is
    /// renamed over the original only once the copy is complete — the old
    /// mapping is never written through while still being read from. An
    /// ephemeral shard has no named file to swap, so it relocates into a
    /// fresh anonymous buffer instead.
    fn compact(&mut self) -> Result<()> {
        let live = self.index.entries()?;
        let file_size: u64 = live.iter().map(|(_, _, len)| u64::from(*len)).sum();

        if self.is_persistent {
            let path = self
                .data_path
                .as_ref()
                .expect("persistent shard always has a data path");
            let temp_path = path.with_extension("tmp");

            let mut temp_data =
                SegmentedBuffer::open(Some(&temp_path), file_size, true, self.max_region_size)?;
            temp_data.set_position(0);

            let mut relocated = Vec::with_capacity(live.len());
            for (key, old_offset, length) in &live {
                let mut value = vec![0u8; *length as usize];
                self.data.read_at(*old_offset, &mut value)?;
                let new_offset = temp_data.put(&value)?;
                relocated.push((key.clone(), new_offset, *length));
            }
            temp_data.force()?;
            drop(temp_data);

            std::fs::rename(&temp_path, path)?;
            let mut new_data =
                SegmentedBuffer::open(Some(path), file_size, true, self.max_region_size)?;
            new_data.set_position(file_size);

            for (key, offset, length) in &relocated {
                self.index.put(key, *offset, *length)?;
            }
            self.data = new_data;
            return self.index.compact();
        }

        let mut new_data = SegmentedBuffer::open(None, file_size, false, self.max_region_size)?;
        new_data.set_position(0);

        let mut relocated = Vec::with_capacity(live.len());
        for (key, old_offset, length) in &live {
            let mut value = vec![0u8; *length as usize];
            self.data.read_at(*old_offset, &mut value)?;
            let new_offset = new_data.put(&value)?;
            relocated.push((key.clone(), new_offset, *length));
        }

        for (key, offset, length) in &relocated {
            self.index.put(key, *offset, *length)?;
        }
        self.data = new_data;
        self.index.compact()
    }

    fn clear(&mut self) -> Result<()> {
        self.index.clear()?;
        self.data.set_position(0);
        Ok(())
    }
}

/// An embeddable, disk-backed key-value map with an in-memory map API and
/// optional durability.
///
/// Keys and values are opaque byte strings; see [`crate::codec::Codec`] for
/// bridging typed values at the application layer.
pub struct Map {
    shards: Vec<Mutex<Shard>>,
}

impl Map {
    /// Opens or creates a map according to `options`, restoring any
    /// existing persistent shards from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `options` fails validation, or
    /// [`Error::Io`] / [`Error::Corrupt`] if shard files cannot be opened or
    /// fail to parse.
    pub fn open(options: MapOptions) -> Result<Self> {
        options.validate()?;
        info!(
            name = %options.name,
            persistent = options.is_persistent,
            shards = options.concurrency_factor,
            "opening map"
        );

        let mut shards = Vec::with_capacity(options.concurrency_factor);
        for i in 0..options.concurrency_factor {
            let (data_path, index_path) = if options.is_persistent {
                let dir = options.data_path.as_ref().expect("validated above");
                // Shard 0's suffix is omitted: map-<name>.hdg / idx-<name>.hdg.
                let suffix = if i == 0 { String::new() } else { format!("-{i}") };
                (
                    Some(dir.join(format!("map-{}{suffix}.hdg", options.name))),
                    Some(dir.join(format!("idx-{}{suffix}.hdg", options.name))),
                )
            } else {
                (None, None)
            };

            let index = IndexStore::open(
                index_path.as_deref(),
                1024,
                options.initial_file_size,
                options.is_persistent,
            )?;
            let mut data = SegmentedBuffer::open(
                data_path.as_deref(),
                options.initial_file_size,
                options.is_persistent,
                options.max_region_size,
            )?;

            // A restored non-empty index store points into live data that
            // already occupies the buffer; resume appending past it rather
            // than from 0, or the next `put` would overwrite live bytes.
            if index.len() > 0 {
                let max_entry = index
                    .entries()?
                    .into_iter()
                    .max_by_key(|(_, offset, _)| *offset);
                if let Some((_, offset, length)) = max_entry {
                    data.set_position(offset + u64::from(length));
                }
            }

            shards.push(Mutex::new(Shard {
                index,
                data,
                data_path,
                is_persistent: options.is_persistent,
                max_region_size: options.max_region_size,
            }));
        }

        Ok(Self { shards })
    }

    fn shard_for(&self, key: &[u8]) -> &Mutex<Shard> {
        let idx = (hash_key(key) % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    /// Locks every shard in ascending index order and runs `f` with the
    /// resulting guards, unlocking in descending order as the `Vec` of
    /// guards is dropped.
    fn with_all_shards<T>(&self, f: impl FnOnce(&mut [parking_lot::MutexGuard<'_, Shard>]) -> T) -> T {
        let mut guards: Vec<_> = self.shards.iter().map(Mutex::lock).collect();
        f(&mut guards)
    }

    /// Inserts `value` under `key`, overwriting any prior value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexFull`], [`Error::Io`], or [`Error::Misuse`] if
    /// `value` exceeds 4 GiB.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.shard_for(key).lock().put(key, value)
    }

    /// Returns `key`'s value, if present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] or [`Error::Corrupt`].
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.shard_for(key).lock().get(key)
    }

    /// Removes `key`, returning its prior value if present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] or [`Error::Corrupt`].
    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.shard_for(key).lock().remove(key)
    }

    /// True if `key` is present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] or [`Error::Corrupt`].
    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        self.shard_for(key).lock().contains_key(key)
    }

    /// True if any key currently maps to `value`. Necessarily a full scan —
    /// there is no secondary index on values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] or [`Error::Corrupt`].
    pub fn contains_value(&self, value: &[u8]) -> Result<bool> {
        for shard in &self.shards {
            if shard.lock().contains_value(value)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns every live key, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] or [`Error::Corrupt`].
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            for (key, _) in shard.lock().entries()? {
                out.push(key);
            }
        }
        Ok(out)
    }

    /// Returns every live value, in no particular order. May contain
    /// duplicates if multiple keys map to equal values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] or [`Error::Corrupt`].
    pub fn values(&self) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            for (_, value) in shard.lock().entries()? {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// Returns every live `(key, value)` pair, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] or [`Error::Corrupt`].
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.lock().entries()?);
        }
        Ok(out)
    }

    /// Total number of live entries across all shards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] or [`Error::Corrupt`].
    pub fn size(&self) -> Result<usize> {
        let mut total = 0usize;
        for shard in &self.shards {
            total += shard.lock().index.len() as usize;
        }
        Ok(total)
    }

    /// True if the map has no live entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] or [`Error::Corrupt`].
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Removes every entry from every shard. Does not shrink backing files.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`].
    pub fn clear(&self) -> Result<()> {
        info!("clearing map");
        self.with_all_shards(|shards| {
            for shard in shards.iter_mut() {
                shard.clear()?;
            }
            Ok(())
        })
    }

    /// Inserts `value` under `key` only if `key` is not already present.
    /// Returns `true` if the insert happened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexFull`] or [`Error::Io`].
    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut shard = self.shard_for(key).lock();
        if shard.contains_key(key)? {
            return Ok(false);
        }
        shard.put(key, value)?;
        Ok(true)
    }

    /// Replaces `key`'s value only if `key` is already present. Returns
    /// `true` if the replace happened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexFull`] or [`Error::Io`].
    pub fn replace(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut shard = self.shard_for(key).lock();
        if !shard.contains_key(key)? {
            return Ok(false);
        }
        shard.put(key, value)?;
        Ok(true)
    }

    /// Replaces `key`'s value only if its current value equals `expected`.
    /// Returns `true` if the replace happened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexFull`] or [`Error::Io`].
    pub fn replace_if(&self, key: &[u8], expected: &[u8], new_value: &[u8]) -> Result<bool> {
        let mut shard = self.shard_for(key).lock();
        match shard.get(key)? {
            Some(current) if current == expected => {
                shard.put(key, new_value)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Removes `key` only if its current value equals `expected`. Returns
    /// `true` if the removal happened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] or [`Error::Corrupt`].
    pub fn remove_if(&self, key: &[u8], expected: &[u8]) -> Result<bool> {
        let mut shard = self.shard_for(key).lock();
        match shard.get(key)? {
            Some(current) if current == expected => {
                shard.remove(key)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Rewrites every shard's backing files to contain only live entries,
    /// reclaiming space from removed keys and grow-induced stale regions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] or [`Error::Corrupt`].
    pub fn compact(&self) -> Result<()> {
        info!("compacting map");
        self.with_all_shards(|shards| {
            for shard in shards.iter_mut() {
                shard.compact()?;
            }
            Ok(())
        })
    }

    /// Flushes every shard's data and index files to disk. A no-op for
    /// non-persistent maps beyond the `msync` itself, since there is no
    /// durable destination to observe it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`].
    pub fn force(&self) -> Result<()> {
        self.with_all_shards(|shards| {
            for shard in shards.iter() {
                shard.force()?;
            }
            Ok(())
        })
    }
}
