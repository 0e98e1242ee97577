//! Open-addressed, disk-backed index store.
//!
//! Maps opaque key bytes to `(value_offset, value_length)` pairs describing
//! where the corresponding value blob lives in a data file. The table and
//! the full key records live together in one memory-mapped file:
//!
//! ```text
//! [0 .. 4)                       capacity       (big-endian u32)
//! [4 .. 4 + capacity*4)          slots[i]       (big-endian u32)
//! [4 + capacity*4 .. append)     key records: [u32 len][key][u64 offset][u32 length]
//! ```
//!
//! A slot of `0` is empty; `1` is a tombstone (see [`remove`](IndexStore::remove));
//! any other value is the byte offset of a key record.

use crate::buffer::{SegmentedBuffer, DEFAULT_MAX_REGION_SIZE};
use crate::error::{Error, Result};
use crate::hashing::{hash_key, probe_start};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const SLOT_EMPTY: u32 = 0;
const SLOT_TOMBSTONE: u32 = 1;
const DEFAULT_INITIAL_CAPACITY: u32 = 1024;

/// A key record's fixed-size tail: 8-byte value offset + 4-byte value length.
const RECORD_TAIL_LEN: usize = 12;

/// Long probe chains are harmless but worth a warning — they usually mean
/// the load-factor grow threshold was set too loose for the workload.
const LONG_PROBE_WARN_THRESHOLD: u32 = 64;

fn header_size(capacity: u32) -> u64 {
    4 + u64::from(capacity) * 4
}

fn slot_offset(i: u32) -> u64 {
    4 + u64::from(i) * 4
}

pub struct IndexStore {
    buffer: SegmentedBuffer,
    capacity: u32,
    size: u32,
    path: Option<PathBuf>,
    is_persistent: bool,
    /// The capacity `clear()` resets to; distinct from `capacity`, which
    /// tracks whatever grow/compact have since produced.
    initial_capacity_floor: u32,
}

impl IndexStore {
    /// Opens an existing index file, restoring its live entries and append
    /// cursor, or initializes a fresh one if the capacity header reads as
    /// zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on file failures and [`Error::Corrupt`] if an
    /// existing file's key-record log doesn't parse.
    pub fn open(
        path: Option<&Path>,
        initial_capacity: u32,
        initial_file_size: u64,
        is_persistent: bool,
    ) -> Result<Self> {
        let initial_capacity_floor = initial_capacity.max(DEFAULT_INITIAL_CAPACITY);
        let mut buffer =
            SegmentedBuffer::open(path, initial_file_size, is_persistent, DEFAULT_MAX_REGION_SIZE)?;

        let mut header = [0u8; 4];
        buffer.read_at(0, &mut header)?;
        let header_capacity = u32::from_be_bytes(header);

        if header_capacity == 0 {
            let capacity = initial_capacity_floor;
            let required = header_size(capacity);
            if buffer.capacity() < required {
                buffer =
                    SegmentedBuffer::open(path, required, is_persistent, DEFAULT_MAX_REGION_SIZE)?;
            }
            let mut store = Self {
                buffer,
                capacity,
                size: 0,
                path: path.map(Path::to_path_buf),
                is_persistent,
                initial_capacity_floor,
            };
            store.write_capacity_header()?;
            store.zero_all_slots()?;
            store.buffer.set_position(header_size(capacity));
            Ok(store)
        } else {
            let capacity = header_capacity;
            let (size, max_record) = Self::scan_slots(&buffer, capacity)?;
            let cursor = match max_record {
                Some((offset, len)) => u64::from(offset) + u64::from(len) + 4,
                None => header_size(capacity),
            };
            buffer.set_position(cursor);
            info!(capacity, size, cursor, "restored index store from file");
            Ok(Self {
                buffer,
                capacity,
                size,
                path: path.map(Path::to_path_buf),
                is_persistent,
                initial_capacity_floor,
            })
        }
    }

    /// Initializes a brand-new index store at `path` (or an anonymous file),
    /// discarding whatever was previously there. Used by `grow`/`compact` to
    /// build the temp and target stores, never by callers directly.
    fn init_fresh(
        path: Option<&Path>,
        capacity: u32,
        file_size: u64,
        is_persistent: bool,
    ) -> Result<Self> {
        if is_persistent {
            let p = path
                .ok_or_else(|| Error::Misuse("persistent index store requires a path".into()))?;
            // SegmentedBuffer::open only ever grows a file; truncate here so
            // a shrinking rebuild (compact) actually shrinks on disk.
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(p)?;
        }
        let required = header_size(capacity).max(file_size);
        let mut buffer = SegmentedBuffer::open(path, required, is_persistent, DEFAULT_MAX_REGION_SIZE)?;
        let mut store = Self {
            buffer: {
                buffer.set_position(0);
                buffer
            },
            capacity,
            size: 0,
            path: path.map(Path::to_path_buf),
            is_persistent,
            initial_capacity_floor: capacity,
        };
        store.write_capacity_header()?;
        store.zero_all_slots()?;
        store.buffer.set_position(header_size(capacity));
        Ok(store)
    }

    fn scan_slots(buffer: &SegmentedBuffer, capacity: u32) -> Result<(u32, Option<(u32, u32)>)> {
        let mut size = 0u32;
        let mut max_record: Option<(u32, u32)> = None;
        for i in 0..capacity {
            let mut b = [0u8; 4];
            buffer.read_at(slot_offset(i), &mut b)?;
            let slot = u32::from_be_bytes(b);
            if slot == SLOT_EMPTY || slot == SLOT_TOMBSTONE {
                continue;
            }
            size += 1;
            let mut lb = [0u8; 4];
            buffer.read_at(u64::from(slot), &mut lb)?;
            let len = u32::from_be_bytes(lb);
            let replace = match max_record {
                None => true,
                Some((max_pos, _)) => slot > max_pos,
            };
            if replace {
                max_record = Some((slot, len));
            }
        }
        Ok((size, max_record))
    }

    fn write_capacity_header(&mut self) -> Result<()> {
        self.buffer.write_at(0, &self.capacity.to_be_bytes())
    }

    fn zero_all_slots(&mut self) -> Result<()> {
        let zeros = vec![0u8; self.capacity as usize * 4];
        self.buffer.write_at(4, &zeros)
    }

    fn read_slot(&self, i: u32) -> Result<u32> {
        let mut b = [0u8; 4];
        self.buffer.read_at(slot_offset(i), &mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn write_slot(&mut self, i: u32, value: u32) -> Result<()> {
        self.buffer.write_at(slot_offset(i), &value.to_be_bytes())
    }

    /// Reads the key record at `offset`, returning `(key, value_offset, value_length)`.
    fn read_record(&self, offset: u32) -> Result<(Vec<u8>, u64, u32)> {
        let mut len_bytes = [0u8; 4];
        self.buffer.read_at(u64::from(offset), &mut len_bytes)?;
        let total_len = u32::from_be_bytes(len_bytes) as usize;
        if total_len < RECORD_TAIL_LEN {
            return Err(Error::Corrupt(format!(
                "key record at {offset} has length {total_len}, shorter than the {RECORD_TAIL_LEN}-byte tail"
            )));
        }
        let mut body = vec![0u8; total_len];
        self.buffer.read_at(u64::from(offset) + 4, &mut body)?;
        let key_len = total_len - RECORD_TAIL_LEN;
        let key = body[..key_len].to_vec();
        let value_offset = u64::from_be_bytes(body[key_len..key_len + 8].try_into().unwrap());
        let value_length =
            u32::from_be_bytes(body[key_len + 8..key_len + 12].try_into().unwrap());
        Ok((key, value_offset, value_length))
    }

    /// Probes for `key`, calling `on_slot(slot_index, record_offset)` for
    /// every occupied (non-empty, non-tombstone) slot visited, in probe
    /// order, stopping early if `on_slot` returns `Some`.
    fn probe<T>(
        &self,
        key: &[u8],
        mut on_match: impl FnMut(u32, &[u8], u64, u32) -> Option<T>,
    ) -> Result<Option<(u32, T)>> {
        let start = probe_start(hash_key(key), self.capacity);
        for i in 0..=self.capacity {
            let idx = (start + i) % self.capacity;
            let slot = self.read_slot(idx)?;
            if slot == SLOT_EMPTY {
                if i >= LONG_PROBE_WARN_THRESHOLD {
                    warn!(probes = i, "long probe chain terminated at empty slot");
                }
                return Ok(None);
            }
            if slot == SLOT_TOMBSTONE {
                continue;
            }
            let (rec_key, off, len) = self.read_record(slot)?;
            if let Some(result) = on_match(idx, &rec_key, off, len) {
                return Ok(Some((idx, result)));
            }
        }
        Err(Error::IndexFull)
    }

    /// Looks up `key`, returning its `(value_offset, value_length)` if present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexFull`] if the probe loop exceeds `capacity + 1`
    /// steps without terminating (a correctness bug, not a normal outcome).
    pub fn get(&self, key: &[u8]) -> Result<Option<(u64, u32)>> {
        let found = self.probe(key, |_, rec_key, off, len| {
            (rec_key == key).then_some((off, len))
        })?;
        Ok(found.map(|(_, v)| v))
    }

    /// Inserts or overwrites `key` with a pointer to a value blob of `length`
    /// bytes at `value_offset`. Grows the table first if the load factor or
    /// available space requires it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexFull`] or [`Error::Io`].
    pub fn put(&mut self, key: &[u8], value_offset: u64, value_length: u32) -> Result<()> {
        if u64::from(self.size) * 2 > u64::from(self.capacity) {
            self.grow(self.capacity.saturating_mul(3), self.buffer.capacity())?;
        }

        let record_body_len = key.len() + RECORD_TAIL_LEN;
        let needed = 4 + record_body_len as u64;
        if self.buffer.position() + needed > self.buffer.capacity() {
            let new_file_size = (self.buffer.capacity() + needed).max(self.buffer.capacity() * 3);
            self.grow(self.capacity, new_file_size)?;
        }

        let mut record = Vec::with_capacity(record_body_len);
        record.extend_from_slice(key);
        record.extend_from_slice(&value_offset.to_be_bytes());
        record.extend_from_slice(&value_length.to_be_bytes());

        let write_pos = self.buffer.position();
        self.buffer.write_at(write_pos, &(record.len() as u32).to_be_bytes())?;
        self.buffer.write_at(write_pos + 4, &record)?;
        self.buffer.set_position(write_pos + 4 + record.len() as u64);

        let write_pos_u32 = u32::try_from(write_pos)
            .map_err(|_| Error::Misuse("index file exceeds 4 GiB".into()))?;

        let start = probe_start(hash_key(key), self.capacity);
        for i in 0..=self.capacity {
            let idx = (start + i) % self.capacity;
            let slot = self.read_slot(idx)?;
            if slot == SLOT_EMPTY || slot == SLOT_TOMBSTONE {
                self.write_slot(idx, write_pos_u32)?;
                self.size += 1;
                return Ok(());
            }
            let (rec_key, _, _) = self.read_record(slot)?;
            if rec_key == key {
                self.write_slot(idx, write_pos_u32)?;
                return Ok(());
            }
        }
        Err(Error::IndexFull)
    }

    /// Marks `key`'s slot with a tombstone rather than clearing it to zero,
    /// so unrelated keys later in the same probe chain remain findable. See
    /// the REDESIGN FLAG discussion in the design notes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexFull`] or [`Error::Io`].
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<(u64, u32)>> {
        let found = self.probe(key, |_, rec_key, off, len| {
            (rec_key == key).then_some((off, len))
        })?;
        match found {
            Some((idx, value)) => {
                self.write_slot(idx, SLOT_TOMBSTONE)?;
                self.size -= 1;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Iterates all live entries in slot order (not insertion order).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] if a key record fails to parse.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, u64, u32)>> {
        let mut out = Vec::with_capacity(self.size as usize);
        for i in 0..self.capacity {
            let slot = self.read_slot(i)?;
            if slot == SLOT_EMPTY || slot == SLOT_TOMBSTONE {
                continue;
            }
            let (key, off, len) = self.read_record(slot)?;
            out.push((key, off, len));
        }
        Ok(out)
    }

    /// Resets to the original `initial_capacity` (floored at 1024), zeroing
    /// all slots. Does not shrink the backing file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`].
    pub fn clear(&mut self) -> Result<()> {
        let capacity = self.initial_capacity_floor;
        let required = header_size(capacity);
        if self.buffer.capacity() < required {
            self.buffer =
                SegmentedBuffer::open(self.path.as_deref(), required, self.is_persistent, DEFAULT_MAX_REGION_SIZE)?;
        }
        self.capacity = capacity;
        self.size = 0;
        self.write_capacity_header()?;
        self.zero_all_slots()?;
        self.buffer.set_position(header_size(capacity));
        Ok(())
    }

    /// Rebuilds the store at a new capacity/file size via the copy-twice
    /// pattern: live entries go into a throwaway temp store first, because
    /// the target (when persistent) reuses `self`'s own filename and can't
    /// be mapped at a new size while `self`'s mapping is still the one being
    /// read from.
    fn rebuild(&mut self, new_capacity: u32, new_file_size: u64) -> Result<()> {
        let live = self.entries()?;
        let mut temp = Self::init_fresh(None, new_capacity, new_file_size, false)?;
        for (key, offset, length) in &live {
            temp.put(key, *offset, *length)?;
        }
        let mut target = Self::init_fresh(self.path.as_deref(), new_capacity, new_file_size, self.is_persistent)?;
        for (key, offset, length) in temp.entries()? {
            target.put(&key, offset, length)?;
        }
        *self = target;
        Ok(())
    }

    /// Grows to `new_capacity` slots and at least `new_file_size` bytes,
    /// preserving every live entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] or [`Error::Corrupt`].
    pub fn grow(&mut self, new_capacity: u32, new_file_size: u64) -> Result<()> {
        info!(
            old_capacity = self.capacity,
            new_capacity, new_file_size, "growing index store"
        );
        self.rebuild(new_capacity, new_file_size)
    }

    /// Rebuilds the store sized to exactly (plus load-factor headroom)
    /// accommodate its current live entries, dropping all tombstones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] or [`Error::Corrupt`].
    pub fn compact(&mut self) -> Result<()> {
        let live = self.entries()?;
        let capacity = Self::capacity_for_live_count(live.len());
        let file_size = header_size(capacity)
            + live
                .iter()
                .map(|(k, _, _)| 4 + RECORD_TAIL_LEN as u64 + k.len() as u64)
                .sum::<u64>();
        info!(live = live.len(), capacity, file_size, "compacting index store");
        self.rebuild(capacity, file_size)
    }

    fn capacity_for_live_count(n: usize) -> u32 {
        let doubled = u32::try_from(n.saturating_mul(2)).unwrap_or(u32::MAX);
        doubled.max(DEFAULT_INITIAL_CAPACITY)
    }

    /// Number of live (non-empty, non-tombstone) entries.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.size
    }

    /// True if there are no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Current slot-array capacity.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Flushes the backing file to disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`].
    pub fn force(&self) -> Result<()> {
        self.buffer.force()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let mut store = IndexStore::open(None, 16, 0, false).unwrap();
        store.put(b"key", 100, 5).unwrap();
        assert_eq!(store.get(b"key").unwrap(), Some((100, 5)));
        assert_eq!(store.get(b"missing").unwrap(), None);
    }

    #[test]
    fn put_overwrites_existing_key() {
        let mut store = IndexStore::open(None, 16, 0, false).unwrap();
        store.put(b"key", 100, 5).unwrap();
        store.put(b"key", 200, 9).unwrap();
        assert_eq!(store.get(b"key").unwrap(), Some((200, 9)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_tombstones_without_hiding_later_keys_in_chain() {
        // Force three keys into the same 4-slot table so they necessarily
        // share a probe chain, then remove the first and confirm the others
        // remain reachable.
        let mut store = IndexStore::open(None, 4, 0, false).unwrap();
        for i in 0u32..3 {
            store.put(format!("k{i}").as_bytes(), u64::from(i) * 10, 1).unwrap();
        }
        store.remove(b"k0").unwrap();
        assert_eq!(store.get(b"k0").unwrap(), None);
        assert_eq!(store.get(b"k1").unwrap(), Some((10, 1)));
        assert_eq!(store.get(b"k2").unwrap(), Some((20, 1)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn remove_missing_key_is_a_no_op() {
        let mut store = IndexStore::open(None, 16, 0, false).unwrap();
        assert_eq!(store.remove(b"nope").unwrap(), None);
    }

    #[test]
    fn grows_past_load_factor_threshold() {
        let mut store = IndexStore::open(None, 4, 0, false).unwrap();
        for i in 0u32..100 {
            store.put(format!("key{i}").as_bytes(), u64::from(i), 4).unwrap();
        }
        assert!(store.capacity() > 4);
        for i in 0u32..100 {
            assert_eq!(
                store.get(format!("key{i}").as_bytes()).unwrap(),
                Some((u64::from(i), 4))
            );
        }
    }

    #[test]
    fn entries_yields_every_live_key() {
        let mut store = IndexStore::open(None, 16, 0, false).unwrap();
        store.put(b"a", 1, 1).unwrap();
        store.put(b"b", 2, 2).unwrap();
        store.remove(b"a").unwrap();
        let entries = store.entries().unwrap();
        assert_eq!(entries, vec![(b"b".to_vec(), 2, 2)]);
    }

    #[test]
    fn clear_resets_size_and_capacity_without_shrinking_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.hdg");
        let mut store = IndexStore::open(Some(&path), 16, 0, true).unwrap();
        for i in 0u32..50 {
            store.put(format!("k{i}").as_bytes(), u64::from(i), 1).unwrap();
        }
        store.force().unwrap();
        let size_before_clear = std::fs::metadata(&path).unwrap().len();

        store.clear().unwrap();
        assert_eq!(store.len(), 0);
        assert_eq!(store.capacity(), 1024);
        assert_eq!(store.get(b"k0").unwrap(), None);

        store.force().unwrap();
        let size_after_clear = std::fs::metadata(&path).unwrap().len();
        assert!(size_after_clear >= size_before_clear);
    }

    #[test]
    fn compact_shrinks_capacity_to_fit_live_set() {
        let mut store = IndexStore::open(None, 4, 0, false).unwrap();
        for i in 0u32..200 {
            store.put(format!("k{i}").as_bytes(), u64::from(i), 1).unwrap();
        }
        for i in 0u32..190 {
            store.remove(format!("k{i}").as_bytes()).unwrap();
        }
        let capacity_before = store.capacity();
        store.compact().unwrap();
        assert!(store.capacity() <= capacity_before);
        assert_eq!(store.len(), 10);
        for i in 190u32..200 {
            assert_eq!(
                store.get(format!("k{i}").as_bytes()).unwrap(),
                Some((u64::from(i), 1))
            );
        }
    }

    #[test]
    fn restore_after_reopen_preserves_entries_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.hdg");
        {
            let mut store = IndexStore::open(Some(&path), 16, 0, true).unwrap();
            store.put(b"alpha", 10, 5).unwrap();
            store.put(b"beta", 20, 4).unwrap();
            store.force().unwrap();
        }
        let restored = IndexStore::open(Some(&path), 16, 0, true).unwrap();
        assert_eq!(restored.get(b"alpha").unwrap(), Some((10, 5)));
        assert_eq!(restored.get(b"beta").unwrap(), Some((20, 4)));
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn hash_collision_keys_are_all_retrievable() {
        // Capacity 1 forces every key into the same slot's probe chain.
        let mut store = IndexStore::open(None, 1, 0, false).unwrap();
        store.put(b"one", 1, 1).unwrap();
        store.put(b"two", 2, 2).unwrap();
        store.put(b"three", 3, 3).unwrap();
        assert_eq!(store.get(b"one").unwrap(), Some((1, 1)));
        assert_eq!(store.get(b"two").unwrap(), Some((2, 2)));
        assert_eq!(store.get(b"three").unwrap(), Some((3, 3)));
    }
}
