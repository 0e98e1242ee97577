//! Segmented memory-mapped buffer.
//!
//! Presents a single logical, growable byte buffer backed by a file, even
//! though any one `mmap` region is bounded by a platform maximum. A logical
//! file is split into fixed-size *regions* (called regions rather than
//! shards to avoid colliding with the concurrency shards in [`crate::map`]),
//! each mapped independently; reads and writes that straddle a region
//! boundary are transparently split and reassembled.

use crate::error::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::debug;

/// Default per-region cap: `2^31 - 1` bytes, the largest region a platform
/// `mmap` is guaranteed to hand back in one call. Tests override this to
/// exercise the region-splitting logic without allocating gigabytes.
pub const DEFAULT_MAX_REGION_SIZE: u64 = (1u64 << 31) - 1;

/// Floor every mapped file is grown to on first creation.
const MIN_FILE_SIZE: u64 = 1024 * 1024;

/// A byte-addressable cursor over one or more memory-mapped regions of a
/// file.
///
/// Access is not internally synchronized — callers (the map engine's shard
/// lock) are responsible for serializing access to a given buffer.
pub struct SegmentedBuffer {
    regions: Vec<MmapMut>,
    region_size: u64,
    capacity: u64,
    position: u64,
}

impl SegmentedBuffer {
    /// Opens (creating if necessary) a segmented buffer.
    ///
    /// `path` is required when `is_persistent`; when not persistent, an
    /// anonymous file is created and unlinked immediately (`tempfile`'s
    /// `tempfile_in`), so the mapping outlives the file's name but not the
    /// process — the OS reclaims the backing storage once every mapping
    /// referencing it is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened, sized, or mapped,
    /// and [`Error::Misuse`] if `is_persistent` is set without a `path`.
    pub fn open(
        path: Option<&Path>,
        target_size: u64,
        is_persistent: bool,
        max_region_size: u64,
    ) -> Result<Self> {
        let file = Self::open_file(path, is_persistent)?;

        let current_len = file.metadata()?.len();
        let effective_size = target_size.max(MIN_FILE_SIZE).max(current_len);
        if effective_size > current_len {
            file.set_len(effective_size)?;
        }

        let region_count = effective_size.div_ceil(max_region_size).max(1);
        let mut regions = Vec::with_capacity(region_count as usize);
        for i in 0..region_count {
            let offset = i * max_region_size;
            let len = if i == region_count - 1 {
                effective_size - offset
            } else {
                max_region_size
            };
            // SAFETY: `file` has been sized to at least `offset + len` bytes
            // above, so the mapped range is backed by allocated file space.
            let region = unsafe {
                MmapOptions::new()
                    .offset(offset)
                    .len(len as usize)
                    .map_mut(&file)?
            };
            regions.push(region);
        }

        debug!(effective_size, region_count, "opened segmented buffer");

        Ok(Self {
            regions,
            region_size: max_region_size,
            capacity: effective_size,
            position: 0,
        })
    }

    fn open_file(path: Option<&Path>, is_persistent: bool) -> Result<File> {
        if is_persistent {
            let path = path.ok_or_else(|| {
                Error::Misuse("persistent buffer requires a path".to_string())
            })?;
            Ok(OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(path)?)
        } else {
            let dir = path
                .map(Path::to_path_buf)
                .unwrap_or_else(std::env::temp_dir);
            Ok(tempfile::tempfile_in(dir)?)
        }
    }

    /// The logical cursor position.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Sets the logical cursor position. Does not validate against
    /// `capacity` — out-of-range positions become visible the next time a
    /// read or write is attempted at them.
    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    /// The sum of all mapped regions' lengths.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn region_index_and_local(&self, offset: u64) -> (usize, usize) {
        let idx = offset / self.region_size;
        let local = offset % self.region_size;
        (idx as usize, local as usize)
    }

    /// Writes `data` at `offset`, splitting across region boundaries as
    /// needed. Does not move the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Misuse`] if `offset + data.len()` exceeds `capacity`.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| Error::Misuse("write offset overflow".to_string()))?;
        if end > self.capacity {
            return Err(Error::Misuse(format!(
                "write at {offset} of {} bytes exceeds capacity {}; grow first",
                data.len(),
                self.capacity
            )));
        }

        let mut cursor = offset;
        let mut remaining = data;
        while !remaining.is_empty() {
            let (region_idx, local) = self.region_index_and_local(cursor);
            let region = &mut self.regions[region_idx];
            let room = region.len() - local;
            let n = remaining.len().min(room);
            region[local..local + n].copy_from_slice(&remaining[..n]);
            remaining = &remaining[n..];
            cursor += n as u64;
        }
        Ok(())
    }

    /// Reads `dst.len()` bytes starting at `offset`, splitting across region
    /// boundaries as needed. Does not move the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Misuse`] if `offset + dst.len()` exceeds `capacity`.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(dst.len() as u64)
            .ok_or_else(|| Error::Misuse("read offset overflow".to_string()))?;
        if end > self.capacity {
            return Err(Error::Misuse(format!(
                "read at {offset} of {} bytes exceeds capacity {}",
                dst.len(),
                self.capacity
            )));
        }

        let mut cursor = offset;
        let mut written = 0usize;
        while written < dst.len() {
            let (region_idx, local) = self.region_index_and_local(cursor);
            let region = &self.regions[region_idx];
            let room = region.len() - local;
            let n = (dst.len() - written).min(room);
            dst[written..written + n].copy_from_slice(&region[local..local + n]);
            written += n;
            cursor += n as u64;
        }
        Ok(())
    }

    /// Writes `data` at the cursor, advancing it by `data.len()`. Returns the
    /// offset the data was written at (the cursor position before the
    /// write).
    ///
    /// # Errors
    ///
    /// See [`SegmentedBuffer::write_at`].
    pub fn put(&mut self, data: &[u8]) -> Result<u64> {
        let pos = self.position;
        self.write_at(pos, data)?;
        self.position += data.len() as u64;
        Ok(pos)
    }

    /// Reads `dst.len()` bytes at the cursor, advancing it by `dst.len()`.
    ///
    /// # Errors
    ///
    /// See [`SegmentedBuffer::read_at`].
    pub fn get(&mut self, dst: &mut [u8]) -> Result<()> {
        let pos = self.position;
        self.read_at(pos, dst)?;
        self.position += dst.len() as u64;
        Ok(())
    }

    /// Flushes every mapped region to disk (`msync`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if any region fails to flush.
    pub fn force(&self) -> Result<()> {
        for region in &self.regions {
            region.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let mut buf = SegmentedBuffer::open(None, 0, false, DEFAULT_MAX_REGION_SIZE).unwrap();
        let pos = buf.put(b"hello world").unwrap();
        assert_eq!(pos, 0);
        let mut dst = [0u8; 11];
        buf.set_position(0);
        buf.get(&mut dst).unwrap();
        assert_eq!(&dst, b"hello world");
    }

    #[test]
    fn read_at_does_not_disturb_cursor() {
        let mut buf = SegmentedBuffer::open(None, 0, false, DEFAULT_MAX_REGION_SIZE).unwrap();
        buf.put(b"first").unwrap();
        let after_first = buf.position();
        let mut dst = [0u8; 5];
        buf.read_at(0, &mut dst).unwrap();
        assert_eq!(&dst, b"first");
        assert_eq!(buf.position(), after_first);
    }

    #[test]
    fn region_boundary_split_write_and_read() {
        // 3 regions of 1024 bytes each; three 1024-byte strings should land
        // exactly on region boundaries, and also exercise the split path
        // when offsets don't align.
        let mut buf = SegmentedBuffer::open(None, 3072, false, 1024).unwrap();
        let a = vec![b'A'; 1024];
        let b = vec![b'B'; 1024];
        let c = vec![b'C'; 1024];

        let pos_a = buf.put(&a).unwrap();
        let pos_b = buf.put(&b).unwrap();
        let pos_c = buf.put(&c).unwrap();
        assert_eq!((pos_a, pos_b, pos_c), (0, 1024, 2048));

        let mut got = vec![0u8; 1024];
        buf.read_at(pos_a, &mut got).unwrap();
        assert_eq!(got, a);
        buf.read_at(pos_b, &mut got).unwrap();
        assert_eq!(got, b);
        buf.read_at(pos_c, &mut got).unwrap();
        assert_eq!(got, c);
    }

    #[test]
    fn write_crossing_region_boundary_is_split_and_reassembled() {
        let mut buf = SegmentedBuffer::open(None, 2048, false, 512).unwrap();
        // Start at offset 400 inside a 512-byte region; the 200-byte write
        // spans into the next region.
        let data: Vec<u8> = (0u8..200).collect();
        buf.write_at(400, &data).unwrap();
        let mut got = vec![0u8; 200];
        buf.read_at(400, &mut got).unwrap();
        assert_eq!(got, data);
    }

    #[test]
    fn write_beyond_capacity_is_misuse() {
        let mut buf = SegmentedBuffer::open(None, 0, false, DEFAULT_MAX_REGION_SIZE).unwrap();
        let cap = buf.capacity();
        let err = buf.write_at(cap, b"x").unwrap_err();
        assert!(matches!(err, Error::Misuse(_)));
    }

    #[test]
    fn capacity_floors_at_one_mebibyte() {
        let buf = SegmentedBuffer::open(None, 10, false, DEFAULT_MAX_REGION_SIZE).unwrap();
        assert_eq!(buf.capacity(), MIN_FILE_SIZE);
    }

    #[test]
    fn persistent_buffer_reopens_with_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.dat");
        {
            let mut buf =
                SegmentedBuffer::open(Some(&path), 0, true, DEFAULT_MAX_REGION_SIZE).unwrap();
            buf.put(b"persisted").unwrap();
            buf.force().unwrap();
        }
        let buf = SegmentedBuffer::open(Some(&path), 0, true, DEFAULT_MAX_REGION_SIZE).unwrap();
        let mut dst = [0u8; 9];
        buf.read_at(0, &mut dst).unwrap();
        assert_eq!(&dst, b"persisted");
    }
}
