//! Block device interface and the file-backed flash simulator
//!
//! The translator talks to flash through the [`FlashDevice`] trait: reads and
//! writes at write-granularity, erases at segment granularity, and three
//! geometry getters. [`FileFlash`] backs the trait with a memory-mapped file;
//! any other implementation (RAM, real flash) can be substituted without the
//! core noticing.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;

use crate::common::{FlashMapError, Result};

/// Default write granularity in bytes (the programmable unit).
pub const DEFAULT_WRITE_GRANULARITY: u32 = 64;

/// Default erase-segment size in bytes.
pub const DEFAULT_SEGMENT_SIZE: u32 = 4096;

/// Default number of segments on the simulated device.
pub const DEFAULT_SEGMENT_COUNT: u32 = 6;

/// Value every byte of an erased segment reads back as. The first 32-bit
/// word of a block being all ones is the "erased" sentinel throughout the
/// crate; porting to a device with a different erase polarity means changing
/// this constant and the sentinel check together.
pub const ERASED_BYTE: u8 = 0xFF;

/// A flash-like block device.
///
/// Contracts: `read`/`write` offsets and lengths are multiples of
/// [`write_granularity`](FlashDevice::write_granularity); `erase_segment`
/// offsets are segment-aligned; `write` has persisted when it returns.
pub trait FlashDevice {
    /// Read `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset`. Durable on return.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Reset one whole segment to [`ERASED_BYTE`].
    fn erase_segment(&mut self, segment_offset: u64) -> Result<()>;

    /// Total device capacity in bytes.
    fn total_size(&self) -> u64;

    /// Erase unit size in bytes.
    fn segment_size(&self) -> u32;

    /// Smallest programmable unit in bytes.
    fn write_granularity(&self) -> u32;

    /// Erase every segment on the device.
    fn erase_all(&mut self) -> Result<()> {
        let segment_size = self.segment_size() as u64;
        let mut offset = 0;
        while offset < self.total_size() {
            self.erase_segment(offset)?;
            offset += segment_size;
        }
        Ok(())
    }
}

/// File-backed flash simulator.
///
/// The backing file is memory-mapped and sized to the full device capacity on
/// open; writes are flushed through to the file before returning so the
/// persistence contract of [`FlashDevice::write`] holds.
pub struct FileFlash {
    map: MmapMut,
    size_bytes: u64,
    segment_size: u32,
    write_granularity: u32,
}

impl FileFlash {
    /// Open (or create) the backing file at `path` with the given geometry.
    pub fn open<P: AsRef<Path>>(
        path: P,
        segment_count: u32,
        segment_size: u32,
        write_granularity: u32,
    ) -> Result<Self> {
        if write_granularity == 0
            || segment_size == 0
            || segment_size % write_granularity != 0
        {
            return Err(FlashMapError::Config {
                message: format!(
                    "segment size {} is not a multiple of write granularity {}",
                    segment_size, write_granularity
                ),
            });
        }

        let size_bytes = segment_count as u64 * segment_size as u64;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        file.set_len(size_bytes)?;

        let map = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            map,
            size_bytes,
            segment_size,
            write_granularity,
        })
    }

    fn check_span(&self, offset: u64, len: usize, granularity: u64) -> Result<()> {
        let len = len as u64;
        if offset % granularity != 0 || len % granularity != 0 {
            return Err(FlashMapError::InvariantViolated {
                message: format!(
                    "unaligned device access at {offset} (+{len}), granularity {granularity}"
                ),
            });
        }
        if offset + len > self.size_bytes {
            return Err(FlashMapError::InvariantViolated {
                message: format!(
                    "device access at {offset} (+{len}) beyond capacity {}",
                    self.size_bytes
                ),
            });
        }
        Ok(())
    }
}

impl FlashDevice for FileFlash {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_span(offset, buf.len(), self.write_granularity as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.map[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_span(offset, data.len(), self.write_granularity as u64)?;
        let start = offset as usize;
        self.map[start..start + data.len()].copy_from_slice(data);
        self.map.flush_range(start, data.len())?;
        Ok(())
    }

    fn erase_segment(&mut self, segment_offset: u64) -> Result<()> {
        self.check_span(
            segment_offset,
            self.segment_size as usize,
            self.segment_size as u64,
        )?;
        let start = segment_offset as usize;
        let end = start + self.segment_size as usize;
        self.map[start..end].fill(ERASED_BYTE);
        self.map.flush_range(start, self.segment_size as usize)?;
        Ok(())
    }

    fn total_size(&self) -> u64 {
        self.size_bytes
    }

    fn segment_size(&self) -> u32 {
        self.segment_size
    }

    fn write_granularity(&self) -> u32 {
        self.write_granularity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_default(dir: &tempfile::TempDir) -> FileFlash {
        FileFlash::open(
            dir.path().join("flash.dbf"),
            DEFAULT_SEGMENT_COUNT,
            DEFAULT_SEGMENT_SIZE,
            DEFAULT_WRITE_GRANULARITY,
        )
        .unwrap()
    }

    #[test]
    fn test_geometry() {
        let dir = tempdir().unwrap();
        let flash = open_default(&dir);
        assert_eq!(flash.total_size(), 6 * 4096);
        assert_eq!(flash.segment_size(), 4096);
        assert_eq!(flash.write_granularity(), 64);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let mut flash = open_default(&dir);

        let data = vec![0xAB; 64];
        flash.write(128, &data).unwrap();

        let mut out = vec![0u8; 64];
        flash.read(128, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_erase_fills_with_ones() {
        let dir = tempdir().unwrap();
        let mut flash = open_default(&dir);

        flash.write(4096, &vec![0u8; 64]).unwrap();
        flash.erase_segment(4096).unwrap();

        let mut out = vec![0u8; 64];
        flash.read(4096, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == ERASED_BYTE));
    }

    #[test]
    fn test_unaligned_access_rejected() {
        let dir = tempdir().unwrap();
        let mut flash = open_default(&dir);

        let mut buf = vec![0u8; 64];
        assert!(flash.read(13, &mut buf).is_err());
        assert!(flash.write(64, &vec![0u8; 17]).is_err());
        assert!(flash.erase_segment(100).is_err());
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let dir = tempdir().unwrap();
        let flash = open_default(&dir);

        let mut buf = vec![0u8; 64];
        assert!(flash.read(6 * 4096, &mut buf).is_err());
    }

    #[test]
    fn test_contents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.dbf");

        {
            let mut flash =
                FileFlash::open(&path, DEFAULT_SEGMENT_COUNT, 4096, 64).unwrap();
            flash.write(0, &vec![0x5A; 64]).unwrap();
        }

        let flash = FileFlash::open(&path, DEFAULT_SEGMENT_COUNT, 4096, 64).unwrap();
        let mut out = vec![0u8; 64];
        flash.read(0, &mut out).unwrap();
        assert_eq!(out, vec![0x5A; 64]);
    }
}
