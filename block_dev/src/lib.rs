//! Block device abstraction consumed by the filesystem core.
//!
//! A backend implements [`BlockDev`]: raw physical-block I/O plus a
//! geometry report. [`Bdev`] wraps a backend with the logical block
//! size chosen at mount time, an optional partition window, transfer
//! counters and the unaligned byte helpers.

use anyhow::{anyhow, Result};
use log::*;

pub mod file;
pub mod memory;

/// Transfer counters, maintained by [`Bdev`].
#[derive(Default, Debug, Clone, Copy)]
pub struct DevStats {
    pub bread_ctr: u64,
    pub bwrite_ctr: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Physical geometry reported by a backend.
#[derive(Debug, Clone, Copy)]
pub struct DevGeometry {
    /// Physical block size in bytes (a power of two, usually 512).
    pub phys_bsize: u32,
    /// Device length in physical blocks.
    pub phys_bcnt: u64,
}

impl DevGeometry {
    pub fn total_bytes(&self) -> u64 {
        self.phys_bcnt * self.phys_bsize as u64
    }
}

/// Backend contract: synchronous I/O on contiguous physical blocks.
/// `lock`/`unlock` are optional hooks for backends that need exclusive
/// access around a burst of operations; the defaults do nothing.
pub trait BlockDev {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    /// Read `buf.len() / phys_bsize` blocks starting at physical `lba`.
    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()>;
    /// Write `buf.len() / phys_bsize` blocks starting at physical `lba`.
    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> Result<()>;
    fn geometry(&self) -> DevGeometry;
    fn lock(&mut self) -> Result<()> {
        Ok(())
    }
    fn unlock(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A backend plus the mount-time view on it: logical block size,
/// partition window and stats.
pub struct Bdev {
    inner: Box<dyn BlockDev>,
    geometry: DevGeometry,
    /// Logical block size, a multiple of the physical one.
    lg_bsize: u32,
    /// Device length in logical blocks (within the partition window).
    lg_bcnt: u64,
    /// Partition start, in bytes from the start of the device.
    part_offset: u64,
    /// Partition length in bytes.
    part_size: u64,
    stats: DevStats,
    scratch: Vec<u8>,
    opened: bool,
}

impl Bdev {
    /// Wrap a backend over its whole range.
    pub fn new(inner: Box<dyn BlockDev>) -> Self {
        let geometry = inner.geometry();
        let part_size = geometry.total_bytes();
        Self {
            inner,
            geometry,
            lg_bsize: geometry.phys_bsize,
            lg_bcnt: part_size / geometry.phys_bsize as u64,
            part_offset: 0,
            part_size,
            stats: DevStats::default(),
            scratch: vec![0u8; geometry.phys_bsize as usize],
            opened: false,
        }
    }

    /// Wrap a backend narrowed to a partition window. `offset` must be
    /// physically aligned; `size == 0` means "to the end of the device".
    pub fn new_partition(inner: Box<dyn BlockDev>, offset: u64, size: u64) -> Result<Self> {
        let geometry = inner.geometry();
        let total = geometry.total_bytes();
        if offset % geometry.phys_bsize as u64 != 0 || offset >= total {
            return Err(anyhow!("partition offset {} not addressable", offset));
        }
        let size = if size == 0 { total - offset } else { size };
        if offset + size > total {
            return Err(anyhow!("partition end {} beyond device", offset + size));
        }
        let mut bdev = Self::new(inner);
        bdev.part_offset = offset;
        bdev.part_size = size;
        bdev.lg_bcnt = size / bdev.lg_bsize as u64;
        Ok(bdev)
    }

    pub fn open(&mut self) -> Result<()> {
        if !self.opened {
            self.inner.open()?;
            self.opened = true;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.opened {
            self.inner.close()?;
            self.opened = false;
        }
        Ok(())
    }

    /// Select the logical block size. Must be a non-zero multiple of
    /// the physical block size.
    pub fn set_lg_bsize(&mut self, bsize: u32) -> Result<()> {
        if bsize == 0 || bsize % self.geometry.phys_bsize != 0 {
            return Err(anyhow!(
                "logical block size {} not a multiple of physical {}",
                bsize,
                self.geometry.phys_bsize
            ));
        }
        self.lg_bsize = bsize;
        self.lg_bcnt = self.part_size / bsize as u64;
        debug!("logical bsize {} -> {} logical blocks", bsize, self.lg_bcnt);
        Ok(())
    }

    pub fn lg_bsize(&self) -> u32 {
        self.lg_bsize
    }

    pub fn lg_bcnt(&self) -> u64 {
        self.lg_bcnt
    }

    pub fn phys_bsize(&self) -> u32 {
        self.geometry.phys_bsize
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn stats(&self) -> DevStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = DevStats::default();
    }

    fn check_range(&self, lba: u64, count: u64) -> Result<()> {
        if lba + count > self.lg_bcnt {
            return Err(anyhow!(
                "block range {}+{} beyond partition ({} blocks)",
                lba,
                count,
                self.lg_bcnt
            ));
        }
        Ok(())
    }

    /// Read `count` logical blocks starting at logical `lba`.
    pub fn read_block(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<()> {
        self.check_range(lba, count as u64)?;
        let len = count as usize * self.lg_bsize as usize;
        let phys = (self.part_offset + lba * self.lg_bsize as u64) / self.geometry.phys_bsize as u64;
        self.inner.read_blocks(phys, &mut buf[..len])?;
        self.stats.bread_ctr += count as u64;
        self.stats.bytes_read += len as u64;
        Ok(())
    }

    /// Write `count` logical blocks starting at logical `lba`.
    pub fn write_block(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<()> {
        self.check_range(lba, count as u64)?;
        let len = count as usize * self.lg_bsize as usize;
        let phys = (self.part_offset + lba * self.lg_bsize as u64) / self.geometry.phys_bsize as u64;
        self.inner.write_blocks(phys, &buf[..len])?;
        self.stats.bwrite_ctr += count as u64;
        self.stats.bytes_written += len as u64;
        Ok(())
    }

    /// Byte-granular read at an arbitrary offset within the partition.
    pub fn read_bytes(&mut self, off: u64, buf: &mut [u8]) -> Result<()> {
        if off + buf.len() as u64 > self.part_size {
            return Err(anyhow!("byte range {}+{} beyond partition", off, buf.len()));
        }
        let pb = self.geometry.phys_bsize as u64;
        let mut off = self.part_offset + off;
        let mut done = 0usize;
        while done < buf.len() {
            let blk = off / pb;
            let in_blk = (off % pb) as usize;
            let chunk = (pb as usize - in_blk).min(buf.len() - done);
            if in_blk == 0 && chunk == pb as usize {
                self.inner.read_blocks(blk, &mut buf[done..done + chunk])?;
            } else {
                self.inner.read_blocks(blk, &mut self.scratch)?;
                buf[done..done + chunk].copy_from_slice(&self.scratch[in_blk..in_blk + chunk]);
            }
            done += chunk;
            off += chunk as u64;
        }
        self.stats.bytes_read += buf.len() as u64;
        Ok(())
    }

    /// Byte-granular write; partial physical blocks go through a
    /// read-modify-write on the scratch buffer, under the backend's
    /// optional lock so the RMW cannot interleave.
    pub fn write_bytes(&mut self, off: u64, buf: &[u8]) -> Result<()> {
        if off + buf.len() as u64 > self.part_size {
            return Err(anyhow!("byte range {}+{} beyond partition", off, buf.len()));
        }
        self.inner.lock()?;
        let r = self.write_bytes_inner(off, buf);
        self.inner.unlock()?;
        r
    }

    fn write_bytes_inner(&mut self, off: u64, buf: &[u8]) -> Result<()> {
        let pb = self.geometry.phys_bsize as u64;
        let mut off = self.part_offset + off;
        let mut done = 0usize;
        while done < buf.len() {
            let blk = off / pb;
            let in_blk = (off % pb) as usize;
            let chunk = (pb as usize - in_blk).min(buf.len() - done);
            if in_blk == 0 && chunk == pb as usize {
                self.inner.write_blocks(blk, &buf[done..done + chunk])?;
            } else {
                self.inner.read_blocks(blk, &mut self.scratch)?;
                self.scratch[in_blk..in_blk + chunk].copy_from_slice(&buf[done..done + chunk]);
                self.inner.write_blocks(blk, &self.scratch)?;
            }
            done += chunk;
            off += chunk as u64;
        }
        self.stats.bytes_written += buf.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemDev;

    #[test]
    fn unaligned_bytes_roundtrip() -> Result<()> {
        let mut bdev = Bdev::new(Box::new(MemDev::new(1024 * 1024)));
        bdev.open()?;
        bdev.set_lg_bsize(1024)?;
        let payload: Vec<u8> = (0u32..700).map(|i| (i % 251) as u8).collect();
        bdev.write_bytes(513, &payload)?;
        let mut back = vec![0u8; payload.len()];
        bdev.read_bytes(513, &mut back)?;
        assert_eq!(payload, back);
        bdev.close()
    }

    #[test]
    fn partition_window_rejects_outside_range() -> Result<()> {
        let mut bdev = Bdev::new_partition(Box::new(MemDev::new(1024 * 1024)), 4096, 512 * 1024)?;
        bdev.open()?;
        bdev.set_lg_bsize(1024)?;
        assert_eq!(bdev.lg_bcnt(), 512);
        let buf = vec![0u8; 1024];
        assert!(bdev.write_block(512, 1, &buf).is_err());
        Ok(())
    }

    #[test]
    fn stats_count_transfers() -> Result<()> {
        let mut bdev = Bdev::new(Box::new(MemDev::new(64 * 1024)));
        bdev.open()?;
        bdev.set_lg_bsize(2048)?;
        let buf = vec![0xa5u8; 2048];
        bdev.write_block(3, 1, &buf)?;
        let mut back = vec![0u8; 2048];
        bdev.read_block(3, 1, &mut back)?;
        assert_eq!(back, buf);
        assert_eq!(bdev.stats().bwrite_ctr, 1);
        assert_eq!(bdev.stats().bread_ctr, 1);
        Ok(())
    }
}
