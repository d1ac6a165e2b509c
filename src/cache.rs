//! Buffered block cache: fixed capacity, LRU eviction, reference
//! counting and a write-back switch used by the journal.
//!
//! A buffer is either referenced (refcnt > 0) or parked in the LRU
//! order, never both. Dirty buffers are tracked on a separate list and
//! flushed on release, on `flush_all`, or when eviction pressure picks
//! them up. Buffers taken over by a running journal transaction carry
//! an end-write tag and are not evictable until the journal releases
//! them.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use block_dev::Bdev;
use bitflags::bitflags;
use log::*;
use lru::LruCache;

use crate::error::{Ext4Error, Result};

bitflags! {
    pub struct BufFlags: u8 {
        const UPTODATE = 0x01;
        const DIRTY = 0x02;
    }
}

pub struct Buffer {
    pub lba: u64,
    pub data: Vec<u8>,
    refcnt: u32,
    flags: BufFlags,
    /// Sequence of the journal transaction holding this block, if any.
    end_write: Option<u32>,
}

impl Buffer {
    fn new(lba: u64, bsize: usize) -> Self {
        Self {
            lba,
            data: vec![0u8; bsize],
            refcnt: 0,
            flags: BufFlags::empty(),
            end_write: None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(BufFlags::DIRTY)
    }

    pub fn is_uptodate(&self) -> bool {
        self.flags.contains(BufFlags::UPTODATE)
    }
}

/// A counted reference to a cached buffer. Obtained from `get`/
/// `get_noread`, returned through `set`.
pub struct BlockRef {
    buf: Rc<RefCell<Buffer>>,
    pub lba: u64,
}

impl BlockRef {
    pub fn borrow(&self) -> std::cell::Ref<'_, Buffer> {
        self.buf.borrow()
    }

    pub fn borrow_mut(&self) -> std::cell::RefMut<'_, Buffer> {
        self.buf.borrow_mut()
    }

    /// Copy bytes out of the buffer.
    pub fn read_at(&self, off: usize, out: &mut [u8]) {
        out.copy_from_slice(&self.buf.borrow().data[off..off + out.len()]);
    }

    /// Copy bytes into the buffer. The caller still has to mark it
    /// dirty through the cache.
    pub fn write_at(&self, off: usize, src: &[u8]) {
        self.buf.borrow_mut().data[off..off + src.len()].copy_from_slice(src);
    }
}

pub struct Bcache {
    bsize: usize,
    capacity: usize,
    map: HashMap<u64, Rc<RefCell<Buffer>>>,
    /// Unreferenced buffers in recency order.
    lru: LruCache<u64, ()>,
    /// Dirty LBAs in first-dirtied order.
    dirty: Vec<u64>,
    /// Write-back nesting; flushes are deferred while non-zero.
    write_back: u32,
    /// (lba, transaction seq) pairs whose end-write fired.
    finished: Vec<(u64, u32)>,
}

impl Bcache {
    pub fn new(bsize: usize, capacity: usize) -> Self {
        Self {
            bsize,
            capacity,
            map: HashMap::new(),
            lru: LruCache::unbounded(),
            dirty: Vec::new(),
            write_back: 0,
            finished: Vec::new(),
        }
    }

    pub fn bsize(&self) -> usize {
        self.bsize
    }

    fn take_ref(&mut self, lba: u64) -> BlockRef {
        let rc = self.map.get(&lba).unwrap().clone();
        {
            let mut b = rc.borrow_mut();
            b.refcnt += 1;
            if b.refcnt == 1 {
                self.lru.pop(&lba);
            }
        }
        BlockRef { buf: rc, lba }
    }

    fn alloc(&mut self, bdev: &mut Bdev, lba: u64) -> Result<()> {
        if self.map.len() >= self.capacity {
            self.shake(bdev)?;
        }
        if self.map.len() >= self.capacity {
            warn!("cache full, every buffer referenced or journaled");
            return Err(Ext4Error::NoSpace);
        }
        self.map
            .insert(lba, Rc::new(RefCell::new(Buffer::new(lba, self.bsize))));
        Ok(())
    }

    /// Return an uptodate buffer for `lba`, reading it from the device
    /// on first reference.
    pub fn get(&mut self, bdev: &mut Bdev, lba: u64) -> Result<BlockRef> {
        if !self.map.contains_key(&lba) {
            self.alloc(bdev, lba)?;
        }
        let bref = self.take_ref(lba);
        let needs_read = !bref.borrow().is_uptodate();
        if needs_read {
            let mut b = bref.borrow_mut();
            bdev.read_block(lba, 1, &mut b.data)?;
            b.flags.insert(BufFlags::UPTODATE);
        }
        Ok(bref)
    }

    /// Return a buffer for `lba` without reading the device; the caller
    /// is going to overwrite every byte.
    pub fn get_noread(&mut self, bdev: &mut Bdev, lba: u64) -> Result<BlockRef> {
        if !self.map.contains_key(&lba) {
            self.alloc(bdev, lba)?;
        }
        Ok(self.take_ref(lba))
    }

    /// Mark a referenced buffer dirty. Dirty implies uptodate.
    pub fn mark_dirty(&mut self, bref: &BlockRef) {
        let mut b = bref.borrow_mut();
        b.flags.insert(BufFlags::UPTODATE);
        if !b.flags.contains(BufFlags::DIRTY) {
            b.flags.insert(BufFlags::DIRTY);
            self.dirty.push(b.lba);
        }
    }

    /// Tag a buffer as owned by journal transaction `seq`; it will not
    /// be evicted or flushed by eviction pressure until the tag clears.
    pub fn set_end_write(&mut self, bref: &BlockRef, seq: u32) {
        bref.borrow_mut().end_write = Some(seq);
    }

    pub fn clear_end_write(&mut self, lba: u64) {
        if let Some(rc) = self.map.get(&lba) {
            rc.borrow_mut().end_write = None;
        }
    }

    /// Release one reference. On the last release a clean buffer parks
    /// in the LRU order; a dirty one is flushed unless write-back mode
    /// is holding flushes.
    pub fn set(&mut self, bdev: &mut Bdev, bref: BlockRef) -> Result<()> {
        let lba = bref.lba;
        let refcnt = {
            let mut b = bref.borrow_mut();
            assert!(b.refcnt > 0, "unbalanced block release for lba {}", lba);
            b.refcnt -= 1;
            b.refcnt
        };
        drop(bref);
        if refcnt == 0 {
            let dirty = self.map.get(&lba).map(|rc| rc.borrow().is_dirty()).unwrap_or(false);
            if dirty && self.write_back == 0 {
                self.flush(bdev, lba)?;
            }
            self.lru.put(lba, ());
        }
        Ok(())
    }

    /// Synchronously write a dirty buffer.
    pub fn flush(&mut self, bdev: &mut Bdev, lba: u64) -> Result<()> {
        let rc = match self.map.get(&lba) {
            Some(rc) => rc.clone(),
            None => return Ok(()),
        };
        let fired = {
            let mut b = rc.borrow_mut();
            if !b.is_dirty() {
                return Ok(());
            }
            bdev.write_block(lba, 1, &b.data)?;
            b.flags.remove(BufFlags::DIRTY);
            b.end_write.take()
        };
        self.dirty.retain(|d| *d != lba);
        if let Some(seq) = fired {
            self.finished.push((lba, seq));
        }
        Ok(())
    }

    /// Drain the dirty list in first-dirtied order.
    pub fn flush_all(&mut self, bdev: &mut Bdev) -> Result<()> {
        let dirty: Vec<u64> = self.dirty.clone();
        for lba in dirty {
            self.flush(bdev, lba)?;
        }
        Ok(())
    }

    /// Enable or disable write-back mode. Enables nest; the final
    /// disable drains the dirty list.
    pub fn write_back(&mut self, bdev: &mut Bdev, on: bool) -> Result<()> {
        if on {
            self.write_back += 1;
        } else {
            assert!(self.write_back > 0, "unbalanced write_back disable");
            self.write_back -= 1;
            if self.write_back == 0 {
                self.flush_all(bdev)?;
            }
        }
        Ok(())
    }

    pub fn write_back_active(&self) -> bool {
        self.write_back > 0
    }

    /// Evict unreferenced buffers in LRU order until below capacity.
    /// Dirty candidates are flushed first; journaled candidates are
    /// passed over.
    fn shake(&mut self, bdev: &mut Bdev) -> Result<()> {
        let mut candidates: Vec<u64> = Vec::new();
        for (lba, _) in self.lru.iter().rev() {
            candidates.push(*lba);
        }
        for lba in candidates {
            if self.map.len() < self.capacity {
                break;
            }
            let rc = self.map.get(&lba).unwrap().clone();
            if rc.borrow().end_write.is_some() {
                continue;
            }
            if rc.borrow().is_dirty() {
                self.flush(bdev, lba)?;
            }
            self.lru.pop(&lba);
            self.map.remove(&lba);
            trace!("evicted lba {}", lba);
        }
        Ok(())
    }

    /// Drop a buffer's contents (e.g. after the block was freed and
    /// revoked); next `get` re-reads the device.
    pub fn invalidate(&mut self, lba: u64) {
        if let Some(rc) = self.map.get(&lba) {
            let mut b = rc.borrow_mut();
            if b.refcnt == 0 {
                b.flags = BufFlags::empty();
                b.end_write = None;
                self.dirty.retain(|d| *d != lba);
            }
        }
    }

    /// Completed end-write notifications since the last call.
    pub fn take_finished(&mut self) -> Vec<(u64, u32)> {
        std::mem::take(&mut self.finished)
    }

    /// Copy a cached buffer's bytes without taking a reference (the
    /// journal snapshots pinned buffers at commit time).
    pub fn peek(&self, lba: u64) -> Option<Vec<u8>> {
        self.map.get(&lba).map(|rc| rc.borrow().data.clone())
    }

    /// Drop every unreferenced buffer. Used after journal replay has
    /// rewritten blocks underneath the cache.
    pub fn purge(&mut self) {
        let (referenced, _) = self.counts();
        assert_eq!(referenced, 0, "purge with buffers still referenced");
        self.map.clear();
        self.lru = LruCache::unbounded();
        self.dirty.clear();
        self.finished.clear();
    }

    /// (referenced, dirty) buffer counts, for leak checks.
    pub fn counts(&self) -> (usize, usize) {
        let referenced = self
            .map
            .values()
            .filter(|rc| rc.borrow().refcnt > 0)
            .count();
        (referenced, self.dirty.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_dev::memory::MemDev;

    fn bdev(bsize: u32) -> Bdev {
        let mut bdev = Bdev::new(Box::new(MemDev::new(1024 * 1024)));
        bdev.open().unwrap();
        bdev.set_lg_bsize(bsize).unwrap();
        bdev
    }

    #[test]
    fn get_set_balanced_leaves_no_refs() -> Result<()> {
        let mut dev = bdev(1024);
        let mut cache = Bcache::new(1024, 8);
        let b = cache.get(&mut dev, 5)?;
        assert!(b.borrow().is_uptodate());
        cache.set(&mut dev, b)?;
        assert_eq!(cache.counts(), (0, 0));
        Ok(())
    }

    #[test]
    fn dirty_flushes_on_release() -> Result<()> {
        let mut dev = bdev(1024);
        let mut cache = Bcache::new(1024, 8);
        let b = cache.get_noread(&mut dev, 9)?;
        b.write_at(0, &[0xEE; 1024]);
        cache.mark_dirty(&b);
        cache.set(&mut dev, b)?;
        assert_eq!(cache.counts(), (0, 0));
        let mut raw = vec![0u8; 1024];
        dev.read_block(9, 1, &mut raw)?;
        assert!(raw.iter().all(|x| *x == 0xEE));
        Ok(())
    }

    #[test]
    fn write_back_defers_until_disable() -> Result<()> {
        let mut dev = bdev(1024);
        let mut cache = Bcache::new(1024, 8);
        cache.write_back(&mut dev, true)?;
        let b = cache.get_noread(&mut dev, 3)?;
        b.write_at(0, &[0x11; 1024]);
        cache.mark_dirty(&b);
        cache.set(&mut dev, b)?;
        let mut raw = vec![0u8; 1024];
        dev.read_block(3, 1, &mut raw)?;
        assert!(raw.iter().all(|x| *x == 0));
        cache.write_back(&mut dev, false)?;
        dev.read_block(3, 1, &mut raw)?;
        assert!(raw.iter().all(|x| *x == 0x11));
        Ok(())
    }

    #[test]
    fn eviction_prefers_clean_lru() -> Result<()> {
        let mut dev = bdev(1024);
        let mut cache = Bcache::new(1024, 4);
        for lba in 0..4 {
            let b = cache.get(&mut dev, lba)?;
            cache.set(&mut dev, b)?;
        }
        // fifth block forces an eviction of lba 0
        let b = cache.get(&mut dev, 100)?;
        cache.set(&mut dev, b)?;
        assert!(cache.map.len() <= 4);
        assert!(!cache.map.contains_key(&0));
        Ok(())
    }

    #[test]
    fn journaled_buffers_survive_shake() -> Result<()> {
        let mut dev = bdev(1024);
        let mut cache = Bcache::new(1024, 2);
        cache.write_back(&mut dev, true)?;
        let b = cache.get_noread(&mut dev, 1)?;
        cache.mark_dirty(&b);
        cache.set_end_write(&b, 7);
        cache.set(&mut dev, b)?;
        // pressure: journaled block must not be flushed or dropped
        let other = cache.get(&mut dev, 2)?;
        cache.set(&mut dev, other)?;
        let third = cache.get(&mut dev, 3)?;
        cache.set(&mut dev, third)?;
        assert!(cache.map.contains_key(&1));
        let mut raw = vec![0u8; 1024];
        dev.read_block(1, 1, &mut raw)?;
        assert!(raw.iter().all(|x| *x == 0));
        cache.clear_end_write(1);
        cache.write_back(&mut dev, false)?;
        assert_eq!(cache.take_finished().len(), 0);
        Ok(())
    }
}
