//! Block allocator: goal-directed bitmap scan with group fallback.

use log::*;

use crate::bitmap::{bit_clear, bit_set, bit_test, find_clear};
use crate::error::{Ext4Error, Result};
use crate::fs::{Ext4Fs, InodeRef};

/// Window scanned after a missed goal before falling back to the whole
/// group.
const NEAR_GOAL_WINDOW: u32 = 63;

impl Ext4Fs {
    fn load_block_bitmap(&mut self, bitmap_lba: u64) -> Result<Vec<u8>> {
        let bref = self.block_get(bitmap_lba)?;
        let bitmap = bref.borrow().data.clone();
        self.block_set(bref)?;
        Ok(bitmap)
    }

    fn store_block_bitmap(&mut self, bitmap_lba: u64, bitmap: &[u8]) -> Result<()> {
        let bref = self.block_get(bitmap_lba)?;
        bref.write_at(0, bitmap);
        self.dirty_block(&bref);
        self.block_set(bref)?;
        Ok(())
    }

    /// Claim one free block near `goal` for `iref`. Scan order: the
    /// goal bit itself, the next 63 bits, the rest of the goal group,
    /// then every other group.
    pub fn block_alloc(&mut self, iref: &mut InodeRef, goal: u64) -> Result<u64> {
        self.check_writable()?;
        let first_data = self.sb.s_first_data_block.get() as u64;
        let total = self.sb.blocks_count();
        let goal = if goal < first_data || goal >= total { first_data } else { goal };
        let goal_group = self.sb.group_of_block(goal);
        let goal_idx = self.sb.block_in_group(goal);
        let group_count = self.sb.group_count();

        let order = std::iter::once(goal_group)
            .chain((0..group_count).filter(|g| *g != goal_group));
        for group in order {
            let mut gref = self.group_get(group)?;
            if gref.desc.free_blocks_count(&self.sb) == 0 {
                self.group_put(gref)?;
                continue;
            }
            let limit = self.sb.blocks_in_group(group);
            let bitmap_lba = gref.desc.block_bitmap(&self.sb);
            let mut bitmap = self.load_block_bitmap(bitmap_lba)?;
            if !gref.desc.verify_block_bitmap_csum(&self.sb, &bitmap) {
                self.group_put(gref)?;
                error!("group {} block bitmap checksum mismatch", group);
                return Err(Ext4Error::Io);
            }

            let mut found = None;
            if group == goal_group {
                if !bit_test(&bitmap, goal_idx) {
                    found = Some(goal_idx);
                } else {
                    let end = (goal_idx + 1 + NEAR_GOAL_WINDOW).min(limit);
                    found = find_clear(&bitmap, goal_idx + 1, end);
                }
            }
            if found.is_none() {
                found = find_clear(&bitmap, 0, limit);
            }
            let Some(bit) = found else {
                self.group_put(gref)?;
                continue;
            };

            bit_set(&mut bitmap, bit);
            gref.desc.set_block_bitmap_csum(&self.sb, &bitmap);
            let free = gref.desc.free_blocks_count(&self.sb) - 1;
            gref.desc.set_free_blocks_count(&self.sb, free);
            gref.dirty = true;
            self.store_block_bitmap(bitmap_lba, &bitmap)?;
            self.group_put(gref)?;
            self.sb_add_free_blocks(-1);
            self.inode_add_blocks(iref, 1)?;
            let block = self.sb.group_first_block(group) + bit as u64;
            trace!("allocated block {} (group {} bit {})", block, group, bit);
            return Ok(block);
        }
        warn!("all block bitmaps exhausted");
        Err(Ext4Error::NoSpace)
    }

    /// Release `count` blocks starting at `first`. The range may span
    /// group boundaries; it is split per group. Freed blocks are
    /// revoked from the running journal transaction and dropped from
    /// the cache.
    pub fn block_free(
        &mut self,
        iref: Option<&mut InodeRef>,
        first: u64,
        count: u64,
    ) -> Result<()> {
        self.check_writable()?;
        if count == 0 {
            return Ok(());
        }
        let total = self.sb.blocks_count();
        if first < self.sb.s_first_data_block.get() as u64 || first + count > total {
            return Err(Ext4Error::OutOfRange);
        }

        let mut block = first;
        let mut remaining = count;
        while remaining > 0 {
            let group = self.sb.group_of_block(block);
            let idx = self.sb.block_in_group(block);
            let in_group = (self.sb.blocks_in_group(group) - idx).min(remaining as u32);

            let mut gref = self.group_get(group)?;
            let bitmap_lba = gref.desc.block_bitmap(&self.sb);
            let mut bitmap = self.load_block_bitmap(bitmap_lba)?;
            for b in idx..idx + in_group {
                if !bit_test(&bitmap, b) {
                    warn!("double free of block {}", self.sb.group_first_block(group) + b as u64);
                    continue;
                }
                bit_clear(&mut bitmap, b);
            }
            gref.desc.set_block_bitmap_csum(&self.sb, &bitmap);
            let free = gref.desc.free_blocks_count(&self.sb) + in_group;
            gref.desc.set_free_blocks_count(&self.sb, free);
            gref.dirty = true;
            self.store_block_bitmap(bitmap_lba, &bitmap)?;
            self.group_put(gref)?;
            self.sb_add_free_blocks(in_group as i64);

            for lba in block..block + in_group as u64 {
                if let Some(journal) = self.journal.as_mut() {
                    if journal.in_transaction() {
                        journal.revoke_block(lba);
                    }
                }
                self.bcache.invalidate(lba);
            }
            block += in_group as u64;
            remaining -= in_group as u64;
        }
        if let Some(iref) = iref {
            self.inode_add_blocks(iref, -(count as i64))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Ext4Error;
    use crate::mkfs::{mkfs, FsProfile, MkfsOpts};
    use crate::fs::Ext4Fs;
    use crate::sb::EXT4_ROOT_INO;
    use block_dev::memory::MemDev;
    use block_dev::Bdev;

    fn fresh_fs() -> Ext4Fs {
        let mut bdev = Bdev::new(Box::new(MemDev::new(16 * 1024 * 1024)));
        mkfs(
            &mut bdev,
            &MkfsOpts { profile: FsProfile::Ext4, block_size: 1024, ..Default::default() },
        )
        .unwrap();
        Ext4Fs::mount(bdev, false).unwrap()
    }

    #[test]
    fn alloc_hits_goal_when_free() {
        let mut fs = fresh_fs();
        let mut root = fs.inode_get(EXT4_ROOT_INO).unwrap();
        let goal = fs.inode_alloc_goal(&root).unwrap();
        let b1 = fs.block_alloc(&mut root, goal).unwrap();
        let b2 = fs.block_alloc(&mut root, b1 + 1).unwrap();
        assert_eq!(b2, b1 + 1);
        fs.block_free(Some(&mut root), b1, 2).unwrap();
        root.dirty = false;
        fs.inode_put(root).unwrap();
    }

    #[test]
    fn free_counts_stay_coherent() {
        let mut fs = fresh_fs();
        let before = fs.sb.free_blocks_count();
        let mut root = fs.inode_get(EXT4_ROOT_INO).unwrap();
        let goal = fs.inode_alloc_goal(&root).unwrap();
        let mut blocks = vec![];
        for _ in 0..100 {
            let b = fs.block_alloc(&mut root, goal).unwrap();
            blocks.push(b);
        }
        assert_eq!(fs.sb.free_blocks_count(), before - 100);
        let mut per_group = 0u64;
        for g in 0..fs.sb.group_count() {
            let gref = fs.group_get(g).unwrap();
            per_group += gref.desc.free_blocks_count(&fs.sb) as u64;
            fs.group_put(gref).unwrap();
        }
        assert_eq!(per_group, fs.sb.free_blocks_count());
        for b in blocks {
            fs.block_free(Some(&mut root), b, 1).unwrap();
        }
        assert_eq!(fs.sb.free_blocks_count(), before);
        root.dirty = false;
        fs.inode_put(root).unwrap();
    }

    #[test]
    fn exhaustion_returns_no_space() {
        let mut bdev = Bdev::new(Box::new(MemDev::new(1024 * 1024)));
        crate::mkfs::mkfs(
            &mut bdev,
            &MkfsOpts { profile: FsProfile::Ext2, block_size: 1024, ..Default::default() },
        )
        .unwrap();
        let mut fs = Ext4Fs::mount(bdev, false).unwrap();
        let mut root = fs.inode_get(EXT4_ROOT_INO).unwrap();
        loop {
            match fs.block_alloc(&mut root, 0) {
                Ok(_) => {}
                Err(Ext4Error::NoSpace) => break,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
        assert_eq!(fs.sb.free_blocks_count(), 0);
        root.dirty = false;
        fs.inode_put(root).unwrap();
    }
}
