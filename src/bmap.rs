//! Direct/indirect block mapping for inodes without the extents flag:
//! twelve direct pointers, then single, double and triple indirect
//! trees of 32-bit block pointers.

use log::*;

use crate::error::{Ext4Error, Result};
use crate::fs::{Ext4Fs, InodeRef};
use crate::inode::{EXT4_DIND_BLOCK, EXT4_IND_BLOCK, EXT4_TIND_BLOCK};
use crate::types::{get_le32, put_le32};

impl Ext4Fs {
    /// Pointers per indirection block.
    fn ind_ptrs_per_block(&self) -> u64 {
        self.block_size() as u64 / 4
    }

    /// Cumulative logical-block limits of the four tiers.
    fn ind_limits(&self) -> [u64; 4] {
        let p = self.ind_ptrs_per_block();
        [12, 12 + p, 12 + p + p * p, 12 + p + p * p + p * p * p]
    }

    /// Decompose `lblock` into (root pointer index, per-level slots).
    fn ind_path(&self, lblock: u64) -> Result<(usize, Vec<u64>)> {
        let p = self.ind_ptrs_per_block();
        let limits = self.ind_limits();
        if lblock < limits[0] {
            return Ok((lblock as usize, vec![]));
        }
        if lblock < limits[1] {
            let l = lblock - limits[0];
            return Ok((EXT4_IND_BLOCK, vec![l]));
        }
        if lblock < limits[2] {
            let l = lblock - limits[1];
            return Ok((EXT4_DIND_BLOCK, vec![l / p, l % p]));
        }
        if lblock < limits[3] {
            let l = lblock - limits[2];
            return Ok((EXT4_TIND_BLOCK, vec![l / (p * p), (l / p) % p, l % p]));
        }
        Err(Ext4Error::OutOfRange)
    }

    fn ind_read_ptr(&mut self, block: u64, slot: u64) -> Result<u32> {
        let bref = self.block_get(block)?;
        let v = get_le32(&bref.borrow().data, slot as usize * 4);
        self.block_set(bref)?;
        Ok(v)
    }

    fn ind_write_ptr(&mut self, block: u64, slot: u64, v: u32) -> Result<()> {
        let bref = self.block_get(block)?;
        {
            let mut b = bref.borrow_mut();
            put_le32(&mut b.data, slot as usize * 4, v);
        }
        self.dirty_block(&bref);
        self.block_set(bref)?;
        Ok(())
    }

    /// Walk the indirection chain; `None` for holes.
    pub fn ind_map_block(&mut self, iref: &InodeRef, lblock: u64) -> Result<Option<u64>> {
        let (root, slots) = self.ind_path(lblock)?;
        let mut cur = iref.inode.block_ptr(root) as u64;
        for slot in slots {
            if cur == 0 {
                return Ok(None);
            }
            cur = self.ind_read_ptr(cur, slot)? as u64;
        }
        Ok(if cur == 0 { None } else { Some(cur) })
    }

    /// Map the logical block one past the current end of file,
    /// allocating any missing indirection blocks on the way down.
    pub fn ind_append_block(&mut self, iref: &mut InodeRef) -> Result<u64> {
        let bsize = self.block_size() as u64;
        let next = num::integer::div_ceil(iref.inode.size(), bsize);
        let goal = self.inode_alloc_goal(iref)?;
        let (root, slots) = self.ind_path(next)?;

        if slots.is_empty() {
            let block = self.block_alloc(iref, goal)?;
            iref.inode.set_block_ptr(root, block as u32);
            iref.dirty = true;
            return Ok(block);
        }

        let mut cur = iref.inode.block_ptr(root) as u64;
        if cur == 0 {
            cur = self.block_alloc(iref, goal)?;
            let bref = self.block_get_zeroed(cur)?;
            self.block_set(bref)?;
            iref.inode.set_block_ptr(root, cur as u32);
            iref.dirty = true;
        }
        for (level, slot) in slots.iter().enumerate() {
            let leaf = level == slots.len() - 1;
            let mut child = self.ind_read_ptr(cur, *slot)? as u64;
            if child == 0 {
                child = self.block_alloc(iref, goal)?;
                if !leaf {
                    let bref = self.block_get_zeroed(child)?;
                    self.block_set(bref)?;
                }
                self.ind_write_ptr(cur, *slot, child as u32)?;
            }
            cur = child;
        }
        Ok(cur)
    }

    /// Release every block at logical index >= `from`, collapsing
    /// indirection blocks that empty out on the way.
    pub fn ind_truncate(&mut self, iref: &mut InodeRef, from: u64) -> Result<()> {
        let bsize = self.block_size() as u64;
        let total = num::integer::div_ceil(iref.inode.size(), bsize);
        if from >= total {
            return Ok(());
        }
        for lblock in (from..total).rev() {
            let (root, slots) = self.ind_path(lblock)?;
            if slots.is_empty() {
                let block = iref.inode.block_ptr(root) as u64;
                if block != 0 {
                    self.block_free(Some(iref), block, 1)?;
                    iref.inode.set_block_ptr(root, 0);
                    iref.dirty = true;
                }
                continue;
            }
            // collect the chain so empties can cascade bottom-up
            let mut chain = Vec::with_capacity(slots.len() + 1);
            let mut cur = iref.inode.block_ptr(root) as u64;
            let mut hole = cur == 0;
            for slot in &slots {
                if hole {
                    break;
                }
                chain.push((cur, *slot));
                cur = self.ind_read_ptr(cur, *slot)? as u64;
                hole = cur == 0;
            }
            if hole {
                continue;
            }
            self.block_free(Some(iref), cur, 1)?;
            let mut cascade = true;
            for (owner, slot) in chain.iter().rev() {
                if !cascade {
                    break;
                }
                self.ind_write_ptr(*owner, *slot, 0)?;
                // the block empties exactly when its first slot clears
                cascade = *slot == 0;
                if cascade {
                    self.block_free(Some(iref), *owner, 1)?;
                }
            }
            if cascade {
                trace!("released whole {} chain for lblock {}", root, lblock);
                iref.inode.set_block_ptr(root, 0);
                iref.dirty = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::fs::Ext4Fs;
    use crate::mkfs::{mkfs, FsProfile, MkfsOpts};
    use crate::inode::Ext4FileType;
    use block_dev::memory::MemDev;
    use block_dev::Bdev;

    fn ext2_fs() -> Ext4Fs {
        let mut bdev = Bdev::new(Box::new(MemDev::new(16 * 1024 * 1024)));
        mkfs(
            &mut bdev,
            &MkfsOpts { profile: FsProfile::Ext2, block_size: 1024, ..Default::default() },
        )
        .unwrap();
        Ext4Fs::mount(bdev, false).unwrap()
    }

    #[test]
    fn append_crosses_into_single_indirect() {
        let mut fs = ext2_fs();
        let mut iref = fs.inode_alloc(Ext4FileType::RegularFile, 0o644).unwrap();
        let bsize = fs.block_size() as u64;
        let mut mapped = vec![];
        for i in 0..20u64 {
            let b = fs.ind_append_block(&mut iref).unwrap();
            iref.inode.set_size((i + 1) * bsize);
            iref.dirty = true;
            mapped.push(b);
        }
        for (i, b) in mapped.iter().enumerate() {
            assert_eq!(fs.ind_map_block(&iref, i as u64).unwrap(), Some(*b));
        }
        // 20 data blocks + 1 indirect block
        assert_eq!(iref.inode.blocks_count(&fs.sb), 21 * (bsize / 512));
        fs.inode_put(iref).unwrap();
    }

    #[test]
    fn truncate_releases_indirect_chain() {
        let mut fs = ext2_fs();
        let free_before = fs.sb.free_blocks_count();
        let mut iref = fs.inode_alloc(Ext4FileType::RegularFile, 0o644).unwrap();
        let bsize = fs.block_size() as u64;
        for i in 0..300u64 {
            fs.ind_append_block(&mut iref).unwrap();
            iref.inode.set_size((i + 1) * bsize);
            iref.dirty = true;
        }
        fs.ind_truncate(&mut iref, 0).unwrap();
        iref.inode.set_size(0);
        assert_eq!(iref.inode.blocks_count(&fs.sb), 0);
        assert_eq!(fs.sb.free_blocks_count(), free_before);
        assert_eq!(fs.ind_map_block(&iref, 0).unwrap(), None);
        assert_eq!(fs.ind_map_block(&iref, 100).unwrap(), None);
        fs.inode_put(iref).unwrap();
    }

    #[test]
    fn partial_truncate_keeps_prefix() {
        let mut fs = ext2_fs();
        let mut iref = fs.inode_alloc(Ext4FileType::RegularFile, 0o644).unwrap();
        let bsize = fs.block_size() as u64;
        let mut mapped = vec![];
        for i in 0..40u64 {
            mapped.push(fs.ind_append_block(&mut iref).unwrap());
            iref.inode.set_size((i + 1) * bsize);
            iref.dirty = true;
        }
        fs.ind_truncate(&mut iref, 10).unwrap();
        iref.inode.set_size(10 * bsize);
        for i in 0..10u64 {
            assert_eq!(fs.ind_map_block(&iref, i).unwrap(), Some(mapped[i as usize]));
        }
        assert_eq!(fs.ind_map_block(&iref, 10).unwrap(), None);
        fs.inode_put(iref).unwrap();
    }
}
