//! Inode allocator: two-pass group selection with a last-used hint.

use log::*;
use zerocopy::FromBytes;

use crate::bitmap::{bit_clear, bit_set, bit_test, find_clear};
use crate::error::{Ext4Error, Result};
use crate::fs::{Ext4Fs, InodeRef};
use crate::inode::{Ext4FileType, Ext4Inode};
use crate::sb::RoCompatFeatures;

impl Ext4Fs {
    fn load_inode_bitmap(&mut self, bitmap_lba: u64) -> Result<Vec<u8>> {
        let bref = self.block_get(bitmap_lba)?;
        let bitmap = bref.borrow().data.clone();
        self.block_set(bref)?;
        Ok(bitmap)
    }

    fn store_inode_bitmap(&mut self, bitmap_lba: u64, bitmap: &[u8]) -> Result<()> {
        let bref = self.block_get(bitmap_lba)?;
        bref.write_at(0, bitmap);
        self.dirty_block(&bref);
        self.block_set(bref)?;
        Ok(())
    }

    /// Pick the group for a new inode. Directories want a group with
    /// free inodes and at least an average share of free blocks; the
    /// second pass settles for any free inode.
    fn ialloc_find_group(&mut self, is_dir: bool) -> Result<Option<u32>> {
        let group_count = self.sb.group_count();
        let avg_free_blocks = self.sb.free_blocks_count() / group_count as u64;
        let start = self.last_inode_bg_id;

        for pass in 0..2 {
            for i in 0..group_count {
                let group = (start + i) % group_count;
                let gref = self.group_get(group)?;
                let free_inodes = gref.desc.free_inodes_count(&self.sb);
                let free_blocks = gref.desc.free_blocks_count(&self.sb);
                self.group_put(gref)?;
                if free_inodes == 0 {
                    continue;
                }
                if pass == 0 && is_dir && (free_blocks as u64) < avg_free_blocks {
                    continue;
                }
                return Ok(Some(group));
            }
        }
        Ok(None)
    }

    /// Allocate an inode number. The bitmap bit is claimed and every
    /// counter (group free/used-dirs/itable-unused, superblock free)
    /// is adjusted; the body is initialized by `inode_alloc`.
    fn ialloc_alloc_ino(&mut self, is_dir: bool) -> Result<u32> {
        self.check_writable()?;
        let Some(group) = self.ialloc_find_group(is_dir)? else {
            warn!("all inode bitmaps exhausted");
            return Err(Ext4Error::NoSpace);
        };
        let ipg = self.sb.s_inodes_per_group.get();
        let mut gref = self.group_get(group)?;
        let bitmap_lba = gref.desc.inode_bitmap(&self.sb);
        let mut bitmap = self.load_inode_bitmap(bitmap_lba)?;
        if !gref.desc.verify_inode_bitmap_csum(&self.sb, &bitmap) {
            self.group_put(gref)?;
            error!("group {} inode bitmap checksum mismatch", group);
            return Err(Ext4Error::Io);
        }
        let Some(bit) = find_clear(&bitmap, 0, ipg) else {
            // descriptor said free but the bitmap disagrees
            self.group_put(gref)?;
            return Err(Ext4Error::Corrupted);
        };
        bit_set(&mut bitmap, bit);
        gref.desc.set_inode_bitmap_csum(&self.sb, &bitmap);
        let free = gref.desc.free_inodes_count(&self.sb) - 1;
        gref.desc.set_free_inodes_count(&self.sb, free);
        if is_dir {
            let dirs = gref.desc.used_dirs_count(&self.sb) + 1;
            gref.desc.set_used_dirs_count(&self.sb, dirs);
        }
        // shrink the unused-itable tail when we bite into it
        if self.sb.ro_compat().contains(RoCompatFeatures::GDT_CSUM) || self.sb.has_metadata_csum() {
            let unused = gref.desc.itable_unused(&self.sb);
            if unused > 0 && bit >= ipg - unused {
                gref.desc.set_itable_unused(&self.sb, ipg - bit - 1);
            }
        }
        Ext4Fs::group_clear_uninit(&mut gref);
        gref.dirty = true;
        self.store_inode_bitmap(bitmap_lba, &bitmap)?;
        self.group_put(gref)?;
        self.sb_add_free_inodes(-1);
        self.last_inode_bg_id = group;
        Ok(group * ipg + bit + 1)
    }

    /// Allocate and initialize a fresh inode of the given type.
    pub fn inode_alloc(&mut self, ftype: Ext4FileType, perm: u16) -> Result<InodeRef> {
        let is_dir = ftype == Ext4FileType::Directory;
        let ino = self.ialloc_alloc_ino(is_dir)?;
        let mut inode = Ext4Inode::new_zeroed();
        inode.set_file_type(ftype, perm);
        inode.set_links_count(0);
        let now = crate::now_epoch();
        inode.i_atime.set(now);
        inode.i_ctime.set(now);
        inode.i_mtime.set(now);
        if self.sb.inode_size() > 128 {
            let want = self.sb.s_want_extra_isize.get();
            inode.i_extra_isize.set(if want != 0 { want } else { 32 });
        }
        inode.i_generation.set(rand::random::<u32>());
        // wipe the whole slot so stale inline xattrs never leak in
        let (lba, off) = self.inode_raw_slot(ino)?;
        let isize = self.sb.inode_size() as usize;
        let bref = self.block_get(lba)?;
        bref.write_at(off, &vec![0u8; isize]);
        self.dirty_block(&bref);
        self.block_set(bref)?;
        debug!("allocated inode {} ({:?})", ino, ftype);
        Ok(InodeRef { ino, inode, dirty: true })
    }

    /// Return an inode to the bitmap. The caller has already released
    /// its blocks; this clears the body and flips every counter back.
    pub fn inode_free(&mut self, mut iref: InodeRef) -> Result<()> {
        self.check_writable()?;
        let ipg = self.sb.s_inodes_per_group.get();
        let group = (iref.ino - 1) / ipg;
        let bit = (iref.ino - 1) % ipg;
        let is_dir = iref.inode.is_type(Ext4FileType::Directory);

        iref.inode.i_dtime.set(crate::now_epoch());
        iref.inode.set_links_count(0);
        iref.dirty = true;
        let ino = iref.ino;
        self.inode_put(iref)?;

        let mut gref = self.group_get(group)?;
        let bitmap_lba = gref.desc.inode_bitmap(&self.sb);
        let mut bitmap = self.load_inode_bitmap(bitmap_lba)?;
        if !bit_test(&bitmap, bit) {
            self.group_put(gref)?;
            warn!("double free of inode {}", ino);
            return Err(Ext4Error::Corrupted);
        }
        bit_clear(&mut bitmap, bit);
        gref.desc.set_inode_bitmap_csum(&self.sb, &bitmap);
        let free = gref.desc.free_inodes_count(&self.sb) + 1;
        gref.desc.set_free_inodes_count(&self.sb, free);
        if is_dir {
            let dirs = gref.desc.used_dirs_count(&self.sb) - 1;
            gref.desc.set_used_dirs_count(&self.sb, dirs);
        }
        gref.dirty = true;
        self.store_inode_bitmap(bitmap_lba, &bitmap)?;
        self.group_put(gref)?;
        self.sb_add_free_inodes(1);
        debug!("freed inode {}", ino);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::fs::Ext4Fs;
    use crate::inode::Ext4FileType;
    use crate::mkfs::{mkfs, FsProfile, MkfsOpts};
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
    fn alloc_free_restores_counts() {
        let mut fs = fresh_fs();
        let before = fs.sb.s_free_inodes_count.get();
        let iref = fs.inode_alloc(Ext4FileType::RegularFile, 0o644).unwrap();
        let ino = iref.ino;
        assert!(ino >= fs.sb.first_ino());
        assert_eq!(fs.sb.s_free_inodes_count.get(), before - 1);
        fs.inode_put(iref).unwrap();
        let iref = fs.inode_get(ino).unwrap();
        fs.inode_free(iref).unwrap();
        assert_eq!(fs.sb.s_free_inodes_count.get(), before);
    }

    #[test]
    fn directory_allocation_bumps_used_dirs() {
        let mut fs = fresh_fs();
        let iref = fs.inode_alloc(Ext4FileType::Directory, 0o755).unwrap();
        let group = (iref.ino - 1) / fs.sb.s_inodes_per_group.get();
        fs.inode_put(iref).unwrap();
        let gref = fs.group_get(group).unwrap();
        assert!(gref.desc.used_dirs_count(&fs.sb) >= 1);
        fs.group_put(gref).unwrap();
    }
}
