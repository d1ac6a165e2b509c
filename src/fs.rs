//! Filesystem core: mount state plus the reference-counted access
//! paths to cached blocks, group descriptors and inode bodies.
//!
//! Every successful `*_get` is paired with a `*_put`/`*_set` on all
//! exit paths; dirty flags propagate to the block cache at release
//! time. The journal, when running, takes over dirtied metadata blocks
//! through `dirty_block`.

use block_dev::Bdev;
use log::*;
use zerocopy::{AsBytes, FromBytes};

use crate::cache::{Bcache, BlockRef};
use crate::error::{Ext4Error, Result};
use crate::group::{Ext4GroupDesc, EXT4_BG_INODE_UNINIT};
use crate::inode::{
    raw_inode_set_csum, raw_inode_verify_csum, Ext4FileType, Ext4Inode, InodeFlags,
    EXT4_INODE_STRUCT_SIZE,
};
use crate::journal::Journal;
use crate::sb::{
    Ext4Superblock, IncompatFeatures, EXT4_ERROR_FS, EXT4_ROOT_INO, EXT4_VALID_FS,
    INCOMPAT_SUPPORTED, RO_COMPAT_SUPPORTED,
};

/// Buffers held by the cache of one mount.
pub const CONFIG_BCACHE_BLOCKS: usize = 128;

/// Largest block size the engine mounts.
pub const EXT4_MAX_BLOCK_SIZE: u32 = 65536;

pub struct Ext4Fs {
    pub bdev: Bdev,
    pub bcache: Bcache,
    pub sb: Ext4Superblock,
    pub read_only: bool,
    pub journal: Option<Journal>,
    /// Group that satisfied the last inode allocation.
    pub last_inode_bg_id: u32,
}

/// A borrowed view of one group descriptor; `dirty` writes it back
/// (with a fresh checksum) at `group_put` time.
pub struct GroupRef {
    pub index: u32,
    pub desc: Ext4GroupDesc,
    pub dirty: bool,
}

/// A borrowed inode body; `dirty` writes it back (checksummed) at
/// `inode_put` time.
pub struct InodeRef {
    pub ino: u32,
    pub inode: Ext4Inode,
    pub dirty: bool,
}

impl Ext4Fs {
    /// Mount: read and validate the superblock, check the feature
    /// support matrix, size the cache, run journal recovery if the
    /// volume was not cleanly unmounted.
    pub fn mount(mut bdev: Bdev, read_only: bool) -> Result<Self> {
        bdev.open()?;
        let sb = Ext4Superblock::load(&mut bdev)?;
        let bsize = sb.block_size();
        if bsize > EXT4_MAX_BLOCK_SIZE {
            error!("unsupported block size {}", bsize);
            return Err(Ext4Error::NotSupported);
        }
        let unsupported = sb.s_feature_incompat.get() & !INCOMPAT_SUPPORTED;
        if unsupported != 0 {
            error!("unsupported incompatible features {:#x}", unsupported);
            return Err(Ext4Error::NotSupported);
        }
        let mut read_only = read_only;
        let ro_unsupported = sb.s_feature_ro_compat.get() & !RO_COMPAT_SUPPORTED;
        if ro_unsupported != 0 {
            warn!(
                "read-only compatible features {:#x} unsupported, forcing read-only",
                ro_unsupported
            );
            read_only = true;
        }
        bdev.set_lg_bsize(bsize)?;
        let bcache = Bcache::new(bsize as usize, CONFIG_BCACHE_BLOCKS);
        let mut fs = Self {
            bdev,
            bcache,
            sb,
            read_only,
            journal: None,
            last_inode_bg_id: 0,
        };

        if fs.sb.s_state.get() & EXT4_VALID_FS == 0 {
            warn!("volume was not cleanly unmounted");
            match fs.journal_recover() {
                Ok(()) => info!("journal recovery complete"),
                Err(Ext4Error::NotSupported) => {
                    warn!("no journal to recover, mounting read-only");
                    fs.read_only = true;
                }
                Err(e) => return Err(e),
            }
        }

        if !fs.read_only {
            fs.sb.s_state.set(EXT4_ERROR_FS);
            let mnt = fs.sb.s_mnt_count.get().wrapping_add(1);
            fs.sb.s_mnt_count.set(mnt);
            fs.sb.s_mtime.set(crate::now_epoch());
            fs.sb.store(&mut fs.bdev)?;
        }
        info!("mounted: {}", fs.sb.summary());
        Ok(fs)
    }

    /// Unmount: stop the journal, drain the cache, mark the superblock
    /// valid again and close the device. Returns the device.
    pub fn umount(mut self) -> Result<Bdev> {
        if self.journal.is_some() {
            self.journal_stop()?;
        }
        self.bcache.flush_all(&mut self.bdev)?;
        let (referenced, dirty) = self.bcache.counts();
        if referenced != 0 || dirty != 0 {
            error!("unbalanced cache at umount: {} refs, {} dirty", referenced, dirty);
            return Err(Ext4Error::Io);
        }
        if !self.read_only {
            self.sb.s_state.set(EXT4_VALID_FS);
            self.sb.s_wtime.set(crate::now_epoch());
            self.sb.store(&mut self.bdev)?;
        }
        self.bdev.close()?;
        Ok(self.bdev)
    }

    pub fn block_size(&self) -> usize {
        self.sb.block_size() as usize
    }

    pub fn has_feature_incompat(&self, f: IncompatFeatures) -> bool {
        self.sb.incompat().contains(f)
    }

    pub fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(Ext4Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    /* ---------------- cached block access ---------------- */

    pub fn block_get(&mut self, lba: u64) -> Result<BlockRef> {
        self.bcache.get(&mut self.bdev, lba)
    }

    pub fn block_get_noread(&mut self, lba: u64) -> Result<BlockRef> {
        self.bcache.get_noread(&mut self.bdev, lba)
    }

    pub fn block_set(&mut self, bref: BlockRef) -> Result<()> {
        self.bcache.set(&mut self.bdev, bref)
    }

    /// Mark a metadata block dirty, routing it through the running
    /// journal transaction when one is open.
    pub fn dirty_block(&mut self, bref: &BlockRef) {
        if let Some(journal) = self.journal.as_mut() {
            if journal.in_transaction() {
                journal.trans_set_block_dirty(&mut self.bcache, bref);
                return;
            }
        }
        self.bcache.mark_dirty(bref);
    }

    /// Fetch a zeroed, dirty block (for freshly allocated metadata).
    pub fn block_get_zeroed(&mut self, lba: u64) -> Result<BlockRef> {
        let bref = self.block_get_noread(lba)?;
        {
            let mut b = bref.borrow_mut();
            b.data.fill(0);
        }
        self.dirty_block(&bref);
        Ok(bref)
    }

    /* ---------------- group descriptors ---------------- */

    fn group_desc_location(&self, group: u32) -> (u64, usize) {
        let desc_size = self.sb.desc_size();
        let bsize = self.block_size();
        let table_first = self.sb.s_first_data_block.get() as u64 + 1;
        let byte = group as u64 * desc_size as u64;
        (table_first + byte / bsize as u64, (byte % bsize as u64) as usize)
    }

    pub fn group_get(&mut self, group: u32) -> Result<GroupRef> {
        if group >= self.sb.group_count() {
            return Err(Ext4Error::OutOfRange);
        }
        let (lba, off) = self.group_desc_location(group);
        let desc_size = self.sb.desc_size();
        let bref = self.block_get(lba)?;
        let mut raw = [0u8; 64];
        bref.read_at(off, &mut raw[..desc_size]);
        self.block_set(bref)?;
        let desc = Ext4GroupDesc::read_from(&raw[..]).ok_or(Ext4Error::Corrupted)?;
        if !desc.verify_checksum(&self.sb, group) {
            error!("group {} descriptor checksum mismatch", group);
            return Err(Ext4Error::Io);
        }
        Ok(GroupRef { index: group, desc, dirty: false })
    }

    pub fn group_put(&mut self, mut gref: GroupRef) -> Result<()> {
        if !gref.dirty {
            return Ok(());
        }
        gref.desc.refresh_checksum(&self.sb, gref.index);
        let (lba, off) = self.group_desc_location(gref.index);
        let desc_size = self.sb.desc_size();
        let bref = self.block_get(lba)?;
        bref.write_at(off, &gref.desc.as_bytes()[..desc_size]);
        self.dirty_block(&bref);
        self.block_set(bref)?;
        Ok(())
    }

    /* ---------------- inode bodies ---------------- */

    fn inode_location(&self, ino: u32, itable: u64) -> (u64, usize) {
        let ipg = self.sb.s_inodes_per_group.get();
        let index = (ino - 1) % ipg;
        let isize = self.sb.inode_size() as u64;
        let byte = index as u64 * isize;
        let bsize = self.block_size() as u64;
        (itable + byte / bsize, (byte % bsize) as usize)
    }

    fn inode_group(&self, ino: u32) -> u32 {
        (ino - 1) / self.sb.s_inodes_per_group.get()
    }

    pub fn inode_get(&mut self, ino: u32) -> Result<InodeRef> {
        if ino == 0 || ino > self.sb.s_inodes_count.get() {
            return Err(Ext4Error::OutOfRange);
        }
        let gref = self.group_get(self.inode_group(ino))?;
        let itable = gref.desc.inode_table(&self.sb);
        self.group_put(gref)?;
        let (lba, off) = self.inode_location(ino, itable);
        let isize = self.sb.inode_size() as usize;
        let bref = self.block_get(lba)?;
        let mut raw = vec![0u8; isize];
        bref.read_at(off, &mut raw);
        self.block_set(bref)?;
        if !raw_inode_verify_csum(&self.sb, ino, &raw) {
            error!("inode {} checksum mismatch", ino);
            return Err(Ext4Error::Io);
        }
        let take = isize.min(EXT4_INODE_STRUCT_SIZE);
        let mut body = [0u8; EXT4_INODE_STRUCT_SIZE];
        body[..take].copy_from_slice(&raw[..take]);
        let inode = Ext4Inode::read_from(&body[..]).ok_or(Ext4Error::Corrupted)?;
        Ok(InodeRef { ino, inode, dirty: false })
    }

    pub fn inode_put(&mut self, iref: InodeRef) -> Result<()> {
        if !iref.dirty {
            return Ok(());
        }
        let gref = self.group_get(self.inode_group(iref.ino))?;
        let itable = gref.desc.inode_table(&self.sb);
        self.group_put(gref)?;
        let (lba, off) = self.inode_location(iref.ino, itable);
        let isize = self.sb.inode_size() as usize;
        // never spill into the inline xattr area past extra_isize
        let body_end = if isize > 128 {
            128 + iref.inode.i_extra_isize.get() as usize
        } else {
            128
        };
        let take = isize.min(EXT4_INODE_STRUCT_SIZE).min(body_end.max(128));
        let bref = self.block_get(lba)?;
        bref.write_at(off, &iref.inode.as_bytes()[..take]);
        // re-checksum the full slot, inline xattr area included
        {
            let mut slot = vec![0u8; isize];
            bref.read_at(off, &mut slot);
            raw_inode_set_csum(&self.sb, iref.ino, &mut slot);
            bref.write_at(off, &slot);
        }
        self.dirty_block(&bref);
        self.block_set(bref)?;
        Ok(())
    }

    /// Expose the raw on-disk inode slot (used by the xattr code for
    /// the inline area).
    pub fn inode_raw_slot(&mut self, ino: u32) -> Result<(u64, usize)> {
        let gref = self.group_get(self.inode_group(ino))?;
        let itable = gref.desc.inode_table(&self.sb);
        self.group_put(gref)?;
        Ok(self.inode_location(ino, itable))
    }

    /// Copy the raw inode slot out for callers that need the reserved
    /// fields too.
    pub fn raw_inode_fill(&mut self, ino: u32) -> Result<Vec<u8>> {
        let (lba, off) = self.inode_raw_slot(ino)?;
        let isize = self.sb.inode_size() as usize;
        let bref = self.block_get(lba)?;
        let mut raw = vec![0u8; isize];
        bref.read_at(off, &mut raw);
        self.block_set(bref)?;
        Ok(raw)
    }

    pub fn inode_exists(&mut self, ino: u32) -> Result<bool> {
        if ino == 0 || ino > self.sb.s_inodes_count.get() {
            return Ok(false);
        }
        match self.inode_get(ino) {
            Ok(iref) => {
                let alive = iref.inode.links_count() > 0 && iref.inode.i_mode.get() != 0;
                self.inode_put(iref)?;
                Ok(alive)
            }
            Err(e) => Err(e),
        }
    }

    /// Root directory sanity check, used by mount callers.
    pub fn check_root(&mut self) -> Result<()> {
        let root = self.inode_get(EXT4_ROOT_INO)?;
        let ok = root.inode.is_type(Ext4FileType::Directory);
        self.inode_put(root)?;
        if !ok {
            error!("root inode is not a directory");
            return Err(Ext4Error::Corrupted);
        }
        Ok(())
    }

    /* ---------------- allocation goals ---------------- */

    /// Allocation goal for the next data block of an inode: one past
    /// the last mapped block, or the first block after the inode
    /// table of the inode's own group for an empty file.
    pub fn inode_alloc_goal(&mut self, iref: &InodeRef) -> Result<u64> {
        let size_blocks = num::integer::div_ceil(iref.inode.size(), self.block_size() as u64);
        if size_blocks > 0 {
            if let Some(last) = self.inode_map_block(iref, size_blocks - 1)? {
                return Ok(last + 1);
            }
        }
        let group = self.inode_group(iref.ino);
        let gref = self.group_get(group)?;
        let itable = gref.desc.inode_table(&self.sb);
        self.group_put(gref)?;
        let itable_blocks = num::integer::div_ceil(
            self.sb.s_inodes_per_group.get() as u64 * self.sb.inode_size() as u64,
            self.block_size() as u64,
        );
        Ok(itable + itable_blocks)
    }

    /// Logical-to-physical translation, dispatching on the inode's
    /// mapping flavor. `None` means a hole.
    pub fn inode_map_block(&mut self, iref: &InodeRef, lblock: u64) -> Result<Option<u64>> {
        if iref.inode.has_flag(InodeFlags::EXTENTS) {
            self.extent_map_block(iref, lblock)
        } else {
            self.ind_map_block(iref, lblock)
        }
    }

    /// Map-or-allocate for appends, dispatching like `inode_map_block`.
    pub fn inode_append_block(&mut self, iref: &mut InodeRef) -> Result<u64> {
        self.check_writable()?;
        if iref.inode.has_flag(InodeFlags::EXTENTS) {
            self.extent_append_block(iref)
        } else {
            self.ind_append_block(iref)
        }
    }

    /// Release all blocks past logical block `from` (inclusive).
    pub fn inode_shrink_blocks(&mut self, iref: &mut InodeRef, from: u64) -> Result<()> {
        if iref.inode.has_flag(InodeFlags::EXTENTS) {
            self.extent_truncate(iref, from)
        } else {
            self.ind_truncate(iref, from)
        }
    }

    /// Truncate an inode to `new_size` bytes. Policy per type: inline
    /// symlinks rewrite their payload, device nodes reset the embedded
    /// device number, data inodes release blocks.
    pub fn truncate_inode(&mut self, iref: &mut InodeRef, new_size: u64) -> Result<()> {
        self.check_writable()?;
        if iref.inode.has_flag(InodeFlags::APPEND) || iref.inode.has_flag(InodeFlags::IMMUTABLE) {
            return Err(Ext4Error::ReadOnly);
        }
        let old_size = iref.inode.size();
        if old_size == new_size {
            return Ok(());
        }
        if old_size < new_size {
            return Err(Ext4Error::InvalidArgument);
        }
        match iref.inode.file_type()? {
            Ext4FileType::Symlink if iref.inode.is_inline_symlink() => {
                let mut payload = iref.inode.inline_symlink().to_vec();
                payload.truncate(new_size as usize);
                iref.inode.set_inline_symlink(&payload);
            }
            Ext4FileType::CharDev
            | Ext4FileType::BlockDev
            | Ext4FileType::Fifo
            | Ext4FileType::Socket => {
                iref.inode.set_dev(0);
                iref.inode.set_size(0);
            }
            _ => {
                let bsize = self.block_size() as u64;
                let keep = num::integer::div_ceil(new_size, bsize);
                self.inode_shrink_blocks(iref, keep)?;
                iref.inode.set_size(new_size);
            }
        }
        iref.inode.i_mtime.set(crate::now_epoch());
        iref.inode.i_ctime.set(crate::now_epoch());
        iref.dirty = true;
        Ok(())
    }

    /* ---------------- free-count bookkeeping ---------------- */

    pub fn sb_add_free_blocks(&mut self, delta: i64) {
        let cur = self.sb.free_blocks_count() as i64;
        self.sb.set_free_blocks_count((cur + delta) as u64);
    }

    pub fn sb_add_free_inodes(&mut self, delta: i32) {
        let cur = self.sb.s_free_inodes_count.get() as i64 + delta as i64;
        self.sb.s_free_inodes_count.set(cur as u32);
    }

    /// Adjust the inode's 512-unit block counter.
    pub fn inode_add_blocks(&mut self, iref: &mut InodeRef, fs_blocks: i64) -> Result<()> {
        let unit = self.block_size() as i64 / 512;
        let cur = iref.inode.blocks_count(&self.sb) as i64;
        iref.inode
            .set_blocks_count(&self.sb, (cur + fs_blocks * unit).max(0) as u64)?;
        iref.dirty = true;
        Ok(())
    }

    /// Group-uninit handling: the first use of a group's inode table
    /// clears the uninit flag so later mounts trust the bitmap.
    pub fn group_clear_uninit(gref: &mut GroupRef) {
        if gref.desc.has_flag(EXT4_BG_INODE_UNINIT) {
            gref.desc.clear_flag(EXT4_BG_INODE_UNINIT);
            gref.dirty = true;
        }
    }
}

// No Drop flushing: a mount abandoned without `umount` behaves like a
// crash, which is exactly what the recovery tests simulate.
