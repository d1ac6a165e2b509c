//! mkfs: lay a blank volume out as ext2, ext3 or ext4.
//!
//! Works directly on the block device (no mount involved): computes
//! the group geometry, seeds bitmaps and inode tables, writes the
//! superblock and descriptor copies, builds the root and lost+found
//! directories, and for journaled profiles carves out the journal
//! file behind inode 8.

use log::*;
use rand::Rng;
use zerocopy::{AsBytes, FromBytes};

use block_dev::Bdev;

use crate::bitmap::{bit_set, count_clear, find_clear};
use crate::crc::crc32c;
use crate::dir::{de_write, dirent_size, EXT4_DIR_CSUM_FT, EXT4_DIR_TAIL_LEN};
use crate::error::{Ext4Error, Result};
use crate::group::{Ext4GroupDesc, EXT4_BG_INODE_ZEROED};
use crate::inode::{raw_inode_set_csum, Ext4FileType, Ext4Inode, InodeFlags, EXT4_IND_BLOCK};
use crate::journal::{JournalSuperblock, JBD2_MAGIC, JBD2_SUPERBLOCK_V2};
use crate::sb::{
    CompatFeatures, Ext4Superblock, IncompatFeatures, RoCompatFeatures, EXT4_CRC32C_CHKSUM,
    EXT4_ERRORS_CONTINUE, EXT4_FLAGS_UNSIGNED_HASH, EXT4_GOOD_OLD_FIRST_INO, EXT4_JOURNAL_INO,
    EXT4_LABEL_LEN, EXT4_ROOT_INO, EXT4_SUPERBLOCK_OFFSET, EXT4_SUPER_MAGIC, EXT4_VALID_FS,
    INCOMPAT_SUPPORTED, RO_COMPAT_SUPPORTED,
};
use crate::types::{put_le16, put_le32};

pub const EXT4_LOST_FOUND_INO: u32 = 11;

/// Bytes of data tracked per inode, used to size the inode tables.
const MKFS_INODE_RATIO: u64 = 16384;
const MKFS_MIN_BLOCKS: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsProfile {
    /// No journal, no directory index, no extents.
    Ext2,
    /// Journal and directory index.
    Ext3,
    /// Journal, directory index, extents, 64-bit layout, checksums.
    Ext4,
}

#[derive(Debug, Clone)]
pub struct MkfsOpts {
    pub profile: FsProfile,
    pub block_size: u32,
    pub inode_size: u16,
    pub label: String,
    /// 0 selects an automatic size.
    pub journal_blocks: u32,
    pub uuid: Option<[u8; 16]>,
}

impl Default for MkfsOpts {
    fn default() -> Self {
        Self {
            profile: FsProfile::Ext4,
            block_size: 4096,
            inode_size: 256,
            label: String::new(),
            journal_blocks: 0,
            uuid: None,
        }
    }
}

struct Layout {
    bsize: u64,
    blocks_count: u64,
    first_data_block: u64,
    blocks_per_group: u32,
    inodes_per_group: u32,
    group_count: u32,
    gdt_blocks: u64,
    itable_blocks: u64,
    desc_size: usize,
}

impl Layout {
    fn group_first(&self, g: u32) -> u64 {
        self.first_data_block + g as u64 * self.blocks_per_group as u64
    }

    fn blocks_in_group(&self, g: u32) -> u32 {
        let first = self.group_first(g);
        (self.blocks_count - first).min(self.blocks_per_group as u64) as u32
    }
}

pub fn mkfs(bdev: &mut Bdev, opts: &MkfsOpts) -> Result<()> {
    bdev.open()?;
    if !matches!(opts.block_size, 1024 | 2048 | 4096) {
        return Err(Ext4Error::InvalidArgument);
    }
    if !matches!(opts.inode_size, 128 | 256 | 512 | 1024) {
        return Err(Ext4Error::InvalidArgument);
    }
    bdev.set_lg_bsize(opts.block_size)?;
    let bsize = opts.block_size as u64;
    let blocks_count = bdev.part_size() / bsize;
    if blocks_count < MKFS_MIN_BLOCKS {
        error!("device too small: {} blocks", blocks_count);
        return Err(Ext4Error::InvalidArgument);
    }

    /* feature sets per profile, masked to what the engine supports */
    let (compat, mut incompat, mut ro_compat) = match opts.profile {
        FsProfile::Ext2 => (
            CompatFeatures::EXT_ATTR.bits(),
            IncompatFeatures::FILETYPE.bits(),
            RoCompatFeatures::SPARSE_SUPER.bits() | RoCompatFeatures::LARGE_FILE.bits(),
        ),
        FsProfile::Ext3 => (
            CompatFeatures::EXT_ATTR.bits()
                | CompatFeatures::HAS_JOURNAL.bits()
                | CompatFeatures::DIR_INDEX.bits(),
            IncompatFeatures::FILETYPE.bits(),
            RoCompatFeatures::SPARSE_SUPER.bits() | RoCompatFeatures::LARGE_FILE.bits(),
        ),
        FsProfile::Ext4 => (
            CompatFeatures::EXT_ATTR.bits()
                | CompatFeatures::HAS_JOURNAL.bits()
                | CompatFeatures::DIR_INDEX.bits(),
            IncompatFeatures::FILETYPE.bits()
                | IncompatFeatures::EXTENTS.bits()
                | IncompatFeatures::BITS64.bits(),
            RoCompatFeatures::SPARSE_SUPER.bits()
                | RoCompatFeatures::LARGE_FILE.bits()
                | RoCompatFeatures::HUGE_FILE.bits()
                | RoCompatFeatures::DIR_NLINK.bits()
                | RoCompatFeatures::EXTRA_ISIZE.bits()
                | RoCompatFeatures::METADATA_CSUM.bits(),
        ),
    };
    incompat &= INCOMPAT_SUPPORTED;
    ro_compat &= RO_COMPAT_SUPPORTED;
    if opts.inode_size == 128 {
        ro_compat &= !RoCompatFeatures::EXTRA_ISIZE.bits();
    }
    let has_journal = compat & CompatFeatures::HAS_JOURNAL.bits() != 0;
    let desc_size = if incompat & IncompatFeatures::BITS64.bits() != 0 { 64 } else { 32 };

    /* geometry */
    let first_data_block = if bsize == 1024 { 1 } else { 0 };
    let blocks_per_group = (8 * bsize) as u32;
    let group_count =
        num::integer::div_ceil(blocks_count - first_data_block, blocks_per_group as u64) as u32;
    let want_inodes = num::integer::div_ceil(blocks_count * bsize, MKFS_INODE_RATIO);
    let inodes_per_group = {
        let per = num::integer::div_ceil(want_inodes, group_count as u64);
        let per = ((per + 7) & !7).max(16);
        per.min(8 * bsize) as u32
    };
    let itable_blocks = num::integer::div_ceil(
        inodes_per_group as u64 * opts.inode_size as u64,
        bsize,
    );
    let gdt_blocks = num::integer::div_ceil(group_count as u64 * desc_size as u64, bsize);
    let layout = Layout {
        bsize,
        blocks_count,
        first_data_block,
        blocks_per_group,
        inodes_per_group,
        group_count,
        gdt_blocks,
        itable_blocks,
        desc_size,
    };
    info!(
        "mkfs {:?}: {} blocks of {}, {} groups, {} inodes/group",
        opts.profile, blocks_count, bsize, group_count, inodes_per_group
    );

    /* superblock skeleton (finished after allocation) */
    let mut sb = Ext4Superblock::new_zeroed();
    sb.s_magic.set(EXT4_SUPER_MAGIC);
    sb.s_inodes_count.set(inodes_per_group * group_count);
    sb.set_blocks_count(blocks_count);
    sb.s_first_data_block.set(first_data_block as u32);
    sb.s_log_block_size.set(bsize.trailing_zeros() - 10);
    sb.s_log_cluster_size.set(bsize.trailing_zeros() - 10);
    sb.s_blocks_per_group.set(blocks_per_group);
    sb.s_clusters_per_group.set(blocks_per_group);
    sb.s_inodes_per_group.set(inodes_per_group);
    sb.s_max_mnt_count.set(0xFFFF);
    sb.s_state.set(EXT4_VALID_FS);
    sb.s_errors.set(EXT4_ERRORS_CONTINUE);
    sb.s_rev_level.set(1);
    sb.s_first_ino.set(EXT4_GOOD_OLD_FIRST_INO);
    sb.s_inode_size.set(opts.inode_size);
    sb.s_feature_compat.set(compat);
    sb.s_feature_incompat.set(incompat);
    sb.s_feature_ro_compat.set(ro_compat);
    sb.s_desc_size.set(if desc_size == 64 { 64 } else { 0 });
    let mut rng = rand::thread_rng();
    sb.s_uuid = opts.uuid.unwrap_or_else(|| rng.gen());
    let label = opts.label.as_bytes();
    let n = label.len().min(EXT4_LABEL_LEN);
    sb.s_volume_name[..n].copy_from_slice(&label[..n]);
    for w in sb.s_hash_seed.iter_mut() {
        w.set(rng.gen());
    }
    sb.s_def_hash_version = crate::dir_hash::DX_HASH_HALF_MD4;
    sb.s_flags.set(EXT4_FLAGS_UNSIGNED_HASH);
    sb.s_mkfs_time.set(crate::now_epoch());
    if opts.inode_size > 128 {
        sb.s_min_extra_isize.set(32);
        sb.s_want_extra_isize.set(32);
    }
    if ro_compat & RoCompatFeatures::METADATA_CSUM.bits() != 0 {
        sb.s_checksum_type = EXT4_CRC32C_CHKSUM;
    }
    if has_journal {
        sb.s_journal_inum.set(EXT4_JOURNAL_INO);
    }

    /* in-memory block bitmaps; metadata marked as it is placed */
    let mut bitmaps: Vec<Vec<u8>> = (0..group_count).map(|_| vec![0u8; bsize as usize]).collect();
    let mut block_bitmap_at = vec![0u64; group_count as usize];
    let mut inode_bitmap_at = vec![0u64; group_count as usize];
    let mut itable_at = vec![0u64; group_count as usize];

    for g in 0..group_count {
        let in_group = layout.blocks_in_group(g);
        let bm = &mut bitmaps[g as usize];
        // tail bits past the end of a short group read as used
        for bit in in_group..blocks_per_group {
            bit_set(bm, bit);
        }
        let mut cursor = 0u32;
        if sb.group_has_super(g) {
            // superblock copy + descriptor table
            for _ in 0..1 + gdt_blocks {
                bit_set(bm, cursor);
                cursor += 1;
            }
        }
        block_bitmap_at[g as usize] = layout.group_first(g) + cursor as u64;
        bit_set(bm, cursor);
        cursor += 1;
        inode_bitmap_at[g as usize] = layout.group_first(g) + cursor as u64;
        bit_set(bm, cursor);
        cursor += 1;
        itable_at[g as usize] = layout.group_first(g) + cursor as u64;
        for _ in 0..itable_blocks {
            bit_set(bm, cursor);
            cursor += 1;
        }
        if cursor >= in_group {
            error!("group {} cannot hold its own metadata", g);
            return Err(Ext4Error::NoSpace);
        }
    }

    /* contiguous allocator over the in-memory bitmaps */
    let alloc_contig = |bitmaps: &mut Vec<Vec<u8>>, n: u32| -> Result<u64> {
        for g in 0..group_count {
            let bm = &mut bitmaps[g as usize];
            let limit = layout.blocks_in_group(g);
            let mut bit = 0u32;
            'scan: while bit + n <= limit {
                let Some(start) = find_clear(bm, bit, limit) else {
                    break;
                };
                for b in start..start + n {
                    if b >= limit {
                        break 'scan;
                    }
                    if bm[(b >> 3) as usize] & (1 << (b & 7)) != 0 {
                        bit = b + 1;
                        continue 'scan;
                    }
                }
                for b in start..start + n {
                    bit_set(bm, b);
                }
                return Ok(layout.group_first(g) + start as u64);
            }
        }
        Err(Ext4Error::NoSpace)
    };

    /* data placement: root block, lost+found block, journal run */
    let root_block = alloc_contig(&mut bitmaps, 1)?;
    let lost_found_block = alloc_contig(&mut bitmaps, 1)?;
    let journal_blocks = if has_journal {
        if opts.journal_blocks != 0 {
            opts.journal_blocks
        } else {
            (blocks_count / 64).clamp(256, 4096) as u32
        }
    } else {
        0
    };
    // an indirect-mapped journal needs its indirection blocks too
    let ptrs = (bsize / 4) as u32;
    let use_extents = incompat & IncompatFeatures::EXTENTS.bits() != 0;
    let journal_meta = if journal_blocks == 0 || use_extents {
        0
    } else if journal_blocks <= 12 {
        0
    } else if journal_blocks <= 12 + ptrs {
        1
    } else {
        // double indirect: the dind block plus one ind per pointer page
        2 + num::integer::div_ceil(journal_blocks - 12 - ptrs, ptrs)
    };
    let journal_start = if journal_blocks > 0 {
        alloc_contig(&mut bitmaps, journal_meta + journal_blocks)?
    } else {
        0
    };

    /* counts */
    let mut free_blocks_total = 0u64;
    let mut group_free_blocks = vec![0u32; group_count as usize];
    for g in 0..group_count {
        let free = count_clear(&bitmaps[g as usize], blocks_per_group);
        group_free_blocks[g as usize] = free;
        free_blocks_total += free as u64;
    }
    sb.set_free_blocks_count(free_blocks_total);
    let reserved_inodes = EXT4_GOOD_OLD_FIRST_INO; // inodes 1..=11
    sb.s_free_inodes_count
        .set(inodes_per_group * group_count - reserved_inodes);

    /* group descriptor table */
    let mut gdt = vec![0u8; (gdt_blocks * bsize) as usize];
    for g in 0..group_count {
        let mut desc = Ext4GroupDesc::new_zeroed();
        desc.set_block_bitmap(&sb, block_bitmap_at[g as usize]);
        desc.set_inode_bitmap(&sb, inode_bitmap_at[g as usize]);
        desc.set_inode_table(&sb, itable_at[g as usize]);
        desc.set_free_blocks_count(&sb, group_free_blocks[g as usize]);
        let free_inodes = if g == 0 {
            inodes_per_group - reserved_inodes
        } else {
            inodes_per_group
        };
        desc.set_free_inodes_count(&sb, free_inodes);
        desc.set_used_dirs_count(&sb, if g == 0 { 2 } else { 0 });
        desc.set_itable_unused(&sb, free_inodes);
        desc.set_flag(EXT4_BG_INODE_ZEROED);

        // inode bitmap image for this group
        let mut ibm = vec![0u8; bsize as usize];
        for bit in inodes_per_group..(8 * bsize) as u32 {
            bit_set(&mut ibm, bit);
        }
        if g == 0 {
            for bit in 0..reserved_inodes {
                bit_set(&mut ibm, bit);
            }
        }
        desc.set_inode_bitmap_csum(&sb, &ibm);
        desc.set_block_bitmap_csum(&sb, &bitmaps[g as usize]);
        desc.refresh_checksum(&sb, g);
        bdev.write_block(inode_bitmap_at[g as usize], 1, &ibm)?;

        let off = g as usize * desc_size;
        gdt[off..off + desc_size].copy_from_slice(&desc.as_bytes()[..desc_size]);
    }

    /* write bitmaps, zero inode tables */
    let zero_block = vec![0u8; bsize as usize];
    for g in 0..group_count {
        bdev.write_block(block_bitmap_at[g as usize], 1, &bitmaps[g as usize])?;
        for i in 0..itable_blocks {
            bdev.write_block(itable_at[g as usize] + i, 1, &zero_block)?;
        }
    }

    /* directory blocks for / and /lost+found */
    let csum_tails = ro_compat & RoCompatFeatures::METADATA_CSUM.bits() != 0;
    let usable = bsize as usize - if csum_tails { EXT4_DIR_TAIL_LEN } else { 0 };
    let dir_ft = Ext4FileType::Directory.dirent_type();
    let seed = sb.csum_seed();
    let write_dir_block = |bdev: &mut Bdev,
                               block: u64,
                               ino: u32,
                               entries: &[(&[u8], u32)]|
     -> Result<()> {
        let mut data = vec![0u8; bsize as usize];
        let mut off = 0usize;
        for (i, (name, target)) in entries.iter().enumerate() {
            let rec = if i == entries.len() - 1 {
                usable - off
            } else {
                dirent_size(name.len())
            };
            de_write(&mut data, off, *target, rec, name, dir_ft);
            off += rec;
        }
        if csum_tails {
            let tail = bsize as usize - EXT4_DIR_TAIL_LEN;
            put_le32(&mut data, tail, 0);
            put_le16(&mut data, tail + 4, EXT4_DIR_TAIL_LEN as u16);
            data[tail + 6] = 0;
            data[tail + 7] = EXT4_DIR_CSUM_FT;
            let c = crc32c(crc32c(seed, &ino.to_le_bytes()), &0u32.to_le_bytes());
            let c = crc32c(c, &data[..tail]);
            put_le32(&mut data, tail + 8, c);
        }
        Ok(bdev.write_block(block, 1, &data)?)
    };
    write_dir_block(
        bdev,
        root_block,
        EXT4_ROOT_INO,
        &[
            (b".", EXT4_ROOT_INO),
            (b"..", EXT4_ROOT_INO),
            (b"lost+found", EXT4_LOST_FOUND_INO),
        ],
    )?;
    write_dir_block(
        bdev,
        lost_found_block,
        EXT4_LOST_FOUND_INO,
        &[(b".", EXT4_LOST_FOUND_INO), (b"..", EXT4_ROOT_INO)],
    )?;

    /* inode bodies */
    let write_inode = |bdev: &mut Bdev, ino: u32, inode: &Ext4Inode| -> Result<()> {
        let g = (ino - 1) / inodes_per_group;
        let index = ((ino - 1) % inodes_per_group) as u64;
        let byte = index * opts.inode_size as u64;
        let lba = itable_at[g as usize] + byte / bsize;
        let off = (byte % bsize) as usize;
        let mut block = vec![0u8; bsize as usize];
        bdev.read_block(lba, 1, &mut block)?;
        let take = (opts.inode_size as usize).min(inode.as_bytes().len());
        block[off..off + take].copy_from_slice(&inode.as_bytes()[..take]);
        raw_inode_set_csum(&sb, ino, &mut block[off..off + opts.inode_size as usize]);
        Ok(bdev.write_block(lba, 1, &block)?)
    };

    let now = crate::now_epoch();
    let new_inode = |ftype: Ext4FileType, perm: u16, links: u16| {
        let mut inode = Ext4Inode::new_zeroed();
        inode.set_file_type(ftype, perm);
        inode.set_links_count(links);
        inode.i_atime.set(now);
        inode.i_ctime.set(now);
        inode.i_mtime.set(now);
        if opts.inode_size > 128 {
            inode.i_extra_isize.set(32);
        }
        inode
    };

    let spb = (bsize / 512) as u64;
    let mut root = new_inode(Ext4FileType::Directory, 0o755, 3);
    root.set_size(bsize);
    root.set_block_ptr(0, root_block as u32);
    root.set_blocks_count(&sb, spb)?;
    write_inode(bdev, EXT4_ROOT_INO, &root)?;

    let mut lf = new_inode(Ext4FileType::Directory, 0o700, 2);
    lf.set_size(bsize);
    lf.set_block_ptr(0, lost_found_block as u32);
    lf.set_blocks_count(&sb, spb)?;
    write_inode(bdev, EXT4_LOST_FOUND_INO, &lf)?;

    // remaining reserved inodes exist but stay zero on disk

    /* journal file */
    if journal_blocks > 0 {
        let data_start = journal_start + journal_meta as u64;
        let mut journal = new_inode(Ext4FileType::RegularFile, 0o600, 1);
        journal.set_size(journal_blocks as u64 * bsize);
        journal
            .set_blocks_count(&sb, (journal_meta + journal_blocks) as u64 * spb)?;
        if use_extents {
            journal.set_flag(InodeFlags::EXTENTS);
            // root header + one extent covering the whole run
            let b = &mut journal.i_block;
            put_le16(b, 0, crate::extent::EXT4_EXT_MAGIC);
            put_le16(b, 2, 1); // entries
            put_le16(b, 4, 4); // max
            put_le16(b, 6, 0); // depth
            put_le32(b, 8, 0);
            put_le32(b, 12, 0); // first logical block
            put_le16(b, 16, journal_blocks as u16);
            put_le16(b, 18, (data_start >> 32) as u16);
            put_le32(b, 20, data_start as u32);
        } else {
            // direct + indirect chain over the contiguous run
            for i in 0..journal_blocks.min(12) {
                journal.set_block_ptr(i as usize, (data_start + i as u64) as u32);
            }
            if journal_blocks > 12 {
                let ind = journal_start;
                journal.set_block_ptr(EXT4_IND_BLOCK, ind as u32);
                let mut blk = vec![0u8; bsize as usize];
                for i in 0..(journal_blocks - 12).min(ptrs) {
                    put_le32(&mut blk, i as usize * 4, (data_start + 12 + i as u64) as u32);
                }
                bdev.write_block(ind, 1, &blk)?;
            }
            if journal_blocks > 12 + ptrs {
                let dind = journal_start + 1;
                journal.set_block_ptr(EXT4_IND_BLOCK + 1, dind as u32);
                let pages = num::integer::div_ceil(journal_blocks - 12 - ptrs, ptrs);
                let mut dblk = vec![0u8; bsize as usize];
                for p in 0..pages {
                    let ind = journal_start + 2 + p as u64;
                    put_le32(&mut dblk, p as usize * 4, ind as u32);
                    let mut blk = vec![0u8; bsize as usize];
                    let base = 12 + ptrs + p * ptrs;
                    for i in 0..(journal_blocks - base).min(ptrs) {
                        put_le32(&mut blk, i as usize * 4, (data_start + base as u64 + i as u64) as u32);
                    }
                    bdev.write_block(ind, 1, &blk)?;
                }
                bdev.write_block(dind, 1, &dblk)?;
            }
        }
        write_inode(bdev, EXT4_JOURNAL_INO, &journal)?;

        // back the journal inode's mapping up into the superblock
        sb.s_jnl_backup_type = 1; // block-array backup
        for i in 0..15 {
            sb.s_jnl_blocks[i].set(journal.block_ptr(i));
        }
        sb.s_jnl_blocks[15].set(journal.i_size_high.get());
        sb.s_jnl_blocks[16].set(journal.i_size_lo.get());

        // journal superblock + zeroed log
        let mut jsb = JournalSuperblock::new_zeroed();
        jsb.h_magic.set(JBD2_MAGIC);
        jsb.h_blocktype.set(JBD2_SUPERBLOCK_V2);
        jsb.s_blocksize.set(bsize as u32);
        jsb.s_maxlen.set(journal_blocks);
        jsb.s_first.set(1);
        jsb.s_sequence.set(1);
        jsb.s_start.set(0);
        jsb.s_nr_users.set(1);
        jsb.s_uuid = rng.gen();
        sb.s_journal_uuid = jsb.s_uuid;
        let mut jsb_block = vec![0u8; bsize as usize];
        jsb_block[..jsb.as_bytes().len()].copy_from_slice(jsb.as_bytes());
        bdev.write_block(data_start, 1, &jsb_block)?;
        for i in 1..journal_blocks as u64 {
            bdev.write_block(data_start + i, 1, &zero_block)?;
        }
    }

    /* superblock + descriptor copies */
    sb.refresh_checksum();
    for g in 0..group_count {
        if !sb.group_has_super(g) {
            continue;
        }
        let base = layout.group_first(g);
        if g == 0 {
            bdev.write_bytes(EXT4_SUPERBLOCK_OFFSET, sb.as_bytes())?;
        } else {
            let mut copy = sb.clone();
            copy.s_block_group_nr.set(g as u16);
            copy.refresh_checksum();
            let mut block = vec![0u8; bsize as usize];
            block[..copy.as_bytes().len().min(bsize as usize)]
                .copy_from_slice(&copy.as_bytes()[..1024.min(bsize as usize)]);
            bdev.write_block(base, 1, &block)?;
        }
        for i in 0..gdt_blocks {
            let off = (i * bsize) as usize;
            bdev.write_block(base + 1 + i, 1, &gdt[off..off + bsize as usize])?;
        }
    }
    info!("mkfs done: {} free blocks", free_blocks_total);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Ext4Fs;
    use block_dev::memory::MemDev;

    fn device(mb: usize) -> Bdev {
        Bdev::new(Box::new(MemDev::new(mb * 1024 * 1024)))
    }

    #[test]
    fn ext4_mounts_and_counts_cohere() {
        let mut bdev = device(16);
        mkfs(
            &mut bdev,
            &MkfsOpts { profile: FsProfile::Ext4, block_size: 1024, ..Default::default() },
        )
        .unwrap();
        let mut fs = Ext4Fs::mount(bdev, false).unwrap();
        fs.check_root().unwrap();
        let mut group_free = 0u64;
        let mut group_free_inodes = 0u64;
        for g in 0..fs.sb.group_count() {
            let gref = fs.group_get(g).unwrap();
            group_free += gref.desc.free_blocks_count(&fs.sb) as u64;
            group_free_inodes += gref.desc.free_inodes_count(&fs.sb) as u64;
            fs.group_put(gref).unwrap();
        }
        assert_eq!(group_free, fs.sb.free_blocks_count());
        assert_eq!(group_free_inodes, fs.sb.s_free_inodes_count.get() as u64);
        fs.umount().unwrap();
    }

    #[test]
    fn root_lists_lost_and_found() {
        let mut bdev = device(16);
        mkfs(
            &mut bdev,
            &MkfsOpts { profile: FsProfile::Ext4, block_size: 1024, ..Default::default() },
        )
        .unwrap();
        let mut fs = Ext4Fs::mount(bdev, false).unwrap();
        let root = fs.inode_get(EXT4_ROOT_INO).unwrap();
        let e = fs.dir_find(&root, b"lost+found").unwrap();
        assert_eq!(e.ino, EXT4_LOST_FOUND_INO);
        let lf = fs.inode_get(EXT4_LOST_FOUND_INO).unwrap();
        assert_eq!(fs.dir_find(&lf, b"..").unwrap().ino, EXT4_ROOT_INO);
        fs.inode_put(lf).unwrap();
        fs.inode_put(root).unwrap();
        fs.umount().unwrap();
    }

    #[test]
    fn all_three_profiles_format() {
        for profile in [FsProfile::Ext2, FsProfile::Ext3, FsProfile::Ext4] {
            let mut bdev = device(8);
            mkfs(
                &mut bdev,
                &MkfsOpts { profile, block_size: 1024, ..Default::default() },
            )
            .unwrap();
            let mut fs = Ext4Fs::mount(bdev, false).unwrap();
            fs.check_root().unwrap();
            assert_eq!(
                fs.sb.compat().contains(crate::sb::CompatFeatures::HAS_JOURNAL),
                profile != FsProfile::Ext2
            );
            fs.umount().unwrap();
        }
    }

    #[test]
    fn journal_file_is_mapped_and_valid() {
        let mut bdev = device(16);
        mkfs(
            &mut bdev,
            &MkfsOpts { profile: FsProfile::Ext3, block_size: 1024, ..Default::default() },
        )
        .unwrap();
        let mut fs = Ext4Fs::mount(bdev, false).unwrap();
        fs.journal_start().unwrap();
        fs.journal_stop().unwrap();
        fs.umount().unwrap();
    }

    #[test]
    fn larger_block_sizes_format() {
        let mut bdev = device(64);
        mkfs(
            &mut bdev,
            &MkfsOpts { profile: FsProfile::Ext4, block_size: 4096, ..Default::default() },
        )
        .unwrap();
        let mut fs = Ext4Fs::mount(bdev, false).unwrap();
        fs.check_root().unwrap();
        assert_eq!(fs.block_size(), 4096);
        fs.umount().unwrap();
    }

    #[test]
    fn too_small_device_is_rejected() {
        let mut bdev = device(0) /* zero MiB */;
        let err = mkfs(
            &mut bdev,
            &MkfsOpts { profile: FsProfile::Ext2, block_size: 1024, ..Default::default() },
        )
        .unwrap_err();
        assert_eq!(err, Ext4Error::InvalidArgument);
    }
}
