//! Block group descriptors and their checksums.
//!
//! Descriptors are 32 bytes on ext2/3 volumes and 64 bytes when the
//! 64-bit feature is active; the table starts in the block after the
//! superblock in every group that carries a copy.

use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::crc::{crc16, crc32c};
use crate::sb::{Ext4Superblock, RoCompatFeatures};
use crate::types::{Le16, Le32};

/* bg_flags */
pub const EXT4_BG_INODE_UNINIT: u16 = 0x0001;
pub const EXT4_BG_BLOCK_UNINIT: u16 = 0x0002;
pub const EXT4_BG_INODE_ZEROED: u16 = 0x0004;

pub const EXT4_MIN_DESC_SIZE: usize = 32;
pub const EXT4_MIN_DESC_SIZE_64BIT: usize = 64;

/// One block group descriptor, full 64-byte form. Only the first 32
/// bytes are read or written on volumes without the 64-bit feature.
#[derive(FromBytes, AsBytes, Unaligned, Clone)]
#[repr(C)]
pub struct Ext4GroupDesc {
    pub bg_block_bitmap_lo: Le32,
    pub bg_inode_bitmap_lo: Le32,
    pub bg_inode_table_lo: Le32,
    pub bg_free_blocks_count_lo: Le16,
    pub bg_free_inodes_count_lo: Le16,
    pub bg_used_dirs_count_lo: Le16,
    pub bg_flags: Le16,
    pub bg_exclude_bitmap_lo: Le32,
    pub bg_block_bitmap_csum_lo: Le16,
    pub bg_inode_bitmap_csum_lo: Le16,
    pub bg_itable_unused_lo: Le16,
    pub bg_checksum: Le16,
    /* 64-bit tail */
    pub bg_block_bitmap_hi: Le32,
    pub bg_inode_bitmap_hi: Le32,
    pub bg_inode_table_hi: Le32,
    pub bg_free_blocks_count_hi: Le16,
    pub bg_free_inodes_count_hi: Le16,
    pub bg_used_dirs_count_hi: Le16,
    pub bg_itable_unused_hi: Le16,
    pub bg_exclude_bitmap_hi: Le32,
    pub bg_block_bitmap_csum_hi: Le16,
    pub bg_inode_bitmap_csum_hi: Le16,
    pub bg_reserved: Le32,
}

impl Ext4GroupDesc {
    fn wide(&self, sb: &Ext4Superblock) -> bool {
        sb.desc_size() > EXT4_MIN_DESC_SIZE
    }

    pub fn block_bitmap(&self, sb: &Ext4Superblock) -> u64 {
        let mut v = self.bg_block_bitmap_lo.get() as u64;
        if self.wide(sb) {
            v |= (self.bg_block_bitmap_hi.get() as u64) << 32;
        }
        v
    }

    pub fn set_block_bitmap(&mut self, sb: &Ext4Superblock, block: u64) {
        self.bg_block_bitmap_lo.set(block as u32);
        if self.wide(sb) {
            self.bg_block_bitmap_hi.set((block >> 32) as u32);
        }
    }

    pub fn inode_bitmap(&self, sb: &Ext4Superblock) -> u64 {
        let mut v = self.bg_inode_bitmap_lo.get() as u64;
        if self.wide(sb) {
            v |= (self.bg_inode_bitmap_hi.get() as u64) << 32;
        }
        v
    }

    pub fn set_inode_bitmap(&mut self, sb: &Ext4Superblock, block: u64) {
        self.bg_inode_bitmap_lo.set(block as u32);
        if self.wide(sb) {
            self.bg_inode_bitmap_hi.set((block >> 32) as u32);
        }
    }

    pub fn inode_table(&self, sb: &Ext4Superblock) -> u64 {
        let mut v = self.bg_inode_table_lo.get() as u64;
        if self.wide(sb) {
            v |= (self.bg_inode_table_hi.get() as u64) << 32;
        }
        v
    }

    pub fn set_inode_table(&mut self, sb: &Ext4Superblock, block: u64) {
        self.bg_inode_table_lo.set(block as u32);
        if self.wide(sb) {
            self.bg_inode_table_hi.set((block >> 32) as u32);
        }
    }

    pub fn free_blocks_count(&self, sb: &Ext4Superblock) -> u32 {
        let mut v = self.bg_free_blocks_count_lo.get() as u32;
        if self.wide(sb) {
            v |= (self.bg_free_blocks_count_hi.get() as u32) << 16;
        }
        v
    }

    pub fn set_free_blocks_count(&mut self, sb: &Ext4Superblock, cnt: u32) {
        self.bg_free_blocks_count_lo.set(cnt as u16);
        if self.wide(sb) {
            self.bg_free_blocks_count_hi.set((cnt >> 16) as u16);
        }
    }

    pub fn free_inodes_count(&self, sb: &Ext4Superblock) -> u32 {
        let mut v = self.bg_free_inodes_count_lo.get() as u32;
        if self.wide(sb) {
            v |= (self.bg_free_inodes_count_hi.get() as u32) << 16;
        }
        v
    }

    pub fn set_free_inodes_count(&mut self, sb: &Ext4Superblock, cnt: u32) {
        self.bg_free_inodes_count_lo.set(cnt as u16);
        if self.wide(sb) {
            self.bg_free_inodes_count_hi.set((cnt >> 16) as u16);
        }
    }

    pub fn used_dirs_count(&self, sb: &Ext4Superblock) -> u32 {
        let mut v = self.bg_used_dirs_count_lo.get() as u32;
        if self.wide(sb) {
            v |= (self.bg_used_dirs_count_hi.get() as u32) << 16;
        }
        v
    }

    pub fn set_used_dirs_count(&mut self, sb: &Ext4Superblock, cnt: u32) {
        self.bg_used_dirs_count_lo.set(cnt as u16);
        if self.wide(sb) {
            self.bg_used_dirs_count_hi.set((cnt >> 16) as u16);
        }
    }

    pub fn itable_unused(&self, sb: &Ext4Superblock) -> u32 {
        let mut v = self.bg_itable_unused_lo.get() as u32;
        if self.wide(sb) {
            v |= (self.bg_itable_unused_hi.get() as u32) << 16;
        }
        v
    }

    pub fn set_itable_unused(&mut self, sb: &Ext4Superblock, cnt: u32) {
        self.bg_itable_unused_lo.set(cnt as u16);
        if self.wide(sb) {
            self.bg_itable_unused_hi.set((cnt >> 16) as u16);
        }
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.bg_flags.get() & flag != 0
    }

    pub fn set_flag(&mut self, flag: u16) {
        self.bg_flags.set(self.bg_flags.get() | flag);
    }

    pub fn clear_flag(&mut self, flag: u16) {
        self.bg_flags.set(self.bg_flags.get() & !flag);
    }

    /// Descriptor checksum: crc32c (METADATA_CSUM) or crc16 (GDT_CSUM),
    /// both over `uuid-seed + group number + descriptor` with the
    /// checksum field itself taken as zero.
    pub fn compute_checksum(&self, sb: &Ext4Superblock, group: u32) -> u16 {
        let desc_size = sb.desc_size();
        let mut scratch = self.clone();
        scratch.bg_checksum.set(0);
        let raw = &scratch.as_bytes()[..desc_size];
        if sb.has_metadata_csum() {
            let mut c = crc32c(sb.csum_seed(), &group.to_le_bytes());
            c = crc32c(c, raw);
            (c & 0xFFFF) as u16
        } else if sb.ro_compat().contains(RoCompatFeatures::GDT_CSUM) {
            let mut c = crc16(!0, &sb.s_uuid);
            c = crc16(c, &group.to_le_bytes());
            c = crc16(c, raw);
            c
        } else {
            0
        }
    }

    pub fn refresh_checksum(&mut self, sb: &Ext4Superblock, group: u32) {
        let csum = self.compute_checksum(sb, group);
        self.bg_checksum.set(csum);
    }

    pub fn verify_checksum(&self, sb: &Ext4Superblock, group: u32) -> bool {
        if !sb.has_metadata_csum() && !sb.ro_compat().contains(RoCompatFeatures::GDT_CSUM) {
            return true;
        }
        self.bg_checksum.get() == self.compute_checksum(sb, group)
    }

    /// Store the bitmap checksum (crc32c of the whole bitmap block)
    /// split across the lo/hi fields.
    pub fn set_block_bitmap_csum(&mut self, sb: &Ext4Superblock, bitmap: &[u8]) {
        if !sb.has_metadata_csum() {
            return;
        }
        let csum = crc32c(sb.csum_seed(), bitmap);
        self.bg_block_bitmap_csum_lo.set((csum & 0xFFFF) as u16);
        if sb.desc_size() >= EXT4_MIN_DESC_SIZE_64BIT {
            self.bg_block_bitmap_csum_hi.set((csum >> 16) as u16);
        }
    }

    pub fn verify_block_bitmap_csum(&self, sb: &Ext4Superblock, bitmap: &[u8]) -> bool {
        if !sb.has_metadata_csum() {
            return true;
        }
        let csum = crc32c(sb.csum_seed(), bitmap);
        if self.bg_block_bitmap_csum_lo.get() != (csum & 0xFFFF) as u16 {
            return false;
        }
        if sb.desc_size() >= EXT4_MIN_DESC_SIZE_64BIT
            && self.bg_block_bitmap_csum_hi.get() != (csum >> 16) as u16
        {
            return false;
        }
        true
    }

    pub fn set_inode_bitmap_csum(&mut self, sb: &Ext4Superblock, bitmap: &[u8]) {
        if !sb.has_metadata_csum() {
            return;
        }
        // only inodes_per_group bits participate
        let len = num::integer::div_ceil(sb.s_inodes_per_group.get(), 8) as usize;
        let csum = crc32c(sb.csum_seed(), &bitmap[..len]);
        self.bg_inode_bitmap_csum_lo.set((csum & 0xFFFF) as u16);
        if sb.desc_size() >= EXT4_MIN_DESC_SIZE_64BIT {
            self.bg_inode_bitmap_csum_hi.set((csum >> 16) as u16);
        }
    }

    pub fn verify_inode_bitmap_csum(&self, sb: &Ext4Superblock, bitmap: &[u8]) -> bool {
        if !sb.has_metadata_csum() {
            return true;
        }
        let len = num::integer::div_ceil(sb.s_inodes_per_group.get(), 8) as usize;
        let csum = crc32c(sb.csum_seed(), &bitmap[..len]);
        if self.bg_inode_bitmap_csum_lo.get() != (csum & 0xFFFF) as u16 {
            return false;
        }
        if sb.desc_size() >= EXT4_MIN_DESC_SIZE_64BIT
            && self.bg_inode_bitmap_csum_hi.get() != (csum >> 16) as u16
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sb::{IncompatFeatures, RoCompatFeatures};
    use std::mem::size_of;
    use zerocopy::FromBytes;

    fn sb_64bit_csum() -> Ext4Superblock {
        let mut sb = Ext4Superblock::new_zeroed();
        sb.s_feature_incompat.set(IncompatFeatures::BITS64.bits());
        sb.s_feature_ro_compat
            .set(RoCompatFeatures::METADATA_CSUM.bits());
        sb.s_desc_size.set(64);
        sb.s_inodes_per_group.set(1024);
        sb.s_uuid = [0x42; 16];
        sb
    }

    #[test]
    fn desc_is_64_bytes() {
        assert_eq!(size_of::<Ext4GroupDesc>(), EXT4_MIN_DESC_SIZE_64BIT);
    }

    #[test]
    fn split_fields_use_hi_half() {
        let sb = sb_64bit_csum();
        let mut desc = Ext4GroupDesc::new_zeroed();
        desc.set_free_blocks_count(&sb, 0x1_0005);
        assert_eq!(desc.bg_free_blocks_count_lo.get(), 5);
        assert_eq!(desc.bg_free_blocks_count_hi.get(), 1);
        assert_eq!(desc.free_blocks_count(&sb), 0x1_0005);
    }

    #[test]
    fn checksum_detects_change() {
        let sb = sb_64bit_csum();
        let mut desc = Ext4GroupDesc::new_zeroed();
        desc.set_block_bitmap(&sb, 260);
        desc.refresh_checksum(&sb, 3);
        assert!(desc.verify_checksum(&sb, 3));
        assert!(!desc.verify_checksum(&sb, 4));
        desc.set_free_inodes_count(&sb, 11);
        assert!(!desc.verify_checksum(&sb, 3));
    }

    #[test]
    fn bitmap_checksum_roundtrip() {
        let sb = sb_64bit_csum();
        let mut desc = Ext4GroupDesc::new_zeroed();
        let mut bitmap = vec![0u8; 1024];
        bitmap[0] = 0xFF;
        desc.set_block_bitmap_csum(&sb, &bitmap);
        assert!(desc.verify_block_bitmap_csum(&sb, &bitmap));
        bitmap[1] = 1;
        assert!(!desc.verify_block_bitmap_csum(&sb, &bitmap));
    }
}
