//! Superblock: the process-wide filesystem descriptor.
//!
//! Field layout follows the reference implementation; all integers are
//! little-endian on disk. The superblock itself always lives at byte
//! offset 1024 from the partition start, whatever the block size.

use bitflags::bitflags;
use log::*;
use zerocopy::{AsBytes, FromBytes, Unaligned};

use block_dev::Bdev;

use crate::crc::crc32c;
use crate::error::{Ext4Error, Result};
use crate::types::{Le16, Le32, Le64};

pub const EXT4_SUPERBLOCK_OFFSET: u64 = 1024;
pub const EXT4_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT4_SUPER_MAGIC: u16 = 0xEF53;

/* Special inode numbers */
pub const EXT4_BAD_INO: u32 = 1;
pub const EXT4_ROOT_INO: u32 = 2;
pub const EXT4_BOOT_LOADER_INO: u32 = 5;
pub const EXT4_UNDEL_DIR_INO: u32 = 6;
pub const EXT4_RESIZE_INO: u32 = 7;
pub const EXT4_JOURNAL_INO: u32 = 8;
pub const EXT4_GOOD_OLD_FIRST_INO: u32 = 11;

pub const EXT4_GOOD_OLD_INODE_SIZE: u16 = 128;
pub const EXT4_LABEL_LEN: usize = 16;

/* Filesystem states */
pub const EXT4_VALID_FS: u16 = 0x0001;
pub const EXT4_ERROR_FS: u16 = 0x0002;

/* Misc superblock flags */
pub const EXT4_FLAGS_SIGNED_HASH: u32 = 0x0001;
pub const EXT4_FLAGS_UNSIGNED_HASH: u32 = 0x0002;

/* Behaviour when detecting errors */
pub const EXT4_ERRORS_CONTINUE: u16 = 1;

pub const EXT4_CRC32C_CHKSUM: u8 = 1;

bitflags! {
    pub struct CompatFeatures: u32 {
        const DIR_PREALLOC  = 0x0001;
        const IMAGIC_INODES = 0x0002;
        const HAS_JOURNAL   = 0x0004;
        const EXT_ATTR      = 0x0008;
        const RESIZE_INODE  = 0x0010;
        const DIR_INDEX     = 0x0020;
        const SPARSE_SUPER2 = 0x0200;
    }
}

bitflags! {
    pub struct IncompatFeatures: u32 {
        const COMPRESSION = 0x0001;
        const FILETYPE    = 0x0002;
        const RECOVER     = 0x0004;
        const JOURNAL_DEV = 0x0008;
        const META_BG     = 0x0010;
        const EXTENTS     = 0x0040;
        const BITS64      = 0x0080;
        const MMP         = 0x0100;
        const FLEX_BG     = 0x0200;
        const EA_INODE    = 0x0400;
        const DIRDATA     = 0x1000;
        const CSUM_SEED   = 0x2000;
        const LARGEDIR    = 0x4000;
        const INLINE_DATA = 0x8000;
        const ENCRYPT     = 0x10000;
        const CASEFOLD    = 0x20000;
    }
}

bitflags! {
    pub struct RoCompatFeatures: u32 {
        const SPARSE_SUPER  = 0x0001;
        const LARGE_FILE    = 0x0002;
        const HUGE_FILE     = 0x0008;
        const GDT_CSUM      = 0x0010;
        const DIR_NLINK     = 0x0020;
        const EXTRA_ISIZE   = 0x0040;
        const QUOTA         = 0x0100;
        const BIGALLOC      = 0x0200;
        const METADATA_CSUM = 0x0400;
        const READONLY      = 0x1000;
        const PROJECT       = 0x2000;
    }
}

/// Incompatible features this engine can mount at all.
pub const INCOMPAT_SUPPORTED: u32 = IncompatFeatures::FILETYPE.bits()
    | IncompatFeatures::RECOVER.bits()
    | IncompatFeatures::EXTENTS.bits()
    | IncompatFeatures::BITS64.bits()
    | IncompatFeatures::FLEX_BG.bits()
    | IncompatFeatures::CSUM_SEED.bits();

/// Read-only-compatible features this engine can mount read-write.
pub const RO_COMPAT_SUPPORTED: u32 = RoCompatFeatures::SPARSE_SUPER.bits()
    | RoCompatFeatures::LARGE_FILE.bits()
    | RoCompatFeatures::HUGE_FILE.bits()
    | RoCompatFeatures::GDT_CSUM.bits()
    | RoCompatFeatures::DIR_NLINK.bits()
    | RoCompatFeatures::EXTRA_ISIZE.bits()
    | RoCompatFeatures::METADATA_CSUM.bits();

/// The full 1024-byte superblock record.
#[derive(FromBytes, AsBytes, Unaligned, Clone)]
#[repr(C)]
pub struct Ext4Superblock {
    /*000*/ pub s_inodes_count: Le32,
    pub s_blocks_count_lo: Le32,
    pub s_r_blocks_count_lo: Le32,
    pub s_free_blocks_count_lo: Le32,
    /*010*/ pub s_free_inodes_count: Le32,
    pub s_first_data_block: Le32,
    pub s_log_block_size: Le32,
    pub s_log_cluster_size: Le32,
    /*020*/ pub s_blocks_per_group: Le32,
    pub s_clusters_per_group: Le32,
    pub s_inodes_per_group: Le32,
    pub s_mtime: Le32,
    /*030*/ pub s_wtime: Le32,
    pub s_mnt_count: Le16,
    pub s_max_mnt_count: Le16,
    pub s_magic: Le16,
    pub s_state: Le16,
    pub s_errors: Le16,
    pub s_minor_rev_level: Le16,
    /*040*/ pub s_lastcheck: Le32,
    pub s_checkinterval: Le32,
    pub s_creator_os: Le32,
    pub s_rev_level: Le32,
    /*050*/ pub s_def_resuid: Le16,
    pub s_def_resgid: Le16,
    pub s_first_ino: Le32,
    pub s_inode_size: Le16,
    pub s_block_group_nr: Le16,
    pub s_feature_compat: Le32,
    /*060*/ pub s_feature_incompat: Le32,
    pub s_feature_ro_compat: Le32,
    /*068*/ pub s_uuid: [u8; 16],
    /*078*/ pub s_volume_name: [u8; EXT4_LABEL_LEN],
    /*088*/ pub s_last_mounted: [u8; 64],
    /*0c8*/ pub s_algorithm_usage_bitmap: Le32,
    pub s_prealloc_blocks: u8,
    pub s_prealloc_dir_blocks: u8,
    pub s_reserved_gdt_blocks: Le16,
    /*0d0*/ pub s_journal_uuid: [u8; 16],
    /*0e0*/ pub s_journal_inum: Le32,
    pub s_journal_dev: Le32,
    pub s_last_orphan: Le32,
    /*0ec*/ pub s_hash_seed: [Le32; 4],
    /*0fc*/ pub s_def_hash_version: u8,
    pub s_jnl_backup_type: u8,
    pub s_desc_size: Le16,
    /*100*/ pub s_default_mount_opts: Le32,
    pub s_first_meta_bg: Le32,
    pub s_mkfs_time: Le32,
    /*10c*/ pub s_jnl_blocks: [Le32; 17],
    /*150*/ pub s_blocks_count_hi: Le32,
    pub s_r_blocks_count_hi: Le32,
    pub s_free_blocks_count_hi: Le32,
    pub s_min_extra_isize: Le16,
    pub s_want_extra_isize: Le16,
    /*160*/ pub s_flags: Le32,
    pub s_raid_stride: Le16,
    pub s_mmp_update_interval: Le16,
    pub s_mmp_block: Le64,
    /*170*/ pub s_raid_stripe_width: Le32,
    pub s_log_groups_per_flex: u8,
    pub s_checksum_type: u8,
    pub s_encryption_level: u8,
    pub s_reserved_pad: u8,
    pub s_kbytes_written: Le64,
    /*180*/ pub s_snapshot_inum: Le32,
    pub s_snapshot_id: Le32,
    pub s_snapshot_r_blocks_count: Le64,
    /*190*/ pub s_snapshot_list: Le32,
    pub s_error_count: Le32,
    pub s_first_error_time: Le32,
    pub s_first_error_ino: Le32,
    /*1a0*/ pub s_first_error_block: Le64,
    pub s_first_error_func: [u8; 32],
    /*1c8*/ pub s_first_error_line: Le32,
    pub s_last_error_time: Le32,
    /*1d0*/ pub s_last_error_ino: Le32,
    pub s_last_error_line: Le32,
    pub s_last_error_block: Le64,
    /*1e0*/ pub s_last_error_func: [u8; 32],
    /*200*/ pub s_mount_opts: [u8; 64],
    /*240*/ pub s_usr_quota_inum: Le32,
    pub s_grp_quota_inum: Le32,
    pub s_overhead_clusters: Le32,
    /*24c*/ pub s_backup_bgs: [Le32; 2],
    /*254*/ pub s_encrypt_algos: [u8; 4],
    /*258*/ pub s_encrypt_pw_salt: [u8; 16],
    /*268*/ pub s_lpf_ino: Le32,
    pub s_prj_quota_inum: Le32,
    /*270*/ pub s_checksum_seed: Le32,
    /*274*/ pub s_wtime_hi: u8,
    pub s_mtime_hi: u8,
    pub s_mkfs_time_hi: u8,
    pub s_lastcheck_hi: u8,
    pub s_first_error_time_hi: u8,
    pub s_last_error_time_hi: u8,
    pub s_first_error_errcode: u8,
    pub s_last_error_errcode: u8,
    /*27c*/ pub s_encoding: Le16,
    pub s_encoding_flags: Le16,
    pub s_reserved: [Le32; 95],
    /*3fc*/ pub s_checksum: Le32,
}

impl Ext4Superblock {
    pub fn magic_matched(&self) -> bool {
        self.s_magic.get() == EXT4_SUPER_MAGIC
    }

    pub fn block_size(&self) -> u32 {
        1024u32 << self.s_log_block_size.get()
    }

    pub fn compat(&self) -> CompatFeatures {
        CompatFeatures::from_bits_truncate(self.s_feature_compat.get())
    }

    pub fn incompat(&self) -> IncompatFeatures {
        IncompatFeatures::from_bits_truncate(self.s_feature_incompat.get())
    }

    pub fn ro_compat(&self) -> RoCompatFeatures {
        RoCompatFeatures::from_bits_truncate(self.s_feature_ro_compat.get())
    }

    pub fn has_metadata_csum(&self) -> bool {
        self.ro_compat().contains(RoCompatFeatures::METADATA_CSUM)
    }

    pub fn is_64bit(&self) -> bool {
        self.incompat().contains(IncompatFeatures::BITS64)
    }

    /// Group descriptor size: 32 bytes for ext2/3, `s_desc_size`
    /// (usually 64) when the 64-bit feature is on.
    pub fn desc_size(&self) -> usize {
        if self.is_64bit() {
            (self.s_desc_size.get() as usize).max(64)
        } else {
            32
        }
    }

    pub fn blocks_count(&self) -> u64 {
        self.s_blocks_count_lo.get() as u64 | ((self.s_blocks_count_hi.get() as u64) << 32)
    }

    pub fn set_blocks_count(&mut self, cnt: u64) {
        self.s_blocks_count_lo.set(cnt as u32);
        self.s_blocks_count_hi.set((cnt >> 32) as u32);
    }

    pub fn free_blocks_count(&self) -> u64 {
        self.s_free_blocks_count_lo.get() as u64
            | ((self.s_free_blocks_count_hi.get() as u64) << 32)
    }

    pub fn set_free_blocks_count(&mut self, cnt: u64) {
        self.s_free_blocks_count_lo.set(cnt as u32);
        self.s_free_blocks_count_hi.set((cnt >> 32) as u32);
    }

    pub fn group_count(&self) -> u32 {
        let bpg = self.s_blocks_per_group.get() as u64;
        let data_blocks = self.blocks_count() - self.s_first_data_block.get() as u64;
        num::integer::div_ceil(data_blocks, bpg) as u32
    }

    pub fn inode_size(&self) -> u16 {
        if self.s_rev_level.get() == 0 {
            EXT4_GOOD_OLD_INODE_SIZE
        } else {
            self.s_inode_size.get()
        }
    }

    pub fn first_ino(&self) -> u32 {
        if self.s_rev_level.get() == 0 {
            EXT4_GOOD_OLD_FIRST_INO
        } else {
            self.s_first_ino.get()
        }
    }

    /// Block group holding filesystem block `block`.
    pub fn group_of_block(&self, block: u64) -> u32 {
        ((block - self.s_first_data_block.get() as u64) / self.s_blocks_per_group.get() as u64)
            as u32
    }

    /// Index of `block` within its group.
    pub fn block_in_group(&self, block: u64) -> u32 {
        ((block - self.s_first_data_block.get() as u64) % self.s_blocks_per_group.get() as u64)
            as u32
    }

    /// First filesystem block of group `group`.
    pub fn group_first_block(&self, group: u32) -> u64 {
        self.s_first_data_block.get() as u64
            + group as u64 * self.s_blocks_per_group.get() as u64
    }

    /// Number of blocks in group `group` (the last group may be short).
    pub fn blocks_in_group(&self, group: u32) -> u32 {
        let total = self.blocks_count();
        let first = self.group_first_block(group);
        let bpg = self.s_blocks_per_group.get() as u64;
        (total - first).min(bpg) as u32
    }

    /// Seed mixed into every metadata checksum: `crc32c(~0, uuid)`, or
    /// the precomputed `s_checksum_seed` when that feature is set.
    pub fn csum_seed(&self) -> u32 {
        if self.incompat().contains(IncompatFeatures::CSUM_SEED) {
            self.s_checksum_seed.get()
        } else {
            crc32c(!0, &self.s_uuid)
        }
    }

    fn compute_checksum(&self) -> u32 {
        crc32c(!0, &self.as_bytes()[..EXT4_SUPERBLOCK_SIZE - 4])
    }

    pub fn refresh_checksum(&mut self) {
        if self.has_metadata_csum() {
            let csum = self.compute_checksum();
            self.s_checksum.set(csum);
        }
    }

    pub fn verify_checksum(&self) -> bool {
        !self.has_metadata_csum() || self.s_checksum.get() == self.compute_checksum()
    }

    /// Does group `group` carry a superblock/descriptor-table copy?
    /// With `sparse_super`, only groups 0, 1 and powers of 3, 5, 7.
    pub fn group_has_super(&self, group: u32) -> bool {
        if !self.ro_compat().contains(RoCompatFeatures::SPARSE_SUPER) {
            return true;
        }
        if group <= 1 {
            return true;
        }
        for base in [3u32, 5, 7] {
            let mut p = base;
            while p < group {
                p = p.saturating_mul(base);
            }
            if p == group {
                return true;
            }
        }
        false
    }

    /// Read the primary superblock off a device.
    pub fn load(bdev: &mut Bdev) -> Result<Self> {
        let mut raw = [0u8; EXT4_SUPERBLOCK_SIZE];
        bdev.read_bytes(EXT4_SUPERBLOCK_OFFSET, &mut raw)?;
        let sb = Ext4Superblock::read_from(&raw[..]).ok_or(Ext4Error::Corrupted)?;
        if !sb.magic_matched() {
            warn!("no ext4 magic at superblock offset");
            return Err(Ext4Error::NotSupported);
        }
        if !sb.verify_checksum() {
            error!("superblock checksum mismatch");
            return Err(Ext4Error::Io);
        }
        Ok(sb)
    }

    /// Write the primary superblock back, refreshing its checksum.
    pub fn store(&mut self, bdev: &mut Bdev) -> Result<()> {
        self.refresh_checksum();
        bdev.write_bytes(EXT4_SUPERBLOCK_OFFSET, self.as_bytes())?;
        Ok(())
    }

    pub fn summary(&self) -> String {
        format!(
            "{} inodes, {} blocks ({} free), {} B/block, {} groups",
            self.s_inodes_count.get(),
            self.blocks_count(),
            self.free_blocks_count(),
            self.block_size(),
            self.group_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn layout_is_exact() {
        assert_eq!(size_of::<Ext4Superblock>(), EXT4_SUPERBLOCK_SIZE);
        // magic at offset 56 within the record
        let mut sb = Ext4Superblock::new_zeroed();
        sb.s_magic.set(EXT4_SUPER_MAGIC);
        let raw = sb.as_bytes();
        assert_eq!(u16::from_le_bytes([raw[56], raw[57]]), EXT4_SUPER_MAGIC);
    }

    #[test]
    fn sparse_super_placement() {
        let mut sb = Ext4Superblock::new_zeroed();
        sb.s_feature_ro_compat
            .set(RoCompatFeatures::SPARSE_SUPER.bits());
        let with: Vec<u32> = (0..60).filter(|g| sb.group_has_super(*g)).collect();
        assert_eq!(with, vec![0, 1, 3, 5, 7, 9, 25, 27, 49]);
    }

    #[test]
    fn checksum_roundtrip() {
        let mut sb = Ext4Superblock::new_zeroed();
        sb.s_magic.set(EXT4_SUPER_MAGIC);
        sb.s_feature_ro_compat
            .set(RoCompatFeatures::METADATA_CSUM.bits());
        sb.s_uuid = [7u8; 16];
        sb.refresh_checksum();
        assert!(sb.verify_checksum());
        sb.s_inodes_count.set(1234);
        assert!(!sb.verify_checksum());
    }

    #[test]
    fn split_counters() {
        let mut sb = Ext4Superblock::new_zeroed();
        sb.set_blocks_count(0x1_2345_6789);
        assert_eq!(sb.blocks_count(), 0x1_2345_6789);
        assert_eq!(sb.s_blocks_count_hi.get(), 1);
    }
}
