//! Inode record and the typed accessors over its split-field encodings.

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::crc::crc32c;
use crate::error::{Ext4Error, Result};
use crate::sb::{Ext4Superblock, RoCompatFeatures};
use crate::types::{get_le32, put_le32, Le16, Le32};

pub const EXT4_N_BLOCKS: usize = 15;
pub const EXT4_IND_BLOCK: usize = 12;
pub const EXT4_DIND_BLOCK: usize = 13;
pub const EXT4_TIND_BLOCK: usize = 14;

pub const EXT4_INODE_MODE_TYPE_MASK: u16 = 0xF000;

/// Longest symlink target stored inline in the block-pointer area.
pub const EXT4_INLINE_SYMLINK_MAX: usize = 59;

bitflags! {
    pub struct InodeFlags: u32 {
        const SECRM        = 0x0000_0001;
        const UNRM         = 0x0000_0002;
        const COMPR        = 0x0000_0004;
        const SYNC         = 0x0000_0008;
        const IMMUTABLE    = 0x0000_0010;
        const APPEND       = 0x0000_0020;
        const NODUMP       = 0x0000_0040;
        const NOATIME      = 0x0000_0080;
        const DIRTY        = 0x0000_0100;
        const COMPRBLK     = 0x0000_0200;
        const NOCOMPR      = 0x0000_0400;
        const ENCRYPT      = 0x0000_0800;
        const INDEX        = 0x0000_1000;
        const IMAGIC       = 0x0000_2000;
        const JOURNAL_DATA = 0x0000_4000;
        const NOTAIL       = 0x0000_8000;
        const DIRSYNC      = 0x0001_0000;
        const TOPDIR       = 0x0002_0000;
        const HUGE_FILE    = 0x0004_0000;
        const EXTENTS      = 0x0008_0000;
        const EA_INODE     = 0x0020_0000;
        const INLINE_DATA  = 0x1000_0000;
    }
}

/// High nibble of `i_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum Ext4FileType {
    Fifo = 0x1,
    CharDev = 0x2,
    Directory = 0x4,
    BlockDev = 0x6,
    RegularFile = 0x8,
    Symlink = 0xA,
    Socket = 0xC,
}

impl Ext4FileType {
    /// Directory-entry `file_type` code for this inode type.
    pub fn dirent_type(self) -> u8 {
        match self {
            Ext4FileType::RegularFile => 1,
            Ext4FileType::Directory => 2,
            Ext4FileType::CharDev => 3,
            Ext4FileType::BlockDev => 4,
            Ext4FileType::Fifo => 5,
            Ext4FileType::Socket => 6,
            Ext4FileType::Symlink => 7,
        }
    }
}

/// The inode body: the good-old 128 bytes plus the 32-byte extension
/// carrying checksum-hi and the extra timestamps.
#[derive(FromBytes, AsBytes, Unaligned, Clone)]
#[repr(C)]
pub struct Ext4Inode {
    /*00*/ pub i_mode: Le16,
    pub i_uid: Le16,
    pub i_size_lo: Le32,
    pub i_atime: Le32,
    pub i_ctime: Le32,
    /*10*/ pub i_mtime: Le32,
    pub i_dtime: Le32,
    pub i_gid: Le16,
    pub i_links_count: Le16,
    pub i_blocks_lo: Le32,
    /*20*/ pub i_flags: Le32,
    pub i_version: Le32,
    /*28*/ pub i_block: [u8; EXT4_N_BLOCKS * 4],
    /*64*/ pub i_generation: Le32,
    pub i_file_acl_lo: Le32,
    pub i_size_high: Le32,
    /*70*/ pub i_obso_faddr: Le32,
    pub i_blocks_high: Le16,
    pub i_file_acl_high: Le16,
    pub i_uid_high: Le16,
    pub i_gid_high: Le16,
    pub i_checksum_lo: Le16,
    pub i_reserved: Le16,
    /*80*/ pub i_extra_isize: Le16,
    pub i_checksum_hi: Le16,
    pub i_ctime_extra: Le32,
    pub i_mtime_extra: Le32,
    pub i_atime_extra: Le32,
    pub i_crtime: Le32,
    pub i_crtime_extra: Le32,
    pub i_version_hi: Le32,
    /*9c*/ pub i_projid: Le32,
}

pub const EXT4_INODE_STRUCT_SIZE: usize = 160;

impl Ext4Inode {
    pub fn file_type(&self) -> Result<Ext4FileType> {
        Ext4FileType::try_from((self.i_mode.get() & EXT4_INODE_MODE_TYPE_MASK) >> 12)
            .map_err(|_| Ext4Error::Corrupted)
    }

    pub fn is_type(&self, t: Ext4FileType) -> bool {
        self.file_type().map(|ft| ft == t).unwrap_or(false)
    }

    pub fn set_file_type(&mut self, t: Ext4FileType, perm: u16) {
        self.i_mode.set((u16::from(t) << 12) | (perm & 0x0FFF))
    }

    pub fn mode_perm(&self) -> u16 {
        self.i_mode.get() & 0x0FFF
    }

    pub fn set_mode_perm(&mut self, perm: u16) {
        let kept = self.i_mode.get() & EXT4_INODE_MODE_TYPE_MASK;
        self.i_mode.set(kept | (perm & 0x0FFF));
    }

    pub fn flags(&self) -> InodeFlags {
        InodeFlags::from_bits_truncate(self.i_flags.get())
    }

    pub fn has_flag(&self, flag: InodeFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn set_flag(&mut self, flag: InodeFlags) {
        self.i_flags.set(self.i_flags.get() | flag.bits());
    }

    pub fn clear_flag(&mut self, flag: InodeFlags) {
        self.i_flags.set(self.i_flags.get() & !flag.bits());
    }

    pub fn uid(&self) -> u32 {
        self.i_uid.get() as u32 | ((self.i_uid_high.get() as u32) << 16)
    }

    pub fn set_uid(&mut self, uid: u32) {
        self.i_uid.set(uid as u16);
        self.i_uid_high.set((uid >> 16) as u16);
    }

    pub fn gid(&self) -> u32 {
        self.i_gid.get() as u32 | ((self.i_gid_high.get() as u32) << 16)
    }

    pub fn set_gid(&mut self, gid: u32) {
        self.i_gid.set(gid as u16);
        self.i_gid_high.set((gid >> 16) as u16);
    }

    /// Byte size; the high half only counts for regular files (large
    /// directories are not supported here).
    pub fn size(&self) -> u64 {
        let lo = self.i_size_lo.get() as u64;
        if self.is_type(Ext4FileType::RegularFile) {
            lo | ((self.i_size_high.get() as u64) << 32)
        } else {
            lo
        }
    }

    pub fn set_size(&mut self, size: u64) {
        self.i_size_lo.set(size as u32);
        if self.is_type(Ext4FileType::RegularFile) {
            self.i_size_high.set((size >> 32) as u32);
        }
    }

    /// Block count in 512-byte units, decoding the `huge_file` form
    /// (where the stored count is in filesystem blocks).
    pub fn blocks_count(&self, sb: &Ext4Superblock) -> u64 {
        let raw = self.i_blocks_lo.get() as u64 | ((self.i_blocks_high.get() as u64) << 32);
        if sb.ro_compat().contains(RoCompatFeatures::HUGE_FILE) && self.has_flag(InodeFlags::HUGE_FILE)
        {
            raw << (sb.s_log_block_size.get() + 1)
        } else {
            raw
        }
    }

    pub fn set_blocks_count(&mut self, sb: &Ext4Superblock, cnt: u64) -> Result<()> {
        if cnt >> 32 == 0 {
            self.clear_flag(InodeFlags::HUGE_FILE);
            self.i_blocks_lo.set(cnt as u32);
            self.i_blocks_high.set(0);
            return Ok(());
        }
        if !sb.ro_compat().contains(RoCompatFeatures::HUGE_FILE) {
            return Err(Ext4Error::NotSupported);
        }
        if cnt >> 48 == 0 {
            self.clear_flag(InodeFlags::HUGE_FILE);
            self.i_blocks_lo.set(cnt as u32);
            self.i_blocks_high.set((cnt >> 32) as u16);
        } else {
            self.set_flag(InodeFlags::HUGE_FILE);
            let fs_blocks = cnt >> (sb.s_log_block_size.get() + 1);
            self.i_blocks_lo.set(fs_blocks as u32);
            self.i_blocks_high.set((fs_blocks >> 32) as u16);
        }
        Ok(())
    }

    pub fn file_acl(&self) -> u64 {
        self.i_file_acl_lo.get() as u64 | ((self.i_file_acl_high.get() as u64) << 32)
    }

    pub fn set_file_acl(&mut self, block: u64) {
        self.i_file_acl_lo.set(block as u32);
        self.i_file_acl_high.set((block >> 32) as u16);
    }

    pub fn links_count(&self) -> u16 {
        self.i_links_count.get()
    }

    pub fn set_links_count(&mut self, cnt: u16) {
        self.i_links_count.set(cnt);
    }

    /// 32-bit block pointer `idx` of the direct/indirect area.
    pub fn block_ptr(&self, idx: usize) -> u32 {
        get_le32(&self.i_block, idx * 4)
    }

    pub fn set_block_ptr(&mut self, idx: usize, v: u32) {
        put_le32(&mut self.i_block, idx * 4, v);
    }

    /// Device number for char/block nodes. Both historical encodings
    /// are understood.
    pub fn dev(&self) -> u32 {
        if self.block_ptr(0) != 0 {
            self.block_ptr(0) & 0xFFFF
        } else {
            self.block_ptr(1)
        }
    }

    pub fn set_dev(&mut self, dev: u32) {
        if dev & !0xFFFF == 0 {
            self.set_block_ptr(0, dev);
            self.set_block_ptr(1, 0);
        } else {
            self.set_block_ptr(0, 0);
            self.set_block_ptr(1, dev);
        }
    }

    /// A symlink short enough to live inside the block-pointer area.
    pub fn is_inline_symlink(&self) -> bool {
        self.is_type(Ext4FileType::Symlink)
            && self.size() as usize <= EXT4_INLINE_SYMLINK_MAX
            && self.i_blocks_lo.get() == 0
            && self.i_blocks_high.get() == 0
    }

    pub fn inline_symlink(&self) -> &[u8] {
        &self.i_block[..self.size() as usize]
    }

    pub fn set_inline_symlink(&mut self, target: &[u8]) {
        self.i_block = [0u8; EXT4_N_BLOCKS * 4];
        self.i_block[..target.len()].copy_from_slice(target);
        self.set_size(target.len() as u64);
    }
}

/// Checksum of a raw on-disk inode slot (`inode_size` bytes); the two
/// checksum fields read as zero for the computation.
pub fn raw_inode_csum(sb: &Ext4Superblock, ino: u32, raw: &[u8]) -> u32 {
    let generation = get_le32(raw, 0x64);
    let mut scratch = raw.to_vec();
    scratch[124] = 0;
    scratch[125] = 0;
    let extra_isize = if raw.len() > 128 {
        u16::from_le_bytes([raw[128], raw[129]])
    } else {
        0
    };
    let has_hi = raw.len() > 128 && extra_isize >= 4;
    if has_hi {
        scratch[130] = 0;
        scratch[131] = 0;
    }
    let mut c = crc32c(sb.csum_seed(), &ino.to_le_bytes());
    c = crc32c(c, &generation.to_le_bytes());
    c = crc32c(c, &scratch);
    if !has_hi {
        c &= 0xFFFF;
    }
    c
}

/// Patch the checksum fields inside a raw inode slot.
pub fn raw_inode_set_csum(sb: &Ext4Superblock, ino: u32, raw: &mut [u8]) {
    if !sb.has_metadata_csum() {
        return;
    }
    let csum = raw_inode_csum(sb, ino, raw);
    raw[124..126].copy_from_slice(&(csum as u16).to_le_bytes());
    let extra_isize = if raw.len() > 128 {
        u16::from_le_bytes([raw[128], raw[129]])
    } else {
        0
    };
    if raw.len() > 128 && extra_isize >= 4 {
        raw[130..132].copy_from_slice(&((csum >> 16) as u16).to_le_bytes());
    }
}

pub fn raw_inode_verify_csum(sb: &Ext4Superblock, ino: u32, raw: &[u8]) -> bool {
    if !sb.has_metadata_csum() {
        return true;
    }
    let csum = raw_inode_csum(sb, ino, raw);
    let lo = u16::from_le_bytes([raw[124], raw[125]]);
    if lo != csum as u16 {
        return false;
    }
    let extra_isize = if raw.len() > 128 {
        u16::from_le_bytes([raw[128], raw[129]])
    } else {
        0
    };
    if raw.len() > 128 && extra_isize >= 4 {
        let hi = u16::from_le_bytes([raw[130], raw[131]]);
        if hi != (csum >> 16) as u16 {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;
    use zerocopy::FromBytes;

    #[test]
    fn struct_size() {
        assert_eq!(size_of::<Ext4Inode>(), EXT4_INODE_STRUCT_SIZE);
    }

    #[test]
    fn type_and_perm_encoding() {
        let mut ino = Ext4Inode::new_zeroed();
        ino.set_file_type(Ext4FileType::Directory, 0o755);
        assert_eq!(ino.i_mode.get(), 0x41ED);
        assert!(ino.is_type(Ext4FileType::Directory));
        assert_eq!(ino.mode_perm(), 0o755);
        ino.set_mode_perm(0o700);
        assert!(ino.is_type(Ext4FileType::Directory));
    }

    #[test]
    fn size_split_for_regular_files() {
        let mut ino = Ext4Inode::new_zeroed();
        ino.set_file_type(Ext4FileType::RegularFile, 0o644);
        ino.set_size(5 * (1u64 << 32) + 77);
        assert_eq!(ino.size(), 5 * (1u64 << 32) + 77);
        assert_eq!(ino.i_size_high.get(), 5);
    }

    #[test]
    fn huge_file_block_count() {
        let mut sb = Ext4Superblock::new_zeroed();
        sb.s_feature_ro_compat
            .set(RoCompatFeatures::HUGE_FILE.bits());
        sb.s_log_block_size.set(2); // 4 KiB
        let mut ino = Ext4Inode::new_zeroed();
        let cnt = 1u64 << 49;
        ino.set_blocks_count(&sb, cnt).unwrap();
        assert!(ino.has_flag(InodeFlags::HUGE_FILE));
        assert_eq!(ino.blocks_count(&sb), cnt);
        ino.set_blocks_count(&sb, 8).unwrap();
        assert!(!ino.has_flag(InodeFlags::HUGE_FILE));
        assert_eq!(ino.blocks_count(&sb), 8);
    }

    #[test]
    fn inline_symlink_payload() {
        let mut ino = Ext4Inode::new_zeroed();
        ino.set_file_type(Ext4FileType::Symlink, 0o777);
        ino.set_inline_symlink(b"../target/file");
        assert!(ino.is_inline_symlink());
        assert_eq!(ino.inline_symlink(), b"../target/file");
    }

    #[test]
    fn inode_checksum_roundtrip() {
        let mut sb = Ext4Superblock::new_zeroed();
        sb.s_feature_ro_compat
            .set(RoCompatFeatures::METADATA_CSUM.bits());
        sb.s_uuid = [9u8; 16];
        let mut raw = vec![0u8; 256];
        raw[128..130].copy_from_slice(&32u16.to_le_bytes()); // extra_isize
        raw[0x64..0x68].copy_from_slice(&7u32.to_le_bytes()); // generation
        raw_inode_set_csum(&sb, 12, &mut raw);
        assert!(raw_inode_verify_csum(&sb, 12, &raw));
        raw[4] ^= 1;
        assert!(!raw_inode_verify_csum(&sb, 12, &raw));
    }
}
