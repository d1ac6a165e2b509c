//! Linear directories: packed entry chains, lookup/insert/remove and
//! the readdir iterator. The HTree path (dir_idx) sits on top and
//! falls back here when the index is damaged.
//!
//! HTree internals stay invisible to the linear walker: the dx root
//! hides its index area inside the rec_len span of `..`, and interior
//! nodes disguise themselves as one whole-block unused entry.

use log::*;

use crate::crc::crc32c;
use crate::error::{Ext4Error, Result};
use crate::fs::{Ext4Fs, InodeRef};
use crate::inode::{Ext4FileType, InodeFlags};
use crate::sb::CompatFeatures;
use crate::types::{get_le16, get_le32, put_le16, put_le32};

pub const EXT4_DIR_ENTRY_HEADER_LEN: usize = 8;
pub const EXT4_NAME_MAX: usize = 255;
/// Fake file-type byte of the checksum tail entry.
pub const EXT4_DIR_CSUM_FT: u8 = 0xDE;
/// Size of the checksum tail pseudo-entry.
pub const EXT4_DIR_TAIL_LEN: usize = 12;

/// One decoded directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u32,
    pub file_type: u8,
    pub name: Vec<u8>,
    /// Byte offset of the entry within the directory file.
    pub offset: u64,
}

impl DirEntry {
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Bytes an entry with `name_len` name bytes occupies on disk.
pub fn dirent_size(name_len: usize) -> usize {
    (EXT4_DIR_ENTRY_HEADER_LEN + name_len + 3) & !3
}

/* raw in-block entry fields */

pub fn de_ino(b: &[u8], off: usize) -> u32 {
    get_le32(b, off)
}

pub fn de_set_ino(b: &mut [u8], off: usize, v: u32) {
    put_le32(b, off, v)
}

pub fn de_rec_len(b: &[u8], off: usize) -> usize {
    get_le16(b, off + 4) as usize
}

pub fn de_set_rec_len(b: &mut [u8], off: usize, v: usize) {
    put_le16(b, off + 4, v as u16)
}

pub fn de_name_len(b: &[u8], off: usize) -> usize {
    b[off + 6] as usize
}

pub fn de_file_type(b: &[u8], off: usize) -> u8 {
    b[off + 7]
}

pub fn de_name(b: &[u8], off: usize) -> &[u8] {
    &b[off + 8..off + 8 + de_name_len(b, off)]
}

pub fn de_write(b: &mut [u8], off: usize, ino: u32, rec_len: usize, name: &[u8], ftype: u8) {
    put_le32(b, off, ino);
    put_le16(b, off + 4, rec_len as u16);
    b[off + 6] = name.len() as u8;
    b[off + 7] = ftype;
    b[off + 8..off + 8 + name.len()].copy_from_slice(name);
}

/// Validate one link of the rec_len chain.
pub(crate) fn de_check(b: &[u8], off: usize) -> Result<usize> {
    let rec = de_rec_len(b, off);
    if rec < EXT4_DIR_ENTRY_HEADER_LEN || rec % 4 != 0 || off + rec > b.len() {
        return Err(Ext4Error::Corrupted);
    }
    if de_ino(b, off) != 0 && off + EXT4_DIR_ENTRY_HEADER_LEN + de_name_len(b, off) > off + rec {
        return Err(Ext4Error::Corrupted);
    }
    Ok(rec)
}

/// Does this block reserve a checksum-tail slot, i.e. does some entry
/// boundary land exactly on `len - 12`?
fn has_tail_slot(b: &[u8]) -> bool {
    let tail = b.len() - EXT4_DIR_TAIL_LEN;
    let mut off = 0usize;
    while off < b.len() {
        if off == tail {
            return true;
        }
        let rec = de_rec_len(b, off);
        if rec < EXT4_DIR_ENTRY_HEADER_LEN || off + rec > b.len() {
            return false;
        }
        off += rec;
    }
    false
}

impl Ext4Fs {
    /// Usable bytes when laying out a fresh directory block (the
    /// checksum tail, when present, is carved off the end).
    pub fn dir_block_usable(&self) -> usize {
        let bsize = self.block_size();
        if self.sb.has_metadata_csum() {
            bsize - EXT4_DIR_TAIL_LEN
        } else {
            bsize
        }
    }

    fn dir_csum_seed(&self, iref: &InodeRef) -> u32 {
        let c = crc32c(self.sb.csum_seed(), &iref.ino.to_le_bytes());
        crc32c(c, &iref.inode.i_generation.get().to_le_bytes())
    }

    /// Stamp the tail pseudo-entry `{0, 12, 0, 0xDE, csum}` onto a
    /// block that reserves the slot.
    pub fn dir_set_csum(&self, iref: &InodeRef, block: &mut [u8]) {
        if !self.sb.has_metadata_csum() || !has_tail_slot(block) {
            return;
        }
        let tail = block.len() - EXT4_DIR_TAIL_LEN;
        put_le32(block, tail, 0);
        put_le16(block, tail + 4, EXT4_DIR_TAIL_LEN as u16);
        block[tail + 6] = 0;
        block[tail + 7] = EXT4_DIR_CSUM_FT;
        let csum = crc32c(self.dir_csum_seed(iref), &block[..tail]);
        put_le32(block, tail + 8, csum);
    }

    pub fn dir_verify_csum(&self, iref: &InodeRef, block: &[u8]) -> bool {
        if !self.sb.has_metadata_csum() {
            return true;
        }
        let tail = block.len() - EXT4_DIR_TAIL_LEN;
        if de_ino(block, tail) != 0
            || de_rec_len(block, tail) != EXT4_DIR_TAIL_LEN
            || block[tail + 7] != EXT4_DIR_CSUM_FT
        {
            // no tail: dx-internal block or degraded fallback block
            return true;
        }
        get_le32(block, tail + 8) == crc32c(self.dir_csum_seed(iref), &block[..tail])
    }

    pub(crate) fn dir_data_blocks(&self, iref: &InodeRef) -> u64 {
        num::integer::div_ceil(iref.inode.size(), self.block_size() as u64)
    }

    pub(crate) fn dir_read_block(&mut self, iref: &InodeRef, dblock: u64) -> Result<(u64, Vec<u8>)> {
        let Some(lba) = self.inode_map_block(iref, dblock)? else {
            error!("directory {} has a hole at block {}", iref.ino, dblock);
            return Err(Ext4Error::Corrupted);
        };
        let bref = self.block_get(lba)?;
        let data = bref.borrow().data.clone();
        self.block_set(bref)?;
        if !self.dir_verify_csum(iref, &data) {
            error!("directory {} block {} checksum mismatch", iref.ino, dblock);
            return Err(Ext4Error::Io);
        }
        Ok((lba, data))
    }

    pub(crate) fn dir_write_block(
        &mut self,
        iref: &InodeRef,
        lba: u64,
        data: &mut [u8],
    ) -> Result<()> {
        self.dir_set_csum(iref, data);
        let bref = self.block_get(lba)?;
        bref.write_at(0, data);
        self.dirty_block(&bref);
        self.block_set(bref)?;
        Ok(())
    }

    /// Scan the rec_len chain of one block for `name`; returns the
    /// entry offset within the block.
    fn dir_block_find(&self, block: &[u8], name: &[u8]) -> Result<Option<usize>> {
        let mut off = 0usize;
        while off < block.len() {
            let rec = de_check(block, off)?;
            if de_ino(block, off) != 0
                && de_name_len(block, off) == name.len()
                && de_name(block, off) == name
            {
                return Ok(Some(off));
            }
            off += rec;
        }
        Ok(None)
    }

    pub(crate) fn dir_uses_index(&self, iref: &InodeRef) -> bool {
        self.sb.compat().contains(CompatFeatures::DIR_INDEX)
            && iref.inode.has_flag(InodeFlags::INDEX)
    }

    /// Look a name up in a directory (through the hash index when the
    /// inode carries one; a damaged index degrades to a linear scan).
    pub fn dir_find(&mut self, iref: &InodeRef, name: &[u8]) -> Result<DirEntry> {
        if name.is_empty() || name.len() > EXT4_NAME_MAX {
            return Err(Ext4Error::InvalidArgument);
        }
        if !iref.inode.is_type(Ext4FileType::Directory) {
            return Err(Ext4Error::NotDirectory);
        }
        if self.dir_uses_index(iref) {
            match self.dx_find(iref, name) {
                Ok(e) => return Ok(e),
                Err(Ext4Error::NotFound) => return Err(Ext4Error::NotFound),
                Err(Ext4Error::Corrupted) => {
                    warn!("damaged hash index in inode {}, linear fallback", iref.ino);
                }
                Err(e) => return Err(e),
            }
        }
        self.dir_find_linear(iref, name)
    }

    pub(crate) fn dir_find_linear(&mut self, iref: &InodeRef, name: &[u8]) -> Result<DirEntry> {
        let blocks = self.dir_data_blocks(iref);
        let bsize = self.block_size() as u64;
        for dblock in 0..blocks {
            let (_lba, data) = self.dir_read_block(iref, dblock)?;
            if let Some(off) = self.dir_block_find(&data, name)? {
                return Ok(DirEntry {
                    ino: de_ino(&data, off),
                    file_type: de_file_type(&data, off),
                    name: name.to_vec(),
                    offset: dblock * bsize + off as u64,
                });
            }
        }
        Err(Ext4Error::NotFound)
    }

    /// Insert `name -> child`. Indexed directories go through the
    /// HTree; a corrupt index clears the INDEX flag and degrades to
    /// the linear layout.
    pub fn dir_add(
        &mut self,
        iref: &mut InodeRef,
        name: &[u8],
        child_ino: u32,
        ftype: Ext4FileType,
    ) -> Result<()> {
        self.check_writable()?;
        if name.is_empty() || name.len() > EXT4_NAME_MAX {
            return Err(Ext4Error::InvalidArgument);
        }
        if self.dir_find(iref, name).is_ok() {
            return Err(Ext4Error::Exists);
        }
        if self.dir_uses_index(iref) {
            match self.dx_add(iref, name, child_ino, ftype) {
                Ok(()) => return Ok(()),
                Err(Ext4Error::Corrupted) => {
                    warn!("damaged hash index in inode {}, clearing INDEX", iref.ino);
                    iref.inode.clear_flag(InodeFlags::INDEX);
                    iref.dirty = true;
                }
                Err(e) => return Err(e),
            }
        }
        self.dir_add_linear(iref, name, child_ino, ftype)
    }

    /// Try to place an entry inside one block; true on success.
    pub(crate) fn dir_block_insert(
        &self,
        data: &mut [u8],
        name: &[u8],
        child_ino: u32,
        ftype: Ext4FileType,
    ) -> Result<bool> {
        let needed = dirent_size(name.len());
        let mut off = 0usize;
        while off < data.len() {
            let rec = de_check(data, off)?;
            if de_ino(data, off) == 0 && rec >= needed && off + rec <= data.len() {
                // skip the checksum tail slot itself
                if !(rec == EXT4_DIR_TAIL_LEN
                    && off + rec == data.len()
                    && de_file_type(data, off) == EXT4_DIR_CSUM_FT)
                {
                    de_write(data, off, child_ino, rec, name, ftype.dirent_type());
                    return Ok(true);
                }
            }
            let used = dirent_size(de_name_len(data, off));
            if de_ino(data, off) != 0 && rec - used >= needed {
                de_set_rec_len(data, off, used);
                de_write(data, off + used, child_ino, rec - used, name, ftype.dirent_type());
                return Ok(true);
            }
            off += rec;
        }
        Ok(false)
    }

    pub(crate) fn dir_add_linear(
        &mut self,
        iref: &mut InodeRef,
        name: &[u8],
        child_ino: u32,
        ftype: Ext4FileType,
    ) -> Result<()> {
        let blocks = self.dir_data_blocks(iref);
        for dblock in 0..blocks {
            let (lba, mut data) = self.dir_read_block(iref, dblock)?;
            if self.dir_block_insert(&mut data, name, child_ino, ftype)? {
                self.dir_write_block(iref, lba, &mut data)?;
                return Ok(());
            }
        }
        // no room anywhere: append a block
        let lba = self.inode_append_block(iref)?;
        let bsize = self.block_size();
        let mut data = vec![0u8; bsize];
        de_write(&mut data, 0, child_ino, self.dir_block_usable(), name, ftype.dirent_type());
        iref.inode.set_size((blocks + 1) * bsize as u64);
        iref.dirty = true;
        self.dir_write_block(iref, lba, &mut data)?;
        Ok(())
    }

    /// Remove `name`. The slot is invalidated and swallowed by the
    /// previous entry's rec_len when there is one.
    pub fn dir_remove(&mut self, iref: &mut InodeRef, name: &[u8]) -> Result<()> {
        self.check_writable()?;
        let blocks = self.dir_data_blocks(iref);
        for dblock in 0..blocks {
            let (lba, mut data) = self.dir_read_block(iref, dblock)?;
            let mut off = 0usize;
            let mut prev: Option<usize> = None;
            while off < data.len() {
                let rec = de_check(&data, off)?;
                if de_ino(&data, off) != 0
                    && de_name_len(&data, off) == name.len()
                    && de_name(&data, off) == name
                {
                    de_set_ino(&mut data, off, 0);
                    if let Some(p) = prev {
                        let merged = de_rec_len(&data, p) + rec;
                        de_set_rec_len(&mut data, p, merged);
                    }
                    self.dir_write_block(iref, lba, &mut data)?;
                    return Ok(());
                }
                prev = Some(off);
                off += rec;
            }
        }
        Err(Ext4Error::NotFound)
    }

    /// Next live entry at or after byte `offset`; `None` at the end.
    pub fn dir_entry_next(
        &mut self,
        iref: &InodeRef,
        offset: u64,
    ) -> Result<Option<(DirEntry, u64)>> {
        let bsize = self.block_size() as u64;
        let blocks = self.dir_data_blocks(iref);
        let mut dblock = offset / bsize;
        let mut in_block = (offset % bsize) as usize;
        while dblock < blocks {
            let (_lba, data) = self.dir_read_block(iref, dblock)?;
            let mut off = 0usize;
            // resync onto the chain from the requested byte position
            while off < data.len() {
                let rec = de_check(&data, off)?;
                if off >= in_block && de_ino(&data, off) != 0 {
                    let entry = DirEntry {
                        ino: de_ino(&data, off),
                        file_type: de_file_type(&data, off),
                        name: de_name(&data, off).to_vec(),
                        offset: dblock * bsize + off as u64,
                    };
                    return Ok(Some((entry, dblock * bsize + (off + rec) as u64)));
                }
                off += rec;
            }
            dblock += 1;
            in_block = 0;
        }
        Ok(None)
    }

    /// True when only `.` and `..` remain.
    pub fn dir_is_empty(&mut self, iref: &InodeRef) -> Result<bool> {
        let mut offset = 0u64;
        while let Some((entry, next)) = self.dir_entry_next(iref, offset)? {
            if entry.name != b"." && entry.name != b".." {
                return Ok(false);
            }
            offset = next;
        }
        Ok(true)
    }

    /// Lay out a fresh directory: a hashed index from birth when the
    /// volume carries DIR_INDEX, a plain `.`/`..` block otherwise.
    pub fn dir_init_new(&mut self, iref: &mut InodeRef, parent_ino: u32) -> Result<()> {
        if self.sb.compat().contains(CompatFeatures::DIR_INDEX) {
            return self.dx_init_dir(iref, parent_ino);
        }
        self.dir_init_linear(iref, parent_ino)
    }

    pub(crate) fn dir_init_linear(&mut self, iref: &mut InodeRef, parent_ino: u32) -> Result<()> {
        let lba = self.inode_append_block(iref)?;
        let bsize = self.block_size();
        let mut data = vec![0u8; bsize];
        let dot_size = dirent_size(1);
        de_write(&mut data, 0, iref.ino, dot_size, b".", Ext4FileType::Directory.dirent_type());
        de_write(
            &mut data,
            dot_size,
            parent_ino,
            self.dir_block_usable() - dot_size,
            b"..",
            Ext4FileType::Directory.dirent_type(),
        );
        iref.inode.set_size(bsize as u64);
        iref.inode.set_links_count(2); // "." plus the parent's entry
        iref.dirty = true;
        self.dir_write_block(iref, lba, &mut data)?;
        Ok(())
    }

    /// Point `..` at a new parent. Both layouts keep the dotdot entry
    /// at offset 12 of block 0; an indexed root re-checksums its dx
    /// tail instead of the dirent tail.
    pub fn dir_update_dotdot(&mut self, iref: &InodeRef, new_parent: u32) -> Result<()> {
        let (lba, mut data) = self.dir_read_block(iref, 0)?;
        let off = dirent_size(1);
        if de_name(&data, off) != b".." {
            return Err(Ext4Error::Corrupted);
        }
        de_set_ino(&mut data, off, new_parent);
        if self.dir_uses_index(iref) {
            self.dx_refresh_root_csum(iref, &mut data);
            let bref = self.block_get(lba)?;
            bref.write_at(0, &data);
            self.dirty_block(&bref);
            self.block_set(bref)?;
            Ok(())
        } else {
            self.dir_write_block(iref, lba, &mut data)
        }
    }

    /// Rewrite the inode number of an existing entry in place (used by
    /// same-directory rename).
    pub fn dir_set_entry_ino(&mut self, iref: &InodeRef, name: &[u8], ino: u32) -> Result<()> {
        let blocks = self.dir_data_blocks(iref);
        for dblock in 0..blocks {
            let (lba, mut data) = self.dir_read_block(iref, dblock)?;
            if let Some(off) = self.dir_block_find(&data, name)? {
                de_set_ino(&mut data, off, ino);
                self.dir_write_block(iref, lba, &mut data)?;
                return Ok(());
            }
        }
        Err(Ext4Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Ext4Error;
    use crate::fs::Ext4Fs;
    use crate::inode::Ext4FileType;
    use crate::mkfs::{mkfs, FsProfile, MkfsOpts};
    use crate::sb::EXT4_ROOT_INO;
    use block_dev::memory::MemDev;
    use block_dev::Bdev;

    fn ext4_fs() -> Ext4Fs {
        let mut bdev = Bdev::new(Box::new(MemDev::new(16 * 1024 * 1024)));
        mkfs(
            &mut bdev,
            &MkfsOpts { profile: FsProfile::Ext4, block_size: 1024, ..Default::default() },
        )
        .unwrap();
        Ext4Fs::mount(bdev, false).unwrap()
    }

    #[test]
    fn add_find_remove() {
        let mut fs = ext4_fs();
        let mut root = fs.inode_get(EXT4_ROOT_INO).unwrap();
        fs.dir_add(&mut root, b"hello.txt", 20, Ext4FileType::RegularFile)
            .unwrap();
        let e = fs.dir_find(&root, b"hello.txt").unwrap();
        assert_eq!(e.ino, 20);
        assert_eq!(e.file_type, 1);
        fs.dir_remove(&mut root, b"hello.txt").unwrap();
        assert_eq!(
            fs.dir_find(&root, b"hello.txt").unwrap_err(),
            Ext4Error::NotFound
        );
        fs.inode_put(root).unwrap();
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut fs = ext4_fs();
        let mut root = fs.inode_get(EXT4_ROOT_INO).unwrap();
        fs.dir_add(&mut root, b"dup", 21, Ext4FileType::RegularFile).unwrap();
        assert_eq!(
            fs.dir_add(&mut root, b"dup", 22, Ext4FileType::RegularFile)
                .unwrap_err(),
            Ext4Error::Exists
        );
        fs.inode_put(root).unwrap();
    }

    #[test]
    fn removal_hole_is_reused() {
        let mut fs = ext4_fs();
        let mut root = fs.inode_get(EXT4_ROOT_INO).unwrap();
        for i in 0..10 {
            let name = format!("entry{:02}", i);
            fs.dir_add(&mut root, name.as_bytes(), 20 + i, Ext4FileType::RegularFile)
                .unwrap();
        }
        let size_before = root.inode.size();
        fs.dir_remove(&mut root, b"entry05").unwrap();
        fs.dir_add(&mut root, b"newname", 99, Ext4FileType::RegularFile)
            .unwrap();
        assert_eq!(root.inode.size(), size_before);
        assert_eq!(fs.dir_find(&root, b"newname").unwrap().ino, 99);
        fs.inode_put(root).unwrap();
    }

    #[test]
    fn iterator_sees_all_live_entries() {
        let mut fs = ext4_fs();
        let mut root = fs.inode_get(EXT4_ROOT_INO).unwrap();
        let mut want = vec![".".to_string(), "..".to_string(), "lost+found".to_string()];
        for i in 0..40 {
            let name = format!("file{:03}", i);
            fs.dir_add(&mut root, name.as_bytes(), 20 + i, Ext4FileType::RegularFile)
                .unwrap();
            want.push(name);
        }
        let mut seen = vec![];
        let mut offset = 0;
        while let Some((e, next)) = fs.dir_entry_next(&root, offset).unwrap() {
            seen.push(e.name_str());
            offset = next;
        }
        want.sort();
        seen.sort();
        assert_eq!(want, seen);
        fs.inode_put(root).unwrap();
    }

    #[test]
    fn grows_into_second_block() {
        let mut fs = ext4_fs();
        let mut root = fs.inode_get(EXT4_ROOT_INO).unwrap();
        // names sized so one 1 KiB block surely overflows
        for i in 0..40 {
            let name = format!("a-rather-long-file-name-{:04}", i);
            fs.dir_add(&mut root, name.as_bytes(), 100 + i, Ext4FileType::RegularFile)
                .unwrap();
        }
        assert!(root.inode.size() >= 2048);
        for i in 0..40 {
            let name = format!("a-rather-long-file-name-{:04}", i);
            assert_eq!(fs.dir_find(&root, name.as_bytes()).unwrap().ino, 100 + i);
        }
        fs.inode_put(root).unwrap();
    }
}
