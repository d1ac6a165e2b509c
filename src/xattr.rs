//! Extended attributes: the inline area behind the inode body and the
//! external xattr block pointed to by `file_acl`.
//!
//! Both areas hold the same entry layout; values grow downward from
//! the area's end. `set` prefers the inline area and spills to the
//! block, allocating or copying it (copy-on-write on shared refcount)
//! as needed. Every mutation rehashes entries and re-checksums.

use log::*;

use crate::crc::crc32c;
use crate::error::{Ext4Error, Result};
use crate::fs::{Ext4Fs, InodeRef};
use crate::types::{get_le16, get_le32, put_le16, put_le32};

pub const EXT4_XATTR_MAGIC: u32 = 0xEA02_0000;
const XATTR_BLOCK_HDR_SIZE: usize = 32;
const XATTR_IBODY_HDR_SIZE: usize = 4;
const XATTR_ENTRY_HDR_SIZE: usize = 16;
const XATTR_PAD: usize = 4;
/// Refcount ceiling for a shared xattr block.
pub const EXT4_XATTR_REFCOUNT_MAX: u32 = 1024;

/* name index prefixes */
pub const XATTR_INDEX_USER: u8 = 1;
pub const XATTR_INDEX_POSIX_ACL_ACCESS: u8 = 2;
pub const XATTR_INDEX_POSIX_ACL_DEFAULT: u8 = 3;
pub const XATTR_INDEX_TRUSTED: u8 = 4;
pub const XATTR_INDEX_SECURITY: u8 = 6;
pub const XATTR_INDEX_SYSTEM: u8 = 7;
pub const XATTR_INDEX_RICHACL: u8 = 8;

fn pad4(n: usize) -> usize {
    (n + XATTR_PAD - 1) & !(XATTR_PAD - 1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xattr {
    pub name_index: u8,
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl Xattr {
    fn disk_size(&self) -> usize {
        pad4(XATTR_ENTRY_HDR_SIZE + self.name.len()) + pad4(self.value.len())
    }

    pub fn full_name(&self) -> String {
        let prefix = match self.name_index {
            XATTR_INDEX_USER => "user.",
            XATTR_INDEX_POSIX_ACL_ACCESS => return "system.posix_acl_access".into(),
            XATTR_INDEX_POSIX_ACL_DEFAULT => return "system.posix_acl_default".into(),
            XATTR_INDEX_TRUSTED => "trusted.",
            XATTR_INDEX_SECURITY => "security.",
            XATTR_INDEX_SYSTEM => "system.",
            XATTR_INDEX_RICHACL => return "system.richacl".into(),
            _ => "",
        };
        format!("{}{}", prefix, String::from_utf8_lossy(&self.name))
    }
}

/// Split a caller-facing name into (name_index, suffix).
pub fn split_name(full: &[u8]) -> Result<(u8, Vec<u8>)> {
    let s = std::str::from_utf8(full).map_err(|_| Ext4Error::InvalidArgument)?;
    match s {
        "system.posix_acl_access" => return Ok((XATTR_INDEX_POSIX_ACL_ACCESS, vec![])),
        "system.posix_acl_default" => return Ok((XATTR_INDEX_POSIX_ACL_DEFAULT, vec![])),
        "system.richacl" => return Ok((XATTR_INDEX_RICHACL, vec![])),
        _ => {}
    }
    for (prefix, index) in [
        ("user.", XATTR_INDEX_USER),
        ("trusted.", XATTR_INDEX_TRUSTED),
        ("security.", XATTR_INDEX_SECURITY),
        ("system.", XATTR_INDEX_SYSTEM),
    ] {
        if let Some(rest) = s.strip_prefix(prefix) {
            if rest.is_empty() || rest.len() > 255 {
                return Err(Ext4Error::InvalidArgument);
            }
            return Ok((index, rest.as_bytes().to_vec()));
        }
    }
    Err(Ext4Error::InvalidArgument)
}

/// `e_hash` over one attribute's name and value.
fn entry_hash(entry: &Xattr) -> u32 {
    let mut hash = 0u32;
    for b in &entry.name {
        hash = (hash << 5) ^ (hash >> 27) ^ *b as u32;
    }
    let padded = pad4(entry.value.len());
    let mut word = [0u8; 4];
    for i in (0..padded).step_by(4) {
        word.fill(0);
        for j in 0..4 {
            if i + j < entry.value.len() {
                word[j] = entry.value[i + j];
            }
        }
        hash = (hash << 16) ^ (hash >> 16) ^ u32::from_le_bytes(word);
    }
    hash
}

/// `h_hash` over all entries of a block.
fn block_hash(entries: &[Xattr]) -> u32 {
    let mut hash = 0u32;
    for e in entries {
        hash = (hash << 16) ^ (hash >> 16) ^ entry_hash(e);
    }
    hash
}

/// Parse an entry list; `area` spans from the first entry to the end
/// of the region values grow down from.
fn parse_entries(area: &[u8], entries_off: usize) -> Result<Vec<Xattr>> {
    let mut out = Vec::new();
    let mut off = entries_off;
    loop {
        if off + 4 > area.len() {
            return Err(Ext4Error::Corrupted);
        }
        if get_le32(area, off) == 0 {
            break;
        }
        if off + XATTR_ENTRY_HDR_SIZE > area.len() {
            return Err(Ext4Error::Corrupted);
        }
        let name_len = area[off] as usize;
        let name_index = area[off + 1];
        let value_offs = get_le16(area, off + 2) as usize;
        let value_inum = get_le32(area, off + 4);
        let value_size = get_le32(area, off + 8) as usize;
        if value_inum != 0 {
            // value-in-inode attributes are not supported
            return Err(Ext4Error::NotSupported);
        }
        if off + XATTR_ENTRY_HDR_SIZE + name_len > area.len()
            || value_offs + value_size > area.len()
        {
            return Err(Ext4Error::Corrupted);
        }
        let name = area[off + XATTR_ENTRY_HDR_SIZE..off + XATTR_ENTRY_HDR_SIZE + name_len].to_vec();
        let value = area[value_offs..value_offs + value_size].to_vec();
        out.push(Xattr { name_index, name, value });
        off += pad4(XATTR_ENTRY_HDR_SIZE + name_len);
    }
    Ok(out)
}

/// Serialize an entry list into `area`; entries from `entries_off`,
/// values packed down from the end. Fails with NoSpace if it cannot
/// fit.
fn write_entries(area: &mut [u8], entries_off: usize, entries: &[Xattr]) -> Result<()> {
    area[entries_off..].fill(0);
    let mut off = entries_off;
    let mut value_end = area.len();
    for e in entries {
        let esize = pad4(XATTR_ENTRY_HDR_SIZE + e.name.len());
        let vsize = pad4(e.value.len());
        if vsize > value_end || off + esize + 4 > value_end - vsize {
            return Err(Ext4Error::NoSpace);
        }
        value_end -= vsize;
        area[off] = e.name.len() as u8;
        area[off + 1] = e.name_index;
        put_le16(area, off + 2, value_end as u16);
        put_le32(area, off + 4, 0);
        put_le32(area, off + 8, e.value.len() as u32);
        put_le32(area, off + 12, entry_hash(e));
        area[off + XATTR_ENTRY_HDR_SIZE..off + XATTR_ENTRY_HDR_SIZE + e.name.len()]
            .copy_from_slice(&e.name);
        area[value_end..value_end + e.value.len()].copy_from_slice(&e.value);
        off += esize;
    }
    Ok(())
}

/// Would `entries` fit into an area of `capacity` bytes past the
/// entry-list start?
fn entries_fit(capacity: usize, entries: &[Xattr]) -> bool {
    let need: usize = entries.iter().map(|e| e.disk_size()).sum::<usize>() + 4;
    need <= capacity
}

impl Ext4Fs {
    /// (offset-into-slot, length) of the inline xattr area, if any.
    fn ibody_area(&self, iref: &InodeRef) -> Option<(usize, usize)> {
        let isize = self.sb.inode_size() as usize;
        if isize <= 128 {
            return None;
        }
        let start = 128 + iref.inode.i_extra_isize.get() as usize;
        if start + XATTR_IBODY_HDR_SIZE + 4 >= isize {
            return None;
        }
        Some((start, isize - start))
    }

    fn ibody_read(&mut self, iref: &InodeRef) -> Result<Vec<Xattr>> {
        let Some((start, len)) = self.ibody_area(iref) else {
            return Ok(vec![]);
        };
        let (lba, off) = self.inode_raw_slot(iref.ino)?;
        let bref = self.block_get(lba)?;
        let mut area = vec![0u8; len];
        bref.read_at(off + start, &mut area);
        self.block_set(bref)?;
        if get_le32(&area, 0) != EXT4_XATTR_MAGIC {
            return Ok(vec![]);
        }
        parse_entries(&area, XATTR_IBODY_HDR_SIZE)
    }

    fn ibody_write(&mut self, iref: &mut InodeRef, entries: &[Xattr]) -> Result<()> {
        let Some((start, len)) = self.ibody_area(iref) else {
            if entries.is_empty() {
                return Ok(());
            }
            return Err(Ext4Error::NoSpace);
        };
        let mut area = vec![0u8; len];
        if !entries.is_empty() {
            put_le32(&mut area, 0, EXT4_XATTR_MAGIC);
            write_entries(&mut area, XATTR_IBODY_HDR_SIZE, entries)?;
        }
        let (lba, off) = self.inode_raw_slot(iref.ino)?;
        let bref = self.block_get(lba)?;
        bref.write_at(off + start, &area);
        self.dirty_block(&bref);
        self.block_set(bref)?;
        // inode_put re-checksums the whole slot
        iref.dirty = true;
        Ok(())
    }

    fn xattr_block_csum(&self, block_nr: u64, data: &[u8]) -> u32 {
        let mut scratch = data.to_vec();
        put_le32(&mut scratch, 16, 0);
        let mut c = crc32c(self.sb.csum_seed(), &block_nr.to_le_bytes());
        c = crc32c(c, &scratch);
        c
    }

    fn xblock_read(&mut self, iref: &InodeRef) -> Result<(Vec<Xattr>, u32)> {
        let block = iref.inode.file_acl();
        if block == 0 {
            return Ok((vec![], 0));
        }
        let bref = self.block_get(block)?;
        let data = bref.borrow().data.clone();
        self.block_set(bref)?;
        if get_le32(&data, 0) != EXT4_XATTR_MAGIC {
            error!("xattr block {} has bad magic", block);
            return Err(Ext4Error::Corrupted);
        }
        let refcount = get_le32(&data, 4);
        if self.sb.has_metadata_csum()
            && get_le32(&data, 16) != self.xattr_block_csum(block, &data)
        {
            error!("xattr block {} checksum mismatch", block);
            return Err(Ext4Error::Io);
        }
        Ok((parse_entries(&data, XATTR_BLOCK_HDR_SIZE)?, refcount))
    }

    fn xblock_write_raw(&mut self, block: u64, entries: &[Xattr], refcount: u32) -> Result<()> {
        let bsize = self.block_size();
        let mut data = vec![0u8; bsize];
        put_le32(&mut data, 0, EXT4_XATTR_MAGIC);
        put_le32(&mut data, 4, refcount);
        put_le32(&mut data, 8, 1); // h_blocks
        put_le32(&mut data, 12, block_hash(entries));
        write_entries(&mut data, XATTR_BLOCK_HDR_SIZE, entries)?;
        if self.sb.has_metadata_csum() {
            let csum = self.xattr_block_csum(block, &data);
            put_le32(&mut data, 16, csum);
        }
        let bref = self.block_get(block)?;
        bref.write_at(0, &data);
        self.dirty_block(&bref);
        self.block_set(bref)?;
        Ok(())
    }

    /// Write the block entry list for this inode, honoring
    /// copy-on-write when the block is shared, allocating on first
    /// use, releasing when the list empties.
    fn xblock_write(
        &mut self,
        iref: &mut InodeRef,
        entries: &[Xattr],
        refcount: u32,
    ) -> Result<()> {
        let block = iref.inode.file_acl();
        if entries.is_empty() {
            if block != 0 {
                if refcount > 1 {
                    // drop our reference only
                    let (old_entries, _) = self.xblock_read(iref)?;
                    self.xblock_write_raw(block, &old_entries, refcount - 1)?;
                } else {
                    self.block_free(Some(iref), block, 1)?;
                }
                iref.inode.set_file_acl(0);
                iref.dirty = true;
            }
            return Ok(());
        }
        if block == 0 {
            let goal = self.inode_alloc_goal(iref)?;
            let new_block = self.block_alloc(iref, goal)?;
            iref.inode.set_file_acl(new_block);
            iref.dirty = true;
            return self.xblock_write_raw(new_block, entries, 1);
        }
        if refcount > 1 {
            // copy-on-write: install a private copy, deref the original
            let (old_entries, _) = self.xblock_read(iref)?;
            let goal = self.inode_alloc_goal(iref)?;
            let new_block = self.block_alloc(iref, goal)?;
            self.xblock_write_raw(block, &old_entries, refcount - 1)?;
            iref.inode.set_file_acl(new_block);
            iref.dirty = true;
            debug!("xattr block {} copied to {} for inode {}", block, new_block, iref.ino);
            return self.xblock_write_raw(new_block, entries, 1);
        }
        self.xblock_write_raw(block, entries, refcount.max(1))
    }

    /// Fetch one attribute's value.
    pub fn xattr_get(&mut self, iref: &InodeRef, full_name: &[u8]) -> Result<Vec<u8>> {
        let (index, name) = split_name(full_name)?;
        for e in self.ibody_read(iref)? {
            if e.name_index == index && e.name == name {
                return Ok(e.value);
            }
        }
        let (block_entries, _) = self.xblock_read(iref)?;
        for e in block_entries {
            if e.name_index == index && e.name == name {
                return Ok(e.value);
            }
        }
        Err(Ext4Error::NotFound)
    }

    /// All attribute names, inline area first.
    pub fn xattr_list(&mut self, iref: &InodeRef) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .ibody_read(iref)?
            .iter()
            .map(Xattr::full_name)
            .collect();
        let (block_entries, _) = self.xblock_read(iref)?;
        names.extend(block_entries.iter().map(Xattr::full_name));
        Ok(names)
    }

    /// Create or replace an attribute.
    pub fn xattr_set(&mut self, iref: &mut InodeRef, full_name: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        let (index, name) = split_name(full_name)?;
        let new = Xattr { name_index: index, name: name.clone(), value: value.to_vec() };

        let mut inline = self.ibody_read(iref)?;
        let (mut block, refcount) = self.xblock_read(iref)?;
        inline.retain(|e| !(e.name_index == index && e.name == name));
        block.retain(|e| !(e.name_index == index && e.name == name));

        let inline_cap = self
            .ibody_area(iref)
            .map(|(_s, len)| len - XATTR_IBODY_HDR_SIZE)
            .unwrap_or(0);
        let block_cap = self.block_size() - XATTR_BLOCK_HDR_SIZE;

        let mut inline_try = inline.clone();
        inline_try.push(new.clone());
        if entries_fit(inline_cap, &inline_try) {
            self.ibody_write(iref, &inline_try)?;
            self.xblock_write(iref, &block, refcount)?;
            iref.inode.i_ctime.set(crate::now_epoch());
            iref.dirty = true;
            return Ok(());
        }

        let mut block_try = block.clone();
        block_try.push(new);
        if !entries_fit(block_cap, &block_try) {
            return Err(Ext4Error::NoSpace);
        }
        self.ibody_write(iref, &inline)?;
        self.xblock_write(iref, &block_try, refcount)?;
        iref.inode.i_ctime.set(crate::now_epoch());
        iref.dirty = true;
        Ok(())
    }

    /// Delete an attribute.
    pub fn xattr_remove(&mut self, iref: &mut InodeRef, full_name: &[u8]) -> Result<()> {
        self.check_writable()?;
        let (index, name) = split_name(full_name)?;
        let mut inline = self.ibody_read(iref)?;
        let (mut block, refcount) = self.xblock_read(iref)?;
        let before = inline.len() + block.len();
        inline.retain(|e| !(e.name_index == index && e.name == name));
        block.retain(|e| !(e.name_index == index && e.name == name));
        if inline.len() + block.len() == before {
            return Err(Ext4Error::NotFound);
        }
        self.ibody_write(iref, &inline)?;
        self.xblock_write(iref, &block, refcount)?;
        iref.inode.i_ctime.set(crate::now_epoch());
        iref.dirty = true;
        Ok(())
    }

    /// Drop every attribute (used when an inode is released).
    pub fn xattr_purge(&mut self, iref: &mut InodeRef) -> Result<()> {
        let (_, refcount) = self.xblock_read(iref)?;
        self.ibody_write(iref, &[])?;
        self.xblock_write(iref, &[], refcount)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Ext4Fs;
    use crate::inode::Ext4FileType;
    use crate::mkfs::{mkfs, FsProfile, MkfsOpts};
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
    fn name_splitting() {
        assert_eq!(split_name(b"user.hello").unwrap(), (XATTR_INDEX_USER, b"hello".to_vec()));
        assert_eq!(
            split_name(b"system.posix_acl_access").unwrap(),
            (XATTR_INDEX_POSIX_ACL_ACCESS, vec![])
        );
        assert_eq!(
            split_name(b"security.selinux").unwrap(),
            (XATTR_INDEX_SECURITY, b"selinux".to_vec())
        );
        assert!(split_name(b"nodot").is_err());
        assert!(split_name(b"user.").is_err());
    }

    #[test]
    fn small_attr_lives_inline() {
        let mut fs = ext4_fs();
        let mut iref = fs.inode_alloc(Ext4FileType::RegularFile, 0o644).unwrap();
        fs.xattr_set(&mut iref, b"user.hello", b"world").unwrap();
        assert_eq!(fs.xattr_get(&iref, b"user.hello").unwrap(), b"world");
        assert_eq!(iref.inode.file_acl(), 0);
        assert_eq!(fs.xattr_list(&iref).unwrap(), vec!["user.hello".to_string()]);
        fs.inode_put(iref).unwrap();
    }

    #[test]
    fn large_attr_spills_to_block_and_back() {
        let mut fs = ext4_fs();
        let free_before = fs.sb.free_blocks_count();
        let mut iref = fs.inode_alloc(Ext4FileType::RegularFile, 0o644).unwrap();
        let big = vec![0xABu8; 300];
        fs.xattr_set(&mut iref, b"user.big", &big).unwrap();
        assert_ne!(iref.inode.file_acl(), 0);
        assert_eq!(fs.xattr_get(&iref, b"user.big").unwrap(), big);
        fs.xattr_remove(&mut iref, b"user.big").unwrap();
        assert_eq!(iref.inode.file_acl(), 0);
        assert_eq!(
            fs.xattr_get(&iref, b"user.big").unwrap_err(),
            Ext4Error::NotFound
        );
        // the freed xattr block came back (inode itself holds no blocks)
        assert_eq!(fs.sb.free_blocks_count(), free_before);
        fs.inode_put(iref).unwrap();
    }

    #[test]
    fn replace_updates_value() {
        let mut fs = ext4_fs();
        let mut iref = fs.inode_alloc(Ext4FileType::RegularFile, 0o644).unwrap();
        fs.xattr_set(&mut iref, b"user.k", b"v1").unwrap();
        fs.xattr_set(&mut iref, b"user.k", b"second-value").unwrap();
        assert_eq!(fs.xattr_get(&iref, b"user.k").unwrap(), b"second-value");
        assert_eq!(fs.xattr_list(&iref).unwrap().len(), 1);
        fs.inode_put(iref).unwrap();
    }

    #[test]
    fn mixed_inline_and_block_listing() {
        let mut fs = ext4_fs();
        let mut iref = fs.inode_alloc(Ext4FileType::RegularFile, 0o644).unwrap();
        fs.xattr_set(&mut iref, b"user.small", b"x").unwrap();
        fs.xattr_set(&mut iref, b"user.big", &vec![1u8; 400]).unwrap();
        fs.xattr_set(&mut iref, b"trusted.tag", b"yes").unwrap();
        let mut names = fs.xattr_list(&iref).unwrap();
        names.sort();
        assert_eq!(names, vec!["trusted.tag", "user.big", "user.small"]);
        fs.inode_put(iref).unwrap();
    }

    #[test]
    fn entry_hash_matches_known_shape() {
        // same name+value must hash identically, different value not
        let a = Xattr { name_index: 1, name: b"k".to_vec(), value: b"v".to_vec() };
        let b = Xattr { name_index: 1, name: b"k".to_vec(), value: b"v".to_vec() };
        let c = Xattr { name_index: 1, name: b"k".to_vec(), value: b"w".to_vec() };
        assert_eq!(entry_hash(&a), entry_hash(&b));
        assert_ne!(entry_hash(&a), entry_hash(&c));
    }
}
