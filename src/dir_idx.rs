//! Hashed directory index (HTree), depth <= 2: a root block with
//! index entries, optionally one level of interior nodes, and ordinary
//! directory blocks as leaves.
//!
//! Index block pointers are logical blocks within the directory file.
//! The root hides its index area inside the rec_len of `..`; interior
//! nodes masquerade as one whole-block unused entry, so the linear
//! walker passes over both.

use log::*;

use crate::crc::crc32c;
use crate::dir::{
    de_check, de_file_type, de_ino, de_name, de_name_len, de_rec_len, de_write, dirent_size,
    DirEntry,
};
use crate::dir_hash::{dirhash_sb, effective_hash_version};
use crate::error::{Ext4Error, Result};
use crate::fs::{Ext4Fs, InodeRef};
use crate::inode::{Ext4FileType, InodeFlags};
use crate::types::{get_le16, get_le32, put_le16, put_le32};

const DX_ROOT_INFO_OFF: usize = 24;
const DX_ROOT_INFO_LEN: u8 = 8;
const DX_ROOT_ENTRIES_OFF: usize = 32;
const DX_NODE_ENTRIES_OFF: usize = 8;
const DX_ENTRY_SIZE: usize = 8;
const DX_TAIL_SIZE: usize = 8;
/// High nibble of a dx block pointer is reserved for fullness hints.
const DX_BLOCK_MASK: u32 = 0x0FFF_FFFF;
/// The tree never exceeds root + one interior level.
const DX_MAX_LEVELS: u8 = 1;

/// One node on the lookup path.
struct DxFrame {
    /// Logical block of this node within the directory file.
    lblock: u64,
    bytes: Vec<u8>,
    entries_off: usize,
    /// Chosen entry while descending.
    pos: usize,
}

fn dx_count(b: &[u8], entries_off: usize) -> usize {
    get_le16(b, entries_off + 2) as usize
}

fn dx_set_count(b: &mut [u8], entries_off: usize, v: usize) {
    put_le16(b, entries_off + 2, v as u16)
}

fn dx_limit(b: &[u8], entries_off: usize) -> usize {
    get_le16(b, entries_off) as usize
}

fn dx_set_limit(b: &mut [u8], entries_off: usize, v: usize) {
    put_le16(b, entries_off, v as u16)
}

/// Hash key of entry `i`; entry 0 holds the count/limit overlay and
/// keys the lowest range implicitly.
fn dx_entry_hash(b: &[u8], entries_off: usize, i: usize) -> u32 {
    if i == 0 {
        0
    } else {
        get_le32(b, entries_off + i * DX_ENTRY_SIZE)
    }
}

fn dx_entry_block(b: &[u8], entries_off: usize, i: usize) -> u32 {
    get_le32(b, entries_off + i * DX_ENTRY_SIZE + 4) & DX_BLOCK_MASK
}

fn dx_write_entry(b: &mut [u8], entries_off: usize, i: usize, hash: u32, block: u32) {
    put_le32(b, entries_off + i * DX_ENTRY_SIZE, hash);
    put_le32(b, entries_off + i * DX_ENTRY_SIZE + 4, block);
}

/// Entry 0's hash field is the count/limit overlay; only its block
/// half may be written.
fn dx_set_entry_block(b: &mut [u8], entries_off: usize, i: usize, block: u32) {
    put_le32(b, entries_off + i * DX_ENTRY_SIZE + 4, block);
}

/// Shift entries `[at, count)` one slot right and write a new one.
fn dx_insert_entry(b: &mut [u8], entries_off: usize, at: usize, hash: u32, block: u32) {
    let count = dx_count(b, entries_off);
    let src = entries_off + at * DX_ENTRY_SIZE;
    let end = entries_off + count * DX_ENTRY_SIZE;
    b.copy_within(src..end, src + DX_ENTRY_SIZE);
    dx_write_entry(b, entries_off, at, hash, block);
    dx_set_count(b, entries_off, count + 1);
}

/// Largest entry whose hash <= `hash` (binary search; entry 0 is the
/// implicit lower bound).
fn dx_search(b: &[u8], entries_off: usize, hash: u32) -> usize {
    let count = dx_count(b, entries_off);
    let (mut lo, mut hi) = (0usize, count - 1);
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if dx_entry_hash(b, entries_off, mid) <= hash {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    lo
}

impl Ext4Fs {
    fn dx_node_limit(&self, entries_off: usize) -> usize {
        let tail = if self.sb.has_metadata_csum() { DX_TAIL_SIZE } else { 0 };
        (self.block_size() - entries_off - tail) / DX_ENTRY_SIZE
    }

    fn dx_csum_seed(&self, iref: &InodeRef) -> u32 {
        let c = crc32c(self.sb.csum_seed(), &iref.ino.to_le_bytes());
        crc32c(c, &iref.inode.i_generation.get().to_le_bytes())
    }

    fn dx_compute_csum(&self, iref: &InodeRef, b: &[u8], entries_off: usize) -> u32 {
        let count = dx_count(b, entries_off);
        let covered = entries_off + count * DX_ENTRY_SIZE;
        let mut c = crc32c(self.dx_csum_seed(iref), &b[..covered]);
        // the 8-byte tail participates with its checksum field zeroed
        c = crc32c(c, &[0u8; DX_TAIL_SIZE]);
        c
    }

    fn dx_set_csum(&self, iref: &InodeRef, b: &mut [u8], entries_off: usize) {
        if !self.sb.has_metadata_csum() {
            return;
        }
        let limit = dx_limit(b, entries_off);
        let tail = entries_off + limit * DX_ENTRY_SIZE;
        let csum = self.dx_compute_csum(iref, b, entries_off);
        put_le32(b, tail, 0);
        put_le32(b, tail + 4, csum);
    }

    fn dx_verify_csum(&self, iref: &InodeRef, b: &[u8], entries_off: usize) -> Result<()> {
        if !self.sb.has_metadata_csum() {
            return Ok(());
        }
        let limit = dx_limit(b, entries_off);
        let tail = entries_off + limit * DX_ENTRY_SIZE;
        if tail + DX_TAIL_SIZE > b.len() {
            return Err(Ext4Error::Corrupted);
        }
        if get_le32(b, tail + 4) != self.dx_compute_csum(iref, b, entries_off) {
            error!("dx node checksum mismatch in inode {}", iref.ino);
            return Err(Ext4Error::Io);
        }
        Ok(())
    }

    /// Restamp the dx tail of a root block edited outside the index
    /// path (the `..` entry participates in the checksum).
    pub(crate) fn dx_refresh_root_csum(&self, iref: &InodeRef, b: &mut [u8]) {
        self.dx_set_csum(iref, b, DX_ROOT_ENTRIES_OFF);
    }

    fn dx_write_node(&mut self, iref: &InodeRef, lblock: u64, b: &mut [u8], entries_off: usize) -> Result<()> {
        self.dx_set_csum(iref, b, entries_off);
        let Some(lba) = self.inode_map_block(iref, lblock)? else {
            return Err(Ext4Error::Corrupted);
        };
        let bref = self.block_get(lba)?;
        bref.write_at(0, b);
        self.dirty_block(&bref);
        self.block_set(bref)?;
        Ok(())
    }

    /// Lay out a brand-new indexed directory: a dx root at block 0
    /// pointing at one empty leaf at block 1.
    pub fn dx_init_dir(&mut self, iref: &mut InodeRef, parent_ino: u32) -> Result<()> {
        let bsize = self.block_size();
        let root_lba = self.inode_append_block(iref)?;
        iref.inode.set_size(bsize as u64);
        let leaf_lba = self.inode_append_block(iref)?;
        iref.inode.set_size(2 * bsize as u64);
        iref.inode.set_links_count(2);
        iref.inode.set_flag(InodeFlags::INDEX);
        iref.dirty = true;

        let mut root = vec![0u8; bsize];
        let dot_size = dirent_size(1);
        de_write(&mut root, 0, iref.ino, dot_size, b".", Ext4FileType::Directory.dirent_type());
        de_write(
            &mut root,
            dot_size,
            parent_ino,
            bsize - dot_size,
            b"..",
            Ext4FileType::Directory.dirent_type(),
        );
        root[DX_ROOT_INFO_OFF + 4] = effective_hash_version(&self.sb);
        root[DX_ROOT_INFO_OFF + 5] = DX_ROOT_INFO_LEN;
        root[DX_ROOT_INFO_OFF + 6] = 0; // indirect_levels
        dx_set_limit(&mut root, DX_ROOT_ENTRIES_OFF, self.dx_node_limit(DX_ROOT_ENTRIES_OFF));
        dx_set_count(&mut root, DX_ROOT_ENTRIES_OFF, 1);
        dx_set_entry_block(&mut root, DX_ROOT_ENTRIES_OFF, 0, 1);
        self.dx_set_csum(iref, &mut root, DX_ROOT_ENTRIES_OFF);
        let bref = self.block_get(root_lba)?;
        bref.write_at(0, &root);
        self.dirty_block(&bref);
        self.block_set(bref)?;

        let mut leaf = vec![0u8; bsize];
        de_write(&mut leaf, 0, 0, self.dir_block_usable(), b"", 0);
        self.dir_write_block(iref, leaf_lba, &mut leaf)?;
        Ok(())
    }

    /// Read and validate the root, then descend to the leaf frame for
    /// `hash`.
    fn dx_load_frames(&mut self, iref: &InodeRef, hash: u32) -> Result<Vec<DxFrame>> {
        let (_lba, root) = self.dir_read_block(iref, 0)?;
        if root.len() < DX_ROOT_ENTRIES_OFF + DX_ENTRY_SIZE {
            return Err(Ext4Error::Corrupted);
        }
        if get_le32(&root, DX_ROOT_INFO_OFF) != 0
            || root[DX_ROOT_INFO_OFF + 5] != DX_ROOT_INFO_LEN
        {
            return Err(Ext4Error::Corrupted);
        }
        if root[DX_ROOT_INFO_OFF + 4] != effective_hash_version(&self.sb) {
            // a foreign or stale hash version: treat the index as bad
            return Err(Ext4Error::Corrupted);
        }
        let levels = root[DX_ROOT_INFO_OFF + 6];
        if levels > DX_MAX_LEVELS {
            return Err(Ext4Error::Corrupted);
        }
        let count = dx_count(&root, DX_ROOT_ENTRIES_OFF);
        if count == 0 || count > dx_limit(&root, DX_ROOT_ENTRIES_OFF) {
            return Err(Ext4Error::Corrupted);
        }
        self.dx_verify_csum(iref, &root, DX_ROOT_ENTRIES_OFF)?;

        let pos = dx_search(&root, DX_ROOT_ENTRIES_OFF, hash);
        let mut frames = vec![DxFrame {
            lblock: 0,
            bytes: root,
            entries_off: DX_ROOT_ENTRIES_OFF,
            pos,
        }];

        if levels == 1 {
            let frame = frames.last().unwrap();
            let child =
                dx_entry_block(&frame.bytes, frame.entries_off, frame.pos) as u64;
            if child >= self.dir_data_blocks(iref) {
                return Err(Ext4Error::Corrupted);
            }
            let (_lba, node) = self.dir_read_block(iref, child)?;
            // interior nodes hide behind one whole-block fake entry
            if de_ino(&node, 0) != 0 || de_rec_len(&node, 0) != node.len() {
                return Err(Ext4Error::Corrupted);
            }
            let count = dx_count(&node, DX_NODE_ENTRIES_OFF);
            if count == 0 || count > dx_limit(&node, DX_NODE_ENTRIES_OFF) {
                return Err(Ext4Error::Corrupted);
            }
            self.dx_verify_csum(iref, &node, DX_NODE_ENTRIES_OFF)?;
            let pos = dx_search(&node, DX_NODE_ENTRIES_OFF, hash);
            frames.push(DxFrame {
                lblock: child,
                bytes: node,
                entries_off: DX_NODE_ENTRIES_OFF,
                pos,
            });
        }
        Ok(frames)
    }

    /// Advance the deepest movable frame to the next leaf if its hash
    /// range continues `hash` (collision spill-over).
    fn dx_next_leaf(&mut self, iref: &InodeRef, frames: &mut Vec<DxFrame>, hash: u32) -> Result<bool> {
        let mut level = frames.len();
        loop {
            if level == 0 {
                return Ok(false);
            }
            level -= 1;
            let frame = &frames[level];
            if frame.pos + 1 < dx_count(&frame.bytes, frame.entries_off) {
                let next_hash =
                    dx_entry_hash(&frame.bytes, frame.entries_off, frame.pos + 1);
                if next_hash & !1 != hash {
                    return Ok(false);
                }
                break;
            }
        }
        frames[level].pos += 1;
        // reload everything below the advanced frame
        while level + 1 < frames.len() {
            let child = dx_entry_block(
                &frames[level].bytes,
                frames[level].entries_off,
                frames[level].pos,
            ) as u64;
            if child >= self.dir_data_blocks(iref) {
                return Err(Ext4Error::Corrupted);
            }
            let (_lba, node) = self.dir_read_block(iref, child)?;
            self.dx_verify_csum(iref, &node, DX_NODE_ENTRIES_OFF)?;
            frames[level + 1] = DxFrame {
                lblock: child,
                bytes: node,
                entries_off: DX_NODE_ENTRIES_OFF,
                pos: 0,
            };
            level += 1;
        }
        Ok(true)
    }

    /// Hash lookup.
    pub fn dx_find(&mut self, iref: &InodeRef, name: &[u8]) -> Result<DirEntry> {
        if name == b"." || name == b".." {
            // the dot entries live in the root block itself
            let (_lba, root) = self.dir_read_block(iref, 0)?;
            let off = if name == b"." { 0 } else { dirent_size(1) };
            if de_name(&root, off) != name {
                return Err(Ext4Error::Corrupted);
            }
            return Ok(DirEntry {
                ino: de_ino(&root, off),
                file_type: de_file_type(&root, off),
                name: name.to_vec(),
                offset: off as u64,
            });
        }
        let hash = dirhash_sb(&self.sb, name)?;
        let mut frames = self.dx_load_frames(iref, hash.major)?;
        let bsize = self.block_size() as u64;
        loop {
            let frame = frames.last().unwrap();
            let leaf = dx_entry_block(&frame.bytes, frame.entries_off, frame.pos) as u64;
            if leaf == 0 || leaf >= self.dir_data_blocks(iref) {
                return Err(Ext4Error::Corrupted);
            }
            let (_lba, data) = self.dir_read_block(iref, leaf)?;
            let mut off = 0usize;
            while off < data.len() {
                let rec = de_check(&data, off)?;
                if de_ino(&data, off) != 0
                    && de_name_len(&data, off) == name.len()
                    && de_name(&data, off) == name
                {
                    return Ok(DirEntry {
                        ino: de_ino(&data, off),
                        file_type: de_file_type(&data, off),
                        name: name.to_vec(),
                        offset: leaf * bsize + off as u64,
                    });
                }
                off += rec;
            }
            if !self.dx_next_leaf(iref, &mut frames, hash.major)? {
                return Err(Ext4Error::NotFound);
            }
        }
    }

    /// Rebuild a leaf image from a sorted entry list.
    fn dx_pack_leaf(&self, entries: &[(u32, Vec<u8>, u32, u8)]) -> Vec<u8> {
        let bsize = self.block_size();
        let usable = self.dir_block_usable();
        let mut data = vec![0u8; bsize];
        let mut off = 0usize;
        for (i, (_hash, name, ino, ftype)) in entries.iter().enumerate() {
            let rec = if i == entries.len() - 1 {
                usable - off
            } else {
                dirent_size(name.len())
            };
            de_write(&mut data, off, *ino, rec, name, *ftype);
            off += rec;
        }
        if entries.is_empty() {
            de_write(&mut data, 0, 0, usable, b"", 0);
        }
        data
    }

    /// Hash insert; splits the leaf (and index nodes, and finally the
    /// root) when full.
    pub fn dx_add(
        &mut self,
        iref: &mut InodeRef,
        name: &[u8],
        child_ino: u32,
        ftype: Ext4FileType,
    ) -> Result<()> {
        let hash = dirhash_sb(&self.sb, name)?;
        let mut frames = self.dx_load_frames(iref, hash.major)?;
        let frame = frames.last().unwrap();
        let leaf = dx_entry_block(&frame.bytes, frame.entries_off, frame.pos) as u64;
        if leaf == 0 || leaf >= self.dir_data_blocks(iref) {
            return Err(Ext4Error::Corrupted);
        }
        let (lba, mut data) = self.dir_read_block(iref, leaf)?;
        if self.dir_block_insert(&mut data, name, child_ino, ftype)? {
            return self.dir_write_block(iref, lba, &mut data);
        }

        // leaf full: collect, rehash, sort, split
        let mut map: Vec<(u32, Vec<u8>, u32, u8)> = Vec::new();
        let mut off = 0usize;
        while off < data.len() {
            let rec = de_check(&data, off)?;
            if de_ino(&data, off) != 0 {
                let ename = de_name(&data, off).to_vec();
                let h = dirhash_sb(&self.sb, &ename)?;
                map.push((h.major, ename, de_ino(&data, off), de_file_type(&data, off)));
            }
            off += rec;
        }
        map.push((hash.major, name.to_vec(), child_ino, ftype.dirent_type()));
        map.sort_by(|a, b| a.0.cmp(&b.0));

        // split point: first index where the lower half reaches half a
        // block's worth of entry bytes
        let half = self.dir_block_usable() / 2;
        let mut acc = 0usize;
        let mut split = map.len() - 1;
        for (i, (_h, n, _, _)) in map.iter().enumerate() {
            acc += dirent_size(n.len());
            if acc > half {
                split = i.max(1);
                break;
            }
        }
        let continued = map[split].0 == map[split - 1].0;
        let boundary = map[split].0 | if continued { 1 } else { 0 };

        // the new leaf appends to the directory file
        let new_lblock = self.dir_data_blocks(iref);
        let new_lba = self.inode_append_block(iref)?;
        iref.inode
            .set_size((new_lblock + 1) * self.block_size() as u64);
        iref.dirty = true;

        let upper = map.split_off(split);
        let mut lower_img = self.dx_pack_leaf(&map);
        let mut upper_img = self.dx_pack_leaf(&upper);
        self.dir_write_block(iref, lba, &mut lower_img)?;
        self.dir_write_block(iref, new_lba, &mut upper_img)?;
        debug!(
            "split dx leaf {} of inode {} at hash {:#x} ({} + {} entries)",
            leaf,
            iref.ino,
            boundary,
            map.len(),
            upper.len()
        );

        self.dx_insert_index(iref, &mut frames, boundary, new_lblock as u32)
    }

    /// Insert `(hash, block)` into the deepest frame, splitting the
    /// interior node or growing the root by one level when needed.
    fn dx_insert_index(
        &mut self,
        iref: &mut InodeRef,
        frames: &mut Vec<DxFrame>,
        hash: u32,
        block: u32,
    ) -> Result<()> {
        let deepest = frames.len() - 1;
        {
            let frame = &mut frames[deepest];
            let count = dx_count(&frame.bytes, frame.entries_off);
            let limit = dx_limit(&frame.bytes, frame.entries_off);
            if count < limit {
                dx_insert_entry(&mut frame.bytes, frame.entries_off, frame.pos + 1, hash, block);
                let (lblock, entries_off) = (frame.lblock, frame.entries_off);
                let mut bytes = std::mem::take(&mut frame.bytes);
                return self.dx_write_node(iref, lblock, &mut bytes, entries_off);
            }
        }

        if deepest == 0 {
            // full root, still flat: push its entries into a fresh
            // interior node and raise indirect_levels
            let bsize = self.block_size();
            let node_lblock = self.dir_data_blocks(iref);
            self.inode_append_block(iref)?;
            iref.inode.set_size((node_lblock + 1) * bsize as u64);
            iref.dirty = true;

            let root = &mut frames[0];
            let count = dx_count(&root.bytes, root.entries_off);
            let mut node = vec![0u8; bsize];
            de_write(&mut node, 0, 0, bsize, b"", 0);
            let src = root.entries_off;
            for i in 0..count {
                let h = get_le32(&root.bytes, src + i * DX_ENTRY_SIZE);
                let b = get_le32(&root.bytes, src + i * DX_ENTRY_SIZE + 4);
                put_le32(&mut node, DX_NODE_ENTRIES_OFF + i * DX_ENTRY_SIZE, h);
                put_le32(&mut node, DX_NODE_ENTRIES_OFF + i * DX_ENTRY_SIZE + 4, b);
            }
            // fix entry 0's overlay in the copy
            dx_set_limit(&mut node, DX_NODE_ENTRIES_OFF, self.dx_node_limit(DX_NODE_ENTRIES_OFF));
            dx_set_count(&mut node, DX_NODE_ENTRIES_OFF, count);

            dx_set_count(&mut root.bytes, root.entries_off, 1);
            dx_set_entry_block(&mut root.bytes, root.entries_off, 0, node_lblock as u32);
            root.bytes[DX_ROOT_INFO_OFF + 6] = 1;
            let mut root_bytes = std::mem::take(&mut root.bytes);
            self.dx_write_node(iref, 0, &mut root_bytes, DX_ROOT_ENTRIES_OFF)?;
            info!("dx root of inode {} grew to two levels", iref.ino);

            let pos = dx_search(&node, DX_NODE_ENTRIES_OFF, hash);
            let mut frame = DxFrame {
                lblock: node_lblock,
                bytes: node,
                entries_off: DX_NODE_ENTRIES_OFF,
                pos,
            };
            dx_insert_entry(&mut frame.bytes, frame.entries_off, frame.pos + 1, hash, block);
            let mut bytes = std::mem::take(&mut frame.bytes);
            return self.dx_write_node(iref, node_lblock, &mut bytes, DX_NODE_ENTRIES_OFF);
        }

        // full interior node: split it and promote into the root
        let root_count = dx_count(&frames[0].bytes, frames[0].entries_off);
        let root_limit = dx_limit(&frames[0].bytes, frames[0].entries_off);
        if root_count >= root_limit {
            warn!("hash index of inode {} is full", iref.ino);
            return Err(Ext4Error::NoSpace);
        }

        let bsize = self.block_size();
        let new_lblock = self.dir_data_blocks(iref);
        self.inode_append_block(iref)?;
        iref.inode.set_size((new_lblock + 1) * bsize as u64);
        iref.dirty = true;

        let (node_lblock, mut node_bytes) = {
            let frame = &mut frames[deepest];
            (frame.lblock, std::mem::take(&mut frame.bytes))
        };
        let count = dx_count(&node_bytes, DX_NODE_ENTRIES_OFF);
        let split = count / 2;
        let mut sibling = vec![0u8; bsize];
        de_write(&mut sibling, 0, 0, bsize, b"", 0);
        dx_set_limit(&mut sibling, DX_NODE_ENTRIES_OFF, self.dx_node_limit(DX_NODE_ENTRIES_OFF));
        let moved = count - split;
        for i in 0..moved {
            let h = dx_entry_hash(&node_bytes, DX_NODE_ENTRIES_OFF, split + i);
            let b = dx_entry_block(&node_bytes, DX_NODE_ENTRIES_OFF, split + i);
            dx_write_entry(&mut sibling, DX_NODE_ENTRIES_OFF, i, h, b);
        }
        dx_set_count(&mut sibling, DX_NODE_ENTRIES_OFF, moved);
        dx_set_count(&mut node_bytes, DX_NODE_ENTRIES_OFF, split);
        let promoted = dx_entry_hash(&node_bytes, DX_NODE_ENTRIES_OFF, split);

        // place the pending entry on the proper side
        if hash >= promoted {
            let pos = dx_search(&sibling, DX_NODE_ENTRIES_OFF, hash);
            dx_insert_entry(&mut sibling, DX_NODE_ENTRIES_OFF, pos + 1, hash, block);
        } else {
            let pos = dx_search(&node_bytes, DX_NODE_ENTRIES_OFF, hash);
            dx_insert_entry(&mut node_bytes, DX_NODE_ENTRIES_OFF, pos + 1, hash, block);
        }
        self.dx_write_node(iref, node_lblock, &mut node_bytes, DX_NODE_ENTRIES_OFF)?;
        self.dx_write_node(iref, new_lblock, &mut sibling, DX_NODE_ENTRIES_OFF)?;

        let root = &mut frames[0];
        dx_insert_entry(
            &mut root.bytes,
            root.entries_off,
            root.pos + 1,
            promoted,
            new_lblock as u32,
        );
        let mut root_bytes = std::mem::take(&mut root.bytes);
        self.dx_write_node(iref, 0, &mut root_bytes, DX_ROOT_ENTRIES_OFF)?;
        debug!("split dx node of inode {} at hash {:#x}", iref.ino, promoted);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::dir_hash::dirhash_sb;
    use crate::fs::Ext4Fs;
    use crate::inode::{Ext4FileType, InodeFlags};
    use crate::mkfs::{mkfs, FsProfile, MkfsOpts};
    use crate::sb::EXT4_ROOT_INO;
    use block_dev::memory::MemDev;
    use block_dev::Bdev;

    fn ext4_fs() -> Ext4Fs {
        let mut bdev = Bdev::new(Box::new(MemDev::new(64 * 1024 * 1024)));
        mkfs(
            &mut bdev,
            &MkfsOpts { profile: FsProfile::Ext4, block_size: 1024, ..Default::default() },
        )
        .unwrap();
        Ext4Fs::mount(bdev, false).unwrap()
    }

    fn new_dir(fs: &mut Ext4Fs) -> crate::fs::InodeRef {
        let mut iref = fs.inode_alloc(Ext4FileType::Directory, 0o755).unwrap();
        if fs.has_feature_incompat(crate::sb::IncompatFeatures::EXTENTS) {
            iref.inode.set_flag(InodeFlags::EXTENTS);
            fs.extent_tree_init(&mut iref);
        }
        fs.dir_init_new(&mut iref, EXT4_ROOT_INO).unwrap();
        iref
    }

    #[test]
    fn fresh_directory_is_indexed_and_empty() {
        let mut fs = ext4_fs();
        let iref = new_dir(&mut fs);
        assert!(iref.inode.has_flag(InodeFlags::INDEX));
        assert!(fs.dir_is_empty(&iref).unwrap());
        assert_eq!(fs.dir_find(&iref, b".").unwrap().ino, iref.ino);
        assert_eq!(fs.dir_find(&iref, b"..").unwrap().ino, EXT4_ROOT_INO);
        fs.inode_put(iref).unwrap();
    }

    #[test]
    fn thousand_entries_split_and_stay_findable() {
        let mut fs = ext4_fs();
        let mut iref = new_dir(&mut fs);
        for i in 0..1000u32 {
            let name = format!("f{}", i);
            fs.dir_add(&mut iref, name.as_bytes(), 100 + i, Ext4FileType::RegularFile)
                .unwrap();
        }
        // still an indexed directory, now several leaves deep
        assert!(iref.inode.has_flag(InodeFlags::INDEX));
        assert!(iref.inode.size() > 3 * 1024);
        for i in 0..1000u32 {
            let name = format!("f{}", i);
            assert_eq!(
                fs.dir_find(&iref, name.as_bytes()).unwrap().ino,
                100 + i,
                "lost {}",
                name
            );
        }
        fs.inode_put(iref).unwrap();
    }

    #[test]
    fn leaf_hashes_respect_index_ranges() {
        let mut fs = ext4_fs();
        let mut iref = new_dir(&mut fs);
        for i in 0..600u32 {
            let name = format!("entry-{:05}", i);
            fs.dir_add(&mut iref, name.as_bytes(), 50 + i, Ext4FileType::RegularFile)
                .unwrap();
        }
        // walk every live entry; its leaf must be the one the index
        // would pick for its hash
        let mut offset = 0u64;
        let bsize = fs.block_size() as u64;
        while let Some((e, next)) = fs.dir_entry_next(&iref, offset).unwrap() {
            offset = next;
            if e.name == b"." || e.name == b".." {
                continue;
            }
            let h = dirhash_sb(&fs.sb, &e.name).unwrap();
            let found = fs.dx_find(&iref, &e.name).unwrap();
            assert_eq!(found.ino, e.ino);
            // and the hash lookup must land it in the same leaf block
            assert_eq!(found.offset / bsize, e.offset / bsize, "entry {}", e.name_str());
            let _ = h;
        }
        fs.inode_put(iref).unwrap();
    }

    #[test]
    fn readdir_and_removal_work_on_indexed_dirs() {
        let mut fs = ext4_fs();
        let mut iref = new_dir(&mut fs);
        for i in 0..200u32 {
            let name = format!("n{:04}", i);
            fs.dir_add(&mut iref, name.as_bytes(), 300 + i, Ext4FileType::RegularFile)
                .unwrap();
        }
        fs.dir_remove(&mut iref, b"n0100").unwrap();
        assert!(fs.dir_find(&iref, b"n0100").is_err());
        let mut live = 0;
        let mut offset = 0u64;
        while let Some((e, next)) = fs.dir_entry_next(&iref, offset).unwrap() {
            offset = next;
            if e.name != b"." && e.name != b".." {
                live += 1;
            }
        }
        assert_eq!(live, 199);
        fs.inode_put(iref).unwrap();
    }
}
