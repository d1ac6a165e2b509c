//! Extent B+tree: logical-to-physical ranges keyed by logical block.
//!
//! The root node lives in the inode's 60-byte block area (up to four
//! entries); deeper nodes fill whole blocks and, when metadata
//! checksums are active, carry a crc32c tail right after the entry
//! area. Depth 0 nodes hold extents, deeper nodes hold index entries.

use log::*;

use crate::crc::crc32c;
use crate::error::{Ext4Error, Result};
use crate::fs::{Ext4Fs, InodeRef};
use crate::types::{get_le16, get_le32, put_le16, put_le32};

pub const EXT4_EXT_MAGIC: u16 = 0xF30A;
const EXT_HDR_SIZE: usize = 12;
const EXT_ENTRY_SIZE: usize = 12;
const EXT_ROOT_SIZE: usize = 60;
const EXT_ROOT_MAX: u16 = ((EXT_ROOT_SIZE - EXT_HDR_SIZE) / EXT_ENTRY_SIZE) as u16;

/// Longest extent this engine creates.
pub const EXT_MAX_LEN: u16 = 32767;
/// Raw lengths above this mark an unwritten extent.
const EXT_UNWRITTEN_BASE: u16 = 32768;

/* ---- raw node accessors ---- */

fn eh_magic(b: &[u8]) -> u16 {
    get_le16(b, 0)
}

fn eh_entries(b: &[u8]) -> u16 {
    get_le16(b, 2)
}

fn eh_set_entries(b: &mut [u8], v: u16) {
    put_le16(b, 2, v)
}

fn eh_max(b: &[u8]) -> u16 {
    get_le16(b, 4)
}

fn eh_depth(b: &[u8]) -> u16 {
    get_le16(b, 6)
}

fn eh_init(b: &mut [u8], entries: u16, max: u16, depth: u16) {
    put_le16(b, 0, EXT4_EXT_MAGIC);
    put_le16(b, 2, entries);
    put_le16(b, 4, max);
    put_le16(b, 6, depth);
    put_le32(b, 8, 0);
}

fn entry_off(i: usize) -> usize {
    EXT_HDR_SIZE + i * EXT_ENTRY_SIZE
}

fn ent_key(b: &[u8], i: usize) -> u32 {
    get_le32(b, entry_off(i))
}

fn ext_len_raw(b: &[u8], i: usize) -> u16 {
    get_le16(b, entry_off(i) + 4)
}

fn ext_set_len_raw(b: &mut [u8], i: usize, v: u16) {
    put_le16(b, entry_off(i) + 4, v)
}

fn ext_start(b: &[u8], i: usize) -> u64 {
    let off = entry_off(i);
    get_le32(b, off + 8) as u64 | ((get_le16(b, off + 6) as u64) << 32)
}

fn ext_write(b: &mut [u8], i: usize, key: u32, len_raw: u16, start: u64) {
    let off = entry_off(i);
    put_le32(b, off, key);
    put_le16(b, off + 4, len_raw);
    put_le16(b, off + 6, (start >> 32) as u16);
    put_le32(b, off + 8, start as u32);
}

fn idx_child(b: &[u8], i: usize) -> u64 {
    let off = entry_off(i);
    get_le32(b, off + 4) as u64 | ((get_le16(b, off + 8) as u64) << 32)
}

fn idx_write(b: &mut [u8], i: usize, key: u32, child: u64) {
    let off = entry_off(i);
    put_le32(b, off, key);
    put_le32(b, off + 4, child as u32);
    put_le16(b, off + 8, (child >> 32) as u16);
    put_le16(b, off + 10, 0);
}

/// Decoded extent length: (blocks, unwritten).
fn len_decode(raw: u16) -> (u16, bool) {
    if raw > EXT_UNWRITTEN_BASE {
        (raw - EXT_UNWRITTEN_BASE, true)
    } else {
        (raw, false)
    }
}

/// Shift entries right by one from `pos`, making room for an insert.
fn entries_open_gap(b: &mut [u8], pos: usize, count: usize) {
    let src = entry_off(pos);
    let end = entry_off(count);
    b.copy_within(src..end, src + EXT_ENTRY_SIZE);
}

/// Largest entry index whose key <= `lblock`, or None when every key
/// is greater (binary search).
fn search_node(b: &[u8], lblock: u64) -> Option<usize> {
    let count = eh_entries(b) as usize;
    if count == 0 || (ent_key(b, 0) as u64) > lblock {
        return None;
    }
    let (mut lo, mut hi) = (0usize, count - 1);
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if ent_key(b, mid) as u64 <= lblock {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Some(lo)
}

/* ---- one level of a lookup path ---- */

struct PathLevel {
    /// Backing block; `None` for the root inside the inode.
    block: Option<u64>,
    bytes: Vec<u8>,
    /// Entry chosen while descending (leaf: match or predecessor).
    pos: Option<usize>,
}

impl Ext4Fs {
    fn ext_node_capacity(&self) -> u16 {
        let tail = if self.sb.has_metadata_csum() { 4 } else { 0 };
        ((self.block_size() - EXT_HDR_SIZE - tail) / EXT_ENTRY_SIZE) as u16
    }

    fn ext_tail_offset(&self, b: &[u8]) -> usize {
        EXT_HDR_SIZE + eh_max(b) as usize * EXT_ENTRY_SIZE
    }

    fn ext_node_csum(&self, iref: &InodeRef, b: &[u8]) -> u32 {
        let mut c = crc32c(self.sb.csum_seed(), &iref.ino.to_le_bytes());
        c = crc32c(c, &iref.inode.i_generation.get().to_le_bytes());
        crc32c(c, &b[..self.ext_tail_offset(b)])
    }

    fn ext_load_node(&mut self, iref: &InodeRef, block: u64, want_depth: u16) -> Result<Vec<u8>> {
        let bref = self.block_get(block)?;
        let bytes = bref.borrow().data.clone();
        self.block_set(bref)?;
        if eh_magic(&bytes) != EXT4_EXT_MAGIC {
            error!("extent node {} has bad magic", block);
            return Err(Ext4Error::Corrupted);
        }
        if eh_depth(&bytes) != want_depth {
            error!("extent node {} depth mismatch", block);
            return Err(Ext4Error::Corrupted);
        }
        if self.sb.has_metadata_csum() {
            let off = self.ext_tail_offset(&bytes);
            let stored = get_le32(&bytes, off);
            if stored != self.ext_node_csum(iref, &bytes) {
                error!("extent node {} checksum mismatch", block);
                return Err(Ext4Error::Io);
            }
        }
        Ok(bytes)
    }

    fn ext_store_node(&mut self, iref: &mut InodeRef, level: &mut PathLevel) -> Result<()> {
        match level.block {
            None => {
                iref.inode.i_block[..EXT_ROOT_SIZE].copy_from_slice(&level.bytes[..EXT_ROOT_SIZE]);
                iref.dirty = true;
            }
            Some(block) => {
                if self.sb.has_metadata_csum() {
                    let off = self.ext_tail_offset(&level.bytes);
                    let csum = self.ext_node_csum(iref, &level.bytes);
                    put_le32(&mut level.bytes, off, csum);
                }
                let bref = self.block_get(block)?;
                bref.write_at(0, &level.bytes);
                self.dirty_block(&bref);
                self.block_set(bref)?;
            }
        }
        Ok(())
    }

    /// Initialize the in-inode root as an empty leaf.
    pub fn extent_tree_init(&mut self, iref: &mut InodeRef) {
        let mut root = [0u8; EXT_ROOT_SIZE];
        eh_init(&mut root, 0, EXT_ROOT_MAX, 0);
        iref.inode.i_block = [0u8; 60];
        iref.inode.i_block[..EXT_ROOT_SIZE].copy_from_slice(&root);
        iref.dirty = true;
    }

    fn ext_root_bytes(&self, iref: &InodeRef) -> Result<Vec<u8>> {
        let bytes = iref.inode.i_block[..EXT_ROOT_SIZE].to_vec();
        if eh_magic(&bytes) != EXT4_EXT_MAGIC {
            error!("inode {} extent root has bad magic", iref.ino);
            return Err(Ext4Error::Corrupted);
        }
        Ok(bytes)
    }

    /// Walk root-to-leaf for `lblock`, recording the entry taken at
    /// every level.
    fn ext_find_path(&mut self, iref: &InodeRef, lblock: u64) -> Result<Vec<PathLevel>> {
        let root = self.ext_root_bytes(iref)?;
        let mut depth = eh_depth(&root);
        let mut path = vec![PathLevel { block: None, pos: search_node(&root, lblock), bytes: root }];
        while depth > 0 {
            let last = path.last().unwrap();
            let Some(pos) = last.pos else {
                break; // lblock precedes the whole tree
            };
            let child = idx_child(&last.bytes, pos);
            let bytes = self.ext_load_node(iref, child, depth - 1)?;
            let pos = search_node(&bytes, lblock);
            path.push(PathLevel { block: Some(child), pos, bytes });
            depth -= 1;
        }
        Ok(path)
    }

    /// Logical-to-physical lookup. Holes and unwritten extents map to
    /// `None` (reads see zeros).
    pub fn extent_map_block(&mut self, iref: &InodeRef, lblock: u64) -> Result<Option<u64>> {
        let path = self.ext_find_path(iref, lblock)?;
        let leaf = path.last().unwrap();
        if eh_depth(&leaf.bytes) != 0 {
            return Ok(None);
        }
        let Some(pos) = leaf.pos else {
            return Ok(None);
        };
        let key = ent_key(&leaf.bytes, pos) as u64;
        let (len, unwritten) = len_decode(ext_len_raw(&leaf.bytes, pos));
        if lblock >= key + len as u64 || unwritten {
            return Ok(None);
        }
        Ok(Some(ext_start(&leaf.bytes, pos) + (lblock - key)))
    }

    /// Every extent of the tree in ascending logical order:
    /// `(lblock, phys, len, unwritten)`.
    pub fn extent_all(&mut self, iref: &InodeRef) -> Result<Vec<(u64, u64, u16, bool)>> {
        let root = self.ext_root_bytes(iref)?;
        let mut out = Vec::new();
        self.ext_collect(iref, &root, eh_depth(&root), &mut out)?;
        Ok(out)
    }

    fn ext_collect(
        &mut self,
        iref: &InodeRef,
        node: &[u8],
        depth: u16,
        out: &mut Vec<(u64, u64, u16, bool)>,
    ) -> Result<()> {
        let count = eh_entries(node) as usize;
        if depth == 0 {
            for i in 0..count {
                let (len, unwritten) = len_decode(ext_len_raw(node, i));
                out.push((ent_key(node, i) as u64, ext_start(node, i), len, unwritten));
            }
            return Ok(());
        }
        for i in 0..count {
            let child = self.ext_load_node(iref, idx_child(node, i), depth - 1)?;
            self.ext_collect(iref, &child, depth - 1, out)?;
        }
        Ok(())
    }

    /// Promote the in-inode root one level down into a fresh block;
    /// the root becomes a one-entry index node.
    fn ext_grow_indepth(&mut self, iref: &mut InodeRef, goal: u64) -> Result<()> {
        let root = self.ext_root_bytes(iref)?;
        let new_block = self.block_alloc(iref, goal)?;
        let bsize = self.block_size();
        let mut child = vec![0u8; bsize];
        child[..EXT_ROOT_SIZE].copy_from_slice(&root);
        eh_init(
            &mut child,
            eh_entries(&root),
            self.ext_node_capacity(),
            eh_depth(&root),
        );
        let first_key = if eh_entries(&root) > 0 { ent_key(&root, 0) } else { 0 };
        let mut level = PathLevel { block: Some(new_block), bytes: child, pos: None };
        self.ext_store_node(iref, &mut level)?;

        let mut new_root = [0u8; EXT_ROOT_SIZE];
        eh_init(&mut new_root, 1, EXT_ROOT_MAX, eh_depth(&root) + 1);
        idx_write(&mut new_root, 0, first_key, new_block);
        iref.inode.i_block[..EXT_ROOT_SIZE].copy_from_slice(&new_root);
        iref.dirty = true;
        debug!("extent tree of inode {} grew to depth {}", iref.ino, eh_depth(&root) + 1);
        Ok(())
    }

    /// Insert the single-block mapping `lblock -> phys`, merging with
    /// the tail extent when contiguous, splitting nodes as needed.
    fn extent_insert(&mut self, iref: &mut InodeRef, lblock: u64, phys: u64) -> Result<()> {
        loop {
            let mut path = self.ext_find_path(iref, lblock)?;
            let depth_total = path.len();
            let leaf = path.last_mut().unwrap();
            if eh_depth(&leaf.bytes) != 0 {
                // lblock precedes the first key of a deep tree; this
                // engine only appends, so this is corruption
                return Err(Ext4Error::Corrupted);
            }
            let count = eh_entries(&leaf.bytes) as usize;

            // merge with the predecessor extent if it ends right here
            if let Some(pos) = leaf.pos {
                let key = ent_key(&leaf.bytes, pos) as u64;
                let (len, unwritten) = len_decode(ext_len_raw(&leaf.bytes, pos));
                if !unwritten
                    && key + len as u64 == lblock
                    && ext_start(&leaf.bytes, pos) + len as u64 == phys
                    && len < EXT_MAX_LEN
                {
                    ext_set_len_raw(&mut leaf.bytes, pos, len + 1);
                    let mut leaf = path.pop().unwrap();
                    return self.ext_store_node(iref, &mut leaf);
                }
            }

            let max = eh_max(&leaf.bytes) as usize;
            let insert_at = leaf.pos.map(|p| p + 1).unwrap_or(0);
            if count < max {
                entries_open_gap(&mut leaf.bytes, insert_at, count);
                ext_write(&mut leaf.bytes, insert_at, lblock as u32, 1, phys);
                eh_set_entries(&mut leaf.bytes, count as u16 + 1);
                let mut leaf = path.pop().unwrap();
                return self.ext_store_node(iref, &mut leaf);
            }

            // leaf is full
            if depth_total == 1 {
                // the in-inode root itself: push it down and retry
                self.ext_grow_indepth(iref, phys)?;
                continue;
            }
            if self.ext_split_and_promote(iref, &mut path, lblock, phys)? {
                return Ok(());
            }
            // a full root was grown somewhere on the way; retry
        }
    }

    /// Split the full leaf at the end of `path`, write the new entry,
    /// and promote the boundary key into the parent (splitting parents
    /// as needed). Returns false when the root had to grow instead
    /// (caller retries).
    fn ext_split_and_promote(
        &mut self,
        iref: &mut InodeRef,
        path: &mut Vec<PathLevel>,
        lblock: u64,
        phys: u64,
    ) -> Result<bool> {
        // ensure an ancestor has room, growing the root when not
        let all_full = path[..path.len() - 1]
            .iter()
            .all(|l| eh_entries(&l.bytes) >= eh_max(&l.bytes));
        if all_full {
            self.ext_grow_indepth(iref, phys)?;
            return Ok(false);
        }

        let mut leaf = path.pop().unwrap();
        let count = eh_entries(&leaf.bytes) as usize;
        let insert_at = leaf.pos.map(|p| p + 1).unwrap_or(0);
        let goal = phys;

        // appending at the very end: open an empty sibling, which
        // keeps sequential writes packing nodes densely
        let split_at = if insert_at == count { count } else { count / 2 };

        let sibling_block = self.block_alloc(iref, goal)?;
        let bsize = self.block_size();
        let mut sibling = vec![0u8; bsize];
        let moved = count - split_at;
        eh_init(&mut sibling, moved as u16, self.ext_node_capacity(), 0);
        sibling[EXT_HDR_SIZE..EXT_HDR_SIZE + moved * EXT_ENTRY_SIZE]
            .copy_from_slice(&leaf.bytes[entry_off(split_at)..entry_off(count)]);
        eh_set_entries(&mut leaf.bytes, split_at as u16);

        // place the pending entry on the correct side
        if insert_at >= split_at {
            let pos = insert_at - split_at;
            let scount = moved;
            entries_open_gap(&mut sibling, pos, scount);
            ext_write(&mut sibling, pos, lblock as u32, 1, phys);
            eh_set_entries(&mut sibling, scount as u16 + 1);
        } else {
            entries_open_gap(&mut leaf.bytes, insert_at, split_at);
            ext_write(&mut leaf.bytes, insert_at, lblock as u32, 1, phys);
            eh_set_entries(&mut leaf.bytes, split_at as u16 + 1);
        }
        let boundary = ent_key(&sibling, 0);
        self.ext_store_node(iref, &mut leaf)?;
        let mut slevel = PathLevel { block: Some(sibling_block), bytes: sibling, pos: None };
        self.ext_store_node(iref, &mut slevel)?;

        // promote (boundary, sibling_block) upward
        let mut promote_key = boundary;
        let mut promote_child = sibling_block;
        while let Some(mut node) = path.pop() {
            let count = eh_entries(&node.bytes) as usize;
            let max = eh_max(&node.bytes) as usize;
            let insert_at = node.pos.map(|p| p + 1).unwrap_or(0);
            if count < max {
                entries_open_gap(&mut node.bytes, insert_at, count);
                idx_write(&mut node.bytes, insert_at, promote_key, promote_child);
                eh_set_entries(&mut node.bytes, count as u16 + 1);
                self.ext_store_node(iref, &mut node)?;
                return Ok(true);
            }
            // split this index node too
            let split_at = if insert_at == count { count } else { count / 2 };
            let new_block = self.block_alloc(iref, goal)?;
            let mut sibling = vec![0u8; bsize];
            let moved = count - split_at;
            let depth = eh_depth(&node.bytes);
            eh_init(&mut sibling, moved as u16, self.ext_node_capacity(), depth);
            sibling[EXT_HDR_SIZE..EXT_HDR_SIZE + moved * EXT_ENTRY_SIZE]
                .copy_from_slice(&node.bytes[entry_off(split_at)..entry_off(count)]);
            eh_set_entries(&mut node.bytes, split_at as u16);
            if insert_at >= split_at {
                let pos = insert_at - split_at;
                entries_open_gap(&mut sibling, pos, moved);
                idx_write(&mut sibling, pos, promote_key, promote_child);
                eh_set_entries(&mut sibling, moved as u16 + 1);
            } else {
                entries_open_gap(&mut node.bytes, insert_at, split_at);
                idx_write(&mut node.bytes, insert_at, promote_key, promote_child);
                eh_set_entries(&mut node.bytes, split_at as u16 + 1);
            }
            promote_key = ent_key(&sibling, 0);
            self.ext_store_node(iref, &mut node)?;
            let mut slevel = PathLevel { block: Some(new_block), bytes: sibling, pos: None };
            self.ext_store_node(iref, &mut slevel)?;
            promote_child = new_block;
        }
        // path exhausted: the root was full after all
        unreachable!("index promotion walked past a root with room");
    }

    /// Allocate and map the block one past the current end of file.
    pub fn extent_append_block(&mut self, iref: &mut InodeRef) -> Result<u64> {
        let bsize = self.block_size() as u64;
        let next = num::integer::div_ceil(iref.inode.size(), bsize);
        let goal = self.inode_alloc_goal(iref)?;
        let phys = self.block_alloc(iref, goal)?;
        match self.extent_insert(iref, next, phys) {
            Ok(()) => Ok(phys),
            Err(e) => {
                // don't leak the data block on a failed insert
                let _ = self.block_free(Some(iref), phys, 1);
                Err(e)
            }
        }
    }

    /// Free all extents at logical block >= `from`; shrink the one
    /// straddling the boundary; collapse emptied levels.
    pub fn extent_truncate(&mut self, iref: &mut InodeRef, from: u64) -> Result<()> {
        let root = self.ext_root_bytes(iref)?;
        let depth = eh_depth(&root);
        let mut root_level = PathLevel { block: None, bytes: root, pos: None };
        let empty = self.ext_truncate_node(iref, &mut root_level, depth, from)?;
        if empty {
            eh_init(&mut root_level.bytes, 0, EXT_ROOT_MAX, 0);
        }
        self.ext_store_node(iref, &mut root_level)?;

        // collapse a root that points at a single shallow chain
        loop {
            let root = self.ext_root_bytes(iref)?;
            let depth = eh_depth(&root);
            if depth == 0 || eh_entries(&root) != 1 {
                break;
            }
            let child_block = idx_child(&root, 0);
            let child = self.ext_load_node(iref, child_block, depth - 1)?;
            if eh_entries(&child) > EXT_ROOT_MAX {
                break;
            }
            let mut new_root = [0u8; EXT_ROOT_SIZE];
            eh_init(&mut new_root, eh_entries(&child), EXT_ROOT_MAX, depth - 1);
            let n = eh_entries(&child) as usize;
            new_root[EXT_HDR_SIZE..entry_off(n)].copy_from_slice(&child[EXT_HDR_SIZE..entry_off(n)]);
            iref.inode.i_block[..EXT_ROOT_SIZE].copy_from_slice(&new_root);
            iref.dirty = true;
            self.block_free(Some(iref), child_block, 1)?;
            debug!("extent tree of inode {} collapsed to depth {}", iref.ino, depth - 1);
        }
        Ok(())
    }

    /// Truncate within one node; returns true when the node has no
    /// entries left.
    fn ext_truncate_node(
        &mut self,
        iref: &mut InodeRef,
        level: &mut PathLevel,
        depth: u16,
        from: u64,
    ) -> Result<bool> {
        let count = eh_entries(&level.bytes) as usize;
        if depth == 0 {
            let mut keep = count;
            for i in (0..count).rev() {
                let key = ent_key(&level.bytes, i) as u64;
                let (len, _) = len_decode(ext_len_raw(&level.bytes, i));
                if key >= from {
                    self.block_free(Some(iref), ext_start(&level.bytes, i), len as u64)?;
                    keep = i;
                } else if key + (len as u64) > from {
                    let new_len = (from - key) as u16;
                    let freed = len - new_len;
                    self.block_free(
                        Some(iref),
                        ext_start(&level.bytes, i) + new_len as u64,
                        freed as u64,
                    )?;
                    ext_set_len_raw(&mut level.bytes, i, new_len);
                    break;
                } else {
                    break;
                }
            }
            eh_set_entries(&mut level.bytes, keep as u16);
            return Ok(keep == 0);
        }

        let mut keep = count;
        for i in (0..count).rev() {
            let child_block = idx_child(&level.bytes, i);
            // child i spans [key_i, key_{i+1}); skip once wholly below
            let next_key = if i + 1 < count {
                ent_key(&level.bytes, i + 1) as u64
            } else {
                u64::MAX
            };
            if next_key <= from {
                break;
            }
            let bytes = self.ext_load_node(iref, child_block, depth - 1)?;
            let mut child = PathLevel { block: Some(child_block), bytes, pos: None };
            let empty = self.ext_truncate_node(iref, &mut child, depth - 1, from)?;
            if empty {
                self.block_free(Some(iref), child_block, 1)?;
                keep = i;
            } else {
                self.ext_store_node(iref, &mut child)?;
                break;
            }
        }
        eh_set_entries(&mut level.bytes, keep as u16);
        Ok(keep == 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::fs::Ext4Fs;
    use crate::inode::{Ext4FileType, InodeFlags};
    use crate::mkfs::{mkfs, FsProfile, MkfsOpts};
    use block_dev::memory::MemDev;
    use block_dev::Bdev;

    fn ext4_fs() -> Ext4Fs {
        let mut bdev = Bdev::new(Box::new(MemDev::new(32 * 1024 * 1024)));
        mkfs(
            &mut bdev,
            &MkfsOpts { profile: FsProfile::Ext4, block_size: 1024, ..Default::default() },
        )
        .unwrap();
        Ext4Fs::mount(bdev, false).unwrap()
    }

    fn extent_file(fs: &mut Ext4Fs) -> crate::fs::InodeRef {
        let mut iref = fs.inode_alloc(Ext4FileType::RegularFile, 0o644).unwrap();
        iref.inode.set_flag(InodeFlags::EXTENTS);
        fs.extent_tree_init(&mut iref);
        iref
    }

    fn append_blocks(fs: &mut Ext4Fs, iref: &mut crate::fs::InodeRef, n: u64) {
        let bsize = fs.block_size() as u64;
        for _ in 0..n {
            fs.extent_append_block(iref).unwrap();
            let size = iref.inode.size();
            iref.inode.set_size(size + bsize);
            iref.dirty = true;
        }
    }

    #[test]
    fn sequential_appends_merge_into_one_extent() {
        let mut fs = ext4_fs();
        let mut iref = extent_file(&mut fs);
        append_blocks(&mut fs, &mut iref, 50);
        let extents = fs.extent_all(&iref).unwrap();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].0, 0);
        assert_eq!(extents[0].2, 50);
        for i in 0..50 {
            assert_eq!(
                fs.extent_map_block(&iref, i).unwrap(),
                Some(extents[0].1 + i)
            );
        }
        assert_eq!(fs.extent_map_block(&iref, 50).unwrap(), None);
        fs.inode_put(iref).unwrap();
    }

    #[test]
    fn coverage_is_sorted_and_gapless() {
        let mut fs = ext4_fs();
        let mut iref = extent_file(&mut fs);
        // interleave with another file so physical runs break and the
        // tree accumulates several extents
        let mut other = extent_file(&mut fs);
        for _ in 0..40 {
            append_blocks(&mut fs, &mut iref, 3);
            append_blocks(&mut fs, &mut other, 2);
        }
        let extents = fs.extent_all(&iref).unwrap();
        let mut expect = 0u64;
        for (key, _phys, len, unwritten) in &extents {
            assert_eq!(*key, expect);
            assert!(!unwritten);
            expect += *len as u64;
        }
        assert_eq!(expect, 120);
        fs.inode_put(iref).unwrap();
        fs.inode_put(other).unwrap();
    }

    #[test]
    fn deep_tree_grows_and_collapses() {
        let mut fs = ext4_fs();
        let free_before = fs.sb.free_blocks_count();
        let mut iref = extent_file(&mut fs);
        let mut other = extent_file(&mut fs);
        // alternating single-block appends defeat merging, forcing
        // hundreds of distinct extents and at least one root growth
        for _ in 0..400 {
            append_blocks(&mut fs, &mut iref, 1);
            append_blocks(&mut fs, &mut other, 1);
        }
        let extents = fs.extent_all(&iref).unwrap();
        assert_eq!(extents.len(), 400);
        for i in 0..400u64 {
            assert!(fs.extent_map_block(&iref, i).unwrap().is_some());
        }
        fs.extent_truncate(&mut iref, 0).unwrap();
        iref.inode.set_size(0);
        assert_eq!(iref.inode.blocks_count(&fs.sb), 0);
        fs.extent_truncate(&mut other, 0).unwrap();
        other.inode.set_size(0);
        assert_eq!(fs.sb.free_blocks_count(), free_before);
        fs.inode_put(iref).unwrap();
        fs.inode_put(other).unwrap();
    }

    #[test]
    fn partial_truncate_shrinks_straddler() {
        let mut fs = ext4_fs();
        let mut iref = extent_file(&mut fs);
        append_blocks(&mut fs, &mut iref, 30);
        fs.extent_truncate(&mut iref, 7).unwrap();
        iref.inode.set_size(7 * fs.block_size() as u64);
        let extents = fs.extent_all(&iref).unwrap();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].2, 7);
        assert!(fs.extent_map_block(&iref, 6).unwrap().is_some());
        assert_eq!(fs.extent_map_block(&iref, 7).unwrap(), None);
        fs.inode_put(iref).unwrap();
    }
}
