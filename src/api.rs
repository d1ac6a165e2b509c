//! Top-level surface: the device registry and mount-point table, path
//! resolution, and the POSIX-style file, directory, metadata, xattr
//! and symlink operations.
//!
//! All state lives in one owned [`FsRegistry`] value; every call takes
//! the registry. Paths start with the mount-point name: with a mount
//! at `"mp"`, `/mp/dir/file` names `dir/file` on that volume.

use std::collections::HashMap;

use bitflags::bitflags;
use log::*;

use block_dev::Bdev;

use crate::dir::DirEntry;
use crate::error::{Ext4Error, Result};
use crate::fs::{Ext4Fs, InodeRef};
use crate::inode::{Ext4FileType, InodeFlags, EXT4_INLINE_SYMLINK_MAX};
use crate::sb::{IncompatFeatures, EXT4_ROOT_INO};

bitflags! {
    pub struct OpenFlags: u32 {
        const READ   = 0x01;
        const WRITE  = 0x02;
        const CREAT  = 0x04;
        const EXCL   = 0x08;
        const TRUNC  = 0x10;
        const APPEND = 0x20;
    }
}

impl OpenFlags {
    /// Parse an fopen-style mode string.
    pub fn from_mode(mode: &str) -> Result<Self> {
        Ok(match mode {
            "r" | "rb" => OpenFlags::READ,
            "w" | "wb" => OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC,
            "a" | "ab" => OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::APPEND,
            "r+" | "rb+" | "r+b" => OpenFlags::READ | OpenFlags::WRITE,
            "w+" | "wb+" | "w+b" => {
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC
            }
            "a+" | "ab+" | "a+b" => {
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::APPEND
            }
            _ => return Err(Ext4Error::InvalidArgument),
        })
    }

    pub fn readable(&self) -> bool {
        self.contains(OpenFlags::READ)
    }

    pub fn writable(&self) -> bool {
        self.contains(OpenFlags::WRITE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Set,
    Cur,
    End,
}

/// An open file: mount name, inode number and position. The inode
/// body itself is fetched on demand.
#[derive(Debug, Clone)]
pub struct Ext4File {
    mp: String,
    pub ino: u32,
    flags: OpenFlags,
    fpos: u64,
    fsize: u64,
}

impl Ext4File {
    pub fn ftell(&self) -> u64 {
        self.fpos
    }

    pub fn fsize(&self) -> u64 {
        self.fsize
    }
}

/// An open directory iterator.
#[derive(Debug, Clone)]
pub struct Ext4Dir {
    mp: String,
    pub ino: u32,
    offset: u64,
}

impl Ext4Dir {
    pub fn rewind(&mut self) {
        self.offset = 0;
    }
}

/// Optional caller-supplied serialization for one mount point.
pub trait MountLock {
    fn lock(&mut self);
    fn unlock(&mut self);
}

pub struct MountStats {
    pub block_size: u32,
    pub blocks_count: u64,
    pub free_blocks_count: u64,
    pub inodes_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
    pub volume_name: String,
}

struct MountPoint {
    dev_name: String,
    fs: Ext4Fs,
    lock: Option<Box<dyn MountLock>>,
}

/// The process-wide device registry and mount-point table, as one
/// owned value.
#[derive(Default)]
pub struct FsRegistry {
    devices: HashMap<String, Option<Bdev>>,
    mounts: HashMap<String, MountPoint>,
}

/* path helpers */

fn split_path(path: &str) -> Result<(String, Vec<Vec<u8>>)> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let mut parts = trimmed.split('/').filter(|s| !s.is_empty());
    let mp = parts.next().ok_or(Ext4Error::InvalidArgument)?.to_string();
    let segs = parts.map(|s| s.as_bytes().to_vec()).collect();
    Ok((mp, segs))
}

/// Walk `segs` from the root inode, returning the final inode number.
fn walk(fs: &mut Ext4Fs, segs: &[Vec<u8>]) -> Result<u32> {
    let mut cur = EXT4_ROOT_INO;
    for seg in segs {
        let iref = fs.inode_get(cur)?;
        if !iref.inode.is_type(Ext4FileType::Directory) {
            fs.inode_put(iref)?;
            return Err(Ext4Error::NotDirectory);
        }
        let found = fs.dir_find(&iref, seg);
        fs.inode_put(iref)?;
        cur = found?.ino;
    }
    Ok(cur)
}

/// Resolve everything but the last segment; returns (parent, leaf).
fn resolve_parent<'a>(fs: &mut Ext4Fs, segs: &'a [Vec<u8>]) -> Result<(u32, &'a [u8])> {
    let (leaf, ancestors) = segs.split_last().ok_or(Ext4Error::InvalidArgument)?;
    let parent = walk(fs, ancestors)?;
    Ok((parent, leaf))
}

/// Allocate and link a fresh inode under `parent`.
fn create_entry(
    fs: &mut Ext4Fs,
    parent_ino: u32,
    name: &[u8],
    ftype: Ext4FileType,
    perm: u16,
) -> Result<u32> {
    let mut child = fs.inode_alloc(ftype, perm)?;
    if ftype != Ext4FileType::Symlink && fs.has_feature_incompat(IncompatFeatures::EXTENTS) {
        child.inode.set_flag(InodeFlags::EXTENTS);
        fs.extent_tree_init(&mut child);
    }
    let child_ino = child.ino;
    let res = (|| -> Result<()> {
        if ftype == Ext4FileType::Directory {
            fs.dir_init_new(&mut child, parent_ino)?;
        } else {
            child.inode.set_links_count(1);
        }
        let mut parent = fs.inode_get(parent_ino)?;
        let add = fs.dir_add(&mut parent, name, child_ino, ftype);
        if add.is_ok() && ftype == Ext4FileType::Directory {
            let links = parent.inode.links_count() + 1; // the child's `..`
            parent.inode.set_links_count(links);
            parent.dirty = true;
        }
        fs.inode_put(parent)?;
        add
    })();
    match res {
        Ok(()) => {
            fs.inode_put(child)?;
            Ok(child_ino)
        }
        Err(e) => {
            // undo the allocation; the directory was never linked
            fs.inode_shrink_blocks(&mut child, 0).ok();
            fs.inode_free(child).ok();
            Err(e)
        }
    }
}

/// Release the data blocks of an inode being deleted.
fn release_blocks(fs: &mut Ext4Fs, iref: &mut InodeRef) -> Result<()> {
    match iref.inode.file_type()? {
        Ext4FileType::RegularFile | Ext4FileType::Directory => {
            fs.inode_shrink_blocks(iref, 0)?;
            iref.inode.set_size(0);
            iref.dirty = true;
        }
        Ext4FileType::Symlink => {
            if !iref.inode.is_inline_symlink() {
                fs.inode_shrink_blocks(iref, 0)?;
            }
            iref.inode.set_size(0);
            iref.dirty = true;
        }
        _ => {}
    }
    Ok(())
}

/// Drop one link; free the inode when the count hits zero.
fn drop_link(fs: &mut Ext4Fs, ino: u32) -> Result<()> {
    let mut iref = fs.inode_get(ino)?;
    let links = iref.inode.links_count();
    if links > 1 {
        iref.inode.set_links_count(links - 1);
        iref.inode.i_ctime.set(crate::now_epoch());
        iref.dirty = true;
        return fs.inode_put(iref);
    }
    release_blocks(fs, &mut iref)?;
    fs.xattr_purge(&mut iref)?;
    fs.inode_free(iref)
}

impl FsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /* ---------------- mount management ---------------- */

    pub fn register_device(&mut self, name: &str, bdev: Bdev) -> Result<()> {
        if self.devices.contains_key(name) {
            return Err(Ext4Error::Exists);
        }
        self.devices.insert(name.to_string(), Some(bdev));
        Ok(())
    }

    pub fn unregister_device(&mut self, name: &str) -> Result<Bdev> {
        match self.devices.get(name) {
            None => Err(Ext4Error::NotFound),
            Some(None) => Err(Ext4Error::InvalidArgument), // still mounted
            Some(Some(_)) => self
                .devices
                .remove(name)
                .flatten()
                .ok_or(Ext4Error::NotFound),
        }
    }

    pub fn mount(&mut self, dev_name: &str, mp_name: &str, read_only: bool) -> Result<()> {
        let mp_name = mp_name.trim_matches('/').to_string();
        if mp_name.is_empty() || mp_name.contains('/') {
            return Err(Ext4Error::InvalidArgument);
        }
        if self.mounts.contains_key(&mp_name) {
            return Err(Ext4Error::Exists);
        }
        let slot = self.devices.get_mut(dev_name).ok_or(Ext4Error::NotFound)?;
        let bdev = slot.take().ok_or(Ext4Error::InvalidArgument)?;
        match Ext4Fs::mount(bdev, read_only) {
            Ok(mut fs) => {
                if let Err(e) = fs.check_root() {
                    if let Ok(bdev) = fs.umount() {
                        if let Some(slot) = self.devices.get_mut(dev_name) {
                            *slot = Some(bdev);
                        }
                    }
                    return Err(e);
                }
                self.mounts.insert(
                    mp_name.clone(),
                    MountPoint { dev_name: dev_name.to_string(), fs, lock: None },
                );
                info!("mounted {} at /{}/", dev_name, mp_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn umount(&mut self, mp_name: &str) -> Result<()> {
        let mp_name = mp_name.trim_matches('/');
        let mp = self.mounts.remove(mp_name).ok_or(Ext4Error::NotFound)?;
        let dev_name = mp.dev_name.clone();
        let bdev = mp.fs.umount()?;
        if let Some(slot) = self.devices.get_mut(&dev_name) {
            *slot = Some(bdev);
        }
        info!("unmounted /{}/", mp_name);
        Ok(())
    }

    /// Install a caller-supplied lock pair for one mount point.
    pub fn set_lock(&mut self, mp_name: &str, lock: Box<dyn MountLock>) -> Result<()> {
        let mp = self
            .mounts
            .get_mut(mp_name.trim_matches('/'))
            .ok_or(Ext4Error::NotFound)?;
        mp.lock = Some(lock);
        Ok(())
    }

    fn with_fs<R>(
        &mut self,
        mp_name: &str,
        f: impl FnOnce(&mut Ext4Fs) -> Result<R>,
    ) -> Result<R> {
        let mp = self
            .mounts
            .get_mut(mp_name.trim_matches('/'))
            .ok_or(Ext4Error::NotFound)?;
        if let Some(lock) = mp.lock.as_mut() {
            lock.lock();
        }
        let r = f(&mut mp.fs);
        if let Some(lock) = mp.lock.as_mut() {
            lock.unlock();
        }
        r
    }

    pub fn journal_start(&mut self, mp_name: &str) -> Result<()> {
        self.with_fs(mp_name, |fs| fs.journal_start())
    }

    pub fn journal_stop(&mut self, mp_name: &str) -> Result<()> {
        self.with_fs(mp_name, |fs| fs.journal_stop())
    }

    pub fn recover(&mut self, mp_name: &str) -> Result<()> {
        self.with_fs(mp_name, |fs| fs.journal_recover())
    }

    pub fn mount_point_stats(&mut self, mp_name: &str) -> Result<MountStats> {
        self.with_fs(mp_name, |fs| {
            let mut used_dirs = 0u32;
            for g in 0..fs.sb.group_count() {
                let gref = fs.group_get(g)?;
                used_dirs += gref.desc.used_dirs_count(&fs.sb);
                fs.group_put(gref)?;
            }
            let name_end = fs
                .sb
                .s_volume_name
                .iter()
                .position(|c| *c == 0)
                .unwrap_or(fs.sb.s_volume_name.len());
            Ok(MountStats {
                block_size: fs.sb.block_size(),
                blocks_count: fs.sb.blocks_count(),
                free_blocks_count: fs.sb.free_blocks_count(),
                inodes_count: fs.sb.s_inodes_count.get(),
                free_inodes_count: fs.sb.s_free_inodes_count.get(),
                used_dirs_count: used_dirs,
                volume_name: String::from_utf8_lossy(&fs.sb.s_volume_name[..name_end])
                    .into_owned(),
            })
        })
    }

    /// Transfer counters of the device behind a mount point.
    pub fn device_stats(&mut self, mp_name: &str) -> Result<block_dev::DevStats> {
        self.with_fs(mp_name, |fs| Ok(fs.bdev.stats()))
    }

    pub fn cache_write_back(&mut self, mp_name: &str, on: bool) -> Result<()> {
        self.with_fs(mp_name, |fs| fs.bcache.write_back(&mut fs.bdev, on))
    }

    pub fn cache_flush(&mut self, mp_name: &str) -> Result<()> {
        self.with_fs(mp_name, |fs| fs.bcache.flush_all(&mut fs.bdev))
    }

    /* ---------------- file operations ---------------- */

    pub fn fopen(&mut self, path: &str, mode: &str) -> Result<Ext4File> {
        let flags = OpenFlags::from_mode(mode)?;
        let (mp, segs) = split_path(path)?;
        if segs.is_empty() {
            return Err(Ext4Error::IsDirectory);
        }
        self.with_fs(&mp, |fs| {
            if flags.writable() {
                fs.check_writable()?;
            }
            let (parent_ino, leaf) = resolve_parent(fs, &segs)?;
            let parent = fs.inode_get(parent_ino)?;
            let found = fs.dir_find(&parent, leaf);
            fs.inode_put(parent)?;
            let ino = match found {
                Ok(entry) => {
                    if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                        return Err(Ext4Error::Exists);
                    }
                    entry.ino
                }
                Err(Ext4Error::NotFound) if flags.contains(OpenFlags::CREAT) => {
                    fs.trans_start()?;
                    let r = create_entry(fs, parent_ino, leaf, Ext4FileType::RegularFile, 0o644);
                    fs.trans_stop()?;
                    r?
                }
                Err(e) => return Err(e),
            };
            let mut iref = fs.inode_get(ino)?;
            if iref.inode.is_type(Ext4FileType::Directory) {
                fs.inode_put(iref)?;
                return Err(Ext4Error::IsDirectory);
            }
            if flags.contains(OpenFlags::TRUNC) && iref.inode.size() > 0 {
                fs.trans_start()?;
                let r = fs.truncate_inode(&mut iref, 0);
                let r2 = fs.trans_stop();
                r?;
                r2?;
            }
            let fsize = iref.inode.size();
            fs.inode_put(iref)?;
            Ok(Ext4File {
                mp: mp.clone(),
                ino,
                flags,
                fpos: if flags.contains(OpenFlags::APPEND) { fsize } else { 0 },
                fsize,
            })
        })
    }

    /// Close a file handle. Flushes nothing by itself (writes go
    /// through the cache); kept for API symmetry and future buffering.
    pub fn fclose(&mut self, _file: Ext4File) -> Result<()> {
        Ok(())
    }

    pub fn fread(&mut self, file: &mut Ext4File, buf: &mut [u8]) -> Result<usize> {
        if !file.flags.readable() {
            return Err(Ext4Error::InvalidArgument);
        }
        let mp = file.mp.clone();
        self.with_fs(&mp, |fs| {
            let iref = fs.inode_get(file.ino)?;
            let size = iref.inode.size();
            file.fsize = size;
            if file.fpos >= size {
                fs.inode_put(iref)?;
                return Ok(0);
            }
            let bsize = fs.block_size() as u64;
            let want = (buf.len() as u64).min(size - file.fpos) as usize;
            let mut done = 0usize;
            while done < want {
                let pos = file.fpos + done as u64;
                let sblock = pos / bsize;
                let off = (pos % bsize) as usize;
                let chunk = (bsize as usize - off).min(want - done);
                match fs.inode_map_block(&iref, sblock)? {
                    Some(phys) => {
                        let bref = fs.block_get(phys)?;
                        bref.read_at(off, &mut buf[done..done + chunk]);
                        fs.block_set(bref)?;
                    }
                    None => {
                        // hole or unwritten extent reads as zeros
                        buf[done..done + chunk].fill(0);
                    }
                }
                done += chunk;
            }
            fs.inode_put(iref)?;
            file.fpos += done as u64;
            Ok(done)
        })
    }

    pub fn fwrite(&mut self, file: &mut Ext4File, data: &[u8]) -> Result<usize> {
        if !file.flags.writable() {
            return Err(Ext4Error::InvalidArgument);
        }
        let mp = file.mp.clone();
        self.with_fs(&mp, |fs| {
            fs.check_writable()?;
            fs.trans_start()?;
            let r = write_locked(fs, file, data);
            let r2 = fs.trans_stop();
            let n = r?;
            r2?;
            Ok(n)
        })
    }

    pub fn fseek(&mut self, file: &mut Ext4File, offset: i64, origin: SeekOrigin) -> Result<u64> {
        let mp = file.mp.clone();
        let size = self.with_fs(&mp, |fs| {
            let iref = fs.inode_get(file.ino)?;
            let size = iref.inode.size();
            fs.inode_put(iref)?;
            Ok(size)
        })?;
        file.fsize = size;
        let base = match origin {
            SeekOrigin::Set => 0i64,
            SeekOrigin::Cur => file.fpos as i64,
            SeekOrigin::End => size as i64,
        };
        let target = base.checked_add(offset).ok_or(Ext4Error::InvalidArgument)?;
        if target < 0 {
            return Err(Ext4Error::OutOfRange);
        }
        if !file.flags.writable() && target as u64 > size {
            return Err(Ext4Error::OutOfRange);
        }
        file.fpos = target as u64;
        Ok(file.fpos)
    }

    pub fn ftruncate(&mut self, file: &mut Ext4File, size: u64) -> Result<()> {
        if !file.flags.writable() {
            return Err(Ext4Error::InvalidArgument);
        }
        let mp = file.mp.clone();
        self.with_fs(&mp, |fs| {
            fs.trans_start()?;
            let r = (|| {
                let mut iref = fs.inode_get(file.ino)?;
                let res = fs.truncate_inode(&mut iref, size);
                fs.inode_put(iref)?;
                res
            })();
            let r2 = fs.trans_stop();
            r?;
            r2
        })?;
        file.fsize = size;
        file.fpos = file.fpos.min(size);
        Ok(())
    }

    pub fn fsize(&mut self, path: &str) -> Result<u64> {
        let (mp, segs) = split_path(path)?;
        self.with_fs(&mp, |fs| {
            let ino = walk(fs, &segs)?;
            let iref = fs.inode_get(ino)?;
            let size = iref.inode.size();
            fs.inode_put(iref)?;
            Ok(size)
        })
    }

    /// Unlink a file (or symlink/device node).
    pub fn fremove(&mut self, path: &str) -> Result<()> {
        let (mp, segs) = split_path(path)?;
        self.with_fs(&mp, |fs| {
            fs.check_writable()?;
            let (parent_ino, leaf) = resolve_parent(fs, &segs)?;
            let mut parent = fs.inode_get(parent_ino)?;
            let entry = match fs.dir_find(&parent, leaf) {
                Ok(e) => e,
                Err(e) => {
                    fs.inode_put(parent)?;
                    return Err(e);
                }
            };
            let target = fs.inode_get(entry.ino)?;
            let is_dir = target.inode.is_type(Ext4FileType::Directory);
            fs.inode_put(target)?;
            if is_dir {
                fs.inode_put(parent)?;
                return Err(Ext4Error::IsDirectory);
            }
            fs.trans_start()?;
            let r = (|| {
                fs.dir_remove(&mut parent, leaf)?;
                drop_link(fs, entry.ino)
            })();
            let put = fs.inode_put(parent);
            let r2 = fs.trans_stop();
            r?;
            put?;
            r2
        })
    }

    /// Hard-link `path` under a second name.
    pub fn flink(&mut self, path: &str, hardlink_path: &str) -> Result<()> {
        let (mp, segs) = split_path(path)?;
        let (mp2, segs2) = split_path(hardlink_path)?;
        if mp != mp2 {
            return Err(Ext4Error::InvalidArgument);
        }
        self.with_fs(&mp, |fs| {
            fs.check_writable()?;
            let ino = walk(fs, &segs)?;
            let mut iref = fs.inode_get(ino)?;
            let ftype = match iref.inode.file_type() {
                Ok(t) => t,
                Err(e) => {
                    fs.inode_put(iref)?;
                    return Err(e);
                }
            };
            if ftype == Ext4FileType::Directory {
                fs.inode_put(iref)?;
                return Err(Ext4Error::IsDirectory);
            }
            let (parent_ino, leaf) = resolve_parent(fs, &segs2)?;
            fs.trans_start()?;
            let r = (|| {
                let mut parent = fs.inode_get(parent_ino)?;
                let add = fs.dir_add(&mut parent, leaf, ino, ftype);
                fs.inode_put(parent)?;
                add
            })();
            if r.is_ok() {
                let links = iref.inode.links_count() + 1;
                iref.inode.set_links_count(links);
                iref.inode.i_ctime.set(crate::now_epoch());
                iref.dirty = true;
            }
            let put = fs.inode_put(iref);
            let r2 = fs.trans_stop();
            r?;
            put?;
            r2
        })
    }

    /// Rename (or move) a file or directory.
    pub fn frename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        let (mp, old_segs) = split_path(old_path)?;
        let (mp2, new_segs) = split_path(new_path)?;
        if mp != mp2 {
            return Err(Ext4Error::InvalidArgument);
        }
        self.with_fs(&mp, |fs| {
            fs.check_writable()?;
            let (old_parent, old_leaf) = resolve_parent(fs, &old_segs)?;
            let (new_parent, new_leaf) = resolve_parent(fs, &new_segs)?;

            let parent = fs.inode_get(old_parent)?;
            let found = fs.dir_find(&parent, old_leaf);
            fs.inode_put(parent)?;
            let entry = found?;
            let src_ino = entry.ino;
            let src = fs.inode_get(src_ino)?;
            let src_is_dir = src.inode.is_type(Ext4FileType::Directory);
            let src_type = src.inode.file_type()?;
            fs.inode_put(src)?;

            let parent = fs.inode_get(new_parent)?;
            let existing = match fs.dir_find(&parent, new_leaf) {
                Ok(e) => Some(e),
                Err(Ext4Error::NotFound) => None,
                Err(e) => {
                    fs.inode_put(parent)?;
                    return Err(e);
                }
            };
            fs.inode_put(parent)?;
            let mut dst_is_dir = false;
            if let Some(dst) = &existing {
                if dst.ino == src_ino {
                    return Ok(());
                }
                let dref = fs.inode_get(dst.ino)?;
                dst_is_dir = dref.inode.is_type(Ext4FileType::Directory);
                let empty = if dst_is_dir { fs.dir_is_empty(&dref)? } else { true };
                fs.inode_put(dref)?;
                if dst_is_dir != src_is_dir {
                    return Err(if dst_is_dir {
                        Ext4Error::IsDirectory
                    } else {
                        Ext4Error::NotDirectory
                    });
                }
                if dst_is_dir && !empty {
                    return Err(Ext4Error::NotEmpty);
                }
            }

            fs.trans_start()?;
            let r = (|| -> Result<()> {
                match &existing {
                    Some(dst) => {
                        // in-place inode swap on the existing entry
                        let parent = fs.inode_get(new_parent)?;
                        let set = fs.dir_set_entry_ino(&parent, new_leaf, src_ino);
                        fs.inode_put(parent)?;
                        set?;
                        if dst_is_dir {
                            // an empty directory is being replaced
                            let mut victim = fs.inode_get(dst.ino)?;
                            release_blocks(fs, &mut victim)?;
                            fs.xattr_purge(&mut victim)?;
                            fs.inode_free(victim)?;
                            if new_parent == old_parent {
                                // its `..` link dies and nothing
                                // replaces it within this parent
                                let mut p = fs.inode_get(new_parent)?;
                                let links = p.inode.links_count() - 1;
                                p.inode.set_links_count(links);
                                p.dirty = true;
                                fs.inode_put(p)?;
                            }
                        } else {
                            drop_link(fs, dst.ino)?;
                        }
                    }
                    None => {
                        let mut parent = fs.inode_get(new_parent)?;
                        let add = fs.dir_add(&mut parent, new_leaf, src_ino, src_type);
                        if add.is_ok() && src_is_dir && new_parent != old_parent {
                            let links = parent.inode.links_count() + 1;
                            parent.inode.set_links_count(links);
                            parent.dirty = true;
                        }
                        fs.inode_put(parent)?;
                        add?;
                    }
                }
                let mut parent = fs.inode_get(old_parent)?;
                let rm = fs.dir_remove(&mut parent, old_leaf);
                if rm.is_ok() && src_is_dir && new_parent != old_parent {
                    let links = parent.inode.links_count() - 1;
                    parent.inode.set_links_count(links);
                    parent.dirty = true;
                }
                fs.inode_put(parent)?;
                rm?;
                if src_is_dir && new_parent != old_parent {
                    // point the moved directory's `..` at its new home
                    let child = fs.inode_get(src_ino)?;
                    let set = fs.dir_update_dotdot(&child, new_parent);
                    fs.inode_put(child)?;
                    set?;
                }
                Ok(())
            })();
            let r2 = fs.trans_stop();
            r?;
            r2
        })
    }

    /* ---------------- directories ---------------- */

    pub fn dir_mk(&mut self, path: &str) -> Result<()> {
        let (mp, segs) = split_path(path)?;
        self.with_fs(&mp, |fs| {
            fs.check_writable()?;
            let (parent_ino, leaf) = resolve_parent(fs, &segs)?;
            let parent = fs.inode_get(parent_ino)?;
            let exists = fs.dir_find(&parent, leaf).is_ok();
            fs.inode_put(parent)?;
            if exists {
                return Err(Ext4Error::Exists);
            }
            fs.trans_start()?;
            let r = create_entry(fs, parent_ino, leaf, Ext4FileType::Directory, 0o755);
            let r2 = fs.trans_stop();
            r?;
            r2
        })
    }

    pub fn dir_rm(&mut self, path: &str) -> Result<()> {
        let (mp, segs) = split_path(path)?;
        self.with_fs(&mp, |fs| {
            fs.check_writable()?;
            let (parent_ino, leaf) = resolve_parent(fs, &segs)?;
            let mut parent = fs.inode_get(parent_ino)?;
            let entry = match fs.dir_find(&parent, leaf) {
                Ok(e) => e,
                Err(e) => {
                    fs.inode_put(parent)?;
                    return Err(e);
                }
            };
            let child = fs.inode_get(entry.ino)?;
            let is_dir = child.inode.is_type(Ext4FileType::Directory);
            let empty = if is_dir { fs.dir_is_empty(&child)? } else { false };
            fs.inode_put(child)?;
            if !is_dir {
                fs.inode_put(parent)?;
                return Err(Ext4Error::NotDirectory);
            }
            if !empty {
                fs.inode_put(parent)?;
                return Err(Ext4Error::NotEmpty);
            }
            fs.trans_start()?;
            let r = (|| -> Result<()> {
                fs.dir_remove(&mut parent, leaf)?;
                let links = parent.inode.links_count() - 1; // child's `..`
                parent.inode.set_links_count(links);
                parent.dirty = true;
                let mut child = fs.inode_get(entry.ino)?;
                release_blocks(fs, &mut child)?;
                fs.xattr_purge(&mut child)?;
                fs.inode_free(child)
            })();
            let put = fs.inode_put(parent);
            let r2 = fs.trans_stop();
            r?;
            put?;
            r2
        })
    }

    pub fn dir_mv(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        self.frename(old_path, new_path)
    }

    pub fn dir_open(&mut self, path: &str) -> Result<Ext4Dir> {
        let (mp, segs) = split_path(path)?;
        self.with_fs(&mp, |fs| {
            let ino = walk(fs, &segs)?;
            let iref = fs.inode_get(ino)?;
            let is_dir = iref.inode.is_type(Ext4FileType::Directory);
            fs.inode_put(iref)?;
            if !is_dir {
                return Err(Ext4Error::NotDirectory);
            }
            Ok(Ext4Dir { mp: mp.clone(), ino, offset: 0 })
        })
    }

    pub fn dir_close(&mut self, _dir: Ext4Dir) -> Result<()> {
        Ok(())
    }

    pub fn dir_entry_next(&mut self, dir: &mut Ext4Dir) -> Result<Option<DirEntry>> {
        let mp = dir.mp.clone();
        self.with_fs(&mp, |fs| {
            let iref = fs.inode_get(dir.ino)?;
            let next = fs.dir_entry_next(&iref, dir.offset);
            fs.inode_put(iref)?;
            match next? {
                Some((entry, next_offset)) => {
                    dir.offset = next_offset;
                    Ok(Some(entry))
                }
                None => Ok(None),
            }
        })
    }

    pub fn dir_entry_rewind(&mut self, dir: &mut Ext4Dir) {
        dir.rewind();
    }

    /* ---------------- metadata ---------------- */

    fn with_inode<R>(
        &mut self,
        path: &str,
        f: impl FnOnce(&mut Ext4Fs, &mut InodeRef) -> Result<R>,
    ) -> Result<R> {
        let (mp, segs) = split_path(path)?;
        self.with_fs(&mp, |fs| {
            let ino = walk(fs, &segs)?;
            let mut iref = fs.inode_get(ino)?;
            let r = f(fs, &mut iref);
            fs.inode_put(iref)?;
            r
        })
    }

    fn with_inode_mut<R>(
        &mut self,
        path: &str,
        f: impl FnOnce(&mut Ext4Fs, &mut InodeRef) -> Result<R>,
    ) -> Result<R> {
        let (mp, segs) = split_path(path)?;
        self.with_fs(&mp, |fs| {
            fs.check_writable()?;
            let ino = walk(fs, &segs)?;
            let mut iref = fs.inode_get(ino)?;
            fs.trans_start()?;
            let r = f(fs, &mut iref);
            if r.is_ok() {
                iref.dirty = true;
            }
            let put = fs.inode_put(iref);
            let r2 = fs.trans_stop();
            let r = r?;
            put?;
            r2?;
            Ok(r)
        })
    }

    pub fn mode_get(&mut self, path: &str) -> Result<u16> {
        self.with_inode(path, |_fs, iref| Ok(iref.inode.i_mode.get()))
    }

    pub fn mode_set(&mut self, path: &str, perm: u16) -> Result<()> {
        self.with_inode_mut(path, |_fs, iref| {
            iref.inode.set_mode_perm(perm);
            iref.inode.i_ctime.set(crate::now_epoch());
            Ok(())
        })
    }

    pub fn owner_get(&mut self, path: &str) -> Result<(u32, u32)> {
        self.with_inode(path, |_fs, iref| Ok((iref.inode.uid(), iref.inode.gid())))
    }

    pub fn owner_set(&mut self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.with_inode_mut(path, |_fs, iref| {
            iref.inode.set_uid(uid);
            iref.inode.set_gid(gid);
            iref.inode.i_ctime.set(crate::now_epoch());
            Ok(())
        })
    }

    pub fn atime_get(&mut self, path: &str) -> Result<u32> {
        self.with_inode(path, |_fs, iref| Ok(iref.inode.i_atime.get()))
    }

    pub fn mtime_get(&mut self, path: &str) -> Result<u32> {
        self.with_inode(path, |_fs, iref| Ok(iref.inode.i_mtime.get()))
    }

    pub fn ctime_get(&mut self, path: &str) -> Result<u32> {
        self.with_inode(path, |_fs, iref| Ok(iref.inode.i_ctime.get()))
    }

    pub fn atime_set(&mut self, path: &str, t: u32) -> Result<()> {
        self.with_inode_mut(path, |_fs, iref| {
            iref.inode.i_atime.set(t);
            Ok(())
        })
    }

    pub fn mtime_set(&mut self, path: &str, t: u32) -> Result<()> {
        self.with_inode_mut(path, |_fs, iref| {
            iref.inode.i_mtime.set(t);
            Ok(())
        })
    }

    pub fn ctime_set(&mut self, path: &str, t: u32) -> Result<()> {
        self.with_inode_mut(path, |_fs, iref| {
            iref.inode.i_ctime.set(t);
            Ok(())
        })
    }

    pub fn inode_exist(&mut self, path: &str) -> Result<bool> {
        let (mp, segs) = split_path(path)?;
        self.with_fs(&mp, |fs| match walk(fs, &segs) {
            Ok(_) => Ok(true),
            Err(Ext4Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        })
    }

    /// The raw on-disk inode slot behind a path, plus its number.
    pub fn raw_inode_fill(&mut self, path: &str) -> Result<(u32, Vec<u8>)> {
        let (mp, segs) = split_path(path)?;
        self.with_fs(&mp, |fs| {
            let ino = walk(fs, &segs)?;
            let raw = fs.raw_inode_fill(ino)?;
            Ok((ino, raw))
        })
    }

    /* ---------------- xattrs ---------------- */

    pub fn setxattr(&mut self, path: &str, name: &[u8], value: &[u8]) -> Result<()> {
        self.with_inode_mut(path, |fs, iref| fs.xattr_set(iref, name, value))
    }

    pub fn getxattr(&mut self, path: &str, name: &[u8]) -> Result<Vec<u8>> {
        self.with_inode(path, |fs, iref| fs.xattr_get(iref, name))
    }

    pub fn listxattr(&mut self, path: &str) -> Result<Vec<String>> {
        self.with_inode(path, |fs, iref| fs.xattr_list(iref))
    }

    pub fn removexattr(&mut self, path: &str, name: &[u8]) -> Result<()> {
        self.with_inode_mut(path, |fs, iref| fs.xattr_remove(iref, name))
    }

    /* ---------------- symlinks and device nodes ---------------- */

    pub fn fsymlink(&mut self, target: &str, path: &str) -> Result<()> {
        let (mp, segs) = split_path(path)?;
        let target = target.as_bytes().to_vec();
        if target.is_empty() {
            return Err(Ext4Error::InvalidArgument);
        }
        self.with_fs(&mp, |fs| {
            fs.check_writable()?;
            let (parent_ino, leaf) = resolve_parent(fs, &segs)?;
            let parent = fs.inode_get(parent_ino)?;
            let exists = fs.dir_find(&parent, leaf).is_ok();
            fs.inode_put(parent)?;
            if exists {
                return Err(Ext4Error::Exists);
            }
            fs.trans_start()?;
            let r = (|| -> Result<()> {
                let ino = create_entry(fs, parent_ino, leaf, Ext4FileType::Symlink, 0o777)?;
                let mut iref = fs.inode_get(ino)?;
                if target.len() <= EXT4_INLINE_SYMLINK_MAX {
                    iref.inode.set_inline_symlink(&target);
                    iref.dirty = true;
                } else {
                    // long target: spill into data blocks
                    if fs.has_feature_incompat(IncompatFeatures::EXTENTS) {
                        iref.inode.set_flag(InodeFlags::EXTENTS);
                        fs.extent_tree_init(&mut iref);
                    }
                    let bsize = fs.block_size();
                    let mut off = 0usize;
                    while off < target.len() {
                        let phys = fs.inode_append_block(&mut iref)?;
                        let chunk = bsize.min(target.len() - off);
                        let bref = fs.block_get_noread(phys)?;
                        bref.borrow_mut().data.fill(0);
                        bref.write_at(0, &target[off..off + chunk]);
                        fs.bcache.mark_dirty(&bref);
                        fs.block_set(bref)?;
                        off += chunk;
                        iref.inode.set_size(off as u64);
                        iref.dirty = true;
                    }
                }
                fs.inode_put(iref)
            })();
            let r2 = fs.trans_stop();
            r?;
            r2
        })
    }

    pub fn readlink(&mut self, path: &str) -> Result<Vec<u8>> {
        self.with_inode(path, |fs, iref| {
            if !iref.inode.is_type(Ext4FileType::Symlink) {
                return Err(Ext4Error::InvalidArgument);
            }
            if iref.inode.is_inline_symlink() {
                return Ok(iref.inode.inline_symlink().to_vec());
            }
            let size = iref.inode.size() as usize;
            let bsize = fs.block_size();
            let mut out = vec![0u8; size];
            let mut off = 0usize;
            while off < size {
                let sblock = (off / bsize) as u64;
                let chunk = bsize.min(size - off);
                match fs.inode_map_block(iref, sblock)? {
                    Some(phys) => {
                        let bref = fs.block_get(phys)?;
                        bref.read_at(0, &mut out[off..off + chunk]);
                        fs.block_set(bref)?;
                    }
                    None => return Err(Ext4Error::Corrupted),
                }
                off += chunk;
            }
            Ok(out)
        })
    }

    pub fn mknod(&mut self, path: &str, ftype: Ext4FileType, dev: u32) -> Result<()> {
        if !matches!(
            ftype,
            Ext4FileType::CharDev | Ext4FileType::BlockDev | Ext4FileType::Fifo | Ext4FileType::Socket
        ) {
            return Err(Ext4Error::InvalidArgument);
        }
        let (mp, segs) = split_path(path)?;
        self.with_fs(&mp, |fs| {
            fs.check_writable()?;
            let (parent_ino, leaf) = resolve_parent(fs, &segs)?;
            fs.trans_start()?;
            let r = (|| -> Result<()> {
                let ino = create_entry(fs, parent_ino, leaf, ftype, 0o644)?;
                if matches!(ftype, Ext4FileType::CharDev | Ext4FileType::BlockDev) {
                    let mut iref = fs.inode_get(ino)?;
                    iref.inode.set_dev(dev);
                    iref.dirty = true;
                    fs.inode_put(iref)?;
                }
                Ok(())
            })();
            let r2 = fs.trans_stop();
            r?;
            r2
        })
    }
}

/// Write path shared by `fwrite`: map-or-append each block, with data
/// blocks flushed write-through so a post-commit crash never loses
/// committed file content.
fn write_locked(fs: &mut Ext4Fs, file: &mut Ext4File, data: &[u8]) -> Result<usize> {
    let mut iref = fs.inode_get(file.ino)?;
    let old_size = iref.inode.size();
    if file.flags.contains(OpenFlags::APPEND) {
        file.fpos = old_size;
    }
    let bsize = fs.block_size() as u64;
    let old_blocks = num::integer::div_ceil(old_size, bsize);
    let mut done = 0usize;
    let res = (|| -> Result<()> {
        while done < data.len() {
            let pos = file.fpos + done as u64;
            let sblock = pos / bsize;
            let off = (pos % bsize) as usize;
            let chunk = (bsize as usize - off).min(data.len() - done);
            let fresh = sblock >= old_blocks;
            let phys = if !fresh {
                match fs.inode_map_block(&iref, sblock)? {
                    Some(p) => p,
                    // writing into holes of foreign sparse files is
                    // not implemented
                    None => return Err(Ext4Error::NotSupported),
                }
            } else {
                let mut phys = 0u64;
                let covered = num::integer::div_ceil(iref.inode.size(), bsize);
                for i in covered..=sblock {
                    phys = fs.inode_append_block(&mut iref)?;
                    iref.inode.set_size((i + 1) * bsize);
                    iref.dirty = true;
                    if i < sblock {
                        // a seek left a gap; materialize it as zeros
                        let bref = fs.block_get_noread(phys)?;
                        bref.borrow_mut().data.fill(0);
                        fs.bcache.mark_dirty(&bref);
                        let lba = bref.lba;
                        fs.block_set(bref)?;
                        fs.bcache.flush(&mut fs.bdev, lba)?;
                    }
                }
                phys
            };
            let full = chunk == bsize as usize;
            let bref = if full || fresh {
                let b = fs.block_get_noread(phys)?;
                if fresh && !full {
                    b.borrow_mut().data.fill(0);
                }
                b
            } else {
                fs.block_get(phys)?
            };
            bref.write_at(off, &data[done..done + chunk]);
            fs.bcache.mark_dirty(&bref);
            let lba = bref.lba;
            fs.block_set(bref)?;
            fs.bcache.flush(&mut fs.bdev, lba)?;
            done += chunk;
        }
        Ok(())
    })();
    let end = file.fpos + done as u64;
    let final_size = old_size.max(end);
    if iref.inode.size() != final_size {
        iref.inode.set_size(final_size);
    }
    iref.inode.i_mtime.set(crate::now_epoch());
    iref.dirty = true;
    file.fpos = end;
    file.fsize = final_size;
    fs.inode_put(iref)?;
    res?;
    Ok(done)
}
