//! JBD2-compatible journal: transactions over metadata blocks, revoke
//! tracking, commit records and crash recovery.
//!
//! Journal records are big-endian. The log lives in the file behind
//! the superblock's journal inode (8 by default): a 1024-byte journal
//! superblock followed by a circular run of block-sized records.

use std::collections::{HashMap, HashSet};

use log::*;
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::cache::{Bcache, BlockRef};
use crate::error::{Ext4Error, Result};
use crate::fs::Ext4Fs;
use crate::sb::{CompatFeatures, IncompatFeatures};
use crate::types::Be32;

pub const JBD2_MAGIC: u32 = 0xC03B_3998;

/* block types */
pub const JBD2_DESCRIPTOR_BLOCK: u32 = 1;
pub const JBD2_COMMIT_BLOCK: u32 = 2;
pub const JBD2_SUPERBLOCK_V1: u32 = 3;
pub const JBD2_SUPERBLOCK_V2: u32 = 4;
pub const JBD2_REVOKE_BLOCK: u32 = 5;

/* tag flags */
pub const JBD2_FLAG_ESCAPE: u32 = 1;
pub const JBD2_FLAG_SAME_UUID: u32 = 2;
pub const JBD2_FLAG_DELETED: u32 = 4;
pub const JBD2_FLAG_LAST_TAG: u32 = 8;

/* journal incompat features */
pub const JBD2_FEATURE_INCOMPAT_REVOKE: u32 = 0x0001;
pub const JBD2_FEATURE_INCOMPAT_64BIT: u32 = 0x0002;
pub const JBD2_FEATURE_INCOMPAT_ASYNC_COMMIT: u32 = 0x0004;
pub const JBD2_FEATURE_INCOMPAT_CSUM_V2: u32 = 0x0008;
pub const JBD2_FEATURE_INCOMPAT_CSUM_V3: u32 = 0x0010;

const JBD2_FEATURE_INCOMPAT_KNOWN: u32 = JBD2_FEATURE_INCOMPAT_REVOKE
    | JBD2_FEATURE_INCOMPAT_64BIT
    | JBD2_FEATURE_INCOMPAT_ASYNC_COMMIT
    | JBD2_FEATURE_INCOMPAT_CSUM_V2
    | JBD2_FEATURE_INCOMPAT_CSUM_V3;

const JBD2_SB_SIZE: usize = 1024;

#[derive(FromBytes, AsBytes, Unaligned, Clone)]
#[repr(C)]
pub struct JournalSuperblock {
    /*000*/ pub h_magic: Be32,
    pub h_blocktype: Be32,
    pub h_sequence: Be32,
    /*00c*/ pub s_blocksize: Be32,
    pub s_maxlen: Be32,
    pub s_first: Be32,
    /*018*/ pub s_sequence: Be32,
    pub s_start: Be32,
    pub s_errno: Be32,
    /*024*/ pub s_feature_compat: Be32,
    pub s_feature_incompat: Be32,
    pub s_feature_ro_compat: Be32,
    /*030*/ pub s_uuid: [u8; 16],
    /*040*/ pub s_nr_users: Be32,
    pub s_dynsuper: Be32,
    /*048*/ pub s_max_transaction: Be32,
    pub s_max_trans_data: Be32,
    /*050*/ pub s_checksum_type: u8,
    pub s_padding2: [u8; 3],
    /*054*/ pub s_num_fc_blks: Be32,
    pub s_padding: [u8; 164],
    /*0fc*/ pub s_checksum: Be32,
    /*100*/ pub s_users: [u8; 768],
}

/// Running state of an opened journal.
pub struct Journal {
    /// Physical block of each journal-file block, in file order.
    blocks: Vec<u64>,
    maxlen: u32,
    first: u32,
    /// Sequence the next commit will carry.
    sequence: u32,
    /// Journal block where the next transaction lands.
    head: u32,
    uuid: [u8; 16],
    /// Running transaction.
    txn_open: bool,
    txn_order: Vec<u64>,
    txn_revokes: HashSet<u64>,
}

impl Journal {
    pub fn in_transaction(&self) -> bool {
        self.txn_open
    }

    /// Take over a dirtied metadata block: pin it against eviction and
    /// early flush, remember its order.
    pub fn trans_set_block_dirty(&mut self, bcache: &mut Bcache, bref: &BlockRef) {
        bcache.mark_dirty(bref);
        bcache.set_end_write(bref, self.sequence);
        if !self.txn_order.contains(&bref.lba) {
            self.txn_order.push(bref.lba);
        }
    }

    /// Record a freed metadata block so replay never resurrects it.
    pub fn revoke_block(&mut self, lba: u64) {
        self.txn_revokes.insert(lba);
        self.txn_order.retain(|b| *b != lba);
    }
}

/* scanned log records */
struct ScannedTxn {
    sequence: u32,
    /// (final lba, journal block index, escaped)
    tags: Vec<(u64, u32, bool)>,
}

impl Ext4Fs {
    fn journal_file_blocks(&mut self) -> Result<Vec<u64>> {
        let jino = self.sb.s_journal_inum.get();
        let jino = if jino == 0 { crate::sb::EXT4_JOURNAL_INO } else { jino };
        let iref = self.inode_get(jino)?;
        let bsize = self.block_size() as u64;
        let count = iref.inode.size() / bsize;
        let mut blocks = Vec::with_capacity(count as usize);
        for i in 0..count {
            let Some(lba) = self.inode_map_block(&iref, i)? else {
                self.inode_put(iref)?;
                error!("journal file has a hole at block {}", i);
                return Err(Ext4Error::Corrupted);
            };
            blocks.push(lba);
        }
        self.inode_put(iref)?;
        if blocks.is_empty() {
            return Err(Ext4Error::Corrupted);
        }
        Ok(blocks)
    }

    fn journal_read_block(&mut self, blocks: &[u64], jblock: u32) -> Result<Vec<u8>> {
        let lba = *blocks.get(jblock as usize).ok_or(Ext4Error::Corrupted)?;
        let mut data = vec![0u8; self.block_size()];
        self.bdev.read_block(lba, 1, &mut data)?;
        Ok(data)
    }

    /// Journal writes bypass the cache so log records always reach the
    /// device before the final-location writes they protect.
    fn journal_write_block(&mut self, blocks: &[u64], jblock: u32, data: &[u8]) -> Result<()> {
        let lba = *blocks.get(jblock as usize).ok_or(Ext4Error::Corrupted)?;
        self.bdev.write_block(lba, 1, data)?;
        Ok(())
    }

    fn journal_load_sb(&mut self, blocks: &[u64]) -> Result<JournalSuperblock> {
        let data = self.journal_read_block(blocks, 0)?;
        let jsb =
            JournalSuperblock::read_from_prefix(&data[..]).ok_or(Ext4Error::Corrupted)?;
        if jsb.h_magic.get() != JBD2_MAGIC
            || !matches!(jsb.h_blocktype.get(), JBD2_SUPERBLOCK_V1 | JBD2_SUPERBLOCK_V2)
        {
            error!("bad journal superblock magic");
            return Err(Ext4Error::Corrupted);
        }
        if jsb.s_blocksize.get() != self.block_size() as u32 {
            error!("journal block size mismatch");
            return Err(Ext4Error::Corrupted);
        }
        let unknown = jsb.s_feature_incompat.get() & !JBD2_FEATURE_INCOMPAT_KNOWN;
        if unknown != 0 {
            error!("unknown journal features {:#x}", unknown);
            return Err(Ext4Error::NotSupported);
        }
        Ok(jsb)
    }

    fn journal_store_sb(&mut self, blocks: &[u64], jsb: &JournalSuperblock) -> Result<()> {
        let mut data = vec![0u8; self.block_size()];
        data[..JBD2_SB_SIZE].copy_from_slice(jsb.as_bytes());
        self.journal_write_block(blocks, 0, &data)
    }

    /// Open the journal and ready an empty running transaction.
    pub fn journal_start(&mut self) -> Result<()> {
        if self.journal.is_some() {
            return Ok(());
        }
        if !self.sb.compat().contains(CompatFeatures::HAS_JOURNAL) {
            return Err(Ext4Error::NotSupported);
        }
        self.check_writable()?;
        let blocks = self.journal_file_blocks()?;
        let jsb = self.journal_load_sb(&blocks)?;
        let first = jsb.s_first.get().max(1);
        let start = jsb.s_start.get();
        let journal = Journal {
            maxlen: jsb.s_maxlen.get().min(blocks.len() as u32),
            first,
            sequence: jsb.s_sequence.get().max(1),
            head: if start == 0 { first } else { start },
            uuid: jsb.s_uuid,
            blocks,
            txn_open: false,
            txn_order: Vec::new(),
            txn_revokes: HashSet::new(),
        };
        // the on-disk log head must already point where the next
        // transaction will land, so a crash mid-checkpoint replays it
        let mut jsb2 = jsb.clone();
        jsb2.s_sequence.set(journal.sequence);
        jsb2.s_start.set(journal.head);
        self.journal_store_sb(&journal.blocks, &jsb2)?;
        // mark the volume as needing recovery until journal_stop
        let incompat = self.sb.s_feature_incompat.get() | IncompatFeatures::RECOVER.bits();
        self.sb.s_feature_incompat.set(incompat);
        self.sb.store(&mut self.bdev)?;
        info!(
            "journal opened: {} blocks, sequence {}",
            journal.maxlen, journal.sequence
        );
        self.journal = Some(journal);
        Ok(())
    }

    /// Flush the running transaction and close the journal.
    pub fn journal_stop(&mut self) -> Result<()> {
        if self.journal.is_none() {
            return Ok(());
        }
        self.trans_stop()?;
        let Some(journal) = self.journal.take() else {
            return Ok(());
        };
        // log is fully checkpointed: empty it
        let mut jsb = self.journal_load_sb(&journal.blocks)?;
        jsb.s_sequence.set(journal.sequence);
        jsb.s_start.set(0);
        self.journal_store_sb(&journal.blocks, &jsb)?;
        let incompat = self.sb.s_feature_incompat.get() & !IncompatFeatures::RECOVER.bits();
        self.sb.s_feature_incompat.set(incompat);
        self.sb.store(&mut self.bdev)?;
        info!("journal closed at sequence {}", journal.sequence);
        Ok(())
    }

    /// Open a transaction (no-op without a journal).
    pub fn trans_start(&mut self) -> Result<()> {
        if let Some(journal) = self.journal.as_mut() {
            if !journal.txn_open {
                journal.txn_open = true;
                journal.txn_order.clear();
                journal.txn_revokes.clear();
                self.bcache.write_back(&mut self.bdev, true)?;
            }
        }
        Ok(())
    }

    /// Commit the running transaction: descriptor(s), the metadata
    /// block images, a revoke record, then the commit block; finally
    /// release the held buffers to write back to their homes.
    pub fn trans_stop(&mut self) -> Result<()> {
        let Some(mut journal) = self.journal.take() else {
            return Ok(());
        };
        let res = self.commit_txn(&mut journal);
        self.journal = Some(journal);
        res
    }

    fn commit_txn(&mut self, journal: &mut Journal) -> Result<()> {
        if !journal.txn_open {
            return Ok(());
        }
        journal.txn_open = false;
        if journal.txn_order.is_empty() && journal.txn_revokes.is_empty() {
            return self.bcache.write_back(&mut self.bdev, false);
        }
        let bsize = self.block_size();
        let seq = journal.sequence;
        let mut head = journal.head;
        let wrap = |h: u32, j: &Journal| if h >= j.maxlen { j.first + (h - j.maxlen) } else { h };

        // capacity check: tags + data + revoke + commit must fit
        let log_space = journal.maxlen - journal.first;
        let needed = journal.txn_order.len() as u32 + 4;
        if needed > log_space {
            error!("transaction larger than the journal");
            return Err(Ext4Error::NoSpace);
        }

        // snapshot every pinned buffer
        let mut images: Vec<(u64, Vec<u8>)> = Vec::with_capacity(journal.txn_order.len());
        for lba in &journal.txn_order {
            let Some(data) = self.bcache.peek(*lba) else {
                error!("journaled block {} fell out of the cache", lba);
                return Err(Ext4Error::Io);
            };
            images.push((*lba, data));
        }

        // descriptor + data blocks, as many descriptors as needed
        let mut idx = 0usize;
        while idx < images.len() {
            let mut desc = vec![0u8; bsize];
            put_be32(&mut desc, 0, JBD2_MAGIC);
            put_be32(&mut desc, 4, JBD2_DESCRIPTOR_BLOCK);
            put_be32(&mut desc, 8, seq);
            let mut off = 12usize;
            let mut batch: Vec<usize> = Vec::new();
            while idx < images.len() {
                let first_tag = batch.is_empty();
                let tag_room = 8 + if first_tag { 16 } else { 0 };
                if off + tag_room > bsize {
                    break;
                }
                let (lba, data) = &images[idx];
                let escaped = data.len() >= 4 && get_be32(data, 0) == JBD2_MAGIC;
                let mut flags = if escaped { JBD2_FLAG_ESCAPE } else { 0 };
                if !first_tag {
                    flags |= JBD2_FLAG_SAME_UUID;
                }
                put_be32(&mut desc, off, *lba as u32);
                put_be32(&mut desc, off + 4, flags);
                off += 8;
                if first_tag {
                    desc[off..off + 16].copy_from_slice(&journal.uuid);
                    off += 16;
                }
                batch.push(idx);
                idx += 1;
            }
            // mark the batch's last tag
            {
                let last_first = batch.len() == 1;
                let tag_off = off - 8 - if last_first { 16 } else { 0 };
                let flags = get_be32(&desc, tag_off + 4) | JBD2_FLAG_LAST_TAG;
                put_be32(&mut desc, tag_off + 4, flags);
            }
            self.journal_write_block(&journal.blocks, head, &desc)?;
            head = wrap(head + 1, journal);
            for i in &batch {
                let (_lba, data) = &images[*i];
                let mut img = data.clone();
                if get_be32(&img, 0) == JBD2_MAGIC {
                    img[0..4].fill(0);
                }
                self.journal_write_block(&journal.blocks, head, &img)?;
                head = wrap(head + 1, journal);
            }
        }

        // revoke record
        if !journal.txn_revokes.is_empty() {
            let mut rev = vec![0u8; bsize];
            put_be32(&mut rev, 0, JBD2_MAGIC);
            put_be32(&mut rev, 4, JBD2_REVOKE_BLOCK);
            put_be32(&mut rev, 8, seq);
            let mut off = 16usize;
            let mut revokes: Vec<u64> = journal.txn_revokes.iter().copied().collect();
            revokes.sort_unstable();
            for lba in revokes {
                if off + 4 > bsize {
                    break; // more revokes than fit is beyond this engine's transaction sizes
                }
                put_be32(&mut rev, off, lba as u32);
                off += 4;
            }
            put_be32(&mut rev, 12, off as u32);
            self.journal_write_block(&journal.blocks, head, &rev)?;
            head = wrap(head + 1, journal);
        }

        // commit record with the wall-clock timestamp
        let mut commit = vec![0u8; bsize];
        put_be32(&mut commit, 0, JBD2_MAGIC);
        put_be32(&mut commit, 4, JBD2_COMMIT_BLOCK);
        put_be32(&mut commit, 8, seq);
        let now = chrono::Utc::now();
        put_be64(&mut commit, 48, now.timestamp() as u64);
        put_be32(&mut commit, 56, now.timestamp_subsec_nanos());
        self.journal_write_block(&journal.blocks, head, &commit)?;
        head = wrap(head + 1, journal);
        debug!(
            "committed transaction {} ({} blocks, {} revokes)",
            seq,
            images.len(),
            journal.txn_revokes.len()
        );

        // checkpoint: hand the buffers back to the cache and flush
        // them to their final locations
        for (lba, _) in &images {
            self.bcache.clear_end_write(*lba);
        }
        journal.txn_order.clear();
        journal.txn_revokes.clear();
        self.bcache.write_back(&mut self.bdev, false)?;
        self.bcache.take_finished();

        // only now is the transaction consumed: advance the log head
        let mut jsb = self.journal_load_sb(&journal.blocks)?;
        jsb.s_sequence.set(seq + 1);
        jsb.s_start.set(head);
        self.journal_store_sb(&journal.blocks, &jsb)?;
        journal.sequence = seq + 1;
        journal.head = head;
        Ok(())
    }

    /// Replay a dirty log. Called during mount when the superblock
    /// state says the volume did not unmount cleanly.
    pub fn journal_recover(&mut self) -> Result<()> {
        if !self.sb.compat().contains(CompatFeatures::HAS_JOURNAL) {
            return Err(Ext4Error::NotSupported);
        }
        let blocks = self.journal_file_blocks()?;
        let jsb = self.journal_load_sb(&blocks)?;
        let features = jsb.s_feature_incompat.get();
        let start = jsb.s_start.get();
        if start == 0 {
            info!("journal is clean, nothing to replay");
            return Ok(());
        }
        let maxlen = jsb.s_maxlen.get().min(blocks.len() as u32);
        let first = jsb.s_first.get().max(1);
        let wrap = |p: u32| if p >= maxlen { first + (p - maxlen) } else { p };
        let long_tags = features & (JBD2_FEATURE_INCOMPAT_64BIT | JBD2_FEATURE_INCOMPAT_CSUM_V3) != 0;
        let csum_v3 = features & JBD2_FEATURE_INCOMPAT_CSUM_V3 != 0;

        // pass 1: scan for complete transactions and revokes
        let mut txns: Vec<ScannedTxn> = Vec::new();
        let mut revokes: HashMap<u64, u32> = HashMap::new();
        let mut pending: Option<ScannedTxn> = None;
        let mut seq = jsb.s_sequence.get();
        let mut pos = start;
        let mut scanned = 0u32;
        'scan: while scanned < maxlen {
            let data = self.journal_read_block(&blocks, pos)?;
            if get_be32(&data, 0) != JBD2_MAGIC || get_be32(&data, 8) != seq {
                break; // torn tail
            }
            match get_be32(&data, 4) {
                JBD2_DESCRIPTOR_BLOCK => {
                    let mut txn = pending.take().unwrap_or(ScannedTxn {
                        sequence: seq,
                        tags: Vec::new(),
                    });
                    let mut off = 12usize;
                    let mut dpos = wrap(pos + 1);
                    loop {
                        let base = if csum_v3 {
                            16
                        } else if long_tags {
                            12
                        } else {
                            8
                        };
                        if off + base > data.len() {
                            break;
                        }
                        let blocknr = get_be32(&data, off) as u64;
                        let flags = get_be32(&data, off + 4) & 0xFFFF;
                        let high = if long_tags {
                            get_be32(&data, off + 8) as u64
                        } else {
                            0
                        };
                        let lba = blocknr | (high << 32);
                        off += base;
                        if flags & JBD2_FLAG_SAME_UUID == 0 {
                            off += 16;
                        }
                        if flags & JBD2_FLAG_DELETED == 0 {
                            txn.tags.push((lba, dpos, flags & JBD2_FLAG_ESCAPE != 0));
                        }
                        scanned += 1;
                        dpos = wrap(dpos + 1);
                        if flags & JBD2_FLAG_LAST_TAG != 0 {
                            break;
                        }
                    }
                    pos = dpos;
                    pending = Some(txn);
                }
                JBD2_COMMIT_BLOCK => {
                    if let Some(txn) = pending.take() {
                        txns.push(txn);
                    } else {
                        txns.push(ScannedTxn { sequence: seq, tags: Vec::new() });
                    }
                    seq += 1;
                    pos = wrap(pos + 1);
                }
                JBD2_REVOKE_BLOCK => {
                    let count = get_be32(&data, 12) as usize;
                    let mut off = 16usize;
                    let step = if long_tags { 8 } else { 4 };
                    while off + step <= count.min(data.len()) {
                        let lba = if long_tags {
                            ((get_be32(&data, off) as u64) << 32)
                                | get_be32(&data, off + 4) as u64
                        } else {
                            get_be32(&data, off) as u64
                        };
                        let e = revokes.entry(lba).or_insert(seq);
                        if *e < seq {
                            *e = seq;
                        }
                        off += step;
                    }
                    pos = wrap(pos + 1);
                }
                _ => break 'scan,
            }
            scanned += 1;
        }
        drop(pending); // descriptor without commit: discarded

        // pass 2: replay committed transactions in order
        let mut replayed = 0usize;
        for txn in &txns {
            for (lba, jblock, escaped) in &txn.tags {
                if let Some(rev_seq) = revokes.get(lba) {
                    if *rev_seq >= txn.sequence {
                        continue;
                    }
                }
                let mut data = self.journal_read_block(&blocks, *jblock)?;
                if *escaped {
                    put_be32(&mut data, 0, JBD2_MAGIC);
                }
                self.bdev.write_block(*lba, 1, &data)?;
                replayed += 1;
            }
        }
        info!(
            "replayed {} blocks from {} committed transactions",
            replayed,
            txns.len()
        );

        // pass 3: the log is consumed
        let mut jsb = self.journal_load_sb(&blocks)?;
        jsb.s_sequence.set(seq);
        jsb.s_start.set(0);
        self.journal_store_sb(&blocks, &jsb)?;
        // replay went under the cache: drop stale buffers, reload
        self.bcache.purge();
        self.sb = crate::sb::Ext4Superblock::load(&mut self.bdev)?;
        // the superblock's free counters were not journaled; rebuild
        // them from the replayed group descriptors
        let mut free_blocks = 0u64;
        let mut free_inodes = 0u64;
        for g in 0..self.sb.group_count() {
            let gref = self.group_get(g)?;
            free_blocks += gref.desc.free_blocks_count(&self.sb) as u64;
            free_inodes += gref.desc.free_inodes_count(&self.sb) as u64;
            self.group_put(gref)?;
        }
        self.sb.set_free_blocks_count(free_blocks);
        self.sb.s_free_inodes_count.set(free_inodes as u32);
        self.sb.store(&mut self.bdev)?;
        Ok(())
    }
}

fn get_be32(b: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(b[off..off + 4].try_into().unwrap())
}

fn put_be32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

fn put_be64(b: &mut [u8], off: usize, v: u64) {
    b[off..off + 8].copy_from_slice(&v.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Ext4Fs;
    use crate::mkfs::{mkfs, FsProfile, MkfsOpts};
    use block_dev::memory::MemDev;
    use block_dev::Bdev;
    use std::mem::size_of;

    fn ext3_fs() -> Ext4Fs {
        let mut bdev = Bdev::new(Box::new(MemDev::new(16 * 1024 * 1024)));
        mkfs(
            &mut bdev,
            &MkfsOpts { profile: FsProfile::Ext3, block_size: 1024, ..Default::default() },
        )
        .unwrap();
        Ext4Fs::mount(bdev, false).unwrap()
    }

    #[test]
    fn journal_sb_layout() {
        assert_eq!(size_of::<JournalSuperblock>(), 1024);
        let mut jsb = JournalSuperblock::new_zeroed();
        jsb.h_magic.set(JBD2_MAGIC);
        let raw = jsb.as_bytes();
        assert_eq!(&raw[0..4], &[0xC0, 0x3B, 0x39, 0x98]);
    }

    #[test]
    fn start_commit_advances_sequence() {
        let mut fs = ext3_fs();
        fs.journal_start().unwrap();
        let seq0 = fs.journal.as_ref().unwrap().sequence;
        fs.trans_start().unwrap();
        // dirty one metadata block through the journal
        let lba = fs.sb.group_first_block(0) + 10;
        let bref = fs.block_get(lba).unwrap();
        bref.write_at(0, &[0x77; 32]);
        fs.dirty_block(&bref);
        fs.block_set(bref).unwrap();
        fs.trans_stop().unwrap();
        assert_eq!(fs.journal.as_ref().unwrap().sequence, seq0 + 1);
        fs.journal_stop().unwrap();
        fs.umount().unwrap();
    }

    #[test]
    fn empty_transaction_is_free() {
        let mut fs = ext3_fs();
        fs.journal_start().unwrap();
        let seq0 = fs.journal.as_ref().unwrap().sequence;
        fs.trans_start().unwrap();
        fs.trans_stop().unwrap();
        assert_eq!(fs.journal.as_ref().unwrap().sequence, seq0);
        fs.journal_stop().unwrap();
        fs.umount().unwrap();
    }

    #[test]
    fn recover_without_journal_is_not_supported() {
        let mut bdev = Bdev::new(Box::new(MemDev::new(8 * 1024 * 1024)));
        mkfs(
            &mut bdev,
            &MkfsOpts { profile: FsProfile::Ext2, block_size: 1024, ..Default::default() },
        )
        .unwrap();
        let mut fs = Ext4Fs::mount(bdev, false).unwrap();
        assert_eq!(fs.journal_recover().unwrap_err(), Ext4Error::NotSupported);
        fs.umount().unwrap();
    }

    #[test]
    fn clean_log_replays_nothing() {
        let mut fs = ext3_fs();
        fs.journal_recover().unwrap();
        fs.umount().unwrap();
    }
}
