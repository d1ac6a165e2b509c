//! Journal crash-recovery scenarios: run a journaled workload over a
//! device whose writes stop landing after a fuse burns out, then mount
//! the surviving image and check that recovery yields a consistent
//! tree. Files must be complete to a committed boundary, never torn.

mod common;

use common::{init_test_logs, CrashDev, SharedMemDev};
use rext4::block_dev::Bdev;
use rext4::{mkfs, Ext4Error, FsProfile, FsRegistry, MkfsOpts};
use std::cell::RefCell;
use std::rc::Rc;

const CHUNK: usize = 64 * 1024;
const CHUNKS: usize = 8;

fn format_ext3(size: usize) -> Rc<RefCell<Vec<u8>>> {
    let (dev, image) = SharedMemDev::new(size);
    let mut bdev = Bdev::new(Box::new(dev));
    mkfs(
        &mut bdev,
        &MkfsOpts { profile: FsProfile::Ext3, block_size: 1024, ..Default::default() },
    )
    .unwrap();
    image
}

/// Run the journaled workload with a write fuse armed at `fuse`
/// device writes; the registry is abandoned afterwards, like a
/// process that lost power.
fn journaled_workload(image: &Rc<RefCell<Vec<u8>>>, fuse: i64) {
    let (dev, fuse_handle) = CrashDev::new(image.clone());
    fuse_handle.set(fuse);
    let mut reg = FsRegistry::new();
    reg.register_device("d", Bdev::new(Box::new(dev))).unwrap();
    reg.mount("d", "mp", false).unwrap();
    reg.journal_start("mp").unwrap();

    let mut f = reg.fopen("/mp/test1", "wb").unwrap();
    for i in 0..CHUNKS {
        let chunk = vec![b'0' + (i % 10) as u8; CHUNK];
        reg.fwrite(&mut f, &chunk).unwrap();
    }
    // no journal_stop, no umount: the "machine" dies here
}

/// Count the device writes of an untouched full run.
fn baseline_writes(size: usize) -> i64 {
    let image = format_ext3(size);
    let (dev, fuse_handle) = CrashDev::new(image.clone());
    // large fuse that will not burn out, used as a countdown counter
    let start = 1_000_000i64;
    fuse_handle.set(start);
    let mut reg = FsRegistry::new();
    reg.register_device("d", Bdev::new(Box::new(dev))).unwrap();
    reg.mount("d", "mp", false).unwrap();
    reg.journal_start("mp").unwrap();
    let mut f = reg.fopen("/mp/test1", "wb").unwrap();
    for i in 0..CHUNKS {
        let chunk = vec![b'0' + (i % 10) as u8; CHUNK];
        reg.fwrite(&mut f, &chunk).unwrap();
    }
    reg.fclose(f).unwrap();
    drop(reg);
    start - fuse_handle.get()
}

/// Mount the crashed image (recovery runs automatically) and verify
/// the post-crash contract.
fn verify_crashed_image(image: Rc<RefCell<Vec<u8>>>) {
    let mut reg = FsRegistry::new();
    let dev = SharedMemDev::from_image(image);
    reg.register_device("d", Bdev::new(Box::new(dev))).unwrap();
    reg.mount("d", "mp", false).unwrap();

    match reg.fsize("/mp/test1") {
        Err(Ext4Error::NotFound) => {
            // crash before the creating transaction committed
        }
        Err(e) => panic!("unexpected error {:?}", e),
        Ok(size) => {
            // committed boundary: some whole number of chunks
            assert_eq!(size % CHUNK as u64, 0, "file torn mid-chunk: {}", size);
            assert!(size <= (CHUNKS * CHUNK) as u64);
            let mut f = reg.fopen("/mp/test1", "rb").unwrap();
            let mut buf = vec![0u8; CHUNK];
            for i in 0..(size as usize / CHUNK) {
                assert_eq!(reg.fread(&mut f, &mut buf).unwrap(), CHUNK);
                let want = b'0' + (i % 10) as u8;
                assert!(buf.iter().all(|b| *b == want), "chunk {} corrupt", i);
            }
            reg.fclose(f).unwrap();
        }
    }
    // the volume is fully usable after recovery
    let stats = reg.mount_point_stats("mp").unwrap();
    assert!(stats.free_blocks_count > 0);
    let mut f = reg.fopen("/mp/after-crash", "wb").unwrap();
    reg.fwrite(&mut f, b"still alive").unwrap();
    reg.fclose(f).unwrap();
    reg.umount("mp").unwrap();
}

/// S6 proper: drop the final writes of the workload.
#[test]
fn s6_crash_near_the_end() {
    init_test_logs();
    let total = baseline_writes(16 * 1024 * 1024);
    assert!(total > 20);
    let image = format_ext3(16 * 1024 * 1024);
    journaled_workload(&image, total - 3);
    verify_crashed_image(image);
}

/// Sweep crash points across the whole workload.
#[test]
fn crash_point_sweep() {
    init_test_logs();
    let total = baseline_writes(16 * 1024 * 1024);
    let step = (total / 9).max(1);
    let mut fuse = 0i64;
    while fuse < total {
        let image = format_ext3(16 * 1024 * 1024);
        journaled_workload(&image, fuse);
        verify_crashed_image(image);
        fuse += step;
    }
}

/// A clean journaled run needs no recovery and survives remounts.
#[test]
fn clean_journaled_run() {
    init_test_logs();
    let image = format_ext3(16 * 1024 * 1024);
    let mut reg = FsRegistry::new();
    let dev = SharedMemDev::from_image(image.clone());
    reg.register_device("d", Bdev::new(Box::new(dev))).unwrap();
    reg.mount("d", "mp", false).unwrap();
    reg.journal_start("mp").unwrap();
    let mut f = reg.fopen("/mp/test1", "wb").unwrap();
    for i in 0..CHUNKS {
        let chunk = vec![b'0' + (i % 10) as u8; CHUNK];
        reg.fwrite(&mut f, &chunk).unwrap();
    }
    reg.fclose(f).unwrap();
    reg.journal_stop("mp").unwrap();
    reg.umount("mp").unwrap();

    reg.mount("d", "mp", false).unwrap();
    assert_eq!(reg.fsize("/mp/test1").unwrap(), (CHUNKS * CHUNK) as u64);
    reg.umount("mp").unwrap();
}

/// Recovery on a journal-less volume reports NotSupported and the
/// caller falls back to read-only.
#[test]
fn recover_without_journal() {
    init_test_logs();
    let (dev, image) = SharedMemDev::new(8 * 1024 * 1024);
    let mut bdev = Bdev::new(Box::new(dev));
    mkfs(
        &mut bdev,
        &MkfsOpts { profile: FsProfile::Ext2, block_size: 1024, ..Default::default() },
    )
    .unwrap();
    let mut reg = FsRegistry::new();
    let dev = SharedMemDev::from_image(image);
    reg.register_device("d", Bdev::new(Box::new(dev))).unwrap();
    reg.mount("d", "mp", false).unwrap();
    assert_eq!(reg.recover("mp").unwrap_err(), Ext4Error::NotSupported);
    reg.umount("mp").unwrap();
}

/// Unlink inside a transaction: revoked blocks never resurrect.
#[test]
fn revoked_blocks_stay_dead() {
    init_test_logs();
    let image = format_ext3(16 * 1024 * 1024);
    {
        let (dev, fuse) = CrashDev::new(image.clone());
        fuse.set(-1);
        let mut reg = FsRegistry::new();
        reg.register_device("d", Bdev::new(Box::new(dev))).unwrap();
        reg.mount("d", "mp", false).unwrap();
        reg.journal_start("mp").unwrap();
        let mut f = reg.fopen("/mp/doomed", "wb").unwrap();
        reg.fwrite(&mut f, &vec![0xAA; 200 * 1024]).unwrap();
        reg.fclose(f).unwrap();
        reg.fremove("/mp/doomed").unwrap();
        // crash without stopping the journal
        drop(reg);
    }
    let mut reg = FsRegistry::new();
    let dev = SharedMemDev::from_image(image);
    reg.register_device("d", Bdev::new(Box::new(dev))).unwrap();
    reg.mount("d", "mp", false).unwrap();
    assert_eq!(reg.fsize("/mp/doomed").unwrap_err(), Ext4Error::NotFound);
    let stats = reg.mount_point_stats("mp").unwrap();
    assert!(stats.free_blocks_count > 0);
    reg.umount("mp").unwrap();
}
