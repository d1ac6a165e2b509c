//! Shared fixtures: an image-sharing memory device and a crash device
//! that silently drops writes once a fuse burns through, so a test can
//! snapshot "power loss" states.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::{anyhow, Result};
use rext4::block_dev::{BlockDev, DevGeometry};

pub const DEV_UNIT: usize = 512;

/// Memory-backed device whose image outlives the device handle.
pub struct SharedMemDev {
    image: Rc<RefCell<Vec<u8>>>,
}

impl SharedMemDev {
    pub fn new(size: usize) -> (Self, Rc<RefCell<Vec<u8>>>) {
        let image = Rc::new(RefCell::new(vec![0u8; size - size % DEV_UNIT]));
        (Self { image: image.clone() }, image)
    }

    pub fn from_image(image: Rc<RefCell<Vec<u8>>>) -> Self {
        Self { image }
    }
}

impl BlockDev for SharedMemDev {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        let image = self.image.borrow();
        let start = lba as usize * DEV_UNIT;
        if start + buf.len() > image.len() {
            return Err(anyhow!("read beyond device"));
        }
        buf.copy_from_slice(&image[start..start + buf.len()]);
        Ok(())
    }

    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        let mut image = self.image.borrow_mut();
        let start = lba as usize * DEV_UNIT;
        if start + buf.len() > image.len() {
            return Err(anyhow!("write beyond device"));
        }
        image[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn geometry(&self) -> DevGeometry {
        DevGeometry {
            phys_bsize: DEV_UNIT as u32,
            phys_bcnt: (self.image.borrow().len() / DEV_UNIT) as u64,
        }
    }
}

/// Device with a write fuse: after `fuse` more write calls, every
/// further write is silently dropped, as if power was cut.
pub struct CrashDev {
    image: Rc<RefCell<Vec<u8>>>,
    fuse: Rc<Cell<i64>>,
}

impl CrashDev {
    /// `fuse < 0` means unlimited until armed later.
    pub fn new(
        image: Rc<RefCell<Vec<u8>>>,
    ) -> (Self, Rc<Cell<i64>>) {
        let fuse = Rc::new(Cell::new(-1i64));
        (Self { image, fuse: fuse.clone() }, fuse)
    }
}

impl BlockDev for CrashDev {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        let image = self.image.borrow();
        let start = lba as usize * DEV_UNIT;
        if start + buf.len() > image.len() {
            return Err(anyhow!("read beyond device"));
        }
        buf.copy_from_slice(&image[start..start + buf.len()]);
        Ok(())
    }

    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        let remaining = self.fuse.get();
        if remaining == 0 {
            // power is gone; the write disappears
            return Ok(());
        }
        if remaining > 0 {
            self.fuse.set(remaining - 1);
        }
        let mut image = self.image.borrow_mut();
        let start = lba as usize * DEV_UNIT;
        if start + buf.len() > image.len() {
            return Err(anyhow!("write beyond device"));
        }
        image[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn geometry(&self) -> DevGeometry {
        DevGeometry {
            phys_bsize: DEV_UNIT as u32,
            phys_bcnt: (self.image.borrow().len() / DEV_UNIT) as u64,
        }
    }
}

pub fn init_test_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}
