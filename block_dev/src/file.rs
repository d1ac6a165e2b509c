//! File-backed backend: a regular file (or a raw device node) on the
//! host, addressed in 512-byte units.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use log::*;

use crate::{BlockDev, DevGeometry};

const FILE_DEV_UNIT: u32 = 512;

pub struct FileDev {
    path: PathBuf,
    file: Option<File>,
    size: u64,
}

impl FileDev {
    /// Open an existing image file; its current length defines the
    /// device size.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let meta = std::fs::metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?;
        let size = meta.len() - meta.len() % FILE_DEV_UNIT as u64;
        Ok(Self { path, file: None, size })
    }

    /// Create (or truncate) an image file of `size` bytes.
    pub fn create(path: impl Into<PathBuf>, size: u64) -> Result<Self> {
        let path = path.into();
        let size = size - size % FILE_DEV_UNIT as u64;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("create {}", path.display()))?;
        file.set_len(size)?;
        info!("created image {} ({} bytes)", path.display(), size);
        Ok(Self { path, file: Some(file), size })
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or_else(|| anyhow!("device not opened"))
    }
}

impl BlockDev for FileDev {
    fn open(&mut self) -> Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.path)
                .with_context(|| format!("open {}", self.path.display()))?;
            self.file = Some(file);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        let off = lba * FILE_DEV_UNIT as u64;
        if off + buf.len() as u64 > self.size {
            return Err(anyhow!("read beyond end of image"));
        }
        let file = self.file()?;
        file.seek(SeekFrom::Start(off))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        let off = lba * FILE_DEV_UNIT as u64;
        if off + buf.len() as u64 > self.size {
            return Err(anyhow!("write beyond end of image"));
        }
        let file = self.file()?;
        file.seek(SeekFrom::Start(off))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn geometry(&self) -> DevGeometry {
        DevGeometry {
            phys_bsize: FILE_DEV_UNIT,
            phys_bcnt: self.size / FILE_DEV_UNIT as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_reopen() -> Result<()> {
        let dir = std::env::temp_dir();
        let path = dir.join("block_dev_file_test.img");
        {
            let mut dev = FileDev::create(&path, 64 * 1024)?;
            dev.open()?;
            dev.write_blocks(1, &[0x5a; 512])?;
            dev.close()?;
        }
        let mut dev = FileDev::new(&path)?;
        dev.open()?;
        let mut buf = [0u8; 512];
        dev.read_blocks(1, &mut buf)?;
        assert!(buf.iter().all(|b| *b == 0x5a));
        dev.close()?;
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
