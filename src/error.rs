//! Error kinds surfaced by the engine.

use std::fmt;

pub type Result<T> = std::result::Result<T, Ext4Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ext4Error {
    /// A path component does not exist.
    NotFound,
    /// `O_EXCL` create against an existing target.
    Exists,
    /// A directory was required.
    NotDirectory,
    /// A non-directory was required.
    IsDirectory,
    /// rmdir on a directory that still has entries.
    NotEmpty,
    /// Bad flags, bad mode string, bad seek origin.
    InvalidArgument,
    /// Block or byte address beyond the partition, seek past end.
    OutOfRange,
    /// Bitmaps exhausted, HTree full.
    NoSpace,
    /// Write attempted on a read-only mount.
    ReadOnly,
    /// Device failure or checksum mismatch.
    Io,
    /// Unrecognized incompatible feature, or recovery without a journal.
    NotSupported,
    /// On-disk structure failed validation.
    Corrupted,
}

impl fmt::Display for Ext4Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Ext4Error::NotFound => "no such file or directory",
            Ext4Error::Exists => "already exists",
            Ext4Error::NotDirectory => "not a directory",
            Ext4Error::IsDirectory => "is a directory",
            Ext4Error::NotEmpty => "directory not empty",
            Ext4Error::InvalidArgument => "invalid argument",
            Ext4Error::OutOfRange => "out of range",
            Ext4Error::NoSpace => "no space left",
            Ext4Error::ReadOnly => "read-only filesystem",
            Ext4Error::Io => "input/output error",
            Ext4Error::NotSupported => "not supported",
            Ext4Error::Corrupted => "corrupted filesystem structure",
        };
        f.write_str(s)
    }
}

impl std::error::Error for Ext4Error {}

// Device backends report through anyhow; everything crossing that
// boundary is an I/O failure as far as the engine is concerned.
impl From<anyhow::Error> for Ext4Error {
    fn from(e: anyhow::Error) -> Self {
        log::error!("device error: {:#}", e);
        Ext4Error::Io
    }
}

impl From<std::io::Error> for Ext4Error {
    fn from(e: std::io::Error) -> Self {
        log::error!("io error: {}", e);
        Ext4Error::Io
    }
}
