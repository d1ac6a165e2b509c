//! Explicit-endian scalar aliases for on-disk records.
//!
//! ext4 metadata is little-endian; JBD2 journal records are big-endian.
//! Every on-disk struct is built from these (or plain byte arrays), so
//! nothing depends on host endianness.

use zerocopy::byteorder::{BigEndian, LittleEndian, U16, U32, U64};

pub type Le16 = U16<LittleEndian>;
pub type Le32 = U32<LittleEndian>;
pub type Le64 = U64<LittleEndian>;

pub type Be16 = U16<BigEndian>;
pub type Be32 = U32<BigEndian>;
pub type Be64 = U64<BigEndian>;

/// Little-endian u32 read out of a byte slice.
#[inline]
pub fn get_le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

#[inline]
pub fn get_le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

#[inline]
pub fn put_le32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn put_le16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}
