//! On-disk record framing for data files and hint files.
//!
//! All integer fields are big-endian. This module only encodes/decodes
//! fixed-size headers and computes CRCs; it performs no I/O itself (see
//! `logfile` for that).

use crate::error::{Error, Result};

/// Largest permitted key length. The value length field doubles as a
/// tombstone marker at its maximum value, so the largest real value is one
/// less than this.
pub const MAX_KSZ: u64 = u32::MAX as u64;

/// Sentinel value-size marking a tombstone (delete) record.
pub const DELETED_VSZ: u32 = u32::MAX;

/// Largest permitted value length.
pub const MAX_VSZ: u64 = (DELETED_VSZ - 1) as u64;

/// Size in bytes of an encoded data record header (excludes key/value).
pub const DATA_HEADER_SIZE: usize = 20;

/// Size in bytes of an encoded hint record header (excludes key).
pub const HINT_HEADER_SIZE: usize = 28;

pub(crate) fn check_key_len(key: &[u8]) -> Result<()> {
    if key.len() as u64 > MAX_KSZ {
        return Err(Error::KeyTooLong { len: key.len() as u64, max: MAX_KSZ });
    }
    Ok(())
}

pub(crate) fn check_value_len(value: &[u8]) -> Result<()> {
    if value.len() as u64 > MAX_VSZ {
        return Err(Error::ValueTooLong { len: value.len() as u64, max: MAX_VSZ });
    }
    Ok(())
}

/// Header of a data record: `crc | version | ksz | vsz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub crc: u32,
    pub version: u64,
    pub ksz: u32,
    pub vsz: u32,
}

impl DataHeader {
    pub fn is_tombstone(&self) -> bool {
        self.vsz == DELETED_VSZ
    }

    /// Serializes the header, with `crc` already computed by the caller via
    /// [`data_crc`].
    pub fn to_bytes(&self) -> [u8; DATA_HEADER_SIZE] {
        let mut buf = [0u8; DATA_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.crc.to_be_bytes());
        buf[4..12].copy_from_slice(&self.version.to_be_bytes());
        buf[12..16].copy_from_slice(&self.ksz.to_be_bytes());
        buf[16..20].copy_from_slice(&self.vsz.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; DATA_HEADER_SIZE]) -> Self {
        DataHeader {
            crc: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            version: u64::from_be_bytes(buf[4..12].try_into().unwrap()),
            ksz: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            vsz: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        }
    }
}

/// CRC of a data record: the header bytes from `version` through `vsz`
/// (inclusive), followed by the key, followed by the value (absent for
/// tombstones). Zero-length key/value segments contribute nothing, which
/// falls out naturally from `Hasher::update(&[])` being a no-op.
pub fn data_crc(version: u64, ksz: u32, vsz: u32, key: &[u8], value: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&version.to_be_bytes());
    hasher.update(&ksz.to_be_bytes());
    hasher.update(&vsz.to_be_bytes());
    hasher.update(key);
    hasher.update(value);
    hasher.finalize()
}

/// Header of a hint record: `crc | version | ksz | vsz | value_pos`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintHeader {
    pub crc: u32,
    pub version: u64,
    pub ksz: u32,
    pub vsz: u32,
    pub value_pos: i64,
}

impl HintHeader {
    pub fn to_bytes(&self) -> [u8; HINT_HEADER_SIZE] {
        let mut buf = [0u8; HINT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.crc.to_be_bytes());
        buf[4..12].copy_from_slice(&self.version.to_be_bytes());
        buf[12..16].copy_from_slice(&self.ksz.to_be_bytes());
        buf[16..20].copy_from_slice(&self.vsz.to_be_bytes());
        buf[20..28].copy_from_slice(&self.value_pos.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HINT_HEADER_SIZE]) -> Self {
        HintHeader {
            crc: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            version: u64::from_be_bytes(buf[4..12].try_into().unwrap()),
            ksz: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            vsz: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            value_pos: i64::from_be_bytes(buf[20..28].try_into().unwrap()),
        }
    }
}

/// CRC of a hint record: the header bytes from `version` through
/// `value_pos` (inclusive), followed by the key.
pub fn hint_crc(version: u64, ksz: u32, vsz: u32, value_pos: i64, key: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&version.to_be_bytes());
    hasher.update(&ksz.to_be_bytes());
    hasher.update(&vsz.to_be_bytes());
    hasher.update(&value_pos.to_be_bytes());
    hasher.update(key);
    hasher.finalize()
}
