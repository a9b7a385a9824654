#![forbid(unsafe_code)]
//! Shared vocabulary for the kfs crates: unit-carrying newtypes, the byte
//! decoding error, little-endian helpers and ext4 layout constants.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const EXT4_SUPERBLOCK_OFFSET: usize = 1024;
pub const EXT4_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT4_SUPER_MAGIC: u16 = 0xEF53;

/// Magic number opening every extent-tree node header.
pub const EXT4_EXT_MAGIC: u16 = 0xF30A;
/// Longest run an initialized extent may describe.
pub const EXT_INIT_MAX_LEN: u16 = 32_768;
/// Size of an extent header, leaf entry or index entry.
pub const EXT4_EXTENT_ENTRY_SIZE: usize = 12;
/// Size of the `i_block` area inside an inode.
pub const EXT4_N_BLOCKS_BYTES: usize = 60;
/// Direct pointers in a legacy block map.
pub const EXT4_NDIR_BLOCKS: usize = 12;
pub const EXT4_IND_BLOCK: usize = 12;
pub const EXT4_DIND_BLOCK: usize = 13;
pub const EXT4_TIND_BLOCK: usize = 14;

/// Longest name a dentry can hold.
pub const EXT4_NAME_LEN: usize = 255;
/// Size of the end-of-block dentry tail sentinel.
pub const EXT4_DIR_TAIL_SIZE: usize = 12;
/// File type tag carried by the tail sentinel.
pub const EXT4_DIR_TAIL_FT: u8 = 0xDE;

/// Inode table entry size written by the formatter.
pub const EXT4_DEFAULT_INODE_SIZE: u16 = 256;
/// First inode available to ordinary files.
pub const EXT4_GOOD_OLD_FIRST_INO: u32 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Validated block size (must be a power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [1024, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as a `usize` buffer length.
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Number of 512-byte sectors in one block (the `i_blocks` unit).
    #[must_use]
    pub fn sectors(self) -> u64 {
        u64::from(self.0 / 512)
    }
}

/// Block group index (ext4: u32 group number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Byte offset on the backing image (pread/pwrite semantics).
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Little-endian field access ──────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let actual = data.len().saturating_sub(offset);
    match offset.checked_add(len) {
        Some(end) if end <= data.len() => Ok(&mut data[offset..end]),
        Some(_) => Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        }),
        None => Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        }),
    }
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

#[must_use]
pub fn ext4_block_size_from_log(log_block_size: u32) -> Option<u32> {
    let shift = 10_u32.checked_add(log_block_size)?;
    1_u32.checked_shl(shift)
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl InodeNumber {
    pub const ROOT: Self = Self(2);
    pub const LOST_AND_FOUND: Self = Self(11);
}

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte position of this block, `None` past the end of a `u64`.
    #[must_use]
    pub fn to_byte_offset(self, block_size: BlockSize) -> Option<ByteOffset> {
        self.0.checked_mul(u64::from(block_size.get())).map(ByteOffset)
    }
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
pub const S_IFIFO: u16 = 0o010_000;
pub const S_IFCHR: u16 = 0o020_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFBLK: u16 = 0o060_000;
pub const S_IFREG: u16 = 0o100_000;
pub const S_IFLNK: u16 = 0o120_000;
pub const S_IFSOCK: u16 = 0o140_000;

// ── ext4 inode flags (i_flags) ──────────────────────────────────────────────

/// Hash-indexed directory (htree/DX).
pub const EXT4_INDEX_FL: u32 = 0x0000_1000;
/// `i_blocks` is in filesystem-block units rather than sectors.
pub const EXT4_HUGE_FILE_FL: u32 = 0x0004_0000;
/// Inode uses extents.
pub const EXT4_EXTENTS_FL: u32 = 0x0008_0000;

// ── Geometry helpers ────────────────────────────────────────────────────────

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Compute the inode's block group from its inode number.
///
/// Inode numbers are 1-indexed; group assignment uses `(ino - 1) / inodes_per_group`.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // ext4 group count is u32
pub fn inode_to_group(ino: InodeNumber, inodes_per_group: u32) -> GroupNumber {
    GroupNumber(((ino.0.saturating_sub(1)) / u64::from(inodes_per_group)) as u32)
}

/// Compute the index of an inode within its block group.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // modulo by u32 always fits in u32
pub fn inode_index_in_group(ino: InodeNumber, inodes_per_group: u32) -> u32 {
    ((ino.0.saturating_sub(1)) % u64::from(inodes_per_group)) as u32
}

/// Inverse of [`inode_to_group`] / [`inode_index_in_group`].
#[must_use]
pub fn inode_from_group_index(group: GroupNumber, index: u32, inodes_per_group: u32) -> InodeNumber {
    InodeNumber(u64::from(group.0) * u64::from(inodes_per_group) + u64::from(index) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34, 0x12, 0x78, 0x56, 0xBC, 0x9A, 0xF0, 0xDE];
        assert_eq!(read_le_u16(&bytes, 0).unwrap(), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).unwrap(), 0x5678_1234);
        assert_eq!(read_fixed::<3>(&bytes, 5).unwrap(), [0x9A, 0xF0, 0xDE]);
        assert!(read_le_u32(&bytes, 6).is_err());
    }

    #[test]
    fn test_write_helpers() {
        let mut buf = [0_u8; 8];
        write_le_u16(&mut buf, 0, 0xEF53).unwrap();
        write_le_u32(&mut buf, 2, 0xDEAD_BEEF).unwrap();
        assert_eq!(read_le_u16(&buf, 0).unwrap(), 0xEF53);
        assert_eq!(read_le_u32(&buf, 2).unwrap(), 0xDEAD_BEEF);
        assert!(matches!(
            write_le_u32(&mut buf, 6, 1),
            Err(ParseError::InsufficientData { needed: 4, offset: 6, actual: 2 })
        ));
        write_bytes(&mut buf, 6, b"ok").unwrap();
        assert_eq!(&buf[6..], b"ok");
    }

    #[test]
    fn test_trim_nul_padded() {
        assert_eq!(trim_nul_padded(b"kfs\0\0\0"), "kfs");
        assert_eq!(trim_nul_padded(b""), "");
    }

    #[test]
    fn test_ext4_block_size_from_log() {
        assert_eq!(ext4_block_size_from_log(0), Some(1024));
        assert_eq!(ext4_block_size_from_log(2), Some(4096));
        assert_eq!(ext4_block_size_from_log(40), None);
    }

    #[test]
    fn test_block_size_validation() {
        assert!(BlockSize::new(1024).is_ok());
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(65536).is_ok());
        assert!(BlockSize::new(512).is_err());
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(131_072).is_err());
    }

    #[test]
    fn test_block_size_conversions() {
        let bs = BlockSize::new(4096).unwrap();
        assert_eq!(bs.as_usize(), 4096);
        assert_eq!(bs.sectors(), 8);
        assert_eq!(BlockSize::new(1024).unwrap().sectors(), 2);
    }

    #[test]
    fn test_inode_group_math() {
        assert_eq!(inode_to_group(InodeNumber(1), 8192), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(8193), 8192), GroupNumber(1));
        assert_eq!(inode_index_in_group(InodeNumber(8193), 8192), 0);
        assert_eq!(inode_index_in_group(InodeNumber(2), 8192), 1);
        for ino in [1_u64, 2, 11, 8192, 8193, 20_000] {
            let ino = InodeNumber(ino);
            let g = inode_to_group(ino, 8192);
            let idx = inode_index_in_group(ino, 8192);
            assert_eq!(inode_from_group_index(g, idx, 8192), ino);
        }
    }

    #[test]
    fn test_narrowing() {
        assert_eq!(u64_to_u32(7, "x").unwrap(), 7);
        assert!(u64_to_u32(u64::from(u32::MAX) + 1, "x").is_err());
        assert_eq!(BlockNumber(3).to_byte_offset(BlockSize::new(4096).unwrap()), Some(ByteOffset(12_288)));
        assert_eq!(BlockNumber(u64::MAX).to_byte_offset(BlockSize::new(1024).unwrap()), None);
    }
}
