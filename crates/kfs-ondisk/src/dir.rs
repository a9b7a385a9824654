use kfs_types::{
    EXT4_DIR_TAIL_FT, EXT4_DIR_TAIL_SIZE, EXT4_NAME_LEN, ParseError, S_IFBLK, S_IFCHR, S_IFDIR,
    S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, ensure_slice, read_le_u16, read_le_u32,
    write_bytes, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

/// Fixed part of a dentry before the name.
pub const DIR_ENTRY_HEADER_SIZE: usize = 8;

/// ext4 file type constants from directory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Ext4FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl Ext4FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    /// Dentry type for an inode mode.
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegFile,
            S_IFDIR => Self::Dir,
            S_IFCHR => Self::Chrdev,
            S_IFBLK => Self::Blkdev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Sock,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

/// Aligned record length needed for a name of `name_len` bytes.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // name_len <= 255
pub fn dir_rec_len(name_len: usize) -> u16 {
    ((DIR_ENTRY_HEADER_SIZE + name_len + 3) & !3) as u16
}

/// A directory record (`ext4_dir_entry_2`), live or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4DirEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: Ext4FileType,
    pub name: Vec<u8>,
}

impl Ext4DirEntry {
    /// The aligned size this entry's name actually needs.
    #[must_use]
    pub fn actual_size(&self) -> usize {
        usize::from(dir_rec_len(usize::from(self.name_len)))
    }

    /// Bytes between the real size and `rec_len`, or the whole record when
    /// the entry is unused.
    #[must_use]
    pub fn slack(&self) -> usize {
        if self.inode == 0 {
            usize::from(self.rec_len)
        } else {
            usize::from(self.rec_len).saturating_sub(self.actual_size())
        }
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }

    /// Length first, then bytes.
    #[must_use]
    pub fn name_matches(&self, name: &[u8]) -> bool {
        usize::from(self.name_len) == name.len() && self.name == name
    }
}

/// Decode the record at `offset`, including unused (inode 0) records.
pub fn read_dir_record(block: &[u8], offset: usize) -> Result<Ext4DirEntry, ParseError> {
    let inode = read_le_u32(block, offset)?;
    let rec_len = read_le_u16(block, offset + 4)?;
    let name_len = ensure_slice(block, offset + 6, 1)?[0];
    let file_type = ensure_slice(block, offset + 7, 1)?[0];

    let rec = usize::from(rec_len);
    if rec < DIR_ENTRY_HEADER_SIZE || rec % 4 != 0 {
        return Err(ParseError::InvalidField {
            field: "de_rec_len",
            reason: "rec_len must be a multiple of 4 and >= 8",
        });
    }
    if offset + rec > block.len() {
        return Err(ParseError::InvalidField {
            field: "de_rec_len",
            reason: "directory entry extends past block boundary",
        });
    }
    let name_end = offset + DIR_ENTRY_HEADER_SIZE + usize::from(name_len);
    if name_end > offset + rec {
        return Err(ParseError::InvalidField {
            field: "de_name_len",
            reason: "name extends past rec_len",
        });
    }

    Ok(Ext4DirEntry {
        inode,
        rec_len,
        name_len,
        file_type: Ext4FileType::from_raw(file_type),
        name: block[offset + DIR_ENTRY_HEADER_SIZE..name_end].to_vec(),
    })
}

/// Whether the record at `offset` is the end-of-block tail sentinel.
#[must_use]
pub fn is_dir_tail(block: &[u8], offset: usize) -> bool {
    offset + EXT4_DIR_TAIL_SIZE == block.len()
        && read_le_u32(block, offset).is_ok_and(|ino| ino == 0)
        && read_le_u16(block, offset + 4).is_ok_and(|len| usize::from(len) == EXT4_DIR_TAIL_SIZE)
        && block.get(offset + 6) == Some(&0)
        && block.get(offset + 7) == Some(&EXT4_DIR_TAIL_FT)
}

/// Write a record header plus name, zero-padding to the aligned name size.
pub fn write_dir_record(
    block: &mut [u8],
    offset: usize,
    inode: u32,
    rec_len: u16,
    file_type: Ext4FileType,
    name: &[u8],
) -> Result<(), ParseError> {
    if name.len() > EXT4_NAME_LEN {
        return Err(ParseError::InvalidField {
            field: "de_name_len",
            reason: "name longer than 255 bytes",
        });
    }
    let size = usize::from(dir_rec_len(name.len()));
    if usize::from(rec_len) < size {
        return Err(ParseError::InvalidField {
            field: "de_rec_len",
            reason: "rec_len smaller than entry",
        });
    }
    ensure_slice(block, offset, usize::from(rec_len))?;
    write_le_u32(block, offset, inode)?;
    write_le_u16(block, offset + 4, rec_len)?;
    #[allow(clippy::cast_possible_truncation)] // checked above
    {
        block[offset + 6] = name.len() as u8;
    }
    block[offset + 7] = file_type as u8;
    block[offset + DIR_ENTRY_HEADER_SIZE..offset + size].fill(0);
    write_bytes(block, offset + DIR_ENTRY_HEADER_SIZE, name)
}

pub fn set_dir_rec_len(block: &mut [u8], offset: usize, rec_len: u16) -> Result<(), ParseError> {
    write_le_u16(block, offset + 4, rec_len)
}

pub fn set_dir_inode(block: &mut [u8], offset: usize, inode: u32) -> Result<(), ParseError> {
    write_le_u32(block, offset, inode)
}

/// Write the 12-byte tail sentinel at the end of `block`.
#[allow(clippy::cast_possible_truncation)] // constant 12
pub fn write_dir_tail(block: &mut [u8]) -> Result<(), ParseError> {
    let offset = block
        .len()
        .checked_sub(EXT4_DIR_TAIL_SIZE)
        .ok_or(ParseError::InsufficientData {
            needed: EXT4_DIR_TAIL_SIZE,
            offset: 0,
            actual: block.len(),
        })?;
    block[offset..].fill(0);
    write_le_u16(block, offset + 4, EXT4_DIR_TAIL_SIZE as u16)?;
    block[offset + 7] = EXT4_DIR_TAIL_FT;
    Ok(())
}

/// A fresh directory block holding `.`, `..` and the tail.
#[allow(clippy::cast_possible_truncation)] // block sizes fit u16 up to 64K - 1
pub fn init_dir_block(block: &mut [u8], self_ino: u32, parent_ino: u32) -> Result<(), ParseError> {
    block.fill(0);
    let dot = dir_rec_len(1);
    let usable = block.len().saturating_sub(EXT4_DIR_TAIL_SIZE);
    let dotdot = (usable - usize::from(dot)) as u16;
    write_dir_record(block, 0, self_ino, dot, Ext4FileType::Dir, b".")?;
    write_dir_record(block, usize::from(dot), parent_ino, dotdot, Ext4FileType::Dir, b"..")?;
    write_dir_tail(block)
}

/// An additional directory block: one unused record spanning it, then the tail.
#[allow(clippy::cast_possible_truncation)]
pub fn init_empty_dir_block(block: &mut [u8]) -> Result<(), ParseError> {
    block.fill(0);
    let usable = block.len().saturating_sub(EXT4_DIR_TAIL_SIZE) as u16;
    write_dir_record(block, 0, 0, usable, Ext4FileType::Unknown, b"")?;
    write_dir_tail(block)
}

/// Live entries of one directory block, stopping at the tail sentinel.
pub fn parse_dir_block(block: &[u8]) -> Result<Vec<Ext4DirEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut offset = 0_usize;
    while offset + DIR_ENTRY_HEADER_SIZE <= block.len() {
        if is_dir_tail(block, offset) {
            break;
        }
        let entry = read_dir_record(block, offset)?;
        offset += usize::from(entry.rec_len);
        if entry.inode != 0 {
            entries.push(entry);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec_len_sum(block: &[u8]) -> usize {
        let mut offset = 0;
        let mut sum = 0;
        while offset < block.len() {
            let len = usize::from(read_le_u16(block, offset + 4).unwrap());
            sum += len;
            offset += len;
        }
        sum
    }

    #[test]
    fn rec_len_alignment() {
        assert_eq!(dir_rec_len(1), 12);
        assert_eq!(dir_rec_len(2), 12);
        assert_eq!(dir_rec_len(4), 12);
        assert_eq!(dir_rec_len(5), 16);
        assert_eq!(dir_rec_len(255), 264);
    }

    #[test]
    fn init_dir_block_layout() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, 2, 2).unwrap();
        let entries = parse_dir_block(&block).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dot());
        assert!(entries[1].is_dotdot());
        assert_eq!(entries[1].rec_len, 1024 - 12 - 12);
        assert!(is_dir_tail(&block, 1012));
        assert_eq!(rec_len_sum(&block), 1024);
    }

    #[test]
    fn empty_block_has_single_unused_record() {
        let mut block = vec![0_u8; 4096];
        init_empty_dir_block(&mut block).unwrap();
        assert!(parse_dir_block(&block).unwrap().is_empty());
        let rec = read_dir_record(&block, 0).unwrap();
        assert_eq!(rec.inode, 0);
        assert_eq!(rec.slack(), 4084);
        assert_eq!(rec_len_sum(&block), 4096);
    }

    #[test]
    fn name_match_checks_length_first() {
        let e = Ext4DirEntry {
            inode: 12,
            rec_len: 12,
            name_len: 3,
            file_type: Ext4FileType::RegFile,
            name: b"abc".to_vec(),
        };
        assert!(e.name_matches(b"abc"));
        assert!(!e.name_matches(b"ab"));
        assert!(!e.name_matches(b"abcd"));
        assert_eq!(e.slack(), 0);
    }

    #[test]
    fn corrupt_rec_len_rejected() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, 2, 2).unwrap();
        set_dir_rec_len(&mut block, 12, 2000).unwrap();
        assert!(read_dir_record(&block, 12).is_err());
        set_dir_rec_len(&mut block, 12, 6).unwrap();
        assert!(parse_dir_block(&block).is_err());
    }

    proptest::proptest! {
        /// Arbitrary bytes decode to an error or to well-formed records,
        /// never to a panic.
        #[test]
        fn arbitrary_blocks_never_panic(block in proptest::collection::vec(proptest::prelude::any::<u8>(), 1024)) {
            if let Ok(entries) = parse_dir_block(&block) {
                for e in entries {
                    proptest::prop_assert_eq!(e.name.len(), usize::from(e.name_len));
                    proptest::prop_assert!(usize::from(e.rec_len) >= DIR_ENTRY_HEADER_SIZE + e.name.len());
                }
            }
        }
    }

    #[test]
    fn file_type_from_mode() {
        assert_eq!(Ext4FileType::from_mode(S_IFDIR | 0o755), Ext4FileType::Dir);
        assert_eq!(Ext4FileType::from_mode(S_IFLNK | 0o777), Ext4FileType::Symlink);
        assert_eq!(Ext4FileType::from_mode(0), Ext4FileType::Unknown);
    }
}
