use kfs_types::{
    EXT_INIT_MAX_LEN, EXT4_EXT_MAGIC, EXT4_EXTENT_ENTRY_SIZE, EXT4_N_BLOCKS_BYTES, ParseError,
    ensure_slice, read_le_u16, read_le_u32, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

/// Entries that fit in the 60-byte root inside the inode.
pub const EXTENT_ROOT_MAX_ENTRIES: u16 =
    ((EXT4_N_BLOCKS_BYTES - EXT4_EXTENT_ENTRY_SIZE) / EXT4_EXTENT_ENTRY_SIZE) as u16;

/// Number of entries a node of `node_len` bytes can hold.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // nodes are at most 64K
pub fn extent_node_capacity(node_len: usize) -> u16 {
    (node_len.saturating_sub(EXT4_EXTENT_ENTRY_SIZE) / EXT4_EXTENT_ENTRY_SIZE) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4ExtentHeader {
    pub magic: u16,
    pub entries: u16,
    pub max_entries: u16,
    pub depth: u16,
    pub generation: u32,
}

impl Ext4ExtentHeader {
    #[must_use]
    pub fn new(max_entries: u16, depth: u16) -> Self {
        Self {
            magic: EXT4_EXT_MAGIC,
            entries: 0,
            max_entries,
            depth,
            generation: 0,
        }
    }
}

/// A leaf entry: `len` logical blocks from `logical_block` map to
/// consecutive physical blocks from `physical_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4Extent {
    pub logical_block: u32,
    pub raw_len: u16,
    pub physical_start: u64,
}

impl Ext4Extent {
    /// Uninitialized extents read as zeroes.
    #[must_use]
    pub fn is_unwritten(self) -> bool {
        self.raw_len > EXT_INIT_MAX_LEN
    }

    #[must_use]
    pub fn actual_len(self) -> u16 {
        if self.raw_len <= EXT_INIT_MAX_LEN {
            self.raw_len
        } else {
            self.raw_len - EXT_INIT_MAX_LEN
        }
    }

    /// One past the last logical block covered.
    #[must_use]
    pub fn logical_end(self) -> u64 {
        u64::from(self.logical_block) + u64::from(self.actual_len())
    }

    #[must_use]
    pub fn contains(self, lblock: u32) -> bool {
        lblock >= self.logical_block && u64::from(lblock) < self.logical_end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4ExtentIndex {
    pub logical_block: u32,
    pub leaf_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentTree {
    Leaf(Vec<Ext4Extent>),
    Index(Vec<Ext4ExtentIndex>),
}

impl ExtentTree {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Leaf(v) => v.len(),
            Self::Index(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse an extent node (the inode root or a tree block).
pub fn parse_extent_tree(bytes: &[u8]) -> Result<(Ext4ExtentHeader, ExtentTree), ParseError> {
    ensure_slice(bytes, 0, EXT4_EXTENT_ENTRY_SIZE)?;

    let header = Ext4ExtentHeader {
        magic: read_le_u16(bytes, 0x00)?,
        entries: read_le_u16(bytes, 0x02)?,
        max_entries: read_le_u16(bytes, 0x04)?,
        depth: read_le_u16(bytes, 0x06)?,
        generation: read_le_u32(bytes, 0x08)?,
    };

    if header.magic != EXT4_EXT_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(EXT4_EXT_MAGIC),
            actual: u64::from(header.magic),
        });
    }
    if header.entries > header.max_entries {
        return Err(ParseError::InvalidField {
            field: "eh_entries",
            reason: "entries exceed max",
        });
    }
    if header.max_entries > extent_node_capacity(bytes.len()) {
        return Err(ParseError::InvalidField {
            field: "eh_max",
            reason: "max entries exceed node size",
        });
    }

    let count = usize::from(header.entries);
    let entry = |idx: usize| EXT4_EXTENT_ENTRY_SIZE * (idx + 1);

    if header.depth == 0 {
        let mut extents = Vec::with_capacity(count);
        for idx in 0..count {
            let base = entry(idx);
            let start_hi = u64::from(read_le_u16(bytes, base + 6)?);
            let start_lo = u64::from(read_le_u32(bytes, base + 8)?);
            let extent = Ext4Extent {
                logical_block: read_le_u32(bytes, base)?,
                raw_len: read_le_u16(bytes, base + 4)?,
                physical_start: start_lo | (start_hi << 32),
            };
            if let Some(prev) = extents.last().copied()
                && u64::from(extent.logical_block) < Ext4Extent::logical_end(prev)
            {
                return Err(ParseError::InvalidField {
                    field: "ee_block",
                    reason: "extents overlap or are out of order",
                });
            }
            extents.push(extent);
        }
        Ok((header, ExtentTree::Leaf(extents)))
    } else {
        let mut indexes: Vec<Ext4ExtentIndex> = Vec::with_capacity(count);
        for idx in 0..count {
            let base = entry(idx);
            let leaf_lo = u64::from(read_le_u32(bytes, base + 4)?);
            let leaf_hi = u64::from(read_le_u16(bytes, base + 8)?);
            let index = Ext4ExtentIndex {
                logical_block: read_le_u32(bytes, base)?,
                leaf_block: leaf_lo | (leaf_hi << 32),
            };
            if indexes
                .last()
                .is_some_and(|prev| index.logical_block <= prev.logical_block)
            {
                return Err(ParseError::InvalidField {
                    field: "ei_block",
                    reason: "index entries out of order",
                });
            }
            indexes.push(index);
        }
        Ok((header, ExtentTree::Index(indexes)))
    }
}

/// Encode a node into `bytes`, updating the header's entry count.
///
/// Slots beyond the live entries are zeroed.
#[allow(clippy::cast_possible_truncation)] // lo/hi splits; counts bounded by max_entries
pub fn write_extent_node(
    bytes: &mut [u8],
    header: &Ext4ExtentHeader,
    tree: &ExtentTree,
) -> Result<(), ParseError> {
    if tree.len() > usize::from(header.max_entries) {
        return Err(ParseError::InvalidField {
            field: "eh_entries",
            reason: "entries exceed max",
        });
    }
    let needed = EXT4_EXTENT_ENTRY_SIZE * (usize::from(header.max_entries) + 1);
    ensure_slice(bytes, 0, needed)?;

    write_le_u16(bytes, 0x00, EXT4_EXT_MAGIC)?;
    write_le_u16(bytes, 0x02, tree.len() as u16)?;
    write_le_u16(bytes, 0x04, header.max_entries)?;
    write_le_u16(bytes, 0x06, header.depth)?;
    write_le_u32(bytes, 0x08, header.generation)?;
    bytes[EXT4_EXTENT_ENTRY_SIZE..needed].fill(0);

    match tree {
        ExtentTree::Leaf(extents) => {
            for (idx, e) in extents.iter().enumerate() {
                let base = EXT4_EXTENT_ENTRY_SIZE * (idx + 1);
                write_le_u32(bytes, base, e.logical_block)?;
                write_le_u16(bytes, base + 4, e.raw_len)?;
                write_le_u16(bytes, base + 6, (e.physical_start >> 32) as u16)?;
                write_le_u32(bytes, base + 8, e.physical_start as u32)?;
            }
        }
        ExtentTree::Index(indexes) => {
            for (idx, ix) in indexes.iter().enumerate() {
                let base = EXT4_EXTENT_ENTRY_SIZE * (idx + 1);
                write_le_u32(bytes, base, ix.logical_block)?;
                write_le_u32(bytes, base + 4, ix.leaf_block as u32)?;
                write_le_u16(bytes, base + 8, (ix.leaf_block >> 32) as u16)?;
                write_le_u16(bytes, base + 10, 0)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_capacity_is_four() {
        assert_eq!(EXTENT_ROOT_MAX_ENTRIES, 4);
        assert_eq!(extent_node_capacity(4096), 340);
        assert_eq!(extent_node_capacity(1024), 84);
    }

    #[test]
    fn leaf_node_encodes_and_parses() {
        let mut root = [0_u8; 60];
        let header = Ext4ExtentHeader::new(EXTENT_ROOT_MAX_ENTRIES, 0);
        let tree = ExtentTree::Leaf(vec![
            Ext4Extent {
                logical_block: 0,
                raw_len: 4,
                physical_start: 0x1_0000_0100,
            },
            Ext4Extent {
                logical_block: 10,
                raw_len: 1,
                physical_start: 300,
            },
        ]);
        write_extent_node(&mut root, &header, &tree).unwrap();
        let (h, parsed) = parse_extent_tree(&root).unwrap();
        assert_eq!(h.entries, 2);
        assert_eq!(h.depth, 0);
        assert_eq!(parsed, tree);
    }

    #[test]
    fn index_node_encodes_and_parses() {
        let mut node = vec![0_u8; 1024];
        let header = Ext4ExtentHeader::new(extent_node_capacity(1024), 1);
        let tree = ExtentTree::Index(vec![
            Ext4ExtentIndex {
                logical_block: 0,
                leaf_block: 77,
            },
            Ext4ExtentIndex {
                logical_block: 500,
                leaf_block: 78,
            },
        ]);
        write_extent_node(&mut node, &header, &tree).unwrap();
        assert_eq!(parse_extent_tree(&node).unwrap().1, tree);
    }

    #[test]
    fn bad_magic_and_overlap_rejected() {
        let mut root = [0_u8; 60];
        assert!(matches!(
            parse_extent_tree(&root),
            Err(ParseError::InvalidMagic { .. })
        ));

        let header = Ext4ExtentHeader::new(4, 0);
        let tree = ExtentTree::Leaf(vec![
            Ext4Extent {
                logical_block: 0,
                raw_len: 8,
                physical_start: 100,
            },
            Ext4Extent {
                logical_block: 4,
                raw_len: 1,
                physical_start: 200,
            },
        ]);
        write_extent_node(&mut root, &header, &tree).unwrap();
        assert!(parse_extent_tree(&root).is_err());
    }

    #[test]
    fn unwritten_extent_length() {
        let e = Ext4Extent {
            logical_block: 5,
            raw_len: EXT_INIT_MAX_LEN + 3,
            physical_start: 9,
        };
        assert!(e.is_unwritten());
        assert_eq!(e.actual_len(), 3);
        assert!(e.contains(7));
        assert!(!e.contains(8));
    }
}
