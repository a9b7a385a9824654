use kfs_types::{ParseError, ensure_slice, read_le_u16, read_le_u32, write_le_u16, write_le_u32};
use serde::{Deserialize, Serialize};

/// One block group descriptor (`ext4_group_desc`), 32 or 64 bytes on disk.
///
/// The in-memory table tracks dirtiness separately; nothing here touches
/// reserved on-disk fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4GroupDesc {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
    pub itable_unused: u32,
    pub flags: u16,
    pub checksum: u16,
}

impl Ext4GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8], desc_size: u16) -> Result<Self, ParseError> {
        let desc_size_usize = usize::from(desc_size);
        if desc_size_usize < 32 {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "descriptor size must be >= 32",
            });
        }
        ensure_slice(bytes, 0, desc_size_usize)?;

        let block_bitmap_lo = u64::from(read_le_u32(bytes, 0x00)?);
        let inode_bitmap_lo = u64::from(read_le_u32(bytes, 0x04)?);
        let inode_table_lo = u64::from(read_le_u32(bytes, 0x08)?);
        let free_blocks_lo = u32::from(read_le_u16(bytes, 0x0C)?);
        let free_inodes_lo = u32::from(read_le_u16(bytes, 0x0E)?);
        let used_dirs_lo = u32::from(read_le_u16(bytes, 0x10)?);
        let flags = read_le_u16(bytes, 0x12)?;
        let itable_unused_lo = u32::from(read_le_u16(bytes, 0x1C)?);
        let checksum = read_le_u16(bytes, 0x1E)?;

        let mut desc = Self {
            block_bitmap: block_bitmap_lo,
            inode_bitmap: inode_bitmap_lo,
            inode_table: inode_table_lo,
            free_blocks_count: free_blocks_lo,
            free_inodes_count: free_inodes_lo,
            used_dirs_count: used_dirs_lo,
            itable_unused: itable_unused_lo,
            flags,
            checksum,
        };

        if desc_size_usize >= 64 {
            desc.block_bitmap |= u64::from(read_le_u32(bytes, 0x20)?) << 32;
            desc.inode_bitmap |= u64::from(read_le_u32(bytes, 0x24)?) << 32;
            desc.inode_table |= u64::from(read_le_u32(bytes, 0x28)?) << 32;
            desc.free_blocks_count |= u32::from(read_le_u16(bytes, 0x2C)?) << 16;
            desc.free_inodes_count |= u32::from(read_le_u16(bytes, 0x2E)?) << 16;
            desc.used_dirs_count |= u32::from(read_le_u16(bytes, 0x30)?) << 16;
            desc.itable_unused |= u32::from(read_le_u16(bytes, 0x32)?) << 16;
        }
        Ok(desc)
    }

    /// Encode into a `desc_size`-byte slot, writing the high halves only for
    /// 64-byte descriptors.
    #[allow(clippy::cast_possible_truncation)] // lo/hi splits
    pub fn encode_into(&self, bytes: &mut [u8], desc_size: u16) -> Result<(), ParseError> {
        let desc_size_usize = usize::from(desc_size);
        ensure_slice(bytes, 0, desc_size_usize)?;
        write_le_u32(bytes, 0x00, self.block_bitmap as u32)?;
        write_le_u32(bytes, 0x04, self.inode_bitmap as u32)?;
        write_le_u32(bytes, 0x08, self.inode_table as u32)?;
        write_le_u16(bytes, 0x0C, self.free_blocks_count as u16)?;
        write_le_u16(bytes, 0x0E, self.free_inodes_count as u16)?;
        write_le_u16(bytes, 0x10, self.used_dirs_count as u16)?;
        write_le_u16(bytes, 0x12, self.flags)?;
        write_le_u16(bytes, 0x1C, self.itable_unused as u16)?;
        write_le_u16(bytes, 0x1E, self.checksum)?;
        if desc_size_usize >= 64 {
            write_le_u32(bytes, 0x20, (self.block_bitmap >> 32) as u32)?;
            write_le_u32(bytes, 0x24, (self.inode_bitmap >> 32) as u32)?;
            write_le_u32(bytes, 0x28, (self.inode_table >> 32) as u32)?;
            write_le_u16(bytes, 0x2C, (self.free_blocks_count >> 16) as u16)?;
            write_le_u16(bytes, 0x2E, (self.free_inodes_count >> 16) as u16)?;
            write_le_u16(bytes, 0x30, (self.used_dirs_count >> 16) as u16)?;
            write_le_u16(bytes, 0x32, (self.itable_unused >> 16) as u16)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Ext4GroupDesc {
        Ext4GroupDesc {
            block_bitmap: 0x1_0000_0010,
            inode_bitmap: 0x11,
            inode_table: 0x12,
            free_blocks_count: 0x2_0005,
            free_inodes_count: 100,
            used_dirs_count: 3,
            itable_unused: 0,
            flags: 0,
            checksum: 0,
        }
    }

    #[test]
    fn wide_descriptor_keeps_high_halves() {
        let mut buf = [0_u8; 64];
        sample().encode_into(&mut buf, 64).unwrap();
        assert_eq!(Ext4GroupDesc::parse_from_bytes(&buf, 64).unwrap(), sample());
    }

    #[test]
    fn narrow_descriptor_truncates_to_low_halves() {
        let mut buf = [0_u8; 32];
        sample().encode_into(&mut buf, 32).unwrap();
        let back = Ext4GroupDesc::parse_from_bytes(&buf, 32).unwrap();
        assert_eq!(back.block_bitmap, 0x10);
        assert_eq!(back.free_blocks_count, 5);
        assert_eq!(back.used_dirs_count, 3);
    }

    #[test]
    fn short_buffer_rejected() {
        assert!(Ext4GroupDesc::parse_from_bytes(&[0_u8; 40], 64).is_err());
        assert!(Ext4GroupDesc::parse_from_bytes(&[0_u8; 40], 16).is_err());
    }
}
