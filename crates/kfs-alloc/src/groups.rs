use std::collections::BTreeSet;

use kfs_block::Disk;
use kfs_error::{KfsError, Result};
use kfs_ondisk::{Ext4GroupDesc, Ext4Superblock};
use kfs_types::{BlockNumber, GroupNumber};
use tracing::trace;

/// In-memory group descriptor table.
///
/// Mutable access through [`GroupTable::get_mut`] records the group in a
/// dirty set; [`GroupTable::flush`] rewrites only the GDT blocks holding
/// dirty descriptors.
#[derive(Debug, Clone)]
pub struct GroupTable {
    descs: Vec<Ext4GroupDesc>,
    dirty: BTreeSet<GroupNumber>,
    desc_size: u16,
    gdt_block: BlockNumber,
}

impl GroupTable {
    #[must_use]
    pub fn new(descs: Vec<Ext4GroupDesc>, desc_size: u16, gdt_block: BlockNumber) -> Self {
        Self {
            descs,
            dirty: BTreeSet::new(),
            desc_size,
            gdt_block,
        }
    }

    /// Read every descriptor from the table following the superblock.
    pub fn load(disk: &Disk, sb: &Ext4Superblock) -> Result<Self> {
        let desc_size = sb.group_desc_size();
        let count = sb.groups_count() as usize;
        let mut raw = vec![0_u8; count * usize::from(desc_size)];
        disk.read_blocks(BlockNumber(sb.gdt_block()), &mut raw)?;

        let descs = raw
            .chunks_exact(usize::from(desc_size))
            .enumerate()
            .map(|(idx, bytes)| {
                Ext4GroupDesc::parse_from_bytes(bytes, desc_size).map_err(|e| {
                    KfsError::Corruption {
                        block: sb.gdt_block(),
                        detail: format!("group descriptor {idx}: {e}"),
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let max_block = sb.blocks_count;
        for (idx, desc) in descs.iter().enumerate() {
            if desc.block_bitmap >= max_block
                || desc.inode_bitmap >= max_block
                || desc.inode_table >= max_block
            {
                return Err(KfsError::Corruption {
                    block: sb.gdt_block(),
                    detail: format!("group descriptor {idx} points past the device"),
                });
            }
        }

        Ok(Self::new(descs, desc_size, BlockNumber(sb.gdt_block())))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ext4GroupDesc> {
        self.descs.iter()
    }

    pub fn get(&self, group: GroupNumber) -> Result<&Ext4GroupDesc> {
        self.descs
            .get(group.0 as usize)
            .ok_or_else(|| out_of_range(group))
    }

    /// Mutable access; marks the group dirty.
    pub fn get_mut(&mut self, group: GroupNumber) -> Result<&mut Ext4GroupDesc> {
        let desc = self
            .descs
            .get_mut(group.0 as usize)
            .ok_or_else(|| out_of_range(group))?;
        self.dirty.insert(group);
        Ok(desc)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Rewrite the GDT blocks that hold dirty descriptors. Fields this
    /// table does not model are preserved from disk. Returns how many
    /// descriptors were written.
    pub fn flush(&mut self, disk: &Disk) -> Result<usize> {
        if self.dirty.is_empty() {
            return Ok(0);
        }
        let ds = usize::from(self.desc_size);
        let per_block = disk.block_size().as_usize() / ds;
        let dirty = std::mem::take(&mut self.dirty);

        let mut current: Option<(u64, Vec<u8>)> = None;
        for group in &dirty {
            let gdt_idx = group.0 as usize / per_block;
            let block = BlockNumber(self.gdt_block.0 + gdt_idx as u64);
            if current.as_ref().is_none_or(|(b, _)| *b != block.0) {
                if let Some((b, buf)) = current.take() {
                    disk.write_blocks(BlockNumber(b), &buf)?;
                }
                current = Some((block.0, disk.read_block(block)?));
            }
            if let Some((_, buf)) = current.as_mut() {
                let offset = (group.0 as usize % per_block) * ds;
                self.descs[group.0 as usize].encode_into(&mut buf[offset..offset + ds], self.desc_size)?;
            }
            trace!(group = group.0, "group descriptor written");
        }
        if let Some((b, buf)) = current {
            disk.write_blocks(BlockNumber(b), &buf)?;
        }
        Ok(dirty.len())
    }
}

fn out_of_range(group: GroupNumber) -> KfsError {
    KfsError::Corruption {
        block: 0,
        detail: format!("group {group} out of range"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfs_block::MemoryByteDevice;
    use kfs_types::BlockSize;

    fn desc(n: u64) -> Ext4GroupDesc {
        Ext4GroupDesc {
            block_bitmap: n,
            inode_bitmap: n + 1,
            inode_table: n + 2,
            free_blocks_count: 10,
            free_inodes_count: 10,
            used_dirs_count: 0,
            itable_unused: 0,
            flags: 0,
            checksum: 0,
        }
    }

    #[test]
    fn flush_touches_only_dirty_descriptors() {
        let disk = Disk::new(
            Box::new(MemoryByteDevice::new(16 * 1024)),
            BlockSize::new(1024).unwrap(),
        );
        // Pre-existing bytes in an untracked field survive the rewrite.
        disk.write_at(kfs_types::ByteOffset(2 * 1024 + 32 + 0x14), &[0xAB])
            .unwrap();

        let mut table = GroupTable::new(vec![desc(3), desc(8)], 32, BlockNumber(2));
        assert_eq!(table.flush(&disk).unwrap(), 0);
        table.get_mut(GroupNumber(1)).unwrap().free_blocks_count = 4;
        assert!(table.is_dirty());
        assert_eq!(table.flush(&disk).unwrap(), 1);
        assert!(!table.is_dirty());

        let gdt = disk.read_block(BlockNumber(2)).unwrap();
        assert_eq!(gdt[..32], [0_u8; 32]);
        let back = Ext4GroupDesc::parse_from_bytes(&gdt[32..], 32).unwrap();
        assert_eq!(back.free_blocks_count, 4);
        assert_eq!(back.block_bitmap, 8);
        assert_eq!(gdt[32 + 0x14], 0xAB);
    }

    #[test]
    fn out_of_range_group_is_corruption() {
        let mut table = GroupTable::new(vec![desc(3)], 32, BlockNumber(1));
        assert!(matches!(
            table.get_mut(GroupNumber(4)),
            Err(KfsError::Corruption { .. })
        ));
        assert!(!table.is_dirty());
    }
}
