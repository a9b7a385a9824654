#![forbid(unsafe_code)]
//! Block and inode allocation.
//!
//! Per-group inode and block bitmaps are loaded wholesale at mount, mutated
//! in memory and written back only on [`Allocator::flush`]. The group
//! descriptor table lives alongside them with an explicit dirty set; nothing
//! about dirtiness is ever encoded into the on-disk descriptors.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on block/inode bitmaps.
//! 2. **FsGeometry**: group arithmetic derived from the superblock.
//! 3. **GroupTable**: in-memory descriptors plus the dirty set.
//! 4. **Allocator**: first-fit search in the hint group, then wraparound
//!    through every other group in ascending order.

mod groups;

pub use groups::GroupTable;

use std::collections::BTreeSet;

use kfs_block::Disk;
use kfs_error::{KfsError, Result};
use kfs_ondisk::{Ext4GroupDesc, Ext4RoCompatFeatures, Ext4Superblock};
use kfs_types::{BlockNumber, GroupNumber, InodeNumber};
use serde::Serialize;
use tracing::{debug, trace, warn};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Group flags from `bg_flags` field.
const GD_FLAG_INODE_UNINIT: u16 = 0x0001;
const GD_FLAG_BLOCK_UNINIT: u16 = 0x0002;

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // at most `count`
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    (0..count).filter(|&idx| !bitmap_get(bitmap, idx)).count() as u32
}

/// First free (zero) bit in the first `count` bits, scanning from bit 0.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32) -> Option<u32> {
    (0..count).find(|&idx| !bitmap_get(bitmap, idx))
}

/// Find `n` contiguous free bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_find_contiguous(bitmap: &[u8], count: u32, n: u32) -> Option<u32> {
    if n == 0 {
        return None;
    }
    let mut run_start = 0u32;
    let mut run_len = 0u32;

    for idx in 0..count {
        if bitmap_get(bitmap, idx) {
            run_start = idx + 1;
            run_len = 0;
        } else {
            run_len += 1;
            if run_len >= n {
                return Some(run_start);
            }
        }
    }
    None
}

// ── Filesystem geometry ─────────────────────────────────────────────────────

/// Cached filesystem geometry needed by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsGeometry {
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub block_size: u32,
    pub total_blocks: u64,
    pub total_inodes: u32,
    pub first_data_block: u32,
    pub first_ino: u32,
    pub group_count: u32,
    pub inode_size: u16,
    pub desc_size: u16,
    /// Superblock backups only in groups 0, 1 and powers of 3, 5 and 7.
    pub sparse_super: bool,
}

impl FsGeometry {
    /// Derive geometry from a parsed superblock.
    #[must_use]
    pub fn from_superblock(sb: &Ext4Superblock) -> Self {
        Self {
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            block_size: sb.block_size,
            total_blocks: sb.blocks_count,
            total_inodes: sb.inodes_count,
            first_data_block: sb.first_data_block,
            first_ino: sb.first_ino,
            group_count: sb.groups_count(),
            inode_size: sb.effective_inode_size(),
            desc_size: sb.group_desc_size(),
            sparse_super: sb
                .feature_ro_compat
                .contains(Ext4RoCompatFeatures::SPARSE_SUPER),
        }
    }

    /// Whether `group` starts with a superblock copy and descriptor table.
    #[must_use]
    pub fn has_super(&self, group: GroupNumber) -> bool {
        fn is_power_of(mut n: u32, base: u32) -> bool {
            while n % base == 0 {
                n /= base;
            }
            n == 1
        }
        let g = group.0;
        !self.sparse_super
            || g <= 1
            || is_power_of(g, 3)
            || is_power_of(g, 5)
            || is_power_of(g, 7)
    }

    /// Number of blocks in a specific group (last group may be shorter).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let group_start = u64::from(self.first_data_block)
            + u64::from(group.0) * u64::from(self.blocks_per_group);
        let remaining = self.total_blocks.saturating_sub(group_start);
        if remaining >= u64::from(self.blocks_per_group) {
            self.blocks_per_group
        } else {
            remaining as u32
        }
    }

    /// Number of inodes in a specific group (last group may be shorter).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn inodes_in_group(&self, group: GroupNumber) -> u32 {
        let inode_start = u64::from(group.0) * u64::from(self.inodes_per_group);
        let remaining = u64::from(self.total_inodes).saturating_sub(inode_start);
        if remaining >= u64::from(self.inodes_per_group) {
            self.inodes_per_group
        } else {
            remaining as u32
        }
    }

    /// Absolute block number for a relative block within a group.
    #[must_use]
    pub fn group_block_to_absolute(&self, group: GroupNumber, rel_block: u32) -> BlockNumber {
        let abs = u64::from(self.first_data_block)
            + u64::from(group.0) * u64::from(self.blocks_per_group)
            + u64::from(rel_block);
        BlockNumber(abs)
    }

    /// Convert absolute block to (group, relative_block).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn absolute_to_group_block(&self, block: BlockNumber) -> (GroupNumber, u32) {
        let rel = block.0.saturating_sub(u64::from(self.first_data_block));
        let group = (rel / u64::from(self.blocks_per_group)) as u32;
        let offset = (rel % u64::from(self.blocks_per_group)) as u32;
        (GroupNumber(group), offset)
    }

    /// Group holding an inode number.
    #[must_use]
    pub fn inode_group(&self, ino: InodeNumber) -> GroupNumber {
        kfs_types::inode_to_group(ino, self.inodes_per_group)
    }

    /// Blocks occupied by one group's inode table.
    #[must_use]
    pub fn inode_table_blocks(&self) -> u64 {
        (u64::from(self.inodes_per_group) * u64::from(self.inode_size))
            .div_ceil(u64::from(self.block_size))
    }

    /// Bytes of one in-memory bitmap; always a whole block.
    #[must_use]
    pub fn bitmap_len(&self) -> usize {
        self.block_size as usize
    }
}

/// Relative block offsets within `group` occupied by that group's own
/// bitmaps and inode table, plus the superblock and GDT (or their backups)
/// in groups that carry them.
#[must_use]
pub fn reserved_blocks_in_group(
    geo: &FsGeometry,
    desc: &Ext4GroupDesc,
    group: GroupNumber,
) -> Vec<u32> {
    let group_start =
        u64::from(geo.first_data_block) + u64::from(group.0) * u64::from(geo.blocks_per_group);
    let blocks_in_group = geo.blocks_in_group(group);
    let mut reserved = Vec::new();

    let mut add_abs = |abs: u64| {
        if abs >= group_start {
            let rel = abs - group_start;
            if rel < u64::from(blocks_in_group) {
                #[allow(clippy::cast_possible_truncation)]
                reserved.push(rel as u32);
            }
        }
    };

    if geo.has_super(group) {
        let gdt_blocks = (u64::from(geo.group_count) * u64::from(geo.desc_size))
            .div_ceil(u64::from(geo.block_size));
        // Superblock block plus the descriptor table right after it.
        for b in 0..=gdt_blocks {
            add_abs(group_start + b);
        }
    }
    add_abs(desc.block_bitmap);
    add_abs(desc.inode_bitmap);
    for i in 0..geo.inode_table_blocks() {
        add_abs(desc.inode_table + i);
    }

    reserved.sort_unstable();
    reserved.dedup();
    reserved
}

/// Free `(blocks, inodes)` the bitmaps of `group` record, counting only bits
/// inside the group.
#[must_use]
pub fn bitmap_free_counts(
    geo: &FsGeometry,
    group: GroupNumber,
    block_bitmap: &[u8],
    inode_bitmap: &[u8],
) -> (u32, u32) {
    (
        bitmap_count_free(block_bitmap, geo.blocks_in_group(group)),
        bitmap_count_free(inode_bitmap, geo.inodes_in_group(group)),
    )
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// In-memory bitmaps, group descriptors and free counters for one mount.
#[derive(Debug)]
pub struct Allocator {
    geo: FsGeometry,
    groups: GroupTable,
    block_bitmaps: Vec<Vec<u8>>,
    inode_bitmaps: Vec<Vec<u8>>,
    dirty_block_bitmaps: BTreeSet<GroupNumber>,
    dirty_inode_bitmaps: BTreeSet<GroupNumber>,
    free_blocks: u64,
    free_inodes: u32,
}

impl Allocator {
    /// Load the descriptor table and every group's bitmaps.
    pub fn load(disk: &Disk, sb: &Ext4Superblock) -> Result<Self> {
        let geo = FsGeometry::from_superblock(sb);
        let groups = GroupTable::load(disk, sb)?;
        let mut block_bitmaps = Vec::with_capacity(groups.len());
        let mut inode_bitmaps = Vec::with_capacity(groups.len());

        for (idx, desc) in groups.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let group = GroupNumber(idx as u32);
            let block_bitmap = if desc.flags & GD_FLAG_BLOCK_UNINIT != 0 {
                trace!(group = group.0, "synthesizing uninitialized block bitmap");
                let mut bitmap = vec![0_u8; geo.bitmap_len()];
                for rel in reserved_blocks_in_group(&geo, desc, group) {
                    bitmap_set(&mut bitmap, rel);
                }
                bitmap
            } else {
                disk.read_block(BlockNumber(desc.block_bitmap))?
            };
            let inode_bitmap = if desc.flags & GD_FLAG_INODE_UNINIT != 0 {
                trace!(group = group.0, "synthesizing uninitialized inode bitmap");
                vec![0_u8; geo.bitmap_len()]
            } else {
                disk.read_block(BlockNumber(desc.inode_bitmap))?
            };
            let (free_blocks, free_inodes) =
                bitmap_free_counts(&geo, group, &block_bitmap, &inode_bitmap);
            if free_blocks != desc.free_blocks_count || free_inodes != desc.free_inodes_count {
                warn!(
                    group = group.0,
                    desc_free_blocks = desc.free_blocks_count,
                    bitmap_free_blocks = free_blocks,
                    desc_free_inodes = desc.free_inodes_count,
                    bitmap_free_inodes = free_inodes,
                    "group descriptor free counts disagree with bitmaps"
                );
            }
            block_bitmaps.push(block_bitmap);
            inode_bitmaps.push(inode_bitmap);
        }

        debug!(
            groups = geo.group_count,
            free_blocks = sb.free_blocks_count,
            free_inodes = sb.free_inodes_count,
            "allocator loaded"
        );
        Ok(Self {
            geo,
            groups,
            block_bitmaps,
            inode_bitmaps,
            dirty_block_bitmaps: BTreeSet::new(),
            dirty_inode_bitmaps: BTreeSet::new(),
            free_blocks: sb.free_blocks_count,
            free_inodes: sb.free_inodes_count,
        })
    }

    /// Build from already-materialized parts.
    #[must_use]
    pub fn from_parts(
        geo: FsGeometry,
        groups: GroupTable,
        block_bitmaps: Vec<Vec<u8>>,
        inode_bitmaps: Vec<Vec<u8>>,
    ) -> Self {
        let free_blocks = groups.iter().map(|d| u64::from(d.free_blocks_count)).sum();
        let free_inodes = groups.iter().map(|d| d.free_inodes_count).sum();
        Self {
            geo,
            groups,
            block_bitmaps,
            inode_bitmaps,
            dirty_block_bitmaps: BTreeSet::new(),
            dirty_inode_bitmaps: BTreeSet::new(),
            free_blocks,
            free_inodes,
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geo
    }

    #[must_use]
    pub fn groups(&self) -> &GroupTable {
        &self.groups
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.free_blocks
    }

    #[must_use]
    pub fn free_inodes(&self) -> u32 {
        self.free_inodes
    }

    /// Whether anything awaits [`Allocator::flush`].
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.dirty_block_bitmaps.is_empty()
            || !self.dirty_inode_bitmaps.is_empty()
            || self.groups.is_dirty()
    }

    /// Copy the running free counters into the superblock.
    pub fn apply_counts(&self, sb: &mut Ext4Superblock) {
        sb.free_blocks_count = self.free_blocks;
        sb.free_inodes_count = self.free_inodes;
    }

    /// Groups in search order: `near` first, then ascending with wraparound.
    fn search_order(&self, near: GroupNumber) -> impl Iterator<Item = GroupNumber> + use<> {
        let count = self.geo.group_count;
        let start = if near.0 < count { near.0 } else { 0 };
        (0..count).map(move |step| GroupNumber((start + step) % count))
    }

    fn group_index(&self, group: GroupNumber, what: &str) -> Result<usize> {
        let idx = group.0 as usize;
        if idx >= self.block_bitmaps.len() {
            return Err(KfsError::Corruption {
                block: 0,
                detail: format!("{what}: group {group} out of range"),
            });
        }
        Ok(idx)
    }

    // ── Inodes ──────────────────────────────────────────────────────────

    /// First free inode, scanning the group of `near` and then every
    /// other group. Does not mark it used.
    #[must_use]
    pub fn find_free_inode(&self, near: InodeNumber) -> Option<InodeNumber> {
        let hint = self.geo.inode_group(near);
        for group in self.search_order(hint) {
            let bitmap = &self.inode_bitmaps[group.0 as usize];
            let limit = self.geo.inodes_in_group(group);
            let reserved = if group.0 == 0 {
                self.geo.first_ino.saturating_sub(1).min(limit)
            } else {
                0
            };
            trace!(group = group.0, "scanning inode bitmap");
            if let Some(idx) = (reserved..limit).find(|&idx| !bitmap_get(bitmap, idx)) {
                let ino =
                    kfs_types::inode_from_group_index(group, idx, self.geo.inodes_per_group);
                trace!(ino = ino.0, "found free inode");
                return Some(ino);
            }
        }
        debug!("no free inode");
        None
    }

    /// Set or clear an inode's bitmap bit and adjust the free counters.
    pub fn set_inode(&mut self, ino: InodeNumber, used: bool, is_dir: bool) -> Result<()> {
        if ino.0 == 0 || ino.0 > u64::from(self.geo.total_inodes) {
            return Err(KfsError::Corruption {
                block: 0,
                detail: format!("inode {ino} out of range"),
            });
        }
        let group = self.geo.inode_group(ino);
        let gidx = self.group_index(group, "set_inode")?;
        let idx = kfs_types::inode_index_in_group(ino, self.geo.inodes_per_group);
        let bitmap = &mut self.inode_bitmaps[gidx];

        if bitmap_get(bitmap, idx) == used {
            return Err(KfsError::Corruption {
                block: self.groups.get(group).map_or(0, |d| d.inode_bitmap),
                detail: format!(
                    "inode {ino} already {}",
                    if used { "allocated" } else { "free" }
                ),
            });
        }

        let desc = self.groups.get_mut(group)?;
        if used {
            bitmap_set(bitmap, idx);
            desc.free_inodes_count = desc.free_inodes_count.saturating_sub(1);
            if is_dir {
                desc.used_dirs_count += 1;
            }
            self.free_inodes = self.free_inodes.saturating_sub(1);
        } else {
            bitmap_clear(bitmap, idx);
            desc.free_inodes_count += 1;
            if is_dir {
                desc.used_dirs_count = desc.used_dirs_count.saturating_sub(1);
            }
            self.free_inodes += 1;
        }
        desc.flags &= !GD_FLAG_INODE_UNINIT;
        self.dirty_inode_bitmaps.insert(group);
        trace!(ino = ino.0, used, "inode bitmap updated");
        Ok(())
    }

    /// Find and mark a free inode near `near`.
    pub fn alloc_inode(&mut self, near: InodeNumber, is_dir: bool) -> Result<InodeNumber> {
        let ino = self.find_free_inode(near).ok_or(KfsError::NoSpace)?;
        self.set_inode(ino, true, is_dir)?;
        Ok(ino)
    }

    #[must_use]
    pub fn inode_in_use(&self, ino: InodeNumber) -> bool {
        let group = self.geo.inode_group(ino);
        let idx = kfs_types::inode_index_in_group(ino, self.geo.inodes_per_group);
        self.inode_bitmaps
            .get(group.0 as usize)
            .is_some_and(|bitmap| bitmap_get(bitmap, idx))
    }

    // ── Blocks ──────────────────────────────────────────────────────────

    /// Start of `count` contiguous free blocks. `near` names the preferred
    /// block: if it and the following blocks are free they are returned as
    /// is, otherwise the search is first-fit from the start of `near`'s
    /// group and then the remaining groups. Does not mark them used.
    pub fn find_free_block(&self, near: BlockNumber, count: u32) -> Result<BlockNumber> {
        if count == 0 || count > self.geo.blocks_per_group {
            return Err(KfsError::InvalidArgument(format!(
                "cannot allocate a run of {count} blocks"
            )));
        }
        let (hint_group, hint_rel) = self.geo.absolute_to_group_block(near);

        if let Some(bitmap) = self.block_bitmaps.get(hint_group.0 as usize) {
            let limit = self.geo.blocks_in_group(hint_group);
            let fits = hint_rel
                .checked_add(count)
                .is_some_and(|end| end <= limit);
            if near.0 >= u64::from(self.geo.first_data_block)
                && fits
                && (hint_rel..hint_rel + count).all(|idx| !bitmap_get(bitmap, idx))
            {
                trace!(block = near.0, count, "goal block free");
                return Ok(near);
            }
        }

        for group in self.search_order(hint_group) {
            let bitmap = &self.block_bitmaps[group.0 as usize];
            let limit = self.geo.blocks_in_group(group);
            trace!(group = group.0, count, "scanning block bitmap");
            let found = if count == 1 {
                bitmap_find_free(bitmap, limit)
            } else {
                bitmap_find_contiguous(bitmap, limit, count)
            };
            if let Some(rel) = found {
                return Ok(self.geo.group_block_to_absolute(group, rel));
            }
        }
        debug!(count, "no free block run");
        Err(KfsError::NoSpace)
    }

    /// Set or clear `len` block bits starting at `start`. The run must lie
    /// inside one group.
    pub fn set_block_range(&mut self, start: BlockNumber, len: u32, used: bool) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if start.0 < u64::from(self.geo.first_data_block)
            || start.0 + u64::from(len) > self.geo.total_blocks
        {
            return Err(KfsError::corrupt_at(start.0, "block run out of range"));
        }
        let (group, rel_start) = self.geo.absolute_to_group_block(start);
        let gidx = self.group_index(group, "set_block_range")?;
        if u64::from(rel_start) + u64::from(len) > u64::from(self.geo.blocks_in_group(group)) {
            return Err(KfsError::corrupt_at(start.0, "block run crosses group end"));
        }

        let bitmap = &mut self.block_bitmaps[gidx];
        for idx in rel_start..rel_start + len {
            if bitmap_get(bitmap, idx) == used {
                return Err(KfsError::corrupt_at(
                    self.geo.group_block_to_absolute(group, idx).0,
                    if used {
                        "block already allocated"
                    } else {
                        "double-free: block already free in bitmap"
                    },
                ));
            }
        }
        for idx in rel_start..rel_start + len {
            if used {
                bitmap_set(bitmap, idx);
            } else {
                bitmap_clear(bitmap, idx);
            }
        }

        let desc = self.groups.get_mut(group)?;
        if used {
            desc.free_blocks_count = desc.free_blocks_count.saturating_sub(len);
            self.free_blocks = self.free_blocks.saturating_sub(u64::from(len));
        } else {
            desc.free_blocks_count += len;
            self.free_blocks += u64::from(len);
        }
        desc.flags &= !GD_FLAG_BLOCK_UNINIT;
        self.dirty_block_bitmaps.insert(group);
        trace!(start = start.0, len, used, "block bitmap updated");
        Ok(())
    }

    /// Find and mark `count` contiguous blocks near `near`.
    pub fn alloc_blocks(&mut self, near: BlockNumber, count: u32) -> Result<BlockNumber> {
        let start = self.find_free_block(near, count)?;
        self.set_block_range(start, count, true)?;
        Ok(start)
    }

    /// Release a physical run, one group at a time.
    pub fn free_blocks_run(&mut self, start: BlockNumber, len: u64) -> Result<()> {
        let mut block = start;
        let mut remaining = len;
        while remaining > 0 {
            let (group, rel) = self.geo.absolute_to_group_block(block);
            let room = u64::from(self.geo.blocks_in_group(group).saturating_sub(rel)).max(1);
            let chunk = remaining.min(room);
            #[allow(clippy::cast_possible_truncation)] // bounded by blocks_per_group
            self.set_block_range(block, chunk as u32, false)?;
            block = BlockNumber(block.0 + chunk);
            remaining -= chunk;
        }
        Ok(())
    }

    #[must_use]
    pub fn block_in_use(&self, block: BlockNumber) -> bool {
        let (group, rel) = self.geo.absolute_to_group_block(block);
        self.block_bitmaps
            .get(group.0 as usize)
            .is_some_and(|bitmap| bitmap_get(bitmap, rel))
    }

    // ── Write-back ──────────────────────────────────────────────────────

    /// Write dirty bitmaps and descriptors; clears the dirty sets.
    pub fn flush(&mut self, disk: &Disk) -> Result<()> {
        let blocks = std::mem::take(&mut self.dirty_block_bitmaps);
        let inodes = std::mem::take(&mut self.dirty_inode_bitmaps);
        for group in &blocks {
            let desc = self.groups.get(*group)?;
            disk.write_blocks(
                BlockNumber(desc.block_bitmap),
                &self.block_bitmaps[group.0 as usize],
            )?;
        }
        for group in &inodes {
            let desc = self.groups.get(*group)?;
            disk.write_blocks(
                BlockNumber(desc.inode_bitmap),
                &self.inode_bitmaps[group.0 as usize],
            )?;
        }
        let descs = self.groups.flush(disk)?;
        debug!(
            block_bitmaps = blocks.len(),
            inode_bitmaps = inodes.len(),
            descriptors = descs,
            "allocator flushed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfs_block::MemoryByteDevice;
    use kfs_types::BlockSize;
    use proptest::prelude::*;

    fn make_geometry() -> FsGeometry {
        FsGeometry {
            blocks_per_group: 8192,
            inodes_per_group: 64,
            block_size: 1024,
            total_blocks: 8192 * 3 + 1,
            total_inodes: 64 * 3,
            first_data_block: 1,
            first_ino: 11,
            group_count: 3,
            inode_size: 256,
            desc_size: 32,
            sparse_super: true,
        }
    }

    fn desc_for(g: u32) -> Ext4GroupDesc {
        let base = 1 + u64::from(g) * 8192;
        Ext4GroupDesc {
            block_bitmap: base + 2,
            inode_bitmap: base + 3,
            inode_table: base + 4,
            free_blocks_count: 8192,
            free_inodes_count: 64,
            used_dirs_count: 0,
            itable_unused: 0,
            flags: 0,
            checksum: 0,
        }
    }

    fn make_allocator() -> Allocator {
        let geo = make_geometry();
        let descs: Vec<_> = (0..geo.group_count).map(desc_for).collect();
        let mut block_bitmaps = Vec::new();
        for (g, desc) in descs.iter().enumerate() {
            let mut bitmap = vec![0_u8; geo.bitmap_len()];
            for rel in reserved_blocks_in_group(&geo, desc, GroupNumber(g as u32)) {
                bitmap_set(&mut bitmap, rel);
            }
            block_bitmaps.push(bitmap);
        }
        let inode_bitmaps = vec![vec![0_u8; geo.bitmap_len()]; geo.group_count as usize];
        Allocator::from_parts(geo, GroupTable::new(descs, 32, BlockNumber(2)), block_bitmaps, inode_bitmaps)
    }

    // ── Bitmap tests ────────────────────────────────────────────────────

    #[test]
    fn bitmap_get_set_clear() {
        let mut bm = vec![0_u8; 4];
        assert!(!bitmap_get(&bm, 0));
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 9);
        assert!(bitmap_get(&bm, 0));
        assert!(bitmap_get(&bm, 9));
        assert_eq!(bm[1], 0b10);
        bitmap_clear(&mut bm, 9);
        assert!(!bitmap_get(&bm, 9));
        // Out of range is a no-op.
        bitmap_set(&mut bm, 1000);
        assert!(!bitmap_get(&bm, 1000));
    }

    #[test]
    fn bitmap_count_and_find() {
        let mut bm = vec![0_u8; 2];
        for i in 0..5 {
            bitmap_set(&mut bm, i);
        }
        assert_eq!(bitmap_count_free(&bm, 16), 11);
        assert_eq!(bitmap_find_free(&bm, 16), Some(5));
        assert_eq!(bitmap_find_free(&bm, 5), None);
    }

    #[test]
    fn bitmap_free_counts_ignore_bits_past_the_group() {
        let geo = FsGeometry {
            total_blocks: 1 + 8192 * 2 + 10,
            ..make_geometry()
        };
        let last = GroupNumber(2);
        // The short last group has its padding bits set.
        assert_eq!(geo.blocks_in_group(last), 10);
        let mut blocks = vec![0xFF_u8; geo.bitmap_len()];
        bitmap_clear(&mut blocks, 0);
        bitmap_clear(&mut blocks, 9);
        let mut inodes = vec![0_u8; geo.bitmap_len()];
        bitmap_set(&mut inodes, 3);
        assert_eq!(bitmap_free_counts(&geo, last, &blocks, &inodes), (2, 63));

        let desc = desc_for(0);
        let mut blocks = vec![0_u8; geo.bitmap_len()];
        let reserved = reserved_blocks_in_group(&geo, &desc, GroupNumber(0));
        for &rel in &reserved {
            bitmap_set(&mut blocks, rel);
        }
        let (free_blocks, free_inodes) =
            bitmap_free_counts(&geo, GroupNumber(0), &blocks, &vec![0_u8; geo.bitmap_len()]);
        assert_eq!(free_blocks as usize, 8192 - reserved.len());
        assert_eq!(free_inodes, 64);
    }

    #[test]
    fn bitmap_find_contiguous_skips_short_runs() {
        let mut bm = vec![0_u8; 2];
        bitmap_set(&mut bm, 2);
        bitmap_set(&mut bm, 6);
        assert_eq!(bitmap_find_contiguous(&bm, 16, 3), Some(3));
        assert_eq!(bitmap_find_contiguous(&bm, 16, 5), Some(7));
        assert_eq!(bitmap_find_contiguous(&bm, 8, 5), None);
    }

    // ── Geometry tests ──────────────────────────────────────────────────

    #[test]
    fn geometry_group_block_conversion() {
        let geo = make_geometry();
        let abs = geo.group_block_to_absolute(GroupNumber(2), 5);
        assert_eq!(abs, BlockNumber(1 + 2 * 8192 + 5));
        assert_eq!(geo.absolute_to_group_block(abs), (GroupNumber(2), 5));
        assert_eq!(geo.blocks_in_group(GroupNumber(2)), 8192);
        assert_eq!(geo.inode_table_blocks(), 16);
    }

    #[test]
    fn reserved_blocks_cover_metadata() {
        let geo = make_geometry();
        let reserved = reserved_blocks_in_group(&geo, &desc_for(0), GroupNumber(0));
        // superblock, 1 GDT block, 2 bitmaps, 16 inode table blocks
        assert_eq!(reserved, (0..20).collect::<Vec<u32>>());
        // Group 1 carries a backup superblock and GDT.
        let reserved = reserved_blocks_in_group(&geo, &desc_for(1), GroupNumber(1));
        assert_eq!(reserved, (0..20).collect::<Vec<u32>>());
        let reserved = reserved_blocks_in_group(&geo, &desc_for(2), GroupNumber(2));
        assert_eq!(reserved.first(), Some(&2));
        assert_eq!(reserved.len(), 18);
    }

    #[test]
    fn sparse_super_backup_groups() {
        let mut geo = make_geometry();
        let backups: Vec<u32> = (0..50).filter(|&g| geo.has_super(GroupNumber(g))).collect();
        assert_eq!(backups, vec![0, 1, 3, 5, 7, 9, 25, 27, 49]);
        geo.sparse_super = false;
        assert!(geo.has_super(GroupNumber(2)));
    }

    // ── Allocation tests ────────────────────────────────────────────────

    #[test]
    fn inode_search_skips_reserved_and_wraps() {
        let mut alloc = make_allocator();
        let first = alloc.alloc_inode(InodeNumber::ROOT, false).unwrap();
        assert_eq!(first, InodeNumber(11));
        assert_eq!(alloc.free_inodes(), 64 * 3 - 1);

        // Fill group 2, then a hint there wraps to group 0.
        for idx in 0..64 {
            let ino = kfs_types::inode_from_group_index(GroupNumber(2), idx, 64);
            alloc.set_inode(ino, true, false).unwrap();
        }
        let hinted = alloc.find_free_inode(InodeNumber(64 * 2 + 5)).unwrap();
        assert_eq!(hinted, InodeNumber(12));
        let in_group1 = alloc.find_free_inode(InodeNumber(70)).unwrap();
        assert_eq!(in_group1, InodeNumber(65));
    }

    #[test]
    fn inode_double_free_is_corruption() {
        let mut alloc = make_allocator();
        let ino = alloc.alloc_inode(InodeNumber::ROOT, true).unwrap();
        assert_eq!(alloc.groups().get(GroupNumber(0)).unwrap().used_dirs_count, 1);
        alloc.set_inode(ino, false, true).unwrap();
        assert!(matches!(
            alloc.set_inode(ino, false, true),
            Err(KfsError::Corruption { .. })
        ));
    }

    #[test]
    fn block_goal_then_first_fit() {
        let mut alloc = make_allocator();
        let a = alloc.alloc_blocks(BlockNumber(1), 1).unwrap();
        assert_eq!(a, BlockNumber(21));
        // Goal right after `a` is free: returned as is.
        let b = alloc.alloc_blocks(BlockNumber(a.0 + 1), 1).unwrap();
        assert_eq!(b, BlockNumber(22));
        // Goal in use: first fit in that group.
        let c = alloc.alloc_blocks(a, 4).unwrap();
        assert_eq!(c, BlockNumber(23));
        assert_eq!(alloc.free_blocks(), 8192 * 3 - 6);
        assert!(alloc.block_in_use(BlockNumber(26)));
    }

    #[test]
    fn exhausted_group_falls_through_to_next() {
        let mut alloc = make_allocator();
        let g0_free = 8192 - 20;
        alloc.set_block_range(BlockNumber(21), g0_free, true).unwrap();
        let next = alloc.find_free_block(BlockNumber(100), 1).unwrap();
        assert_eq!(alloc.geometry().absolute_to_group_block(next).0, GroupNumber(1));
    }

    #[test]
    fn no_space_surfaces() {
        let mut alloc = make_allocator();
        for g in 0..3 {
            let group = GroupNumber(g);
            for rel in 0..alloc.geo.blocks_in_group(group) {
                let abs = alloc.geo.group_block_to_absolute(group, rel);
                if !alloc.block_in_use(abs) {
                    alloc.set_block_range(abs, 1, true).unwrap();
                }
            }
        }
        assert!(matches!(
            alloc.find_free_block(BlockNumber(1), 1),
            Err(KfsError::NoSpace)
        ));
    }

    #[test]
    fn free_run_detects_double_free() {
        let mut alloc = make_allocator();
        let start = alloc.alloc_blocks(BlockNumber(1), 3).unwrap();
        alloc.free_blocks_run(start, 3).unwrap();
        assert!(alloc.free_blocks_run(start, 1).is_err());
    }

    #[test]
    fn flush_writes_bitmaps_and_descriptors() {
        let geo = make_geometry();
        let bs = BlockSize::new(1024).unwrap();
        let disk = Disk::new(
            Box::new(MemoryByteDevice::new((geo.total_blocks as usize) * 1024)),
            bs,
        );
        let mut alloc = make_allocator();
        let ino = alloc.alloc_inode(InodeNumber::ROOT, false).unwrap();
        let blk = alloc.alloc_blocks(BlockNumber(1), 2).unwrap();
        assert!(alloc.is_dirty());
        alloc.flush(&disk).unwrap();
        assert!(!alloc.is_dirty());

        let ibm = disk.read_block(BlockNumber(desc_for(0).inode_bitmap)).unwrap();
        assert!(bitmap_get(&ibm, (ino.0 - 1) as u32));
        let bbm = disk.read_block(BlockNumber(desc_for(0).block_bitmap)).unwrap();
        assert!(bitmap_get(&bbm, (blk.0 - 1) as u32));

        let gdt = disk.read_block(BlockNumber(2)).unwrap();
        let desc = Ext4GroupDesc::parse_from_bytes(&gdt, 32).unwrap();
        assert_eq!(desc.free_blocks_count, 8190);
        assert_eq!(desc.free_inodes_count, 63);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Inodes handed out without an intervening release are distinct.
        #[test]
        fn inode_allocation_is_exclusive(
            hints in proptest::collection::vec(1_u64..=192, 1..120),
        ) {
            let mut alloc = make_allocator();
            let mut seen = std::collections::HashSet::new();
            for hint in hints {
                match alloc.alloc_inode(InodeNumber(hint), false) {
                    Ok(ino) => prop_assert!(seen.insert(ino)),
                    Err(KfsError::NoSpace) => break,
                    Err(e) => return Err(TestCaseError::fail(e.to_string())),
                }
            }
        }

        /// Block runs never overlap each other or metadata.
        #[test]
        fn block_runs_are_exclusive(
            reqs in proptest::collection::vec((1_u64..24_577, 1_u32..9), 1..60),
        ) {
            let mut alloc = make_allocator();
            let mut owned = std::collections::HashSet::new();
            for (near, count) in reqs {
                let start = alloc.alloc_blocks(BlockNumber(near), count).unwrap();
                for b in start.0..start.0 + u64::from(count) {
                    prop_assert!(owned.insert(b));
                    let (g, rel) = alloc.geo.absolute_to_group_block(BlockNumber(b));
                    let desc = desc_for(g.0);
                    prop_assert!(
                        !reserved_blocks_in_group(&alloc.geo, &desc, g).contains(&rel)
                    );
                }
            }
        }
    }
}
