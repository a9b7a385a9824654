//! Pre-extent block maps: 12 direct pointers, then single, double and
//! triple indirect blocks of little-endian `u32` pointers.

use kfs_block::Disk;
use kfs_error::{KfsError, Result};
use kfs_types::{
    BlockNumber, EXT4_DIND_BLOCK, EXT4_IND_BLOCK, EXT4_N_BLOCKS_BYTES, EXT4_NDIR_BLOCKS,
    EXT4_TIND_BLOCK, read_le_u32, write_le_u32,
};
use tracing::trace;

use crate::{BlockAllocator, FreedRange};

/// Pointer chain for one logical block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockPath {
    Direct(usize),
    /// Slot in `i_block`, then one index per indirection level.
    Indirect { slot: usize, indexes: Vec<usize> },
}

/// Decompose `lblock` into its pointer chain; `None` past the triple
/// indirect range.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // indexes are below per_block
pub fn block_path(lblock: u64, per_block: u64) -> Option<BlockPath> {
    let ndir = EXT4_NDIR_BLOCKS as u64;
    if lblock < ndir {
        return Some(BlockPath::Direct(lblock as usize));
    }
    let mut rel = lblock - ndir;
    let mut span = per_block;
    for (level, slot) in [EXT4_IND_BLOCK, EXT4_DIND_BLOCK, EXT4_TIND_BLOCK].into_iter().enumerate() {
        if rel < span {
            let mut indexes = Vec::with_capacity(level + 1);
            let mut divisor = span / per_block;
            for _ in 0..=level {
                indexes.push(((rel / divisor) % per_block) as usize);
                divisor /= per_block.max(1);
            }
            return Some(BlockPath::Indirect { slot, indexes });
        }
        rel -= span;
        span = span.checked_mul(per_block)?;
    }
    None
}

fn root_pointer(root: &[u8; EXT4_N_BLOCKS_BYTES], slot: usize) -> Result<u32> {
    Ok(read_le_u32(root, slot * 4)?)
}

fn pointer_in(disk: &Disk, block: u32, index: usize) -> Result<u32> {
    if u64::from(block) >= disk.block_count() {
        return Err(KfsError::corrupt_at(u64::from(block), "indirect block outside the device"));
    }
    let buf = disk.read_block(BlockNumber(u64::from(block)))?;
    Ok(read_le_u32(&buf, index * 4)?)
}

/// Physical block for `lblock`, or `None` for a hole.
pub fn resolve(disk: &Disk, root: &[u8; EXT4_N_BLOCKS_BYTES], lblock: u64) -> Result<Option<u64>> {
    let per_block = u64::from(disk.block_size().get() / 4);
    let Some(path) = block_path(lblock, per_block) else {
        return Ok(None);
    };
    let ptr = match path {
        BlockPath::Direct(idx) => root_pointer(root, idx)?,
        BlockPath::Indirect { slot, indexes } => {
            let mut ptr = root_pointer(root, slot)?;
            for idx in indexes {
                if ptr == 0 {
                    break;
                }
                ptr = pointer_in(disk, ptr, idx)?;
            }
            ptr
        }
    };
    trace!(lblock, physical = ptr, "legacy_resolve");
    Ok((ptr != 0).then_some(u64::from(ptr)))
}

/// Visit every mapped data block as `(logical, physical)`.
#[allow(clippy::cast_possible_truncation)]
pub fn walk<F>(disk: &Disk, root: &[u8; EXT4_N_BLOCKS_BYTES], visitor: &mut F) -> Result<()>
where
    F: FnMut(u64, u64) -> Result<()>,
{
    fn walk_level<F>(
        disk: &Disk,
        block: u32,
        level: u32,
        base: u64,
        per_block: u64,
        visitor: &mut F,
    ) -> Result<()>
    where
        F: FnMut(u64, u64) -> Result<()>,
    {
        let buf = disk.read_block(BlockNumber(u64::from(block)))?;
        let span = per_block.pow(level - 1);
        for idx in 0..per_block as usize {
            let ptr = read_le_u32(&buf, idx * 4)?;
            if ptr == 0 {
                continue;
            }
            let child_base = base + idx as u64 * span;
            if level == 1 {
                visitor(child_base, u64::from(ptr))?;
            } else {
                walk_level(disk, ptr, level - 1, child_base, per_block, visitor)?;
            }
        }
        Ok(())
    }

    let per_block = u64::from(disk.block_size().get() / 4);
    for idx in 0..EXT4_NDIR_BLOCKS {
        let ptr = root_pointer(root, idx)?;
        if ptr != 0 {
            visitor(idx as u64, u64::from(ptr))?;
        }
    }
    let mut base = EXT4_NDIR_BLOCKS as u64;
    for (level, slot) in [(1, EXT4_IND_BLOCK), (2, EXT4_DIND_BLOCK), (3, EXT4_TIND_BLOCK)] {
        let ptr = root_pointer(root, slot)?;
        if ptr != 0 {
            walk_level(disk, ptr, level, base, per_block, visitor)?;
        }
        base += per_block.pow(level);
    }
    Ok(())
}

/// Release every data block at or past `keep` and every indirect block
/// left empty. Returns the data ranges freed; indirect blocks go back
/// through `alloc`.
pub fn truncate(
    disk: &Disk,
    root: &mut [u8; EXT4_N_BLOCKS_BYTES],
    keep: u64,
    alloc: &mut dyn BlockAllocator,
) -> Result<Vec<FreedRange>> {
    let per_block = u64::from(disk.block_size().get() / 4);
    let mut freed = Vec::new();

    for idx in 0..EXT4_NDIR_BLOCKS {
        let ptr = root_pointer(root, idx)?;
        if ptr != 0 && idx as u64 >= keep {
            push_freed(&mut freed, u64::from(ptr));
            write_le_u32(root, idx * 4, 0)?;
        }
    }

    let mut base = EXT4_NDIR_BLOCKS as u64;
    for (level, slot) in [(1, EXT4_IND_BLOCK), (2, EXT4_DIND_BLOCK), (3, EXT4_TIND_BLOCK)] {
        let span = per_block.pow(level);
        let ptr = root_pointer(root, slot)?;
        if ptr != 0 && base + span > keep {
            let empty = prune(disk, ptr, level, base, keep, per_block, alloc, &mut freed)?;
            if empty {
                alloc.free_block(BlockNumber(u64::from(ptr)))?;
                write_le_u32(root, slot * 4, 0)?;
            }
        }
        base += span;
    }
    Ok(freed)
}

/// Returns whether the pointer block at `block` holds no pointers anymore.
#[allow(clippy::too_many_arguments, clippy::cast_possible_truncation)]
fn prune(
    disk: &Disk,
    block: u32,
    level: u32,
    base: u64,
    keep: u64,
    per_block: u64,
    alloc: &mut dyn BlockAllocator,
    freed: &mut Vec<FreedRange>,
) -> Result<bool> {
    let bn = BlockNumber(u64::from(block));
    let mut buf = disk.read_block(bn)?;
    let span = per_block.pow(level - 1);
    let mut changed = false;
    let mut live = 0_usize;

    for idx in 0..per_block as usize {
        let ptr = read_le_u32(&buf, idx * 4)?;
        if ptr == 0 {
            continue;
        }
        let child_base = base + idx as u64 * span;
        let drop = if child_base + span <= keep {
            false
        } else if level == 1 {
            push_freed(freed, u64::from(ptr));
            true
        } else if prune(disk, ptr, level - 1, child_base, keep, per_block, alloc, freed)? {
            alloc.free_block(BlockNumber(u64::from(ptr)))?;
            true
        } else {
            false
        };
        if drop {
            write_le_u32(&mut buf, idx * 4, 0)?;
            changed = true;
        } else {
            live += 1;
        }
    }
    if changed && live > 0 {
        disk.write_blocks(bn, &buf)?;
    }
    Ok(live == 0)
}

fn push_freed(freed: &mut Vec<FreedRange>, physical: u64) {
    if let Some(last) = freed.last_mut()
        && last.physical_start + u64::from(last.count) == physical
    {
        last.count += 1;
        return;
    }
    freed.push(FreedRange {
        physical_start: physical,
        count: 1,
    });
}
