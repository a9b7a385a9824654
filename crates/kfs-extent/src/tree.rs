//! ext4 extent B+tree operations over the 60-byte inode root and
//! block-sized external nodes.
//!
//! Depth 0: root contains up to 4 leaf extents.
//! Depth 1: root indexes up to 4 child blocks, each holding up to
//!          `(block_size - 12) / 12` entries (340 at 4K).

use kfs_block::Disk;
use kfs_error::{KfsError, Result};
use kfs_ondisk::{
    EXTENT_ROOT_MAX_ENTRIES, Ext4Extent, Ext4ExtentHeader, Ext4ExtentIndex, ExtentTree,
    extent_node_capacity, parse_extent_tree, write_extent_node,
};
use kfs_types::{BlockNumber, EXT_INIT_MAX_LEN, EXT4_N_BLOCKS_BYTES};
use tracing::{debug, error, trace};

use crate::{BlockAllocator, FreedRange};

/// Deepest tree the kernel builds.
pub const MAX_DEPTH: u16 = 5;

// ── Search ──────────────────────────────────────────────────────────────────

/// Result of searching for a logical block in the extent tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchResult {
    /// Found an extent covering the target logical block.
    Found {
        extent: Ext4Extent,
        /// Offset within the extent (target - extent.logical_block).
        offset_in_extent: u32,
    },
    /// Target falls in a hole (unmapped region).
    Hole {
        /// Unmapped blocks from target until the next extent, or
        /// `u32::MAX` if none follows.
        hole_len: u32,
    },
}

/// Search the tree rooted in `root` for `target`, reading child blocks from
/// `disk` as needed.
pub fn search(disk: &Disk, root: &[u8; EXT4_N_BLOCKS_BYTES], target: u32) -> Result<SearchResult> {
    let (header, tree) = parse_root(root)?;
    match tree {
        ExtentTree::Leaf(extents) => Ok(search_leaf(&extents, target)),
        ExtentTree::Index(indexes) => {
            let child = find_index_child(&indexes, target)?;
            descend_search(disk, child, header.depth - 1, target)
        }
    }
}

fn descend_search(disk: &Disk, block: u64, depth: u16, target: u32) -> Result<SearchResult> {
    match read_node(disk, block, depth)? {
        ExtentTree::Leaf(extents) => Ok(search_leaf(&extents, target)),
        ExtentTree::Index(indexes) => {
            let child = find_index_child(&indexes, target)?;
            descend_search(disk, child, depth - 1, target)
        }
    }
}

/// Last extent with `logical_block <= target`, or the hole before the next.
fn search_leaf(extents: &[Ext4Extent], target: u32) -> SearchResult {
    let pos = extents.partition_point(|e| e.logical_block <= target);

    if pos > 0 {
        let ext = extents[pos - 1];
        if ext.contains(target) {
            return SearchResult::Found {
                extent: ext,
                offset_in_extent: target - ext.logical_block,
            };
        }
    }

    let next_start = extents.get(pos).map_or(u32::MAX, |e| e.logical_block);
    SearchResult::Hole {
        hole_len: next_start.saturating_sub(target),
    }
}

/// Leaf block of the last index entry with `logical_block <= target`.
fn find_index_child(indexes: &[Ext4ExtentIndex], target: u32) -> Result<u64> {
    if indexes.is_empty() {
        return Err(KfsError::corrupt_at(0, "extent tree index node has no entries"));
    }
    Ok(indexes[find_index_pos(indexes, target)].leaf_block)
}

fn find_index_pos(indexes: &[Ext4ExtentIndex], target: u32) -> usize {
    indexes
        .partition_point(|idx| idx.logical_block <= target)
        .saturating_sub(1)
}

// ── Walk ────────────────────────────────────────────────────────────────────

/// Visit every extent in logical order. Returns how many were visited.
pub fn walk<F>(disk: &Disk, root: &[u8; EXT4_N_BLOCKS_BYTES], visitor: &mut F) -> Result<usize>
where
    F: FnMut(&Ext4Extent) -> Result<()>,
{
    let (header, tree) = parse_root(root)?;
    walk_tree(disk, header.depth, tree, visitor)
}

fn walk_tree<F>(disk: &Disk, depth: u16, tree: ExtentTree, visitor: &mut F) -> Result<usize>
where
    F: FnMut(&Ext4Extent) -> Result<()>,
{
    match tree {
        ExtentTree::Leaf(extents) => {
            for ext in &extents {
                visitor(ext)?;
            }
            Ok(extents.len())
        }
        ExtentTree::Index(indexes) => {
            let mut count = 0;
            for idx in &indexes {
                let child = read_node(disk, idx.leaf_block, depth - 1)?;
                count += walk_tree(disk, depth - 1, child, visitor)?;
            }
            Ok(count)
        }
    }
}

/// Physical blocks holding external tree nodes.
#[cfg(test)]
pub(crate) fn node_blocks(disk: &Disk, root: &[u8; EXT4_N_BLOCKS_BYTES]) -> Result<Vec<u64>> {
    fn collect(disk: &Disk, depth: u16, tree: &ExtentTree, out: &mut Vec<u64>) -> Result<()> {
        if let ExtentTree::Index(indexes) = tree {
            for idx in indexes {
                out.push(idx.leaf_block);
                let child = read_node(disk, idx.leaf_block, depth - 1)?;
                collect(disk, depth - 1, &child, out)?;
            }
        }
        Ok(())
    }
    let (header, tree) = parse_root(root)?;
    let mut out = Vec::new();
    collect(disk, header.depth, &tree, &mut out)?;
    Ok(out)
}

// ── Insert ──────────────────────────────────────────────────────────────────

/// Insert `extent` into the tree rooted at `root`.
///
/// The extent is merged into its left neighbour when both are initialized
/// and contiguous logically and physically. Overlapping an existing extent
/// is an error. A full root moves its entries into a new child block and
/// becomes an index one level deeper; full external nodes split in half.
pub fn insert(
    disk: &Disk,
    root: &mut [u8; EXT4_N_BLOCKS_BYTES],
    extent: Ext4Extent,
    alloc: &mut dyn BlockAllocator,
) -> Result<()> {
    let (header, tree) = parse_root(root)?;
    trace!(
        logical_start = extent.logical_block,
        len = extent.actual_len(),
        physical_block = extent.physical_start,
        tree_depth = header.depth,
        "extent_insert"
    );

    match tree {
        ExtentTree::Leaf(mut extents) => {
            leaf_insert(&mut extents, extent)?;
            if extents.len() <= usize::from(EXTENT_ROOT_MAX_ENTRIES) {
                return write_root(root, &header, &ExtentTree::Leaf(extents));
            }
            grow_root(disk, root, &header, ExtentTree::Leaf(extents), alloc)
        }
        ExtentTree::Index(mut indexes) => {
            let pos = find_index_pos(&indexes, extent.logical_block);
            if indexes[pos].logical_block > extent.logical_block {
                indexes[pos].logical_block = extent.logical_block;
            }
            let split = insert_descend(disk, indexes[pos].leaf_block, header.depth - 1, extent, alloc)?;
            if let Some(new_entry) = split {
                indexes.insert(pos + 1, new_entry);
            }
            if indexes.len() <= usize::from(EXTENT_ROOT_MAX_ENTRIES) {
                return write_root(root, &header, &ExtentTree::Index(indexes));
            }
            grow_root(disk, root, &header, ExtentTree::Index(indexes), alloc)
        }
    }
}

fn leaf_insert(extents: &mut Vec<Ext4Extent>, extent: Ext4Extent) -> Result<()> {
    let pos = extents.partition_point(|e| e.logical_block < extent.logical_block);

    if let Some(next) = extents.get(pos)
        && extent.logical_end() > u64::from(next.logical_block)
    {
        return Err(KfsError::corrupt_at(
            extent.physical_start,
            format!("extent at logical {} overlaps the next one", extent.logical_block),
        ));
    }
    if pos > 0 {
        let prev = &mut extents[pos - 1];
        if prev.logical_end() > u64::from(extent.logical_block) {
            return Err(KfsError::corrupt_at(
                extent.physical_start,
                format!("extent at logical {} overlaps the previous one", extent.logical_block),
            ));
        }
        let merged_len = u32::from(prev.actual_len()) + u32::from(extent.actual_len());
        if !prev.is_unwritten()
            && !extent.is_unwritten()
            && prev.logical_end() == u64::from(extent.logical_block)
            && prev.physical_start + u64::from(prev.actual_len()) == extent.physical_start
            && merged_len <= u32::from(EXT_INIT_MAX_LEN)
        {
            #[allow(clippy::cast_possible_truncation)] // bounded by EXT_INIT_MAX_LEN
            {
                prev.raw_len = merged_len as u16;
            }
            trace!(logical = prev.logical_block, len = merged_len, "extent_merge");
            return Ok(());
        }
    }
    extents.insert(pos, extent);
    Ok(())
}

/// Returns `Some(new_index_entry)` when the child split.
fn insert_descend(
    disk: &Disk,
    block: u64,
    depth: u16,
    extent: Ext4Extent,
    alloc: &mut dyn BlockAllocator,
) -> Result<Option<Ext4ExtentIndex>> {
    let capacity = usize::from(node_capacity(disk));
    match read_node(disk, block, depth)? {
        ExtentTree::Leaf(mut extents) => {
            leaf_insert(&mut extents, extent)?;
            if extents.len() <= capacity {
                write_node(disk, block, depth, &ExtentTree::Leaf(extents))?;
                return Ok(None);
            }
            let right = extents.split_off(extents.len() / 2);
            let separator = right[0].logical_block;
            write_node(disk, block, depth, &ExtentTree::Leaf(extents))?;
            let new_block = alloc.alloc_block()?;
            write_node(disk, new_block.0, depth, &ExtentTree::Leaf(right))?;
            debug!(old_node = block, new_node = new_block.0, separator_key = separator, "extent_leaf_split");
            Ok(Some(Ext4ExtentIndex {
                logical_block: separator,
                leaf_block: new_block.0,
            }))
        }
        ExtentTree::Index(mut indexes) => {
            let pos = find_index_pos(&indexes, extent.logical_block);
            if indexes[pos].logical_block > extent.logical_block {
                indexes[pos].logical_block = extent.logical_block;
            }
            let split = insert_descend(disk, indexes[pos].leaf_block, depth - 1, extent, alloc)?;
            if let Some(new_entry) = split {
                indexes.insert(pos + 1, new_entry);
            }
            if indexes.len() <= capacity {
                write_node(disk, block, depth, &ExtentTree::Index(indexes))?;
                return Ok(None);
            }
            let right = indexes.split_off(indexes.len() / 2);
            let separator = right[0].logical_block;
            write_node(disk, block, depth, &ExtentTree::Index(indexes))?;
            let new_block = alloc.alloc_block()?;
            write_node(disk, new_block.0, depth, &ExtentTree::Index(right))?;
            debug!(old_node = block, new_node = new_block.0, separator_key = separator, "extent_index_split");
            Ok(Some(Ext4ExtentIndex {
                logical_block: separator,
                leaf_block: new_block.0,
            }))
        }
    }
}

/// Move an overfull root into a fresh child and index it from the root.
fn grow_root(
    disk: &Disk,
    root: &mut [u8; EXT4_N_BLOCKS_BYTES],
    header: &Ext4ExtentHeader,
    tree: ExtentTree,
    alloc: &mut dyn BlockAllocator,
) -> Result<()> {
    if header.depth >= MAX_DEPTH {
        return Err(KfsError::UnsupportedFeature(format!(
            "extent tree deeper than {MAX_DEPTH} levels"
        )));
    }
    let first = match &tree {
        ExtentTree::Leaf(v) => v.first().map(|e| e.logical_block),
        ExtentTree::Index(v) => v.first().map(|i| i.logical_block),
    }
    .unwrap_or(0);

    let child = alloc.alloc_block()?;
    write_node(disk, child.0, header.depth, &tree)?;

    let new_header = Ext4ExtentHeader {
        depth: header.depth + 1,
        ..*header
    };
    write_root(
        root,
        &new_header,
        &ExtentTree::Index(vec![Ext4ExtentIndex {
            logical_block: first,
            leaf_block: child.0,
        }]),
    )?;
    debug!(new_node = child.0, depth = new_header.depth, "extent_root_grow");
    Ok(())
}

// ── Delete ──────────────────────────────────────────────────────────────────

/// Remove the part of every extent overlapping `[logical_start, logical_end)`.
///
/// Partially covered extents are trimmed; emptied external nodes are freed
/// through `alloc` and a root left with a single small child absorbs it.
/// Returns the physical data ranges released; the caller frees those.
pub fn delete_range(
    disk: &Disk,
    root: &mut [u8; EXT4_N_BLOCKS_BYTES],
    logical_start: u32,
    logical_end: u32,
    alloc: &mut dyn BlockAllocator,
) -> Result<Vec<FreedRange>> {
    let (header, tree) = parse_root(root)?;
    trace!(logical_start, logical_end, tree_depth = header.depth, "extent_delete_start");

    let freed = match tree {
        ExtentTree::Leaf(extents) => {
            let (remaining, freed) = trim_extents(extents, logical_start, logical_end);
            write_root(root, &header, &ExtentTree::Leaf(remaining))?;
            freed
        }
        ExtentTree::Index(indexes) => {
            let (indexes, freed) =
                delete_in_indexes(disk, indexes, header.depth, logical_start, logical_end, alloc)?;
            if indexes.is_empty() {
                let empty = Ext4ExtentHeader {
                    depth: 0,
                    ..header
                };
                write_root(root, &empty, &ExtentTree::Leaf(Vec::new()))?;
            } else {
                write_root(root, &header, &ExtentTree::Index(indexes))?;
                maybe_shrink_root(disk, root, alloc)?;
            }
            freed
        }
    };
    trace!(freed_ranges = freed.len(), "extent_delete_done");
    Ok(freed)
}

fn delete_in_indexes(
    disk: &Disk,
    mut indexes: Vec<Ext4ExtentIndex>,
    depth: u16,
    logical_start: u32,
    logical_end: u32,
    alloc: &mut dyn BlockAllocator,
) -> Result<(Vec<Ext4ExtentIndex>, Vec<FreedRange>)> {
    let mut all_freed = Vec::new();
    let mut pos = 0;
    while pos < indexes.len() {
        let child_block = indexes[pos].leaf_block;
        let next_key = indexes.get(pos + 1).map_or(u64::from(u32::MAX) + 1, |i| u64::from(i.logical_block));
        // Children entirely outside the range are untouched.
        if u64::from(indexes[pos].logical_block) >= u64::from(logical_end)
            || next_key <= u64::from(logical_start)
        {
            pos += 1;
            continue;
        }

        let (first, freed) = match read_node(disk, child_block, depth - 1)? {
            ExtentTree::Leaf(extents) => {
                let (remaining, freed) = trim_extents(extents, logical_start, logical_end);
                let first = remaining.first().map(|e| e.logical_block);
                if first.is_some() {
                    write_node(disk, child_block, depth - 1, &ExtentTree::Leaf(remaining))?;
                }
                (first, freed)
            }
            ExtentTree::Index(children) => {
                let (children, freed) =
                    delete_in_indexes(disk, children, depth - 1, logical_start, logical_end, alloc)?;
                let first = children.first().map(|i| i.logical_block);
                if first.is_some() {
                    write_node(disk, child_block, depth - 1, &ExtentTree::Index(children))?;
                }
                (first, freed)
            }
        };
        all_freed.extend(freed);

        match first {
            None => {
                trace!(freed_block_num = child_block, reason = "empty_subtree", "extent_block_free");
                alloc.free_block(BlockNumber(child_block))?;
                indexes.remove(pos);
            }
            Some(first) => {
                indexes[pos].logical_block = first;
                pos += 1;
            }
        }
    }
    Ok((indexes, all_freed))
}

/// Pull a lone child back into the root while its entries fit.
fn maybe_shrink_root(
    disk: &Disk,
    root: &mut [u8; EXT4_N_BLOCKS_BYTES],
    alloc: &mut dyn BlockAllocator,
) -> Result<()> {
    loop {
        let (header, tree) = parse_root(root)?;
        let ExtentTree::Index(indexes) = tree else {
            return Ok(());
        };
        if indexes.len() != 1 {
            return Ok(());
        }
        let only_child = indexes[0].leaf_block;
        let child = read_node(disk, only_child, header.depth - 1)?;
        if child.len() > usize::from(EXTENT_ROOT_MAX_ENTRIES) {
            return Ok(());
        }
        let new_header = Ext4ExtentHeader {
            depth: header.depth - 1,
            ..header
        };
        write_root(root, &new_header, &child)?;
        trace!(freed_block_num = only_child, reason = "root_shrink", "extent_block_free");
        alloc.free_block(BlockNumber(only_child))?;
    }
}

/// Trim/remove extents that overlap `[start, end)`.
#[allow(clippy::cast_possible_truncation)] // pieces of a u16-length extent
fn trim_extents(extents: Vec<Ext4Extent>, start: u32, end: u32) -> (Vec<Ext4Extent>, Vec<FreedRange>) {
    let mut remaining = Vec::new();
    let mut freed = Vec::new();
    let start = u64::from(start);
    let end = u64::from(end);

    for ext in extents {
        let ext_start = u64::from(ext.logical_block);
        let ext_end = ext.logical_end();

        if ext_end <= start || ext_start >= end {
            remaining.push(ext);
            continue;
        }

        let cut_start = ext_start.max(start);
        let cut_end = ext_end.min(end);
        // Unwritten extents still own their blocks.
        freed.push(FreedRange {
            physical_start: ext.physical_start + (cut_start - ext_start),
            count: (cut_end - cut_start) as u32,
        });

        if ext_start < cut_start {
            remaining.push(Ext4Extent {
                logical_block: ext.logical_block,
                raw_len: encode_len((cut_start - ext_start) as u16, ext.is_unwritten()),
                physical_start: ext.physical_start,
            });
        }
        if cut_end < ext_end {
            remaining.push(Ext4Extent {
                logical_block: cut_end as u32,
                raw_len: encode_len((ext_end - cut_end) as u16, ext.is_unwritten()),
                physical_start: ext.physical_start + (cut_end - ext_start),
            });
        }
    }

    (remaining, freed)
}

fn encode_len(len: u16, unwritten: bool) -> u16 {
    if unwritten { len + EXT_INIT_MAX_LEN } else { len }
}

// ── Node I/O ────────────────────────────────────────────────────────────────

fn node_capacity(disk: &Disk) -> u16 {
    extent_node_capacity(disk.block_size().as_usize())
}

pub(crate) fn parse_root(
    root: &[u8; EXT4_N_BLOCKS_BYTES],
) -> Result<(Ext4ExtentHeader, ExtentTree)> {
    let (header, tree) = parse_extent_tree(root).map_err(|e| {
        error!(error = %e, "extent_invariant_violation");
        KfsError::corrupt_at(0, format!("extent root: {e}"))
    })?;
    if header.depth > MAX_DEPTH {
        return Err(KfsError::corrupt_at(0, format!("extent root depth {}", header.depth)));
    }
    Ok((header, tree))
}

fn read_node(disk: &Disk, block: u64, depth: u16) -> Result<ExtentTree> {
    if block == 0 || block >= disk.block_count() {
        return Err(KfsError::corrupt_at(block, "extent node outside the device"));
    }
    let buf = disk.read_block(BlockNumber(block))?;
    let (header, tree) = parse_extent_tree(&buf).map_err(|e| {
        error!(block, error = %e, "extent_invariant_violation");
        KfsError::corrupt_at(block, format!("extent node: {e}"))
    })?;
    if header.depth != depth {
        return Err(KfsError::corrupt_at(
            block,
            format!("extent tree depth mismatch: expected {depth}, got {}", header.depth),
        ));
    }
    Ok(tree)
}

fn write_node(disk: &Disk, block: u64, depth: u16, tree: &ExtentTree) -> Result<()> {
    let mut buf = vec![0_u8; disk.block_size().as_usize()];
    let header = Ext4ExtentHeader::new(node_capacity(disk), depth);
    write_extent_node(&mut buf, &header, tree)?;
    disk.write_blocks(BlockNumber(block), &buf)
}

fn write_root(
    root: &mut [u8; EXT4_N_BLOCKS_BYTES],
    header: &Ext4ExtentHeader,
    tree: &ExtentTree,
) -> Result<()> {
    let header = Ext4ExtentHeader {
        max_entries: EXTENT_ROOT_MAX_ENTRIES,
        ..*header
    };
    write_extent_node(root, &header, tree)?;
    Ok(())
}
