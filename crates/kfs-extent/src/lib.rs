#![forbid(unsafe_code)]
//! Extent mapping: logical block to physical block resolution.
//!
//! Resolves file logical blocks to physical block addresses through the
//! extent B+tree ([`tree`]) or, for inodes without `EXTENTS_FL`, the legacy
//! direct/indirect block map ([`legacy`]). Also maps new runs into the tree
//! and releases mappings on truncate.

pub mod legacy;
pub mod tree;

use kfs_block::Disk;
use kfs_error::{KfsError, Result};
use kfs_ondisk::{
    EXTENT_ROOT_MAX_ENTRIES, Ext4Extent, Ext4ExtentHeader, Ext4Inode, ExtentTree,
    write_extent_node,
};
use kfs_types::{BlockNumber, EXT_INIT_MAX_LEN, EXT4_EXTENTS_FL};
use tracing::trace;

pub use tree::SearchResult;

/// Source of blocks for tree nodes and indirect blocks.
///
/// The implementor decides placement (typically near the owning inode).
pub trait BlockAllocator {
    /// Allocate a single block for tree use (index or leaf node).
    fn alloc_block(&mut self) -> Result<BlockNumber>;

    /// Free a previously allocated tree block.
    fn free_block(&mut self, block: BlockNumber) -> Result<()>;
}

/// A range of physical data blocks released by a truncate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreedRange {
    pub physical_start: u64,
    pub count: u32,
}

/// Where a logical block lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub physical: BlockNumber,
    /// Blocks from the requested one (inclusive) to the end of its run.
    pub run_length: u32,
    /// Preallocated but never written; reads see zeroes.
    pub unwritten: bool,
}

/// Translate `lblock` of `inode` to a physical block. `None` is a hole.
pub fn resolve(disk: &Disk, inode: &Ext4Inode, lblock: u32) -> Result<Option<Mapping>> {
    if inode.uses_extents() {
        return match tree::search(disk, &inode.block, lblock)? {
            SearchResult::Found {
                extent,
                offset_in_extent,
            } => Ok(Some(Mapping {
                physical: BlockNumber(extent.physical_start + u64::from(offset_in_extent)),
                run_length: u32::from(extent.actual_len()) - offset_in_extent,
                unwritten: extent.is_unwritten(),
            })),
            SearchResult::Hole { .. } => Ok(None),
        };
    }
    let physical = legacy::resolve(disk, &inode.block, u64::from(lblock))?;
    Ok(physical.map(|p| Mapping {
        physical: BlockNumber(p),
        run_length: 1,
        unwritten: false,
    }))
}

/// Turn the inode's block area into an empty depth-0 extent root.
pub fn init_extent_root(inode: &mut Ext4Inode) -> Result<()> {
    inode.block = [0; kfs_types::EXT4_N_BLOCKS_BYTES];
    inode.flags |= EXT4_EXTENTS_FL;
    let header = Ext4ExtentHeader::new(EXTENT_ROOT_MAX_ENTRIES, 0);
    write_extent_node(&mut inode.block, &header, &ExtentTree::Leaf(Vec::new()))?;
    Ok(())
}

/// Initialize the root with a single extent mapping logical 0.
pub fn init_pblock(inode: &mut Ext4Inode, physical: BlockNumber, len: u16) -> Result<()> {
    if len == 0 || len > EXT_INIT_MAX_LEN {
        return Err(KfsError::InvalidArgument(format!("extent length {len}")));
    }
    inode.block = [0; kfs_types::EXT4_N_BLOCKS_BYTES];
    inode.flags |= EXT4_EXTENTS_FL;
    let header = Ext4ExtentHeader::new(EXTENT_ROOT_MAX_ENTRIES, 0);
    let tree = ExtentTree::Leaf(vec![Ext4Extent {
        logical_block: 0,
        raw_len: len,
        physical_start: physical.0,
    }]);
    write_extent_node(&mut inode.block, &header, &tree)?;
    Ok(())
}

/// Map `len` logical blocks from `lblock` onto physical blocks from
/// `physical`, merging with an adjacent extent where possible.
pub fn map_run(
    disk: &Disk,
    inode: &mut Ext4Inode,
    lblock: u32,
    physical: BlockNumber,
    len: u16,
    alloc: &mut dyn BlockAllocator,
) -> Result<()> {
    if !inode.uses_extents() {
        return Err(KfsError::UnsupportedFeature(
            "allocating blocks for block-mapped (non-extent) inodes".into(),
        ));
    }
    if len == 0 || len > EXT_INIT_MAX_LEN {
        return Err(KfsError::InvalidArgument(format!("extent length {len}")));
    }
    tree::insert(
        disk,
        &mut inode.block,
        Ext4Extent {
            logical_block: lblock,
            raw_len: len,
            physical_start: physical.0,
        },
        alloc,
    )
}

/// Drop every mapping at or past logical block `keep`.
pub fn truncate(
    disk: &Disk,
    inode: &mut Ext4Inode,
    keep: u32,
    alloc: &mut dyn BlockAllocator,
) -> Result<Vec<FreedRange>> {
    trace!(keep, extents = inode.uses_extents(), "truncate_mappings");
    if inode.uses_extents() {
        tree::delete_range(disk, &mut inode.block, keep, u32::MAX, alloc)
    } else {
        legacy::truncate(disk, &mut inode.block, u64::from(keep), alloc)
    }
}

/// Last mapped block as `(logical, physical)`, the natural goal for the
/// next allocation.
pub fn last_mapped(disk: &Disk, inode: &Ext4Inode) -> Result<Option<(u32, BlockNumber)>> {
    let mut last = None;
    if inode.uses_extents() {
        tree::walk(disk, &inode.block, &mut |e: &Ext4Extent| {
            let len = u32::from(e.actual_len());
            if len > 0 {
                last = Some((
                    e.logical_block + len - 1,
                    BlockNumber(e.physical_start + u64::from(len) - 1),
                ));
            }
            Ok(())
        })?;
    } else {
        legacy::walk(disk, &inode.block, &mut |l, p| {
            #[allow(clippy::cast_possible_truncation)] // legacy maps stay below 2^32
            {
                last = Some((l as u32, BlockNumber(p)));
            }
            Ok(())
        })?;
    }
    Ok(last)
}

/// Every mapped data extent in logical order, as `(logical, physical, len)`.
#[cfg(test)]
fn collect_runs(disk: &Disk, inode: &Ext4Inode) -> Result<Vec<(u32, u64, u32)>> {
    let mut runs: Vec<(u32, u64, u32)> = Vec::new();
    if inode.uses_extents() {
        tree::walk(disk, &inode.block, &mut |e: &Ext4Extent| {
            runs.push((e.logical_block, e.physical_start, u32::from(e.actual_len())));
            Ok(())
        })?;
    } else {
        legacy::walk(disk, &inode.block, &mut |l, p| {
            #[allow(clippy::cast_possible_truncation)]
            let l = l as u32;
            if let Some(run) = runs.last_mut()
                && run.0 + run.2 == l
                && run.1 + u64::from(run.2) == p
            {
                run.2 += 1;
            } else {
                runs.push((l, p, 1));
            }
            Ok(())
        })?;
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfs_block::MemoryByteDevice;
    use kfs_types::{BlockSize, write_le_u32};
    use proptest::prelude::*;
    use std::collections::{BTreeMap, BTreeSet};

    /// Hands out blocks from a counter and records frees.
    struct CountingAlloc {
        next: u64,
        live: BTreeSet<u64>,
    }

    impl CountingAlloc {
        fn new(first: u64) -> Self {
            Self {
                next: first,
                live: BTreeSet::new(),
            }
        }
    }

    impl BlockAllocator for CountingAlloc {
        fn alloc_block(&mut self) -> Result<BlockNumber> {
            let b = self.next;
            self.next += 1;
            self.live.insert(b);
            Ok(BlockNumber(b))
        }

        fn free_block(&mut self, block: BlockNumber) -> Result<()> {
            assert!(self.live.remove(&block.0), "freeing unknown tree block");
            Ok(())
        }
    }

    fn mem_disk(blocks: usize) -> Disk {
        Disk::new(
            Box::new(MemoryByteDevice::new(blocks * 1024)),
            BlockSize::new(1024).unwrap(),
        )
    }

    fn extent_inode() -> Ext4Inode {
        let mut inode = Ext4Inode::zeroed(256);
        init_extent_root(&mut inode).unwrap();
        inode
    }

    #[test]
    fn init_pblock_resolves_block_zero() {
        let disk = mem_disk(16);
        let mut inode = Ext4Inode::zeroed(256);
        init_pblock(&mut inode, BlockNumber(500), 3).unwrap();
        assert!(inode.uses_extents());
        let m = resolve(&disk, &inode, 0).unwrap().unwrap();
        assert_eq!(m.physical, BlockNumber(500));
        assert_eq!(m.run_length, 3);
        let m = resolve(&disk, &inode, 2).unwrap().unwrap();
        assert_eq!(m.physical, BlockNumber(502));
        assert_eq!(m.run_length, 1);
        assert_eq!(resolve(&disk, &inode, 3).unwrap(), None);
    }

    #[test]
    fn adjacent_runs_merge() {
        let disk = mem_disk(16);
        let mut inode = extent_inode();
        let mut alloc = CountingAlloc::new(10);
        map_run(&disk, &mut inode, 0, BlockNumber(100), 1, &mut alloc).unwrap();
        map_run(&disk, &mut inode, 1, BlockNumber(101), 2, &mut alloc).unwrap();
        let runs = collect_runs(&disk, &inode).unwrap();
        assert_eq!(runs, vec![(0, 100, 3)]);
        // Physically discontiguous: new extent.
        map_run(&disk, &mut inode, 3, BlockNumber(200), 1, &mut alloc).unwrap();
        assert_eq!(collect_runs(&disk, &inode).unwrap().len(), 2);
        assert_eq!(last_mapped(&disk, &inode).unwrap(), Some((3, BlockNumber(200))));
    }

    #[test]
    fn overlapping_run_rejected() {
        let disk = mem_disk(16);
        let mut inode = extent_inode();
        let mut alloc = CountingAlloc::new(10);
        map_run(&disk, &mut inode, 4, BlockNumber(100), 4, &mut alloc).unwrap();
        assert!(map_run(&disk, &mut inode, 6, BlockNumber(300), 1, &mut alloc).is_err());
        assert!(map_run(&disk, &mut inode, 2, BlockNumber(300), 3, &mut alloc).is_err());
    }

    #[test]
    fn fifth_extent_grows_tree() {
        let disk = mem_disk(64);
        let mut inode = extent_inode();
        let mut alloc = CountingAlloc::new(40);
        for i in 0..5_u32 {
            map_run(&disk, &mut inode, i * 2, BlockNumber(100 + u64::from(i) * 10), 1, &mut alloc)
                .unwrap();
        }
        let (header, _) = tree::parse_root(&inode.block).unwrap();
        assert_eq!(header.depth, 1);
        assert_eq!(alloc.live.len(), 1);
        for i in 0..5_u32 {
            let m = resolve(&disk, &inode, i * 2).unwrap().unwrap();
            assert_eq!(m.physical.0, 100 + u64::from(i) * 10);
            assert_eq!(resolve(&disk, &inode, i * 2 + 1).unwrap(), None);
        }
        assert_eq!(tree::node_blocks(&disk, &inode.block).unwrap(), vec![40]);
    }

    #[test]
    fn truncate_frees_tail_and_collapses_tree() {
        let disk = mem_disk(64);
        let mut inode = extent_inode();
        let mut alloc = CountingAlloc::new(40);
        for i in 0..6_u32 {
            map_run(&disk, &mut inode, i * 2, BlockNumber(100 + u64::from(i) * 10), 2, &mut alloc)
                .unwrap();
        }
        let freed = truncate(&disk, &mut inode, 3, &mut alloc).unwrap();
        let total: u32 = freed.iter().map(|f| f.count).sum();
        assert_eq!(total, 12 - 3);
        assert_eq!(freed[0], FreedRange { physical_start: 111, count: 1 });
        // Two extents remain, so the leaf moved back into the root.
        let (header, tree) = tree::parse_root(&inode.block).unwrap();
        assert_eq!(header.depth, 0);
        assert_eq!(tree.len(), 2);
        assert!(alloc.live.is_empty());

        truncate(&disk, &mut inode, 0, &mut alloc).unwrap();
        assert!(collect_runs(&disk, &inode).unwrap().is_empty());
    }

    #[test]
    fn bad_magic_is_corruption() {
        let disk = mem_disk(4);
        let mut inode = extent_inode();
        inode.block[0] = 0;
        assert!(matches!(
            resolve(&disk, &inode, 0),
            Err(KfsError::Corruption { .. })
        ));
    }

    /// Five single-block extents: a depth-1 tree whose leaf is block 40.
    fn depth_one_tree(disk: &Disk) -> Ext4Inode {
        let mut inode = extent_inode();
        let mut alloc = CountingAlloc::new(40);
        for i in 0..5_u32 {
            map_run(disk, &mut inode, i * 2, BlockNumber(100 + u64::from(i) * 10), 1, &mut alloc)
                .unwrap();
        }
        inode
    }

    #[test]
    fn root_deeper_than_max_is_corruption() {
        let disk = mem_disk(64);
        let mut inode = depth_one_tree(&disk);
        inode.block[6..8].copy_from_slice(&(tree::MAX_DEPTH + 1).to_le_bytes());
        assert!(matches!(
            resolve(&disk, &inode, 0),
            Err(KfsError::Corruption { block: 0, .. })
        ));
    }

    #[test]
    fn child_depth_mismatch_is_corruption() {
        let disk = mem_disk(64);
        let inode = depth_one_tree(&disk);
        let mut leaf = disk.read_block(BlockNumber(40)).unwrap();
        // A leaf claiming to be an index node one level up.
        leaf[6..8].copy_from_slice(&1_u16.to_le_bytes());
        disk.write_blocks(BlockNumber(40), &leaf).unwrap();
        let err = resolve(&disk, &inode, 2).unwrap_err();
        assert!(matches!(err, KfsError::Corruption { block: 40, .. }), "{err}");
    }

    #[test]
    fn child_node_magic_is_checked() {
        let disk = mem_disk(64);
        let inode = depth_one_tree(&disk);
        disk.write_blocks(BlockNumber(40), &[0_u8; 1024]).unwrap();
        assert!(matches!(
            resolve(&disk, &inode, 4),
            Err(KfsError::Corruption { block: 40, .. })
        ));
    }

    #[test]
    fn index_pointing_outside_device_is_corruption() {
        let disk = mem_disk(64);
        let mut inode = depth_one_tree(&disk);
        // First index entry's leaf pointer (ei_leaf_lo) past the device end.
        write_le_u32(&mut inode.block, 12 + 4, 10_000).unwrap();
        assert!(matches!(
            resolve(&disk, &inode, 0),
            Err(KfsError::Corruption { block: 10_000, .. })
        ));
    }

    #[test]
    fn legacy_map_resolves_through_indirect_blocks() {
        let disk = mem_disk(64);
        let mut inode = Ext4Inode::zeroed(256);
        write_le_u32(&mut inode.block, 0, 30).unwrap();
        // Single indirect at block 20 holding logical 12 -> 31, 13 -> hole.
        write_le_u32(&mut inode.block, 12 * 4, 20).unwrap();
        let mut ind = vec![0_u8; 1024];
        write_le_u32(&mut ind, 0, 31).unwrap();
        write_le_u32(&mut ind, 8, 32).unwrap();
        disk.write_blocks(BlockNumber(20), &ind).unwrap();

        assert_eq!(resolve(&disk, &inode, 0).unwrap().unwrap().physical, BlockNumber(30));
        assert_eq!(resolve(&disk, &inode, 5).unwrap(), None);
        assert_eq!(resolve(&disk, &inode, 12).unwrap().unwrap().physical, BlockNumber(31));
        assert_eq!(resolve(&disk, &inode, 13).unwrap(), None);
        assert_eq!(resolve(&disk, &inode, 14).unwrap().unwrap().run_length, 1);

        let mut alloc = CountingAlloc::new(0);
        alloc.live.insert(20);
        assert!(matches!(
            map_run(&disk, &mut inode, 40, BlockNumber(50), 1, &mut alloc),
            Err(KfsError::UnsupportedFeature(_))
        ));

        let freed = truncate(&disk, &mut inode, 13, &mut alloc).unwrap();
        assert_eq!(freed, vec![FreedRange { physical_start: 32, count: 1 }]);
        assert_eq!(resolve(&disk, &inode, 12).unwrap().unwrap().physical, BlockNumber(31));
        truncate(&disk, &mut inode, 0, &mut alloc).unwrap();
        assert!(alloc.live.is_empty());
        assert!(collect_runs(&disk, &inode).unwrap().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Mapping single blocks in any order resolves exactly as mapped.
        #[test]
        fn random_single_block_maps_resolve(
            lblocks in proptest::collection::btree_set(0_u32..2_000, 1..300),
            order_seed in any::<u64>(),
        ) {
            let disk = mem_disk(4096);
            let mut inode = extent_inode();
            let mut alloc = CountingAlloc::new(3000);
            let mut expected = BTreeMap::new();
            let mut order: Vec<u32> = lblocks.into_iter().collect();
            let len = order.len();
            order.rotate_left((order_seed as usize) % len);
            for l in order {
                let p = 5000 + u64::from(l) * 3;
                map_run(&disk, &mut inode, l, BlockNumber(p), 1, &mut alloc).unwrap();
                expected.insert(l, p);
            }
            for (l, p) in &expected {
                let m = resolve(&disk, &inode, *l).unwrap().unwrap();
                prop_assert_eq!(m.physical.0, *p);
            }
            let mapped: u32 = collect_runs(&disk, &inode).unwrap().iter().map(|r| r.2).sum();
            prop_assert_eq!(mapped as usize, expected.len());
        }
    }
}
