#![forbid(unsafe_code)]
//! Bounded inode cache.
//!
//! A fixed array of slots, each holding one decoded inode. A miss takes an
//! invalid slot or evicts the least recently used one, writing it back
//! first when dirty. Dirty state is only cleared by eviction write-back and
//! [`InodeCache::flush`].

use std::time::SystemTime;

use kfs_block::Disk;
use kfs_error::{KfsError, Result};
use kfs_ondisk::Ext4Inode;
use kfs_types::{
    BlockNumber, BlockSize, ByteOffset, InodeNumber, inode_index_in_group, inode_to_group,
};
use serde::Serialize;
use tracing::{debug, trace};

/// Default number of slots.
pub const DEFAULT_CAPACITY: usize = 128;

/// Where inode records live on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeLayout {
    pub inodes_count: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub block_size: BlockSize,
    /// First inode-table block of each group.
    pub tables: Vec<BlockNumber>,
}

impl InodeLayout {
    /// Byte offset of inode `ino`'s record.
    pub fn offset_of(&self, ino: InodeNumber) -> Result<ByteOffset> {
        if ino.0 == 0 || ino.0 > u64::from(self.inodes_count) {
            return Err(KfsError::InvalidArgument(format!("inode {ino} out of range")));
        }
        let group = inode_to_group(ino, self.inodes_per_group);
        let table = self
            .tables
            .get(group.0 as usize)
            .ok_or_else(|| KfsError::corrupt_at(0, format!("no inode table for group {group}")))?;
        let index = u64::from(inode_index_in_group(ino, self.inodes_per_group));
        let overflow = || KfsError::corrupt_at(table.0, format!("inode {ino} offset overflows u64"));
        let base = table.to_byte_offset(self.block_size).ok_or_else(overflow)?;
        index
            .checked_mul(u64::from(self.inode_size))
            .and_then(|rel| base.0.checked_add(rel))
            .map(ByteOffset)
            .ok_or_else(overflow)
    }

    fn read(&self, disk: &Disk, ino: InodeNumber) -> Result<Ext4Inode> {
        let mut raw = vec![0_u8; usize::from(self.inode_size)];
        disk.read_at(self.offset_of(ino)?, &mut raw)?;
        Ext4Inode::parse_from_bytes(&raw).map_err(|e| KfsError::Corruption {
            block: 0,
            detail: format!("inode {ino}: {e}"),
        })
    }

    fn write(&self, disk: &Disk, ino: InodeNumber, inode: &Ext4Inode) -> Result<()> {
        let mut raw = inode.to_bytes()?;
        raw.resize(usize::from(self.inode_size), 0);
        disk.write_at(self.offset_of(ino)?, &raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotStatus {
    Invalid,
    Valid,
    Dirty,
}

#[derive(Debug, Clone)]
struct Slot {
    ino: InodeNumber,
    inode: Ext4Inode,
    lru: u64,
    status: SlotStatus,
    last_dentry: Option<u64>,
}

/// Hit/miss/eviction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

#[derive(Debug)]
pub struct InodeCache {
    layout: InodeLayout,
    slots: Vec<Slot>,
    clock: u64,
    stats: CacheStats,
}

impl InodeCache {
    #[must_use]
    pub fn new(layout: InodeLayout, capacity: usize) -> Self {
        let empty = Slot {
            ino: InodeNumber(0),
            inode: Ext4Inode::zeroed(layout.inode_size),
            lru: 0,
            status: SlotStatus::Invalid,
            last_dentry: None,
        };
        Self {
            slots: vec![empty; capacity.max(1)],
            layout,
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    #[must_use]
    pub fn layout(&self) -> &InodeLayout {
        &self.layout
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status == SlotStatus::Dirty)
            .count()
    }

    fn position(&self, ino: InodeNumber) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.status != SlotStatus::Invalid && s.ino == ino)
    }

    fn touch(&mut self, idx: usize) {
        self.clock += 1;
        self.slots[idx].lru = self.clock;
    }

    /// A slot ready for reuse: an invalid one, else the LRU victim after
    /// writing it back.
    fn claim(&mut self, disk: &Disk) -> Result<usize> {
        if let Some(idx) = self.slots.iter().position(|s| s.status == SlotStatus::Invalid) {
            return Ok(idx);
        }
        let idx = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.lru)
            .map_or(0, |(idx, _)| idx);
        let victim = &self.slots[idx];
        if victim.status == SlotStatus::Dirty {
            self.layout.write(disk, victim.ino, &victim.inode)?;
            self.stats.writebacks += 1;
        }
        trace!(ino = victim.ino.0, dirty = victim.status == SlotStatus::Dirty, "icache evict");
        self.stats.evictions += 1;
        self.slots[idx].status = SlotStatus::Invalid;
        Ok(idx)
    }

    fn slot_for(&mut self, disk: &Disk, ino: InodeNumber) -> Result<usize> {
        if let Some(idx) = self.position(ino) {
            self.stats.hits += 1;
            trace!(ino = ino.0, "icache hit");
            self.touch(idx);
            return Ok(idx);
        }
        self.stats.misses += 1;
        trace!(ino = ino.0, "icache miss");
        let inode = self.layout.read(disk, ino)?;
        let idx = self.claim(disk)?;
        self.slots[idx] = Slot {
            ino,
            inode,
            lru: 0,
            status: SlotStatus::Valid,
            last_dentry: None,
        };
        self.touch(idx);
        Ok(idx)
    }

    /// Borrow the cached copy of `ino`, loading it on a miss.
    pub fn get(&mut self, disk: &Disk, ino: InodeNumber) -> Result<&Ext4Inode> {
        let idx = self.slot_for(disk, ino)?;
        Ok(&self.slots[idx].inode)
    }

    /// An owned copy of `ino`.
    pub fn read(&mut self, disk: &Disk, ino: InodeNumber) -> Result<Ext4Inode> {
        self.get(disk, ino).cloned()
    }

    /// Mutate `ino` in place and mark it dirty.
    pub fn update<R>(
        &mut self,
        disk: &Disk,
        ino: InodeNumber,
        f: impl FnOnce(&mut Ext4Inode) -> R,
    ) -> Result<R> {
        let idx = self.slot_for(disk, ino)?;
        let slot = &mut self.slots[idx];
        slot.status = SlotStatus::Dirty;
        Ok(f(&mut slot.inode))
    }

    /// Replace the cached copy of `ino` and mark it dirty.
    pub fn store(&mut self, disk: &Disk, ino: InodeNumber, inode: Ext4Inode) -> Result<()> {
        self.update(disk, ino, |slot| *slot = inode)
    }

    /// A fresh inode that is never read from disk: zeroed, with owner, mode
    /// and all timestamps set, dirty from the start.
    pub fn create(
        &mut self,
        disk: &Disk,
        ino: InodeNumber,
        mode: u16,
        uid: u32,
        gid: u32,
    ) -> Result<&mut Ext4Inode> {
        self.layout.offset_of(ino)?;
        let idx = match self.position(ino) {
            Some(idx) => idx,
            None => self.claim(disk)?,
        };
        let now = SystemTime::now();
        let mut inode = Ext4Inode::zeroed(self.layout.inode_size);
        inode.mode = mode;
        inode.uid = uid;
        inode.gid = gid;
        inode.set_atime(now);
        inode.set_mtime(now);
        inode.set_ctime(now);
        inode.set_crtime(now);
        self.slots[idx] = Slot {
            ino,
            inode,
            lru: 0,
            status: SlotStatus::Dirty,
            last_dentry: None,
        };
        self.touch(idx);
        debug!(ino = ino.0, mode = format_args!("{mode:o}"), "icache create");
        Ok(&mut self.slots[idx].inode)
    }

    /// Mark an already cached inode dirty. Returns false if it is not
    /// resident.
    pub fn mark_dirty(&mut self, ino: InodeNumber) -> bool {
        match self.position(ino) {
            Some(idx) => {
                self.slots[idx].status = SlotStatus::Dirty;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_dirty(&self, ino: InodeNumber) -> bool {
        self.position(ino)
            .is_some_and(|idx| self.slots[idx].status == SlotStatus::Dirty)
    }

    /// Position of the last dentry looked up in directory `ino`.
    #[must_use]
    pub fn last_dentry(&self, ino: InodeNumber) -> Option<u64> {
        self.position(ino).and_then(|idx| self.slots[idx].last_dentry)
    }

    pub fn set_last_dentry(&mut self, ino: InodeNumber, pos: Option<u64>) {
        if let Some(idx) = self.position(ino) {
            self.slots[idx].last_dentry = pos;
        }
    }

    /// Write back one inode if it is dirty.
    pub fn flush_one(&mut self, disk: &Disk, ino: InodeNumber) -> Result<bool> {
        let Some(idx) = self.position(ino) else {
            return Ok(false);
        };
        let slot = &mut self.slots[idx];
        if slot.status != SlotStatus::Dirty {
            return Ok(false);
        }
        self.layout.write(disk, slot.ino, &slot.inode)?;
        slot.status = SlotStatus::Valid;
        self.stats.writebacks += 1;
        Ok(true)
    }

    /// Write back every dirty slot, keeping them resident. Returns how many
    /// were written.
    pub fn flush(&mut self, disk: &Disk) -> Result<usize> {
        let mut written = 0;
        for slot in &mut self.slots {
            if slot.status == SlotStatus::Dirty {
                self.layout.write(disk, slot.ino, &slot.inode)?;
                slot.status = SlotStatus::Valid;
                written += 1;
            }
        }
        self.stats.writebacks += written as u64;
        if written > 0 {
            debug!(written, "icache flush");
        }
        Ok(written)
    }

    /// Drop `ino` without writing it back.
    pub fn invalidate(&mut self, ino: InodeNumber) {
        if let Some(idx) = self.position(ino) {
            self.slots[idx].status = SlotStatus::Invalid;
            self.slots[idx].last_dentry = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfs_block::MemoryByteDevice;
    use kfs_types::S_IFREG;

    /// 1K blocks, two groups of 16 inodes, tables at blocks 5 and 20.
    fn fixture(capacity: usize) -> (Disk, InodeCache) {
        let disk = Disk::new(
            Box::new(MemoryByteDevice::new(64 * 1024)),
            BlockSize::new(1024).unwrap(),
        );
        let layout = InodeLayout {
            inodes_count: 32,
            inodes_per_group: 16,
            inode_size: 256,
            block_size: BlockSize::new(1024).unwrap(),
            tables: vec![BlockNumber(5), BlockNumber(20)],
        };
        (disk, InodeCache::new(layout, capacity))
    }

    #[test]
    fn offsets_follow_group_tables() {
        let (_, cache) = fixture(4);
        let layout = cache.layout();
        assert_eq!(layout.offset_of(InodeNumber(1)).unwrap(), ByteOffset(5 * 1024));
        assert_eq!(
            layout.offset_of(InodeNumber(3)).unwrap(),
            ByteOffset(5 * 1024 + 2 * 256)
        );
        assert_eq!(layout.offset_of(InodeNumber(17)).unwrap(), ByteOffset(20 * 1024));
        assert!(layout.offset_of(InodeNumber(0)).is_err());
        assert!(layout.offset_of(InodeNumber(33)).is_err());
    }

    #[test]
    fn table_past_u64_is_corruption() {
        let layout = InodeLayout {
            inodes_count: 16,
            inodes_per_group: 16,
            inode_size: 256,
            block_size: BlockSize::new(4096).unwrap(),
            tables: vec![BlockNumber(u64::MAX / 1024)],
        };
        assert!(matches!(
            layout.offset_of(InodeNumber(2)),
            Err(KfsError::Corruption { .. })
        ));
        assert!(matches!(
            layout.offset_of(InodeNumber(0)),
            Err(KfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn second_get_is_a_hit() {
        let (disk, mut cache) = fixture(4);
        cache.get(&disk, InodeNumber(2)).unwrap();
        cache.get(&disk, InodeNumber(2)).unwrap();
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn create_is_dirty_and_not_read_from_disk() {
        let (disk, mut cache) = fixture(4);
        disk.write_at(ByteOffset(5 * 1024 + 4 * 256), &[0xFF; 256]).unwrap();
        let inode = cache
            .create(&disk, InodeNumber(5), S_IFREG | 0o644, 1000, 100)
            .unwrap();
        assert_eq!(inode.mode, S_IFREG | 0o644);
        assert_eq!(inode.size, 0);
        assert!(inode.mtime > 0);
        assert!(cache.is_dirty(InodeNumber(5)));
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn eviction_writes_back_dirty_inode() {
        let (disk, mut cache) = fixture(2);
        cache
            .update(&disk, InodeNumber(3), |i| {
                i.mode = S_IFREG | 0o600;
                i.size = 4242;
            })
            .unwrap();
        cache.get(&disk, InodeNumber(4)).unwrap();
        cache.get(&disk, InodeNumber(5)).unwrap();
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().writebacks, 1);
        assert!(!cache.is_dirty(InodeNumber(3)));

        let back = cache.read(&disk, InodeNumber(3)).unwrap();
        assert_eq!(back.size, 4242);
        assert_eq!(back.mode, S_IFREG | 0o600);
    }

    #[test]
    fn victim_is_least_recently_used() {
        let (disk, mut cache) = fixture(2);
        cache.get(&disk, InodeNumber(3)).unwrap();
        cache.get(&disk, InodeNumber(4)).unwrap();
        cache.get(&disk, InodeNumber(3)).unwrap();
        cache.get(&disk, InodeNumber(5)).unwrap();
        let misses = cache.stats().misses;
        cache.get(&disk, InodeNumber(3)).unwrap();
        assert_eq!(cache.stats().misses, misses, "inode 3 should still be resident");
        cache.get(&disk, InodeNumber(4)).unwrap();
        assert_eq!(cache.stats().misses, misses + 1);
    }

    #[test]
    fn flush_clears_dirty_and_persists() {
        let (disk, mut cache) = fixture(8);
        for n in 1..=6 {
            cache
                .update(&disk, InodeNumber(n), |i| i.links_count = u16::try_from(n).unwrap())
                .unwrap();
        }
        assert_eq!(cache.dirty_count(), 6);
        assert_eq!(cache.flush(&disk).unwrap(), 6);
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(cache.flush(&disk).unwrap(), 0);

        let (_, mut fresh) = fixture(8);
        assert_eq!(fresh.read(&disk, InodeNumber(6)).unwrap().links_count, 6);
    }

    #[test]
    fn invalidate_drops_without_writeback() {
        let (disk, mut cache) = fixture(4);
        cache.update(&disk, InodeNumber(7), |i| i.size = 99).unwrap();
        cache.set_last_dentry(InodeNumber(7), Some(24));
        assert_eq!(cache.last_dentry(InodeNumber(7)), Some(24));
        cache.invalidate(InodeNumber(7));
        assert_eq!(cache.last_dentry(InodeNumber(7)), None);
        assert_eq!(cache.read(&disk, InodeNumber(7)).unwrap().size, 0);
        assert!(!cache.mark_dirty(InodeNumber(8)));
    }

    #[test]
    fn more_dirty_inodes_than_slots_lose_nothing() {
        let (disk, mut cache) = fixture(3);
        for n in 1..=32_u64 {
            cache.update(&disk, InodeNumber(n), |i| i.size = n * 10).unwrap();
        }
        cache.flush(&disk).unwrap();
        let (_, mut fresh) = fixture(3);
        for n in 1..=32_u64 {
            assert_eq!(fresh.read(&disk, InodeNumber(n)).unwrap().size, n * 10);
        }
    }
}
