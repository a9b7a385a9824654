#![forbid(unsafe_code)]
//! Directory entry manager.
//!
//! Directory data is walked one logical block at a time through a
//! [`StagingBlock`]: a single block-sized buffer that remembers which
//! directory block it holds and whether it has unwritten edits. Positions
//! are byte offsets into the directory (`lblock * block_size + offset`),
//! which doubles as the readdir cookie.
//!
//! Records are never compacted. Deleting merges the record into its
//! predecessor within the block; creating splits slack off an existing
//! record. The sum of `rec_len` over a block (tail included) always equals
//! the block size.

use kfs_block::Disk;
use kfs_error::{KfsError, Result};
use kfs_extent::BlockAllocator;
use kfs_ondisk::{
    Ext4DirEntry, Ext4FileType, Ext4Inode, dir_rec_len, init_empty_dir_block, is_dir_tail,
    read_dir_record, set_dir_inode, set_dir_rec_len, write_dir_record,
};
use kfs_types::{BlockNumber, BlockSize, EXT4_INDEX_FL, EXT4_NAME_LEN, InodeNumber, u64_to_u32};
use tracing::trace;

// ── Staging buffer ──────────────────────────────────────────────────────────

/// The currently loaded directory data block.
#[derive(Debug)]
pub struct StagingBlock {
    owner: Option<(InodeNumber, u32)>,
    pblock: BlockNumber,
    buf: Vec<u8>,
    dirty: bool,
}

impl StagingBlock {
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        Self {
            owner: None,
            pblock: BlockNumber(0),
            buf: vec![0; block_size.as_usize()],
            dirty: false,
        }
    }

    /// `(directory, logical block)` currently held, if any.
    #[must_use]
    pub fn owner(&self) -> Option<(InodeNumber, u32)> {
        self.owner
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the buffer back if it holds unwritten edits.
    pub fn flush(&mut self, disk: &Disk) -> Result<()> {
        if self.dirty {
            disk.write_blocks(self.pblock, &self.buf)?;
            self.dirty = false;
            trace!(block = self.pblock.0, "staging block written");
        }
        Ok(())
    }

    /// Forget the buffer without writing it if it belongs to `ino`. Used
    /// before the directory's blocks are released.
    pub fn discard(&mut self, ino: InodeNumber) {
        if self.owner.is_some_and(|(owner, _)| owner == ino) {
            self.owner = None;
            self.dirty = false;
        }
    }

    fn load(&mut self, disk: &Disk, ino: InodeNumber, inode: &Ext4Inode, lblock: u32) -> Result<()> {
        if self.owner == Some((ino, lblock)) {
            trace!(ino = ino.0, lblock, "staging hit");
            return Ok(());
        }
        self.flush(disk)?;
        let mapping = kfs_extent::resolve(disk, inode, lblock)?
            .filter(|m| !m.unwritten)
            .ok_or_else(|| {
                KfsError::corrupt_at(0, format!("directory {ino} has no data at block {lblock}"))
            })?;
        disk.read_blocks(mapping.physical, &mut self.buf)?;
        self.owner = Some((ino, lblock));
        self.pblock = mapping.physical;
        self.dirty = false;
        trace!(ino = ino.0, lblock, block = mapping.physical.0, "staging load");
        Ok(())
    }
}

// ── Entries ─────────────────────────────────────────────────────────────────

/// A record and where it sits in the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DentryRef {
    pub pos: u64,
    pub entry: Ext4DirEntry,
}

impl DentryRef {
    /// Position of the record that follows this one.
    #[must_use]
    pub fn next_pos(&self) -> u64 {
        self.pos + u64::from(self.entry.rec_len)
    }
}

/// Result of [`Directory::find`]: the match and the record just before it
/// in the same block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub found: DentryRef,
    pub prev: Option<DentryRef>,
}

/// Whether `entry` has enough slack to host a record named `name`.
#[must_use]
pub fn has_space(entry: &Ext4DirEntry, name: &[u8]) -> bool {
    entry.slack() >= usize::from(dir_rec_len(name.len()))
}

/// Reject names that cannot be stored as a single path component.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(KfsError::InvalidArgument("empty name".into()));
    }
    if name.len() > EXT4_NAME_LEN {
        return Err(KfsError::NameTooLong);
    }
    if name.iter().any(|&b| b == b'/' || b == 0) {
        return Err(KfsError::InvalidArgument(format!(
            "name {:?} contains '/' or NUL",
            String::from_utf8_lossy(name)
        )));
    }
    Ok(())
}

// ── Directory handle ────────────────────────────────────────────────────────

/// Entry-level view of one directory inode.
///
/// Mutations edit the staging buffer in place and may change the inode
/// (size growth, htree flag); callers persist the inode afterwards when
/// [`Directory::inode_changed`] reports it.
pub struct Directory<'a> {
    disk: &'a Disk,
    ino: InodeNumber,
    inode: &'a mut Ext4Inode,
    staging: &'a mut StagingBlock,
    inode_changed: bool,
}

impl<'a> Directory<'a> {
    pub fn new(
        disk: &'a Disk,
        ino: InodeNumber,
        inode: &'a mut Ext4Inode,
        staging: &'a mut StagingBlock,
    ) -> Result<Self> {
        if !inode.is_dir() {
            return Err(KfsError::NotDirectory);
        }
        Ok(Self {
            disk,
            ino,
            inode,
            staging,
            inode_changed: false,
        })
    }

    #[must_use]
    pub fn inode_changed(&self) -> bool {
        self.inode_changed
    }

    fn block_size(&self) -> u64 {
        u64::from(self.disk.block_size().get())
    }

    fn load(&mut self, pos: u64) -> Result<usize> {
        let bs = self.block_size();
        let lblock = u64_to_u32(pos / bs, "directory block")?;
        self.staging.load(self.disk, self.ino, self.inode, lblock)?;
        #[allow(clippy::cast_possible_truncation)] // below block size
        Ok((pos % bs) as usize)
    }

    fn corrupt(&self, detail: impl std::fmt::Display) -> KfsError {
        KfsError::corrupt_at(self.staging.pblock.0, format!("directory {}: {detail}", self.ino))
    }

    fn touch(&mut self) {
        self.staging.dirty = true;
        if self.inode.has_htree_index() {
            self.inode.flags &= !EXT4_INDEX_FL;
            self.inode_changed = true;
        }
    }

    /// The record at `pos`, skipping tail sentinels. `None` at the end of
    /// the directory.
    ///
    /// A block-aligned `pos` at or past `i_size` whose block is nonetheless
    /// mapped grows `i_size` to cover it.
    pub fn next(&mut self, mut pos: u64) -> Result<Option<DentryRef>> {
        let bs = self.block_size();
        loop {
            if pos >= self.inode.size {
                if pos % bs != 0 {
                    return Ok(None);
                }
                let lblock = u64_to_u32(pos / bs, "directory block")?;
                if kfs_extent::resolve(self.disk, self.inode, lblock)?.is_none() {
                    return Ok(None);
                }
                self.inode.size = pos + bs;
                self.inode_changed = true;
                trace!(ino = self.ino.0, size = self.inode.size, "directory size extended");
            }
            let off = self.load(pos)?;
            if is_dir_tail(&self.staging.buf, off) {
                pos = (pos / bs + 1) * bs;
                continue;
            }
            let entry = read_dir_record(&self.staging.buf, off)
                .map_err(|e| self.corrupt(format_args!("offset {off}: {e}")))?;
            return Ok(Some(DentryRef { pos, entry }));
        }
    }

    /// Locate a live entry by name.
    pub fn find(&mut self, name: &[u8]) -> Result<Option<Lookup>> {
        if name.len() > EXT4_NAME_LEN {
            return Err(KfsError::NameTooLong);
        }
        let bs = self.block_size();
        let mut pos = 0;
        let mut prev: Option<DentryRef> = None;
        while let Some(d) = self.next(pos)? {
            if d.pos % bs == 0 {
                prev = None;
            }
            pos = d.next_pos();
            if d.entry.inode != 0 && d.entry.name_matches(name) {
                trace!(ino = self.ino.0, name = %d.entry.name_str(), pos = d.pos, "dentry found");
                return Ok(Some(Lookup { found: d, prev }));
            }
            prev = Some(d);
        }
        Ok(None)
    }

    /// The last live entry of the directory.
    pub fn last(&mut self) -> Result<Option<DentryRef>> {
        let mut pos = 0;
        let mut last = None;
        while let Some(d) = self.next(pos)? {
            pos = d.next_pos();
            if d.entry.inode != 0 {
                last = Some(d);
            }
        }
        Ok(last)
    }

    /// Every live entry in directory order.
    pub fn entries(&mut self) -> Result<Vec<DentryRef>> {
        let mut pos = 0;
        let mut out = Vec::new();
        while let Some(d) = self.next(pos)? {
            pos = d.next_pos();
            if d.entry.inode != 0 {
                out.push(d);
            }
        }
        Ok(out)
    }

    /// Whether the directory holds nothing besides `.` and `..`.
    pub fn is_empty(&mut self) -> Result<bool> {
        let mut pos = 0;
        while let Some(d) = self.next(pos)? {
            pos = d.next_pos();
            if d.entry.inode != 0 && !d.entry.is_dot() && !d.entry.is_dotdot() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Place a new record in the space of `after`: reuse it outright if it
    /// is unused, otherwise shrink it to its real size and take the rest.
    pub fn create(
        &mut self,
        after: &DentryRef,
        name: &[u8],
        ino: InodeNumber,
        file_type: Ext4FileType,
    ) -> Result<DentryRef> {
        validate_name(name)?;
        let target = u64_to_u32(ino.0, "inode number")?;
        let off = self.load(after.pos)?;
        let current = read_dir_record(&self.staging.buf, off)
            .map_err(|e| self.corrupt(format_args!("offset {off}: {e}")))?;
        if !has_space(&current, name) {
            return Err(KfsError::DirectoryFull(self.ino.0));
        }

        let (pos, new_off, rec_len) = if current.inode == 0 {
            (after.pos, off, current.rec_len)
        } else {
            let actual = current.actual_size();
            #[allow(clippy::cast_possible_truncation)] // actual < rec_len
            set_dir_rec_len(&mut self.staging.buf, off, actual as u16)?;
            #[allow(clippy::cast_possible_truncation)]
            let rest = current.rec_len - actual as u16;
            (after.pos + actual as u64, off + actual, rest)
        };
        write_dir_record(&mut self.staging.buf, new_off, target, rec_len, file_type, name)?;
        self.touch();
        trace!(dir = self.ino.0, ino = ino.0, name = %String::from_utf8_lossy(name), pos, "dentry created");

        let entry = read_dir_record(&self.staging.buf, new_off)?;
        Ok(DentryRef { pos, entry })
    }

    /// Insert into the first record with room. Fails with
    /// [`KfsError::DirectoryFull`] when no existing block can take it.
    pub fn add(&mut self, name: &[u8], ino: InodeNumber, file_type: Ext4FileType) -> Result<DentryRef> {
        validate_name(name)?;
        let mut pos = 0;
        while let Some(d) = self.next(pos)? {
            pos = d.next_pos();
            if has_space(&d.entry, name) {
                return self.create(&d, name, ino, file_type);
            }
        }
        Err(KfsError::DirectoryFull(self.ino.0))
    }

    /// [`Directory::add`], appending a fresh block when every block is full.
    pub fn add_or_grow(
        &mut self,
        name: &[u8],
        ino: InodeNumber,
        file_type: Ext4FileType,
        alloc: &mut dyn BlockAllocator,
    ) -> Result<DentryRef> {
        match self.add(name, ino, file_type) {
            Err(KfsError::DirectoryFull(_)) => {
                let fresh = self.grow(alloc)?;
                self.create(&fresh, name, ino, file_type)
            }
            other => other,
        }
    }

    /// Append one block holding a single unused record plus the tail.
    pub fn grow(&mut self, alloc: &mut dyn BlockAllocator) -> Result<DentryRef> {
        let bs = self.block_size();
        let pos = self.inode.size.div_ceil(bs) * bs;
        let lblock = u64_to_u32(pos / bs, "directory block")?;
        let pblock = alloc.alloc_block()?;
        if let Err(err) = kfs_extent::map_run(self.disk, self.inode, lblock, pblock, 1, alloc) {
            alloc.free_block(pblock)?;
            return Err(err);
        }

        self.staging.flush(self.disk)?;
        init_empty_dir_block(&mut self.staging.buf)?;
        self.staging.owner = Some((self.ino, lblock));
        self.staging.pblock = pblock;
        self.staging.dirty = true;
        self.inode.size = pos + bs;
        self.inode_changed = true;
        trace!(dir = self.ino.0, lblock, block = pblock.0, "directory grown");

        let entry = read_dir_record(&self.staging.buf, 0)?;
        Ok(DentryRef { pos, entry })
    }

    /// Remove a live entry by merging it into its predecessor, or by
    /// zeroing its inode when it opens the block. Returns the removed
    /// record.
    pub fn delete(&mut self, name: &[u8]) -> Result<Ext4DirEntry> {
        if name == b"." || name == b".." {
            return Err(KfsError::InvalidArgument("cannot remove . or ..".into()));
        }
        let Lookup { found, prev } = self
            .find(name)?
            .ok_or_else(|| KfsError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
        let off = self.load(found.pos)?;
        if let Some(prev) = prev {
            let prev_off = self.load(prev.pos)?;
            let merged = prev.entry.rec_len.checked_add(found.entry.rec_len).ok_or_else(|| {
                self.corrupt(format_args!("merged rec_len overflow at {prev_off}"))
            })?;
            set_dir_rec_len(&mut self.staging.buf, prev_off, merged)?;
        }
        set_dir_inode(&mut self.staging.buf, off, 0)?;
        self.touch();
        trace!(dir = self.ino.0, name = %found.entry.name_str(), pos = found.pos, "dentry deleted");
        Ok(found.entry)
    }

    /// Point an existing entry at a different inode.
    pub fn retarget(&mut self, name: &[u8], ino: InodeNumber, file_type: Ext4FileType) -> Result<()> {
        let Lookup { found, .. } = self
            .find(name)?
            .ok_or_else(|| KfsError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
        let off = self.load(found.pos)?;
        set_dir_inode(&mut self.staging.buf, off, u64_to_u32(ino.0, "inode number")?)?;
        self.staging.buf[off + 7] = file_type as u8;
        self.touch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfs_block::MemoryByteDevice;
    use kfs_ondisk::init_dir_block;
    use kfs_types::{EXT4_DIR_TAIL_SIZE, S_IFDIR, read_le_u16};
    use proptest::prelude::*;

    const BS: usize = 1024;
    const DIR_BLOCK: u64 = 20;

    struct BumpAlloc(u64);

    impl BlockAllocator for BumpAlloc {
        fn alloc_block(&mut self) -> Result<BlockNumber> {
            self.0 += 1;
            Ok(BlockNumber(self.0))
        }

        fn free_block(&mut self, _block: BlockNumber) -> Result<()> {
            Ok(())
        }
    }

    fn setup() -> (Disk, Ext4Inode, StagingBlock) {
        let disk = Disk::new(
            Box::new(MemoryByteDevice::new(128 * BS)),
            BlockSize::new(1024).unwrap(),
        );
        let mut block = vec![0; BS];
        init_dir_block(&mut block, 12, 2).unwrap();
        disk.write_blocks(BlockNumber(DIR_BLOCK), &block).unwrap();

        let mut inode = Ext4Inode::zeroed(256);
        inode.mode = S_IFDIR | 0o755;
        inode.size = BS as u64;
        kfs_extent::init_pblock(&mut inode, BlockNumber(DIR_BLOCK), 1).unwrap();
        (disk, inode, StagingBlock::new(BlockSize::new(1024).unwrap()))
    }

    fn rec_len_sum(block: &[u8]) -> usize {
        let mut off = 0;
        let mut sum = 0;
        while off < block.len() {
            let len = usize::from(read_le_u16(block, off + 4).unwrap());
            assert!(len >= 8, "rec_len {len} at {off}");
            sum += len;
            off += len;
        }
        sum
    }

    #[test]
    fn fresh_directory_lists_dot_entries() {
        let (disk, mut inode, mut staging) = setup();
        let mut dir = Directory::new(&disk, InodeNumber(12), &mut inode, &mut staging).unwrap();
        let names: Vec<_> = dir.entries().unwrap().into_iter().map(|d| d.entry.name).collect();
        assert_eq!(names, vec![b".".to_vec(), b"..".to_vec()]);
        assert!(dir.is_empty().unwrap());
        assert_eq!(dir.last().unwrap().unwrap().entry.name, b"..");
    }

    #[test]
    fn create_splits_slack_of_last_entry() {
        let (disk, mut inode, mut staging) = setup();
        let mut dir = Directory::new(&disk, InodeNumber(12), &mut inode, &mut staging).unwrap();
        let last = dir.last().unwrap().unwrap();
        assert!(has_space(&last.entry, b"hello"));
        let new = dir
            .create(&last, b"hello", InodeNumber(30), Ext4FileType::RegFile)
            .unwrap();
        assert_eq!(new.pos, 24);
        assert_eq!(usize::from(new.entry.rec_len), BS - EXT4_DIR_TAIL_SIZE - 24);

        let hit = dir.find(b"hello").unwrap().unwrap();
        assert_eq!(hit.found.entry.inode, 30);
        assert_eq!(hit.prev.unwrap().entry.name, b"..");
        assert!(!dir.is_empty().unwrap());
    }

    #[test]
    fn find_checks_length_before_bytes() {
        let (disk, mut inode, mut staging) = setup();
        let mut dir = Directory::new(&disk, InodeNumber(12), &mut inode, &mut staging).unwrap();
        dir.add(b"abc", InodeNumber(31), Ext4FileType::RegFile).unwrap();
        assert!(dir.find(b"ab").unwrap().is_none());
        assert!(dir.find(b"abcd").unwrap().is_none());
        assert!(dir.find(b"abc").unwrap().is_some());
    }

    #[test]
    fn delete_merges_into_predecessor() {
        let (disk, mut inode, mut staging) = setup();
        {
            let mut dir = Directory::new(&disk, InodeNumber(12), &mut inode, &mut staging).unwrap();
            dir.add(b"a", InodeNumber(40), Ext4FileType::RegFile).unwrap();
            dir.add(b"b", InodeNumber(41), Ext4FileType::RegFile).unwrap();
            let removed = dir.delete(b"a").unwrap();
            assert_eq!(removed.inode, 40);
            assert!(dir.find(b"a").unwrap().is_none());
            assert_eq!(dir.find(b"b").unwrap().unwrap().found.entry.inode, 41);
            assert!(matches!(dir.delete(b"a"), Err(KfsError::NotFound(_))));
            assert!(matches!(dir.delete(b".."), Err(KfsError::InvalidArgument(_))));
        }
        staging.flush(&disk).unwrap();
        let raw = disk.read_block(BlockNumber(DIR_BLOCK)).unwrap();
        // ".." absorbed the removed record.
        assert_eq!(read_le_u16(&raw, 12 + 4).unwrap(), 12 + 12);
        assert_eq!(rec_len_sum(&raw), BS);
        assert!(is_dir_tail(&raw, BS - EXT4_DIR_TAIL_SIZE));
    }

    #[test]
    fn full_block_reports_directory_full_then_grows() {
        let (disk, mut inode, mut staging) = setup();
        let mut alloc = BumpAlloc(60);
        let mut dir = Directory::new(&disk, InodeNumber(12), &mut inode, &mut staging).unwrap();
        let name = [b'x'; 200];
        let mut created = 0_u64;
        loop {
            let mut n = name;
            n[0] = b'a' + u8::try_from(created).unwrap();
            match dir.add(&n, InodeNumber(100 + created), Ext4FileType::RegFile) {
                Ok(_) => created += 1,
                Err(KfsError::DirectoryFull(12)) => break,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(created, 4);

        let mut overflow = name;
        overflow[0] = b'z';
        let d = dir
            .add_or_grow(&overflow, InodeNumber(200), Ext4FileType::RegFile, &mut alloc)
            .unwrap();
        assert_eq!(d.pos, BS as u64);
        assert!(dir.inode_changed());
        assert_eq!(dir.find(&overflow).unwrap().unwrap().found.entry.inode, 200);
        drop(dir);
        assert_eq!(inode.size, 2 * BS as u64);

        staging.flush(&disk).unwrap();
        for block in [DIR_BLOCK, 61] {
            let raw = disk.read_block(BlockNumber(block)).unwrap();
            assert_eq!(rec_len_sum(&raw), BS);
            assert!(is_dir_tail(&raw, BS - EXT4_DIR_TAIL_SIZE));
        }
    }

    #[test]
    fn next_extends_size_over_mapped_blocks() {
        let (disk, mut inode, mut staging) = setup();
        let mut block = vec![0; BS];
        init_empty_dir_block(&mut block).unwrap();
        write_dir_record(&mut block, 0, 77, 1012, Ext4FileType::RegFile, b"late").unwrap();
        disk.write_blocks(BlockNumber(DIR_BLOCK + 1), &block).unwrap();
        kfs_extent::init_pblock(&mut inode, BlockNumber(DIR_BLOCK), 2).unwrap();

        let mut dir = Directory::new(&disk, InodeNumber(12), &mut inode, &mut staging).unwrap();
        assert_eq!(dir.find(b"late").unwrap().unwrap().found.entry.inode, 77);
        assert!(dir.inode_changed());
        drop(dir);
        assert_eq!(inode.size, 2 * BS as u64);
    }

    #[test]
    fn missing_block_inside_size_is_corruption() {
        let (disk, mut inode, mut staging) = setup();
        inode.size = 2 * BS as u64;
        let mut dir = Directory::new(&disk, InodeNumber(12), &mut inode, &mut staging).unwrap();
        assert!(matches!(dir.find(b"nope"), Err(KfsError::Corruption { .. })));
    }

    #[test]
    fn retarget_rewrites_inode_and_type() {
        let (disk, mut inode, mut staging) = setup();
        let mut dir = Directory::new(&disk, InodeNumber(12), &mut inode, &mut staging).unwrap();
        dir.retarget(b"..", InodeNumber(5), Ext4FileType::Dir).unwrap();
        assert_eq!(dir.find(b"..").unwrap().unwrap().found.entry.inode, 5);
    }

    #[test]
    fn mutation_clears_htree_flag() {
        let (disk, mut inode, mut staging) = setup();
        inode.flags |= EXT4_INDEX_FL;
        let mut dir = Directory::new(&disk, InodeNumber(12), &mut inode, &mut staging).unwrap();
        dir.add(b"f", InodeNumber(50), Ext4FileType::RegFile).unwrap();
        drop(dir);
        assert_eq!(inode.flags & EXT4_INDEX_FL, 0);
    }

    #[test]
    fn name_validation() {
        assert!(validate_name(b"ok").is_ok());
        assert!(matches!(validate_name(b""), Err(KfsError::InvalidArgument(_))));
        assert!(matches!(validate_name(b"a/b"), Err(KfsError::InvalidArgument(_))));
        assert!(matches!(validate_name(&[b'n'; 256]), Err(KfsError::NameTooLong)));
    }

    #[test]
    fn discard_drops_dirty_buffer() {
        let (disk, mut inode, mut staging) = setup();
        let mut dir = Directory::new(&disk, InodeNumber(12), &mut inode, &mut staging).unwrap();
        dir.add(b"gone", InodeNumber(50), Ext4FileType::RegFile).unwrap();
        drop(dir);
        assert!(staging.is_dirty());
        staging.discard(InodeNumber(12));
        assert!(!staging.is_dirty());
        assert_eq!(staging.owner(), None);
        staging.flush(&disk).unwrap();
        let raw = disk.read_block(BlockNumber(DIR_BLOCK)).unwrap();
        assert_eq!(kfs_ondisk::parse_dir_block(&raw).unwrap().len(), 2);
    }

    proptest! {
        #[test]
        fn rec_len_sum_survives_create_delete(ops in proptest::collection::vec((any::<bool>(), 0_u8..24, 1_usize..40), 1..80)) {
            let (disk, mut inode, mut staging) = setup();
            let mut alloc = BumpAlloc(60);
            {
                let mut dir = Directory::new(&disk, InodeNumber(12), &mut inode, &mut staging).unwrap();
                for (insert, id, len) in ops {
                    let name = format!("{id}-{}", "n".repeat(len)).into_bytes();
                    if insert {
                        if dir.find(&name).unwrap().is_none() {
                            dir.add_or_grow(&name, InodeNumber(100 + u64::from(id)), Ext4FileType::RegFile, &mut alloc).unwrap();
                        }
                    } else {
                        let _ = dir.delete(&name);
                    }
                }
            }
            staging.flush(&disk).unwrap();
            let blocks = inode.size / BS as u64;
            for lblock in 0..blocks {
                let m = kfs_extent::resolve(&disk, &inode, u32::try_from(lblock).unwrap()).unwrap().unwrap();
                let raw = disk.read_block(m.physical).unwrap();
                prop_assert_eq!(rec_len_sum(&raw), BS);
                prop_assert!(is_dir_tail(&raw, BS - EXT4_DIR_TAIL_SIZE));
            }
        }
    }
}
