//! The mounted filesystem.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use kfs_alloc::{Allocator, FsGeometry};
use kfs_block::{Disk, FileByteDevice};
use kfs_dir::{Directory, StagingBlock, validate_name};
use kfs_error::{KfsError, Result};
use kfs_extent::BlockAllocator;
use kfs_inode::{CacheStats, InodeCache, InodeLayout};
use kfs_ondisk::{Ext4DirEntry, Ext4FileType, Ext4Inode, Ext4Superblock, init_dir_block, init_empty_dir_block};
use kfs_types::{
    BlockNumber, BlockSize, ByteOffset, EXT4_N_BLOCKS_BYTES, EXT4_NAME_LEN, InodeNumber, S_IFDIR,
    S_IFLNK, S_IFMT, S_IFREG, u64_to_u32,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::dcache::{DirCache, DirCacheStats};
use crate::perm::check_access;
use crate::{
    AccessMask, DirEntry, FileType, FsOps, InodeAttr, MountConfig, RequestCtx, SetAttr, StatFs,
    mount,
};

/// Link count ceiling for regular files.
const MAX_LINKS: u16 = 65_000;
/// Longest symlink target stored inline in `i_block`.
const FAST_SYMLINK_MAX: usize = EXT4_N_BLOCKS_BYTES - 1;

/// Split an absolute path into its components. Empty components and `.`
/// are dropped.
pub fn split_path(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(KfsError::InvalidArgument(format!("path {path:?} is not absolute")));
    }
    let parts: Vec<&str> = path
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    if parts.iter().any(|c| c.len() > EXT4_NAME_LEN) {
        return Err(KfsError::NameTooLong);
    }
    Ok(parts)
}

/// Components of the parent directory and the final name.
fn parent_and_name(path: &str) -> Result<(String, &str)> {
    let mut parts = split_path(path)?;
    let name = parts
        .pop()
        .ok_or_else(|| KfsError::InvalidArgument("path names the root directory".into()))?;
    Ok((format!("/{}", parts.join("/")), name))
}

fn now() -> SystemTime {
    SystemTime::now()
}

fn touch_mc(inode: &mut Ext4Inode) {
    let t = now();
    inode.set_mtime(t);
    inode.set_ctime(t);
}

/// Engine counters exposed to tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub icache: CacheStats,
    pub dcache: DirCacheStats,
    /// Linear directory scans done by lookups.
    pub dir_scans: u64,
    pub dirty_inodes: usize,
    pub free_blocks: u64,
    pub free_inodes: u32,
}

// ── Tree block accounting ───────────────────────────────────────────────────

/// Hands blocks to the extent layer and keeps count of what went in and out
/// so `i_blocks` can be adjusted afterwards.
struct TreeAlloc<'a> {
    alloc: &'a mut Allocator,
    goal: BlockNumber,
    allocated: u64,
    freed: u64,
}

impl<'a> TreeAlloc<'a> {
    fn new(alloc: &'a mut Allocator, goal: BlockNumber) -> Self {
        Self {
            alloc,
            goal,
            allocated: 0,
            freed: 0,
        }
    }

    /// Fold the block delta into `inode.blocks`, counted in sectors.
    fn settle(&self, inode: &mut Ext4Inode, block_size: BlockSize) {
        let per_block = block_size.sectors();
        inode.blocks = inode
            .blocks
            .saturating_add(self.allocated * per_block)
            .saturating_sub(self.freed * per_block);
    }
}

impl BlockAllocator for TreeAlloc<'_> {
    fn alloc_block(&mut self) -> Result<BlockNumber> {
        let block = self.alloc.alloc_blocks(self.goal, 1)?;
        self.goal = BlockNumber(block.0 + 1);
        self.allocated += 1;
        Ok(block)
    }

    fn free_block(&mut self, block: BlockNumber) -> Result<()> {
        self.alloc.free_blocks_run(block, 1)?;
        self.freed += 1;
        Ok(())
    }
}

// ── Mutable state ───────────────────────────────────────────────────────────

struct FsState {
    disk: Arc<Disk>,
    sb: Ext4Superblock,
    alloc: Allocator,
    icache: InodeCache,
    staging: StagingBlock,
    dcache: DirCache,
    dir_scans: u64,
    file_prealloc: u16,
    dir_prealloc: u16,
}

impl FsState {
    fn block_size(&self) -> BlockSize {
        self.disk.block_size()
    }

    fn bs(&self) -> u64 {
        u64::from(self.disk.block_size().get())
    }

    fn inode(&mut self, ino: InodeNumber) -> Result<Ext4Inode> {
        self.icache.read(&self.disk, ino)
    }

    fn store(&mut self, ino: InodeNumber, inode: Ext4Inode) -> Result<()> {
        self.icache.store(&self.disk, ino, inode)
    }

    fn attr(&mut self, ino: InodeNumber) -> Result<InodeAttr> {
        let bs = self.block_size().get();
        let inode = self.icache.get(&self.disk, ino)?;
        Ok(InodeAttr::from_inode(ino, inode, bs))
    }

    fn dir_inode(&mut self, ino: InodeNumber) -> Result<Ext4Inode> {
        let inode = self.inode(ino)?;
        if !inode.is_dir() {
            return Err(KfsError::NotDirectory);
        }
        Ok(inode)
    }

    /// First block of the group holding `ino`, the default goal for its data.
    fn group_goal(&self, ino: InodeNumber) -> BlockNumber {
        let geo: &FsGeometry = self.alloc.geometry();
        geo.group_block_to_absolute(geo.inode_group(ino), 0)
    }

    fn data_goal(&self, ino: InodeNumber, inode: &Ext4Inode) -> Result<BlockNumber> {
        Ok(match kfs_extent::last_mapped(&self.disk, inode)? {
            Some((_, phys)) => BlockNumber(phys.0 + 1),
            None => self.group_goal(ino),
        })
    }

    // ── Directory access ────────────────────────────────────────────────

    /// Run `f` against directory `ino`, persisting the inode if the walk
    /// changed it.
    fn with_dir<R>(
        &mut self,
        ino: InodeNumber,
        f: impl FnOnce(&mut Directory<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut inode = self.inode(ino)?;
        let (result, changed) = {
            let mut dir = Directory::new(&self.disk, ino, &mut inode, &mut self.staging)?;
            let result = f(&mut dir);
            (result, dir.inode_changed())
        };
        if changed {
            self.store(ino, inode)?;
        }
        result
    }

    /// [`FsState::with_dir`] for edits: drops the remembered dentry position
    /// and stamps the directory's mtime and ctime.
    fn edit_dir<R>(
        &mut self,
        ino: InodeNumber,
        f: impl FnOnce(&mut Directory<'_>) -> Result<R>,
    ) -> Result<R> {
        self.icache.set_last_dentry(ino, None);
        let result = self.with_dir(ino, f)?;
        self.icache.update(&self.disk, ino, touch_mc)?;
        Ok(result)
    }

    /// Add `name`, growing the directory by a block when every block is full.
    fn add_entry(
        &mut self,
        dir_ino: InodeNumber,
        name: &[u8],
        ino: InodeNumber,
        ft: Ext4FileType,
    ) -> Result<()> {
        self.icache.set_last_dentry(dir_ino, None);
        let mut inode = self.dir_inode(dir_ino)?;
        let goal = self.data_goal(dir_ino, &inode)?;
        let block_size = self.block_size();
        let mut tree = TreeAlloc::new(&mut self.alloc, goal);
        let (result, changed) = {
            let mut dir = Directory::new(&self.disk, dir_ino, &mut inode, &mut self.staging)?;
            let result = dir.add_or_grow(name, ino, ft, &mut tree);
            (result, dir.inode_changed())
        };
        tree.settle(&mut inode, block_size);
        if changed || tree.allocated > 0 {
            touch_mc(&mut inode);
            self.store(dir_ino, inode)?;
        } else {
            self.icache.update(&self.disk, dir_ino, touch_mc)?;
        }
        result.map(|_| ())
    }

    /// Look `name` up in directory `dir`. Tries the remembered last dentry
    /// position first; otherwise scans the directory.
    fn lookup_child(&mut self, dir: InodeNumber, name: &[u8]) -> Result<Option<Ext4DirEntry>> {
        if name.len() > EXT4_NAME_LEN {
            return Err(KfsError::NameTooLong);
        }
        if let Some(pos) = self.icache.last_dentry(dir) {
            let hit = match self.with_dir(dir, |d| d.next(pos)) {
                Ok(hit) => hit,
                Err(err) => {
                    debug!(dir = dir.0, pos, %err, "remembered dentry unreadable, rescanning");
                    self.icache.set_last_dentry(dir, None);
                    None
                }
            };
            if let Some(d) = hit
                && d.entry.inode != 0
                && d.entry.name_matches(name)
            {
                trace!(dir = dir.0, pos, "last dentry hit");
                return self.live_entry(dir, d.entry).map(Some);
            }
        }
        self.dir_scans += 1;
        let Some(l) = self.with_dir(dir, |d| d.find(name))? else {
            return Ok(None);
        };
        self.icache.set_last_dentry(dir, Some(l.found.pos));
        self.live_entry(dir, l.found.entry).map(Some)
    }

    /// A name must point at an inode the bitmap marks allocated.
    fn live_entry(&self, dir: InodeNumber, entry: Ext4DirEntry) -> Result<Ext4DirEntry> {
        let ino = InodeNumber(u64::from(entry.inode));
        if self.alloc.inode_in_use(ino) {
            return Ok(entry);
        }
        warn!(dir = dir.0, ino = ino.0, "directory entry names a free inode");
        Err(KfsError::corrupt_at(
            0,
            format!("directory {dir} names free inode {ino}"),
        ))
    }

    // ── Path resolution ─────────────────────────────────────────────────

    /// Walk `path` from the root, directory cache first.
    fn resolve(&mut self, ctx: &RequestCtx, path: &str) -> Result<InodeNumber> {
        let mut cur = InodeNumber::ROOT;
        let mut node = Some(self.dcache.root());
        for comp in split_path(path)? {
            let name = comp.as_bytes();
            if !ctx.is_root() {
                let dir = self.dir_inode(cur)?;
                check_access(ctx, &dir, AccessMask::EXEC)?;
            }
            if name == b".." {
                cur = self.dotdot(cur)?;
                node = self.dcache.node_of(cur);
                continue;
            }
            if let Some(parent) = node
                && let Some(child) = self.dcache.lookup(parent, name)
                && let Some(ino) = self.dcache.ino(child)
            {
                cur = ino;
                node = Some(child);
                continue;
            }
            self.dir_inode(cur)?;
            let entry = self
                .lookup_child(cur, name)?
                .ok_or_else(|| KfsError::NotFound(comp.to_owned()))?;
            let child = InodeNumber(u64::from(entry.inode));
            node = if entry.file_type == Ext4FileType::Dir {
                node.or_else(|| self.dcache.node_of(cur))
                    .and_then(|parent| self.dcache.insert(parent, name, child))
            } else {
                None
            };
            cur = child;
        }
        trace!(path, ino = cur.0, "resolved");
        Ok(cur)
    }

    fn dotdot(&mut self, dir: InodeNumber) -> Result<InodeNumber> {
        self.dir_inode(dir)?;
        let entry = self
            .lookup_child(dir, b"..")?
            .ok_or_else(|| KfsError::corrupt_at(0, format!("directory {dir} has no '..'")))?;
        Ok(InodeNumber(u64::from(entry.inode)))
    }

    // ── Inode-level operations ──────────────────────────────────────────

    fn lookup(&mut self, ctx: &RequestCtx, parent: InodeNumber, name: &[u8]) -> Result<InodeAttr> {
        let dir = self.dir_inode(parent)?;
        check_access(ctx, &dir, AccessMask::EXEC)?;
        let entry = self
            .lookup_child(parent, name)?
            .ok_or_else(|| KfsError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
        let ino = InodeNumber(u64::from(entry.inode));
        if entry.file_type == Ext4FileType::Dir
            && !entry.is_dot()
            && !entry.is_dotdot()
            && let Some(node) = self.dcache.node_of(parent)
        {
            self.dcache.insert(node, name, ino);
        }
        self.attr(ino)
    }

    /// Check write and search permission on `parent` and that `name` is free.
    fn prepare_insert(&mut self, ctx: &RequestCtx, parent: InodeNumber, name: &[u8]) -> Result<()> {
        validate_name(name)?;
        let dir = self.dir_inode(parent)?;
        check_access(ctx, &dir, AccessMask::WRITE | AccessMask::EXEC)?;
        if self.lookup_child(parent, name)?.is_some() {
            return Err(KfsError::Exists);
        }
        Ok(())
    }

    /// Undo a half-created inode: release its blocks and its bitmap bit.
    fn abandon(&mut self, ino: InodeNumber, is_dir: bool) {
        let result = (|| -> Result<()> {
            let mut inode = self.inode(ino)?;
            if !inode.is_fast_symlink() {
                self.truncate_blocks(&mut inode, 0)?;
            }
            self.icache.invalidate(ino);
            self.alloc.set_inode(ino, false, is_dir)
        })();
        if let Err(err) = result {
            warn!(ino = ino.0, %err, "rollback of new inode failed");
        }
    }

    fn create(&mut self, ctx: &RequestCtx, parent: InodeNumber, name: &[u8], mode: u16) -> Result<InodeAttr> {
        self.prepare_insert(ctx, parent, name)?;
        let ino = self.alloc.alloc_inode(parent, false)?;
        let prealloc = self.file_prealloc;
        let goal = self.group_goal(parent);
        let run = if prealloc > 0 {
            match self.alloc.alloc_blocks(goal, u32::from(prealloc)) {
                Ok(start) => {
                    // Reads of the run before the first write must not see
                    // the previous owner's bytes.
                    if let Err(err) = self.disk.zero_blocks(start, u64::from(prealloc)) {
                        self.alloc.free_blocks_run(start, u64::from(prealloc))?;
                        self.alloc.set_inode(ino, false, false)?;
                        return Err(err);
                    }
                    Some(start)
                }
                Err(KfsError::NoSpace) => None,
                Err(err) => {
                    self.alloc.set_inode(ino, false, false)?;
                    return Err(err);
                }
            }
        } else {
            None
        };
        let sectors = self.block_size().sectors();
        let inode = self
            .icache
            .create(&self.disk, ino, S_IFREG | (mode & 0o7777), ctx.uid, ctx.gid)?;
        inode.links_count = 1;
        match run {
            Some(start) => {
                kfs_extent::init_pblock(inode, start, prealloc)?;
                inode.blocks = u64::from(prealloc) * sectors;
            }
            None => kfs_extent::init_extent_root(inode)?,
        }
        if let Err(err) = self.add_entry(parent, name, ino, Ext4FileType::RegFile) {
            self.abandon(ino, false);
            return Err(err);
        }
        debug!(parent = parent.0, ino = ino.0, name = %String::from_utf8_lossy(name), "create");
        self.attr(ino)
    }

    fn mkdir(&mut self, ctx: &RequestCtx, parent: InodeNumber, name: &[u8], mode: u16) -> Result<InodeAttr> {
        self.prepare_insert(ctx, parent, name)?;
        let ino = self.alloc.alloc_inode(parent, true)?;
        let count = self.dir_prealloc.max(1);
        let start = match self.alloc.alloc_blocks(self.group_goal(ino), u32::from(count)) {
            Ok(start) => start,
            Err(err) => {
                self.alloc.set_inode(ino, false, true)?;
                return Err(err);
            }
        };

        let bs = self.bs();
        let mut buf = vec![0_u8; self.block_size().as_usize()];
        init_dir_block(
            &mut buf,
            u64_to_u32(ino.0, "inode number")?,
            u64_to_u32(parent.0, "inode number")?,
        )?;
        self.disk.write_blocks(start, &buf)?;
        if count > 1 {
            init_empty_dir_block(&mut buf)?;
            for i in 1..u64::from(count) {
                self.disk.write_blocks(BlockNumber(start.0 + i), &buf)?;
            }
        }

        let sectors = self.block_size().sectors();
        let inode = self
            .icache
            .create(&self.disk, ino, S_IFDIR | (mode & 0o7777), ctx.uid, ctx.gid)?;
        inode.links_count = 2;
        inode.size = u64::from(count) * bs;
        inode.blocks = u64::from(count) * sectors;
        kfs_extent::init_pblock(inode, start, count)?;

        if let Err(err) = self.add_entry(parent, name, ino, Ext4FileType::Dir) {
            self.abandon(ino, true);
            return Err(err);
        }
        self.icache.update(&self.disk, parent, |p| {
            p.links_count = p.links_count.saturating_add(1);
        })?;
        if let Some(node) = self.dcache.node_of(parent) {
            self.dcache.insert(node, name, ino);
        }
        debug!(parent = parent.0, ino = ino.0, name = %String::from_utf8_lossy(name), "mkdir");
        self.attr(ino)
    }

    fn symlink(
        &mut self,
        ctx: &RequestCtx,
        parent: InodeNumber,
        name: &[u8],
        target: &[u8],
    ) -> Result<InodeAttr> {
        if target.is_empty() {
            return Err(KfsError::InvalidArgument("empty symlink target".into()));
        }
        if target.len() >= self.block_size().as_usize() {
            return Err(KfsError::NameTooLong);
        }
        self.prepare_insert(ctx, parent, name)?;
        let ino = self.alloc.alloc_inode(parent, false)?;

        let slow_block = if target.len() > FAST_SYMLINK_MAX {
            let block = match self.alloc.alloc_blocks(self.group_goal(ino), 1) {
                Ok(block) => block,
                Err(err) => {
                    self.alloc.set_inode(ino, false, false)?;
                    return Err(err);
                }
            };
            let mut buf = vec![0_u8; self.block_size().as_usize()];
            buf[..target.len()].copy_from_slice(target);
            self.disk.write_blocks(block, &buf)?;
            Some(block)
        } else {
            None
        };

        let sectors = self.block_size().sectors();
        let inode = self
            .icache
            .create(&self.disk, ino, S_IFLNK | 0o777, ctx.uid, ctx.gid)?;
        inode.links_count = 1;
        inode.size = target.len() as u64;
        match slow_block {
            Some(block) => {
                kfs_extent::init_pblock(inode, block, 1)?;
                inode.blocks = sectors;
            }
            None => inode.block[..target.len()].copy_from_slice(target),
        }

        if let Err(err) = self.add_entry(parent, name, ino, Ext4FileType::Symlink) {
            self.abandon(ino, false);
            return Err(err);
        }
        debug!(parent = parent.0, ino = ino.0, len = target.len(), "symlink");
        self.attr(ino)
    }

    fn link(
        &mut self,
        ctx: &RequestCtx,
        ino: InodeNumber,
        new_parent: InodeNumber,
        new_name: &[u8],
    ) -> Result<InodeAttr> {
        let inode = self.inode(ino)?;
        if inode.is_dir() {
            return Err(KfsError::NotPermitted);
        }
        if inode.links_count >= MAX_LINKS {
            return Err(KfsError::TooManyLinks);
        }
        self.prepare_insert(ctx, new_parent, new_name)?;
        let ft = Ext4FileType::from_mode(inode.mode);
        self.add_entry(new_parent, new_name, ino, ft)?;
        self.icache.update(&self.disk, ino, |i| {
            i.links_count += 1;
            i.set_ctime(now());
        })?;
        debug!(ino = ino.0, parent = new_parent.0, "link");
        self.attr(ino)
    }

    /// Drop one link; the last one releases the inode.
    fn drop_link(&mut self, ino: InodeNumber) -> Result<()> {
        let mut inode = self.inode(ino)?;
        inode.links_count = inode.links_count.saturating_sub(1);
        inode.set_ctime(now());
        if inode.links_count == 0 {
            self.release_inode(ino, inode)
        } else {
            self.store(ino, inode)
        }
    }

    /// Free every block of an unlinked inode and clear its bitmap bit. The
    /// record itself stays on disk with `dtime` set.
    fn release_inode(&mut self, ino: InodeNumber, mut inode: Ext4Inode) -> Result<()> {
        let is_dir = inode.is_dir();
        if is_dir {
            self.staging.discard(ino);
            self.dcache.forget(ino);
        }
        if !inode.is_fast_symlink() {
            self.truncate_blocks(&mut inode, 0)?;
        }
        inode.links_count = 0;
        inode.size = 0;
        inode.dtime = mount::now_secs();
        self.store(ino, inode)?;
        self.alloc.set_inode(ino, false, is_dir)?;
        debug!(ino = ino.0, "inode released");
        Ok(())
    }

    fn unlink(&mut self, ctx: &RequestCtx, parent: InodeNumber, name: &[u8]) -> Result<()> {
        let dir = self.dir_inode(parent)?;
        check_access(ctx, &dir, AccessMask::WRITE | AccessMask::EXEC)?;
        let entry = self
            .lookup_child(parent, name)?
            .ok_or_else(|| KfsError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
        let ino = InodeNumber(u64::from(entry.inode));
        if self.inode(ino)?.is_dir() {
            return Err(KfsError::IsDirectory);
        }
        self.edit_dir(parent, |d| d.delete(name))?;
        self.drop_link(ino)?;
        debug!(parent = parent.0, ino = ino.0, name = %String::from_utf8_lossy(name), "unlink");
        Ok(())
    }

    fn rmdir(&mut self, ctx: &RequestCtx, parent: InodeNumber, name: &[u8]) -> Result<()> {
        match name {
            b"." => return Err(KfsError::InvalidArgument("rmdir of '.'".into())),
            b".." => return Err(KfsError::NotEmpty),
            _ => {}
        }
        let dir = self.dir_inode(parent)?;
        check_access(ctx, &dir, AccessMask::WRITE | AccessMask::EXEC)?;
        let entry = self
            .lookup_child(parent, name)?
            .ok_or_else(|| KfsError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
        let ino = InodeNumber(u64::from(entry.inode));
        self.dir_inode(ino)?;
        if !self.with_dir(ino, |d| d.is_empty())? {
            return Err(KfsError::NotEmpty);
        }
        self.edit_dir(parent, |d| d.delete(name))?;
        self.icache.update(&self.disk, parent, |p| {
            p.links_count = p.links_count.saturating_sub(1);
        })?;
        self.dcache.remove(parent, name);
        let child = self.inode(ino)?;
        self.release_inode(ino, child)?;
        debug!(parent = parent.0, ino = ino.0, name = %String::from_utf8_lossy(name), "rmdir");
        Ok(())
    }

    /// Whether `dir` is `ancestor` or lies below it.
    fn is_within(&mut self, mut dir: InodeNumber, ancestor: InodeNumber) -> Result<bool> {
        let limit = self.sb.inodes_count;
        for _ in 0..limit {
            if dir == ancestor {
                return Ok(true);
            }
            if dir == InodeNumber::ROOT {
                return Ok(false);
            }
            dir = self.dotdot(dir)?;
        }
        Err(KfsError::corrupt_at(0, "directory '..' chain does not reach the root"))
    }

    fn rename(
        &mut self,
        ctx: &RequestCtx,
        parent: InodeNumber,
        name: &[u8],
        new_parent: InodeNumber,
        new_name: &[u8],
    ) -> Result<()> {
        for n in [name, new_name] {
            if n == b"." || n == b".." {
                return Err(KfsError::InvalidArgument("cannot rename '.' or '..'".into()));
            }
        }
        validate_name(new_name)?;
        let src_dir = self.dir_inode(parent)?;
        check_access(ctx, &src_dir, AccessMask::WRITE | AccessMask::EXEC)?;
        let dst_dir = self.dir_inode(new_parent)?;
        check_access(ctx, &dst_dir, AccessMask::WRITE | AccessMask::EXEC)?;

        let entry = self
            .lookup_child(parent, name)?
            .ok_or_else(|| KfsError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
        let src = InodeNumber(u64::from(entry.inode));
        if parent == new_parent && name == new_name {
            return Ok(());
        }
        let src_is_dir = self.inode(src)?.is_dir();
        if src_is_dir && new_parent != parent && self.is_within(new_parent, src)? {
            return Err(KfsError::InvalidArgument(
                "cannot move a directory below itself".into(),
            ));
        }
        let ft = if src_is_dir {
            Ext4FileType::Dir
        } else {
            entry.file_type
        };

        match self.lookup_child(new_parent, new_name)? {
            Some(target) if u64::from(target.inode) == src.0 => return Ok(()),
            Some(target) => {
                let victim = InodeNumber(u64::from(target.inode));
                let victim_inode = self.inode(victim)?;
                if src_is_dir {
                    if !victim_inode.is_dir() {
                        return Err(KfsError::NotDirectory);
                    }
                    if !self.with_dir(victim, |d| d.is_empty())? {
                        return Err(KfsError::NotEmpty);
                    }
                } else if victim_inode.is_dir() {
                    return Err(KfsError::IsDirectory);
                }
                self.edit_dir(new_parent, |d| d.retarget(new_name, src, ft))?;
                if victim_inode.is_dir() {
                    self.icache.update(&self.disk, new_parent, |p| {
                        p.links_count = p.links_count.saturating_sub(1);
                    })?;
                    let victim_inode = self.inode(victim)?;
                    self.release_inode(victim, victim_inode)?;
                } else {
                    self.drop_link(victim)?;
                }
            }
            None => self.add_entry(new_parent, new_name, src, ft)?,
        }

        self.edit_dir(parent, |d| d.delete(name))?;
        if src_is_dir && parent != new_parent {
            self.with_dir(src, |d| d.retarget(b"..", new_parent, Ext4FileType::Dir))?;
            self.icache.set_last_dentry(src, None);
            self.icache.update(&self.disk, parent, |p| {
                p.links_count = p.links_count.saturating_sub(1);
            })?;
            self.icache.update(&self.disk, new_parent, |p| {
                p.links_count = p.links_count.saturating_add(1);
            })?;
        }
        self.icache.update(&self.disk, src, |i| i.set_ctime(now()))?;

        self.dcache.remove(parent, name);
        self.dcache.remove(new_parent, new_name);
        if src_is_dir {
            self.dcache.forget(src);
        }
        debug!(
            src = src.0,
            from = parent.0,
            to = new_parent.0,
            name = %String::from_utf8_lossy(new_name),
            "rename"
        );
        Ok(())
    }

    fn readdir(&mut self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>> {
        self.dir_inode(ino)?;
        self.with_dir(ino, |d| {
            let mut out = Vec::new();
            let mut pos = offset;
            while let Some(dentry) = d.next(pos)? {
                pos = dentry.next_pos();
                if dentry.entry.inode != 0 {
                    out.push(DirEntry {
                        ino: InodeNumber(u64::from(dentry.entry.inode)),
                        offset: pos,
                        kind: FileType::from_dirent(dentry.entry.file_type),
                        name: dentry.entry.name,
                    });
                }
            }
            Ok(out)
        })
    }

    // ── File data ───────────────────────────────────────────────────────

    fn read(&mut self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>> {
        let inode = self.inode(ino)?;
        if inode.is_dir() {
            return Err(KfsError::IsDirectory);
        }
        if offset >= inode.size || size == 0 {
            return Ok(Vec::new());
        }
        let end = inode.size.min(offset.saturating_add(u64::from(size)));
        if let Some(target) = inode.fast_symlink_target() {
            #[allow(clippy::cast_possible_truncation)] // below 60
            return Ok(target[offset as usize..end as usize].to_vec());
        }

        let bs = self.bs();
        #[allow(clippy::cast_possible_truncation)] // bounded by `size`
        let mut out = vec![0_u8; (end - offset) as usize];
        let mut pos = offset;
        while pos < end {
            let lblock = u64_to_u32(pos / bs, "logical block")?;
            let in_block = pos % bs;
            #[allow(clippy::cast_possible_truncation)]
            let done = (pos - offset) as usize;
            let n = match kfs_extent::resolve(&self.disk, &inode, lblock)? {
                Some(m) if !m.unwritten => {
                    let run = u64::from(m.run_length) * bs - in_block;
                    let n = run.min(end - pos);
                    #[allow(clippy::cast_possible_truncation)]
                    self.disk.read_at(
                        ByteOffset(m.physical.0 * bs + in_block),
                        &mut out[done..done + n as usize],
                    )?;
                    n
                }
                _ => (bs - in_block).min(end - pos),
            };
            pos += n;
        }
        trace!(ino = ino.0, offset, len = out.len(), "read");
        Ok(out)
    }

    fn write(&mut self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<u32> {
        let len = u32::try_from(data.len())
            .map_err(|_| KfsError::InvalidArgument("write larger than 4 GiB".into()))?;
        let mut inode = self.inode(ino)?;
        if inode.is_dir() {
            return Err(KfsError::IsDirectory);
        }
        if !inode.is_regular() {
            return Err(KfsError::InvalidArgument(format!("inode {ino} is not a regular file")));
        }
        if len == 0 {
            return Ok(0);
        }
        let bs = self.bs();
        let end = offset
            .checked_add(u64::from(len))
            .filter(|&end| end.div_ceil(bs) <= u64::from(u32::MAX))
            .ok_or_else(|| KfsError::InvalidArgument("write past the maximum file size".into()))?;
        if !inode.uses_extents() && inode.blocks == 0 {
            kfs_extent::init_extent_root(&mut inode)?;
        }

        let goal = self.data_goal(ino, &inode)?;
        let block_size = self.block_size();
        let mut tree = TreeAlloc::new(&mut self.alloc, goal);
        let disk = &self.disk;
        let mut pos = offset;
        let result = (|| -> Result<()> {
            while pos < end {
                let lblock = u64_to_u32(pos / bs, "logical block")?;
                let in_block = pos % bs;
                let n = (bs - in_block).min(end - pos);
                #[allow(clippy::cast_possible_truncation)]
                let chunk = &data[(pos - offset) as usize..(pos - offset + n) as usize];
                match kfs_extent::resolve(disk, &inode, lblock)? {
                    Some(m) if m.unwritten => {
                        return Err(KfsError::UnsupportedFeature(
                            "writing into unwritten extents".into(),
                        ));
                    }
                    Some(m) => disk.write_at(ByteOffset(m.physical.0 * bs + in_block), chunk)?,
                    None => {
                        if !inode.uses_extents() {
                            return Err(KfsError::UnsupportedFeature(
                                "allocating blocks for block-mapped (non-extent) inodes".into(),
                            ));
                        }
                        let phys = tree.alloc_block()?;
                        if let Err(err) = kfs_extent::map_run(disk, &mut inode, lblock, phys, 1, &mut tree) {
                            tree.free_block(phys)?;
                            return Err(err);
                        }
                        let mut buf = vec![0_u8; block_size.as_usize()];
                        #[allow(clippy::cast_possible_truncation)]
                        buf[in_block as usize..in_block as usize + chunk.len()].copy_from_slice(chunk);
                        disk.write_blocks(phys, &buf)?;
                    }
                }
                pos += n;
            }
            Ok(())
        })();

        tree.settle(&mut inode, block_size);
        let allocated = tree.allocated;
        if pos > inode.size {
            inode.size = pos;
        }
        if pos > offset {
            touch_mc(&mut inode);
        }
        self.store(ino, inode)?;
        result?;
        trace!(ino = ino.0, offset, len, allocated, "write");
        Ok(len)
    }

    /// Drop every mapping past `new_size` and return the blocks.
    fn truncate_blocks(&mut self, inode: &mut Ext4Inode, new_size: u64) -> Result<()> {
        let bs = self.bs();
        let keep = u64_to_u32(new_size.div_ceil(bs), "logical block")?;
        let block_size = self.block_size();
        let mut tree = TreeAlloc::new(&mut self.alloc, BlockNumber(0));
        let freed = kfs_extent::truncate(&self.disk, inode, keep, &mut tree)?;
        let mut data_blocks = 0_u64;
        for range in &freed {
            tree.alloc
                .free_blocks_run(BlockNumber(range.physical_start), u64::from(range.count))?;
            data_blocks += u64::from(range.count);
        }
        tree.freed += data_blocks;
        tree.settle(inode, block_size);
        trace!(keep, ranges = freed.len(), data_blocks, "blocks released");
        Ok(())
    }

    /// Shrink or extend to `new_size`. Extending leaves a hole.
    fn set_size(&mut self, inode: &mut Ext4Inode, new_size: u64) -> Result<()> {
        if new_size < inode.size {
            self.truncate_blocks(inode, new_size)?;
            let bs = self.bs();
            let tail = new_size % bs;
            if tail != 0
                && let Some(m) =
                    kfs_extent::resolve(&self.disk, inode, u64_to_u32(new_size / bs, "logical block")?)?
                && !m.unwritten
            {
                #[allow(clippy::cast_possible_truncation)]
                let zeros = vec![0_u8; (bs - tail) as usize];
                self.disk.write_at(ByteOffset(m.physical.0 * bs + tail), &zeros)?;
            }
        }
        inode.size = new_size;
        touch_mc(inode);
        Ok(())
    }

    fn setattr(&mut self, ctx: &RequestCtx, ino: InodeNumber, attr: &SetAttr) -> Result<InodeAttr> {
        let mut inode = self.inode(ino)?;
        let owner = ctx.is_root() || ctx.uid == inode.uid;

        if let Some(mode) = attr.mode {
            if !owner {
                return Err(KfsError::NotPermitted);
            }
            inode.mode = (inode.mode & S_IFMT) | (mode & 0o7777);
        }
        if let Some(uid) = attr.uid
            && uid != inode.uid
        {
            if !ctx.is_root() {
                return Err(KfsError::NotPermitted);
            }
            inode.uid = uid;
        }
        if let Some(gid) = attr.gid
            && gid != inode.gid
        {
            if !ctx.is_root() && !(owner && gid == ctx.gid) {
                return Err(KfsError::NotPermitted);
            }
            inode.gid = gid;
        }
        if let Some(size) = attr.size {
            if inode.is_dir() {
                return Err(KfsError::IsDirectory);
            }
            if !inode.is_regular() {
                return Err(KfsError::InvalidArgument("truncate of a non-regular file".into()));
            }
            check_access(ctx, &inode, AccessMask::WRITE)?;
            let result = self.set_size(&mut inode, size);
            self.store(ino, inode.clone())?;
            result?;
        }
        if attr.atime.is_some() || attr.mtime.is_some() {
            if !owner {
                check_access(ctx, &inode, AccessMask::WRITE).map_err(|_| KfsError::NotPermitted)?;
            }
            if let Some(t) = attr.atime {
                inode.set_atime(t);
            }
            if let Some(t) = attr.mtime {
                inode.set_mtime(t);
            }
        }
        inode.set_ctime(now());
        self.store(ino, inode)?;
        debug!(ino = ino.0, ?attr, "setattr");
        self.attr(ino)
    }

    fn readlink(&mut self, ino: InodeNumber) -> Result<Vec<u8>> {
        let inode = self.inode(ino)?;
        if !inode.is_symlink() {
            return Err(KfsError::InvalidArgument(format!("inode {ino} is not a symlink")));
        }
        if let Some(target) = inode.fast_symlink_target() {
            return Ok(target.to_vec());
        }
        let size = u32::try_from(inode.size)
            .map_err(|_| KfsError::corrupt_at(0, format!("symlink {ino} size {}", inode.size)))?;
        self.read_symlink_blocks(ino, &inode, size)
    }

    fn read_symlink_blocks(&mut self, ino: InodeNumber, inode: &Ext4Inode, size: u32) -> Result<Vec<u8>> {
        let bs = self.bs();
        if u64::from(size) > bs {
            return Err(KfsError::corrupt_at(0, format!("symlink {ino} longer than a block")));
        }
        let mapping = kfs_extent::resolve(&self.disk, inode, 0)?
            .ok_or_else(|| KfsError::corrupt_at(0, format!("symlink {ino} has no data block")))?;
        let mut out = vec![0_u8; size as usize];
        self.disk.read_blocks(mapping.physical, &mut out)?;
        Ok(out)
    }

    fn statfs(&self) -> StatFs {
        let bfree = self.alloc.free_blocks();
        StatFs {
            blocks: self.sb.blocks_count,
            bfree,
            bavail: bfree.saturating_sub(self.sb.reserved_blocks_count),
            files: u64::from(self.sb.inodes_count),
            ffree: u64::from(self.alloc.free_inodes()),
            bsize: self.block_size().get(),
            namelen: EXT4_NAME_LEN as u32,
            frsize: self.block_size().get(),
        }
    }

    // ── Write-back ──────────────────────────────────────────────────────

    fn flush_inode(&mut self, ino: InodeNumber) -> Result<()> {
        self.staging.flush(&self.disk)?;
        self.icache.flush_one(&self.disk, ino)?;
        self.alloc.flush(&self.disk)?;
        self.write_superblock()
    }

    fn write_superblock(&mut self) -> Result<()> {
        self.alloc.apply_counts(&mut self.sb);
        mount::write_back(&self.disk, &mut self.sb)
    }

    fn flush_all(&mut self) -> Result<()> {
        self.staging.flush(&self.disk)?;
        let inodes = self.icache.flush(&self.disk)?;
        self.alloc.flush(&self.disk)?;
        self.write_superblock()?;
        self.disk.sync()?;
        debug!(inodes, "flushed");
        Ok(())
    }
}

// ── Public handle ───────────────────────────────────────────────────────────

/// A mounted kfs image.
pub struct KfsFs {
    config: MountConfig,
    read_only: bool,
    unmounted: AtomicBool,
    state: Mutex<FsState>,
}

impl std::fmt::Debug for KfsFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KfsFs")
            .field("config", &self.config)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl KfsFs {
    /// Open and mount the image at `path`. A file without write permission
    /// mounts read-only.
    pub fn open(path: impl AsRef<Path>, mut config: MountConfig) -> Result<Self> {
        let dev = FileByteDevice::open(path.as_ref())?;
        if !dev.is_writable() && !config.read_only {
            warn!(path = %path.as_ref().display(), "image is not writable, mounting read-only");
            config.read_only = true;
        }
        let disk = Disk::new(Box::new(dev), BlockSize::new(1024)?);
        Self::mount(disk, config)
    }

    /// Mount an already opened device.
    pub fn mount(disk: Disk, config: MountConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| KfsError::InvalidArgument(e.to_string()))?;
        let mut sb = mount::load(&disk)?;
        let block_size = BlockSize::new(sb.block_size)
            .map_err(|e| KfsError::InvalidGeometry(e.to_string()))?;
        let disk = Arc::new(disk.with_block_size(block_size));
        let alloc = Allocator::load(&disk, &sb)?;
        let layout = InodeLayout {
            inodes_count: sb.inodes_count,
            inodes_per_group: sb.inodes_per_group,
            inode_size: sb.effective_inode_size(),
            block_size,
            tables: alloc
                .groups()
                .iter()
                .map(|d| BlockNumber(d.inode_table))
                .collect(),
        };
        let mut icache = InodeCache::new(layout, config.icache_capacity);
        if !icache.get(&disk, InodeNumber::ROOT)?.is_dir() {
            return Err(KfsError::Format("root inode is not a directory".into()));
        }

        let read_only = config.read_only || mount::forced_read_only(&sb);
        if !read_only {
            mount::mark_mounted(&mut sb);
        }
        info!(
            block_size = block_size.get(),
            blocks = sb.blocks_count,
            groups = sb.groups_count(),
            free_blocks = alloc.free_blocks(),
            free_inodes = alloc.free_inodes(),
            read_only,
            "mounted"
        );
        let state = FsState {
            disk,
            sb,
            alloc,
            icache,
            staging: StagingBlock::new(block_size),
            dcache: DirCache::new(config.dcache_max_children),
            dir_scans: 0,
            file_prealloc: config.file_prealloc_blocks,
            dir_prealloc: config.dir_prealloc_blocks,
        };
        Ok(Self {
            config,
            read_only,
            unmounted: AtomicBool::new(false),
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.state.lock().block_size().get()
    }

    /// In-memory superblock, counters as of the last write-back.
    #[must_use]
    pub fn superblock(&self) -> Ext4Superblock {
        self.state.lock().sb.clone()
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let st = self.state.lock();
        EngineStats {
            icache: st.icache.stats(),
            dcache: st.dcache.stats(),
            dir_scans: st.dir_scans,
            dirty_inodes: st.icache.dirty_count(),
            free_blocks: st.alloc.free_blocks(),
            free_inodes: st.alloc.free_inodes(),
        }
    }

    fn writable(&self) -> Result<()> {
        if self.read_only {
            Err(KfsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut FsState) -> Result<R>) -> Result<R> {
        self.writable()?;
        f(&mut self.state.lock())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FsState) -> Result<R>) -> Result<R> {
        f(&mut self.state.lock())
    }

    /// Write back everything and sync the device.
    pub fn flush_all(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.state.lock().flush_all()
    }

    /// Final write-back; the handle is consumed.
    pub fn unmount(self) -> Result<()> {
        let result = self.flush_all();
        self.unmounted.store(true, Ordering::Release);
        info!("unmounted");
        result
    }

    // ── Path-based API ──────────────────────────────────────────────────

    /// Inode number of an absolute path.
    pub fn resolve(&self, ctx: &RequestCtx, path: &str) -> Result<InodeNumber> {
        self.with_state(|st| st.resolve(ctx, path))
    }

    fn resolve_parent<'p>(&self, ctx: &RequestCtx, path: &'p str) -> Result<(InodeNumber, &'p str)> {
        let (parent, name) = parent_and_name(path)?;
        Ok((self.resolve(ctx, &parent)?, name))
    }

    pub fn stat(&self, ctx: &RequestCtx, path: &str) -> Result<InodeAttr> {
        let ino = self.resolve(ctx, path)?;
        self.getattr(ino)
    }

    /// The whole content of a regular file.
    pub fn read_file(&self, ctx: &RequestCtx, path: &str) -> Result<Vec<u8>> {
        let ino = self.resolve(ctx, path)?;
        self.with_state(|st| {
            let inode = st.inode(ino)?;
            check_access(ctx, &inode, AccessMask::READ)?;
            let size = u32::try_from(inode.size)
                .map_err(|_| KfsError::InvalidArgument("file larger than 4 GiB".into()))?;
            st.read(ino, 0, size)
        })
    }

    pub fn write_file(&self, ctx: &RequestCtx, path: &str, offset: u64, data: &[u8]) -> Result<u32> {
        let ino = self.resolve(ctx, path)?;
        self.mutate(|st| {
            let inode = st.inode(ino)?;
            check_access(ctx, &inode, AccessMask::WRITE)?;
            st.write(ino, offset, data)
        })
    }

    pub fn create_file(&self, ctx: &RequestCtx, path: &str, mode: u16) -> Result<InodeAttr> {
        let (parent, name) = self.resolve_parent(ctx, path)?;
        self.create(ctx, parent, OsStr::new(name), mode)
    }

    pub fn mkdir_path(&self, ctx: &RequestCtx, path: &str, mode: u16) -> Result<InodeAttr> {
        let (parent, name) = self.resolve_parent(ctx, path)?;
        self.mkdir(ctx, parent, OsStr::new(name), mode)
    }

    pub fn unlink_path(&self, ctx: &RequestCtx, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(ctx, path)?;
        self.unlink(ctx, parent, OsStr::new(name))
    }

    pub fn rmdir_path(&self, ctx: &RequestCtx, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(ctx, path)?;
        self.rmdir(ctx, parent, OsStr::new(name))
    }

    pub fn rename_path(&self, ctx: &RequestCtx, from: &str, to: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(ctx, from)?;
        let (new_parent, new_name) = self.resolve_parent(ctx, to)?;
        self.rename(ctx, parent, OsStr::new(name), new_parent, OsStr::new(new_name))
    }

    pub fn symlink_path(&self, ctx: &RequestCtx, path: &str, target: &str) -> Result<InodeAttr> {
        let (parent, name) = self.resolve_parent(ctx, path)?;
        self.symlink(ctx, parent, OsStr::new(name), target.as_bytes())
    }

    pub fn link_path(&self, ctx: &RequestCtx, existing: &str, new_path: &str) -> Result<InodeAttr> {
        let ino = self.resolve(ctx, existing)?;
        let (parent, name) = self.resolve_parent(ctx, new_path)?;
        self.link(ctx, ino, parent, OsStr::new(name))
    }

    pub fn readlink_path(&self, ctx: &RequestCtx, path: &str) -> Result<Vec<u8>> {
        let ino = self.resolve(ctx, path)?;
        self.readlink(ino)
    }

    /// Every entry of a directory, `.` and `..` included.
    pub fn list_dir(&self, ctx: &RequestCtx, path: &str) -> Result<Vec<DirEntry>> {
        let ino = self.resolve(ctx, path)?;
        self.with_state(|st| {
            let dir = st.dir_inode(ino)?;
            check_access(ctx, &dir, AccessMask::READ)?;
            st.readdir(ino, 0)
        })
    }

    pub fn truncate_path(&self, ctx: &RequestCtx, path: &str, size: u64) -> Result<InodeAttr> {
        let ino = self.resolve(ctx, path)?;
        let attr = SetAttr {
            size: Some(size),
            ..SetAttr::default()
        };
        self.setattr(ctx, ino, &attr)
    }
}

impl Drop for KfsFs {
    fn drop(&mut self) {
        if self.unmounted.load(Ordering::Acquire) || self.read_only {
            return;
        }
        if let Err(err) = self.state.get_mut().flush_all() {
            warn!(%err, "write-back on drop failed");
        }
    }
}

fn name_bytes(name: &OsStr) -> &[u8] {
    name.as_encoded_bytes()
}

impl FsOps for KfsFs {
    fn lookup(&self, ctx: &RequestCtx, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr> {
        self.with_state(|st| st.lookup(ctx, parent, name_bytes(name)))
    }

    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        self.with_state(|st| st.attr(ino))
    }

    fn setattr(&self, ctx: &RequestCtx, ino: InodeNumber, attr: &SetAttr) -> Result<InodeAttr> {
        self.mutate(|st| st.setattr(ctx, ino, attr))
    }

    fn access(&self, ctx: &RequestCtx, ino: InodeNumber, mask: AccessMask) -> Result<()> {
        if self.read_only && mask.contains(AccessMask::WRITE) {
            return Err(KfsError::ReadOnly);
        }
        self.with_state(|st| {
            let inode = st.inode(ino)?;
            check_access(ctx, &inode, mask)
        })
    }

    fn open(&self, ctx: &RequestCtx, ino: InodeNumber, mask: AccessMask) -> Result<()> {
        self.access(ctx, ino, mask)
    }

    fn release(&self, ino: InodeNumber) -> Result<()> {
        trace!(ino = ino.0, "release");
        Ok(())
    }

    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.with_state(|st| st.read(ino, offset, size))
    }

    fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<u32> {
        self.mutate(|st| st.write(ino, offset, data))
    }

    fn create(&self, ctx: &RequestCtx, parent: InodeNumber, name: &OsStr, mode: u16) -> Result<InodeAttr> {
        self.mutate(|st| st.create(ctx, parent, name_bytes(name), mode))
    }

    fn mkdir(&self, ctx: &RequestCtx, parent: InodeNumber, name: &OsStr, mode: u16) -> Result<InodeAttr> {
        self.mutate(|st| st.mkdir(ctx, parent, name_bytes(name), mode))
    }

    fn unlink(&self, ctx: &RequestCtx, parent: InodeNumber, name: &OsStr) -> Result<()> {
        self.mutate(|st| st.unlink(ctx, parent, name_bytes(name)))
    }

    fn rmdir(&self, ctx: &RequestCtx, parent: InodeNumber, name: &OsStr) -> Result<()> {
        self.mutate(|st| st.rmdir(ctx, parent, name_bytes(name)))
    }

    fn rename(
        &self,
        ctx: &RequestCtx,
        parent: InodeNumber,
        name: &OsStr,
        new_parent: InodeNumber,
        new_name: &OsStr,
    ) -> Result<()> {
        self.mutate(|st| st.rename(ctx, parent, name_bytes(name), new_parent, name_bytes(new_name)))
    }

    fn symlink(&self, ctx: &RequestCtx, parent: InodeNumber, name: &OsStr, target: &[u8]) -> Result<InodeAttr> {
        self.mutate(|st| st.symlink(ctx, parent, name_bytes(name), target))
    }

    fn link(&self, ctx: &RequestCtx, ino: InodeNumber, new_parent: InodeNumber, new_name: &OsStr) -> Result<InodeAttr> {
        self.mutate(|st| st.link(ctx, ino, new_parent, name_bytes(new_name)))
    }

    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        self.with_state(|st| st.readlink(ino))
    }

    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>> {
        self.with_state(|st| st.readdir(ino, offset))
    }

    fn statfs(&self) -> Result<StatFs> {
        Ok(self.state.lock().statfs())
    }

    fn flush(&self, ino: InodeNumber) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.with_state(|st| st.flush_inode(ino))
    }

    fn fsync(&self, ino: InodeNumber) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.with_state(|st| {
            st.flush_inode(ino)?;
            st.disk.sync()
        })
    }

    fn destroy(&self) -> Result<()> {
        self.flush_all()
    }
}
