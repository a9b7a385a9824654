#![forbid(unsafe_code)]
//! kfs storage engine.
//!
//! [`KfsFs`] mounts an ext4 image and serves POSIX operations on it: path
//! and inode lookups, byte-range reads and writes, namespace changes and
//! attribute updates. All mutable state (superblock, group descriptors,
//! bitmaps, inode cache, directory staging block, directory cache) sits
//! behind one coarse lock and is written back on flush and unmount.

mod config;
mod control;
mod dcache;
mod fs;
mod mkfs;
mod mount;
mod perm;

pub use config::{ConfigError, MountConfig};
pub use control::{CONTROL_FILE_NAME, ControlFile};
pub use dcache::{DirCache, DirCacheStats, NodeId};
pub use fs::{EngineStats, KfsFs, split_path};
pub use mkfs::{FormatOptions, FormatSummary, format, format_uuid};
pub use perm::{AccessMask, RequestCtx};

pub use kfs_block::{Disk, FileByteDevice, MemoryByteDevice};
pub use kfs_error::{KfsError, Result};
pub use kfs_types::InodeNumber;

use std::ffi::OsStr;
use std::time::SystemTime;

use kfs_ondisk::{Ext4FileType, Ext4Inode};
use serde::{Deserialize, Serialize};

// ── VFS semantics layer ─────────────────────────────────────────────────────

/// File type as seen by VFS callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileType {
    fn from_inode(inode: &Ext4Inode) -> Self {
        Self::from_dirent(Ext4FileType::from_mode(inode.mode))
    }

    fn from_dirent(ft: Ext4FileType) -> Self {
        match ft {
            Ext4FileType::Dir => Self::Directory,
            Ext4FileType::Symlink => Self::Symlink,
            Ext4FileType::Blkdev => Self::BlockDevice,
            Ext4FileType::Chrdev => Self::CharDevice,
            Ext4FileType::Fifo => Self::Fifo,
            Ext4FileType::Sock => Self::Socket,
            Ext4FileType::RegFile | Ext4FileType::Unknown => Self::RegularFile,
        }
    }
}

/// Inode attributes, analogous to POSIX `struct stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    pub size: u64,
    /// Allocated 512-byte sectors, tree blocks included.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub kind: FileType,
    /// Lower 12 bits of the mode.
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
}

impl InodeAttr {
    fn from_inode(ino: InodeNumber, inode: &Ext4Inode, block_size: u32) -> Self {
        Self {
            ino,
            size: inode.size,
            blocks: inode.sectors(block_size),
            atime: inode.atime_system_time(),
            mtime: inode.mtime_system_time(),
            ctime: inode.ctime_system_time(),
            crtime: inode.crtime_system_time(),
            kind: FileType::from_inode(inode),
            perm: inode.permission_bits(),
            nlink: u32::from(inode.links_count),
            uid: inode.uid,
            gid: inode.gid,
            blksize: block_size,
        }
    }
}

/// One name returned by [`FsOps::readdir`].
///
/// `offset` is the cookie that resumes the listing after this entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub offset: u64,
    pub kind: FileType,
    pub name: Vec<u8>,
}

impl DirEntry {
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Attribute changes requested by `setattr`; `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: Option<u16>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

/// Filesystem-wide counters for `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Inode-addressed operations consumed by the FUSE adapter.
///
/// Every method takes the caller's identity so permission checks happen in
/// one place. Errors map to errnos through [`KfsError::to_errno`].
pub trait FsOps: Send + Sync {
    fn lookup(&self, ctx: &RequestCtx, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr>;

    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr>;

    fn setattr(&self, ctx: &RequestCtx, ino: InodeNumber, attr: &SetAttr) -> Result<InodeAttr>;

    fn access(&self, ctx: &RequestCtx, ino: InodeNumber, mask: AccessMask) -> Result<()>;

    /// Permission check for opening `ino` with `mask`.
    fn open(&self, ctx: &RequestCtx, ino: InodeNumber, mask: AccessMask) -> Result<()>;

    fn release(&self, ino: InodeNumber) -> Result<()>;

    /// Up to `size` bytes from `offset`; short at end of file.
    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>>;

    /// Bytes written, always `data.len()` on success.
    fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<u32>;

    fn create(
        &self,
        ctx: &RequestCtx,
        parent: InodeNumber,
        name: &OsStr,
        mode: u16,
    ) -> Result<InodeAttr>;

    fn mkdir(&self, ctx: &RequestCtx, parent: InodeNumber, name: &OsStr, mode: u16)
    -> Result<InodeAttr>;

    fn unlink(&self, ctx: &RequestCtx, parent: InodeNumber, name: &OsStr) -> Result<()>;

    fn rmdir(&self, ctx: &RequestCtx, parent: InodeNumber, name: &OsStr) -> Result<()>;

    fn rename(
        &self,
        ctx: &RequestCtx,
        parent: InodeNumber,
        name: &OsStr,
        new_parent: InodeNumber,
        new_name: &OsStr,
    ) -> Result<()>;

    fn symlink(
        &self,
        ctx: &RequestCtx,
        parent: InodeNumber,
        name: &OsStr,
        target: &[u8],
    ) -> Result<InodeAttr>;

    fn link(
        &self,
        ctx: &RequestCtx,
        ino: InodeNumber,
        new_parent: InodeNumber,
        new_name: &OsStr,
    ) -> Result<InodeAttr>;

    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>>;

    /// Entries after the cookie `offset` (0 starts from the beginning).
    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>>;

    fn statfs(&self) -> Result<StatFs>;

    /// Write back the inode and everything shared with it.
    fn flush(&self, ino: InodeNumber) -> Result<()>;

    fn fsync(&self, ino: InodeNumber) -> Result<()>;

    /// Final write-back at unmount.
    fn destroy(&self) -> Result<()>;
}
