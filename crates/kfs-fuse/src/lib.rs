#![forbid(unsafe_code)]
//! FUSE adapter for kfs.
//!
//! Kernel requests arrive through `fuser`, are forwarded to an
//! [`FsOps`] implementation with the caller's uid/gid, and errors are
//! mapped through [`KfsError::to_errno`].

use std::ffi::OsStr;
use std::os::raw::c_int;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use kfs_core::{AccessMask, FileType as KfsFileType, FsOps, InodeAttr, RequestCtx, SetAttr};
use kfs_error::KfsError;
use kfs_types::InodeNumber;
use thiserror::Error;
use tracing::{info, trace, warn};

/// Lifetime of attributes and entries handed to the kernel.
///
/// Every change goes through this process, so the kernel's copies only go
/// stale through our own replies.
const ATTR_TTL: Duration = Duration::from_secs(1);

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── FUSE error context ─────────────────────────────────────────────────────

/// A failed operation, logged once before its errno goes back to the kernel.
pub struct FuseErrorContext<'a> {
    pub error: &'a KfsError,
    pub operation: &'static str,
    pub ino: u64,
    pub offset: Option<u64>,
}

impl FuseErrorContext<'_> {
    /// Log via tracing and return the errno for the reply.
    pub fn log_and_errno(&self) -> c_int {
        let errno = self.error.to_errno();
        // ENOENT is routine (shell completion, $PATH probes).
        if errno == libc::ENOENT {
            trace!(
                op = self.operation,
                ino = self.ino,
                errno,
                error = %self.error,
                "FUSE op returned ENOENT"
            );
        } else {
            warn!(
                op = self.operation,
                ino = self.ino,
                offset = self.offset,
                errno,
                error = %self.error,
                "FUSE op failed"
            );
        }
        errno
    }
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(ft: KfsFileType) -> FileType {
    match ft {
        KfsFileType::RegularFile => FileType::RegularFile,
        KfsFileType::Directory => FileType::Directory,
        KfsFileType::Symlink => FileType::Symlink,
        KfsFileType::BlockDevice => FileType::BlockDevice,
        KfsFileType::CharDevice => FileType::CharDevice,
        KfsFileType::Fifo => FileType::NamedPipe,
        KfsFileType::Socket => FileType::Socket,
    }
}

fn to_file_attr(attr: &InodeAttr) -> FileAttr {
    FileAttr {
        ino: attr.ino.0,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.crtime,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn request_ctx(req: &Request<'_>) -> RequestCtx {
    RequestCtx::new(req.uid(), req.gid())
}

/// Permission bits of a FUSE mode after applying the caller's umask.
#[allow(clippy::cast_possible_truncation)] // masked to 12 bits
fn effective_mode(mode: u32, umask: u32) -> u16 {
    (mode & !umask & 0o7777) as u16
}

fn access_mask(mask: i32) -> AccessMask {
    AccessMask(u32::try_from(mask).unwrap_or(0) & 0o7)
}

fn resolve_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(st) => st,
        TimeOrNow::Now => SystemTime::now(),
    }
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub read_only: bool,
    pub allow_other: bool,
    pub auto_unmount: bool,
}

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Lock-free per-mount request counters.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    requests_ok: AtomicU64,
    requests_err: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl AtomicMetrics {
    fn record<T>(&self, result: &kfs_error::Result<T>) {
        let counter = if result.is_ok() {
            &self.requests_ok
        } else {
            &self.requests_err
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests_ok = self.requests_ok.load(Ordering::Relaxed);
        let requests_err = self.requests_err.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests_total: requests_ok + requests_err,
            requests_ok,
            requests_err,
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_ok: u64,
    pub requests_err: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// `fuser::Filesystem` over any [`FsOps`].
pub struct KfsFuse {
    ops: Arc<dyn FsOps>,
    metrics: Arc<AtomicMetrics>,
    read_only: bool,
}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<KfsFuse>;
};

impl std::fmt::Debug for KfsFuse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KfsFuse")
            .field("metrics", &self.metrics.snapshot())
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl KfsFuse {
    #[must_use]
    pub fn new(ops: Arc<dyn FsOps>, options: &MountOptions) -> Self {
        Self {
            ops,
            metrics: Arc::new(AtomicMetrics::default()),
            read_only: options.read_only,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<AtomicMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run one operation and count its outcome.
    fn run<T>(&self, f: impl FnOnce(&dyn FsOps) -> kfs_error::Result<T>) -> kfs_error::Result<T> {
        let result = f(self.ops.as_ref());
        self.metrics.record(&result);
        result
    }

    /// Mutations on a read-only mount fail before reaching the engine.
    fn run_mut<T>(
        &self,
        f: impl FnOnce(&dyn FsOps) -> kfs_error::Result<T>,
    ) -> kfs_error::Result<T> {
        if self.read_only {
            let result = Err(KfsError::ReadOnly);
            self.metrics.record::<T>(&result);
            return result;
        }
        self.run(f)
    }

    fn reply_entry(result: kfs_error::Result<InodeAttr>, op: &'static str, ino: u64, reply: ReplyEntry) {
        match result {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(Self::errno(&e, op, ino, None)),
        }
    }

    fn reply_empty(result: kfs_error::Result<()>, op: &'static str, ino: u64, reply: ReplyEmpty) {
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::errno(&e, op, ino, None)),
        }
    }

    fn errno(error: &KfsError, operation: &'static str, ino: u64, offset: Option<u64>) -> c_int {
        FuseErrorContext {
            error,
            operation,
            ino,
            offset,
        }
        .log_and_errno()
    }
}

impl Filesystem for KfsFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!(read_only = self.read_only, "FUSE session initialised");
        Ok(())
    }

    fn destroy(&mut self) {
        let snap = self.metrics.snapshot();
        info!(
            requests_ok = snap.requests_ok,
            requests_err = snap.requests_err,
            bytes_read = snap.bytes_read,
            bytes_written = snap.bytes_written,
            "FUSE session ending"
        );
        if let Err(e) = self.ops.destroy() {
            warn!(error = %e, "final write-back failed");
        }
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let ctx = request_ctx(req);
        let result = self.run(|ops| ops.lookup(&ctx, InodeNumber(parent), name));
        Self::reply_entry(result, "lookup", parent, reply);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.run(|ops| ops.getattr(InodeNumber(ino))) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr)),
            Err(e) => reply.error(Self::errno(&e, "getattr", ino, None)),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let ctx = request_ctx(req);
        let attrs = SetAttr {
            mode: mode.map(|m| effective_mode(m, 0)),
            uid,
            gid,
            size,
            atime: atime.map(resolve_time),
            mtime: mtime.map(resolve_time),
        };
        match self.run_mut(|ops| ops.setattr(&ctx, InodeNumber(ino), &attrs)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr)),
            Err(e) => reply.error(Self::errno(&e, "setattr", ino, None)),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let ctx = request_ctx(req);
        let result = self.run(|ops| ops.access(&ctx, InodeNumber(ino), access_mask(mask)));
        Self::reply_empty(result, "access", ino, reply);
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let ctx = request_ctx(req);
        let mask = AccessMask::from_open_flags(flags);
        // Stateless: no file handles are tracked.
        match self.run(|ops| ops.open(&ctx, InodeNumber(ino), mask)) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(Self::errno(&e, "open", ino, None)),
        }
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let ctx = request_ctx(req);
        match self.run(|ops| ops.open(&ctx, InodeNumber(ino), AccessMask::READ)) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(Self::errno(&e, "opendir", ino, None)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let result = self.run(|ops| ops.release(InodeNumber(ino)));
        Self::reply_empty(result, "release", ino, reply);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.run(|ops| ops.read(InodeNumber(ino), byte_offset, size)) {
            Ok(data) => {
                self.metrics
                    .bytes_read
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                reply.data(&data);
            }
            Err(e) => reply.error(Self::errno(&e, "read", ino, Some(byte_offset))),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.run_mut(|ops| ops.write(InodeNumber(ino), byte_offset, data)) {
            Ok(written) => {
                self.metrics
                    .bytes_written
                    .fetch_add(u64::from(written), Ordering::Relaxed);
                reply.written(written);
            }
            Err(e) => reply.error(Self::errno(&e, "write", ino, Some(byte_offset))),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let result = self.run(|ops| ops.flush(InodeNumber(ino)));
        Self::reply_empty(result, "flush", ino, reply);
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let result = self.run(|ops| ops.fsync(InodeNumber(ino)));
        Self::reply_empty(result, "fsync", ino, reply);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let fs_offset = u64::try_from(offset).unwrap_or(0);
        match self.run(|ops| ops.readdir(InodeNumber(ino), fs_offset)) {
            Ok(entries) => {
                for entry in &entries {
                    let full = reply.add(
                        entry.ino.0,
                        i64::try_from(entry.offset).unwrap_or(i64::MAX),
                        to_fuser_file_type(entry.kind),
                        OsStr::from_bytes(&entry.name),
                    );
                    if full {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(Self::errno(&e, "readdir", ino, Some(fs_offset))),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        let result = self.run(|ops| ops.release(InodeNumber(ino)));
        Self::reply_empty(result, "releasedir", ino, reply);
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.run(|ops| ops.readlink(InodeNumber(ino))) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(Self::errno(&e, "readlink", ino, None)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let ctx = request_ctx(req);
        let mode = effective_mode(mode, umask);
        let result = self.run_mut(|ops| ops.mkdir(&ctx, InodeNumber(parent), name, mode));
        Self::reply_entry(result, "mkdir", parent, reply);
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let ctx = request_ctx(req);
        let mode = effective_mode(mode, umask);
        match self.run_mut(|ops| ops.create(&ctx, InodeNumber(parent), name, mode)) {
            Ok(attr) => reply.created(&ATTR_TTL, &to_file_attr(&attr), 0, 0, 0),
            Err(e) => reply.error(Self::errno(&e, "create", parent, None)),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let ctx = request_ctx(req);
        let result = self.run_mut(|ops| ops.unlink(&ctx, InodeNumber(parent), name));
        Self::reply_empty(result, "unlink", parent, reply);
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let ctx = request_ctx(req);
        let result = self.run_mut(|ops| ops.rmdir(&ctx, InodeNumber(parent), name));
        Self::reply_empty(result, "rmdir", parent, reply);
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            // RENAME_NOREPLACE / RENAME_EXCHANGE are not offered.
            reply.error(libc::EINVAL);
            return;
        }
        let ctx = request_ctx(req);
        let result = self.run_mut(|ops| {
            ops.rename(&ctx, InodeNumber(parent), name, InodeNumber(newparent), newname)
        });
        Self::reply_empty(result, "rename", parent, reply);
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let ctx = request_ctx(req);
        let target = target.as_os_str().as_bytes();
        let result = self.run_mut(|ops| ops.symlink(&ctx, InodeNumber(parent), link_name, target));
        Self::reply_entry(result, "symlink", parent, reply);
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let ctx = request_ctx(req);
        let result =
            self.run_mut(|ops| ops.link(&ctx, InodeNumber(ino), InodeNumber(newparent), newname));
        Self::reply_entry(result, "link", ino, reply);
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        match self.run(|ops| ops.statfs()) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize,
            ),
            Err(e) => reply.error(Self::errno(&e, "statfs", ino, None)),
        }
    }
}

// ── Mount entrypoints ───────────────────────────────────────────────────────

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("kfs".to_owned()),
        MountOption::Subtype("kfs".to_owned()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ];
    opts.push(if options.read_only {
        MountOption::RO
    } else {
        MountOption::RW
    });
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

fn check_mountpoint(mountpoint: &Path) -> Result<(), FuseError> {
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    if !mountpoint.is_dir() {
        return Err(FuseError::InvalidMountpoint(format!(
            "{} is not a directory",
            mountpoint.display()
        )));
    }
    Ok(())
}

/// Serve `ops` at `mountpoint` until the filesystem is unmounted.
pub fn mount(
    ops: Arc<dyn FsOps>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<MetricsSnapshot, FuseError> {
    let mountpoint = mountpoint.as_ref();
    check_mountpoint(mountpoint)?;
    let fs = KfsFuse::new(ops, options);
    let metrics = fs.metrics();
    info!(mountpoint = %mountpoint.display(), ?options, "mounting");
    fuser::mount2(fs, mountpoint, &build_mount_options(options))?;
    info!(mountpoint = %mountpoint.display(), "unmounted");
    Ok(metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfs_core::{Disk, FormatOptions, KfsFs, MemoryByteDevice, MountConfig, format};
    use kfs_types::BlockSize;

    fn engine() -> Arc<dyn FsOps> {
        let disk = Disk::new(
            Box::new(MemoryByteDevice::new(4 << 20)),
            BlockSize::new(1024).unwrap(),
        );
        format(
            &disk,
            &FormatOptions {
                block_size: 1024,
                ..FormatOptions::default()
            },
        )
        .unwrap();
        Arc::new(KfsFs::mount(disk, MountConfig::default()).unwrap())
    }

    #[test]
    fn file_type_conversion() {
        let cases = [
            (KfsFileType::RegularFile, FileType::RegularFile),
            (KfsFileType::Directory, FileType::Directory),
            (KfsFileType::Symlink, FileType::Symlink),
            (KfsFileType::BlockDevice, FileType::BlockDevice),
            (KfsFileType::CharDevice, FileType::CharDevice),
            (KfsFileType::Fifo, FileType::NamedPipe),
            (KfsFileType::Socket, FileType::Socket),
        ];
        for (ours, theirs) in cases {
            assert_eq!(to_fuser_file_type(ours), theirs);
        }
    }

    #[test]
    fn inode_attr_to_file_attr() {
        let ops = engine();
        let attr = ops.getattr(InodeNumber::ROOT).unwrap();
        let fattr = to_file_attr(&attr);
        assert_eq!(fattr.ino, 2);
        assert_eq!(fattr.kind, FileType::Directory);
        assert_eq!(fattr.perm, 0o755);
        assert_eq!(fattr.nlink, 3);
        assert_eq!(fattr.blksize, 1024);
        assert_eq!(fattr.rdev, 0);
    }

    #[test]
    fn umask_is_applied() {
        assert_eq!(effective_mode(0o100_666, 0o022), 0o644);
        assert_eq!(effective_mode(0o777, 0o077), 0o700);
        assert_eq!(effective_mode(0o4755, 0), 0o4755);
    }

    #[test]
    fn access_mask_keeps_rwx_bits() {
        assert_eq!(access_mask(libc::R_OK | libc::X_OK), AccessMask::READ | AccessMask::EXEC);
        assert_eq!(access_mask(libc::F_OK), AccessMask::EXISTS);
        assert_eq!(access_mask(-1), AccessMask::EXISTS);
    }

    #[test]
    fn mount_options_map_to_fuser() {
        let opts = build_mount_options(&MountOptions {
            read_only: true,
            allow_other: true,
            auto_unmount: false,
        });
        assert!(opts.contains(&MountOption::RO));
        assert!(opts.contains(&MountOption::AllowOther));
        assert!(!opts.contains(&MountOption::AutoUnmount));
        let rw = build_mount_options(&MountOptions::default());
        assert!(rw.contains(&MountOption::RW));
        assert!(rw.contains(&MountOption::DefaultPermissions));
    }

    #[test]
    fn mount_rejects_bad_mountpoints() {
        let err = mount(engine(), "", &MountOptions::default()).unwrap_err();
        assert!(matches!(err, FuseError::InvalidMountpoint(_)));
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = mount(engine(), file.path(), &MountOptions::default()).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn error_context_maps_errno() {
        let cases = [
            (KfsError::NotFound("x".into()), libc::ENOENT),
            (KfsError::ReadOnly, libc::EROFS),
            (KfsError::NotEmpty, libc::ENOTEMPTY),
            (KfsError::corrupt_at(9, "bad"), libc::EIO),
        ];
        for (error, errno) in &cases {
            let ctx = FuseErrorContext {
                error,
                operation: "test",
                ino: 2,
                offset: Some(0),
            };
            assert_eq!(ctx.log_and_errno(), *errno);
        }
    }

    #[test]
    fn read_only_adapter_short_circuits_mutations() {
        let fuse = KfsFuse::new(
            engine(),
            &MountOptions {
                read_only: true,
                ..MountOptions::default()
            },
        );
        let ctx = RequestCtx::root();
        let result =
            fuse.run_mut(|ops| ops.create(&ctx, InodeNumber::ROOT, OsStr::new("f"), 0o644));
        assert!(matches!(result, Err(KfsError::ReadOnly)));
        assert!(fuse.run(|ops| ops.getattr(InodeNumber::ROOT)).is_ok());

        let snap = fuse.metrics().snapshot();
        assert_eq!(snap.requests_total, 2);
        assert_eq!(snap.requests_err, 1);
    }

    #[test]
    fn adapter_forwards_to_engine() {
        let fuse = KfsFuse::new(engine(), &MountOptions::default());
        let ctx = RequestCtx::root();
        let attr = fuse
            .run_mut(|ops| ops.create(&ctx, InodeNumber::ROOT, OsStr::new("f"), 0o644))
            .unwrap();
        fuse.run_mut(|ops| ops.write(attr.ino, 0, b"abc")).unwrap();
        let data = fuse.run(|ops| ops.read(attr.ino, 0, 16)).unwrap();
        assert_eq!(data, b"abc");
        assert_eq!(fuse.metrics().snapshot().requests_ok, 3);
    }
}
