//! The engine-managed control file at `/.kfsctl`.
//!
//! Out-of-band tooling talks to a mounted image through this file. It is an
//! ordinary regular inode: reads and writes go through the same extent and
//! allocation paths as any other file.

use std::ffi::OsStr;

use kfs_error::{KfsError, Result};
use kfs_types::InodeNumber;
use tracing::debug;

use crate::{FsOps, KfsFs, RequestCtx};

pub const CONTROL_FILE_NAME: &str = ".kfsctl";

const CONTROL_FILE_MODE: u16 = 0o600;

/// Open handle on the control file.
#[derive(Debug)]
pub struct ControlFile<'a> {
    fs: &'a KfsFs,
    ino: InodeNumber,
}

impl<'a> ControlFile<'a> {
    /// Open the control file, creating it on first use. Creation needs a
    /// writable mount.
    pub fn open(fs: &'a KfsFs) -> Result<Self> {
        let ctx = RequestCtx::root();
        let name = OsStr::new(CONTROL_FILE_NAME);
        let ino = match fs.lookup(&ctx, InodeNumber::ROOT, name) {
            Ok(attr) => attr.ino,
            Err(KfsError::NotFound(_)) => {
                let attr = fs.create(&ctx, InodeNumber::ROOT, name, CONTROL_FILE_MODE)?;
                debug!(ino = attr.ino.0, "control file created");
                attr.ino
            }
            Err(err) => return Err(err),
        };
        if fs.getattr(ino)?.kind != crate::FileType::RegularFile {
            return Err(KfsError::InvalidArgument(format!(
                "/{CONTROL_FILE_NAME} is not a regular file"
            )));
        }
        Ok(Self { fs, ino })
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.fs.getattr(self.ino)?.size)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn read_at(&self, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.fs.read(self.ino, offset, size)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<u32> {
        self.fs.write(self.ino, offset, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mkfs::{FormatOptions, format};
    use crate::{Disk, MemoryByteDevice, MountConfig};
    use kfs_types::BlockSize;

    fn mounted() -> KfsFs {
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
        KfsFs::mount(disk, MountConfig::default()).unwrap()
    }

    #[test]
    fn created_lazily_and_reused() {
        let fs = mounted();
        assert!(fs.stat(&RequestCtx::root(), "/.kfsctl").is_err());
        let ino = ControlFile::open(&fs).unwrap().ino();
        let attr = fs.stat(&RequestCtx::root(), "/.kfsctl").unwrap();
        assert_eq!(attr.ino, ino);
        assert_eq!(attr.perm, 0o600);
        assert_eq!(ControlFile::open(&fs).unwrap().ino(), ino);
    }

    #[test]
    fn offsets_address_file_bytes() {
        let fs = mounted();
        let ctl = ControlFile::open(&fs).unwrap();
        assert!(ctl.is_empty().unwrap());
        ctl.write_at(2048, b"snapshot").unwrap();
        ctl.write_at(0, b"hdr").unwrap();
        assert_eq!(ctl.len().unwrap(), 2056);
        assert_eq!(ctl.read_at(2048, 64).unwrap(), b"snapshot");
        assert_eq!(ctl.read_at(0, 4).unwrap(), b"hdr\0");
    }

    #[test]
    fn read_only_mount_cannot_create() {
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
        let fs = KfsFs::mount(
            disk,
            MountConfig {
                read_only: true,
                ..MountConfig::default()
            },
        )
        .unwrap();
        assert!(matches!(ControlFile::open(&fs), Err(KfsError::ReadOnly)));
    }
}
