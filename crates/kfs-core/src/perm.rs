//! Owner/group/other permission checks.

use std::ops::BitOr;

use kfs_error::{KfsError, Result};
use kfs_ondisk::Ext4Inode;
use serde::{Deserialize, Serialize};

/// Identity of the process issuing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestCtx {
    pub uid: u32,
    pub gid: u32,
}

impl RequestCtx {
    #[must_use]
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    #[must_use]
    pub const fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// `access(2)`-style mask: any combination of read, write and execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AccessMask(pub u32);

impl AccessMask {
    /// Existence only (`F_OK`).
    pub const EXISTS: Self = Self(0);
    pub const EXEC: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const READ: Self = Self(4);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The mask implied by `open(2)` flags.
    #[must_use]
    pub fn from_open_flags(flags: i32) -> Self {
        let mut mask = match flags & O_ACCMODE {
            0 => Self::READ,
            1 => Self::WRITE,
            _ => Self::READ | Self::WRITE,
        };
        if flags & O_TRUNC != 0 {
            mask = mask | Self::WRITE;
        }
        mask
    }
}

const O_ACCMODE: i32 = 0o3;
const O_TRUNC: i32 = 0o1000;

impl BitOr for AccessMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Grant or deny `mask` on `inode` for `ctx`.
///
/// Root passes every check except execute on a non-directory without any
/// execute bit set.
pub(crate) fn check_access(ctx: &RequestCtx, inode: &Ext4Inode, mask: AccessMask) -> Result<()> {
    let mode = u32::from(inode.permission_bits());
    if ctx.is_root() {
        if mask.contains(AccessMask::EXEC) && !inode.is_dir() && mode & 0o111 == 0 {
            return Err(KfsError::PermissionDenied);
        }
        return Ok(());
    }
    let granted = if ctx.uid == inode.uid {
        (mode >> 6) & 0o7
    } else if ctx.gid == inode.gid {
        (mode >> 3) & 0o7
    } else {
        mode & 0o7
    };
    if granted & mask.0 == mask.0 {
        Ok(())
    } else {
        Err(KfsError::PermissionDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfs_types::{S_IFDIR, S_IFREG};

    fn inode(mode: u16, uid: u32, gid: u32) -> Ext4Inode {
        let mut inode = Ext4Inode::zeroed(256);
        inode.mode = mode;
        inode.uid = uid;
        inode.gid = gid;
        inode
    }

    #[test]
    fn owner_group_other_classes() {
        let file = inode(S_IFREG | 0o640, 1000, 100);
        let owner = RequestCtx::new(1000, 1);
        let member = RequestCtx::new(2000, 100);
        let stranger = RequestCtx::new(3000, 300);

        assert!(check_access(&owner, &file, AccessMask::READ | AccessMask::WRITE).is_ok());
        assert!(check_access(&member, &file, AccessMask::READ).is_ok());
        assert!(matches!(
            check_access(&member, &file, AccessMask::WRITE),
            Err(KfsError::PermissionDenied)
        ));
        assert!(check_access(&stranger, &file, AccessMask::READ).is_err());
        assert!(check_access(&stranger, &file, AccessMask::EXISTS).is_ok());
    }

    #[test]
    fn root_bypasses_except_exec_without_x() {
        let root = RequestCtx::root();
        let file = inode(S_IFREG, 1000, 100);
        assert!(check_access(&root, &file, AccessMask::READ | AccessMask::WRITE).is_ok());
        assert!(check_access(&root, &file, AccessMask::EXEC).is_err());

        let script = inode(S_IFREG | 0o001, 1000, 100);
        assert!(check_access(&root, &script, AccessMask::EXEC).is_ok());

        let dir = inode(S_IFDIR, 1000, 100);
        assert!(check_access(&root, &dir, AccessMask::EXEC).is_ok());
    }

    #[test]
    fn open_flags_to_mask() {
        assert_eq!(AccessMask::from_open_flags(0), AccessMask::READ);
        assert_eq!(AccessMask::from_open_flags(1), AccessMask::WRITE);
        assert_eq!(
            AccessMask::from_open_flags(2),
            AccessMask::READ | AccessMask::WRITE
        );
        assert_eq!(
            AccessMask::from_open_flags(O_TRUNC),
            AccessMask::READ | AccessMask::WRITE
        );
    }
}
