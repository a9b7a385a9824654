use kfs_types::{
    EXT4_EXTENTS_FL, EXT4_HUGE_FILE_FL, EXT4_INDEX_FL, EXT4_N_BLOCKS_BYTES, ParseError, S_IFDIR,
    S_IFLNK, S_IFMT, S_IFREG, read_fixed, read_le_u16, read_le_u32, write_bytes, write_le_u16,
    write_le_u32,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Extra inode bytes the engine initializes on fresh 256-byte inodes.
pub const EXT4_GOOD_EXTRA_ISIZE: u16 = 32;

/// A decoded ext4 inode.
///
/// `raw` keeps the original record so that [`Ext4Inode::to_bytes`] only
/// rewrites the fields modelled here; inline xattrs, checksums and project
/// ids pass through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ext4Inode {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links_count: u16,
    /// `i_blocks` as stored (sectors, or fs blocks when HUGE_FILE is set).
    pub blocks: u64,
    pub flags: u32,
    pub generation: u32,
    pub file_acl: u64,

    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,

    pub extra_isize: u16,
    pub atime_extra: u32,
    pub ctime_extra: u32,
    pub mtime_extra: u32,
    pub crtime: u32,
    pub crtime_extra: u32,

    /// The 60-byte `i_block` area: extent root, block map or fast symlink.
    pub block: [u8; EXT4_N_BLOCKS_BYTES],

    raw: Vec<u8>,
}

impl Ext4Inode {
    /// A zeroed inode record of `inode_size` bytes.
    #[must_use]
    pub fn zeroed(inode_size: u16) -> Self {
        let extra_isize = if inode_size > 128 {
            EXT4_GOOD_EXTRA_ISIZE
        } else {
            0
        };
        let mut raw = vec![0_u8; usize::from(inode_size.max(128))];
        if extra_isize > 0 {
            raw[0x80..0x82].copy_from_slice(&extra_isize.to_le_bytes());
        }
        Self {
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            links_count: 0,
            blocks: 0,
            flags: 0,
            generation: 0,
            file_acl: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            dtime: 0,
            extra_isize,
            atime_extra: 0,
            ctime_extra: 0,
            mtime_extra: 0,
            crtime: 0,
            crtime_extra: 0,
            block: [0; EXT4_N_BLOCKS_BYTES],
            raw,
        }
    }

    /// Parse an ext4 inode from raw bytes (at least 128).
    #[allow(clippy::similar_names)]
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < 128 {
            return Err(ParseError::InsufficientData {
                needed: 128,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let uid_lo = u32::from(read_le_u16(bytes, 0x02)?);
        let gid_lo = u32::from(read_le_u16(bytes, 0x18)?);
        let uid_hi = u32::from(read_le_u16(bytes, 0x78)?);
        let gid_hi = u32::from(read_le_u16(bytes, 0x7A)?);
        let size_lo = u64::from(read_le_u32(bytes, 0x04)?);
        let size_hi = u64::from(read_le_u32(bytes, 0x6C)?);
        let blocks_lo = u64::from(read_le_u32(bytes, 0x1C)?);
        let blocks_hi = u64::from(read_le_u16(bytes, 0x74)?);
        let acl_lo = u64::from(read_le_u32(bytes, 0x68)?);
        let acl_hi = u64::from(read_le_u16(bytes, 0x76)?);

        let extra_isize = if bytes.len() > 0x82 {
            read_le_u16(bytes, 0x80)?
        } else {
            0
        };
        let extra_end = 128 + usize::from(extra_isize);
        let extra = |end: usize, off: usize| -> Result<u32, ParseError> {
            if extra_end >= end && bytes.len() >= end {
                read_le_u32(bytes, off)
            } else {
                Ok(0)
            }
        };

        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            uid: uid_lo | (uid_hi << 16),
            gid: gid_lo | (gid_hi << 16),
            size: size_lo | (size_hi << 32),
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: blocks_lo | (blocks_hi << 32),
            flags: read_le_u32(bytes, 0x20)?,
            generation: read_le_u32(bytes, 0x64)?,
            file_acl: acl_lo | (acl_hi << 32),
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            extra_isize,
            ctime_extra: extra(0x88, 0x84)?,
            mtime_extra: extra(0x8C, 0x88)?,
            atime_extra: extra(0x90, 0x8C)?,
            crtime: extra(0x94, 0x90)?,
            crtime_extra: extra(0x98, 0x94)?,
            block: read_fixed::<EXT4_N_BLOCKS_BYTES>(bytes, 0x28)?,
            raw: bytes.to_vec(),
        })
    }

    /// Encode back to an on-disk record of the original length.
    #[allow(clippy::cast_possible_truncation)] // lo/hi splits
    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = self.raw.clone();
        let buf = out.as_mut_slice();
        write_le_u16(buf, 0x00, self.mode)?;
        write_le_u16(buf, 0x02, self.uid as u16)?;
        write_le_u32(buf, 0x04, self.size as u32)?;
        write_le_u32(buf, 0x08, self.atime)?;
        write_le_u32(buf, 0x0C, self.ctime)?;
        write_le_u32(buf, 0x10, self.mtime)?;
        write_le_u32(buf, 0x14, self.dtime)?;
        write_le_u16(buf, 0x18, self.gid as u16)?;
        write_le_u16(buf, 0x1A, self.links_count)?;
        write_le_u32(buf, 0x1C, self.blocks as u32)?;
        write_le_u32(buf, 0x20, self.flags)?;
        write_bytes(buf, 0x28, &self.block)?;
        write_le_u32(buf, 0x64, self.generation)?;
        write_le_u32(buf, 0x68, self.file_acl as u32)?;
        write_le_u32(buf, 0x6C, (self.size >> 32) as u32)?;
        write_le_u16(buf, 0x74, (self.blocks >> 32) as u16)?;
        write_le_u16(buf, 0x76, (self.file_acl >> 32) as u16)?;
        write_le_u16(buf, 0x78, (self.uid >> 16) as u16)?;
        write_le_u16(buf, 0x7A, (self.gid >> 16) as u16)?;
        if buf.len() >= 128 + usize::from(self.extra_isize) && self.extra_isize > 0 {
            write_le_u16(buf, 0x80, self.extra_isize)?;
            let extra_end = 128 + usize::from(self.extra_isize);
            for (end, off, val) in [
                (0x88, 0x84, self.ctime_extra),
                (0x8C, 0x88, self.mtime_extra),
                (0x90, 0x8C, self.atime_extra),
                (0x94, 0x90, self.crtime),
                (0x98, 0x94, self.crtime_extra),
            ] {
                if extra_end >= end {
                    write_le_u32(buf, off, val)?;
                }
            }
        }
        Ok(out)
    }

    // ── Flags and type ──────────────────────────────────────────────────

    #[must_use]
    pub fn uses_extents(&self) -> bool {
        (self.flags & EXT4_EXTENTS_FL) != 0
    }

    #[must_use]
    pub fn is_huge_file(&self) -> bool {
        (self.flags & EXT4_HUGE_FILE_FL) != 0
    }

    /// Hash-indexed directories are read as linear ones; the htree nodes
    /// look like empty dentry blocks to a linear scan.
    #[must_use]
    pub fn has_htree_index(&self) -> bool {
        (self.flags & EXT4_INDEX_FL) != 0
    }

    #[must_use]
    pub fn file_type_mode(&self) -> u16 {
        self.mode & S_IFMT
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type_mode() == S_IFREG
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type_mode() == S_IFDIR
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type_mode() == S_IFLNK
    }

    /// Permission bits (lower 12 bits of mode).
    #[must_use]
    pub fn permission_bits(&self) -> u16 {
        self.mode & 0o7777
    }

    /// A symlink whose target lives inside `i_block` rather than a data block.
    #[must_use]
    pub fn is_fast_symlink(&self) -> bool {
        self.is_symlink()
            && !self.uses_extents()
            && self.blocks == 0
            && self.size < EXT4_N_BLOCKS_BYTES as u64
    }

    #[must_use]
    pub fn fast_symlink_target(&self) -> Option<&[u8]> {
        if !self.is_fast_symlink() {
            return None;
        }
        let len = usize::try_from(self.size).ok()?;
        self.block.get(..len)
    }

    /// Allocated space in bytes-per-512 sectors as reported by `stat`.
    #[must_use]
    pub fn sectors(&self, block_size: u32) -> u64 {
        if self.is_huge_file() {
            self.blocks.saturating_mul(u64::from(block_size / 512))
        } else {
            self.blocks
        }
    }

    // ── Timestamps ──────────────────────────────────────────────────────

    #[allow(clippy::cast_possible_wrap)] // the kernel reads the base as signed
    fn timestamp(base: u32, extra: u32) -> SystemTime {
        let secs = i64::from(base as i32) + (i64::from(extra & 0x3) << 32);
        let nsec = extra >> 2;
        let t = if secs >= 0 {
            u64::try_from(secs)
                .ok()
                .and_then(|s| UNIX_EPOCH.checked_add(Duration::new(s, nsec)))
        } else {
            secs.checked_neg()
                .and_then(|abs| u64::try_from(abs).ok())
                .and_then(|abs| UNIX_EPOCH.checked_sub(Duration::new(abs, 0)))
                .and_then(|t| t.checked_add(Duration::new(0, nsec)))
        };
        t.unwrap_or(UNIX_EPOCH)
    }

    /// Split a `SystemTime` into `(base, extra)`; pre-1970 clamps to the epoch.
    #[allow(clippy::cast_possible_truncation)] // low 32 bits + 2 epoch bits
    #[must_use]
    pub fn encode_time(t: SystemTime) -> (u32, u32) {
        let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        let secs = d.as_secs();
        let base = secs as u32;
        let epoch = ((secs >> 32) & 0x3) as u32;
        (base, (d.subsec_nanos() << 2) | epoch)
    }

    #[must_use]
    pub fn atime_system_time(&self) -> SystemTime {
        Self::timestamp(self.atime, self.atime_extra)
    }

    #[must_use]
    pub fn mtime_system_time(&self) -> SystemTime {
        Self::timestamp(self.mtime, self.mtime_extra)
    }

    #[must_use]
    pub fn ctime_system_time(&self) -> SystemTime {
        Self::timestamp(self.ctime, self.ctime_extra)
    }

    #[must_use]
    pub fn crtime_system_time(&self) -> SystemTime {
        Self::timestamp(self.crtime, self.crtime_extra)
    }

    pub fn set_atime(&mut self, t: SystemTime) {
        (self.atime, self.atime_extra) = Self::encode_time(t);
    }

    pub fn set_mtime(&mut self, t: SystemTime) {
        (self.mtime, self.mtime_extra) = Self::encode_time(t);
    }

    pub fn set_ctime(&mut self, t: SystemTime) {
        (self.ctime, self.ctime_extra) = Self::encode_time(t);
    }

    pub fn set_crtime(&mut self, t: SystemTime) {
        (self.crtime, self.crtime_extra) = Self::encode_time(t);
    }
}
