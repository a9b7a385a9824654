use kfs_types::{
    EXT4_SUPER_MAGIC, EXT4_SUPERBLOCK_SIZE, ParseError, ensure_slice,
    ext4_block_size_from_log, read_fixed, read_le_u16, read_le_u32, trim_nul_padded, write_bytes,
    write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

// ── ext4 feature flags ─────────────────────────────────────────────────────

/// ext4 compatible feature flags (`s_feature_compat`).
///
/// These are advisory; unknown bits are safe to ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4CompatFeatures(pub u32);

impl Ext4CompatFeatures {
    pub const DIR_PREALLOC: Self = Self(0x0001);
    pub const HAS_JOURNAL: Self = Self(0x0004);
    pub const EXT_ATTR: Self = Self(0x0008);
    pub const RESIZE_INODE: Self = Self(0x0010);
    pub const DIR_INDEX: Self = Self(0x0020);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "DIR_PREALLOC"),
        (0x0002, "IMAGIC_INODES"),
        (0x0004, "HAS_JOURNAL"),
        (0x0008, "EXT_ATTR"),
        (0x0010, "RESIZE_INODE"),
        (0x0020, "DIR_INDEX"),
        (0x0200, "SPARSE_SUPER2"),
        (0x0400, "FAST_COMMIT"),
        (0x0800, "STABLE_INODES"),
        (0x1000, "ORPHAN_FILE"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for Ext4CompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// ext4 incompatible feature flags (`s_feature_incompat`).
///
/// Any bit outside [`Ext4IncompatFeatures::SUPPORTED`] fails the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4IncompatFeatures(pub u32);

impl Ext4IncompatFeatures {
    pub const COMPRESSION: Self = Self(0x0001);
    pub const FILETYPE: Self = Self(0x0002);
    pub const RECOVER: Self = Self(0x0004);
    pub const JOURNAL_DEV: Self = Self(0x0008);
    pub const META_BG: Self = Self(0x0010);
    pub const EXTENTS: Self = Self(0x0040);
    pub const BIT64: Self = Self(0x0080);
    pub const MMP: Self = Self(0x0100);
    pub const FLEX_BG: Self = Self(0x0200);
    pub const INLINE_DATA: Self = Self(0x8000);

    /// Dentries must carry a file type byte.
    pub const REQUIRED: Self = Self(Self::FILETYPE.0);

    /// Everything the engine reads and writes correctly.
    pub const SUPPORTED: Self =
        Self(Self::FILETYPE.0 | Self::EXTENTS.0 | Self::BIT64.0 | Self::FLEX_BG.0);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "COMPRESSION"),
        (0x0002, "FILETYPE"),
        (0x0004, "RECOVER"),
        (0x0008, "JOURNAL_DEV"),
        (0x0010, "META_BG"),
        (0x0040, "EXTENTS"),
        (0x0080, "64BIT"),
        (0x0100, "MMP"),
        (0x0200, "FLEX_BG"),
        (0x0400, "EA_INODE"),
        (0x1000, "DIRDATA"),
        (0x2000, "CSUM_SEED"),
        (0x4000, "LARGEDIR"),
        (0x8000, "INLINE_DATA"),
        (0x1_0000, "ENCRYPT"),
        (0x2_0000, "CASEFOLD"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    /// Names of set bits the engine does not support.
    #[must_use]
    pub fn describe_unsupported(self) -> Vec<&'static str> {
        describe_flags(self.0 & !Self::SUPPORTED.0, Self::KNOWN)
    }
}

impl std::fmt::Display for Ext4IncompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// ext4 read-only compatible feature flags (`s_feature_ro_compat`).
///
/// The engine never computes checksums, so images carrying
/// `GDT_CSUM`/`METADATA_CSUM` may only be opened read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4RoCompatFeatures(pub u32);

impl Ext4RoCompatFeatures {
    pub const SPARSE_SUPER: Self = Self(0x0001);
    pub const LARGE_FILE: Self = Self(0x0002);
    pub const HUGE_FILE: Self = Self(0x0008);
    pub const GDT_CSUM: Self = Self(0x0010);
    pub const DIR_NLINK: Self = Self(0x0020);
    pub const EXTRA_ISIZE: Self = Self(0x0040);
    pub const METADATA_CSUM: Self = Self(0x0400);

    /// Bits that do not prevent read-write use.
    pub const WRITABLE: Self = Self(
        Self::SPARSE_SUPER.0
            | Self::LARGE_FILE.0
            | Self::HUGE_FILE.0
            | Self::DIR_NLINK.0
            | Self::EXTRA_ISIZE.0,
    );

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "SPARSE_SUPER"),
        (0x0002, "LARGE_FILE"),
        (0x0004, "BTREE_DIR"),
        (0x0008, "HUGE_FILE"),
        (0x0010, "GDT_CSUM"),
        (0x0020, "DIR_NLINK"),
        (0x0040, "EXTRA_ISIZE"),
        (0x0100, "QUOTA"),
        (0x0200, "BIGALLOC"),
        (0x0400, "METADATA_CSUM"),
        (0x1000, "READONLY"),
        (0x2000, "PROJECT"),
        (0x8000, "VERITY"),
        (0x1_0000, "ORPHAN_PRESENT"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    /// Names of set bits that force a read-only mount.
    #[must_use]
    pub fn describe_readonly_forcing(self) -> Vec<&'static str> {
        describe_flags(self.0 & !Self::WRITABLE.0, Self::KNOWN)
    }
}

impl std::fmt::Display for Ext4RoCompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

fn describe_flags(bits: u32, known: &[(u32, &'static str)]) -> Vec<&'static str> {
    known
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Format a bitmask as `FILETYPE|EXTENTS`, `(none)` when zero, unknown bits in hex.
fn format_flags(
    f: &mut std::fmt::Formatter<'_>,
    bits: u32,
    known: &[(u32, &'static str)],
) -> std::fmt::Result {
    if bits == 0 {
        return f.write_str("(none)");
    }
    let mut first = true;
    let mut remaining = bits;
    for &(bit, name) in known {
        if remaining & bit != 0 {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            remaining &= !bit;
            first = false;
        }
    }
    if remaining != 0 {
        if !first {
            f.write_str("|")?;
        }
        write!(f, "0x{remaining:X}")?;
    }
    Ok(())
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Value of `s_state` while mounted read-write.
pub const EXT4_STATE_ERRORS_CLEAR: u16 = 0x0001;
/// `s_rev_level` for dynamic inode sizes.
pub const EXT4_DYNAMIC_REV: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub reserved_blocks_count: u64,
    pub free_blocks_count: u64,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub block_size: u32,
    pub log_cluster_size: u32,
    pub blocks_per_group: u32,
    pub clusters_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_ino: u32,
    pub desc_size: u16,

    // ── Identity ─────────────────────────────────────────────────────────
    pub magic: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,

    // ── Revision & OS ────────────────────────────────────────────────────
    pub rev_level: u32,
    pub minor_rev_level: u16,
    pub creator_os: u32,

    // ── Features ─────────────────────────────────────────────────────────
    pub feature_compat: Ext4CompatFeatures,
    pub feature_incompat: Ext4IncompatFeatures,
    pub feature_ro_compat: Ext4RoCompatFeatures,

    // ── State ────────────────────────────────────────────────────────────
    pub state: u16,
    pub errors: u16,
    pub mnt_count: u16,
    pub max_mnt_count: i16,

    // ── Timestamps ───────────────────────────────────────────────────────
    pub mtime: u32,
    pub wtime: u32,
    pub lastcheck: u32,
    pub mkfs_time: u32,

    // ── Htree directory hashing ──────────────────────────────────────────
    pub hash_seed: [u32; 4],
    pub def_hash_version: u8,
    pub log_groups_per_flex: u8,
}

impl Ext4Superblock {
    /// Parse an ext4 superblock from a 1024-byte superblock region.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT4_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT4_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT4_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT4_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let blocks_lo = u64::from(read_le_u32(region, 0x04)?);
        let blocks_hi = u64::from(read_le_u32(region, 0x150)?);
        let r_blocks_lo = u64::from(read_le_u32(region, 0x08)?);
        let r_blocks_hi = u64::from(read_le_u32(region, 0x154)?);
        let free_blocks_lo = u64::from(read_le_u32(region, 0x0C)?);
        let free_blocks_hi = u64::from(read_le_u32(region, 0x158)?);

        let log_block_size = read_le_u32(region, 0x18)?;
        let Some(block_size) = ext4_block_size_from_log(log_block_size) else {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            });
        };

        let incompat = Ext4IncompatFeatures(read_le_u32(region, 0x60)?);
        let (blocks_hi, r_blocks_hi, free_blocks_hi) = if incompat.contains(Ext4IncompatFeatures::BIT64) {
            (blocks_hi, r_blocks_hi, free_blocks_hi)
        } else {
            (0, 0, 0)
        };

        #[allow(clippy::cast_possible_wrap)] // s_max_mnt_count is signed on disk
        let max_mnt_count = read_le_u16(region, 0x36)? as i16;

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: blocks_lo | (blocks_hi << 32),
            reserved_blocks_count: r_blocks_lo | (r_blocks_hi << 32),
            free_blocks_count: free_blocks_lo | (free_blocks_hi << 32),
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size,
            block_size,
            log_cluster_size: read_le_u32(region, 0x1C)?,
            blocks_per_group: read_le_u32(region, 0x20)?,
            clusters_per_group: read_le_u32(region, 0x24)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            inode_size: read_le_u16(region, 0x58)?,
            first_ino: read_le_u32(region, 0x54)?,
            desc_size: read_le_u16(region, 0xFE)?,

            magic,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),

            rev_level: read_le_u32(region, 0x4C)?,
            minor_rev_level: read_le_u16(region, 0x3E)?,
            creator_os: read_le_u32(region, 0x48)?,

            feature_compat: Ext4CompatFeatures(read_le_u32(region, 0x5C)?),
            feature_incompat: incompat,
            feature_ro_compat: Ext4RoCompatFeatures(read_le_u32(region, 0x64)?),

            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count,

            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            lastcheck: read_le_u32(region, 0x40)?,
            mkfs_time: read_le_u32(region, 0x108)?,

            hash_seed: [
                read_le_u32(region, 0xEC)?,
                read_le_u32(region, 0xF0)?,
                read_le_u32(region, 0xF4)?,
                read_le_u32(region, 0xF8)?,
            ],
            def_hash_version: ensure_slice(region, 0xFC, 1)?[0],
            log_groups_per_flex: ensure_slice(region, 0x174, 1)?[0],
        })
    }

    /// Encode every modelled field into `region`, leaving other bytes as they are.
    ///
    /// Unmount reads the current region from disk and calls this over it;
    /// the formatter starts from a zeroed region.
    #[allow(clippy::cast_possible_truncation)] // hi/lo splits of 64-bit counters
    pub fn encode_into(&self, region: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice(region, 0, EXT4_SUPERBLOCK_SIZE)?;
        write_le_u32(region, 0x00, self.inodes_count)?;
        write_le_u32(region, 0x04, self.blocks_count as u32)?;
        write_le_u32(region, 0x08, self.reserved_blocks_count as u32)?;
        write_le_u32(region, 0x0C, self.free_blocks_count as u32)?;
        write_le_u32(region, 0x10, self.free_inodes_count)?;
        write_le_u32(region, 0x14, self.first_data_block)?;
        write_le_u32(region, 0x18, self.log_block_size)?;
        write_le_u32(region, 0x1C, self.log_cluster_size)?;
        write_le_u32(region, 0x20, self.blocks_per_group)?;
        write_le_u32(region, 0x24, self.clusters_per_group)?;
        write_le_u32(region, 0x28, self.inodes_per_group)?;
        write_le_u32(region, 0x2C, self.mtime)?;
        write_le_u32(region, 0x30, self.wtime)?;
        write_le_u16(region, 0x34, self.mnt_count)?;
        #[allow(clippy::cast_sign_loss)]
        write_le_u16(region, 0x36, self.max_mnt_count as u16)?;
        write_le_u16(region, 0x38, self.magic)?;
        write_le_u16(region, 0x3A, self.state)?;
        write_le_u16(region, 0x3C, self.errors)?;
        write_le_u16(region, 0x3E, self.minor_rev_level)?;
        write_le_u32(region, 0x40, self.lastcheck)?;
        write_le_u32(region, 0x48, self.creator_os)?;
        write_le_u32(region, 0x4C, self.rev_level)?;
        write_le_u32(region, 0x54, self.first_ino)?;
        write_le_u16(region, 0x58, self.inode_size)?;
        write_le_u32(region, 0x5C, self.feature_compat.0)?;
        write_le_u32(region, 0x60, self.feature_incompat.0)?;
        write_le_u32(region, 0x64, self.feature_ro_compat.0)?;
        write_bytes(region, 0x68, &self.uuid)?;
        let mut name = [0_u8; 16];
        let bytes = self.volume_name.as_bytes();
        let n = bytes.len().min(16);
        name[..n].copy_from_slice(&bytes[..n]);
        write_bytes(region, 0x78, &name)?;
        for (i, word) in self.hash_seed.iter().enumerate() {
            write_le_u32(region, 0xEC + i * 4, *word)?;
        }
        region[0xFC] = self.def_hash_version;
        write_le_u16(region, 0xFE, self.desc_size)?;
        write_le_u32(region, 0x108, self.mkfs_time)?;
        if self.is_64bit() {
            write_le_u32(region, 0x150, (self.blocks_count >> 32) as u32)?;
            write_le_u32(region, 0x154, (self.reserved_blocks_count >> 32) as u32)?;
            write_le_u32(region, 0x158, (self.free_blocks_count >> 32) as u32)?;
        }
        region[0x174] = self.log_groups_per_flex;
        Ok(())
    }

    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.feature_incompat.contains(Ext4IncompatFeatures::BIT64)
    }

    #[must_use]
    pub fn group_desc_size(&self) -> u16 {
        if self.is_64bit() {
            self.desc_size.max(64)
        } else {
            32
        }
    }

    /// Number of block groups in this filesystem.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // ext4 group count is u32
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        let data_blocks = self
            .blocks_count
            .saturating_sub(u64::from(self.first_data_block));
        data_blocks.div_ceil(u64::from(self.blocks_per_group)) as u32
    }

    /// First block of the group descriptor table.
    #[must_use]
    pub fn gdt_block(&self) -> u64 {
        u64::from(self.first_data_block) + 1
    }

    /// Blocks occupied by the group descriptor table.
    #[must_use]
    pub fn gdt_blocks(&self) -> u64 {
        (u64::from(self.groups_count()) * u64::from(self.group_desc_size()))
            .div_ceil(u64::from(self.block_size))
    }

    /// Validate geometry fields and their cross-field layout.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if !self.block_size.is_power_of_two() || !(1024..=65536).contains(&self.block_size) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        if self.blocks_per_group > self.block_size.saturating_mul(8) {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "exceeds block_size * 8 (block bitmap capacity)",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inodes_per_group > self.block_size.saturating_mul(8) {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "exceeds block_size * 8 (inode bitmap capacity)",
            });
        }
        if self.inode_size < 128 || !self.inode_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two >= 128",
            });
        }
        if u32::from(self.inode_size) > self.block_size {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "inode_size exceeds block_size",
            });
        }
        if self.is_64bit() && self.desc_size < 64 {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "64BIT feature set but desc_size < 64",
            });
        }
        let expected_first = u32::from(self.block_size == 1024);
        if self.first_data_block != expected_first {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 1 for 1K blocks and 0 otherwise",
            });
        }
        if u64::from(self.first_data_block) >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "first_data_block >= blocks_count",
            });
        }
        let max_inodes = u64::from(self.groups_count()) * u64::from(self.inodes_per_group);
        if u64::from(self.inodes_count) > max_inodes {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "inodes_count exceeds groups * inodes_per_group",
            });
        }
        if self.rev_level >= EXT4_DYNAMIC_REV && self.first_ino < 3 {
            return Err(ParseError::InvalidField {
                field: "s_first_ino",
                reason: "first non-reserved inode must follow the root inode",
            });
        }
        Ok(())
    }

    /// Validate incompat features. Callers map failures to `UnsupportedFeature`.
    pub fn validate_features(&self) -> Result<(), ParseError> {
        let incompat = self.feature_incompat.0;
        if incompat & Ext4IncompatFeatures::REQUIRED.0 != Ext4IncompatFeatures::REQUIRED.0 {
            return Err(ParseError::InvalidField {
                field: "feature_incompat",
                reason: "missing required feature FILETYPE",
            });
        }
        if incompat & !Ext4IncompatFeatures::SUPPORTED.0 != 0 {
            return Err(ParseError::InvalidField {
                field: "feature_incompat",
                reason: "unsupported incompatible features present",
            });
        }
        Ok(())
    }

    /// Whether ro_compat bits allow read-write use.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.feature_ro_compat.0 & !Ext4RoCompatFeatures::WRITABLE.0 == 0
    }

    /// Effective inode size in bytes (128 for revision 0 images).
    #[must_use]
    pub fn effective_inode_size(&self) -> u16 {
        if self.rev_level == 0 { 128 } else { self.inode_size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_region() -> [u8; EXT4_SUPERBLOCK_SIZE] {
        let mut sb = [0_u8; EXT4_SUPERBLOCK_SIZE];
        write_le_u32(&mut sb, 0x00, 2048).unwrap(); // inodes_count
        write_le_u32(&mut sb, 0x04, 8192).unwrap(); // blocks_count
        write_le_u32(&mut sb, 0x0C, 7000).unwrap();
        write_le_u32(&mut sb, 0x10, 2037).unwrap();
        write_le_u32(&mut sb, 0x14, 0).unwrap();
        write_le_u32(&mut sb, 0x18, 2).unwrap(); // 4K
        write_le_u32(&mut sb, 0x20, 32_768).unwrap();
        write_le_u32(&mut sb, 0x24, 32_768).unwrap();
        write_le_u32(&mut sb, 0x28, 2048).unwrap();
        write_le_u16(&mut sb, 0x38, EXT4_SUPER_MAGIC).unwrap();
        write_le_u32(&mut sb, 0x4C, 1).unwrap();
        write_le_u32(&mut sb, 0x54, 11).unwrap();
        write_le_u16(&mut sb, 0x58, 256).unwrap();
        write_le_u32(&mut sb, 0x60, 0x0042).unwrap(); // FILETYPE|EXTENTS
        sb[0x78..0x7B].copy_from_slice(b"kfs");
        sb
    }

    #[test]
    fn parse_and_validate_sample() {
        let sb = Ext4Superblock::parse_superblock_region(&sample_region()).unwrap();
        assert_eq!(sb.block_size, 4096);
        assert_eq!(sb.groups_count(), 1);
        assert_eq!(sb.group_desc_size(), 32);
        assert_eq!(sb.volume_name, "kfs");
        assert_eq!(sb.gdt_block(), 1);
        sb.validate_geometry().unwrap();
        sb.validate_features().unwrap();
        assert!(sb.is_writable());
    }

    #[test]
    fn bad_magic_rejected() {
        let mut region = sample_region();
        region[0x38] = 0;
        assert!(matches!(
            Ext4Superblock::parse_superblock_region(&region),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn encode_preserves_unmodelled_bytes() {
        let mut region = sample_region();
        region[0x200] = 0x5A; // outside every modelled field
        let mut sb = Ext4Superblock::parse_superblock_region(&region).unwrap();
        sb.mnt_count = 7;
        sb.free_blocks_count = 123;
        sb.encode_into(&mut region).unwrap();
        assert_eq!(region[0x200], 0x5A);
        let back = Ext4Superblock::parse_superblock_region(&region).unwrap();
        assert_eq!(back, sb);
    }

    #[test]
    fn unsupported_incompat_rejected() {
        let mut region = sample_region();
        write_le_u32(&mut region, 0x60, 0x0042 | 0x8000).unwrap(); // INLINE_DATA
        let sb = Ext4Superblock::parse_superblock_region(&region).unwrap();
        assert!(sb.validate_features().is_err());
        assert_eq!(sb.feature_incompat.describe_unsupported(), vec!["INLINE_DATA"]);
        assert_eq!(
            sb.feature_incompat.to_string(),
            "FILETYPE|EXTENTS|INLINE_DATA"
        );
    }

    #[test]
    fn metadata_csum_forces_read_only() {
        let mut region = sample_region();
        write_le_u32(&mut region, 0x64, 0x0400 | 0x0001).unwrap();
        let sb = Ext4Superblock::parse_superblock_region(&region).unwrap();
        assert!(!sb.is_writable());
        assert_eq!(
            sb.feature_ro_compat.describe_readonly_forcing(),
            vec!["METADATA_CSUM"]
        );
    }

    #[test]
    fn geometry_checks() {
        let mut region = sample_region();
        write_le_u32(&mut region, 0x28, 0).unwrap();
        let sb = Ext4Superblock::parse_superblock_region(&region).unwrap();
        assert!(matches!(
            sb.validate_geometry(),
            Err(ParseError::InvalidField { field: "s_inodes_per_group", .. })
        ));

        let mut region = sample_region();
        write_le_u32(&mut region, 0x14, 1).unwrap();
        let sb = Ext4Superblock::parse_superblock_region(&region).unwrap();
        assert!(sb.validate_geometry().is_err());
    }
}
