//! Image formatter.
//!
//! Lays down an empty filesystem: superblock (plus sparse backups), one
//! descriptor table, per-group bitmaps and inode tables, the root directory
//! and `lost+found`. There are no reserved GDT blocks, no journal and no
//! checksums.

use kfs_alloc::{FsGeometry, bitmap_set, reserved_blocks_in_group};
use kfs_block::{Disk, write_superblock_region};
use kfs_dir::{Directory, StagingBlock};
use kfs_error::{KfsError, Result};
use kfs_inode::{InodeCache, InodeLayout};
use kfs_ondisk::superblock::{EXT4_DYNAMIC_REV, EXT4_STATE_ERRORS_CLEAR};
use kfs_ondisk::{
    Ext4CompatFeatures, Ext4FileType, Ext4GroupDesc, Ext4IncompatFeatures, Ext4RoCompatFeatures,
    Ext4Superblock, init_dir_block,
};
use kfs_types::{
    BlockNumber, BlockSize, ByteOffset, EXT4_DEFAULT_INODE_SIZE, EXT4_GOOD_OLD_FIRST_INO,
    EXT4_SUPER_MAGIC, EXT4_SUPERBLOCK_SIZE, GroupNumber, InodeNumber, S_IFDIR, u64_to_u32,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Layout choices for [`format`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    /// 1024, 2048 or 4096.
    pub block_size: u32,
    /// Defaults to 8192, clamped to what one bitmap block can track.
    pub inodes_per_group: Option<u32>,
    pub inode_size: u16,
    /// 64-byte descriptors and 64-bit block counts.
    pub bit64: bool,
    /// Share of blocks kept back for root.
    pub reserved_percent: u8,
    pub volume_name: String,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            inodes_per_group: None,
            inode_size: EXT4_DEFAULT_INODE_SIZE,
            bit64: false,
            reserved_percent: 5,
            volume_name: String::new(),
        }
    }
}

/// What [`format`] produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatSummary {
    pub block_size: u32,
    pub blocks_count: u64,
    pub groups: u32,
    pub inodes_count: u32,
    pub inodes_per_group: u32,
    pub inode_table_blocks: u64,
    pub free_blocks: u64,
    pub free_inodes: u32,
    pub uuid: String,
    pub volume_name: String,
}

const DEFAULT_INODES_PER_GROUP: u32 = 8192;
/// Data blocks the first group must hold beyond its metadata: the root
/// directory and `lost+found`.
const GROUP0_DATA_BLOCKS: u64 = 2;

fn invalid(reason: impl Into<String>) -> KfsError {
    KfsError::InvalidGeometry(reason.into())
}

/// Inodes per group: the requested or default count, limited so the inode
/// table takes at most a quarter of `group_blocks`, rounded down to whole
/// inode-table blocks and bitmap bytes.
fn pick_inodes_per_group(opts: &FormatOptions, group_blocks: u64) -> Result<u32> {
    let bs = u64::from(opts.block_size);
    let isz = u64::from(opts.inode_size);
    let per_block = bs / isz;
    let align = per_block.max(8);
    let wanted = u64::from(opts.inodes_per_group.unwrap_or(DEFAULT_INODES_PER_GROUP));
    let table_cap = (group_blocks / 4) * per_block;
    let ipg = wanted.min(bs * 8).min(table_cap) / align * align;
    if ipg == 0 {
        return Err(invalid("image too small for an inode table"));
    }
    Ok(u64_to_u32(ipg, "inodes_per_group")?)
}

fn blank_superblock(opts: &FormatOptions, blocks: u64, ipg: u32, groups: u32) -> Result<Ext4Superblock> {
    let bs = opts.block_size;
    let log = bs.trailing_zeros() - 10;
    let mut rng = rand::thread_rng();
    let mut uuid: [u8; 16] = rng.r#gen();
    uuid[6] = (uuid[6] & 0x0F) | 0x40;
    uuid[8] = (uuid[8] & 0x3F) | 0x80;
    let now = crate::mount::now_secs();

    let mut incompat = Ext4IncompatFeatures::FILETYPE.0 | Ext4IncompatFeatures::EXTENTS.0;
    if opts.bit64 {
        incompat |= Ext4IncompatFeatures::BIT64.0;
    }
    Ok(Ext4Superblock {
        inodes_count: ipg
            .checked_mul(groups)
            .ok_or_else(|| invalid("inode count overflows 32 bits"))?,
        blocks_count: blocks,
        reserved_blocks_count: blocks * u64::from(opts.reserved_percent.min(50)) / 100,
        free_blocks_count: 0,
        free_inodes_count: 0,
        first_data_block: u32::from(bs == 1024),
        log_block_size: log,
        block_size: bs,
        log_cluster_size: log,
        blocks_per_group: bs * 8,
        clusters_per_group: bs * 8,
        inodes_per_group: ipg,
        inode_size: opts.inode_size,
        first_ino: EXT4_GOOD_OLD_FIRST_INO,
        desc_size: if opts.bit64 { 64 } else { 32 },
        magic: EXT4_SUPER_MAGIC,
        uuid,
        volume_name: opts.volume_name.chars().take(16).collect(),
        rev_level: EXT4_DYNAMIC_REV,
        minor_rev_level: 0,
        creator_os: 0,
        feature_compat: Ext4CompatFeatures(0),
        feature_incompat: Ext4IncompatFeatures(incompat),
        feature_ro_compat: Ext4RoCompatFeatures(
            Ext4RoCompatFeatures::SPARSE_SUPER.0 | Ext4RoCompatFeatures::LARGE_FILE.0,
        ),
        state: EXT4_STATE_ERRORS_CLEAR,
        errors: 1,
        mnt_count: 0,
        max_mnt_count: -1,
        mtime: 0,
        wtime: now,
        lastcheck: now,
        mkfs_time: now,
        hash_seed: [rng.r#gen(), rng.r#gen(), rng.r#gen(), rng.r#gen()],
        def_hash_version: 1,
        log_groups_per_flex: 0,
    })
}

/// Blocks at the start of `group` taken by metadata.
fn group_overhead(geo: &FsGeometry, group: GroupNumber) -> u64 {
    let gdt = (u64::from(geo.group_count) * u64::from(geo.desc_size))
        .div_ceil(u64::from(geo.block_size));
    let backup = if geo.has_super(group) { 1 + gdt } else { 0 };
    backup + 2 + geo.inode_table_blocks()
}

/// Choose a geometry for a device of `len` bytes. A trailing group too
/// short for its own metadata is cut off.
fn plan(opts: &FormatOptions, len: u64) -> Result<(Ext4Superblock, FsGeometry)> {
    if !matches!(opts.block_size, 1024 | 2048 | 4096) {
        return Err(invalid(format!("unsupported block size {}", opts.block_size)));
    }
    if opts.inode_size < 128
        || !opts.inode_size.is_power_of_two()
        || u32::from(opts.inode_size) > opts.block_size
    {
        return Err(invalid(format!("unsupported inode size {}", opts.inode_size)));
    }
    let bs = u64::from(opts.block_size);
    let first = u64::from(opts.block_size == 1024);
    let mut blocks = len / bs;
    if !opts.bit64 {
        blocks = blocks.min(u64::from(u32::MAX));
    }
    let bpg = bs * 8;

    loop {
        if blocks <= first {
            return Err(invalid("image too small"));
        }
        let groups = u64_to_u32((blocks - first).div_ceil(bpg), "group count")?;
        let ipg = pick_inodes_per_group(opts, (blocks - first).min(bpg))?;
        let sb = blank_superblock(opts, blocks, ipg, groups)?;
        let geo = FsGeometry::from_superblock(&sb);

        let last = GroupNumber(groups - 1);
        let last_len = u64::from(geo.blocks_in_group(last));
        let mut needed = group_overhead(&geo, last) + 1;
        if groups == 1 {
            needed += GROUP0_DATA_BLOCKS;
        }
        if last_len >= needed {
            if sb.inodes_count <= EXT4_GOOD_OLD_FIRST_INO {
                return Err(invalid("image too small for the reserved inodes"));
            }
            return Ok((sb, geo));
        }
        if groups == 1 {
            return Err(invalid("image too small for group metadata"));
        }
        debug!(dropped = last_len, "trailing group too short, trimming");
        blocks -= last_len;
    }
}

fn descriptor(geo: &FsGeometry, group: GroupNumber) -> Ext4GroupDesc {
    let start = geo.group_block_to_absolute(group, 0).0;
    let meta = start + group_overhead(geo, group) - 2 - geo.inode_table_blocks();
    let used = group_overhead(geo, group) + if group.0 == 0 { GROUP0_DATA_BLOCKS } else { 0 };
    let reserved_inodes = if group.0 == 0 { EXT4_GOOD_OLD_FIRST_INO } else { 0 };
    #[allow(clippy::cast_possible_truncation)] // bounded by blocks_per_group
    Ext4GroupDesc {
        block_bitmap: meta,
        inode_bitmap: meta + 1,
        inode_table: meta + 2,
        free_blocks_count: u64::from(geo.blocks_in_group(group)).saturating_sub(used) as u32,
        free_inodes_count: geo.inodes_in_group(group).saturating_sub(reserved_inodes),
        used_dirs_count: if group.0 == 0 { 2 } else { 0 },
        itable_unused: 0,
        flags: 0,
        checksum: 0,
    }
}

/// Block bitmap with metadata, padding and (in group 0) the two initial
/// directory blocks marked used.
fn block_bitmap(geo: &FsGeometry, desc: &Ext4GroupDesc, group: GroupNumber) -> Vec<u8> {
    let mut bitmap = vec![0_u8; geo.bitmap_len()];
    for rel in reserved_blocks_in_group(geo, desc, group) {
        bitmap_set(&mut bitmap, rel);
    }
    if group.0 == 0 {
        #[allow(clippy::cast_possible_truncation)]
        let data = group_overhead(geo, group) as u32;
        bitmap_set(&mut bitmap, data);
        bitmap_set(&mut bitmap, data + 1);
    }
    #[allow(clippy::cast_possible_truncation)]
    let bits = (geo.bitmap_len() * 8) as u32;
    for rel in geo.blocks_in_group(group)..bits {
        bitmap_set(&mut bitmap, rel);
    }
    bitmap
}

fn inode_bitmap(geo: &FsGeometry, group: GroupNumber) -> Vec<u8> {
    let mut bitmap = vec![0_u8; geo.bitmap_len()];
    if group.0 == 0 {
        for idx in 0..EXT4_GOOD_OLD_FIRST_INO {
            bitmap_set(&mut bitmap, idx);
        }
    }
    #[allow(clippy::cast_possible_truncation)]
    let bits = (geo.bitmap_len() * 8) as u32;
    for idx in geo.inodes_in_group(group)..bits {
        bitmap_set(&mut bitmap, idx);
    }
    bitmap
}

/// Format the whole of `disk`, whose block size must match the options.
pub fn format(disk: &Disk, opts: &FormatOptions) -> Result<FormatSummary> {
    let block_size = BlockSize::new(opts.block_size)
        .map_err(|e| invalid(format!("block size {}: {e}", opts.block_size)))?;
    if disk.block_size() != block_size {
        return Err(KfsError::InvalidArgument(format!(
            "device opened with {} byte blocks, formatting with {}",
            disk.block_size(),
            opts.block_size
        )));
    }
    let (mut sb, geo) = plan(opts, disk.len_bytes())?;
    let bs = u64::from(opts.block_size);
    info!(
        blocks = sb.blocks_count,
        groups = geo.group_count,
        inodes_per_group = sb.inodes_per_group,
        block_size = opts.block_size,
        "formatting"
    );

    disk.write_at(ByteOffset::ZERO, &[0_u8; 1024])?;

    let groups: Vec<GroupNumber> = (0..geo.group_count).map(GroupNumber).collect();
    let descs: Vec<Ext4GroupDesc> = groups.iter().map(|&g| descriptor(&geo, g)).collect();
    for (&group, desc) in groups.iter().zip(&descs) {
        disk.write_blocks(BlockNumber(desc.block_bitmap), &block_bitmap(&geo, desc, group))?;
        disk.write_blocks(BlockNumber(desc.inode_bitmap), &inode_bitmap(&geo, group))?;
        disk.zero_blocks(BlockNumber(desc.inode_table), geo.inode_table_blocks())?;
        log_group(group, desc);
    }

    sb.free_blocks_count = descs.iter().map(|d| u64::from(d.free_blocks_count)).sum();
    sb.free_inodes_count = descs.iter().map(|d| d.free_inodes_count).sum();

    let desc_size = usize::from(geo.desc_size);
    let gdt_blocks = u64_to_u32(sb.gdt_blocks(), "gdt blocks")?;
    let mut gdt = vec![0_u8; gdt_blocks as usize * block_size.as_usize()];
    for (idx, desc) in descs.iter().enumerate() {
        desc.encode_into(&mut gdt[idx * desc_size..], geo.desc_size)?;
    }
    let mut region = [0_u8; EXT4_SUPERBLOCK_SIZE];
    sb.encode_into(&mut region)?;

    for &group in &groups {
        if !geo.has_super(group) {
            continue;
        }
        let start = geo.group_block_to_absolute(group, 0);
        if group.0 == 0 {
            write_superblock_region(disk, &region)?;
            disk.write_blocks(BlockNumber(sb.gdt_block()), &gdt)?;
        } else {
            let mut backup = region;
            #[allow(clippy::cast_possible_truncation)] // group numbers in backups are 16-bit
            backup[0x5A..0x5C].copy_from_slice(&(group.0 as u16).to_le_bytes());
            disk.write_at(ByteOffset(start.0 * bs), &backup)?;
            disk.write_blocks(BlockNumber(start.0 + 1), &gdt)?;
        }
    }

    create_root_dirs(disk, &sb, &geo, &descs)?;
    disk.sync()?;

    let summary = FormatSummary {
        block_size: opts.block_size,
        blocks_count: sb.blocks_count,
        groups: geo.group_count,
        inodes_count: sb.inodes_count,
        inodes_per_group: sb.inodes_per_group,
        inode_table_blocks: geo.inode_table_blocks(),
        free_blocks: sb.free_blocks_count,
        free_inodes: sb.free_inodes_count,
        uuid: format_uuid(&sb.uuid),
        volume_name: sb.volume_name.clone(),
    };
    info!(uuid = %summary.uuid, free_blocks = summary.free_blocks, "format complete");
    Ok(summary)
}

fn log_group(group: GroupNumber, desc: &Ext4GroupDesc) {
    debug!(
        group = group.0,
        block_bitmap = desc.block_bitmap,
        inode_table = desc.inode_table,
        free_blocks = desc.free_blocks_count,
        "group laid out"
    );
}

/// Root (inode 2) and `lost+found` (inode 11), each with one data block.
fn create_root_dirs(
    disk: &Disk,
    sb: &Ext4Superblock,
    geo: &FsGeometry,
    descs: &[Ext4GroupDesc],
) -> Result<()> {
    let root_block = geo.group_block_to_absolute(GroupNumber(0), 0).0
        + group_overhead(geo, GroupNumber(0));
    let lf_block = root_block + 1;
    let block_size = disk.block_size();
    let sectors = block_size.sectors();

    let mut buf = vec![0_u8; block_size.as_usize()];
    let root = u64_to_u32(InodeNumber::ROOT.0, "root inode")?;
    let lost = u64_to_u32(InodeNumber::LOST_AND_FOUND.0, "lost+found inode")?;
    init_dir_block(&mut buf, root, root)?;
    disk.write_blocks(BlockNumber(root_block), &buf)?;
    init_dir_block(&mut buf, lost, root)?;
    disk.write_blocks(BlockNumber(lf_block), &buf)?;

    let layout = InodeLayout {
        inodes_count: sb.inodes_count,
        inodes_per_group: sb.inodes_per_group,
        inode_size: sb.inode_size,
        block_size,
        tables: descs.iter().map(|d| BlockNumber(d.inode_table)).collect(),
    };
    let mut icache = InodeCache::new(layout, 2);

    let root_inode = icache.create(disk, InodeNumber::ROOT, S_IFDIR | 0o755, 0, 0)?;
    kfs_extent::init_pblock(root_inode, BlockNumber(root_block), 1)?;
    root_inode.size = u64::from(block_size.get());
    root_inode.blocks = sectors;
    root_inode.links_count = 3;
    let mut root_copy = root_inode.clone();

    let lf_inode = icache.create(disk, InodeNumber::LOST_AND_FOUND, S_IFDIR | 0o700, 0, 0)?;
    kfs_extent::init_pblock(lf_inode, BlockNumber(lf_block), 1)?;
    lf_inode.size = u64::from(block_size.get());
    lf_inode.blocks = sectors;
    lf_inode.links_count = 2;

    let mut staging = StagingBlock::new(block_size);
    {
        let mut dir = Directory::new(disk, InodeNumber::ROOT, &mut root_copy, &mut staging)?;
        dir.add(b"lost+found", InodeNumber::LOST_AND_FOUND, Ext4FileType::Dir)?;
    }
    staging.flush(disk)?;
    icache.store(disk, InodeNumber::ROOT, root_copy)?;
    icache.flush(disk)?;
    Ok(())
}

/// Canonical 8-4-4-4-12 text form of a volume uuid.
#[must_use]
pub fn format_uuid(uuid: &[u8; 16]) -> String {
    let hex: String = uuid.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfs_alloc::Allocator;
    use kfs_block::{MemoryByteDevice, read_superblock_region};
    use kfs_ondisk::parse_dir_block;

    fn memory_disk(bytes: usize, block_size: u32) -> Disk {
        Disk::new(
            Box::new(MemoryByteDevice::new(bytes)),
            BlockSize::new(block_size).unwrap(),
        )
    }

    fn one_k() -> FormatOptions {
        FormatOptions {
            block_size: 1024,
            ..FormatOptions::default()
        }
    }

    #[test]
    fn small_image_single_group() {
        let disk = memory_disk(1 << 20, 1024);
        let summary = format(&disk, &one_k()).unwrap();
        assert_eq!(summary.blocks_count, 1024);
        assert_eq!(summary.groups, 1);
        assert_eq!(summary.inodes_per_group % 8, 0);

        let region = read_superblock_region(&disk).unwrap();
        let sb = Ext4Superblock::parse_superblock_region(&region).unwrap();
        sb.validate_geometry().unwrap();
        sb.validate_features().unwrap();
        assert!(sb.is_writable());
        assert_eq!(sb.free_inodes_count, sb.inodes_count - 11);
    }

    #[test]
    fn bitmaps_agree_with_counters() {
        let disk = memory_disk(24 << 20, 1024);
        let summary = format(&disk, &one_k()).unwrap();
        assert_eq!(summary.groups, 3);

        let region = read_superblock_region(&disk).unwrap();
        let sb = Ext4Superblock::parse_superblock_region(&region).unwrap();
        let alloc = Allocator::load(&disk, &sb).unwrap();
        let mut free = 0_u64;
        for block in u64::from(sb.first_data_block)..sb.blocks_count {
            if !alloc.block_in_use(BlockNumber(block)) {
                free += 1;
            }
        }
        assert_eq!(free, sb.free_blocks_count);
        assert!(alloc.inode_in_use(InodeNumber::LOST_AND_FOUND));
        assert!(!alloc.inode_in_use(InodeNumber(12)));
    }

    #[test]
    fn backup_superblocks_carry_group_number() {
        let disk = memory_disk(24 << 20, 1024);
        format(&disk, &one_k()).unwrap();
        // Group 1 starts at block 8193 with 1K blocks.
        let mut backup = [0_u8; EXT4_SUPERBLOCK_SIZE];
        disk.read_at(ByteOffset(8193 * 1024), &mut backup).unwrap();
        assert_eq!(u16::from_le_bytes([backup[0x38], backup[0x39]]), EXT4_SUPER_MAGIC);
        assert_eq!(u16::from_le_bytes([backup[0x5A], backup[0x5B]]), 1);
    }

    #[test]
    fn root_lists_lost_and_found() {
        let disk = memory_disk(4 << 20, 4096);
        format(&disk, &FormatOptions::default()).unwrap();
        let region = read_superblock_region(&disk).unwrap();
        let sb = Ext4Superblock::parse_superblock_region(&region).unwrap();
        let alloc = Allocator::load(&disk, &sb).unwrap();
        let desc = alloc.groups().get(GroupNumber(0)).unwrap();
        let geo = alloc.geometry();
        let root_block = desc.inode_table + geo.inode_table_blocks();

        let block = disk.read_block(BlockNumber(root_block)).unwrap();
        let names: Vec<String> = parse_dir_block(&block)
            .unwrap()
            .iter()
            .map(kfs_ondisk::Ext4DirEntry::name_str)
            .collect();
        assert_eq!(names, vec![".", "..", "lost+found"]);
    }

    #[test]
    fn too_small_is_rejected() {
        let disk = memory_disk(16 * 1024, 1024);
        assert!(matches!(
            format(&disk, &one_k()),
            Err(KfsError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn mismatched_disk_block_size_rejected() {
        let disk = memory_disk(1 << 20, 1024);
        assert!(matches!(
            format(&disk, &FormatOptions::default()),
            Err(KfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn uuid_text_form() {
        let uuid = [0xAB_u8; 16];
        assert_eq!(format_uuid(&uuid), "abababab-abab-abab-abab-abababababab");
    }
}
