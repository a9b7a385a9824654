//! Superblock lifecycle: validation at mount, bookkeeping and write-back.

use std::time::SystemTime;

use kfs_block::{Disk, read_superblock_region, write_superblock_region};
use kfs_error::{KfsError, Result};
use kfs_ondisk::Ext4Superblock;
use kfs_types::ParseError;
use tracing::{debug, info, warn};

/// Wall clock as a 32-bit ext4 timestamp, saturating past 2106.
pub(crate) fn now_secs() -> u32 {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// Read and validate the primary superblock.
pub(crate) fn load(disk: &Disk) -> Result<Ext4Superblock> {
    let region = read_superblock_region(disk)?;
    let sb = Ext4Superblock::parse_superblock_region(&region).map_err(|e| match e {
        ParseError::InvalidMagic { .. } => KfsError::Format(format!("not an ext4 image: {e}")),
        other => KfsError::Parse(other.to_string()),
    })?;
    sb.validate_geometry()
        .map_err(|e| KfsError::InvalidGeometry(e.to_string()))?;
    sb.validate_features().map_err(|e| {
        let unsupported = sb.feature_incompat.describe_unsupported();
        if unsupported.is_empty() {
            KfsError::UnsupportedFeature(e.to_string())
        } else {
            KfsError::UnsupportedFeature(unsupported.join(", "))
        }
    })?;
    debug!(
        block_size = sb.block_size,
        groups = sb.groups_count(),
        inodes = sb.inodes_count,
        incompat = %sb.feature_incompat,
        "superblock validated"
    );
    Ok(sb)
}

/// Whether the image must be served read-only regardless of the request.
pub(crate) fn forced_read_only(sb: &Ext4Superblock) -> bool {
    if sb.is_writable() {
        return false;
    }
    warn!(
        features = ?sb.feature_ro_compat.describe_readonly_forcing(),
        "ro_compat features require a read-only mount"
    );
    true
}

/// Record a read-write mount in the superblock.
pub(crate) fn mark_mounted(sb: &mut Ext4Superblock) {
    sb.mtime = now_secs();
    sb.mnt_count = sb.mnt_count.wrapping_add(1);
    info!(mnt_count = sb.mnt_count, "mounted read-write");
}

/// Encode `sb` over the on-disk region so unmodelled bytes survive.
pub(crate) fn write_back(disk: &Disk, sb: &mut Ext4Superblock) -> Result<()> {
    sb.wtime = now_secs();
    let mut region = read_superblock_region(disk)?;
    sb.encode_into(&mut region)?;
    write_superblock_region(disk, &region)?;
    debug!(
        free_blocks = sb.free_blocks_count,
        free_inodes = sb.free_inodes_count,
        "superblock written"
    );
    Ok(())
}
