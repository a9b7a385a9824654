#![forbid(unsafe_code)]
//! ext4 on-disk structure codecs.
//!
//! Pure byte-level crate with no I/O. Every structure that the engine reads
//! from the image also has an encoder here, so a parse followed by an encode
//! over the same bytes leaves fields the engine does not model untouched.

pub mod dir;
pub mod extent;
pub mod group_desc;
pub mod inode;
pub mod superblock;

pub use dir::{
    Ext4DirEntry, Ext4FileType, dir_rec_len, init_dir_block, init_empty_dir_block, is_dir_tail,
    parse_dir_block, read_dir_record, set_dir_inode, set_dir_rec_len, write_dir_record,
    write_dir_tail,
};
pub use extent::{
    EXTENT_ROOT_MAX_ENTRIES, Ext4Extent, Ext4ExtentHeader, Ext4ExtentIndex, ExtentTree,
    extent_node_capacity, parse_extent_tree, write_extent_node,
};
pub use group_desc::Ext4GroupDesc;
pub use inode::Ext4Inode;
pub use superblock::{
    Ext4CompatFeatures, Ext4IncompatFeatures, Ext4RoCompatFeatures, Ext4Superblock,
};
