#![forbid(unsafe_code)]
//! On-disk format parsing for ext2 structures.
//!
//! Pure parsing crate with no I/O. Parses byte slices into typed
//! superblocks, group descriptors, inodes, indirect pointer arrays and
//! directory entries.

pub mod ext2;

pub use ext2::{
    DirBlockIter, Ext2DirEntry, Ext2DirEntryRef, Ext2FileType, Ext2GroupDesc, Ext2Inode, Ext2Superblock,
    InodeLocation, indirect_pointer, iter_dir_block,
};
