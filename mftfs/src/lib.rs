//! Metadata layer of a simulated single-disk file system.
//!
//! An in-memory tree of inodes whose files are backed by extents taken from a
//! [`BlockAllocator`], persisted as a single master file table (see [`mft`]).
mod debug;
mod extent;
mod fs;
pub mod mft;
mod node;

pub use blockalloc::{
    BitmapAllocator, BitmapAllocatorBuilder, BlockAllocator, BlockNumber, State, BLOCK_SIZE,
    NUM_BLOCKS,
};

pub use crate::debug::{debug_fs, write_tree, BlockTable};
pub use crate::extent::{allocate_extents, blocks_for, release_extents, PendingExtents, MAX_RUN};
pub use crate::fs::{FileSystem, FsError, Result, DEFAULT_ROOT_NAME};
pub use crate::mft::LoadedTree;
pub use crate::node::{Entries, Extent, IdGenerator, Inode, InodeId, PreOrder};
