//! Block allocation for a simulated single-disk volume.
//!
//! The volume is a fixed array of [`NUM_BLOCKS`] blocks of [`BLOCK_SIZE`] bytes. Consumers only see
//! the [`BlockAllocator`] trait; [`BitmapAllocator`] is the bitmap backed implementation.
mod allocator;
mod bitmap;

pub use crate::allocator::{BitmapAllocator, BitmapAllocatorBuilder};
pub use crate::bitmap::{Bitmap, State};

/// Size of a single block in bytes.
pub const BLOCK_SIZE: u32 = 4096;

/// Number of blocks a bitmap can track.
pub const NUM_BLOCKS: usize = 256;

/// The block number to access ranging from 0 (the first block) to n - 1 (the last block) where n
/// is the number of blocks managed by the allocator.
pub type BlockNumber = u32;

/// Hands out contiguous runs of blocks and takes single blocks back.
///
/// Implementations are not reentrant. A caller that shares an allocator between several actors
/// must serialize access itself.
pub trait BlockAllocator {
    /// Reserves `run_length` contiguous free blocks and returns the first block of the run.
    ///
    /// Returns `None` when no run of that length is free. Every block number, including 0, is a
    /// valid result.
    fn allocate(&mut self, run_length: u32) -> Option<BlockNumber>;

    /// Returns a single block to the free pool.
    ///
    /// Freeing a block that is already free, or that lies outside the allocator, is a no-op.
    fn free(&mut self, blocknr: BlockNumber);

    /// Marks a specific block as used. Used to rebuild occupancy from persisted extents.
    ///
    /// Returns `false` if the block was already in use or lies outside the allocator.
    fn mark_used(&mut self, blocknr: BlockNumber) -> bool;

    /// Reports whether a block is free. Blocks beyond the capacity are never allocatable and
    /// report [`State::Used`].
    fn state(&self, blocknr: BlockNumber) -> State;

    /// The number of blocks managed by this allocator.
    fn capacity(&self) -> u32;

    /// The number of blocks currently free.
    fn free_count(&self) -> u32;
}
