use std::io::ErrorKind;

use log::{debug, warn};

use crate::bitmap::{Bitmap, State};
use crate::{BlockAllocator, BlockNumber, NUM_BLOCKS};

/// Implements a first fit allocation policy: a request for a run of n blocks is served by the
/// lowest numbered window of n consecutive free blocks.
///
/// ## Other Allocation Policies
///
/// 1. Next fit, resuming the search where the last one ended to spread writes over the medium.
/// 2. Best fit, choosing the smallest free window that satisfies the request to keep large runs
///    available for large files.
pub struct BitmapAllocator {
    /// A simple bitmap tracking which blocks are allocated and which are free.
    bitmap: Bitmap,
    /// The number of blocks available to the allocator, at most NUM_BLOCKS.
    cap: usize,
}

impl BitmapAllocator {
    /// An allocator managing all NUM_BLOCKS blocks, all of them free.
    pub fn new() -> Self {
        Self {
            bitmap: Bitmap::new(),
            cap: NUM_BLOCKS,
        }
    }

    pub fn builder() -> BitmapAllocatorBuilder {
        BitmapAllocatorBuilder::default()
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    fn find_run(&self, run_length: usize) -> Option<usize> {
        let mut start = 0;
        let mut len = 0;
        for blocknr in 0..self.cap {
            match self.bitmap.get(blocknr) {
                State::Free => {
                    if len == 0 {
                        start = blocknr;
                    }
                    len += 1;
                    if len == run_length {
                        return Some(start);
                    }
                }
                State::Used => len = 0,
            }
        }
        None
    }
}

impl Default for BitmapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockAllocator for BitmapAllocator {
    fn allocate(&mut self, run_length: u32) -> Option<BlockNumber> {
        if run_length == 0 {
            return None;
        }
        let start = self.find_run(run_length as usize)?;
        for blocknr in start..start + run_length as usize {
            self.bitmap.set_reserved(blocknr);
        }
        debug!("allocated run of {} block(s) at {}", run_length, start);
        Some(start as BlockNumber)
    }

    fn free(&mut self, blocknr: BlockNumber) {
        let blocknr = blocknr as usize;
        if blocknr >= self.cap {
            warn!("ignoring free of block {} outside of allocator", blocknr);
            return;
        }
        if let State::Free = self.bitmap.get(blocknr) {
            warn!("ignoring double free of block {}", blocknr);
            return;
        }
        self.bitmap.set_free(blocknr);
    }

    fn mark_used(&mut self, blocknr: BlockNumber) -> bool {
        let blocknr = blocknr as usize;
        if blocknr >= self.cap || self.bitmap.get(blocknr) == State::Used {
            return false;
        }
        self.bitmap.set_reserved(blocknr);
        true
    }

    fn state(&self, blocknr: BlockNumber) -> State {
        if blocknr as usize >= self.cap {
            return State::Used;
        }
        self.bitmap.get(blocknr as usize)
    }

    fn capacity(&self) -> u32 {
        self.cap as u32
    }

    fn free_count(&self) -> u32 {
        (self.cap - self.bitmap.count_used(self.cap)) as u32
    }
}

pub struct BitmapAllocatorBuilder {
    block_count: usize,
    reserved: Vec<BlockNumber>,
}

impl Default for BitmapAllocatorBuilder {
    fn default() -> Self {
        BitmapAllocatorBuilder {
            block_count: NUM_BLOCKS,
            reserved: Vec::new(),
        }
    }
}

impl BitmapAllocatorBuilder {
    /// Sets the number of blocks managed by the allocator.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Marks a block as used before the allocator hands out anything, for instance blocks holding
    /// metadata of an outer layer.
    pub fn with_reserved(mut self, blocknr: BlockNumber) -> Self {
        self.reserved.push(blocknr);
        self
    }

    pub fn build(self) -> std::io::Result<BitmapAllocator> {
        if self.block_count == 0 || self.block_count > NUM_BLOCKS {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("block count must be between 1 and {}", NUM_BLOCKS),
            ));
        }
        let mut alloc = BitmapAllocator {
            bitmap: Bitmap::new(),
            cap: self.block_count,
        };
        for blocknr in self.reserved {
            if blocknr as usize >= self.block_count {
                return Err(std::io::Error::new(
                    ErrorKind::InvalidInput,
                    "reserved block out of range",
                ));
            }
            alloc.bitmap.set_reserved(blocknr as usize);
        }
        Ok(alloc)
    }
}
