use blockalloc::{BlockAllocator, BLOCK_SIZE};
use log::debug;

use crate::fs::{FsError, Result};
use crate::node::Extent;

/// The largest run requested from the block allocator in a single call.
pub const MAX_RUN: u32 = 4;

/// Number of blocks needed to hold `total_bytes`, i.e. `ceil(total_bytes / BLOCK_SIZE)`.
pub fn blocks_for(total_bytes: u32) -> u32 {
    let blocks = (u64::from(total_bytes) + u64::from(BLOCK_SIZE) - 1) / u64::from(BLOCK_SIZE);
    blocks as u32
}

/// Returns every block of every extent to the allocator.
pub fn release_extents<A: BlockAllocator + ?Sized>(alloc: &mut A, extents: &[Extent]) {
    for extent in extents {
        for blocknr in extent.blocks() {
            alloc.free(blocknr);
        }
    }
}

/// Allocates enough blocks for `total_bytes` and returns the extents covering them, in order.
///
/// Either every block is handed back to the caller as part of the returned extents, or the
/// allocation fails and every block taken along the way has been released again.
pub fn allocate_extents<A: BlockAllocator + ?Sized>(
    alloc: &mut A,
    total_bytes: u32,
) -> Result<Vec<Extent>> {
    let needed = blocks_for(total_bytes);
    let mut pending = PendingExtents::with_capacity(alloc, needed)?;
    pending.allocate(needed)?;
    Ok(pending.commit())
}

/// Extents taken from an allocator that are not owned by an inode yet.
///
/// Allocation may fail half way with blocks already granted. Everything recorded here is given
/// back when the value is dropped, unless [`PendingExtents::commit`] took the extents first.
pub struct PendingExtents<'a, A: BlockAllocator + ?Sized> {
    alloc: &'a mut A,
    extents: Vec<Extent>,
}

impl<'a, A: BlockAllocator + ?Sized> PendingExtents<'a, A> {
    /// Prepares room for up to `blocks` extents, the worst case when every block ends up in a
    /// run of its own.
    pub fn with_capacity(alloc: &'a mut A, blocks: u32) -> Result<Self> {
        let mut extents = Vec::new();
        extents
            .try_reserve_exact(blocks as usize)
            .map_err(|_| FsError::ResourceExhausted)?;
        Ok(Self { alloc, extents })
    }

    /// Allocates `blocks` more blocks in runs of at most [`MAX_RUN`].
    ///
    /// When a run cannot be served contiguously a single block is taken instead and the rest of
    /// the run is allocated recursively, so contiguity degrades before the request fails. Blocks
    /// already recorded stay allocated on failure.
    pub fn allocate(&mut self, blocks: u32) -> Result<()> {
        if blocks == 0 {
            return Ok(());
        }
        let run = blocks.min(MAX_RUN);
        match self.alloc.allocate(run) {
            Some(start) => self.record(start, run),
            None if run == 1 => {
                debug!("block allocator exhausted, {} block(s) outstanding", blocks);
                return Err(FsError::AllocationExhausted { needed: blocks });
            }
            None => {
                debug!("no free run of {} blocks, splitting", run);
                let start = self
                    .alloc
                    .allocate(1)
                    .ok_or(FsError::AllocationExhausted { needed: blocks })?;
                self.record(start, 1);
                self.allocate(run - 1)?;
            }
        }
        self.allocate(blocks - run)
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Hands the extents over to the caller, who becomes responsible for releasing them.
    pub fn commit(mut self) -> Vec<Extent> {
        let mut extents = std::mem::take(&mut self.extents);
        extents.shrink_to_fit();
        extents
    }

    fn record(&mut self, start_block: u32, run_length: u32) {
        self.extents.push(Extent::new(start_block, run_length));
    }
}

impl<'a, A: BlockAllocator + ?Sized> Drop for PendingExtents<'a, A> {
    fn drop(&mut self) {
        if !self.extents.is_empty() {
            debug!("releasing {} uncommitted extent(s)", self.extents.len());
            release_extents(&mut *self.alloc, &self.extents);
            self.extents.clear();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use blockalloc::{BitmapAllocator, BlockNumber, State};

    /// Behaves like a disk so fragmented that no two free blocks are adjacent.
    pub(crate) struct FragmentedAllocator(pub BitmapAllocator);

    impl BlockAllocator for FragmentedAllocator {
        fn allocate(&mut self, run_length: u32) -> Option<BlockNumber> {
            if run_length != 1 {
                return None;
            }
            self.0.allocate(1)
        }

        fn free(&mut self, blocknr: BlockNumber) {
            self.0.free(blocknr)
        }

        fn mark_used(&mut self, blocknr: BlockNumber) -> bool {
            self.0.mark_used(blocknr)
        }

        fn state(&self, blocknr: BlockNumber) -> State {
            self.0.state(blocknr)
        }

        fn capacity(&self) -> u32 {
            self.0.capacity()
        }

        fn free_count(&self) -> u32 {
            self.0.free_count()
        }
    }

    fn allocator(blocks: usize) -> BitmapAllocator {
        BitmapAllocator::builder()
            .with_block_count(blocks)
            .build()
            .unwrap()
    }

    fn total_blocks(extents: &[Extent]) -> u32 {
        extents.iter().map(|extent| extent.run_length).sum()
    }

    #[test]
    fn rounds_byte_counts_up_to_whole_blocks() {
        assert_eq!(blocks_for(0), 0);
        assert_eq!(blocks_for(1), 1);
        assert_eq!(blocks_for(BLOCK_SIZE), 1);
        assert_eq!(blocks_for(BLOCK_SIZE + 1), 2);
        assert_eq!(blocks_for(u32::MAX), 1 << 20);
    }

    #[test]
    fn splits_large_requests_into_runs_of_four() {
        let mut alloc = allocator(32);

        let extents = allocate_extents(&mut alloc, BLOCK_SIZE * 10).unwrap();

        assert_eq!(
            extents,
            vec![Extent::new(0, 4), Extent::new(4, 4), Extent::new(8, 2)]
        );
        assert_eq!(alloc.free_count(), 22);
    }

    #[test]
    fn partial_last_block_still_counts() {
        let mut alloc = allocator(8);

        let extents = allocate_extents(&mut alloc, BLOCK_SIZE * 3 + 1).unwrap();

        assert_eq!(extents, vec![Extent::new(0, 4)]);
    }

    #[test]
    fn falls_back_to_single_blocks_when_fragmented() {
        let mut alloc = FragmentedAllocator(allocator(16));

        let extents = allocate_extents(&mut alloc, BLOCK_SIZE * 7).unwrap();

        assert_eq!(extents.len(), 7);
        assert!(extents.iter().all(|extent| extent.run_length == 1));
        assert_eq!(total_blocks(&extents), 7);
        assert_eq!(alloc.free_count(), 9);
    }

    #[test]
    fn degrades_contiguity_around_used_blocks() {
        let mut alloc = allocator(16);
        // Leave holes of size 1 and 2 at the front of the disk.
        for blocknr in [1, 4] {
            assert!(alloc.mark_used(blocknr));
        }

        let extents = allocate_extents(&mut alloc, BLOCK_SIZE * 4).unwrap();

        // The run of four fits at block 5, no splitting needed.
        assert_eq!(extents, vec![Extent::new(5, 4)]);

        let mut alloc = allocator(6);
        assert!(alloc.mark_used(1));
        assert!(alloc.mark_used(4));
        // Free blocks are 0, 2, 3 and 5: no run of four exists anywhere.
        let extents = allocate_extents(&mut alloc, BLOCK_SIZE * 4).unwrap();
        assert_eq!(
            extents,
            vec![
                Extent::new(0, 1),
                Extent::new(2, 1),
                Extent::new(3, 1),
                Extent::new(5, 1)
            ]
        );
        assert_eq!(alloc.free_count(), 0);
    }

    #[test]
    fn failure_releases_every_block_taken() {
        let mut alloc = allocator(6);

        let result = allocate_extents(&mut alloc, BLOCK_SIZE * 8);

        assert!(matches!(result, Err(FsError::AllocationExhausted { .. })));
        assert_eq!(alloc.free_count(), 6);
    }

    #[test]
    fn fragmented_failure_releases_every_block_taken() {
        let mut alloc = FragmentedAllocator(allocator(5));

        let result = allocate_extents(&mut alloc, BLOCK_SIZE * 6);

        assert!(matches!(
            result,
            Err(FsError::AllocationExhausted { needed: 1 })
        ));
        assert_eq!(alloc.free_count(), 5);
    }

    #[test]
    fn pending_extents_keep_blocks_until_dropped() {
        let mut alloc = allocator(8);
        {
            let mut pending = PendingExtents::with_capacity(&mut alloc, 3).unwrap();
            pending.allocate(3).unwrap();
            assert_eq!(pending.extents(), &[Extent::new(0, 3)]);
        }
        assert_eq!(alloc.free_count(), 8);

        let committed = {
            let mut pending = PendingExtents::with_capacity(&mut alloc, 3).unwrap();
            pending.allocate(3).unwrap();
            pending.commit()
        };
        assert_eq!(committed, vec![Extent::new(0, 3)]);
        assert_eq!(alloc.free_count(), 5);

        release_extents(&mut alloc, &committed);
        assert_eq!(alloc.free_count(), 8);
    }
}
