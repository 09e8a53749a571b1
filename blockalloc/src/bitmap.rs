use crate::NUM_BLOCKS;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    Free,
    Used,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Bitmap {
    /// Stores NUM_BLOCKS bits mapping each bit to a logical block on disk.
    bitmap: [u64; NUM_BLOCKS / 64],
}

impl Bitmap {
    pub fn new() -> Self {
        Self {
            bitmap: [0; NUM_BLOCKS / 64],
        }
    }

    pub fn get(&self, blocknr: usize) -> State {
        assert!(blocknr < NUM_BLOCKS, "block {} outside of bitmap", blocknr);
        let word = self.bitmap[blocknr / 64];
        if word & (1u64 << (blocknr % 64)) == 0 {
            State::Free
        } else {
            State::Used
        }
    }

    pub fn set_reserved(&mut self, blocknr: usize) {
        assert!(blocknr < NUM_BLOCKS, "block {} outside of bitmap", blocknr);
        let mask = 0b01_u64 << (blocknr % 64);
        self.bitmap[blocknr / 64] |= mask;
    }

    pub fn set_free(&mut self, blocknr: usize) {
        assert!(blocknr < NUM_BLOCKS, "block {} outside of bitmap", blocknr);
        let mask = 0b01_u64 << (blocknr % 64);
        self.bitmap[blocknr / 64] &= !mask;
    }

    /// Number of used blocks in the first `limit` entries of the map.
    pub fn count_used(&self, limit: usize) -> usize {
        (0..limit.min(NUM_BLOCKS))
            .filter(|&blocknr| self.get(blocknr) == State::Used)
            .count()
    }
}

impl Default for Bitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("used", &self.count_used(NUM_BLOCKS))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_on_word_boundaries_are_tracked_separately() {
        let mut bmp = Bitmap::new();
        for blocknr in [0, 63, 64, NUM_BLOCKS - 1] {
            bmp.set_reserved(blocknr);
        }

        for blocknr in [0, 63, 64, NUM_BLOCKS - 1] {
            assert_eq!(bmp.get(blocknr), State::Used, "block {}", blocknr);
        }
        for blocknr in [1, 62, 65, NUM_BLOCKS - 2] {
            assert_eq!(bmp.get(blocknr), State::Free, "block {}", blocknr);
        }
        assert_eq!(bmp.count_used(NUM_BLOCKS), 4);
    }

    #[test]
    fn freeing_a_block_leaves_its_neighbours_alone() {
        let mut bmp = Bitmap::new();
        bmp.set_reserved(9);
        bmp.set_reserved(10);
        bmp.set_reserved(11);

        bmp.set_free(10);

        assert_eq!(bmp.get(9), State::Used);
        assert_eq!(bmp.get(10), State::Free);
        assert_eq!(bmp.get(11), State::Used);
    }

    #[test]
    fn count_used_respects_limit() {
        let mut bmp = Bitmap::new();
        bmp.set_reserved(3);
        bmp.set_reserved(70);

        assert_eq!(bmp.count_used(64), 1);
        assert_eq!(bmp.count_used(NUM_BLOCKS), 2);
    }

    #[test]
    #[should_panic]
    fn reading_past_the_end_panics() {
        Bitmap::new().get(NUM_BLOCKS);
    }
}
