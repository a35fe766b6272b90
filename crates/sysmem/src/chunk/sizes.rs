use crate::{PAGE_SIZE, config::chunk::SUPPORTED_CHUNK_SIZES_MASK, error::SysmemError};
use alloc::format;

/// The size lattice: a bit mask of the power-of-two chunk sizes allocation, split and merge use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkSizes {
    mask: u64,
}

impl ChunkSizes {
    /// Build the lattice from a list of byte sizes.
    pub fn from_sizes(sizes: &[u64]) -> Result<Self, SysmemError> {
        let mut mask = 0;

        for &size in sizes {
            if !size.is_power_of_two() || size & SUPPORTED_CHUNK_SIZES_MASK == 0 {
                return Err(SysmemError::invalid_argument(format!(
                    "Chunk size {size:#x} isn't a supported power of two"
                )));
            }
            mask |= size;
        }

        if mask == 0 {
            return Err(SysmemError::invalid_argument(
                "At least one chunk size is required",
            ));
        }

        Ok(Self { mask })
    }

    /// The raw OR'ed mask of sizes.
    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Whether `size` is part of the lattice.
    pub fn contains(&self, size: u64) -> bool {
        size.is_power_of_two() && self.mask & size != 0
    }

    /// The largest size of the lattice.
    pub fn largest(&self) -> u64 {
        1 << (u64::BITS - 1 - self.mask.leading_zeros())
    }

    /// The smallest size of the lattice.
    pub fn smallest(&self) -> u64 {
        1 << self.mask.trailing_zeros()
    }

    /// The next smaller size of the lattice, if any.
    pub fn next_smaller(&self, size: u64) -> Option<u64> {
        let below = self.mask & (size - 1);

        match below {
            0 => None,
            below => Some(1 << (u64::BITS - 1 - below.leading_zeros())),
        }
    }

    /// Iterate the sizes from the largest to the smallest.
    pub fn iter_rev(&self) -> impl Iterator<Item = u64> + '_ {
        (0..u64::BITS)
            .rev()
            .map(|bit| 1u64 << bit)
            .filter(|size| self.mask & size != 0)
    }

    /// Number of pages in a chunk of `size` bytes.
    pub fn num_pages(size: u64) -> u64 {
        size / PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB: u64 = 1024;

    #[test]
    fn lattice_walks_down() {
        let sizes = ChunkSizes::from_sizes(&[4 * KB, 64 * KB, 2048 * KB]).unwrap();

        assert_eq!(sizes.largest(), 2048 * KB);
        assert_eq!(sizes.smallest(), 4 * KB);
        assert_eq!(sizes.next_smaller(2048 * KB), Some(64 * KB));
        assert_eq!(sizes.next_smaller(64 * KB), Some(4 * KB));
        assert_eq!(sizes.next_smaller(4 * KB), None);
        assert_eq!(
            sizes.iter_rev().collect::<alloc::vec::Vec<_>>(),
            [2048 * KB, 64 * KB, 4 * KB]
        );
    }

    #[test]
    fn rejects_unsupported_sizes() {
        assert!(ChunkSizes::from_sizes(&[3 * KB]).is_err());
        assert!(ChunkSizes::from_sizes(&[4096 * KB]).is_err());
        assert!(ChunkSizes::from_sizes(&[]).is_err());
    }
}
