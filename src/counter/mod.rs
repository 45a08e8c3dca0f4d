//! Per-file occurrence marking.
//!
//! A counting thread scans every byte offset of a file, resolves the n-gram
//! starting there to a slot of the current [`NgramSpace`], and sets that bit
//! in a private [`Bitset`]. Repeats within the file collapse to one bit, so
//! after the bitsets are merged into a [`CountsArray`](crate::counts::CountsArray)
//! a counter holds the number of files the n-gram occurs in.
//!
//! Bitsets are recycled through a [`BitsetPool`].

mod pool;

pub use pool::{BitsetLease, BitsetPool, PoolStats, MAX_GROUP_SIZE};

use crate::alloc::HugeBuffer;
use crate::error::Result;
use crate::space::NgramSpace;

/// One bit per counter slot, plus the range of words written since the last clear.
pub struct Bitset {
    words: HugeBuffer<u64>,
    lo: usize,
    hi: usize,
}

impl Bitset {
    /// A cleared bitset covering `words` 64-bit words.
    pub fn new(words: usize) -> Result<Self> {
        Ok(Self {
            words: HugeBuffer::zeroed(words, "bitset")?,
            lo: usize::MAX,
            hi: 0,
        })
    }

    #[inline]
    pub fn set(&mut self, bit: usize) {
        let w = bit / 64;
        self.words[w] |= 1 << (bit % 64);
        self.lo = self.lo.min(w);
        self.hi = self.hi.max(w + 1);
    }

    pub fn contains(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    /// True if any bit was set since the last clear.
    pub fn is_dirty(&self) -> bool {
        self.lo < self.hi
    }

    /// Words that may hold set bits; empty when clean.
    pub fn touched(&self) -> std::ops::Range<usize> {
        if self.is_dirty() {
            self.lo..self.hi
        } else {
            0..0
        }
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn count_ones(&self) -> usize {
        self.words[self.touched()]
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }

    /// Zero the touched words.
    pub fn clear(&mut self) {
        let range = self.touched();
        self.words[range].fill(0);
        self.lo = usize::MAX;
        self.hi = 0;
    }
}

impl std::fmt::Debug for Bitset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitset")
            .field("words", &self.words.len())
            .field("touched", &self.touched())
            .finish()
    }
}

/// Mark every n-gram of `chunk` in `bitset`; returns how many windows were
/// inside the space (pruned prefixes are skipped).
pub fn mark_chunk(space: &NgramSpace<'_>, bitset: &mut Bitset, chunk: &[u8]) -> usize {
    let n = space.ngram_len();
    if chunk.len() < n {
        return 0;
    }

    let mut marked = 0;
    for window in chunk.windows(n) {
        if let Some(slot) = space.index(window) {
            bitset.set(slot);
            marked += 1;
        }
    }
    marked
}
