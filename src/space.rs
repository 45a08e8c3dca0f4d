//! Index spaces for n-gram counts.
//!
//! A pass over length-3 n-grams addresses every possible 3-gram directly.
//! Later passes only count n-grams whose `n - 1` byte prefix survived the
//! previous pass: the prefix's dense id from the [`PackedTrie`] selects a
//! block of 256 slots and the final byte picks the slot within it.

use crate::packed_trie::PackedTrie;

/// Number of distinct 3-grams.
pub const FIXED_SLOTS: usize = 1 << 24;

/// How an n-gram window maps to a counter slot.
#[derive(Debug, Clone, Copy)]
pub enum NgramSpace<'t> {
    /// All 3-grams, indexed by their big-endian value.
    Fixed,
    /// Extensions by one byte of the prefixes held in the trie.
    Prefixed(&'t PackedTrie),
}

impl<'t> NgramSpace<'t> {
    /// Length of the n-grams this space indexes.
    pub fn ngram_len(&self) -> usize {
        match self {
            NgramSpace::Fixed => 3,
            NgramSpace::Prefixed(trie) => trie.prefix_len() + 1,
        }
    }

    /// Number of counter slots.
    pub fn slots(&self) -> usize {
        match self {
            NgramSpace::Fixed => FIXED_SLOTS,
            NgramSpace::Prefixed(trie) => trie.len() * 256,
        }
    }

    /// Slot for the n-gram at the start of `window`, or `None` if its prefix
    /// was pruned. `window` must hold at least [`ngram_len`](Self::ngram_len) bytes.
    #[inline]
    pub fn index(&self, window: &[u8]) -> Option<usize> {
        match self {
            NgramSpace::Fixed => {
                Some(((window[0] as usize) << 16) | ((window[1] as usize) << 8) | window[2] as usize)
            }
            NgramSpace::Prefixed(trie) => {
                let plen = trie.prefix_len();
                let id = trie.search(&window[..plen])?;
                Some(id * 256 + window[plen] as usize)
            }
        }
    }

    /// The trie backing a prefixed space.
    pub fn trie(&self) -> Option<&'t PackedTrie> {
        match self {
            NgramSpace::Fixed => None,
            NgramSpace::Prefixed(trie) => Some(trie),
        }
    }
}
