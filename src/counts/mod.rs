//! Shared n-gram counters.
//!
//! Workers never write counts directly. They mark n-grams in private bitsets
//! and periodically merge a batch of bitsets with [`CountsArray::increment`],
//! which adds the set bits of several 64-bit words at once. The per-bit
//! additions are accumulated outside of any lock; only the final add into
//! the shared array happens under the region lock.

use std::io::Write;

use parking_lot::Mutex;

use crate::alloc::HugeBuffer;
use crate::error::{hex, Error, Result};
use crate::prefix_set::PrefixSet;
use crate::space::NgramSpace;

/// Counters per bitset word.
pub const WORD_BITS: usize = 64;

/// Bitset words guarded by one lock (128 counters).
pub const WORDS_PER_LOCK: usize = 2;

const SLOTS_PER_LOCK: usize = WORD_BITS * WORDS_PER_LOCK;

/// Region-locked array of 32-bit counters, one per slot of an [`NgramSpace`].
pub struct CountsArray<'t> {
    space: NgramSpace<'t>,
    counts: HugeBuffer<u32>,
    locks: Box<[Mutex<()>]>,
}

impl<'t> CountsArray<'t> {
    /// Zeroed counters covering every slot of `space`.
    pub fn new(space: NgramSpace<'t>) -> Result<Self> {
        let words = space.slots().div_ceil(WORD_BITS);
        let counts = HugeBuffer::zeroed(words * WORD_BITS, "counts array")?;
        let locks = (0..words.div_ceil(WORDS_PER_LOCK))
            .map(|_| Mutex::new(()))
            .collect();
        Ok(Self {
            space,
            counts,
            locks,
        })
    }

    /// The index space these counts cover.
    pub fn space(&self) -> NgramSpace<'t> {
        self.space
    }

    /// Number of counters (a multiple of 64, at least `space().slots()`).
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Number of 64-bit bitset words that cover this array.
    pub fn words(&self) -> usize {
        self.counts.len() / WORD_BITS
    }

    /// Add the set bits of every word in `bits` to counters
    /// `word * 64 .. word * 64 + 64`.
    ///
    /// Each entry of `bits` is the same word taken from a different bitset, so
    /// a counter grows by the number of bitsets that have its bit set.
    pub fn increment(&self, word: usize, bits: &[u64]) {
        // Four 16-lane groups per word, low bits first.
        let mut lanes = [[0u32; 16]; 4];
        let mut any = 0u64;
        for &w in bits {
            any |= w;
            if w == 0 {
                continue;
            }
            for (g, group) in lanes.iter_mut().enumerate() {
                let nibbles = (w >> (g * 16)) as u16;
                for (l, lane) in group.iter_mut().enumerate() {
                    *lane += ((nibbles >> l) & 1) as u32;
                }
            }
        }
        if any == 0 {
            return;
        }

        let base = word * WORD_BITS;
        assert!(base + WORD_BITS <= self.counts.len(), "bitset word {word} out of range");

        let _guard = self.locks[word / WORDS_PER_LOCK].lock();
        let ptr = self.counts.raw_ptr();
        for (g, group) in lanes.iter().enumerate() {
            for (l, &add) in group.iter().enumerate() {
                if add != 0 {
                    // SAFETY: in bounds (asserted above) and this region's
                    // lock is held, so no other thread touches the counter.
                    unsafe { *ptr.add(base + g * 16 + l) += add };
                }
            }
        }
    }

    /// Call `f` on each locked region of counters, in index order.
    fn for_each_region(&self, mut f: impl FnMut(usize, &[u32]) -> Result<()>) -> Result<()> {
        let ptr = self.counts.raw_ptr();
        for (r, lock) in self.locks.iter().enumerate() {
            let start = r * SLOTS_PER_LOCK;
            let len = SLOTS_PER_LOCK.min(self.counts.len() - start);
            let _guard = lock.lock();
            // SAFETY: region r lies within the buffer and its lock is held.
            let region = unsafe { std::slice::from_raw_parts(ptr.add(start), len) };
            f(start, region)?;
        }
        Ok(())
    }

    /// Visit every `(index, count)` pair in index order.
    pub fn for_each_count(&self, mut f: impl FnMut(usize, u32)) {
        let _ = self.for_each_region(|start, region| {
            for (i, &c) in region.iter().enumerate() {
                f(start + i, c);
            }
            Ok(())
        });
    }

    /// Counter `index`.
    pub fn get(&self, index: usize) -> u32 {
        assert!(index < self.counts.len(), "counter {index} out of range");
        let _guard = self.locks[index / SLOTS_PER_LOCK].lock();
        // SAFETY: in bounds and the region lock is held.
        unsafe { *self.counts.raw_ptr().add(index) }
    }

    /// Copy `len` counters starting at `start`, taking each region lock in turn.
    pub fn read_range(&self, start: usize, len: usize) -> Vec<u32> {
        let end = start + len;
        assert!(end <= self.counts.len(), "counter range {start}..{end} out of range");

        let ptr = self.counts.raw_ptr();
        let mut out = Vec::with_capacity(len);
        let mut at = start;
        while at < end {
            let stop = ((at / SLOTS_PER_LOCK + 1) * SLOTS_PER_LOCK).min(end);
            let _guard = self.locks[at / SLOTS_PER_LOCK].lock();
            // SAFETY: at..stop is in bounds and within one locked region.
            out.extend_from_slice(unsafe { std::slice::from_raw_parts(ptr.add(at), stop - at) });
            at = stop;
        }
        out
    }

    /// Largest counter value.
    pub fn maximum(&self) -> u32 {
        let mut max = 0;
        self.for_each_count(|_, c| max = max.max(c));
        max
    }

    /// Materialise the selected n-grams.
    ///
    /// Every slot with a count above `min` is taken, plus the first `budget`
    /// slots (in walk order) whose count equals `min`. A fixed space is
    /// walked by index. A prefixed space is walked prefix by prefix in dense
    /// id order, extensions by byte; a prefix none of whose extensions was
    /// ever seen is an error.
    pub fn copy_prefixes(&self, min: u32, mut budget: usize) -> Result<PrefixSet> {
        let mut out = PrefixSet::new(self.space.ngram_len());
        let mut take = |ngram: &[u8], count: u32, out: &mut PrefixSet| -> Result<()> {
            if count > min {
                out.push(ngram, count)?;
            } else if count == min && budget > 0 {
                out.push(ngram, count)?;
                budget -= 1;
            }
            Ok(())
        };

        match self.space {
            NgramSpace::Fixed => {
                let slots = self.space.slots();
                self.for_each_region(|start, region| {
                    for (i, &count) in region.iter().enumerate() {
                        let index = start + i;
                        if index >= slots {
                            break;
                        }
                        let ngram = [(index >> 16) as u8, (index >> 8) as u8, index as u8];
                        take(&ngram, count, &mut out)?;
                    }
                    Ok(())
                })?;
            }
            NgramSpace::Prefixed(trie) => {
                let mut ngram = Vec::with_capacity(trie.prefix_len() + 1);
                for (id, prefix) in trie.leaves() {
                    let extensions = self.read_range(id * 256, 256);
                    if extensions.iter().all(|&c| c == 0) {
                        return Err(Error::ZeroCountPrefix {
                            prefix: hex(&prefix),
                        });
                    }

                    let plen = prefix.len();
                    ngram.clear();
                    ngram.extend_from_slice(&prefix);
                    ngram.push(0);
                    for (b, &count) in extensions.iter().enumerate() {
                        ngram[plen] = b as u8;
                        take(&ngram, count, &mut out)?;
                    }
                }
            }
        }

        Ok(out)
    }

    /// Write every counter as `0x<index>, <count>`, one per line.
    pub fn dump<W: Write>(&self, mut out: W) -> Result<()> {
        let slots = self.space.slots();
        self.for_each_region(|start, region| {
            for (i, &c) in region.iter().enumerate() {
                if start + i < slots {
                    writeln!(out, "0x{:06x}, {}", start + i, c)?;
                }
            }
            Ok(())
        })?;
        out.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for CountsArray<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountsArray")
            .field("space", &self.space)
            .field("len", &self.counts.len())
            .field("locks", &self.locks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packed_trie::PackedTrie;

    fn prefixed_trie() -> PackedTrie {
        let mut prefixes = PrefixSet::new(2);
        prefixes.push(b"ab", 10).unwrap();
        prefixes.push(b"cd", 20).unwrap();
        PackedTrie::build(&mut prefixes).unwrap()
    }

    #[test]
    fn test_increment_adds_bits_per_bitset() {
        let trie = prefixed_trie();
        let counts = CountsArray::new(NgramSpace::Prefixed(&trie)).unwrap();
        assert_eq!(counts.len(), 512);

        counts.increment(1, &[0b1011, 0b0010, 1 << 63]);
        assert_eq!(counts.get(64), 1);
        assert_eq!(counts.get(65), 2);
        assert_eq!(counts.get(66), 0);
        assert_eq!(counts.get(67), 1);
        assert_eq!(counts.get(127), 1);
        assert_eq!(counts.maximum(), 2);

        counts.increment(1, &[0b10]);
        assert_eq!(counts.get(65), 3);
    }

    #[test]
    fn test_concurrent_increments() {
        let trie = prefixed_trie();
        let counts = CountsArray::new(NgramSpace::Prefixed(&trie)).unwrap();

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        for word in 0..counts.words() {
                            counts.increment(word, &[u64::MAX, 1]);
                        }
                    }
                });
            }
        });

        assert_eq!(counts.get(0), 16_000);
        assert_eq!(counts.get(1), 8_000);
        assert_eq!(counts.get(511), 8_000);
    }

    #[test]
    fn test_copy_prefixes_fixed_budget() {
        let counts = CountsArray::new(NgramSpace::Fixed).unwrap();
        // Indices 0..10 with counts [5,5,5,3,3,2,2,2,1,1].
        let values = [5u32, 5, 5, 3, 3, 2, 2, 2, 1, 1];
        for (i, &v) in values.iter().enumerate() {
            for _ in 0..v {
                counts.increment(0, &[1 << i]);
            }
        }

        let selected = counts.copy_prefixes(3, 1).unwrap();
        assert_eq!(selected.len(), 4);
        assert_eq!(selected.counts(), &[5, 5, 5, 3]);
        assert_eq!(selected.get(3), Some((&[0u8, 0, 3][..], 3)));
    }

    #[test]
    fn test_copy_prefixes_walks_trie_in_rank_order() {
        let trie = prefixed_trie();
        let counts = CountsArray::new(NgramSpace::Prefixed(&trie)).unwrap();
        let space = counts.space();

        let hits: [&[u8]; 4] = [b"cdx", b"cdx", b"aby", b"abz"];
        for ngram in hits {
            let index = space.index(ngram).unwrap();
            counts.increment(index / 64, &[1 << (index % 64)]);
        }

        let selected = counts.copy_prefixes(1, 1).unwrap();
        let got: Vec<(Vec<u8>, u32)> = selected.iter().map(|(g, c)| (g.to_vec(), c)).collect();
        assert_eq!(got, vec![(b"cdx".to_vec(), 2), (b"aby".to_vec(), 1)]);
    }

    #[test]
    fn test_zero_count_prefix_is_fatal() {
        let trie = prefixed_trie();
        let counts = CountsArray::new(NgramSpace::Prefixed(&trie)).unwrap();
        let index = NgramSpace::Prefixed(&trie).index(b"cdq").unwrap();
        counts.increment(index / 64, &[1 << (index % 64)]);

        match counts.copy_prefixes(1, 0) {
            Err(Error::ZeroCountPrefix { prefix }) => assert_eq!(prefix, "6162"),
            other => panic!("expected zero-count prefix error, got {other:?}"),
        }
    }

    #[test]
    fn test_dump() {
        let trie = prefixed_trie();
        let counts = CountsArray::new(NgramSpace::Prefixed(&trie)).unwrap();
        counts.increment(0, &[0b100]);

        let mut out = Vec::new();
        counts.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 512);
        assert_eq!(text.lines().nth(2), Some("0x000002, 1"));
    }
}
