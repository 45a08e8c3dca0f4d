//! Flat table of fixed-length n-grams with their counts.
//!
//! This is what top-k selection produces and what the packed trie consumes:
//! n-gram `i` occupies `bytes[i * ngram_len..(i + 1) * ngram_len]` and its
//! count is `counts[i]`.

use std::io::Write;

use crate::error::{hex, Error, Result};

/// An ordered list of `(n-gram, count)` pairs of a single length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixSet {
    ngram_len: usize,
    pub(crate) bytes: Vec<u8>,
    pub(crate) counts: Vec<u32>,
}

impl PrefixSet {
    /// Create an empty set of `ngram_len`-byte n-grams.
    pub fn new(ngram_len: usize) -> Self {
        Self::with_capacity(ngram_len, 0)
    }

    /// Create an empty set with room for `capacity` entries.
    pub fn with_capacity(ngram_len: usize, capacity: usize) -> Self {
        Self {
            ngram_len,
            bytes: Vec::with_capacity(ngram_len * capacity),
            counts: Vec::with_capacity(capacity),
        }
    }

    /// Build a set from a flat byte buffer and parallel counts.
    pub fn from_parts(ngram_len: usize, bytes: Vec<u8>, counts: Vec<u32>) -> Result<Self> {
        if bytes.len() != ngram_len * counts.len() {
            return Err(Error::KeyLength {
                expected: ngram_len * counts.len(),
                actual: bytes.len(),
            });
        }
        Ok(Self {
            ngram_len,
            bytes,
            counts,
        })
    }

    /// Append one n-gram.
    pub fn push(&mut self, ngram: &[u8], count: u32) -> Result<()> {
        if ngram.len() != self.ngram_len {
            return Err(Error::KeyLength {
                expected: self.ngram_len,
                actual: ngram.len(),
            });
        }
        self.bytes.extend_from_slice(ngram);
        self.counts.push(count);
        Ok(())
    }

    /// Length in bytes of every n-gram in the set.
    pub fn ngram_len(&self) -> usize {
        self.ngram_len
    }

    /// Number of n-grams.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Returns true if the set holds no n-grams.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// The `i`th n-gram and its count.
    pub fn get(&self, i: usize) -> Option<(&[u8], u32)> {
        let count = *self.counts.get(i)?;
        let start = i * self.ngram_len;
        Some((&self.bytes[start..start + self.ngram_len], count))
    }

    /// The flat n-gram bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Counts, parallel to the n-grams.
    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    /// Iterate over `(n-gram, count)` pairs in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], u32)> + '_ {
        // chunks_exact panics on a zero chunk size.
        let width = self.ngram_len.max(1);
        self.bytes
            .chunks_exact(width)
            .zip(self.counts.iter().copied())
    }

    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }

    /// Indices ordered by descending count; equal counts keep storage order.
    pub fn rank_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| self.counts[b].cmp(&self.counts[a]));
        order
    }

    /// Write the set as `ngram,count` text, most frequent first.
    ///
    /// At most `limit` lines follow the header. Each n-gram is rendered as
    /// `0x` followed by lowercase hex.
    pub fn write_csv<W: Write>(&self, mut out: W, limit: usize) -> Result<()> {
        writeln!(out, "ngram,count")?;
        for i in self.rank_order().into_iter().take(limit) {
            let start = i * self.ngram_len;
            writeln!(
                out,
                "0x{},{}",
                hex(&self.bytes[start..start + self.ngram_len]),
                self.counts[i]
            )?;
        }
        out.flush()?;
        Ok(())
    }
}
