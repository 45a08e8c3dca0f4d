//! # topgram
//!
//! Finds the `k` byte n-grams that occur in the most files of a corpus.
//!
//! Counting every n-gram directly is infeasible for `n > 3`, so the search
//! runs in passes. Pass 3 counts all 2^24 3-grams in a flat array. Pass `L`
//! only counts `L`-grams whose `(L-1)`-byte prefix survived pass `L - 1`; the
//! survivors are compiled into a [`PackedTrie`] that maps each prefix to a
//! dense row of 256 counters.
//!
//! An n-gram is counted once per file no matter how often it repeats there:
//! each file is marked into its own [`Bitset`](counter::Bitset) and finished
//! bitsets are merged into the shared [`CountsArray`] in groups.
//!
//! ## Example
//!
//! ```rust
//! use topgram::{MemorySource, Pipeline, PipelineConfig};
//!
//! let files = (0..4).map(|i| format!("{i}: the quick brown fox").into_bytes());
//! let config = PipelineConfig { n: 5, k: 1, threads: 2, ..PipelineConfig::default() };
//! let pipeline = Pipeline::new(config, MemorySource::new(files)).unwrap();
//!
//! let passes = pipeline.run().unwrap();
//! let top = &passes.last().unwrap().selected;
//! assert_eq!(top.ngram_len(), 5);
//! assert_eq!(top.counts(), &[4]);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod alloc;
pub mod byte_trie;
pub mod counter;
pub mod counts;
pub mod error;
pub mod packed_trie;
pub mod pipeline;
pub mod prefix_set;
pub mod source;
pub mod space;
pub mod topk;

pub use byte_trie::{ByteTrie, ByteTrieBuilder, PackedByteTrie};
pub use counts::CountsArray;
pub use error::{Error, Result};
pub use packed_trie::PackedTrie;
pub use pipeline::{PassOutput, PassStats, Pipeline, PipelineConfig};
pub use prefix_set::PrefixSet;
pub use source::{DirectorySource, FileSource, MemorySource};
pub use space::NgramSpace;
pub use topk::find_top_k;

#[cfg(test)]
mod proptests;
