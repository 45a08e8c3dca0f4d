//! Error types shared by every stage of the pipeline.
//!
//! Configuration errors and invariant violations are both fatal: the pass
//! that raised them is abandoned and the error travels up to the caller.
//! Transient conditions (no chunk ready, no free bitset) never show up here.

use std::io;
use thiserror::Error;

/// Everything that can go wrong while building tries or counting.
#[derive(Error, Debug)]
pub enum Error {
    /// A packed trie was requested over zero prefixes.
    #[error("cannot build a packed trie from an empty prefix set")]
    EmptyPrefixSet,

    /// Batch construction started at a byte index outside the n-gram.
    #[error("invalid byte index {byte_index}: must be smaller than the n-gram length {len}")]
    InvalidByteIndex { byte_index: usize, len: usize },

    /// The same byte appeared twice among the leaves of one node.
    #[error("byte 0x{byte:02x} encountered more than once while assembling trie level {depth}")]
    DuplicateLeafByte { depth: usize, byte: u8 },

    /// The same full prefix was handed to the packed trie twice.
    #[error("prefix 0x{prefix} occurs more than once")]
    DuplicatePrefix { prefix: String },

    /// `set`/`increment` walked into a child that was never built.
    #[error("prefix does not exist: no child for byte 0x{byte:02x} at depth {depth}")]
    MissingPrefix { depth: usize, byte: u8 },

    /// A flat n-gram buffer or lookup key had the wrong length.
    #[error("expected a key length of {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },

    /// Node or child-slot usage after a build disagreed with the dry run.
    #[error("trie layout mismatch: {what} expected {expected}, got {actual}")]
    TrieLayout {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A surviving prefix never had a single extension observed.
    #[error("all counts for prefix 0x{prefix} are zero")]
    ZeroCountPrefix { prefix: String },

    /// The bitset slot protocol ended in an impossible state.
    #[error("bitset flush protocol violated: {0}")]
    FlushProtocol(String),

    /// Every allocation strategy failed.
    #[error("could not allocate {bytes} bytes for {purpose}")]
    Alloc { purpose: &'static str, bytes: usize },

    /// A reader or counting thread panicked.
    #[error("{0} thread panicked")]
    WorkerPanic(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Lowercase hex rendering used in error messages and output files.
pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
