//! Immutable, rank-ordered prefix trie in a handful of flat arrays.
//!
//! The trie maps each of a fixed set of equal-length prefixes to a dense id
//! in `0..len()`. Ids follow rank: at every depth, sibling subtrees are
//! ordered by descending total count (ties by ascending byte), and leaves are
//! numbered in depth-first order over that ordering. Id 0 is therefore the
//! leaf reached by repeatedly taking the heaviest branch.
//!
//! # Layout
//!
//! Nodes are numbered breadth-first, root = 0. Per node we keep
//!
//! - `bytes[node]`: the byte on the edge into this node
//! - `num_children[node]`: fan-out (0 for leaves)
//! - `children[node]`: offset of this node's segment in `child_slots`, or
//!   the dense id for a leaf
//!
//! A node with at least `map_threshold` children owns a 256-entry segment
//! indexed directly by byte (0 = absent, the root is never a child). Smaller
//! fan-outs own exactly `num_children` slots sorted by byte, searched
//! linearly with an early exit.
//!
//! Sizes are computed by a dry run over the prefixes (which also reorders
//! them), so each buffer is allocated exactly once.

use smallvec::SmallVec;
use tracing::debug;

use crate::alloc::HugeBuffer;
use crate::error::{hex, Error, Result};
use crate::prefix_set::PrefixSet;

/// Fan-out at which a node switches from a sorted list to a 256-entry map.
pub const DEFAULT_MAP_THRESHOLD: usize = 2;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct LayoutSize {
    nodes: usize,
    slots: usize,
}

/// A read-only trie over equal-length prefixes. Safe to share between threads.
pub struct PackedTrie {
    bytes: HugeBuffer<u8>,
    num_children: HugeBuffer<u16>,
    children: HugeBuffer<u32>,
    child_slots: HugeBuffer<u32>,
    prefix_len: usize,
    num_leaves: usize,
    map_threshold: usize,
}

impl PackedTrie {
    /// Build a trie over every prefix in `prefixes` using the default map threshold.
    ///
    /// `prefixes` is reordered in place into rank order, so afterwards entry
    /// `i` of the set is the prefix with dense id `i`.
    pub fn build(prefixes: &mut PrefixSet) -> Result<Self> {
        Self::build_with_map_threshold(prefixes, DEFAULT_MAP_THRESHOLD)
    }

    /// Like [`PackedTrie::build`] with an explicit list/map switch-over point.
    pub fn build_with_map_threshold(prefixes: &mut PrefixSet, map_threshold: usize) -> Result<Self> {
        if prefixes.is_empty() {
            return Err(Error::EmptyPrefixSet);
        }
        let prefix_len = prefixes.ngram_len();
        if prefix_len == 0 {
            return Err(Error::InvalidConfig("packed trie prefixes must be at least one byte".into()));
        }

        let expected = reorder_prefixes(prefixes, map_threshold)?;
        if expected.nodes > u32::MAX as usize || expected.slots > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "packed trie too large: {} nodes, {} child slots",
                expected.nodes, expected.slots
            )));
        }

        let mut trie = Self {
            bytes: HugeBuffer::zeroed(expected.nodes, "packed trie bytes")?,
            num_children: HugeBuffer::zeroed(expected.nodes, "packed trie fan-out")?,
            children: HugeBuffer::zeroed(expected.nodes, "packed trie children")?,
            child_slots: HugeBuffer::zeroed(expected.slots, "packed trie child slots")?,
            prefix_len,
            num_leaves: prefixes.len(),
            map_threshold,
        };

        let actual = trie.lay_out(prefixes)?;
        if actual.nodes != expected.nodes {
            return Err(Error::TrieLayout {
                what: "nodes",
                expected: expected.nodes,
                actual: actual.nodes,
            });
        }
        if actual.slots != expected.slots {
            return Err(Error::TrieLayout {
                what: "child slots",
                expected: expected.slots,
                actual: actual.slots,
            });
        }

        debug!(
            prefixes = trie.num_leaves,
            nodes = actual.nodes,
            slots = actual.slots,
            bytes = trie.memory_usage(),
            "built packed trie"
        );
        Ok(trie)
    }

    /// Breadth-first placement of the (already rank-ordered) prefixes.
    fn lay_out(&mut self, prefixes: &PrefixSet) -> Result<LayoutSize> {
        let plen = self.prefix_len;
        let flat = prefixes.bytes();
        let mut used = LayoutSize { nodes: 1, slots: 0 };

        // (node, first prefix, one past last prefix, depth)
        let mut queue = std::collections::VecDeque::new();
        queue.push_back((0usize, 0usize, prefixes.len(), 0usize));

        let mut runs: Vec<(u8, usize, usize)> = Vec::new();
        while let Some((node, lo, hi, depth)) = queue.pop_front() {
            runs.clear();
            let mut start = lo;
            for i in lo + 1..=hi {
                if i == hi || flat[i * plen + depth] != flat[start * plen + depth] {
                    runs.push((flat[start * plen + depth], start, i));
                    start = i;
                }
            }

            let fan_out = runs.len();
            let first_child = used.nodes;
            let segment = used.slots;
            let nodes_needed = first_child + fan_out;
            let slots_needed = segment + if fan_out >= self.map_threshold { 256 } else { fan_out };
            if nodes_needed > self.bytes.len() {
                return Err(Error::TrieLayout {
                    what: "nodes",
                    expected: self.bytes.len(),
                    actual: nodes_needed,
                });
            }
            if slots_needed > self.child_slots.len() {
                return Err(Error::TrieLayout {
                    what: "child slots",
                    expected: self.child_slots.len(),
                    actual: slots_needed,
                });
            }

            self.num_children[node] = fan_out as u16;
            self.children[node] = segment as u32;

            // Child node ids are handed out in rank order; only the slot
            // placement differs between the two representations.
            if fan_out >= self.map_threshold {
                for (i, &(byte, _, _)) in runs.iter().enumerate() {
                    self.child_slots[segment + byte as usize] = (first_child + i) as u32;
                }
            } else {
                let mut by_byte: SmallVec<[(u8, usize); 4]> = runs
                    .iter()
                    .enumerate()
                    .map(|(i, &(byte, _, _))| (byte, first_child + i))
                    .collect();
                by_byte.sort_unstable();
                for (i, &(_, child)) in by_byte.iter().enumerate() {
                    self.child_slots[segment + i] = child as u32;
                }
            }

            for (i, &(byte, run_lo, run_hi)) in runs.iter().enumerate() {
                let child = first_child + i;
                self.bytes[child] = byte;
                if depth + 1 == plen {
                    // Leaf: its id is its position in rank order.
                    self.children[child] = run_lo as u32;
                } else {
                    queue.push_back((child, run_lo, run_hi, depth + 1));
                }
            }

            used.nodes = nodes_needed;
            used.slots = slots_needed;
        }

        Ok(used)
    }

    /// Look up a prefix and return its dense id.
    #[inline]
    pub fn search(&self, key: &[u8]) -> Option<usize> {
        if key.len() != self.prefix_len {
            return None;
        }

        let mut node = 0usize;
        for &b in key {
            node = self.child(node, b)?;
        }
        Some(self.children[node] as usize)
    }

    #[inline]
    fn child(&self, node: usize, byte: u8) -> Option<usize> {
        let fan_out = self.num_children[node] as usize;
        let segment = self.children[node] as usize;

        if fan_out >= self.map_threshold {
            match self.child_slots[segment + byte as usize] {
                0 => None,
                c => Some(c as usize),
            }
        } else {
            for &c in &self.child_slots[segment..segment + fan_out] {
                let c = c as usize;
                let cb = self.bytes[c];
                if cb == byte {
                    return Some(c);
                }
                if cb > byte {
                    break;
                }
            }
            None
        }
    }

    /// Children of `node` in rank order.
    fn ranked_children(&self, node: usize) -> SmallVec<[u32; 16]> {
        let fan_out = self.num_children[node] as usize;
        let segment = self.children[node] as usize;

        let mut out: SmallVec<[u32; 16]> = if fan_out >= self.map_threshold {
            self.child_slots[segment..segment + 256]
                .iter()
                .copied()
                .filter(|&c| c != 0)
                .collect()
        } else {
            self.child_slots[segment..segment + fan_out].iter().copied().collect()
        };
        // Siblings were numbered in rank order at build time.
        out.sort_unstable();
        out
    }

    /// Depth-first walk over all leaves, yielding `(id, prefix)` in id order.
    pub fn leaves(&self) -> Leaves<'_> {
        Leaves {
            trie: self,
            stack: vec![(0, 0)],
            prefix: SmallVec::new(),
        }
    }

    /// Length in bytes of every prefix.
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    /// Number of prefixes (and dense ids).
    pub fn len(&self) -> usize {
        self.num_leaves
    }

    /// Always false for a successfully built trie.
    pub fn is_empty(&self) -> bool {
        self.num_leaves == 0
    }

    /// Total number of nodes including the root.
    pub fn node_count(&self) -> usize {
        self.bytes.len()
    }

    /// Fan-out at which nodes use a 256-entry map.
    pub fn map_threshold(&self) -> usize {
        self.map_threshold
    }

    /// Bytes held by the node and slot arrays.
    pub fn memory_usage(&self) -> usize {
        self.bytes.byte_len()
            + self.num_children.byte_len()
            + self.children.byte_len()
            + self.child_slots.byte_len()
    }

    /// Independent copy. Children are stored as offsets, so this is a plain
    /// buffer copy.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            bytes: self.bytes.try_clone("packed trie bytes")?,
            num_children: self.num_children.try_clone("packed trie fan-out")?,
            children: self.children.try_clone("packed trie children")?,
            child_slots: self.child_slots.try_clone("packed trie child slots")?,
            prefix_len: self.prefix_len,
            num_leaves: self.num_leaves,
            map_threshold: self.map_threshold,
        })
    }
}

impl std::fmt::Debug for PackedTrie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedTrie")
            .field("prefix_len", &self.prefix_len)
            .field("prefixes", &self.num_leaves)
            .field("nodes", &self.bytes.len())
            .field("slots", &self.child_slots.len())
            .finish()
    }
}

/// Iterator returned by [`PackedTrie::leaves`].
pub struct Leaves<'a> {
    trie: &'a PackedTrie,
    stack: Vec<(u32, usize)>,
    prefix: SmallVec<[u8; 16]>,
}

impl<'a> Iterator for Leaves<'a> {
    type Item = (usize, SmallVec<[u8; 16]>);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((node, depth)) = self.stack.pop() {
            let node = node as usize;
            if depth > 0 {
                self.prefix.truncate(depth - 1);
                self.prefix.push(self.trie.bytes[node]);
            }

            if depth == self.trie.prefix_len {
                return Some((self.trie.children[node] as usize, self.prefix.clone()));
            }

            for &c in self.trie.ranked_children(node).iter().rev() {
                self.stack.push((c, depth + 1));
            }
        }
        None
    }
}

/// Reorder `prefixes` into rank order and size the trie that will hold them.
///
/// Returns the node count (root included) and child-slot count.
fn reorder_prefixes(prefixes: &mut PrefixSet, map_threshold: usize) -> Result<LayoutSize> {
    let plen = prefixes.ngram_len();
    let mut size = LayoutSize { nodes: 1, slots: 0 };
    let PrefixSet { bytes, counts, .. } = prefixes;
    reorder_range(bytes, counts, plen, 0, map_threshold, &mut size)?;
    Ok(size)
}

fn reorder_range(
    bytes: &mut [u8],
    counts: &mut [u32],
    plen: usize,
    depth: usize,
    map_threshold: usize,
    size: &mut LayoutSize,
) -> Result<()> {
    let len = counts.len();
    let mut sums = [0u64; 256];
    let mut sizes = [0usize; 256];
    for i in 0..len {
        let b = bytes[i * plen + depth] as usize;
        sums[b] += counts[i] as u64;
        sizes[b] += 1;
    }

    let mut order: SmallVec<[u8; 32]> = (0..=255u8).filter(|&b| sizes[b as usize] > 0).collect();
    order.sort_by(|&a, &b| {
        sums[b as usize]
            .cmp(&sums[a as usize])
            .then_with(|| a.cmp(&b))
    });

    let last = depth + 1 == plen;
    if last {
        if let Some(&dup) = order.iter().find(|&&b| sizes[b as usize] > 1) {
            let i = (0..len)
                .find(|&i| bytes[i * plen + depth] == dup)
                .unwrap_or(0);
            return Err(Error::DuplicatePrefix {
                prefix: hex(&bytes[i * plen..(i + 1) * plen]),
            });
        }
    }

    let mut start = [0usize; 256];
    let mut pos = 0;
    for &b in &order {
        start[b as usize] = pos;
        pos += sizes[b as usize];
    }

    // Stable partition by byte into rank order.
    if order.len() > 1 {
        let mut cursor = start;
        let mut new_bytes = vec![0u8; bytes.len()];
        let mut new_counts = vec![0u32; len];
        for i in 0..len {
            let b = bytes[i * plen + depth] as usize;
            let dst = cursor[b];
            cursor[b] += 1;
            new_bytes[dst * plen..(dst + 1) * plen].copy_from_slice(&bytes[i * plen..(i + 1) * plen]);
            new_counts[dst] = counts[i];
        }
        bytes.copy_from_slice(&new_bytes);
        counts.copy_from_slice(&new_counts);
    }

    size.nodes += order.len();
    size.slots += if order.len() >= map_threshold { 256 } else { order.len() };

    if !last {
        for &b in &order {
            let lo = start[b as usize];
            let hi = lo + sizes[b as usize];
            reorder_range(
                &mut bytes[lo * plen..hi * plen],
                &mut counts[lo..hi],
                plen,
                depth + 1,
                map_threshold,
                size,
            )?;
        }
    }
    Ok(())
}
