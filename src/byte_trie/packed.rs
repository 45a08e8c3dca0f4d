//! Breadth-first, index-addressed form of a [`ByteTrie`].
//!
//! All nodes live in one `Vec` and refer to their children by position, so a
//! copy is a plain `clone()` with nothing to rebase.

use std::collections::VecDeque;

use super::ByteTrie;
use crate::error::{Error, Result};

const NO_MAP: u32 = 0;

/// One node of a [`PackedByteTrie`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedNode {
    pub byte: u8,
    pub num_children: u16,
    pub value: u32,
    /// Index of the first child; siblings are contiguous and byte-sorted.
    pub first_child: u32,
    /// 1-based index of this node's child map, or 0 if it has none.
    pub child_map: u32,
}

/// A flattened byte trie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedByteTrie {
    nodes: Vec<PackedNode>,
    // 256 entries per map; each entry is a child index + 1, 0 if absent.
    maps: Vec<u32>,
}

impl PackedByteTrie {
    pub(super) fn from_trie(trie: &ByteTrie) -> Self {
        let mut nodes = vec![PackedNode {
            byte: trie.byte(),
            num_children: 0,
            value: trie.value(),
            first_child: 0,
            child_map: NO_MAP,
        }];
        let mut maps = Vec::new();

        let mut queue: VecDeque<(&ByteTrie, usize)> = VecDeque::new();
        queue.push_back((trie, 0));
        while let Some((src, at)) = queue.pop_front() {
            let first = nodes.len();
            nodes[at].num_children = src.num_children() as u16;
            nodes[at].first_child = first as u32;

            if src.has_child_map() {
                let base = maps.len();
                maps.resize(base + 256, 0);
                for (i, c) in src.children().iter().enumerate() {
                    maps[base + c.byte() as usize] = (first + i + 1) as u32;
                }
                nodes[at].child_map = (base / 256 + 1) as u32;
            }

            for (i, c) in src.children().iter().enumerate() {
                nodes.push(PackedNode {
                    byte: c.byte(),
                    num_children: 0,
                    value: c.value(),
                    first_child: 0,
                    child_map: NO_MAP,
                });
                queue.push_back((c, first + i));
            }
        }

        Self { nodes, maps }
    }

    fn child(&self, at: usize, byte: u8) -> Option<usize> {
        let node = &self.nodes[at];
        if node.child_map != NO_MAP {
            let base = (node.child_map as usize - 1) * 256;
            return match self.maps[base + byte as usize] {
                0 => None,
                c => Some(c as usize - 1),
            };
        }

        let first = node.first_child as usize;
        for i in first..first + node.num_children as usize {
            let b = self.nodes[i].byte;
            if b == byte {
                return Some(i);
            }
            if b > byte {
                break;
            }
        }
        None
    }

    fn leaf(&self, key: &[u8]) -> Option<usize> {
        let mut at = 0;
        for &b in key {
            at = self.child(at, b)?;
        }
        (self.nodes[at].num_children == 0).then_some(at)
    }

    /// Leaf value stored for `key`.
    pub fn search(&self, key: &[u8]) -> Option<u32> {
        self.leaf(key).map(|at| self.nodes[at].value)
    }

    /// Overwrite a leaf value. Never creates nodes.
    pub fn set(&mut self, key: &[u8], value: u32) -> Result<()> {
        let mut at = 0;
        for (depth, &b) in key.iter().enumerate() {
            at = self
                .child(at, b)
                .ok_or(Error::MissingPrefix { depth, byte: b })?;
        }
        self.nodes[at].value = value;
        Ok(())
    }

    /// All nodes, breadth first; index 0 is the root.
    pub fn nodes(&self) -> &[PackedNode] {
        &self.nodes
    }

    /// Number of leaves.
    pub fn len(&self) -> usize {
        self.nodes.iter().skip(1).filter(|n| n.num_children == 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Bytes used by the node and map arrays.
    pub fn memory_usage(&self) -> usize {
        self.nodes.len() * std::mem::size_of::<PackedNode>() + self.maps.len() * 4
    }
}
