//! Mutable byte trie over fixed-length n-grams.
//!
//! Each node owns its children directly. Leaves carry a `u32` value that is
//! either a count (via [`ByteTrie::increment`]) or a dimension index (assigned
//! by [`ByteTrieBuilder::build`]). Structure is only created by the builder;
//! `set` and `increment` fail on a path that does not exist.
//!
//! For cache-friendly, copyable lookups the trie can be flattened with
//! [`ByteTrie::pack`].

mod packed;

pub use packed::{PackedByteTrie, PackedNode};

use std::fmt;

use smallvec::SmallVec;

use crate::error::{hex, Error, Result};

/// Fan-out above which a node keeps a 256-entry byte → child map.
pub const DEFAULT_MAP_THRESHOLD: usize = 4;

const NO_CHILD: u16 = u16::MAX;

/// Key type yielded by the iterators. N-grams longer than 16 bytes spill.
pub type Key = SmallVec<[u8; 16]>;

/// A node of the trie; the root's byte is unused.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ByteTrie {
    byte: u8,
    value: u32,
    children: Vec<ByteTrie>,
    child_map: Option<Box<[u16; 256]>>,
}

/// Batch construction parameters for [`ByteTrie`].
#[derive(Debug, Clone, Copy)]
pub struct ByteTrieBuilder {
    byte_index: usize,
    value_offset: u32,
    map_threshold: usize,
}

impl Default for ByteTrieBuilder {
    fn default() -> Self {
        Self {
            byte_index: 0,
            value_offset: 0,
            map_threshold: DEFAULT_MAP_THRESHOLD,
        }
    }
}

impl ByteTrieBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only index bytes `byte_index..len` of every n-gram.
    pub fn byte_index(mut self, byte_index: usize) -> Self {
        self.byte_index = byte_index;
        self
    }

    /// Number leaves starting from `offset` instead of 0.
    pub fn value_offset(mut self, offset: u32) -> Self {
        self.value_offset = offset;
        self
    }

    pub fn map_threshold(mut self, threshold: usize) -> Self {
        self.map_threshold = threshold;
        self
    }

    /// Build a trie from `ngrams`, a flat buffer of `len`-byte sequences.
    ///
    /// Leaves are numbered `value_offset, value_offset + 1, ...` in byte-sorted
    /// key order. Repeated bytes are fine on inner levels, but two n-grams that
    /// end in the same leaf are rejected.
    pub fn build(&self, ngrams: &[u8], len: usize) -> Result<ByteTrie> {
        if len == 0 || ngrams.len() % len != 0 {
            return Err(Error::KeyLength {
                expected: len,
                actual: ngrams.len(),
            });
        }

        let mut root = ByteTrie::new();
        if ngrams.is_empty() {
            return Ok(root);
        }
        if self.byte_index >= len {
            return Err(Error::InvalidByteIndex {
                byte_index: self.byte_index,
                len,
            });
        }

        let keys: Vec<&[u8]> = ngrams.chunks_exact(len).collect();
        root.build_level(&keys, self.byte_index, self.value_offset, self.map_threshold)?;
        Ok(root)
    }
}

impl ByteTrie {
    /// An empty trie.
    pub fn new() -> Self {
        Self::default()
    }

    fn build_level(&mut self, keys: &[&[u8]], index: usize, offset: u32, map_threshold: usize) -> Result<()> {
        let len = keys[0].len();

        let mut present = [0u32; 256];
        for key in keys {
            present[key[index] as usize] += 1;
        }

        let last = index + 1 == len;
        self.children = present
            .iter()
            .enumerate()
            .filter(|(_, &n)| n > 0)
            .map(|(b, _)| ByteTrie {
                byte: b as u8,
                ..ByteTrie::default()
            })
            .collect();

        if self.children.len() > map_threshold {
            let mut map = Box::new([NO_CHILD; 256]);
            for (i, child) in self.children.iter().enumerate() {
                map[child.byte as usize] = i as u16;
            }
            self.child_map = Some(map);
        }

        if last {
            if let Some(b) = present.iter().position(|&n| n > 1) {
                return Err(Error::DuplicateLeafByte {
                    depth: index,
                    byte: b as u8,
                });
            }
            for (i, child) in self.children.iter_mut().enumerate() {
                child.value = offset + i as u32;
            }
            return Ok(());
        }

        let mut used = offset;
        let mut subset: Vec<&[u8]> = Vec::new();
        for child in self.children.iter_mut() {
            subset.clear();
            subset.extend(keys.iter().copied().filter(|k| k[index] == child.byte));
            child.build_level(&subset, index + 1, used, map_threshold)?;
            used += subset.len() as u32;
        }
        Ok(())
    }

    /// The byte this node represents.
    pub fn byte(&self) -> u8 {
        self.byte
    }

    /// The leaf value (meaningless on inner nodes).
    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn set_value(&mut self, value: u32) {
        self.value = value;
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of direct children.
    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    pub(crate) fn children(&self) -> &[ByteTrie] {
        &self.children
    }

    pub(crate) fn has_child_map(&self) -> bool {
        self.child_map.is_some()
    }

    fn child_index(&self, byte: u8) -> Option<usize> {
        match &self.child_map {
            Some(map) => match map[byte as usize] {
                NO_CHILD => None,
                i => Some(i as usize),
            },
            None => {
                for (i, c) in self.children.iter().enumerate() {
                    if c.byte == byte {
                        return Some(i);
                    }
                    if c.byte > byte {
                        break;
                    }
                }
                None
            }
        }
    }

    /// The child for `byte`, if any.
    pub fn step(&self, byte: u8) -> Option<&ByteTrie> {
        self.child_index(byte).map(|i| &self.children[i])
    }

    pub fn step_mut(&mut self, byte: u8) -> Option<&mut ByteTrie> {
        self.child_index(byte).map(move |i| &mut self.children[i])
    }

    /// The leaf for `key`, or `None` if the path is missing or does not end
    /// at a leaf.
    pub fn search(&self, key: &[u8]) -> Option<&ByteTrie> {
        let mut node = self;
        for &b in key {
            node = node.step(b)?;
        }
        node.is_leaf().then_some(node)
    }

    pub fn search_mut(&mut self, key: &[u8]) -> Option<&mut ByteTrie> {
        let mut node = self;
        for &b in key {
            node = node.step_mut(b)?;
        }
        if node.is_leaf() {
            Some(node)
        } else {
            None
        }
    }

    /// Value stored for `key`.
    pub fn get(&self, key: &[u8]) -> Option<u32> {
        self.search(key).map(|n| n.value)
    }

    fn walk_mut(&mut self, key: &[u8]) -> Result<&mut ByteTrie> {
        let mut node = self;
        for (depth, &b) in key.iter().enumerate() {
            node = node
                .step_mut(b)
                .ok_or(Error::MissingPrefix { depth, byte: b })?;
        }
        Ok(node)
    }

    /// Overwrite the value at `key`. Never creates nodes.
    pub fn set(&mut self, key: &[u8], value: u32) -> Result<()> {
        self.walk_mut(key)?.value = value;
        Ok(())
    }

    /// Add one to the value at `key` and return the new value. Never creates nodes.
    pub fn increment(&mut self, key: &[u8]) -> Result<u32> {
        let node = self.walk_mut(key)?;
        node.value = node.value.wrapping_add(1);
        Ok(node.value)
    }

    /// Length of the keys held by this trie (depth of the first leaf).
    pub fn len_of_keys(&self) -> usize {
        let mut len = 0;
        let mut node = self;
        while let Some(first) = node.children.first() {
            node = first;
            len += 1;
        }
        len
    }

    /// Number of leaves.
    pub fn trie_size(&self) -> usize {
        self.values().count()
    }

    /// `(key, value)` pairs, depth first, byte-sorted at every level.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            stack: vec![self.children.iter()],
            key: Key::new(),
        }
    }

    /// Keys in byte-sorted order.
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.iter().map(|(k, _)| k)
    }

    /// Leaf values in key order.
    pub fn values(&self) -> impl Iterator<Item = u32> + '_ {
        self.iter().map(|(_, v)| v)
    }

    /// Mutable leaf values in key order.
    pub fn values_mut(&mut self) -> ValuesMut<'_> {
        ValuesMut {
            stack: vec![self.children.iter_mut()],
        }
    }

    /// Hex strings of every key, placed at the index given by its leaf value.
    ///
    /// Only meaningful when the values are distinct dimension indices. Gaps
    /// are left as empty strings.
    pub fn to_ngram_strings(&self) -> Vec<String> {
        let Some(max) = self.values().max() else {
            return Vec::new();
        };
        let mut out = vec![String::new(); max as usize + 1];
        for (key, value) in self.iter() {
            out[value as usize] = hex(&key);
        }
        out
    }

    /// Flatten into one breadth-first node array.
    pub fn pack(&self) -> PackedByteTrie {
        PackedByteTrie::from_trie(self)
    }
}

/// One hex n-gram per line in key order.
impl fmt::Display for ByteTrie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for key in self.keys() {
            writeln!(f, "{}", hex(&key))?;
        }
        Ok(())
    }
}

/// Iterator returned by [`ByteTrie::iter`].
pub struct Iter<'a> {
    stack: Vec<std::slice::Iter<'a, ByteTrie>>,
    key: Key,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (Key, u32);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let depth = self.stack.len();
            let top = self.stack.last_mut()?;
            match top.next() {
                Some(node) => {
                    self.key.truncate(depth - 1);
                    self.key.push(node.byte);
                    if node.is_leaf() {
                        return Some((self.key.clone(), node.value));
                    }
                    self.stack.push(node.children.iter());
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

/// Iterator returned by [`ByteTrie::values_mut`].
pub struct ValuesMut<'a> {
    stack: Vec<std::slice::IterMut<'a, ByteTrie>>,
}

impl<'a> Iterator for ValuesMut<'a> {
    type Item = &'a mut u32;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let top = self.stack.last_mut()?;
            match top.next() {
                Some(ByteTrie {
                    value, children, ..
                }) => {
                    if children.is_empty() {
                        return Some(value);
                    }
                    self.stack.push(children.iter_mut());
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}
