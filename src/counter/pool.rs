//! Shared pool of bitsets and the batched flush protocol.
//!
//! Every slot carries an atomic state:
//!
//! ```text
//!   Available --claim--> Filling --release(dirty)--> NeedsFlush
//!       ^                   |                             |
//!       |            release(clean)                  try_flush (CAS)
//!       |                   v                             v
//!       +-------------------+<-------- cleared ------- Flushing
//!
//!   Available --drain--> Done
//! ```
//!
//! A bitset is only touched by the thread that moved its slot into `Filling`
//! or `Flushing`, so a flush never reads bits that are still being written
//! and a slot is never handed out again before its bits reach the counts.
//! Groups of up to [`MAX_GROUP_SIZE`] bitsets are merged with one
//! [`CountsArray::increment`] call per word.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::trace;

use super::Bitset;
use crate::counts::CountsArray;
use crate::error::{Error, Result};

/// Largest number of bitsets merged by one flush.
pub const MAX_GROUP_SIZE: usize = 16;

const WAIT: Duration = Duration::from_millis(1);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Available = 0,
    Filling = 1,
    NeedsFlush = 2,
    Flushing = 3,
    Done = 4,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SlotState::Available,
            1 => SlotState::Filling,
            2 => SlotState::NeedsFlush,
            3 => SlotState::Flushing,
            _ => SlotState::Done,
        }
    }
}

struct Slot {
    state: AtomicU8,
    bitset: UnsafeCell<Bitset>,
}

impl Slot {
    fn transition(&self, from: SlotState, to: SlotState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Counters accumulated by a pool over one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Flush operations performed.
    pub flushes: usize,
    /// Bitsets merged into the counts.
    pub flushed_bitsets: usize,
    /// Times a thread had to wait for a free bitset.
    pub waits: usize,
}

/// Fixed set of bitsets shared by all counting threads of a pass.
pub struct BitsetPool {
    slots: Box<[Slot]>,
    group_size: usize,
    lock: Mutex<()>,
    freed: Condvar,
    flushes: AtomicUsize,
    flushed_bitsets: AtomicUsize,
    waits: AtomicUsize,
}

// Each bitset is accessed only by the owner of its slot state (see module docs).
unsafe impl Sync for BitsetPool {}

impl BitsetPool {
    /// `slots` bitsets of `words` words each, flushed `group_size` at a time.
    pub fn new(slots: usize, words: usize, group_size: usize) -> Result<Self> {
        if !(1..=MAX_GROUP_SIZE).contains(&group_size) {
            return Err(Error::InvalidConfig(format!(
                "bitset group size must be between 1 and {MAX_GROUP_SIZE}, got {group_size}"
            )));
        }
        if slots == 0 {
            return Err(Error::InvalidConfig("bitset pool needs at least one slot".into()));
        }

        let slots = (0..slots)
            .map(|_| {
                Ok(Slot {
                    state: AtomicU8::new(SlotState::Available as u8),
                    bitset: UnsafeCell::new(Bitset::new(words)?),
                })
            })
            .collect::<Result<Vec<_>>>()?
            .into_boxed_slice();

        Ok(Self {
            slots,
            group_size,
            lock: Mutex::new(()),
            freed: Condvar::new(),
            flushes: AtomicUsize::new(0),
            flushed_bitsets: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
        })
    }

    /// Number of bitsets in the pool.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Take a free bitset, if there is one.
    pub fn claim(&self) -> Option<BitsetLease<'_>> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.transition(SlotState::Available, SlotState::Filling)
                .then(|| BitsetLease { pool: self, index })
        })
    }

    /// Take a free bitset, flushing pending ones into `counts` or waiting
    /// until one is released.
    pub fn claim_blocking(&self, counts: &CountsArray<'_>) -> Result<BitsetLease<'_>> {
        loop {
            if let Some(lease) = self.claim() {
                return Ok(lease);
            }
            if self.try_flush(counts, 1)? > 0 {
                continue;
            }

            self.waits.fetch_add(1, Ordering::Relaxed);
            let mut guard = self.lock.lock();
            self.freed.wait_for(&mut guard, WAIT);
        }
    }

    /// Claim up to `group_size` bitsets awaiting flush and merge them into
    /// `counts`. Nothing is flushed unless at least `min_group` could be
    /// claimed. Returns the number of bitsets flushed.
    pub fn try_flush(&self, counts: &CountsArray<'_>, min_group: usize) -> Result<usize> {
        let mut group: SmallVec<[usize; MAX_GROUP_SIZE]> = SmallVec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            if group.len() == self.group_size {
                break;
            }
            if slot.transition(SlotState::NeedsFlush, SlotState::Flushing) {
                group.push(index);
            }
        }

        if group.is_empty() || group.len() < min_group {
            for &index in &group {
                self.set_state(index, SlotState::Flushing, SlotState::NeedsFlush)?;
            }
            return Ok(0);
        }

        // SAFETY: every slot in `group` was moved to Flushing by this thread,
        // which gives it exclusive access until it is released below.
        let bitsets: SmallVec<[&mut Bitset; MAX_GROUP_SIZE]> = group
            .iter()
            .map(|&index| unsafe { &mut *self.slots[index].bitset.get() })
            .collect();
        merge(counts, &bitsets);

        for bitset in bitsets {
            bitset.clear();
        }
        for &index in &group {
            self.set_state(index, SlotState::Flushing, SlotState::Available)?;
        }
        self.freed.notify_all();

        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.flushed_bitsets.fetch_add(group.len(), Ordering::Relaxed);
        trace!(bitsets = group.len(), "flushed bitset group");
        Ok(group.len())
    }

    /// Flush everything still pending and retire every slot.
    ///
    /// Must be called once all counting threads are done. A slot still being
    /// filled or flushed at that point is a protocol violation.
    pub fn drain(&self, counts: &CountsArray<'_>) -> Result<usize> {
        let mut flushed = 0;
        loop {
            let n = self.try_flush(counts, 1)?;
            if n == 0 {
                break;
            }
            flushed += n;
        }

        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.transition(SlotState::Available, SlotState::Done) {
                return Err(Error::FlushProtocol(format!(
                    "bitset {index} is {:?} during the final flush",
                    slot.state()
                )));
            }
        }
        Ok(flushed)
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            flushed_bitsets: self.flushed_bitsets.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, index: usize, from: SlotState, to: SlotState) -> Result<()> {
        if self.slots[index].transition(from, to) {
            Ok(())
        } else {
            Err(Error::FlushProtocol(format!(
                "bitset {index} expected {from:?} but was {:?}",
                self.slots[index].state()
            )))
        }
    }
}

/// Add the union of touched words of `bitsets` into `counts`.
fn merge(counts: &CountsArray<'_>, bitsets: &[&mut Bitset]) {
    let lo = bitsets.iter().map(|b| b.touched().start).min().unwrap_or(0);
    let hi = bitsets.iter().map(|b| b.touched().end).max().unwrap_or(0);

    let mut words: SmallVec<[u64; MAX_GROUP_SIZE]> = SmallVec::new();
    for w in lo..hi {
        words.clear();
        words.extend(bitsets.iter().map(|b| b.words()[w]));
        counts.increment(w, &words);
    }
}

/// Exclusive use of one pooled bitset. Dropping the lease hands the bitset
/// back: to the flush queue if anything was set, otherwise straight back to
/// the free list.
pub struct BitsetLease<'p> {
    pool: &'p BitsetPool,
    index: usize,
}

impl BitsetLease<'_> {
    /// The leased bitset.
    pub fn bitset(&mut self) -> &mut Bitset {
        // SAFETY: the slot is in Filling and this lease is its only owner.
        unsafe { &mut *self.pool.slots[self.index].bitset.get() }
    }

    /// Hand the bitset back (same as dropping the lease).
    pub fn release(self) {}
}

impl Drop for BitsetLease<'_> {
    fn drop(&mut self) {
        let next = if self.bitset().is_dirty() {
            SlotState::NeedsFlush
        } else {
            SlotState::Available
        };
        self.pool.slots[self.index]
            .state
            .store(next as u8, Ordering::Release);
        self.pool.freed.notify_all();
    }
}
