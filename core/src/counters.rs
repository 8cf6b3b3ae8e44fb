//! Fixed-size array of independent atomic counters
//!
//! Shared between many concurrent incrementers and a single window rollup.
//! Each slot is its own `AtomicI64`; there is no lock anywhere.
//!
//! ```text
//! worker ─► add(id, 1) ─┐
//! worker ─► add(id, 1) ─┼─► [AtomicI64; N] ─► drain() (swap-with-zero per slot) ─► Vec<i64>
//! worker ─► add(id, 1) ─┘
//! ```
//!
//! `drain` swaps each slot with zero atomically, so an increment is counted
//! exactly once: either before the swap (in this window) or after it (in the
//! next). Increments racing the swap of *another* slot may land on either
//! side of the window boundary; that skew is accepted.
//!
//! Adds saturate at `i64::MAX` instead of wrapping, so a slot of
//! non-negative deltas never drains negative.

use std::sync::atomic::{AtomicI64, Ordering};

/// Per-knob atomic counters
#[derive(Debug)]
pub struct AtomicCounters {
    slots: Box<[AtomicI64]>,
}

impl AtomicCounters {
    /// Create `len` zeroed counters
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| AtomicI64::new(0)).collect(),
        }
    }

    /// Number of slots
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if there are no slots
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Atomically add `delta` to slot `id`, saturating
    ///
    /// Returns `false` (and changes nothing) if `id` is out of range.
    #[inline]
    pub fn add(&self, id: usize, delta: i64) -> bool {
        match self.slots.get(id) {
            Some(slot) => {
                saturating_add(slot, delta);
                true
            }
            None => false,
        }
    }

    /// Add a whole vector slot by slot
    ///
    /// Returns `false` without touching any slot if the lengths differ.
    pub fn add_all(&self, deltas: &[i64]) -> bool {
        if deltas.len() != self.slots.len() {
            return false;
        }
        for (slot, delta) in self.slots.iter().zip(deltas) {
            saturating_add(slot, *delta);
        }
        true
    }

    /// Read-and-reset every slot
    pub fn drain(&self) -> Vec<i64> {
        self.slots
            .iter()
            .map(|slot| slot.swap(0, Ordering::AcqRel))
            .collect()
    }

    /// Current values without resetting
    pub fn peek(&self) -> Vec<i64> {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .collect()
    }
}

#[inline]
fn saturating_add(slot: &AtomicI64, delta: i64) {
    // The closure always returns Some, so the update cannot fail
    let _ = slot.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_add(delta))
    });
}
