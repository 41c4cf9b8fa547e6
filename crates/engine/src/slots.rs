//! Processing slots and waiting-queue capacity.
//!
//! Only root records consume a processing slot. Children of a running root
//! are dispatched without one so a composite processor cannot starve its own
//! sub-jobs.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Default number of concurrently processed roots.
pub const DEFAULT_PROCESSING_SLOTS: usize = 1000;

/// Runtime-tunable slot counters. Changes apply on the next dispatch cycle.
#[derive(Debug)]
pub struct SlotManager {
    processing_slots: AtomicUsize,
    /// 0 means unlimited.
    max_waiting_slots: AtomicUsize,
    used: AtomicUsize,
}

impl SlotManager {
    pub fn new(processing_slots: usize, max_waiting_slots: usize) -> Self {
        Self {
            processing_slots: AtomicUsize::new(processing_slots),
            max_waiting_slots: AtomicUsize::new(max_waiting_slots),
            used: AtomicUsize::new(0),
        }
    }

    pub fn processing_slots(&self) -> usize {
        self.processing_slots.load(Ordering::SeqCst)
    }

    /// 0 pauses new root dispatch; running jobs are left alone.
    pub fn set_processing_slots(&self, count: usize) {
        self.processing_slots.store(count, Ordering::SeqCst);
    }

    pub fn max_waiting_slots(&self) -> usize {
        self.max_waiting_slots.load(Ordering::SeqCst)
    }

    pub fn set_max_waiting_slots(&self, count: usize) {
        self.max_waiting_slots.store(count, Ordering::SeqCst);
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    /// Slots not taken by running roots.
    pub fn available(&self) -> usize {
        self.processing_slots().saturating_sub(self.used())
    }

    /// Take one slot for a claimed root.
    pub fn acquire(&self) {
        self.used.fetch_add(1, Ordering::SeqCst);
    }

    /// Return a slot. Never underflows.
    pub fn release(&self) {
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Remaining waiting capacity given `waiting` queued records;
    /// `None` when unlimited.
    pub fn waiting_capacity(&self, waiting: usize) -> Option<usize> {
        match self.max_waiting_slots() {
            0 => None,
            max => Some(max.saturating_sub(waiting)),
        }
    }
}

impl Default for SlotManager {
    fn default() -> Self {
        Self::new(DEFAULT_PROCESSING_SLOTS, 0)
    }
}

/// Answer of `get_server_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub available_slots: usize,
    pub used_slots: usize,
    /// `None` when the waiting queue is unlimited.
    pub waiting_capacity: Option<usize>,
    pub waiting_count: usize,
    pub running_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_tracks_used_and_resizes() {
        let slots = SlotManager::new(2, 0);
        slots.acquire();
        assert_eq!(slots.available(), 1);
        slots.acquire();
        slots.acquire();
        assert_eq!(slots.available(), 0);

        slots.set_processing_slots(5);
        assert_eq!(slots.available(), 2);
        slots.set_processing_slots(0);
        assert_eq!(slots.available(), 0);
    }

    #[test]
    fn release_never_underflows() {
        let slots = SlotManager::default();
        slots.release();
        assert_eq!(slots.used(), 0);
        assert_eq!(slots.available(), DEFAULT_PROCESSING_SLOTS);
    }

    #[test]
    fn zero_waiting_limit_is_unlimited() {
        let slots = SlotManager::new(1, 0);
        assert_eq!(slots.waiting_capacity(10_000), None);
        slots.set_max_waiting_slots(3);
        assert_eq!(slots.waiting_capacity(1), Some(2));
        assert_eq!(slots.waiting_capacity(7), Some(0));
    }
}
