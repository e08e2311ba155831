//! Allocation accounting.
//!
//! Every pool in a manager (the data pool, the send-queue element pool and
//! any lazily created deferred-dealloc pool) shares one [`AllocStats`]
//! through an `Rc` handle and reports each backing allocation and free.
//! `total_bytes` therefore reflects the bytes currently held from the
//! allocator, which lets leak tests assert a clean zero after cleanup.

use std::cell::Cell;
use std::rc::Rc;

pub(crate) type StatsHandle = Rc<AllocStats>;

#[derive(Debug, Default)]
pub(crate) struct AllocStats {
    total_allocs: Cell<u64>,
    total_bytes: Cell<u64>,
}

impl AllocStats {
    pub(crate) fn on_alloc(&self, bytes: usize) {
        self.total_allocs.set(self.total_allocs.get() + 1);
        self.total_bytes.set(self.total_bytes.get() + bytes as u64);
    }

    pub(crate) fn on_free(&self, bytes: usize) {
        debug_assert!(
            self.total_bytes.get() >= bytes as u64,
            "freeing {} bytes with only {} accounted",
            bytes,
            self.total_bytes.get()
        );
        self.total_bytes
            .set(self.total_bytes.get().saturating_sub(bytes as u64));
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bytes.get()
    }

    pub(crate) fn reset(&self) {
        self.total_allocs.set(0);
        self.total_bytes.set(0);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_allocs: self.total_allocs.get(),
            total_bytes: self.total_bytes.get(),
        }
    }
}

/// A point-in-time copy of a manager's allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Number of backing allocations performed since construction (or the
    /// last cleanup). Monotonic.
    pub total_allocs: u64,
    /// Bytes currently held from the backing allocator.
    pub total_bytes: u64,
}
