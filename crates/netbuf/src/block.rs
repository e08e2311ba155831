//! Fixed-capacity blocks with ring-style reuse.
//!
//! A block owns one allocated buffer divided among multiple spans. Three
//! offsets describe the live data:
//!
//! - `start`: first live byte (oldest reservation still held)
//! - `wrap`: exclusive end of the first live segment
//! - `cursor`: exclusive end of the most recent reservation
//!
//! In diagrams, `{$:NN}` marks position type `$` at offset `NN` ([S]tart,
//! [W]rap, [C]ursor, [A]lloc limit), `x` is span-owned data, `o` is free
//! space and `-` is unreachable until the block drains:
//!
//! ```text
//! fresh:          [ {S:0}xxxxxxx{CW:10}ooo{A:12} ]
//! head released:  [ ooo{S:6}xxxx{CW:10}oo{A:12} ]
//! wrapped:        [ xx{C:3}oo{S:6}xxxx{W:10}--{A:12} ]
//! ```
//!
//! With a single segment `cursor == wrap`; once a reservation wraps to
//! offset 0 the block carries two segments, `[start, wrap)` followed by
//! `[0, cursor)`, and `cursor < start` until the first segment drains.
//!
//! Releases normally chew from the head or the tail. A release that lands in
//! the middle of the live region is parked in a [`DeallocQueue`] and applied
//! when the head catches up to it.

use crate::invariants::{debug_assert_block_geometry, debug_assert_live_region};
use crate::pool::{DeaCfg, ElemPool, PoolSpan};
use crate::stats::StatsHandle;

pub(crate) struct MBlock {
    pub(crate) start: u32,
    pub(crate) wrap: u32,
    pub(crate) cursor: u32,
    /// Total bytes allocated in `root`; 0 marks an unused header slot.
    pub(crate) nalloc: u32,
    /// Backing buffer. Constant for the lifetime of the block; its heap
    /// address never moves, so span base pointers handed to the send queue
    /// stay valid until the block is destroyed.
    pub(crate) root: Option<Box<[u8]>>,
    /// Deferred out-of-order releases. Only present once a middle release
    /// has occurred on this block.
    pub(crate) deallocs: Option<Box<DeallocQueue>>,
}

impl MBlock {
    pub(crate) fn unused_slot() -> Self {
        Self {
            start: 0,
            wrap: 0,
            cursor: 0,
            nalloc: 0,
            root: None,
            deallocs: None,
        }
    }

    #[inline]
    pub(crate) fn is_unused(&self) -> bool {
        self.nalloc == 0
    }

    /// A drained block always ends with all three offsets equal. The extra
    /// `wrap` comparison distinguishes that from a wrapped block whose
    /// second segment grew to meet `start` exactly.
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.start == self.cursor && self.cursor == self.wrap
    }

    #[inline]
    pub(crate) fn has_deallocs(&self) -> bool {
        self.deallocs.as_ref().is_some_and(|q| !q.is_drained())
    }

    /// Live bytes: the first segment plus, when wrapped, the second.
    pub(crate) fn live_size(&self) -> u32 {
        if self.is_empty() {
            return 0;
        }
        (self.wrap - self.start) + if self.cursor <= self.start { self.cursor } else { 0 }
    }

    pub(crate) fn root_slice(&self) -> &[u8] {
        self.root.as_deref().expect("block has no backing buffer")
    }

    pub(crate) fn root_slice_mut(&mut self) -> &mut [u8] {
        self.root.as_deref_mut().expect("block has no backing buffer")
    }

    /// Offset of `ptr` within this block's buffer, if it points into it.
    /// Pure address arithmetic; the pointer is never dereferenced.
    pub(crate) fn offset_of(&self, ptr: *const u8) -> Option<u32> {
        let root = self.root.as_deref()?;
        let base = root.as_ptr() as usize;
        let p = ptr as usize;
        if p >= base && p < base + self.nalloc as usize {
            Some((p - base) as u32)
        } else {
            None
        }
    }

    /// Attempts to carve `size` bytes out of this block, appending after
    /// `cursor` or wrapping to offset 0 when the head has made room.
    ///
    /// Returns the offset of the reservation, or `None` if the block cannot
    /// take it. A block with deferred deallocations pending always refuses:
    /// packing new spans behind a hole would break flush ordering.
    pub(crate) fn reserve_active(&mut self, size: u32) -> Option<u32> {
        if self.has_deallocs() {
            return None;
        }

        let offset = if self.cursor > self.start {
            if self.nalloc - self.cursor >= size {
                let offset = self.cursor;
                self.cursor += size;
                self.wrap = self.cursor;
                offset
            } else if self.start >= size {
                // wrap around: a second segment opens at offset 0
                self.cursor = size;
                0
            } else {
                return None;
            }
        } else {
            // already wrapped
            if self.start - self.cursor >= size {
                let offset = self.cursor;
                self.cursor += size;
                offset
            } else {
                return None;
            }
        };

        debug_assert_block_geometry!(self);
        Some(offset)
    }

    /// Re-initializes an empty or recycled block for its first reservation.
    pub(crate) fn reset_for(&mut self, size: u32) {
        debug_assert!(self.deallocs.as_ref().map_or(true, |q| q.is_drained()));
        self.start = 0;
        self.wrap = size;
        self.cursor = size;
        self.deallocs = None;
    }

    /// Returns `size` bytes at `offset` to the block.
    pub(crate) fn release(&mut self, offset: u32, size: u32, dea: DeaCfg, stats: &StatsHandle) {
        debug_assert_live_region!(self, offset, size);

        if offset == self.start {
            self.release_from_head(size);
        } else if offset + size == self.cursor {
            // Removing from the end
            if self.cursor == self.wrap {
                self.cursor -= size;
                self.wrap -= size;
            } else {
                self.cursor -= size;
                if self.cursor == 0 {
                    // second segment fully unwound; back to one segment
                    self.cursor = self.wrap;
                }
            }
        } else {
            self.queue_dealloc(offset, size, dea, stats);
        }

        debug_assert_block_geometry!(self);
    }

    fn release_from_head(&mut self, size: u32) {
        self.start += size;
        loop {
            if let Some(q) = self.deallocs.as_mut() {
                if !q.is_drained() && q.min_offset() == self.start {
                    self.start = q.apply(self.start);
                }
            }
            if !self.is_empty() && self.start == self.wrap {
                // first segment drained; the second rotates in
                self.wrap = self.cursor;
                self.start = 0;
                continue;
            }
            break;
        }
    }

    fn queue_dealloc(&mut self, offset: u32, size: u32, dea: DeaCfg, stats: &StatsHandle) {
        let queue = self.deallocs.get_or_insert_with(|| {
            stats.on_alloc(std::mem::size_of::<DeallocQueue>());
            Box::new(DeallocQueue::new(dea, stats.clone()))
        });
        queue.push(offset, size);
    }

    /// Drops a drained dealloc queue when the block is retired; a recycled
    /// block starts over without one.
    pub(crate) fn retire_dealloc_queue(&mut self, stats: &StatsHandle) {
        if let Some(mut q) = self.deallocs.take() {
            debug_assert!(q.is_drained());
            q.teardown();
            stats.on_free(std::mem::size_of::<DeallocQueue>());
        }
    }

    /// Frees the backing buffer and any dealloc queue, leaving an unused
    /// header slot behind. Idempotent.
    pub(crate) fn destroy(&mut self, stats: &StatsHandle) {
        if let Some(root) = self.root.take() {
            stats.on_free(root.len());
        }
        if let Some(mut q) = self.deallocs.take() {
            q.teardown();
            stats.on_free(std::mem::size_of::<DeallocQueue>());
        }
        self.nalloc = 0;
        self.start = 0;
        self.wrap = 0;
        self.cursor = 0;
    }
}

/// Deferred releases for one block, ordered by arrival.
///
/// Records live in the queue's own element pool, so a burst of out-of-order
/// releases costs one block allocation rather than one per record.
/// `min_offset` is the smallest queued offset; the head-release path uses it
/// as a cheap reject before walking the record chain.
pub(crate) struct DeallocQueue {
    head: Option<PoolSpan>,
    tail: Option<PoolSpan>,
    min_offset: u32,
    qpool: ElemPool<DeallocInfo>,
}

#[derive(Debug, Clone, Copy)]
struct DeallocInfo {
    offset: u32,
    size: u32,
    next: Option<PoolSpan>,
}

impl DeallocQueue {
    fn new(dea: DeaCfg, stats: StatsHandle) -> Self {
        Self {
            head: None,
            tail: None,
            min_offset: u32::MAX,
            qpool: ElemPool::new(dea.basealloc, dea.cacheblocks, dea, stats),
        }
    }

    #[inline]
    pub(crate) fn is_drained(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub(crate) fn min_offset(&self) -> u32 {
        self.min_offset
    }

    fn push(&mut self, offset: u32, size: u32) {
        let rec = self
            .qpool
            .alloc(DeallocInfo {
                offset,
                size,
                next: None,
            })
            .expect("deferred-dealloc record allocation failed");

        match self.tail {
            Some(t) => {
                let mut tr = self.qpool.get(t);
                tr.next = Some(rec);
                self.qpool.set(t, tr);
            }
            None => self.head = Some(rec),
        }
        self.tail = Some(rec);
        if offset < self.min_offset {
            self.min_offset = offset;
        }
    }

    /// Consumes queued records that begin exactly at the advancing `start`,
    /// repeating until no record matches, and returns the new `start`.
    fn apply(&mut self, mut start: u32) -> u32 {
        loop {
            let mut prev: Option<PoolSpan> = None;
            let mut cur = self.head;
            let mut advanced = false;

            while let Some(r) = cur {
                let rec = self.qpool.get(r);
                if rec.offset == start {
                    match prev {
                        None => self.head = rec.next,
                        Some(p) => {
                            let mut pr = self.qpool.get(p);
                            pr.next = rec.next;
                            self.qpool.set(p, pr);
                        }
                    }
                    if rec.next.is_none() {
                        self.tail = prev;
                    }
                    self.qpool.free(r);
                    start += rec.size;
                    advanced = true;
                    break;
                }
                prev = cur;
                cur = rec.next;
            }

            if !advanced {
                break;
            }
        }

        self.min_offset = self.fold_min();
        start
    }

    fn fold_min(&self) -> u32 {
        let mut min = u32::MAX;
        let mut cur = self.head;
        while let Some(r) = cur {
            let rec = self.qpool.get(r);
            if rec.offset < min {
                min = rec.offset;
            }
            cur = rec.next;
        }
        min
    }

    /// Walks the queued `(offset, size)` records in arrival order.
    pub(crate) fn for_each(&self, mut f: impl FnMut(u32, u32)) {
        let mut cur = self.head;
        while let Some(r) = cur {
            let rec = self.qpool.get(r);
            f(rec.offset, rec.size);
            cur = rec.next;
        }
    }

    /// Releases every queued record and the pool behind them.
    fn teardown(&mut self) {
        let mut cur = self.head;
        while let Some(r) = cur {
            let rec = self.qpool.get(r);
            cur = rec.next;
            self.qpool.free(r);
        }
        self.head = None;
        self.tail = None;
        self.min_offset = u32::MAX;
        self.qpool.cleanup();
    }
}
