//! The send queue: ordered I/O descriptors with physical-adjacency
//! coalescing and a resumable two-phase flush cursor.
//!
//! Spans reserved consecutively from one block occupy adjacent byte ranges,
//! so enqueuing them extends the tail descriptor instead of appending a new
//! one. A contiguous run of small packets therefore costs a single vectored
//! descriptor, which is the whole point of packing them.
//!
//! Flush is two-phase: `start_flush` advertises pending bytes into a caller
//! array without consuming anything, and `end_flush` consumes whatever the
//! transport actually wrote. `last_requested`/`last_offset` remember how far
//! advertisement got, so repeated `start_flush` calls before an `end_flush`
//! each advertise strictly beyond the previous call. The cursor cannot be
//! rewound; a torn-down connection calls `reset_flush` instead.

use crate::invariants::debug_assert_nonempty_item;
use crate::iovec::IoVec;
use crate::pool::{DeaCfg, ElemPool, PoolSpan};
use crate::stats::StatsHandle;

/// One pending descriptor. Records live in the queue's element pool and
/// chain through it; `base` advances as `end_flush` consumes the front.
#[derive(Debug, Clone, Copy)]
struct SendItem {
    base: *const u8,
    len: u32,
    next: Option<PoolSpan>,
}

pub(crate) struct SendQueue {
    head: Option<PoolSpan>,
    tail: Option<PoolSpan>,
    len: usize,
    /// Last item advertised by `start_flush`, or `None` when advertisement
    /// restarts from the head. A borrowed position, not an owner.
    last_requested: Option<PoolSpan>,
    /// How much of `last_requested` has been advertised.
    last_offset: u32,
    elempool: ElemPool<SendItem>,
}

impl SendQueue {
    pub(crate) fn new(
        basealloc_elems: u32,
        cacheblocks: u32,
        dea: DeaCfg,
        stats: StatsHandle,
    ) -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            last_requested: None,
            last_offset: 0,
            elempool: ElemPool::new(basealloc_elems, cacheblocks, dea, stats),
        }
    }

    /// Appends a descriptor, extending the tail item when the new range
    /// begins exactly where the tail ends.
    ///
    /// # Panics
    ///
    /// Panics on a zero-length descriptor; advertising an empty range is a
    /// caller bug.
    pub(crate) fn enqueue(&mut self, iov: IoVec) {
        assert!(!iov.is_empty(), "zero-length descriptor enqueued");
        let len = iov.len() as u32;

        if let Some(t) = self.tail {
            let mut item = self.elempool.get(t);
            if item.base as usize + item.len as usize == iov.as_ptr() as usize {
                item.len += len;
                self.elempool.set(t, item);
                return;
            }
        }

        let rec = self
            .elempool
            .alloc(SendItem {
                base: iov.as_ptr(),
                len,
                next: None,
            })
            .expect("send-queue element allocation failed");
        match self.tail {
            Some(t) => {
                let mut tr = self.elempool.get(t);
                tr.next = Some(rec);
                self.elempool.set(t, tr);
            }
            None => self.head = Some(rec),
        }
        self.tail = Some(rec);
        self.len += 1;
    }

    /// Fills `iovs` with pending descriptors beyond the advertisement
    /// cursor and returns the total bytes advertised, capped by the array.
    ///
    /// The unsent suffix of the cursor item comes first, then whole
    /// successors. The cursor moves to the last descriptor written, so a
    /// following call continues after the bytes just advertised and returns
    /// 0 once everything pending has been handed out.
    pub(crate) fn start_flush(&mut self, iovs: &mut [IoVec]) -> u32 {
        let mut ret = 0u32;
        let mut out = iovs.iter_mut();
        let mut win: Option<PoolSpan> = None;

        let mut cur = if let Some(lr) = self.last_requested {
            let item = self.elempool.get(lr);
            if self.last_offset != item.len {
                debug_assert!(item.len > self.last_offset);
                if let Some(slot) = out.next() {
                    // SAFETY: the suffix stays within the enqueued run.
                    let base = unsafe { item.base.add(self.last_offset as usize) };
                    *slot = IoVec::new(base, (item.len - self.last_offset) as usize);
                    ret += item.len - self.last_offset;
                    win = Some(lr);
                }
            }
            item.next
        } else {
            self.head
        };

        while let Some(r) = cur {
            let Some(slot) = out.next() else { break };
            let item = self.elempool.get(r);
            debug_assert_nonempty_item!(item.len);
            *slot = IoVec::new(item.base, item.len as usize);
            ret += item.len;
            win = Some(r);
            cur = item.next;
        }

        if let Some(w) = win {
            self.last_offset = self.elempool.get(w).len;
            self.last_requested = Some(w);
        }
        ret
    }

    /// Consumes `nflushed` bytes from the head of the queue, retiring items
    /// as they empty. Touching the cursor item clears the advertisement
    /// cursor so the unconsumed remainder is advertised again.
    ///
    /// Consuming more than was advertised is a caller bug: debug builds
    /// assert, release builds saturate at an empty queue.
    pub(crate) fn end_flush(&mut self, mut nflushed: u32) {
        while nflushed > 0 {
            let Some(h) = self.head else { break };
            let mut item = self.elempool.get(h);
            let chop = item.len.min(nflushed);
            item.len -= chop;
            nflushed -= chop;

            if self.last_requested == Some(h) {
                self.last_requested = None;
                self.last_offset = 0;
            }

            if item.len == 0 {
                self.head = item.next;
                if self.head.is_none() {
                    self.tail = None;
                }
                self.len -= 1;
                self.elempool.free(h);
            } else {
                // SAFETY: chop < len here, so the advance stays in the run.
                item.base = unsafe { item.base.add(chop as usize) };
                self.elempool.set(h, item);
            }
        }
        debug_assert!(nflushed == 0, "end_flush consumed more than was advertised");
    }

    /// Number of pending descriptors after coalescing.
    #[inline]
    pub(crate) fn iov_count(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Forgets the advertisement cursor; the next `start_flush` starts over
    /// from the head.
    pub(crate) fn reset_flush(&mut self) {
        self.last_requested = None;
        self.last_offset = 0;
    }

    /// Walks pending items in order; `f` receives `(base, len, at_cursor)`.
    pub(crate) fn for_each_pending(&self, mut f: impl FnMut(*const u8, u32, bool)) {
        let mut cur = self.head;
        while let Some(r) = cur {
            let item = self.elempool.get(r);
            f(item.base, item.len, self.last_requested == Some(r));
            cur = item.next;
        }
    }

    pub(crate) fn last_offset(&self) -> u32 {
        self.last_offset
    }

    /// Releases every pending item back to the element pool.
    pub(crate) fn clear(&mut self) {
        let mut cur = self.head;
        while let Some(r) = cur {
            let item = self.elempool.get(r);
            cur = item.next;
            self.elempool.free(r);
        }
        self.head = None;
        self.tail = None;
        self.len = 0;
        self.reset_flush();
    }

    /// Drains the queue and frees the element pool behind it.
    pub(crate) fn teardown(&mut self) {
        self.clear();
        self.elempool.cleanup();
    }

    /// Validates the queue's structural invariants, panicking on violation.
    pub(crate) fn audit(&self) {
        let mut n = 0usize;
        let mut found_cursor = self.last_requested.is_none();
        let mut last = None;
        let mut cur = self.head;
        while let Some(r) = cur {
            let item = self.elempool.get(r);
            assert!(item.len > 0, "pending send item with zero length");
            if self.last_requested == Some(r) {
                found_cursor = true;
                assert!(
                    self.last_offset <= item.len,
                    "advertisement cursor past the item"
                );
            }
            last = Some(r);
            n += 1;
            cur = item.next;
        }
        assert_eq!(n, self.len, "send-queue length out of sync");
        assert_eq!(last, self.tail, "send-queue tail out of sync");
        assert!(found_cursor, "flush cursor points outside the pending list");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::AllocStats;
    use std::rc::Rc;

    fn sendq() -> SendQueue {
        SendQueue::new(
            8,
            1,
            DeaCfg {
                basealloc: 4,
                cacheblocks: 0,
            },
            Rc::new(AllocStats::default()),
        )
    }

    #[test]
    fn adjacent_ranges_coalesce() {
        let buf = [0u8; 64];
        let mut q = sendq();

        q.enqueue(IoVec::new(buf.as_ptr(), 16));
        // SAFETY: within `buf`
        q.enqueue(IoVec::new(unsafe { buf.as_ptr().add(16) }, 16));
        assert_eq!(q.iov_count(), 1);

        // a gap breaks the run
        q.enqueue(IoVec::new(unsafe { buf.as_ptr().add(40) }, 8));
        assert_eq!(q.iov_count(), 2);
        q.audit();

        let mut iovs = [IoVec::default(); 4];
        assert_eq!(q.start_flush(&mut iovs), 40);
        assert_eq!(iovs[0].len(), 32);
        assert_eq!(iovs[1].len(), 8);
        q.teardown();
    }

    #[test]
    fn flush_resumes_after_partial_consumption() {
        let buf = [0u8; 64];
        let mut q = sendq();
        q.enqueue(IoVec::new(buf.as_ptr(), 32));

        let mut iovs = [IoVec::default(); 1];
        assert_eq!(q.start_flush(&mut iovs), 32);
        // everything advertised; nothing more to hand out
        assert_eq!(q.start_flush(&mut iovs), 0);

        q.end_flush(20);
        q.audit();
        // the unconsumed remainder is advertised again
        assert_eq!(q.start_flush(&mut iovs), 12);
        assert_eq!(iovs[0].as_ptr() as usize, buf.as_ptr() as usize + 20);
        q.end_flush(12);
        assert!(q.is_empty());
        q.audit();
        q.teardown();
    }

    #[test]
    fn small_iov_array_caps_advertisement() {
        let buf = [0u8; 64];
        let mut q = sendq();
        // gaps keep the three ranges from coalescing
        q.enqueue(IoVec::new(buf.as_ptr(), 16));
        q.enqueue(IoVec::new(unsafe { buf.as_ptr().add(20) }, 16));
        q.enqueue(IoVec::new(unsafe { buf.as_ptr().add(40) }, 16));
        assert_eq!(q.iov_count(), 3);

        let mut one = [IoVec::default(); 1];
        assert_eq!(q.start_flush(&mut one), 16);
        assert_eq!(q.start_flush(&mut one), 16);
        assert_eq!(q.start_flush(&mut one), 16);
        assert_eq!(q.start_flush(&mut one), 0);
        q.audit();
        q.teardown();
    }

    #[test]
    fn reset_flush_re_advertises_from_the_head() {
        let buf = [0u8; 64];
        let mut q = sendq();
        q.enqueue(IoVec::new(buf.as_ptr(), 48));

        let mut iovs = [IoVec::default(); 2];
        assert_eq!(q.start_flush(&mut iovs), 48);
        assert_eq!(q.start_flush(&mut iovs), 0);

        q.reset_flush();
        assert_eq!(q.start_flush(&mut iovs), 48);
        q.teardown();
    }
}
