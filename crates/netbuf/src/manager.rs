//! The manager: one data pool plus one send queue.

use crate::block::MBlock;
use crate::config::Settings;
use crate::error::ReserveError;
use crate::iovec::IoVec;
use crate::pool::{DeaCfg, MBlockPool, PoolCfg};
use crate::sendq::SendQueue;
use crate::span::{Span, SpanRepr};
use crate::stats::{AllocStats, StatsHandle, StatsSnapshot};
use std::io::{self, Write};
use std::rc::Rc;

/// Read-only view of a block's offsets, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    /// First live byte.
    pub start: u32,
    /// Exclusive end of the first live segment.
    pub wrap: u32,
    /// Exclusive end of the most recent reservation.
    pub cursor: u32,
    /// Capacity of the block buffer.
    pub nalloc: u32,
}

/// Write-buffer manager: packed span allocation plus a coalescing send
/// queue, intended one-per-connection.
///
/// The manager is a single-owner object. Every operation completes
/// synchronously; there is no locking and no internal cancellation. Callers
/// multiplexing many connections keep one manager per connection.
pub struct NetBufs {
    sendq: SendQueue,
    datapool: MBlockPool,
    settings: Settings,
    stats: StatsHandle,
}

impl NetBufs {
    /// Creates a manager with default [`Settings`].
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    /// Creates a manager with the given allocation policy.
    pub fn with_settings(settings: Settings) -> Self {
        let stats: StatsHandle = Rc::new(AllocStats::default());
        let dea = DeaCfg {
            basealloc: settings.dealloc_basealloc,
            cacheblocks: settings.dealloc_cacheblocks,
        };
        Self {
            sendq: SendQueue::new(
                settings.sendq_basealloc,
                settings.sendq_cacheblocks,
                dea,
                Rc::clone(&stats),
            ),
            datapool: MBlockPool::new(
                PoolCfg {
                    basealloc: settings.data_basealloc,
                    cacheblocks: settings.data_cacheblocks,
                    dea,
                },
                Rc::clone(&stats),
            ),
            settings,
            stats,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ---------------------------------------------------------------------
    // RESERVE / RELEASE
    // ---------------------------------------------------------------------

    /// Reserves `size` contiguous bytes, ordered after every earlier
    /// reservation. The bytes are reachable through
    /// [`span_slice`](Self::span_slice) /
    /// [`span_slice_mut`](Self::span_slice_mut) until the span is released.
    pub fn reserve(&mut self, size: u32) -> Result<Span, ReserveError> {
        let span = self.datapool.reserve(size)?;
        Ok(Span::pooled(span))
    }

    /// Returns a span's bytes to the data pool. Releasing a standalone span
    /// is a no-op since the caller owns that memory.
    ///
    /// Under the normal protocol the span has been fully flushed (or is
    /// being abandoned after an error); releasing an unflushed span that is
    /// still enqueued would feed garbage to the transport.
    pub fn release(&mut self, span: Span) {
        match span.repr {
            SpanRepr::Pooled(ps) => self.datapool.release(ps),
            SpanRepr::Standalone { .. } => {}
        }
    }

    /// Release by raw pointer, for callers that no longer hold the span.
    /// The owning block is found by scanning the active list.
    ///
    /// # Panics
    ///
    /// Panics if no active block owns `ptr`.
    pub fn release_ptr(&mut self, ptr: *const u8, len: u32) {
        self.datapool.release_ptr(ptr, len);
    }

    /// The bytes covered by a span.
    pub fn span_slice(&self, span: &Span) -> &[u8] {
        match span.repr {
            SpanRepr::Pooled(ps) => self.datapool.span_slice(ps),
            // SAFETY: upheld by the `Span::standalone` contract.
            SpanRepr::Standalone { base, len } => unsafe {
                std::slice::from_raw_parts(base, len as usize)
            },
        }
    }

    /// The bytes covered by a span, writable.
    pub fn span_slice_mut(&mut self, span: &Span) -> &mut [u8] {
        match span.repr {
            SpanRepr::Pooled(ps) => self.datapool.span_slice_mut(ps),
            // SAFETY: upheld by the `Span::standalone` contract.
            SpanRepr::Standalone { base, len } => unsafe {
                std::slice::from_raw_parts_mut(base, len as usize)
            },
        }
    }

    fn span_base(&self, span: &Span) -> *const u8 {
        match span.repr {
            SpanRepr::Pooled(ps) => self.datapool.span_base(ps),
            SpanRepr::Standalone { base, .. } => base,
        }
    }

    // ---------------------------------------------------------------------
    // SEND QUEUE
    // ---------------------------------------------------------------------

    /// Appends a descriptor to the send queue, coalescing with the tail
    /// descriptor when the ranges are physically adjacent.
    pub fn enqueue(&mut self, iov: IoVec) {
        self.sendq.enqueue(iov);
    }

    /// Enqueues a span's entire region.
    pub fn enqueue_span(&mut self, span: &Span) {
        let iov = IoVec::new(self.span_base(span), span.size() as usize);
        self.sendq.enqueue(iov);
    }

    /// Number of pending descriptors after coalescing.
    pub fn iov_count(&self) -> usize {
        self.sendq.iov_count()
    }

    /// Advertises pending bytes into `iovs` and returns the total, capped by
    /// the array. Repeated calls advertise strictly beyond the previous call
    /// until [`end_flush`](Self::end_flush) moves the queue forward.
    pub fn start_flush(&mut self, iovs: &mut [IoVec]) -> u32 {
        self.sendq.start_flush(iovs)
    }

    /// Consumes `nflushed` bytes, as reported by the transport, from the
    /// front of the queue, retiring descriptors that are fully written.
    pub fn end_flush(&mut self, nflushed: u32) {
        self.sendq.end_flush(nflushed);
    }

    /// Forgets the advertisement cursor so the next
    /// [`start_flush`](Self::start_flush) starts over from the head. For
    /// connection teardown; the cursor itself cannot be rewound.
    pub fn reset_flush(&mut self) {
        self.sendq.reset_flush();
    }

    // ---------------------------------------------------------------------
    // INFORMATIONAL
    // ---------------------------------------------------------------------

    /// Largest span the data pool can serve without allocating a block.
    pub fn max_span_size(&self, allow_wrap: bool) -> u32 {
        self.datapool.max_span_size(allow_wrap)
    }

    /// Total live bytes across the data pool. Traverses all blocks.
    pub fn size(&self) -> u32 {
        self.datapool.live_size()
    }

    /// Current allocation counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Offsets of the block a span lives in. `None` for standalone spans.
    pub fn block_geometry(&self, span: &Span) -> Option<BlockGeometry> {
        match span.repr {
            SpanRepr::Pooled(ps) => {
                let b = self.datapool.block(ps.block);
                Some(BlockGeometry {
                    start: b.start,
                    wrap: b.wrap,
                    cursor: b.cursor,
                    nalloc: b.nalloc,
                })
            }
            SpanRepr::Standalone { .. } => None,
        }
    }

    /// Validates every structural invariant of the data pool and the send
    /// queue, panicking on violation. Cheap traversal; meant for tests and
    /// debugging sessions.
    pub fn audit(&self) {
        self.datapool.audit();
        self.sendq.audit();
    }

    // ---------------------------------------------------------------------
    // LIFECYCLE
    // ---------------------------------------------------------------------

    /// Releases every pending send item, frees every block in both pools
    /// and zeroes the statistics. The manager is reusable afterwards, as if
    /// freshly constructed.
    pub fn cleanup(&mut self) {
        self.sendq.teardown();
        self.datapool.cleanup();
        debug_assert_eq!(
            self.stats.total_bytes(),
            0,
            "backing bytes leaked across cleanup"
        );
        self.stats.reset();
        tracing::debug!("manager cleaned up");
    }

    // ---------------------------------------------------------------------
    // DIAGNOSTICS
    // ---------------------------------------------------------------------

    /// Writes a human-readable picture of the data pool and send queue.
    ///
    /// Blocks are drawn in the offset notation used throughout this crate:
    /// `{S:n}` start, `{W:n}` wrap, `{C:n}` cursor, `{A:n}` allocation
    /// limit, with `x` span-owned bytes and `o` free bytes.
    pub fn dump_status(&self, out: &mut dyn Write) -> io::Result<()> {
        let stats = self.stats.snapshot();
        writeln!(out, "Status for NetBufs [nallocs={}]", stats.total_allocs)?;
        writeln!(out, "ACTIVE:")?;
        for block in self.datapool.active_blocks() {
            Self::dump_block(out, block)?;
        }
        self.dump_sendq(out)
    }

    fn dump_block(out: &mut dyn Write, block: &MBlock) -> io::Result<()> {
        writeln!(
            out,
            "  BLOCK(MANAGED) BUF={:p}, {}B",
            block.root_slice().as_ptr(),
            block.nalloc
        )?;
        write!(out, "     USAGE: ")?;
        if block.is_empty() {
            return writeln!(out, "EMPTY");
        }

        write!(out, "[")?;
        if block.cursor == block.wrap {
            if block.start > 0 {
                write!(out, "ooo{{S:{}}}xxx", block.start)?;
            } else {
                write!(out, "{{S:0}}xxxxxx")?;
            }
            if block.nalloc > block.cursor {
                write!(out, "{{CW:{}}}ooo{{A:{}}}", block.cursor, block.nalloc)?;
            } else {
                write!(out, "xxx{{CWA:{}}}", block.cursor)?;
            }
        } else {
            write!(out, "xxx{{C:{}}}ooo{{S:{}}}xxx", block.cursor, block.start)?;
            if block.wrap != block.nalloc {
                write!(out, "{{W:{}}}ooo{{A:{}}}", block.wrap, block.nalloc)?;
            } else {
                write!(out, "xxx{{WA:{}}}", block.wrap)?;
            }
        }
        writeln!(out, "]")?;

        if let Some(q) = block.deallocs.as_ref() {
            if !q.is_drained() {
                write!(out, "     DEFERRED:")?;
                q.for_each(|offset, size| {
                    let _ = write!(out, " [{offset}+{size}]");
                });
                writeln!(out)?;
            }
        }
        Ok(())
    }

    fn dump_sendq(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Send Queue")?;
        let cursor_offset = self.sendq.last_offset();
        let mut result = Ok(());
        self.sendq.for_each_pending(|base, len, at_cursor| {
            if result.is_ok() {
                result = writeln!(out, "  [Base={base:p}, Len={len}]");
            }
            if result.is_ok() && at_cursor {
                result = writeln!(out, "  <Flush limit @{cursor_offset}^^^>");
            }
        });
        result
    }
}

impl Default for NetBufs {
    fn default() -> Self {
        Self::new()
    }
}
