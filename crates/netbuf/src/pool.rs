//! Block pools: span reservation and release.
//!
//! A pool owns an arena of block header slots. The first `cacheblocks` slots
//! are preallocated so early blocks never touch the heap for their headers;
//! slots past that point are "standalone" and their indices are recycled
//! through a freelist once destroyed. Reservations are served from the most
//! recently appended active block so flush ordering matches reservation
//! ordering; a block that cannot take the span is left in place and a
//! sibling becomes the new tail.

use crate::block::MBlock;
use crate::error::ReserveError;
use crate::stats::StatsHandle;
use std::marker::PhantomData;

/// Index of a block header slot in its pool's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockId(pub(crate) u32);

/// A reserved region: owning block, byte offset and caller-requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolSpan {
    pub(crate) block: BlockId,
    pub(crate) offset: u32,
    pub(crate) size: u32,
}

/// Allocation policy for the dealloc queues a pool's blocks may grow.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeaCfg {
    /// Records per dealloc block.
    pub(crate) basealloc: u32,
    /// Preallocated header slots per dealloc pool.
    pub(crate) cacheblocks: u32,
}

/// Allocation policy for one pool.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolCfg {
    /// Default block capacity in bytes; doubled until a reservation fits.
    pub(crate) basealloc: u32,
    /// Preallocated header slots.
    pub(crate) cacheblocks: u32,
    pub(crate) dea: DeaCfg,
}

pub(crate) struct MBlockPool {
    /// Header arena; indices are stable for the life of the pool.
    blocks: Vec<MBlock>,
    /// Non-empty blocks in reservation order; the last entry serves next.
    active: Vec<BlockId>,
    /// Empty blocks held for reuse.
    avail: Vec<BlockId>,
    /// Recycled standalone header slots.
    free_headers: Vec<BlockId>,
    /// Standalone blocks currently retained in `avail`, and the cap on them.
    curblocks: u32,
    maxblocks: u32,
    cfg: PoolCfg,
    stats: StatsHandle,
}

impl MBlockPool {
    pub(crate) fn new(cfg: PoolCfg, stats: StatsHandle) -> Self {
        debug_assert!(cfg.basealloc > 0, "block capacity must be non-zero");
        let blocks = (0..cfg.cacheblocks).map(|_| MBlock::unused_slot()).collect();
        Self {
            blocks,
            active: Vec::new(),
            avail: Vec::new(),
            free_headers: Vec::new(),
            curblocks: 0,
            maxblocks: cfg.cacheblocks,
            cfg,
            stats,
        }
    }

    #[inline]
    fn is_standalone(&self, id: BlockId) -> bool {
        id.0 >= self.cfg.cacheblocks
    }

    // ---------------------------------------------------------------------
    // RESERVATION
    // ---------------------------------------------------------------------

    /// Reserves `size` contiguous bytes, in order after every earlier
    /// reservation. Fails only if a new block was needed and its backing
    /// allocation failed; no partial state is left behind in that case.
    pub(crate) fn reserve(&mut self, size: u32) -> Result<PoolSpan, ReserveError> {
        assert!(size > 0, "reserve of zero bytes");

        if let Some(&tail) = self.active.last() {
            if let Some(offset) = self.blocks[tail.0 as usize].reserve_active(size) {
                return Ok(PoolSpan {
                    block: tail,
                    offset,
                    size,
                });
            }
        }
        self.reserve_empty(size)
    }

    /// Serves a reservation from an empty block, reusing one from `avail`
    /// when it is large enough and allocating otherwise. The block becomes
    /// the new active tail.
    fn reserve_empty(&mut self, size: u32) -> Result<PoolSpan, ReserveError> {
        let id = match self.find_free_block(size) {
            Some(id) => id,
            None => self.alloc_new_block(size)?,
        };

        self.blocks[id.0 as usize].reset_for(size);
        self.active.push(id);
        Ok(PoolSpan {
            block: id,
            offset: 0,
            size,
        })
    }

    /// First block in `avail` with room for `size` bytes, unlinked.
    fn find_free_block(&mut self, size: u32) -> Option<BlockId> {
        let pos = self
            .avail
            .iter()
            .position(|&id| self.blocks[id.0 as usize].nalloc >= size)?;
        let id = self.avail.remove(pos);
        if self.is_standalone(id) {
            self.curblocks -= 1;
        }
        Some(id)
    }

    /// Creates a block with capacity doubled up from `basealloc` until
    /// `size` fits, preferring an unused preallocated header slot, then a
    /// recycled standalone slot, then a fresh one.
    fn alloc_new_block(&mut self, size: u32) -> Result<BlockId, ReserveError> {
        let mut id = (0..self.cfg.cacheblocks)
            .map(BlockId)
            .find(|id| self.blocks[id.0 as usize].is_unused());
        if id.is_none() {
            id = self.free_headers.pop();
        }
        let id = match id {
            Some(id) => id,
            None => {
                self.blocks.push(MBlock::unused_slot());
                BlockId((self.blocks.len() - 1) as u32)
            }
        };

        let mut nalloc = self.cfg.basealloc.max(1);
        while nalloc < size {
            nalloc = nalloc
                .checked_mul(2)
                .ok_or(ReserveError::OutOfMemory { requested: size })?;
        }

        let root = match Self::alloc_root(nalloc) {
            Ok(root) => root,
            Err(err) => {
                // the slot stays unused; keep recycled indices findable
                if self.is_standalone(id) {
                    self.free_headers.push(id);
                }
                return Err(err);
            }
        };
        self.stats.on_alloc(nalloc as usize);
        tracing::trace!(nalloc, "allocated block");

        let block = &mut self.blocks[id.0 as usize];
        block.nalloc = nalloc;
        block.root = Some(root);
        block.deallocs = None;
        Ok(id)
    }

    fn alloc_root(nalloc: u32) -> Result<Box<[u8]>, ReserveError> {
        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(nalloc as usize)
            .map_err(|e| ReserveError::from_try_reserve(nalloc, e))?;
        buf.resize(nalloc as usize, 0);
        Ok(buf.into_boxed_slice())
    }

    // ---------------------------------------------------------------------
    // RELEASE
    // ---------------------------------------------------------------------

    /// Returns a reserved region to its block. An emptied block leaves the
    /// active list and is retired to `avail` or destroyed.
    pub(crate) fn release(&mut self, span: PoolSpan) {
        let dea = self.cfg.dea;
        let block = &mut self.blocks[span.block.0 as usize];
        block.release(span.offset, span.size, dea, &self.stats);
        if block.is_empty() {
            self.relocate(span.block);
        }
    }

    /// Release by raw pointer: locates the owning block by scanning the
    /// active list for the buffer range containing `ptr`.
    ///
    /// # Panics
    ///
    /// Panics if no active block owns the pointer; that indicates a caller
    /// bug (double release, or a pointer from some other allocation).
    pub(crate) fn release_ptr(&mut self, ptr: *const u8, len: u32) {
        let found = self.active.iter().find_map(|&id| {
            self.blocks[id.0 as usize]
                .offset_of(ptr)
                .map(|offset| (id, offset))
        });
        match found {
            Some((id, offset)) => self.release(PoolSpan {
                block: id,
                offset,
                size: len,
            }),
            None => panic!("released pointer does not belong to any active block"),
        }
    }

    /// Unlinks an emptied block from `active` and retires it. Preallocated
    /// headers always go back to `avail`; standalone headers are retained up
    /// to `maxblocks` and destroyed past that.
    fn relocate(&mut self, id: BlockId) {
        let pos = self
            .active
            .iter()
            .position(|&b| b == id)
            .expect("relocated block is not active");
        self.active.remove(pos);

        // a drained dealloc queue does not survive retirement
        self.blocks[id.0 as usize].retire_dealloc_queue(&self.stats);

        if self.is_standalone(id) {
            if self.curblocks < self.maxblocks {
                self.curblocks += 1;
                self.avail.push(id);
            } else {
                self.destroy_block(id);
            }
        } else {
            self.avail.push(id);
        }
    }

    fn destroy_block(&mut self, id: BlockId) {
        tracing::trace!(nalloc = self.blocks[id.0 as usize].nalloc, "destroying block");
        self.blocks[id.0 as usize].destroy(&self.stats);
        self.free_headers.push(id);
    }

    // ---------------------------------------------------------------------
    // INFORMATIONAL
    // ---------------------------------------------------------------------

    /// Largest reservation the active tail block can take without a new
    /// block. `allow_wrap` also considers the head room a wrap-around would
    /// reach, trading the bytes after `wrap` for it.
    pub(crate) fn max_span_size(&self, allow_wrap: bool) -> u32 {
        let Some(&tail) = self.active.last() else {
            return 0;
        };
        let b = &self.blocks[tail.0 as usize];
        if b.has_deallocs() {
            return 0;
        }

        if b.start == 0 {
            return b.nalloc - b.cursor;
        }
        if b.cursor != b.wrap {
            // already in the second segment
            return b.start - b.cursor;
        }
        if allow_wrap {
            return (b.nalloc - b.wrap).max(b.start);
        }
        b.nalloc - b.wrap
    }

    /// Sum of live bytes across the active blocks.
    pub(crate) fn live_size(&self) -> u32 {
        self.active
            .iter()
            .map(|&id| self.blocks[id.0 as usize].live_size())
            .sum()
    }

    pub(crate) fn block(&self, id: BlockId) -> &MBlock {
        &self.blocks[id.0 as usize]
    }

    pub(crate) fn active_blocks(&self) -> impl Iterator<Item = &MBlock> + '_ {
        self.active.iter().map(move |&id| &self.blocks[id.0 as usize])
    }

    // ---------------------------------------------------------------------
    // SPAN ACCESS
    // ---------------------------------------------------------------------

    pub(crate) fn span_slice(&self, span: PoolSpan) -> &[u8] {
        let b = self.block(span.block);
        &b.root_slice()[span.offset as usize..(span.offset + span.size) as usize]
    }

    pub(crate) fn span_slice_mut(&mut self, span: PoolSpan) -> &mut [u8] {
        let b = &mut self.blocks[span.block.0 as usize];
        &mut b.root_slice_mut()[span.offset as usize..(span.offset + span.size) as usize]
    }

    /// Base pointer of a reserved region. The pointer carries provenance
    /// over the whole block buffer, so send-queue coalescing may extend a
    /// descriptor across adjacent spans of the same block.
    pub(crate) fn span_base(&self, span: PoolSpan) -> *const u8 {
        let root = self.block(span.block).root_slice();
        debug_assert!((span.offset + span.size) as usize <= root.len());
        // SAFETY: the reservation contract keeps offset within the buffer.
        unsafe { root.as_ptr().add(span.offset as usize) }
    }

    // ---------------------------------------------------------------------
    // LIFECYCLE
    // ---------------------------------------------------------------------

    /// Frees every block, preallocated and standalone, and resets the pool
    /// to its freshly initialized state. Idempotent.
    pub(crate) fn cleanup(&mut self) {
        for block in &mut self.blocks {
            block.destroy(&self.stats);
        }
        self.blocks.truncate(self.cfg.cacheblocks as usize);
        self.active.clear();
        self.avail.clear();
        self.free_headers.clear();
        self.curblocks = 0;
    }

    /// Validates the pool's structural invariants, panicking on violation.
    pub(crate) fn audit(&self) {
        for &id in &self.active {
            let b = self.block(id);
            assert!(!b.is_unused(), "active block with no capacity");
            assert!(!b.is_empty(), "active block is empty but was not retired");
            assert!(
                b.start <= b.wrap && b.wrap <= b.nalloc && b.cursor <= b.nalloc,
                "block cursors out of bounds: start={} wrap={} cursor={} nalloc={}",
                b.start,
                b.wrap,
                b.cursor,
                b.nalloc
            );
            if b.cursor > b.start {
                assert_eq!(b.wrap, b.cursor, "single-segment block with detached wrap");
            } else {
                assert!(b.wrap > b.start, "two-segment block with empty first segment");
            }
            if let Some(q) = b.deallocs.as_ref() {
                let mut min = u32::MAX;
                q.for_each(|offset, size| {
                    assert!(size > 0, "queued dealloc record with zero size");
                    min = min.min(offset);
                });
                assert_eq!(q.min_offset(), min, "stale min_offset in dealloc queue");
            }
        }

        let mut standalone_avail = 0;
        for &id in &self.avail {
            assert!(self.block(id).is_empty(), "available block holds live bytes");
            if self.is_standalone(id) {
                standalone_avail += 1;
            }
        }
        assert_eq!(self.curblocks, standalone_avail, "curblocks out of sync");
        assert!(self.curblocks <= self.maxblocks, "standalone retention over cap");
    }
}

impl Drop for MBlockPool {
    fn drop(&mut self) {
        // keep the shared allocation counters truthful on teardown
        self.cleanup();
    }
}

// ---------------------------------------------------------------------
// TYPED ELEMENT POOL
// ---------------------------------------------------------------------

/// A pool of fixed-size records packed into block buffers.
///
/// Records are plain-data (`Copy`) values moved in and out by value, so the
/// byte buffers need no alignment guarantees. Send-queue elements and
/// deferred-dealloc records both live in pools like this, sized so that one
/// block holds `basealloc_elems` records.
pub(crate) struct ElemPool<T> {
    pool: MBlockPool,
    _elem: PhantomData<T>,
}

impl<T: Copy> ElemPool<T> {
    pub(crate) fn new(
        basealloc_elems: u32,
        cacheblocks: u32,
        dea: DeaCfg,
        stats: StatsHandle,
    ) -> Self {
        let elem_size = std::mem::size_of::<T>() as u32;
        Self {
            pool: MBlockPool::new(
                PoolCfg {
                    basealloc: elem_size * basealloc_elems.max(1),
                    cacheblocks,
                    dea,
                },
                stats,
            ),
            _elem: PhantomData,
        }
    }

    pub(crate) fn alloc(&mut self, value: T) -> Result<PoolSpan, ReserveError> {
        let span = self.pool.reserve(std::mem::size_of::<T>() as u32)?;
        self.set(span, value);
        Ok(span)
    }

    pub(crate) fn get(&self, span: PoolSpan) -> T {
        debug_assert_eq!(span.size as usize, std::mem::size_of::<T>());
        // SAFETY: the span names a reserved region of exactly
        // size_of::<T>() bytes, initialized by `alloc` or `set`. T is Copy,
        // so an unaligned by-value read is sound.
        unsafe { std::ptr::read_unaligned(self.pool.span_slice(span).as_ptr().cast::<T>()) }
    }

    pub(crate) fn set(&mut self, span: PoolSpan, value: T) {
        debug_assert_eq!(span.size as usize, std::mem::size_of::<T>());
        // SAFETY: the span names a reserved region of exactly
        // size_of::<T>() bytes, exclusively borrowed through &mut self.
        unsafe {
            std::ptr::write_unaligned(
                self.pool.span_slice_mut(span).as_mut_ptr().cast::<T>(),
                value,
            );
        }
    }

    pub(crate) fn free(&mut self, span: PoolSpan) {
        self.pool.release(span);
    }

    pub(crate) fn cleanup(&mut self) {
        self.pool.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::AllocStats;
    use std::rc::Rc;

    fn pool(basealloc: u32, cacheblocks: u32) -> MBlockPool {
        MBlockPool::new(
            PoolCfg {
                basealloc,
                cacheblocks,
                dea: DeaCfg {
                    basealloc: 4,
                    cacheblocks: 0,
                },
            },
            Rc::new(AllocStats::default()),
        )
    }

    #[test]
    fn capacity_doubles_until_the_span_fits() {
        let mut p = pool(8, 2);
        let span = p.reserve(100).unwrap();
        assert_eq!(span.offset, 0);
        assert_eq!(p.block(span.block).nalloc, 128);
        p.release(span);
        p.audit();
    }

    #[test]
    fn sibling_block_becomes_the_tail_when_full() {
        let mut p = pool(64, 2);
        let a = p.reserve(40).unwrap();
        let b = p.reserve(40).unwrap();
        assert_ne!(a.block, b.block);
        assert_eq!(b.offset, 0);

        // the stranded first block still releases directly
        p.release(a);
        p.release(b);
        p.audit();
        assert_eq!(p.live_size(), 0);
    }

    #[test]
    fn standalone_retention_is_capped() {
        let mut p = pool(16, 1);
        let spans: Vec<_> = (0..3).map(|_| p.reserve(16).unwrap()).collect();
        let bytes_before = p.stats.total_bytes();

        // preallocated header: retired to avail unconditionally
        p.release(spans[0]);
        // first standalone: retained (cap is cacheblocks = 1)
        p.release(spans[1]);
        assert_eq!(p.stats.total_bytes(), bytes_before);
        // second standalone: over the cap, destroyed
        p.release(spans[2]);
        assert_eq!(p.stats.total_bytes(), bytes_before - 16);
        p.audit();

        // destroyed header slots are recycled before new ones are pushed
        let arena_len = p.blocks.len();
        let _a = p.reserve(16).unwrap();
        let _b = p.reserve(16).unwrap();
        let _c = p.reserve(16).unwrap();
        assert_eq!(p.blocks.len(), arena_len);
    }

    #[test]
    fn release_by_pointer_finds_the_owning_block() {
        let mut p = pool(64, 2);
        let a = p.reserve(10).unwrap();
        let b = p.reserve(10).unwrap();
        let ptr = p.span_base(b);
        p.release_ptr(ptr, 10);
        p.release(a);
        assert_eq!(p.live_size(), 0);
        p.audit();
    }

    #[test]
    #[should_panic(expected = "does not belong to any active block")]
    fn release_of_a_foreign_pointer_panics() {
        let mut p = pool(64, 2);
        let _a = p.reserve(10).unwrap();
        let foreign = [0u8; 4];
        p.release_ptr(foreign.as_ptr(), 4);
    }

    #[test]
    fn max_span_size_follows_the_tail_geometry() {
        let mut p = pool(64, 2);
        assert_eq!(p.max_span_size(true), 0);

        let a = p.reserve(16).unwrap();
        let b = p.reserve(16).unwrap();
        // single segment, start == 0
        assert_eq!(p.max_span_size(false), 32);
        assert_eq!(p.max_span_size(true), 32);

        p.release(a);
        // single segment, head released: wrapping reaches 16 head bytes,
        // packing reaches 32 tail bytes
        assert_eq!(p.max_span_size(false), 32);
        assert_eq!(p.max_span_size(true), 32);

        let c = p.reserve(32).unwrap();
        assert_eq!(c.offset, 32);
        p.release(b);
        p.release(c);
        p.audit();
    }

    #[test]
    fn max_span_size_prefers_wrap_room_when_larger() {
        let mut p = pool(64, 2);
        let a = p.reserve(40).unwrap();
        let b = p.reserve(16).unwrap();
        p.release(a);
        // start=40, wrap=cursor=56: 8 tail bytes vs 40 head bytes
        assert_eq!(p.max_span_size(false), 8);
        assert_eq!(p.max_span_size(true), 40);

        let c = p.reserve(30).unwrap();
        assert_eq!(c.offset, 0);
        // second segment: room up to start
        assert_eq!(p.max_span_size(true), 10);
        p.release(b);
        p.release(c);
    }

    #[test]
    fn element_pool_round_trips_records() {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        struct Rec {
            a: u64,
            b: u32,
        }

        let mut ep: ElemPool<Rec> = ElemPool::new(
            4,
            1,
            DeaCfg {
                basealloc: 4,
                cacheblocks: 0,
            },
            Rc::new(AllocStats::default()),
        );

        let r1 = ep.alloc(Rec { a: 1, b: 2 }).unwrap();
        let r2 = ep.alloc(Rec { a: 3, b: 4 }).unwrap();
        assert_eq!(ep.get(r1), Rec { a: 1, b: 2 });

        let mut v = ep.get(r2);
        v.b = 9;
        ep.set(r2, v);
        assert_eq!(ep.get(r2), Rec { a: 3, b: 9 });

        ep.free(r1);
        ep.free(r2);
        ep.cleanup();
    }
}
