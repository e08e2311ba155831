//! Reservation handles.

use crate::pool::PoolSpan;

/// A caller-visible reservation.
///
/// A span is normally a packed region inside a pool block, obtained from
/// [`NetBufs::reserve`](crate::NetBufs::reserve); its bytes are reached
/// through [`NetBufs::span_slice`](crate::NetBufs::span_slice) and
/// [`NetBufs::span_slice_mut`](crate::NetBufs::span_slice_mut). Spans
/// reserved one after another occupy sequential memory, which is what lets
/// the send queue collapse them into few descriptors.
///
/// A *standalone* span instead wraps a user-owned buffer, so caller data can
/// enter the span/enqueue/flush pipeline without being copied into a block.
///
/// Spans are not `Clone`: releasing consumes the handle, so a region cannot
/// be returned twice through the same span.
#[derive(Debug)]
pub struct Span {
    pub(crate) repr: SpanRepr,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum SpanRepr {
    Pooled(PoolSpan),
    Standalone { base: *mut u8, len: u32 },
}

impl Span {
    pub(crate) fn pooled(span: PoolSpan) -> Self {
        Self {
            repr: SpanRepr::Pooled(span),
        }
    }

    /// Wraps `len` bytes of a user-owned buffer as a span.
    ///
    /// Releasing a standalone span is a no-op; the caller keeps ownership of
    /// the memory.
    ///
    /// # Safety
    ///
    /// `base` must point to `len` valid bytes that stay alive and unmoved
    /// for as long as this span (or any descriptor enqueued from it) is in
    /// use, and must not be mutated elsewhere during that time.
    pub unsafe fn standalone(base: *mut u8, len: u32) -> Self {
        debug_assert!(!base.is_null() && len > 0);
        Self {
            repr: SpanRepr::Standalone { base, len },
        }
    }

    /// Size of the reserved region in bytes.
    pub fn size(&self) -> u32 {
        match self.repr {
            SpanRepr::Pooled(ps) => ps.size,
            SpanRepr::Standalone { len, .. } => len,
        }
    }

    /// Returns `true` if this span wraps a user-owned buffer.
    pub fn is_standalone(&self) -> bool {
        matches!(self.repr, SpanRepr::Standalone { .. })
    }

    /// Returns `true` if both spans live in the same pool block.
    pub fn same_parent(&self, other: &Span) -> bool {
        match (&self.repr, &other.repr) {
            (SpanRepr::Pooled(a), SpanRepr::Pooled(b)) => a.block == b.block,
            _ => false,
        }
    }

    /// Offset of the region within its block. `None` for standalone spans.
    pub fn offset(&self) -> Option<u32> {
        match self.repr {
            SpanRepr::Pooled(ps) => Some(ps.offset),
            SpanRepr::Standalone { .. } => None,
        }
    }
}
