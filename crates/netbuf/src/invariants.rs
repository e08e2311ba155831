//! Debug assertion macros for block and send-queue invariants.
//!
//! These are only active in debug builds (`#[cfg(debug_assertions)]`), so
//! there is zero overhead in release builds. The same conditions are also
//! checked structurally by [`NetBufs::audit`](crate::NetBufs::audit), which
//! tests run after every public operation.

/// Assert the segment geometry of a block.
///
/// A non-empty block is either a single segment (`cursor > start` and
/// `wrap == cursor`) or two segments (`cursor <= start` and `wrap > start`),
/// and every offset stays within the allocated capacity.
macro_rules! debug_assert_block_geometry {
    ($block:expr) => {{
        #[cfg(debug_assertions)]
        {
            let b = &*$block;
            assert!(
                b.start <= b.wrap && b.wrap <= b.nalloc && b.cursor <= b.nalloc,
                "block cursors out of bounds: start={} wrap={} cursor={} nalloc={}",
                b.start,
                b.wrap,
                b.cursor,
                b.nalloc
            );
            if !b.is_empty() {
                assert!(
                    if b.cursor > b.start {
                        b.wrap == b.cursor
                    } else {
                        b.wrap > b.start
                    },
                    "block segment geometry violated: start={} wrap={} cursor={}",
                    b.start,
                    b.wrap,
                    b.cursor
                );
            }
        }
    }};
}

/// Assert that a released region lies inside the block's live region.
///
/// Single segment: `[start, cursor)`. Two segments: `[start, wrap)` or
/// `[0, cursor)`.
macro_rules! debug_assert_live_region {
    ($block:expr, $offset:expr, $size:expr) => {{
        #[cfg(debug_assertions)]
        {
            let b = &*$block;
            let (offset, size) = ($offset, $size);
            assert!(size > 0, "released region is empty");
            let in_live = if b.cursor > b.start {
                offset >= b.start && offset + size <= b.cursor
            } else {
                (offset >= b.start && offset + size <= b.wrap) || offset + size <= b.cursor
            };
            assert!(
                in_live,
                "released region [{}, {}) outside live region: start={} wrap={} cursor={}",
                offset,
                offset + size,
                b.start,
                b.wrap,
                b.cursor
            );
        }
    }};
}

/// Assert that a send-queue item still advertises bytes.
macro_rules! debug_assert_nonempty_item {
    ($len:expr) => {
        debug_assert!($len > 0, "send-queue item with zero length")
    };
}

pub(crate) use debug_assert_block_geometry;
pub(crate) use debug_assert_live_region;
pub(crate) use debug_assert_nonempty_item;
