//! Allocation policy settings.
//!
//! Each pool is described by two knobs: `basealloc`, the default capacity of
//! one block, and `cacheblocks`, the number of block headers kept inline in
//! the pool so the first blocks never touch the heap for their headers.
//! Multiple blocks help with cache locality when traversing, while large
//! data segments keep each element near the next.

/// How many block headers to preallocate for send-queue elements, per manager.
pub const SENDQ_CACHEBLOCKS: u32 = 4;
/// How many send-queue elements per block.
pub const SENDQ_BASEALLOC: u32 = 128;

/// How many block headers to preallocate per deferred-dealloc queue.
pub const DEALLOC_CACHEBLOCKS: u32 = 0;
/// Number of deferred-dealloc records per block.
pub const DEALLOC_BASEALLOC: u32 = 24;

/// How many data block headers to preallocate per manager.
pub const DATA_CACHEBLOCKS: u32 = 16;
/// Default data block capacity in bytes.
pub const DATA_BASEALLOC: u32 = 32_768;

/// Configuration for a [`NetBufs`](crate::NetBufs) manager.
///
/// `basealloc` is measured in *elements* for the send-queue and dealloc
/// pools and in *bytes* for the data pool. A block grows by doubling from
/// `basealloc` until a reservation fits, so oversized spans are still served
/// from a single contiguous block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Send-queue elements per block.
    pub sendq_basealloc: u32,
    /// Preallocated block headers in the send-queue element pool.
    pub sendq_cacheblocks: u32,
    /// Deferred-dealloc records per block.
    pub dealloc_basealloc: u32,
    /// Preallocated block headers in each deferred-dealloc pool.
    pub dealloc_cacheblocks: u32,
    /// Data block capacity in bytes.
    pub data_basealloc: u32,
    /// Preallocated block headers in the data pool.
    pub data_cacheblocks: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sendq_basealloc: SENDQ_BASEALLOC,
            sendq_cacheblocks: SENDQ_CACHEBLOCKS,
            dealloc_basealloc: DEALLOC_BASEALLOC,
            dealloc_cacheblocks: DEALLOC_CACHEBLOCKS,
            data_basealloc: DATA_BASEALLOC,
            data_cacheblocks: DATA_CACHEBLOCKS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let s = Settings::default();
        assert_eq!(s.sendq_basealloc, 128);
        assert_eq!(s.sendq_cacheblocks, 4);
        assert_eq!(s.dealloc_basealloc, 24);
        assert_eq!(s.dealloc_cacheblocks, 0);
        assert_eq!(s.data_basealloc, 32_768);
        assert_eq!(s.data_cacheblocks, 16);
    }
}
