//! Error types for buffer reservation.
//!
//! Only allocation failure is surfaced as a value. Contract violations
//! (releasing a pointer no active block owns, enqueuing a zero-length
//! descriptor, consuming more bytes than were advertised) indicate bugs in
//! the caller's send pipeline and panic instead.

use std::collections::TryReserveError;
use thiserror::Error;

/// Errors that can occur while reserving buffer space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReserveError {
    /// The backing allocator could not provide a buffer of the required
    /// capacity. The reservation left no partial state behind; the caller
    /// may retry with a smaller span or drop the packet.
    #[error("backing allocation of {requested} bytes failed")]
    OutOfMemory {
        /// Capacity of the block that could not be allocated.
        requested: u32,
    },
}

impl ReserveError {
    pub(crate) fn from_try_reserve(requested: u32, _err: TryReserveError) -> Self {
        Self::OutOfMemory { requested }
    }
}
