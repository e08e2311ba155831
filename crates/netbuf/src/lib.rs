//! NETBUF: efficient write buffers for vectored network output.
//!
//! A write-buffer manager for clients that construct and transmit many
//! small, logically contiguous packets. The goals:
//!
//! 1. A simple allocation API: each packet gets a straight contiguous
//!    buffer (a *span*), reserved in the order it will be sent.
//! 2. Few copies, few descriptors: spans are packed into large fixed-size
//!    *blocks*, so a run of consecutive packets flushes as one
//!    scatter/gather descriptor instead of one per packet.
//! 3. A pluggable edge for user-owned data: a standalone span wraps a
//!    caller's buffer into the same span/enqueue/flush pipeline.
//!
//! # Terminology
//!
//! - **Span**: a reserved contiguous region; filled by the caller, then
//!   enqueued, flushed and finally released.
//! - **Block**: a fixed-capacity buffer holding many spans, reused
//!   ring-style: once head spans are released, new reservations wrap around
//!   to the front while at most two segments stay live.
//! - **Flush**: the two-phase advertise/consume protocol:
//!   [`NetBufs::start_flush`] fills an [`IoVec`] array without consuming
//!   anything, and [`NetBufs::end_flush`] advances the queue by what the
//!   transport actually wrote. Partial writes are a normal state, not an
//!   error.
//!
//! The manager is single-owner: keep one [`NetBufs`] per connection and
//! drive it from one task. Under the normal protocol a span is released
//! only after its bytes have been flushed; releases may arrive slightly out
//! of order and are parked per block until the head catches up.
//!
//! # Example
//!
//! ```
//! use netbuf_rs::{IoVec, NetBufs};
//!
//! let mut mgr = NetBufs::new();
//!
//! // reserve a span and fill it with packet bytes
//! let span = mgr.reserve(16).unwrap();
//! mgr.span_slice_mut(&span).copy_from_slice(&[0x2a; 16]);
//! mgr.enqueue_span(&span);
//!
//! // hand the pending bytes to the transport
//! let mut iovs = [IoVec::default(); 4];
//! let advertised = mgr.start_flush(&mut iovs);
//! assert_eq!(advertised, 16);
//!
//! // ...writev(&iovs)... then account for what the OS took
//! mgr.end_flush(advertised);
//! mgr.release(span);
//! assert_eq!(mgr.size(), 0);
//! ```

mod block;
mod config;
mod error;
mod invariants;
mod iovec;
mod manager;
mod pool;
mod sendq;
mod span;
mod stats;

pub use config::Settings;
pub use error::ReserveError;
pub use iovec::IoVec;
pub use manager::{BlockGeometry, NetBufs};
pub use span::Span;
pub use stats::StatsSnapshot;
