//! Property-based tests driving random operation sequences against a
//! shadow model, with the structural auditor run after every step.
//!
//! Coverage:
//! - pool churn: random-order releases exercise every head/tail/middle path,
//!   and every live span must keep its bytes intact throughout
//! - flush: every enqueued byte is advertised exactly once and in order,
//!   however the descriptor array is sized and however consumption is split

use netbuf_rs::{IoVec, NetBufs, Settings, Span};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Reserve(u32),
    ReleaseAt(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..48).prop_map(Op::Reserve),
        (0usize..64).prop_map(Op::ReleaseAt),
    ]
}

proptest! {
    /// Live spans never observe each other's bytes, whatever order the
    /// caller releases in, and the pool's size never drops below the bytes
    /// still reserved (parked holes may keep it above).
    #[test]
    fn live_spans_stay_intact_under_random_churn(
        ops in prop::collection::vec(op_strategy(), 1..200),
    ) {
        let settings = Settings {
            data_basealloc: 64,
            data_cacheblocks: 2,
            ..Settings::default()
        };
        let mut mgr = NetBufs::with_settings(settings);
        let mut live: Vec<(Span, u8, u32)> = Vec::new();
        let mut fill: u8 = 0;
        let mut live_bytes: u32 = 0;

        for op in ops {
            match op {
                Op::Reserve(size) => {
                    let span = mgr.reserve(size).unwrap();
                    fill = fill.wrapping_add(1);
                    mgr.span_slice_mut(&span).fill(fill);
                    live.push((span, fill, size));
                    live_bytes += size;
                }
                Op::ReleaseAt(raw) => {
                    if live.is_empty() {
                        continue;
                    }
                    let idx = raw % live.len();
                    let (span, _, size) = live.remove(idx);
                    mgr.release(span);
                    live_bytes -= size;
                }
            }
            mgr.audit();
            prop_assert!(mgr.size() >= live_bytes);
            for (span, pattern, _) in &live {
                prop_assert!(mgr.span_slice(span).iter().all(|b| b == pattern));
            }
        }

        for (span, _, _) in live.drain(..) {
            mgr.release(span);
        }
        prop_assert_eq!(mgr.size(), 0);
        mgr.cleanup();
        prop_assert_eq!(mgr.stats().total_bytes, 0);
    }

    /// The flush protocol hands out every enqueued byte exactly once, in
    /// enqueue order, regardless of descriptor-array capacity or how the
    /// transport splits its consumption.
    #[test]
    fn flush_hands_out_every_byte_exactly_once(
        sizes in prop::collection::vec(1u32..100, 1..40),
        consume_chunks in prop::collection::vec(1u32..64, 1..80),
    ) {
        let settings = Settings {
            data_basealloc: 128,
            ..Settings::default()
        };
        let mut mgr = NetBufs::with_settings(settings);

        let mut expected = Vec::new();
        let mut spans = Vec::new();
        let mut seq: u8 = 0;
        for &size in &sizes {
            let span = mgr.reserve(size).unwrap();
            for b in mgr.span_slice_mut(&span) {
                *b = seq;
                expected.push(seq);
                seq = seq.wrapping_add(1);
            }
            mgr.enqueue_span(&span);
            spans.push(span);
        }

        // advertise everything, four descriptors at a time
        let mut advertised = Vec::new();
        loop {
            let mut iovs = [IoVec::default(); 4];
            let n = mgr.start_flush(&mut iovs);
            if n == 0 {
                break;
            }
            let mut got = 0u32;
            for iov in &iovs {
                if got == n {
                    break;
                }
                // SAFETY: the spans stay alive for the whole test
                advertised.extend_from_slice(unsafe { iov.as_slice() });
                got += iov.len() as u32;
            }
            prop_assert_eq!(got, n);
            mgr.audit();
        }
        prop_assert_eq!(&advertised, &expected);

        // consume in arbitrary chunks
        let total: u32 = sizes.iter().sum();
        let mut consumed = 0u32;
        for &chunk in &consume_chunks {
            if consumed == total {
                break;
            }
            let chunk = chunk.min(total - consumed);
            mgr.end_flush(chunk);
            consumed += chunk;
            mgr.audit();
        }
        mgr.end_flush(total - consumed);
        prop_assert_eq!(mgr.iov_count(), 0);

        for span in spans {
            mgr.release(span);
        }
        prop_assert_eq!(mgr.size(), 0);
        mgr.cleanup();
        prop_assert_eq!(mgr.stats().total_bytes, 0);
    }
}
