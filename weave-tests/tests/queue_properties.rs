//! Property-based tests for the ordered segment container, the congestion
//! window and the fragmentation law.

use bytes::Bytes;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use weave_protocol::congestion::{CubicSendAlgorithm, RttStats};
use weave_protocol::queue::SegmentQueue;
use weave_protocol::segment::{ProtocolKind, Role, Segment};
use weave_protocol::signal::Signal;
use weave_protocol::underlay::TransportProtocol;
use weave_tests::{attached_session, wait_for};

fn data_segment(seq: u32) -> Segment {
    Segment::new_data(
        ProtocolKind::DataClientToServer,
        1,
        seq,
        0,
        0,
        0,
        Bytes::from_static(b"p"),
    )
}

proptest! {
    #[test]
    fn prop_delete_min_drains_in_ascending_key_order(
        seqs in prop::collection::vec(0u32..1024, 1..256),
    ) {
        let queue = SegmentQueue::new(4096);
        for &seq in &seqs {
            prop_assert!(queue.insert_blocking(data_segment(seq)));
        }
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        for expected in sorted {
            prop_assert_eq!(queue.delete_min().unwrap().seq(), expected);
        }
        prop_assert!(queue.delete_min().is_none());
    }

    #[test]
    fn prop_len_plus_remaining_is_capacity(
        seqs in prop::collection::vec(0u32..1024, 0..512),
    ) {
        let queue = SegmentQueue::new(1024);
        for &seq in &seqs {
            queue.insert_blocking(data_segment(seq));
        }
        prop_assert_eq!(queue.len() + queue.remaining(), queue.capacity());
    }

    #[test]
    fn prop_delete_min_if_purges_exactly_below_threshold(
        seqs in prop::collection::vec(0u32..1024, 1..256),
        threshold in 0u32..1024,
    ) {
        let queue = SegmentQueue::new(4096);
        for &seq in &seqs {
            queue.insert_blocking(data_segment(seq));
        }
        let mut purged = 0usize;
        while queue.delete_min_if(|seg| seg.seq() < threshold).is_some() {
            purged += 1;
        }
        let expected = seqs.iter().filter(|&&seq| seq < threshold).count();
        prop_assert_eq!(purged, expected);
        if let Some(min) = queue.delete_min() {
            prop_assert!(min.seq() >= threshold);
        }
    }

    #[test]
    fn prop_cubic_window_stays_within_bounds(
        events in prop::collection::vec((any::<bool>(), 1u32..128), 1..256),
    ) {
        let mut algorithm = CubicSendAlgorithm::new(32, 4096);
        for (is_ack, acked) in events {
            if is_ack {
                algorithm.on_ack(acked);
            } else {
                algorithm.on_loss();
            }
            let window = algorithm.congestion_window();
            prop_assert!((32..=4096).contains(&window));
        }
    }

    #[test]
    fn prop_rto_dominates_smoothed_rtt(
        samples in prop::collection::vec(1u64..500, 1..64),
    ) {
        let mut stats = RttStats::new();
        for ms in samples {
            stats.update_sample(Duration::from_millis(ms));
        }
        prop_assert!(stats.retransmission_timeout() > stats.smoothed_rtt());
        prop_assert!(stats.mean_deviation() <= stats.smoothed_rtt() * 2);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    // For every N-byte write the wire carries ceil(N / fragment_size)
    // segments with descending fragment indices, and their payloads
    // concatenate back to the message.
    #[test]
    fn prop_fragmentation_covers_payload(len in 1usize..40000) {
        // 1458 - 58 bytes of headers = 1400-byte fragments.
        let (session, underlay) = attached_session(
            5,
            Role::Client,
            TransportProtocol::ReliableStream,
            1458,
        );
        let cancel = Signal::new();
        let loops = Arc::clone(&session).spawn_loops(&cancel).unwrap();

        // Get the handshake out of the way with an empty first write.
        session.write(b"").unwrap();

        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        session.write(&payload).unwrap();

        let fragment_size = 1400usize;
        let expected = len.div_ceil(fragment_size);
        // Handshake + empty data fragment + the message's fragments.
        prop_assert!(wait_for(
            || underlay.sent_len() == 2 + expected,
            Duration::from_secs(2)
        ));

        let sent = underlay.sent();
        let fragments = &sent[2..];
        let mut reassembled = Vec::new();
        for (i, seg) in fragments.iter().enumerate() {
            prop_assert_eq!(seg.fragment() as usize, expected - 1 - i);
            reassembled.extend_from_slice(&seg.payload);
        }
        prop_assert_eq!(reassembled, payload);

        cancel.set();
        let (input, output) = loops.join();
        prop_assert!(input.is_ok());
        prop_assert!(output.is_ok());
    }
}
