//! Property-based tests for chunk reassembly and reconnection backoff

use bytes::Bytes;
use proptest::prelude::*;
use silver_share::chunking::chunk_count;
use silver_share::{split_into_chunks, BackoffState, ReassemblyBuffer};
use std::time::Duration;

fn file_and_order() -> impl Strategy<Value = (Vec<u8>, usize, Vec<usize>)> {
    (prop::collection::vec(any::<u8>(), 1..50_000), 1024usize..8192).prop_flat_map(|(data, chunk_size)| {
        let n = chunk_count(data.len() as u64, chunk_size) as usize;
        let order = Just((0..n).collect::<Vec<usize>>()).prop_shuffle();
        (Just(data), Just(chunk_size), order)
    })
}

proptest! {
    /// Any delivery order of the chunks reassembles to the original bytes
    #[test]
    fn prop_any_permutation_reassembles((data, chunk_size, order) in file_and_order()) {
        let data = Bytes::from(data);
        let chunks = split_into_chunks(&data, chunk_size);
        prop_assert_eq!(chunks.len(), order.len());

        let mut buffer = ReassemblyBuffer::new("t1");
        buffer.set_header(chunks.len() as u32, data.len() as u64, chunk_size as u32);
        for index in order {
            let verified = chunks[index].clone().verify("t1").unwrap();
            buffer.insert(verified).unwrap();
        }

        prop_assert!(buffer.is_complete());
        prop_assert_eq!(buffer.reassemble().unwrap(), data);
    }

    /// Chunks buffered ahead of the header still reassemble once it arrives
    #[test]
    fn prop_header_after_chunks((data, chunk_size, order) in file_and_order()) {
        let data = Bytes::from(data);
        let chunks = split_into_chunks(&data, chunk_size);

        let mut buffer = ReassemblyBuffer::new("t2");
        for index in order {
            buffer.insert(chunks[index].clone().verify("t2").unwrap()).unwrap();
        }
        prop_assert!(!buffer.is_complete());

        let evicted = buffer.set_header(chunks.len() as u32, data.len() as u64, chunk_size as u32);
        prop_assert!(evicted.is_empty());
        prop_assert_eq!(buffer.reassemble().unwrap(), data);
    }

    /// A flipped byte never passes verification
    #[test]
    fn prop_corruption_detected(
        data in prop::collection::vec(any::<u8>(), 1..4096),
        position in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let chunk = split_into_chunks(&Bytes::from(data), 4096).remove(0);
        let mut tampered = chunk.payload.to_vec();
        let at = position.index(tampered.len());
        tampered[at] ^= flip;

        let forged = silver_share::Chunk {
            seq: chunk.seq,
            payload: Bytes::from(tampered),
            checksum: chunk.checksum.clone(),
        };
        prop_assert!(forged.verify("t3").is_err());
    }

    /// Delays never shrink, stay under the cap and stop after the attempt limit
    #[test]
    fn prop_backoff_monotonic(jitters in prop::collection::vec(0.0f64..1.0, 10)) {
        let mut backoff = BackoffState::new(Duration::from_millis(1000), Duration::from_secs(30), 6);
        let mut delays = Vec::new();
        for jitter in jitters {
            match backoff.next_delay_with_jitter(jitter) {
                Some(delay) => delays.push(delay),
                None => break,
            }
        }

        prop_assert_eq!(delays.len(), 6);
        prop_assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        prop_assert!(delays.iter().all(|d| *d <= Duration::from_secs(30)));
        prop_assert!(delays[0] >= Duration::from_millis(1200));
        prop_assert!(backoff.next_delay().is_none());
    }
}
