//! Property tests for chunk accounting: completion soundness and the
//! square-root memory bound.

use proptest::prelude::*;
use wdx_chunks::{ChunkAccountant, ChunkError};

proptest! {
    #[test]
    fn full_coverage_in_any_order_completes(
        capacity in 2u64..100_000,
        raw_cuts in prop::collection::vec(any::<u64>(), 0..16),
        seed in any::<u64>(),
    ) {
        let mut cuts: Vec<u64> = raw_cuts
            .into_iter()
            .map(|cut| 1 + cut % (capacity - 1))
            .collect();
        cuts.sort_unstable();
        cuts.dedup();

        let mut chunks = Vec::new();
        let mut start = 0;
        for cut in cuts {
            chunks.push((start, cut - start));
            start = cut;
        }
        chunks.push((start, capacity - start));

        // pseudo-shuffle via the seed so delivery order varies
        let len = chunks.len();
        for i in 0..len {
            let j = (seed
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(i as u64)
                % len as u64) as usize;
            chunks.swap(i, j);
        }

        let mut accountant = ChunkAccountant::new(capacity);
        for (offset, length) in chunks {
            accountant.add_chunk(offset, length).unwrap();
        }
        prop_assert!(accountant.file_completed());
    }

    #[test]
    fn coverage_with_a_gap_never_completes(
        capacity in 10u64..100_000,
        gap_tenth in 1u64..9,
    ) {
        let gap = capacity * gap_tenth / 10;
        let mut accountant = ChunkAccountant::new(capacity);
        accountant.add_chunk(0, gap).unwrap();
        accountant.add_chunk(gap + 1, capacity - gap - 1).unwrap();
        prop_assert!(!accountant.file_completed());
    }

    #[test]
    fn cardinality_never_exceeds_the_bound(
        capacity in 4u64..1_073_741_824u64,
        chunks in prop::collection::vec((0u64..4096, 1u64..128), 1..64),
    ) {
        let bound = capacity.isqrt();
        let mut accountant = ChunkAccountant::new(capacity);
        for (offset, length) in chunks {
            match accountant.add_chunk(offset, length) {
                Ok(()) => prop_assert!(accountant.len() as u64 <= bound),
                Err(ChunkError::CannotOptimize) => return Ok(()),
                Err(error) => return Err(TestCaseError::fail(error.to_string())),
            }
        }
    }
}

#[test]
fn adversarial_single_byte_chunks_fail_before_oom() {
    let capacity = 1 << 20;
    let mut accountant = ChunkAccountant::new(capacity);
    let bound = capacity.isqrt();
    let mut outcome = Ok(());
    for i in 0..capacity / 2 {
        outcome = accountant.add_chunk(i * 2, 1);
        if outcome.is_err() {
            break;
        }
        assert!(accountant.len() as u64 <= bound);
    }
    assert_eq!(outcome, Err(ChunkError::CannotOptimize));
}
