//! Property-based tests for allocator correctness
//!
//! Uses proptest to verify bitmap allocator invariants across random
//! allocate/free sequences.

use proptest::prelude::*;
use std::collections::HashSet;
use volstore::{BitmapAllocator, BlockAllocator, VolumeError};

proptest! {
    #[test]
    fn prop_no_double_allocation(
        sizes in prop::collection::vec(1usize..20, 1..40),
        total in 64usize..512
    ) {
        let mut alloc = BitmapAllocator::new(total);
        let mut owned = HashSet::new();

        for n in sizes {
            if let Ok(start) = alloc.allocate_contiguous(n) {
                for block in start..start + n {
                    prop_assert!(owned.insert(block), "Block {} allocated twice!", block);
                }
            }
        }
        prop_assert_eq!(alloc.free_count(), total - owned.len());
    }

    #[test]
    fn prop_free_count_matches_bits(
        ops in prop::collection::vec((any::<bool>(), 0usize..200, 0usize..16), 1..80)
    ) {
        let mut alloc = BitmapAllocator::new(200);
        for (used, start, n) in ops {
            let n = n.min(200 - start);
            if used {
                alloc.mark_used(start, n).unwrap();
            } else {
                alloc.mark_free(start, n).unwrap();
            }
        }

        let set = (0..200).filter(|&b| alloc.is_used(b)).count();
        prop_assert_eq!(alloc.used_count(), set);
    }

    #[test]
    fn prop_first_fit_is_leftmost(
        used in prop::collection::vec(any::<bool>(), 1..300),
        n in 1usize..12
    ) {
        let mut alloc = BitmapAllocator::new(used.len());
        for (block, &is_used) in used.iter().enumerate() {
            if is_used {
                alloc.mark_used(block, 1).unwrap();
            }
        }

        let expected = (0..used.len())
            .find(|&s| s + n <= used.len() && used[s..s + n].iter().all(|u| !u));
        prop_assert_eq!(alloc.find_contiguous(n), expected);
    }

    #[test]
    fn prop_failures_are_classified(
        used in prop::collection::vec(any::<bool>(), 1..128),
        n in 1usize..160
    ) {
        let mut alloc = BitmapAllocator::new(used.len());
        for (block, &is_used) in used.iter().enumerate() {
            if is_used {
                alloc.mark_used(block, 1).unwrap();
            }
        }
        let before = alloc.clone();

        match alloc.allocate_contiguous(n) {
            Ok(start) => prop_assert!(alloc.is_range_used(start, n)),
            Err(VolumeError::InsufficientSpace { required, free }) => {
                prop_assert_eq!(required, n);
                prop_assert!(free < n);
                prop_assert_eq!(&alloc, &before);
            }
            Err(VolumeError::InsufficientContiguousSpace { .. }) => {
                prop_assert!(before.free_count() >= n);
                prop_assert!(before.largest_free_run() < n);
                prop_assert_eq!(&alloc, &before);
            }
            Err(other) => prop_assert!(false, "unexpected error {:?}", other),
        }
    }

    #[test]
    fn prop_bytes_round_trip(used in prop::collection::vec(any::<bool>(), 1..300)) {
        let mut alloc = BitmapAllocator::new(used.len());
        for (block, &is_used) in used.iter().enumerate() {
            if is_used {
                alloc.mark_used(block, 1).unwrap();
            }
        }

        let bytes = alloc.to_bytes();
        prop_assert_eq!(bytes.len(), used.len().div_ceil(8));
        let restored = BitmapAllocator::from_bytes(&bytes, used.len()).unwrap();
        prop_assert_eq!(restored, alloc);
    }
}
