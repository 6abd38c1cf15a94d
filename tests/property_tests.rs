//! Property-based tests using proptest.
//!
//! These verify invariants that should hold for all inputs: watermark
//! monotonicity under any batch completion order, and replication id
//! stability under everything that is not supposed to affect it.

use doc_replicator::{ReplicationTask, SeqRange, Watermark};
use proptest::prelude::*;

/// Build abutting ranges from random positive gap sizes.
fn abutting_ranges(start: u64, gaps: &[u64]) -> Vec<SeqRange> {
    let mut ranges = Vec::with_capacity(gaps.len());
    let mut since = start;
    for gap in gaps {
        let through = since + gap;
        ranges.push(SeqRange::new(since, through));
        since = through;
    }
    ranges
}

/// Cheap deterministic Fisher-Yates from a seed.
fn shuffle(ranges: &mut [SeqRange], seed: u64) {
    let mut state = seed | 1;
    for i in (1..ranges.len()).rev() {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let j = (state >> 33) as usize % (i + 1);
        ranges.swap(i, j);
    }
}

proptest! {
    /// `through_seq` never decreases, no matter the completion order.
    #[test]
    fn watermark_is_monotonic(
        start in 0u64..1000,
        gaps in prop::collection::vec(1u64..50, 1..20),
        seed in any::<u64>(),
    ) {
        let mut ranges = abutting_ranges(start, &gaps);
        shuffle(&mut ranges, seed);
        let mut wm = Watermark::new(start);
        let mut last = start;
        for range in &ranges {
            wm.complete(*range);
            prop_assert!(wm.through_seq() >= last);
            last = wm.through_seq();
        }
    }

    /// Once every range is complete, the watermark reaches the tip and
    /// holds nothing pending, in any completion order.
    #[test]
    fn watermark_converges_to_tip(
        start in 0u64..1000,
        gaps in prop::collection::vec(1u64..50, 1..20),
        seed in any::<u64>(),
    ) {
        let mut ranges = abutting_ranges(start, &gaps);
        let tip = ranges.last().map(|r| r.through).unwrap_or(start);
        shuffle(&mut ranges, seed);

        let mut wm = Watermark::new(start);
        for range in &ranges {
            wm.complete(*range);
        }
        prop_assert_eq!(wm.through_seq(), tip);
        prop_assert_eq!(wm.pending_len(), 0);
    }

    /// Until the first range (the one starting at the watermark) lands,
    /// nothing advances.
    #[test]
    fn watermark_holds_without_first_range(
        start in 0u64..1000,
        gaps in prop::collection::vec(1u64..50, 2..20),
    ) {
        let ranges = abutting_ranges(start, &gaps);
        let mut wm = Watermark::new(start);
        for range in ranges.iter().skip(1) {
            prop_assert_eq!(wm.complete(*range), None);
        }
        prop_assert_eq!(wm.through_seq(), start);
        // The missing first range releases everything at once
        let tip = ranges.last().unwrap().through;
        prop_assert_eq!(wm.complete(ranges[0]), Some(tip));
    }

    /// Stale completions (fully behind the watermark) change nothing.
    #[test]
    fn watermark_ignores_stale_ranges(
        start in 100u64..1000,
        since in 0u64..50,
        len in 1u64..50,
    ) {
        let mut wm = Watermark::new(start);
        prop_assert_eq!(wm.complete(SeqRange::new(since, since + len)), None);
        prop_assert_eq!(wm.through_seq(), start);
        prop_assert_eq!(wm.pending_len(), 0);
    }
}

// =============================================================================
// Replication Id Properties
// =============================================================================

fn url_strategy() -> impl Strategy<Value = String> {
    ("[a-z]{1,8}", "[a-z]{1,8}")
        .prop_map(|(host, db)| format!("http://{}:5984/{}", host, db))
}

proptest! {
    /// The id is a pure function of the task's semantic fields.
    #[test]
    fn replication_id_deterministic(source in url_strategy(), target in url_strategy()) {
        let a = ReplicationTask::new(source.clone(), target.clone()).unwrap();
        let b = ReplicationTask::new(source, target).unwrap();
        prop_assert_eq!(a.replication_id(), b.replication_id());
    }

    /// Tuning knobs and `continuous` never change the id.
    #[test]
    fn replication_id_ignores_tuning(
        source in url_strategy(),
        target in url_strategy(),
        continuous in any::<bool>(),
        workers in 1usize..64,
        batch in 1usize..5000,
    ) {
        let base = ReplicationTask::new(source.clone(), target.clone()).unwrap();
        let tuned = ReplicationTask::new(source, target)
            .unwrap()
            .with_continuous(continuous)
            .with_workers(workers, batch);
        prop_assert_eq!(base.replication_id(), tuned.replication_id());
    }

    /// A trailing slash on either URL never changes the id.
    #[test]
    fn replication_id_trailing_slash_invariant(
        source in url_strategy(),
        target in url_strategy(),
    ) {
        let plain = ReplicationTask::new(source.clone(), target.clone()).unwrap();
        let slashed =
            ReplicationTask::new(format!("{}/", source), format!("{}/", target)).unwrap();
        prop_assert_eq!(plain.replication_id(), slashed.replication_id());
    }

    /// Different doc id allowlists give different ids.
    #[test]
    fn replication_id_sensitive_to_doc_ids(
        source in url_strategy(),
        target in url_strategy(),
        ids_a in prop::collection::vec("[a-z]{1,6}", 1..5),
        ids_b in prop::collection::vec("[a-z]{1,6}", 1..5),
    ) {
        prop_assume!(ids_a != ids_b);
        let a = ReplicationTask::new(source.clone(), target.clone())
            .unwrap()
            .with_doc_ids(ids_a)
            .unwrap();
        let b = ReplicationTask::new(source, target)
            .unwrap()
            .with_doc_ids(ids_b)
            .unwrap();
        prop_assert_ne!(a.replication_id(), b.replication_id());
    }

    /// The id always looks like a 64-char hex digest.
    #[test]
    fn replication_id_shape(source in url_strategy(), target in url_strategy()) {
        let id = ReplicationTask::new(source, target).unwrap().replication_id();
        prop_assert_eq!(id.len(), 64);
        prop_assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
