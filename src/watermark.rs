//! Committed-sequence watermark over out-of-order batch completions.
//!
//! Batches are dispatched with increasing, non-overlapping sequence ranges
//! but workers finish them in any order. The watermark tracks the end of
//! the longest unbroken prefix of completed ranges: checkpoints may only
//! ever be written at this value, so a resumed replication never skips a
//! range that was still in flight when the process died.
//!
//! ```text
//! complete (0,10]  -> through = 10
//! complete (20,30] -> through = 10   (gap at 10..20)
//! complete (10,20] -> through = 30   (prefix coalesced)
//! ```
//!
//! Ranges use an exclusive start / inclusive end convention, matching how
//! the change reader slices the feed: a batch covers `(since, through]`.

use std::collections::BTreeMap;

/// A half-open sequence range `(since, through]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRange {
    /// Exclusive lower bound: the previous batch's last sequence.
    pub since: u64,
    /// Inclusive upper bound: this batch's last sequence.
    pub through: u64,
}

impl SeqRange {
    pub fn new(since: u64, through: u64) -> Self {
        debug_assert!(since <= through, "inverted sequence range");
        Self { since, through }
    }
}

/// Low-water-mark over completed sequence ranges.
///
/// Not thread-safe by itself; the owning replication applies completions
/// inside its single reports loop, which is the required critical section.
#[derive(Debug)]
pub struct Watermark {
    through: u64,
    /// Completed ranges not yet contiguous with `through`, keyed by start.
    pending: BTreeMap<u64, u64>,
}

impl Watermark {
    /// Create a watermark starting at `since` (typically the checkpoint seq).
    pub fn new(since: u64) -> Self {
        Self {
            through: since,
            pending: BTreeMap::new(),
        }
    }

    /// Highest sequence for which all preceding work is committed.
    pub fn through_seq(&self) -> u64 {
        self.through
    }

    /// Number of completed-but-not-contiguous ranges being held.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Record a completed range. Returns the new `through_seq` if it
    /// advanced, `None` if the range left a gap.
    ///
    /// `through_seq` is monotonically non-decreasing across any sequence
    /// of calls, regardless of completion order.
    pub fn complete(&mut self, range: SeqRange) -> Option<u64> {
        if range.through <= self.through {
            // Stale completion from before a resume; nothing to do
            return None;
        }
        self.pending.insert(range.since, range.through);

        let before = self.through;
        // Coalesce the contiguous prefix
        while let Some((&since, &through)) = self.pending.first_key_value() {
            if since > self.through {
                break;
            }
            self.pending.pop_first();
            if through > self.through {
                self.through = through;
            }
        }

        (self.through > before).then_some(self.through)
    }
}
