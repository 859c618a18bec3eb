//! Shared analyzer machinery.
//!
//! An analyzer walks one attribute's subblocks for one filter and emits the
//! sorted row ids whose value qualifies, in batches of up to one subblock of
//! matches per call. The per-type scan loops live next to their decoders in
//! [`crate::accessor`]; this module holds the caller-facing trait, the
//! caller-provided candidate-subblock list, and the cursor state every
//! analyzer drags along.

use crate::RowId;
use crate::error::Result;

// ── Caller-facing trait ───────────────────────────────────────────────────

/// Filter-driven stream of matching row ids, in ascending order.
pub trait BlockIterator {
    /// Fast-forward to the subblock containing `row_id` (never backwards).
    /// Returns false once the attribute is exhausted.
    fn hint_row_id(&mut self, row_id: RowId) -> Result<bool>;

    /// Produce the next batch of matching row ids.
    ///
    /// `Ok(None)` means exhausted. `Ok(Some(..))` may be an empty slice when
    /// block-level skips consumed the scan budget; callers must keep
    /// calling. Row ids are strictly ascending within and across batches;
    /// the slice is only valid until the next call.
    fn next_row_id_block(&mut self) -> Result<Option<&[RowId]>>;

    /// Rows examined so far. Wholesale-skipped blocks are not examined.
    fn num_processed(&self) -> u64;
}

// ── Matching subblocks ────────────────────────────────────────────────────

/// Caller-provided list of candidate subblock ids, produced by a cheaper
/// pre-filter over block min/max summaries. Ids are global subblock ids in
/// ascending order; the analyzer visits them verbatim and never reorders.
#[derive(Debug, Clone)]
pub struct MatchingSubblocks {
    blocks: Vec<u32>,
}

impl MatchingSubblocks {
    pub fn new(mut blocks: Vec<u32>) -> Self {
        blocks.sort_unstable();
        blocks.dedup();
        Self { blocks }
    }

    #[inline]
    pub fn get(&self, idx: u32) -> u32 {
        self.blocks[idx as usize]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// First list position at or after `subblock_id`.
    pub fn position_of(&self, subblock_id: u32) -> u32 {
        self.blocks.partition_point(|&s| s < subblock_id) as u32
    }
}

// ── Analyzer cursor state ─────────────────────────────────────────────────

/// Cursor state common to every analyzer variant.
///
/// `cur_subblock` indexes the iteration domain: the matching-subblock list
/// when one was provided, the dense range `0..total_subblocks` otherwise.
pub(crate) struct AnalyzerCore {
    /// Next row id to be examined by a scan loop.
    pub row_id: RowId,
    pub cur_subblock: u32,
    pub total_subblocks: u32,
    /// Block currently decoded by the accessor; `u32::MAX` before the first.
    pub cur_block: u32,
    pub num_processed: u64,
    /// Batch buffer; borrowed out to the caller between calls.
    pub collected: Vec<RowId>,
    pub matching: Option<MatchingSubblocks>,
}

impl AnalyzerCore {
    pub fn new(
        attr_subblocks: u32,
        subblock_size: u32,
        matching: Option<MatchingSubblocks>,
    ) -> Self {
        let total_subblocks = match &matching {
            Some(m) => m.len() as u32,
            None => attr_subblocks,
        };
        Self {
            row_id: 0,
            cur_subblock: 0,
            total_subblocks,
            cur_block: u32::MAX,
            num_processed: 0,
            // a full subblock of matches can land when the batch is one shy
            // of its budget, so size for the overshoot
            collected: Vec::with_capacity(subblock_size as usize * 2),
            matching,
        }
    }

    /// Resolve a domain index to a global subblock id.
    #[inline]
    pub fn subblock_at<const MATCHING: bool>(&self, idx: u32) -> u32 {
        if MATCHING {
            self.matching
                .as_ref()
                .expect("matching analyzer without a subblock list")
                .get(idx)
        } else {
            idx
        }
    }

    /// Domain index of the first candidate at or after `target`, clamped to
    /// never move backwards.
    #[inline]
    pub fn hint_position<const MATCHING: bool>(&self, target_subblock: u32) -> u32 {
        let pos = if MATCHING {
            self.matching
                .as_ref()
                .expect("matching analyzer without a subblock list")
                .position_of(target_subblock)
        } else {
            target_subblock
        };
        pos.max(self.cur_subblock)
    }

    #[inline]
    pub fn exhausted(&self) -> bool {
        self.cur_subblock >= self.total_subblocks
    }

    /// Emit `count` consecutive row ids unconditionally (constant blocks and
    /// tautological filters). Returns the number of rows examined.
    #[inline]
    pub fn emit_all(&mut self, count: u32) -> u32 {
        let start = self.row_id;
        self.collected.extend(start..start + count);
        self.row_id = start + count;
        count
    }

    /// Batch result per the [`BlockIterator::next_row_id_block`] contract.
    pub fn finish_batch(&self) -> Option<&[RowId]> {
        if self.collected.is_empty() && self.exhausted() {
            None
        } else {
            Some(&self.collected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_subblocks_sorted() {
        let m = MatchingSubblocks::new(vec![7, 2, 2, 5]);
        assert_eq!(m.len(), 3);
        assert_eq!(m.get(0), 2);
        assert_eq!(m.get(2), 7);
        assert_eq!(m.position_of(0), 0);
        assert_eq!(m.position_of(3), 1);
        assert_eq!(m.position_of(7), 2);
        assert_eq!(m.position_of(8), 3);
    }

    #[test]
    fn test_core_domain_size() {
        let dense = AnalyzerCore::new(10, 128, None);
        assert_eq!(dense.total_subblocks, 10);
        assert_eq!(dense.subblock_at::<false>(4), 4);

        let sparse = AnalyzerCore::new(10, 128, Some(MatchingSubblocks::new(vec![1, 8])));
        assert_eq!(sparse.total_subblocks, 2);
        assert_eq!(sparse.subblock_at::<true>(1), 8);
    }

    #[test]
    fn test_emit_all() {
        let mut core = AnalyzerCore::new(1, 128, None);
        core.row_id = 100;
        assert_eq!(core.emit_all(3), 3);
        assert_eq!(core.collected, vec![100, 101, 102]);
        assert_eq!(core.row_id, 103);
    }
}
