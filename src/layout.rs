//! Row-id arithmetic tying rows to blocks and subblocks.
//!
//! A store splits each attribute into blocks of `rows_per_block` contiguous
//! rows; non-constant packings further split a block into subblocks of
//! `subblock_size` rows. Subblocks never span blocks, so a short trailing
//! block simply has fewer (or shorter) subblocks. Everything here is pure
//! division/modulo; the decoders and analyzers lean on it for seeks and for
//! the matching-subblock hint protocol.

use crate::RowId;

#[derive(Debug, Clone, Copy)]
pub struct BlockLayout {
    subblock_size: u32,
    rows_per_block: u32,
    subblocks_per_block: u32,
    total_docs: u32,
}

impl BlockLayout {
    pub fn new(subblock_size: u32, rows_per_block: u32, total_docs: u32) -> Self {
        debug_assert!(subblock_size > 0 && rows_per_block > 0);
        Self {
            subblock_size,
            rows_per_block,
            subblocks_per_block: rows_per_block.div_ceil(subblock_size),
            total_docs,
        }
    }

    #[inline]
    pub fn subblock_size(&self) -> u32 {
        self.subblock_size
    }

    #[inline]
    pub fn total_docs(&self) -> u32 {
        self.total_docs
    }

    #[inline]
    pub fn num_blocks(&self) -> u32 {
        self.total_docs.div_ceil(self.rows_per_block)
    }

    #[inline]
    pub fn block_start_row(&self, block_id: u32) -> RowId {
        block_id * self.rows_per_block
    }

    #[inline]
    pub fn num_docs_in_block(&self, block_id: u32) -> u32 {
        let start = self.block_start_row(block_id);
        debug_assert!(start < self.total_docs);
        (self.total_docs - start).min(self.rows_per_block)
    }

    #[inline]
    pub fn row_to_block(&self, row_id: RowId) -> u32 {
        row_id / self.rows_per_block
    }

    /// Global subblock id of the subblock containing `row_id`.
    #[inline]
    pub fn row_to_subblock(&self, row_id: RowId) -> u32 {
        self.row_to_block(row_id) * self.subblocks_per_block
            + (row_id % self.rows_per_block) / self.subblock_size
    }

    #[inline]
    pub fn subblock_to_block(&self, subblock_id: u32) -> u32 {
        subblock_id / self.subblocks_per_block
    }

    #[inline]
    pub fn subblock_in_block(&self, subblock_id: u32) -> u32 {
        subblock_id % self.subblocks_per_block
    }

    /// First row id covered by a global subblock.
    #[inline]
    pub fn subblock_start_row(&self, subblock_id: u32) -> RowId {
        self.block_start_row(self.subblock_to_block(subblock_id))
            + self.subblock_in_block(subblock_id) * self.subblock_size
    }

    /// Subblock index within a block for a block-relative row offset.
    #[inline]
    pub fn subblock_id_in_block(&self, row_in_block: u32) -> u32 {
        row_in_block / self.subblock_size
    }

    /// Value index within its subblock for a block-relative row offset.
    #[inline]
    pub fn value_in_subblock(&self, row_in_block: u32) -> u32 {
        row_in_block % self.subblock_size
    }

    /// Number of values held by subblock `sub_in_block` of `block_id`
    /// (the last subblock of a block may be short).
    #[inline]
    pub fn num_subblock_values(&self, block_id: u32, sub_in_block: u32) -> u32 {
        let docs = self.num_docs_in_block(block_id);
        debug_assert!(sub_in_block * self.subblock_size < docs);
        (docs - sub_in_block * self.subblock_size).min(self.subblock_size)
    }

    /// Subblocks actually populated in a block.
    #[inline]
    pub fn num_subblocks_in_block(&self, block_id: u32) -> u32 {
        self.num_docs_in_block(block_id).div_ceil(self.subblock_size)
    }

    /// Total addressable subblocks across the attribute. Global subblock ids
    /// are allocated `subblocks_per_block` per block, so the range is dense
    /// except possibly within a short trailing block.
    pub fn total_subblocks(&self) -> u32 {
        if self.total_docs == 0 {
            return 0;
        }
        let last = self.num_blocks() - 1;
        last * self.subblocks_per_block + self.num_subblocks_in_block(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_layout() {
        // 65536-row blocks, 128-row subblocks
        let l = BlockLayout::new(128, 65536, 200_000);
        assert_eq!(l.num_blocks(), 4);
        assert_eq!(l.num_docs_in_block(0), 65536);
        assert_eq!(l.num_docs_in_block(3), 200_000 - 3 * 65536);
        assert_eq!(l.row_to_block(65535), 0);
        assert_eq!(l.row_to_block(65536), 1);
        assert_eq!(l.row_to_subblock(0), 0);
        assert_eq!(l.row_to_subblock(127), 0);
        assert_eq!(l.row_to_subblock(128), 1);
        assert_eq!(l.row_to_subblock(65536), 512);
        assert_eq!(l.subblock_to_block(511), 0);
        assert_eq!(l.subblock_to_block(512), 1);
        assert_eq!(l.subblock_start_row(512), 65536);
        assert_eq!(l.value_in_subblock(129), 1);
    }

    #[test]
    fn test_short_last_subblock() {
        let l = BlockLayout::new(128, 65536, 300);
        assert_eq!(l.num_blocks(), 1);
        assert_eq!(l.total_subblocks(), 3);
        assert_eq!(l.num_subblock_values(0, 0), 128);
        assert_eq!(l.num_subblock_values(0, 2), 44);
    }

    #[test]
    fn test_blocks_smaller_than_subblock() {
        // e.g. a test configuration with 100-row blocks and 128-row subblocks
        let l = BlockLayout::new(128, 100, 200);
        assert_eq!(l.num_blocks(), 2);
        assert_eq!(l.total_subblocks(), 2);
        assert_eq!(l.num_subblock_values(0, 0), 100);
        assert_eq!(l.subblock_to_block(1), 1);
        assert_eq!(l.subblock_start_row(1), 100);
        assert_eq!(l.row_to_subblock(150), 1);
    }

    #[test]
    fn test_empty() {
        let l = BlockLayout::new(128, 65536, 0);
        assert_eq!(l.num_blocks(), 0);
        assert_eq!(l.total_subblocks(), 0);
    }
}
