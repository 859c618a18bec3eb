//! Bool attributes: one bit of payload per row.
//!
//! | Packing | Block payload                                             |
//! |---------|-----------------------------------------------------------|
//! | CONST   | one byte, every row in the block has that value           |
//! | BITMAP  | per subblock, `subblock_size / 32` u32 words, 1 bit/value |
//!
//! Bitmap subblocks have constant payload size, so `read_subblock` seeks by
//! multiplication. The analyzer reduces any supported filter to a pair of
//! accept flags for false/true and rejects constant blocks wholesale.

use std::sync::Arc;

use crate::analyzer::{AnalyzerCore, BlockIterator, MatchingSubblocks};
use crate::codec::bitunpack_slots;
use crate::error::{Error, Result};
use crate::filter::{Filter, FilterType, value_in_interval};
use crate::format::AttributeHeader;
use crate::layout::BlockLayout;
use crate::reader::FileReader;
use crate::{INVALID_ROW_ID, RowId};

use super::ColumnIterator;

// ── Packing ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoolPacking {
    Const,
    Bitmap,
}

impl BoolPacking {
    fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Self::Const),
            1 => Ok(Self::Bitmap),
            other => Err(Error::Corruption(format!("unknown bool packing tag {other}"))),
        }
    }
}

// ── Stored blocks ─────────────────────────────────────────────────────────

#[derive(Default)]
struct BoolConstBlock {
    value: bool,
}

impl BoolConstBlock {
    fn read_header(&mut self, reader: &mut FileReader) -> Result<()> {
        self.value = reader.read_u8()? != 0;
        Ok(())
    }

    #[inline]
    fn value(&self) -> bool {
        self.value
    }
}

struct BoolBitmapBlock {
    values: Vec<u32>,
    encoded: Vec<u32>,
    values_offset: u64,
    subblock_id: u32,
    num_read: usize,
}

impl BoolBitmapBlock {
    fn new(subblock_size: u32) -> Self {
        Self {
            values: vec![0; subblock_size as usize],
            encoded: vec![0; (subblock_size >> 5) as usize],
            values_offset: 0,
            subblock_id: u32::MAX,
            num_read: 0,
        }
    }

    fn read_header(&mut self, reader: &FileReader) {
        self.values_offset = reader.pos();
        self.subblock_id = u32::MAX;
    }

    /// Idempotent: re-reading the cached subblock performs no IO.
    fn read_subblock(
        &mut self,
        subblock_id: u32,
        num_values: usize,
        reader: &mut FileReader,
    ) -> Result<()> {
        if self.subblock_id == subblock_id {
            return Ok(());
        }
        self.subblock_id = subblock_id;

        let packed_size = (self.encoded.len() * 4) as u64;
        reader.seek(self.values_offset + packed_size * subblock_id as u64);
        reader.read_u32_words(&mut self.encoded)?;
        bitunpack_slots(&self.encoded, 1, &mut self.values);
        self.num_read = num_values;
        Ok(())
    }

    #[inline]
    fn value(&self, id_in_subblock: usize) -> i64 {
        self.values[id_in_subblock] as i64
    }

    #[inline]
    fn values(&self) -> &[u32] {
        &self.values[..self.num_read]
    }
}

// ── Accessor ──────────────────────────────────────────────────────────────

pub(crate) struct BoolAccessor {
    header: Arc<AttributeHeader>,
    reader: FileReader,
    layout: BlockLayout,
    packing: BoolPacking,
    block_const: BoolConstBlock,
    block_bitmap: BoolBitmapBlock,
    cur_block: u32,
    requested_row: RowId,
}

impl BoolAccessor {
    fn new(header: Arc<AttributeHeader>, reader: FileReader) -> Self {
        let layout = header.layout();
        Self {
            block_bitmap: BoolBitmapBlock::new(layout.subblock_size()),
            header,
            reader,
            layout,
            packing: BoolPacking::Const,
            block_const: BoolConstBlock::default(),
            cur_block: u32::MAX,
            requested_row: INVALID_ROW_ID,
        }
    }

    fn set_cur_block(&mut self, block_id: u32) -> Result<()> {
        self.reader.seek(self.header.block_offset(block_id)?);
        let tag = self.reader.unpack_u32()?;
        self.packing = BoolPacking::from_tag(tag)?;
        match self.packing {
            BoolPacking::Const => self.block_const.read_header(&mut self.reader)?,
            BoolPacking::Bitmap => self.block_bitmap.read_header(&self.reader),
        }
        self.requested_row = INVALID_ROW_ID;
        self.cur_block = block_id;
        Ok(())
    }

    fn read_value(&mut self) -> Result<i64> {
        match self.packing {
            BoolPacking::Const => Ok(self.block_const.value() as i64),
            BoolPacking::Bitmap => {
                let row_in_block = self.requested_row - self.layout.block_start_row(self.cur_block);
                let sub = self.layout.subblock_id_in_block(row_in_block);
                let num_values = self.layout.num_subblock_values(self.cur_block, sub);
                self.block_bitmap
                    .read_subblock(sub, num_values as usize, &mut self.reader)?;
                Ok(self
                    .block_bitmap
                    .value(self.layout.value_in_subblock(row_in_block) as usize))
            }
        }
    }
}

// ── Iterator ──────────────────────────────────────────────────────────────

pub(crate) struct BoolIterator {
    acc: BoolAccessor,
}

pub(crate) fn create_bool_iterator(
    header: Arc<AttributeHeader>,
    reader: FileReader,
) -> Box<dyn ColumnIterator> {
    Box::new(BoolIterator {
        acc: BoolAccessor::new(header, reader),
    })
}

impl ColumnIterator for BoolIterator {
    fn advance_to(&mut self, row_id: RowId) -> RowId {
        self.acc.requested_row = row_id;
        row_id
    }

    fn get(&mut self) -> Result<i64> {
        let row = self.acc.requested_row;
        if row == INVALID_ROW_ID {
            return Err(Error::Usage("get() before advance_to()"));
        }
        if row >= self.acc.layout.total_docs() {
            return Err(Error::Usage("row id out of range"));
        }
        let block = self.acc.layout.row_to_block(row);
        if block != self.acc.cur_block {
            let requested = row;
            self.acc.set_cur_block(block)?;
            self.acc.requested_row = requested;
        }
        self.acc.read_value()
    }

    fn get_bytes(&mut self, _pack: bool) -> Result<&[u8]> {
        Err(Error::TypeMismatch {
            expected: "uint32set/int64set",
            got: "bool",
        })
    }
}

// ── Analyzer ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum BoolScan {
    /// The filter accepts both values; every row id is emitted.
    EmitAll,
    /// Accepted constant block; every row id is emitted.
    Const,
    /// Bitmap block; compare each bit against the accepted value.
    Bitmap,
}

struct BoolAnalyzer<const MATCHING: bool> {
    acc: BoolAccessor,
    core: AnalyzerCore,
    accept_false: bool,
    accept_true: bool,
    scan: BoolScan,
}

/// Reduce a filter over a bool attribute to accept flags for 0 and 1.
fn analyze_bool_filter(filter: &Filter) -> Result<(bool, bool)> {
    let mut accept_false = false;
    let mut accept_true = false;
    match filter.filter_type {
        FilterType::Values => {
            for &v in &filter.values {
                accept_false |= v == 0;
                accept_true |= v != 0;
            }
        }
        FilterType::Range => {
            accept_false = value_in_interval(0, filter);
            accept_true = value_in_interval(1, filter);
        }
        other => {
            return Err(Error::UnsupportedFilter(format!(
                "bool analyzer cannot serve {other:?} filters"
            )));
        }
    }
    if filter.exclude {
        accept_false = !accept_false;
        accept_true = !accept_true;
    }
    Ok((accept_false, accept_true))
}

pub(crate) fn create_bool_analyzer(
    header: Arc<AttributeHeader>,
    reader: FileReader,
    filter: &Filter,
    matching: Option<MatchingSubblocks>,
) -> Result<Box<dyn BlockIterator>> {
    match matching {
        Some(m) => Ok(Box::new(BoolAnalyzer::<true>::new(header, reader, filter, Some(m))?)),
        None => Ok(Box::new(BoolAnalyzer::<false>::new(header, reader, filter, None)?)),
    }
}

impl<const MATCHING: bool> BoolAnalyzer<MATCHING> {
    fn new(
        header: Arc<AttributeHeader>,
        reader: FileReader,
        filter: &Filter,
        matching: Option<MatchingSubblocks>,
    ) -> Result<Self> {
        let (accept_false, accept_true) = analyze_bool_filter(filter)?;
        let layout = header.layout();
        let core = AnalyzerCore::new(layout.total_subblocks(), layout.subblock_size(), matching);
        let mut analyzer = Self {
            acc: BoolAccessor::new(header, reader),
            core,
            accept_false,
            accept_true,
            scan: BoolScan::EmitAll,
        };
        analyzer.move_to_subblock(0)?;
        Ok(analyzer)
    }

    /// Position on domain index `idx`, loading (and possibly skipping past)
    /// blocks as needed. Returns false once exhausted.
    fn move_to_subblock(&mut self, idx: u32) -> Result<bool> {
        self.core.cur_subblock = idx;
        if self.core.exhausted() {
            return Ok(false);
        }
        let subblock = self.core.subblock_at::<MATCHING>(idx);
        let block = self.acc.layout.subblock_to_block(subblock);
        if block != self.core.cur_block && !self.move_to_block(block)? {
            self.core.cur_subblock = self.core.total_subblocks;
            return Ok(false);
        }
        let landed = self.core.subblock_at::<MATCHING>(self.core.cur_subblock);
        self.core.row_id = self.acc.layout.subblock_start_row(landed);
        Ok(true)
    }

    /// Block-skip state machine: decode block headers and fast-forward over
    /// constant blocks the filter rejects. Binds the subblock scanner for
    /// the block it lands on.
    fn move_to_block(&mut self, mut next_block: u32) -> Result<bool> {
        loop {
            self.core.cur_block = next_block;
            self.acc.set_cur_block(next_block)?;

            if self.accept_false && self.accept_true {
                self.scan = BoolScan::EmitAll;
                return Ok(true);
            }
            if !self.accept_false && !self.accept_true {
                return Ok(false);
            }
            match self.acc.packing {
                BoolPacking::Bitmap => {
                    self.scan = BoolScan::Bitmap;
                    return Ok(true);
                }
                BoolPacking::Const => {
                    if self.acc.block_const.value() == self.accept_true {
                        self.scan = BoolScan::Const;
                        return Ok(true);
                    }
                }
            }

            // Rejected constant block: walk to the first candidate subblock
            // outside it. Skipped rows are not counted as processed.
            loop {
                if self.core.exhausted() {
                    return Ok(false);
                }
                let sub = self.core.subblock_at::<MATCHING>(self.core.cur_subblock);
                let block = self.acc.layout.subblock_to_block(sub);
                if block != next_block {
                    next_block = block;
                    break;
                }
                self.core.cur_subblock += 1;
            }
        }
    }

    fn process_cur_subblock(&mut self) -> Result<u32> {
        let sub = self.core.subblock_at::<MATCHING>(self.core.cur_subblock);
        let block = self.acc.layout.subblock_to_block(sub);
        let sub_in_block = self.acc.layout.subblock_in_block(sub);
        let num_values = self.acc.layout.num_subblock_values(block, sub_in_block);

        match self.scan {
            BoolScan::EmitAll | BoolScan::Const => Ok(self.core.emit_all(num_values)),
            BoolScan::Bitmap => {
                let acc = &mut self.acc;
                let core = &mut self.core;
                acc.block_bitmap
                    .read_subblock(sub_in_block, num_values as usize, &mut acc.reader)?;
                let want = self.accept_true as u32;
                let mut row = core.row_id;
                for &v in acc.block_bitmap.values() {
                    if v == want {
                        core.collected.push(row);
                    }
                    row += 1;
                }
                core.row_id = row;
                Ok(num_values)
            }
        }
    }
}

impl<const MATCHING: bool> BlockIterator for BoolAnalyzer<MATCHING> {
    fn hint_row_id(&mut self, row_id: RowId) -> Result<bool> {
        if self.core.exhausted() {
            return Ok(false);
        }
        if row_id >= self.acc.layout.total_docs() {
            self.core.cur_subblock = self.core.total_subblocks;
            return Ok(false);
        }
        let target = self.acc.layout.row_to_subblock(row_id);
        let pos = self.core.hint_position::<MATCHING>(target);
        self.move_to_subblock(pos)
    }

    fn next_row_id_block(&mut self) -> Result<Option<&[RowId]>> {
        if self.core.exhausted() {
            return Ok(None);
        }
        self.core.collected.clear();

        // Scan until a subblock's worth of matches has accumulated. A filter
        // matching nothing may walk many subblocks before returning.
        let budget = self.acc.layout.subblock_size() as usize;
        while self.core.collected.len() < budget {
            let processed = self.process_cur_subblock()?;
            self.core.num_processed += processed as u64;
            let next = self.core.cur_subblock + 1;
            if !self.move_to_subblock(next)? {
                break;
            }
        }
        Ok(self.core.finish_batch())
    }

    fn num_processed(&self) -> u64 {
        self.core.num_processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::OwnedBytes;

    #[test]
    fn test_const_block_header() {
        let mut reader = FileReader::new(OwnedBytes::new(vec![1u8]));
        let mut block = BoolConstBlock::default();
        block.read_header(&mut reader).unwrap();
        assert!(block.value());
    }

    #[test]
    fn test_bitmap_subblock_idempotent() {
        // Two subblocks of 32 rows: bits 0..32 then 32..64.
        let words = [0b1010u32.to_le_bytes(), 0xffff_0000u32.to_le_bytes()];
        let bytes: Vec<u8> = words.concat();
        let mut reader = FileReader::new(OwnedBytes::new(bytes));

        let mut block = BoolBitmapBlock::new(32);
        block.read_header(&reader);
        block.read_subblock(0, 32, &mut reader).unwrap();
        assert_eq!(block.value(0), 0);
        assert_eq!(block.value(1), 1);
        assert_eq!(block.value(3), 1);
        let pos_after = reader.pos();

        // Cached subblock: no further reads, same values.
        block.read_subblock(0, 32, &mut reader).unwrap();
        assert_eq!(reader.pos(), pos_after);
        assert_eq!(block.value(1), 1);

        block.read_subblock(1, 32, &mut reader).unwrap();
        assert_eq!(block.value(15), 0);
        assert_eq!(block.value(16), 1);
    }

    #[test]
    fn test_analyze_bool_filter() {
        let both = Filter::values("b", vec![0, 1]);
        assert_eq!(analyze_bool_filter(&both).unwrap(), (true, true));

        let only_true = Filter::values("b", vec![1]);
        assert_eq!(analyze_bool_filter(&only_true).unwrap(), (false, true));

        let excluded = Filter::values("b", vec![1]).excluded();
        assert_eq!(analyze_bool_filter(&excluded).unwrap(), (true, false));

        let range = Filter::range("b", 0, 0, true, true);
        assert_eq!(analyze_bool_filter(&range).unwrap(), (true, false));

        let bad = Filter {
            filter_type: FilterType::FloatRange,
            ..Filter::default()
        };
        assert!(analyze_bool_filter(&bad).is_err());
    }
}
