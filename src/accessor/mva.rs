//! Multi-valued set attributes: each row holds a sorted vector of integers
//! (u32 or u64 storage, compared in the signed 64-bit domain).
//!
//! | Packing    | Block payload                                             |
//! |------------|-----------------------------------------------------------|
//! | CONST      | one PFOR vector shared by every row                       |
//! | CONSTLEN   | fixed per-row length; PFOR stream per subblock            |
//! | TABLE      | ≤256-entry dictionary + bit-packed per-row indices        |
//! | DELTA_PFOR | per-subblock lengths array + values, both PFOR            |
//!
//! Row vectors are stored as first differences and reconstructed by an
//! inverse-delta pass, after which every vector is non-decreasing. The
//! analyzer's binary searches and endpoint checks rely on that order.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::analyzer::{AnalyzerCore, BlockIterator, MatchingSubblocks};
use crate::codec::{
    IntCodec, IntValue, apply_inverse_deltas, bits_for_table, bitunpack_slots, create_int_codec,
    delta_decode, put_vint,
};
use crate::error::{Error, Result};
use crate::filter::{Filter, FilterType, MvaAggr};
use crate::format::{AttrType, AttributeHeader};
use crate::layout::BlockLayout;
use crate::reader::FileReader;
use crate::{INVALID_ROW_ID, RowId};

use super::ColumnIterator;

// ── Packing ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MvaPacking {
    Const,
    ConstLen,
    Table,
    DeltaPfor,
}

impl MvaPacking {
    fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Self::Const),
            1 => Ok(Self::ConstLen),
            2 => Ok(Self::Table),
            3 => Ok(Self::DeltaPfor),
            other => Err(Error::Corruption(format!("unknown mva packing tag {other}"))),
        }
    }
}

// ── Decode helpers ────────────────────────────────────────────────────────

fn decode_values<T: IntValue>(
    reader: &mut FileReader,
    codec: &dyn IntCodec,
    byte_size: usize,
    out: &mut Vec<T>,
) -> Result<()> {
    let bytes = reader.read_slice(byte_size)?;
    T::decode_with(codec, bytes, out)
}

/// Decode a PFOR stream of per-subblock sizes into cumulative byte offsets.
fn decode_cumulative_sizes(
    reader: &mut FileReader,
    codec: &dyn IntCodec,
    byte_size: usize,
    out: &mut Vec<u32>,
) -> Result<()> {
    decode_values(reader, codec, byte_size, out)?;
    delta_decode(out.as_mut_slice());
    Ok(())
}

/// Byte (offset, size) of subblock `id` within a block's value area.
fn subblock_byte_range(cumulative: &[u32], subblock_id: u32) -> Result<(u32, u32)> {
    let id = subblock_id as usize;
    let end = *cumulative
        .get(id)
        .ok_or_else(|| Error::Corruption(format!("subblock {subblock_id} beyond size table")))?;
    let start = if id > 0 { cumulative[id - 1] } else { 0 };
    if end < start {
        return Err(Error::Corruption("subblock sizes not cumulative".into()));
    }
    Ok((start, end - start))
}

/// Prefix-sum per-row lengths into `n + 1` value offsets.
fn offsets_from_lengths(lengths: &[u32], total_values: usize) -> Result<Vec<u32>> {
    let mut offsets = Vec::with_capacity(lengths.len() + 1);
    let mut total = 0u32;
    offsets.push(0);
    for &len in lengths {
        total = total
            .checked_add(len)
            .ok_or_else(|| Error::Corruption("row length overflow".into()))?;
        offsets.push(total);
    }
    if total as usize != total_values {
        return Err(Error::Corruption(format!(
            "row lengths sum to {total}, stream holds {total_values} values"
        )));
    }
    Ok(offsets)
}

/// Inverse-delta each row of a fixed-stride subblock in place.
fn inverse_deltas_strided<T: IntValue>(values: &mut [T], stride: usize) {
    if stride == 0 {
        return;
    }
    for row in values.chunks_exact_mut(stride) {
        for i in 1..stride {
            row[i] = T::from_u64(row[i].to_u64().wrapping_add(row[i - 1].to_u64()));
        }
    }
}

// ── Stored blocks ─────────────────────────────────────────────────────────

/// CONST: the whole block decodes to one shared vector.
struct MvaConstBlock<T> {
    values: Vec<T>,
}

impl<T: IntValue> MvaConstBlock<T> {
    fn new() -> Self {
        Self { values: Vec::new() }
    }

    fn read_header(&mut self, reader: &mut FileReader, codec: &dyn IntCodec) -> Result<()> {
        let byte_size = reader.unpack_u32()? as usize;
        decode_values(reader, codec, byte_size, &mut self.values)?;
        delta_decode(self.values.as_mut_slice());
        Ok(())
    }

    #[inline]
    fn values(&self) -> &[T] {
        &self.values
    }
}

/// CONSTLEN: every row has `length` values; cumulative subblock byte sizes
/// live in the header, so subblock decode is a seek + one PFOR stream.
struct MvaFixedLenBlock<T> {
    cumulative_sizes: Vec<u32>,
    values: Vec<T>,
    length: u32,
    values_offset: u64,
    subblock_id: u32,
}

impl<T: IntValue> MvaFixedLenBlock<T> {
    fn new() -> Self {
        Self {
            cumulative_sizes: Vec::new(),
            values: Vec::new(),
            length: 0,
            values_offset: 0,
            subblock_id: u32::MAX,
        }
    }

    fn read_header(&mut self, reader: &mut FileReader, codec: &dyn IntCodec) -> Result<()> {
        self.length = reader.unpack_u32()?;
        let sizes_bytes = reader.unpack_u32()? as usize;
        decode_cumulative_sizes(reader, codec, sizes_bytes, &mut self.cumulative_sizes)?;
        self.values_offset = reader.pos();
        self.subblock_id = u32::MAX;
        Ok(())
    }

    fn read_subblock(
        &mut self,
        subblock_id: u32,
        num_rows: u32,
        reader: &mut FileReader,
        codec: &dyn IntCodec,
    ) -> Result<()> {
        if self.subblock_id == subblock_id {
            return Ok(());
        }
        self.subblock_id = subblock_id;

        let (offset, size) = subblock_byte_range(&self.cumulative_sizes, subblock_id)?;
        reader.seek(self.values_offset + offset as u64);
        decode_values(reader, codec, size as usize, &mut self.values)?;

        let expected = self.length as usize * num_rows as usize;
        if self.values.len() != expected {
            return Err(Error::Corruption(format!(
                "fixed-length subblock holds {} values, {expected} expected",
                self.values.len()
            )));
        }
        inverse_deltas_strided(&mut self.values, self.length as usize);
        Ok(())
    }

    #[inline]
    fn row(&self, id_in_subblock: usize) -> &[T] {
        let len = self.length as usize;
        &self.values[id_in_subblock * len..(id_in_subblock + 1) * len]
    }
}

/// TABLE: a per-block dictionary of distinct vectors plus bit-packed per-row
/// indices with constant subblock payload size.
struct MvaTableBlock<T> {
    lengths: Vec<u32>,
    values: Vec<T>,
    offsets: Vec<u32>,
    bits: u8,
    values_offset: u64,
    subblock_id: u32,
    indexes: Vec<u32>,
    encoded: Vec<u32>,
    num_read: usize,
}

impl<T: IntValue> MvaTableBlock<T> {
    fn new(subblock_size: u32) -> Self {
        Self {
            lengths: Vec::new(),
            values: Vec::new(),
            offsets: Vec::new(),
            bits: 0,
            values_offset: 0,
            subblock_id: u32::MAX,
            indexes: vec![0; subblock_size as usize],
            encoded: Vec::new(),
            num_read: 0,
        }
    }

    fn read_header(&mut self, reader: &mut FileReader, codec: &dyn IntCodec) -> Result<()> {
        let lengths_bytes = reader.unpack_u32()? as usize;
        decode_values(reader, codec, lengths_bytes, &mut self.lengths)?;
        if self.lengths.is_empty() || self.lengths.len() > 256 {
            return Err(Error::Corruption(format!(
                "mva table with {} entries",
                self.lengths.len()
            )));
        }

        let values_bytes = reader.unpack_u32()? as usize;
        decode_values(reader, codec, values_bytes, &mut self.values)?;
        self.offsets = offsets_from_lengths(&self.lengths, self.values.len())?;
        apply_inverse_deltas(&mut self.values, &self.offsets);

        self.bits = bits_for_table(self.lengths.len());
        self.encoded
            .resize((self.indexes.len() >> 5) * self.bits as usize, 0);
        self.values_offset = reader.pos();
        self.subblock_id = u32::MAX;
        Ok(())
    }

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
        bitunpack_slots(&self.encoded, self.bits, &mut self.indexes);
        self.num_read = num_values;

        let table_len = self.table_len() as u32;
        if self.indexes[..num_values].iter().any(|&ix| ix >= table_len) {
            return Err(Error::Corruption("table index beyond dictionary".into()));
        }
        Ok(())
    }

    #[inline]
    fn table_len(&self) -> usize {
        self.lengths.len()
    }

    #[inline]
    fn entry(&self, index: usize) -> &[T] {
        &self.values[self.offsets[index] as usize..self.offsets[index + 1] as usize]
    }

    #[inline]
    fn indexes(&self) -> &[u32] {
        &self.indexes[..self.num_read]
    }

    #[inline]
    fn row(&self, id_in_subblock: usize) -> &[T] {
        self.entry(self.indexes[id_in_subblock] as usize)
    }
}

/// DELTA_PFOR: each subblock carries its own lengths array ahead of the
/// values; cumulative subblock byte sizes live in the header.
struct MvaPforBlock<T> {
    cumulative_sizes: Vec<u32>,
    lengths: Vec<u32>,
    values: Vec<T>,
    offsets: Vec<u32>,
    values_offset: u64,
    subblock_id: u32,
}

impl<T: IntValue> MvaPforBlock<T> {
    fn new() -> Self {
        Self {
            cumulative_sizes: Vec::new(),
            lengths: Vec::new(),
            values: Vec::new(),
            offsets: Vec::new(),
            values_offset: 0,
            subblock_id: u32::MAX,
        }
    }

    fn read_header(&mut self, reader: &mut FileReader, codec: &dyn IntCodec) -> Result<()> {
        let sizes_bytes = reader.unpack_u32()? as usize;
        decode_cumulative_sizes(reader, codec, sizes_bytes, &mut self.cumulative_sizes)?;
        self.values_offset = reader.pos();
        self.subblock_id = u32::MAX;
        Ok(())
    }

    fn read_subblock(
        &mut self,
        subblock_id: u32,
        num_rows: u32,
        reader: &mut FileReader,
        codec: &dyn IntCodec,
    ) -> Result<()> {
        if self.subblock_id == subblock_id {
            return Ok(());
        }
        self.subblock_id = subblock_id;

        let (offset, size) = subblock_byte_range(&self.cumulative_sizes, subblock_id)?;
        reader.seek(self.values_offset + offset as u64);

        let start = reader.pos();
        let lengths_bytes = reader.unpack_u32()?;
        let prefix = (reader.pos() - start) as u32;
        decode_values(reader, codec, lengths_bytes as usize, &mut self.lengths)?;
        if self.lengths.len() != num_rows as usize {
            return Err(Error::Corruption(format!(
                "delta-pfor subblock holds {} rows, {num_rows} expected",
                self.lengths.len()
            )));
        }

        let values_bytes = size
            .checked_sub(lengths_bytes + prefix)
            .ok_or_else(|| Error::Corruption("delta-pfor subblock size underflow".into()))?;
        decode_values(reader, codec, values_bytes as usize, &mut self.values)?;

        self.offsets = offsets_from_lengths(&self.lengths, self.values.len())?;
        apply_inverse_deltas(&mut self.values, &self.offsets);
        Ok(())
    }

    #[inline]
    fn row(&self, id_in_subblock: usize) -> &[T] {
        &self.values
            [self.offsets[id_in_subblock] as usize..self.offsets[id_in_subblock + 1] as usize]
    }
}

// ── Accessor ──────────────────────────────────────────────────────────────

pub(crate) struct MvaAccessor<T: IntValue> {
    header: Arc<AttributeHeader>,
    reader: FileReader,
    layout: BlockLayout,
    codec: Box<dyn IntCodec>,
    packing: MvaPacking,
    block_const: MvaConstBlock<T>,
    block_fixed: MvaFixedLenBlock<T>,
    block_table: MvaTableBlock<T>,
    block_pfor: MvaPforBlock<T>,
    cur_block: u32,
    requested_row: RowId,
    /// Scratch for the byte-oriented iterator surface.
    result: Vec<u8>,
}

impl<T: IntValue> MvaAccessor<T> {
    fn new(header: Arc<AttributeHeader>, reader: FileReader) -> Result<Self> {
        let settings = header.settings();
        let codec = create_int_codec(&settings.compression_u32, &settings.compression_u64)?;
        let layout = header.layout();
        Ok(Self {
            block_table: MvaTableBlock::new(layout.subblock_size()),
            header,
            reader,
            layout,
            codec,
            packing: MvaPacking::Const,
            block_const: MvaConstBlock::new(),
            block_fixed: MvaFixedLenBlock::new(),
            block_pfor: MvaPforBlock::new(),
            cur_block: u32::MAX,
            requested_row: INVALID_ROW_ID,
            result: Vec::new(),
        })
    }

    fn set_cur_block(&mut self, block_id: u32) -> Result<()> {
        self.reader.seek(self.header.block_offset(block_id)?);
        let tag = self.reader.unpack_u32()?;
        self.packing = MvaPacking::from_tag(tag)?;
        match self.packing {
            MvaPacking::Const => self
                .block_const
                .read_header(&mut self.reader, self.codec.as_ref())?,
            MvaPacking::ConstLen => self
                .block_fixed
                .read_header(&mut self.reader, self.codec.as_ref())?,
            MvaPacking::Table => self
                .block_table
                .read_header(&mut self.reader, self.codec.as_ref())?,
            MvaPacking::DeltaPfor => self
                .block_pfor
                .read_header(&mut self.reader, self.codec.as_ref())?,
        }
        self.requested_row = INVALID_ROW_ID;
        self.cur_block = block_id;
        Ok(())
    }

    /// Decode whatever subblock holds the requested row (idempotent) and
    /// leave the row reachable through the current packing's block.
    fn decode_requested(&mut self) -> Result<u32> {
        let row_in_block = self.requested_row - self.layout.block_start_row(self.cur_block);
        let sub = self.layout.subblock_id_in_block(row_in_block);
        let num_values = self.layout.num_subblock_values(self.cur_block, sub);
        match self.packing {
            MvaPacking::Const => {}
            MvaPacking::ConstLen => self.block_fixed.read_subblock(
                sub,
                num_values,
                &mut self.reader,
                self.codec.as_ref(),
            )?,
            MvaPacking::Table => {
                self.block_table
                    .read_subblock(sub, num_values as usize, &mut self.reader)?
            }
            MvaPacking::DeltaPfor => self.block_pfor.read_subblock(
                sub,
                num_values,
                &mut self.reader,
                self.codec.as_ref(),
            )?,
        }
        Ok(self.layout.value_in_subblock(row_in_block))
    }

    /// Render the requested row into the scratch buffer as little-endian
    /// bytes, optionally with a varint byte-length prefix.
    fn write_row_bytes(&mut self, pack: bool) -> Result<()> {
        let id_in_subblock = self.decode_requested()? as usize;
        let values: &[T] = match self.packing {
            MvaPacking::Const => self.block_const.values(),
            MvaPacking::ConstLen => self.block_fixed.row(id_in_subblock),
            MvaPacking::Table => self.block_table.row(id_in_subblock),
            MvaPacking::DeltaPfor => self.block_pfor.row(id_in_subblock),
        };
        let result = &mut self.result;
        result.clear();
        if pack {
            put_vint(result, (values.len() * (T::BITS as usize / 8)) as u64);
        }
        for &v in values {
            v.push_le(result);
        }
        Ok(())
    }
}

// ── Iterator ──────────────────────────────────────────────────────────────

struct MvaIterator<T: IntValue> {
    acc: MvaAccessor<T>,
}

pub(crate) fn create_mva_iterator(
    header: Arc<AttributeHeader>,
    reader: FileReader,
) -> Result<Box<dyn ColumnIterator>> {
    match header.attr_type() {
        AttrType::Uint32Set => Ok(Box::new(MvaIterator::<u32> {
            acc: MvaAccessor::new(header, reader)?,
        })),
        AttrType::Int64Set => Ok(Box::new(MvaIterator::<u64> {
            acc: MvaAccessor::new(header, reader)?,
        })),
        AttrType::Bool => Err(Error::TypeMismatch {
            expected: "uint32set/int64set",
            got: "bool",
        }),
    }
}

impl<T: IntValue> ColumnIterator for MvaIterator<T> {
    fn advance_to(&mut self, row_id: RowId) -> RowId {
        self.acc.requested_row = row_id;
        row_id
    }

    fn get(&mut self) -> Result<i64> {
        Err(Error::TypeMismatch {
            expected: "bool",
            got: "uint32set/int64set",
        })
    }

    fn get_bytes(&mut self, pack: bool) -> Result<&[u8]> {
        let row = self.acc.requested_row;
        if row == INVALID_ROW_ID {
            return Err(Error::Usage("get_bytes() before advance_to()"));
        }
        if row >= self.acc.layout.total_docs() {
            return Err(Error::Usage("row id out of range"));
        }
        let block = self.acc.layout.row_to_block(row);
        if block != self.acc.cur_block {
            self.acc.set_cur_block(block)?;
            self.acc.requested_row = row;
        }
        self.acc.write_row_bytes(pack)?;
        Ok(&self.acc.result)
    }
}

// ── Predicates ────────────────────────────────────────────────────────────

/// Predicate over one row's sorted vector, monomorphised per aggregator and
/// endpoint closedness so the scan loops stay branch-free.
pub(crate) trait MvaTest {
    fn test_values<T: IntValue>(values: &[T], tests: &[i64]) -> bool;
    fn test_single<T: IntValue>(values: &[T], test: i64) -> bool;
    fn test_range<T: IntValue>(values: &[T], lo: i64, hi: i64) -> bool;
}

pub(crate) struct MvaAny<const LEFT_CLOSED: bool, const RIGHT_CLOSED: bool>;
pub(crate) struct MvaAll<const LEFT_CLOSED: bool, const RIGHT_CLOSED: bool>;

#[inline]
fn contains<T: IntValue>(values: &[T], test: i64) -> bool {
    values
        .binary_search_by(|v| v.cmp_value().cmp(&test))
        .is_ok()
}

impl<const L: bool, const R: bool> MvaTest for MvaAny<L, R> {
    fn test_values<T: IntValue>(values: &[T], tests: &[i64]) -> bool {
        if values.is_empty() || tests.is_empty() {
            return false;
        }
        tests.iter().any(|&t| contains(values, t))
    }

    #[inline]
    fn test_single<T: IntValue>(values: &[T], test: i64) -> bool {
        contains(values, test)
    }

    fn test_range<T: IntValue>(values: &[T], lo: i64, hi: i64) -> bool {
        if values.is_empty() {
            return false;
        }
        // First element not below the lower bound.
        let idx = values.partition_point(|v| v.cmp_value() < lo);
        if idx < values.len() && values[idx].cmp_value() == lo {
            // The bound itself is present: with an open left endpoint only a
            // successor can qualify.
            return L || idx + 1 < values.len();
        }
        if idx == values.len() {
            return false;
        }
        let first_above = values[idx].cmp_value();
        if R { first_above <= hi } else { first_above < hi }
    }
}

impl<const L: bool, const R: bool> MvaTest for MvaAll<L, R> {
    fn test_values<T: IntValue>(values: &[T], tests: &[i64]) -> bool {
        if values.is_empty() || tests.is_empty() {
            return false;
        }
        values
            .iter()
            .all(|v| tests.binary_search(&v.cmp_value()).is_ok())
    }

    fn test_single<T: IntValue>(values: &[T], test: i64) -> bool {
        if values.is_empty() {
            return false;
        }
        values.iter().all(|v| v.cmp_value() == test)
    }

    fn test_range<T: IntValue>(values: &[T], lo: i64, hi: i64) -> bool {
        if values.is_empty() {
            return false;
        }
        let first = values[0].cmp_value();
        let last = values[values.len() - 1].cmp_value();
        (if L { first >= lo } else { first > lo }) && (if R { last <= hi } else { last < hi })
    }
}

// ── Analyzer ──────────────────────────────────────────────────────────────

/// Scan shape chosen once at construction from the filter.
#[derive(Debug, Clone, Copy)]
enum MvaScan {
    SingleValue,
    Values,
    Range,
}

struct MvaAnalyzer<T: IntValue, P: MvaTest, const MATCHING: bool> {
    acc: MvaAccessor<T>,
    core: AnalyzerCore,
    scan: MvaScan,
    filter_values: Vec<i64>,
    single_value: i64,
    lo: i64,
    hi: i64,
    exclude: bool,
    /// Per-block qualification of dictionary entries (TABLE packing).
    table_map: [bool; 256],
    _predicate: PhantomData<P>,
}

#[inline]
fn test_row<T: IntValue, P: MvaTest>(
    scan: MvaScan,
    values: &[T],
    single_value: i64,
    filter_values: &[i64],
    lo: i64,
    hi: i64,
) -> bool {
    match scan {
        MvaScan::SingleValue => P::test_single(values, single_value),
        MvaScan::Values => P::test_values(values, filter_values),
        MvaScan::Range => P::test_range(values, lo, hi),
    }
}

impl<T: IntValue, P: MvaTest, const MATCHING: bool> MvaAnalyzer<T, P, MATCHING> {
    fn new(
        header: Arc<AttributeHeader>,
        reader: FileReader,
        filter: &Filter,
        matching: Option<MatchingSubblocks>,
    ) -> Result<Self> {
        let scan = match filter.filter_type {
            FilterType::Values if filter.values.len() == 1 => MvaScan::SingleValue,
            FilterType::Values => MvaScan::Values,
            FilterType::Range => MvaScan::Range,
            other => {
                return Err(Error::UnsupportedFilter(format!(
                    "mva analyzer cannot serve {other:?} filters"
                )));
            }
        };
        let layout = header.layout();
        let core = AnalyzerCore::new(layout.total_subblocks(), layout.subblock_size(), matching);
        let mut analyzer = Self {
            acc: MvaAccessor::new(header, reader)?,
            core,
            scan,
            single_value: filter.values.first().copied().unwrap_or(0),
            filter_values: filter.values.clone(),
            lo: filter.lower_bound().0,
            hi: filter.upper_bound().0,
            exclude: filter.exclude,
            table_map: [false; 256],
            _predicate: PhantomData,
        };
        analyzer.move_to_subblock(0)?;
        Ok(analyzer)
    }

    #[inline]
    fn test(&self, values: &[T]) -> bool {
        test_row::<T, P>(
            self.scan,
            values,
            self.single_value,
            &self.filter_values,
            self.lo,
            self.hi,
        ) != self.exclude
    }

    /// Qualify a constant block: either every row matches or none does.
    fn setup_const_block(&mut self) -> bool {
        self.test(self.acc.block_const.values())
    }

    /// Qualify each dictionary entry once; per-row matching becomes an O(1)
    /// lookup. Returns whether anything in the block can match at all.
    fn setup_table_block(&mut self) -> bool {
        let mut any = false;
        for i in 0..self.acc.block_table.table_len() {
            let hit = test_row::<T, P>(
                self.scan,
                self.acc.block_table.entry(i),
                self.single_value,
                &self.filter_values,
                self.lo,
                self.hi,
            ) != self.exclude;
            self.table_map[i] = hit;
            any |= hit;
        }
        any
    }

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

    /// Block-skip state machine: CONST and TABLE blocks can be qualified
    /// from their headers alone and rejected without touching subblocks.
    fn move_to_block(&mut self, mut next_block: u32) -> Result<bool> {
        loop {
            self.core.cur_block = next_block;
            self.acc.set_cur_block(next_block)?;

            match self.acc.packing {
                MvaPacking::ConstLen | MvaPacking::DeltaPfor => return Ok(true),
                MvaPacking::Const => {
                    if self.setup_const_block() {
                        return Ok(true);
                    }
                }
                MvaPacking::Table => {
                    if self.setup_table_block() {
                        return Ok(true);
                    }
                }
            }

            // Rejected block: walk to the first candidate subblock outside
            // it. Skipped rows are not counted as processed.
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

        match self.acc.packing {
            MvaPacking::Const => return Ok(self.core.emit_all(num_values)),
            MvaPacking::Table => {
                let acc = &mut self.acc;
                acc.block_table
                    .read_subblock(sub_in_block, num_values as usize, &mut acc.reader)?;
                let core = &mut self.core;
                let mut row = core.row_id;
                for &ix in acc.block_table.indexes() {
                    if self.table_map[ix as usize] {
                        core.collected.push(row);
                    }
                    row += 1;
                }
                core.row_id = row;
            }
            MvaPacking::ConstLen => {
                let acc = &mut self.acc;
                acc.block_fixed.read_subblock(
                    sub_in_block,
                    num_values,
                    &mut acc.reader,
                    acc.codec.as_ref(),
                )?;
                let scan = self.scan;
                let exclude = self.exclude;
                let (single, lo, hi) = (self.single_value, self.lo, self.hi);
                let filter_values = &self.filter_values;
                let core = &mut self.core;
                let acc = &self.acc;
                let mut row = core.row_id;
                for idx in 0..num_values as usize {
                    let hit = test_row::<T, P>(
                        scan,
                        acc.block_fixed.row(idx),
                        single,
                        filter_values,
                        lo,
                        hi,
                    ) != exclude;
                    if hit {
                        core.collected.push(row);
                    }
                    row += 1;
                }
                core.row_id = row;
            }
            MvaPacking::DeltaPfor => {
                let acc = &mut self.acc;
                acc.block_pfor.read_subblock(
                    sub_in_block,
                    num_values,
                    &mut acc.reader,
                    acc.codec.as_ref(),
                )?;
                let scan = self.scan;
                let exclude = self.exclude;
                let (single, lo, hi) = (self.single_value, self.lo, self.hi);
                let filter_values = &self.filter_values;
                let core = &mut self.core;
                let acc = &self.acc;
                let mut row = core.row_id;
                for idx in 0..num_values as usize {
                    let hit = test_row::<T, P>(
                        scan,
                        acc.block_pfor.row(idx),
                        single,
                        filter_values,
                        lo,
                        hi,
                    ) != exclude;
                    if hit {
                        core.collected.push(row);
                    }
                    row += 1;
                }
                core.row_id = row;
            }
        }
        Ok(num_values)
    }
}

impl<T: IntValue, P: MvaTest, const MATCHING: bool> BlockIterator for MvaAnalyzer<T, P, MATCHING> {
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

// ── Construction ──────────────────────────────────────────────────────────

/// Pick one of the sixteen analyzer variants: attribute width × aggregator ×
/// matching-blocks, wrapped in the four endpoint-closedness specialisations.
/// Unsupported combinations fail here, not inside a scan loop.
pub(crate) fn create_mva_analyzer(
    header: Arc<AttributeHeader>,
    reader: FileReader,
    filter: &Filter,
    matching: Option<MatchingSubblocks>,
) -> Result<Box<dyn BlockIterator>> {
    if filter.mva_aggr == MvaAggr::None {
        return Err(Error::UnsupportedFilter(
            "mva filter without an ANY/ALL aggregator".into(),
        ));
    }
    let left_closed = filter.left_closed || filter.left_unbounded;
    let right_closed = filter.right_closed || filter.right_unbounded;
    match (left_closed, right_closed) {
        (false, false) => {
            with_bounds::<MvaAny<false, false>, MvaAll<false, false>>(header, reader, filter, matching)
        }
        (false, true) => {
            with_bounds::<MvaAny<false, true>, MvaAll<false, true>>(header, reader, filter, matching)
        }
        (true, false) => {
            with_bounds::<MvaAny<true, false>, MvaAll<true, false>>(header, reader, filter, matching)
        }
        (true, true) => {
            with_bounds::<MvaAny<true, true>, MvaAll<true, true>>(header, reader, filter, matching)
        }
    }
}

fn with_bounds<ANY: MvaTest + 'static, ALL: MvaTest + 'static>(
    header: Arc<AttributeHeader>,
    reader: FileReader,
    filter: &Filter,
    matching: Option<MatchingSubblocks>,
) -> Result<Box<dyn BlockIterator>> {
    let any = filter.mva_aggr == MvaAggr::Any;
    let boxed: Box<dyn BlockIterator> = match (header.attr_type(), any, matching.is_some()) {
        (AttrType::Uint32Set, false, false) => {
            Box::new(MvaAnalyzer::<u32, ALL, false>::new(header, reader, filter, matching)?)
        }
        (AttrType::Uint32Set, false, true) => {
            Box::new(MvaAnalyzer::<u32, ALL, true>::new(header, reader, filter, matching)?)
        }
        (AttrType::Uint32Set, true, false) => {
            Box::new(MvaAnalyzer::<u32, ANY, false>::new(header, reader, filter, matching)?)
        }
        (AttrType::Uint32Set, true, true) => {
            Box::new(MvaAnalyzer::<u32, ANY, true>::new(header, reader, filter, matching)?)
        }
        (AttrType::Int64Set, false, false) => {
            Box::new(MvaAnalyzer::<u64, ALL, false>::new(header, reader, filter, matching)?)
        }
        (AttrType::Int64Set, false, true) => {
            Box::new(MvaAnalyzer::<u64, ALL, true>::new(header, reader, filter, matching)?)
        }
        (AttrType::Int64Set, true, false) => {
            Box::new(MvaAnalyzer::<u64, ANY, false>::new(header, reader, filter, matching)?)
        }
        (AttrType::Int64Set, true, true) => {
            Box::new(MvaAnalyzer::<u64, ANY, true>::new(header, reader, filter, matching)?)
        }
        (AttrType::Bool, ..) => {
            return Err(Error::TypeMismatch {
                expected: "uint32set/int64set",
                got: "bool",
            });
        }
    };
    Ok(boxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    type AnyCC = MvaAny<true, true>;
    type AnyOC = MvaAny<false, true>;
    type AnyCO = MvaAny<true, false>;
    type AllCC = MvaAll<true, true>;
    type AllOO = MvaAll<false, false>;

    #[test]
    fn test_any_values() {
        let v: Vec<u32> = vec![5, 15, 25];
        assert!(AnyCC::test_values(&v, &[1, 15]));
        assert!(!AnyCC::test_values(&v, &[1, 2, 24]));
        assert!(!AnyCC::test_values(&v, &[]));
        assert!(!AnyCC::test_values(&Vec::<u32>::new(), &[1]));
    }

    #[test]
    fn test_any_single() {
        let v: Vec<u64> = vec![3, 9, 12];
        assert!(AnyCC::test_single(&v, 9));
        assert!(!AnyCC::test_single(&v, 10));
    }

    #[test]
    fn test_any_range_closedness() {
        // Rows from the range scenarios: [10, 20] vs (10, 20]
        let row3: Vec<u32> = vec![10];
        let row4: Vec<u32> = vec![20, 21];
        assert!(AnyCC::test_range(&row3, 10, 20));
        assert!(!AnyOC::test_range(&row3, 10, 20));
        assert!(AnyCC::test_range(&row4, 10, 20));
        assert!(AnyOC::test_range(&row4, 10, 20));
        assert!(!AnyCO::test_range(&vec![20u32], 10, 20));

        let mid: Vec<u32> = vec![5, 15, 25];
        assert!(AnyCC::test_range(&mid, 10, 20));
        assert!(AnyOC::test_range(&mid, 10, 20));
        assert!(!AnyCC::test_range(&vec![30u32, 40], 10, 20));
        assert!(!AnyCC::test_range(&vec![9u32], 10, 20));
    }

    #[test]
    fn test_any_range_open_left_bound_hit() {
        // Lower bound present with a successor qualifies under an open left
        // endpoint; present as the last element does not.
        assert!(AnyOC::test_range(&vec![10u32, 15], 10, 20));
        assert!(!AnyOC::test_range(&vec![5u32, 10], 10, 20));
    }

    #[test]
    fn test_all_values() {
        let tests = vec![1i64, 2, 3];
        assert!(AllCC::test_values(&vec![1u32, 2], &tests));
        assert!(AllCC::test_values(&vec![1u32, 2, 3], &tests));
        assert!(!AllCC::test_values(&vec![2u32, 4], &tests));
        assert!(!AllCC::test_values(&Vec::<u32>::new(), &tests));
    }

    #[test]
    fn test_all_single_and_range() {
        assert!(AllCC::test_single(&vec![7u32, 7, 7], 7));
        assert!(!AllCC::test_single(&vec![7u32, 8], 7));
        assert!(!AllCC::test_single(&Vec::<u32>::new(), 7));

        assert!(AllCC::test_range(&vec![10u32, 20], 10, 20));
        assert!(!AllOO::test_range(&vec![10u32, 20], 10, 20));
        assert!(AllOO::test_range(&vec![11u32, 19], 10, 20));
        assert!(!AllCC::test_range(&Vec::<u32>::new(), 10, 20));
    }

    #[test]
    fn test_signed_compare_for_u64_storage() {
        // Int64Set values are stored as two's-complement u64 and compared
        // in the signed domain.
        let v: Vec<u64> = vec![(-5i64) as u64, 3u64];
        assert!(AnyCC::test_single(&v, -5));
        assert!(AnyCC::test_range(&v, -10, -1));
    }

    #[test]
    fn test_offsets_from_lengths() {
        let offsets = offsets_from_lengths(&[3, 0, 2], 5).unwrap();
        assert_eq!(offsets, vec![0, 3, 3, 5]);
        assert!(offsets_from_lengths(&[3, 3], 5).is_err());
    }

    #[test]
    fn test_subblock_byte_range() {
        let cum = vec![10u32, 25, 25, 40];
        assert_eq!(subblock_byte_range(&cum, 0).unwrap(), (0, 10));
        assert_eq!(subblock_byte_range(&cum, 1).unwrap(), (10, 15));
        assert_eq!(subblock_byte_range(&cum, 2).unwrap(), (25, 0));
        assert!(subblock_byte_range(&cum, 4).is_err());
    }

    #[test]
    fn test_inverse_deltas_strided() {
        let mut values: Vec<u32> = vec![1, 2, 3, 10, 0, 5];
        inverse_deltas_strided(&mut values, 3);
        assert_eq!(values, vec![1, 3, 6, 10, 10, 15]);
    }
}
