//! Paired writer producing the store format the read path consumes.
//!
//! The writer collects whole attribute columns, splits them into blocks,
//! and picks the cheapest packing per block:
//!
//! - bool: all rows equal → CONST, else BITMAP
//! - sets: all rows equal → CONST; ≤256 distinct vectors → TABLE;
//!   constant row length → CONSTLEN; else DELTA_PFOR
//!
//! Alongside the block payloads it emits per-subblock min/max leaves, the
//! attribute directory, persisted settings, and the footer. Set rows are
//! sorted and deduplicated on the way in; the stored form is the per-row
//! first-difference expected by the decoders.

use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use rustc_hash::FxHashMap;

use crate::codec::{
    IntCodec, IntValue, bitpack_slots, bits_for_table, create_int_codec, delta_encode,
    packed_word_count, put_vint,
};
use crate::error::{Error, Result};
use crate::format::{AttrType, AttributeHeader, FORMAT_VERSION, Settings, write_footer};
use crate::layout::BlockLayout;

enum AttrData {
    Bool { name: String, values: Vec<bool> },
    U32Set { name: String, rows: Vec<Vec<u32>> },
    I64Set { name: String, rows: Vec<Vec<u64>> },
}

impl AttrData {
    fn name(&self) -> &str {
        match self {
            AttrData::Bool { name, .. } => name,
            AttrData::U32Set { name, .. } => name,
            AttrData::I64Set { name, .. } => name,
        }
    }

    fn num_docs(&self) -> usize {
        match self {
            AttrData::Bool { values, .. } => values.len(),
            AttrData::U32Set { rows, .. } => rows.len(),
            AttrData::I64Set { rows, .. } => rows.len(),
        }
    }
}

/// Builds one store file from complete attribute columns.
pub struct StoreWriter {
    settings: Settings,
    attrs: Vec<AttrData>,
}

impl StoreWriter {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            attrs: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Settings::default())
    }

    pub fn add_bool_attribute(&mut self, name: impl Into<String>, values: Vec<bool>) {
        self.attrs.push(AttrData::Bool {
            name: name.into(),
            values,
        });
    }

    pub fn add_uint32set_attribute(&mut self, name: impl Into<String>, mut rows: Vec<Vec<u32>>) {
        for row in &mut rows {
            row.sort_unstable();
            row.dedup();
        }
        self.attrs.push(AttrData::U32Set {
            name: name.into(),
            rows,
        });
    }

    pub fn add_int64set_attribute(&mut self, name: impl Into<String>, rows: Vec<Vec<i64>>) {
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.sort_unstable();
                row.dedup();
                row.into_iter().map(|v| v as u64).collect()
            })
            .collect();
        self.attrs.push(AttrData::I64Set {
            name: name.into(),
            rows,
        });
    }

    /// Serialize the store. Every attribute must cover the same row count.
    pub fn finish(self) -> Result<Vec<u8>> {
        let total_docs = match self.attrs.first() {
            Some(attr) => attr.num_docs(),
            None => 0,
        };
        for attr in &self.attrs {
            if attr.num_docs() != total_docs {
                return Err(Error::Usage("attributes hold differing row counts"));
            }
        }
        {
            let mut seen = FxHashMap::default();
            for attr in &self.attrs {
                if seen.insert(attr.name(), ()).is_some() {
                    return Err(Error::Usage("duplicate attribute name"));
                }
            }
        }

        let settings = Arc::new(self.settings.clone());
        let codec = create_int_codec(&settings.compression_u32, &settings.compression_u64)?;
        let total_docs = total_docs as u32;

        let mut out = Vec::new();
        let mut headers = Vec::new();
        for attr in &self.attrs {
            let header = match attr {
                AttrData::Bool { name, values } => {
                    let layout =
                        BlockLayout::new(settings.subblock_size, settings.rows_per_block, total_docs);
                    let (offsets, minmax) = write_bool_attr(&mut out, values, &layout)?;
                    AttributeHeader::new(
                        name.clone(),
                        AttrType::Bool,
                        total_docs,
                        offsets,
                        minmax,
                        Arc::clone(&settings),
                    )
                }
                AttrData::U32Set { name, rows } => {
                    let layout = BlockLayout::new(
                        settings.subblock_size_mva,
                        settings.rows_per_block,
                        total_docs,
                    );
                    let (offsets, minmax) =
                        write_mva_attr(&mut out, rows, &layout, codec.as_ref())?;
                    AttributeHeader::new(
                        name.clone(),
                        AttrType::Uint32Set,
                        total_docs,
                        offsets,
                        minmax,
                        Arc::clone(&settings),
                    )
                }
                AttrData::I64Set { name, rows } => {
                    let layout = BlockLayout::new(
                        settings.subblock_size_mva,
                        settings.rows_per_block,
                        total_docs,
                    );
                    let (offsets, minmax) =
                        write_mva_attr(&mut out, rows, &layout, codec.as_ref())?;
                    AttributeHeader::new(
                        name.clone(),
                        AttrType::Int64Set,
                        total_docs,
                        offsets,
                        minmax,
                        Arc::clone(&settings),
                    )
                }
            };
            headers.push(header);
        }

        let toc_offset = out.len() as u64;
        out.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        settings.save(&mut out)?;
        for header in &headers {
            header.write_to(&mut out)?;
        }
        write_footer(&mut out, toc_offset, headers.len() as u32)?;
        Ok(out)
    }

    pub fn write_to_path(self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.finish()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

// ── Bool blocks ───────────────────────────────────────────────────────────

type BlockDirectory = (Vec<u64>, Vec<(i64, i64)>);

fn write_bool_attr(out: &mut Vec<u8>, values: &[bool], layout: &BlockLayout) -> Result<BlockDirectory> {
    let sbs = layout.subblock_size() as usize;
    let mut offsets = Vec::new();
    let mut minmax = Vec::new();

    for block in 0..layout.num_blocks() {
        offsets.push(out.len() as u64);
        let start = layout.block_start_row(block) as usize;
        let docs = layout.num_docs_in_block(block) as usize;
        let slice = &values[start..start + docs];

        let first = slice[0];
        if slice.iter().all(|&v| v == first) {
            put_vint(out, 0); // CONST
            out.push(first as u8);
        } else {
            put_vint(out, 1); // BITMAP
            for chunk in slice.chunks(sbs) {
                let bits: Vec<u32> = chunk.iter().map(|&v| v as u32).collect();
                let mut words = vec![0u32; sbs >> 5];
                bitpack_slots(&bits, 1, &mut words);
                for w in words {
                    out.write_u32::<LittleEndian>(w)?;
                }
            }
        }

        for chunk in slice.chunks(sbs) {
            let min = chunk.iter().map(|&v| v as i64).min().unwrap_or(0);
            let max = chunk.iter().map(|&v| v as i64).max().unwrap_or(0);
            minmax.push((min, max));
        }
    }
    Ok((offsets, minmax))
}

// ── Set blocks ────────────────────────────────────────────────────────────

/// Flatten rows with each row replaced by its first differences.
fn delta_encoded_rows<T: IntValue>(rows: &[Vec<T>]) -> Vec<T> {
    let mut flat = Vec::new();
    for row in rows {
        let start = flat.len();
        flat.extend_from_slice(row);
        delta_encode(&mut flat[start..]);
    }
    flat
}

fn write_mva_attr<T: IntValue + std::hash::Hash>(
    out: &mut Vec<u8>,
    rows: &[Vec<T>],
    layout: &BlockLayout,
    codec: &dyn IntCodec,
) -> Result<BlockDirectory> {
    let sbs = layout.subblock_size() as usize;
    let mut offsets = Vec::new();
    let mut minmax = Vec::new();

    for block in 0..layout.num_blocks() {
        offsets.push(out.len() as u64);
        let start = layout.block_start_row(block) as usize;
        let docs = layout.num_docs_in_block(block) as usize;
        let block_rows = &rows[start..start + docs];

        // Distinct vectors in first-occurrence order, bailing past 256.
        let mut table: Vec<&[T]> = Vec::new();
        let mut index_of: FxHashMap<&[T], u32> = FxHashMap::default();
        let mut row_indexes: Vec<u32> = Vec::with_capacity(docs);
        let mut overflow = false;
        for row in block_rows {
            let key = row.as_slice();
            let ix = match index_of.get(key) {
                Some(&ix) => ix,
                None => {
                    if table.len() == 256 {
                        overflow = true;
                        break;
                    }
                    let ix = table.len() as u32;
                    index_of.insert(key, ix);
                    table.push(key);
                    ix
                }
            };
            row_indexes.push(ix);
        }

        if !overflow && table.len() == 1 {
            write_const_block(out, table[0], codec);
        } else if !overflow {
            write_table_block(out, &table, &row_indexes, sbs, codec)?;
        } else if block_rows.iter().all(|r| r.len() == block_rows[0].len()) {
            write_fixed_len_block(out, block_rows, sbs, codec);
        } else {
            write_pfor_block(out, block_rows, sbs, codec);
        }

        for chunk in block_rows.chunks(sbs) {
            let mut leaf = (i64::MAX, i64::MIN);
            for row in chunk {
                for &v in row {
                    let c = v.cmp_value();
                    leaf.0 = leaf.0.min(c);
                    leaf.1 = leaf.1.max(c);
                }
            }
            minmax.push(leaf);
        }
    }
    Ok((offsets, minmax))
}

fn write_const_block<T: IntValue>(out: &mut Vec<u8>, row: &[T], codec: &dyn IntCodec) {
    put_vint(out, 0); // CONST
    let mut vector = row.to_vec();
    delta_encode(&mut vector);
    let mut stream = Vec::new();
    T::encode_with(codec, &vector, &mut stream);
    put_vint(out, stream.len() as u64);
    out.extend_from_slice(&stream);
}

fn write_table_block<T: IntValue>(
    out: &mut Vec<u8>,
    table: &[&[T]],
    row_indexes: &[u32],
    sbs: usize,
    codec: &dyn IntCodec,
) -> Result<()> {
    put_vint(out, 2); // TABLE

    let lengths: Vec<u32> = table.iter().map(|e| e.len() as u32).collect();
    let mut lengths_stream = Vec::new();
    codec.encode32(&lengths, &mut lengths_stream);
    put_vint(out, lengths_stream.len() as u64);
    out.extend_from_slice(&lengths_stream);

    let mut flat: Vec<T> = Vec::new();
    for entry in table {
        let start = flat.len();
        flat.extend_from_slice(entry);
        delta_encode(&mut flat[start..]);
    }
    let mut values_stream = Vec::new();
    T::encode_with(codec, &flat, &mut values_stream);
    put_vint(out, values_stream.len() as u64);
    out.extend_from_slice(&values_stream);

    let bits = bits_for_table(table.len());
    for chunk in row_indexes.chunks(sbs) {
        let mut words = vec![0u32; packed_word_count(sbs, bits)];
        bitpack_slots(chunk, bits, &mut words);
        for w in words {
            out.write_u32::<LittleEndian>(w)?;
        }
    }
    Ok(())
}

fn write_fixed_len_block<T: IntValue>(
    out: &mut Vec<u8>,
    block_rows: &[Vec<T>],
    sbs: usize,
    codec: &dyn IntCodec,
) {
    put_vint(out, 1); // CONSTLEN
    put_vint(out, block_rows[0].len() as u64);

    let mut payloads = Vec::new();
    for chunk in block_rows.chunks(sbs) {
        let flat = delta_encoded_rows(chunk);
        let mut stream = Vec::new();
        T::encode_with(codec, &flat, &mut stream);
        payloads.push(stream);
    }
    write_subblock_payloads(out, &payloads, codec);
}

fn write_pfor_block<T: IntValue>(
    out: &mut Vec<u8>,
    block_rows: &[Vec<T>],
    sbs: usize,
    codec: &dyn IntCodec,
) {
    put_vint(out, 3); // DELTA_PFOR

    let mut payloads = Vec::new();
    for chunk in block_rows.chunks(sbs) {
        let lengths: Vec<u32> = chunk.iter().map(|r| r.len() as u32).collect();
        let mut lengths_stream = Vec::new();
        codec.encode32(&lengths, &mut lengths_stream);

        let flat = delta_encoded_rows(chunk);
        let mut values_stream = Vec::new();
        T::encode_with(codec, &flat, &mut values_stream);

        let mut payload = Vec::new();
        put_vint(&mut payload, lengths_stream.len() as u64);
        payload.extend_from_slice(&lengths_stream);
        payload.extend_from_slice(&values_stream);
        payloads.push(payload);
    }
    write_subblock_payloads(out, &payloads, codec);
}

/// Per-subblock byte sizes (PFOR, first-difference form) followed by the
/// payloads themselves.
fn write_subblock_payloads(out: &mut Vec<u8>, payloads: &[Vec<u8>], codec: &dyn IntCodec) {
    let sizes: Vec<u32> = payloads.iter().map(|p| p.len() as u32).collect();
    let mut sizes_stream = Vec::new();
    codec.encode32(&sizes, &mut sizes_stream);
    put_vint(out, sizes_stream.len() as u64);
    out.extend_from_slice(&sizes_stream);
    for payload in payloads {
        out.extend_from_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_sorted_on_add() {
        let mut writer = StoreWriter::with_defaults();
        writer.add_uint32set_attribute("tags", vec![vec![9, 3, 3, 7]]);
        match &writer.attrs[0] {
            AttrData::U32Set { rows, .. } => assert_eq!(rows[0], vec![3, 7, 9]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_int64_rows_sorted_signed() {
        let mut writer = StoreWriter::with_defaults();
        writer.add_int64set_attribute("vals", vec![vec![5, -3, 5]]);
        match &writer.attrs[0] {
            AttrData::I64Set { rows, .. } => {
                assert_eq!(rows[0], vec![(-3i64) as u64, 5u64]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_mismatched_row_counts() {
        let mut writer = StoreWriter::with_defaults();
        writer.add_bool_attribute("a", vec![true, false]);
        writer.add_uint32set_attribute("b", vec![vec![1]]);
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_duplicate_names() {
        let mut writer = StoreWriter::with_defaults();
        writer.add_bool_attribute("a", vec![true]);
        writer.add_bool_attribute("a", vec![false]);
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_empty_store_roundtrips_footer() {
        let bytes = StoreWriter::with_defaults().finish().unwrap();
        let store = crate::columnar::Columnar::open_bytes(bytes, 0).unwrap();
        assert_eq!(store.total_docs(), 0);
    }
}
