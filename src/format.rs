//! On-disk store format: settings, attribute directory, footer.
//!
//! ## File layout
//!
//! ```text
//! [attr 0 block data] [attr 1 block data] ... [attr N block data]
//! [TOC: version, settings, AttributeHeader × num_attrs]
//! [footer: toc_offset(8) + num_attrs(4) + magic(4)]  = 16 bytes
//! ```
//!
//! Block data is opaque at this level: each block starts with a varint
//! packing tag interpreted by the per-type decoders. The TOC is read once at
//! open time and shared read-only by every iterator and analyzer.
//!
//! All multi-byte integers are little-endian; variable-length integers are
//! LEB128. Packing tags are position-defined and must not be renumbered
//! without a format version bump.

use std::io::{self, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::codec::put_vint;
use crate::error::{Error, Result};
use crate::layout::BlockLayout;
use crate::reader::FileReader;

/// Magic number in the store footer.
pub const STORE_MAGIC: u32 = 0x31444553; // "SED1"

/// Format version; bump on any layout or tag-numbering change.
pub const FORMAT_VERSION: u32 = 4;

/// Footer size: toc_offset(8) + num_attrs(4) + magic(4) = 16
pub const FOOTER_SIZE: usize = 16;

// ── Attribute type ────────────────────────────────────────────────────────

/// Type of a stored attribute. Position-defined, persisted as one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttrType {
    Bool = 0,
    /// Multi-valued set of unsigned 32-bit integers.
    Uint32Set = 1,
    /// Multi-valued set of signed 64-bit integers.
    Int64Set = 2,
}

impl AttrType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Bool),
            1 => Some(Self::Uint32Set),
            2 => Some(Self::Int64Set),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Uint32Set => "uint32set",
            Self::Int64Set => "int64set",
        }
    }
}

// ── Settings ──────────────────────────────────────────────────────────────

/// Per-store settings, persisted in the TOC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Rows per block. Blocks are the packing-selection unit.
    pub rows_per_block: u32,
    /// Rows per subblock for scalar attributes (the decode unit).
    pub subblock_size: u32,
    /// Rows per subblock for multi-valued attributes.
    pub subblock_size_mva: u32,
    /// Rows per min/max summary leaf.
    pub min_max_leaf_size: u32,
    /// Codec name for 32-bit value streams.
    pub compression_u32: String,
    /// Codec name for 64-bit value streams.
    pub compression_u64: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rows_per_block: 65536,
            subblock_size: 128,
            subblock_size_mva: 128,
            min_max_leaf_size: 128,
            compression_u32: "simdfastpfor128".to_string(),
            compression_u64: "fastpfor128".to_string(),
        }
    }
}

impl Settings {
    /// Subblock size for a given attribute type.
    pub fn subblock_size_for(&self, attr_type: AttrType) -> u32 {
        match attr_type {
            AttrType::Bool => self.subblock_size,
            AttrType::Uint32Set | AttrType::Int64Set => self.subblock_size_mva,
        }
    }

    pub fn load(reader: &mut FileReader) -> Result<Self> {
        let settings = Self {
            rows_per_block: reader.unpack_u32()?,
            subblock_size: reader.unpack_u32()?,
            subblock_size_mva: reader.unpack_u32()?,
            min_max_leaf_size: reader.unpack_u32()?,
            compression_u32: reader.read_string()?,
            compression_u64: reader.read_string()?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, out: &mut Vec<u8>) -> Result<()> {
        self.validate()?;
        put_vint(out, self.rows_per_block as u64);
        put_vint(out, self.subblock_size as u64);
        put_vint(out, self.subblock_size_mva as u64);
        put_vint(out, self.min_max_leaf_size as u64);
        write_string(out, &self.compression_u32)?;
        write_string(out, &self.compression_u64)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        // Bitmap and table-index payloads pack subblocks into u32 words.
        for size in [self.subblock_size, self.subblock_size_mva] {
            if size == 0 || size % 32 != 0 {
                return Err(Error::Corruption(format!(
                    "subblock size {size} is not a positive multiple of 32"
                )));
            }
        }
        if self.rows_per_block == 0 || self.min_max_leaf_size == 0 {
            return Err(Error::Corruption("zero-sized block settings".into()));
        }
        Ok(())
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) -> Result<()> {
    out.write_u32::<LittleEndian>(s.len() as u32)
        .map_err(io_to_err)?;
    out.write_all(s.as_bytes()).map_err(io_to_err)?;
    Ok(())
}

fn io_to_err(e: io::Error) -> Error {
    Error::Io(e)
}

// ── Attribute header ──────────────────────────────────────────────────────

/// Per-attribute directory: block offsets, document count, and the min/max
/// summary driving block-level prefiltering. Immutable after open; shared
/// read-only by every cursor over the attribute.
#[derive(Debug)]
pub struct AttributeHeader {
    name: String,
    attr_type: AttrType,
    num_docs: u32,
    block_offsets: Vec<u64>,
    /// Per-leaf (min, max) over the attribute's values, one leaf per
    /// `min_max_leaf_size` rows. Empty leaves store an inverted pair.
    minmax: Vec<(i64, i64)>,
    settings: Arc<Settings>,
}

impl AttributeHeader {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr_type(&self) -> AttrType {
        self.attr_type
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn num_blocks(&self) -> u32 {
        self.block_offsets.len() as u32
    }

    pub fn block_offset(&self, block_id: u32) -> Result<u64> {
        self.block_offsets
            .get(block_id as usize)
            .copied()
            .ok_or_else(|| {
                Error::Corruption(format!(
                    "block {block_id} out of range for attribute '{}' ({} blocks)",
                    self.name,
                    self.block_offsets.len()
                ))
            })
    }

    pub fn minmax(&self) -> &[(i64, i64)] {
        &self.minmax
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Block/subblock arithmetic for this attribute.
    pub fn layout(&self) -> BlockLayout {
        BlockLayout::new(
            self.settings.subblock_size_for(self.attr_type),
            self.settings.rows_per_block,
            self.num_docs,
        )
    }

    pub(crate) fn new(
        name: String,
        attr_type: AttrType,
        num_docs: u32,
        block_offsets: Vec<u64>,
        minmax: Vec<(i64, i64)>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            name,
            attr_type,
            num_docs,
            block_offsets,
            minmax,
            settings,
        }
    }

    pub(crate) fn read_from(reader: &mut FileReader, settings: &Arc<Settings>) -> Result<Self> {
        let name = reader.read_string()?;
        let type_byte = reader.read_u8()?;
        let attr_type = AttrType::from_u8(type_byte)
            .ok_or_else(|| Error::Corruption(format!("unknown attribute type {type_byte}")))?;
        let num_docs = reader.read_u32()?;
        let num_blocks = reader.read_u32()? as usize;

        let expected_blocks = BlockLayout::new(
            settings.subblock_size_for(attr_type),
            settings.rows_per_block,
            num_docs,
        )
        .num_blocks() as usize;
        if num_blocks != expected_blocks {
            return Err(Error::Corruption(format!(
                "attribute '{name}': {num_blocks} blocks on disk, {expected_blocks} expected \
                 for {num_docs} docs"
            )));
        }

        let mut block_offsets = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            block_offsets.push(reader.read_u64()?);
        }

        let num_leaves = reader.read_u32()? as usize;
        let mut minmax = Vec::with_capacity(num_leaves);
        for _ in 0..num_leaves {
            let min = reader.read_i64()?;
            let max = reader.read_i64()?;
            minmax.push((min, max));
        }

        Ok(Self {
            name,
            attr_type,
            num_docs,
            block_offsets,
            minmax,
            settings: Arc::clone(settings),
        })
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        write_string(out, &self.name)?;
        out.push(self.attr_type as u8);
        out.write_u32::<LittleEndian>(self.num_docs).map_err(io_to_err)?;
        out.write_u32::<LittleEndian>(self.block_offsets.len() as u32)
            .map_err(io_to_err)?;
        for &offset in &self.block_offsets {
            out.write_u64::<LittleEndian>(offset).map_err(io_to_err)?;
        }
        out.write_u32::<LittleEndian>(self.minmax.len() as u32)
            .map_err(io_to_err)?;
        for &(min, max) in &self.minmax {
            out.write_i64::<LittleEndian>(min).map_err(io_to_err)?;
            out.write_i64::<LittleEndian>(max).map_err(io_to_err)?;
        }
        Ok(())
    }
}

// ── Footer ────────────────────────────────────────────────────────────────

pub(crate) fn write_footer(out: &mut Vec<u8>, toc_offset: u64, num_attrs: u32) -> Result<()> {
    out.write_u64::<LittleEndian>(toc_offset).map_err(io_to_err)?;
    out.write_u32::<LittleEndian>(num_attrs).map_err(io_to_err)?;
    out.write_u32::<LittleEndian>(STORE_MAGIC).map_err(io_to_err)?;
    Ok(())
}

/// Read the footer from the last 16 bytes. Returns (toc_offset, num_attrs).
pub(crate) fn read_footer(data: &[u8]) -> Result<(u64, u32)> {
    if data.len() < FOOTER_SIZE {
        return Err(Error::Corruption("store file too small for footer".into()));
    }
    let footer = &data[data.len() - FOOTER_SIZE..];
    let toc_offset = u64::from_le_bytes(footer[0..8].try_into().unwrap());
    let num_attrs = u32::from_le_bytes(footer[8..12].try_into().unwrap());
    let magic = u32::from_le_bytes(footer[12..16].try_into().unwrap());
    if magic != STORE_MAGIC {
        return Err(Error::Corruption(format!("bad store magic: 0x{magic:08x}")));
    }
    if toc_offset as usize > data.len() - FOOTER_SIZE {
        return Err(Error::Corruption("TOC offset out of bounds".into()));
    }
    Ok((toc_offset, num_attrs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::OwnedBytes;

    #[test]
    fn test_settings_roundtrip() {
        let settings = Settings {
            rows_per_block: 1024,
            subblock_size: 64,
            subblock_size_mva: 128,
            min_max_leaf_size: 128,
            compression_u32: "simdfastpfor128".into(),
            compression_u64: "fastpfor128".into(),
        };
        let mut buf = Vec::new();
        settings.save(&mut buf).unwrap();
        let mut reader = FileReader::new(OwnedBytes::new(buf));
        let loaded = Settings::load(&mut reader).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_settings_rejects_unaligned_subblock() {
        let settings = Settings {
            subblock_size: 100,
            ..Settings::default()
        };
        let mut buf = Vec::new();
        assert!(settings.save(&mut buf).is_err());
    }

    #[test]
    fn test_header_roundtrip() {
        let settings = Arc::new(Settings {
            rows_per_block: 256,
            ..Settings::default()
        });
        let header = AttributeHeader::new(
            "tags".into(),
            AttrType::Uint32Set,
            600,
            vec![16, 700, 1400],
            vec![(1, 9), (0, 42), (i64::MAX, i64::MIN)],
            Arc::clone(&settings),
        );
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();

        let mut reader = FileReader::new(OwnedBytes::new(buf));
        let loaded = AttributeHeader::read_from(&mut reader, &settings).unwrap();
        assert_eq!(loaded.name(), "tags");
        assert_eq!(loaded.attr_type(), AttrType::Uint32Set);
        assert_eq!(loaded.num_docs(), 600);
        assert_eq!(loaded.num_blocks(), 3);
        assert_eq!(loaded.block_offset(2).unwrap(), 1400);
        assert!(loaded.block_offset(3).is_err());
        assert_eq!(loaded.minmax().len(), 3);
    }

    #[test]
    fn test_footer_roundtrip() {
        let mut buf = vec![0u8; 100];
        write_footer(&mut buf, 42, 3).unwrap();
        let (toc, n) = read_footer(&buf).unwrap();
        assert_eq!((toc, n), (42, 3));

        let mut bad = buf.clone();
        let len = bad.len();
        bad[len - 1] ^= 0xff;
        assert!(read_footer(&bad).is_err());
    }
}
