//! Sediment - the read path of a columnar attribute store
//!
//! Given a store file produced by the paired writer, this library serves:
//! - Point lookups: a positional iterator returning the value at any row id
//! - Bulk filtering: analyzers streaming the sorted row ids whose attribute
//!   value satisfies a predicate, in subblock-sized batches
//! - Block-and-subblock storage with per-block packing selection
//!   (CONST/BITMAP for bool, CONST/CONSTLEN/TABLE/DELTA_PFOR for sets)
//! - PFOR-family integer codec and fixed-slot bit packing
//! - Block skipping over constant and dictionary blocks, plus
//!   caller-provided candidate-subblock hints from min/max summaries

pub mod accessor;
pub mod analyzer;
pub mod codec;
pub mod columnar;
pub mod error;
pub mod filter;
pub mod format;
mod iterator_tests;
pub mod layout;
pub mod reader;
pub mod writer;

// Re-exports from accessor
pub use accessor::ColumnIterator;

// Re-exports from analyzer
pub use analyzer::{BlockIterator, MatchingSubblocks};

// Re-exports from columnar
pub use columnar::{BlockTester, Columnar, GetAttrId, IteratorHints, MinMaxVec, lib_version};

// Re-exports from filter
pub use filter::{Filter, FilterType, MvaAggr, is_filter_degenerate, value_in_interval};

// Re-exports from format
pub use format::{AttrType, FORMAT_VERSION, Settings};

// Re-exports from other modules
pub use error::{Error, Result};
pub use reader::{FileReader, OwnedBytes};
pub use writer::StoreWriter;

/// 32-bit document identifier.
pub type RowId = u32;

/// Sentinel row id meaning "unset".
pub const INVALID_ROW_ID: RowId = RowId::MAX;
