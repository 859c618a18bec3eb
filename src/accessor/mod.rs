//! Per-type stored-block decoders, iterators and analyzer scan loops.
//!
//! Each attribute type supplies three layers:
//!
//! - **stored blocks**: one decoder per packing; `read_header` runs once per
//!   block, `read_subblock` decodes on demand and caches the last subblock.
//! - **accessor**: holds the positioned reader plus every decoder the
//!   attribute may need, and dispatches on the packing tag read per block.
//! - **iterator / analyzer**: the public cursors built on the accessor.

pub mod boolean;
pub mod mva;

use crate::RowId;
use crate::error::{Error, Result};

/// Positional cursor over one attribute's values.
///
/// `advance_to` positions the cursor; the `get` family reads the value at
/// the requested row. Rows may be requested in any order, but ascending
/// order keeps the decoded block cache warm. The cursor does not track which
/// rows it has served.
pub trait ColumnIterator {
    /// Position the cursor on `row_id`. Returns `row_id` back.
    fn advance_to(&mut self, row_id: RowId) -> RowId;

    /// Scalar value at the requested row (0/1 for bool attributes).
    fn get(&mut self) -> Result<i64>;

    /// Multi-valued payload at the requested row as little-endian bytes.
    /// With `pack`, the payload is prefixed with its varint byte length.
    /// The slice is invalidated by the next call on this iterator.
    fn get_bytes(&mut self, pack: bool) -> Result<&[u8]>;

    /// String payload length; only string attributes have one.
    fn get_length(&mut self) -> Result<usize> {
        Err(Error::Usage("string length requested from a non-string iterator"))
    }

    fn string_hash(&mut self) -> Result<u64> {
        Err(Error::Usage("string hash requested from a non-string iterator"))
    }

    fn have_string_hashes(&self) -> bool {
        false
    }
}
