//! Store-level API: open a columnar file, hand out iterators and analyzers.
//!
//! A [`Columnar`] owns the mapped file and the parsed attribute directory.
//! Every cursor it creates clones the mapping cheaply and seeks on its own;
//! the directory itself is immutable after open and shared read-only.

use std::path::Path;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::accessor::{ColumnIterator, boolean, mva};
use crate::analyzer::{BlockIterator, MatchingSubblocks};
use crate::error::{Error, Result};
use crate::filter::{Filter, is_filter_degenerate};
use crate::format::{AttrType, AttributeHeader, FORMAT_VERSION, Settings, read_footer};
use crate::reader::{FileReader, OwnedBytes};

/// Hints passed by the host when creating an iterator.
#[derive(Debug, Clone, Copy, Default)]
pub struct IteratorHints {
    /// Rows will be requested in ascending order; enables OS read-ahead.
    pub sequential: bool,
    /// The host wants string hashes (string attributes only).
    pub need_string_hashes: bool,
}

/// Per-attribute (min, max) summaries handed to a [`BlockTester`], indexed
/// by the host's attribute ids.
pub type MinMaxVec = Vec<(i64, i64)>;

/// Host-side combination test over per-attribute min/max summaries.
/// Returning false must be sound: a rejected leaf may not contain a match.
pub trait BlockTester {
    fn test(&self, minmax: &MinMaxVec) -> bool;
}

/// Maps an attribute name to the host's index into a [`MinMaxVec`].
pub type GetAttrId<'a> = &'a dyn Fn(&str) -> Option<usize>;

/// An opened columnar attribute store.
pub struct Columnar {
    data: OwnedBytes,
    settings: Arc<Settings>,
    attrs: Vec<Arc<AttributeHeader>>,
    by_name: FxHashMap<String, usize>,
    total_docs: u32,
}

impl Columnar {
    /// Open a store file via a read-only memory mapping.
    ///
    /// `total_docs` is the host's row count; the stored directory must
    /// agree, per attribute, or the store is considered corrupt.
    pub fn open(path: impl AsRef<Path>, total_docs: u32) -> Result<Self> {
        Self::open_data(OwnedBytes::mmap(path.as_ref())?, total_docs)
    }

    /// Open a store from an in-memory buffer.
    pub fn open_bytes(bytes: Vec<u8>, total_docs: u32) -> Result<Self> {
        Self::open_data(OwnedBytes::new(bytes), total_docs)
    }

    fn open_data(data: OwnedBytes, total_docs: u32) -> Result<Self> {
        let (toc_offset, num_attrs) = read_footer(data.as_slice())?;
        let mut reader = FileReader::new(data.clone());
        reader.seek(toc_offset);

        let version = reader.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "store format version {version}, this library reads {FORMAT_VERSION}"
            )));
        }
        let settings = Arc::new(Settings::load(&mut reader)?);

        let mut attrs = Vec::with_capacity(num_attrs as usize);
        let mut by_name = FxHashMap::default();
        for _ in 0..num_attrs {
            let header = AttributeHeader::read_from(&mut reader, &settings)?;
            if header.num_docs() != total_docs {
                return Err(Error::Corruption(format!(
                    "attribute '{}' holds {} docs, host expects {total_docs}",
                    header.name(),
                    header.num_docs()
                )));
            }
            if by_name.insert(header.name().to_string(), attrs.len()).is_some() {
                return Err(Error::Corruption(format!(
                    "duplicate attribute '{}'",
                    header.name()
                )));
            }
            attrs.push(Arc::new(header));
        }

        debug!(attrs = attrs.len(), total_docs, "opened columnar store");
        Ok(Self {
            data,
            settings,
            attrs,
            by_name,
            total_docs,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn total_docs(&self) -> u32 {
        self.total_docs
    }

    pub fn attribute(&self, name: &str) -> Option<&Arc<AttributeHeader>> {
        self.by_name.get(name).map(|&i| &self.attrs[i])
    }

    fn header(&self, name: &str) -> Result<Arc<AttributeHeader>> {
        self.attribute(name)
            .cloned()
            .ok_or_else(|| Error::AttributeNotFound(name.to_string()))
    }

    /// Create a point-lookup iterator over one attribute.
    pub fn create_iterator(
        &self,
        name: &str,
        hints: &IteratorHints,
    ) -> Result<Box<dyn ColumnIterator>> {
        let header = self.header(name)?;
        if hints.sequential {
            self.data.advise_sequential();
        }
        let reader = FileReader::new(self.data.clone());
        match header.attr_type() {
            AttrType::Bool => Ok(boolean::create_bool_iterator(header, reader)),
            AttrType::Uint32Set | AttrType::Int64Set => mva::create_mva_iterator(header, reader),
        }
    }

    /// Create an analyzer for one filter, optionally restricted to a
    /// caller-provided candidate subblock list.
    pub fn create_analyzer(
        &self,
        filter: &Filter,
        matching: Option<MatchingSubblocks>,
    ) -> Result<Box<dyn BlockIterator>> {
        let header = self.header(&filter.name)?;
        let reader = FileReader::new(self.data.clone());
        match header.attr_type() {
            AttrType::Bool => boolean::create_bool_analyzer(header, reader, filter, matching),
            AttrType::Uint32Set | AttrType::Int64Set => {
                mva::create_mva_analyzer(header, reader, filter, matching)
            }
        }
    }

    /// For each filter over a stored attribute, build an analyzer, fed with
    /// a candidate-subblock list when the min/max summaries can narrow the
    /// scan through `tester`. Returns the analyzers plus the indices of
    /// filters they fully absorb (the host needn't re-apply those).
    /// Degenerate filters and filters over unknown attributes are left to
    /// the host untouched.
    pub fn create_analyzer_or_prefilter(
        &self,
        filters: &[Filter],
        tester: &dyn BlockTester,
        get_attr_id: GetAttrId<'_>,
    ) -> Result<(Vec<Box<dyn BlockIterator>>, Vec<usize>)> {
        let mut iterators = Vec::new();
        let mut absorbed = Vec::new();
        for (index, filter) in filters.iter().enumerate() {
            if is_filter_degenerate(filter) {
                continue;
            }
            let Some(header) = self.attribute(&filter.name) else {
                continue;
            };
            let matching = self.matching_subblocks(header, tester, get_attr_id);
            match self.create_analyzer(filter, matching) {
                Ok(analyzer) => {
                    iterators.push(analyzer);
                    absorbed.push(index);
                }
                // A filter shape these attributes cannot serve stays with
                // the host; real IO/corruption failures surface.
                Err(Error::UnsupportedFilter(_)) | Err(Error::TypeMismatch { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok((iterators, absorbed))
    }

    /// Evaluate the min/max leaves of one attribute through the host tester.
    /// Returns None when the whole attribute must be scanned (no summaries,
    /// mismatched leaf granularity, or every leaf qualified).
    fn matching_subblocks(
        &self,
        header: &Arc<AttributeHeader>,
        tester: &dyn BlockTester,
        get_attr_id: GetAttrId<'_>,
    ) -> Option<MatchingSubblocks> {
        let attr_id = get_attr_id(header.name())?;
        let leaves = header.minmax();
        if leaves.is_empty() {
            return None;
        }
        // Leaf granularity must line up with subblocks for the hint protocol.
        let layout = header.layout();
        if self.settings.min_max_leaf_size != layout.subblock_size()
            || leaves.len() != layout.total_subblocks() as usize
        {
            return None;
        }

        let mut template: MinMaxVec = vec![(i64::MIN, i64::MAX); attr_id + 1];
        let mut candidates = Vec::new();
        let mut all = true;
        for (leaf_id, &leaf) in leaves.iter().enumerate() {
            template[attr_id] = leaf;
            if tester.test(&template) {
                candidates.push(leaf_id as u32);
            } else {
                all = false;
            }
        }
        if all {
            // No narrowing; a dense scan avoids the indirection.
            None
        } else {
            Some(MatchingSubblocks::new(candidates))
        }
    }

    /// True iff the filter combination is provably empty from the
    /// whole-attribute min/max bounds alone.
    pub fn early_reject(
        &self,
        filters: &[Filter],
        tester: &dyn BlockTester,
        get_attr_id: GetAttrId<'_>,
    ) -> bool {
        let mut template: MinMaxVec = Vec::new();
        let mut resolved_any = false;
        for filter in filters {
            let Some(header) = self.attribute(&filter.name) else {
                continue;
            };
            let Some(attr_id) = get_attr_id(header.name()) else {
                continue;
            };
            let Some(bounds) = attribute_bounds(header.minmax()) else {
                continue;
            };
            if template.len() <= attr_id {
                template.resize(attr_id + 1, (i64::MIN, i64::MAX));
            }
            template[attr_id] = bounds;
            resolved_any = true;
        }
        resolved_any && !tester.test(&template)
    }

    /// See [`crate::filter::is_filter_degenerate`].
    pub fn is_filter_degenerate(&self, filter: &Filter) -> bool {
        is_filter_degenerate(filter)
    }
}

/// Fold per-leaf summaries into whole-attribute bounds, skipping inverted
/// (empty) leaves. None when every leaf is empty.
fn attribute_bounds(leaves: &[(i64, i64)]) -> Option<(i64, i64)> {
    let mut folded: Option<(i64, i64)> = None;
    for &(min, max) in leaves {
        if min > max {
            continue;
        }
        folded = Some(match folded {
            Some((lo, hi)) => (lo.min(min), hi.max(max)),
            None => (min, max),
        });
    }
    folded
}

/// Version of the store format this library reads and writes.
pub fn lib_version() -> u32 {
    FORMAT_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_bounds() {
        assert_eq!(attribute_bounds(&[]), None);
        assert_eq!(attribute_bounds(&[(i64::MAX, i64::MIN)]), None);
        assert_eq!(
            attribute_bounds(&[(3, 9), (i64::MAX, i64::MIN), (-2, 4)]),
            Some((-2, 9))
        );
    }

    #[test]
    fn test_open_rejects_garbage() {
        assert!(Columnar::open_bytes(vec![0u8; 4], 0).is_err());
        let mut junk = vec![0u8; 64];
        junk[60] = 0xde;
        assert!(Columnar::open_bytes(junk, 0).is_err());
    }
}
