//! Filter model shared by analyzers and the block-level prefilter.

/// Shape of a filter predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterType {
    #[default]
    None,
    /// Match rows whose value is one of a sorted list.
    Values,
    /// Match rows whose value lies in an interval.
    Range,
    /// Interval over float attributes (not served by bool/set analyzers).
    FloatRange,
}

/// How a multi-valued row qualifies against the predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MvaAggr {
    #[default]
    None,
    /// At least one element qualifies.
    Any,
    /// Every element qualifies.
    All,
}

/// One per-attribute filter, as handed in by the host engine.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub name: String,
    pub exclude: bool,
    pub filter_type: FilterType,
    pub mva_aggr: MvaAggr,
    pub min_value: i64,
    pub max_value: i64,
    pub left_unbounded: bool,
    pub right_unbounded: bool,
    pub left_closed: bool,
    pub right_closed: bool,
    /// Sorted unique values for [`FilterType::Values`].
    pub values: Vec<i64>,
}

impl Filter {
    /// Values filter; the list is sorted and deduplicated.
    pub fn values(name: impl Into<String>, mut values: Vec<i64>) -> Self {
        values.sort_unstable();
        values.dedup();
        Self {
            name: name.into(),
            filter_type: FilterType::Values,
            left_closed: true,
            right_closed: true,
            values,
            ..Self::default()
        }
    }

    /// Interval filter with explicit endpoint closedness.
    pub fn range(
        name: impl Into<String>,
        min_value: i64,
        max_value: i64,
        left_closed: bool,
        right_closed: bool,
    ) -> Self {
        Self {
            name: name.into(),
            filter_type: FilterType::Range,
            min_value,
            max_value,
            left_closed,
            right_closed,
            ..Self::default()
        }
    }

    pub fn with_aggr(mut self, aggr: MvaAggr) -> Self {
        self.mva_aggr = aggr;
        self
    }

    pub fn excluded(mut self) -> Self {
        self.exclude = true;
        self
    }

    /// Lower bound with unboundedness folded in. The returned closedness is
    /// forced closed for an unbounded side so the extreme value itself passes.
    pub(crate) fn lower_bound(&self) -> (i64, bool) {
        if self.left_unbounded {
            (i64::MIN, true)
        } else {
            (self.min_value, self.left_closed)
        }
    }

    pub(crate) fn upper_bound(&self) -> (i64, bool) {
        if self.right_unbounded {
            (i64::MAX, true)
        } else {
            (self.max_value, self.right_closed)
        }
    }
}

/// Interval membership with the filter's closedness flags applied.
pub fn value_in_interval(value: i64, filter: &Filter) -> bool {
    let (lo, lo_closed) = filter.lower_bound();
    let (hi, hi_closed) = filter.upper_bound();
    let above = if lo_closed { value >= lo } else { value > lo };
    let below = if hi_closed { value <= hi } else { value < hi };
    above && below
}

/// A degenerate filter can never change the result set and is dropped by
/// the caller instead of getting an analyzer.
pub fn is_filter_degenerate(filter: &Filter) -> bool {
    match filter.filter_type {
        FilterType::None => true,
        FilterType::Values => filter.values.is_empty(),
        FilterType::Range => {
            if filter.left_unbounded || filter.right_unbounded {
                return false;
            }
            let empty = filter.min_value > filter.max_value
                || (filter.min_value == filter.max_value
                    && !(filter.left_closed && filter.right_closed));
            // An empty interval rejects everything; with exclude it accepts
            // everything. Either way the filter itself is vacuous only when
            // it cannot select: keep empty-and-excluded as a real filter.
            empty && !filter.exclude
        }
        FilterType::FloatRange => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_closedness() {
        for (lc, rc, at_lo, at_hi) in [
            (true, true, true, true),
            (true, false, true, false),
            (false, true, false, true),
            (false, false, false, false),
        ] {
            let f = Filter::range("a", 10, 20, lc, rc);
            assert_eq!(value_in_interval(10, &f), at_lo, "lc={lc} rc={rc}");
            assert_eq!(value_in_interval(20, &f), at_hi, "lc={lc} rc={rc}");
            assert!(value_in_interval(15, &f));
            assert!(!value_in_interval(9, &f));
            assert!(!value_in_interval(21, &f));
        }
    }

    #[test]
    fn test_interval_unbounded() {
        let mut f = Filter::range("a", 0, 20, false, true);
        f.left_unbounded = true;
        assert!(value_in_interval(i64::MIN, &f));
        assert!(value_in_interval(20, &f));
        assert!(!value_in_interval(21, &f));
    }

    #[test]
    fn test_values_sorted_unique() {
        let f = Filter::values("a", vec![5, 1, 5, 3]);
        assert_eq!(f.values, vec![1, 3, 5]);
    }

    #[test]
    fn test_degenerate() {
        assert!(is_filter_degenerate(&Filter::default()));
        assert!(is_filter_degenerate(&Filter::values("a", vec![])));
        assert!(is_filter_degenerate(&Filter::range("a", 5, 4, true, true)));
        assert!(is_filter_degenerate(&Filter::range("a", 5, 5, true, false)));
        assert!(!is_filter_degenerate(&Filter::range("a", 5, 5, true, true)));
        assert!(!is_filter_degenerate(&Filter::values("a", vec![1])));
    }
}
