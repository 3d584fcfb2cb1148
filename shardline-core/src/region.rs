//! Key regions
//!
//! A region is a set of half-open `[start, end)` key ranges. Ranges are kept
//! sorted and merged so two regions covering the same keys compare equal.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open key range; `end == None` means unbounded
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound
    pub start: String,
    /// Exclusive upper bound, unbounded when `None`
    pub end: Option<String>,
}

impl KeyRange {
    /// Create a range
    pub fn new(start: impl Into<String>, end: Option<String>) -> Self {
        Self {
            start: start.into(),
            end,
        }
    }

    fn is_empty(&self) -> bool {
        matches!(&self.end, Some(end) if *end <= self.start)
    }

    fn contains_key(&self, key: &str) -> bool {
        key >= self.start.as_str() && self.end.as_deref().is_none_or(|end| key < end)
    }

}

fn end_ge(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => a >= b,
    }
}

/// A normalized set of key ranges owned by one branch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    ranges: Vec<KeyRange>,
}

impl Region {
    /// Region covering every key
    pub fn universe() -> Self {
        Self {
            ranges: vec![KeyRange::new("", None)],
        }
    }

    /// Region covering no key
    pub fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Region covering `[start, end)`
    pub fn range(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self::from_ranges([KeyRange::new(start, Some(end.into()))])
    }

    /// Build a region from arbitrary ranges, merging overlaps
    pub fn from_ranges(ranges: impl IntoIterator<Item = KeyRange>) -> Self {
        let mut ranges: Vec<KeyRange> = ranges.into_iter().filter(|r| !r.is_empty()).collect();
        ranges.sort_by(|a, b| a.start.cmp(&b.start));

        let mut merged: Vec<KeyRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if last.end.as_deref().is_none_or(|end| range.start.as_str() <= end) => {
                    if !end_ge(&last.end, &range.end) {
                        last.end = range.end;
                    }
                }
                _ => merged.push(range),
            }
        }

        Self { ranges: merged }
    }

    /// Ranges in ascending order
    pub fn ranges(&self) -> &[KeyRange] {
        &self.ranges
    }

    /// True when no key is covered
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Check whether a key falls into this region
    pub fn contains_key(&self, key: &str) -> bool {
        self.ranges.iter().any(|r| r.contains_key(key))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return write!(f, "{{}}");
        }
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|r| match &r.end {
                Some(end) => format!("[{:?}, {:?})", r.start, end),
                None => format!("[{:?}, +inf)", r.start),
            })
            .collect();
        write!(f, "{}", parts.join(" u "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_universe_contains_everything() {
        let region = Region::universe();
        assert!(region.contains_key(""));
        assert!(region.contains_key("zzz"));
        assert_ne!(region, Region::range("a", "m"));
    }

    #[test]
    fn test_half_open_bounds() {
        let region = Region::range("a", "m");
        assert!(region.contains_key("a"));
        assert!(region.contains_key("lzz"));
        assert!(!region.contains_key("m"));
        assert!(!region.contains_key("0"));
    }

    #[test]
    fn test_normalization_merges_overlaps() {
        let a = Region::from_ranges([
            KeyRange::new("f", Some("z".into())),
            KeyRange::new("a", Some("g".into())),
        ]);
        assert_eq!(a, Region::range("a", "z"));
        assert_eq!(a.ranges().len(), 1);
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let a = Region::from_ranges([
            KeyRange::new("a", Some("m".into())),
            KeyRange::new("m", None),
        ]);
        assert_eq!(a.ranges(), &[KeyRange::new("a", None)]);
        assert!(a.contains_key("zzz"));
    }

    #[test]
    fn test_empty_ranges_dropped() {
        let a = Region::from_ranges([KeyRange::new("m", Some("a".into()))]);
        assert!(a.is_empty());
        assert_eq!(a, Region::empty());
    }
}
