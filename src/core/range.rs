//! Genomic interval sets with union semantics
//!
//! Range filters over the same chromosome must be unioned, never ANDed:
//! restricting to five regions means "in any of these", so each contribution
//! is folded into one [`RangeSet`] before conditions are generated.

use crate::sql::Condition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeParseError {
    #[error("region '{0}' is not of the form chrom:start-end")]
    Malformed(String),
    #[error("invalid coordinate '{0}'")]
    Coordinate(String),
}

/// Inclusive interval `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    /// Bounds given in either order are normalized so that `start <= end`.
    pub fn new(start: u64, end: u64) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    pub fn contains(&self, position: u64) -> bool {
        self.start <= position && position <= self.end
    }

    /// True when the two intervals overlap or abut.
    fn touches(&self, other: &Range) -> bool {
        other.start <= self.end.saturating_add(1) && self.start <= other.end.saturating_add(1)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Per-chromosome union of intervals, kept sorted and coalesced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    ranges: BTreeMap<String, Vec<Range>>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(mut self, chrom: impl Into<String>, range: Range) -> Self {
        self.add(chrom, range);
        self
    }

    pub fn add(&mut self, chrom: impl Into<String>, range: Range) {
        let list = self.ranges.entry(chrom.into()).or_default();
        list.push(range);
        coalesce(list);
    }

    /// Union another set into this one.
    pub fn merge(&mut self, other: &RangeSet) {
        for (chrom, ranges) in &other.ranges {
            let list = self.ranges.entry(chrom.clone()).or_default();
            list.extend(ranges.iter().copied());
            coalesce(list);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.values().all(Vec::is_empty)
    }

    /// Number of disjoint intervals across all chromosomes
    pub fn len(&self) -> usize {
        self.ranges.values().map(Vec::len).sum()
    }

    pub fn chromosomes(&self) -> impl Iterator<Item = &str> {
        self.ranges.keys().map(String::as_str)
    }

    pub fn ranges(&self, chrom: &str) -> &[Range] {
        self.ranges.get(chrom).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Range)> {
        self.ranges
            .iter()
            .flat_map(|(chrom, list)| list.iter().map(move |r| (chrom.as_str(), r)))
    }

    pub fn contains(&self, chrom: &str, position: u64) -> bool {
        self.ranges(chrom).iter().any(|r| r.contains(position))
    }

    /// One `chrom = c AND position BETWEEN s AND e` condition per interval.
    pub fn conditions(&self, chrom_column: &str, position_column: &str) -> Vec<Condition> {
        self.iter()
            .map(|(chrom, range)| {
                Condition::And(vec![
                    Condition::equals(chrom_column, chrom),
                    Condition::between(position_column, range.start, range.end),
                ])
            })
            .collect()
    }

    /// `chrom:start-end` strings, one per interval
    pub fn to_regions(&self) -> Vec<String> {
        self.iter()
            .map(|(chrom, range)| format!("{chrom}:{range}"))
            .collect()
    }

    pub fn from_regions<I, S>(regions: I) -> Result<Self, RangeParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = RangeSet::new();
        for region in regions {
            let (chrom, range) = parse_region(region.as_ref())?;
            set.add(chrom, range);
        }
        Ok(set)
    }
}

fn coalesce(list: &mut Vec<Range>) {
    list.sort();
    let mut merged: Vec<Range> = Vec::with_capacity(list.len());
    for range in list.drain(..) {
        match merged.last_mut() {
            Some(last) if last.touches(&range) => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    *list = merged;
}

fn parse_region(region: &str) -> Result<(String, Range), RangeParseError> {
    let malformed = || RangeParseError::Malformed(region.to_string());
    let (chrom, span) = region.trim().rsplit_once(':').ok_or_else(malformed)?;
    let (start, end) = span.split_once('-').ok_or_else(malformed)?;
    if chrom.is_empty() {
        return Err(malformed());
    }
    let coord = |s: &str| {
        u64::from_str(s.trim()).map_err(|_| RangeParseError::Coordinate(s.to_string()))
    };
    Ok((chrom.to_string(), Range::new(coord(start)?, coord(end)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn overlapping_intervals_union() {
        let mut set = RangeSet::new().with_range("chr1", Range::new(10, 20));
        set.merge(&RangeSet::new().with_range("chr1", Range::new(15, 30)));
        assert_eq!(set.ranges("chr1"), &[Range::new(10, 30)]);
    }

    #[test]
    fn adjacent_intervals_coalesce() {
        let set = RangeSet::new()
            .with_range("chr1", Range::new(21, 30))
            .with_range("chr1", Range::new(10, 20));
        assert_eq!(set.ranges("chr1"), &[Range::new(10, 30)]);
    }

    #[test]
    fn disjoint_intervals_stay_apart() {
        let set = RangeSet::new()
            .with_range("chr1", Range::new(40, 50))
            .with_range("chr1", Range::new(10, 20))
            .with_range("chr2", Range::new(10, 20));
        assert_eq!(set.len(), 3);
        assert_eq!(set.ranges("chr1"), &[Range::new(10, 20), Range::new(40, 50)]);
        assert!(!set.contains("chr1", 30));
        assert!(set.contains("chr2", 15));
    }

    #[test]
    fn reversed_bounds_are_normalized() {
        assert_eq!(Range::new(30, 10), Range::new(10, 30));
    }

    #[test]
    fn regions_parse_and_format() {
        let set = RangeSet::from_regions(["chrX:100-200", "chr1:5-9"]).unwrap();
        assert_eq!(set.to_regions(), vec!["chr1:5-9", "chrX:100-200"]);
    }

    #[test]
    fn bad_regions_are_rejected() {
        assert!(matches!(
            RangeSet::from_regions(["chr1"]),
            Err(RangeParseError::Malformed(_))
        ));
        assert!(matches!(
            RangeSet::from_regions(["chr1:a-5"]),
            Err(RangeParseError::Coordinate(_))
        ));
    }

    #[test]
    fn empty_set_yields_no_conditions() {
        assert!(RangeSet::new().conditions("chrom", "position").is_empty());
    }
}
