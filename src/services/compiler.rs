//! Translation of a scope's filter set into query conditions

use crate::core::filter::{Filter, FilterSpec, VariantColumns};
use crate::core::range::RangeSet;
use crate::core::types::FilterKind;
use crate::sql::Condition;
use std::collections::BTreeMap;

pub const RANGE_ACCUMULATOR_ID: &str = "range_filters";
pub const RANGE_ACCUMULATOR_NAME: &str = "Range Filters";

/// Compiles filter sets into condition rows.
///
/// Chromosome and position filters are placed first so that the generated
/// conditions test the cheap, selective columns before anything else. Order
/// never changes the result: the row is ANDed as a whole.
#[derive(Debug, Clone, Default)]
pub struct ConditionCompiler {
    columns: VariantColumns,
}

impl ConditionCompiler {
    pub fn new(columns: VariantColumns) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &VariantColumns {
        &self.columns
    }

    /// Query-capable filters of one scope, with every range filter folded
    /// into a single accumulator placed last.
    pub fn query_filters(&self, filters: &BTreeMap<String, Filter>) -> Vec<Filter> {
        let mut out = Vec::with_capacity(filters.len());
        let mut merged: Option<RangeSet> = None;
        for filter in filters.values() {
            match filter.kind() {
                FilterKind::Range => {
                    if let Some(set) = filter.range_set() {
                        merged.get_or_insert_with(RangeSet::new).merge(set);
                    }
                }
                FilterKind::Query => out.push(filter.clone()),
                FilterKind::Other => {}
            }
        }
        if let Some(set) = merged {
            out.push(Filter::new(
                RANGE_ACCUMULATOR_ID,
                RANGE_ACCUMULATOR_NAME,
                FilterSpec::Range(set),
            ));
        }
        out
    }

    /// Move chromosome filters to the front, then position filters; the rest
    /// keep their relative order.
    pub fn prioritize(&self, mut filters: Vec<Filter>) -> Vec<Filter> {
        let mut result = Vec::with_capacity(filters.len());
        for id in [&self.columns.chromosome, &self.columns.position] {
            let (matching, rest): (Vec<Filter>, Vec<Filter>) =
                filters.into_iter().partition(|f| &f.id == id);
            result.extend(matching);
            filters = rest;
        }
        result.extend(filters);
        result
    }

    /// One condition per contributing filter, in priority order.
    ///
    /// A filter with several values yields their OR; a filter that yields
    /// nothing is dropped rather than emitted as a vacuous clause.
    pub fn compile(&self, filters: &BTreeMap<String, Filter>) -> Vec<Condition> {
        self.prioritize(self.query_filters(filters))
            .iter()
            .filter_map(|f| Condition::or(f.conditions(&self.columns)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::range::Range;
    use crate::sql::Row;
    use pretty_assertions::assert_eq;

    fn set_of(filters: Vec<Filter>) -> BTreeMap<String, Filter> {
        filters.into_iter().map(|f| (f.id.clone(), f)).collect()
    }

    fn region(id: &str, chrom: &str, start: u64, end: u64) -> Filter {
        Filter::range(id, id, RangeSet::new().with_range(chrom, Range::new(start, end)))
    }

    #[test]
    fn range_filters_merge_into_one_condition() {
        let compiler = ConditionCompiler::default();
        let filters = set_of(vec![region("a", "1", 10, 20), region("b", "1", 15, 30)]);

        let conditions = compiler.compile(&filters);
        assert_eq!(
            conditions,
            vec![Condition::And(vec![
                Condition::equals("chrom", "1"),
                Condition::between("position", 10, 30),
            ])]
        );

        let at = |pos: &str| -> Row {
            [("chrom", "1"), ("position", pos)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        assert!(conditions[0].evaluate_row(&at("12")).unwrap());
        assert!(conditions[0].evaluate_row(&at("28")).unwrap());
        assert!(!conditions[0].evaluate_row(&at("31")).unwrap());
    }

    #[test]
    fn range_accumulator_goes_last() {
        let compiler = ConditionCompiler::default();
        let filters = set_of(vec![region("aaa", "1", 1, 2), Filter::equality("gene", "TP53")]);
        let ids: Vec<String> = compiler
            .query_filters(&filters)
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec!["gene", RANGE_ACCUMULATOR_ID]);
    }

    #[test]
    fn empty_range_filter_contributes_nothing() {
        let compiler = ConditionCompiler::default();
        let filters = set_of(vec![Filter::range("r", "Regions", RangeSet::new())]);
        assert_eq!(compiler.query_filters(&filters).len(), 1);
        assert!(compiler.compile(&filters).is_empty());
    }

    #[test]
    fn chromosome_then_position_then_rest() {
        let compiler = ConditionCompiler::default();
        let filters = set_of(vec![
            Filter::equality("other", "1"),
            Filter::numeric("position", 1.0, 2.0),
            Filter::equality("chrom", "X"),
        ]);
        let ids: Vec<String> = compiler
            .prioritize(compiler.query_filters(&filters))
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec!["chrom", "position", "other"]);
    }

    #[test]
    fn multi_valued_filter_is_ored() {
        let compiler = ConditionCompiler::default();
        let filters = set_of(vec![Filter::membership("gene", ["BRCA1", "BRCA2"])]);
        assert_eq!(
            compiler.compile(&filters),
            vec![Condition::Or(vec![
                Condition::equals("gene", "BRCA1"),
                Condition::equals("gene", "BRCA2"),
            ])]
        );
    }

    #[test]
    fn passive_filters_are_skipped() {
        let compiler = ConditionCompiler::default();
        let filters = set_of(vec![Filter::new("ui", "UI only", FilterSpec::Passive)]);
        assert!(compiler.query_filters(&filters).is_empty());
    }

    #[test]
    fn priority_follows_configured_columns() {
        let compiler = ConditionCompiler::new(VariantColumns {
            chromosome: "chr".into(),
            position: "pos".into(),
        });
        let filters = set_of(vec![Filter::equality("chrom", "1"), Filter::equality("chr", "2")]);
        let first = compiler.compile(&filters).remove(0);
        assert_eq!(first, Condition::equals("chr", "2"));
    }
}
