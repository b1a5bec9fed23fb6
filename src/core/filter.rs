use crate::core::range::RangeSet;
use crate::core::types::FilterKind;
use crate::sql::Condition;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHROMOSOME_COLUMN: &str = "chrom";
pub const DEFAULT_POSITION_COLUMN: &str = "position";

/// Names of the variant-table columns that carry genomic coordinates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantColumns {
    #[serde(default = "default_chromosome_column")]
    pub chromosome: String,
    #[serde(default = "default_position_column")]
    pub position: String,
}

fn default_chromosome_column() -> String {
    DEFAULT_CHROMOSOME_COLUMN.to_string()
}

fn default_position_column() -> String {
    DEFAULT_POSITION_COLUMN.to_string()
}

impl Default for VariantColumns {
    fn default() -> Self {
        Self {
            chromosome: default_chromosome_column(),
            position: default_position_column(),
        }
    }
}

/// What a filter restricts, and the data needed to build its conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSpec {
    /// Genomic intervals; unioned with every other range filter in the scope
    Range(RangeSet),
    Equality { column: String, value: String },
    /// Any of the listed values
    Membership { column: String, values: Vec<String> },
    /// Inclusive numeric bounds
    Numeric { column: String, min: f64, max: f64 },
    /// Pre-built conditions, ORed together
    Composite { conditions: Vec<Condition> },
    /// Holds UI state only and never restricts the query
    Passive,
}

/// A named predicate contributed by one control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub id: String,
    pub name: String,
    pub spec: FilterSpec,
}

impl Filter {
    pub fn new(id: impl Into<String>, name: impl Into<String>, spec: FilterSpec) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            spec,
        }
    }

    pub fn range(id: impl Into<String>, name: impl Into<String>, ranges: RangeSet) -> Self {
        Self::new(id, name, FilterSpec::Range(ranges))
    }

    /// Equality filter identified by its column
    pub fn equality(column: impl Into<String>, value: impl Into<String>) -> Self {
        let column = column.into();
        Self::new(
            column.clone(),
            column.clone(),
            FilterSpec::Equality {
                column,
                value: value.into(),
            },
        )
    }

    /// Membership filter identified by its column
    pub fn membership<I, S>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let column = column.into();
        Self::new(
            column.clone(),
            column.clone(),
            FilterSpec::Membership {
                column,
                values: values.into_iter().map(Into::into).collect(),
            },
        )
    }

    /// Numeric range filter identified by its column
    pub fn numeric(column: impl Into<String>, min: f64, max: f64) -> Self {
        let column = column.into();
        Self::new(
            column.clone(),
            column.clone(),
            FilterSpec::Numeric { column, min, max },
        )
    }

    pub fn kind(&self) -> FilterKind {
        match self.spec {
            FilterSpec::Range(_) => FilterKind::Range,
            FilterSpec::Passive => FilterKind::Other,
            _ => FilterKind::Query,
        }
    }

    pub fn range_set(&self) -> Option<&RangeSet> {
        match &self.spec {
            FilterSpec::Range(set) => Some(set),
            _ => None,
        }
    }

    /// The individual conditions this filter contributes.
    ///
    /// The compiler ORs them into one clause; an empty result means the filter
    /// places no restriction and is left out entirely.
    pub fn conditions(&self, columns: &VariantColumns) -> Vec<Condition> {
        match &self.spec {
            FilterSpec::Range(set) => set.conditions(&columns.chromosome, &columns.position),
            FilterSpec::Equality { column, value } => {
                vec![Condition::equals(column.as_str(), value.as_str())]
            }
            FilterSpec::Membership { column, values } => values
                .iter()
                .map(|v| Condition::equals(column.as_str(), v.as_str()))
                .collect(),
            FilterSpec::Numeric { column, min, max } => {
                vec![Condition::between(column.as_str(), min, max)]
            }
            FilterSpec::Composite { conditions } => conditions.clone(),
            FilterSpec::Passive => Vec::new(),
        }
    }

    /// Format the filter as a one-line summary for status displays
    pub fn summary(&self) -> String {
        match &self.spec {
            FilterSpec::Range(set) => {
                let regions = set.to_regions();
                if regions.len() > 3 {
                    format!(
                        "{}: {}, {}... ({} regions)",
                        self.name,
                        regions[0],
                        regions[1],
                        regions.len()
                    )
                } else {
                    format!("{}: {}", self.name, regions.join(", "))
                }
            }
            FilterSpec::Equality { column, value } => format!("{column} = \"{value}\""),
            FilterSpec::Membership { column, values } => {
                format!("{} in [{}]", column, values.join(", "))
            }
            FilterSpec::Numeric { column, min, max } => {
                format!("{column} between {min} and {max}")
            }
            FilterSpec::Composite { conditions } => {
                let parts: Vec<String> = conditions.iter().map(ToString::to_string).collect();
                format!("{}: {}", self.name, parts.join(" OR "))
            }
            FilterSpec::Passive => self.name.clone(),
        }
    }
}
