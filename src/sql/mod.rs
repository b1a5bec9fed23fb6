//! Boolean condition trees produced by filters
//!
//! Conditions are opaque to the registry: they are built by filters, combined by
//! the compiler, and handed to a query executor. They can be rendered as a
//! parameterized `WHERE` fragment or evaluated directly against a row.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// One row per scope; conditions inside a row are ANDed by the consumer.
pub type ConditionMatrix = Vec<Vec<Condition>>;

/// A row of named field values, as seen by [`Condition::evaluate_row`].
pub type Row = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("invalid pattern for column {column}: {source}")]
    InvalidPattern {
        column: String,
        #[source]
        source: regex::Error,
    },
}

/// Boolean expression over named columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Equals { column: String, value: String },
    InList { column: String, values: Vec<String> },
    /// Inclusive on both ends
    Between { column: String, min: String, max: String },
    Matches { column: String, pattern: String, case_sensitive: bool },
    IsNull { column: String },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn equals(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Equals {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn between(column: impl Into<String>, min: impl ToString, max: impl ToString) -> Self {
        Self::Between {
            column: column.into(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }

    /// OR-combine conditions, collapsing the trivial cases.
    ///
    /// Returns `None` for an empty input so callers can suppress the clause
    /// instead of emitting an always-false one.
    pub fn or(conditions: Vec<Condition>) -> Option<Condition> {
        Self::combine(conditions, false)
    }

    /// AND-combine conditions, collapsing the trivial cases.
    pub fn and(conditions: Vec<Condition>) -> Option<Condition> {
        Self::combine(conditions, true)
    }

    fn combine(conditions: Vec<Condition>, all: bool) -> Option<Condition> {
        let mut flat = Vec::with_capacity(conditions.len());
        for condition in conditions {
            match (condition, all) {
                (Condition::And(children), true) | (Condition::Or(children), false) => {
                    flat.extend(children)
                }
                (other, _) => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ if all => Some(Condition::And(flat)),
            _ => Some(Condition::Or(flat)),
        }
    }

    /// Evaluate this condition against a single row.
    ///
    /// Missing columns read as the empty string. Bounds compare numerically
    /// when both sides parse as numbers, lexically otherwise.
    pub fn evaluate_row(&self, row: &Row) -> Result<bool, ConditionError> {
        let cell = |column: &str| cell_value(row, column);
        match self {
            Condition::Equals { column, value } => Ok(cell(column) == value),
            Condition::InList { column, values } => {
                let cell_value = cell(column);
                Ok(values.iter().any(|v| v == cell_value))
            }
            Condition::Between { column, min, max } => {
                let cell_value = cell(column);
                if let (Ok(n), Ok(lo), Ok(hi)) = (
                    cell_value.parse::<f64>(),
                    min.parse::<f64>(),
                    max.parse::<f64>(),
                ) {
                    return Ok(n >= lo && n <= hi);
                }
                Ok(cell_value >= min.as_str() && cell_value <= max.as_str())
            }
            Condition::Matches {
                column,
                pattern,
                case_sensitive,
            } => {
                let re = if *case_sensitive {
                    Regex::new(pattern)
                } else {
                    Regex::new(&format!("(?i){pattern}"))
                }
                .map_err(|source| ConditionError::InvalidPattern {
                    column: column.clone(),
                    source,
                })?;
                Ok(re.is_match(cell(column)))
            }
            Condition::IsNull { column } => {
                let cell_value = cell(column);
                Ok(cell_value.is_empty() || cell_value.eq_ignore_ascii_case("null"))
            }
            Condition::And(children) => {
                for child in children {
                    if !child.evaluate_row(row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or(children) => {
                for child in children {
                    if child.evaluate_row(row)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not(inner) => Ok(!inner.evaluate_row(row)?),
        }
    }

    /// Render as a `WHERE` fragment with `?` placeholders.
    ///
    /// Values always go through the returned parameter vector; only column
    /// names are spliced into the text, quoted with [`quote_identifier`].
    pub fn to_sql(&self) -> (String, Vec<String>) {
        let mut params = Vec::new();
        let sql = self.write_sql(&mut params);
        (sql, params)
    }

    fn write_sql(&self, params: &mut Vec<String>) -> String {
        match self {
            Condition::Equals { column, value } => {
                params.push(value.clone());
                format!("{} = ?", quote_identifier(column))
            }
            Condition::InList { column, values } => {
                if values.is_empty() {
                    return "1=0".to_string();
                }
                params.extend(values.iter().cloned());
                let placeholders = vec!["?"; values.len()].join(", ");
                format!("{} IN ({})", quote_identifier(column), placeholders)
            }
            Condition::Between { column, min, max } => {
                params.push(min.clone());
                params.push(max.clone());
                format!("{} BETWEEN ? AND ?", quote_identifier(column))
            }
            Condition::Matches {
                column,
                pattern,
                case_sensitive,
            } => {
                if *case_sensitive {
                    params.push(pattern.clone());
                } else {
                    params.push(format!("(?i){pattern}"));
                }
                format!("regexp_matches({}, ?)", quote_identifier(column))
            }
            Condition::IsNull { column } => format!("{} IS NULL", quote_identifier(column)),
            Condition::And(children) => join_sql(children, " AND ", "1=1", params),
            Condition::Or(children) => join_sql(children, " OR ", "1=0", params),
            Condition::Not(inner) => format!("NOT ({})", inner.write_sql(params)),
        }
    }

    /// Columns referenced anywhere in this tree, in first-seen order
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Equals { column, .. }
            | Condition::InList { column, .. }
            | Condition::Between { column, .. }
            | Condition::Matches { column, .. }
            | Condition::IsNull { column } => {
                if !out.contains(&column.as_str()) {
                    out.push(column);
                }
            }
            Condition::And(children) | Condition::Or(children) => {
                for child in children {
                    child.collect_columns(out);
                }
            }
            Condition::Not(inner) => inner.collect_columns(out),
        }
    }
}

fn cell_value<'a>(row: &'a Row, column: &str) -> &'a str {
    row.get(column).map(String::as_str).unwrap_or("")
}

fn join_sql(children: &[Condition], sep: &str, empty: &str, params: &mut Vec<String>) -> String {
    if children.is_empty() {
        return empty.to_string();
    }
    let parts: Vec<String> = children.iter().map(|c| c.write_sql(params)).collect();
    format!("({})", parts.join(sep))
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Equals { column, value } => write!(f, "{column} = \"{value}\""),
            Condition::InList { column, values } => {
                let display_values = if values.len() > 3 {
                    format!("{}, {}... ({} total)", values[0], values[1], values.len())
                } else {
                    values.join(", ")
                };
                write!(f, "{column} in [{display_values}]")
            }
            Condition::Between { column, min, max } => {
                write!(f, "{column} between {min} and {max}")
            }
            Condition::Matches { column, pattern, .. } => write!(f, "{column} matches /{pattern}/"),
            Condition::IsNull { column } => write!(f, "{column} is null"),
            Condition::And(children) => write_joined(f, children, " AND "),
            Condition::Or(children) => write_joined(f, children, " OR "),
            Condition::Not(inner) => write!(f, "NOT ({inner})"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, children: &[Condition], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            write!(f, "{sep}")?;
        }
        write!(f, "{child}")?;
    }
    write!(f, ")")
}

/// Quote a column name for inclusion in generated SQL text
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// AND together one scope's row of conditions into a single `WHERE` fragment.
pub fn row_to_sql(row: &[Condition]) -> (String, Vec<String>) {
    match Condition::and(row.to_vec()) {
        Some(condition) => condition.to_sql(),
        None => ("1=1".to_string(), Vec::new()),
    }
}
