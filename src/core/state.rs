//! Saved filter sets
//!
//! A [`FilterState`] is the flat, persistable form of a filter: a type tag,
//! the display name and id, and a bag of `key -> [values]`. Files hold one
//! `<set>` per saved filter set:
//!
//! ```xml
//! <filters>
//!   <set>
//!     <filter name="Gene" id="gene" type="STRING">
//!       <column>gene</column>
//!       <value>BRCA1</value>
//!     </filter>
//!   </set>
//! </filters>
//! ```

use crate::core::filter::{Filter, FilterSpec};
use crate::core::range::{RangeParseError, RangeSet};
use crate::core::types::ScopeId;
use crate::sql::Condition;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;
use strum::{Display, EnumString};
use thiserror::Error;

pub const ROOT_ELEMENT: &str = "filters";
pub const SET_ELEMENT: &str = "set";
pub const FILTER_ELEMENT: &str = "filter";
pub const TABLE_KEY: &str = "table";

const COLUMN_KEY: &str = "column";
const VALUE_KEY: &str = "value";
const MIN_KEY: &str = "min";
const MAX_KEY: &str = "max";
const REGION_KEY: &str = "region";
const CONDITION_KEY: &str = "condition";

#[derive(Debug, Error)]
pub enum FilterStateError {
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("XML attribute error: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("failed to write XML: {0}")]
    Write(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XML error: <filter> found outside of <set> element")]
    FilterOutsideSet,
    #[error("XML error: <{0}> found outside of <filter> element")]
    ValueOutsideFilter(String),
    #[error("XML error: <filter> is missing the '{0}' attribute")]
    MissingAttribute(&'static str),
    #[error("unknown filter type '{0}'")]
    UnknownType(String),
    #[error("filter '{filter}' has no '{key}' value")]
    MissingValue { filter: String, key: &'static str },
    #[error("filter '{filter}' has a non-numeric '{key}' value: {value}")]
    InvalidNumber {
        filter: String,
        key: &'static str,
        value: String,
    },
    #[error(transparent)]
    Region(#[from] RangeParseError),
    #[error("invalid stored condition: {0}")]
    Condition(#[from] serde_json::Error),
    #[error("no scope ids left after {0}")]
    ScopeExhausted(ScopeId),
}

/// Type tag written to the `type` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterStateType {
    Numeric,
    String,
    Boolean,
    RegionList,
    Generic,
    Plugin,
}

/// Persistable snapshot of one filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterState {
    pub kind: FilterStateType,
    pub name: String,
    pub filter_id: String,
    values: BTreeMap<String, Vec<String>>,
}

impl FilterState {
    pub fn new(kind: FilterStateType, name: impl Into<String>, filter_id: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            filter_id: filter_id.into(),
            values: BTreeMap::new(),
        }
    }

    /// First value stored under `key`, for keys expected to be single-valued
    pub fn one_value(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(|vals| vals.first())
            .map(String::as_str)
    }

    pub fn put_one_value(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.insert(key.into(), vec![value.to_string()]);
    }

    pub fn values(&self, key: &str) -> Option<&[String]> {
        self.values.get(key).map(Vec::as_slice)
    }

    pub fn put_values(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.values.insert(key.into(), values);
    }

    pub fn push_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.entry(key.into()).or_default().push(value.into());
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Table the filter was built against, if recorded
    pub fn table(&self) -> Option<&str> {
        self.one_value(TABLE_KEY)
    }

    fn required(&self, key: &'static str) -> Result<&str, FilterStateError> {
        self.one_value(key).ok_or_else(|| FilterStateError::MissingValue {
            filter: self.filter_id.clone(),
            key,
        })
    }

    fn required_number(&self, key: &'static str) -> Result<f64, FilterStateError> {
        let raw = self.required(key)?;
        f64::from_str(raw.trim()).map_err(|_| FilterStateError::InvalidNumber {
            filter: self.filter_id.clone(),
            key,
            value: raw.to_string(),
        })
    }

    fn write_xml<W: std::io::Write>(&self, writer: &mut Writer<W>) -> Result<(), FilterStateError> {
        let kind = self.kind.to_string();
        let mut start = BytesStart::new(FILTER_ELEMENT);
        start.push_attribute(("name", self.name.as_str()));
        start.push_attribute(("id", self.filter_id.as_str()));
        start.push_attribute(("type", kind.as_str()));
        write_event(writer, Event::Start(start))?;
        for (key, vals) in &self.values {
            for val in vals {
                write_event(writer, Event::Start(BytesStart::new(key.as_str())))?;
                write_event(writer, Event::Text(BytesText::new(val)))?;
                write_event(writer, Event::End(BytesEnd::new(key.as_str())))?;
            }
        }
        write_event(writer, Event::End(BytesEnd::new(FILTER_ELEMENT)))
    }
}

fn write_event<W: std::io::Write>(
    writer: &mut Writer<W>,
    event: Event<'_>,
) -> Result<(), FilterStateError> {
    writer
        .write_event(event)
        .map_err(|e| FilterStateError::Write(e.to_string()))
}

/// Saved form of a filter.
///
/// `STRING` does not record equality versus membership: it is read back by
/// value count. A one-value membership therefore reloads as equality, and
/// saves as `BOOLEAN` from then on if its value is `true` or `false`. The
/// compiled conditions are unchanged either way.
impl From<&Filter> for FilterState {
    fn from(filter: &Filter) -> Self {
        let kind = match &filter.spec {
            FilterSpec::Range(_) => FilterStateType::RegionList,
            FilterSpec::Equality { value, .. } if value == "true" || value == "false" => {
                FilterStateType::Boolean
            }
            FilterSpec::Equality { .. } | FilterSpec::Membership { .. } => FilterStateType::String,
            FilterSpec::Numeric { .. } => FilterStateType::Numeric,
            FilterSpec::Composite { .. } => FilterStateType::Generic,
            FilterSpec::Passive => FilterStateType::Plugin,
        };
        let mut state = FilterState::new(kind, filter.name.clone(), filter.id.clone());
        match &filter.spec {
            FilterSpec::Range(set) => state.put_values(REGION_KEY, set.to_regions()),
            FilterSpec::Equality { column, value } => {
                state.put_one_value(COLUMN_KEY, column);
                state.put_one_value(VALUE_KEY, value);
            }
            FilterSpec::Membership { column, values } => {
                state.put_one_value(COLUMN_KEY, column);
                state.put_values(VALUE_KEY, values.clone());
            }
            FilterSpec::Numeric { column, min, max } => {
                state.put_one_value(COLUMN_KEY, column);
                state.put_one_value(MIN_KEY, min);
                state.put_one_value(MAX_KEY, max);
            }
            FilterSpec::Composite { conditions } => {
                // Conditions are plain serde data, so this cannot fail.
                let encoded = conditions
                    .iter()
                    .filter_map(|c| serde_json::to_string(c).ok())
                    .collect();
                state.put_values(CONDITION_KEY, encoded);
            }
            FilterSpec::Passive => {}
        }
        state
    }
}

impl TryFrom<FilterState> for Filter {
    type Error = FilterStateError;

    fn try_from(state: FilterState) -> Result<Self, Self::Error> {
        let spec = match state.kind {
            FilterStateType::RegionList => {
                let regions = state.values(REGION_KEY).unwrap_or(&[]);
                FilterSpec::Range(RangeSet::from_regions(regions)?)
            }
            FilterStateType::Boolean => FilterSpec::Equality {
                column: state.required(COLUMN_KEY)?.to_string(),
                value: state.required(VALUE_KEY)?.to_string(),
            },
            FilterStateType::String => {
                let column = state.required(COLUMN_KEY)?.to_string();
                match state.values(VALUE_KEY).unwrap_or(&[]) {
                    [single] => FilterSpec::Equality {
                        column,
                        value: single.clone(),
                    },
                    many => FilterSpec::Membership {
                        column,
                        values: many.to_vec(),
                    },
                }
            }
            FilterStateType::Numeric => FilterSpec::Numeric {
                column: state.required(COLUMN_KEY)?.to_string(),
                min: state.required_number(MIN_KEY)?,
                max: state.required_number(MAX_KEY)?,
            },
            FilterStateType::Generic => {
                let conditions = state
                    .values(CONDITION_KEY)
                    .unwrap_or(&[])
                    .iter()
                    .map(|raw| serde_json::from_str::<Condition>(raw))
                    .collect::<Result<Vec<_>, _>>()?;
                FilterSpec::Composite { conditions }
            }
            FilterStateType::Plugin => FilterSpec::Passive,
        };
        Ok(Filter::new(state.filter_id, state.name, spec))
    }
}

/// Serialize saved filter sets into a complete `<filters>` document.
pub fn write_filter_sets(sets: &[Vec<FilterState>]) -> Result<String, FilterStateError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b'\t', 1);
    write_event(&mut writer, Event::Start(BytesStart::new(ROOT_ELEMENT)))?;
    for set in sets {
        write_event(&mut writer, Event::Start(BytesStart::new(SET_ELEMENT)))?;
        for state in set {
            state.write_xml(&mut writer)?;
        }
        write_event(&mut writer, Event::End(BytesEnd::new(SET_ELEMENT)))?;
    }
    write_event(&mut writer, Event::End(BytesEnd::new(ROOT_ELEMENT)))?;
    String::from_utf8(writer.into_inner()).map_err(|e| FilterStateError::Write(e.to_string()))
}

pub fn save_filter_sets(path: &Path, sets: &[Vec<FilterState>]) -> Result<(), FilterStateError> {
    let xml = write_filter_sets(sets)?;
    std::fs::write(path, xml)?;
    Ok(())
}

pub fn read_filter_sets_from_str(xml: &str) -> Result<Vec<Vec<FilterState>>, FilterStateError> {
    read_filter_sets(xml.as_bytes())
}

/// Load the sets of every file, in file order.
pub fn load_filter_sets_from_files<P: AsRef<Path>>(
    paths: &[P],
) -> Result<Vec<Vec<FilterState>>, FilterStateError> {
    let mut sets = Vec::new();
    for path in paths {
        let file = File::open(path.as_ref())?;
        sets.extend(read_filter_sets(BufReader::new(file))?);
    }
    Ok(sets)
}

/// Parse one `<filters>` document.
pub fn read_filter_sets<R: BufRead>(input: R) -> Result<Vec<Vec<FilterState>>, FilterStateError> {
    // Value text is kept verbatim; whitespace between elements never
    // reaches a value because no value element is open then.
    let mut reader = Reader::from_reader(input);

    let mut sets = Vec::new();
    let mut cur_set: Option<Vec<FilterState>> = None;
    let mut cur_filter: Option<FilterState> = None;
    // Element name and accumulated text of the value being read
    let mut cur_value: Option<(String, String)> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let elem = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if elem == SET_ELEMENT {
                    cur_set = Some(Vec::new());
                } else if elem == FILTER_ELEMENT {
                    if cur_set.is_none() {
                        return Err(FilterStateError::FilterOutsideSet);
                    }
                    cur_filter = Some(filter_from_start(&e)?);
                } else if elem != ROOT_ELEMENT {
                    if cur_filter.is_none() {
                        return Err(FilterStateError::ValueOutsideFilter(elem));
                    }
                    cur_value = Some((elem, String::new()));
                }
            }
            Event::Empty(e) => {
                let elem = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if elem == SET_ELEMENT {
                    sets.push(Vec::new());
                } else if elem == FILTER_ELEMENT {
                    let set = cur_set.as_mut().ok_or(FilterStateError::FilterOutsideSet)?;
                    set.push(filter_from_start(&e)?);
                } else if elem != ROOT_ELEMENT {
                    let filter = cur_filter
                        .as_mut()
                        .ok_or_else(|| FilterStateError::ValueOutsideFilter(elem.clone()))?;
                    filter.push_value(elem, String::new());
                }
            }
            Event::Text(t) => {
                if let Some((_, text)) = cur_value.as_mut() {
                    text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some((_, text)) = cur_value.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::End(e) => {
                let elem = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if elem == SET_ELEMENT {
                    if let Some(set) = cur_set.take() {
                        sets.push(set);
                    }
                } else if elem == FILTER_ELEMENT {
                    if let (Some(set), Some(filter)) = (cur_set.as_mut(), cur_filter.take()) {
                        set.push(filter);
                    }
                } else if let Some((key, text)) = cur_value.take() {
                    if let Some(filter) = cur_filter.as_mut() {
                        filter.push_value(key, text);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(sets)
}

fn filter_from_start(e: &BytesStart<'_>) -> Result<FilterState, FilterStateError> {
    let attr = |name: &'static str| -> Result<String, FilterStateError> {
        let value = e
            .try_get_attribute(name)?
            .ok_or(FilterStateError::MissingAttribute(name))?;
        Ok(value.unescape_value()?.into_owned())
    };
    let raw_type = attr("type")?;
    let kind = FilterStateType::from_str(&raw_type)
        .map_err(|_| FilterStateError::UnknownType(raw_type.clone()))?;
    Ok(FilterState::new(kind, attr("name")?, attr("id")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::range::Range;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"<filters>
	<set>
		<filter name="Gene" id="gene" type="STRING">
			<column>gene</column>
			<value>BRCA1</value>
			<value>BRCA2</value>
		</filter>
		<filter name="Quality" id="qual" type="NUMERIC">
			<column>qual</column>
			<min>10</min>
			<max>99.5</max>
		</filter>
	</set>
	<set>
		<filter name="Regions" id="regions" type="REGION_LIST">
			<region>chr1:10-20</region>
		</filter>
	</set>
</filters>"#;

    #[test]
    fn reads_sets_and_multi_valued_keys() {
        let sets = read_filter_sets_from_str(SAMPLE).unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].len(), 2);
        let gene = &sets[0][0];
        assert_eq!(gene.kind, FilterStateType::String);
        assert_eq!(gene.one_value("column"), Some("gene"));
        assert_eq!(
            gene.values("value").unwrap(),
            &["BRCA1".to_string(), "BRCA2".to_string()]
        );
    }

    #[test]
    fn cdata_and_surrounding_whitespace_are_kept() {
        let xml = r#"<filters>
  <set>
    <filter name="Gene" id="gene" type="STRING">
      <column>gene</column>
      <value><![CDATA[BRCA1]]></value>
      <value> a &amp; <![CDATA[<b>]]> </value>
    </filter>
  </set>
</filters>"#;
        let sets = read_filter_sets_from_str(xml).unwrap();
        let gene = &sets[0][0];
        assert_eq!(gene.one_value("column"), Some("gene"));
        assert_eq!(
            gene.values("value").unwrap(),
            &["BRCA1".to_string(), " a & <b> ".to_string()]
        );
    }

    #[test]
    fn filter_outside_set_is_rejected() {
        let xml = r#"<filters><filter name="a" id="a" type="STRING"/></filters>"#;
        assert!(matches!(
            read_filter_sets_from_str(xml),
            Err(FilterStateError::FilterOutsideSet)
        ));
    }

    #[test]
    fn value_outside_filter_is_rejected() {
        let xml = r#"<filters><set><value>x</value></set></filters>"#;
        assert!(matches!(
            read_filter_sets_from_str(xml),
            Err(FilterStateError::ValueOutsideFilter(e)) if e == "value"
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let xml = r#"<filters><set><filter name="a" id="a" type="COLOUR"></filter></set></filters>"#;
        assert!(matches!(
            read_filter_sets_from_str(xml),
            Err(FilterStateError::UnknownType(t)) if t == "COLOUR"
        ));
    }

    #[test]
    fn missing_attribute_is_rejected() {
        let xml = r#"<filters><set><filter name="a" type="STRING"></filter></set></filters>"#;
        assert!(matches!(
            read_filter_sets_from_str(xml),
            Err(FilterStateError::MissingAttribute("id"))
        ));
    }

    #[test]
    fn written_values_are_escaped() {
        let mut state = FilterState::new(FilterStateType::String, "A & B", "ab");
        state.put_one_value("column", "note");
        state.put_one_value("value", "<tag>");
        let xml = write_filter_sets(&[vec![state.clone()]]).unwrap();
        assert!(xml.contains("&lt;tag&gt;"));
        let back = read_filter_sets_from_str(&xml).unwrap();
        assert_eq!(back, vec![vec![state]]);
    }

    #[test]
    fn string_state_with_one_value_becomes_equality() {
        let mut state = FilterState::new(FilterStateType::String, "Chrom", "chrom");
        state.put_one_value("column", "chrom");
        state.put_one_value("value", "X");
        let filter = Filter::try_from(state).unwrap();
        assert_eq!(filter, Filter::new("chrom", "Chrom", FilterSpec::Equality {
            column: "chrom".into(),
            value: "X".into(),
        }));
    }

    #[test]
    fn filters_survive_state_conversion() {
        let filters = vec![
            Filter::range(
                "regions",
                "Regions",
                RangeSet::new().with_range("chr2", Range::new(1, 5)),
            ),
            Filter::membership("gene", ["BRCA1", "TP53"]),
            Filter::numeric("qual", 10.0, 99.5),
            Filter::equality("is_dbsnp", "true"),
            Filter::new(
                "custom",
                "Custom",
                FilterSpec::Composite {
                    conditions: vec![Condition::IsNull { column: "af".into() }],
                },
            ),
            Filter::new("plugin", "Plugin", FilterSpec::Passive),
        ];
        for filter in filters {
            let state = FilterState::from(&filter);
            assert_eq!(Filter::try_from(state).unwrap(), filter);
        }
    }

    #[test]
    fn one_value_membership_reloads_as_equality() {
        let single = Filter::membership("somatic", ["true"]);
        let state = FilterState::from(&single);
        assert_eq!(state.kind, FilterStateType::String);

        let reloaded = Filter::try_from(state).unwrap();
        assert_eq!(reloaded, Filter::equality("somatic", "true"));
        assert_eq!(FilterState::from(&reloaded).kind, FilterStateType::Boolean);

        let columns = crate::core::filter::VariantColumns::default();
        assert_eq!(reloaded.conditions(&columns), single.conditions(&columns));
    }

    #[test]
    fn numeric_state_requires_numbers() {
        let mut state = FilterState::new(FilterStateType::Numeric, "Q", "qual");
        state.put_one_value("column", "qual");
        state.put_one_value("min", "low");
        state.put_one_value("max", "5");
        assert!(matches!(
            Filter::try_from(state),
            Err(FilterStateError::InvalidNumber { key: "min", .. })
        ));
    }
}
