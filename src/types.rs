use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single cell as handed over by a source reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Empty,
    Number(f64),
    Text(String),
}

impl RawValue {
    /// Empty cells and whitespace-only text both count as empty.
    pub fn is_empty(&self) -> bool {
        match self {
            RawValue::Empty => true,
            RawValue::Number(_) => false,
            RawValue::Text(s) => s.trim().is_empty(),
        }
    }

    /// Cell contents as written, for failure reports.
    pub fn display(&self) -> Option<String> {
        match self {
            RawValue::Empty => None,
            RawValue::Number(n) => Some(n.to_string()),
            RawValue::Text(s) => Some(s.clone()),
        }
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Text(s)
    }
}

impl From<f64> for RawValue {
    fn from(n: f64) -> Self {
        RawValue::Number(n)
    }
}

impl From<i64> for RawValue {
    fn from(n: i64) -> Self {
        RawValue::Number(n as f64)
    }
}

impl From<Option<&str>> for RawValue {
    fn from(s: Option<&str>) -> Self {
        s.map_or(RawValue::Empty, RawValue::from)
    }
}

/// A worksheet as read from the source: one stable header row and the data
/// rows below it. Rows are positional against `headers`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceTable {
    pub worksheet: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<RawValue>>,
}

impl SourceTable {
    pub fn new(worksheet: impl Into<String>, headers: Vec<String>) -> Self {
        Self {
            worksheet: worksheet.into(),
            headers,
            rows: Vec::new(),
        }
    }

    pub fn with_row(mut self, row: Vec<RawValue>) -> Self {
        self.rows.push(row);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// View every row as an ordered header -> value mapping.
    pub fn records(&self) -> impl Iterator<Item = RawRow<'_>> {
        self.rows.iter().map(move |cells| RawRow {
            headers: &self.headers,
            cells,
        })
    }
}

/// Borrowed view of one source row keyed by header label
#[derive(Debug, Clone, Copy)]
pub struct RawRow<'a> {
    headers: &'a [String],
    cells: &'a [RawValue],
}

impl<'a> RawRow<'a> {
    pub fn new(headers: &'a [String], cells: &'a [RawValue]) -> Self {
        Self { headers, cells }
    }

    pub fn get(&self, label: &str) -> Option<&'a RawValue> {
        self.headers
            .iter()
            .position(|h| h == label)
            .and_then(|i| self.cells.get(i))
    }

    pub fn at(&self, position: usize) -> Option<&'a RawValue> {
        self.cells.get(position)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a RawValue)> {
        self.headers
            .iter()
            .map(String::as_str)
            .zip(self.cells.iter())
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(RawValue::is_empty)
    }
}

/// A value coerced to its target representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CleanValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl fmt::Display for CleanValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanValue::Null => write!(f, "NULL"),
            CleanValue::Integer(i) => write!(f, "{i}"),
            CleanValue::Float(x) => write!(f, "{x}"),
            CleanValue::Text(s) => write!(f, "{s}"),
            CleanValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            CleanValue::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

static NULL_VALUE: CleanValue = CleanValue::Null;

/// A row that passed every field check, keyed by schema field name.
/// `source_index` is the zero-based data-row position in the worksheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanRow {
    pub source_index: usize,
    pub values: BTreeMap<String, CleanValue>,
}

impl CleanRow {
    pub fn new(source_index: usize) -> Self {
        Self {
            source_index,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: &str, value: CleanValue) -> Self {
        self.values.insert(field.to_string(), value);
        self
    }

    pub fn get(&self, field: &str) -> &CleanValue {
        self.values.get(field).unwrap_or(&NULL_VALUE)
    }
}
