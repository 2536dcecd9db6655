//! Source readers: where raw worksheets come from.
//!
//! A reader returns one worksheet as a [`SourceTable`] with a stable header row
//! and positional data rows. Fetching, credentials and file formats stay
//! behind this trait; everything downstream only sees headers and cells.

pub mod csv_dir;
pub mod in_memory;
pub mod json_values;

pub use csv_dir::CsvDirectoryReader;
pub use in_memory::InMemoryReader;
pub use json_values::JsonValuesReader;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::Result;
use crate::types::{RawValue, SourceTable};

/// Which worksheet to read: by position or by title
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorksheetSelector {
    Index(usize),
    Name(String),
}

impl fmt::Display for WorksheetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorksheetSelector::Index(i) => write!(f, "#{i}"),
            WorksheetSelector::Name(n) => write!(f, "'{n}'"),
        }
    }
}

#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Where this reader reads from, for reports and error messages.
    fn locator(&self) -> &str;

    async fn read(&self, worksheet: &WorksheetSelector) -> Result<SourceTable>;
}

/// Build a table from a raw header row and raw data rows.
///
/// Blank header cells are named `Column_<n>` and repeated labels get a `_<n>`
/// suffix, so every header is unique before normalization. Rows are padded
/// with empty cells or cut to the header width.
pub fn prepare_table(
    worksheet: impl Into<String>,
    header_row: &[String],
    rows: Vec<Vec<RawValue>>,
) -> SourceTable {
    let headers = prepare_headers(header_row);
    let width = headers.len();

    let rows = rows
        .into_iter()
        .map(|mut cells| {
            cells.resize(width, RawValue::Empty);
            cells
        })
        .collect();

    SourceTable {
        worksheet: worksheet.into(),
        headers,
        rows,
    }
}

fn prepare_headers(raw: &[String]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    raw.iter()
        .enumerate()
        .map(|(i, label)| {
            let label = label.trim();
            let base = if label.is_empty() {
                format!("Column_{}", i + 1)
            } else {
                label.to_string()
            };
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                base
            } else {
                format!("{base}_{count}")
            }
        })
        .collect()
}

/// Text cell from a delimited export. Empty strings are empty cells.
pub(crate) fn text_cell(s: &str) -> RawValue {
    if s.trim().is_empty() {
        RawValue::Empty
    } else {
        RawValue::Text(s.to_string())
    }
}
