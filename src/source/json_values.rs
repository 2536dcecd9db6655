use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{prepare_table, SourceReader, WorksheetSelector};
use crate::error::{EtlError, Result};
use crate::types::{RawValue, SourceTable};

/// A workbook exported from a spreadsheet values API:
/// `{ "sheets": [ { "title": "...", "values": [[header...], [row...]] } ] }`
#[derive(Debug, Deserialize)]
struct Workbook {
    sheets: Vec<Sheet>,
}

#[derive(Debug, Deserialize)]
struct Sheet {
    title: String,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Clone)]
pub struct JsonValuesReader {
    path: PathBuf,
    locator: String,
}

impl JsonValuesReader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            locator: path.display().to_string(),
            path,
        }
    }

    async fn workbook(&self) -> Result<Workbook> {
        let body = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| EtlError::extraction(&self.locator, format!("cannot read file: {e}")))?;
        serde_json::from_str(&body)
            .map_err(|e| EtlError::extraction(&self.locator, format!("malformed workbook: {e}")))
    }
}

fn cell(value: Value) -> RawValue {
    match value {
        Value::Null => RawValue::Empty,
        Value::Number(n) => n.as_f64().map_or(RawValue::Empty, RawValue::Number),
        Value::String(s) if s.trim().is_empty() => RawValue::Empty,
        Value::String(s) => RawValue::Text(s),
        Value::Bool(b) => RawValue::Text(b.to_string()),
        other => RawValue::Text(other.to_string()),
    }
}

fn header_label(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SourceReader for JsonValuesReader {
    fn locator(&self) -> &str {
        &self.locator
    }

    async fn read(&self, worksheet: &WorksheetSelector) -> Result<SourceTable> {
        let workbook = self.workbook().await?;
        let titles: Vec<String> = workbook.sheets.iter().map(|s| s.title.clone()).collect();

        let sheet = match worksheet {
            WorksheetSelector::Index(i) => workbook.sheets.into_iter().nth(*i),
            WorksheetSelector::Name(name) => workbook.sheets.into_iter().find(|s| &s.title == name),
        }
        .ok_or_else(|| {
            EtlError::extraction(
                &self.locator,
                format!(
                    "worksheet {worksheet} not found (available: {})",
                    titles.join(", ")
                ),
            )
        })?;

        let mut values = sheet.values.into_iter();
        let header_row: Vec<String> = values
            .next()
            .map(|row| row.iter().map(header_label).collect())
            .ok_or_else(|| {
                EtlError::extraction(
                    &self.locator,
                    format!("worksheet '{}' has no header row", sheet.title),
                )
            })?;
        let rows = values.map(|row| row.into_iter().map(cell).collect()).collect();

        debug!(worksheet = %sheet.title, "read json worksheet");
        Ok(prepare_table(sheet.title, &header_row, rows))
    }
}
