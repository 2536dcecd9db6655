use async_trait::async_trait;

use super::{prepare_table, SourceReader, WorksheetSelector};
use crate::error::{EtlError, Result};
use crate::types::SourceTable;

/// Worksheets handed over directly, for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct InMemoryReader {
    locator: String,
    sheets: Vec<SourceTable>,
}

impl InMemoryReader {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            sheets: Vec::new(),
        }
    }

    pub fn with_sheet(mut self, sheet: SourceTable) -> Self {
        self.sheets.push(sheet);
        self
    }
}

#[async_trait]
impl SourceReader for InMemoryReader {
    fn locator(&self) -> &str {
        &self.locator
    }

    async fn read(&self, worksheet: &WorksheetSelector) -> Result<SourceTable> {
        let sheet = match worksheet {
            WorksheetSelector::Index(i) => self.sheets.get(*i),
            WorksheetSelector::Name(name) => self.sheets.iter().find(|s| &s.worksheet == name),
        }
        .ok_or_else(|| EtlError::extraction(&self.locator, format!("worksheet {worksheet} not found")))?;

        Ok(prepare_table(
            sheet.worksheet.clone(),
            &sheet.headers,
            sheet.rows.clone(),
        ))
    }
}
