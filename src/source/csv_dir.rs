use async_trait::async_trait;
use csv::ReaderBuilder;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{prepare_table, text_cell, SourceReader, WorksheetSelector};
use crate::error::{EtlError, Result};
use crate::types::{RawValue, SourceTable};

/// Reads worksheets exported as `<title>.csv` files into one directory
#[derive(Debug, Clone)]
pub struct CsvDirectoryReader {
    dir: PathBuf,
    locator: String,
}

impl CsvDirectoryReader {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            locator: dir.display().to_string(),
            dir,
        }
    }

    fn csv_files(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| EtlError::extraction(&self.locator, format!("cannot list directory: {e}")))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    fn resolve(&self, worksheet: &WorksheetSelector) -> Result<PathBuf> {
        match worksheet {
            WorksheetSelector::Name(name) => {
                let path = self.dir.join(format!("{name}.csv"));
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(EtlError::extraction(
                        &self.locator,
                        format!("worksheet {worksheet} not found ({} missing)", path.display()),
                    ))
                }
            }
            WorksheetSelector::Index(i) => {
                let files = self.csv_files()?;
                let count = files.len();
                files.into_iter().nth(*i).ok_or_else(|| {
                    EtlError::extraction(
                        &self.locator,
                        format!("worksheet {worksheet} not found ({count} csv files)"),
                    )
                })
            }
        }
    }
}

fn read_csv(path: &Path, locator: &str) -> Result<SourceTable> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| EtlError::extraction(locator, format!("{}: {e}", path.display())))?;

    let mut records = reader.records();
    let header_row: Vec<String> = match records.next() {
        Some(record) => record
            .map_err(|e| EtlError::extraction(locator, format!("{}: {e}", path.display())))?
            .iter()
            .map(str::to_string)
            .collect(),
        None => {
            return Err(EtlError::extraction(
                locator,
                format!("{} has no header row", path.display()),
            ))
        }
    };

    let mut rows: Vec<Vec<RawValue>> = Vec::new();
    for record in records {
        let record = record
            .map_err(|e| EtlError::extraction(locator, format!("{}: {e}", path.display())))?;
        rows.push(record.iter().map(text_cell).collect());
    }

    let title = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(prepare_table(title, &header_row, rows))
}

#[async_trait]
impl SourceReader for CsvDirectoryReader {
    fn locator(&self) -> &str {
        &self.locator
    }

    async fn read(&self, worksheet: &WorksheetSelector) -> Result<SourceTable> {
        let path = self.resolve(worksheet)?;
        let locator = self.locator.clone();
        debug!(path = %path.display(), "reading csv worksheet");

        tokio::task::spawn_blocking(move || read_csv(&path, &locator))
            .await
            .map_err(|e| EtlError::extraction(&self.locator, format!("reader task failed: {e}")))?
    }
}
