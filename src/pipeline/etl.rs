use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::pipeline::cleaner::{CleanOutcome, CleanerOptions, RecordCleaner};
use crate::pipeline::loader::{BulkLoader, LoadSummary};
use crate::pipeline::schema::TableSchema;
use crate::source::{SourceReader, WorksheetSelector};
use crate::types::{CleanRow, SourceTable};

/// The three stages of one logical record type. The runner drives them in
/// order and owns every decision between them.
#[async_trait]
pub trait EtlPipeline: Send + Sync {
    fn name(&self) -> &str;

    /// Destination table.
    fn table(&self) -> &str;

    /// Source locator and worksheet, for reports.
    fn source(&self) -> String;

    async fn extract(&self) -> Result<SourceTable>;

    fn transform(&self, table: &SourceTable) -> Result<CleanOutcome>;

    async fn load(&self, rows: &[CleanRow], cancel: &CancellationToken) -> Result<LoadSummary>;
}

/// Pipeline assembled from a reader, a target schema and a loader
pub struct RecordPipeline {
    name: String,
    reader: Arc<dyn SourceReader>,
    worksheet: WorksheetSelector,
    cleaner: RecordCleaner,
    loader: Arc<BulkLoader>,
}

impl RecordPipeline {
    pub fn new(
        name: impl Into<String>,
        reader: Arc<dyn SourceReader>,
        worksheet: WorksheetSelector,
        schema: TableSchema,
        options: CleanerOptions,
        loader: Arc<BulkLoader>,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            reader,
            worksheet,
            cleaner: RecordCleaner::new(schema, options)?,
            loader,
        })
    }
}

#[async_trait]
impl EtlPipeline for RecordPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn table(&self) -> &str {
        &self.cleaner.schema().table
    }

    fn source(&self) -> String {
        format!("{} worksheet {}", self.reader.locator(), self.worksheet)
    }

    async fn extract(&self) -> Result<SourceTable> {
        let table = self.reader.read(&self.worksheet).await?;
        debug!(
            pipeline = %self.name,
            worksheet = %table.worksheet,
            rows = table.len(),
            "worksheet extracted"
        );
        Ok(table)
    }

    fn transform(&self, table: &SourceTable) -> Result<CleanOutcome> {
        self.cleaner.clean_table(table)
    }

    async fn load(&self, rows: &[CleanRow], cancel: &CancellationToken) -> Result<LoadSummary> {
        self.loader.load(self.cleaner.schema(), rows, cancel).await
    }
}
