//! Destination capability consumed by the bulk loader.
//!
//! A sink hands out one transaction per batch. Everything written through a
//! [`SinkTransaction`] becomes visible on `commit` or not at all.

pub mod dry_run;
pub mod sqlite;

pub use dry_run::DryRunSink;
pub use sqlite::SqliteSink;

use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::schema::TableSchema;
use crate::types::CleanRow;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// Deterministic rejection by the store. Retrying cannot help.
    #[error("constraint '{constraint}' violated: {message}")]
    Constraint {
        row_index: Option<usize>,
        constraint: String,
        message: String,
    },

    /// Busy, locked or briefly unreachable store.
    #[error("transient destination failure: {0}")]
    Transient(String),

    #[error("destination failure: {0}")]
    Fatal(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Rows written by one chunk, split by whether the natural key already existed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub inserted: usize,
    pub updated: usize,
}

#[async_trait]
pub trait DataSink: Send + Sync {
    /// Short label for logs and reports.
    fn name(&self) -> &str;

    async fn begin(&self) -> Result<Box<dyn SinkTransaction>, SinkError>;
}

#[async_trait]
pub trait SinkTransaction: Send {
    /// Upsert `rows` by the schema's natural key: update non-key columns of a
    /// matching row, insert otherwise.
    async fn upsert_chunk(
        &mut self,
        schema: &TableSchema,
        rows: &[CleanRow],
    ) -> Result<ChunkOutcome, SinkError>;

    async fn commit(self: Box<Self>) -> Result<(), SinkError>;

    async fn rollback(self: Box<Self>) -> Result<(), SinkError>;
}
