use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::{ChunkOutcome, DataSink, SinkError, SinkTransaction};
use crate::pipeline::schema::TableSchema;
use crate::types::CleanRow;

/// Sink that only logs what it would write. Every row counts as an insert
/// since no store is consulted.
#[derive(Debug, Default, Clone)]
pub struct DryRunSink {
    committed: Arc<AtomicUsize>,
}

impl DryRunSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows that made it through a committed transaction.
    pub fn rows_committed(&self) -> usize {
        self.committed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSink for DryRunSink {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn begin(&self) -> Result<Box<dyn SinkTransaction>, SinkError> {
        Ok(Box::new(DryRunTransaction {
            pending: 0,
            committed: Arc::clone(&self.committed),
        }))
    }
}

struct DryRunTransaction {
    pending: usize,
    committed: Arc<AtomicUsize>,
}

#[async_trait]
impl SinkTransaction for DryRunTransaction {
    async fn upsert_chunk(
        &mut self,
        schema: &TableSchema,
        rows: &[CleanRow],
    ) -> Result<ChunkOutcome, SinkError> {
        info!(table = %schema.table, rows = rows.len(), "[dry run] would upsert chunk");
        for row in rows {
            debug!(table = %schema.table, row = row.source_index, values = ?row.values, "[dry run] row");
        }
        self.pending += rows.len();
        Ok(ChunkOutcome {
            inserted: rows.len(),
            updated: 0,
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), SinkError> {
        self.committed.fetch_add(self.pending, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), SinkError> {
        info!(rows = self.pending, "[dry run] discarding pending rows");
        Ok(())
    }
}
