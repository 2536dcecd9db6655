//! Transactional bulk upsert of a cleaned batch.
//!
//! The whole batch is one sink transaction split into bounded chunks. Either
//! every chunk commits together or nothing does. Transient sink failures
//! restart the transaction with exponential backoff; constraint failures never
//! do.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS, MAX_RETRY_DELAY_MS,
};
use crate::error::{EtlError, Result};
use crate::metrics::PipelineMetrics;
use crate::pipeline::schema::TableSchema;
use crate::sink::{DataSink, SinkError, SinkTransaction};
use crate::types::CleanRow;

#[derive(Debug, Clone, PartialEq)]
pub struct LoadSettings {
    pub chunk_size: usize,
    /// Retries after the first attempt, for transient failures only.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub inserted: usize,
    pub updated: usize,
    pub chunks: usize,
    pub attempts: u32,
}

enum AttemptError {
    Sink(SinkError),
    Cancelled,
}

pub struct BulkLoader {
    sink: Arc<dyn DataSink>,
    settings: LoadSettings,
}

impl BulkLoader {
    pub fn new(sink: Arc<dyn DataSink>, settings: LoadSettings) -> Self {
        Self { sink, settings }
    }

    #[instrument(skip_all, fields(table = %schema.table, rows = rows.len()))]
    pub async fn load(
        &self,
        schema: &TableSchema,
        rows: &[CleanRow],
        cancel: &CancellationToken,
    ) -> Result<LoadSummary> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.attempt(schema, rows, cancel).await {
                Ok(mut summary) => {
                    summary.attempts = attempt;
                    info!(
                        inserted = summary.inserted,
                        updated = summary.updated,
                        chunks = summary.chunks,
                        attempts = attempt,
                        "batch committed"
                    );
                    return Ok(summary);
                }
                Err(AttemptError::Cancelled) => {
                    return Err(EtlError::Cancelled {
                        stage: "loading".to_string(),
                    })
                }
                Err(AttemptError::Sink(e)) if e.is_transient() && attempt <= self.settings.max_retries => {
                    let delay = compute_backoff(self.settings.retry_delay, attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient load failure, retrying"
                    );
                    PipelineMetrics::record_load_retry(&schema.table);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(EtlError::Cancelled { stage: "loading".to_string() });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(AttemptError::Sink(e)) => return Err(load_error(&schema.table, e, attempt)),
            }
        }
    }

    async fn attempt(
        &self,
        schema: &TableSchema,
        rows: &[CleanRow],
        cancel: &CancellationToken,
    ) -> std::result::Result<LoadSummary, AttemptError> {
        if cancel.is_cancelled() {
            return Err(AttemptError::Cancelled);
        }
        let mut tx = self.sink.begin().await.map_err(AttemptError::Sink)?;
        let mut summary = LoadSummary::default();

        for chunk in rows.chunks(self.settings.chunk_size.max(1)) {
            if cancel.is_cancelled() {
                abandon(tx).await;
                return Err(AttemptError::Cancelled);
            }
            match tx.upsert_chunk(schema, chunk).await {
                Ok(outcome) => {
                    summary.inserted += outcome.inserted;
                    summary.updated += outcome.updated;
                    summary.chunks += 1;
                    debug!(chunk = summary.chunks, rows = chunk.len(), "chunk staged");
                }
                Err(e) => {
                    abandon(tx).await;
                    return Err(AttemptError::Sink(e));
                }
            }
        }

        if cancel.is_cancelled() {
            abandon(tx).await;
            return Err(AttemptError::Cancelled);
        }
        tx.commit().await.map_err(AttemptError::Sink)?;
        Ok(summary)
    }
}

async fn abandon(tx: Box<dyn SinkTransaction>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "rollback failed; the sink discards the transaction on release");
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped.
pub fn compute_backoff(base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    Duration::from_millis(delay_ms.min(MAX_RETRY_DELAY_MS))
}

fn load_error(table: &str, err: SinkError, attempts: u32) -> EtlError {
    match err {
        SinkError::Constraint {
            row_index,
            constraint,
            message,
        } => EtlError::Load {
            table: table.to_string(),
            row_index,
            constraint: Some(constraint),
            message,
        },
        SinkError::Transient(message) => EtlError::Load {
            table: table.to_string(),
            row_index: None,
            constraint: None,
            message: format!("gave up after {attempts} attempts: {message}"),
        },
        SinkError::Fatal(message) => EtlError::Load {
            table: table.to_string(),
            row_index: None,
            constraint: None,
            message,
        },
    }
}
