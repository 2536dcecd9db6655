//! Drives one pipeline through `Idle -> Extracting -> Transforming -> Loading`
//! and always hands back a [`RunReport`], whatever stage it stopped in.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::constants::DEFAULT_FAILURE_RATE_THRESHOLD;
use crate::error::EtlError;
use crate::metrics::PipelineMetrics;
use crate::pipeline::cleaner::RowFailure;
use crate::pipeline::etl::EtlPipeline;
use crate::types::{RawValue, SourceTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Extracting,
    Transforming,
    Loading,
    Succeeded,
    Failed,
}

impl RunState {
    fn stage(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Extracting => "extracting",
            RunState::Transforming => "transforming",
            RunState::Loading => "loading",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }
}

/// Summary of one run, complete or aborted
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub pipeline: String,
    pub table: String,
    pub source: String,
    pub state: RunState,
    /// Stage the run was in when it failed.
    pub failed_stage: Option<RunState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rows_extracted: usize,
    pub rows_blank: usize,
    pub rows_cleaned: usize,
    pub rows_failed: usize,
    pub failures: Vec<RowFailure>,
    pub rows_inserted: usize,
    pub rows_updated: usize,
    pub load_attempts: u32,
    /// SHA-256 over the extracted headers and cells. Equal digests mean the
    /// run saw identical source data.
    pub source_digest: Option<String>,
    pub error: Option<EtlError>,
}

impl RunReport {
    fn new(pipeline: &dyn EtlPipeline) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline: pipeline.name().to_string(),
            table: pipeline.table().to_string(),
            source: pipeline.source(),
            state: RunState::Idle,
            failed_stage: None,
            started_at: Utc::now(),
            finished_at: None,
            rows_extracted: 0,
            rows_blank: 0,
            rows_cleaned: 0,
            rows_failed: 0,
            failures: Vec::new(),
            rows_inserted: 0,
            rows_updated: 0,
            load_attempts: 0,
            source_digest: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    fn enter(&mut self, state: RunState) {
        info!(run_id = %self.run_id, pipeline = %self.pipeline, from = self.state.stage(), to = state.stage(), "stage transition");
        self.state = state;
    }

    fn fail(mut self, err: EtlError) -> Self {
        error!(run_id = %self.run_id, pipeline = %self.pipeline, stage = self.state.stage(), error = %err, "run failed");
        PipelineMetrics::record_run(&self.pipeline, Some(&err));
        self.failed_stage = Some(self.state);
        self.state = RunState::Failed;
        self.error = Some(err);
        self.finished_at = Some(Utc::now());
        self
    }
}

#[derive(Debug, Clone)]
pub struct PipelineRunner {
    failure_rate_threshold: f64,
    require_rows: bool,
}

impl Default for PipelineRunner {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_RATE_THRESHOLD, true)
    }
}

impl PipelineRunner {
    pub fn new(failure_rate_threshold: f64, require_rows: bool) -> Self {
        Self {
            failure_rate_threshold,
            require_rows,
        }
    }

    #[instrument(skip_all, fields(pipeline = %pipeline.name()))]
    pub async fn run(&self, pipeline: &dyn EtlPipeline, cancel: &CancellationToken) -> RunReport {
        let mut report = RunReport::new(pipeline);

        if let Some(err) = cancelled(cancel, &report) {
            return report.fail(err);
        }

        report.enter(RunState::Extracting);
        let started = Instant::now();
        let table = match pipeline.extract().await {
            Ok(table) => table,
            Err(e) => return report.fail(e),
        };
        PipelineMetrics::record_stage_duration("extract", started);
        PipelineMetrics::record_extracted(&report.pipeline, table.len());
        report.rows_extracted = table.len();
        report.source_digest = Some(source_digest(&table));

        if self.require_rows && table.records().all(|row| row.is_blank()) {
            let err = EtlError::extraction(
                &report.source,
                format!("worksheet '{}' has no data rows", table.worksheet),
            );
            return report.fail(err);
        }
        if let Some(err) = cancelled(cancel, &report) {
            return report.fail(err);
        }

        report.enter(RunState::Transforming);
        let started = Instant::now();
        let outcome = match pipeline.transform(&table) {
            Ok(outcome) => outcome,
            Err(e) => return report.fail(e),
        };
        PipelineMetrics::record_stage_duration("transform", started);
        PipelineMetrics::record_transformed(
            &report.pipeline,
            outcome.rows.len(),
            outcome.failures.len(),
            outcome.blank,
        );

        let total = outcome.non_blank();
        let failed = outcome.failures.len();
        report.rows_blank = outcome.blank;
        report.rows_cleaned = outcome.rows.len();
        report.rows_failed = failed;
        report.failures = outcome.failures;

        if failed > 0 {
            warn!(failed, total, "rows rejected during transform");
        }
        if self.exceeds_threshold(failed, total) {
            return report.fail(EtlError::Transform {
                failed,
                total,
                threshold: self.failure_rate_threshold,
            });
        }
        if let Some(err) = cancelled(cancel, &report) {
            return report.fail(err);
        }

        report.enter(RunState::Loading);
        if !outcome.rows.is_empty() {
            let started = Instant::now();
            let summary = match pipeline.load(&outcome.rows, cancel).await {
                Ok(summary) => summary,
                Err(e) => return report.fail(e),
            };
            PipelineMetrics::record_stage_duration("load", started);
            PipelineMetrics::record_loaded(&report.table, summary.inserted, summary.updated);
            report.rows_inserted = summary.inserted;
            report.rows_updated = summary.updated;
            report.load_attempts = summary.attempts;
        }

        report.enter(RunState::Succeeded);
        report.finished_at = Some(Utc::now());
        PipelineMetrics::record_run(&report.pipeline, None);
        info!(
            run_id = %report.run_id,
            extracted = report.rows_extracted,
            cleaned = report.rows_cleaned,
            failed = report.rows_failed,
            inserted = report.rows_inserted,
            updated = report.rows_updated,
            "run succeeded"
        );
        report
    }

    /// A batch where every non-blank row failed is never loaded, whatever the
    /// configured threshold.
    fn exceeds_threshold(&self, failed: usize, total: usize) -> bool {
        if total == 0 || failed == 0 {
            return false;
        }
        failed == total || failed as f64 / total as f64 > self.failure_rate_threshold
    }
}

fn cancelled(cancel: &CancellationToken, report: &RunReport) -> Option<EtlError> {
    cancel.is_cancelled().then(|| EtlError::Cancelled {
        stage: report.state.stage().to_string(),
    })
}

fn source_digest(table: &SourceTable) -> String {
    let mut hasher = Sha256::new();
    for header in &table.headers {
        hasher.update(header.as_bytes());
        hasher.update([0x1f_u8]);
    }
    for row in &table.rows {
        hasher.update([0x1e_u8]);
        for cell in row {
            match cell {
                RawValue::Empty => hasher.update([0x00_u8]),
                RawValue::Number(n) => {
                    hasher.update([0x01_u8]);
                    hasher.update(n.to_le_bytes());
                }
                RawValue::Text(s) => {
                    hasher.update([0x02_u8]);
                    hasher.update(s.as_bytes());
                    hasher.update([0x1f_u8]);
                }
            }
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::pipeline::cleaner::{CleanOutcome, CleanerOptions, RecordCleaner};
    use crate::pipeline::loader::LoadSummary;
    use crate::pipeline::schema::{FieldSchema, TableSchema};
    use crate::types::CleanRow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Pipeline over a fixed table whose load just counts rows
    struct FixedPipeline {
        table: std::result::Result<SourceTable, EtlError>,
        cleaner: RecordCleaner,
        loads: AtomicUsize,
    }

    impl FixedPipeline {
        fn new(table: std::result::Result<SourceTable, EtlError>) -> Self {
            let schema = TableSchema::new(
                "daily_record",
                vec![
                    FieldSchema::date("record_date").required().aliases(&["date"]),
                    FieldSchema::integer("mortality", Some(0), None),
                ],
                &["record_date"],
            );
            Self {
                table,
                cleaner: RecordCleaner::new(schema, CleanerOptions::default()).unwrap(),
                loads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EtlPipeline for FixedPipeline {
        fn name(&self) -> &str {
            "fixed"
        }

        fn table(&self) -> &str {
            "daily_record"
        }

        fn source(&self) -> String {
            "memory worksheet #0".to_string()
        }

        async fn extract(&self) -> Result<SourceTable> {
            self.table.clone()
        }

        fn transform(&self, table: &SourceTable) -> Result<CleanOutcome> {
            self.cleaner.clean_table(table)
        }

        async fn load(&self, rows: &[CleanRow], _cancel: &CancellationToken) -> Result<LoadSummary> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(LoadSummary {
                inserted: rows.len(),
                updated: 0,
                chunks: 1,
                attempts: 1,
            })
        }
    }

    fn sheet(rows: Vec<Vec<RawValue>>) -> SourceTable {
        let mut table = SourceTable::new("daily", vec!["Date".into(), "Mortality".into()]);
        table.rows = rows;
        table
    }

    #[tokio::test]
    async fn test_successful_run_reports_counts() {
        let pipeline = FixedPipeline::new(Ok(sheet(vec![
            vec![RawValue::Number(44197.0), RawValue::Number(3.0)],
            vec!["not-a-date".into(), RawValue::Number(-1.0)],
            vec![RawValue::Empty, RawValue::Empty],
        ])));

        let report = PipelineRunner::default()
            .run(&pipeline, &CancellationToken::new())
            .await;

        assert_eq!(report.state, RunState::Succeeded);
        assert_eq!(report.rows_extracted, 3);
        assert_eq!(report.rows_blank, 1);
        assert_eq!(report.rows_cleaned, 1);
        assert_eq!(report.rows_failed, 1);
        assert_eq!(report.failures[0].failures.len(), 2);
        assert_eq!(report.rows_inserted, 1);
        assert!(report.error.is_none());
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_extraction_failure_stops_the_run() {
        let pipeline = FixedPipeline::new(Err(EtlError::extraction("memory", "unreachable")));
        let report = PipelineRunner::default()
            .run(&pipeline, &CancellationToken::new())
            .await;

        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.failed_stage, Some(RunState::Extracting));
        assert!(matches!(report.error, Some(EtlError::Extraction { .. })));
        assert_eq!(pipeline.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_sheet_fails_when_rows_are_required() {
        let empty = FixedPipeline::new(Ok(sheet(vec![vec![RawValue::Empty, "  ".into()]])));

        let strict = PipelineRunner::new(0.8, true)
            .run(&empty, &CancellationToken::new())
            .await;
        assert_eq!(strict.failed_stage, Some(RunState::Extracting));

        let lenient = PipelineRunner::new(0.8, false)
            .run(&empty, &CancellationToken::new())
            .await;
        assert!(lenient.succeeded());
        assert_eq!(lenient.load_attempts, 0);
    }

    #[tokio::test]
    async fn test_all_rows_failing_is_a_transform_error() {
        let pipeline = FixedPipeline::new(Ok(sheet(vec![
            vec!["bad".into(), RawValue::Number(1.0)],
            vec!["worse".into(), RawValue::Number(1.0)],
        ])));

        let report = PipelineRunner::new(1.0, true)
            .run(&pipeline, &CancellationToken::new())
            .await;

        assert_eq!(report.failed_stage, Some(RunState::Transforming));
        assert_eq!(
            report.error,
            Some(EtlError::Transform {
                failed: 2,
                total: 2,
                threshold: 1.0
            })
        );
        assert_eq!(report.rows_failed, 2);
        assert_eq!(pipeline.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_threshold_is_strictly_greater() {
        let runner = PipelineRunner::new(0.5, true);
        assert!(!runner.exceeds_threshold(1, 2));
        assert!(runner.exceeds_threshold(2, 3));
        assert!(!runner.exceeds_threshold(0, 0));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let pipeline = FixedPipeline::new(Ok(sheet(vec![])));
        let token = CancellationToken::new();
        token.cancel();

        let report = PipelineRunner::default().run(&pipeline, &token).await;
        assert_eq!(
            report.error,
            Some(EtlError::Cancelled {
                stage: "idle".into()
            })
        );
    }

    #[test]
    fn test_digest_changes_with_content() {
        let a = sheet(vec![vec![RawValue::Number(44197.0), "3".into()]]);
        let b = sheet(vec![vec![RawValue::Number(44197.0), "4".into()]]);
        assert_eq!(source_digest(&a), source_digest(&a.clone()));
        assert_ne!(source_digest(&a), source_digest(&b));
        assert_eq!(source_digest(&a).len(), 64);
    }
}
