//! Wires configuration, source reader, sink and runner together and runs
//! record types, reference tables first.

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{EtlConfig, SourceKind};
use crate::error::{EtlError, Result};
use crate::pipeline::etl::RecordPipeline;
use crate::pipeline::loader::BulkLoader;
use crate::pipeline::record_types::RecordType;
use crate::pipeline::runner::{PipelineRunner, RunReport};
use crate::sink::{DataSink, DryRunSink, SqliteSink};
use crate::source::{CsvDirectoryReader, JsonValuesReader, SourceReader};

pub fn build_reader(config: &EtlConfig) -> Arc<dyn SourceReader> {
    match config.source.kind {
        SourceKind::CsvDir => Arc::new(CsvDirectoryReader::new(&config.source.locator)),
        SourceKind::JsonValues => Arc::new(JsonValuesReader::new(&config.source.locator)),
    }
}

/// Open the configured SQLite store, or a sink that writes nothing.
pub fn open_sink(config: &EtlConfig, dry_run: bool) -> Result<Arc<dyn DataSink>> {
    if dry_run {
        return Ok(Arc::new(DryRunSink::new()));
    }
    let sink = SqliteSink::open(
        &config.destination.database_path,
        config.destination.pool_size,
        config.busy_timeout(),
    )
    .map_err(|e| EtlError::Config(format!("cannot open destination: {e}")))?;
    Ok(Arc::new(sink))
}

pub struct Orchestrator {
    config: Arc<EtlConfig>,
    reader: Arc<dyn SourceReader>,
    loader: Arc<BulkLoader>,
    runner: PipelineRunner,
}

impl Orchestrator {
    pub fn new(
        config: Arc<EtlConfig>,
        reader: Arc<dyn SourceReader>,
        sink: Arc<dyn DataSink>,
    ) -> Self {
        let loader = Arc::new(BulkLoader::new(sink, config.load_settings()));
        let runner = config.runner();
        Self {
            config,
            reader,
            loader,
            runner,
        }
    }

    pub fn from_config(config: Arc<EtlConfig>, dry_run: bool) -> Result<Self> {
        let reader = build_reader(&config);
        let sink = open_sink(&config, dry_run)?;
        Ok(Self::new(config, reader, sink))
    }

    pub fn pipeline(&self, record_type: RecordType) -> Result<RecordPipeline> {
        RecordPipeline::new(
            record_type.name(),
            Arc::clone(&self.reader),
            self.config.worksheet_for(record_type),
            self.config.schema_for(record_type),
            self.config.cleaner_options(),
            Arc::clone(&self.loader),
        )
    }

    /// Run one record type end to end.
    pub async fn run_record_type(
        &self,
        record_type: RecordType,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let pipeline = self.pipeline(record_type)?;
        Ok(self.runner.run(&pipeline, cancel).await)
    }

    /// Every enabled record type.
    pub async fn run_all(&self, cancel: &CancellationToken) -> Result<Vec<RunReport>> {
        let enabled: Vec<RecordType> = RecordType::ALL
            .into_iter()
            .filter(|rt| self.config.is_enabled(*rt))
            .collect();
        self.run_selected(&enabled, cancel).await
    }

    /// Reference tables run one after another first, since the rest resolve
    /// keys against them. The remaining record types then run concurrently.
    /// Reports come back in [`RecordType::ALL`] order.
    pub async fn run_selected(
        &self,
        record_types: &[RecordType],
        cancel: &CancellationToken,
    ) -> Result<Vec<RunReport>> {
        let mut selected = record_types.to_vec();
        selected.sort();
        selected.dedup();

        // Build everything up front so a bad schema fails before any load.
        let mut pipelines = Vec::with_capacity(selected.len());
        for record_type in &selected {
            pipelines.push((*record_type, self.pipeline(*record_type)?));
        }

        let (references, dependents): (Vec<_>, Vec<_>) = pipelines
            .into_iter()
            .partition(|(rt, _)| rt.is_reference());

        let mut reports = Vec::with_capacity(selected.len());
        for (record_type, pipeline) in references {
            let report = self.runner.run(&pipeline, cancel).await;
            if !report.succeeded() {
                warn!(
                    pipeline = %record_type,
                    "reference table failed to load; dependent rows may not resolve"
                );
            }
            reports.push((record_type, report));
        }

        let mut tasks = JoinSet::new();
        for (record_type, pipeline) in dependents {
            let runner = self.runner.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let report = runner.run(&pipeline, &cancel).await;
                (record_type, report)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(done) => reports.push(done),
                Err(e) => error!(error = %e, "pipeline task aborted"),
            }
        }

        reports.sort_by_key(|(rt, _)| *rt);
        let succeeded = reports.iter().filter(|(_, r)| r.succeeded()).count();
        info!(
            runs = reports.len(),
            succeeded,
            failed = reports.len() - succeeded,
            "all pipelines finished"
        );
        Ok(reports.into_iter().map(|(_, report)| report).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::runner::RunState;
    use crate::source::InMemoryReader;
    use crate::types::{RawValue, SourceTable};

    fn config() -> Arc<EtlConfig> {
        Arc::new(
            EtlConfig::from_toml_str(
                r#"
                [source]
                locator = "memory"

                [pipelines.batch]
                enabled = false
                "#,
            )
            .unwrap(),
        )
    }

    fn text(s: &str) -> RawValue {
        RawValue::Text(s.to_string())
    }

    fn reader() -> Arc<dyn SourceReader> {
        let ponds = SourceTable::new("Ponds", vec!["Name".into(), "Capacity".into()])
            .with_row(vec![text("Pond A"), RawValue::Number(500.0)]);
        Arc::new(InMemoryReader::new("memory").with_sheet(ponds))
    }

    #[tokio::test]
    async fn test_runs_reference_tables_in_order() {
        let sink = Arc::new(DryRunSink::new());
        let orchestrator = Orchestrator::new(config(), reader(), sink.clone());
        let cancel = CancellationToken::new();

        let reports = orchestrator
            .run_selected(&[RecordType::Expense, RecordType::Pond], &cancel)
            .await
            .unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].pipeline, "pond");
        assert_eq!(reports[0].state, RunState::Succeeded);
        assert_eq!(reports[0].rows_inserted, 1);
        // The in-memory reader has no worksheet #4
        assert_eq!(reports[1].pipeline, "expense");
        assert_eq!(reports[1].state, RunState::Failed);
        assert_eq!(sink.rows_committed(), 1);
    }

    #[tokio::test]
    async fn test_run_all_skips_disabled() {
        let orchestrator = Orchestrator::new(config(), reader(), Arc::new(DryRunSink::new()));
        let reports = orchestrator
            .run_all(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reports.len(), RecordType::ALL.len() - 1);
        assert!(reports.iter().all(|r| r.pipeline != "batch"));
    }

    #[tokio::test]
    async fn test_cancelled_token_fails_every_run() {
        let orchestrator = Orchestrator::new(config(), reader(), Arc::new(DryRunSink::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = orchestrator
            .run_record_type(RecordType::Pond, &cancel)
            .await
            .unwrap();
        assert_eq!(report.state, RunState::Failed);
        assert!(matches!(report.error, Some(EtlError::Cancelled { .. })));
    }
}
