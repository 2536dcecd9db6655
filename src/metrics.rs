//! Pipeline metrics.
//!
//! Counters and histograms are always recorded through the `metrics` facade.
//! They only leave the process when a Prometheus exporter is installed, which
//! happens when `metrics_addr` is configured.

use metrics::{counter, histogram};
use std::net::SocketAddr;
use std::sync::Once;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::EtlError;

static INIT: Once = Once::new();

/// Install the Prometheus exporter. Idempotent; a failed install is logged and
/// the run continues without exported metrics.
pub fn init_metrics(addr: SocketAddr) {
    INIT.call_once(|| {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
        match builder.install() {
            Ok(()) => {
                info!("Prometheus exporter listening on http://{}/metrics", addr);
                PipelineMetrics::register_metrics();
            }
            Err(e) => warn!("Failed to install Prometheus exporter: {}", e),
        }
    });
}

/// Metrics for the extract / transform / load stages
pub struct PipelineMetrics;

impl PipelineMetrics {
    pub fn record_extracted(pipeline: &str, rows: usize) {
        counter!("etl_rows_extracted_total", "pipeline" => pipeline.to_string())
            .increment(rows as u64);
    }

    pub fn record_transformed(pipeline: &str, cleaned: usize, failed: usize, blank: usize) {
        counter!("etl_rows_cleaned_total", "pipeline" => pipeline.to_string())
            .increment(cleaned as u64);
        counter!("etl_rows_failed_total", "pipeline" => pipeline.to_string())
            .increment(failed as u64);
        counter!("etl_rows_blank_total", "pipeline" => pipeline.to_string())
            .increment(blank as u64);
    }

    pub fn record_loaded(table: &str, inserted: usize, updated: usize) {
        counter!("etl_rows_inserted_total", "table" => table.to_string())
            .increment(inserted as u64);
        counter!("etl_rows_updated_total", "table" => table.to_string())
            .increment(updated as u64);
    }

    pub fn record_load_retry(table: &str) {
        counter!("etl_load_retries_total", "table" => table.to_string()).increment(1);
    }

    /// Terminal state of one run, labelled with the error kind when it failed.
    pub fn record_run(pipeline: &str, error: Option<&EtlError>) {
        let (outcome, kind) = run_labels(error);
        counter!(
            "etl_runs_total",
            "pipeline" => pipeline.to_string(),
            "outcome" => outcome,
            "error" => kind
        )
        .increment(1);
    }

    pub fn record_stage_duration(stage: &'static str, started: Instant) {
        histogram!("etl_stage_duration_seconds", "stage" => stage)
            .record(started.elapsed().as_secs_f64());
    }

    /// Touch every series so the exporter lists them before the first run.
    pub fn register_metrics() {
        let _ = counter!("etl_rows_extracted_total");
        let _ = counter!("etl_rows_cleaned_total");
        let _ = counter!("etl_rows_failed_total");
        let _ = counter!("etl_rows_blank_total");
        let _ = counter!("etl_rows_inserted_total");
        let _ = counter!("etl_rows_updated_total");
        let _ = counter!("etl_load_retries_total");
        let _ = counter!("etl_runs_total");
        let _ = histogram!("etl_stage_duration_seconds");
    }
}

fn run_labels(error: Option<&EtlError>) -> (&'static str, &'static str) {
    match error {
        None => ("succeeded", "none"),
        Some(err) => ("failed", err.kind()),
    }
}
