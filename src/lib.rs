pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod types;

pub use config::EtlConfig;
pub use error::{EtlError, Result};
pub use orchestrator::Orchestrator;
pub use pipeline::{EtlPipeline, PipelineRunner, RecordPipeline, RecordType, RunReport, RunState};
pub use sink::{DataSink, DryRunSink, SqliteSink};
pub use source::{SourceReader, WorksheetSelector};
