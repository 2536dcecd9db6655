// Record pipelines: header normalization, value cleaning, bulk loading and
// the runner that sequences them.

pub mod cleaner;
pub mod columns;
pub mod dates;
pub mod etl;
pub mod loader;
pub mod record_types;
pub mod runner;
pub mod schema;

pub use etl::{EtlPipeline, RecordPipeline};
pub use record_types::RecordType;
pub use runner::{PipelineRunner, RunReport, RunState};
