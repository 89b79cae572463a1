//! Averaging pipeline and file sinks.
//!
//! - [`pipeline`]: sample window, hazard pause, averaged records
//! - [`record_sink`]: `Scans_*_mini.csv` rows and the peak log
//! - [`snapshot`]: one-spectrum snapshot and final-data files

pub mod pipeline;
pub mod record_sink;
pub mod snapshot;

pub use pipeline::{AveragedRecord, AveragingPipeline, CollectOutcome, PipelineState, Sample};
pub use record_sink::{RecordSink, SinkSummary};
pub use snapshot::{write_final_data, write_snapshot, SnapshotTag};
