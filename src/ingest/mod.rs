//! Ingestion: event sources and the pipeline that stores their events

mod pipeline;
mod source;

pub use pipeline::{IngestError, IngestOutcome, IngestPipeline, IngestSummary, ReplayReport, RetryPolicy};
pub use source::{EventSource, JsonLinesSource};
