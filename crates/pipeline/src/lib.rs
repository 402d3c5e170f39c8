//! Staged pipeline executor: Extract -> Transform -> Validate -> Load.
//!
//! Sources, sinks, and pipeline definitions reach the executor through
//! the adapter traits in [`source`], [`sink`], and [`definition`]; the
//! in-memory implementations back the test suites and local development.

pub mod definition;
pub mod executor;
pub mod sink;
pub mod source;

pub use definition::{MemoryPipelineStore, PipelineDefinition, PipelineStore};
pub use executor::{PipelineExecutor, PipelineOutcome};
pub use sink::{DataSink, MemorySink, WriteMode};
pub use source::{DataSource, MemorySource, RowStream, SourceSpec};
