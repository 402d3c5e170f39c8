//! Per-kind job handlers.

pub mod ai_stream;
pub mod alert;
pub mod email;
pub mod pipeline;
pub mod pulse;
pub mod report;

pub use ai_stream::{AiStreamHandler, ChunkProvider, StaticChunks};
pub use alert::{AlertCheckHandler, AlertSpec};
pub use email::EmailSendHandler;
pub use pipeline::PipelineJobHandler;
pub use pulse::PulseHandler;
pub use report::ReportHandler;
