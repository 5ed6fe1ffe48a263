//! Discovery and refresh runs over the declaration registry.
//!
//! The [`IngestionOrchestrator`] selects work, fans it out through a
//! [`FetchWorkerPool`], and flushes what was consolidated to a
//! [`due_sync_core::StorageSink`] even when the run is cut short.

pub mod orchestrator;
pub mod persist;
pub mod pipeline;
pub mod pool;

pub use orchestrator::{CandidateBreakdown, IngestionOrchestrator, RefreshOptions, RunMode, RunReport};
pub use persist::{FlushSummary, Persister};
pub use pipeline::{CheckResult, RecordPipeline};
pub use pool::{FetchWorkerPool, ItemFailure, PoolOutcome, StopReason};
