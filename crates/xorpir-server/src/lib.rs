mod config;
mod engine;
mod orchestrator;
mod profiling;
mod queue;
mod scan;
mod telemetry;

pub use config::{ConfigError, EngineConfig, Environment, MAX_LOG_RECORDS, MAX_PRODUCERS};
pub use engine::{build_store, EngineError, PimEngine};
pub use orchestrator::{
    producer_count, run_batch_pass, BatchWorkItem, OrchestratorError, PassConfig, PassReport,
};
pub use profiling::Profiler;
pub use queue::{work_queue, QueueError, WorkReceiver, WorkSender};
pub use scan::{
    reduce, reduce_batch, reduce_batch_scalar, reduce_portable, reduce_records, reduce_scalar,
    reduce_sharded, ScanError,
};
pub use telemetry::{init_tracing, DEFAULT_ENV_FILTER};
