//! Runtime — admission control, retries and the chunk worker pool.
//!
//! The [`Orchestrator`] plans an asset, opens or rebuilds its manifest and
//! runs every pending chunk through the [`WorkerPool`], sharing one set of
//! [`ModelLimiters`] and one [`QuotaMonitor`] across all jobs.

pub mod orchestrator;
pub mod provider;
pub mod quota;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;
pub mod telemetry;
pub mod types;

pub use orchestrator::Orchestrator;
pub use provider::{Provider, RequestMeta, Transcription, Usage};
pub use quota::{QuotaMonitor, QuotaState, QuotaTicket, UploadGuard, UploadState};
pub use rate_limiter::{ModelLimiter, ModelLimiters, RateLimiter};
pub use retry::{backoff_delay_with_random, classify, RetryController, RetryDecision};
pub use scheduler::{PoolJob, WorkerPool};
pub use telemetry::{
    estimate_cost, CostSummary, MemoryRecorder, ModelCost, MultiRecorder, NdjsonRecorder,
    Outcome, TelemetryEvent, TelemetrySink, TelemetrySummary, UsageTotals,
};
pub use types::*;
pub use tokio_util::sync::CancellationToken;
