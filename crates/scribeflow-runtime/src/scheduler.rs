//! Worker pool — drives pending chunks through admission, the provider and
//! the retry controller.
//!
//! Per chunk: `pending → in_flight → {done | failed}`, re-entering
//! `in_flight` after a retryable failure. Chunks are dispatched in index
//! order into a bounded number of slots; completion order is unconstrained.
//! A failed chunk never aborts its siblings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use scribeflow_core::{Asset, Error, FailureClass, ProviderError, Result};
use scribeflow_ingest::estimate_tokens;
use scribeflow_store::{ChunkRecord, ManifestHandle};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::provider::{Provider, RequestMeta};
use crate::quota::QuotaMonitor;
use crate::rate_limiter::ModelLimiters;
use crate::retry::{classify, RetryController, RetryDecision};
use crate::telemetry::{Outcome, TelemetryEvent, TelemetrySink};
use crate::types::ChunkOutcome;

/// Everything a worker needs to know about the job it serves.
pub struct PoolJob {
    pub run_id: Uuid,
    pub asset: Asset,
    pub instruction: String,
    pub model: String,
    pub tokens_per_second: f64,
}

impl PoolJob {
    fn event(&self, index: usize, outcome: Outcome) -> TelemetryEvent {
        TelemetryEvent::new(
            self.run_id,
            &self.model,
            self.asset.modality,
            index,
            outcome,
        )
    }
}

/// Bounded pool of chunk workers sharing one set of limiters.
#[derive(Clone)]
pub struct WorkerPool {
    provider: Arc<dyn Provider>,
    limiters: Arc<ModelLimiters>,
    quota: Arc<QuotaMonitor>,
    retry: RetryController,
    telemetry: Arc<dyn TelemetrySink>,
    request_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        provider: Arc<dyn Provider>,
        limiters: Arc<ModelLimiters>,
        quota: Arc<QuotaMonitor>,
        retry: RetryController,
        telemetry: Arc<dyn TelemetrySink>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            limiters,
            quota,
            retry,
            telemetry,
            request_timeout,
        }
    }

    /// Process every pending chunk of `manifest` with up to `slots` workers.
    ///
    /// Returns one outcome per pending chunk, sorted by index. Manifest
    /// persistence failures are returned as an error once all in-flight
    /// workers have finished.
    pub async fn run(
        &self,
        manifest: Arc<ManifestHandle>,
        job: Arc<PoolJob>,
        slots: usize,
        cancel: CancellationToken,
    ) -> Result<Vec<ChunkOutcome>> {
        let slots = slots.max(1);
        let semaphore = Arc::new(Semaphore::new(slots));
        let mut queue = manifest.pending_chunks().into_iter();
        let mut tasks = JoinSet::new();
        let mut outcomes = Vec::new();

        info!(
            "Dispatching {} chunks of {} with {} workers",
            queue.len(),
            job.asset.source,
            slots
        );

        while let Some(chunk) = queue.next() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                outcomes.push(ChunkOutcome::Cancelled { index: chunk.index });
                outcomes.extend(queue.by_ref().map(|c| ChunkOutcome::Cancelled { index: c.index }));
                break;
            };

            let worker = self.clone();
            let manifest = manifest.clone();
            let job = job.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                worker.process_chunk(&manifest, &job, chunk, &cancel).await
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => {
                    error!("Chunk worker failed: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("Chunk worker panicked: {}", e);
                    first_error.get_or_insert(Error::Internal(format!("worker panicked: {}", e)));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        outcomes.sort_by_key(|o| o.index());
        Ok(outcomes)
    }

    async fn process_chunk(
        &self,
        manifest: &ManifestHandle,
        job: &PoolJob,
        chunk: ChunkRecord,
        cancel: &CancellationToken,
    ) -> Result<ChunkOutcome> {
        let index = chunk.index;
        let window = chunk.window();
        let model = job.model.as_str();
        let estimate = estimate_tokens(&window, job.tokens_per_second);
        let mut failures: HashMap<FailureClass, u32> = HashMap::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(ChunkOutcome::Cancelled { index });
            }

            // Soft preemption is not an attempt.
            if self.quota.should_preempt(model) {
                let delay = self.quota.preempt_delay(model);
                if !delay.is_zero() {
                    debug!("Chunk {}: preempting {} for {:?}", index, model, delay);
                    self.telemetry.record(
                        job.event(index, Outcome::Throttle)
                            .message(format!("preempted for {} ms", delay.as_millis())),
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        return Ok(ChunkOutcome::Cancelled { index });
                    }
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(ChunkOutcome::Cancelled { index }),
                _ = self.limiters.acquire(model, estimate) => {}
            }

            let record = manifest.mark_in_flight(index)?;
            let attempt = record.attempts;
            let ticket = self.quota.record_request(model, estimate);
            let meta = RequestMeta {
                model: job.model.clone(),
                chunk_index: index,
                start_seconds: window.start_seconds,
                end_seconds: window.end_seconds,
                attempt,
            };
            debug!("Chunk {}: calling {} (attempt {})", index, model, attempt);

            let started = Instant::now();
            let call = self.provider.transcribe(
                &job.instruction,
                &job.asset.source,
                job.asset.modality,
                &meta,
            );
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    manifest.release(index)?;
                    info!("Chunk {}: abandoned in-flight call on cancellation", index);
                    return Ok(ChunkOutcome::Cancelled { index });
                }
                r = tokio::time::timeout(self.request_timeout, call) => {
                    r.unwrap_or_else(|_| Err(ProviderError::Timeout(self.request_timeout)))
                }
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(transcription) => {
                    if transcription.usage.total() > 0 {
                        self.quota
                            .record_usage(model, ticket, transcription.usage.total());
                    }
                    let persisted = manifest
                        .write_result(index, &transcription.text)
                        .and_then(|result_ref| manifest.mark_done(index, &result_ref));
                    if let Err(e) = persisted {
                        if let Err(release_err) = manifest.release(index) {
                            warn!("Chunk {}: failed to release after {}: {}", index, e, release_err);
                        }
                        return Err(e);
                    }
                    info!(
                        "Chunk {} done after {} attempt(s) in {} ms",
                        index, attempt, latency_ms
                    );
                    self.telemetry.record(
                        job.event(index, Outcome::Success)
                            .attempt(attempt)
                            .usage(transcription.usage)
                            .chunk_seconds(window.length())
                            .latency_ms(latency_ms),
                    );
                    return Ok(ChunkOutcome::Done {
                        index,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    let class = classify(&e);
                    let message = e.to_string();
                    if class == FailureClass::TransientCapacity {
                        self.quota.note_throttle(model, e.retry_after());
                    }
                    let count = failures.entry(class).or_insert(0);
                    *count += 1;
                    let decision = self.retry.decide(class, *count, e.retry_after());
                    manifest.mark_failed(index, class, &message)?;

                    match decision {
                        RetryDecision::Retry { delay } => {
                            warn!(
                                "Chunk {} attempt {} failed ({}): {}; retrying in {:?}",
                                index, attempt, class, message, delay
                            );
                            self.telemetry.record(
                                job.event(index, Outcome::Retry)
                                    .attempt(attempt)
                                    .failure(class, &message)
                                    .latency_ms(latency_ms),
                            );
                            if !sleep_or_cancel(delay, cancel).await {
                                return Ok(ChunkOutcome::Cancelled { index });
                            }
                        }
                        RetryDecision::GiveUp => {
                            error!(
                                "Chunk {} failed permanently after {} attempt(s) ({}): {}",
                                index, attempt, class, message
                            );
                            self.telemetry.record(
                                job.event(index, Outcome::Failure)
                                    .attempt(attempt)
                                    .failure(class, &message)
                                    .latency_ms(latency_ms),
                            );
                            return Ok(ChunkOutcome::Failed {
                                index,
                                class,
                                attempts: attempt,
                                error: message,
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns false on cancellation.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
