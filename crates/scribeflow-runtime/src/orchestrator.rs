//! Orchestrator — plans an asset, opens its manifest and runs the worker pool.

use std::sync::Arc;

use scribeflow_core::{Asset, Capability, ChunkWindow, Error, FailureClass, Result, ScribeConfig};
use scribeflow_ingest::plan_for_asset;
use scribeflow_store::{ManifestHandle, ManifestStore, Progress};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::provider::Provider;
use crate::quota::QuotaMonitor;
use crate::rate_limiter::ModelLimiters;
use crate::retry::{classify, RetryController};
use crate::scheduler::{PoolJob, WorkerPool};
use crate::telemetry::{NdjsonRecorder, Outcome, TelemetryEvent, TelemetrySink};
use crate::types::{ChunkOutcome, JobReport};

/// Top-level entry point: one instance per process, shared across jobs.
pub struct Orchestrator {
    config: ScribeConfig,
    store: ManifestStore,
    provider: Arc<dyn Provider>,
    limiters: Arc<ModelLimiters>,
    quota: Arc<QuotaMonitor>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Orchestrator {
    /// Create an orchestrator with fresh limiters built from `config.quota`.
    pub fn new(
        config: ScribeConfig,
        provider: Arc<dyn Provider>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        let limiters = Arc::new(ModelLimiters::from_config(&config.quota));
        let quota = Arc::new(QuotaMonitor::new(config.quota.clone()));
        Self::with_limits(config, provider, telemetry, limiters, quota)
    }

    /// Create an orchestrator that appends telemetry to the data directory's
    /// event log.
    pub fn with_event_log(config: ScribeConfig, provider: Arc<dyn Provider>) -> Result<Self> {
        let recorder = NdjsonRecorder::open(config.data_paths.telemetry_log())?;
        info!("Telemetry log: {}", recorder.path().display());
        Self::new(config, provider, Arc::new(recorder))
    }

    /// Create an orchestrator that shares limiters with other instances.
    pub fn with_limits(
        config: ScribeConfig,
        provider: Arc<dyn Provider>,
        telemetry: Arc<dyn TelemetrySink>,
        limiters: Arc<ModelLimiters>,
        quota: Arc<QuotaMonitor>,
    ) -> Result<Self> {
        let store = ManifestStore::new(&config.data_paths.manifests)?;
        info!(
            "Orchestrator initialized: provider={}, model={}, manifests={}",
            provider.name(),
            config.planning.model,
            store.root().display()
        );
        Ok(Self {
            config,
            store,
            provider,
            limiters,
            quota,
            telemetry,
        })
    }

    pub fn config(&self) -> &ScribeConfig {
        &self.config
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn quota(&self) -> &QuotaMonitor {
        &self.quota
    }

    /// Dry run: the windows `run` would create for `asset`.
    pub fn plan(&self, asset: &Asset) -> Vec<ChunkWindow> {
        plan_for_asset(asset, &self.config.planning.params())
    }

    /// Progress of an existing manifest, if any.
    pub fn status(&self, source: &str) -> Result<Option<Progress>> {
        Ok(self.store.find(source)?.map(|m| m.progress()))
    }

    /// Process `asset` to completion, resuming earlier work when possible.
    ///
    /// Per-chunk failures are reported in the [`JobReport`], not as errors.
    /// Errors mean the job could not be run at all (unsupported model,
    /// manifest I/O).
    pub async fn run(
        &self,
        asset: &Asset,
        instruction: &str,
        cancel: CancellationToken,
    ) -> Result<JobReport> {
        let planning = self.config.planning.params();
        let capability = Capability::for_modality(asset.modality);
        if !self.provider.supports(&planning.model, capability) {
            return Err(Error::Unsupported(format!(
                "model {} does not accept {} input",
                planning.model, capability
            )));
        }

        let run_id = Uuid::new_v4();
        let windows = plan_for_asset(asset, &planning);
        let manifest = Arc::new(self.store.open(asset, &planning, &windows)?);

        if self.config.pool.verify_artifacts {
            let requeued = manifest.reconcile_artifacts()?;
            if requeued > 0 {
                warn!("{} chunks of {} will be redone", requeued, asset.source);
            }
        }

        let snapshot = manifest.snapshot();
        let mut skipped = 0;
        for chunk in snapshot.chunks.iter().filter(|c| c.is_done()) {
            skipped += 1;
            self.telemetry.record(
                TelemetryEvent::new(
                    run_id,
                    &planning.model,
                    asset.modality,
                    chunk.index,
                    Outcome::Skip,
                )
                .attempt(chunk.attempts),
            );
        }

        // The upload stays counted until the pool finishes.
        let _upload = if manifest.pending_chunks().is_empty() {
            None
        } else {
            match self.quota.track_upload(&asset.source, asset.size_bytes) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    let message = e.to_string();
                    self.reject_pending(
                        &manifest,
                        run_id,
                        &planning.model,
                        asset,
                        &message,
                        classify(&e),
                    )?;
                    let report =
                        JobReport::from_manifest(run_id, &manifest.snapshot(), skipped, false);
                    warn!("{}", report);
                    return Ok(report);
                }
            }
        };

        let slots = if asset.modality.is_time_based() && windows.len() > 1 {
            self.config.pool.max_video_workers
        } else {
            self.config.pool.max_workers
        };

        info!(
            "Run {} for {}: {} chunks, {} already done",
            run_id,
            asset.source,
            windows.len(),
            skipped
        );

        let pool = WorkerPool::new(
            self.provider.clone(),
            self.limiters.clone(),
            self.quota.clone(),
            RetryController::new(self.config.retry.clone()),
            self.telemetry.clone(),
            self.config.pool.request_timeout(),
        );
        let job = Arc::new(PoolJob {
            run_id,
            asset: asset.clone(),
            instruction: instruction.to_string(),
            model: planning.model.clone(),
            tokens_per_second: planning.tokens_per_second,
        });

        let outcomes = pool.run(manifest.clone(), job, slots, cancel.clone()).await?;
        let cancelled = cancel.is_cancelled()
            || outcomes
                .iter()
                .any(|o| matches!(o, ChunkOutcome::Cancelled { .. }));

        let report = JobReport::from_manifest(run_id, &manifest.snapshot(), skipped, cancelled);
        if report.is_success() {
            info!("{}", report);
        } else {
            warn!("{}", report);
        }
        Ok(report)
    }

    /// Fail every pending chunk without calling the provider.
    fn reject_pending(
        &self,
        manifest: &ManifestHandle,
        run_id: Uuid,
        model: &str,
        asset: &Asset,
        message: &str,
        class: FailureClass,
    ) -> Result<()> {
        warn!("Rejecting {} before dispatch: {}", asset.source, message);
        for chunk in manifest.pending_chunks() {
            manifest.mark_failed(chunk.index, class, message)?;
            self.telemetry.record(
                TelemetryEvent::new(run_id, model, asset.modality, chunk.index, Outcome::Failure)
                    .attempt(chunk.attempts)
                    .failure(class, message),
            );
        }
        Ok(())
    }
}
