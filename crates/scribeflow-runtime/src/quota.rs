//! Rolling-window quota monitor.
//!
//! Soft warning layer in front of the hard [`ModelLimiters`](crate::ModelLimiters):
//! tracks requests and tokens issued per model over the last `window` and
//! asks the scheduler to slow down before the remote starts rejecting.
//!
//! Also tracks uploaded bytes and concurrent uploads against the remote
//! storage ceilings; see [`QuotaMonitor::track_upload`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scribeflow_core::{ProviderError, QuotaConfig};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

struct Entry {
    seq: u64,
    at: Instant,
    tokens: u64,
}

/// Handle to the window entry created by [`QuotaMonitor::record_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaTicket {
    seq: u64,
}

#[derive(Default)]
struct ModelWindow {
    entries: VecDeque<Entry>,
    tokens: u64,
    next_seq: u64,
    throttled_until: Option<Instant>,
    last_warned: Option<Instant>,
}

impl ModelWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.at) < window {
                break;
            }
            self.tokens = self.tokens.saturating_sub(front.tokens);
            self.entries.pop_front();
        }
    }
}

/// Point-in-time copy of one model's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaState {
    pub model: String,
    pub requests: u32,
    pub tokens: u64,
    pub request_limit: Option<u32>,
    pub token_limit: Option<u32>,
    pub utilization: f64,
    pub throttled: bool,
}

/// Bytes and uploads currently held by live [`UploadGuard`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadState {
    pub uploaded_bytes: u64,
    pub active_uploads: u32,
}

/// Keeps an upload counted until dropped.
#[must_use = "the upload is released as soon as the guard is dropped"]
pub struct UploadGuard {
    uploads: Arc<Mutex<UploadState>>,
    size_bytes: u64,
}

impl UploadGuard {
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        let mut uploads = self.uploads.lock();
        uploads.active_uploads = uploads.active_uploads.saturating_sub(1);
        uploads.uploaded_bytes = uploads.uploaded_bytes.saturating_sub(self.size_bytes);
    }
}

/// Per-model rolling request and token counters.
pub struct QuotaMonitor {
    config: QuotaConfig,
    windows: Mutex<HashMap<String, ModelWindow>>,
    uploads: Arc<Mutex<UploadState>>,
}

impl QuotaMonitor {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            uploads: Arc::new(Mutex::new(UploadState::default())),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    fn utilization_of(&self, model: &str, window: &ModelWindow) -> f64 {
        let mut utilization: f64 = 0.0;
        if let Some(limit) = self.config.request_limit(model) {
            utilization = utilization.max(window.entries.len() as f64 / limit as f64);
        }
        if let Some(limit) = self.config.token_limit(model) {
            utilization = utilization.max(window.tokens as f64 / limit as f64);
        }
        utilization
    }

    /// Record a dispatched request with its estimated token cost.
    ///
    /// The returned ticket identifies this request's entry for a later
    /// [`record_usage`](Self::record_usage) correction.
    pub fn record_request(&self, model: &str, estimated_tokens: u64) -> QuotaTicket {
        let now = Instant::now();
        let window_len = self.config.window();
        let mut windows = self.windows.lock();
        let window = windows.entry(model.to_string()).or_default();
        window.prune(now, window_len);
        let seq = window.next_seq;
        window.next_seq += 1;
        window.entries.push_back(Entry {
            seq,
            at: now,
            tokens: estimated_tokens,
        });
        window.tokens = window.tokens.saturating_add(estimated_tokens);

        let utilization = self.utilization_of(model, window);
        if utilization >= self.config.warn_threshold {
            let cooled = window
                .last_warned
                .map_or(true, |at| now.saturating_duration_since(at) >= self.config.warn_cooldown());
            if cooled {
                window.last_warned = Some(now);
                warn!(
                    "Quota for {} at {:.0}% ({} requests, {} tokens in window)",
                    model,
                    utilization * 100.0,
                    window.entries.len(),
                    window.tokens
                );
            }
        }
        QuotaTicket { seq }
    }

    /// Replace the estimate recorded under `ticket` with the provider-reported
    /// token count. Does nothing once that entry has left the window.
    pub fn record_usage(&self, model: &str, ticket: QuotaTicket, actual_tokens: u64) {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(model) else {
            return;
        };
        window.prune(now, self.config.window());
        let Some(entry) = window.entries.iter_mut().find(|e| e.seq == ticket.seq) else {
            debug!("Usage for {} arrived after its window entry expired", model);
            return;
        };
        let estimated = std::mem::replace(&mut entry.tokens, actual_tokens);
        window.tokens = window
            .tokens
            .saturating_sub(estimated)
            .saturating_add(actual_tokens);
    }

    /// Count an upload of `size_bytes` until the returned guard is dropped.
    ///
    /// Files over the per-file upload limit are rejected as invalid input.
    /// Nearing the storage or concurrency ceiling only logs a warning.
    pub fn track_upload(
        &self,
        source: &str,
        size_bytes: u64,
    ) -> std::result::Result<UploadGuard, ProviderError> {
        if let Some(limit) = self.config.upload_limit() {
            if size_bytes > limit {
                return Err(ProviderError::InvalidInput(format!(
                    "{} is {} bytes, over the per-file upload limit of {} bytes",
                    source, size_bytes, limit
                )));
            }
        }

        let mut uploads = self.uploads.lock();
        uploads.uploaded_bytes = uploads.uploaded_bytes.saturating_add(size_bytes);
        uploads.active_uploads += 1;

        if let Some(limit) = self.config.storage_limit() {
            let utilization = uploads.uploaded_bytes as f64 / limit as f64;
            if utilization >= self.config.warn_threshold {
                warn!(
                    "Uploads total {} bytes ({:.0}% of the {} byte storage ceiling)",
                    uploads.uploaded_bytes,
                    utilization * 100.0,
                    limit
                );
            }
        }
        if self.config.upload_concurrency_limit > 0 {
            let utilization =
                uploads.active_uploads as f64 / self.config.upload_concurrency_limit as f64;
            if utilization >= self.config.warn_threshold {
                warn!(
                    "Concurrent uploads at {}/{}",
                    uploads.active_uploads, self.config.upload_concurrency_limit
                );
            }
        }

        Ok(UploadGuard {
            uploads: self.uploads.clone(),
            size_bytes,
        })
    }

    pub fn uploads(&self) -> UploadState {
        *self.uploads.lock()
    }

    /// Note a remote throttle. Preemption stays on for `retry_after`, or for
    /// the maximum preemptive sleep when the remote gave no hint.
    pub fn note_throttle(&self, model: &str, retry_after: Option<Duration>) {
        let hold = retry_after.unwrap_or_else(|| self.config.max_preemptive_sleep());
        let until = Instant::now() + hold;
        let mut windows = self.windows.lock();
        let window = windows.entry(model.to_string()).or_default();
        if window.throttled_until.map_or(true, |t| t < until) {
            window.throttled_until = Some(until);
        }
    }

    /// Fraction of the tighter of the two ceilings used in the current window.
    /// Zero for models without local ceilings.
    pub fn utilization(&self, model: &str) -> f64 {
        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(model) else {
            return 0.0;
        };
        window.prune(Instant::now(), self.config.window());
        self.utilization_of(model, window)
    }

    pub fn should_preempt(&self, model: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(model) else {
            return false;
        };
        if window.throttled_until.is_some_and(|t| t > now) {
            return true;
        }
        window.prune(now, self.config.window());
        self.utilization_of(model, window) >= self.config.preempt_threshold
    }

    /// Soft delay to insert before dispatch.
    ///
    /// Remaining window time scaled by how far utilization overshoots the
    /// threshold, capped at `max_preemptive_sleep`. An active remote throttle
    /// raises it to at least the remaining hold.
    pub fn preempt_delay(&self, model: &str) -> Duration {
        let now = Instant::now();
        let window_len = self.config.window();
        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(model) else {
            return Duration::ZERO;
        };
        window.prune(now, window_len);

        let threshold = self.config.preempt_threshold;
        let utilization = self.utilization_of(model, window);
        let mut delay = Duration::ZERO;
        if utilization >= threshold {
            let remaining = window
                .entries
                .front()
                .map(|oldest| window_len.saturating_sub(now.saturating_duration_since(oldest.at)))
                .unwrap_or(Duration::ZERO);
            let overshoot = if threshold < 1.0 {
                ((utilization - threshold) / (1.0 - threshold)).clamp(0.0, 1.0)
            } else {
                1.0
            };
            delay = remaining
                .mul_f64(overshoot)
                .min(self.config.max_preemptive_sleep());
        }

        if let Some(until) = window.throttled_until {
            delay = delay.max(until.saturating_duration_since(now));
        }
        delay
    }

    /// Current counters for `model`. Unknown models read as zero.
    pub fn snapshot(&self, model: &str) -> QuotaState {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(model) else {
            return QuotaState {
                model: model.to_string(),
                requests: 0,
                tokens: 0,
                request_limit: self.config.request_limit(model),
                token_limit: self.config.token_limit(model),
                utilization: 0.0,
                throttled: false,
            };
        };
        window.prune(now, self.config.window());
        QuotaState {
            model: model.to_string(),
            requests: window.entries.len() as u32,
            tokens: window.tokens,
            request_limit: self.config.request_limit(model),
            token_limit: self.config.token_limit(model),
            utilization: self.utilization_of(model, window),
            throttled: window.throttled_until.is_some_and(|t| t > now),
        }
    }
}
