//! Configuration and data directory management.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models;
use crate::types::PlanningParams;

/// Paths to all Scribeflow data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// Per-asset manifests and result artifacts (`data/manifests/`).
    pub manifests: PathBuf,
    /// Telemetry event logs (`data/telemetry/`).
    pub telemetry: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let paths = Self::layout(root);
        paths.ensure_dirs()?;
        Ok(paths)
    }

    fn layout(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            manifests: root.join("manifests"),
            telemetry: root.join("telemetry"),
            root,
        }
    }

    /// Shared NDJSON event log under the telemetry directory.
    pub fn telemetry_log(&self) -> PathBuf {
        self.telemetry.join("events.ndjson")
    }

    /// Create all required directories.
    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.manifests)?;
        std::fs::create_dir_all(&self.telemetry)?;
        Ok(())
    }
}

impl Default for DataPaths {
    fn default() -> Self {
        Self::layout("data")
    }
}

/// Chunk planning ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Per-request token budget (default: 300000). `null` disables it.
    #[serde(default = "default_token_budget")]
    pub token_budget: Option<u64>,
    /// Assumed media tokens per second of timeline (default: 300).
    #[serde(default = "default_tokens_per_second")]
    pub tokens_per_second: f64,
    /// Longest chunk in seconds (default: 7200).
    #[serde(default = "default_max_chunk_seconds")]
    pub max_chunk_seconds: f64,
    /// Largest chunk in bytes (default: 500 MiB).
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: u64,
}

fn default_model() -> String {
    models::DEFAULT_MODEL.into()
}
fn default_token_budget() -> Option<u64> {
    Some(300_000)
}
fn default_tokens_per_second() -> f64 {
    300.0
}
fn default_max_chunk_seconds() -> f64 {
    7200.0
}
fn default_max_chunk_bytes() -> u64 {
    500 * 1024 * 1024
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            token_budget: default_token_budget(),
            tokens_per_second: default_tokens_per_second(),
            max_chunk_seconds: default_max_chunk_seconds(),
            max_chunk_bytes: default_max_chunk_bytes(),
        }
    }
}

impl PlanningConfig {
    pub fn params(&self) -> PlanningParams {
        PlanningParams {
            model: self.model.clone(),
            token_budget: self.token_budget,
            tokens_per_second: self.tokens_per_second,
            max_chunk_seconds: self.max_chunk_seconds,
            max_chunk_bytes: self.max_chunk_bytes,
        }
    }
}

/// Per-model quota ceilings and soft-preemption tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Requests-per-window ceiling by model.
    #[serde(default = "default_request_limits")]
    pub request_limits: HashMap<String, u32>,
    /// Tokens-per-window ceiling by model.
    #[serde(default = "default_token_limits")]
    pub token_limits: HashMap<String, u32>,
    /// Rolling window length in seconds (default: 60).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Utilization at which dispatch is softly delayed (default: 0.8).
    #[serde(default = "default_threshold")]
    pub preempt_threshold: f64,
    /// Utilization at which a warning is logged (default: 0.8).
    #[serde(default = "default_threshold")]
    pub warn_threshold: f64,
    #[serde(default = "default_warn_cooldown_ms")]
    pub warn_cooldown_ms: u64,
    /// Upper bound for a single soft-preemption sleep (default: 10s).
    #[serde(default = "default_max_preemptive_sleep_ms")]
    pub max_preemptive_sleep_ms: u64,
    /// Largest single upload in bytes (default: 2 GiB). Zero disables it.
    #[serde(default = "default_upload_limit_bytes")]
    pub upload_limit_bytes: u64,
    /// Remote file storage ceiling in bytes (default: 20 GiB).
    #[serde(default = "default_storage_limit_bytes")]
    pub storage_limit_bytes: u64,
    #[serde(default = "default_upload_concurrency_limit")]
    pub upload_concurrency_limit: u32,
}

fn default_request_limits() -> HashMap<String, u32> {
    models::catalog()
        .iter()
        .map(|m| (m.name.to_string(), m.requests_per_minute))
        .collect()
}
fn default_token_limits() -> HashMap<String, u32> {
    models::catalog()
        .iter()
        .map(|m| (m.name.to_string(), m.tokens_per_minute))
        .collect()
}
fn default_window_secs() -> u64 {
    60
}
fn default_threshold() -> f64 {
    0.8
}
fn default_warn_cooldown_ms() -> u64 {
    10_000
}
fn default_max_preemptive_sleep_ms() -> u64 {
    10_000
}
fn default_upload_limit_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}
fn default_storage_limit_bytes() -> u64 {
    20 * 1024 * 1024 * 1024
}
fn default_upload_concurrency_limit() -> u32 {
    100
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            request_limits: default_request_limits(),
            token_limits: default_token_limits(),
            window_secs: default_window_secs(),
            preempt_threshold: default_threshold(),
            warn_threshold: default_threshold(),
            warn_cooldown_ms: default_warn_cooldown_ms(),
            max_preemptive_sleep_ms: default_max_preemptive_sleep_ms(),
            upload_limit_bytes: default_upload_limit_bytes(),
            storage_limit_bytes: default_storage_limit_bytes(),
            upload_concurrency_limit: default_upload_concurrency_limit(),
        }
    }
}

impl QuotaConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }

    pub fn warn_cooldown(&self) -> Duration {
        Duration::from_millis(self.warn_cooldown_ms)
    }

    pub fn max_preemptive_sleep(&self) -> Duration {
        Duration::from_millis(self.max_preemptive_sleep_ms)
    }

    /// Ceiling for `model`; zero or missing means "no local ceiling".
    pub fn request_limit(&self, model: &str) -> Option<u32> {
        self.request_limits.get(model).copied().filter(|v| *v > 0)
    }

    pub fn token_limit(&self, model: &str) -> Option<u32> {
        self.token_limits.get(model).copied().filter(|v| *v > 0)
    }

    pub fn upload_limit(&self) -> Option<u64> {
        (self.upload_limit_bytes > 0).then_some(self.upload_limit_bytes)
    }

    pub fn storage_limit(&self) -> Option<u64> {
        (self.storage_limit_bytes > 0).then_some(self.storage_limit_bytes)
    }
}

/// Retry and backoff tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base delay for exponential backoff in ms (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay between retries in ms (default: 60000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Attempt ceiling for capacity failures (default: 6).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed poll interval for not-ready resources in ms (default: 3000).
    #[serde(default = "default_state_poll_interval_ms")]
    pub state_poll_interval_ms: u64,
    /// Attempt ceiling for not-ready failures (default: 10).
    #[serde(default = "default_max_state_polls")]
    pub max_state_polls: u32,
    /// Retries granted to unclassified failures (default: 1).
    #[serde(default = "default_fatal_other_retries")]
    pub fatal_other_retries: u32,
}

fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_max_attempts() -> u32 {
    6
}
fn default_state_poll_interval_ms() -> u64 {
    3000
}
fn default_max_state_polls() -> u32 {
    10
}
fn default_fatal_other_retries() -> u32 {
    1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            state_poll_interval_ms: default_state_poll_interval_ms(),
            max_state_polls: default_max_state_polls(),
            fatal_other_retries: default_fatal_other_retries(),
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Concurrent slots for ordinary work (default: 4).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Concurrent slots for chunked time-based media (default: 3).
    #[serde(default = "default_max_video_workers")]
    pub max_video_workers: usize,
    /// Caller-side timeout for one provider call in seconds (default: 600).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Re-check result artifacts of `done` chunks before resuming.
    #[serde(default = "default_verify_artifacts")]
    pub verify_artifacts: bool,
}

fn default_max_workers() -> usize {
    4
}
fn default_max_video_workers() -> usize {
    3
}
fn default_request_timeout_secs() -> u64 {
    600
}
fn default_verify_artifacts() -> bool {
    true
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_video_workers: default_max_video_workers(),
            request_timeout_secs: default_request_timeout_secs(),
            verify_artifacts: default_verify_artifacts(),
        }
    }
}

impl PoolConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Top-level Scribeflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScribeConfig {
    /// Data directory paths (resolved at load time, never read from file).
    #[serde(skip)]
    pub data_paths: DataPaths,
    #[serde(default)]
    pub planning: PlanningConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl ScribeConfig {
    /// Load configuration from an optional JSON file, then apply environment
    /// overrides. A missing file falls back to defaults.
    pub fn load(config_file: Option<&Path>, data_dir: impl AsRef<Path>) -> Result<Self> {
        let mut config = match config_file {
            Some(path) if path.exists() => {
                let data = std::fs::read_to_string(path)?;
                let parsed: ScribeConfig = serde_json::from_str(&data).map_err(|e| {
                    Error::Config(format!("invalid config {}: {}", path.display(), e))
                })?;
                info!("Loaded configuration from {}", path.display());
                parsed
            }
            Some(path) => {
                warn!("Config file {} not found, using defaults", path.display());
                ScribeConfig::default()
            }
            None => ScribeConfig::default(),
        };

        config.data_paths = DataPaths::new(data_dir)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `SCRIBEFLOW_*` overrides from the given lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup("SCRIBEFLOW_MODEL").filter(|m| !m.is_empty()) {
            self.planning.model = model;
        }
        if let Some(n) = lookup("SCRIBEFLOW_MAX_WORKERS").and_then(|v| v.parse().ok()) {
            self.pool.max_workers = n;
        }
        if let Some(n) = lookup("SCRIBEFLOW_MAX_VIDEO_WORKERS").and_then(|v| v.parse().ok()) {
            self.pool.max_video_workers = n;
        }
        if let Some(n) = lookup("SCRIBEFLOW_TOKEN_BUDGET").and_then(|v| v.parse().ok()) {
            self.planning.token_budget = Some(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ScribeConfig::default();
        assert_eq!(config.planning.token_budget, Some(300_000));
        assert_eq!(config.planning.tokens_per_second, 300.0);
        assert_eq!(config.retry.max_attempts, 6);
        assert_eq!(config.retry.max_delay_ms, 60_000);
        assert_eq!(config.pool.max_workers, 4);
        assert_eq!(config.pool.max_video_workers, 3);
        assert_eq!(config.quota.window(), Duration::from_secs(60));
        assert_eq!(config.quota.request_limit(models::GEMINI_2_5_PRO), Some(6));
        assert_eq!(config.quota.upload_limit(), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(config.quota.storage_limit(), Some(20 * 1024 * 1024 * 1024));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("scribeflow.json");
        std::fs::write(
            &file,
            r#"{"planning": {"max_chunk_seconds": 3600}, "retry": {"max_attempts": 3}}"#,
        )
        .unwrap();

        let config = ScribeConfig::load(Some(&file), dir.path().join("data")).unwrap();
        assert_eq!(config.planning.max_chunk_seconds, 3600.0);
        assert_eq!(config.planning.tokens_per_second, 300.0);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert!(config.data_paths.manifests.exists());
        assert!(config.data_paths.telemetry.exists());
        assert_eq!(
            config.data_paths.telemetry_log(),
            dir.path().join("data").join("telemetry").join("events.ndjson")
        );
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("broken.json");
        std::fs::write(&file, "{not json").unwrap();
        let err = ScribeConfig::load(Some(&file), dir.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_overrides() {
        let mut config = ScribeConfig::default();
        config.apply_overrides(|key| match key {
            "SCRIBEFLOW_MODEL" => Some("gemini-2.5-pro".into()),
            "SCRIBEFLOW_MAX_WORKERS" => Some("8".into()),
            "SCRIBEFLOW_TOKEN_BUDGET" => Some("not-a-number".into()),
            _ => None,
        });
        assert_eq!(config.planning.model, "gemini-2.5-pro");
        assert_eq!(config.pool.max_workers, 8);
        assert_eq!(config.planning.token_budget, Some(300_000));
    }

    #[test]
    fn test_zero_limit_means_unbounded() {
        let mut quota = QuotaConfig::default();
        quota.request_limits.insert("local-model".into(), 0);
        assert_eq!(quota.request_limit("local-model"), None);
        assert_eq!(quota.token_limit("unknown"), None);
    }
}
