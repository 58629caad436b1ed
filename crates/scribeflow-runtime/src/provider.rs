//! Provider boundary: the remote multimodal model, seen from the scheduler.

use async_trait::async_trait;
use scribeflow_core::{models, Capability, Modality, ProviderError};
use serde::{Deserialize, Serialize};

/// Token counters reported by the provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.output_tokens
    }
}

/// Successful provider response.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    pub usage: Usage,
}

/// Per-call metadata: which model, which window, which attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMeta {
    pub model: String,
    pub chunk_index: usize,
    pub start_seconds: f64,
    pub end_seconds: f64,
    /// 1-based attempt number for this chunk, across runs.
    pub attempt: u32,
}

/// A remote generation service.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name (for logging/telemetry).
    fn name(&self) -> &str;

    /// Whether `model` accepts `capability` input. Defaults to the catalog.
    fn supports(&self, model: &str, capability: Capability) -> bool {
        models::lookup(model).is_some_and(|info| info.supports(capability))
    }

    /// Transcribe one window of `asset_ref` following `instruction`.
    async fn transcribe(
        &self,
        instruction: &str,
        asset_ref: &str,
        modality: Modality,
        meta: &RequestMeta,
    ) -> std::result::Result<Transcription, ProviderError>;
}
