//! Telemetry recorder — append-only events for every attempt, plus the
//! usage and cost rollups built from them.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use scribeflow_core::{models, FailureClass, Modality, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::provider::Usage;

/// What happened to one chunk at one point in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Final failure; the chunk stays `failed`.
    Failure,
    /// Failed attempt that will be retried.
    Retry,
    /// Dispatch delayed by soft quota preemption.
    Throttle,
    /// Chunk was already `done` when the run started.
    Skip,
}

/// An immutable fact about one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub modality: Modality,
    pub chunk_index: usize,
    pub outcome: Outcome,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Timeline length of the chunk, for time-based media.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TelemetryEvent {
    pub fn new(
        run_id: Uuid,
        model: &str,
        modality: Modality,
        chunk_index: usize,
        outcome: Outcome,
    ) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            model: model.to_string(),
            modality,
            chunk_index,
            outcome,
            attempt: 0,
            failure_class: None,
            prompt_tokens: None,
            output_tokens: None,
            latency_ms: None,
            chunk_seconds: None,
            message: None,
        }
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn failure(mut self, class: FailureClass, message: impl Into<String>) -> Self {
        self.failure_class = Some(class);
        self.message = Some(message.into());
        self
    }

    pub fn usage(mut self, usage: Usage) -> Self {
        self.prompt_tokens = Some(usage.prompt_tokens);
        self.output_tokens = Some(usage.output_tokens);
        self
    }

    pub fn latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn chunk_seconds(mut self, seconds: f64) -> Self {
        self.chunk_seconds = (seconds > 0.0).then_some(seconds);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Destination for telemetry events. Only ever appended to.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

/// Rolled-up counters for one model or modality.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    /// Provider calls: successes, retries and failures.
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub throttles: u64,
    pub skips: u64,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    pub total_latency_ms: u64,
}

impl UsageTotals {
    fn add(&mut self, event: &TelemetryEvent) {
        match event.outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Failure => self.failures += 1,
            Outcome::Retry => self.retries += 1,
            Outcome::Throttle => self.throttles += 1,
            Outcome::Skip => self.skips += 1,
        }
        if matches!(
            event.outcome,
            Outcome::Success | Outcome::Failure | Outcome::Retry
        ) {
            self.requests += 1;
        }
        self.prompt_tokens += event.prompt_tokens.unwrap_or(0);
        self.output_tokens += event.output_tokens.unwrap_or(0);
        self.total_latency_ms += event.latency_ms.unwrap_or(0);
    }

    pub fn mean_latency_ms(&self) -> Option<f64> {
        (self.requests > 0).then(|| self.total_latency_ms as f64 / self.requests as f64)
    }
}

/// Media tokens per second assumed when a success reported no usage.
const ESTIMATED_TOKENS_PER_SECOND: f64 = 300.0;

/// Spend attributed to one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelCost {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

/// Estimated USD spend of a set of events, priced from the model catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostSummary {
    pub total_input_cost: f64,
    pub total_output_cost: f64,
    pub total_cost: f64,
    pub per_model: BTreeMap<String, ModelCost>,
    /// Some token counts were inferred from chunk length, not reported.
    pub estimated: bool,
}

impl CostSummary {
    fn add(&mut self, event: &TelemetryEvent) {
        if !matches!(
            event.outcome,
            Outcome::Success | Outcome::Failure | Outcome::Retry
        ) {
            return;
        }

        let mut input_tokens = event.prompt_tokens.unwrap_or(0);
        let output_tokens = event.output_tokens.unwrap_or(0);
        if input_tokens == 0 && output_tokens == 0 {
            let inferred = match (event.outcome, event.chunk_seconds) {
                (Outcome::Success, Some(seconds)) if event.modality.is_time_based() => {
                    (seconds * ESTIMATED_TOKENS_PER_SECOND) as u64
                }
                _ => 0,
            };
            if inferred == 0 {
                return;
            }
            input_tokens = inferred;
            self.estimated = true;
        }

        let price = models::pricing(&event.model).for_modality(event.modality);
        let input_cost = input_tokens as f64 / 1_000_000.0 * price.input;
        let output_cost = output_tokens as f64 / 1_000_000.0 * price.output;
        self.total_input_cost += input_cost;
        self.total_output_cost += output_cost;
        self.total_cost += input_cost + output_cost;

        let model = self.per_model.entry(event.model.clone()).or_default();
        model.input_tokens += input_tokens;
        model.output_tokens += output_tokens;
        model.input_cost += input_cost;
        model.output_cost += output_cost;
        model.total_cost += input_cost + output_cost;
    }
}

/// Cost of `events` alone, without the usage rollups.
pub fn estimate_cost<'a>(events: impl IntoIterator<Item = &'a TelemetryEvent>) -> CostSummary {
    let mut cost = CostSummary::default();
    for event in events {
        cost.add(event);
    }
    cost
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySummary {
    pub by_model: BTreeMap<String, UsageTotals>,
    pub by_modality: BTreeMap<String, UsageTotals>,
    pub cost: CostSummary,
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    pub fn summarize(&self) -> TelemetrySummary {
        let mut summary = TelemetrySummary::default();
        for event in self.events.lock().iter() {
            summary
                .by_model
                .entry(event.model.clone())
                .or_default()
                .add(event);
            summary
                .by_modality
                .entry(event.modality.to_string())
                .or_default()
                .add(event);
            summary.cost.add(event);
        }
        summary
    }
}

impl TelemetrySink for MemoryRecorder {
    fn record(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}

/// Appends one JSON object per line to a file.
pub struct NdjsonRecorder {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl NdjsonRecorder {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySink for NdjsonRecorder {
    fn record(&self, event: TelemetryEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize telemetry event: {}", e);
                return;
            }
        };
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            warn!("Failed to write telemetry to {}: {}", self.path.display(), e);
        }
    }
}

/// Fans each event out to several sinks.
pub struct MultiRecorder {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl MultiRecorder {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }
}

impl TelemetrySink for MultiRecorder {
    fn record(&self, event: TelemetryEvent) {
        for sink in &self.sinks {
            sink.record(event.clone());
        }
    }
}
