//! Manifest data types: the persisted chunk list and its status counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scribeflow_core::{Asset, ChunkWindow, FailureClass, Modality, PlanningParams};

/// On-disk manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Lifecycle of a chunk: `pending → in_flight → {done | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// A planned window plus its mutable processing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub index: usize,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub status: ChunkStatus,
    /// Result artifact, relative to the manifest directory.
    #[serde(default)]
    pub result_ref: Option<String>,
    /// Provider invocations made for this chunk, across runs.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ChunkRecord {
    pub fn from_window(window: &ChunkWindow) -> Self {
        Self {
            index: window.index,
            start_seconds: window.start_seconds,
            end_seconds: window.end_seconds,
            status: ChunkStatus::Pending,
            result_ref: None,
            attempts: 0,
            failure_class: None,
            last_error: None,
        }
    }

    pub fn window(&self) -> ChunkWindow {
        ChunkWindow {
            index: self.index,
            start_seconds: self.start_seconds,
            end_seconds: self.end_seconds,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == ChunkStatus::Done
    }
}

/// Durable record of one asset's planned chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(default)]
    pub source: String,
    pub asset_fingerprint: String,
    #[serde(default)]
    pub normalized_fingerprint: Option<String>,
    pub duration_seconds: f64,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modality: Option<Modality>,
    pub planning: PlanningParams,
    pub chunks: Vec<ChunkRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_utc: Option<DateTime<Utc>>,
}

impl Manifest {
    /// Fresh manifest with every chunk `pending`.
    pub fn new(asset: &Asset, planning: &PlanningParams, windows: &[ChunkWindow]) -> Self {
        let now = Utc::now();
        Self {
            version: MANIFEST_VERSION,
            source: asset.source.clone(),
            asset_fingerprint: asset.fingerprint.clone(),
            normalized_fingerprint: asset.normalized_fingerprint.clone(),
            duration_seconds: asset.duration_seconds,
            size_bytes: asset.size_bytes,
            modality: Some(asset.modality),
            planning: planning.clone(),
            chunks: windows.iter().map(ChunkRecord::from_window).collect(),
            created_utc: Some(now),
            updated_utc: Some(now),
        }
    }

    /// Why this manifest cannot be resumed for `asset`, or `None` if it can.
    pub fn stale_reason(&self, asset: &Asset, planning: &PlanningParams) -> Option<String> {
        if self.version != MANIFEST_VERSION {
            return Some(format!("unsupported manifest version {}", self.version));
        }
        if self.asset_fingerprint != asset.fingerprint {
            return Some(format!(
                "asset fingerprint changed ({} → {})",
                self.asset_fingerprint, asset.fingerprint
            ));
        }
        if let (Some(recorded), Some(current)) =
            (&self.normalized_fingerprint, &asset.normalized_fingerprint)
        {
            if recorded != current {
                return Some("normalized fingerprint changed".to_string());
            }
        }
        if &self.planning != planning {
            return Some("planning parameters changed".to_string());
        }
        None
    }

    pub fn chunk(&self, index: usize) -> Option<&ChunkRecord> {
        self.chunks.iter().find(|c| c.index == index)
    }

    pub fn chunk_mut(&mut self, index: usize) -> Option<&mut ChunkRecord> {
        self.chunks.iter_mut().find(|c| c.index == index)
    }

    pub fn progress(&self) -> Progress {
        let mut progress = Progress {
            total: self.chunks.len(),
            ..Progress::default()
        };
        for chunk in &self.chunks {
            match chunk.status {
                ChunkStatus::Pending => progress.pending += 1,
                ChunkStatus::InFlight => progress.in_flight += 1,
                ChunkStatus::Done => progress.done += 1,
                ChunkStatus::Failed => progress.failed += 1,
            }
        }
        progress
    }
}

/// Chunk counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub done: usize,
    pub failed: usize,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.done == self.total
    }
}
