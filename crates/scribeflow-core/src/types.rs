//! Shared data types: assets, chunk windows, planning parameters, failure classes.

use serde::{Deserialize, Serialize};

/// Declared media kind of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Document,
    Image,
    Video,
    Audio,
}

impl Modality {
    /// Whether the asset has a timeline that can be cut into windows.
    pub fn is_time_based(&self) -> bool {
        matches!(self, Self::Video | Self::Audio)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A media unit to process. Immutable once fingerprinted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// Where the asset came from (local path or URI). Identifies the manifest.
    pub source: String,
    pub modality: Modality,
    /// Total duration in seconds, 0 for non-time-based media.
    pub duration_seconds: f64,
    pub size_bytes: u64,
    /// `sha256:<hex>` of the normalized bytes of the source.
    pub fingerprint: String,
    /// Fingerprint of the transcoded derivative, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_fingerprint: Option<String>,
}

/// Half-open time interval `[start, end)` within an asset.
///
/// Zero-length windows stand for "the whole asset" on non-time media.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkWindow {
    pub index: usize,
    pub start_seconds: f64,
    pub end_seconds: f64,
}

impl ChunkWindow {
    pub fn length(&self) -> f64 {
        (self.end_seconds - self.start_seconds).max(0.0)
    }

    pub fn is_whole_asset(&self) -> bool {
        self.length() == 0.0
    }
}

/// Parameters a chunk plan was computed with. Persisted in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningParams {
    pub model: String,
    /// Per-request token budget; `None` disables the token ceiling.
    pub token_budget: Option<u64>,
    pub tokens_per_second: f64,
    pub max_chunk_seconds: f64,
    pub max_chunk_bytes: u64,
}

/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    /// Remote throttling; back off exponentially.
    TransientCapacity,
    /// Dependent resource not ready; poll on a short fixed interval.
    TransientState,
    /// Malformed or oversized input; never retried.
    FatalInput,
    /// Unclassified; retried once.
    FatalOther,
}

impl FailureClass {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientCapacity | Self::TransientState)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientCapacity => "transient-capacity",
            Self::TransientState => "transient-state",
            Self::FatalInput => "fatal-input",
            Self::FatalOther => "fatal-other",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_class_wire_names() {
        let json = serde_json::to_string(&FailureClass::TransientCapacity).unwrap();
        assert_eq!(json, "\"transient-capacity\"");
        let parsed: FailureClass = serde_json::from_str("\"fatal-input\"").unwrap();
        assert_eq!(parsed, FailureClass::FatalInput);
        assert_eq!(FailureClass::TransientState.to_string(), "transient-state");
    }

    #[test]
    fn test_modality_time_based() {
        assert!(Modality::Video.is_time_based());
        assert!(Modality::Audio.is_time_based());
        assert!(!Modality::Document.is_time_based());
        assert!(!Modality::Image.is_time_based());
    }

    #[test]
    fn test_whole_asset_window() {
        let w = ChunkWindow {
            index: 0,
            start_seconds: 0.0,
            end_seconds: 0.0,
        };
        assert!(w.is_whole_asset());
        let w = ChunkWindow {
            index: 1,
            start_seconds: 10.0,
            end_seconds: 25.5,
        };
        assert_eq!(w.length(), 15.5);
    }
}
