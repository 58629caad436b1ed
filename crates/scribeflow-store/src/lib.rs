//! Scribeflow Store — per-asset chunk manifests persisted as JSON.

pub mod manifest;
pub mod types;

pub use manifest::{asset_key, ManifestHandle, ManifestStore};
pub use types::*;
