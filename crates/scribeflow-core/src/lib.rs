//! Scribeflow Core — shared data types, errors, configuration, model catalog.

pub mod config;
pub mod error;
pub mod models;
pub mod types;

pub use config::{DataPaths, PlanningConfig, PoolConfig, QuotaConfig, RetryConfig, ScribeConfig};
pub use error::{Error, ProviderError, Result};
pub use models::{Capability, ModelInfo, ModelPricing, PricePair};
pub use types::{Asset, ChunkWindow, FailureClass, Modality, PlanningParams};
