//! Model catalog: capabilities, published per-minute ceilings and pricing.

use serde::{Deserialize, Serialize};

use crate::types::Modality;

pub const GEMINI_2_5_FLASH: &str = "gemini-2.5-flash";
pub const GEMINI_2_5_FLASH_LITE: &str = "gemini-2.5-flash-lite";
pub const GEMINI_2_5_PRO: &str = "gemini-2.5-pro";
pub const GEMINI_2_FLASH: &str = "gemini-2.0-flash";

/// Default model for planning when nothing is configured.
pub const DEFAULT_MODEL: &str = GEMINI_2_5_FLASH_LITE;

/// Input kind a model can accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Text,
    Image,
    Audio,
    Video,
    Pdf,
}

impl Capability {
    /// Capability a modality needs from the model.
    pub fn for_modality(modality: Modality) -> Self {
        match modality {
            Modality::Document => Self::Pdf,
            Modality::Image => Self::Image,
            Modality::Video => Self::Video,
            Modality::Audio => Self::Audio,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Image => write!(f, "image"),
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
            Self::Pdf => write!(f, "pdf"),
        }
    }
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePair {
    pub input: f64,
    pub output: f64,
}

impl PricePair {
    const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }
}

/// Prices for text-like input and for audio/video input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub text: PricePair,
    pub audio_video: PricePair,
}

impl ModelPricing {
    /// Priced at zero; used for models missing from the catalog.
    pub const FREE: Self = Self::new((0.0, 0.0), (0.0, 0.0));

    const fn new(text: (f64, f64), audio_video: (f64, f64)) -> Self {
        Self {
            text: PricePair::new(text.0, text.1),
            audio_video: PricePair::new(audio_video.0, audio_video.1),
        }
    }

    pub fn for_modality(&self, modality: Modality) -> PricePair {
        if modality.is_time_based() {
            self.audio_video
        } else {
            self.text
        }
    }
}

/// Static description of a known model.
#[derive(Debug, Clone, Copy)]
pub struct ModelInfo {
    pub name: &'static str,
    pub capabilities: &'static [Capability],
    /// Published requests-per-minute ceiling.
    pub requests_per_minute: u32,
    /// Published tokens-per-minute ceiling.
    pub tokens_per_minute: u32,
    pub pricing: ModelPricing,
}

impl ModelInfo {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

const ALL_MEDIA: &[Capability] = &[
    Capability::Text,
    Capability::Image,
    Capability::Audio,
    Capability::Video,
    Capability::Pdf,
];

const CATALOG: &[ModelInfo] = &[
    ModelInfo {
        name: GEMINI_2_5_FLASH,
        capabilities: &[
            Capability::Text,
            Capability::Image,
            Capability::Audio,
            Capability::Video,
        ],
        requests_per_minute: 20,
        tokens_per_minute: 600_000,
        pricing: ModelPricing::new((0.35, 1.05), (0.70, 2.10)),
    },
    ModelInfo {
        name: GEMINI_2_5_FLASH_LITE,
        capabilities: ALL_MEDIA,
        requests_per_minute: 10,
        tokens_per_minute: 600_000,
        pricing: ModelPricing::new((0.10, 0.40), (0.30, 1.20)),
    },
    ModelInfo {
        name: GEMINI_2_5_PRO,
        capabilities: ALL_MEDIA,
        requests_per_minute: 6,
        tokens_per_minute: 600_000,
        pricing: ModelPricing::new((3.50, 10.00), (3.00, 15.00)),
    },
    ModelInfo {
        name: GEMINI_2_FLASH,
        capabilities: &[Capability::Text, Capability::Image],
        requests_per_minute: 15,
        tokens_per_minute: 600_000,
        pricing: ModelPricing::new((0.10, 0.40), (0.70, 2.80)),
    },
];

/// All catalogued models.
pub fn catalog() -> &'static [ModelInfo] {
    CATALOG
}

/// Look up a model by name.
pub fn lookup(name: &str) -> Option<&'static ModelInfo> {
    CATALOG.iter().find(|m| m.name == name)
}

/// Pricing for `name`, free when the model is not catalogued.
pub fn pricing(name: &str) -> ModelPricing {
    lookup(name).map_or(ModelPricing::FREE, |m| m.pricing)
}
