pub mod adapter;
pub mod config;
pub mod device;
pub mod error;
pub mod loader;
pub mod registry;
pub mod weights;

mod kontext;
mod util;

pub use adapter::InferenceAdapter;
pub use config::{ModelConfig, ModelVariant};
pub use device::{AcceleratorInfo, DevicePreference};
pub use error::EditError;
use image::DynamicImage;
pub use kontext::{EditPipeline, KontextLoader};
pub use loader::{ConfiguredLoader, LoadStrategy, Loader};
pub use registry::{LoadedModel, ModelRegistry, ModelStatus, PipelineLoader};
pub(crate) use util::*;

pub const DEFAULT_NUM_INFERENCE_STEPS: usize = 40;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 1.0;
pub const DEFAULT_TRUE_CFG_SCALE: f64 = 4.0;

/// One edit request: source image bytes plus sampling parameters.
/// Constructed per request, consumed once.
#[derive(Debug, Clone, PartialEq)]
pub struct EditRequest {
    pub image: Vec<u8>,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub true_cfg_scale: f64,
    pub seed: Option<u64>,
}

impl EditRequest {
    pub fn new(image: Vec<u8>, prompt: impl Into<String>) -> Self {
        Self {
            image,
            prompt: prompt.into(),
            negative_prompt: None,
            num_inference_steps: DEFAULT_NUM_INFERENCE_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            true_cfg_scale: DEFAULT_TRUE_CFG_SCALE,
            seed: None,
        }
    }

    /// The sampler requires a non-empty negative prompt; an absent or empty
    /// one becomes a single-space placeholder.
    pub fn negative_prompt(&self) -> &str {
        match self.negative_prompt.as_deref() {
            Some(s) if !s.is_empty() => s,
            _ => " ",
        }
    }
}

pub trait PipelineLike: Send + Sync {
    fn run(&self, image: &DynamicImage, request: &EditRequest) -> anyhow::Result<DynamicImage>;
}
