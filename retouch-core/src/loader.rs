use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{ModelConfig, ModelVariant};
use crate::device::DevicePreference;
use crate::kontext::KontextLoader;
use crate::registry::{LoadedModel, PipelineLoader};
use crate::weights::WeightSource;
use crate::PipelineLike;

/// How the pipeline core is brought up: every component from the base
/// repository, or a single-file reduced-precision core substituted in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStrategy {
    Full,
    ReducedPrecision,
}

impl From<ModelVariant> for LoadStrategy {
    fn from(variant: ModelVariant) -> Self {
        match variant {
            ModelVariant::Full => LoadStrategy::Full,
            ModelVariant::Fp8 => LoadStrategy::ReducedPrecision,
        }
    }
}

/// Implemented by model-family loaders that can bring up a runnable pipeline.
pub trait Loader {
    type Model: PipelineLike;

    fn load(
        strategy: LoadStrategy,
        source: &WeightSource,
        device: DevicePreference,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}

/// One-shot pipeline bring-up. Errors propagate to the caller; there is no
/// retry at this layer.
pub async fn load_pipeline(config: &ModelConfig, device: DevicePreference) -> Result<LoadedModel> {
    let strategy = LoadStrategy::from(config.variant);
    tracing::info!(variant = %config.variant, ?strategy, "loading pipeline");
    let source = WeightSource::new(config.hf_token.clone())?;
    let pipeline = KontextLoader::load(strategy, &source, device).await?;
    Ok(LoadedModel {
        pipeline: Arc::new(pipeline),
        model_id: config.variant.model_id(),
    })
}

/// Loader seam the registry drives; carries the immutable start-time
/// configuration and device choice.
pub struct ConfiguredLoader {
    config: ModelConfig,
    device: DevicePreference,
}

impl ConfiguredLoader {
    pub fn new(config: ModelConfig, device: DevicePreference) -> Self {
        Self { config, device }
    }
}

#[async_trait]
impl PipelineLoader for ConfiguredLoader {
    async fn load(&self) -> Result<LoadedModel> {
        load_pipeline(&self.config, self.device).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_selects_strategy() {
        assert_eq!(LoadStrategy::from(ModelVariant::Full), LoadStrategy::Full);
        assert_eq!(
            LoadStrategy::from(ModelVariant::Fp8),
            LoadStrategy::ReducedPrecision
        );
    }
}
