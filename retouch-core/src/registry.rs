use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::PipelineLike;

/// The singleton state installed after a successful load: the pipeline handle
/// and its identifying label. All fields populate together; a handle is never
/// observable half-built.
#[derive(Clone)]
pub struct LoadedModel {
    pub pipeline: Arc<dyn PipelineLike>,
    pub model_id: String,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

/// Seam between the registry and the concrete loading path.
#[async_trait]
pub trait PipelineLoader: Send + Sync {
    async fn load(&self) -> Result<LoadedModel>;
}

/// Read-only view for the health/info endpoints. Never blocks behind an
/// in-flight load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelStatus {
    pub loaded: bool,
    pub model_id: Option<String>,
}

enum LoadState {
    Unloaded,
    Loaded(LoadedModel),
}

/// Process-wide holder of the single loaded pipeline.
///
/// `ensure_loaded` is single-flight: the state mutex is held across the
/// in-flight load, so concurrent callers wait on the same attempt instead of
/// racing their own. A failed attempt leaves the state unloaded and the next
/// caller retries from scratch.
pub struct ModelRegistry {
    loader: Box<dyn PipelineLoader>,
    state: Mutex<LoadState>,
    snapshot: RwLock<ModelStatus>,
}

impl ModelRegistry {
    pub fn new(loader: impl PipelineLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            state: Mutex::new(LoadState::Unloaded),
            snapshot: RwLock::new(ModelStatus::default()),
        }
    }

    /// Returns the loaded model, loading it first if this is the first call
    /// (or every earlier attempt failed).
    pub async fn ensure_loaded(&self) -> Result<LoadedModel> {
        let mut state = self.state.lock().await;
        if let LoadState::Loaded(model) = &*state {
            return Ok(model.clone());
        }
        let model = self.loader.load().await?;
        tracing::info!(model_id = %model.model_id, "model loaded");
        *state = LoadState::Loaded(model.clone());
        *self.snapshot.write().expect("status lock poisoned") = ModelStatus {
            loaded: true,
            model_id: Some(model.model_id.clone()),
        };
        Ok(model)
    }

    pub fn status(&self) -> ModelStatus {
        self.snapshot.read().expect("status lock poisoned").clone()
    }

    /// Drops the handle; device and host memory go with the last strong
    /// reference. Calling this when nothing is loaded is a no-op.
    pub async fn teardown(&self) {
        let mut state = self.state.lock().await;
        if let LoadState::Loaded(model) = std::mem::replace(&mut *state, LoadState::Unloaded) {
            tracing::info!(model_id = %model.model_id, "tearing down model");
            *self.snapshot.write().expect("status lock poisoned") = ModelStatus::default();
            drop(model);
        }
    }
}
