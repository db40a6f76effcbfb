use std::sync::Arc;

use image::DynamicImage;
use tokio::sync::Mutex;

use crate::error::EditError;
use crate::registry::ModelRegistry;
use crate::util::encode_png;
use crate::EditRequest;

/// Bridges wire-level edit requests onto the singleton pipeline: bytes in,
/// PNG bytes out.
pub struct InferenceAdapter {
    registry: Arc<ModelRegistry>,
    /// Device-exclusive execution gate: one inference at a time. The mutex is
    /// fair, so requests run in the order they reach it.
    gate: Mutex<()>,
}

impl InferenceAdapter {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            gate: Mutex::new(()),
        }
    }

    pub async fn run(&self, request: EditRequest) -> Result<Vec<u8>, EditError> {
        let input = image::load_from_memory(&request.image)
            .map_err(|e| EditError::InputDecode(e.to_string()))?;
        // Normalize to a fixed 3-channel color model.
        let input = DynamicImage::ImageRgb8(input.to_rgb8());
        tracing::info!(
            width = input.width(),
            height = input.height(),
            prompt = %truncate(&request.prompt, 50),
            "received edit request"
        );

        let model = self
            .registry
            .ensure_loaded()
            .await
            .map_err(EditError::classify)?;

        let _exclusive = self.gate.lock().await;
        let pipeline = model.pipeline.clone();
        let result = tokio::task::spawn_blocking(move || pipeline.run(&input, &request))
            .await
            .map_err(|e| EditError::Upstream(format!("inference task failed: {e}")))?
            .map_err(EditError::classify)?;

        let bytes = encode_png(&result).map_err(EditError::classify)?;
        tracing::info!(bytes = bytes.len(), "edit completed");
        Ok(bytes)
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{LoadedModel, PipelineLoader};
    use crate::PipelineLike;
    use anyhow::Result;
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoPipeline {
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl EchoPipeline {
        fn new() -> Self {
            Self {
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            }
        }
    }

    impl PipelineLike for EchoPipeline {
        fn run(&self, image: &DynamicImage, request: &EditRequest) -> Result<DynamicImage> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            assert!(!request.negative_prompt().is_empty());
            std::thread::sleep(std::time::Duration::from_millis(20));
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(image.clone())
        }
    }

    struct StubLoader {
        pipeline: Arc<EchoPipeline>,
    }

    #[async_trait]
    impl PipelineLoader for StubLoader {
        async fn load(&self) -> Result<LoadedModel> {
            Ok(LoadedModel {
                pipeline: self.pipeline.clone(),
                model_id: "stub-model".to_string(),
            })
        }
    }

    struct FailingLoader;

    #[async_trait]
    impl PipelineLoader for FailingLoader {
        async fn load(&self) -> Result<LoadedModel> {
            anyhow::bail!("weights unavailable")
        }
    }

    fn adapter() -> (Arc<InferenceAdapter>, Arc<EchoPipeline>) {
        let pipeline = Arc::new(EchoPipeline::new());
        let registry = Arc::new(ModelRegistry::new(StubLoader {
            pipeline: pipeline.clone(),
        }));
        (Arc::new(InferenceAdapter::new(registry)), pipeline)
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([255, 0, 0])));
        encode_png(&img).unwrap()
    }

    #[tokio::test]
    async fn round_trips_png_bytes() {
        let (adapter, _) = adapter();
        let out = adapter
            .run(EditRequest::new(png_bytes(32, 16), "make it blue"))
            .await
            .unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
        assert_eq!(
            image::guess_format(&out).unwrap(),
            image::ImageFormat::Png
        );
    }

    #[tokio::test]
    async fn corrupt_bytes_are_a_client_input_error() {
        let (adapter, _) = adapter();
        let err = adapter
            .run(EditRequest::new(b"definitely not an image".to_vec(), "p"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "input_decode");
    }

    #[tokio::test]
    async fn load_failure_surfaces_with_its_message() {
        let registry = Arc::new(ModelRegistry::new(FailingLoader));
        let adapter = InferenceAdapter::new(registry);
        let err = adapter
            .run(EditRequest::new(png_bytes(8, 8), "p"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "upstream");
        assert!(err.to_string().contains("weights unavailable"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_run_one_at_a_time() {
        let (adapter, pipeline) = adapter();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let adapter = adapter.clone();
            handles.push(tokio::spawn(async move {
                adapter
                    .run(EditRequest::new(png_bytes(8, 8), "p"))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(pipeline.max_running.load(Ordering::SeqCst), 1);
    }
}
