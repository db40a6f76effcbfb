use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Json, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use retouch_core::{
    config, AcceleratorInfo, ConfiguredLoader, DevicePreference, EditError, EditRequest,
    InferenceAdapter, ModelConfig, ModelRegistry, ModelVariant, DEFAULT_GUIDANCE_SCALE,
    DEFAULT_NUM_INFERENCE_STEPS, DEFAULT_TRUE_CFG_SCALE,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Retouch image editing server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Weight-precision variant to load
    #[arg(long, env = "MODEL_VARIANT", default_value = "full")]
    variant: ModelVariant,

    /// Load the model at startup instead of on first request
    #[arg(long, env = "MODEL_PRELOAD", default_value = "true", value_parser = parse_preload)]
    preload: bool,

    /// Hub access token for gated repositories
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,
}

fn parse_preload(value: &str) -> Result<bool, std::convert::Infallible> {
    Ok(config::truthy(value))
}

// Application state shared by all request handlers.
#[derive(Clone)]
struct AppState {
    registry: Arc<ModelRegistry>,
    adapter: Arc<InferenceAdapter>,
    variant: ModelVariant,
    accelerator: Arc<AcceleratorInfo>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    cuda_available: bool,
}

#[derive(Serialize)]
struct InfoResponse {
    model_id: Option<String>,
    variant: String,
    loaded: bool,
    cuda_available: bool,
    gpu_name: Option<String>,
    gpu_memory_gb: Option<f64>,
}

#[derive(Deserialize)]
struct Base64EditRequest {
    /// Base64 encoded image
    image: String,
    prompt: String,
    #[serde(default)]
    negative_prompt: Option<String>,
    #[serde(default = "default_steps")]
    num_inference_steps: usize,
    #[serde(default = "default_guidance")]
    guidance_scale: f64,
    #[serde(default = "default_true_cfg")]
    true_cfg_scale: f64,
    #[serde(default)]
    seed: Option<u64>,
}

fn default_steps() -> usize {
    DEFAULT_NUM_INFERENCE_STEPS
}

fn default_guidance() -> f64 {
    DEFAULT_GUIDANCE_SCALE
}

fn default_true_cfg() -> f64 {
    DEFAULT_TRUE_CFG_SCALE
}

#[derive(Serialize)]
struct Base64EditResponse {
    image: String,
    format: &'static str,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        model_loaded: state.registry.status().loaded,
        cuda_available: state.accelerator.cuda_available,
    })
}

async fn info_handler(State(state): State<AppState>) -> Json<InfoResponse> {
    let status = state.registry.status();
    Json(InfoResponse {
        model_id: status
            .model_id
            .or_else(|| Some(config::BASE_MODEL_ID.to_string())),
        variant: state.variant.to_string(),
        loaded: status.loaded,
        cuda_available: state.accelerator.cuda_available,
        gpu_name: state.accelerator.gpu_name.clone(),
        gpu_memory_gb: state.accelerator.gpu_memory_gb,
    })
}

async fn edit_handler(State(state): State<AppState>, multipart: Multipart) -> Response {
    let request = match parse_multipart(multipart).await {
        Ok(request) => request,
        Err(e) => return error_response(e),
    };
    match state.adapter.run(request).await {
        Ok(png) => (
            [
                (header::CONTENT_TYPE, "image/png"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=edited_image.png",
                ),
            ],
            png,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn parse_multipart(mut multipart: Multipart) -> Result<EditRequest, EditError> {
    let invalid = |e: &dyn std::fmt::Display| EditError::InputDecode(e.to_string());

    let mut image = None;
    let mut prompt = None;
    let mut negative_prompt = None;
    let mut num_inference_steps = DEFAULT_NUM_INFERENCE_STEPS;
    let mut guidance_scale = DEFAULT_GUIDANCE_SCALE;
    let mut true_cfg_scale = DEFAULT_TRUE_CFG_SCALE;
    let mut seed = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| invalid(&e))? {
        match field.name().unwrap_or_default() {
            "image" => image = Some(field.bytes().await.map_err(|e| invalid(&e))?.to_vec()),
            "prompt" => prompt = Some(field.text().await.map_err(|e| invalid(&e))?),
            "negative_prompt" => {
                negative_prompt = Some(field.text().await.map_err(|e| invalid(&e))?)
            }
            "num_inference_steps" => {
                let text = field.text().await.map_err(|e| invalid(&e))?;
                num_inference_steps = text.parse().map_err(|e: std::num::ParseIntError| {
                    EditError::InputDecode(format!("invalid num_inference_steps: {e}"))
                })?;
            }
            "guidance_scale" => {
                let text = field.text().await.map_err(|e| invalid(&e))?;
                guidance_scale = text.parse().map_err(|e: std::num::ParseFloatError| {
                    EditError::InputDecode(format!("invalid guidance_scale: {e}"))
                })?;
            }
            "true_cfg_scale" => {
                let text = field.text().await.map_err(|e| invalid(&e))?;
                true_cfg_scale = text.parse().map_err(|e: std::num::ParseFloatError| {
                    EditError::InputDecode(format!("invalid true_cfg_scale: {e}"))
                })?;
            }
            "seed" => {
                let text = field.text().await.map_err(|e| invalid(&e))?;
                seed = Some(text.parse().map_err(|e: std::num::ParseIntError| {
                    EditError::InputDecode(format!("invalid seed: {e}"))
                })?);
            }
            _ => {}
        }
    }

    let image = image.ok_or_else(|| EditError::InputDecode("missing image field".to_string()))?;
    let prompt =
        prompt.ok_or_else(|| EditError::InputDecode("missing prompt field".to_string()))?;
    Ok(EditRequest {
        image,
        prompt,
        negative_prompt,
        num_inference_steps,
        guidance_scale,
        true_cfg_scale,
        seed,
    })
}

async fn edit_base64_handler(
    State(state): State<AppState>,
    Json(body): Json<Base64EditRequest>,
) -> Response {
    let image = match BASE64_STANDARD.decode(body.image.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(EditError::InputDecode(format!("invalid base64 image: {e}")))
        }
    };
    let request = EditRequest {
        image,
        prompt: body.prompt,
        negative_prompt: body.negative_prompt,
        num_inference_steps: body.num_inference_steps,
        guidance_scale: body.guidance_scale,
        true_cfg_scale: body.true_cfg_scale,
        seed: body.seed,
    };
    match state.adapter.run(request).await {
        Ok(png) => Json(Base64EditResponse {
            image: BASE64_STANDARD.encode(&png),
            format: "png",
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(err: EditError) -> Response {
    error!(kind = err.kind(), "edit request failed: {err}");
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(serde_json::json!({ "detail": err.to_string() })),
    )
        .into_response()
}

// Build the axum router; CORS is wide open for frontend integration.
fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        .route("/edit", post(edit_handler))
        .route("/edit/base64", post(edit_base64_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let model_config = ModelConfig::new(args.variant, args.preload, args.hf_token);
    let device = if args.cpu {
        DevicePreference::ForceCpu
    } else {
        DevicePreference::default()
    };

    let registry = Arc::new(ModelRegistry::new(ConfiguredLoader::new(
        model_config.clone(),
        device,
    )));
    let adapter = Arc::new(InferenceAdapter::new(registry.clone()));
    let state = AppState {
        registry: registry.clone(),
        adapter,
        variant: model_config.variant,
        accelerator: Arc::new(AcceleratorInfo::probe()),
    };

    if model_config.preload {
        info!("preloading model on startup");
        if let Err(e) = registry.ensure_loaded().await {
            // Keep serving; the first edit request retries the load.
            error!("failed to preload model: {e:#}");
        }
    }

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.teardown().await;
    Ok(())
}
