use std::path::PathBuf;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::clip::text_model::{self, ClipTextTransformer};
use candle_transformers::models::flux::autoencoder::{self, AutoEncoder};
use candle_transformers::models::flux::model::{self, Flux};
use candle_transformers::models::flux::sampling as flux_sampling;
use candle_transformers::models::t5::{self, T5EncoderModel};
use image::DynamicImage;
use tokenizers::Tokenizer;

mod sampling;

use crate::device::{select_device, DevicePreference};
use crate::loader::{LoadStrategy, Loader};
use crate::weights::WeightSource;
use crate::{image_to_tensor, snap_to_grid, tensor_to_image, EditRequest, PipelineLike};

const CORE_WEIGHTS_FILE: &str = "flux1-kontext-dev.safetensors";
const AUTOENCODER_FILE: &str = "ae.safetensors";
const T5_REPO: &str = "google/t5-v1_1-xxl";
const T5_REVISION: &str = "refs/pr/2";
const T5_TOKENIZER_REPO: &str = "lmz/mt5-tokenizers";
const T5_TOKENIZER_FILE: &str = "t5-v1_1-xxl.tokenizer.json";
const CLIP_REPO: &str = "openai/clip-vit-large-patch14";
const T5_SEQUENCE_LEN: usize = 256;

/// Instruction-conditioned image-edit pipeline.
///
/// Holds resolved weight artifacts, configs and tokenizers rather than live
/// models: each heavyweight component is materialized from its memory-mapped
/// artifact at the step that needs it and dropped afterward, so peak device
/// residency is one component plus activations.
pub struct EditPipeline {
    device: Device,
    dtype: DType,
    t5_tokenizer: Tokenizer,
    clip_tokenizer: Tokenizer,
    t5_config: t5::Config,
    clip_config: text_model::ClipTextConfig,
    ae_config: autoencoder::Config,
    core_config: model::Config,
    t5_weights: PathBuf,
    clip_weights: PathBuf,
    ae_weights: PathBuf,
    core_weights: PathBuf,
}

impl EditPipeline {
    fn text_encoder(&self) -> Result<T5EncoderModel> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&self.t5_weights], self.dtype, &self.device)
                .context("failed to build T5 var builder")?
        };
        T5EncoderModel::load(vb, &self.t5_config).context("failed to load T5 encoder")
    }

    fn pooled_encoder(&self) -> Result<ClipTextTransformer> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&self.clip_weights], self.dtype, &self.device)
                .context("failed to build CLIP var builder")?
        };
        ClipTextTransformer::new(vb.pp("text_model"), &self.clip_config)
            .context("failed to load CLIP encoder")
    }

    fn autoencoder(&self) -> Result<AutoEncoder> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&self.ae_weights], self.dtype, &self.device)
                .context("failed to build autoencoder var builder")?
        };
        AutoEncoder::new(&self.ae_config, vb).context("failed to load autoencoder")
    }

    fn core(&self) -> Result<Flux> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&self.core_weights], self.dtype, &self.device)
                .context("failed to build transformer var builder")?
        };
        Flux::new(&self.core_config, vb).context("failed to load transformer core")
    }

    /// T5 sequence embedding plus CLIP pooled embedding for one prompt.
    fn encode_text(
        &self,
        t5: &mut T5EncoderModel,
        clip: &ClipTextTransformer,
        prompt: &str,
    ) -> Result<(Tensor, Tensor)> {
        let mut tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(T5_SEQUENCE_LEN, 0);
        let ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        let txt = t5.forward(&ids)?;

        let clip_tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let clip_ids = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let vec_ = clip.forward(&clip_ids)?;
        Ok((txt, vec_))
    }
}

impl PipelineLike for EditPipeline {
    fn run(&self, image: &DynamicImage, request: &EditRequest) -> Result<DynamicImage> {
        if let Some(seed) = request.seed {
            self.device.set_seed(seed)?;
        }

        let (width, height) = snap_to_grid(image.width(), image.height());
        let image = if (width, height) == (image.width(), image.height()) {
            image.clone()
        } else {
            image.resize_exact(width, height, image::imageops::FilterType::CatmullRom)
        };
        let (width, height) = (width as usize, height as usize);

        // --- Text conditioning (encoders resident only for this block) ---
        let (txt, vec_, neg_txt, neg_vec) = {
            let mut t5 = self.text_encoder()?;
            let clip = self.pooled_encoder()?;
            let (txt, vec_) = self.encode_text(&mut t5, &clip, &request.prompt)?;
            let (neg_txt, neg_vec) = self.encode_text(&mut t5, &clip, request.negative_prompt())?;
            (txt, vec_, neg_txt, neg_vec)
        };

        // --- Reference latent from the input image (autoencoder resident) ---
        let reference_latent = {
            let ae = self.autoencoder()?;
            let pixels = image_to_tensor(&image, &self.device)?.to_dtype(self.dtype)?;
            ae.encode(&pixels)?
        };

        // --- Sampling state: fresh noise plus the packed reference tokens ---
        let noise = flux_sampling::get_noise(1, height, width, &self.device)?.to_dtype(self.dtype)?;
        let state = flux_sampling::State::new(&txt, &vec_, &noise)?;
        let neg_state = flux_sampling::State::new(&neg_txt, &neg_vec, &noise)?;
        let reference = sampling::pack_latent(&reference_latent)?.to_dtype(state.img.dtype())?;
        let reference_ids = sampling::reference_ids(&reference_latent, &self.device)?
            .to_dtype(state.img_ids.dtype())?;
        let timesteps =
            flux_sampling::get_schedule(request.num_inference_steps, Some((4096, 0.5, 1.15)));

        // --- Denoise (transformer resident) ---
        let latent = {
            let core = self.core()?;
            sampling::denoise_edit(
                &core,
                &state,
                &neg_state,
                &reference,
                &reference_ids,
                &timesteps,
                request.guidance_scale,
                request.true_cfg_scale,
            )?
        };
        let latent = flux_sampling::unpack(&latent, height, width)?;

        // --- Decode back to pixels (autoencoder resident again) ---
        let decoded = {
            let ae = self.autoencoder()?;
            ae.decode(&latent)?
        };
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }
}

pub struct KontextLoader;

impl Loader for KontextLoader {
    type Model = EditPipeline;

    async fn load(
        strategy: LoadStrategy,
        source: &WeightSource,
        device: DevicePreference,
    ) -> Result<Self::Model> {
        let device = select_device(device).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();

        let base_repo = source.base_repo();

        // --- Core transformer weights: the one strategy-dependent artifact ---
        let core_weights = match strategy {
            LoadStrategy::ReducedPrecision => source
                .fetch_reduced_core()
                .await
                .context("failed to fetch reduced-precision core")?,
            LoadStrategy::Full => base_repo
                .get(CORE_WEIGHTS_FILE)
                .await
                .context("failed to get transformer weights")?,
        };
        let core_config = model::Config::dev();

        // --- Text encoder (T5-XXL) ---
        let t5_repo = source.model_repo_at(T5_REPO, T5_REVISION);
        let t5_weights = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to get T5 weights")?;
        let t5_config_file = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let t5_config_str =
            std::fs::read_to_string(&t5_config_file).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&t5_config_str).context("failed to parse T5 config")?;
        let t5_tokenizer_file = source
            .model_repo(T5_TOKENIZER_REPO)
            .get(T5_TOKENIZER_FILE)
            .await
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- Pooled text encoder (CLIP-L) ---
        let clip_repo = source.model_repo(CLIP_REPO);
        let clip_weights = clip_repo
            .get("model.safetensors")
            .await
            .context("failed to get CLIP weights")?;
        let clip_config = text_model::ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_tokenizer_file = clip_repo
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Autoencoder ---
        let ae_weights = base_repo
            .get(AUTOENCODER_FILE)
            .await
            .context("failed to get autoencoder weights")?;
        let ae_config = autoencoder::Config::dev();

        Ok(EditPipeline {
            device,
            dtype,
            t5_tokenizer,
            clip_tokenizer,
            t5_config,
            clip_config,
            ae_config,
            core_config,
            t5_weights,
            clip_weights,
            ae_weights,
            core_weights,
        })
    }
}
