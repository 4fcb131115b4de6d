//! Latent Consistency Model text-to-image pipeline
//!
//! Prompts are encoded by the CLIP text encoder, the guidance scale is
//! embedded and fed to the UNet through its time-conditioning projection, and
//! a handful of LCM steps turn Gaussian latents into clean latents that the
//! VAE decodes to pixels. There is no classifier-free guidance pass: the
//! distilled UNet receives the guidance scale directly.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use hf_hub::api::tokio::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use image::RgbImage;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array4;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::config::{AppConfig, PipelineConfig};
use crate::error::{Error, Result};
use crate::generator::Generators;
use crate::init::build_seeded;
use crate::models::unet::guidance_scale_embedding;
use crate::models::{ClipTextConfig, ClipTextModel, UNet2DConditionConfig, UNet2DConditionModel, VaeConfig, VaeModel};
use crate::scheduler::{LcmScheduler, LcmSchedulerConfig};
use crate::tokenizer::{PromptTokenizer, SpecialTokens, SPECIAL_TOKENS_MAP};

/// The models and scheduler a pipeline is assembled from
#[derive(Debug)]
pub struct LcmComponents {
    /// Denoising network
    pub unet: UNet2DConditionModel,
    /// Autoencoder
    pub vae: VaeModel,
    /// CLIP text encoder
    pub text_encoder: ClipTextModel,
    /// Prompt tokenizer
    pub tokenizer: PromptTokenizer,
    /// LCM scheduler
    pub scheduler: LcmScheduler,
    /// Device holding the parameters
    pub device: Device,
    /// Parameter dtype
    pub dtype: DType,
    /// Parameters of randomly initialised components, `None` once loaded
    pub weights: Option<ComponentWeights>,
}

/// Variable maps backing randomly initialised models
#[derive(Clone)]
pub struct ComponentWeights {
    /// UNet parameters
    pub unet: VarMap,
    /// VAE parameters
    pub vae: VarMap,
    /// Text encoder parameters
    pub text_encoder: VarMap,
}

impl fmt::Debug for ComponentWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentWeights")
            .field("unet", &self.unet.all_vars().len())
            .field("vae", &self.vae.all_vars().len())
            .field("text_encoder", &self.text_encoder.all_vars().len())
            .finish()
    }
}

impl LcmComponents {
    /// Randomly initialised components, reproducible for a given `seed`
    #[instrument(skip(config, tokenizer, device))]
    pub fn from_config(
        config: &PipelineConfig,
        tokenizer: PromptTokenizer,
        seed: u64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let (unet, unet_weights) =
            build_seeded(seed, dtype, device, |vb| UNet2DConditionModel::new(vb, &config.unet))?;
        let (vae, vae_weights) = build_seeded(seed, dtype, device, |vb| VaeModel::new(vb, &config.vae))?;
        let (text_encoder, text_encoder_weights) =
            build_seeded(seed, dtype, device, |vb| ClipTextModel::new(vb, &config.text_encoder))?;
        let scheduler = LcmScheduler::new(config.scheduler.clone())?;
        debug!("random components initialised");

        Ok(Self {
            unet,
            vae,
            text_encoder,
            tokenizer,
            scheduler,
            device: device.clone(),
            dtype,
            weights: Some(ComponentWeights {
                unet: unet_weights,
                vae: vae_weights,
                text_encoder: text_encoder_weights,
            }),
        })
    }

    /// Write the components to `dir` in the diffusers layout read by
    /// [`LatentConsistencyModelPipeline::from_pretrained`]
    #[instrument(skip_all)]
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let weights = self.weights.as_ref().ok_or_else(|| {
            Error::invalid_input("only randomly initialised components can be saved")
        })?;

        write_json(&dir.join("unet"), "config.json", self.unet.config())?;
        weights
            .unet
            .save(dir.join("unet").join("diffusion_pytorch_model.safetensors"))?;

        write_json(&dir.join("vae"), "config.json", self.vae.config())?;
        weights
            .vae
            .save(dir.join("vae").join("diffusion_pytorch_model.safetensors"))?;

        write_json(&dir.join("text_encoder"), "config.json", self.text_encoder.config())?;
        weights
            .text_encoder
            .save(dir.join("text_encoder").join("model.safetensors"))?;

        write_json(&dir.join("scheduler"), "scheduler_config.json", self.scheduler.config())?;
        self.tokenizer.save(dir.join("tokenizer"))?;

        info!("components saved");
        Ok(())
    }
}

fn write_json<T: serde::Serialize>(dir: &Path, file: &str, value: &T) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(file), serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Options for [`LatentConsistencyModelPipeline::from_pretrained`]
#[derive(Debug, Clone)]
pub struct PretrainedOptions {
    /// Device the weights are loaded to
    pub device: Device,
    /// Parameter dtype
    pub dtype: DType,
    /// Hub revision
    pub revision: Option<String>,
    /// Repository providing `tokenizer.json` when the pipeline only ships
    /// the slow tokenizer files
    pub tokenizer_repo: String,
}

impl Default for PretrainedOptions {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
            revision: None,
            tokenizer_repo: AppConfig::default().tokenizer_repo,
        }
    }
}

impl PretrainedOptions {
    /// Options matching the runtime settings
    pub fn from_app_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            device: config.device()?,
            dtype: config.dtype(),
            revision: config.revision.clone(),
            tokenizer_repo: config.tokenizer_repo.clone(),
        })
    }
}

enum ModelSource {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl ModelSource {
    fn open(model_id: &str, revision: Option<&str>) -> Result<Self> {
        let path = Path::new(model_id);
        if path.is_dir() {
            return Ok(Self::Local(path.to_path_buf()));
        }
        let api = Api::new()?;
        let repo = match revision {
            Some(rev) => Repo::with_revision(model_id.to_string(), RepoType::Model, rev.to_string()),
            None => Repo::model(model_id.to_string()),
        };
        Ok(Self::Hub(api.repo(repo)))
    }

    async fn get(&self, file: &str) -> Result<PathBuf> {
        match self {
            Self::Local(root) => {
                let path = root.join(file);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(Error::model_loading(format!("{} not found", path.display())))
                }
            }
            Self::Hub(repo) => Ok(repo.get(file).await?),
        }
    }

    async fn weights(&self, file: &str, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
        let path = self.get(file).await?;
        debug!(path = %path.display(), "loading weights");
        let tensors = candle_core::safetensors::load(&path, device)?;
        Ok(VarBuilder::from_tensors(tensors, dtype, device))
    }
}

/// Progress bar settings for the denoising loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressBarConfig {
    /// Hide the bar
    pub disable: bool,
}

/// Per-step hook receiving `(step, timestep, latents)`
pub type StepCallback = Box<dyn FnMut(usize, usize, &Tensor)>;

/// Requested output representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputType {
    /// NHWC `f32` array in `[0, 1]`
    Np,
    /// 8-bit RGB images
    #[default]
    Pil,
    /// NCHW tensor in `[0, 1]`
    Pt,
    /// Final denoised latents, not decoded
    Latent,
}

/// Arguments of a pipeline call
pub struct LcmInputs {
    /// Prompts; exactly one of `prompt` and `prompt_embeds` must be set
    pub prompt: Option<Vec<String>>,
    /// Precomputed text embeddings `(b, seq, hidden)`
    pub prompt_embeds: Option<Tensor>,
    /// Image height in pixels, defaults to `sample_size * vae_scale_factor`
    pub height: Option<usize>,
    /// Image width in pixels, defaults to `sample_size * vae_scale_factor`
    pub width: Option<usize>,
    /// Denoising steps, ignored when `timesteps` is set
    pub num_inference_steps: usize,
    /// Overrides the scheduler's distillation grid length
    pub original_inference_steps: Option<usize>,
    /// Custom descending timesteps
    pub timesteps: Option<Vec<usize>>,
    /// Guidance scale embedded into the UNet
    pub guidance_scale: f64,
    /// Images generated per prompt
    pub num_images_per_prompt: usize,
    /// Random sources for the latents and the re-noising
    pub generators: Generators,
    /// Starting latents instead of sampled noise
    pub latents: Option<Tensor>,
    /// Output representation
    pub output_type: OutputType,
    /// Text encoder layers to skip from the end
    pub clip_skip: Option<usize>,
    /// Called after every step
    pub callback: Option<StepCallback>,
}

impl Default for LcmInputs {
    fn default() -> Self {
        Self {
            prompt: None,
            prompt_embeds: None,
            height: None,
            width: None,
            num_inference_steps: 4,
            original_inference_steps: None,
            timesteps: None,
            guidance_scale: 8.5,
            num_images_per_prompt: 1,
            generators: Generators::default(),
            latents: None,
            output_type: OutputType::default(),
            clip_skip: None,
            callback: None,
        }
    }
}

impl fmt::Debug for LcmInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LcmInputs")
            .field("prompt", &self.prompt)
            .field("has_prompt_embeds", &self.prompt_embeds.is_some())
            .field("height", &self.height)
            .field("width", &self.width)
            .field("num_inference_steps", &self.num_inference_steps)
            .field("timesteps", &self.timesteps)
            .field("guidance_scale", &self.guidance_scale)
            .field("num_images_per_prompt", &self.num_images_per_prompt)
            .field("output_type", &self.output_type)
            .finish_non_exhaustive()
    }
}

impl LcmInputs {
    /// Inputs for a single prompt
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(vec![prompt.into()]),
            ..Default::default()
        }
    }

    /// Inputs for a batch of prompts
    pub fn prompts<S: Into<String>>(prompts: impl IntoIterator<Item = S>) -> Self {
        Self {
            prompt: Some(prompts.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }
}

/// Generated images
#[derive(Debug, Clone)]
pub enum Images {
    /// NHWC array in `[0, 1]`
    Np(Array4<f32>),
    /// 8-bit RGB images
    Pil(Vec<RgbImage>),
    /// NCHW tensor in `[0, 1]`
    Pt(Tensor),
    /// Undecoded latents
    Latent(Tensor),
}

impl Images {
    /// The NHWC array, if that was requested
    pub fn as_np(&self) -> Option<&Array4<f32>> {
        match self {
            Self::Np(array) => Some(array),
            _ => None,
        }
    }

    /// The RGB images, if those were requested
    pub fn as_pil(&self) -> Option<&[RgbImage]> {
        match self {
            Self::Pil(images) => Some(images),
            _ => None,
        }
    }

    /// The image or latent tensor, if one was requested
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Pt(t) | Self::Latent(t) => Some(t),
            _ => None,
        }
    }

    /// Number of images
    pub fn len(&self) -> usize {
        match self {
            Self::Np(array) => array.shape()[0],
            Self::Pil(images) => images.len(),
            Self::Pt(t) | Self::Latent(t) => t.dims().first().copied().unwrap_or(0),
        }
    }

    /// Whether no image was produced
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pipeline result
#[derive(Debug, Clone)]
pub struct LcmOutput {
    /// Generated images
    pub images: Images,
}

/// Text-to-image generation with a latent consistency model
pub struct LatentConsistencyModelPipeline {
    unet: UNet2DConditionModel,
    vae: VaeModel,
    text_encoder: ClipTextModel,
    tokenizer: PromptTokenizer,
    scheduler: LcmScheduler,
    device: Device,
    dtype: DType,
    progress: ProgressBarConfig,
}

impl fmt::Debug for LatentConsistencyModelPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatentConsistencyModelPipeline")
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("scheduler", &self.scheduler.config())
            .finish_non_exhaustive()
    }
}

impl LatentConsistencyModelPipeline {
    /// Assemble a pipeline from loaded components
    pub fn new(components: LcmComponents) -> Self {
        let LcmComponents {
            unet,
            vae,
            text_encoder,
            tokenizer,
            scheduler,
            device,
            dtype,
            ..
        } = components;
        if unet.time_cond_proj_dim().is_none() {
            warn!("UNet has no time_cond_proj_dim, the guidance scale will be ignored");
        }
        Self {
            unet,
            vae,
            text_encoder,
            tokenizer,
            scheduler,
            device,
            dtype,
            progress: ProgressBarConfig::default(),
        }
    }

    /// Load a diffusers-layout pipeline from the hub or a local directory
    #[instrument(skip(options), fields(device = ?options.device, dtype = ?options.dtype))]
    pub async fn from_pretrained(model_id: &str, options: PretrainedOptions) -> Result<Self> {
        info!("Loading LCM pipeline");
        let source = ModelSource::open(model_id, options.revision.as_deref())?;
        let device = &options.device;
        let dtype = options.dtype;

        let unet_config = UNet2DConditionConfig::from_file(source.get("unet/config.json").await?)?;
        let vb = source
            .weights("unet/diffusion_pytorch_model.safetensors", dtype, device)
            .await?;
        let unet = UNet2DConditionModel::new(vb, &unet_config)?;
        debug!("UNet loaded");

        let vae_config = VaeConfig::from_file(source.get("vae/config.json").await?)?;
        let vb = source
            .weights("vae/diffusion_pytorch_model.safetensors", dtype, device)
            .await?;
        let vae = VaeModel::new(vb, &vae_config)?;
        debug!("VAE loaded");

        let text_config = ClipTextConfig::from_file(source.get("text_encoder/config.json").await?)?;
        let vb = source.weights("text_encoder/model.safetensors", dtype, device).await?;
        let text_encoder = ClipTextModel::new(vb, &text_config)?;
        debug!("text encoder loaded");

        let scheduler_config =
            LcmSchedulerConfig::from_file(source.get("scheduler/scheduler_config.json").await?)?;
        let scheduler = LcmScheduler::new(scheduler_config)?;

        let tokenizer_file = match source.get("tokenizer/tokenizer.json").await {
            Ok(path) => path,
            Err(e) => {
                debug!(error = %e, repo = %options.tokenizer_repo, "falling back to tokenizer repo");
                Api::new()?
                    .model(options.tokenizer_repo.clone())
                    .get("tokenizer.json")
                    .await?
            }
        };
        let special = match source.get(&format!("tokenizer/{SPECIAL_TOKENS_MAP}")).await {
            Ok(path) => SpecialTokens::from_special_tokens_map(path)?,
            Err(e) => {
                debug!(error = %e, "no special token map, using CLIP defaults");
                SpecialTokens::default()
            }
        };
        let tokenizer =
            PromptTokenizer::from_file(tokenizer_file, &special, text_config.max_position_embeddings)?;

        info!("LCM pipeline loaded");
        Ok(Self::new(LcmComponents {
            unet,
            vae,
            text_encoder,
            tokenizer,
            scheduler,
            device: options.device.clone(),
            dtype,
            weights: None,
        }))
    }

    /// Replace the scheduler
    pub fn set_scheduler(&mut self, scheduler: LcmScheduler) {
        self.scheduler = scheduler;
    }

    /// Current scheduler configuration
    pub fn scheduler_config(&self) -> &LcmSchedulerConfig {
        self.scheduler.config()
    }

    /// Scheduler state after the last call
    pub fn scheduler(&self) -> &LcmScheduler {
        &self.scheduler
    }

    /// Configure the denoising progress bar
    pub fn set_progress_bar_config(&mut self, config: ProgressBarConfig) {
        self.progress = config;
    }

    /// Denoising network
    pub fn unet(&self) -> &UNet2DConditionModel {
        &self.unet
    }

    /// Autoencoder
    pub fn vae(&self) -> &VaeModel {
        &self.vae
    }

    /// Text encoder
    pub fn text_encoder(&self) -> &ClipTextModel {
        &self.text_encoder
    }

    /// Prompt tokenizer
    pub fn tokenizer(&self) -> &PromptTokenizer {
        &self.tokenizer
    }

    /// Device holding the parameters
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Parameter dtype
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Spatial ratio between images and latents
    pub fn vae_scale_factor(&self) -> usize {
        self.vae.scale_factor()
    }

    /// Image size used when the call leaves height or width unset
    pub fn default_image_size(&self) -> usize {
        self.unet.config().sample_size * self.vae_scale_factor()
    }

    /// Text embeddings for `prompts`, each repeated `num_images_per_prompt` times
    pub fn encode_prompt<S: AsRef<str>>(
        &self,
        prompts: &[S],
        num_images_per_prompt: usize,
        clip_skip: Option<usize>,
    ) -> Result<Tensor> {
        let ids = self.tokenizer.encode_batch(prompts, &self.device)?;
        let embeds = self.text_encoder.forward_with_skip(&ids, clip_skip)?;
        repeat_per_prompt(&embeds.to_dtype(self.dtype)?, num_images_per_prompt)
    }

    fn check_inputs(&self, inputs: &LcmInputs, height: usize, width: usize) -> Result<()> {
        if height % 8 != 0 || width % 8 != 0 {
            return Err(Error::invalid_input(format!(
                "height and width have to be divisible by 8 but are {height} and {width}"
            )));
        }
        match (&inputs.prompt, &inputs.prompt_embeds) {
            (Some(_), Some(_)) => {
                return Err(Error::invalid_input(
                    "cannot forward both prompt and prompt_embeds, only one of them",
                ))
            }
            (None, None) => {
                return Err(Error::invalid_input(
                    "provide either prompt or prompt_embeds, neither was given",
                ))
            }
            (Some(prompts), None) if prompts.is_empty() => {
                return Err(Error::invalid_input("prompt list must not be empty"))
            }
            (None, Some(embeds)) => {
                let (_, _, hidden) = embeds.dims3()?;
                if hidden != self.text_encoder.hidden_size() {
                    return Err(Error::invalid_input(format!(
                        "prompt_embeds width {hidden} does not match the text encoder width {}",
                        self.text_encoder.hidden_size()
                    )));
                }
            }
            _ => {}
        }
        if inputs.num_images_per_prompt == 0 {
            return Err(Error::invalid_input("num_images_per_prompt must be > 0"));
        }
        match &inputs.timesteps {
            Some(ts) if ts.is_empty() => {
                return Err(Error::invalid_input("custom timesteps must not be empty"))
            }
            None if inputs.num_inference_steps == 0 => {
                return Err(Error::invalid_input("num_inference_steps must be > 0"))
            }
            _ => {}
        }
        if !inputs.guidance_scale.is_finite() {
            return Err(Error::invalid_input("guidance_scale must be finite"));
        }
        Ok(())
    }

    fn prepare_latents(
        &self,
        batch: usize,
        height: usize,
        width: usize,
        latents: Option<Tensor>,
        generators: &mut Generators,
    ) -> Result<Tensor> {
        let factor = self.vae_scale_factor();
        let shape = [batch, self.unet.config().in_channels, height / factor, width / factor];
        let latents = match latents {
            Some(latents) => {
                if latents.dims() != shape {
                    return Err(Error::invalid_input(format!(
                        "unexpected latents shape, got {:?}, expected {shape:?}",
                        latents.dims()
                    )));
                }
                latents.to_device(&self.device)?.to_dtype(self.dtype)?
            }
            None => generators.randn(&shape, self.dtype, &self.device)?,
        };
        Ok((latents * self.scheduler.init_noise_sigma())?)
    }

    fn progress_bar(&self, steps: usize) -> Result<ProgressBar> {
        if self.progress.disable {
            return Ok(ProgressBar::hidden());
        }
        let bar = ProgressBar::new(steps as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .map_err(|e| Error::internal(e.to_string()))?
                .progress_chars("█▇▆▅▄▃▂▁  "),
        );
        bar.set_message("denoising");
        Ok(bar)
    }

    /// Generate images
    #[instrument(skip_all, fields(steps = inputs.num_inference_steps, guidance = inputs.guidance_scale))]
    pub fn call(&mut self, inputs: LcmInputs) -> Result<LcmOutput> {
        let default_size = self.default_image_size();
        let height = inputs.height.unwrap_or(default_size);
        let width = inputs.width.unwrap_or(default_size);
        self.check_inputs(&inputs, height, width)?;

        let LcmInputs {
            prompt,
            prompt_embeds,
            num_inference_steps,
            original_inference_steps,
            timesteps,
            guidance_scale,
            num_images_per_prompt,
            mut generators,
            latents,
            output_type,
            clip_skip,
            mut callback,
            ..
        } = inputs;

        let prompt_embeds = match (prompt, prompt_embeds) {
            (Some(prompts), _) => self.encode_prompt(&prompts, num_images_per_prompt, clip_skip)?,
            (None, Some(embeds)) => repeat_per_prompt(
                &embeds.to_device(&self.device)?.to_dtype(self.dtype)?,
                num_images_per_prompt,
            )?,
            (None, None) => return Err(Error::invalid_input("no prompt given")),
        };
        let batch = prompt_embeds.dim(0)?;
        generators.check_batch(batch)?;

        match &timesteps {
            Some(custom) => self
                .scheduler
                .set_timesteps(None, original_inference_steps, Some(custom), 1.0)?,
            None => self.scheduler.set_timesteps(
                Some(num_inference_steps),
                original_inference_steps,
                None,
                1.0,
            )?,
        }
        let timesteps = self.scheduler.timesteps().to_vec();
        debug!(?timesteps, batch, height, width, "denoising");

        let mut latents = self.prepare_latents(batch, height, width, latents, &mut generators)?;

        let w = guidance_weights(guidance_scale, batch);
        let w_embedding = self
            .unet
            .time_cond_proj_dim()
            .map(|dim| guidance_scale_embedding(&w, dim, self.dtype, &self.device))
            .transpose()?;

        let bar = self.progress_bar(timesteps.len())?;
        let mut denoised = latents.clone();
        for (i, &t) in timesteps.iter().enumerate() {
            let model_input = self.scheduler.scale_model_input(&latents, t)?;
            let model_pred = self
                .unet
                .forward(&model_input, t as f64, &prompt_embeds, w_embedding.as_ref())?;
            let output = self.scheduler.step(&model_pred, t, &latents, &mut generators)?;
            latents = output.prev_sample;
            denoised = output.denoised;
            if let Some(callback) = callback.as_mut() {
                callback(i, t, &latents);
            }
            bar.inc(1);
        }
        bar.finish_and_clear();

        let images = match output_type {
            OutputType::Latent => Images::Latent(denoised),
            kind => {
                let decoded = self.vae.decode_scaled(&denoised.to_dtype(self.dtype)?)?;
                postprocess(&decoded, kind)?
            }
        };
        info!(images = images.len(), "generation finished");
        Ok(LcmOutput { images })
    }
}

/// Guidance weight fed to the UNet: `w = guidance_scale - 1`, so that a scale
/// of 1 means no guidance
fn guidance_weights(guidance_scale: f64, batch: usize) -> Vec<f32> {
    vec![(guidance_scale - 1.0) as f32; batch]
}

fn repeat_per_prompt(embeds: &Tensor, n: usize) -> Result<Tensor> {
    if n == 1 {
        return Ok(embeds.clone());
    }
    let (b, seq, hidden) = embeds.dims3()?;
    Ok(embeds
        .unsqueeze(1)?
        .repeat((1, n, 1, 1))?
        .reshape((b * n, seq, hidden))?)
}

/// Map decoded images from `[-1, 1]` to `[0, 1]` in the requested layout
fn postprocess(decoded: &Tensor, output_type: OutputType) -> Result<Images> {
    let image = ((decoded.to_dtype(DType::F32)? / 2.0)? + 0.5)?.clamp(0f32, 1f32)?;
    if output_type == OutputType::Pt {
        return Ok(Images::Pt(image));
    }

    let (b, c, h, w) = image.dims4()?;
    let nhwc = image.permute((0, 2, 3, 1))?.flatten_all()?.to_vec1::<f32>()?;
    match output_type {
        OutputType::Pil => {
            let frame = h * w * c;
            nhwc.chunks(frame)
                .map(|pixels| {
                    let bytes = pixels.iter().map(|v| (v * 255.0).round() as u8).collect();
                    RgbImage::from_raw(w as u32, h as u32, bytes)
                        .ok_or_else(|| Error::internal("decoded image does not have 3 channels"))
                })
                .collect::<Result<Vec<_>>>()
                .map(Images::Pil)
        }
        _ => Ok(Images::Np(Array4::from_shape_vec((b, h, w, c), nhwc)?)),
    }
}
