//! Configuration structures for the LCM pipeline

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::models::{ClipTextConfig, UNet2DConditionConfig, VaeConfig};
use crate::scheduler::LcmSchedulerConfig;
use crate::tokenizer::{SpecialTokens, DEFAULT_MAX_LENGTH};

/// Hyperparameters of every pipeline component
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Denoising network
    pub unet: UNet2DConditionConfig,
    /// Autoencoder
    pub vae: VaeConfig,
    /// Text encoder
    pub text_encoder: ClipTextConfig,
    /// Noise scheduler
    pub scheduler: LcmSchedulerConfig,
    /// Tokenizer settings
    pub tokenizer: TokenizerConfig,
}

/// Tokenizer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    /// Padded prompt length
    pub max_length: usize,
    /// Special tokens
    pub special_tokens: SpecialTokens,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            special_tokens: SpecialTokens::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate each component and the wiring between them
    pub fn validate(&self) -> Result<()> {
        self.unet.validate()?;
        self.vae.validate()?;
        self.text_encoder.validate()?;
        self.scheduler.validate()?;

        if self.unet.cross_attention_dim != self.text_encoder.hidden_size {
            return Err(Error::config(format!(
                "UNet cross_attention_dim {} must match text encoder hidden_size {}",
                self.unet.cross_attention_dim, self.text_encoder.hidden_size
            )));
        }
        if self.unet.in_channels != self.vae.latent_channels {
            return Err(Error::config(format!(
                "UNet in_channels {} must match VAE latent_channels {}",
                self.unet.in_channels, self.vae.latent_channels
            )));
        }
        if self.tokenizer.max_length > self.text_encoder.max_position_embeddings {
            return Err(Error::config(format!(
                "tokenizer max_length {} exceeds text encoder max_position_embeddings {}",
                self.tokenizer.max_length, self.text_encoder.max_position_embeddings
            )));
        }

        Ok(())
    }

    /// Default output height and width in pixels
    pub fn default_image_size(&self) -> usize {
        self.unet.sample_size * self.vae.scale_factor()
    }
}

/// Compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Host CPU
    Cpu,
    /// NVIDIA GPU (requires the `cuda` feature)
    Cuda,
    /// Apple GPU (requires the `metal` feature)
    Metal,
}

/// Parameter precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit float
    F32,
    /// 16-bit float
    F16,
    /// bfloat16
    Bf16,
}

impl From<Precision> for DType {
    fn from(precision: Precision) -> Self {
        match precision {
            Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

/// Runtime settings of the `lcm` binary
///
/// Layered lowest to highest: built-in defaults, an optional config file,
/// `LCM_*` environment variables, then command line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Hub repository or local directory holding the pipeline
    pub model_id: String,
    /// Hub revision
    pub revision: Option<String>,
    /// Repository providing `tokenizer.json` when the pipeline lacks one
    pub tokenizer_repo: String,
    /// Compute device
    pub device: DeviceKind,
    /// Device ordinal for GPUs
    pub device_ordinal: usize,
    /// Parameter precision
    pub precision: Precision,
    /// Denoising steps
    pub num_inference_steps: usize,
    /// Classifier-free guidance scale embedded into the UNet
    pub guidance_scale: f64,
    /// Random seed
    pub seed: u64,
    /// Where generated images are written
    pub output_dir: PathBuf,
    /// Emit logs as JSON
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model_id: "SimianLuo/LCM_Dreamshaper_v7".to_string(),
            revision: None,
            tokenizer_repo: "openai/clip-vit-base-patch32".to_string(),
            device: DeviceKind::Cpu,
            device_ordinal: 0,
            precision: Precision::F32,
            num_inference_steps: 4,
            guidance_scale: 8.0,
            seed: 0,
            output_dir: PathBuf::from("."),
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Load defaults, then `file` (if given, otherwise `lcm.{toml,json,yaml}`
    /// when present), then `LCM_*` environment variables
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let builder = config::Config::builder();
        let builder = match file {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("lcm").required(false)),
        };
        let settings = builder
            .add_source(config::Environment::with_prefix("LCM").try_parsing(true))
            .build()
            .map_err(|e| Error::config(e.to_string()))?;
        let config: Self = settings
            .try_deserialize()
            .map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate runtime settings
    pub fn validate(&self) -> Result<()> {
        if self.model_id.is_empty() {
            return Err(Error::config("model_id must not be empty"));
        }
        if self.num_inference_steps == 0 {
            return Err(Error::config("num_inference_steps must be > 0"));
        }
        if !self.guidance_scale.is_finite() {
            return Err(Error::config("guidance_scale must be finite"));
        }
        Ok(())
    }

    /// Open the configured device
    pub fn device(&self) -> Result<Device> {
        let device = match self.device {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Cuda => Device::new_cuda(self.device_ordinal)?,
            DeviceKind::Metal => Device::new_metal(self.device_ordinal)?,
        };
        Ok(device)
    }

    /// Parameter dtype
    pub fn dtype(&self) -> DType {
        self.precision.into()
    }
}
