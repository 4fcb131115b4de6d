//! Variational autoencoder mapping images to latents and back

use candle_core::Tensor;
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// VAE hyperparameters, read from `vae/config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaeConfig {
    /// Image channels in
    pub in_channels: usize,
    /// Image channels out
    pub out_channels: usize,
    /// Channels of each encoder stage
    pub block_out_channels: Vec<usize>,
    /// ResNet layers per encoder stage
    pub layers_per_block: usize,
    /// Latent channels
    pub latent_channels: usize,
    /// Group norm group count
    pub norm_num_groups: usize,
    /// Image size the model was trained at
    pub sample_size: usize,
    /// Latents are multiplied by this after encoding
    pub scaling_factor: f64,
    /// 1x1 convolution after the encoder
    pub use_quant_conv: bool,
    /// 1x1 convolution before the decoder
    pub use_post_quant_conv: bool,
}

impl Default for VaeConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            out_channels: 3,
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 4,
            norm_num_groups: 32,
            sample_size: 512,
            scaling_factor: 0.18215,
            use_quant_conv: true,
            use_post_quant_conv: true,
        }
    }
}

impl VaeConfig {
    /// Load from a diffusers `config.json`
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate channel/group compatibility
    pub fn validate(&self) -> Result<()> {
        if self.block_out_channels.is_empty() {
            return Err(Error::config("block_out_channels must not be empty"));
        }
        if self.norm_num_groups == 0
            || self.block_out_channels.iter().any(|ch| ch % self.norm_num_groups != 0)
        {
            return Err(Error::config(format!(
                "block_out_channels {:?} are not divisible by norm_num_groups {}",
                self.block_out_channels, self.norm_num_groups
            )));
        }
        if self.scaling_factor <= 0.0 {
            return Err(Error::config("scaling_factor must be positive"));
        }
        Ok(())
    }

    /// Spatial ratio between images and latents
    pub fn scale_factor(&self) -> usize {
        1 << self.block_out_channels.len().saturating_sub(1)
    }

    fn autoencoder_config(&self) -> AutoEncoderKLConfig {
        AutoEncoderKLConfig {
            block_out_channels: self.block_out_channels.clone(),
            layers_per_block: self.layers_per_block,
            latent_channels: self.latent_channels,
            norm_num_groups: self.norm_num_groups,
            use_quant_conv: self.use_quant_conv,
            use_post_quant_conv: self.use_post_quant_conv,
        }
    }
}

/// `AutoencoderKL` with its configuration
pub struct VaeModel {
    inner: AutoEncoderKL,
    config: VaeConfig,
}

impl fmt::Debug for VaeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaeModel").field("config", &self.config).finish()
    }
}

impl VaeModel {
    /// Build from `vb` (diffusers `encoder.*` / `decoder.*` names)
    pub fn new(vb: VarBuilder, config: &VaeConfig) -> Result<Self> {
        config.validate()?;
        let inner = AutoEncoderKL::new(
            vb,
            config.in_channels,
            config.out_channels,
            config.autoencoder_config(),
        )?;
        Ok(Self {
            inner,
            config: config.clone(),
        })
    }

    /// Model config
    pub fn config(&self) -> &VaeConfig {
        &self.config
    }

    /// Spatial ratio between images and latents
    pub fn scale_factor(&self) -> usize {
        self.config.scale_factor()
    }

    /// Decode latents already divided by `scaling_factor` to images in `[-1, 1]`
    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        Ok(self.inner.decode(latents)?)
    }

    /// Decode denoiser-space latents, undoing `scaling_factor` first
    pub fn decode_scaled(&self, latents: &Tensor) -> Result<Tensor> {
        self.decode(&(latents / self.config.scaling_factor)?)
    }

    /// Encode images in `[-1, 1]` to scaled latents.
    ///
    /// The posterior is sampled with the device RNG.
    pub fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let posterior = self.inner.encode(images)?;
        Ok((posterior.sample()? * self.config.scaling_factor)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::build_seeded;
    use candle_core::{DType, Device};

    fn tiny() -> VaeConfig {
        VaeConfig {
            block_out_channels: vec![4, 8],
            layers_per_block: 1,
            latent_channels: 4,
            norm_num_groups: 2,
            sample_size: 64,
            ..Default::default()
        }
    }

    #[test]
    fn test_scale_factor() {
        assert_eq!(tiny().scale_factor(), 2);
        assert_eq!(VaeConfig::default().scale_factor(), 8);
    }

    #[test]
    fn test_decode_and_encode_shapes() {
        let config = tiny();
        let (vae, _) = build_seeded(0, DType::F32, &Device::Cpu, |vb| VaeModel::new(vb, &config)).unwrap();

        let latents = Tensor::zeros((1, 4, 16, 16), DType::F32, &Device::Cpu).unwrap();
        let image = vae.decode_scaled(&latents).unwrap();
        assert_eq!(image.dims(), &[1, 3, 32, 32]);

        let encoded = vae.encode(&image).unwrap();
        assert_eq!(encoded.dims(), &[1, 4, 16, 16]);
    }

    #[test]
    fn test_validate_rejects_bad_groups() {
        let config = VaeConfig {
            norm_num_groups: 3,
            ..tiny()
        };
        assert!(config.validate().is_err());
    }
}
