//! Conditional 2D UNet with guidance-scale time conditioning
//!
//! Layout and parameter names follow the diffusers `UNet2DConditionModel`, so
//! a `diffusion_pytorch_model.safetensors` checkpoint loads without renaming.
//! The time embedding accepts an extra conditioning vector (`cond_proj`),
//! which is how distilled LCM checkpoints receive the guidance scale.

pub mod attention;
pub mod blocks;
pub mod embeddings;
pub mod resnet;

use candle_core::{Tensor, D};
use candle_nn::{Activation, Conv2d, Conv2dConfig, GroupNorm, Module, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use blocks::{CrossAttnConfig, DownBlock, MidBlock, UpBlock};
use embeddings::{TimestepEmbedding, Timesteps};
use resnet::ResnetConfig;

pub use embeddings::guidance_scale_embedding;

/// A value given once for all blocks or once per block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerBlock<T> {
    /// Same value for every block
    Single(T),
    /// One value per down block
    Each(Vec<T>),
}

impl<T: Clone> PerBlock<T> {
    /// Expand to one value per block
    pub fn expand(&self, blocks: usize) -> Result<Vec<T>> {
        match self {
            Self::Single(value) => Ok(vec![value.clone(); blocks]),
            Self::Each(values) if values.len() == blocks => Ok(values.clone()),
            Self::Each(values) => Err(Error::config(format!(
                "expected {blocks} per-block values, got {}",
                values.len()
            ))),
        }
    }
}

/// Down stage kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownBlockType {
    /// ResNet layers only
    DownBlock2D,
    /// ResNet layers each followed by a spatial transformer
    CrossAttnDownBlock2D,
}

/// Up stage kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpBlockType {
    /// ResNet layers only
    UpBlock2D,
    /// ResNet layers each followed by a spatial transformer
    CrossAttnUpBlock2D,
}

/// Mid stage kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MidBlockType {
    /// ResNet, then alternating transformer and ResNet layers
    UNetMidBlock2DCrossAttn,
}

/// UNet hyperparameters, read from `unet/config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UNet2DConditionConfig {
    /// Latent height and width the model was trained at
    pub sample_size: usize,
    /// Latent channels in
    pub in_channels: usize,
    /// Channels out
    pub out_channels: usize,
    /// Map the input from [0, 1] to [-1, 1]
    pub center_input_sample: bool,
    /// Cosine first in the timestep embedding
    pub flip_sin_to_cos: bool,
    /// Frequency shift of the timestep embedding
    pub freq_shift: f64,
    /// Down stage kinds
    pub down_block_types: Vec<DownBlockType>,
    /// Mid stage kind, `None` to skip the bottleneck
    pub mid_block_type: Option<MidBlockType>,
    /// Up stage kinds
    pub up_block_types: Vec<UpBlockType>,
    /// Output channels of each down stage
    pub block_out_channels: Vec<usize>,
    /// ResNet layers per down stage (up stages get one more)
    pub layers_per_block: usize,
    /// Padding of the downsampling convolutions
    pub downsample_padding: usize,
    /// Residual divisor in the mid stage
    pub mid_block_scale_factor: f64,
    /// Activation of the time embedding MLP
    pub act_fn: Activation,
    /// Group norm group count
    pub norm_num_groups: usize,
    /// Group norm epsilon
    pub norm_eps: f64,
    /// Width of the encoder hidden states
    pub cross_attention_dim: usize,
    /// Transformer blocks per attention layer
    pub transformer_layers_per_block: usize,
    /// Attention heads per stage (named after its historical misuse)
    pub attention_head_dim: PerBlock<usize>,
    /// Attention heads per stage, overrides `attention_head_dim`
    pub num_attention_heads: Option<PerBlock<usize>>,
    /// Linear instead of convolutional transformer projections
    pub use_linear_projection: bool,
    /// Width of the time-conditioning input (guidance embedding)
    pub time_cond_proj_dim: Option<usize>,
}

impl Default for UNet2DConditionConfig {
    fn default() -> Self {
        Self {
            sample_size: 64,
            in_channels: 4,
            out_channels: 4,
            center_input_sample: false,
            flip_sin_to_cos: true,
            freq_shift: 0.0,
            down_block_types: vec![
                DownBlockType::CrossAttnDownBlock2D,
                DownBlockType::CrossAttnDownBlock2D,
                DownBlockType::CrossAttnDownBlock2D,
                DownBlockType::DownBlock2D,
            ],
            mid_block_type: Some(MidBlockType::UNetMidBlock2DCrossAttn),
            up_block_types: vec![
                UpBlockType::UpBlock2D,
                UpBlockType::CrossAttnUpBlock2D,
                UpBlockType::CrossAttnUpBlock2D,
                UpBlockType::CrossAttnUpBlock2D,
            ],
            block_out_channels: vec![320, 640, 1280, 1280],
            layers_per_block: 2,
            downsample_padding: 1,
            mid_block_scale_factor: 1.0,
            act_fn: Activation::Silu,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            cross_attention_dim: 768,
            transformer_layers_per_block: 1,
            attention_head_dim: PerBlock::Single(8),
            num_attention_heads: None,
            use_linear_projection: false,
            time_cond_proj_dim: None,
        }
    }
}

impl UNet2DConditionConfig {
    /// Load from a diffusers `config.json`
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate block layout and channel/group compatibility
    pub fn validate(&self) -> Result<()> {
        let n = self.block_out_channels.len();
        if n == 0 {
            return Err(Error::config("block_out_channels must not be empty"));
        }
        if self.down_block_types.len() != n {
            return Err(Error::config(format!(
                "{} down blocks for {n} block_out_channels",
                self.down_block_types.len()
            )));
        }
        if self.up_block_types.len() != n {
            return Err(Error::config(format!(
                "{} up blocks for {n} block_out_channels",
                self.up_block_types.len()
            )));
        }
        if self.layers_per_block == 0 {
            return Err(Error::config("layers_per_block must be > 0"));
        }
        if self.norm_num_groups == 0 {
            return Err(Error::config("norm_num_groups must be > 0"));
        }
        if let Some(ch) = self
            .block_out_channels
            .iter()
            .find(|ch| **ch % self.norm_num_groups != 0)
        {
            return Err(Error::config(format!(
                "block channel count {ch} is not divisible by norm_num_groups {}",
                self.norm_num_groups
            )));
        }
        self.heads()?;
        Ok(())
    }

    /// Attention heads per down stage
    pub fn heads(&self) -> Result<Vec<usize>> {
        let n = self.block_out_channels.len();
        self.num_attention_heads
            .as_ref()
            .unwrap_or(&self.attention_head_dim)
            .expand(n)
    }

    /// Width of the time embedding
    pub fn time_embed_dim(&self) -> usize {
        self.block_out_channels[0] * 4
    }
}

/// Conditional UNet noise predictor
#[derive(Debug, Clone)]
pub struct UNet2DConditionModel {
    config: UNet2DConditionConfig,
    conv_in: Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<DownBlock>,
    mid_block: Option<MidBlock>,
    up_blocks: Vec<UpBlock>,
    conv_norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl UNet2DConditionModel {
    /// Build the UNet from `vb`
    pub fn new(vb: VarBuilder, config: &UNet2DConditionConfig) -> Result<Self> {
        config.validate()?;

        let channels = &config.block_out_channels;
        let n = channels.len();
        let heads = config.heads()?;
        let time_embed_dim = config.time_embed_dim();
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let conv_in = candle_nn::conv2d(config.in_channels, channels[0], 3, conv_cfg, vb.pp("conv_in"))?;
        let time_proj = Timesteps::new(channels[0], config.flip_sin_to_cos, config.freq_shift);
        let time_embedding = TimestepEmbedding::new(
            vb.pp("time_embedding"),
            channels[0],
            time_embed_dim,
            config.time_cond_proj_dim,
            config.act_fn,
        )?;

        let resnet = ResnetConfig {
            groups: config.norm_num_groups,
            eps: config.norm_eps,
            temb_channels: Some(time_embed_dim),
            output_scale_factor: 1.0,
        };
        let cross_attn = |heads: usize| CrossAttnConfig {
            heads,
            cross_attention_dim: config.cross_attention_dim,
            use_linear_projection: config.use_linear_projection,
            transformer_layers: config.transformer_layers_per_block,
        };

        let mut down_blocks = Vec::with_capacity(n);
        let mut output_channel = channels[0];
        for (i, kind) in config.down_block_types.iter().enumerate() {
            let input_channel = output_channel;
            output_channel = channels[i];
            let attn = match kind {
                DownBlockType::DownBlock2D => None,
                DownBlockType::CrossAttnDownBlock2D => Some(cross_attn(heads[i])),
            };
            down_blocks.push(DownBlock::new(
                vb.pp("down_blocks").pp(i.to_string()),
                input_channel,
                output_channel,
                config.layers_per_block,
                resnet,
                attn,
                i + 1 < n,
                config.downsample_padding,
            )?);
        }

        let mid_block = match config.mid_block_type {
            Some(MidBlockType::UNetMidBlock2DCrossAttn) => Some(MidBlock::new(
                vb.pp("mid_block"),
                channels[n - 1],
                1,
                ResnetConfig {
                    output_scale_factor: config.mid_block_scale_factor,
                    ..resnet
                },
                cross_attn(heads[n - 1]),
            )?),
            None => None,
        };

        let reversed_channels: Vec<usize> = channels.iter().rev().copied().collect();
        let reversed_heads: Vec<usize> = heads.iter().rev().copied().collect();
        let mut up_blocks = Vec::with_capacity(n);
        let mut output_channel = reversed_channels[0];
        for (i, kind) in config.up_block_types.iter().enumerate() {
            let prev_output_channel = output_channel;
            output_channel = reversed_channels[i];
            let input_channel = reversed_channels[(i + 1).min(n - 1)];
            let attn = match kind {
                UpBlockType::UpBlock2D => None,
                UpBlockType::CrossAttnUpBlock2D => Some(cross_attn(reversed_heads[i])),
            };
            up_blocks.push(UpBlock::new(
                vb.pp("up_blocks").pp(i.to_string()),
                input_channel,
                prev_output_channel,
                output_channel,
                config.layers_per_block + 1,
                resnet,
                attn,
                i + 1 < n,
            )?);
        }

        let conv_norm_out = candle_nn::group_norm(
            config.norm_num_groups,
            channels[0],
            config.norm_eps,
            vb.pp("conv_norm_out"),
        )?;
        let conv_out = candle_nn::conv2d(channels[0], config.out_channels, 3, conv_cfg, vb.pp("conv_out"))?;

        debug!(
            stages = n,
            time_cond_proj_dim = ?config.time_cond_proj_dim,
            "UNet built"
        );

        Ok(Self {
            config: config.clone(),
            conv_in,
            time_proj,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
        })
    }

    /// Model config
    pub fn config(&self) -> &UNet2DConditionConfig {
        &self.config
    }

    /// Width of the guidance conditioning input, if any
    pub fn time_cond_proj_dim(&self) -> Option<usize> {
        self.config.time_cond_proj_dim
    }

    /// Predict noise for `sample` at `timestep`.
    ///
    /// `encoder_hidden_states` is `(b, seq, cross_attention_dim)`;
    /// `timestep_cond` is `(b, time_cond_proj_dim)` for guidance-distilled
    /// checkpoints.
    #[instrument(level = "trace", skip_all, fields(timestep = timestep))]
    pub fn forward(
        &self,
        sample: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        timestep_cond: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch, _, height, width) = sample.dims4()?;
        let dtype = sample.dtype();
        let device = sample.device();

        let upsample_factor = 1usize << (self.up_blocks.len().saturating_sub(1));
        let forward_upsample_size = height % upsample_factor != 0 || width % upsample_factor != 0;

        let sample = if self.config.center_input_sample {
            sample.affine(2.0, -1.0)?
        } else {
            sample.clone()
        };

        let timesteps = Tensor::full(timestep as f32, batch, device)?;
        let t_emb = self.time_proj.forward(&timesteps)?.to_dtype(dtype)?;
        let emb = self.time_embedding.forward(&t_emb, timestep_cond)?;

        let mut xs = self.conv_in.forward(&sample)?;
        let mut skips = vec![xs.clone()];
        for block in &self.down_blocks {
            let (out, states) = block.forward(&xs, &emb, encoder_hidden_states)?;
            xs = out;
            skips.extend(states);
        }

        if let Some(mid) = &self.mid_block {
            xs = mid.forward(&xs, &emb, encoder_hidden_states)?;
        }

        let last = self.up_blocks.len().saturating_sub(1);
        for (i, block) in self.up_blocks.iter().enumerate() {
            let split = skips.len().checked_sub(block.num_layers()).ok_or_else(|| {
                Error::internal("not enough skip states for the up blocks")
            })?;
            let block_skips = skips.split_off(split);
            let upsample_size = match (i < last, forward_upsample_size, skips.last()) {
                (true, true, Some(next)) => Some((next.dim(D::Minus2)?, next.dim(D::Minus1)?)),
                _ => None,
            };
            xs = block.forward(&xs, &block_skips, &emb, encoder_hidden_states, upsample_size)?;
        }

        let xs = candle_nn::ops::silu(&self.conv_norm_out.forward(&xs)?)?;
        Ok(self.conv_out.forward(&xs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::build_seeded;
    use candle_core::{DType, Device};

    fn tiny_config() -> UNet2DConditionConfig {
        UNet2DConditionConfig {
            block_out_channels: vec![4, 8],
            layers_per_block: 1,
            sample_size: 32,
            in_channels: 4,
            out_channels: 4,
            down_block_types: vec![DownBlockType::DownBlock2D, DownBlockType::CrossAttnDownBlock2D],
            up_block_types: vec![UpBlockType::CrossAttnUpBlock2D, UpBlockType::UpBlock2D],
            cross_attention_dim: 32,
            norm_num_groups: 2,
            time_cond_proj_dim: Some(32),
            ..Default::default()
        }
    }

    #[test]
    fn test_forward_shape() {
        let config = tiny_config();
        let (unet, _) = build_seeded(0, DType::F32, &Device::Cpu, |vb| {
            UNet2DConditionModel::new(vb, &config)
        })
        .unwrap();

        let sample = Tensor::ones((2, 4, 16, 16), DType::F32, &Device::Cpu).unwrap();
        let context = Tensor::ones((2, 77, 32), DType::F32, &Device::Cpu).unwrap();
        let cond = guidance_scale_embedding(&[5.0, 5.0], 32, DType::F32, &Device::Cpu).unwrap();
        let out = unet.forward(&sample, 999.0, &context, Some(&cond)).unwrap();
        assert_eq!(out.dims(), &[2, 4, 16, 16]);
    }

    #[test]
    fn test_odd_latent_size_is_upsampled_to_match() {
        let config = tiny_config();
        let (unet, _) = build_seeded(0, DType::F32, &Device::Cpu, |vb| {
            UNet2DConditionModel::new(vb, &config)
        })
        .unwrap();

        let sample = Tensor::ones((1, 4, 9, 7), DType::F32, &Device::Cpu).unwrap();
        let context = Tensor::ones((1, 4, 32), DType::F32, &Device::Cpu).unwrap();
        let out = unet.forward(&sample, 10.0, &context, None).unwrap();
        assert_eq!(out.dims(), &[1, 4, 9, 7]);
    }

    #[test]
    fn test_guidance_condition_changes_prediction() {
        let config = tiny_config();
        let (unet, _) = build_seeded(0, DType::F32, &Device::Cpu, |vb| {
            UNet2DConditionModel::new(vb, &config)
        })
        .unwrap();

        let sample = Tensor::ones((1, 4, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let context = Tensor::ones((1, 4, 32), DType::F32, &Device::Cpu).unwrap();
        let low = guidance_scale_embedding(&[0.0], 32, DType::F32, &Device::Cpu).unwrap();
        let high = guidance_scale_embedding(&[7.0], 32, DType::F32, &Device::Cpu).unwrap();
        let a = unet.forward(&sample, 500.0, &context, Some(&low)).unwrap();
        let b = unet.forward(&sample, 500.0, &context, Some(&high)).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff > 0.0);
    }

    #[test]
    fn test_config_from_diffusers_json() {
        let json = r#"{
            "_class_name": "UNet2DConditionModel",
            "act_fn": "silu",
            "attention_head_dim": [5, 10, 20, 20],
            "block_out_channels": [320, 640, 1280, 1280],
            "cross_attention_dim": 1024,
            "down_block_types": ["CrossAttnDownBlock2D", "CrossAttnDownBlock2D", "CrossAttnDownBlock2D", "DownBlock2D"],
            "up_block_types": ["UpBlock2D", "CrossAttnUpBlock2D", "CrossAttnUpBlock2D", "CrossAttnUpBlock2D"],
            "mid_block_type": "UNetMidBlock2DCrossAttn",
            "time_cond_proj_dim": 256,
            "use_linear_projection": true,
            "sample_size": 96
        }"#;
        let config: UNet2DConditionConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.heads().unwrap(), vec![5, 10, 20, 20]);
        assert_eq!(config.time_cond_proj_dim, Some(256));
        assert_eq!(config.time_embed_dim(), 1280);
    }

    #[test]
    fn test_invalid_layout_rejected() {
        let mut config = tiny_config();
        config.up_block_types.pop();
        assert!(config.validate().is_err());

        let mut config = tiny_config();
        config.norm_num_groups = 3;
        assert!(config.validate().is_err());
    }
}
