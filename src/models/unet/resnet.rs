//! ResNet blocks and resamplers

use candle_core::Tensor;
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, Linear, Module, VarBuilder};

use crate::error::Result;

/// Hyperparameters shared by every ResNet block of a UNet stage
#[derive(Debug, Clone, Copy)]
pub struct ResnetConfig {
    /// Group count for both normalisations
    pub groups: usize,
    /// Normalisation epsilon
    pub eps: f64,
    /// Time embedding width, `None` for unconditioned blocks
    pub temb_channels: Option<usize>,
    /// Divisor applied to the residual sum
    pub output_scale_factor: f64,
}

/// Two 3x3 convolutions with a time-embedding shift and a residual path
#[derive(Debug, Clone)]
pub struct ResnetBlock2D {
    norm1: GroupNorm,
    conv1: Conv2d,
    time_emb_proj: Option<Linear>,
    norm2: GroupNorm,
    conv2: Conv2d,
    conv_shortcut: Option<Conv2d>,
    output_scale_factor: f64,
}

impl ResnetBlock2D {
    /// Build a block mapping `in_channels` to `out_channels`
    pub fn new(vb: VarBuilder, in_channels: usize, out_channels: usize, config: ResnetConfig) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let norm1 = candle_nn::group_norm(config.groups, in_channels, config.eps, vb.pp("norm1"))?;
        let conv1 = candle_nn::conv2d(in_channels, out_channels, 3, conv_cfg, vb.pp("conv1"))?;
        let time_emb_proj = config
            .temb_channels
            .map(|temb| candle_nn::linear(temb, out_channels, vb.pp("time_emb_proj")))
            .transpose()?;
        let norm2 = candle_nn::group_norm(config.groups, out_channels, config.eps, vb.pp("norm2"))?;
        let conv2 = candle_nn::conv2d(out_channels, out_channels, 3, conv_cfg, vb.pp("conv2"))?;
        let conv_shortcut = if in_channels != out_channels {
            Some(candle_nn::conv2d(
                in_channels,
                out_channels,
                1,
                Default::default(),
                vb.pp("conv_shortcut"),
            )?)
        } else {
            None
        };

        Ok(Self {
            norm1,
            conv1,
            time_emb_proj,
            norm2,
            conv2,
            conv_shortcut,
            output_scale_factor: config.output_scale_factor,
        })
    }

    /// Apply the block; `temb` has shape `(b, temb_channels)`
    pub fn forward(&self, xs: &Tensor, temb: Option<&Tensor>) -> Result<Tensor> {
        let h = candle_nn::ops::silu(&self.norm1.forward(xs)?)?;
        let mut h = self.conv1.forward(&h)?;

        if let (Some(proj), Some(temb)) = (&self.time_emb_proj, temb) {
            let shift = proj
                .forward(&candle_nn::ops::silu(temb)?)?
                .unsqueeze(2)?
                .unsqueeze(3)?;
            h = h.broadcast_add(&shift)?;
        }

        let h = candle_nn::ops::silu(&self.norm2.forward(&h)?)?;
        let h = self.conv2.forward(&h)?;

        let shortcut = match &self.conv_shortcut {
            Some(conv) => conv.forward(xs)?,
            None => xs.clone(),
        };
        Ok(((shortcut + h)? / self.output_scale_factor)?)
    }
}

/// Stride-2 convolution halving the spatial size
#[derive(Debug, Clone)]
pub struct Downsample2D {
    conv: Conv2d,
}

impl Downsample2D {
    /// Build the downsampler under `vb` (expects a `conv` child)
    pub fn new(vb: VarBuilder, channels: usize, padding: usize) -> Result<Self> {
        let cfg = Conv2dConfig {
            stride: 2,
            padding,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(channels, channels, 3, cfg, vb.pp("conv"))?;
        Ok(Self { conv })
    }

    /// Downsample `xs`
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.conv.forward(xs)?)
    }
}

/// Nearest-neighbour upsampling followed by a 3x3 convolution
#[derive(Debug, Clone)]
pub struct Upsample2D {
    conv: Conv2d,
}

impl Upsample2D {
    /// Build the upsampler under `vb` (expects a `conv` child)
    pub fn new(vb: VarBuilder, channels: usize) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(channels, channels, 3, cfg, vb.pp("conv"))?;
        Ok(Self { conv })
    }

    /// Upsample to `size` when given, otherwise by a factor of two
    pub fn forward(&self, xs: &Tensor, size: Option<(usize, usize)>) -> Result<Tensor> {
        let (_, _, h, w) = xs.dims4()?;
        let (target_h, target_w) = size.unwrap_or((2 * h, 2 * w));
        let xs = xs.upsample_nearest2d(target_h, target_w)?;
        Ok(self.conv.forward(&xs)?)
    }
}
