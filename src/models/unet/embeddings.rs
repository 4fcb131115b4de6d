//! Timestep and guidance-scale embeddings

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Activation, Linear, Module, VarBuilder};

use crate::error::Result;

/// Sinusoidal embedding of a batch of scalar timesteps, shape `(b, dim)`
pub fn timestep_embedding(
    timesteps: &Tensor,
    dim: usize,
    flip_sin_to_cos: bool,
    downscale_freq_shift: f64,
) -> Result<Tensor> {
    let device = timesteps.device();
    let half = dim / 2;
    let exponent = (Tensor::arange(0u32, half as u32, device)?.to_dtype(DType::F32)?
        * (-(10000f64.ln()) / (half as f64 - downscale_freq_shift)))?;
    let freqs = exponent.exp()?;
    let args = timesteps
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .broadcast_mul(&freqs.unsqueeze(0)?)?;
    let (sin, cos) = (args.sin()?, args.cos()?);
    let emb = if flip_sin_to_cos {
        Tensor::cat(&[&cos, &sin], D::Minus1)?
    } else {
        Tensor::cat(&[&sin, &cos], D::Minus1)?
    };
    pad_odd(emb, dim)
}

/// Embedding of the guidance scale fed to the UNet through `cond_proj`.
///
/// `w` is scaled by 1000 and projected onto `dim / 2` log-spaced frequencies.
pub fn guidance_scale_embedding(w: &[f32], dim: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let half = dim / 2;
    let factor = 10000f64.ln() / (half.max(2) - 1) as f64;
    let freqs = (Tensor::arange(0u32, half as u32, device)?.to_dtype(DType::F32)? * -factor)?.exp()?;
    let w = (Tensor::from_slice(w, w.len(), device)? * 1000.0)?;
    let args = w.unsqueeze(1)?.broadcast_mul(&freqs.unsqueeze(0)?)?;
    let emb = Tensor::cat(&[&args.sin()?, &args.cos()?], D::Minus1)?;
    Ok(pad_odd(emb, dim)?.to_dtype(dtype)?)
}

fn pad_odd(emb: Tensor, dim: usize) -> Result<Tensor> {
    if dim % 2 == 1 {
        Ok(emb.pad_with_zeros(D::Minus1, 0, 1)?)
    } else {
        Ok(emb)
    }
}

/// Sinusoidal timestep projection
#[derive(Debug, Clone)]
pub struct Timesteps {
    num_channels: usize,
    flip_sin_to_cos: bool,
    downscale_freq_shift: f64,
}

impl Timesteps {
    /// New projection with `num_channels` output features
    pub fn new(num_channels: usize, flip_sin_to_cos: bool, downscale_freq_shift: f64) -> Self {
        Self {
            num_channels,
            flip_sin_to_cos,
            downscale_freq_shift,
        }
    }

    /// Project a `(b,)` timestep tensor to `(b, num_channels)`
    pub fn forward(&self, timesteps: &Tensor) -> Result<Tensor> {
        timestep_embedding(
            timesteps,
            self.num_channels,
            self.flip_sin_to_cos,
            self.downscale_freq_shift,
        )
    }
}

/// Timestep MLP with an optional conditioning projection
#[derive(Debug, Clone)]
pub struct TimestepEmbedding {
    linear_1: Linear,
    linear_2: Linear,
    cond_proj: Option<Linear>,
    act: Activation,
}

impl TimestepEmbedding {
    /// Build the MLP; `cond_proj_dim` enables the conditioning input
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        time_embed_dim: usize,
        cond_proj_dim: Option<usize>,
        act: Activation,
    ) -> Result<Self> {
        let linear_1 = candle_nn::linear(in_channels, time_embed_dim, vb.pp("linear_1"))?;
        let linear_2 = candle_nn::linear(time_embed_dim, time_embed_dim, vb.pp("linear_2"))?;
        let cond_proj = cond_proj_dim
            .map(|dim| candle_nn::linear_no_bias(dim, in_channels, vb.pp("cond_proj")))
            .transpose()?;
        Ok(Self {
            linear_1,
            linear_2,
            cond_proj,
            act,
        })
    }

    /// Embed projected timesteps, adding the projected condition if given
    pub fn forward(&self, sample: &Tensor, condition: Option<&Tensor>) -> Result<Tensor> {
        let sample = match (&self.cond_proj, condition) {
            (Some(proj), Some(cond)) => (sample + proj.forward(cond)?)?,
            _ => sample.clone(),
        };
        let xs = self.act.forward(&self.linear_1.forward(&sample)?)?;
        Ok(self.linear_2.forward(&xs)?)
    }
}
