//! Down, mid and up stages of the UNet

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::attention::{Transformer2DConfig, Transformer2DModel};
use super::resnet::{Downsample2D, ResnetBlock2D, ResnetConfig, Upsample2D};
use crate::error::{Error, Result};

/// Cross-attention settings of a stage; `None` on plain ResNet stages
#[derive(Debug, Clone, Copy)]
pub struct CrossAttnConfig {
    /// Attention heads; head width is `channels / heads`
    pub heads: usize,
    /// Width of the encoder hidden states
    pub cross_attention_dim: usize,
    /// Linear instead of convolutional projections
    pub use_linear_projection: bool,
    /// Transformer blocks per attention layer
    pub transformer_layers: usize,
}

fn transformer(
    vb: VarBuilder,
    channels: usize,
    attn: CrossAttnConfig,
    groups: usize,
) -> Result<Transformer2DModel> {
    if attn.heads == 0 || channels % attn.heads != 0 {
        return Err(Error::config(format!(
            "{channels} channels cannot be split across {} attention heads",
            attn.heads
        )));
    }
    Transformer2DModel::new(
        vb,
        channels,
        Transformer2DConfig {
            heads: attn.heads,
            head_dim: channels / attn.heads,
            cross_attention_dim: attn.cross_attention_dim,
            norm_num_groups: groups,
            use_linear_projection: attn.use_linear_projection,
            num_layers: attn.transformer_layers,
        },
    )
}

/// `DownBlock2D` or, with attention layers, `CrossAttnDownBlock2D`
#[derive(Debug, Clone)]
pub struct DownBlock {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<Transformer2DModel>,
    downsampler: Option<Downsample2D>,
}

impl DownBlock {
    /// Build a down stage
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        num_layers: usize,
        resnet: ResnetConfig,
        attn: Option<CrossAttnConfig>,
        add_downsample: bool,
        downsample_padding: usize,
    ) -> Result<Self> {
        let mut resnets = Vec::with_capacity(num_layers);
        let mut attentions = Vec::new();
        for i in 0..num_layers {
            let in_ch = if i == 0 { in_channels } else { out_channels };
            resnets.push(ResnetBlock2D::new(
                vb.pp("resnets").pp(i.to_string()),
                in_ch,
                out_channels,
                resnet,
            )?);
            if let Some(attn) = attn {
                attentions.push(transformer(
                    vb.pp("attentions").pp(i.to_string()),
                    out_channels,
                    attn,
                    resnet.groups,
                )?);
            }
        }
        let downsampler = if add_downsample {
            Some(Downsample2D::new(
                vb.pp("downsamplers").pp("0"),
                out_channels,
                downsample_padding,
            )?)
        } else {
            None
        };
        Ok(Self {
            resnets,
            attentions,
            downsampler,
        })
    }

    /// Returns the stage output and every intermediate state kept for skips
    pub fn forward(
        &self,
        xs: &Tensor,
        temb: &Tensor,
        context: &Tensor,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let mut xs = xs.clone();
        let mut states = Vec::with_capacity(self.resnets.len() + 1);
        for (i, resnet) in self.resnets.iter().enumerate() {
            xs = resnet.forward(&xs, Some(temb))?;
            if let Some(attn) = self.attentions.get(i) {
                xs = attn.forward(&xs, context)?;
            }
            states.push(xs.clone());
        }
        if let Some(down) = &self.downsampler {
            xs = down.forward(&xs)?;
            states.push(xs.clone());
        }
        Ok((xs, states))
    }
}

/// `UNetMidBlock2DCrossAttn`
#[derive(Debug, Clone)]
pub struct MidBlock {
    first: ResnetBlock2D,
    layers: Vec<(Transformer2DModel, ResnetBlock2D)>,
}

impl MidBlock {
    /// Build the bottleneck stage with `num_layers` attention/resnet pairs
    pub fn new(
        vb: VarBuilder,
        channels: usize,
        num_layers: usize,
        resnet: ResnetConfig,
        attn: CrossAttnConfig,
    ) -> Result<Self> {
        let first = ResnetBlock2D::new(vb.pp("resnets").pp("0"), channels, channels, resnet)?;
        let layers = (0..num_layers)
            .map(|i| {
                let attention = transformer(
                    vb.pp("attentions").pp(i.to_string()),
                    channels,
                    attn,
                    resnet.groups,
                )?;
                let block = ResnetBlock2D::new(
                    vb.pp("resnets").pp((i + 1).to_string()),
                    channels,
                    channels,
                    resnet,
                )?;
                Ok((attention, block))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { first, layers })
    }

    /// Apply the bottleneck
    pub fn forward(&self, xs: &Tensor, temb: &Tensor, context: &Tensor) -> Result<Tensor> {
        let mut xs = self.first.forward(xs, Some(temb))?;
        for (attn, resnet) in &self.layers {
            xs = attn.forward(&xs, context)?;
            xs = resnet.forward(&xs, Some(temb))?;
        }
        Ok(xs)
    }
}

/// `UpBlock2D` or, with attention layers, `CrossAttnUpBlock2D`
#[derive(Debug, Clone)]
pub struct UpBlock {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<Transformer2DModel>,
    upsampler: Option<Upsample2D>,
}

impl UpBlock {
    /// Build an up stage; `in_channels` is the width of the deepest skip it consumes
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        prev_output_channels: usize,
        out_channels: usize,
        num_layers: usize,
        resnet: ResnetConfig,
        attn: Option<CrossAttnConfig>,
        add_upsample: bool,
    ) -> Result<Self> {
        let mut resnets = Vec::with_capacity(num_layers);
        let mut attentions = Vec::new();
        for i in 0..num_layers {
            let skip_channels = if i == num_layers - 1 { in_channels } else { out_channels };
            let resnet_in = if i == 0 { prev_output_channels } else { out_channels };
            resnets.push(ResnetBlock2D::new(
                vb.pp("resnets").pp(i.to_string()),
                resnet_in + skip_channels,
                out_channels,
                resnet,
            )?);
            if let Some(attn) = attn {
                attentions.push(transformer(
                    vb.pp("attentions").pp(i.to_string()),
                    out_channels,
                    attn,
                    resnet.groups,
                )?);
            }
        }
        let upsampler = if add_upsample {
            Some(Upsample2D::new(vb.pp("upsamplers").pp("0"), out_channels)?)
        } else {
            None
        };
        Ok(Self {
            resnets,
            attentions,
            upsampler,
        })
    }

    /// Number of skip connections consumed
    pub fn num_layers(&self) -> usize {
        self.resnets.len()
    }

    /// Consume `skips` from the back, one per resnet
    pub fn forward(
        &self,
        xs: &Tensor,
        skips: &[Tensor],
        temb: &Tensor,
        context: &Tensor,
        upsample_size: Option<(usize, usize)>,
    ) -> Result<Tensor> {
        if skips.len() != self.resnets.len() {
            return Err(Error::internal(format!(
                "up block expects {} skip states, got {}",
                self.resnets.len(),
                skips.len()
            )));
        }
        let mut xs = xs.clone();
        for (i, resnet) in self.resnets.iter().enumerate() {
            let skip = &skips[skips.len() - 1 - i];
            xs = Tensor::cat(&[&xs, skip], 1)?;
            xs = resnet.forward(&xs, Some(temb))?;
            if let Some(attn) = self.attentions.get(i) {
                xs = attn.forward(&xs, context)?;
            }
        }
        if let Some(up) = &self.upsampler {
            xs = up.forward(&xs, upsample_size)?;
        }
        Ok(xs)
    }
}
