//! Spatial transformer: self attention, cross attention and GEGLU feed-forward

use candle_core::{DType, Tensor, D};
use candle_nn::{Conv2d, GroupNorm, LayerNorm, Linear, Module, VarBuilder};

use crate::error::Result;

/// Multi-head attention with optional cross-attention context
#[derive(Debug, Clone)]
pub struct Attention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    heads: usize,
    scale: f64,
}

impl Attention {
    /// `context_dim` is `None` for self attention
    pub fn new(
        vb: VarBuilder,
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        head_dim: usize,
    ) -> Result<Self> {
        let inner = heads * head_dim;
        let context_dim = context_dim.unwrap_or(query_dim);
        Ok(Self {
            to_q: candle_nn::linear_no_bias(query_dim, inner, vb.pp("to_q"))?,
            to_k: candle_nn::linear_no_bias(context_dim, inner, vb.pp("to_k"))?,
            to_v: candle_nn::linear_no_bias(context_dim, inner, vb.pp("to_v"))?,
            to_out: candle_nn::linear(inner, query_dim, vb.pp("to_out").pp("0"))?,
            heads,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, inner) = xs.dims3()?;
        Ok(xs
            .reshape((b, n, self.heads, inner / self.heads))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// `xs`: `(b, n, query_dim)`, `context`: `(b, m, context_dim)`
    pub fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let context = context.unwrap_or(xs);
        let (b, n, _) = xs.dims3()?;

        let q = self.split_heads(&self.to_q.forward(xs)?)?;
        let k = self.split_heads(&self.to_k.forward(context)?)?;
        let v = self.split_heads(&self.to_v.forward(context)?)?;

        let dtype = q.dtype();
        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?.to_dtype(dtype)?;
        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, n, ()))?;
        Ok(self.to_out.forward(&out)?)
    }
}

/// Gated-GELU feed-forward
#[derive(Debug, Clone)]
pub struct FeedForward {
    proj: Linear,
    out: Linear,
}

impl FeedForward {
    /// Hidden width is `4 * dim`
    pub fn new(vb: VarBuilder, dim: usize) -> Result<Self> {
        let inner = dim * 4;
        Ok(Self {
            proj: candle_nn::linear(dim, inner * 2, vb.pp("net").pp("0").pp("proj"))?,
            out: candle_nn::linear(inner, dim, vb.pp("net").pp("2"))?,
        })
    }

    /// Apply the feed-forward
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let projected = self.proj.forward(xs)?;
        let chunks = projected.chunk(2, D::Minus1)?;
        let gated = (&chunks[0] * chunks[1].gelu_erf()?)?;
        Ok(self.out.forward(&gated)?)
    }
}

/// Pre-norm transformer block: self attention, cross attention, feed-forward
#[derive(Debug, Clone)]
pub struct BasicTransformerBlock {
    norm1: LayerNorm,
    attn1: Attention,
    norm2: LayerNorm,
    attn2: Attention,
    norm3: LayerNorm,
    ff: FeedForward,
}

impl BasicTransformerBlock {
    /// Build a block of width `dim` attending to `cross_attention_dim` context
    pub fn new(
        vb: VarBuilder,
        dim: usize,
        heads: usize,
        head_dim: usize,
        cross_attention_dim: usize,
    ) -> Result<Self> {
        Ok(Self {
            norm1: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm1"))?,
            attn1: Attention::new(vb.pp("attn1"), dim, None, heads, head_dim)?,
            norm2: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm2"))?,
            attn2: Attention::new(vb.pp("attn2"), dim, Some(cross_attention_dim), heads, head_dim)?,
            norm3: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm3"))?,
            ff: FeedForward::new(vb.pp("ff"), dim)?,
        })
    }

    /// Apply the block to `(b, n, dim)` tokens
    pub fn forward(&self, xs: &Tensor, context: &Tensor) -> Result<Tensor> {
        let xs = (self.attn1.forward(&self.norm1.forward(xs)?, None)? + xs)?;
        let xs = (self.attn2.forward(&self.norm2.forward(&xs)?, Some(context))? + &xs)?;
        Ok((self.ff.forward(&self.norm3.forward(&xs)?)? + &xs)?)
    }
}

/// Hyperparameters of a spatial transformer
#[derive(Debug, Clone, Copy)]
pub struct Transformer2DConfig {
    /// Attention heads
    pub heads: usize,
    /// Width of each head
    pub head_dim: usize,
    /// Width of the encoder hidden states
    pub cross_attention_dim: usize,
    /// Groups of the input normalisation
    pub norm_num_groups: usize,
    /// Project with linear layers instead of 1x1 convolutions
    pub use_linear_projection: bool,
    /// Number of stacked transformer blocks
    pub num_layers: usize,
}

#[derive(Debug, Clone)]
enum Projection {
    Conv(Conv2d),
    Linear(Linear),
}

impl Projection {
    fn new(vb: VarBuilder, in_dim: usize, out_dim: usize, linear: bool) -> Result<Self> {
        if linear {
            Ok(Self::Linear(candle_nn::linear(in_dim, out_dim, vb)?))
        } else {
            Ok(Self::Conv(candle_nn::conv2d(in_dim, out_dim, 1, Default::default(), vb)?))
        }
    }
}

/// Transformer over the spatial positions of a feature map
#[derive(Debug, Clone)]
pub struct Transformer2DModel {
    norm: GroupNorm,
    proj_in: Projection,
    blocks: Vec<BasicTransformerBlock>,
    proj_out: Projection,
}

impl Transformer2DModel {
    /// Build a spatial transformer over `in_channels`
    pub fn new(vb: VarBuilder, in_channels: usize, config: Transformer2DConfig) -> Result<Self> {
        let inner = config.heads * config.head_dim;
        let norm = candle_nn::group_norm(config.norm_num_groups, in_channels, 1e-6, vb.pp("norm"))?;
        let proj_in = Projection::new(vb.pp("proj_in"), in_channels, inner, config.use_linear_projection)?;
        let blocks = (0..config.num_layers)
            .map(|i| {
                BasicTransformerBlock::new(
                    vb.pp("transformer_blocks").pp(i.to_string()),
                    inner,
                    config.heads,
                    config.head_dim,
                    config.cross_attention_dim,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let proj_out = Projection::new(vb.pp("proj_out"), inner, in_channels, config.use_linear_projection)?;
        Ok(Self {
            norm,
            proj_in,
            blocks,
            proj_out,
        })
    }

    /// `xs`: `(b, c, h, w)`, `context`: `(b, m, cross_attention_dim)`
    pub fn forward(&self, xs: &Tensor, context: &Tensor) -> Result<Tensor> {
        let (b, _, h, w) = xs.dims4()?;
        let residual = xs;
        let xs = self.norm.forward(xs)?;

        let mut tokens = match &self.proj_in {
            Projection::Conv(conv) => {
                let xs = conv.forward(&xs)?;
                let inner = xs.dim(1)?;
                xs.permute((0, 2, 3, 1))?.reshape((b, h * w, inner))?
            }
            Projection::Linear(linear) => {
                let c = xs.dim(1)?;
                let xs = xs.permute((0, 2, 3, 1))?.reshape((b, h * w, c))?;
                linear.forward(&xs)?
            }
        };

        for block in &self.blocks {
            tokens = block.forward(&tokens, context)?;
        }

        let out = match &self.proj_out {
            Projection::Conv(conv) => {
                let inner = tokens.dim(2)?;
                let xs = tokens.reshape((b, h, w, inner))?.permute((0, 3, 1, 2))?.contiguous()?;
                conv.forward(&xs)?
            }
            Projection::Linear(linear) => {
                let xs = linear.forward(&tokens)?;
                let c = xs.dim(2)?;
                xs.reshape((b, h, w, c))?.permute((0, 3, 1, 2))?.contiguous()?
            }
        };
        Ok((out + residual)?)
    }
}
