//! CLIP text encoder
//!
//! Parameter names follow the `transformers` `CLIPTextModel` checkpoint
//! layout (`text_model.embeddings.*`, `text_model.encoder.layers.{i}.*`,
//! `text_model.final_layer_norm`).

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, LayerNorm, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// MLP activation of the encoder layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipActivation {
    /// `x * sigmoid(1.702 * x)`
    QuickGelu,
    /// Exact GELU
    Gelu,
}

impl ClipActivation {
    fn forward(self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::QuickGelu => Ok((xs * candle_nn::ops::sigmoid(&(xs * 1.702)?)?)?),
            Self::Gelu => Ok(xs.gelu_erf()?),
        }
    }
}

/// Text encoder hyperparameters, read from `text_encoder/config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipTextConfig {
    /// Token vocabulary size
    pub vocab_size: usize,
    /// Hidden width
    pub hidden_size: usize,
    /// MLP width
    pub intermediate_size: usize,
    /// Encoder layers
    pub num_hidden_layers: usize,
    /// Attention heads per layer
    pub num_attention_heads: usize,
    /// Longest supported token sequence
    pub max_position_embeddings: usize,
    /// MLP activation
    pub hidden_act: ClipActivation,
    /// Layer norm epsilon
    pub layer_norm_eps: f64,
    /// Padding token id
    pub pad_token_id: u32,
    /// Start-of-text token id
    pub bos_token_id: u32,
    /// End-of-text token id
    pub eos_token_id: u32,
}

impl Default for ClipTextConfig {
    fn default() -> Self {
        Self {
            vocab_size: 49408,
            hidden_size: 768,
            intermediate_size: 3072,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            max_position_embeddings: 77,
            hidden_act: ClipActivation::QuickGelu,
            layer_norm_eps: 1e-5,
            pad_token_id: 1,
            bos_token_id: 49406,
            eos_token_id: 49407,
        }
    }
}

impl ClipTextConfig {
    /// Load from a `config.json`
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check head/width compatibility
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::config(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.max_position_embeddings == 0 {
            return Err(Error::config("max_position_embeddings must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ClipAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    heads: usize,
    head_dim: usize,
}

impl ClipAttention {
    fn new(vb: VarBuilder, config: &ClipTextConfig) -> Result<Self> {
        let dim = config.hidden_size;
        Ok(Self {
            q_proj: candle_nn::linear(dim, dim, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(dim, dim, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(dim, dim, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(dim, dim, vb.pp("out_proj"))?,
            heads: config.num_attention_heads,
            head_dim: dim / config.num_attention_heads,
        })
    }

    fn shape(&self, xs: &Tensor, b: usize, n: usize) -> Result<Tensor> {
        Ok(xs
            .reshape((b, n, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn forward(&self, xs: &Tensor, causal_mask: &Tensor) -> Result<Tensor> {
        let (b, n, dim) = xs.dims3()?;
        let dtype = xs.dtype();
        let scale = (self.head_dim as f64).powf(-0.5);

        let q = self.shape(&(self.q_proj.forward(xs)? * scale)?, b, n)?;
        let k = self.shape(&self.k_proj.forward(xs)?, b, n)?;
        let v = self.shape(&self.v_proj.forward(xs)?, b, n)?;

        let scores = q.matmul(&k.t()?)?.to_dtype(DType::F32)?;
        let scores = scores.broadcast_add(causal_mask)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?.to_dtype(dtype)?;
        let out = probs.matmul(&v)?.transpose(1, 2)?.reshape((b, n, dim))?;
        Ok(self.out_proj.forward(&out)?)
    }
}

#[derive(Debug, Clone)]
struct ClipEncoderLayer {
    layer_norm1: LayerNorm,
    self_attn: ClipAttention,
    layer_norm2: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    act: ClipActivation,
}

impl ClipEncoderLayer {
    fn new(vb: VarBuilder, config: &ClipTextConfig) -> Result<Self> {
        let dim = config.hidden_size;
        Ok(Self {
            layer_norm1: candle_nn::layer_norm(dim, config.layer_norm_eps, vb.pp("layer_norm1"))?,
            self_attn: ClipAttention::new(vb.pp("self_attn"), config)?,
            layer_norm2: candle_nn::layer_norm(dim, config.layer_norm_eps, vb.pp("layer_norm2"))?,
            fc1: candle_nn::linear(dim, config.intermediate_size, vb.pp("mlp").pp("fc1"))?,
            fc2: candle_nn::linear(config.intermediate_size, dim, vb.pp("mlp").pp("fc2"))?,
            act: config.hidden_act,
        })
    }

    fn forward(&self, xs: &Tensor, causal_mask: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let xs = self.self_attn.forward(&self.layer_norm1.forward(xs)?, causal_mask)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let h = self.act.forward(&self.fc1.forward(&self.layer_norm2.forward(&xs)?)?)?;
        Ok((self.fc2.forward(&h)? + residual)?)
    }
}

/// CLIP text transformer producing per-token hidden states
#[derive(Debug, Clone)]
pub struct ClipTextModel {
    token_embedding: Embedding,
    position_embedding: Embedding,
    layers: Vec<ClipEncoderLayer>,
    final_layer_norm: LayerNorm,
    config: ClipTextConfig,
    dtype: DType,
}

impl ClipTextModel {
    /// Build from the checkpoint root (the `text_model` prefix is added here)
    pub fn new(vb: VarBuilder, config: &ClipTextConfig) -> Result<Self> {
        config.validate()?;
        let vb = vb.pp("text_model");
        let embeddings = vb.pp("embeddings");
        let token_embedding = candle_nn::embedding(
            config.vocab_size,
            config.hidden_size,
            embeddings.pp("token_embedding"),
        )?;
        let position_embedding = candle_nn::embedding(
            config.max_position_embeddings,
            config.hidden_size,
            embeddings.pp("position_embedding"),
        )?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| ClipEncoderLayer::new(vb.pp("encoder").pp("layers").pp(i.to_string()), config))
            .collect::<Result<Vec<_>>>()?;
        let final_layer_norm = candle_nn::layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("final_layer_norm"),
        )?;
        Ok(Self {
            token_embedding,
            position_embedding,
            layers,
            final_layer_norm,
            config: config.clone(),
            dtype: vb.dtype(),
        })
    }

    /// Model config
    pub fn config(&self) -> &ClipTextConfig {
        &self.config
    }

    /// Width of the produced hidden states
    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    /// Dtype of the parameters
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    fn causal_mask(n: usize, device: &Device) -> Result<Tensor> {
        let mask: Vec<f32> = (0..n)
            .flat_map(|i| (0..n).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
            .collect();
        Ok(Tensor::from_vec(mask, (n, n), device)?)
    }

    /// Last hidden state for `(b, n)` token ids
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.forward_with_skip(input_ids, None)
    }

    /// Hidden states `clip_skip` layers before the last, with the final
    /// layer norm applied. `None` or `Some(0)` yields the last hidden state.
    pub fn forward_with_skip(&self, input_ids: &Tensor, clip_skip: Option<usize>) -> Result<Tensor> {
        let (_, n) = input_ids.dims2()?;
        if n > self.config.max_position_embeddings {
            return Err(Error::invalid_input(format!(
                "sequence of {n} tokens exceeds max_position_embeddings {}",
                self.config.max_position_embeddings
            )));
        }
        let skip = clip_skip.unwrap_or(0);
        let depth = self.layers.len().checked_sub(skip).ok_or_else(|| {
            Error::invalid_input(format!(
                "clip_skip {skip} exceeds the {} encoder layers",
                self.layers.len()
            ))
        })?;

        let device = input_ids.device();
        let positions = Tensor::arange(0u32, n as u32, device)?.unsqueeze(0)?;
        let xs = self
            .token_embedding
            .forward(input_ids)?
            .broadcast_add(&self.position_embedding.forward(&positions)?)?;

        let mask = Self::causal_mask(n, device)?;
        let mut xs = xs;
        for layer in &self.layers[..depth] {
            xs = layer.forward(&xs, &mask)?;
        }
        Ok(self.final_layer_norm.forward(&xs)?)
    }
}
