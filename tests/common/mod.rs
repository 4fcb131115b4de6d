//! Shared fixtures: tiny randomly initialised components and default inputs

#![allow(dead_code)]

use candle_core::{DType, Device};
use lcm_diffusion::config::{PipelineConfig, TokenizerConfig};
use lcm_diffusion::models::unet::{DownBlockType, UpBlockType};
use lcm_diffusion::models::{ClipTextConfig, UNet2DConditionConfig, VaeConfig};
use lcm_diffusion::scheduler::{BetaSchedule, LcmSchedulerConfig};
use lcm_diffusion::{
    Generators, LatentConsistencyModelPipeline, LcmComponents, LcmInputs, OutputType,
    PromptTokenizer, ProgressBarConfig,
};
use ndarray::{s, Array4};

pub const PROMPT: &str = "A painting of a squirrel eating a burger";

/// Hyperparameters of the tiny test pipeline
pub fn dummy_config() -> PipelineConfig {
    PipelineConfig {
        unet: UNet2DConditionConfig {
            block_out_channels: vec![4, 8],
            layers_per_block: 1,
            sample_size: 32,
            time_cond_proj_dim: Some(32),
            in_channels: 4,
            out_channels: 4,
            down_block_types: vec![DownBlockType::DownBlock2D, DownBlockType::CrossAttnDownBlock2D],
            up_block_types: vec![UpBlockType::CrossAttnUpBlock2D, UpBlockType::UpBlock2D],
            cross_attention_dim: 32,
            norm_num_groups: 2,
            ..Default::default()
        },
        scheduler: LcmSchedulerConfig {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            clip_sample: false,
            set_alpha_to_one: false,
            ..Default::default()
        },
        vae: VaeConfig {
            block_out_channels: vec![4, 8],
            in_channels: 3,
            out_channels: 3,
            layers_per_block: 1,
            latent_channels: 4,
            norm_num_groups: 2,
            sample_size: 64,
            ..Default::default()
        },
        text_encoder: ClipTextConfig {
            bos_token_id: 0,
            eos_token_id: 2,
            hidden_size: 32,
            intermediate_size: 64,
            layer_norm_eps: 1e-5,
            num_attention_heads: 8,
            num_hidden_layers: 3,
            pad_token_id: 1,
            vocab_size: 1000,
            ..Default::default()
        },
        tokenizer: TokenizerConfig::default(),
    }
}

/// Components with weights seeded from 0
pub fn dummy_components(device: &Device) -> LcmComponents {
    let tokenizer = PromptTokenizer::dummy().expect("dummy tokenizer");
    LcmComponents::from_config(&dummy_config(), tokenizer, 0, DType::F32, device)
        .expect("dummy components")
}

/// A quiet pipeline over [`dummy_components`]
pub fn dummy_pipeline(device: &Device) -> LatentConsistencyModelPipeline {
    let mut pipe = LatentConsistencyModelPipeline::new(dummy_components(device));
    pipe.set_progress_bar_config(ProgressBarConfig { disable: true });
    pipe
}

/// Two steps at guidance 6 with an array output
pub fn dummy_inputs(seed: u64) -> LcmInputs {
    LcmInputs {
        generators: Generators::seeded(seed),
        num_inference_steps: 2,
        guidance_scale: 6.0,
        output_type: OutputType::Np,
        ..LcmInputs::prompt(PROMPT)
    }
}

/// `image[index, -3:, -3:, -1]`, flattened
pub fn corner_slice(image: &Array4<f32>, index: usize) -> Vec<f32> {
    let (_, h, w, c) = image.dim();
    image
        .slice(s![index, h - 3.., w - 3.., c - 1])
        .iter()
        .copied()
        .collect()
}

/// Largest absolute elementwise difference
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "slices differ in length");
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
