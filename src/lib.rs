//! lcm-diffusion - Latent Consistency Model text-to-image generation
//!
//! This crate implements the LCM pipeline on top of candle: a CLIP text
//! encoder, a guidance-conditioned UNet, the LCM multi-step scheduler and a
//! KL autoencoder. Pipelines load from diffusers-layout repositories on the
//! Hugging Face hub, or are built with seeded random weights for testing.
//!
//! ```no_run
//! use lcm_diffusion::{LatentConsistencyModelPipeline, LcmInputs, PretrainedOptions};
//!
//! # async fn run() -> lcm_diffusion::Result<()> {
//! let mut pipe = LatentConsistencyModelPipeline::from_pretrained(
//!     "SimianLuo/LCM_Dreamshaper_v7",
//!     PretrainedOptions::default(),
//! )
//! .await?;
//! let _output = pipe.call(LcmInputs::prompt("a photograph of an astronaut riding a horse"))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod generator;
pub mod init;
pub mod models;
pub mod pipeline;
pub mod scheduler;
pub mod tokenizer;

// Re-exports
pub use config::{AppConfig, PipelineConfig};
pub use error::{Error, Result};
pub use generator::{Generator, Generators};
pub use pipeline::{
    ComponentWeights, Images, LatentConsistencyModelPipeline, LcmComponents, LcmInputs, LcmOutput,
    OutputType, PretrainedOptions, ProgressBarConfig,
};
pub use scheduler::{LcmScheduler, LcmSchedulerConfig, LcmSchedulerOutput};
pub use tokenizer::PromptTokenizer;
