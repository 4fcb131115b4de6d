//! Networks of the latent diffusion stack

pub mod clip;
pub mod unet;
pub mod vae;

pub use clip::{ClipActivation, ClipTextConfig, ClipTextModel};
pub use unet::{UNet2DConditionConfig, UNet2DConditionModel};
pub use vae::{VaeConfig, VaeModel};
