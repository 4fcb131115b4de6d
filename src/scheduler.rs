//! Latent Consistency Model scheduler
//!
//! Multi-step consistency sampling: every step maps the current noisy latents
//! straight to a denoised estimate through the consistency boundary
//! condition, then re-noises that estimate down to the next timestep on the
//! LCM skipping grid.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::generator::Generators;

/// Noise schedule used to derive the betas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Betas linearly spaced between `beta_start` and `beta_end`
    Linear,
    /// Square roots of the betas linearly spaced (Stable Diffusion)
    ScaledLinear,
    /// Glide cosine schedule
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredcosCapV2,
}

/// What the denoising network predicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// The added noise
    Epsilon,
    /// The clean sample directly
    Sample,
    /// The velocity `sqrt(a) * noise - sqrt(1 - a) * x0`
    VPrediction,
}

/// Timestep spacing; recorded for config compatibility, LCM uses its own grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    /// Evenly spaced including the last training step
    Linspace,
    /// Integer multiples of the step ratio
    Leading,
    /// Counted backwards from the last training step
    Trailing,
}

/// Scheduler hyperparameters, read from `scheduler_config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcmSchedulerConfig {
    /// Number of diffusion steps used during training
    pub num_train_timesteps: usize,
    /// Starting beta value
    pub beta_start: f64,
    /// Final beta value
    pub beta_end: f64,
    /// Beta schedule
    pub beta_schedule: BetaSchedule,
    /// Explicit betas overriding the schedule
    pub trained_betas: Option<Vec<f64>>,
    /// Length of the grid the LCM was distilled on
    pub original_inference_steps: usize,
    /// Clip the predicted sample
    pub clip_sample: bool,
    /// Clipping range when `clip_sample` is set
    pub clip_sample_range: f64,
    /// Use alpha_cumprod = 1 past the first step instead of `alphas_cumprod[0]`
    pub set_alpha_to_one: bool,
    /// Kept for config compatibility; the LCM grid ignores it
    pub steps_offset: usize,
    /// Network prediction type
    pub prediction_type: PredictionType,
    /// Dynamic thresholding of the predicted sample
    pub thresholding: bool,
    /// Quantile used by dynamic thresholding
    pub dynamic_thresholding_ratio: f64,
    /// Upper bound for the dynamic threshold
    pub sample_max_value: f64,
    /// Timestep spacing
    pub timestep_spacing: TimestepSpacing,
    /// Factor applied to timesteps in the boundary condition scalings
    pub timestep_scaling: f64,
    /// Rescale betas to zero terminal SNR
    pub rescale_betas_zero_snr: bool,
}

impl Default for LcmSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            trained_betas: None,
            original_inference_steps: 50,
            clip_sample: false,
            clip_sample_range: 1.0,
            set_alpha_to_one: true,
            steps_offset: 0,
            prediction_type: PredictionType::Epsilon,
            thresholding: false,
            dynamic_thresholding_ratio: 0.995,
            sample_max_value: 1.0,
            timestep_spacing: TimestepSpacing::Leading,
            timestep_scaling: 10.0,
            rescale_betas_zero_snr: false,
        }
    }
}

impl LcmSchedulerConfig {
    /// Load a scheduler config from a JSON file; unknown keys are ignored
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the config
    pub fn validate(&self) -> Result<()> {
        if self.num_train_timesteps == 0 {
            return Err(Error::config("num_train_timesteps must be > 0"));
        }
        if let Some(betas) = &self.trained_betas {
            if betas.len() != self.num_train_timesteps {
                return Err(Error::config(format!(
                    "trained_betas has {} entries, expected {}",
                    betas.len(),
                    self.num_train_timesteps
                )));
            }
        }
        if self.original_inference_steps == 0 {
            return Err(Error::config("original_inference_steps must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.dynamic_thresholding_ratio) {
            return Err(Error::config("dynamic_thresholding_ratio must be within [0, 1]"));
        }
        Ok(())
    }
}

/// Output of a single scheduler step
#[derive(Debug, Clone)]
pub struct LcmSchedulerOutput {
    /// Latents for the next step
    pub prev_sample: Tensor,
    /// Denoised estimate at this step
    pub denoised: Tensor,
}

/// LCM multi-step scheduler
#[derive(Debug, Clone)]
pub struct LcmScheduler {
    config: LcmSchedulerConfig,
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    init_noise_sigma: f64,
    timesteps: Vec<usize>,
    num_inference_steps: Option<usize>,
    custom_timesteps: bool,
    step_index: Option<usize>,
    begin_index: Option<usize>,
}

const SIGMA_DATA: f64 = 0.5;

impl LcmScheduler {
    /// Build a scheduler from its config
    pub fn new(config: LcmSchedulerConfig) -> Result<Self> {
        config.validate()?;

        let n = config.num_train_timesteps;
        let mut betas = match &config.trained_betas {
            Some(betas) => betas.clone(),
            None => match config.beta_schedule {
                BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, n),
                BetaSchedule::ScaledLinear => {
                    linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n)
                        .into_iter()
                        .map(|b| b * b)
                        .collect()
                }
                BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(n, 0.999),
            },
        };

        if config.rescale_betas_zero_snr {
            betas = rescale_zero_terminal_snr(&betas);
        }

        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut acc = 1.0;
        for beta in &betas {
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc);
        }

        if config.rescale_betas_zero_snr {
            // Avoid an infinite x0 estimate at the terminal step
            if let Some(last) = alphas_cumprod.last_mut() {
                *last = 2f64.powi(-24);
            }
        }

        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };

        Ok(Self {
            timesteps: (0..n).rev().collect(),
            config,
            betas,
            alphas_cumprod,
            final_alpha_cumprod,
            init_noise_sigma: 1.0,
            num_inference_steps: None,
            custom_timesteps: false,
            step_index: None,
            begin_index: None,
        })
    }

    /// Rebuild a scheduler from another scheduler's config
    pub fn from_config(config: &LcmSchedulerConfig) -> Result<Self> {
        Self::new(config.clone())
    }

    /// Scheduler config
    pub fn config(&self) -> &LcmSchedulerConfig {
        &self.config
    }

    /// Betas over the training schedule
    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    /// Cumulative alpha products over the training schedule
    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    /// Alpha product used past the first training step
    pub fn final_alpha_cumprod(&self) -> f64 {
        self.final_alpha_cumprod
    }

    /// Standard deviation of the initial noise
    pub fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    /// Current inference timesteps, descending
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Number of inference steps, once set
    pub fn num_inference_steps(&self) -> Option<usize> {
        self.num_inference_steps
    }

    /// Whether the timesteps were supplied by the caller
    pub fn custom_timesteps(&self) -> bool {
        self.custom_timesteps
    }

    /// Index of the next step, once stepping has started
    pub fn step_index(&self) -> Option<usize> {
        self.step_index
    }

    /// First index to step from, for pipelines that skip leading timesteps
    pub fn begin_index(&self) -> Option<usize> {
        self.begin_index
    }

    /// Set the first index to step from
    pub fn set_begin_index(&mut self, begin_index: usize) {
        self.begin_index = Some(begin_index);
    }

    /// LCM timesteps are not rescaled
    pub fn scale_model_input(&self, sample: &Tensor, _timestep: usize) -> Result<Tensor> {
        Ok(sample.clone())
    }

    /// The distillation grid: `k * [1..=floor(original * strength)] - 1`
    fn origin_timesteps(&self, original_steps: usize, strength: f64) -> Vec<usize> {
        let k = self.config.num_train_timesteps / original_steps;
        let count = (original_steps as f64 * strength) as usize;
        (1..=count).map(|i| i * k - 1).collect()
    }

    /// Compute inference timesteps on the LCM grid
    pub fn set_timesteps(
        &mut self,
        num_inference_steps: Option<usize>,
        original_inference_steps: Option<usize>,
        timesteps: Option<&[usize]>,
        strength: f64,
    ) -> Result<()> {
        let num_train = self.config.num_train_timesteps;

        if num_inference_steps.is_none() && timesteps.is_none() {
            return Err(Error::scheduler(
                "must pass exactly one of num_inference_steps or timesteps",
            ));
        }
        if num_inference_steps.is_some() && timesteps.is_some() {
            return Err(Error::scheduler(
                "can only pass one of num_inference_steps or custom timesteps",
            ));
        }

        let original_steps =
            original_inference_steps.unwrap_or(self.config.original_inference_steps);
        if original_steps == 0 || original_steps > num_train {
            return Err(Error::scheduler(format!(
                "original_inference_steps ({original_steps}) must be in 1..={num_train}"
            )));
        }

        let origin = self.origin_timesteps(original_steps, strength);

        let selected = if let Some(custom) = timesteps {
            if custom.is_empty() {
                return Err(Error::scheduler("custom timesteps must not be empty"));
            }
            if custom.len() > num_train {
                return Err(Error::scheduler(format!(
                    "{} timesteps exceeds num_train_timesteps ({num_train})",
                    custom.len()
                )));
            }
            if custom.windows(2).any(|w| w[1] >= w[0]) {
                return Err(Error::scheduler("custom timesteps must be in descending order"));
            }
            if custom[0] >= num_train {
                return Err(Error::scheduler(format!(
                    "timesteps must start before num_train_timesteps ({num_train})"
                )));
            }

            let grid: HashSet<usize> = origin.iter().copied().collect();
            let off_grid = custom.iter().filter(|t| !grid.contains(t)).count();
            if off_grid > 0 {
                warn!(
                    off_grid,
                    "custom timesteps are not on the original LCM grid; results may be degraded"
                );
            }

            let n = custom.len();
            self.num_inference_steps = Some(n);
            self.custom_timesteps = true;

            let init_timestep = ((n as f64 * strength) as usize).min(n);
            let t_start = n.saturating_sub(init_timestep);
            custom[t_start..].to_vec()
        } else {
            let n = num_inference_steps.unwrap_or_default();
            if n == 0 {
                return Err(Error::scheduler("num_inference_steps must be > 0"));
            }
            if n > num_train {
                return Err(Error::scheduler(format!(
                    "num_inference_steps ({n}) cannot exceed num_train_timesteps ({num_train})"
                )));
            }
            let skipping_step = origin.len() / n;
            if skipping_step < 1 {
                return Err(Error::scheduler(format!(
                    "the combination of original_steps x strength ({original_steps} x {strength}) \
                     is smaller than num_inference_steps ({n})"
                )));
            }
            if n > original_steps {
                return Err(Error::scheduler(format!(
                    "num_inference_steps ({n}) cannot exceed original_inference_steps ({original_steps})"
                )));
            }

            self.num_inference_steps = Some(n);
            self.custom_timesteps = false;

            let reversed: Vec<usize> = origin.iter().rev().copied().collect();
            (0..n)
                .map(|i| {
                    let index = (i as f64 * reversed.len() as f64 / n as f64).floor() as usize;
                    reversed[index]
                })
                .collect()
        };

        debug!(timesteps = ?selected, "LCM timesteps set");
        self.timesteps = selected;
        self.step_index = None;
        self.begin_index = None;
        Ok(())
    }

    /// Position of `timestep` in the schedule; the second match if it repeats
    pub fn index_for_timestep(&self, timestep: usize) -> Result<usize> {
        let matches: Vec<usize> = self
            .timesteps
            .iter()
            .enumerate()
            .filter(|(_, t)| **t == timestep)
            .map(|(i, _)| i)
            .collect();
        match matches.as_slice() {
            [] => Err(Error::scheduler(format!(
                "timestep {timestep} is not part of the current schedule"
            ))),
            [only] => Ok(*only),
            [_, second, ..] => Ok(*second),
        }
    }

    /// Timestep that follows `timestep` in the schedule.
    ///
    /// `None` when `timestep` is the last entry or is not on the grid. Before
    /// `set_timesteps` the grid is the full training range.
    pub fn previous_timestep(&self, timestep: usize) -> Option<usize> {
        if self.num_inference_steps.is_none() {
            return timestep.checked_sub(1);
        }
        let index = self.timesteps.iter().position(|&t| t == timestep)?;
        self.timesteps.get(index + 1).copied()
    }

    fn alpha_cumprod(&self, timestep: usize) -> Result<f64> {
        self.alphas_cumprod.get(timestep).copied().ok_or_else(|| {
            Error::scheduler(format!(
                "timestep {timestep} is outside the {} training timesteps",
                self.alphas_cumprod.len()
            ))
        })
    }

    /// Consistency boundary condition scalings `(c_skip, c_out)`
    pub fn boundary_condition_scalings(&self, timestep: usize) -> (f64, f64) {
        let scaled = timestep as f64 * self.config.timestep_scaling;
        let c_skip = SIGMA_DATA * SIGMA_DATA / (scaled * scaled + SIGMA_DATA * SIGMA_DATA);
        let c_out = scaled / (scaled * scaled + SIGMA_DATA * SIGMA_DATA).sqrt();
        (c_skip, c_out)
    }

    /// One multi-step consistency sampling step
    pub fn step(
        &mut self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
        generators: &mut Generators,
    ) -> Result<LcmSchedulerOutput> {
        let num_inference_steps = self.num_inference_steps.ok_or_else(|| {
            Error::scheduler("set_timesteps must be called before stepping")
        })?;

        let step_index = match self.step_index {
            Some(index) => index,
            None => match self.begin_index {
                Some(begin) => begin,
                None => self.index_for_timestep(timestep)?,
            },
        };
        self.step_index = Some(step_index);

        let prev_timestep = self.timesteps.get(step_index + 1).copied();

        let alpha_prod_t = self.alpha_cumprod(timestep)?;
        let alpha_prod_t_prev = match prev_timestep {
            Some(t) => self.alpha_cumprod(t)?,
            None => self.final_alpha_cumprod,
        };
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let (c_skip, c_out) = self.boundary_condition_scalings(timestep);

        let predicted_original = match self.config.prediction_type {
            PredictionType::Epsilon => ((sample - (model_output * beta_prod_t.sqrt())?)?
                / alpha_prod_t.sqrt())?,
            PredictionType::Sample => model_output.clone(),
            PredictionType::VPrediction => ((sample * alpha_prod_t.sqrt())?
                - (model_output * beta_prod_t.sqrt())?)?,
        };

        let predicted_original = if self.config.thresholding {
            self.threshold_sample(&predicted_original)?
        } else if self.config.clip_sample {
            let range = self.config.clip_sample_range;
            predicted_original.clamp(-range, range)?
        } else {
            predicted_original
        };

        let denoised = ((&predicted_original * c_out)? + (sample * c_skip)?)?;

        let prev_sample = if step_index + 1 != num_inference_steps {
            let noise = generators.randn(model_output.dims(), model_output.dtype(), model_output.device())?;
            ((&denoised * alpha_prod_t_prev.sqrt())? + (noise * beta_prod_t_prev.sqrt())?)?
        } else {
            denoised.clone()
        };

        self.step_index = Some(step_index + 1);

        Ok(LcmSchedulerOutput {
            prev_sample,
            denoised,
        })
    }

    /// Dynamic thresholding: clamp each sample to its `ratio` quantile of |x|
    fn threshold_sample(&self, sample: &Tensor) -> Result<Tensor> {
        let dtype = sample.dtype();
        let dims = sample.dims().to_vec();
        let batch = dims.first().copied().unwrap_or(1);
        let flat = sample.to_dtype(DType::F32)?.reshape((batch, ()))?;

        let mut rows = Vec::with_capacity(batch);
        for b in 0..batch {
            let row = flat.get(b)?;
            let values = row.to_vec1::<f32>()?;
            let mut abs: Vec<f32> = values.iter().map(|v| v.abs()).collect();
            abs.sort_by(|a, b| a.total_cmp(b));
            let s = quantile_sorted(&abs, self.config.dynamic_thresholding_ratio)
                .clamp(1.0, self.config.sample_max_value.max(1.0));
            rows.push((row.clamp(-s, s)? / s)?);
        }

        Ok(Tensor::stack(&rows, 0)?.reshape(dims)?.to_dtype(dtype)?)
    }

    fn alpha_factors(&self, timesteps: &[usize], ndim: usize, like: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut shape = vec![timesteps.len()];
        shape.extend(std::iter::repeat(1).take(ndim.saturating_sub(1)));

        let mut sqrt_alpha = Vec::with_capacity(timesteps.len());
        let mut sqrt_one_minus = Vec::with_capacity(timesteps.len());
        for &t in timesteps {
            let a = *self.alphas_cumprod.get(t).ok_or_else(|| {
                Error::scheduler(format!("timestep {t} out of range"))
            })?;
            sqrt_alpha.push(a.sqrt() as f32);
            sqrt_one_minus.push((1.0 - a).sqrt() as f32);
        }

        let to_tensor = |values: Vec<f32>| -> Result<Tensor> {
            Ok(Tensor::from_vec(values, shape.as_slice(), like.device())?.to_dtype(like.dtype())?)
        };
        Ok((to_tensor(sqrt_alpha)?, to_tensor(sqrt_one_minus)?))
    }

    /// Forward-diffuse `original` to `timesteps` (one per batch element)
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timesteps: &[usize]) -> Result<Tensor> {
        let (sqrt_alpha, sqrt_one_minus) = self.alpha_factors(timesteps, original.rank(), original)?;
        Ok((original.broadcast_mul(&sqrt_alpha)? + noise.broadcast_mul(&sqrt_one_minus)?)?)
    }

    /// Velocity target `sqrt(a) * noise - sqrt(1 - a) * sample`
    pub fn velocity(&self, sample: &Tensor, noise: &Tensor, timesteps: &[usize]) -> Result<Tensor> {
        let (sqrt_alpha, sqrt_one_minus) = self.alpha_factors(timesteps, sample.rank(), sample)?;
        Ok((noise.broadcast_mul(&sqrt_alpha)? - sample.broadcast_mul(&sqrt_one_minus)?)?)
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

fn betas_for_alpha_bar(n: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
    (0..n)
        .map(|i| {
            let t1 = i as f64 / n as f64;
            let t2 = (i + 1) as f64 / n as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

fn rescale_zero_terminal_snr(betas: &[f64]) -> Vec<f64> {
    let mut acc = 1.0;
    let mut sqrt_bar: Vec<f64> = betas
        .iter()
        .map(|b| {
            acc *= 1.0 - b;
            acc.sqrt()
        })
        .collect();

    let first = sqrt_bar[0];
    let last = sqrt_bar[sqrt_bar.len() - 1];
    for v in sqrt_bar.iter_mut() {
        *v = (*v - last) * first / (first - last);
    }

    let bar: Vec<f64> = sqrt_bar.iter().map(|v| v * v).collect();
    let mut out = Vec::with_capacity(bar.len());
    out.push(1.0 - bar[0]);
    for i in 1..bar.len() {
        out.push(1.0 - bar[i] / bar[i - 1]);
    }
    out
}

/// Linear-interpolated quantile of an ascending slice
fn quantile_sorted(sorted: &[f32], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] as f64 * (1.0 - frac) + sorted[hi] as f64 * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;
    use test_case::test_case;

    fn dummy_config() -> LcmSchedulerConfig {
        LcmSchedulerConfig {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            clip_sample: false,
            set_alpha_to_one: false,
            ..Default::default()
        }
    }

    #[test_case(1, &[999] ; "one step")]
    #[test_case(2, &[999, 499] ; "two steps")]
    #[test_case(4, &[999, 759, 499, 259] ; "four steps")]
    fn test_lcm_timesteps(steps: usize, expected: &[usize]) {
        let mut scheduler = LcmScheduler::new(dummy_config()).unwrap();
        scheduler.set_timesteps(Some(steps), None, None, 1.0).unwrap();
        assert_eq!(scheduler.timesteps(), expected);
        assert_eq!(scheduler.num_inference_steps(), Some(steps));
    }

    #[test]
    fn test_scaled_linear_betas() {
        let scheduler = LcmScheduler::new(dummy_config()).unwrap();
        let betas = scheduler.betas();
        assert_eq!(betas.len(), 1000);
        assert_relative_eq!(betas[0], 0.00085, epsilon = 1e-12);
        assert_relative_eq!(betas[999], 0.012, epsilon = 1e-12);
        assert!(betas.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_final_alpha_cumprod() {
        let scheduler = LcmScheduler::new(dummy_config()).unwrap();
        assert_relative_eq!(scheduler.final_alpha_cumprod(), 1.0 - 0.00085, epsilon = 1e-12);

        let scheduler = LcmScheduler::new(LcmSchedulerConfig::default()).unwrap();
        assert_eq!(scheduler.final_alpha_cumprod(), 1.0);
    }

    #[test]
    fn test_cosine_betas_capped() {
        let config = LcmSchedulerConfig {
            beta_schedule: BetaSchedule::SquaredcosCapV2,
            ..Default::default()
        };
        let scheduler = LcmScheduler::new(config).unwrap();
        assert!(scheduler.betas().iter().all(|&b| b > 0.0 && b <= 0.999));
    }

    #[test]
    fn test_zero_snr_rescale() {
        let config = LcmSchedulerConfig {
            rescale_betas_zero_snr: true,
            ..Default::default()
        };
        let scheduler = LcmScheduler::new(config).unwrap();
        let last = *scheduler.alphas_cumprod().last().unwrap();
        assert!(last < 1e-6);
    }

    #[test]
    fn test_boundary_condition_scalings() {
        let scheduler = LcmScheduler::new(dummy_config()).unwrap();
        let (c_skip, c_out) = scheduler.boundary_condition_scalings(0);
        assert_eq!(c_skip, 1.0);
        assert_eq!(c_out, 0.0);

        let (c_skip, c_out) = scheduler.boundary_condition_scalings(999);
        assert!(c_skip < 1e-6);
        assert_relative_eq!(c_out, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_set_timesteps_errors() {
        let mut scheduler = LcmScheduler::new(dummy_config()).unwrap();
        assert!(scheduler.set_timesteps(None, None, None, 1.0).is_err());
        assert!(scheduler.set_timesteps(Some(2), None, Some(&[999, 499]), 1.0).is_err());
        assert!(scheduler.set_timesteps(Some(51), None, None, 1.0).is_err());
        assert!(scheduler.set_timesteps(Some(4), Some(2000), None, 1.0).is_err());
        assert!(scheduler.set_timesteps(Some(0), None, None, 1.0).is_err());
    }

    #[test]
    fn test_custom_timesteps() {
        let mut scheduler = LcmScheduler::new(dummy_config()).unwrap();
        scheduler.set_timesteps(None, None, Some(&[999, 639, 259]), 1.0).unwrap();
        assert_eq!(scheduler.timesteps(), &[999, 639, 259]);
        assert!(scheduler.custom_timesteps());

        assert!(scheduler.set_timesteps(None, None, Some(&[259, 999]), 1.0).is_err());
        assert!(scheduler.set_timesteps(None, None, Some(&[1000, 10]), 1.0).is_err());
    }

    #[test]
    fn test_strength_shortens_grid() {
        let mut scheduler = LcmScheduler::new(dummy_config()).unwrap();
        scheduler.set_timesteps(Some(2), None, None, 0.5).unwrap();
        // 25 origin steps: 19, 39, ..., 499
        assert_eq!(scheduler.timesteps(), &[499, 259]);
    }

    #[test]
    fn test_step_requires_timesteps() {
        let mut scheduler = LcmScheduler::new(dummy_config()).unwrap();
        let x = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let mut gens = Generators::seeded(0);
        assert!(scheduler.step(&x, 999, &x, &mut gens).is_err());
    }

    #[test]
    fn test_last_step_returns_denoised() {
        let mut scheduler = LcmScheduler::new(dummy_config()).unwrap();
        scheduler.set_timesteps(Some(1), None, None, 1.0).unwrap();

        let sample = Tensor::ones((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let model_output = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let mut gens = Generators::seeded(0);
        let out = scheduler.step(&model_output, 999, &sample, &mut gens).unwrap();

        let prev: Vec<f32> = out.prev_sample.flatten_all().unwrap().to_vec1().unwrap();
        let denoised: Vec<f32> = out.denoised.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(prev, denoised);
        assert_eq!(scheduler.step_index(), Some(1));
    }

    #[test]
    fn test_intermediate_step_adds_noise() {
        let mut scheduler = LcmScheduler::new(dummy_config()).unwrap();
        scheduler.set_timesteps(Some(2), None, None, 1.0).unwrap();

        let sample = Tensor::ones((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let model_output = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let mut gens = Generators::seeded(0);
        let out = scheduler.step(&model_output, 999, &sample, &mut gens).unwrap();

        let prev: Vec<f32> = out.prev_sample.flatten_all().unwrap().to_vec1().unwrap();
        let denoised: Vec<f32> = out.denoised.flatten_all().unwrap().to_vec1().unwrap();
        assert_ne!(prev, denoised);
        assert_eq!(scheduler.step_index(), Some(1));
    }

    #[test]
    fn test_previous_timestep_follows_grid() {
        let mut scheduler = LcmScheduler::new(dummy_config()).unwrap();
        assert_eq!(scheduler.previous_timestep(10), Some(9));
        assert_eq!(scheduler.previous_timestep(0), None);

        scheduler.set_timesteps(Some(2), None, None, 1.0).unwrap();
        assert_eq!(scheduler.previous_timestep(999), Some(499));
        assert_eq!(scheduler.previous_timestep(499), None);
        assert_eq!(scheduler.previous_timestep(500), None);

        let sample = Tensor::ones((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let model_output = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let mut gens = Generators::seeded(0);
        scheduler.step(&model_output, 999, &sample, &mut gens).unwrap();
        assert_eq!(scheduler.previous_timestep(999), Some(499));
    }

    #[test]
    fn test_out_of_range_timestep_is_an_error() {
        let mut scheduler = LcmScheduler::new(dummy_config()).unwrap();
        scheduler.set_timesteps(Some(2), None, None, 1.0).unwrap();
        scheduler.set_begin_index(0);

        let sample = Tensor::ones((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let model_output = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let mut gens = Generators::seeded(0);
        let result = scheduler.step(&model_output, 5000, &sample, &mut gens);
        assert!(matches!(result, Err(Error::Scheduler(_))));
    }

    #[test]
    fn test_epsilon_prediction_recovers_clean_sample() {
        let mut scheduler = LcmScheduler::new(dummy_config()).unwrap();
        scheduler.set_timesteps(Some(1), None, None, 1.0).unwrap();

        let device = Device::Cpu;
        let clean = Tensor::full(0.5f32, (1, 4, 2, 2), &device).unwrap();
        let noise = Tensor::full(-1.0f32, (1, 4, 2, 2), &device).unwrap();
        let noisy = scheduler.add_noise(&clean, &noise, &[999]).unwrap();

        let mut gens = Generators::seeded(0);
        let out = scheduler.step(&noise, 999, &noisy, &mut gens).unwrap();
        let noisy_value = noisy.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0] as f64;
        let (c_skip, c_out) = scheduler.boundary_condition_scalings(999);
        let expected = (c_out * 0.5 + c_skip * noisy_value) as f32;
        for v in out.denoised.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert_relative_eq!(v, expected, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_thresholding_bounds_output() {
        let config = LcmSchedulerConfig {
            prediction_type: PredictionType::Sample,
            thresholding: true,
            sample_max_value: 2.0,
            ..dummy_config()
        };
        let mut scheduler = LcmScheduler::new(config).unwrap();
        scheduler.set_timesteps(Some(1), None, None, 1.0).unwrap();

        let device = Device::Cpu;
        let prediction = Tensor::new(&[[5.0f32, -5.0, 0.5, 0.1]], &device).unwrap();
        let sample = Tensor::zeros((1, 4), DType::F32, &device).unwrap();
        let mut gens = Generators::seeded(0);
        let out = scheduler.step(&prediction, 999, &sample, &mut gens).unwrap();
        let (_, c_out) = scheduler.boundary_condition_scalings(999);
        for v in out.denoised.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!(v.abs() as f64 <= c_out + 1e-6);
        }
    }

    #[test]
    fn test_config_ignores_unknown_keys() {
        let json = r#"{
            "_class_name": "LCMScheduler",
            "beta_schedule": "scaled_linear",
            "set_alpha_to_one": false,
            "skip_prk_steps": true,
            "num_train_timesteps": 1000
        }"#;
        let config: LcmSchedulerConfig = serde_json::from_str(json).unwrap();
        assert!(!config.set_alpha_to_one);
        assert_eq!(config.original_inference_steps, 50);
        assert_eq!(config.beta_schedule, BetaSchedule::ScaledLinear);
    }

    #[test]
    fn test_index_for_repeated_timestep() {
        let mut scheduler = LcmScheduler::new(dummy_config()).unwrap();
        scheduler.set_timesteps(None, None, Some(&[999, 499]), 1.0).unwrap();
        assert_eq!(scheduler.index_for_timestep(499).unwrap(), 1);
        assert!(scheduler.index_for_timestep(5).is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn timesteps_descend_within_range(steps in 1usize..=50, original in 50usize..=100) {
                let mut scheduler = LcmScheduler::new(dummy_config()).unwrap();
                scheduler.set_timesteps(Some(steps), Some(original), None, 1.0).unwrap();
                let ts = scheduler.timesteps();
                prop_assert_eq!(ts.len(), steps);
                prop_assert!(ts.windows(2).all(|w| w[1] < w[0]));
                prop_assert!(ts.iter().all(|&t| t < 1000));
            }

            #[test]
            fn scalings_stay_in_unit_range(t in 0usize..1000) {
                let scheduler = LcmScheduler::new(dummy_config()).unwrap();
                let (c_skip, c_out) = scheduler.boundary_condition_scalings(t);
                prop_assert!((0.0..=1.0).contains(&c_skip));
                prop_assert!((0.0..=1.0).contains(&c_out));
            }
        }
    }
}
