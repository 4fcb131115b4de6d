//! Seeded random sources for latents and scheduler noise
//!
//! candle's own `randn` draws from an unseeded thread RNG on the CPU, so every
//! random tensor that has to be reproducible goes through a [`Generator`].
//! Values are sampled on the host and then moved to the target device, which
//! keeps results identical across devices for a given seed.

use candle_core::{DType, Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::{Error, Result};

/// A seeded standard-normal source
#[derive(Debug, Clone)]
pub struct Generator {
    seed: u64,
    rng: StdRng,
}

impl Generator {
    /// Create a generator seeded with `seed`
    pub fn manual_seed(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Seed this generator was created with
    pub fn initial_seed(&self) -> u64 {
        self.seed
    }

    /// Draw a standard-normal tensor of the given shape
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, dtype: DType, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let values: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        let tensor = Tensor::from_vec(values, shape, &Device::Cpu)?
            .to_dtype(dtype)?
            .to_device(device)?;
        Ok(tensor)
    }

    /// Draw `n` uniform values in `[-bound, bound)`
    pub fn uniform_vec(&mut self, n: usize, bound: f32) -> Vec<f32> {
        (0..n).map(|_| self.rng.random_range(-bound..bound)).collect()
    }
}

/// Random sources for a batch: one shared generator or one per sample
#[derive(Debug, Clone)]
pub enum Generators {
    /// A single generator drives the whole batch
    Shared(Generator),
    /// One generator per batch element
    PerSample(Vec<Generator>),
}

impl Generators {
    /// Single generator seeded with `seed`
    pub fn seeded(seed: u64) -> Self {
        Self::Shared(Generator::manual_seed(seed))
    }

    /// One generator per seed
    pub fn per_sample(seeds: impl IntoIterator<Item = u64>) -> Self {
        Self::PerSample(seeds.into_iter().map(Generator::manual_seed).collect())
    }

    /// Number of generators held
    pub fn len(&self) -> usize {
        match self {
            Self::Shared(_) => 1,
            Self::PerSample(gens) => gens.len(),
        }
    }

    /// Whether no generator is held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that these generators can drive a batch of `batch_size`
    pub fn check_batch(&self, batch_size: usize) -> Result<()> {
        match self {
            Self::Shared(_) => Ok(()),
            Self::PerSample(gens) if gens.len() == batch_size => Ok(()),
            Self::PerSample(gens) => Err(Error::invalid_input(format!(
                "got {} generators for an effective batch size of {}",
                gens.len(),
                batch_size
            ))),
        }
    }

    /// Draw a batched standard-normal tensor; `shape[0]` is the batch dimension
    pub fn randn(&mut self, shape: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
        match self {
            Self::Shared(gen) => gen.randn(shape, dtype, device),
            Self::PerSample(gens) => {
                let batch = shape.first().copied().unwrap_or(0);
                if gens.len() != batch {
                    return Err(Error::invalid_input(format!(
                        "got {} generators for a batch of {}",
                        gens.len(),
                        batch
                    )));
                }
                let mut sample_shape = shape.to_vec();
                sample_shape[0] = 1;
                let samples = gens
                    .iter_mut()
                    .map(|gen| gen.randn(sample_shape.as_slice(), dtype, device))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Tensor::cat(&samples, 0)?)
            }
        }
    }
}

impl From<Generator> for Generators {
    fn from(gen: Generator) -> Self {
        Self::Shared(gen)
    }
}

impl Default for Generators {
    fn default() -> Self {
        Self::seeded(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_values() {
        let mut a = Generator::manual_seed(7);
        let mut b = Generator::manual_seed(7);
        let ta = a.randn((2, 3), DType::F32, &Device::Cpu).unwrap();
        let tb = b.randn((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(
            ta.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            tb.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_seed_zero_stream() {
        let mut gen = Generator::manual_seed(0);
        let values = gen.randn(4, DType::F32, &Device::Cpu).unwrap().to_vec1::<f32>().unwrap();
        let expected = [0.712_813_0, 0.858_331_44, -2.436_243_8, 0.163_344_26];
        for (got, want) in values.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{got} != {want}");
        }
    }

    #[test]
    fn test_different_seeds_differ() {
        let mut a = Generator::manual_seed(0);
        let mut b = Generator::manual_seed(1);
        let ta = a.randn(16, DType::F32, &Device::Cpu).unwrap();
        let tb = b.randn(16, DType::F32, &Device::Cpu).unwrap();
        assert_ne!(ta.to_vec1::<f32>().unwrap(), tb.to_vec1::<f32>().unwrap());
    }

    #[test]
    fn test_per_sample_matches_single() {
        let mut batched = Generators::per_sample([0, 1, 2]);
        let batch = batched.randn(&[3, 4, 2, 2], DType::F32, &Device::Cpu).unwrap();

        let mut single = Generators::seeded(0);
        let first = single.randn(&[1, 4, 2, 2], DType::F32, &Device::Cpu).unwrap();

        assert_eq!(
            batch.get(0).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            first.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_check_batch() {
        assert!(Generators::seeded(0).check_batch(4).is_ok());
        assert!(Generators::per_sample([0, 1]).check_batch(2).is_ok());
        assert!(Generators::per_sample([0, 1]).check_batch(3).is_err());
    }

    #[test]
    fn test_uniform_within_bound() {
        let mut gen = Generator::manual_seed(3);
        let values = gen.uniform_vec(1000, 0.25);
        assert!(values.iter().all(|v| (-0.25..0.25).contains(v)));
    }
}
