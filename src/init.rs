//! Seeded parameter initialisation for randomly initialised models
//!
//! Layers are first built against a [`VarMap`], which records every parameter
//! they request. The non-constant parameters are then overwritten in place
//! with draws from a generator keyed on `(seed, parameter name)`, so the
//! result depends neither on creation order nor on the device RNG.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::debug;

use crate::error::{Error, Result};
use crate::generator::Generator;

/// Build a model against a fresh `VarMap` and reseed its parameters
pub fn build_seeded<T, F>(seed: u64, dtype: DType, device: &Device, build: F) -> Result<(T, VarMap)>
where
    F: FnOnce(VarBuilder) -> Result<T>,
{
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, dtype, device);
    let model = build(vb)?;
    let reseeded = reseed_parameters(&varmap, seed)?;
    debug!(seed, reseeded, "initialised parameters");
    Ok((model, varmap))
}

/// Overwrite every non-constant parameter of `varmap` with a seeded draw.
///
/// Constant-initialised parameters (normalisation scales and shifts) keep
/// their values. Everything else gets `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
/// Returns the number of parameters rewritten.
pub fn reseed_parameters(varmap: &VarMap, seed: u64) -> Result<usize> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| Error::internal(e.to_string()))?;

    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let mut reseeded = 0;
    for name in names {
        let var = &data[name];
        let tensor = var.as_tensor();
        let values = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        if is_constant(&values) {
            continue;
        }

        let dims = tensor.dims();
        let fan_in = match dims {
            [] => 1,
            [n] => *n,
            [_, rest @ ..] => rest.iter().product(),
        };
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();

        let mut gen = Generator::manual_seed(parameter_seed(seed, name));
        let fresh = Tensor::from_vec(gen.uniform_vec(values.len(), bound), dims, tensor.device())?
            .to_dtype(tensor.dtype())?;
        var.set(&fresh)?;
        reseeded += 1;
    }

    Ok(reseeded)
}

fn is_constant(values: &[f32]) -> bool {
    match values.first() {
        Some(first) => values.iter().all(|v| v == first),
        None => true,
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Per-parameter seed: 64-bit FNV-1a of the name, xored with `seed`
fn parameter_seed(seed: u64, name: &str) -> u64 {
    let hash = name.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    seed ^ hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::Module;

    fn build_layer(seed: u64) -> (candle_nn::Linear, candle_nn::LayerNorm) {
        let (layers, _) = build_seeded(seed, DType::F32, &Device::Cpu, |vb| {
            let linear = candle_nn::linear(8, 4, vb.pp("proj"))?;
            let norm = candle_nn::layer_norm(4, 1e-5, vb.pp("norm"))?;
            Ok((linear, norm))
        })
        .unwrap();
        layers
    }

    #[test]
    fn test_same_seed_same_parameters() {
        let (a, _) = build_layer(0);
        let (b, _) = build_layer(0);
        let x = Tensor::ones((1, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(
            a.forward(&x).unwrap().to_vec2::<f32>().unwrap(),
            b.forward(&x).unwrap().to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_different_seed_different_parameters() {
        let (a, _) = build_layer(0);
        let (b, _) = build_layer(1);
        assert_ne!(
            a.weight().to_vec2::<f32>().unwrap(),
            b.weight().to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_parameter_seed_is_fnv1a() {
        assert_eq!(parameter_seed(0, ""), FNV_OFFSET_BASIS);
        assert_eq!(parameter_seed(0, "a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(parameter_seed(0, "foobar"), 0x8594_4171_f739_67e8);
        assert_eq!(
            parameter_seed(7, "conv_in.weight"),
            7 ^ parameter_seed(0, "conv_in.weight")
        );
    }

    #[test]
    fn test_first_draws_are_pinned() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let linear = candle_nn::linear_no_bias(4, 2, vb.pp("proj")).unwrap();
        reseed_parameters(&varmap, 0).unwrap();

        let expected = [
            -0.394_470_93, 0.495_101_7, 0.432_033_78, 0.275_346_52,
            -0.345_307_35, -0.001_931_19, 0.089_740_4, 0.107_078_08,
        ];
        let weights: Vec<f32> = linear.weight().flatten_all().unwrap().to_vec1().unwrap();
        for (got, want) in weights.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{got} != {want}");
        }
    }

    #[test]
    fn test_constant_parameters_kept_and_bounds_respected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let linear = candle_nn::linear(16, 4, vb.pp("proj")).unwrap();
        let norm = candle_nn::layer_norm(4, 1e-5, vb.pp("norm")).unwrap();
        reseed_parameters(&varmap, 42).unwrap();

        let x = Tensor::new(&[[1f32, 2., 3., 4.]], &Device::Cpu).unwrap();
        let normed = norm.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        let mean: f32 = normed[0].iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);

        let bound = 1.0 / 4.0;
        for row in linear.weight().to_vec2::<f32>().unwrap() {
            assert!(row.iter().all(|v| v.abs() <= bound));
        }
    }
}
