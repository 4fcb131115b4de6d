//! Fast pipeline tests over tiny randomly initialised components

mod common;

use candle_core::{DType, Device, Tensor};
use common::{corner_slice, dummy_components, dummy_inputs, dummy_pipeline, max_abs_diff, PROMPT};
use lcm_diffusion::{
    Error, Generators, Images, LatentConsistencyModelPipeline, LcmInputs, OutputType,
    PretrainedOptions, ProgressBarConfig,
};
use ndarray::Array4;
use std::sync::{Arc, Mutex};

fn run(inputs: LcmInputs) -> Array4<f32> {
    let mut pipe = dummy_pipeline(&Device::Cpu);
    let output = pipe.call(inputs).unwrap();
    output.images.as_np().expect("array output").clone()
}

const LONG_PROMPT: &str = "a very long prompt about a small red bird sitting in a green tree ";

fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    let diff = max_abs_diff(actual, expected);
    assert!(
        diff < tolerance,
        "max difference {diff}\n  actual: {actual:?}\nexpected: {expected:?}"
    );
}

fn assert_in_unit_range(image: &Array4<f32>) {
    assert!(
        image.iter().all(|v| (0.0..=1.0).contains(v)),
        "pixel values outside [0, 1]"
    );
}

#[test]
fn lcm_onestep() {
    let inputs = LcmInputs {
        num_inference_steps: 1,
        ..dummy_inputs(0)
    };
    let image = run(inputs);
    assert_eq!(image.shape(), &[1, 64, 64, 3]);
    assert_in_unit_range(&image);

    let expected = [
        0.747_425_4, 0.695_652, 0.458_483_44, 0.513_026_2, 0.641_021_5, 0.466_767_5,
        0.309_414, 0.427_373_8, 0.474_853_4,
    ];
    assert_close(&corner_slice(&image, 0), &expected, 1e-3);
}

#[test]
fn lcm_multistep() {
    let image = run(dummy_inputs(0));
    assert_eq!(image.shape(), &[1, 64, 64, 3]);
    assert_in_unit_range(&image);

    let expected = [
        0.793_542_4, 0.725_881_2, 0.451_706_3, 0.507_697, 0.631_676_1, 0.467_088_2,
        0.302_982, 0.421_953_9, 0.481_794_9,
    ];
    assert_close(&corner_slice(&image, 0), &expected, 2e-2);
}

#[test]
fn inference_batch_single_identical() {
    let batch_size = 3;
    let mut pipe = dummy_pipeline(&Device::Cpu);

    let prompts = vec![PROMPT.to_string(), PROMPT.to_string(), LONG_PROMPT.repeat(10)];
    let batched = pipe
        .call(LcmInputs {
            prompt: Some(prompts),
            generators: Generators::per_sample(0..batch_size as u64),
            ..dummy_inputs(0)
        })
        .unwrap();
    let batched = batched.images.as_np().unwrap().clone();
    assert_eq!(batched.shape()[0], batch_size);

    let single = pipe
        .call(LcmInputs {
            generators: Generators::per_sample([0]),
            ..dummy_inputs(0)
        })
        .unwrap();
    let single = single.images.as_np().unwrap().clone();

    let diff = batched
        .index_axis(ndarray::Axis(0), 0)
        .iter()
        .zip(single.index_axis(ndarray::Axis(0), 0).iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    assert!(diff < 5e-4, "max difference {diff}");

    let second = [
        0.128_192, 0.020_719_44, 0.497_509_87, 0.328_548_05, 0.352_244_4, 0.576_260_3,
        0.438_359_58, 0.459_744_2, 0.510_514_8,
    ];
    assert_close(&corner_slice(&batched, 1), &second, 2e-2);
    let long = [
        0.592_038_2, 0.314_531_5, 0.482_678_56, 0.417_712_14, 0.296_665_45, 0.427_291_95,
        0.253_456_8, 0.241_932_44, 0.314_996_93,
    ];
    assert_close(&corner_slice(&batched, 2), &long, 2e-2);
}

#[test]
fn inference_batch_consistent() {
    let mut pipe = dummy_pipeline(&Device::Cpu);
    for batch_size in [2usize, 3] {
        let mut prompts = vec![PROMPT.to_string(); batch_size];
        prompts[batch_size - 1] = LONG_PROMPT.repeat(10);
        let output = pipe
            .call(LcmInputs {
                prompt: Some(prompts),
                generators: Generators::per_sample(0..batch_size as u64),
                ..dummy_inputs(0)
            })
            .unwrap();
        assert_eq!(output.images.len(), batch_size);

        let images = output.images.as_np().unwrap();
        assert_eq!(images.shape(), &[batch_size, 64, 64, 3]);
        assert_in_unit_range(images);
        assert!(max_abs_diff(&corner_slice(images, 0), &corner_slice(images, 1)) > 1e-3);
    }
}

#[test]
fn shared_and_per_sample_generator_agree_for_one_image() {
    let shared = run(dummy_inputs(7));
    let per_sample = run(LcmInputs {
        generators: Generators::per_sample([7]),
        ..dummy_inputs(7)
    });
    assert_eq!(corner_slice(&shared, 0), corner_slice(&per_sample, 0));
}

#[test]
fn different_seeds_give_different_images() {
    let a = run(dummy_inputs(0));
    let b = run(dummy_inputs(1));
    assert!(max_abs_diff(&corner_slice(&a, 0), &corner_slice(&b, 0)) > 0.0);
}

#[test]
fn onestep_and_multistep_differ() {
    let one = run(LcmInputs {
        num_inference_steps: 1,
        ..dummy_inputs(0)
    });
    let two = run(dummy_inputs(0));
    assert!(max_abs_diff(one.as_slice().unwrap(), two.as_slice().unwrap()) > 0.0);
}

#[test]
fn custom_timesteps_match_scheduler_grid() {
    let mut pipe = dummy_pipeline(&Device::Cpu);
    let from_steps = pipe.call(dummy_inputs(0)).unwrap();
    assert_eq!(pipe.scheduler().timesteps(), &[999, 499]);

    let from_timesteps = pipe
        .call(LcmInputs {
            timesteps: Some(vec![999, 499]),
            ..dummy_inputs(0)
        })
        .unwrap();
    let a = from_steps.images.as_np().unwrap();
    let b = from_timesteps.images.as_np().unwrap();
    assert_eq!(a, b);
}

#[test]
fn prompt_embeds_match_prompt() {
    let mut pipe = dummy_pipeline(&Device::Cpu);
    let embeds = pipe.encode_prompt(&[PROMPT], 1, None).unwrap();
    assert_eq!(embeds.dims(), &[1, 77, 32]);

    let from_prompt = pipe.call(dummy_inputs(0)).unwrap();
    let from_embeds = pipe
        .call(LcmInputs {
            prompt: None,
            prompt_embeds: Some(embeds),
            ..dummy_inputs(0)
        })
        .unwrap();
    assert_eq!(
        from_prompt.images.as_np().unwrap(),
        from_embeds.images.as_np().unwrap()
    );
}

#[test]
fn num_images_per_prompt_expands_batch() {
    let image = run(LcmInputs {
        prompt: Some(vec![PROMPT.to_string(), "a cat".to_string()]),
        num_images_per_prompt: 2,
        ..dummy_inputs(0)
    });
    assert_eq!(image.shape(), &[4, 64, 64, 3]);
}

#[test]
fn output_types() {
    let mut pipe = dummy_pipeline(&Device::Cpu);

    let latent = pipe
        .call(LcmInputs {
            output_type: OutputType::Latent,
            ..dummy_inputs(0)
        })
        .unwrap();
    assert_eq!(latent.images.as_tensor().unwrap().dims(), &[1, 4, 32, 32]);

    let np = pipe.call(dummy_inputs(0)).unwrap();
    let np = np.images.as_np().unwrap().clone();

    let pt = pipe
        .call(LcmInputs {
            output_type: OutputType::Pt,
            ..dummy_inputs(0)
        })
        .unwrap();
    let pt = pt.images.as_tensor().unwrap().clone();
    assert_eq!(pt.dims(), &[1, 3, 64, 64]);
    let pt_nhwc: Vec<f32> = pt
        .permute((0, 2, 3, 1))
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert_eq!(pt_nhwc.as_slice(), np.as_slice().unwrap());

    let pil = pipe
        .call(LcmInputs {
            output_type: OutputType::Pil,
            ..dummy_inputs(0)
        })
        .unwrap();
    match pil.images {
        Images::Pil(images) => {
            assert_eq!(images.len(), 1);
            assert_eq!(images[0].dimensions(), (64, 64));
            for (byte, value) in images[0].as_raw().iter().zip(np.iter()) {
                assert!(
                    (f32::from(*byte) - value * 255.0).abs() <= 1.0,
                    "{byte} vs {value}"
                );
            }
        }
        other => panic!("expected RGB images, got {other:?}"),
    }
}

#[test]
fn explicit_size_and_latents() {
    let mut pipe = dummy_pipeline(&Device::Cpu);
    let latents = Tensor::zeros((1, 4, 16, 24), DType::F32, &Device::Cpu).unwrap();
    let output = pipe
        .call(LcmInputs {
            height: Some(32),
            width: Some(48),
            latents: Some(latents),
            ..dummy_inputs(0)
        })
        .unwrap();
    assert_eq!(output.images.as_np().unwrap().shape(), &[1, 32, 48, 3]);
}

#[test]
fn callback_sees_every_step() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let mut pipe = dummy_pipeline(&Device::Cpu);
    pipe.call(LcmInputs {
        num_inference_steps: 4,
        callback: Some(Box::new(move |step: usize, timestep: usize, latents: &Tensor| {
            assert_eq!(latents.dims(), &[1, 4, 32, 32]);
            record.lock().unwrap().push((step, timestep));
        })),
        ..dummy_inputs(0)
    })
    .unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(0, 999), (1, 759), (2, 499), (3, 259)]
    );
}

#[test]
fn invalid_inputs_are_rejected() {
    let mut pipe = dummy_pipeline(&Device::Cpu);
    let invalid = |result: lcm_diffusion::Result<_>| matches!(result, Err(Error::InvalidInput(_)));

    assert!(invalid(pipe.call(LcmInputs {
        height: Some(60),
        ..dummy_inputs(0)
    })));
    assert!(invalid(pipe.call(LcmInputs {
        prompt: None,
        ..dummy_inputs(0)
    })));
    assert!(invalid(pipe.call(LcmInputs {
        prompt_embeds: Some(Tensor::zeros((1, 77, 32), DType::F32, &Device::Cpu).unwrap()),
        ..dummy_inputs(0)
    })));
    assert!(invalid(pipe.call(LcmInputs {
        prompt: Some(Vec::new()),
        ..dummy_inputs(0)
    })));
    assert!(invalid(pipe.call(LcmInputs {
        generators: Generators::per_sample([0, 1]),
        ..dummy_inputs(0)
    })));
    assert!(invalid(pipe.call(LcmInputs {
        latents: Some(Tensor::zeros((1, 4, 8, 8), DType::F32, &Device::Cpu).unwrap()),
        ..dummy_inputs(0)
    })));
    assert!(invalid(pipe.call(LcmInputs {
        num_inference_steps: 0,
        ..dummy_inputs(0)
    })));
}

#[test]
fn too_many_steps_is_a_scheduler_error() {
    let mut pipe = dummy_pipeline(&Device::Cpu);
    let result = pipe.call(LcmInputs {
        num_inference_steps: 51,
        ..dummy_inputs(0)
    });
    assert!(matches!(result, Err(Error::Scheduler(_))));
}

#[tokio::test]
async fn save_and_load_round_trip() {
    let components = dummy_components(&Device::Cpu);
    let dir = tempfile::tempdir().unwrap();
    components.save_pretrained(dir.path()).unwrap();
    for file in [
        "unet/config.json",
        "unet/diffusion_pytorch_model.safetensors",
        "vae/config.json",
        "vae/diffusion_pytorch_model.safetensors",
        "text_encoder/config.json",
        "text_encoder/model.safetensors",
        "scheduler/scheduler_config.json",
        "tokenizer/tokenizer.json",
        "tokenizer/special_tokens_map.json",
    ] {
        assert!(dir.path().join(file).is_file(), "{file} missing");
    }

    let model_id = dir.path().to_str().unwrap();
    let mut loaded = LatentConsistencyModelPipeline::from_pretrained(model_id, PretrainedOptions::default())
        .await
        .unwrap();
    loaded.set_progress_bar_config(ProgressBarConfig { disable: true });
    let mut original = LatentConsistencyModelPipeline::new(components);
    original.set_progress_bar_config(ProgressBarConfig { disable: true });

    let expected = original.call(dummy_inputs(0)).unwrap();
    let actual = loaded.call(dummy_inputs(0)).unwrap();
    let expected = expected.images.as_np().unwrap();
    let actual = actual.images.as_np().unwrap();
    assert_eq!(actual.shape(), expected.shape());
    assert!(max_abs_diff(actual.as_slice().unwrap(), expected.as_slice().unwrap()) < 1e-6);
}
