use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, Rng};
use serde::Deserialize;
use serde_json::Value;

use super::{
    dataset::{DatasetMode, Sample},
    Result,
};
use crate::{error::to_runtime_error, TrainingError};

/// Per-sample preprocessing applied by the loader before batching.
pub trait SampleTransformer: Send + Sync {
    fn transform(&self, sample: Sample, mode: DatasetMode, rng: &mut StdRng) -> Result<Sample>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl SampleTransformer for Identity {
    fn transform(&self, sample: Sample, _mode: DatasetMode, _rng: &mut StdRng) -> Result<Sample> {
        Ok(sample)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NormalizeArgs {
    mean: Vec<f32>,
    std: Vec<f32>,
}

/// Per-channel `(x - mean) / std`.
#[derive(Debug, Clone)]
pub struct Normalize {
    mean: Tensor,
    std: Tensor,
}

impl Normalize {
    pub fn from_args(args: &Value) -> Result<Self> {
        let args: NormalizeArgs = serde_json::from_value(args.clone()).map_err(|err| {
            TrainingError::initialization(format!("invalid normalize args: {err}"))
        })?;
        if args.mean.is_empty() || args.mean.len() != args.std.len() {
            return Err(TrainingError::initialization(
                "normalize requires equally long, non-empty mean and std",
            ));
        }
        if args.std.iter().any(|s| *s <= 0.0) {
            return Err(TrainingError::initialization("normalize std must be positive"));
        }
        let channels = args.mean.len();
        let mean = Tensor::from_vec(args.mean, (channels, 1, 1), &Device::Cpu)
            .map_err(to_runtime_error)?;
        let std = Tensor::from_vec(args.std, (channels, 1, 1), &Device::Cpu)
            .map_err(to_runtime_error)?;
        Ok(Self { mean, std })
    }
}

impl SampleTransformer for Normalize {
    fn transform(&self, sample: Sample, _mode: DatasetMode, _rng: &mut StdRng) -> Result<Sample> {
        let channels = self.mean.dims()[0];
        if sample.input.dims()[0] != channels {
            return Err(TrainingError::runtime(format!(
                "normalize configured for {channels} channels, sample '{}' has {}",
                sample.id,
                sample.input.dims()[0]
            )));
        }
        let input = sample
            .input
            .broadcast_sub(&self.mean)
            .and_then(|t| t.broadcast_div(&self.std))
            .map_err(to_runtime_error)?;
        Ok(Sample { input, ..sample })
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RandomFlipArgs {
    p: f64,
}

impl Default for RandomFlipArgs {
    fn default() -> Self {
        Self { p: 0.5 }
    }
}

/// Horizontal flip with probability `p`, training mode only.
#[derive(Debug, Clone, Copy)]
pub struct RandomFlip {
    p: f64,
}

impl RandomFlip {
    pub fn new(p: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&p) {
            return Err(TrainingError::initialization(format!(
                "random_flip probability must be in [0, 1] (got {p})"
            )));
        }
        Ok(Self { p })
    }

    pub fn from_args(args: &Value) -> Result<Self> {
        let args: RandomFlipArgs = serde_json::from_value(args.clone()).map_err(|err| {
            TrainingError::initialization(format!("invalid random_flip args: {err}"))
        })?;
        Self::new(args.p)
    }
}

impl SampleTransformer for RandomFlip {
    fn transform(&self, sample: Sample, mode: DatasetMode, rng: &mut StdRng) -> Result<Sample> {
        if mode != DatasetMode::Train || !rng.gen_bool(self.p) {
            return Ok(sample);
        }
        let width = sample.target.dims()[1];
        let reversed: Vec<u32> = (0..width as u32).rev().collect();
        let index = Tensor::new(reversed.as_slice(), &Device::Cpu).map_err(to_runtime_error)?;
        let input = sample
            .input
            .index_select(&index, 2)
            .map_err(to_runtime_error)?;
        let target = sample
            .target
            .index_select(&index, 1)
            .map_err(to_runtime_error)?;
        Ok(Sample {
            id: sample.id,
            input,
            target,
        })
    }
}
