//! Seeded parameter initialization.
//!
//! Candle's CPU backend cannot be seeded, so parameters are sampled on the
//! host from a caller-provided `StdRng` and then moved to the target device.

use candle_core::{Device, Result, Tensor, Var};
use rand::{
    distributions::{Distribution, Uniform},
    rngs::StdRng,
};

/// Uniform in `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`, matching the usual
/// Kaiming-uniform default for convolutions.
pub fn kaiming_uniform(
    shape: &[usize],
    fan_in: usize,
    rng: &mut StdRng,
    device: &Device,
) -> Result<Var> {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    let dist = Uniform::new_inclusive(-bound, bound);
    let numel: usize = shape.iter().product();
    let values: Vec<f32> = (0..numel).map(|_| dist.sample(rng)).collect();
    let tensor = Tensor::from_vec(values, shape, &Device::Cpu)?.to_device(device)?;
    Var::from_tensor(&tensor)
}
