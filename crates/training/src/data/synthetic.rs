use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;
use serde_json::Value;

use super::{
    dataset::{default_palette, DatasetMode, Sample, SegmentationDataset},
    Result,
};
use crate::{error::to_runtime_error, TrainingError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SyntheticArgs {
    train_samples: usize,
    val_samples: usize,
    height: usize,
    width: usize,
    in_channels: usize,
    n_classes: usize,
    /// Width of the ignored frame around every target.
    border: usize,
    ignore_index: u32,
    noise: f32,
    seed: u64,
}

impl Default for SyntheticArgs {
    fn default() -> Self {
        Self {
            train_samples: 64,
            val_samples: 16,
            height: 16,
            width: 16,
            in_channels: 3,
            n_classes: 3,
            border: 1,
            ignore_index: 255,
            noise: 0.1,
            seed: 0,
        }
    }
}

/// Procedurally generated rectangles on a background.
///
/// Every sample is a pure function of `(seed, mode, index)`, so the dataset
/// needs no files and is identical across runs and workers.
pub struct SyntheticDataset {
    args: SyntheticArgs,
    mode: DatasetMode,
    labels: Vec<String>,
    palette: Vec<[u8; 3]>,
}

impl SyntheticDataset {
    pub fn from_args(args: &Value, mode: DatasetMode) -> Result<Self> {
        let args: SyntheticArgs = serde_json::from_value(args.clone()).map_err(|err| {
            TrainingError::initialization(format!("invalid synthetic dataset args: {err}"))
        })?;

        let mut errors = Vec::new();
        if args.n_classes < 2 {
            errors.push("synthetic.n_classes must be at least 2".to_string());
        }
        if args.in_channels == 0 {
            errors.push("synthetic.in_channels must be greater than 0".to_string());
        }
        if args.height < 2 || args.width < 2 {
            errors.push("synthetic images must be at least 2x2".to_string());
        } else if args.height <= 2 * args.border || args.width <= 2 * args.border {
            errors.push("synthetic image must be larger than its ignored border".to_string());
        }
        if (args.ignore_index as usize) < args.n_classes {
            errors.push("synthetic.ignore_index must not collide with a class".to_string());
        }
        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        let labels = std::iter::once("background".to_string())
            .chain((1..args.n_classes).map(|class| format!("shape_{class}")))
            .collect();
        let palette = default_palette(args.n_classes);
        Ok(Self {
            args,
            mode,
            labels,
            palette,
        })
    }

    fn rng_for(&self, index: usize) -> StdRng {
        let mode_tag = match self.mode {
            DatasetMode::Train => 0x7261_696e,
            DatasetMode::Val => 0x0076_616c,
        };
        StdRng::seed_from_u64(
            self.args
                .seed
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                .wrapping_add(mode_tag)
                .wrapping_add((index as u64) << 20),
        )
    }
}

impl SegmentationDataset for SyntheticDataset {
    fn len(&self) -> usize {
        match self.mode {
            DatasetMode::Train => self.args.train_samples,
            DatasetMode::Val => self.args.val_samples,
        }
    }

    fn get(&self, index: usize) -> Result<Sample> {
        if index >= self.len() {
            return Err(TrainingError::runtime(format!(
                "synthetic index {index} out of range ({} samples)",
                self.len()
            )));
        }

        let SyntheticArgs {
            height: h,
            width: w,
            in_channels: channels,
            n_classes,
            border,
            ignore_index,
            noise,
            ..
        } = self.args;
        let mut rng = self.rng_for(index);

        let class = rng.gen_range(1..n_classes) as u32;
        let rect_h = rng.gen_range(1..=h / 2);
        let rect_w = rng.gen_range(1..=w / 2);
        let top = rng.gen_range(0..=h - rect_h);
        let left = rng.gen_range(0..=w - rect_w);

        let mut labels = vec![0u32; h * w];
        for y in top..top + rect_h {
            for x in left..left + rect_w {
                labels[y * w + x] = class;
            }
        }

        let mut input = vec![0f32; channels * h * w];
        for c in 0..channels {
            for (pixel, &label) in labels.iter().enumerate() {
                let signal = if label as usize % channels == c && label != 0 {
                    1.0
                } else {
                    0.0
                };
                input[c * h * w + pixel] = signal + noise * rng.gen_range(-1.0f32..1.0);
            }
        }

        let mut target = labels;
        for y in 0..h {
            for x in 0..w {
                if y < border || y >= h - border || x < border || x >= w - border {
                    target[y * w + x] = ignore_index;
                }
            }
        }

        let input = Tensor::from_vec(input, (channels, h, w), &Device::Cpu).map_err(to_runtime_error)?;
        let target = Tensor::from_vec(target, (h, w), &Device::Cpu).map_err(to_runtime_error)?;
        Sample::new(format!("{}_{index:05}", self.mode), input, target)
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn ignore_index(&self) -> Option<u32> {
        Some(self.args.ignore_index)
    }

    fn in_channels(&self) -> usize {
        self.args.in_channels
    }

    fn color_palette(&self) -> &[[u8; 3]] {
        &self.palette
    }
}
