use std::fmt;

use candle_core::{DType, Tensor};

use super::Result;
use crate::TrainingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetMode {
    Train,
    Val,
}

impl DatasetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetMode::Train => "train",
            DatasetMode::Val => "val",
        }
    }
}

impl fmt::Display for DatasetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One example: `input` is `(channels, h, w)` f32, `target` is `(h, w)` u32,
/// both on the host.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: String,
    pub input: Tensor,
    pub target: Tensor,
}

impl Sample {
    pub fn new(id: impl Into<String>, input: Tensor, target: Tensor) -> Result<Self> {
        let id = id.into();
        let (in_dims, target_dims) = (input.dims(), target.dims());
        let consistent = matches!(
            (in_dims, target_dims),
            ([_, h, w], [th, tw]) if h == th && w == tw
        );
        if !consistent {
            return Err(TrainingError::runtime(format!(
                "sample '{id}' has input {in_dims:?} and target {target_dims:?}; expected (c, h, w) and (h, w)"
            )));
        }
        if input.dtype() != DType::F32 || target.dtype() != DType::U32 {
            return Err(TrainingError::runtime(format!(
                "sample '{id}' must hold f32 inputs and u32 targets"
            )));
        }
        Ok(Self { id, input, target })
    }
}

/// Indexed collection of segmentation samples plus the label metadata the
/// controller needs.
pub trait SegmentationDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<Sample>;

    fn labels(&self) -> &[String];

    fn n_classes(&self) -> usize {
        self.labels().len()
    }

    fn ignore_index(&self) -> Option<u32>;

    fn in_channels(&self) -> usize;

    /// RGB color per class, used when rendering label maps.
    fn color_palette(&self) -> &[[u8; 3]];
}

/// Evenly spread, reasonably distinct colors.
pub fn default_palette(n_classes: usize) -> Vec<[u8; 3]> {
    (0..n_classes)
        .map(|class| {
            if class == 0 {
                return [0, 0, 0];
            }
            let hue = (class as f32 * 137.508) % 360.0;
            hsv_to_rgb(hue, 0.75, 0.95)
        })
        .collect()
}

fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> [u8; 3] {
    let c = value * saturation;
    let x = c * (1.0 - ((hue / 60.0) % 2.0 - 1.0).abs());
    let m = value - c;
    let (r, g, b) = match hue as u32 / 60 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let to_byte = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    [to_byte(r), to_byte(g), to_byte(b)]
}
