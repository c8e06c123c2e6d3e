use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{error::to_runtime_error, TrainingError};

/// Per-pixel cross entropy, summed over every non-ignored target.
///
/// The loss is always the raw sum; callers decide how to normalize it.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    ignore_index: Option<u32>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<u32>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    pub fn ignore_index(&self) -> Option<u32> {
        self.ignore_index
    }

    /// `logits`: `(batch, classes, h, w)`; `targets`: `(batch, h, w)` labels.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let (batch, classes, height, width) = match logits.dims() {
            [b, k, h, w] => (*b, *k, *h, *w),
            dims => {
                return Err(TrainingError::runtime(format!(
                    "cross entropy expects (batch, classes, h, w) logits, got {dims:?}"
                )))
            }
        };
        if targets.dims() != [batch, height, width] {
            return Err(TrainingError::runtime(format!(
                "target shape {:?} does not match logits {:?}",
                targets.dims(),
                logits.dims()
            )));
        }

        let pixel_count = batch * height * width;
        if pixel_count == 0 || classes == 0 {
            return Err(TrainingError::runtime("no pixels available for loss computation"));
        }

        let device = logits.device();
        let logits_flat = logits
            .permute((0, 2, 3, 1))
            .and_then(|t| t.contiguous())
            .and_then(|t| t.reshape((pixel_count, classes)))
            .map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;

        let targets_flat = targets
            .to_device(device)
            .and_then(|t| t.to_dtype(DType::U32))
            .and_then(|t| t.reshape((pixel_count,)))
            .map_err(to_runtime_error)?;

        let (gather_targets, valid_mask) = match self.ignore_index {
            Some(ignore_index) => {
                let keep = targets_flat.ne(ignore_index).map_err(to_runtime_error)?;
                // Ignored labels may lie outside the class range; point them at
                // class 0 so the gather stays in bounds. The mask zeroes them.
                let zeros = targets_flat.zeros_like().map_err(to_runtime_error)?;
                let safe = keep
                    .where_cond(&targets_flat, &zeros)
                    .map_err(to_runtime_error)?;
                let mask = keep.to_dtype(DType::F32).map_err(to_runtime_error)?;
                (safe, mask)
            }
            None => {
                let mask =
                    Tensor::ones((pixel_count,), DType::F32, device).map_err(to_runtime_error)?;
                (targets_flat, mask)
            }
        };

        let nll = log_probs
            .gather(&gather_targets.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .and_then(|t| t.squeeze(1))
            .and_then(|t| t.neg())
            .map_err(to_runtime_error)?;
        let loss = (nll * &valid_mask)
            .and_then(|t| t.sum_all())
            .map_err(to_runtime_error)?;

        let loss_sum = loss
            .to_dtype(DType::F64)
            .and_then(|t| t.to_vec0::<f64>())
            .map_err(to_runtime_error)?;
        let valid = valid_mask
            .sum_all()
            .and_then(|t| t.to_vec0::<f32>())
            .map_err(to_runtime_error)?
            .round() as usize;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics { loss_sum, valid },
        })
    }
}

/// Number of targets that are not `ignore_index`.
pub fn valid_target_count(targets: &Tensor, ignore_index: Option<u32>) -> Result<usize, TrainingError> {
    let Some(ignore_index) = ignore_index else {
        return Ok(targets.elem_count());
    };
    let count = targets
        .to_dtype(DType::U32)
        .and_then(|t| t.ne(ignore_index))
        .and_then(|t| t.to_dtype(DType::U32))
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_vec0::<u32>())
        .map_err(to_runtime_error)?;
    Ok(count as usize)
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar, attached to the autograd graph.
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossMetrics {
    pub loss_sum: f64,
    pub valid: usize,
}
