//! Reference segmentation models for the training controller.
//!
//! The controller only relies on [`SegmentationModel`]; the architectures here
//! exist so runs can be configured by name without external code.

pub mod block;
pub mod config;
pub mod init;
pub mod model;

use candle_core::{Error, Result, Tensor, Var};
use rand::rngs::StdRng;

pub use config::ModelSpec;
pub use model::{FullyConvNet, PointwiseClassifier};

/// Dense per-pixel classifier: `(batch, in_channels, h, w)` inputs produce
/// `(batch, n_classes, h, w)` class scores.
pub trait SegmentationModel: Send {
    fn forward(&self, inputs: &Tensor) -> Result<Tensor>;

    /// Trainable parameters keyed by stable, dot-separated names.
    fn parameters(&self) -> Vec<(String, Var)>;

    fn spec(&self) -> &ModelSpec;
}

/// Names accepted by [`build_model`].
pub const MODEL_NAMES: &[&str] = &["pointwise", "fcn"];

pub fn build_model(
    name: &str,
    spec: ModelSpec,
    rng: &mut StdRng,
) -> Result<Box<dyn SegmentationModel>> {
    match name {
        "pointwise" => Ok(Box::new(PointwiseClassifier::new(spec, rng)?)),
        "fcn" => Ok(Box::new(FullyConvNet::new(spec, rng)?)),
        other => Err(Error::Msg(format!(
            "unknown model '{other}' (expected one of {})",
            MODEL_NAMES.join(", ")
        ))),
    }
}
