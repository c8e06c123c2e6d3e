//! Data-parallel copies of the trained model.
//!
//! The primary model owns the parameters the optimizer updates. Each replica
//! lives on another device and receives a fresh copy of the primary weights
//! before it is used; micro-batches are sharded across the primary and the
//! replicas and every replica gradient is reduced back onto the primary.

use candle_core::{backprop::GradStore, Device, Tensor};
use segmodel::SegmentationModel;

use crate::{error::to_runtime_error, TrainingError};

#[derive(Default)]
pub struct ReplicaSet {
    replicas: Vec<Box<dyn SegmentationModel>>,
}

impl ReplicaSet {
    /// Single-device execution.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(replicas: Vec<Box<dyn SegmentationModel>>) -> Self {
        Self { replicas }
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Primary plus replicas.
    pub fn device_count(&self) -> usize {
        1 + self.replicas.len()
    }

    pub fn replicas(&self) -> impl Iterator<Item = &dyn SegmentationModel> {
        self.replicas.iter().map(|replica| replica.as_ref())
    }

    /// Copies every primary parameter onto each replica's device.
    pub fn broadcast(&self, primary: &dyn SegmentationModel) -> Result<(), TrainingError> {
        let source = primary.parameters();
        for replica in &self.replicas {
            let target = replica.parameters();
            if source.len() != target.len() {
                return Err(TrainingError::runtime(format!(
                    "replica has {} parameters but the primary model has {}",
                    target.len(),
                    source.len()
                )));
            }
            for ((name, var), (replica_name, replica_var)) in source.iter().zip(&target) {
                if name != replica_name {
                    return Err(TrainingError::runtime(format!(
                        "replica parameter '{replica_name}' does not match primary '{name}'"
                    )));
                }
                let value = var
                    .as_tensor()
                    .to_device(replica_var.device())
                    .map_err(to_runtime_error)?;
                replica_var.set(&value).map_err(to_runtime_error)?;
            }
        }
        Ok(())
    }

    /// Splits `size` examples into at most `device_count` contiguous shards
    /// of `ceil(size / device_count)`; the primary always takes the first.
    pub fn shard_sizes(&self, size: usize) -> Vec<usize> {
        let chunk = size.div_ceil(self.device_count()).max(1);
        let mut sizes = Vec::with_capacity(self.device_count());
        let mut remaining = size;
        while remaining > 0 {
            let shard = chunk.min(remaining);
            sizes.push(shard);
            remaining -= shard;
        }
        sizes
    }

    /// Model that runs shard `index`: the primary for 0, replica `index - 1`
    /// otherwise.
    pub(crate) fn shard_model<'a>(
        &'a self,
        primary: &'a dyn SegmentationModel,
        index: usize,
    ) -> &'a dyn SegmentationModel {
        match index {
            0 => primary,
            _ => self.replicas[index - 1].as_ref(),
        }
    }

    /// Sharded forward pass with detached outputs gathered on `device` in
    /// input order. Replicas must already hold the primary weights.
    pub fn forward(
        &self,
        primary: &dyn SegmentationModel,
        inputs: &Tensor,
        device: &Device,
    ) -> Result<Tensor, TrainingError> {
        let batch_size = inputs.dims().first().copied().unwrap_or(0);
        let mut outputs = Vec::with_capacity(self.device_count());
        let mut offset = 0usize;
        for (index, size) in self.shard_sizes(batch_size).into_iter().enumerate() {
            let model = self.shard_model(primary, index);
            let shard = inputs
                .narrow(0, offset, size)
                .and_then(|t| t.to_device(&model.spec().device))
                .map_err(to_runtime_error)?;
            offset += size;
            let logits = model
                .forward(&shard)
                .and_then(|t| t.detach().to_device(device))
                .map_err(to_runtime_error)?;
            outputs.push(logits);
        }
        Tensor::cat(&outputs, 0).map_err(to_runtime_error)
    }
}

/// Adds the gradients a replica produced for its own parameters into `accum`,
/// keyed by the matching primary parameters and moved to `device`.
pub(crate) fn reduce_replica_gradients(
    parameters: &[Tensor],
    replica: &dyn SegmentationModel,
    accum: &mut GradStore,
    grads: GradStore,
    device: &Device,
) -> Result<(), TrainingError> {
    for (tensor, (_, var)) in parameters.iter().zip(replica.parameters()) {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let grad = grad.to_device(device).map_err(to_runtime_error)?;
            let combined = match accum.remove(tensor) {
                Some(existing) => existing.add(&grad).map_err(to_runtime_error)?,
                None => grad,
            };
            accum.insert(tensor, combined);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::{rngs::StdRng, SeedableRng};
    use segmodel::ModelSpec;
    use serde_json::json;

    fn pointwise(seed: u64) -> Box<dyn SegmentationModel> {
        let spec = ModelSpec::new(2, 3, json!({}), Device::Cpu);
        segmodel::build_model("pointwise", spec, &mut StdRng::seed_from_u64(seed)).unwrap()
    }

    fn replicas(count: usize) -> ReplicaSet {
        ReplicaSet::new((0..count).map(|i| pointwise(100 + i as u64)).collect())
    }

    #[test]
    fn shards_follow_chunked_scatter() {
        assert_eq!(ReplicaSet::none().shard_sizes(5), vec![5]);
        assert_eq!(replicas(1).shard_sizes(5), vec![3, 2]);
        assert_eq!(replicas(2).shard_sizes(7), vec![3, 3, 1]);
        // Fewer examples than devices leaves the last replica idle.
        assert_eq!(replicas(2).shard_sizes(2), vec![1, 1]);
    }

    #[test]
    fn broadcast_copies_primary_weights() -> anyhow::Result<()> {
        let primary = pointwise(1);
        let set = replicas(2);
        set.broadcast(primary.as_ref())?;
        for replica in set.replicas() {
            for ((_, a), (_, b)) in primary.parameters().iter().zip(replica.parameters()) {
                let a = a.as_tensor().flatten_all()?.to_vec1::<f32>()?;
                let b = b.as_tensor().flatten_all()?.to_vec1::<f32>()?;
                assert_eq!(a, b);
            }
        }
        Ok(())
    }

    #[test]
    fn broadcast_rejects_a_different_layout() {
        let primary = pointwise(1);
        let spec = ModelSpec::new(2, 3, json!({"bias": false}), Device::Cpu);
        let other =
            segmodel::build_model("pointwise", spec, &mut StdRng::seed_from_u64(2)).unwrap();
        let set = ReplicaSet::new(vec![other]);
        assert!(set.broadcast(primary.as_ref()).is_err());
    }

    #[test]
    fn sharded_forward_matches_a_single_pass() -> anyhow::Result<()> {
        let primary = pointwise(1);
        let set = replicas(2);
        set.broadcast(primary.as_ref())?;
        let inputs = Tensor::arange(0f32, 5.0 * 2.0 * 3.0 * 3.0, &Device::Cpu)?
            .affine(0.01, -0.3)?
            .reshape((5, 2, 3, 3))?;

        let sharded = set.forward(primary.as_ref(), &inputs, &Device::Cpu)?;
        let whole = primary.forward(&inputs)?;
        let diff = sharded.sub(&whole)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-6, "max difference {diff}");
        Ok(())
    }
}
