use candle_core::{backprop::GradStore, Device, Tensor};
use segmodel::SegmentationModel;

use crate::{
    config::LossReduction,
    error::to_runtime_error,
    loss::{valid_target_count, CrossEntropyLoss, LossOutput},
    optimizer::TrainerOptimizer,
    replica::{reduce_replica_gradients, ReplicaSet},
    TrainingError,
};

/// Ordered micro-batch sizes for one logical batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPlan {
    sizes: Vec<usize>,
}

impl SplitPlan {
    pub fn new(sizes: Vec<usize>) -> Result<Self, TrainingError> {
        if sizes.is_empty() || sizes.contains(&0) {
            return Err(TrainingError::runtime(format!(
                "split plan must contain only non-empty micro-batches (got {sizes:?})"
            )));
        }
        Ok(Self { sizes })
    }

    /// Chunks of `max_micro_batch` with a smaller trailing chunk.
    pub fn from_max_micro_batch(batch_size: usize, max_micro_batch: usize) -> Result<Self, TrainingError> {
        if batch_size == 0 || max_micro_batch == 0 {
            return Err(TrainingError::runtime(
                "batch size and micro-batch size must be greater than zero",
            ));
        }
        let mut sizes = vec![max_micro_batch; batch_size / max_micro_batch];
        if batch_size % max_micro_batch != 0 {
            sizes.push(batch_size % max_micro_batch);
        }
        Self::new(sizes)
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn total(&self) -> usize {
        self.sizes.iter().sum()
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

/// Result of one logical batch.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Detached model outputs for the whole batch, in input order.
    pub outputs: Tensor,
    /// Summed loss over every micro-batch, before any normalization.
    pub step_loss: f64,
    /// Non-ignored targets in the logical batch.
    pub valid_count: usize,
    pub micro_batches: usize,
}

impl StepOutput {
    pub fn normalized_loss(&self) -> f64 {
        if self.valid_count == 0 {
            0.0
        } else {
            self.step_loss / self.valid_count as f64
        }
    }
}

/// Runs a logical batch as sequential micro-batches with a single optimizer
/// update.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    loss: CrossEntropyLoss,
    device: Device,
    reduction: LossReduction,
    max_micro_batch: usize,
}

impl StepExecutor {
    pub fn new(
        loss: CrossEntropyLoss,
        device: Device,
        reduction: LossReduction,
        max_micro_batch: usize,
    ) -> Self {
        Self {
            loss,
            device,
            reduction,
            max_micro_batch,
        }
    }

    pub fn loss(&self) -> &CrossEntropyLoss {
        &self.loss
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn plan_for(&self, batch_size: usize) -> Result<SplitPlan, TrainingError> {
        SplitPlan::from_max_micro_batch(batch_size, self.max_micro_batch)
    }

    /// Trains on `inputs`/`targets` split by the default plan.
    pub fn step(
        &self,
        model: &dyn SegmentationModel,
        optimizer: &mut TrainerOptimizer,
        inputs: &Tensor,
        targets: &Tensor,
    ) -> Result<StepOutput, TrainingError> {
        self.step_replicated(model, &ReplicaSet::none(), optimizer, inputs, targets)
    }

    /// Like [`StepExecutor::step`], with every micro-batch sharded across the
    /// primary model and `replicas`. Micro-batches grow with the device count
    /// so each device still sees at most `max_micro_batch` examples.
    pub fn step_replicated(
        &self,
        model: &dyn SegmentationModel,
        replicas: &ReplicaSet,
        optimizer: &mut TrainerOptimizer,
        inputs: &Tensor,
        targets: &Tensor,
    ) -> Result<StepOutput, TrainingError> {
        let plan = SplitPlan::from_max_micro_batch(
            inputs.dims().first().copied().unwrap_or(0),
            self.max_micro_batch * replicas.device_count(),
        )?;
        self.step_with_replicas(model, replicas, optimizer, inputs, targets, &plan)
    }

    pub fn step_with_plan(
        &self,
        model: &dyn SegmentationModel,
        optimizer: &mut TrainerOptimizer,
        inputs: &Tensor,
        targets: &Tensor,
        plan: &SplitPlan,
    ) -> Result<StepOutput, TrainingError> {
        self.step_with_replicas(model, &ReplicaSet::none(), optimizer, inputs, targets, plan)
    }

    /// The valid-target count is taken over the whole batch before splitting
    /// and, under mean reduction, divides every shard loss before its
    /// backward pass. Gradients from all micro-batches and devices feed
    /// exactly one optimizer update on the primary model.
    pub fn step_with_replicas(
        &self,
        model: &dyn SegmentationModel,
        replicas: &ReplicaSet,
        optimizer: &mut TrainerOptimizer,
        inputs: &Tensor,
        targets: &Tensor,
        plan: &SplitPlan,
    ) -> Result<StepOutput, TrainingError> {
        let batch_size = inputs.dims().first().copied().unwrap_or(0);
        if plan.total() != batch_size {
            return Err(TrainingError::runtime(format!(
                "split plan {:?} covers {} examples but the batch has {}",
                plan.sizes(),
                plan.total(),
                batch_size
            )));
        }
        if targets.dims().first().copied() != Some(batch_size) {
            return Err(TrainingError::runtime(format!(
                "inputs {:?} and targets {:?} disagree on batch size",
                inputs.dims(),
                targets.dims()
            )));
        }

        let valid_count = valid_target_count(targets, self.loss.ignore_index())?;
        if valid_count == 0 && self.reduction == LossReduction::Mean {
            return Err(TrainingError::DegenerateBatch);
        }

        let inputs = inputs.to_device(&self.device).map_err(to_runtime_error)?;
        let targets = targets.to_device(&self.device).map_err(to_runtime_error)?;
        replicas.broadcast(model)?;
        let parameters: Vec<Tensor> = model
            .parameters()
            .iter()
            .map(|(_, var)| var.as_tensor().clone())
            .collect();

        let mut outputs = Vec::with_capacity(plan.len() * replicas.device_count());
        let mut accumulated: Option<GradStore> = None;
        let mut step_loss = 0f64;
        let mut offset = 0usize;

        for &size in plan.sizes() {
            for (index, shard) in replicas.shard_sizes(size).into_iter().enumerate() {
                let shard_model = replicas.shard_model(model, index);
                let device = &shard_model.spec().device;
                let shard_inputs = inputs
                    .narrow(0, offset, shard)
                    .and_then(|t| t.to_device(device))
                    .map_err(to_runtime_error)?;
                let shard_targets = targets
                    .narrow(0, offset, shard)
                    .and_then(|t| t.to_device(device))
                    .map_err(to_runtime_error)?;
                offset += shard;

                let logits = shard_model.forward(&shard_inputs).map_err(to_runtime_error)?;
                let LossOutput { loss, metrics } = self.loss.compute(&logits, &shard_targets)?;
                step_loss += metrics.loss_sum;

                let loss = match self.reduction {
                    LossReduction::Mean => loss
                        .affine(1.0 / valid_count as f64, 0.0)
                        .map_err(to_runtime_error)?,
                    LossReduction::Sum => loss,
                };
                let shard_grads = loss.backward().map_err(to_runtime_error)?;
                outputs.push(
                    logits
                        .detach()
                        .to_device(&self.device)
                        .map_err(to_runtime_error)?,
                );

                if index == 0 {
                    match accumulated.as_mut() {
                        Some(existing) => merge_gradient_store(&parameters, existing, shard_grads)?,
                        None => accumulated = Some(shard_grads),
                    }
                } else {
                    let Some(existing) = accumulated.as_mut() else {
                        return Err(TrainingError::runtime(
                            "replica gradients arrived before the primary pass",
                        ));
                    };
                    reduce_replica_gradients(
                        &parameters,
                        shard_model,
                        existing,
                        shard_grads,
                        &self.device,
                    )?;
                }
            }
        }

        let Some(mut grads) = accumulated else {
            return Err(TrainingError::runtime("split plan produced no micro-batches"));
        };
        optimizer.step(&grads)?;
        optimizer.zero_grad(&mut grads);

        let outputs = Tensor::cat(&outputs, 0).map_err(to_runtime_error)?;
        Ok(StepOutput {
            outputs,
            step_loss,
            valid_count,
            micro_batches: plan.len(),
        })
    }
}

/// Adds parameter gradients from `new_grads` into `accum`. Gradients of
/// intermediate tensors are dropped with `new_grads`.
fn merge_gradient_store(
    parameters: &[Tensor],
    accum: &mut GradStore,
    mut new_grads: GradStore,
) -> Result<(), TrainingError> {
    for tensor in parameters {
        if let Some(grad) = new_grads.remove(tensor) {
            let combined = match accum.remove(tensor) {
                Some(existing) => existing.add(&grad).map_err(to_runtime_error)?,
                None => grad,
            };
            accum.insert(tensor, combined);
        }
    }
    Ok(())
}
