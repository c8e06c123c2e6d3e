use candle_core::{Device, Tensor};
use log::debug;
use segmodel::SegmentationModel;

use crate::{
    data::{BlockingDataLoader, DataLoader},
    epoch::{first_example, flatten_labels, predict_labels},
    error::to_runtime_error,
    logging::{ConsoleLogger, VisualLogger},
    loss::CrossEntropyLoss,
    metrics::{MetricMap, MetricsEngine},
    replica::ReplicaSet,
    step::SplitPlan,
    TrainingError,
};

/// Scores a model on held-out data without touching its parameters.
pub trait Evaluator {
    fn evaluate(
        &mut self,
        model: &dyn SegmentationModel,
        replicas: &ReplicaSet,
        epoch: usize,
        console: &mut dyn ConsoleLogger,
        visual: &mut dyn VisualLogger,
    ) -> Result<MetricMap, TrainingError>;
}

pub struct SegmentationEvaluator<L: DataLoader, M> {
    loader: BlockingDataLoader<L>,
    loss: CrossEntropyLoss,
    device: Device,
    max_micro_batch: usize,
    log_images_interval: usize,
    metrics: M,
}

impl<L, M> SegmentationEvaluator<L, M>
where
    L: DataLoader,
    M: MetricsEngine,
{
    /// `log_images_interval == 0` disables validation images.
    pub fn new(
        loader: BlockingDataLoader<L>,
        loss: CrossEntropyLoss,
        device: Device,
        max_micro_batch: usize,
        log_images_interval: usize,
        metrics: M,
    ) -> Result<Self, TrainingError> {
        if max_micro_batch == 0 {
            return Err(TrainingError::initialization(
                "evaluation micro-batch size must be greater than zero",
            ));
        }
        Ok(Self {
            loader,
            loss,
            device,
            max_micro_batch,
            log_images_interval,
            metrics,
        })
    }

    /// Each chunk is sharded across the primary and the replicas, so a device
    /// never sees more than `max_micro_batch` examples at once.
    fn forward_chunked(
        &self,
        model: &dyn SegmentationModel,
        replicas: &ReplicaSet,
        inputs: &Tensor,
        targets: &Tensor,
    ) -> Result<(Tensor, f64, usize), TrainingError> {
        let batch_size = inputs.dims().first().copied().unwrap_or(0);
        let plan = SplitPlan::from_max_micro_batch(
            batch_size,
            self.max_micro_batch * replicas.device_count(),
        )?;
        let inputs = inputs.to_device(&self.device).map_err(to_runtime_error)?;
        let targets = targets.to_device(&self.device).map_err(to_runtime_error)?;

        let mut outputs = Vec::with_capacity(plan.len());
        let mut loss_sum = 0f64;
        let mut valid = 0usize;
        let mut offset = 0usize;
        for &size in plan.sizes() {
            let chunk = inputs.narrow(0, offset, size).map_err(to_runtime_error)?;
            let chunk_targets = targets.narrow(0, offset, size).map_err(to_runtime_error)?;
            offset += size;
            let logits = replicas.forward(model, &chunk, &self.device)?;
            let loss = self.loss.compute(&logits, &chunk_targets)?;
            loss_sum += loss.metrics.loss_sum;
            valid += loss.metrics.valid;
            outputs.push(logits);
        }
        let outputs = Tensor::cat(&outputs, 0).map_err(to_runtime_error)?;
        Ok((outputs, loss_sum, valid))
    }
}

impl<L, M> Evaluator for SegmentationEvaluator<L, M>
where
    L: DataLoader,
    M: MetricsEngine,
{
    fn evaluate(
        &mut self,
        model: &dyn SegmentationModel,
        replicas: &ReplicaSet,
        epoch: usize,
        console: &mut dyn ConsoleLogger,
        visual: &mut dyn VisualLogger,
    ) -> Result<MetricMap, TrainingError> {
        self.metrics.reset();
        self.loader.start_epoch(epoch)?;
        replicas.broadcast(model)?;

        let mut index = 0usize;
        while let Some(batch) = self.loader.next_batch()? {
            let (outputs, loss_sum, valid) =
                self.forward_chunked(model, replicas, &batch.inputs, &batch.targets)?;
            let loss = if valid == 0 {
                0.0
            } else {
                loss_sum / valid as f64
            };
            let predictions = predict_labels(&outputs)?;
            self.metrics.add(
                &flatten_labels(&predictions)?,
                &flatten_labels(&batch.targets)?,
                loss,
            )?;

            if self.log_images_interval > 0 && index % self.log_images_interval == 0 {
                let image = first_example(&batch, &predictions)?;
                visual.log_prediction(&format!("val_epoch{epoch:03}"), index, &image)?;
            }
            index += 1;
        }
        debug!("validation for epoch {epoch} covered {index} batch(es)");

        let metrics = self.metrics.metrics();
        console.log_validation(epoch, &metrics)?;
        visual.log_metrics("val", epoch, &metrics)?;
        Ok(metrics)
    }
}
