use std::time::{Duration, Instant};

use candle_core::{Device, Tensor};
use candle_nn::ops;
use log::{debug, warn};
use segmodel::SegmentationModel;

use crate::{
    config::DegenerateBatchPolicy,
    data::{BlockingDataLoader, DataLoader, LogicalBatch},
    error::to_runtime_error,
    logging::{ConsoleLogger, IntervalRecord, PredictionImage, VisualLogger},
    metrics::{MetricMap, MetricsEngine},
    optimizer::TrainerOptimizer,
    replica::ReplicaSet,
    step::StepExecutor,
    TrainingError,
};

/// Where the runner is within an epoch. Step indices are 1-based counts of
/// completed optimizer steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochPhase {
    Idle,
    Running(usize),
    LoggingInterval(usize),
    Complete,
}

#[derive(Debug, Clone, Copy)]
pub struct EpochSettings {
    pub log_interval: usize,
    pub degenerate_batches: DegenerateBatchPolicy,
}

/// Rolling metrics reported at one logging boundary.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub step: usize,
    pub window_steps: usize,
    pub metrics: MetricMap,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub steps: usize,
    pub skipped_batches: usize,
    pub samples: usize,
    pub metrics: MetricMap,
    pub learning_rate: f64,
    pub intervals: Vec<LogRecord>,
    pub elapsed: Duration,
}

/// Borrowed collaborators for one epoch.
pub struct EpochContext<'a> {
    pub model: &'a dyn SegmentationModel,
    pub replicas: &'a ReplicaSet,
    pub optimizer: &'a mut TrainerOptimizer,
    pub console: &'a mut dyn ConsoleLogger,
    pub visual: &'a mut dyn VisualLogger,
}

/// Drives the step executor over one pass of the training data while keeping
/// a rolling accumulator (reset at every logging boundary) and a full-epoch
/// accumulator (never reset within the epoch).
///
/// Logging boundaries fall after the first step and then after every
/// `log_interval` steps: steps `1, 1 + k, 1 + 2k, ...`.
pub struct EpochRunner<M> {
    executor: StepExecutor,
    settings: EpochSettings,
    rolling: M,
    full: M,
    phase: EpochPhase,
}

impl<M> EpochRunner<M>
where
    M: MetricsEngine + Clone,
{
    pub fn new(
        executor: StepExecutor,
        settings: EpochSettings,
        mut metrics: M,
    ) -> Result<Self, TrainingError> {
        if settings.log_interval == 0 {
            return Err(TrainingError::initialization(
                "log_interval must be greater than zero",
            ));
        }
        metrics.reset();
        Ok(Self {
            executor,
            settings,
            rolling: metrics.clone(),
            full: metrics,
            phase: EpochPhase::Idle,
        })
    }

    pub fn phase(&self) -> EpochPhase {
        self.phase
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn run<L: DataLoader>(
        &mut self,
        epoch: usize,
        loader: &mut BlockingDataLoader<L>,
        ctx: &mut EpochContext<'_>,
    ) -> Result<EpochSummary, TrainingError> {
        self.phase = EpochPhase::Idle;
        self.rolling.reset();
        self.full.reset();
        loader.start_epoch(epoch)?;

        let started = Instant::now();
        let mut boundary = started;
        let mut steps = 0usize;
        let mut window_steps = 0usize;
        let mut skipped_batches = 0usize;
        let mut samples = 0usize;
        let mut intervals = Vec::new();
        let mut batch_index = 0usize;

        while let Some(batch) = loader.next_batch()? {
            batch_index += 1;
            self.phase = EpochPhase::Running(steps + 1);
            let output = match self.executor.step_replicated(
                ctx.model,
                ctx.replicas,
                ctx.optimizer,
                &batch.inputs,
                &batch.targets,
            ) {
                Ok(output) => output,
                Err(TrainingError::DegenerateBatch)
                    if self.settings.degenerate_batches == DegenerateBatchPolicy::Skip =>
                {
                    warn!(
                        "epoch {epoch}: skipping batch {batch_index} ({} examples) with no valid targets",
                        batch.len()
                    );
                    skipped_batches += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            steps += 1;
            window_steps += 1;
            samples += batch.len();

            let predictions = predict_labels(&output.outputs)?;
            let predicted = flatten_labels(&predictions)?;
            let targets = flatten_labels(&batch.targets)?;
            let loss = output.normalized_loss();
            self.rolling.add(&predicted, &targets, loss)?;
            self.full.add(&predicted, &targets, loss)?;

            if (steps - 1) % self.settings.log_interval == 0 {
                self.phase = EpochPhase::LoggingInterval(steps);
                let metrics = self.rolling.metrics().without_classes();
                let elapsed = boundary.elapsed();
                ctx.console.log_interval(&IntervalRecord {
                    epoch,
                    step: steps,
                    batches_per_epoch: loader.batches_per_epoch(),
                    samples_seen: samples,
                    dataset_len: loader.dataset_len(),
                    metrics: &metrics,
                    elapsed,
                })?;
                let image = first_example(&batch, &predictions)?;
                ctx.visual
                    .log_prediction(&format!("train_epoch{epoch:03}"), steps, &image)?;
                intervals.push(LogRecord {
                    step: steps,
                    window_steps,
                    metrics,
                    elapsed,
                });
                self.rolling.reset();
                window_steps = 0;
                boundary = Instant::now();
            }
        }

        self.phase = EpochPhase::Complete;
        let metrics = self.full.metrics();
        let learning_rate = ctx.optimizer.learning_rate();
        ctx.visual.log_metrics("train", epoch, &metrics)?;
        ctx.visual.log_learning_rate(epoch, learning_rate)?;
        debug!("epoch {epoch} finished {steps} step(s), skipped {skipped_batches}");

        Ok(EpochSummary {
            epoch,
            steps,
            skipped_batches,
            samples,
            metrics,
            learning_rate,
            intervals,
            elapsed: started.elapsed(),
        })
    }
}

/// Softmax over the class dimension followed by arg-max: `(n, k, h, w)` to
/// `(n, h, w)` u32 labels.
pub fn predict_labels(logits: &Tensor) -> Result<Tensor, TrainingError> {
    let probabilities = ops::softmax(logits, 1).map_err(to_runtime_error)?;
    probabilities.argmax(1).map_err(to_runtime_error)
}

pub(crate) fn flatten_labels(labels: &Tensor) -> Result<Vec<u32>, TrainingError> {
    labels
        .to_device(&Device::Cpu)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<u32>())
        .map_err(to_runtime_error)
}

pub(crate) fn first_example(
    batch: &LogicalBatch,
    predictions: &Tensor,
) -> Result<PredictionImage, TrainingError> {
    let first = |tensor: &Tensor| {
        tensor
            .get(0)
            .and_then(|t| t.to_device(&Device::Cpu))
            .map_err(to_runtime_error)
    };
    Ok(PredictionImage {
        input: first(&batch.inputs)?,
        target: first(&batch.targets)?,
        prediction: first(predictions)?,
    })
}
