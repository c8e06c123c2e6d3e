//! Gradient-accumulating training controller for dense segmentation models.
//!
//! A [`Trainer`] resolves its collaborators by name through a
//! [`ComponentRegistry`], then loops over epochs: the [`EpochRunner`] feeds
//! each logical batch to the [`StepExecutor`], which splits it into
//! micro-batches that fit the device and applies a single optimizer update.
//! Validation, checkpointing and the learning-rate schedule follow every
//! epoch.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod epoch;
pub mod error;
pub mod evaluate;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod registry;
pub mod replica;
pub mod scheduler;
pub mod seed;
pub mod step;
pub mod trainer;

pub use checkpoint::{
    load_architecture, latest_checkpoint, ArchitectureMetadata, CheckpointManager,
    CheckpointState, ResumeSource, ResumeTarget, RunManifest,
};
pub use config::{
    ConfigOverride, DegenerateBatchPolicy, LossReduction, RunConfigSnapshot, TrainingConfig,
};
pub use data::{BlockingDataLoader, DataLoader, DatasetMode, LogicalBatch, SegmentationDataset};
pub use device::{AutoPlacement, CpuPlacement, DevicePlacement, Placement};
pub use epoch::{EpochContext, EpochPhase, EpochRunner, EpochSettings, EpochSummary, LogRecord};
pub use error::TrainingError;
pub use evaluate::{Evaluator, SegmentationEvaluator};
pub use logging::{ConsoleLogger, PredictionImage, VisualLogger};
pub use loss::{CrossEntropyLoss, LossMetrics, LossOutput};
pub use metrics::{MetricMap, MetricsEngine, SegmentationMetrics};
pub use optimizer::{OptimizerState, TrainerOptimizer};
pub use registry::ComponentRegistry;
pub use replica::ReplicaSet;
pub use scheduler::{LRScheduler, SchedulerState};
pub use seed::SeedManager;
pub use step::{SplitPlan, StepExecutor, StepOutput};
pub use trainer::{Loggers, RunSummary, Trainer, TrainerBuilder, TrainingState};
