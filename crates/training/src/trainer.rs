use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{info, warn};
use segmodel::{ModelSpec, SegmentationModel};

use crate::{
    checkpoint::{
        latest_checkpoint, ArchitectureMetadata, CheckpointManager, CheckpointState,
        ResumeSource, ResumeTarget,
    },
    config::{RunConfigSnapshot, TrainingConfig},
    data::{BlockingDataLoader, DatasetMode, SegmentationDataset, SegmentationLoader},
    device::{AutoPlacement, DevicePlacement, Placement},
    epoch::{EpochContext, EpochRunner, EpochSettings, EpochSummary},
    evaluate::{Evaluator, SegmentationEvaluator},
    logging::{ConsoleLogger, FileConsoleLogger, TensorBoardLogger, VisualLogger},
    loss::CrossEntropyLoss,
    metrics::{MetricMap, SegmentationMetrics},
    optimizer::{self, TrainerOptimizer},
    registry::ComponentRegistry,
    replica::ReplicaSet,
    scheduler::{build_scheduler, LRScheduler},
    seed::SeedManager,
    step::StepExecutor,
    TrainingError,
};

pub const RUN_CONFIG_FILENAME: &str = "run_config.toml";
pub const TRAIN_LOG_FILENAME: &str = "train.log";
pub const VISUAL_DIR: &str = "visual";
const VISUAL_FLUSH_EVERY: usize = 16;

#[derive(Debug, Clone)]
pub struct TrainingState {
    /// Epoch currently running, or the first epoch to run before `run`.
    pub epoch: usize,
    pub placement: Placement,
    pub seed: u64,
    pub continuing: bool,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub start_epoch: usize,
    pub epochs: Vec<EpochSummary>,
    pub validation: Vec<(usize, MetricMap)>,
    pub checkpoints: Vec<PathBuf>,
}

/// Replacement loggers, mainly for embedding and tests.
pub struct Loggers {
    pub console: Box<dyn ConsoleLogger>,
    pub visual: Box<dyn VisualLogger>,
}

pub struct TrainerBuilder {
    config: TrainingConfig,
    command: String,
    registry: Option<ComponentRegistry>,
    placement: Box<dyn DevicePlacement>,
    loggers: Option<Loggers>,
}

impl TrainerBuilder {
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn registry(mut self, registry: ComponentRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn placement(mut self, placement: impl DevicePlacement + 'static) -> Self {
        self.placement = Box::new(placement);
        self
    }

    pub fn loggers(mut self, loggers: Loggers) -> Self {
        self.loggers = Some(loggers);
        self
    }

    pub fn build(self) -> Result<Trainer, TrainingError> {
        let registry = self.registry.unwrap_or_default();
        Trainer::assemble(
            self.config,
            self.command,
            &registry,
            self.placement.as_ref(),
            self.loggers,
        )
    }
}

pub struct Trainer {
    config: TrainingConfig,
    snapshot: RunConfigSnapshot,
    state: TrainingState,
    model: Box<dyn SegmentationModel>,
    replicas: ReplicaSet,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    train_loader: BlockingDataLoader<SegmentationLoader>,
    runner: EpochRunner<SegmentationMetrics>,
    evaluator: Box<dyn Evaluator>,
    checkpoints: CheckpointManager,
    console: Box<dyn ConsoleLogger>,
    visual: Box<dyn VisualLogger>,
}

impl Trainer {
    pub fn builder(config: TrainingConfig) -> TrainerBuilder {
        TrainerBuilder {
            config,
            command: String::new(),
            registry: None,
            placement: Box::new(AutoPlacement),
            loggers: None,
        }
    }

    /// Builds a trainer with the bundled components and automatic placement.
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        Self::builder(config).build()
    }

    fn assemble(
        mut config: TrainingConfig,
        command: String,
        registry: &ComponentRegistry,
        placement: &dyn DevicePlacement,
        loggers: Option<Loggers>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let resume = resolve_resume_source(&mut config)?;
        registry.check(&config)?;
        prepare_output_dir(&config, resume.as_ref())?;

        let model_dir = config.model_dir.clone();
        let snapshot = RunConfigSnapshot {
            command,
            config: config.clone(),
        };
        snapshot.write(&model_dir.join(RUN_CONFIG_FILENAME))?;

        let placement = placement.place(&config.runtime)?;
        let device = placement.primary.clone();
        let seeds = SeedManager::new(config.runtime.seed);
        seeds.apply(&device);
        info!("placement: {} (seed {})", placement.describe(), seeds.seed());

        let train_set = registry.build_dataset(
            &config.dataset.name,
            &config.data_dir,
            &config.dataset.args,
            DatasetMode::Train,
        )?;
        let val_set = registry.build_dataset(
            &config.dataset.name,
            &config.data_dir,
            &config.dataset.args,
            DatasetMode::Val,
        )?;
        ensure_compatible(train_set.as_ref(), val_set.as_ref())?;
        let transformer =
            registry.build_transformer(&config.transformer.name, &config.transformer.args)?;

        let spec = ModelSpec::new(
            train_set.in_channels(),
            train_set.n_classes(),
            config.model.args.clone(),
            device.clone(),
        );
        let model = registry.build_model(&config.model.name, spec.clone(), &mut seeds.init_rng())?;
        let replicas = ReplicaSet::new(
            placement
                .replicas
                .iter()
                .map(|device| {
                    let spec = ModelSpec {
                        device: device.clone(),
                        ..spec.clone()
                    };
                    registry.build_model(&config.model.name, spec, &mut seeds.init_rng())
                })
                .collect::<Result<Vec<_>, _>>()?,
        );
        if !replicas.is_empty() {
            info!(
                "replicating '{}' across {} devices",
                config.model.name,
                replicas.device_count()
            );
        }
        let mut optimizer = TrainerOptimizer::new(
            model.parameters(),
            optimizer::OptimizerConfig::from_config(&config.optimizer)?,
        )?;
        let mut scheduler = build_scheduler(&config.scheduler, config.optimizer.learning_rate)?;
        optimizer.set_learning_rate(scheduler.learning_rate());

        let loss = CrossEntropyLoss::new().with_ignore_index(train_set.ignore_index());
        let metrics =
            SegmentationMetrics::new(train_set.labels().to_vec(), train_set.ignore_index());
        let micro_batch = config.micro_batch_size();

        let train_loader = BlockingDataLoader::new(SegmentationLoader::new(
            Arc::clone(&train_set),
            Arc::clone(&transformer),
            DatasetMode::Train,
            seeds,
            config.data.batch_size,
            config.data.num_workers,
        )?);
        let val_loader = BlockingDataLoader::new(SegmentationLoader::new(
            Arc::clone(&val_set),
            transformer,
            DatasetMode::Val,
            seeds,
            config.data.test_batch_size,
            config.data.num_workers,
        )?);

        let runner = EpochRunner::new(
            StepExecutor::new(
                loss.clone(),
                device.clone(),
                config.runtime.loss_reduction,
                micro_batch,
            ),
            EpochSettings {
                log_interval: config.runtime.log_interval,
                degenerate_batches: config.runtime.degenerate_batches,
            },
            metrics.clone(),
        )?;
        let evaluator = SegmentationEvaluator::new(
            val_loader,
            loss,
            device,
            micro_batch,
            config.runtime.log_images_interval,
            metrics,
        )?;

        let Loggers { console, visual } = match loggers {
            Some(loggers) => loggers,
            None => Loggers {
                console: Box::new(FileConsoleLogger::create(
                    &model_dir.join(TRAIN_LOG_FILENAME),
                )?),
                visual: Box::new(TensorBoardLogger::create(
                    &model_dir.join(VISUAL_DIR),
                    train_set.color_palette().to_vec(),
                    VISUAL_FLUSH_EVERY,
                )?),
            },
        };

        let checkpoints = CheckpointManager::new(
            &model_dir,
            config.checkpoint.save_every_n_epochs,
            config.checkpoint.max_keep,
            ArchitectureMetadata::new(config.model.name.clone(), model.spec()),
            &snapshot,
        )?;

        let continuing = matches!(resume, Some(ResumeSource::Latest));
        let mut start_epoch = 0;
        if let Some(source) = resume.as_ref() {
            start_epoch = checkpoints.resume(
                source,
                !config.checkpoint.allow_missing_keys,
                ResumeTarget {
                    model: model.as_ref(),
                    optimizer: &mut optimizer,
                    scheduler: scheduler.as_mut(),
                },
            )?;
            // Checkpoints are taken before the epoch-end scheduler step.
            optimizer.set_learning_rate(scheduler.step());
        }

        Ok(Self {
            state: TrainingState {
                epoch: start_epoch,
                placement,
                seed: config.runtime.seed,
                continuing,
            },
            config,
            snapshot,
            model,
            replicas,
            optimizer,
            scheduler,
            train_loader,
            runner,
            evaluator: Box::new(evaluator),
            checkpoints,
            console,
            visual,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn model(&self) -> &dyn SegmentationModel {
        self.model.as_ref()
    }

    pub fn optimizer(&self) -> &TrainerOptimizer {
        &self.optimizer
    }

    pub fn scheduler(&self) -> &dyn LRScheduler {
        self.scheduler.as_ref()
    }

    /// Runs `runtime.epochs` epochs from the current state: train, validate,
    /// checkpoint by cadence, then advance the scheduler.
    pub fn run(&mut self) -> Result<RunSummary, TrainingError> {
        let start_epoch = self.state.epoch;
        let mut summary = RunSummary {
            start_epoch,
            epochs: Vec::new(),
            validation: Vec::new(),
            checkpoints: Vec::new(),
        };
        self.visual.log_args(&serde_json::to_value(&self.snapshot)?)?;

        for epoch in start_epoch..start_epoch + self.config.runtime.epochs {
            self.state.epoch = epoch;
            info!(
                "epoch {epoch}: learning rate {:.6e}",
                self.optimizer.learning_rate()
            );

            let mut ctx = EpochContext {
                model: self.model.as_ref(),
                replicas: &self.replicas,
                optimizer: &mut self.optimizer,
                console: self.console.as_mut(),
                visual: self.visual.as_mut(),
            };
            let trained = self.runner.run(epoch, &mut self.train_loader, &mut ctx)?;
            if trained.skipped_batches > 0 {
                warn!(
                    "epoch {epoch}: skipped {} batch(es) without valid targets",
                    trained.skipped_batches
                );
            }
            summary.epochs.push(trained);

            let validation = self.evaluator.evaluate(
                self.model.as_ref(),
                &self.replicas,
                epoch,
                self.console.as_mut(),
                self.visual.as_mut(),
            )?;
            summary.validation.push((epoch, validation));

            let saved = self.checkpoints.save(&CheckpointState {
                epoch,
                model: self.model.as_ref(),
                optimizer: &self.optimizer,
                scheduler: self.scheduler.as_ref(),
            })?;
            summary.checkpoints.extend(saved);

            let learning_rate = self.scheduler.step();
            self.optimizer.set_learning_rate(learning_rate);
            self.visual.flush()?;
        }

        self.state.epoch = start_epoch + self.config.runtime.epochs;
        Ok(summary)
    }
}

/// Continuation wins over an explicit checkpoint path and requires an
/// existing run with at least one checkpoint.
fn resolve_resume_source(
    config: &mut TrainingConfig,
) -> Result<Option<ResumeSource>, TrainingError> {
    if config.checkpoint.continue_training {
        if let Some(path) = config.checkpoint.path.take() {
            warn!(
                "continue_training ignores checkpoint.path {}; using the latest checkpoint",
                path.display()
            );
        }
        if !config.model_dir.is_dir() {
            return Err(TrainingError::MissingCheckpoint(format!(
                "model directory {} does not exist",
                config.model_dir.display()
            )));
        }
        if latest_checkpoint(&config.model_dir)?.is_none() {
            return Err(TrainingError::MissingCheckpoint(format!(
                "no checkpoint found in {}",
                config.model_dir.display()
            )));
        }
        return Ok(Some(ResumeSource::Latest));
    }

    match config.checkpoint.path.as_ref() {
        Some(path) if !path.exists() => Err(TrainingError::MissingCheckpoint(format!(
            "checkpoint {} does not exist",
            path.display()
        ))),
        Some(path) => Ok(Some(ResumeSource::Path(path.clone()))),
        None => Ok(None),
    }
}

fn prepare_output_dir(
    config: &TrainingConfig,
    resume: Option<&ResumeSource>,
) -> Result<(), TrainingError> {
    let model_dir = &config.model_dir;
    if matches!(resume, Some(ResumeSource::Latest)) {
        return Ok(());
    }
    if is_non_empty_dir(model_dir)? {
        if !config.checkpoint.overwrite_output {
            return Err(TrainingError::OutputDirConflict(model_dir.clone()));
        }
        if let Some(ResumeSource::Path(path)) = resume {
            if path.starts_with(model_dir) {
                return Err(TrainingError::initialization(format!(
                    "checkpoint {} lives inside the output directory that would be cleared",
                    path.display()
                )));
            }
        }
        warn!("clearing existing output directory {}", model_dir.display());
        fs::remove_dir_all(model_dir)?;
    }
    fs::create_dir_all(model_dir)?;
    Ok(())
}

fn is_non_empty_dir(path: &Path) -> Result<bool, TrainingError> {
    if !path.exists() {
        return Ok(false);
    }
    if !path.is_dir() {
        return Err(TrainingError::initialization(format!(
            "output path {} is not a directory",
            path.display()
        )));
    }
    Ok(fs::read_dir(path)?.next().is_some())
}

fn ensure_compatible(
    train: &dyn SegmentationDataset,
    val: &dyn SegmentationDataset,
) -> Result<(), TrainingError> {
    if train.labels() != val.labels()
        || train.in_channels() != val.in_channels()
        || train.ignore_index() != val.ignore_index()
    {
        return Err(TrainingError::initialization(
            "train and validation splits disagree on labels, channels or ignore index",
        ));
    }
    Ok(())
}
