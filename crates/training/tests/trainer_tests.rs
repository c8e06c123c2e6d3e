mod common;

use std::{
    fs,
    sync::{Arc, Mutex},
};

use candle_core::{DType, Device, Tensor};
use common::{optimizer_for, pointwise, synthetic_config, Recorder};
use segtrain::{
    config::RuntimeConfig,
    data::{Identity, Sample, SegmentationLoader, SyntheticDataset},
    BlockingDataLoader, CpuPlacement, CrossEntropyLoss, DatasetMode, DegenerateBatchPolicy,
    DevicePlacement, EpochContext, EpochPhase, EpochRunner, EpochSettings, Loggers,
    LossReduction, MetricMap, MetricsEngine, Placement, ReplicaSet, RunConfigSnapshot,
    SeedManager, SegmentationDataset, SegmentationMetrics, StepExecutor, Trainer,
    TrainingError,
};
use serde_json::json;

/// `(predictions, targets, loss)` handed to a metrics engine for one step.
type StepRecord = (Vec<u32>, Vec<u32>, f64);

/// Segmentation metrics that also keep a copy of every step they receive.
/// Clones forward to their own metrics but do not record.
struct Tapped {
    inner: SegmentationMetrics,
    tap: Option<Arc<Mutex<Vec<StepRecord>>>>,
}

impl Clone for Tapped {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            tap: None,
        }
    }
}

impl MetricsEngine for Tapped {
    fn add(&mut self, predictions: &[u32], targets: &[u32], loss: f64) -> Result<(), TrainingError> {
        if let Some(tap) = &self.tap {
            tap.lock()
                .unwrap()
                .push((predictions.to_vec(), targets.to_vec(), loss));
        }
        self.inner.add(predictions, targets, loss)
    }

    fn metrics(&self) -> MetricMap {
        self.inner.metrics()
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

/// Metrics of one engine fed the concatenation of `steps`, with the loss
/// averaged per step as the accumulators do.
fn concatenated_metrics(labels: &[String], ignore: Option<u32>, steps: &[StepRecord]) -> MetricMap {
    let mut metrics = SegmentationMetrics::new(labels.to_vec(), ignore);
    let predictions: Vec<u32> = steps.iter().flat_map(|s| s.0.iter().copied()).collect();
    let targets: Vec<u32> = steps.iter().flat_map(|s| s.1.iter().copied()).collect();
    let loss = steps.iter().map(|s| s.2).sum::<f64>() / steps.len() as f64;
    metrics.add(&predictions, &targets, loss).unwrap();
    metrics.metrics()
}

fn synthetic_loader(samples: usize) -> anyhow::Result<(Arc<SyntheticDataset>, BlockingDataLoader<SegmentationLoader>)> {
    let dataset = Arc::new(SyntheticDataset::from_args(
        &json!({"train_samples": samples, "height": 4, "width": 4, "seed": 2}),
        DatasetMode::Train,
    )?);
    let loader = BlockingDataLoader::new(SegmentationLoader::new(
        dataset.clone(),
        Arc::new(Identity),
        DatasetMode::Train,
        SeedManager::new(3),
        2,
        0,
    )?);
    Ok((dataset, loader))
}

fn sgd_executor(dataset: &SyntheticDataset) -> StepExecutor {
    StepExecutor::new(
        CrossEntropyLoss::new().with_ignore_index(dataset.ignore_index()),
        Device::Cpu,
        LossReduction::Mean,
        1,
    )
}

fn recording_loggers(recorder: &Recorder) -> Loggers {
    Loggers {
        console: Box::new(recorder.clone()),
        visual: Box::new(recorder.clone()),
    }
}

#[test]
fn rolling_metrics_reset_every_log_interval() -> anyhow::Result<()> {
    let (dataset, mut loader) = synthetic_loader(10)?;
    let total_valid: u64 = (0..dataset.len())
        .map(|i| {
            let target = dataset.get(i).unwrap().target;
            let labels = target.flatten_all().unwrap().to_vec1::<u32>().unwrap();
            labels.iter().filter(|&&l| l != 255).count() as u64
        })
        .sum();

    let model = pointwise(3, 3, json!({}), 5);
    let mut optimizer = optimizer_for(model.as_ref(), "sgd", 0.05);
    let tap = Arc::new(Mutex::new(Vec::new()));
    let mut runner = EpochRunner::new(
        sgd_executor(&dataset),
        EpochSettings {
            log_interval: 2,
            degenerate_batches: DegenerateBatchPolicy::Fail,
        },
        Tapped {
            inner: SegmentationMetrics::new(dataset.labels().to_vec(), dataset.ignore_index()),
            tap: Some(tap.clone()),
        },
    )?;
    assert_eq!(runner.phase(), EpochPhase::Idle);

    let recorder = Recorder::default();
    let mut console = recorder.clone();
    let mut visual = recorder.clone();
    let summary = runner.run(
        0,
        &mut loader,
        &mut EpochContext {
            model: model.as_ref(),
            replicas: &ReplicaSet::none(),
            optimizer: &mut optimizer,
            console: &mut console,
            visual: &mut visual,
        },
    )?;

    assert_eq!(runner.phase(), EpochPhase::Complete);
    assert_eq!(summary.steps, 5);
    assert_eq!(summary.samples, 10);
    assert_eq!(optimizer.step_count(), 5);

    // The first step is logged on its own, then every two steps.
    let boundaries: Vec<(usize, usize)> = summary
        .intervals
        .iter()
        .map(|record| (record.step, record.window_steps))
        .collect();
    assert_eq!(boundaries, vec![(1, 1), (3, 2), (5, 2)]);

    let steps = tap.lock().unwrap().clone();
    assert_eq!(steps.len(), 5);
    let labels = dataset.labels();
    let ignore = dataset.ignore_index();

    // Each window covers exactly the steps since the previous boundary.
    for (record, window) in summary.intervals.iter().zip([0..1, 1..3, 3..5]) {
        assert_eq!(
            record.metrics,
            concatenated_metrics(labels, ignore, &steps[window]).without_classes()
        );
    }

    // The full-epoch accumulator equals metrics over the whole epoch at once.
    assert_eq!(summary.metrics, concatenated_metrics(labels, ignore, &steps));
    let support: u64 = summary.metrics.classes.values().map(|c| c.support).sum();
    assert_eq!(support, total_valid);

    recorder.snapshot(|log| {
        assert_eq!(log.intervals, vec![(0, 1, false), (0, 3, false), (0, 5, false)]);
        assert_eq!(log.images.len(), 3);
        assert_eq!(log.metrics, vec![("train".to_string(), 0)]);
        assert_eq!(log.learning_rates, vec![(0, 0.05)]);
    });
    Ok(())
}

#[test]
fn short_epochs_still_log_their_first_step() -> anyhow::Result<()> {
    let (dataset, mut loader) = synthetic_loader(6)?;
    let model = pointwise(3, 3, json!({}), 5);
    let mut optimizer = optimizer_for(model.as_ref(), "sgd", 0.05);
    let mut runner = EpochRunner::new(
        sgd_executor(&dataset),
        EpochSettings {
            log_interval: 10,
            degenerate_batches: DegenerateBatchPolicy::Fail,
        },
        SegmentationMetrics::new(dataset.labels().to_vec(), dataset.ignore_index()),
    )?;

    let recorder = Recorder::default();
    let mut console = recorder.clone();
    let mut visual = recorder.clone();
    let summary = runner.run(
        0,
        &mut loader,
        &mut EpochContext {
            model: model.as_ref(),
            replicas: &ReplicaSet::none(),
            optimizer: &mut optimizer,
            console: &mut console,
            visual: &mut visual,
        },
    )?;

    assert_eq!(summary.steps, 3);
    assert_eq!(summary.intervals.len(), 1);
    assert_eq!(
        (summary.intervals[0].step, summary.intervals[0].window_steps),
        (1, 1)
    );
    recorder.snapshot(|log| {
        assert_eq!(log.intervals, vec![(0, 1, false)]);
        assert_eq!(log.images, vec![("train_epoch000".to_string(), 1)]);
    });
    Ok(())
}

/// Every pixel carries the ignore label.
struct Unlabelled {
    labels: Vec<String>,
    palette: Vec<[u8; 3]>,
}

impl SegmentationDataset for Unlabelled {
    fn len(&self) -> usize {
        4
    }

    fn get(&self, index: usize) -> segtrain::data::Result<Sample> {
        let to_err = |err: candle_core::Error| TrainingError::runtime(err.to_string());
        Sample::new(
            format!("blank_{index}"),
            Tensor::zeros((3, 2, 2), DType::F32, &Device::Cpu).map_err(to_err)?,
            Tensor::full(255u32, (2, 2), &Device::Cpu).map_err(to_err)?,
        )
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn ignore_index(&self) -> Option<u32> {
        Some(255)
    }

    fn in_channels(&self) -> usize {
        3
    }

    fn color_palette(&self) -> &[[u8; 3]] {
        &self.palette
    }
}

#[test]
fn degenerate_batches_follow_the_configured_policy() -> anyhow::Result<()> {
    let dataset = Arc::new(Unlabelled {
        labels: vec!["a".into(), "b".into(), "c".into()],
        palette: vec![[0, 0, 0]; 3],
    });
    let model = pointwise(3, 3, json!({}), 5);
    let recorder = Recorder::default();

    for (policy, should_fail) in [
        (DegenerateBatchPolicy::Skip, false),
        (DegenerateBatchPolicy::Fail, true),
    ] {
        let mut loader = BlockingDataLoader::new(SegmentationLoader::new(
            dataset.clone(),
            Arc::new(Identity),
            DatasetMode::Train,
            SeedManager::new(3),
            2,
            0,
        )?);
        let mut optimizer = optimizer_for(model.as_ref(), "sgd", 0.05);
        let mut runner = EpochRunner::new(
            StepExecutor::new(
                CrossEntropyLoss::new().with_ignore_index(Some(255)),
                Device::Cpu,
                LossReduction::Mean,
                2,
            ),
            EpochSettings {
                log_interval: 1,
                degenerate_batches: policy,
            },
            SegmentationMetrics::new(dataset.labels().to_vec(), Some(255)),
        )?;
        let mut console = recorder.clone();
        let mut visual = recorder.clone();
        let result = runner.run(
            0,
            &mut loader,
            &mut EpochContext {
                model: model.as_ref(),
                replicas: &ReplicaSet::none(),
                optimizer: &mut optimizer,
                console: &mut console,
                visual: &mut visual,
            },
        );
        if should_fail {
            assert!(matches!(result, Err(TrainingError::DegenerateBatch)));
        } else {
            let summary = result?;
            assert_eq!(summary.steps, 0);
            assert_eq!(summary.skipped_batches, 2);
        }
        assert_eq!(optimizer.step_count(), 0);
    }
    Ok(())
}

#[test]
fn continuing_without_a_checkpoint_fails_before_setup() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = synthetic_config(dir.path(), "");
    config.checkpoint.continue_training = true;

    let err = match Trainer::builder(config.clone()).placement(CpuPlacement).build() {
        Err(err) => err,
        Ok(_) => panic!("continuing without a run must fail"),
    };
    assert!(matches!(err, TrainingError::MissingCheckpoint(_)));
    assert!(!config.model_dir.exists());

    fs::create_dir_all(&config.model_dir)?;
    let err = match Trainer::builder(config.clone()).placement(CpuPlacement).build() {
        Err(err) => err,
        Ok(_) => panic!("continuing without a checkpoint must fail"),
    };
    assert!(matches!(err, TrainingError::MissingCheckpoint(_)));
    assert!(!config.model_dir.join("run_config.toml").exists());
    Ok(())
}

#[test]
fn non_empty_output_requires_overwrite() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = synthetic_config(dir.path(), "");
    fs::create_dir_all(&config.model_dir)?;
    let stale = config.model_dir.join("stale.txt");
    fs::write(&stale, "left over")?;

    let result = Trainer::builder(config.clone())
        .placement(CpuPlacement)
        .loggers(recording_loggers(&Recorder::default()))
        .build();
    assert!(matches!(result, Err(TrainingError::OutputDirConflict(_))));
    assert!(stale.exists());

    config.checkpoint.overwrite_output = true;
    Trainer::builder(config.clone())
        .placement(CpuPlacement)
        .loggers(recording_loggers(&Recorder::default()))
        .build()?;
    assert!(!stale.exists());
    assert!(config.model_dir.join("run_config.toml").is_file());
    Ok(())
}

#[test]
fn unknown_components_fail_fast() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = synthetic_config(dir.path(), "");
    config.model.name = "unet".into();
    let result = Trainer::builder(config.clone()).placement(CpuPlacement).build();
    assert!(matches!(
        result,
        Err(TrainingError::UnknownComponent { kind: "model", .. })
    ));
    assert!(!config.model_dir.exists());
    Ok(())
}

#[test]
fn trains_checkpoints_and_continues() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = synthetic_config(dir.path(), "");
    let recorder = Recorder::default();

    let mut trainer = Trainer::builder(config.clone())
        .command("train --config run.toml")
        .placement(CpuPlacement)
        .loggers(recording_loggers(&recorder))
        .build()?;
    assert_eq!(trainer.state().epoch, 0);
    assert!(!trainer.state().continuing);
    let summary = trainer.run()?;

    assert_eq!(summary.start_epoch, 0);
    assert_eq!(summary.epochs.len(), 2);
    assert_eq!(summary.validation.len(), 2);
    assert_eq!(summary.checkpoints.len(), 2);
    // 8 samples in batches of 4, logged every step.
    assert!(summary.epochs.iter().all(|epoch| epoch.steps == 2));
    assert_eq!(trainer.optimizer().step_count(), 4);
    assert_eq!(trainer.scheduler().snapshot().last_epoch, 2);

    let snapshot = RunConfigSnapshot::read(&config.model_dir.join("run_config.toml"))?;
    assert_eq!(snapshot.command, "train --config run.toml");
    recorder.snapshot(|log| {
        assert_eq!(log.intervals.len(), 4);
        assert_eq!(log.validations, vec![0, 1]);
        assert_eq!(log.args.len(), 1);
        // One validation batch per epoch, imaged every batch.
        assert_eq!(
            log.images.iter().filter(|(tag, _)| tag.starts_with("val")).count(),
            2
        );
    });

    let mut resumed_config = config.clone();
    resumed_config.checkpoint.continue_training = true;
    resumed_config.runtime.epochs = 1;
    let mut resumed = Trainer::builder(resumed_config)
        .placement(CpuPlacement)
        .loggers(recording_loggers(&Recorder::default()))
        .build()?;
    assert!(resumed.state().continuing);
    assert_eq!(resumed.state().epoch, 2);
    assert_eq!(resumed.scheduler().snapshot().last_epoch, 2);
    assert_eq!(resumed.optimizer().step_count(), 4);
    assert_eq!(
        common::parameter_values(resumed.model()),
        common::parameter_values(trainer.model())
    );

    let summary = resumed.run()?;
    assert_eq!(summary.start_epoch, 2);
    assert_eq!(
        summary.checkpoints,
        vec![config.model_dir.join("checkpoints").join("epoch_000002")]
    );
    assert_eq!(resumed.state().epoch, 3);
    Ok(())
}

#[test]
fn default_loggers_write_into_the_model_dir() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = synthetic_config(dir.path(), "");
    config.runtime.epochs = 1;
    let mut trainer = Trainer::builder(config.clone()).placement(CpuPlacement).build()?;
    trainer.run()?;
    drop(trainer);

    let log = fs::read_to_string(config.model_dir.join("train.log"))?;
    assert!(log.lines().any(|line| line.starts_with("train epoch 0")));
    assert!(log.lines().any(|line| line.starts_with("validation epoch 0")));
    let visual = config.model_dir.join("visual");
    assert!(visual.join("args.json").is_file());
    assert!(visual.join("images").read_dir()?.next().is_some());
    Ok(())
}

#[test]
fn metrics_engine_is_reusable_across_epochs() {
    let mut metrics = SegmentationMetrics::new(vec!["a".into(), "b".into()], None);
    metrics.add(&[0, 1], &[0, 0], 1.0).unwrap();
    metrics.reset();
    assert_eq!(metrics.metrics().classes["a"].support, 0);
}

/// Places the run on several host devices so every step fans out to replicas.
struct ReplicatedHost(usize);

impl DevicePlacement for ReplicatedHost {
    fn place(&self, _runtime: &RuntimeConfig) -> Result<Placement, TrainingError> {
        Placement::from_devices(vec![Device::Cpu; self.0])
            .ok_or_else(|| TrainingError::initialization("no devices"))
    }
}

#[test]
fn replicated_runs_track_single_device_runs() -> anyhow::Result<()> {
    let single_dir = tempfile::tempdir()?;
    let mut single = Trainer::builder(synthetic_config(single_dir.path(), ""))
        .placement(CpuPlacement)
        .loggers(recording_loggers(&Recorder::default()))
        .build()?;
    single.run()?;

    let replicated_dir = tempfile::tempdir()?;
    let recorder = Recorder::default();
    let mut replicated = Trainer::builder(synthetic_config(replicated_dir.path(), ""))
        .placement(ReplicatedHost(3))
        .loggers(recording_loggers(&recorder))
        .build()?;
    assert_eq!(replicated.state().placement.device_count(), 3);
    let summary = replicated.run()?;

    assert_eq!(replicated.optimizer().step_count(), single.optimizer().step_count());
    assert!(summary.epochs.iter().all(|epoch| epoch.steps == 2));
    assert_eq!(summary.validation.len(), 2);
    for ((name, a), (_, b)) in common::parameter_values(replicated.model())
        .into_iter()
        .zip(common::parameter_values(single.model()))
    {
        let diff = a.iter().zip(&b).map(|(a, b)| (a - b).abs()).fold(0f32, f32::max);
        assert!(diff < 1e-5, "{name} differs by {diff}");
    }
    Ok(())
}

#[test]
fn overwrite_refuses_to_clear_the_checkpoint_it_resumes_from() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = synthetic_config(dir.path(), "");
    config.runtime.epochs = 1;
    Trainer::builder(config.clone())
        .placement(CpuPlacement)
        .loggers(recording_loggers(&Recorder::default()))
        .build()?
        .run()?;

    let checkpoint = config.model_dir.join("checkpoints").join("epoch_000000");
    config.checkpoint.path = Some(checkpoint.clone());
    config.checkpoint.overwrite_output = true;
    let result = Trainer::builder(config.clone())
        .placement(CpuPlacement)
        .loggers(recording_loggers(&Recorder::default()))
        .build();
    assert!(matches!(result, Err(TrainingError::Initialization(_))));
    assert!(checkpoint.join("manifest.json").is_file());
    Ok(())
}
