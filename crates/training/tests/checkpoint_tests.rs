mod common;

use std::fs;

use candle_core::Device;
use common::{inputs, optimizer_for, parameter_values, pointwise, synthetic_config, targets};
use segtrain::{
    checkpoint::load_model_weights, config::SchedulerConfig, load_architecture,
    scheduler::build_scheduler, ArchitectureMetadata, CheckpointManager, CheckpointState,
    CrossEntropyLoss, LRScheduler, LossReduction, ResumeSource, ResumeTarget, RunConfigSnapshot,
    RunManifest, StepExecutor, TrainerOptimizer, TrainingError,
};
use serde_json::json;

fn snapshot(root: &std::path::Path) -> RunConfigSnapshot {
    RunConfigSnapshot {
        command: "train --config run.toml".into(),
        config: synthetic_config(root, ""),
    }
}

fn step_scheduler() -> Box<dyn LRScheduler> {
    let cfg = SchedulerConfig {
        name: "step".into(),
        args: json!({"step_size": 1, "gamma": 0.5}),
    };
    build_scheduler(&cfg, 0.01).unwrap()
}

/// Runs a couple of updates so the optimizer carries non-trivial state.
fn train_a_little(model: &dyn segmodel::SegmentationModel, optimizer: &mut TrainerOptimizer) {
    let executor = StepExecutor::new(
        CrossEntropyLoss::new().with_ignore_index(Some(255)),
        Device::Cpu,
        LossReduction::Mean,
        2,
    );
    let x = inputs(4, 3, 2, 2);
    let y = targets((0..16u32).map(|i| i % 3).collect(), 4, 2, 2);
    for _ in 0..2 {
        executor.step(model, optimizer, &x, &y).unwrap();
    }
}

fn manager(root: &std::path::Path, cadence: usize, max_keep: Option<usize>, model: &dyn segmodel::SegmentationModel) -> CheckpointManager {
    CheckpointManager::new(
        &root.join("run"),
        cadence,
        max_keep,
        ArchitectureMetadata::new("pointwise", model.spec()),
        &snapshot(root),
    )
    .unwrap()
}

#[test]
fn round_trip_restores_state_and_reports_next_epoch() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let model = pointwise(3, 3, json!({}), 1);
    let mut optimizer = optimizer_for(model.as_ref(), "adam", 0.01);
    let mut scheduler = step_scheduler();
    train_a_little(model.as_ref(), &mut optimizer);
    scheduler.step();
    scheduler.step();

    let checkpoints = manager(dir.path(), 2, None, model.as_ref());
    let saved = checkpoints
        .save(&CheckpointState {
            epoch: 4,
            model: model.as_ref(),
            optimizer: &optimizer,
            scheduler: scheduler.as_ref(),
        })?
        .expect("epoch 4 is on the cadence");
    assert!(saved.ends_with("checkpoints/epoch_000004"));
    for file in ["model.safetensors", "optimizer.json", "scheduler.json", "manifest.json"] {
        assert!(saved.join(file).is_file(), "{file}");
    }

    let architecture = load_architecture(&saved)?;
    assert_eq!(architecture.model, "pointwise");
    assert_eq!((architecture.in_channels, architecture.n_classes), (3, 3));

    let restored = pointwise(3, 3, json!({}), 99);
    assert_ne!(parameter_values(restored.as_ref()), parameter_values(model.as_ref()));
    let mut restored_optimizer = optimizer_for(restored.as_ref(), "adam", 0.01);
    let mut restored_scheduler = step_scheduler();

    let next = checkpoints.resume(
        &ResumeSource::Latest,
        true,
        ResumeTarget {
            model: restored.as_ref(),
            optimizer: &mut restored_optimizer,
            scheduler: restored_scheduler.as_mut(),
        },
    )?;
    assert_eq!(next, 5);
    assert_eq!(parameter_values(restored.as_ref()), parameter_values(model.as_ref()));
    assert_eq!(
        serde_json::to_value(restored_optimizer.state()?)?,
        serde_json::to_value(optimizer.state()?)?
    );
    assert_eq!(restored_scheduler.snapshot(), scheduler.snapshot());
    Ok(())
}

#[test]
fn saves_only_on_cadence_and_prunes_old_checkpoints() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let model = pointwise(3, 3, json!({}), 1);
    let optimizer = optimizer_for(model.as_ref(), "sgd", 0.1);
    let scheduler = step_scheduler();
    let checkpoints = manager(dir.path(), 3, Some(2), model.as_ref());

    let mut written = Vec::new();
    for epoch in 0..10 {
        let saved = checkpoints.save(&CheckpointState {
            epoch,
            model: model.as_ref(),
            optimizer: &optimizer,
            scheduler: scheduler.as_ref(),
        })?;
        if saved.is_some() {
            written.push(epoch);
        }
    }
    assert_eq!(written, vec![0, 3, 6, 9]);

    let run = RunManifest::load(checkpoints.root())?;
    let kept: Vec<usize> = run.entries.iter().map(|entry| entry.epoch).collect();
    assert_eq!(kept, vec![6, 9]);
    assert!(!checkpoints.root().join("epoch_000000").exists());
    assert!(!checkpoints.root().join("epoch_000003").exists());
    assert_eq!(checkpoints.latest()?, Some(checkpoints.root().join("epoch_000009")));
    Ok(())
}

#[test]
fn tampered_files_fail_checksum_validation() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let model = pointwise(3, 3, json!({}), 1);
    let mut optimizer = optimizer_for(model.as_ref(), "sgd", 0.1);
    let mut scheduler = step_scheduler();
    let checkpoints = manager(dir.path(), 1, None, model.as_ref());
    let saved = checkpoints
        .save(&CheckpointState {
            epoch: 1,
            model: model.as_ref(),
            optimizer: &optimizer,
            scheduler: scheduler.as_ref(),
        })?
        .expect("cadence 1 saves every epoch");

    let path = saved.join("scheduler.json");
    let mut contents = fs::read_to_string(&path)?;
    contents.push(' ');
    fs::write(&path, contents)?;

    let err = checkpoints
        .resume(
            &ResumeSource::Path(saved.clone()),
            true,
            ResumeTarget {
                model: model.as_ref(),
                optimizer: &mut optimizer,
                scheduler: scheduler.as_mut(),
            },
        )
        .unwrap_err();
    assert!(matches!(err, TrainingError::Checksum(p) if p == path));
    Ok(())
}

#[test]
fn strict_resume_rejects_missing_keys_and_relaxed_keeps_fresh_values() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let source = pointwise(3, 3, json!({"bias": false}), 1);
    let optimizer = optimizer_for(source.as_ref(), "sgd", 0.1);
    let scheduler = step_scheduler();
    let checkpoints = manager(dir.path(), 1, None, source.as_ref());
    let saved = checkpoints
        .save(&CheckpointState {
            epoch: 2,
            model: source.as_ref(),
            optimizer: &optimizer,
            scheduler: scheduler.as_ref(),
        })?
        .expect("cadence 1 saves every epoch");

    let target = pointwise(3, 3, json!({"bias": true}), 7);
    let fresh = parameter_values(target.as_ref());
    let mut target_optimizer = optimizer_for(target.as_ref(), "sgd", 0.1);
    let mut target_scheduler = step_scheduler();

    let err = checkpoints
        .resume(
            &ResumeSource::Path(saved.clone()),
            true,
            ResumeTarget {
                model: target.as_ref(),
                optimizer: &mut target_optimizer,
                scheduler: target_scheduler.as_mut(),
            },
        )
        .unwrap_err();
    match err {
        TrainingError::KeyMismatch {
            missing,
            unexpected,
        } => {
            assert_eq!(missing, vec!["classifier.bias".to_string()]);
            assert!(unexpected.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(parameter_values(target.as_ref()), fresh);

    let next = checkpoints.resume(
        &ResumeSource::Path(saved.clone()),
        false,
        ResumeTarget {
            model: target.as_ref(),
            optimizer: &mut target_optimizer,
            scheduler: target_scheduler.as_mut(),
        },
    )?;
    assert_eq!(next, 3);
    let loaded = parameter_values(target.as_ref());
    let source_values = parameter_values(source.as_ref());
    let weight = |values: &[(String, Vec<f32>)]| {
        values
            .iter()
            .find(|(name, _)| name == "classifier.weight")
            .map(|(_, v)| v.clone())
            .unwrap()
    };
    assert_eq!(weight(&loaded), weight(&source_values));
    let bias = |values: &[(String, Vec<f32>)]| {
        values
            .iter()
            .find(|(name, _)| name == "classifier.bias")
            .map(|(_, v)| v.clone())
            .unwrap()
    };
    assert_eq!(bias(&loaded), bias(&fresh));
    Ok(())
}

#[test]
fn shape_mismatches_fail_even_when_relaxed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let source = pointwise(3, 3, json!({}), 1);
    let optimizer = optimizer_for(source.as_ref(), "sgd", 0.1);
    let scheduler = step_scheduler();
    let saved = manager(dir.path(), 1, None, source.as_ref())
        .save(&CheckpointState {
            epoch: 1,
            model: source.as_ref(),
            optimizer: &optimizer,
            scheduler: scheduler.as_ref(),
        })?
        .expect("cadence 1 saves every epoch");

    let wider = pointwise(3, 4, json!({}), 1);
    let result = load_model_weights(wider.as_ref(), &saved.join("model.safetensors"), false);
    assert!(matches!(result, Err(TrainingError::Runtime(_))));
    Ok(())
}

#[test]
fn rejected_resume_leaves_everything_untouched() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let model = pointwise(3, 3, json!({}), 1);
    let mut optimizer = optimizer_for(model.as_ref(), "adam", 0.01);
    let mut scheduler = step_scheduler();
    train_a_little(model.as_ref(), &mut optimizer);
    scheduler.step();
    let checkpoints = manager(dir.path(), 1, None, model.as_ref());
    checkpoints.save(&CheckpointState {
        epoch: 0,
        model: model.as_ref(),
        optimizer: &optimizer,
        scheduler: scheduler.as_ref(),
    })?;

    let fresh = pointwise(3, 3, json!({}), 42);
    let before = parameter_values(fresh.as_ref());

    // Optimizer algorithm differs from the checkpoint.
    let mut sgd = optimizer_for(fresh.as_ref(), "sgd", 0.01);
    let mut fresh_scheduler = step_scheduler();
    let result = checkpoints.resume(
        &ResumeSource::Latest,
        true,
        ResumeTarget {
            model: fresh.as_ref(),
            optimizer: &mut sgd,
            scheduler: fresh_scheduler.as_mut(),
        },
    );
    assert!(matches!(result, Err(TrainingError::Initialization(_))));
    assert_eq!(parameter_values(fresh.as_ref()), before);

    // Scheduler differs; neither the model nor the optimizer may change.
    let mut adam = optimizer_for(fresh.as_ref(), "adam", 0.01);
    let adam_before = serde_json::to_value(adam.state()?)?;
    let mut constant = build_scheduler(
        &SchedulerConfig {
            name: "constant".into(),
            args: json!({}),
        },
        0.01,
    )?;
    let result = checkpoints.resume(
        &ResumeSource::Latest,
        true,
        ResumeTarget {
            model: fresh.as_ref(),
            optimizer: &mut adam,
            scheduler: constant.as_mut(),
        },
    );
    assert!(matches!(result, Err(TrainingError::Initialization(_))));
    assert_eq!(parameter_values(fresh.as_ref()), before);
    assert_eq!(serde_json::to_value(adam.state()?)?, adam_before);
    assert_eq!(adam.step_count(), 0);
    Ok(())
}
