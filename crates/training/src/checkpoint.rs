use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use log::{debug, info, warn};
use segmodel::{ModelSpec, SegmentationModel};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{
    config::RunConfigSnapshot,
    error::to_runtime_error,
    optimizer::{OptimizerState, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerState},
    TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
/// Subdirectory of the model directory holding every checkpoint.
pub const CHECKPOINT_DIR: &str = "checkpoints";
const RUN_MANIFEST_FILENAME: &str = "manifest.json";
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Enough to rebuild the model's parameter layout without the run config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureMetadata {
    pub model: String,
    pub model_args: Value,
    pub in_channels: usize,
    pub n_classes: usize,
}

impl ArchitectureMetadata {
    pub fn new(model: impl Into<String>, spec: &ModelSpec) -> Self {
        Self {
            model: model.into(),
            model_args: spec.args.clone(),
            in_channels: spec.in_channels,
            n_classes: spec.n_classes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub epoch: usize,
    pub created_unix_timestamp: u64,
    pub architecture: ArchitectureMetadata,
    pub run_config: Value,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub scheduler: FileRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub epoch: usize,
    /// Directory name relative to the checkpoint root.
    pub location: String,
}

/// Ordered record of every checkpoint a run has written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub entries: Vec<ManifestEntry>,
}

impl RunManifest {
    pub fn latest(&self) -> Option<&ManifestEntry> {
        self.entries.last()
    }

    /// Adds an entry, replacing any previous entry for the same epoch, and
    /// keeps entries sorted by epoch.
    pub fn record(&mut self, epoch: usize, location: impl Into<String>) {
        self.entries.retain(|entry| entry.epoch != epoch);
        self.entries.push(ManifestEntry {
            epoch,
            location: location.into(),
        });
        self.entries.sort_by_key(|entry| entry.epoch);
    }

    /// Drops the oldest entries beyond `max_keep` and returns them.
    pub fn prune(&mut self, max_keep: Option<usize>) -> Vec<ManifestEntry> {
        match max_keep {
            Some(limit) if limit > 0 && self.entries.len() > limit => {
                let excess = self.entries.len() - limit;
                self.entries.drain(..excess).collect()
            }
            _ => Vec::new(),
        }
    }

    /// A missing manifest reads as an empty run.
    pub fn load(root: &Path) -> Result<Self, TrainingError> {
        let path = root.join(RUN_MANIFEST_FILENAME);
        if !path.is_file() {
            return Ok(Self::default());
        }
        read_json(&path)
    }

    /// Writes to a temporary file and renames it over the previous manifest.
    pub fn save(&self, root: &Path) -> Result<(), TrainingError> {
        let path = root.join(RUN_MANIFEST_FILENAME);
        let tmp = root.join(format!("{RUN_MANIFEST_FILENAME}.tmp"));
        write_json(&tmp, self)?;
        fs::rename(&tmp, &path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to replace run manifest {}: {err}",
                path.display()
            ))
        })
    }
}

/// What a checkpoint captures at the end of an epoch.
pub struct CheckpointState<'a> {
    pub epoch: usize,
    pub model: &'a dyn SegmentationModel,
    pub optimizer: &'a TrainerOptimizer,
    pub scheduler: &'a dyn LRScheduler,
}

/// Training objects a checkpoint is restored into.
pub struct ResumeTarget<'a> {
    pub model: &'a dyn SegmentationModel,
    pub optimizer: &'a mut TrainerOptimizer,
    pub scheduler: &'a mut dyn LRScheduler,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeSource {
    /// A checkpoint directory, or any file inside one.
    Path(PathBuf),
    /// The newest entry of this run's manifest.
    Latest,
}

pub struct CheckpointManager {
    root: PathBuf,
    cadence: usize,
    max_keep: Option<usize>,
    architecture: ArchitectureMetadata,
    run_config: Value,
}

impl CheckpointManager {
    pub fn new(
        model_dir: &Path,
        cadence: usize,
        max_keep: Option<usize>,
        architecture: ArchitectureMetadata,
        run_config: &RunConfigSnapshot,
    ) -> Result<Self, TrainingError> {
        if cadence == 0 {
            return Err(TrainingError::initialization(
                "checkpoint cadence must be greater than zero",
            ));
        }
        Ok(Self {
            root: model_dir.join(CHECKPOINT_DIR),
            cadence,
            max_keep,
            architecture,
            run_config: serde_json::to_value(run_config)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn should_save(&self, epoch: usize) -> bool {
        epoch % self.cadence == 0
    }

    /// Writes a checkpoint when `state.epoch` falls on the cadence and returns
    /// its directory.
    pub fn save(&self, state: &CheckpointState<'_>) -> Result<Option<PathBuf>, TrainingError> {
        if !self.should_save(state.epoch) {
            return Ok(None);
        }
        fs::create_dir_all(&self.root).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                self.root.display()
            ))
        })?;

        let location = format!("epoch_{:06}", state.epoch);
        let directory = self.root.join(&location);
        if directory.exists() {
            fs::remove_dir_all(&directory)?;
        }
        fs::create_dir(&directory)?;

        let model_path = directory.join(MODEL_FILENAME);
        save_model_weights(state.model, &model_path)?;
        let optimizer_path = directory.join(OPTIMIZER_FILENAME);
        write_json(&optimizer_path, &state.optimizer.state()?)?;
        let scheduler_path = directory.join(SCHEDULER_FILENAME);
        write_json(&scheduler_path, &state.scheduler.snapshot())?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            epoch: state.epoch,
            created_unix_timestamp: unix_timestamp(),
            architecture: self.architecture.clone(),
            run_config: self.run_config.clone(),
            model: file_record(&model_path)?,
            optimizer: file_record(&optimizer_path)?,
            scheduler: file_record(&scheduler_path)?,
        };
        write_json(&directory.join(MANIFEST_FILENAME), &manifest)?;

        let mut run = RunManifest::load(&self.root)?;
        run.record(state.epoch, location);
        let pruned = run.prune(self.max_keep);
        run.save(&self.root)?;
        for entry in pruned {
            let victim = self.root.join(&entry.location);
            if victim.exists() {
                fs::remove_dir_all(&victim)?;
            }
            debug!("pruned checkpoint for epoch {}", entry.epoch);
        }

        info!("saved checkpoint for epoch {} to {}", state.epoch, directory.display());
        Ok(Some(directory))
    }

    pub fn latest(&self) -> Result<Option<PathBuf>, TrainingError> {
        latest_in(&self.root)
    }

    /// Restores model, optimizer and scheduler and returns the next epoch to
    /// run. Parameter key mismatches fail under `strict` and are logged
    /// otherwise; shape mismatches always fail.
    pub fn resume(
        &self,
        source: &ResumeSource,
        strict: bool,
        target: ResumeTarget<'_>,
    ) -> Result<usize, TrainingError> {
        let directory = match source {
            ResumeSource::Path(path) if path.is_file() => path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| path.clone()),
            ResumeSource::Path(path) => path.clone(),
            ResumeSource::Latest => self.latest()?.ok_or_else(|| {
                TrainingError::MissingCheckpoint(format!(
                    "no checkpoint recorded under {}",
                    self.root.display()
                ))
            })?,
        };

        let manifest = load_manifest(&directory)?;
        for record in [&manifest.model, &manifest.optimizer, &manifest.scheduler] {
            verify_record(&directory, record)?;
        }
        if manifest.architecture.model != self.architecture.model {
            warn!(
                "checkpoint was written by model '{}', restoring into '{}'",
                manifest.architecture.model, self.architecture.model
            );
        }

        // Every payload is checked before anything is restored.
        let weights =
            read_model_weights(target.model, &directory.join(&manifest.model.filename), strict)?;
        let optimizer_state: OptimizerState =
            read_json(&directory.join(&manifest.optimizer.filename))?;
        target.optimizer.validate_state(&optimizer_state, strict)?;
        let scheduler_state: SchedulerState =
            read_json(&directory.join(&manifest.scheduler.filename))?;
        target.scheduler.check_snapshot(&scheduler_state)?;

        apply_model_weights(target.model, weights)?;
        target.optimizer.apply_state(optimizer_state)?;
        target.scheduler.load_snapshot(&scheduler_state)?;

        info!(
            "resumed from {} (epoch {})",
            directory.display(),
            manifest.epoch
        );
        Ok(manifest.epoch + 1)
    }
}

/// Latest checkpoint directory recorded for the run in `model_dir`.
pub fn latest_checkpoint(model_dir: &Path) -> Result<Option<PathBuf>, TrainingError> {
    latest_in(&model_dir.join(CHECKPOINT_DIR))
}

fn latest_in(root: &Path) -> Result<Option<PathBuf>, TrainingError> {
    let run = RunManifest::load(root)?;
    Ok(run
        .latest()
        .map(|entry| root.join(&entry.location))
        .filter(|path| path.join(MANIFEST_FILENAME).is_file()))
}

/// Reads the architecture a checkpoint was written for.
pub fn load_architecture(directory: &Path) -> Result<ArchitectureMetadata, TrainingError> {
    Ok(load_manifest(directory)?.architecture)
}

/// Loads safetensors weights into `model`. Parameter key mismatches fail
/// under `strict` and are logged otherwise; shape mismatches always fail.
/// The model is untouched when loading fails.
pub fn load_model_weights(
    model: &dyn SegmentationModel,
    weights_path: &Path,
    strict: bool,
) -> Result<(), TrainingError> {
    let weights = read_model_weights(model, weights_path, strict)?;
    apply_model_weights(model, weights)
}

/// Reads and checks saved weights against the parameters of `model`.
fn read_model_weights(
    model: &dyn SegmentationModel,
    weights_path: &Path,
    strict: bool,
) -> Result<HashMap<String, candle_core::Tensor>, TrainingError> {
    let device = model.spec().device.clone();
    let saved: HashMap<String, candle_core::Tensor> =
        load_safetensors(weights_path, &device).map_err(to_runtime_error)?;
    let parameters = model.parameters();

    let mut missing = Vec::new();
    for (name, var) in &parameters {
        match saved.get(name) {
            Some(tensor) if tensor.dims() != var.as_tensor().dims() => {
                return Err(TrainingError::runtime(format!(
                    "shape mismatch for '{name}': checkpoint {:?}, model {:?}",
                    tensor.dims(),
                    var.as_tensor().dims()
                )));
            }
            Some(_) => {}
            None => missing.push(name.clone()),
        }
    }
    let mut unexpected: Vec<String> = saved
        .keys()
        .filter(|key| !parameters.iter().any(|(name, _)| name == *key))
        .cloned()
        .collect();
    unexpected.sort();

    if !(missing.is_empty() && unexpected.is_empty()) {
        if strict {
            return Err(TrainingError::KeyMismatch {
                missing,
                unexpected,
            });
        }
        warn!(
            "loading checkpoint with mismatched parameters; missing={:?} unexpected={:?}",
            missing, unexpected
        );
    }
    Ok(saved)
}

fn apply_model_weights(
    model: &dyn SegmentationModel,
    mut saved: HashMap<String, candle_core::Tensor>,
) -> Result<(), TrainingError> {
    for (name, var) in &model.parameters() {
        let Some(tensor) = saved.remove(name) else {
            continue;
        };
        let dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == dtype {
            tensor
        } else {
            tensor.to_dtype(dtype).map_err(to_runtime_error)?
        };
        var.set(&tensor).map_err(to_runtime_error)?;
    }
    Ok(())
}

fn save_model_weights(model: &dyn SegmentationModel, path: &Path) -> Result<(), TrainingError> {
    let parameters = model.parameters();
    if parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, candle_core::Tensor> = parameters
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let path = directory.join(MANIFEST_FILENAME);
    if !path.is_file() {
        return Err(TrainingError::MissingCheckpoint(format!(
            "checkpoint manifest not found at {}",
            path.display()
        )));
    }
    let manifest: CheckpointManifest = read_json(&path)?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            manifest.version, CHECKPOINT_VERSION
        )));
    }
    Ok(manifest)
}

fn verify_record(directory: &Path, record: &FileRecord) -> Result<(), TrainingError> {
    let path = directory.join(&record.filename);
    if !path.is_file() {
        return Err(TrainingError::MissingCheckpoint(format!(
            "checkpoint file {} is missing",
            path.display()
        )));
    }
    if sha256_file(&path)? != record.sha256 {
        return Err(TrainingError::Checksum(path));
    }
    Ok(())
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha256_file(path)?,
        bytes: path.metadata()?.len(),
    })
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path)?;
    let data = serde_json::to_vec_pretty(value)?;
    file.write_all(&data)?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path)?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
