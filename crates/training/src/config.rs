use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::TrainingError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub data_dir: PathBuf,
    pub model_dir: PathBuf,
    pub model: ComponentConfig,
    pub dataset: ComponentConfig,
    #[serde(default = "default_transformer")]
    pub transformer: ComponentConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model_dir.as_os_str().is_empty() {
            errors.push("model_dir must not be empty".to_string());
        }

        for (section, component) in [
            ("model", &self.model),
            ("dataset", &self.dataset),
            ("transformer", &self.transformer),
        ] {
            if component.name.trim().is_empty() {
                errors.push(format!("{section}.name must not be empty"));
            }
            if !component.args.is_object() {
                errors.push(format!("{section}.args must be a table"));
            }
        }
        if !self.optimizer.args.is_object() {
            errors.push("optimizer.args must be a table".to_string());
        }
        if !self.scheduler.args.is_object() {
            errors.push("scheduler.args must be a table".to_string());
        }

        if !(self.optimizer.learning_rate > 0.0) {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.test_batch_size == 0 {
            errors.push("data.test_batch_size must be greater than 0".to_string());
        }
        if let Some(0) = self.data.max_gpu_batch_size {
            errors.push("data.max_gpu_batch_size must be greater than 0".to_string());
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }
        if let Some(0) = self.runtime.accelerator_count {
            errors.push("runtime.accelerator_count must be greater than 0".to_string());
        }
        if self.runtime.log_interval == 0 {
            errors.push("runtime.log_interval must be greater than 0".to_string());
        }
        if self.runtime.log_images_interval == 0 {
            errors.push("runtime.log_images_interval must be greater than 0".to_string());
        }

        if self.checkpoint.save_every_n_epochs == 0 {
            errors.push("checkpoint.save_every_n_epochs must be greater than 0".to_string());
        }
        if let Some(0) = self.checkpoint.max_keep {
            errors.push("checkpoint.max_keep must be greater than 0".to_string());
        }
        if self.checkpoint.allow_missing_keys && self.checkpoint.continue_training {
            errors.push(
                "checkpoint.allow_missing_keys and checkpoint.continue_training are mutually exclusive"
                    .to_string(),
            );
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Largest micro-batch a single forward pass may see.
    pub fn micro_batch_size(&self) -> usize {
        self.data.max_gpu_batch_size.unwrap_or(self.data.batch_size)
    }

    /// Applies `key.path=value` overrides by round-tripping through JSON, then
    /// re-validates the result.
    pub fn with_overrides(self, overrides: &[ConfigOverride]) -> Result<Self, TrainingError> {
        if overrides.is_empty() {
            return Ok(self);
        }

        let mut value = serde_json::to_value(self)?;
        for override_arg in overrides {
            let new_value = parse_override_value(&override_arg.value);
            set_value_at_path(&mut value, &override_arg.path, new_value)?;
        }

        let config: TrainingConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data_dir, base);
        absolutize_in_place(&mut self.model_dir, base);
        if let Some(path) = self.checkpoint.path.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

/// Resolved configuration plus the command that produced it, persisted once
/// per run as `run_config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfigSnapshot {
    pub command: String,
    pub config: TrainingConfig,
}

impl RunConfigSnapshot {
    pub fn write(&self, path: &Path) -> Result<(), TrainingError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, TrainingError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

/// A pluggable collaborator selected by name with free-form arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

impl ComponentConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: empty_args(),
        }
    }

    pub fn with_args(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_optimizer_name")]
    pub name: String,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "empty_args")]
    pub args: Value,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            name: default_optimizer_name(),
            learning_rate: default_learning_rate(),
            args: empty_args(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_name")]
    pub name: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_scheduler_name(),
            args: empty_args(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_test_batch_size")]
    pub test_batch_size: usize,
    /// Upper bound on a micro-batch; defaults to `batch_size` (no splitting).
    #[serde(default)]
    pub max_gpu_batch_size: Option<usize>,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            test_batch_size: default_test_batch_size(),
            max_gpu_batch_size: None,
            num_workers: default_num_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub no_accelerator: bool,
    /// Upper bound on devices used; unset uses every visible accelerator.
    #[serde(default)]
    pub accelerator_count: Option<usize>,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default = "default_log_images_interval")]
    pub log_images_interval: usize,
    #[serde(default)]
    pub loss_reduction: LossReduction,
    #[serde(default)]
    pub degenerate_batches: DegenerateBatchPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            seed: default_seed(),
            no_accelerator: false,
            accelerator_count: None,
            log_interval: default_log_interval(),
            log_images_interval: default_log_images_interval(),
            loss_reduction: LossReduction::default(),
            degenerate_batches: DegenerateBatchPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReduction {
    /// Every micro-batch loss is divided by the logical batch's valid target
    /// count before backpropagation.
    #[default]
    Mean,
    Sum,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegenerateBatchPolicy {
    #[default]
    Skip,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Explicit checkpoint directory to resume from.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_save_every_n_epochs")]
    pub save_every_n_epochs: usize,
    #[serde(default)]
    pub max_keep: Option<usize>,
    #[serde(default)]
    pub allow_missing_keys: bool,
    #[serde(default)]
    pub continue_training: bool,
    #[serde(default)]
    pub overwrite_output: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: None,
            save_every_n_epochs: default_save_every_n_epochs(),
            max_keep: None,
            allow_missing_keys: false,
            continue_training: false,
            overwrite_output: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOverride {
    pub path: String,
    pub value: String,
}

impl FromStr for ConfigOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::ConfigFormat(format!(
            "invalid override path '{path}'"
        )));
    }

    let Some((last, parents)) = segments.split_last() else {
        return Err(TrainingError::ConfigFormat("override path must not be empty".into()));
    };

    let mut current = target;
    for segment in parents {
        let map = as_object(current, segment)?;
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    as_object(current, last)?.insert(last.to_string(), new_value);
    Ok(())
}

fn as_object<'a>(value: &'a mut Value, segment: &str) -> Result<&'a mut Map<String, Value>, TrainingError> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut().ok_or_else(|| {
        TrainingError::ConfigFormat(format!(
            "override path segment '{segment}' points into a non-table value"
        ))
    })
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn empty_args() -> Value {
    Value::Object(Map::new())
}

fn default_transformer() -> ComponentConfig {
    ComponentConfig::named("identity")
}

fn default_optimizer_name() -> String {
    "rmsprop".to_string()
}

fn default_scheduler_name() -> String {
    "constant".to_string()
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_batch_size() -> usize {
    64
}

fn default_test_batch_size() -> usize {
    1000
}

fn default_num_workers() -> usize {
    1
}

fn default_epochs() -> usize {
    10
}

fn default_seed() -> u64 {
    8861
}

fn default_log_interval() -> usize {
    10
}

fn default_log_images_interval() -> usize {
    200
}

fn default_save_every_n_epochs() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        data_dir = "data"
        model_dir = "runs/demo"

        [model]
        name = "pointwise"

        [dataset]
        name = "synthetic"
        args = { samples = 8 }
    "#;

    fn minimal() -> TrainingConfig {
        toml::from_str(MINIMAL).expect("minimal config parses")
    }

    #[test]
    fn defaults_follow_reference_values() {
        let config = minimal();
        assert_eq!(config.optimizer.name, "rmsprop");
        assert_eq!(config.optimizer.learning_rate, 1e-3);
        assert_eq!(config.scheduler.name, "constant");
        assert_eq!(config.transformer.name, "identity");
        assert_eq!(config.data.batch_size, 64);
        assert_eq!(config.data.test_batch_size, 1000);
        assert_eq!(config.micro_batch_size(), 64);
        assert_eq!(config.runtime.seed, 8861);
        assert_eq!(config.runtime.epochs, 10);
        assert_eq!(config.runtime.log_interval, 10);
        assert_eq!(config.runtime.accelerator_count, None);
        assert_eq!(config.runtime.loss_reduction, LossReduction::Mean);
        assert_eq!(config.runtime.degenerate_batches, DegenerateBatchPolicy::Skip);
        assert_eq!(config.checkpoint.save_every_n_epochs, 5);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = minimal();
        config.data.batch_size = 0;
        config.runtime.log_interval = 0;
        config.runtime.accelerator_count = Some(0);
        config.checkpoint.allow_missing_keys = true;
        config.checkpoint.continue_training = true;

        match config.validate() {
            Err(TrainingError::Validation(messages)) => {
                assert_eq!(messages.len(), 4, "{messages:?}");
                assert!(messages.iter().any(|m| m.contains("mutually exclusive")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn overrides_reach_nested_keys() {
        let overrides: Vec<ConfigOverride> = [
            "data.max_gpu_batch_size=16",
            "runtime.loss_reduction=sum",
            "model.args.bias=false",
            "optimizer.learning_rate=0.5",
        ]
        .iter()
        .map(|raw| raw.parse().expect("override parses"))
        .collect();

        let config = minimal().with_overrides(&overrides).expect("overrides apply");
        assert_eq!(config.micro_batch_size(), 16);
        assert_eq!(config.runtime.loss_reduction, LossReduction::Sum);
        assert_eq!(config.model.args["bias"], Value::Bool(false));
        assert_eq!(config.optimizer.learning_rate, 0.5);
    }

    #[test]
    fn overrides_cannot_descend_into_scalars() {
        let overrides = vec!["runtime.seed.inner=1".parse::<ConfigOverride>().unwrap()];
        assert!(minimal().with_overrides(&overrides).is_err());
        assert!("no_equals_sign".parse::<ConfigOverride>().is_err());
    }

    #[test]
    fn relative_paths_resolve_against_config_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("train.toml");
        fs::write(&path, MINIMAL)?;

        let config = TrainingConfig::from_path(&path)?;
        assert_eq!(config.data_dir, dir.path().join("data"));
        assert_eq!(config.model_dir, dir.path().join("runs/demo"));
        Ok(())
    }

    #[test]
    fn run_snapshot_round_trips_through_toml() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run_config.toml");
        let snapshot = RunConfigSnapshot {
            command: "train --config train.toml".into(),
            config: minimal(),
        };
        snapshot.write(&path)?;

        let restored = RunConfigSnapshot::read(&path)?;
        assert_eq!(restored.command, snapshot.command);
        assert_eq!(restored.config.dataset.args["samples"], Value::from(8));
        Ok(())
    }
}
