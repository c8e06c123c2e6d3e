#![allow(dead_code)]

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use candle_core::{Device, Tensor};
use segmodel::{ModelSpec, SegmentationModel};
use segtrain::{
    config, optimizer, ConsoleLogger, MetricMap, PredictionImage, SeedManager, TrainerOptimizer,
    TrainingConfig, TrainingError, VisualLogger,
};
use serde_json::{json, Value};

pub fn pointwise(in_channels: usize, n_classes: usize, args: Value, seed: u64) -> Box<dyn SegmentationModel> {
    let spec = ModelSpec::new(in_channels, n_classes, args, Device::Cpu);
    segmodel::build_model("pointwise", spec, &mut SeedManager::new(seed).init_rng()).unwrap()
}

pub fn optimizer_for(model: &dyn SegmentationModel, name: &str, learning_rate: f64) -> TrainerOptimizer {
    let cfg = config::OptimizerConfig {
        name: name.to_string(),
        learning_rate,
        args: json!({}),
    };
    TrainerOptimizer::new(
        model.parameters(),
        optimizer::OptimizerConfig::from_config(&cfg).unwrap(),
    )
    .unwrap()
}

pub fn parameter_values(model: &dyn SegmentationModel) -> Vec<(String, Vec<f32>)> {
    model
        .parameters()
        .into_iter()
        .map(|(name, var)| {
            let values = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            (name, values)
        })
        .collect()
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    a.sub(b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

/// Deterministic `(n, c, h, w)` inputs.
pub fn inputs(n: usize, c: usize, h: usize, w: usize) -> Tensor {
    let count = n * c * h * w;
    Tensor::arange(0f32, count as f32, &Device::Cpu)
        .unwrap()
        .affine(0.37, 0.1)
        .unwrap()
        .sin()
        .unwrap()
        .reshape((n, c, h, w))
        .unwrap()
}

pub fn targets(labels: Vec<u32>, n: usize, h: usize, w: usize) -> Tensor {
    Tensor::from_vec(labels, (n, h, w), &Device::Cpu).unwrap()
}

/// Minimal run configuration over the synthetic dataset.
pub fn synthetic_config(root: &Path, extra: &str) -> TrainingConfig {
    let text = format!(
        r#"
data_dir = "{data}"
model_dir = "{model}"

[model]
name = "pointwise"

[dataset]
name = "synthetic"
args = {{ train_samples = 8, val_samples = 4, height = 6, width = 6, seed = 5 }}

[optimizer]
name = "sgd"
learning_rate = 0.1

[data]
batch_size = 4
test_batch_size = 4
max_gpu_batch_size = 2
num_workers = 0

[runtime]
epochs = 2
log_interval = 1
log_images_interval = 1
no_accelerator = true

[checkpoint]
save_every_n_epochs = 1
{extra}
"#,
        data = root.join("data").display(),
        model = root.join("run").display(),
    );
    toml::from_str(&text).unwrap()
}

#[derive(Debug, Default)]
pub struct Recorded {
    /// `(epoch, step, window metrics carried per-class entries)`.
    pub intervals: Vec<(usize, usize, bool)>,
    pub validations: Vec<usize>,
    pub images: Vec<(String, usize)>,
    pub metrics: Vec<(String, usize)>,
    pub learning_rates: Vec<(usize, f64)>,
    pub args: Vec<Value>,
}

/// Console and visual logger that keeps every call in memory.
#[derive(Clone, Default)]
pub struct Recorder(pub Arc<Mutex<Recorded>>);

impl Recorder {
    pub fn snapshot<T>(&self, read: impl FnOnce(&Recorded) -> T) -> T {
        read(&self.0.lock().unwrap())
    }
}

impl ConsoleLogger for Recorder {
    fn log_interval(&mut self, record: &segtrain::logging::IntervalRecord<'_>) -> Result<(), TrainingError> {
        self.0.lock().unwrap().intervals.push((
            record.epoch,
            record.step,
            !record.metrics.classes.is_empty(),
        ));
        Ok(())
    }

    fn log_validation(&mut self, epoch: usize, _metrics: &MetricMap) -> Result<(), TrainingError> {
        self.0.lock().unwrap().validations.push(epoch);
        Ok(())
    }
}

impl VisualLogger for Recorder {
    fn log_args(&mut self, args: &Value) -> Result<(), TrainingError> {
        self.0.lock().unwrap().args.push(args.clone());
        Ok(())
    }

    fn log_prediction(&mut self, tag: &str, step: usize, image: &PredictionImage) -> Result<(), TrainingError> {
        assert_eq!(image.target.dims(), image.prediction.dims());
        self.0.lock().unwrap().images.push((tag.to_string(), step));
        Ok(())
    }

    fn log_metrics(&mut self, prefix: &str, epoch: usize, _metrics: &MetricMap) -> Result<(), TrainingError> {
        self.0.lock().unwrap().metrics.push((prefix.to_string(), epoch));
        Ok(())
    }

    fn log_learning_rate(&mut self, epoch: usize, learning_rate: f64) -> Result<(), TrainingError> {
        self.0.lock().unwrap().learning_rates.push((epoch, learning_rate));
        Ok(())
    }
}
