//! Name-based resolution of the pluggable collaborators.
//!
//! Each kind has a fixed table of factories pre-populated with the bundled
//! implementations; callers may register more before building a trainer.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use rand::rngs::StdRng;
use segmodel::{ModelSpec, SegmentationModel};
use serde_json::Value;

use crate::{
    config::TrainingConfig,
    data::{
        DatasetMode, Identity, Normalize, RandomFlip, SafetensorsFolderDataset,
        SampleTransformer, SegmentationDataset, SyntheticDataset,
    },
    optimizer::OPTIMIZER_NAMES,
    scheduler::SCHEDULER_NAMES,
    TrainingError,
};

pub type ModelFactory = Box<
    dyn Fn(ModelSpec, &mut StdRng) -> candle_core::Result<Box<dyn SegmentationModel>> + Send + Sync,
>;
pub type DatasetFactory = Box<
    dyn Fn(&Path, &Value, DatasetMode) -> Result<Arc<dyn SegmentationDataset>, TrainingError>
        + Send
        + Sync,
>;
pub type TransformerFactory =
    Box<dyn Fn(&Value) -> Result<Arc<dyn SampleTransformer>, TrainingError> + Send + Sync>;

pub struct ComponentRegistry {
    models: BTreeMap<String, ModelFactory>,
    datasets: BTreeMap<String, DatasetFactory>,
    transformers: BTreeMap<String, TransformerFactory>,
}

impl ComponentRegistry {
    pub fn empty() -> Self {
        Self {
            models: BTreeMap::new(),
            datasets: BTreeMap::new(),
            transformers: BTreeMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for &name in segmodel::MODEL_NAMES {
            registry.register_model(name, move |spec, rng| segmodel::build_model(name, spec, rng));
        }

        registry.register_dataset("synthetic", |_, args, mode| {
            Ok(Arc::new(SyntheticDataset::from_args(args, mode)?))
        });
        registry.register_dataset("safetensors_folder", |data_dir, args, mode| {
            Ok(Arc::new(SafetensorsFolderDataset::open(data_dir, args, mode)?))
        });

        registry.register_transformer("identity", |_| Ok(Arc::new(Identity)));
        registry.register_transformer("normalize", |args| {
            Ok(Arc::new(Normalize::from_args(args)?))
        });
        registry.register_transformer("random_flip", |args| {
            Ok(Arc::new(RandomFlip::from_args(args)?))
        });
        registry
    }

    pub fn register_model<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(ModelSpec, &mut StdRng) -> candle_core::Result<Box<dyn SegmentationModel>>
            + Send
            + Sync
            + 'static,
    {
        self.models.insert(name.into(), Box::new(factory));
    }

    pub fn register_dataset<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Path, &Value, DatasetMode) -> Result<Arc<dyn SegmentationDataset>, TrainingError>
            + Send
            + Sync
            + 'static,
    {
        self.datasets.insert(name.into(), Box::new(factory));
    }

    pub fn register_transformer<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn SampleTransformer>, TrainingError> + Send + Sync + 'static,
    {
        self.transformers.insert(name.into(), Box::new(factory));
    }

    /// Fails on the first configured name with no registered factory.
    pub fn check(&self, config: &TrainingConfig) -> Result<(), TrainingError> {
        lookup(&self.models, "model", &config.model.name)?;
        lookup(&self.datasets, "dataset", &config.dataset.name)?;
        lookup(&self.transformers, "transformer", &config.transformer.name)?;
        if !OPTIMIZER_NAMES.contains(&config.optimizer.name.as_str()) {
            return Err(TrainingError::unknown_component(
                "optimizer",
                &config.optimizer.name,
                OPTIMIZER_NAMES,
            ));
        }
        if !SCHEDULER_NAMES.contains(&config.scheduler.name.as_str()) {
            return Err(TrainingError::unknown_component(
                "scheduler",
                &config.scheduler.name,
                SCHEDULER_NAMES,
            ));
        }
        Ok(())
    }

    pub fn build_model(
        &self,
        name: &str,
        spec: ModelSpec,
        rng: &mut StdRng,
    ) -> Result<Box<dyn SegmentationModel>, TrainingError> {
        let factory = lookup(&self.models, "model", name)?;
        factory(spec, rng).map_err(|err| {
            TrainingError::initialization(format!("failed to build model '{name}': {err}"))
        })
    }

    pub fn build_dataset(
        &self,
        name: &str,
        data_dir: &Path,
        args: &Value,
        mode: DatasetMode,
    ) -> Result<Arc<dyn SegmentationDataset>, TrainingError> {
        lookup(&self.datasets, "dataset", name)?(data_dir, args, mode)
    }

    pub fn build_transformer(
        &self,
        name: &str,
        args: &Value,
    ) -> Result<Arc<dyn SampleTransformer>, TrainingError> {
        lookup(&self.transformers, "transformer", name)?(args)
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn lookup<'a, T>(
    table: &'a BTreeMap<String, T>,
    kind: &'static str,
    name: &str,
) -> Result<&'a T, TrainingError> {
    table.get(name).ok_or_else(|| TrainingError::UnknownComponent {
        kind,
        name: name.to_string(),
        known: table.keys().cloned().collect(),
    })
}
