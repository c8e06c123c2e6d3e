pub mod dataset;
pub mod folder;
pub mod loader;
pub mod synthetic;
pub mod transform;

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

pub use dataset::{DatasetMode, Sample, SegmentationDataset};
pub use folder::SafetensorsFolderDataset;
pub use loader::{BlockingDataLoader, DataLoader, LogicalBatch, SegmentationLoader};
pub use synthetic::SyntheticDataset;
pub use transform::{Identity, Normalize, RandomFlip, SampleTransformer};
