use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::{safetensors, DType, Device, Tensor};
use serde::Deserialize;
use serde_json::Value;

use super::{
    dataset::{default_palette, DatasetMode, Sample, SegmentationDataset},
    Result,
};
use crate::{error::to_runtime_error, TrainingError};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FolderArgs {
    labels: Vec<String>,
    #[serde(default = "default_ignore_index")]
    ignore_index: Option<u32>,
    #[serde(default)]
    palette: Option<Vec<[u8; 3]>>,
}

fn default_ignore_index() -> Option<u32> {
    Some(255)
}

/// Samples stored as `<data_dir>/<mode>/<id>.safetensors`, each holding an
/// `input` `(c, h, w)` tensor and a `target` `(h, w)` label tensor.
pub struct SafetensorsFolderDataset {
    files: Vec<PathBuf>,
    labels: Vec<String>,
    ignore_index: Option<u32>,
    in_channels: usize,
    palette: Vec<[u8; 3]>,
}

impl SafetensorsFolderDataset {
    pub fn open(data_dir: &Path, args: &Value, mode: DatasetMode) -> Result<Self> {
        let args: FolderArgs = serde_json::from_value(args.clone()).map_err(|err| {
            TrainingError::initialization(format!("invalid safetensors_folder args: {err}"))
        })?;
        if args.labels.len() < 2 {
            return Err(TrainingError::initialization(
                "safetensors_folder requires at least two labels",
            ));
        }

        let dir = data_dir.join(mode.as_str());
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to list dataset directory {}: {err}",
                    dir.display()
                ))
            })?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("safetensors"))
            .collect();
        files.sort();

        let Some(first) = files.first() else {
            return Err(TrainingError::initialization(format!(
                "no .safetensors samples found in {}",
                dir.display()
            )));
        };
        let in_channels = match load_tensors(first)?.0.dims() {
            [channels, _, _] => *channels,
            dims => {
                return Err(TrainingError::initialization(format!(
                    "{}: input must be (c, h, w), got {dims:?}",
                    first.display()
                )))
            }
        };

        let palette = match args.palette {
            Some(palette) if palette.len() == args.labels.len() => palette,
            Some(_) => {
                return Err(TrainingError::initialization(
                    "safetensors_folder palette must have one color per label",
                ))
            }
            None => default_palette(args.labels.len()),
        };

        Ok(Self {
            files,
            labels: args.labels,
            ignore_index: args.ignore_index,
            in_channels,
            palette,
        })
    }
}

fn load_tensors(path: &Path) -> Result<(Tensor, Tensor)> {
    let mut tensors = safetensors::load(path, &Device::Cpu).map_err(to_runtime_error)?;
    let mut take = |key: &str| {
        tensors.remove(key).ok_or_else(|| {
            TrainingError::runtime(format!("{} is missing tensor '{key}'", path.display()))
        })
    };
    let input = take("input")?;
    let target = take("target")?;
    let input = input.to_dtype(DType::F32).map_err(to_runtime_error)?;
    let target = target.to_dtype(DType::U32).map_err(to_runtime_error)?;
    Ok((input, target))
}

impl SegmentationDataset for SafetensorsFolderDataset {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let path = self.files.get(index).ok_or_else(|| {
            TrainingError::runtime(format!(
                "dataset index {index} out of range ({} samples)",
                self.files.len()
            ))
        })?;
        let (input, target) = load_tensors(path)?;
        let id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| index.to_string());
        Sample::new(id, input, target)
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn ignore_index(&self) -> Option<u32> {
        self.ignore_index
    }

    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn color_palette(&self) -> &[[u8; 3]] {
        &self.palette
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use serde_json::json;

    fn write_sample(dir: &Path, name: &str, fill: f32) -> anyhow::Result<()> {
        let input = Tensor::full(fill, (2, 3, 4), &Device::Cpu)?;
        let target = Tensor::from_vec(vec![0u8, 1, 255, 1, 0, 0, 1, 1, 0, 1, 0, 255], (3, 4), &Device::Cpu)?;
        let tensors = HashMap::from([("input".to_string(), input), ("target".to_string(), target)]);
        safetensors::save(&tensors, dir.join(format!("{name}.safetensors")))?;
        Ok(())
    }

    #[test]
    fn loads_sorted_samples_from_mode_directory() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let train = root.path().join("train");
        fs::create_dir_all(&train)?;
        write_sample(&train, "b", 2.0)?;
        write_sample(&train, "a", 1.0)?;
        fs::write(train.join("notes.txt"), "ignored")?;

        let dataset = SafetensorsFolderDataset::open(
            root.path(),
            &json!({"labels": ["background", "road"]}),
            DatasetMode::Train,
        )?;
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.in_channels(), 2);
        assert_eq!(dataset.ignore_index(), Some(255));

        let sample = dataset.get(0)?;
        assert_eq!(sample.id, "a");
        assert_eq!(sample.target.dtype(), DType::U32);
        assert_eq!(sample.target.dims(), &[3, 4]);
        Ok(())
    }

    #[test]
    fn missing_directory_fails_fast() {
        let root = tempfile::tempdir().unwrap();
        let result = SafetensorsFolderDataset::open(
            root.path(),
            &json!({"labels": ["a", "b"]}),
            DatasetMode::Val,
        );
        assert!(result.is_err());
    }
}
