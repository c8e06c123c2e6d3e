use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use candle_core::{DType, Device, Tensor};
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{error::to_runtime_error, metrics::MetricMap, TrainingError};

/// First example of a batch, rendered side by side as input | target | prediction.
#[derive(Debug, Clone)]
pub struct PredictionImage {
    /// `(channels, h, w)`.
    pub input: Tensor,
    /// `(h, w)` u32.
    pub target: Tensor,
    /// `(h, w)` u32.
    pub prediction: Tensor,
}

pub trait VisualLogger {
    fn log_args(&mut self, args: &serde_json::Value) -> Result<(), TrainingError>;
    fn log_prediction(
        &mut self,
        tag: &str,
        step: usize,
        image: &PredictionImage,
    ) -> Result<(), TrainingError>;
    /// `prefix` is `train` or `val`; `epoch` is the x coordinate.
    fn log_metrics(
        &mut self,
        prefix: &str,
        epoch: usize,
        metrics: &MetricMap,
    ) -> Result<(), TrainingError>;
    fn log_learning_rate(&mut self, epoch: usize, learning_rate: f64) -> Result<(), TrainingError>;
    fn flush(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// Scalars go to a TensorBoard event file, predictions to PPM files and the
/// run arguments to `args.json`, all under one directory.
pub struct TensorBoardLogger {
    dir: PathBuf,
    writer: TensorBoardWriter,
    palette: Vec<[u8; 3]>,
}

impl TensorBoardLogger {
    pub fn create(
        dir: &Path,
        palette: Vec<[u8; 3]>,
        flush_every: usize,
    ) -> Result<Self, TrainingError> {
        let writer = TensorBoardWriter::create(dir, flush_every)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            writer,
            palette,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn label_color(&self, label: u32) -> [u8; 3] {
        self.palette
            .get(label as usize)
            .copied()
            .unwrap_or([255, 255, 255])
    }
}

impl VisualLogger for TensorBoardLogger {
    fn log_args(&mut self, args: &serde_json::Value) -> Result<(), TrainingError> {
        let contents = serde_json::to_string_pretty(args)?;
        fs::write(self.dir.join("args.json"), contents)?;
        Ok(())
    }

    fn log_prediction(
        &mut self,
        tag: &str,
        step: usize,
        image: &PredictionImage,
    ) -> Result<(), TrainingError> {
        let input = render_input(&image.input)?;
        let target = render_labels(&image.target, |label| self.label_color(label))?;
        let prediction = render_labels(&image.prediction, |label| self.label_color(label))?;
        let panel = RgbImage::side_by_side(&[input, target, prediction])?;

        let images = self.dir.join("images");
        fs::create_dir_all(&images)?;
        let path = images.join(format!("{tag}_{step:08}.ppm"));
        panel.write_ppm(&path)
    }

    fn log_metrics(
        &mut self,
        prefix: &str,
        epoch: usize,
        metrics: &MetricMap,
    ) -> Result<(), TrainingError> {
        let step = epoch as i64;
        for (name, value) in &metrics.values {
            self.writer
                .write_scalar(&format!("{prefix}/{name}"), step, *value)?;
        }
        for (label, class) in &metrics.classes {
            self.writer
                .write_scalar(&format!("{prefix}/iou/{label}"), step, class.iou)?;
            self.writer
                .write_scalar(&format!("{prefix}/accuracy/{label}"), step, class.accuracy)?;
        }
        Ok(())
    }

    fn log_learning_rate(&mut self, epoch: usize, learning_rate: f64) -> Result<(), TrainingError> {
        self.writer
            .write_scalar("train/learning_rate", epoch as i64, learning_rate)
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush()
    }
}

struct RgbImage {
    width: usize,
    height: usize,
    pixels: Vec<[u8; 3]>,
}

impl RgbImage {
    fn side_by_side(tiles: &[RgbImage]) -> Result<Self, TrainingError> {
        let height = tiles.first().map(|tile| tile.height).unwrap_or(0);
        if tiles.iter().any(|tile| tile.height != height) {
            return Err(TrainingError::runtime(
                "prediction panels must share the same height",
            ));
        }
        let width = tiles.iter().map(|tile| tile.width).sum();
        let mut pixels = Vec::with_capacity(width * height);
        for row in 0..height {
            for tile in tiles {
                pixels.extend_from_slice(&tile.pixels[row * tile.width..(row + 1) * tile.width]);
            }
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    fn write_ppm(&self, path: &Path) -> Result<(), TrainingError> {
        let mut writer = BufWriter::new(File::create(path)?);
        write!(writer, "P6\n{} {}\n255\n", self.width, self.height)?;
        for pixel in &self.pixels {
            writer.write_all(pixel)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Min-max scales the input. Three channels render as RGB, anything else
/// shows the first channel in gray.
fn render_input(input: &Tensor) -> Result<RgbImage, TrainingError> {
    let (channels, height, width) = input.dims3().map_err(to_runtime_error)?;
    let planes = input
        .to_device(&Device::Cpu)
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.to_vec3::<f32>())
        .map_err(to_runtime_error)?;
    let (min, max) = planes
        .iter()
        .flatten()
        .flatten()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = if max > min { max - min } else { 1.0 };
    let scale = |v: f32| (((v - min) / range) * 255.0).round().clamp(0.0, 255.0) as u8;

    let mut pixels = Vec::with_capacity(height * width);
    for y in 0..height {
        for x in 0..width {
            let pixel = if channels == 3 {
                [scale(planes[0][y][x]), scale(planes[1][y][x]), scale(planes[2][y][x])]
            } else {
                let v = scale(planes[0][y][x]);
                [v, v, v]
            };
            pixels.push(pixel);
        }
    }
    Ok(RgbImage {
        width,
        height,
        pixels,
    })
}

fn render_labels(
    labels: &Tensor,
    color: impl Fn(u32) -> [u8; 3],
) -> Result<RgbImage, TrainingError> {
    let (height, width) = labels.dims2().map_err(to_runtime_error)?;
    let values = labels
        .to_device(&Device::Cpu)
        .and_then(|t| t.to_dtype(DType::U32))
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<u32>())
        .map_err(to_runtime_error)?;
    Ok(RgbImage {
        width,
        height,
        pixels: values.into_iter().map(color).collect(),
    })
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create visual log directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create event file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    /// TFRecord framing: length, masked length crc, payload, masked payload crc.
    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode event: {err}"))
        })?;
        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&masked_crc32(&len_bytes).to_le_bytes()))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&masked_crc32(&data).to_le_bytes()))
            .map_err(|err| TrainingError::runtime(format!("failed to write event: {err}")))?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer
            .flush()
            .map_err(|err| TrainingError::runtime(format!("failed to flush event file: {err}")))?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
