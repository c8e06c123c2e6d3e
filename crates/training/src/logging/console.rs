use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
    time::Duration,
};

use log::info;

use crate::{metrics::MetricMap, TrainingError};

/// Snapshot emitted at every logging boundary of a training epoch.
#[derive(Debug, Clone)]
pub struct IntervalRecord<'a> {
    pub epoch: usize,
    /// Completed steps in this epoch.
    pub step: usize,
    pub batches_per_epoch: usize,
    pub samples_seen: usize,
    pub dataset_len: usize,
    pub metrics: &'a MetricMap,
    /// Wall time since the previous boundary.
    pub elapsed: Duration,
}

pub trait ConsoleLogger {
    fn log_interval(&mut self, record: &IntervalRecord<'_>) -> Result<(), TrainingError>;
    fn log_validation(&mut self, epoch: usize, metrics: &MetricMap) -> Result<(), TrainingError>;
}

/// Writes summaries through `log` and appends the same lines to a file.
pub struct FileConsoleLogger {
    file: Option<BufWriter<File>>,
}

impl FileConsoleLogger {
    pub fn create(path: &Path) -> Result<Self, TrainingError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to open log file {}: {err}",
                    path.display()
                ))
            })?;
        Ok(Self {
            file: Some(BufWriter::new(file)),
        })
    }

    /// Logs through `log` only.
    pub fn stdout_only() -> Self {
        Self { file: None }
    }

    fn emit(&mut self, line: String) -> Result<(), TrainingError> {
        info!("{line}");
        if let Some(file) = self.file.as_mut() {
            writeln!(file, "{line}")?;
            file.flush()?;
        }
        Ok(())
    }
}

impl ConsoleLogger for FileConsoleLogger {
    fn log_interval(&mut self, record: &IntervalRecord<'_>) -> Result<(), TrainingError> {
        let percent = if record.dataset_len == 0 {
            0.0
        } else {
            100.0 * record.samples_seen as f64 / record.dataset_len as f64
        };
        let line = format!(
            "train epoch {} step {}/{} [{}/{} ({:.0}%)] {} time={:.2}s",
            record.epoch,
            record.step,
            record.batches_per_epoch,
            record.samples_seen,
            record.dataset_len,
            percent,
            format_metrics(record.metrics),
            record.elapsed.as_secs_f64()
        );
        self.emit(line)
    }

    fn log_validation(&mut self, epoch: usize, metrics: &MetricMap) -> Result<(), TrainingError> {
        let mut line = format!("validation epoch {} {}", epoch, format_metrics(metrics));
        for (label, class) in &metrics.classes {
            line.push_str(&format!(
                "\n  {label:<20} acc={:.4} iou={:.4} support={}",
                class.accuracy, class.iou, class.support
            ));
        }
        self.emit(line)
    }
}

fn format_metrics(metrics: &MetricMap) -> String {
    metrics
        .values
        .iter()
        .map(|(name, value)| format!("{name}={value:.4}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_lines_to_log_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("train.log");
        let mut metrics = MetricMap::default();
        metrics.values.insert("loss".into(), 0.25);

        let mut logger = FileConsoleLogger::create(&path)?;
        logger.log_interval(&IntervalRecord {
            epoch: 2,
            step: 10,
            batches_per_epoch: 20,
            samples_seen: 40,
            dataset_len: 80,
            metrics: &metrics,
            elapsed: Duration::from_millis(1500),
        })?;
        drop(logger);

        let mut reopened = FileConsoleLogger::create(&path)?;
        reopened.log_validation(2, &metrics)?;

        let contents = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines[0],
            "train epoch 2 step 10/20 [40/80 (50%)] loss=0.2500 time=1.50s"
        );
        assert_eq!(lines[1], "validation epoch 2 loss=0.2500");
        Ok(())
    }
}
