use std::collections::BTreeMap;

use serde::Serialize;

use crate::TrainingError;

/// Accumulates per-step predictions and reports named metrics.
pub trait MetricsEngine {
    /// `predictions` and `targets` are flattened label maps of equal length.
    fn add(&mut self, predictions: &[u32], targets: &[u32], loss: f64) -> Result<(), TrainingError>;
    fn metrics(&self) -> MetricMap;
    fn reset(&mut self);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub accuracy: f64,
    pub iou: f64,
    pub support: u64,
}

/// Scalar metrics plus a per-class breakdown keyed by label name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricMap {
    pub values: BTreeMap<String, f64>,
    pub classes: BTreeMap<String, ClassMetrics>,
}

impl MetricMap {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn without_classes(mut self) -> Self {
        self.classes.clear();
        self
    }
}

/// Confusion-matrix backed segmentation metrics.
#[derive(Debug, Clone)]
pub struct SegmentationMetrics {
    labels: Vec<String>,
    ignore_index: Option<u32>,
    /// Row = target class, column = predicted class.
    confusion: Vec<u64>,
    loss_sum: f64,
    steps: usize,
}

impl SegmentationMetrics {
    pub fn new(labels: Vec<String>, ignore_index: Option<u32>) -> Self {
        let n = labels.len();
        Self {
            labels,
            ignore_index,
            confusion: vec![0; n * n],
            loss_sum: 0.0,
            steps: 0,
        }
    }

    pub fn n_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn confusion(&self) -> &[u64] {
        &self.confusion
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    fn row_sum(&self, class: usize) -> u64 {
        let n = self.n_classes();
        self.confusion[class * n..(class + 1) * n].iter().sum()
    }

    fn col_sum(&self, class: usize) -> u64 {
        let n = self.n_classes();
        (0..n).map(|row| self.confusion[row * n + class]).sum()
    }
}

impl MetricsEngine for SegmentationMetrics {
    fn add(&mut self, predictions: &[u32], targets: &[u32], loss: f64) -> Result<(), TrainingError> {
        if predictions.len() != targets.len() {
            return Err(TrainingError::runtime(format!(
                "prediction count {} does not match target count {}",
                predictions.len(),
                targets.len()
            )));
        }

        let n = self.n_classes();
        for (&prediction, &target) in predictions.iter().zip(targets) {
            if Some(target) == self.ignore_index {
                continue;
            }
            let (p, t) = (prediction as usize, target as usize);
            if p >= n || t >= n {
                return Err(TrainingError::runtime(format!(
                    "label out of range: prediction {p}, target {t}, classes {n}"
                )));
            }
            self.confusion[t * n + p] += 1;
        }

        self.loss_sum += loss;
        self.steps += 1;
        Ok(())
    }

    fn metrics(&self) -> MetricMap {
        let n = self.n_classes();
        let total: u64 = self.confusion.iter().sum();
        let correct: u64 = (0..n).map(|c| self.confusion[c * n + c]).sum();

        let mut classes = BTreeMap::new();
        let mut accuracies = Vec::new();
        let mut ious = Vec::new();
        let mut fw_iou = 0.0;

        for (class, label) in self.labels.iter().enumerate() {
            let hits = self.confusion[class * n + class];
            let support = self.row_sum(class);
            let union = support + self.col_sum(class) - hits;

            let accuracy = ratio(hits, support);
            let iou = ratio(hits, union);
            if support > 0 {
                accuracies.push(accuracy);
                fw_iou += ratio(support, total) * iou;
            }
            if union > 0 {
                ious.push(iou);
            }
            classes.insert(
                label.clone(),
                ClassMetrics {
                    accuracy,
                    iou,
                    support,
                },
            );
        }

        let loss = if self.steps == 0 {
            0.0
        } else {
            self.loss_sum / self.steps as f64
        };

        let mut values = BTreeMap::new();
        values.insert("loss".to_string(), loss);
        values.insert("pixel_accuracy".to_string(), ratio(correct, total));
        values.insert("mean_class_accuracy".to_string(), mean(&accuracies));
        values.insert("mean_iou".to_string(), mean(&ious));
        values.insert("fw_iou".to_string(), fw_iou);

        MetricMap { values, classes }
    }

    fn reset(&mut self) {
        self.confusion.iter_mut().for_each(|cell| *cell = 0);
        self.loss_sum = 0.0;
        self.steps = 0;
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<String> {
        vec!["background".into(), "object".into()]
    }

    #[test]
    fn computes_confusion_based_metrics() {
        let mut metrics = SegmentationMetrics::new(labels(), Some(255));
        // targets: 0 0 1 1 255 ; predictions: 0 1 1 1 0
        metrics
            .add(&[0, 1, 1, 1, 0], &[0, 0, 1, 1, 255], 0.5)
            .unwrap();
        let result = metrics.metrics();

        assert_eq!(metrics.confusion(), &[1, 1, 0, 2]);
        assert!((result.get("pixel_accuracy").unwrap() - 0.75).abs() < 1e-12);
        // class accuracies: 0.5, 1.0
        assert!((result.get("mean_class_accuracy").unwrap() - 0.75).abs() < 1e-12);
        // ious: 1/2, 2/3
        let mean_iou = (0.5 + 2.0 / 3.0) / 2.0;
        assert!((result.get("mean_iou").unwrap() - mean_iou).abs() < 1e-12);
        let fw_iou = 0.5 * 0.5 + 0.5 * (2.0 / 3.0);
        assert!((result.get("fw_iou").unwrap() - fw_iou).abs() < 1e-12);
        assert_eq!(result.get("loss"), Some(0.5));
        assert_eq!(result.classes["object"].support, 2);
    }

    #[test]
    fn loss_is_averaged_over_steps_and_reset_clears_state() {
        let mut metrics = SegmentationMetrics::new(labels(), None);
        metrics.add(&[0], &[0], 1.0).unwrap();
        metrics.add(&[1], &[1], 3.0).unwrap();
        assert_eq!(metrics.metrics().get("loss"), Some(2.0));

        metrics.reset();
        assert_eq!(metrics.steps(), 0);
        assert_eq!(metrics.confusion(), &[0, 0, 0, 0]);
        assert_eq!(metrics.metrics().get("pixel_accuracy"), Some(0.0));
    }

    #[test]
    fn rejects_out_of_range_labels() {
        let mut metrics = SegmentationMetrics::new(labels(), Some(255));
        assert!(metrics.add(&[2], &[0], 0.0).is_err());
        assert!(metrics.add(&[0, 1], &[0], 0.0).is_err());
    }

    #[test]
    fn console_view_drops_class_breakdown() {
        let mut metrics = SegmentationMetrics::new(labels(), None);
        metrics.add(&[0], &[0], 0.0).unwrap();
        let summary = metrics.metrics().without_classes();
        assert!(summary.classes.is_empty());
        assert!(summary.values.contains_key("mean_iou"));
    }
}
