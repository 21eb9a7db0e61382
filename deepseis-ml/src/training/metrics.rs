//! Training history and segmentation metrics.

use serde::{Deserialize, Serialize};

use crate::data::LabelMask;
use crate::error::MlError;

/// Per-epoch record of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs_completed: usize,
    /// Mean training loss of each completed epoch.
    pub loss_history: Vec<f64>,
    pub val_loss_history: Vec<f64>,
    pub miou_history: Vec<f64>,
    /// Epoch (absolute) with the highest validation mIoU.
    pub best_epoch: Option<usize>,
    pub best_miou: Option<f64>,
    pub total_training_time_secs: f64,
}

impl TrainingHistory {
    pub fn record_epoch(&mut self, loss: f64, elapsed_secs: f64) {
        self.loss_history.push(loss);
        self.epochs_completed += 1;
        self.total_training_time_secs += elapsed_secs;
    }

    pub fn record_evaluation(&mut self, epoch: usize, val_loss: f64, miou: f64) {
        self.val_loss_history.push(val_loss);
        self.miou_history.push(miou);
        if self.best_miou.is_none_or(|best| miou > best) {
            self.best_miou = Some(miou);
            self.best_epoch = Some(epoch);
        }
    }
}

/// Square count matrix; rows are ground truth, columns are predictions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    num_classes: usize,
    counts: Vec<u64>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            counts: vec![0; num_classes * num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn get(&self, truth: usize, predicted: usize) -> u64 {
        self.counts[truth * self.num_classes + predicted]
    }

    /// Accumulate one mask pair. Pixels whose label or prediction is not a valid class id,
    /// the ignore label included, are skipped.
    pub fn update(&mut self, truth: &LabelMask, predicted: &LabelMask) -> Result<(), MlError> {
        if truth.dimensions() != predicted.dimensions() {
            return Err(MlError::invalid_input(format!(
                "prediction is {:?} but ground truth is {:?}",
                predicted.dimensions(),
                truth.dimensions()
            )));
        }
        let n = self.num_classes;
        for (t, p) in truth.pixels().zip(predicted.pixels()) {
            let (t, p) = (t[0] as usize, p[0] as usize);
            if t < n && p < n {
                self.counts[t * n + p] += 1;
            }
        }
        Ok(())
    }

    pub fn merge(&mut self, other: &ConfusionMatrix) -> Result<(), MlError> {
        if other.num_classes != self.num_classes {
            return Err(MlError::invalid_input(format!(
                "cannot merge {}-class matrix into {}-class matrix",
                other.num_classes, self.num_classes
            )));
        }
        for (a, b) in self.counts.iter_mut().zip(&other.counts) {
            *a += b;
        }
        Ok(())
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    fn diagonal(&self, class: usize) -> u64 {
        self.get(class, class)
    }

    fn truth_count(&self, class: usize) -> u64 {
        (0..self.num_classes).map(|p| self.get(class, p)).sum()
    }

    fn predicted_count(&self, class: usize) -> u64 {
        (0..self.num_classes).map(|t| self.get(t, class)).sum()
    }

    pub fn metrics(&self) -> SegmentationMetrics {
        SegmentationMetrics::from_confusion(self)
    }
}

/// Scores derived from a [`ConfusionMatrix`]. Empty denominators count as 0, and the class
/// means skip classes that never occur.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationMetrics {
    pub pixel_accuracy: f64,
    pub class_accuracy: Vec<f64>,
    pub mean_class_accuracy: f64,
    pub class_iou: Vec<f64>,
    pub mean_iou: f64,
    pub frequency_weighted_iou: f64,
    /// Pixels that contributed, i.e. not ignored.
    pub valid_pixels: u64,
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

fn mean_of(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

impl SegmentationMetrics {
    pub fn from_confusion(cm: &ConfusionMatrix) -> Self {
        let n = cm.num_classes();
        let total = cm.total();
        let correct: u64 = (0..n).map(|c| cm.diagonal(c)).sum();

        let mut class_accuracy = Vec::with_capacity(n);
        let mut class_iou = Vec::with_capacity(n);
        let mut present = Vec::with_capacity(n);
        let mut in_union = Vec::with_capacity(n);
        let mut fwiou = 0.0;

        for c in 0..n {
            let tp = cm.diagonal(c);
            let truth = cm.truth_count(c);
            let union = truth + cm.predicted_count(c) - tp;
            class_accuracy.push(ratio(tp, truth));
            class_iou.push(ratio(tp, union));
            present.push(truth > 0);
            in_union.push(union > 0);
            fwiou += ratio(truth, total) * ratio(tp, union);
        }

        let mean_class_accuracy = mean_of(
            class_accuracy
                .iter()
                .zip(&present)
                .filter(|(_, p)| **p)
                .map(|(a, _)| *a),
        );
        let mean_iou = mean_of(
            class_iou
                .iter()
                .zip(&in_union)
                .filter(|(_, u)| **u)
                .map(|(v, _)| *v),
        );

        Self {
            pixel_accuracy: ratio(correct, total),
            class_accuracy,
            mean_class_accuracy,
            class_iou,
            mean_iou,
            frequency_weighted_iou: fwiou,
            valid_pixels: total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepseis_core::IGNORE_LABEL;
    use image::Luma;
    use pretty_assertions::assert_eq;

    fn mask(w: u32, values: &[u8]) -> LabelMask {
        let h = values.len() as u32 / w;
        LabelMask::from_fn(w, h, |x, y| Luma([values[(y * w + x) as usize]]))
    }

    #[test]
    fn test_training_history() {
        let mut history = TrainingHistory::default();
        history.record_epoch(0.5, 1.0);
        history.record_epoch(0.3, 2.0);
        history.record_evaluation(0, 0.6, 0.4);
        history.record_evaluation(1, 0.5, 0.7);
        history.record_evaluation(2, 0.5, 0.6);
        assert_eq!(history.epochs_completed, 2);
        assert_eq!(history.best_epoch, Some(1));
        assert_eq!(history.best_miou, Some(0.7));
        assert_eq!(history.total_training_time_secs, 3.0);
    }

    #[test]
    fn test_perfect_prediction() {
        let gt = mask(2, &[0, 1, 1, 2]);
        let mut cm = ConfusionMatrix::new(3);
        cm.update(&gt, &gt).unwrap();
        let m = cm.metrics();
        assert_eq!(m.pixel_accuracy, 1.0);
        assert_eq!(m.mean_iou, 1.0);
        assert_eq!(m.class_iou, vec![1.0, 1.0, 1.0]);
        assert_eq!(m.valid_pixels, 4);
    }

    #[test]
    fn test_known_values() {
        // gt:   0 0 1 1
        // pred: 0 1 1 1
        let gt = mask(4, &[0, 0, 1, 1]);
        let pred = mask(4, &[0, 1, 1, 1]);
        let mut cm = ConfusionMatrix::new(2);
        cm.update(&gt, &pred).unwrap();
        let m = cm.metrics();
        assert_eq!(m.pixel_accuracy, 0.75);
        assert_eq!(m.class_accuracy, vec![0.5, 1.0]);
        assert_eq!(m.mean_class_accuracy, 0.75);
        assert_eq!(m.class_iou, vec![0.5, 2.0 / 3.0]);
        assert!((m.mean_iou - (0.5 + 2.0 / 3.0) / 2.0).abs() < 1e-12);
        assert!((m.frequency_weighted_iou - (0.5 * 0.5 + 0.5 * 2.0 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn test_ignore_pixels_excluded() {
        let gt = mask(4, &[0, IGNORE_LABEL, IGNORE_LABEL, 1]);
        let pred = mask(4, &[0, 1, 0, 1]);
        let mut cm = ConfusionMatrix::new(2);
        cm.update(&gt, &pred).unwrap();
        let m = cm.metrics();
        assert_eq!(m.valid_pixels, 2);
        assert_eq!(m.pixel_accuracy, 1.0);
        assert_eq!(m.mean_iou, 1.0);
    }

    #[test]
    fn test_all_ignore_is_zero() {
        let gt = mask(2, &[IGNORE_LABEL; 4]);
        let pred = mask(2, &[0, 1, 0, 1]);
        let mut cm = ConfusionMatrix::new(2);
        cm.update(&gt, &pred).unwrap();
        let m = cm.metrics();
        assert_eq!(m.valid_pixels, 0);
        assert_eq!(m.pixel_accuracy, 0.0);
        assert_eq!(m.mean_class_accuracy, 0.0);
        assert_eq!(m.mean_iou, 0.0);
        assert_eq!(m.frequency_weighted_iou, 0.0);
        assert!(m.class_iou.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_absent_class_does_not_drag_mean() {
        let gt = mask(2, &[0, 0, 1, 1]);
        let mut cm = ConfusionMatrix::new(3);
        cm.update(&gt, &gt).unwrap();
        let m = cm.metrics();
        assert_eq!(m.class_iou[2], 0.0);
        assert_eq!(m.mean_iou, 1.0);
        assert_eq!(m.mean_class_accuracy, 1.0);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut cm = ConfusionMatrix::new(2);
        assert!(cm.update(&mask(2, &[0, 0]), &mask(1, &[0, 0])).is_err());
    }

    #[test]
    fn test_merge() {
        let gt = mask(2, &[0, 1]);
        let mut a = ConfusionMatrix::new(2);
        a.update(&gt, &gt).unwrap();
        let mut b = a.clone();
        b.merge(&a).unwrap();
        assert_eq!(b.total(), 4);
        assert!(b.merge(&ConfusionMatrix::new(3)).is_err());
    }
}
