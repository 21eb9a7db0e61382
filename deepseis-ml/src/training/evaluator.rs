//! Validation passes and the observers that consume their results.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::data::{LabelMask, PatchLoader, SeismicImage};
use crate::error::MlError;
use crate::models::SegmentationModel;
use crate::training::metrics::{ConfusionMatrix, SegmentationMetrics};
use crate::training::observer::{Event, TrainingObserver};
use crate::training::state::TrainingState;

/// First validation patch with the model's prediction, for image summaries.
#[derive(Debug, Clone)]
pub struct EvaluationPreview {
    /// First channel of the network input, still normalized.
    pub image: SeismicImage,
    pub mask: LabelMask,
    pub prediction: LabelMask,
}

/// Result of one validation pass.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub epoch: usize,
    pub iteration: u64,
    /// Mean validation loss over batches.
    pub loss: f64,
    pub metrics: SegmentationMetrics,
    #[serde(skip)]
    pub preview: Option<EvaluationPreview>,
}

/// Runs a model over the validation loader and accumulates a confusion matrix.
#[derive(Debug, Clone)]
pub struct Evaluator {
    loader: PatchLoader,
    num_classes: usize,
}

impl Evaluator {
    pub fn new(loader: PatchLoader, num_classes: usize) -> Self {
        Self {
            loader,
            num_classes,
        }
    }

    pub fn loader(&self) -> &PatchLoader {
        &self.loader
    }

    /// Evaluate `model`; `epoch` and `iteration` only label the report.
    pub async fn evaluate(
        &self,
        model: &dyn SegmentationModel,
        epoch: usize,
        iteration: u64,
    ) -> Result<EvaluationReport, MlError> {
        let mut confusion = ConfusionMatrix::new(self.num_classes);
        let mut loss_sum = 0.0;
        let mut batches = 0usize;
        let mut preview = None;

        let mut stream = self.loader.epoch(0);
        while let Some(batch) = stream.next().await {
            let batch = batch?;
            loss_sum += model.loss(&batch)?;
            batches += 1;
            for sample in &batch.samples {
                let prediction = model.predict(&sample.image)?;
                confusion.update(&sample.mask, &prediction)?;
                if preview.is_none() {
                    if let Some(first) = sample.image.channels.first() {
                        preview = Some(EvaluationPreview {
                            image: first.clone(),
                            mask: sample.mask.clone(),
                            prediction,
                        });
                    }
                }
            }
            tokio::task::yield_now().await;
        }

        Ok(EvaluationReport {
            epoch,
            iteration,
            loss: if batches > 0 {
                loss_sum / batches as f64
            } else {
                0.0
            },
            metrics: confusion.metrics(),
            preview,
        })
    }
}

/// Consumer of validation results, called after every evaluation in registration order.
pub trait EvaluationObserver: Send {
    fn name(&self) -> &str;

    fn on_evaluation(
        &mut self,
        state: &TrainingState,
        model: &dyn SegmentationModel,
        report: &EvaluationReport,
    ) -> Result<(), MlError>;
}

/// Reports collected over a run, previews stripped.
pub type EvaluationLog = Arc<Mutex<Vec<EvaluationReport>>>;

/// Runs the evaluator when an epoch completes and hands the report to its observers.
pub struct EvaluationTrigger {
    evaluator: Evaluator,
    observers: Vec<Box<dyn EvaluationObserver>>,
    log: EvaluationLog,
}

impl EvaluationTrigger {
    pub fn new(evaluator: Evaluator) -> Self {
        Self {
            evaluator,
            observers: Vec::new(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn EvaluationObserver>) {
        self.observers.push(observer);
    }

    /// Shared handle on the reports, readable after the trigger has been moved into a driver.
    pub fn log(&self) -> EvaluationLog {
        Arc::clone(&self.log)
    }
}

#[async_trait]
impl TrainingObserver for EvaluationTrigger {
    fn name(&self) -> &str {
        "evaluation_trigger"
    }

    async fn on_epoch_complete(&mut self, event: &Event<'_>) -> Result<(), MlError> {
        let state = event.state;
        let report = self
            .evaluator
            .evaluate(event.model, state.epoch, state.iteration)
            .await?;

        for observer in &mut self.observers {
            observer
                .on_evaluation(state, event.model, &report)
                .map_err(|e| match e {
                    MlError::Observer { .. } => e,
                    other => MlError::observer(observer.name(), other.to_string()),
                })?;
        }

        let mut log = self
            .log
            .lock()
            .map_err(|_| MlError::training("evaluation log lock poisoned"))?;
        log.push(EvaluationReport {
            preview: None,
            ..report
        });
        Ok(())
    }
}

/// Logs the headline validation metrics.
#[derive(Debug, Default)]
pub struct MetricsLogger;

impl EvaluationObserver for MetricsLogger {
    fn name(&self) -> &str {
        "metrics_logger"
    }

    fn on_evaluation(
        &mut self,
        state: &TrainingState,
        _model: &dyn SegmentationModel,
        report: &EvaluationReport,
    ) -> Result<(), MlError> {
        let m = &report.metrics;
        tracing::info!(
            epoch = state.epoch,
            loss = report.loss,
            pixacc = m.pixel_accuracy,
            mca = m.mean_class_accuracy,
            miou = m.mean_iou,
            fwiou = m.frequency_weighted_iou,
            pixels = m.valid_pixels,
            "Validation"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::AugmentationPipeline;
    use crate::data::{
        BoundaryPolicy, LoaderOptions, PatchDataset, PatchOptions, VolumeSample,
    };
    use crate::models::{ModelRegistry, ModelSpec};
    use deepseis_core::{DepthMode, IGNORE_LABEL};
    use image::Luma;

    fn loader(mask_value: u8) -> PatchLoader {
        let image = SeismicImage::from_fn(4, 4, |x, _| Luma([x as f32]));
        let mask = LabelMask::from_pixel(4, 4, Luma([mask_value]));
        let sample = VolumeSample::new("s", image, mask).unwrap();
        let options = PatchOptions {
            patch_size: 2,
            stride: 2,
            channels: 1,
            depth: DepthMode::No,
            boundary: BoundaryPolicy::CompleteOnly,
        };
        let dataset =
            PatchDataset::from_samples(vec![sample], options, AugmentationPipeline::default(), 0)
                .unwrap();
        let opts = LoaderOptions {
            batch_size: 3,
            ..LoaderOptions::default()
        };
        PatchLoader::new(Arc::new(dataset), opts, 0)
    }

    fn model() -> Box<dyn SegmentationModel> {
        let spec = ModelSpec {
            num_classes: 2,
            in_channels: 1,
            class_weights: None,
            seed: 1,
        };
        ModelRegistry::builtin().create("pixel_linear", &spec).unwrap()
    }

    #[tokio::test]
    async fn test_evaluate_counts_every_pixel() {
        let evaluator = Evaluator::new(loader(1), 2);
        let model = model();
        let report = evaluator.evaluate(model.as_ref(), 3, 40).await.unwrap();
        assert_eq!(report.epoch, 3);
        assert_eq!(report.iteration, 40);
        assert_eq!(report.metrics.valid_pixels, 16);
        let preview = report.preview.unwrap();
        assert_eq!(preview.mask.dimensions(), (2, 2));
        assert_eq!(preview.prediction.dimensions(), (2, 2));
    }

    #[tokio::test]
    async fn test_all_ignore_validation_is_zero() {
        let evaluator = Evaluator::new(loader(IGNORE_LABEL), 2);
        let model = model();
        let report = evaluator.evaluate(model.as_ref(), 0, 0).await.unwrap();
        assert_eq!(report.metrics.valid_pixels, 0);
        assert_eq!(report.metrics.mean_iou, 0.0);
        assert_eq!(report.metrics.pixel_accuracy, 0.0);
        assert_eq!(report.loss, 0.0);
    }

    struct Failing;

    impl EvaluationObserver for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_evaluation(
            &mut self,
            _state: &TrainingState,
            _model: &dyn SegmentationModel,
            _report: &EvaluationReport,
        ) -> Result<(), MlError> {
            Err(MlError::Checkpoint("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_trigger_logs_and_propagates() {
        let model = model();
        let state = TrainingState::new(0, 1, 1);
        let event = Event {
            state: &state,
            model: model.as_ref(),
        };

        let mut trigger = EvaluationTrigger::new(Evaluator::new(loader(0), 2));
        trigger.add_observer(Box::new(MetricsLogger));
        let log = trigger.log();
        trigger.on_epoch_complete(&event).await.unwrap();
        {
            let reports = log.lock().unwrap();
            assert_eq!(reports.len(), 1);
            assert!(reports[0].preview.is_none());
        }

        trigger.add_observer(Box::new(Failing));
        let err = trigger.on_epoch_complete(&event).await.unwrap_err();
        match err {
            MlError::Observer { observer, message } => {
                assert_eq!(observer, "failing");
                assert!(message.contains("disk full"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
