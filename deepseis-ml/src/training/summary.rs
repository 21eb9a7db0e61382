//! Scalar and image summaries under the log directory.
//!
//! Scalars are appended to `scalars.jsonl`, one JSON object per line. Images are PNG files
//! under `images/`, named after their tag and step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{GrayImage, Luma, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::augment::transforms::denormalize;
use crate::data::{LabelMask, SeismicImage};
use crate::error::MlError;
use crate::models::SegmentationModel;
use crate::training::evaluator::{EvaluationObserver, EvaluationReport};
use crate::training::observer::{Event, TrainingObserver};
use crate::training::state::TrainingState;

pub const SCALARS_FILE: &str = "scalars.jsonl";

/// One line of `scalars.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub step: u64,
    pub value: f64,
    pub wall_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SummaryWriter {
    dir: PathBuf,
}

impl SummaryWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, MlError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn scalars_path(&self) -> PathBuf {
        self.dir.join(SCALARS_FILE)
    }

    pub fn add_scalar(&self, tag: &str, step: u64, value: f64) -> Result<(), MlError> {
        let event = ScalarEvent {
            tag: tag.to_string(),
            step,
            value,
            wall_time: Utc::now(),
        };
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.scalars_path())?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Save `image` as `images/<tag>_<step>.png`, with `/` in the tag replaced by `_`.
    pub fn add_image(
        &self,
        tag: &str,
        step: u64,
        image: impl Into<image::DynamicImage>,
    ) -> Result<PathBuf, MlError> {
        let dir = self.dir.join("images");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}_{step:08}.png", tag.replace('/', "_")));
        let rendered: image::DynamicImage = image.into();
        rendered
            .save_with_format(&path, image::ImageFormat::Png)
            .map_err(|source| MlError::Image {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// Read back every scalar event written so far.
    pub fn read_scalars(path: &Path) -> Result<Vec<ScalarEvent>, MlError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(MlError::from))
            .collect()
    }
}

/// Min-max scale amplitudes into an 8-bit image. A flat image renders mid-gray.
pub fn amplitude_to_gray(image: &SeismicImage) -> GrayImage {
    let (lo, hi) = image
        .pixels()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p[0]), hi.max(p[0]))
        });
    let span = hi - lo;
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let v = image.get_pixel(x, y)[0];
        if span > 0.0 && span.is_finite() {
            Luma([(((v - lo) / span) * 255.0).round() as u8])
        } else {
            Luma([128])
        }
    })
}

const PALETTE: [[u8; 3]; 8] = [
    [69, 117, 180],
    [145, 191, 219],
    [224, 243, 248],
    [254, 224, 144],
    [252, 141, 89],
    [215, 48, 39],
    [102, 189, 99],
    [153, 112, 171],
];

/// Colour class ids from a fixed palette; the ignore label renders black.
pub fn labels_to_rgb(mask: &LabelMask) -> RgbImage {
    RgbImage::from_fn(mask.width(), mask.height(), |x, y| {
        let label = mask.get_pixel(x, y)[0];
        if label == deepseis_core::IGNORE_LABEL {
            Rgb([0, 0, 0])
        } else {
            Rgb(PALETTE[label as usize % PALETTE.len()])
        }
    })
}

/// Writes training loss and learning rate per iteration and mean loss per epoch.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    writer: SummaryWriter,
}

impl TrainingSummary {
    pub fn new(writer: SummaryWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl TrainingObserver for TrainingSummary {
    fn name(&self) -> &str {
        "training_summary"
    }

    async fn on_iteration_complete(&mut self, event: &Event<'_>) -> Result<(), MlError> {
        let state = event.state;
        if let Some(loss) = state.last_loss {
            self.writer.add_scalar("training/loss", state.iteration, loss)?;
        }
        self.writer
            .add_scalar("training/learning_rate", state.iteration, state.learning_rate)
    }

    async fn on_epoch_complete(&mut self, event: &Event<'_>) -> Result<(), MlError> {
        let state = event.state;
        match state.history.loss_history.last() {
            Some(loss) => self
                .writer
                .add_scalar("training/epoch_loss", state.epoch as u64, *loss),
            None => Ok(()),
        }
    }
}

/// Writes validation metrics and a preview of input, ground truth and prediction per epoch.
#[derive(Debug, Clone)]
pub struct ValidationSummary {
    writer: SummaryWriter,
    normalization: Option<(f32, f32)>,
}

impl ValidationSummary {
    /// `normalization` undoes the pipeline's normalize step before rendering.
    pub fn new(writer: SummaryWriter, normalization: Option<(f32, f32)>) -> Self {
        Self {
            writer,
            normalization,
        }
    }
}

impl EvaluationObserver for ValidationSummary {
    fn name(&self) -> &str {
        "validation_summary"
    }

    fn on_evaluation(
        &mut self,
        state: &TrainingState,
        _model: &dyn SegmentationModel,
        report: &EvaluationReport,
    ) -> Result<(), MlError> {
        let step = state.epoch as u64;
        let m = &report.metrics;
        self.writer.add_scalar("validation/loss", step, report.loss)?;
        self.writer.add_scalar("validation/pixacc", step, m.pixel_accuracy)?;
        self.writer.add_scalar("validation/mca", step, m.mean_class_accuracy)?;
        self.writer.add_scalar("validation/mIoU", step, m.mean_iou)?;
        self.writer.add_scalar("validation/fwIoU", step, m.frequency_weighted_iou)?;
        for (class, iou) in m.class_iou.iter().enumerate() {
            self.writer
                .add_scalar(&format!("validation/iou_class_{class}"), step, *iou)?;
        }

        if let Some(preview) = &report.preview {
            let mut image = preview.image.clone();
            if let Some((mean, std)) = self.normalization {
                denormalize(&mut image, mean, std);
            }
            self.writer
                .add_image("validation/image", step, amplitude_to_gray(&image))?;
            self.writer
                .add_image("validation/mask", step, labels_to_rgb(&preview.mask))?;
            self.writer
                .add_image("validation/pred", step, labels_to_rgb(&preview.prediction))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scalars_append() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SummaryWriter::new(dir.path().join("log")).unwrap();
        writer.add_scalar("training/loss", 1, 0.5).unwrap();
        writer.add_scalar("training/loss", 2, 0.25).unwrap();

        let events = SummaryWriter::read_scalars(&writer.scalars_path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].tag, "training/loss");
        assert_eq!(events[1].step, 2);
        assert_eq!(events[1].value, 0.25);
    }

    #[test]
    fn test_image_written_as_png() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SummaryWriter::new(dir.path()).unwrap();
        let mask = LabelMask::from_fn(3, 2, |x, _| Luma([x as u8]));
        let path = writer
            .add_image("validation/mask", 7, labels_to_rgb(&mask))
            .unwrap();
        assert!(path.ends_with("images/validation_mask_00000007.png"));
        let decoded = image::open(&path).unwrap().into_rgb8();
        assert_eq!(decoded.dimensions(), (3, 2));
        assert_eq!(decoded.get_pixel(1, 0).0, PALETTE[1]);
    }

    #[test]
    fn test_gray_rendering() {
        let flat = SeismicImage::from_pixel(2, 2, Luma([3.0]));
        assert!(amplitude_to_gray(&flat).pixels().all(|p| p[0] == 128));

        let ramp = SeismicImage::from_fn(3, 1, |x, _| Luma([x as f32 - 1.0]));
        let gray = amplitude_to_gray(&ramp);
        assert_eq!(gray.get_pixel(0, 0)[0], 0);
        assert_eq!(gray.get_pixel(2, 0)[0], 255);
    }

    #[test]
    fn test_ignore_renders_black() {
        let mask = LabelMask::from_pixel(1, 1, Luma([deepseis_core::IGNORE_LABEL]));
        assert_eq!(labels_to_rgb(&mask).get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_missing_scalars_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let events = SummaryWriter::read_scalars(&dir.path().join(SCALARS_FILE)).unwrap();
        assert!(events.is_empty());
    }
}
