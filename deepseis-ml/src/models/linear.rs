//! Linear softmax classifiers over per-pixel features.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{ClassScores, ModelSpec, ModelState, SegmentationModel, SgdStep};
use crate::data::{Batch, PatchImage, PatchSample};
use crate::error::MlError;
use deepseis_core::IGNORE_LABEL;

/// Which pixels feed a pixel's features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receptive {
    /// Channel values at the pixel itself.
    Pixel,
    /// Channel values over the 3x3 neighbourhood, edges clamped.
    Neighborhood3x3,
}

impl Receptive {
    fn taps(self) -> usize {
        match self {
            Self::Pixel => 1,
            Self::Neighborhood3x3 => 9,
        }
    }
}

/// Softmax regression from pixel features to class scores.
#[derive(Debug, Clone)]
pub struct LinearSegmenter {
    name: String,
    receptive: Receptive,
    num_classes: usize,
    in_channels: usize,
    /// `num_classes` rows of `feature_dim + 1` (bias last).
    weights: Vec<f32>,
    velocity: Vec<f32>,
    class_weights: Vec<f64>,
}

impl LinearSegmenter {
    pub fn new(name: &str, receptive: Receptive, spec: &ModelSpec) -> Result<Self, MlError> {
        if spec.num_classes == 0 || spec.in_channels == 0 {
            return Err(MlError::model("classes and channels must be positive"));
        }
        let class_weights = match &spec.class_weights {
            Some(w) if w.len() != spec.num_classes => {
                return Err(MlError::model(format!(
                    "{} class weights for {} classes",
                    w.len(),
                    spec.num_classes
                )));
            }
            Some(w) => w.clone(),
            None => vec![1.0; spec.num_classes],
        };

        let row = spec.in_channels * receptive.taps() + 1;
        let mut rng = StdRng::seed_from_u64(spec.seed);
        let weights = (0..spec.num_classes * row)
            .map(|_| rng.gen_range(-0.01f32..0.01))
            .collect::<Vec<_>>();
        Ok(Self {
            name: name.to_string(),
            receptive,
            num_classes: spec.num_classes,
            in_channels: spec.in_channels,
            velocity: vec![0.0; weights.len()],
            weights,
            class_weights,
        })
    }

    fn row_len(&self) -> usize {
        self.in_channels * self.receptive.taps() + 1
    }

    fn check_input(&self, image: &PatchImage) -> Result<(), MlError> {
        if image.num_channels() != self.in_channels {
            return Err(MlError::model(format!(
                "{} expects {} channels, got {}",
                self.name,
                self.in_channels,
                image.num_channels()
            )));
        }
        Ok(())
    }

    fn features(&self, image: &PatchImage, x: u32, y: u32, out: &mut [f32]) {
        let mut k = 0;
        match self.receptive {
            Receptive::Pixel => {
                for c in 0..self.in_channels {
                    out[k] = image.value(c, x, y);
                    k += 1;
                }
            }
            Receptive::Neighborhood3x3 => {
                let (w, h) = (image.width() as i64, image.height() as i64);
                for c in 0..self.in_channels {
                    for dy in -1i64..=1 {
                        for dx in -1i64..=1 {
                            let sx = (i64::from(x) + dx).clamp(0, w - 1) as u32;
                            let sy = (i64::from(y) + dy).clamp(0, h - 1) as u32;
                            out[k] = image.value(c, sx, sy);
                            k += 1;
                        }
                    }
                }
            }
        }
        out[k] = 1.0;
    }

    fn softmax(&self, features: &[f32], probs: &mut [f64]) {
        let row = self.row_len();
        let mut max = f64::NEG_INFINITY;
        for (c, p) in probs.iter_mut().enumerate() {
            let w = &self.weights[c * row..(c + 1) * row];
            let z: f32 = w.iter().zip(features).map(|(a, b)| a * b).sum();
            *p = f64::from(z);
            max = max.max(*p);
        }
        let mut total = 0.0;
        for p in probs.iter_mut() {
            *p = (*p - max).exp();
            total += *p;
        }
        for p in probs.iter_mut() {
            *p /= total;
        }
    }

    /// Weighted cross-entropy over a batch. With `grad`, accumulates the gradient of the
    /// summed loss. Returns `(weighted loss sum, weight sum)`.
    fn accumulate(&self, batch: &Batch, mut grad: Option<&mut [f64]>) -> Result<(f64, f64), MlError> {
        let row = self.row_len();
        let mut features = vec![0.0f32; row];
        let mut probs = vec![0.0f64; self.num_classes];
        let mut loss_sum = 0.0;
        let mut weight_sum = 0.0;

        for sample in &batch.samples {
            self.check_sample(sample)?;
            for (x, y, label) in sample.mask.enumerate_pixels() {
                let label = label[0];
                if label == IGNORE_LABEL {
                    continue;
                }
                let label = usize::from(label);
                if label >= self.num_classes {
                    return Err(MlError::model(format!(
                        "label {label} in {} outside {} classes",
                        sample.sample_id, self.num_classes
                    )));
                }
                let weight = self.class_weights[label];
                if weight == 0.0 {
                    continue;
                }
                self.features(&sample.image, x, y, &mut features);
                self.softmax(&features, &mut probs);
                loss_sum += weight * -probs[label].max(1e-12).ln();
                weight_sum += weight;

                if let Some(grad) = grad.as_deref_mut() {
                    for (c, p) in probs.iter().enumerate() {
                        let target = if c == label { 1.0 } else { 0.0 };
                        let delta = weight * (p - target);
                        let g = &mut grad[c * row..(c + 1) * row];
                        for (gj, fj) in g.iter_mut().zip(&features) {
                            *gj += delta * f64::from(*fj);
                        }
                    }
                }
            }
        }
        Ok((loss_sum, weight_sum))
    }

    fn check_sample(&self, sample: &PatchSample) -> Result<(), MlError> {
        self.check_input(&sample.image)?;
        if (sample.image.width(), sample.image.height()) != sample.mask.dimensions() {
            return Err(MlError::ShapeMismatch {
                sample: sample.sample_id.clone(),
                image_width: sample.image.width(),
                image_height: sample.image.height(),
                mask_width: sample.mask.width(),
                mask_height: sample.mask.height(),
            });
        }
        Ok(())
    }
}

impl SegmentationModel for LinearSegmenter {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn forward(&self, image: &PatchImage) -> Result<ClassScores, MlError> {
        self.check_input(image)?;
        let (w, h) = (image.width(), image.height());
        let plane = (w * h) as usize;
        let mut data = vec![0.0f32; self.num_classes * plane];
        let mut features = vec![0.0f32; self.row_len()];
        let mut probs = vec![0.0f64; self.num_classes];
        for y in 0..h {
            for x in 0..w {
                self.features(image, x, y, &mut features);
                self.softmax(&features, &mut probs);
                let offset = (y * w + x) as usize;
                for (c, p) in probs.iter().enumerate() {
                    data[c * plane + offset] = *p as f32;
                }
            }
        }
        Ok(ClassScores {
            num_classes: self.num_classes,
            width: w,
            height: h,
            data,
        })
    }

    fn loss(&self, batch: &Batch) -> Result<f64, MlError> {
        let (sum, weight) = self.accumulate(batch, None)?;
        Ok(if weight > 0.0 { sum / weight } else { 0.0 })
    }

    fn train_step(&mut self, batch: &Batch, step: &SgdStep) -> Result<f64, MlError> {
        let mut grad = vec![0.0f64; self.weights.len()];
        let (sum, weight) = self.accumulate(batch, Some(&mut grad))?;
        if weight == 0.0 {
            // nothing but ignored pixels
            return Ok(0.0);
        }

        for ((w, v), g) in self.weights.iter_mut().zip(&mut self.velocity).zip(&grad) {
            let g = g / weight + step.weight_decay * f64::from(*w);
            let nv = step.momentum * f64::from(*v) + g;
            *v = nv as f32;
            *w -= (step.learning_rate * nv) as f32;
        }
        Ok(sum / weight)
    }

    fn state(&self) -> ModelState {
        ModelState {
            model: self.name.clone(),
            num_classes: self.num_classes,
            in_channels: self.in_channels,
            parameters: self.weights.clone(),
        }
    }

    fn load_state(&mut self, state: &ModelState) -> Result<(), MlError> {
        if state.model != self.name
            || state.num_classes != self.num_classes
            || state.in_channels != self.in_channels
            || state.parameters.len() != self.weights.len()
        {
            return Err(MlError::model(format!(
                "checkpoint for {} ({} classes, {} channels) does not fit {} ({} classes, {} channels)",
                state.model,
                state.num_classes,
                state.in_channels,
                self.name,
                self.num_classes,
                self.in_channels
            )));
        }
        self.weights.clone_from(&state.parameters);
        self.velocity.iter_mut().for_each(|v| *v = 0.0);
        Ok(())
    }
}
