//! Segmentation models and the name → factory registry used to build them.

pub mod linear;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::data::{Batch, LabelMask, PatchImage};
use crate::error::MlError;

pub use linear::{LinearSegmenter, Receptive};

/// Per-class scores for every pixel, class-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassScores {
    pub num_classes: usize,
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl ClassScores {
    pub fn score(&self, class: usize, x: u32, y: u32) -> f32 {
        let plane = (self.width * self.height) as usize;
        self.data[class * plane + (y * self.width + x) as usize]
    }

    /// Highest-scoring class per pixel; ties go to the lower class id.
    pub fn argmax(&self) -> LabelMask {
        LabelMask::from_fn(self.width, self.height, |x, y| {
            let mut best = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for c in 0..self.num_classes {
                let s = self.score(c, x, y);
                if s > best_score {
                    best = c;
                    best_score = s;
                }
            }
            image::Luma([best as u8])
        })
    }
}

/// Hyperparameters for one SGD step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdStep {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

/// Serializable parameter snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub model: String,
    pub num_classes: usize,
    pub in_channels: usize,
    pub parameters: Vec<f32>,
}

/// A per-pixel classifier trained by the loop driver.
pub trait SegmentationModel: Send + Sync {
    fn name(&self) -> &str;

    fn num_classes(&self) -> usize;

    fn in_channels(&self) -> usize;

    fn forward(&self, image: &PatchImage) -> Result<ClassScores, MlError>;

    fn predict(&self, image: &PatchImage) -> Result<LabelMask, MlError> {
        Ok(self.forward(image)?.argmax())
    }

    /// Mean weighted cross-entropy over non-ignored pixels, without updating parameters.
    fn loss(&self, batch: &Batch) -> Result<f64, MlError>;

    /// One optimizer step on `batch`; returns the loss before the update.
    fn train_step(&mut self, batch: &Batch, step: &SgdStep) -> Result<f64, MlError>;

    fn state(&self) -> ModelState;

    fn load_state(&mut self, state: &ModelState) -> Result<(), MlError>;
}

/// Construction parameters shared by all factories.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub num_classes: usize,
    pub in_channels: usize,
    pub class_weights: Option<Vec<f64>>,
    pub seed: u64,
}

pub type ModelFactory = fn(&ModelSpec) -> Result<Box<dyn SegmentationModel>, MlError>;

/// Maps `MODEL.NAME` to a factory. Unknown names fail at startup.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    factories: BTreeMap<String, ModelFactory>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in models.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("pixel_linear", build_pixel_linear);
        registry.register("patch_linear", build_patch_linear);
        registry
    }

    /// Register a factory, replacing any previous one with the same name.
    pub fn register(&mut self, name: &str, factory: ModelFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(
        &self,
        name: &str,
        spec: &ModelSpec,
    ) -> Result<Box<dyn SegmentationModel>, MlError> {
        let factory = self.factories.get(name).ok_or_else(|| {
            MlError::model(format!(
                "unknown model '{name}' (available: {})",
                self.names().join(", ")
            ))
        })?;
        factory(spec)
    }
}

fn build_pixel_linear(spec: &ModelSpec) -> Result<Box<dyn SegmentationModel>, MlError> {
    let model = LinearSegmenter::new("pixel_linear", Receptive::Pixel, spec)?;
    Ok(Box::new(model))
}

fn build_patch_linear(spec: &ModelSpec) -> Result<Box<dyn SegmentationModel>, MlError> {
    let model = LinearSegmenter::new("patch_linear", Receptive::Neighborhood3x3, spec)?;
    Ok(Box::new(model))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ModelSpec {
        ModelSpec {
            num_classes: 3,
            in_channels: 1,
            class_weights: None,
            seed: 5,
        }
    }

    #[test]
    fn test_builtin_names() {
        let registry = ModelRegistry::builtin();
        assert_eq!(registry.names(), vec!["patch_linear", "pixel_linear"]);
        let model = registry.create("pixel_linear", &spec()).unwrap();
        assert_eq!(model.name(), "pixel_linear");
        assert_eq!(model.num_classes(), 3);
    }

    #[test]
    fn test_unknown_model_lists_available() {
        let err = ModelRegistry::builtin()
            .create("seg_hrnet", &spec())
            .err()
            .unwrap();
        let msg = err.to_string();
        assert!(msg.contains("seg_hrnet"));
        assert!(msg.contains("patch_linear"));
    }

    #[test]
    fn test_argmax_ties_prefer_lower_class() {
        let scores = ClassScores {
            num_classes: 2,
            width: 2,
            height: 1,
            data: vec![1.0, 0.0, 1.0, 3.0],
        };
        let mask = scores.argmax();
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
        assert_eq!(mask.get_pixel(1, 0)[0], 1);
    }
}
