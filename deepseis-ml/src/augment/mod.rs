//! Augmentation pipeline: an ordered list of image/mask transforms.
//!
//! The standard composition is normalize → pad to patch size → resize → pad to network
//! input size, followed by a random horizontal flip for training. Padding after the resize
//! absorbs sizes the network cannot divide evenly.

pub mod transforms;

use deepseis_core::config::TrainConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::data::{LabelMask, SeismicImage};
use crate::error::MlError;

/// A single pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    Normalize { mean: f32, std: f32 },
    PadIfNeeded { min_height: u32, min_width: u32 },
    Resize { height: u32, width: u32 },
    HorizontalFlip { probability: f64 },
}

impl Transform {
    fn is_random(&self) -> bool {
        matches!(self, Self::HorizontalFlip { .. })
    }
}

/// Immutable, validated sequence of transforms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AugmentationPipeline {
    steps: Vec<Transform>,
}

impl AugmentationPipeline {
    /// Validate ordering and parameters, then freeze the steps.
    ///
    /// Normalize must come before the first pad, and every resize must be followed by a pad.
    pub fn new(steps: Vec<Transform>) -> Result<Self, MlError> {
        let first_pad = steps
            .iter()
            .position(|s| matches!(s, Transform::PadIfNeeded { .. }));
        let normalize = steps
            .iter()
            .position(|s| matches!(s, Transform::Normalize { .. }));
        if let (Some(pad), Some(norm)) = (first_pad, normalize) {
            if norm > pad {
                return Err(MlError::transform(
                    "normalize must precede the first pad-if-needed",
                ));
            }
        }

        for (i, step) in steps.iter().enumerate() {
            match step {
                Transform::Normalize { std, .. } if !(*std > 0.0 && std.is_finite()) => {
                    return Err(MlError::transform(format!(
                        "normalize std must be positive, got {std}"
                    )));
                }
                Transform::Resize { height, width } => {
                    if *height == 0 || *width == 0 {
                        return Err(MlError::transform("resize target must be non-empty"));
                    }
                    let padded_after = steps[i + 1..]
                        .iter()
                        .any(|s| matches!(s, Transform::PadIfNeeded { .. }));
                    if !padded_after {
                        return Err(MlError::transform("resize must be followed by pad-if-needed"));
                    }
                }
                Transform::HorizontalFlip { probability } if !(0.0..=1.0).contains(probability) => {
                    return Err(MlError::transform(format!(
                        "flip probability must be in [0, 1], got {probability}"
                    )));
                }
                _ => {}
            }
        }
        Ok(Self { steps })
    }

    /// Build the train (`training = true`) or validation pipeline from config.
    ///
    /// The two differ only in the randomized flip, which training includes when
    /// `TRAIN.AUGMENTATION` is set.
    pub fn from_config(train: &TrainConfig, training: bool) -> Result<Self, MlError> {
        let aug = &train.augmentations;
        let mut steps = vec![
            Transform::Normalize {
                mean: train.mean as f32,
                std: train.std as f32,
            },
            Transform::PadIfNeeded {
                min_height: train.patch_size,
                min_width: train.patch_size,
            },
            Transform::Resize {
                height: aug.resize.height,
                width: aug.resize.width,
            },
            Transform::PadIfNeeded {
                min_height: aug.pad.height,
                min_width: aug.pad.width,
            },
        ];
        if training && train.augmentation {
            steps.push(Transform::HorizontalFlip {
                probability: train.flip_probability,
            });
        }
        Self::new(steps)
    }

    pub fn steps(&self) -> &[Transform] {
        &self.steps
    }

    pub fn is_deterministic(&self) -> bool {
        !self.steps.iter().any(Transform::is_random)
    }

    /// The normalization parameters, if the pipeline normalizes.
    pub fn normalization(&self) -> Option<(f32, f32)> {
        self.steps.iter().find_map(|s| match s {
            Transform::Normalize { mean, std } => Some((*mean, *std)),
            _ => None,
        })
    }

    /// Apply every step in order. The flip decision is drawn once per call and applied to
    /// image and mask together.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        mut image: SeismicImage,
        mut mask: LabelMask,
        rng: &mut R,
    ) -> Result<(SeismicImage, LabelMask), MlError> {
        if image.dimensions() != mask.dimensions() {
            return Err(MlError::transform(format!(
                "image {:?} and mask {:?} differ before augmentation",
                image.dimensions(),
                mask.dimensions()
            )));
        }

        for step in &self.steps {
            match step {
                Transform::Normalize { mean, std } => {
                    transforms::normalize(&mut image, *mean, *std);
                }
                Transform::PadIfNeeded {
                    min_height,
                    min_width,
                } => {
                    (image, mask) = transforms::pad_if_needed(image, mask, *min_height, *min_width);
                }
                Transform::Resize { height, width } => {
                    image = transforms::resize_bilinear(&image, *width, *height);
                    mask = transforms::resize_nearest(&mask, *width, *height);
                }
                Transform::HorizontalFlip { probability } => {
                    if rng.gen_bool(*probability) {
                        transforms::flip_horizontal(&mut image, &mut mask);
                    }
                }
            }
        }
        Ok((image, mask))
    }

    /// One-line description for logs.
    pub fn describe(&self) -> String {
        if self.steps.is_empty() {
            return "identity".to_string();
        }
        self.steps
            .iter()
            .map(|s| match s {
                Transform::Normalize { mean, std } => format!("normalize(mean={mean}, std={std})"),
                Transform::PadIfNeeded {
                    min_height,
                    min_width,
                } => format!("pad({min_height}x{min_width})"),
                Transform::Resize { height, width } => format!("resize({height}x{width})"),
                Transform::HorizontalFlip { probability } => format!("hflip(p={probability:.2})"),
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn sample(w: u32, h: u32) -> (SeismicImage, LabelMask) {
        let img = ImageBuffer::from_fn(w, h, |x, y| Luma([(x * 3 + y) as f32]));
        let mask = ImageBuffer::from_fn(w, h, |x, _| Luma([(x % 2) as u8]));
        (img, mask)
    }

    fn standard(flip: Option<f64>) -> Vec<Transform> {
        let mut steps = vec![
            Transform::Normalize {
                mean: 1.0,
                std: 2.0,
            },
            Transform::PadIfNeeded {
                min_height: 6,
                min_width: 6,
            },
            Transform::Resize {
                height: 5,
                width: 5,
            },
            Transform::PadIfNeeded {
                min_height: 8,
                min_width: 8,
            },
        ];
        if let Some(p) = flip {
            steps.push(Transform::HorizontalFlip { probability: p });
        }
        steps
    }

    #[test]
    fn test_rejects_pad_before_normalize() {
        let err = AugmentationPipeline::new(vec![
            Transform::PadIfNeeded {
                min_height: 4,
                min_width: 4,
            },
            Transform::Normalize {
                mean: 0.0,
                std: 1.0,
            },
        ])
        .unwrap_err();
        assert!(err.to_string().contains("normalize"));
    }

    #[test]
    fn test_rejects_trailing_resize() {
        let err = AugmentationPipeline::new(vec![Transform::Resize {
            height: 4,
            width: 4,
        }])
        .unwrap_err();
        assert!(err.to_string().contains("resize"));
    }

    #[test]
    fn test_standard_pipeline_output_shape() {
        let pipeline = AugmentationPipeline::new(standard(None)).unwrap();
        let (img, mask) = sample(4, 4);
        let mut rng = StdRng::seed_from_u64(1);
        let (img, mask) = pipeline.apply(img, mask, &mut rng).unwrap();
        assert_eq!(img.dimensions(), (8, 8));
        assert_eq!(mask.dimensions(), (8, 8));
        // outer padding ring is ignored
        assert_eq!(mask.get_pixel(0, 0)[0], 255);
        assert!(pipeline.is_deterministic());
    }

    #[test]
    fn test_flip_always_applied_to_both() {
        let pipeline = AugmentationPipeline::new(vec![Transform::HorizontalFlip {
            probability: 1.0,
        }])
        .unwrap();
        let (img, mask) = sample(3, 2);
        let mut rng = StdRng::seed_from_u64(7);
        let (flipped, flipped_mask) = pipeline.apply(img.clone(), mask.clone(), &mut rng).unwrap();
        assert_eq!(flipped.get_pixel(0, 0)[0], img.get_pixel(2, 0)[0]);
        assert_eq!(flipped_mask.get_pixel(0, 0)[0], mask.get_pixel(2, 0)[0]);

        let (back, back_mask) = pipeline.apply(flipped, flipped_mask, &mut rng).unwrap();
        assert_eq!(back, img);
        assert_eq!(back_mask, mask);
    }

    #[test]
    fn test_same_seed_same_output() {
        let pipeline = AugmentationPipeline::new(standard(Some(0.5))).unwrap();
        for seed in 0..8 {
            let (img, mask) = sample(4, 3);
            let a = pipeline
                .apply(img.clone(), mask.clone(), &mut StdRng::seed_from_u64(seed))
                .unwrap();
            let b = pipeline
                .apply(img, mask, &mut StdRng::seed_from_u64(seed))
                .unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_describe() {
        let pipeline = AugmentationPipeline::new(standard(Some(0.5))).unwrap();
        assert_eq!(
            pipeline.describe(),
            "normalize(mean=1, std=2) -> pad(6x6) -> resize(5x5) -> pad(8x8) -> hflip(p=0.50)"
        );
        assert_eq!(AugmentationPipeline::default().describe(), "identity");
    }
}
