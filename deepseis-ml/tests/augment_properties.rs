//! Property-based tests for the augmentation transforms.

use deepseis_core::IGNORE_LABEL;
use deepseis_ml::augment::transforms::{denormalize, flip_horizontal, normalize};
use deepseis_ml::data::{LabelMask, SeismicImage};
use deepseis_ml::{AugmentationPipeline, Transform};
use image::Luma;
use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

fn image_from(w: u32, values: &[f32]) -> SeismicImage {
    let h = values.len() as u32 / w;
    SeismicImage::from_fn(w, h, |x, y| Luma([values[(y * w + x) as usize]]))
}

fn mask_from(w: u32, values: &[u8]) -> LabelMask {
    let h = values.len() as u32 / w;
    LabelMask::from_fn(w, h, |x, y| Luma([values[(y * w + x) as usize]]))
}

proptest! {
    #[test]
    fn normalize_then_denormalize_round_trips(
        values in prop::collection::vec(-5000.0f32..5000.0, 1..64),
        mean in -100.0f32..100.0,
        std in 0.01f32..500.0,
    ) {
        let original = image_from(1, &values);
        let mut image = original.clone();
        normalize(&mut image, mean, std);
        denormalize(&mut image, mean, std);
        for (a, b) in original.pixels().zip(image.pixels()) {
            let tolerance = 1e-3 * a[0].abs().max(1.0);
            prop_assert!((a[0] - b[0]).abs() <= tolerance, "{} vs {}", a[0], b[0]);
        }
    }

    #[test]
    fn double_flip_is_identity(
        w in 1u32..12,
        h in 1u32..12,
        seed in any::<u64>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let values: Vec<f32> = (0..w * h).map(|_| rand::Rng::gen_range(&mut rng, -1.0f32..1.0)).collect();
        let labels: Vec<u8> = (0..w * h).map(|i| (i % 7) as u8).collect();
        let image = image_from(w, &values);
        let mask = mask_from(w, &labels);

        let (mut flipped, mut flipped_mask) = (image.clone(), mask.clone());
        flip_horizontal(&mut flipped, &mut flipped_mask);
        flip_horizontal(&mut flipped, &mut flipped_mask);
        prop_assert_eq!(flipped, image);
        prop_assert_eq!(flipped_mask, mask);
    }

    #[test]
    fn image_and_mask_flip_together(
        w in 2u32..10,
        h in 1u32..10,
        seed in any::<u64>(),
    ) {
        // label encodes the column, so image and mask must agree after any flip
        let image = SeismicImage::from_fn(w, h, |x, _| Luma([x as f32]));
        let mask = LabelMask::from_fn(w, h, |x, _| Luma([x as u8]));
        let pipeline = AugmentationPipeline::new(vec![Transform::HorizontalFlip { probability: 0.5 }]).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let (image, mask) = pipeline.apply(image, mask, &mut rng).unwrap();
        for (p, m) in image.pixels().zip(mask.pixels()) {
            prop_assert_eq!(p[0] as u8, m[0]);
        }
    }

    #[test]
    fn full_pipeline_output_has_pad_size(
        w in 1u32..40,
        h in 1u32..40,
        seed in any::<u64>(),
    ) {
        let pipeline = AugmentationPipeline::new(vec![
            Transform::Normalize { mean: 0.0, std: 2.0 },
            Transform::PadIfNeeded { min_height: 8, min_width: 8 },
            Transform::Resize { height: 12, width: 12 },
            Transform::PadIfNeeded { min_height: 16, min_width: 16 },
            Transform::HorizontalFlip { probability: 0.5 },
        ])
        .unwrap();
        let image = SeismicImage::from_pixel(w, h, Luma([1.0]));
        let mask = LabelMask::from_pixel(w, h, Luma([1]));
        let mut rng = StdRng::seed_from_u64(seed);
        let (image, mask) = pipeline.apply(image, mask, &mut rng).unwrap();
        prop_assert_eq!(image.dimensions(), (16, 16));
        prop_assert_eq!(mask.dimensions(), (16, 16));
        // the outer pad ring is ignore-labelled
        prop_assert_eq!(mask.get_pixel(0, 0)[0], IGNORE_LABEL);
        prop_assert_eq!(image.get_pixel(0, 0)[0], 0.0);
    }
}

#[test]
fn pad_before_normalize_is_rejected() {
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
