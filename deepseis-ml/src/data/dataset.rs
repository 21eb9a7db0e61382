//! Patch dataset over a split of seismic slices.

use deepseis_core::{DepthMode, ExperimentConfig};
use image::{ImageBuffer, Luma, imageops};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::Path;

use crate::augment::AugmentationPipeline;
use crate::data::patch::{BoundaryPolicy, PatchLocation, enumerate_patches};
use crate::data::volume::{LabelMask, SeismicImage, VolumeSample, discover_pairs, select_split};
use crate::error::MlError;

/// Patch sampling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOptions {
    pub patch_size: u32,
    pub stride: u32,
    pub channels: usize,
    pub depth: DepthMode,
    pub boundary: BoundaryPolicy,
}

impl PatchOptions {
    /// Options for the training (`training = true`) or validation split.
    pub fn from_config(config: &ExperimentConfig, training: bool) -> Self {
        let complete_only = if training {
            config.train.complete_patches_only
        } else {
            config.validation.complete_patches_only
        };
        Self {
            patch_size: config.train.patch_size,
            stride: config.train.stride,
            channels: config.model.in_channels,
            depth: config.train.depth,
            boundary: BoundaryPolicy::from_complete_patches_only(complete_only),
        }
    }

    fn validate(&self) -> Result<(), MlError> {
        if self.patch_size == 0 || self.stride == 0 {
            return Err(MlError::invalid_input("patch size and stride must be positive"));
        }
        if self.channels == 0 {
            return Err(MlError::invalid_input("channel count must be positive"));
        }
        if self.depth != DepthMode::No && self.channels != 3 {
            return Err(MlError::invalid_input(format!(
                "depth mode {:?} produces 3 channels but {} were requested",
                self.depth, self.channels
            )));
        }
        Ok(())
    }
}

/// Multi-channel patch image; every channel has the same dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchImage {
    pub channels: Vec<SeismicImage>,
}

impl PatchImage {
    pub fn width(&self) -> u32 {
        self.channels.first().map_or(0, |c| c.width())
    }

    pub fn height(&self) -> u32 {
        self.channels.first().map_or(0, |c| c.height())
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Value of channel `c` at `(x, y)`.
    pub fn value(&self, c: usize, x: u32, y: u32) -> f32 {
        self.channels[c].get_pixel(x, y)[0]
    }
}

/// One dataset item.
#[derive(Debug, Clone)]
pub struct PatchSample {
    pub image: PatchImage,
    pub mask: LabelMask,
    pub sample_id: String,
    pub location: PatchLocation,
}

#[derive(Debug, Clone, Copy)]
struct PatchRef {
    sample: usize,
    location: PatchLocation,
}

/// Fixed-size patches cut from a set of slices, augmented on retrieval.
#[derive(Debug, Clone)]
pub struct PatchDataset {
    samples: Vec<VolumeSample>,
    index: Vec<PatchRef>,
    options: PatchOptions,
    transform: AugmentationPipeline,
    seed: u64,
}

impl PatchDataset {
    /// Load `split` from the dataset layout under `root`.
    pub fn open(
        root: &Path,
        split: &str,
        config: &ExperimentConfig,
        options: PatchOptions,
        transform: AugmentationPipeline,
        seed: u64,
    ) -> Result<Self, MlError> {
        let pairs = discover_pairs(root, config.dataset.orientation)?;
        let pairs = select_split(root, pairs, split, config.dataset.val_ratio)?;
        let samples = pairs
            .iter()
            .map(VolumeSample::load)
            .collect::<Result<Vec<_>, _>>()?;
        let dataset = Self::from_samples(samples, options, transform, seed)?;
        tracing::info!(
            split,
            slices = dataset.num_slices(),
            patches = dataset.len(),
            pipeline = %dataset.transform.describe(),
            "Loaded patch dataset"
        );
        Ok(dataset)
    }

    /// Build from slices already in memory.
    pub fn from_samples(
        samples: Vec<VolumeSample>,
        options: PatchOptions,
        transform: AugmentationPipeline,
        seed: u64,
    ) -> Result<Self, MlError> {
        options.validate()?;
        let mut index = Vec::new();
        for (i, sample) in samples.iter().enumerate() {
            if sample.image.dimensions() != sample.mask.dimensions() {
                return Err(MlError::ShapeMismatch {
                    sample: sample.id.clone(),
                    image_width: sample.width(),
                    image_height: sample.height(),
                    mask_width: sample.mask.width(),
                    mask_height: sample.mask.height(),
                });
            }
            let locations = enumerate_patches(
                sample.height(),
                sample.width(),
                options.patch_size,
                options.stride,
                options.boundary,
            );
            if locations.is_empty() {
                tracing::debug!(sample = %sample.id, "Slice smaller than patch, no patches");
            }
            index.extend(locations.into_iter().map(|location| PatchRef {
                sample: i,
                location,
            }));
        }
        Ok(Self {
            samples,
            index,
            options,
            transform,
            seed,
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn num_slices(&self) -> usize {
        self.samples.len()
    }

    pub fn options(&self) -> &PatchOptions {
        &self.options
    }

    pub fn transform(&self) -> &AugmentationPipeline {
        &self.transform
    }

    /// `(sample_id, location)` of patch `idx` without cropping.
    pub fn locate(&self, idx: usize) -> Option<(&str, PatchLocation)> {
        self.index
            .get(idx)
            .map(|r| (self.samples[r.sample].id.as_str(), r.location))
    }

    /// Un-augmented crop of patch `idx`. Windows are clipped to the slice.
    pub fn raw_patch(&self, idx: usize) -> Result<(SeismicImage, LabelMask), MlError> {
        let r = self.patch_ref(idx)?;
        let sample = &self.samples[r.sample];
        let (x, y) = (r.location.col, r.location.row);
        let w = self.options.patch_size.min(sample.width() - x);
        let h = self.options.patch_size.min(sample.height() - y);
        let image = imageops::crop_imm(&sample.image, x, y, w, h).to_image();
        let mask = imageops::crop_imm(&sample.mask, x, y, w, h).to_image();
        Ok((image, mask))
    }

    /// Augmented patch `idx` for `epoch`. Randomness depends only on seed, epoch and index.
    pub fn get(&self, idx: usize, epoch: usize) -> Result<PatchSample, MlError> {
        let r = self.patch_ref(idx)?;
        let sample = &self.samples[r.sample];
        let (raw_image, raw_mask) = self.raw_patch(idx)?;
        let crop_height = raw_image.height();

        let mut rng = StdRng::seed_from_u64(item_seed(self.seed, epoch, idx));
        let (image, mask) = self
            .transform
            .apply(raw_image, raw_mask, &mut rng)
            .map_err(|e| MlError::transform(format!("{} @ {:?}: {e}", sample.id, r.location)))?;

        let depth = DepthRamp {
            mode: self.options.depth,
            top: r.location.row,
            crop_height,
            slice_height: sample.height(),
        };
        let image = expand_channels(image, self.options.channels, depth);
        Ok(PatchSample {
            image,
            mask,
            sample_id: sample.id.clone(),
            location: r.location,
        })
    }

    fn patch_ref(&self, idx: usize) -> Result<PatchRef, MlError> {
        self.index.get(idx).copied().ok_or_else(|| {
            MlError::invalid_input(format!("patch index {idx} out of range ({})", self.len()))
        })
    }
}

/// Mix run seed, epoch and item index into one RNG seed.
fn item_seed(seed: u64, epoch: usize, idx: usize) -> u64 {
    let mut z = seed
        ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (idx as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    // splitmix64 finalizer
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[derive(Debug, Clone, Copy)]
struct DepthRamp {
    mode: DepthMode,
    top: u32,
    crop_height: u32,
    slice_height: u32,
}

impl DepthRamp {
    /// Depth in `[0, 1]` of output row `y` out of `out_height` rows.
    fn at(&self, y: u32, out_height: u32) -> f32 {
        let out_height = out_height.max(1) as f32;
        match self.mode {
            DepthMode::No => 0.0,
            DepthMode::Patch => y as f32 / (out_height - 1.0).max(1.0),
            DepthMode::Voxel => {
                let source_row = self.top as f32 + y as f32 * self.crop_height as f32 / out_height;
                source_row / (self.slice_height.max(2) - 1) as f32
            }
        }
    }
}

fn expand_channels(image: SeismicImage, channels: usize, depth: DepthRamp) -> PatchImage {
    match depth.mode {
        DepthMode::No => PatchImage {
            channels: vec![image; channels],
        },
        DepthMode::Patch | DepthMode::Voxel => {
            let (w, h) = image.dimensions();
            let ramp: SeismicImage = ImageBuffer::from_fn(w, h, |_, y| Luma([depth.at(y, h)]));
            let product: SeismicImage = ImageBuffer::from_fn(w, h, |x, y| {
                Luma([image.get_pixel(x, y)[0] * ramp.get_pixel(x, y)[0]])
            });
            PatchImage {
                channels: vec![image, ramp, product],
            }
        }
    }
}
