//! Seismic slices and their class masks, and the on-disk layout they are read from.
//!
//! ```text
//! <ROOT>/inlines/<name>.tiff        one 2D slice per file (crosslines/ for crossline runs)
//! <ROOT>/masks/<name>_mask.png      8-bit class ids, same size as the slice
//! <ROOT>/splits/<split>.txt         optional list of slice names per split
//! ```

use deepseis_core::Orientation;
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use std::path::{Path, PathBuf};

use crate::error::MlError;

/// Single-channel slice with raw amplitude values.
pub type SeismicImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Per-pixel class ids; 255 marks ignored pixels.
pub type LabelMask = GrayImage;

const IMAGE_EXTENSIONS: &[&str] = &["tiff", "tif"];
const MASK_SUFFIX: &str = "_mask.png";
const SPLITS_DIR: &str = "splits";
const MASKS_DIR: &str = "masks";

/// One 2D slice of a seismic volume paired with its label mask.
#[derive(Debug, Clone)]
pub struct VolumeSample {
    pub id: String,
    pub image: SeismicImage,
    pub mask: LabelMask,
}

impl VolumeSample {
    /// Pair an image with its mask, rejecting mismatched dimensions.
    pub fn new(id: impl Into<String>, image: SeismicImage, mask: LabelMask) -> Result<Self, MlError> {
        let id = id.into();
        if image.dimensions() != mask.dimensions() {
            return Err(MlError::ShapeMismatch {
                sample: id,
                image_width: image.width(),
                image_height: image.height(),
                mask_width: mask.width(),
                mask_height: mask.height(),
            });
        }
        Ok(Self { id, image, mask })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Read an image/mask pair from disk.
    pub fn load(pair: &SlicePair) -> Result<Self, MlError> {
        let image = read_slice(&pair.image_path)?;
        let mask = read_mask(&pair.mask_path)?;
        Self::new(pair.id.clone(), image, mask)
    }
}

/// Paths of one slice and its mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicePair {
    pub id: String,
    pub image_path: PathBuf,
    pub mask_path: PathBuf,
}

/// Decode a slice keeping raw amplitudes: 8/16-bit gray values are not rescaled.
pub fn read_slice(path: &Path) -> Result<SeismicImage, MlError> {
    let decoded = image::open(path).map_err(|source| MlError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(to_amplitudes(decoded))
}

fn to_amplitudes(decoded: DynamicImage) -> SeismicImage {
    match decoded {
        DynamicImage::ImageLuma8(img) => {
            ImageBuffer::from_fn(img.width(), img.height(), |x, y| {
                Luma([f32::from(img.get_pixel(x, y)[0])])
            })
        }
        DynamicImage::ImageLuma16(img) => {
            ImageBuffer::from_fn(img.width(), img.height(), |x, y| {
                Luma([f32::from(img.get_pixel(x, y)[0])])
            })
        }
        DynamicImage::ImageRgb32F(img) => {
            ImageBuffer::from_fn(img.width(), img.height(), |x, y| {
                Luma([img.get_pixel(x, y)[0]])
            })
        }
        DynamicImage::ImageRgba32F(img) => {
            ImageBuffer::from_fn(img.width(), img.height(), |x, y| {
                Luma([img.get_pixel(x, y)[0]])
            })
        }
        other => other.to_luma32f(),
    }
}

/// Decode a mask as 8-bit class ids.
pub fn read_mask(path: &Path) -> Result<LabelMask, MlError> {
    let decoded = image::open(path).map_err(|source| MlError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(decoded.into_luma8())
}

/// Locate every slice/mask pair for `orientation` under `root`, sorted by name.
///
/// A slice without its `<name>_mask.png` is a [`MlError::DataNotFound`].
pub fn discover_pairs(root: &Path, orientation: Orientation) -> Result<Vec<SlicePair>, MlError> {
    let image_dir = root.join(orientation.dir_name());
    let mask_dir = root.join(MASKS_DIR);
    if !image_dir.is_dir() {
        return Err(MlError::data_not_found("slice directory", image_dir));
    }
    if !mask_dir.is_dir() {
        return Err(MlError::data_not_found("mask directory", mask_dir));
    }

    let mut pairs = Vec::new();
    for entry in std::fs::read_dir(&image_dir)? {
        let path = entry?.path();
        let is_slice = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if !is_slice {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let mask_path = mask_dir.join(format!("{stem}{MASK_SUFFIX}"));
        if !mask_path.is_file() {
            return Err(MlError::data_not_found(
                format!("mask for slice '{stem}'"),
                mask_path,
            ));
        }
        pairs.push(SlicePair {
            id: stem.to_string(),
            image_path: path,
            mask_path,
        });
    }

    if pairs.is_empty() {
        return Err(MlError::data_not_found("slice images", image_dir));
    }
    pairs.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(pairs)
}

/// Select the pairs belonging to `split`.
///
/// `<root>/splits/<split>.txt` wins when present. Otherwise `train` and `val` are cut from
/// the sorted pairs, with the trailing `val_ratio` fraction going to `val`.
pub fn select_split(
    root: &Path,
    pairs: Vec<SlicePair>,
    split: &str,
    val_ratio: f64,
) -> Result<Vec<SlicePair>, MlError> {
    let split_file = root.join(SPLITS_DIR).join(format!("{split}.txt"));
    if split_file.is_file() {
        let listing = std::fs::read_to_string(&split_file)?;
        let mut selected = Vec::new();
        for name in listing
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
        {
            let pair = pairs.iter().find(|p| p.id == name).ok_or_else(|| {
                MlError::data_not_found(format!("slice '{name}' listed in split '{split}'"), &split_file)
            })?;
            selected.push(pair.clone());
        }
        return Ok(selected);
    }

    let val_count = ((pairs.len() as f64) * val_ratio.clamp(0.0, 1.0)).round() as usize;
    let val_count = val_count.min(pairs.len());
    let cut = pairs.len() - val_count;
    match split {
        "train" => Ok(pairs[..cut].to_vec()),
        "val" => Ok(pairs[cut..].to_vec()),
        other => Err(MlError::data_not_found(
            format!("split file for '{other}'"),
            split_file,
        )),
    }
}
