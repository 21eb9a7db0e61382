//! Individual image/mask transforms.
//!
//! Amplitudes are resampled here rather than through `image::imageops::resize`, which
//! clamps float pixels to `[0, 1]` and would destroy normalized values. Masks are `u8` and go
//! through `imageops` directly.

use image::imageops::FilterType;
use image::{ImageBuffer, Luma, imageops};

use crate::data::{LabelMask, SeismicImage};
use deepseis_core::IGNORE_LABEL;

/// `(pixel - mean) / std` over every pixel.
pub fn normalize(image: &mut SeismicImage, mean: f32, std: f32) {
    for p in image.pixels_mut() {
        p[0] = (p[0] - mean) / std;
    }
}

/// Inverse of [`normalize`].
pub fn denormalize(image: &mut SeismicImage, mean: f32, std: f32) {
    for p in image.pixels_mut() {
        p[0] = p[0] * std + mean;
    }
}

/// Centered padding amounts `(before, after)` to grow `current` to at least `target`.
pub fn pad_amounts(current: u32, target: u32) -> (u32, u32) {
    if current >= target {
        return (0, 0);
    }
    let total = target - current;
    let before = total / 2;
    (before, total - before)
}

/// Pad the image with 0 and the mask with the ignore label when either side is short.
pub fn pad_if_needed(
    image: SeismicImage,
    mask: LabelMask,
    min_height: u32,
    min_width: u32,
) -> (SeismicImage, LabelMask) {
    let (width, height) = image.dimensions();
    let (top, bottom) = pad_amounts(height, min_height);
    let (left, right) = pad_amounts(width, min_width);
    if top + bottom + left + right == 0 {
        return (image, mask);
    }

    let new_w = width + left + right;
    let new_h = height + top + bottom;
    let mut padded_image: SeismicImage = ImageBuffer::from_pixel(new_w, new_h, Luma([0.0]));
    let mut padded_mask: LabelMask = ImageBuffer::from_pixel(new_w, new_h, Luma([IGNORE_LABEL]));
    imageops::replace(&mut padded_image, &image, i64::from(left), i64::from(top));
    imageops::replace(&mut padded_mask, &mask, i64::from(left), i64::from(top));
    (padded_image, padded_mask)
}

/// Map an output coordinate to a source coordinate with pixel-center alignment.
fn source_coord(dst: u32, scale: f32) -> f32 {
    (dst as f32 + 0.5) * scale - 0.5
}

/// Bilinear resize of an amplitude image.
pub fn resize_bilinear(image: &SeismicImage, width: u32, height: u32) -> SeismicImage {
    let (src_w, src_h) = image.dimensions();
    if (src_w, src_h) == (width, height) {
        return image.clone();
    }
    if src_w == 0 || src_h == 0 {
        return ImageBuffer::new(width, height);
    }
    let scale_x = src_w as f32 / width as f32;
    let scale_y = src_h as f32 / height as f32;
    let max_x = (src_w - 1) as f32;
    let max_y = (src_h - 1) as f32;

    ImageBuffer::from_fn(width, height, |x, y| {
        let sx = source_coord(x, scale_x).clamp(0.0, max_x);
        let sy = source_coord(y, scale_y).clamp(0.0, max_y);
        let x0 = sx.floor() as u32;
        let y0 = sy.floor() as u32;
        let x1 = (x0 + 1).min(src_w - 1);
        let y1 = (y0 + 1).min(src_h - 1);
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let p00 = image.get_pixel(x0, y0)[0];
        let p10 = image.get_pixel(x1, y0)[0];
        let p01 = image.get_pixel(x0, y1)[0];
        let p11 = image.get_pixel(x1, y1)[0];
        let top = p00 + (p10 - p00) * fx;
        let bottom = p01 + (p11 - p01) * fx;
        Luma([top + (bottom - top) * fy])
    })
}

/// Nearest-neighbour resize; never invents class ids.
pub fn resize_nearest(mask: &LabelMask, width: u32, height: u32) -> LabelMask {
    let (src_w, src_h) = mask.dimensions();
    if (src_w, src_h) == (width, height) {
        return mask.clone();
    }
    if src_w == 0 || src_h == 0 {
        return ImageBuffer::from_pixel(width, height, Luma([IGNORE_LABEL]));
    }
    imageops::resize(mask, width, height, FilterType::Nearest)
}

/// Mirror image and mask left-to-right together.
pub fn flip_horizontal(image: &mut SeismicImage, mask: &mut LabelMask) {
    imageops::flip_horizontal_in_place(image);
    imageops::flip_horizontal_in_place(mask);
}
