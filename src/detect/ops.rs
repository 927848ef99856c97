//! Image primitives used by the change detector.

use image::{GrayImage, Luma};
use imageproc::contrast::{threshold, ThresholdType};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::dilate;
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::HashMap;

use crate::frame::{Frame, PixelLayout};

/// Binarisation level applied to the blurred difference image.
pub const DIFF_THRESHOLD: u8 = 20;

/// Chebyshev radius of the dilation, three passes of a 3x3 rectangle.
pub const DILATE_RADIUS: u8 = 3;

/// Sigma of a 5x5 Gaussian kernel.
pub const BLUR_SIGMA: f32 = 1.1;

fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
        .round()
        .clamp(0.0, 255.0) as u8
}

/// Per-pixel absolute difference of two same-shaped frames, reduced to intensity.
pub fn abs_diff_intensity(a: &Frame, b: &Frame) -> GrayImage {
    let channels = a.channels();
    let stride = a.width as usize;
    let (pa, pb) = (a.pixels(), b.pixels());
    GrayImage::from_fn(a.width, a.height, |x, y| {
        let o = (y as usize * stride + x as usize) * channels;
        let value = match a.layout {
            PixelLayout::Gray8 => pa[o].abs_diff(pb[o]),
            PixelLayout::Rgb8 => luma(
                pa[o].abs_diff(pb[o]),
                pa[o + 1].abs_diff(pb[o + 1]),
                pa[o + 2].abs_diff(pb[o + 2]),
            ),
        };
        Luma([value])
    })
}

/// Blur, binarise and dilate a difference image into a foreground mask.
pub fn motion_mask(diff: &GrayImage) -> GrayImage {
    let blurred = gaussian_blur_f32(diff, BLUR_SIGMA);
    let mask = threshold(&blurred, DIFF_THRESHOLD, ThresholdType::Binary);
    dilate(&mask, Norm::LInf, DILATE_RADIUS)
}

/// Areas (pixel counts) of the 8-connected foreground regions of a mask.
pub fn region_areas(mask: &GrayImage) -> Vec<usize> {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let mut areas: HashMap<u32, usize> = HashMap::new();
    for pixel in labels.pixels() {
        let label = pixel.0[0];
        if label != 0 {
            *areas.entry(label).or_default() += 1;
        }
    }
    areas.into_values().collect()
}

/// Normalised correlation coefficient of two same-shaped frames, in [-1, 1].
///
/// Channel means are removed independently. When either frame is flat
/// (zero variance) the coefficient is undefined; identical frames then score
/// 1.0 and anything else 0.0.
pub fn correlation_coefficient(a: &Frame, b: &Frame) -> f64 {
    let channels = a.channels();
    let (pa, pb) = (a.pixels(), b.pixels());
    let n = (pa.len() / channels) as f64;

    let mut mean_a = vec![0f64; channels];
    let mut mean_b = vec![0f64; channels];
    for (i, (&x, &y)) in pa.iter().zip(pb).enumerate() {
        mean_a[i % channels] += x as f64;
        mean_b[i % channels] += y as f64;
    }
    for c in 0..channels {
        mean_a[c] /= n;
        mean_b[c] /= n;
    }

    let (mut cross, mut var_a, mut var_b) = (0f64, 0f64, 0f64);
    for (i, (&x, &y)) in pa.iter().zip(pb).enumerate() {
        let c = i % channels;
        let da = x as f64 - mean_a[c];
        let db = y as f64 - mean_b[c];
        cross += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    let denom = (var_a * var_b).sqrt();
    if denom <= f64::EPSILON {
        return if pa == pb { 1.0 } else { 0.0 };
    }
    (cross / denom).clamp(-1.0, 1.0)
}
