//! Frame change detection.
//!
//! Two independent judgments, both pure:
//! - motion: is something moving or occluding the scene between two frames
//!   (difference, blur, binarise, dilate, region area);
//! - distinctness: has the scene materially changed since a reference frame
//!   (normalised correlation below a similarity threshold).
//!
//! A side is only shot when motion is absent and the frame is distinct from
//! the previous side.

pub mod ops;

use crate::frame::Frame;

/// Default region area, in pixels, that counts as motion.
pub const DEFAULT_MOVEMENT_THRESHOLD: u32 = 1000;

/// Default correlation below which two frames are different sides.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.65;

/// True iff a connected region of changed pixels exceeds `threshold` pixels.
///
/// Frames of different shape always count as motion.
pub fn has_motion(prev: &Frame, cur: &Frame, threshold: u32) -> bool {
    if !prev.same_shape(cur) {
        return true;
    }
    let diff = ops::abs_diff_intensity(prev, cur);
    ops::region_areas(&ops::motion_mask(&diff))
        .into_iter()
        .any(|area| area > threshold as usize)
}

/// Correlation score between two frames; 0.0 for frames of different shape.
pub fn similarity(prev: &Frame, cur: &Frame) -> f64 {
    if !prev.same_shape(cur) {
        return 0.0;
    }
    ops::correlation_coefficient(prev, cur)
}

/// True iff `cur` is different enough from `prev` to be a new side.
pub fn is_distinct(prev: &Frame, cur: &Frame, similarity_threshold: f64) -> bool {
    let score = similarity(prev, cur);
    log::debug!("similarity: {:.3}", score);
    score < similarity_threshold
}

/// Thresholds bound together for the capture loop.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChangeDetector {
    pub movement_threshold: u32,
    pub similarity_threshold: f64,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self {
            movement_threshold: DEFAULT_MOVEMENT_THRESHOLD,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

impl ChangeDetector {
    pub fn new(movement_threshold: u32, similarity_threshold: f64) -> Self {
        Self {
            movement_threshold,
            similarity_threshold,
        }
    }

    pub fn has_motion(&self, prev: &Frame, cur: &Frame) -> bool {
        has_motion(prev, cur, self.movement_threshold)
    }

    pub fn is_distinct(&self, prev: &Frame, cur: &Frame) -> bool {
        is_distinct(prev, cur, self.similarity_threshold)
    }

    /// Stable and changed: the gate for accepting the next side.
    pub fn is_settled_new_side(&self, last: &Frame, reference: &Frame, cur: &Frame) -> bool {
        !self.has_motion(last, cur) && self.is_distinct(reference, cur)
    }
}
