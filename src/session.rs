//! Per-object side accumulation.

use anyhow::{anyhow, Result};

use crate::frame::Frame;
use crate::sink::FlushReceipt;

/// Sides accepted so far for the object currently on the staging area.
///
/// Never holds more than `images_per_object` sides.
#[derive(Clone, Debug)]
pub struct ObjectSession {
    object_id: u64,
    images_per_object: usize,
    sides: Vec<Frame>,
}

impl ObjectSession {
    pub fn new(object_id: u64, images_per_object: usize) -> Self {
        Self {
            object_id,
            images_per_object: images_per_object.max(1),
            sides: Vec::with_capacity(images_per_object.max(1)),
        }
    }

    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    pub fn images_per_object(&self) -> usize {
        self.images_per_object
    }

    pub fn accepted_sides(&self) -> &[Frame] {
        &self.sides
    }

    pub fn len(&self) -> usize {
        self.sides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sides.is_empty()
    }

    /// Zero-based slot the next accepted side fills.
    pub fn pending_side_index(&self) -> usize {
        self.sides.len()
    }

    pub fn is_complete(&self) -> bool {
        self.sides.len() >= self.images_per_object
    }

    /// Accept a side into the pending slot. Returns the 1-based side number.
    pub fn accept(&mut self, frame: Frame) -> Result<usize> {
        if self.is_complete() {
            return Err(anyhow!(
                "object {} already holds {} sides",
                self.object_id,
                self.images_per_object
            ));
        }
        self.sides.push(frame);
        Ok(self.sides.len())
    }

    /// Drop the most recently accepted side; earlier sides are untouched.
    pub fn discard_last(&mut self) -> Option<Frame> {
        self.sides.pop()
    }

    /// Fresh session for the following object.
    pub fn successor(&self) -> ObjectSession {
        ObjectSession::new(self.object_id + 1, self.images_per_object)
    }
}

/// A flushed object kept until the next object's first side supersedes it,
/// so a full-object retake can still withdraw it.
#[derive(Clone, Debug)]
pub struct CompletedObject {
    pub object_id: u64,
    pub sides: Vec<Frame>,
    pub receipt: FlushReceipt,
}

impl CompletedObject {
    pub fn new(session: ObjectSession, receipt: FlushReceipt) -> Self {
        Self {
            object_id: session.object_id,
            sides: session.sides,
            receipt,
        }
    }
}
