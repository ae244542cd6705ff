use crate::common::*;

/// A scored detection in pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class: usize,
    pub score: R64,
    pub bbox: TLBR<f64>,
}

/// The detections and ground truth of one image.
#[derive(Debug, Clone, Default)]
pub struct EvalImage {
    pub detections: Vec<Detection>,
    pub ground_truth: Vec<ObjectLabel>,
    /// Motion IoU of each ground truth box, in the same order.
    pub motion_ious: Option<Vec<f64>>,
}

impl EvalImage {
    pub fn new(detections: Vec<Detection>, ground_truth: Vec<ObjectLabel>) -> Self {
        Self {
            detections,
            ground_truth,
            motion_ious: None,
        }
    }

    pub fn with_motion_ious(self, motion_ious: Vec<f64>) -> Result<Self> {
        ensure!(
            motion_ious.len() == self.ground_truth.len(),
            "expect {} motion IoUs, but get {}",
            self.ground_truth.len(),
            motion_ious.len()
        );
        Ok(Self {
            motion_ious: Some(motion_ious),
            ..self
        })
    }

    /// Clips every detection into the image canvas.
    pub fn clip_detections(&mut self, size: &bbox::HW<f64>) {
        self.detections
            .iter_mut()
            .for_each(|det| det.bbox = det.bbox.clip(size));
    }
}
