//! Detection quality metrics: VOC, COCO and motion-binned VID mean average precision.

mod common;

pub mod ap;
pub mod class_map;
pub mod coco;
pub mod detection;
pub mod matching;
pub mod vid;
pub mod voc;

pub use ap::*;
pub use class_map::*;
pub use coco::*;
pub use detection::*;
pub use vid::*;
pub use voc::*;

/// An accumulating detection metric.
pub trait DetectionMetric {
    fn reset(&mut self);

    fn update(&mut self, image: &EvalImage) -> anyhow::Result<()>;

    /// Metric names paired with their values.
    fn get(&self) -> (Vec<String>, Vec<f64>);
}
