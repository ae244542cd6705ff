//! Detection datasets for still images and videos, and the batch loader
//! feeding the detector.

mod common;

pub mod clip;
pub mod coco;
pub mod combined;
pub mod config;
pub mod dataset;
pub mod imagenet;
pub mod loader;
pub mod motion;
pub mod names;
pub mod pascal_xml;
pub mod stats;
pub mod transform;
pub mod tree;
pub mod voc;
pub mod window;
pub mod youtube_bb;

pub use clip::*;
pub use coco::*;
pub use combined::*;
pub use config::*;
pub use dataset::*;
pub use imagenet::*;
pub use loader::*;
pub use motion::*;
pub use names::*;
pub use stats::*;
pub use transform::*;
pub use tree::*;
pub use voc::*;
pub use window::*;
pub use youtube_bb::*;
