//! Temporal YOLOv3 detector on a Darknet-53 backbone.
//!
//! Single images are `[B, 3, H, W]` tensors and frame windows are
//! `[B, K, 3, H, W]` tensors with values normalized per channel.

mod common;

pub mod block;
pub mod config;
pub mod darknet;
pub mod hierarchy;
pub mod loss;
pub mod model;
pub mod motion;
pub mod nms;
pub mod output;
pub mod target;

pub use config::{FusionPos, JoinType, ModelConfig, MotionStream, RnnPos, StreamGating};
pub use hierarchy::Hierarchy;
pub use loss::{YoloLoss, YoloLossInit, YoloLossOutput};
pub use model::{ClassRef, ClassReuse, YoloVid, YoloVidInit, BACKBONE_SCOPE};
pub use nms::{NmsOutput, NonMaxSuppression, NonMaxSuppressionInit};
pub use output::{LevelInfo, YoloTrainOutput};
