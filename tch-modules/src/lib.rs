//! Neural network layers shared by the temporal detector.
//!
//! Layers that work on frame windows take `[batch, frames, channels, height, width]`
//! tensors unless noted otherwise.

mod common;

pub mod bce_with_logits_loss;
pub mod conv_bn;
pub mod conv_gru;
pub mod conv_nd;
pub mod correlation;
pub mod dark_batch_norm;
pub mod temporal_pool;
pub mod time_distributed;

pub use bce_with_logits_loss::*;
pub use conv_bn::*;
pub use conv_gru::*;
pub use conv_nd::*;
pub use correlation::*;
pub use dark_batch_norm::*;
pub use temporal_pool::*;
pub use time_distributed::*;
