//! The training workers.

mod single_gpu;

pub use single_gpu::*;
