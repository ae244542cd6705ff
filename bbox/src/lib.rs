//! Bounding box types shared by the dataset, model and metric crates.
//!
//! Boxes are stored in TLBR order (top, left, bottom, right). Dataset files
//! store boxes as `[x1, y1, x2, y2]`, use [TLBR::from_xyxy] and [TLBR::xyxy]
//! to cross the boundary.

mod common;

pub use rect::*;
pub mod rect;

pub use tlbr::*;
pub mod tlbr;

pub use cycxhw::*;
pub mod cycxhw;

pub use hw::*;
pub mod hw;

pub use transform::*;
mod transform;

pub mod prelude {
    pub use crate::rect::{Rect, RectFloat, RectNum};
}
