//! Misc utilities.

mod checkpoint;
mod freeze;
mod loss_meter;
mod lr_scheduler;
mod rate_counter;

pub use checkpoint::*;
pub use freeze::*;
pub use loss_meter::*;
pub use lr_scheduler::*;
pub use rate_counter::*;
