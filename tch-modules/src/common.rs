pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use log::warn;
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::borrow::Borrow;
pub use strum::{AsRefStr, Display, EnumString};
pub use tch::{
    nn::{self, Module as _, ModuleT},
    Device, IndexOp, Kind, Reduction, Tensor,
};
pub use tch_act::{Activation, TensorActivationExt as _};
