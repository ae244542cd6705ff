pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use bbox::{prelude::*, CyCxHW, HW, TLBR};
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::{chain, iproduct, izip, Itertools as _};
pub use label::ObjectLabel;
pub use log::{info, warn};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    cmp::Ordering,
    collections::{HashMap, HashSet},
    fmt::Debug,
    iter,
};
pub use strum::{AsRefStr, Display, EnumString};
pub use tch::{
    nn::{self, Module as _, ModuleT as _},
    Device, IndexOp, Kind, Reduction, Tensor,
};
pub use tch_tensor_like::TensorLike;
