pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use bbox::{prelude::*, TLBR};
pub use itertools::{izip, Itertools};
pub use label::ObjectLabel;
pub use noisy_float::prelude::*;
pub use std::{
    borrow::Borrow,
    collections::{HashMap, HashSet},
    iter,
};
