pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use bbox::{prelude::*, HW, TLBR};
pub use futures::{
    future::FutureExt as _,
    stream::{self, StreamExt as _, TryStreamExt as _},
};
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::{izip, Itertools as _};
pub use label::ObjectLabel;
pub use log::{error, info, warn};
pub use noisy_float::prelude::*;
pub use par_stream::prelude::*;
pub use rand::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::{self, Debug, Write as _},
    path::{Path, PathBuf},
    sync::Arc,
};
pub use tch::{vision, Device, IndexOp, Kind, Tensor};

pub type Fallible<T> = Result<T, Error>;
