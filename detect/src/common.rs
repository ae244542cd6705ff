pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use bbox::{prelude::*, Transform, HW, TLBR};
pub use futures::{
    future::{self, FutureExt},
    stream::{self, StreamExt, TryStreamExt},
};
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::{izip, Itertools};
pub use label::ObjectLabel;
pub use noisy_float::prelude::*;
pub use once_cell::sync::Lazy;
pub use par_stream::prelude::*;
pub use semver::{Version, VersionReq};
pub use serde::{de::Error as DeserializeError, Deserialize, Deserializer, Serialize};
pub use std::{
    collections::HashMap,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};
pub use tch::{nn, vision, Device, IndexOp, Kind, Tensor};
pub use tokio::sync::mpsc;
pub use tracing::{error, info, info_span, warn, Instrument};

pub type Fallible<T> = Result<T, Error>;
