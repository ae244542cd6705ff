//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use bbox::{HW, TLBR};
pub use chrono::Local;
pub use futures::{
    future::FutureExt,
    stream::{self, Stream, StreamExt, TryStreamExt},
};
pub use itertools::{izip, Itertools};
pub use noisy_float::prelude::*;
pub use once_cell::sync::Lazy;
pub use semver::{Version, VersionReq};
pub use serde::{de::Error as DeserializeError, Deserialize, Deserializer, Serialize};
pub use std::{
    borrow::Cow,
    fmt::Debug,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        atomic::{self, AtomicUsize},
        Arc,
    },
    time::{Duration, Instant},
};
pub use tch::{
    nn::{self, OptimizerConfig as _},
    Device, Tensor,
};
pub use tfrecord::{EventWriter, EventWriterInit};
pub use tokio::sync::{broadcast, mpsc};
pub use tracing::{error, info, info_span, trace_span, warn, Instrument};

pub type Fallible<T> = Result<T, Error>;
