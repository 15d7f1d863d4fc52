//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use approx::{abs_diff_eq, assert_abs_diff_eq};
pub use byteorder::{LittleEndian, WriteBytesExt};
pub use futures::{
    future::FutureExt,
    stream::{self, Stream, StreamExt, TryStreamExt},
};
pub use itertools::{izip, Itertools};
pub use noisy_float::prelude::*;
pub use rand::{prelude::*, rngs::StdRng};
pub use regex::Regex;
pub use reid_dl::{
    dataset::{HardIdentityPool, PkBatch, PkSampler, PkSamplerInit, ReidDataset},
    loss::{LossKind, Margin, Metric, TripletLoss, TripletLossInit, TripletLossOutput},
    model::{BackboneKind, HeadKind, HeadOutput, ReidModel, ReidModelInit},
    processor::{DenoiseAugmentInit, ImageLoader, ImageLoaderInit},
};
pub use serde::{Deserialize, Serialize};
pub use serde_json::{Map, Value};
pub use std::{
    borrow::Cow,
    fmt::Debug,
    fs::{self, File, OpenOptions},
    future::Future,
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
pub use structopt::StructOpt;
pub use tch::{
    nn::{self, OptimizerConfig as _},
    Device, IndexOp, Kind, Tensor,
};
pub use tch_tensor_like::TensorLike;
pub use tfrecord::{EventWriter, EventWriterInit};
pub use tokio::sync::{broadcast, mpsc};
pub use tracing::{error, info, info_span, warn, Instrument};

pub type Fallible<T> = Result<T, Error>;
