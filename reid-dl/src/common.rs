pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use approx::{abs_diff_eq, assert_abs_diff_eq};
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::{izip, Itertools as _};
pub use log::{debug, info, warn};
pub use nalgebra::{Matrix3, SMatrix, SVector};
pub use noisy_float::prelude::*;
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use rand_distr::StandardNormal;
pub use serde::{
    de::{Error as _, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};
pub use std::{
    borrow::Borrow,
    collections::{HashMap, HashSet, VecDeque},
    fmt::{self, Debug, Display},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
pub use strum::{AsRefStr, Display as StrumDisplay, EnumIter, EnumString, EnumVariantNames};
pub use tch::{
    nn::{self, ModuleT},
    vision, Device, IndexOp, Kind, Tensor,
};
pub use tch_goodies::TensorExt as _;
pub use tch_tensor_like::TensorLike;

pub type Fallible<T> = Result<T, Error>;
