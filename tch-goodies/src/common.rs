pub use anyhow::{bail, ensure, Result};
pub use itertools::Itertools;
pub use tch::{vision, Device, IndexOp, Kind, Tensor};
