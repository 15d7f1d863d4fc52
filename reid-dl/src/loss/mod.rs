//! Metric learning losses.

mod margin;
mod metric;
mod triplet;

pub use margin::*;
pub use metric::*;
pub use triplet::*;
