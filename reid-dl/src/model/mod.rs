//! Embedding networks.

mod backbone;
mod head;
mod mobilenet;
mod model;

pub use backbone::*;
pub use head::*;
pub use mobilenet::*;
pub use model::*;
