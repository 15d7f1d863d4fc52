//! Dataset processing toolkit.

mod csv;
mod hard_pool;
mod pk_sampler;

pub use self::csv::*;
pub use hard_pool::*;
pub use pk_sampler::*;
