//! Tensor helpers shared by the re-identification pipeline.

mod common;
pub mod tensor;

pub use tensor::*;
