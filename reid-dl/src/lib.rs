//! The building blocks of person re-identification training.

mod common;
pub mod dataset;
pub mod loss;
pub mod model;
pub mod processor;
