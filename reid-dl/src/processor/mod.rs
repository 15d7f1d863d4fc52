//! Data preprocessing building blocks.

pub mod geometric;
pub mod image_loader;
pub mod photometric;
pub mod wavelet;

pub use geometric::*;
pub use image_loader::*;
pub use photometric::*;
pub use wavelet::*;

use crate::common::*;

/// Pick `0..=max_count` of `num_choices` indexes without repetition, in ascending order.
pub(crate) fn sample_some_of<R>(rng: &mut R, num_choices: usize, max_count: usize) -> Vec<usize>
where
    R: Rng + ?Sized,
{
    let count = rng.gen_range(0..=max_count.min(num_choices));
    let mut indexes = rand::seq::index::sample(rng, num_choices, count).into_vec();
    indexes.sort_unstable();
    indexes
}
