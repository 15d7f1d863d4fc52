//! The PK batch sampler.

use super::{HardIdentityPool, ReidDataset};
use crate::common::*;

/// One sampled image in a PK batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchSample {
    /// The dense identity index.
    pub identity: usize,
    /// The record index in the dataset.
    pub record: usize,
}

/// P identities times K images, grouped by identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkBatch {
    pub epoch: usize,
    pub samples: Vec<BatchSample>,
}

#[derive(Debug, Clone)]
pub struct PkSamplerInit {
    pub batch_p: usize,
    pub batch_k: usize,
    pub hard_pool: Option<Arc<HardIdentityPool>>,
}

impl PkSamplerInit {
    pub fn build(self, dataset: Arc<ReidDataset>, rng: StdRng) -> Result<PkSampler> {
        let Self {
            batch_p,
            batch_k,
            hard_pool,
        } = self;

        ensure!(batch_p >= 2, "batch_p must be at least 2, but get {}", batch_p);
        ensure!(batch_k >= 1, "batch_k must be positive");
        ensure!(
            dataset.num_identities() >= batch_p,
            "the dataset has {} identities, fewer than batch_p = {}",
            dataset.num_identities(),
            batch_p
        );
        if let Some(pool) = &hard_pool {
            ensure!(
                pool.num_identities() == dataset.num_identities(),
                "the hard pool covers {} identities, but the dataset has {}",
                pool.num_identities(),
                dataset.num_identities()
            );
        }

        Ok(PkSampler {
            dataset,
            batch_p,
            batch_k,
            hard_pool,
            rng,
            epoch: None,
            pending: VecDeque::new(),
        })
    }
}

/// A never-ending iterator of [PkBatch].
#[derive(Debug)]
pub struct PkSampler {
    dataset: Arc<ReidDataset>,
    batch_p: usize,
    batch_k: usize,
    hard_pool: Option<Arc<HardIdentityPool>>,
    rng: StdRng,
    epoch: Option<usize>,
    /// Identities not yet visited in the current epoch.
    pending: VecDeque<usize>,
}

impl PkSampler {
    pub fn batch_size(&self) -> usize {
        self.batch_p * self.batch_k
    }

    pub fn next_batch(&mut self) -> PkBatch {
        let (epoch, identities) = self.next_identities();

        let mut samples = Vec::with_capacity(self.batch_size());
        for identity in identities {
            let records = self.dataset.records_of(identity);
            let drawn = sample_k(records, self.batch_k, &mut self.rng);
            samples.extend(
                drawn
                    .into_iter()
                    .map(|record| BatchSample { identity, record }),
            );
        }

        PkBatch { epoch, samples }
    }

    fn next_identities(&mut self) -> (usize, Vec<usize>) {
        let step_size = match self.hard_pool {
            Some(_) => 1,
            None => self.batch_p,
        };

        if self.pending.len() < step_size {
            self.epoch = match self.epoch {
                Some(epoch) => Some(epoch + 1),
                None => Some(0),
            };
            self.refill();
        }
        let epoch = self.epoch.unwrap_or(0);
        let heads: Vec<usize> = self.pending.drain(..step_size).collect();

        let identities = match self.hard_pool.clone() {
            Some(pool) => self.companions_of(heads[0], &pool),
            None => heads,
        };
        (epoch, identities)
    }

    fn refill(&mut self) {
        let num_identities = self.dataset.num_identities();
        let mut identities: Vec<usize> = (0..num_identities).collect();
        identities.shuffle(&mut self.rng);

        if self.hard_pool.is_none() {
            let usable = num_identities / self.batch_p * self.batch_p;
            identities.truncate(usable);
        }

        self.pending = identities.into();
    }

    fn companions_of(&mut self, anchor: usize, pool: &HardIdentityPool) -> Vec<usize> {
        let num_companions = self.batch_p - 1;
        let num_hard = num_companions / 2;

        let mut chosen = vec![anchor];

        let mut hard: Vec<usize> = pool
            .hard_identities(anchor)
            .iter()
            .copied()
            .filter(|&identity| identity != anchor)
            .collect();
        hard.shuffle(&mut self.rng);
        chosen.extend(hard.into_iter().take(num_hard));

        let mut others: Vec<usize> = (0..self.dataset.num_identities())
            .filter(|identity| !chosen.contains(identity))
            .collect();
        others.shuffle(&mut self.rng);
        let num_random = self.batch_p - chosen.len();
        chosen.extend(others.into_iter().take(num_random));

        chosen
    }
}

impl Iterator for PkSampler {
    type Item = PkBatch;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

/// Draw `k` record indexes out of `records`.
///
/// The indexes are drawn without repetition if there are at least `k` records.
/// Otherwise every record appears ⌊k/n⌋ times and the remaining `k mod n` picks
/// are distinct records drawn without replacement, so the counts of any two
/// records in one draw differ by at most one.
pub fn sample_k<R>(records: &[usize], k: usize, rng: &mut R) -> Vec<usize>
where
    R: Rng + ?Sized,
{
    let count = records.len();
    if count == 0 {
        return vec![];
    }

    let full_copies = k / count;
    let mut drawn: Vec<usize> = Vec::with_capacity(k);
    for _ in 0..full_copies {
        drawn.extend_from_slice(records);
    }
    drawn.extend(records.choose_multiple(rng, k % count).copied());
    drawn.shuffle(rng);
    drawn
}
