//! Mining of visually confusable identities.

use super::ReidDataset;
use crate::{common::*, loss::Metric};

/// Per identity, the ordered list of the nearest other identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardIdentityPool {
    pools: Vec<Vec<usize>>,
}

impl HardIdentityPool {
    /// Build the pool from a full `[N, N]` distance matrix and the identity label of each row.
    ///
    /// The row of the first occurrence of each identity is used.
    pub fn from_distances(labels: &[usize], distances: &Tensor, pool_size: usize) -> Result<Self> {
        let num_records = labels.len();
        let (rows, cols) = distances.size2()?;
        ensure!(
            rows == num_records as i64 && cols == num_records as i64,
            "expect a {}x{} distance matrix, but get {}x{}",
            num_records,
            num_records,
            rows,
            cols
        );

        let first_records = first_occurrences(labels)?;
        let index = Tensor::of_slice(
            &first_records
                .iter()
                .map(|&record| record as i64)
                .collect_vec(),
        )
        .to_device(distances.device());
        let block = distances.index_select(0, &index);

        Self::from_block(labels, &block, pool_size)
    }

    /// Build the pool from an `[N, D]` embedding snapshot aligned with the dataset records.
    pub fn from_embeddings(
        dataset: &ReidDataset,
        embeddings: &Tensor,
        pool_size: usize,
    ) -> Result<Self> {
        let (num_rows, _dim) = embeddings.size2()?;
        ensure!(
            num_rows == dataset.len() as i64,
            "the embedding snapshot has {} rows, but the dataset has {} records",
            num_rows,
            dataset.len()
        );

        let block = tch::no_grad(|| -> Result<_> {
            let embeddings = embeddings.to_kind(Kind::Float);
            let index = Tensor::of_slice(
                &dataset
                    .first_records()
                    .into_iter()
                    .map(|record| record as i64)
                    .collect_vec(),
            )
            .to_device(embeddings.device());
            let anchors = embeddings.index_select(0, &index);
            Metric::Euclidean.cdist(&anchors, &embeddings)
        })?;

        Self::from_block(dataset.labels(), &block, pool_size)
    }

    /// Load the embedding array keyed `emb` from a NumPy `.npz` archive and build the pool.
    pub fn from_npz(
        dataset: &ReidDataset,
        npz_file: impl AsRef<Path>,
        pool_size: usize,
    ) -> Result<Self> {
        let npz_file = npz_file.as_ref();
        let embeddings = Tensor::read_npz(npz_file)
            .with_context(|| format!("failed to read {}", npz_file.display()))?
            .into_iter()
            .find_map(|(name, tensor)| (name == "emb").then(|| tensor))
            .ok_or_else(|| format_err!("the array 'emb' is not found in {}", npz_file.display()))?;

        info!(
            "build hard identity pool of size {} from {:?} embeddings",
            pool_size,
            embeddings.size()
        );
        Self::from_embeddings(dataset, &embeddings, pool_size)
    }

    /// Build from explicit per-identity lists.
    pub fn from_lists(pools: Vec<Vec<usize>>) -> Result<Self> {
        pools.iter().enumerate().try_for_each(|(identity, pool)| {
            ensure!(
                !pool.contains(&identity),
                "the pool of identity {} contains itself",
                identity
            );
            ensure!(
                pool.iter().all_unique(),
                "the pool of identity {} has duplicated entries",
                identity
            );
            Ok(())
        })?;
        Ok(Self { pools })
    }

    /// `block` is a `[U, N]` matrix whose row `u` holds the distances from the first record of identity `u`.
    fn from_block(labels: &[usize], block: &Tensor, pool_size: usize) -> Result<Self> {
        let num_identities = labels.iter().max().map(|&max| max + 1).unwrap_or(0);
        let (rows, cols) = block.size2()?;
        ensure!(
            rows == num_identities as i64 && cols == labels.len() as i64,
            "expect a {}x{} distance block, but get {}x{}",
            num_identities,
            labels.len(),
            rows,
            cols
        );

        let pool_size = pool_size.min(num_identities.saturating_sub(1));
        if pool_size < num_identities.saturating_sub(1) {
            debug!("pool size is capped to {}", pool_size);
        }

        let block: Vec<f32> = block.to_kind(Kind::Float).to_device(Device::Cpu).reshape(&[-1]).into();

        let pools: Vec<Vec<usize>> = block
            .chunks(labels.len())
            .enumerate()
            .map(|(identity, row)| {
                let mut order: Vec<usize> = (0..row.len()).collect();
                // the sort is stable, ties keep the record order
                order.sort_by(|&lhs, &rhs| row[lhs].total_cmp(&row[rhs]));

                let mut pool = Vec::with_capacity(pool_size);
                for record in order {
                    if pool.len() >= pool_size {
                        break;
                    }
                    let candidate = labels[record];
                    if candidate != identity && !pool.contains(&candidate) {
                        pool.push(candidate);
                    }
                }
                pool
            })
            .collect();

        Ok(Self { pools })
    }

    pub fn num_identities(&self) -> usize {
        self.pools.len()
    }

    pub fn hard_identities(&self, identity: usize) -> &[usize] {
        self.pools
            .get(identity)
            .map(|pool| pool.as_slice())
            .unwrap_or(&[])
    }
}

fn first_occurrences(labels: &[usize]) -> Result<Vec<usize>> {
    let num_identities = labels.iter().max().map(|&max| max + 1).unwrap_or(0);
    let mut first = vec![None; num_identities];
    labels.iter().enumerate().for_each(|(record, &label)| {
        first[label].get_or_insert(record);
    });
    first
        .into_iter()
        .enumerate()
        .map(|(identity, record)| {
            record.ok_or_else(|| format_err!("identity {} has no records", identity))
        })
        .try_collect()
}

#[cfg(test)]
mod tests {
    use super::super::CsvSample;
    use super::*;

    #[test]
    fn nearest_distinct_identities() -> Result<()> {
        // points on a line, identity label in parentheses:
        // 0.0(0) 0.1(0) 1.0(1) 1.1(1) 3.0(2) 7.0(3)
        let positions = [0.0f32, 0.1, 1.0, 1.1, 3.0, 7.0];
        let labels = [0usize, 0, 1, 1, 2, 3];
        let points = Tensor::of_slice(&positions).view([6, 1]);
        let distances = Metric::Euclidean.pairwise(&points)?;

        let pool = HardIdentityPool::from_distances(&labels, &distances, 2)?;
        assert_eq!(pool.num_identities(), 4);
        assert_eq!(pool.hard_identities(0), &[1, 2]);
        assert_eq!(pool.hard_identities(1), &[0, 2]);
        assert_eq!(pool.hard_identities(2), &[1, 0]);
        assert_eq!(pool.hard_identities(3), &[2, 1]);
        Ok(())
    }

    #[test]
    fn pool_excludes_self_and_duplicates() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let labels: Vec<usize> = (0..60).map(|_| rng.gen_range(0..12)).collect();
        // make sure every identity occurs
        let labels: Vec<usize> = (0..12).chain(labels).collect();
        let samples: Vec<_> = labels
            .iter()
            .enumerate()
            .map(|(index, label)| CsvSample {
                pid: format!("{}", label),
                fid: format!("{}.jpg", index),
            })
            .collect();
        let dataset = ReidDataset::from_samples("/", samples)?;
        let embeddings = Tensor::randn(&[72, 8], (Kind::Float, Device::Cpu));

        // larger than the number of other identities
        let pool = HardIdentityPool::from_embeddings(&dataset, &embeddings, 100)?;
        assert_eq!(pool.num_identities(), 12);

        (0..12).for_each(|identity| {
            let hard = pool.hard_identities(identity);
            assert_eq!(hard.len(), 11);
            assert!(!hard.contains(&identity));
            assert!(hard.iter().all_unique());
        });
        Ok(())
    }

    #[test]
    fn embedding_count_mismatch() -> Result<()> {
        let samples = vec![
            CsvSample {
                pid: "a".into(),
                fid: "a.jpg".into(),
            },
            CsvSample {
                pid: "b".into(),
                fid: "b.jpg".into(),
            },
        ];
        let dataset = ReidDataset::from_samples("/", samples)?;
        let embeddings = Tensor::randn(&[3, 4], (Kind::Float, Device::Cpu));
        assert!(HardIdentityPool::from_embeddings(&dataset, &embeddings, 1).is_err());
        Ok(())
    }

    #[test]
    fn reject_invalid_lists() {
        assert!(HardIdentityPool::from_lists(vec![vec![1], vec![0]]).is_ok());
        assert!(HardIdentityPool::from_lists(vec![vec![0], vec![0]]).is_err());
        assert!(HardIdentityPool::from_lists(vec![vec![1, 1], vec![0]]).is_err());
    }
}
