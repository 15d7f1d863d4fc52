use crate::common::*;

/// Distance metrics between embedding vectors.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    StrumDisplay,
    EnumIter,
    EnumVariantNames,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Metric {
    /// Squared Euclidean distance.
    Sqeuclidean,
    Euclidean,
    /// L1 distance.
    Cityblock,
}

impl Metric {
    /// Compute `[N, M]` distances between `[N, D]` and `[M, D]` embeddings.
    pub fn cdist(&self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
        let (_, lhs_dim) = lhs.size2()?;
        let (_, rhs_dim) = rhs.size2()?;
        ensure!(
            lhs_dim == rhs_dim,
            "embedding dimensions mismatch: {} vs {}",
            lhs_dim,
            rhs_dim
        );

        let dists = match self {
            Self::Sqeuclidean => squared_distances(lhs, rhs),
            Self::Euclidean => (squared_distances(lhs, rhs) + 1e-12).sqrt(),
            Self::Cityblock => (lhs.unsqueeze(1) - rhs.unsqueeze(0))
                .abs()
                .sum_dim_intlist(&[-1], false, Kind::Float),
        };
        Ok(dists)
    }

    /// Compute the `[N, N]` self-distance matrix of `[N, D]` embeddings.
    ///
    /// The diagonal is exactly zero.
    pub fn pairwise(&self, embeddings: &Tensor) -> Result<Tensor> {
        let (num, _) = embeddings.size2()?;
        let dists = self.cdist(embeddings, embeddings)?;
        let diagonal = Tensor::eye(num, (Kind::Bool, embeddings.device()));
        Ok(dists.masked_fill(&diagonal, 0.0))
    }
}

impl Default for Metric {
    fn default() -> Self {
        Self::Euclidean
    }
}

/// Squared distances by the Gram expansion, clamped to non-negative values.
fn squared_distances(lhs: &Tensor, rhs: &Tensor) -> Tensor {
    let lhs_sq = (lhs * lhs).sum_dim_intlist(&[1], true, Kind::Float);
    let rhs_sq = (rhs * rhs)
        .sum_dim_intlist(&[1], true, Kind::Float)
        .transpose(0, 1);
    let dot = lhs.matmul(&rhs.transpose(0, 1));
    (lhs_sq + rhs_sq - dot * 2.0).clamp_min(0.0)
}
