use super::Margin;
use crate::common::*;

/// A large finite value standing for an excluded entry in log-sum-exp.
const EXCLUDED_LOGIT: f64 = -1e9;

/// The threshold above which an anchor loss counts as active.
pub const ACTIVE_LOSS_THRESHOLD: f64 = 1e-5;

/// The loss policies over a pairwise distance matrix.
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LossKind {
    /// The hardest positive against the hardest negative.
    BatchHard,
    /// The mean over all valid (positive, negative) pairs.
    BatchAll,
    /// Log-sum-exp over positives against soft minimum over negatives.
    LiftedStructured,
}

impl Default for LossKind {
    fn default() -> Self {
        Self::BatchHard
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TripletLossInit {
    pub kind: LossKind,
    pub margin: Margin,
    /// The k of the precision@k statistic, usually K - 1.
    pub precision_at_k: usize,
}

impl TripletLossInit {
    pub fn build(self) -> Result<TripletLoss> {
        let Self {
            kind,
            margin,
            precision_at_k,
        } = self;
        ensure!(precision_at_k >= 1, "precision_at_k must be positive");

        Ok(TripletLoss {
            kind,
            margin,
            precision_at_k: precision_at_k as i64,
        })
    }
}

#[derive(Debug)]
pub struct TripletLoss {
    kind: LossKind,
    margin: Margin,
    precision_at_k: i64,
}

impl TripletLoss {
    /// The requested k of the precision@k statistic.
    pub fn precision_at_k(&self) -> usize {
        self.precision_at_k as usize
    }

    /// Compute per-anchor losses from a `[B, B]` self-distance matrix and `[B]` identity labels.
    pub fn forward(&self, dists: &Tensor, pids: &Tensor) -> Result<TripletLossOutput> {
        let (rows, cols) = dists.size2()?;
        ensure!(
            rows == cols,
            "the distance matrix must be square, but get {}x{}",
            rows,
            cols
        );
        let batch_size = rows;
        ensure!(
            pids.size1()? == batch_size,
            "expect {} labels, but get {}",
            batch_size,
            pids.size1()?
        );
        let device = dists.device();

        let masks = PairMasks::new(pids, device);
        let losses = match self.kind {
            LossKind::BatchHard => self.batch_hard(dists, &masks),
            LossKind::BatchAll => self.batch_all(dists, &masks),
            LossKind::LiftedStructured => self.lifted_structured(dists, &masks),
        };

        let EmbeddingStats {
            top1,
            precision_at_k,
            topk_is_same,
            positive_dists,
            negative_dists,
        } = tch::no_grad(|| self.embedding_stats(dists, &masks));

        Ok(TripletLossOutput {
            losses,
            top1,
            precision_at_k,
            topk_is_same,
            positive_dists,
            negative_dists,
        })
    }

    fn batch_hard(&self, dists: &Tensor, masks: &PairMasks) -> Tensor {
        let (furthest_positive, _) =
            (dists * masks.positive.to_kind(Kind::Float)).max_dim(1, false);
        let (closest_negative, _) = dists
            .masked_fill(&masks.same, f64::INFINITY)
            .min_dim(1, false);
        self.margin.apply(&(furthest_positive - closest_negative))
    }

    fn batch_all(&self, dists: &Tensor, masks: &PairMasks) -> Tensor {
        // diff[a, p, n] = d(a, p) - d(a, n)
        let diff = dists.unsqueeze(2) - dists.unsqueeze(1);
        let valid = masks
            .positive
            .unsqueeze(2)
            .logical_and(&masks.negative.unsqueeze(1))
            .to_kind(Kind::Float);
        let pair_losses = self.margin.apply(&diff) * &valid;
        let num_pairs = valid
            .sum_dim_intlist(&[1, 2], false, Kind::Float)
            .clamp_min(1.0);
        pair_losses.sum_dim_intlist(&[1, 2], false, Kind::Float) / num_pairs
    }

    fn lifted_structured(&self, dists: &Tensor, masks: &PairMasks) -> Tensor {
        let has_positive = masks.positive.any_dim(1, false);

        let positive_term = dists
            .masked_fill(&masks.positive.logical_not(), EXCLUDED_LOGIT)
            .logsumexp(&[1], false)
            .masked_fill(&has_positive.logical_not(), 0.0);
        let negative_term = -(-dists)
            .masked_fill(&masks.negative.logical_not(), EXCLUDED_LOGIT)
            .logsumexp(&[1], false);

        self.margin.apply(&(positive_term - negative_term))
    }

    fn embedding_stats(&self, dists: &Tensor, masks: &PairMasks) -> EmbeddingStats {
        let batch_size = dists.size()[0];
        let k = self.precision_at_k.min(batch_size - 1).max(1);

        // self is never a neighbour
        let (_, neighbours) = dists
            .masked_fill(&masks.diagonal, f64::INFINITY)
            .topk(k, 1, false, true);
        let topk_is_same = masks.same.gather(1, &neighbours, false);
        let topk_is_same_f = topk_is_same.to_kind(Kind::Float);

        EmbeddingStats {
            top1: topk_is_same_f.select(1, 0).mean(Kind::Float),
            precision_at_k: topk_is_same_f.mean(Kind::Float),
            topk_is_same,
            positive_dists: dists.detach().masked_select(&masks.positive),
            negative_dists: dists.detach().masked_select(&masks.negative),
        }
    }
}

#[derive(Debug)]
struct EmbeddingStats {
    top1: Tensor,
    precision_at_k: Tensor,
    topk_is_same: Tensor,
    positive_dists: Tensor,
    negative_dists: Tensor,
}

/// Boolean `[B, B]` masks derived from identity labels.
#[derive(Debug)]
struct PairMasks {
    diagonal: Tensor,
    same: Tensor,
    positive: Tensor,
    negative: Tensor,
}

impl PairMasks {
    fn new(pids: &Tensor, device: Device) -> Self {
        let batch_size = pids.size()[0];
        let pids = pids.to_device(device);
        let diagonal = Tensor::eye(batch_size, (Kind::Bool, device));
        let same = pids.unsqueeze(1).eq_tensor(&pids.unsqueeze(0));
        let positive = same.logical_and(&diagonal.logical_not());
        let negative = same.logical_not();

        Self {
            diagonal,
            same,
            positive,
            negative,
        }
    }
}

#[derive(Debug, TensorLike)]
pub struct TripletLossOutput {
    /// Per-anchor losses `[B]`.
    pub losses: Tensor,
    /// Fraction of anchors whose nearest neighbour shares the identity.
    pub top1: Tensor,
    /// Fraction of same-identity neighbours among the top k.
    pub precision_at_k: Tensor,
    /// `[B, k]` booleans telling whether each of the top k neighbours shares the identity.
    pub topk_is_same: Tensor,
    /// Flattened distances of positive pairs.
    pub positive_dists: Tensor,
    /// Flattened distances of negative pairs.
    pub negative_dists: Tensor,
}

impl TripletLossOutput {
    pub fn mean_loss(&self) -> Tensor {
        self.losses.mean(Kind::Float)
    }

    /// Copy of the output cut off from the autograd graph.
    pub fn detach(&self) -> Self {
        Self {
            losses: self.losses.detach(),
            top1: self.top1.detach(),
            precision_at_k: self.precision_at_k.detach(),
            topk_is_same: self.topk_is_same.detach(),
            positive_dists: self.positive_dists.detach(),
            negative_dists: self.negative_dists.detach(),
        }
    }

    /// The number of anchors with loss above the activity threshold.
    pub fn num_active(&self) -> i64 {
        i64::from(
            self.losses
                .detach()
                .gt(ACTIVE_LOSS_THRESHOLD)
                .sum(Kind::Int64),
        )
    }
}
