use crate::common::*;

const HIDDEN_DIM: i64 = 1024;

/// The registry of embedding heads.
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
pub enum HeadKind {
    /// A single linear projection.
    Direct,
    /// Linear 1024, batch norm and ReLU, followed by the linear projection.
    Fc1024,
    /// Like [HeadKind::Fc1024] with L2-normalized embeddings.
    Fc1024Normalize,
}

impl HeadKind {
    pub fn build(&self, path: &nn::Path, in_dim: i64, embedding_dim: i64) -> Result<EmbeddingHead> {
        ensure!(in_dim > 0, "in_dim must be positive");
        ensure!(embedding_dim > 0, "embedding_dim must be positive");

        let hidden = match self {
            Self::Direct => None,
            Self::Fc1024 | Self::Fc1024Normalize => {
                let linear = nn::linear(path / "fc", in_dim, HIDDEN_DIM, Default::default());
                let norm = nn::batch_norm1d(path / "bn", HIDDEN_DIM, Default::default());
                Some((linear, norm))
            }
        };
        let proj_in = if hidden.is_some() { HIDDEN_DIM } else { in_dim };
        let proj = nn::linear(path / "emb", proj_in, embedding_dim, Default::default());

        Ok(EmbeddingHead {
            hidden,
            proj,
            normalize: matches!(self, Self::Fc1024Normalize),
        })
    }
}

impl Default for HeadKind {
    fn default() -> Self {
        Self::Fc1024
    }
}

#[derive(Debug)]
pub struct EmbeddingHead {
    hidden: Option<(nn::Linear, nn::BatchNorm)>,
    proj: nn::Linear,
    normalize: bool,
}

impl EmbeddingHead {
    pub fn forward_t(&self, features: &Tensor, train: bool) -> HeadOutput {
        let xs = match &self.hidden {
            Some((linear, norm)) => features.apply(linear).apply_t(norm, train).relu(),
            None => features.shallow_clone(),
        };
        let emb_raw = xs.apply(&self.proj);

        let emb = if self.normalize {
            let norm = (&emb_raw * &emb_raw)
                .sum_dim_intlist(&[1], true, Kind::Float)
                .sqrt()
                .clamp_min(1e-12);
            &emb_raw / norm
        } else {
            emb_raw.shallow_clone()
        };

        HeadOutput { emb, emb_raw }
    }
}

#[derive(Debug, TensorLike)]
pub struct HeadOutput {
    /// The embeddings used by the loss.
    pub emb: Tensor,
    /// The embeddings before normalization.
    pub emb_raw: Tensor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn head_shapes() -> Result<()> {
        let features = Tensor::randn(&[6, 32], (Kind::Float, Device::Cpu));

        for kind in HeadKind::iter() {
            let vs = nn::VarStore::new(Device::Cpu);
            let head = kind.build(&vs.root(), 32, 8)?;
            let HeadOutput { emb, emb_raw } = head.forward_t(&features, true);
            assert_eq!(emb.size(), vec![6, 8]);
            assert_eq!(emb_raw.size(), vec![6, 8]);

            if kind == HeadKind::Fc1024Normalize {
                let lengths: Vec<f32> = emb.norm_scalaropt_dim(2, &[1], false).into();
                lengths
                    .into_iter()
                    .for_each(|length| assert_abs_diff_eq!(length, 1.0, epsilon = 1e-5));
            }
        }
        Ok(())
    }

    #[test]
    fn parse_head_names() -> Result<()> {
        assert_eq!("fc1024".parse::<HeadKind>()?, HeadKind::Fc1024);
        assert_eq!(
            "fc1024_normalize".parse::<HeadKind>()?,
            HeadKind::Fc1024Normalize
        );
        assert_eq!(HeadKind::Direct.to_string(), "direct");
        Ok(())
    }
}
