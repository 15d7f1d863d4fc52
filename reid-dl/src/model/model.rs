use super::{BackboneKind, EmbeddingHead, HeadKind, HeadOutput};
use crate::common::*;

/// The channel means of ImageNet images in `[0, 1]` scale.
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// The channel standard deviations of ImageNet images in `[0, 1]` scale.
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReidModelInit {
    pub backbone: BackboneKind,
    pub head: HeadKind,
    pub embedding_dim: usize,
}

impl ReidModelInit {
    /// Build the model. The backbone is created at `path` and the head under `path / "head"`.
    pub fn build<'p, P>(self, path: P) -> Result<ReidModel>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            backbone: backbone_kind,
            head: head_kind,
            embedding_dim,
        } = self;

        let backbone = backbone_kind.build(path);
        let head = head_kind.build(
            &(path / "head"),
            backbone_kind.feature_dim(),
            embedding_dim as i64,
        )?;

        let device = path.device();
        let mean = Tensor::of_slice(&IMAGENET_MEAN)
            .view([1, 3, 1, 1])
            .to_device(device);
        let std = Tensor::of_slice(&IMAGENET_STD)
            .view([1, 3, 1, 1])
            .to_device(device);

        Ok(ReidModel {
            backbone,
            head,
            mean,
            std,
        })
    }
}

#[derive(Debug)]
pub struct ReidModel {
    backbone: Box<dyn ModuleT>,
    head: EmbeddingHead,
    mean: Tensor,
    std: Tensor,
}

impl ReidModel {
    /// Map `[B, 3, H, W]` images in `[0, 1]` to embeddings.
    pub fn forward_t(&self, images: &Tensor, train: bool) -> Result<HeadOutput> {
        ensure!(
            images.dim() == 4,
            "expect a [batch, 3, height, width] input, but get shape {:?}",
            images.size()
        );
        let (_batch_size, channels, _height, _width) = images.size4()?;
        ensure!(
            channels == 3,
            "channel size must be 3, but get {}",
            channels
        );

        let xs = (images - &self.mean) / &self.std;
        let features = self.backbone.forward_t(&xs, train);
        ensure!(
            features.dim() == 2,
            "the backbone yields non-pooled features of shape {:?}",
            features.size()
        );

        Ok(self.head.forward_t(&features, train))
    }
}
