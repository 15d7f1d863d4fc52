use super::mobilenet::mobilenet_v2_features;
use crate::common::*;
use tch::vision::resnet;

/// The constructor of a backbone, mapping images to `[B, C]` pooled features.
pub type BackboneFn = fn(&nn::Path) -> Box<dyn ModuleT>;

/// The registry of feature extractors.
///
/// Variables are created at the given path, following the naming of torchvision, so that
/// pretrained `.ot` weights can be loaded into the root of a var store.
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
pub enum BackboneKind {
    Resnet18,
    Resnet34,
    Resnet50,
    Resnet101,
    Resnet152,
    MobilenetV2,
}

impl BackboneKind {
    /// The channel size of the pooled features.
    pub fn feature_dim(&self) -> i64 {
        match self {
            Self::Resnet18 | Self::Resnet34 => 512,
            Self::Resnet50 | Self::Resnet101 | Self::Resnet152 => 2048,
            Self::MobilenetV2 => 1280,
        }
    }

    pub fn constructor(&self) -> BackboneFn {
        match self {
            Self::Resnet18 => |path| Box::new(resnet::resnet18_no_final_layer(path)),
            Self::Resnet34 => |path| Box::new(resnet::resnet34_no_final_layer(path)),
            Self::Resnet50 => |path| Box::new(resnet::resnet50_no_final_layer(path)),
            Self::Resnet101 => |path| Box::new(resnet::resnet101_no_final_layer(path)),
            Self::Resnet152 => |path| Box::new(resnet::resnet150_no_final_layer(path)),
            Self::MobilenetV2 => |path| Box::new(mobilenet_v2_features(path)),
        }
    }

    pub fn build(&self, path: &nn::Path) -> Box<dyn ModuleT> {
        (self.constructor())(path)
    }
}

impl Default for BackboneKind {
    fn default() -> Self {
        Self::Resnet50
    }
}
