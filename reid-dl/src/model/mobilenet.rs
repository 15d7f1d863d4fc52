//! The MobileNet V2 feature extractor without the classifier.

use crate::common::*;

/// (expansion ratio, output channels, repeats, stride) of each inverted residual stage.
const INVERTED_RESIDUAL_SETTINGS: [(i64, i64, i64, i64); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

const STEM_CHANNELS: i64 = 32;
const FEATURE_CHANNELS: i64 = 1280;

/// Conv, batch norm and ReLU6.
fn conv_bn_relu6(
    path: &nn::Path,
    c_in: i64,
    c_out: i64,
    ksize: i64,
    stride: i64,
    groups: i64,
) -> nn::SequentialT {
    let conv_config = nn::ConvConfig {
        stride,
        padding: (ksize - 1) / 2,
        groups,
        bias: false,
        ..Default::default()
    };
    nn::seq_t()
        .add(nn::conv2d(path / 0, c_in, c_out, ksize, conv_config))
        .add(nn::batch_norm2d(path / 1, c_out, Default::default()))
        .add_fn(|xs| xs.relu().clamp_max(6.0))
}

fn inverted_residual(
    path: &nn::Path,
    c_in: i64,
    c_out: i64,
    stride: i64,
    expand_ratio: i64,
) -> nn::FuncT<'static> {
    let path = path / "conv";
    let c_hidden = expand_ratio * c_in;
    let no_bias = nn::ConvConfig {
        bias: false,
        ..Default::default()
    };

    let mut index = 0;
    let mut conv = nn::seq_t();
    if expand_ratio > 1 {
        conv = conv.add(conv_bn_relu6(&(&path / index), c_in, c_hidden, 1, 1, 1));
        index += 1;
    }
    let conv = conv
        .add(conv_bn_relu6(
            &(&path / index),
            c_hidden,
            c_hidden,
            3,
            stride,
            c_hidden,
        ))
        .add(nn::conv2d(&path / (index + 1), c_hidden, c_out, 1, no_bias))
        .add(nn::batch_norm2d(&path / (index + 2), c_out, Default::default()));

    let residual = stride == 1 && c_in == c_out;
    nn::func_t(move |xs, train| {
        let ys = xs.apply_t(&conv, train);
        if residual {
            xs + ys
        } else {
            ys
        }
    })
}

/// Build MobileNet V2 features followed by global average pooling, giving `[B, 1280]` outputs.
///
/// Variables live under `features`, matching the torchvision layout.
pub fn mobilenet_v2_features(path: &nn::Path) -> nn::FuncT<'static> {
    let features_path = path / "features";

    let mut features = nn::seq_t().add(conv_bn_relu6(
        &(&features_path / 0),
        3,
        STEM_CHANNELS,
        3,
        2,
        1,
    ));

    let mut c_in = STEM_CHANNELS;
    let mut layer_index = 1;
    for &(expand_ratio, c_out, repeats, stride) in INVERTED_RESIDUAL_SETTINGS.iter() {
        for repeat in 0..repeats {
            let stride = if repeat == 0 { stride } else { 1 };
            features = features.add(inverted_residual(
                &(&features_path / layer_index),
                c_in,
                c_out,
                stride,
                expand_ratio,
            ));
            c_in = c_out;
            layer_index += 1;
        }
    }
    let features = features.add(conv_bn_relu6(
        &(&features_path / layer_index),
        c_in,
        FEATURE_CHANNELS,
        1,
        1,
        1,
    ));

    nn::func_t(move |xs, train| {
        xs.apply_t(&features, train)
            .mean_dim(&[2, 3], false, Kind::Float)
    })
}
