//! Image loading with crop, flip and denoise augmentation.

use super::{
    GeometricAugment, GeometricAugmentInit, PhotometricAugment, PhotometricAugmentInit,
    WaveletDenoise,
};
use crate::common::*;

/// The denoise and augmentation pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DenoiseAugmentInit {
    pub photometric: PhotometricAugmentInit,
    pub geometric: GeometricAugmentInit,
}

impl DenoiseAugmentInit {
    pub fn build(self) -> Result<DenoiseAugment> {
        let Self {
            photometric,
            geometric,
        } = self;

        Ok(DenoiseAugment {
            denoise: WaveletDenoise,
            photometric: photometric.build()?,
            geometric: geometric.build()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DenoiseAugment {
    denoise: WaveletDenoise,
    photometric: PhotometricAugment,
    geometric: GeometricAugment,
}

impl DenoiseAugment {
    /// Denoise a `[3, H, W]` image in `[0, 1]`, then distort it photometrically and geometrically.
    pub fn forward<R>(&self, image: &Tensor, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        tch::no_grad(|| {
            let denoised = self.denoise.forward(image)?;
            // back to 8-bit precision
            let denoised = (denoised.clamp(0.0, 1.0) * 255.0).round() / 255.0;
            let distorted = self.photometric.forward(&denoised, rng)?;
            let distorted = self.geometric.forward(&distorted, rng)?;
            Ok(distorted.clamp(0.0, 1.0))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageLoaderInit {
    /// The network input size in `[height, width]`.
    pub net_input_size: [usize; 2],
    /// The size in `[height, width]` before random cropping.
    pub pre_crop_size: [usize; 2],
    pub flip_augment: bool,
    pub crop_augment: bool,
    /// Takes precedence over flip and crop augmentation if set.
    pub denoise_augment: Option<DenoiseAugmentInit>,
}

impl ImageLoaderInit {
    pub fn build(self) -> Result<ImageLoader> {
        let Self {
            net_input_size: [net_h, net_w],
            pre_crop_size: [pre_h, pre_w],
            flip_augment,
            crop_augment,
            denoise_augment,
        } = self;

        ensure!(
            net_h > 0 && net_w > 0,
            "the network input size must be positive"
        );
        if crop_augment && denoise_augment.is_none() {
            ensure!(
                pre_h >= net_h && pre_w >= net_w,
                "the pre-crop size {}x{} is smaller than the network input size {}x{}",
                pre_h,
                pre_w,
                net_h,
                net_w
            );
        }

        let denoise_augment = denoise_augment.map(|init| init.build()).transpose()?;

        Ok(ImageLoader {
            net_size: [net_h as i64, net_w as i64],
            pre_crop_size: [pre_h as i64, pre_w as i64],
            flip_augment,
            crop_augment,
            denoise_augment,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ImageLoader {
    net_size: [i64; 2],
    pre_crop_size: [i64; 2],
    flip_augment: bool,
    crop_augment: bool,
    denoise_augment: Option<DenoiseAugment>,
}

impl ImageLoader {
    /// Load an image file into a `[3, H, W]` float tensor in `[0, 1]` of the network input size.
    pub fn load<R>(&self, path: impl AsRef<Path>, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let image = load_rgb_image(path)?;
        self.process(&image, rng)
    }

    /// Resize and augment a `[3, H, W]` float image in `[0, 1]`.
    pub fn process<R>(&self, image: &Tensor, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let [net_h, net_w] = self.net_size;

        tch::no_grad(|| {
            if let Some(augment) = &self.denoise_augment {
                let resized = image.resize2d_exact(net_h, net_w)?;
                return augment.forward(&resized, rng);
            }

            let [resize_h, resize_w] = if self.crop_augment {
                self.pre_crop_size
            } else {
                self.net_size
            };
            let image = image.resize2d_exact(resize_h, resize_w)?;

            let image = if self.flip_augment && rng.gen_bool(0.5) {
                image.f_hflip()?
            } else {
                image
            };

            let image = if self.crop_augment {
                let top = rng.gen_range(0..=(resize_h - net_h));
                let left = rng.gen_range(0..=(resize_w - net_w));
                image.f_crop(top, left, net_h, net_w)?
            } else {
                image
            };

            Ok(image)
        })
    }
}

/// Decode an image file into a `[3, H, W]` float tensor in `[0, 1]`.
pub fn load_rgb_image(path: impl AsRef<Path>) -> Result<Tensor> {
    let path = path.as_ref();
    let image = vision::image::load(path)
        .with_context(|| format!("failed to load image {}", path.display()))?;

    let (channels, _height, _width) = image.size3()?;
    let image = match channels {
        1 => image.repeat(&[3, 1, 1]),
        3 => image,
        4 => image.i(0..3),
        _ => bail!(
            "unsupported channel size {} of image {}",
            channels,
            path.display()
        ),
    };

    Ok(image.to_kind(Kind::Float) / 255.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader_init() -> ImageLoaderInit {
        ImageLoaderInit {
            net_input_size: [64, 32],
            pre_crop_size: [80, 40],
            flip_augment: false,
            crop_augment: false,
            denoise_augment: None,
        }
    }

    #[test]
    fn output_sizes() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(9);
        let image = Tensor::rand(&[3, 120, 50], (Kind::Float, Device::Cpu));

        let plain = loader_init().build()?;
        assert_eq!(plain.process(&image, &mut rng)?.size(), vec![3, 64, 32]);

        let cropped = ImageLoaderInit {
            flip_augment: true,
            crop_augment: true,
            ..loader_init()
        }
        .build()?;
        for _ in 0..10 {
            assert_eq!(cropped.process(&image, &mut rng)?.size(), vec![3, 64, 32]);
        }

        let augmented = ImageLoaderInit {
            denoise_augment: Some(DenoiseAugmentInit::default()),
            ..loader_init()
        }
        .build()?;
        for _ in 0..5 {
            let output = augmented.process(&image, &mut rng)?;
            assert_eq!(output.size(), vec![3, 64, 32]);
            assert!(f64::from(output.min()) >= 0.0);
            assert!(f64::from(output.max()) <= 1.0);
        }
        Ok(())
    }

    #[test]
    fn flip_happens_about_half_of_the_time() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(10);
        let loader = ImageLoaderInit {
            flip_augment: true,
            ..loader_init()
        }
        .build()?;

        // the left half is black, the right half is white
        let image = Tensor::cat(
            &[
                Tensor::zeros(&[3, 64, 16], (Kind::Float, Device::Cpu)),
                Tensor::ones(&[3, 64, 16], (Kind::Float, Device::Cpu)),
            ],
            2,
        );
        let num_flipped = (0..200)
            .map(|_| loader.process(&image, &mut rng))
            .map_ok(|output| output.double_value(&[0, 0, 0]) > 0.5)
            .fold_ok(0, |count, flipped| count + flipped as usize)?;
        assert!((70..=130).contains(&num_flipped), "{}", num_flipped);
        Ok(())
    }

    #[test]
    fn reject_small_pre_crop_size() {
        let init = ImageLoaderInit {
            pre_crop_size: [32, 32],
            crop_augment: true,
            ..loader_init()
        };
        assert!(init.build().is_err());
    }
}
