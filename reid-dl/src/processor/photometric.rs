//! Random photometric distortion.

use super::sample_some_of;
use crate::common::*;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhotometricAugmentInit {
    /// At most this many distortions are applied to each image.
    pub max_augmenters: usize,
    /// The range of the Gaussian blur sigma in pixels.
    pub blur_sigma: (R64, R64),
    /// The range of the contrast factor around the mid gray.
    pub contrast: (R64, R64),
    /// The range of the weight of the grayscale image mixed into the image.
    pub grayscale_alpha: (R64, R64),
    /// The range of the multiplicative brightness factor.
    pub brightness: (R64, R64),
}

impl Default for PhotometricAugmentInit {
    fn default() -> Self {
        Self {
            max_augmenters: 3,
            blur_sigma: (r64(0.0), r64(1.0)),
            contrast: (r64(0.9), r64(1.1)),
            grayscale_alpha: (r64(0.0), r64(0.2)),
            brightness: (r64(0.9), r64(1.1)),
        }
    }
}

impl PhotometricAugmentInit {
    pub fn build(self) -> Result<PhotometricAugment> {
        let Self {
            max_augmenters,
            blur_sigma,
            contrast,
            grayscale_alpha,
            brightness,
        } = self;

        let check_range = |name: &str, (lo, up): (R64, R64)| -> Result<(f64, f64)> {
            ensure!(lo >= 0.0, "{} min must be non-negative", name);
            ensure!(lo <= up, "{} min must not exceed {} max", name, name);
            Ok((lo.raw(), up.raw()))
        };
        let grayscale_alpha = check_range("grayscale_alpha", grayscale_alpha)?;
        ensure!(
            grayscale_alpha.1 <= 1.0,
            "grayscale_alpha must not exceed 1"
        );

        Ok(PhotometricAugment {
            max_augmenters,
            blur_sigma: check_range("blur_sigma", blur_sigma)?,
            contrast: check_range("contrast", contrast)?,
            grayscale_alpha,
            brightness: check_range("brightness", brightness)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
enum PhotometricOp {
    Blur,
    Contrast,
    Grayscale,
    Brightness,
}

#[derive(Debug, Clone)]
pub struct PhotometricAugment {
    max_augmenters: usize,
    blur_sigma: (f64, f64),
    contrast: (f64, f64),
    grayscale_alpha: (f64, f64),
    brightness: (f64, f64),
}

impl PhotometricAugment {
    /// Apply a random subset of blur, contrast, grayscale and brightness, in that order,
    /// to a `[3, H, W]` image in `[0, 1]`.
    pub fn forward<R>(&self, image: &Tensor, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        use strum::IntoEnumIterator;

        tch::no_grad(|| {
            let (channels, _height, _width) = image.size3()?;
            ensure!(
                channels == 3,
                "channel size must be 3, but get {}",
                channels
            );

            let ops: Vec<_> = PhotometricOp::iter().collect();
            let selected = sample_some_of(rng, ops.len(), self.max_augmenters);

            selected
                .into_iter()
                .try_fold(image.shallow_clone(), |image, index| {
                    self.apply(ops[index], &image, rng)
                })
        })
    }

    fn apply<R>(&self, op: PhotometricOp, image: &Tensor, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let output = match op {
            PhotometricOp::Blur => {
                let sigma = sample_range(rng, self.blur_sigma);
                image.f_gaussian_blur(sigma)?
            }
            PhotometricOp::Contrast => {
                let alpha = sample_range(rng, self.contrast);
                ((image - 0.5) * alpha + 0.5).clamp(0.0, 1.0)
            }
            PhotometricOp::Grayscale => {
                let alpha = sample_range(rng, self.grayscale_alpha);
                let gray = image.f_rgb_to_grayscale()?;
                image * (1.0 - alpha) + gray * alpha
            }
            PhotometricOp::Brightness => {
                let factor = sample_range(rng, self.brightness);
                (image * factor).clamp(0.0, 1.0)
            }
        };
        Ok(output)
    }
}

pub(crate) fn sample_range<R>(rng: &mut R, (lo, up): (f64, f64)) -> f64
where
    R: Rng + ?Sized,
{
    if lo < up {
        rng.gen_range(lo..=up)
    } else {
        lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_shape_and_range() -> Result<()> {
        let augment = PhotometricAugmentInit::default().build()?;
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..20 {
            let image = Tensor::rand(&[3, 32, 16], (Kind::Float, Device::Cpu));
            let output = augment.forward(&image, &mut rng)?;
            assert_eq!(output.size(), vec![3, 32, 16]);
            assert!(f64::from(output.min()) >= 0.0);
            assert!(f64::from(output.max()) <= 1.0 + 1e-6);
        }
        Ok(())
    }

    #[test]
    fn fixed_contrast_and_brightness() -> Result<()> {
        let augment = PhotometricAugmentInit {
            contrast: (r64(2.0), r64(2.0)),
            brightness: (r64(0.5), r64(0.5)),
            ..Default::default()
        }
        .build()?;
        let mut rng = StdRng::seed_from_u64(0);
        let image = Tensor::of_slice(&[0.25f32, 0.5, 0.75]).view([3, 1, 1]);

        let contrast: Vec<f32> = augment
            .apply(PhotometricOp::Contrast, &image, &mut rng)?
            .reshape(&[-1])
            .into();
        assert_eq!(contrast, vec![0.0, 0.5, 1.0]);

        let brightness: Vec<f32> = augment
            .apply(PhotometricOp::Brightness, &image, &mut rng)?
            .reshape(&[-1])
            .into();
        assert_eq!(brightness, vec![0.125, 0.25, 0.375]);
        Ok(())
    }

    #[test]
    fn reject_invalid_ranges() {
        let init = PhotometricAugmentInit {
            contrast: (r64(1.1), r64(0.9)),
            ..Default::default()
        };
        assert!(init.build().is_err());

        let init = PhotometricAugmentInit {
            grayscale_alpha: (r64(0.0), r64(1.5)),
            ..Default::default()
        };
        assert!(init.build().is_err());
    }
}
