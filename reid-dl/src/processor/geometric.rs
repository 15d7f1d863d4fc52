//! Random geometric distortion.

use super::{photometric::sample_range, sample_some_of};
use crate::common::*;

/// Perspective corner offsets are capped below half of the image side.
const MAX_CORNER_OFFSET: f64 = 0.45;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeometricAugmentInit {
    /// At most this many distortions are applied to each image.
    pub max_augmenters: usize,
    /// The probability to mirror horizontally.
    pub flip_prob: R64,
    /// The range of the standard deviation of perspective corner offsets, relative to the image size.
    pub perspective_scale: (R64, R64),
    /// The range of affine scaling.
    pub affine_scale: (R64, R64),
    /// The maximum affine rotation in degrees.
    pub rotate_degrees: R64,
    /// The maximum affine translation relative to the image size.
    pub translation: R64,
    /// The range of the cropped ratio on each side.
    pub crop_percent: (R64, R64),
    /// The probability that a coarse pixel turns black.
    pub pepper_prob: R64,
    /// The size of the coarse mask relative to the image size.
    pub pepper_size_percent: R64,
}

impl Default for GeometricAugmentInit {
    fn default() -> Self {
        Self {
            max_augmenters: 5,
            flip_prob: r64(0.5),
            perspective_scale: (r64(0.0), r64(0.075)),
            affine_scale: (r64(0.8), r64(1.0)),
            rotate_degrees: r64(5.0),
            translation: r64(0.1),
            crop_percent: (r64(0.0), r64(0.125)),
            pepper_prob: r64(0.01),
            pepper_size_percent: r64(0.1),
        }
    }
}

impl GeometricAugmentInit {
    pub fn build(self) -> Result<GeometricAugment> {
        let Self {
            max_augmenters,
            flip_prob,
            perspective_scale,
            affine_scale,
            rotate_degrees,
            translation,
            crop_percent,
            pepper_prob,
            pepper_size_percent,
        } = self;

        let check_range = |name: &str, (lo, up): (R64, R64)| -> Result<(f64, f64)> {
            ensure!(lo >= 0.0, "{} min must be non-negative", name);
            ensure!(lo <= up, "{} min must not exceed {} max", name, name);
            Ok((lo.raw(), up.raw()))
        };
        let check_prob = |name: &str, prob: R64| -> Result<f64> {
            ensure!(
                (0.0..=1.0).contains(&prob.raw()),
                "{} must be in range [0, 1]",
                name
            );
            Ok(prob.raw())
        };

        let affine_scale = check_range("affine_scale", affine_scale)?;
        ensure!(affine_scale.0 > 0.0, "affine_scale min must be positive");
        let crop_percent = check_range("crop_percent", crop_percent)?;
        ensure!(crop_percent.1 < 0.5, "crop_percent must be less than 0.5");
        ensure!(rotate_degrees >= 0.0, "rotate_degrees must be non-negative");
        ensure!(translation >= 0.0, "translation must be non-negative");
        ensure!(
            pepper_size_percent > 0.0 && pepper_size_percent <= 1.0,
            "pepper_size_percent must be in range (0, 1]"
        );

        Ok(GeometricAugment {
            max_augmenters,
            flip_prob: check_prob("flip_prob", flip_prob)?,
            perspective_scale: check_range("perspective_scale", perspective_scale)?,
            affine_scale,
            rotate_radians: rotate_degrees.raw().to_radians(),
            translation: translation.raw(),
            crop_percent,
            pepper_prob: check_prob("pepper_prob", pepper_prob)?,
            pepper_size_percent: pepper_size_percent.raw(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
enum GeometricOp {
    Flip,
    Perspective,
    Affine,
    Crop,
    CoarsePepper,
}

#[derive(Debug, Clone)]
pub struct GeometricAugment {
    max_augmenters: usize,
    flip_prob: f64,
    perspective_scale: (f64, f64),
    affine_scale: (f64, f64),
    rotate_radians: f64,
    translation: f64,
    crop_percent: (f64, f64),
    pepper_prob: f64,
    pepper_size_percent: f64,
}

impl GeometricAugment {
    /// Apply a random subset of flip, perspective, affine, crop and coarse pepper, in that order,
    /// to a `[C, H, W]` float image. The image size is kept.
    pub fn forward<R>(&self, image: &Tensor, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        use strum::IntoEnumIterator;

        tch::no_grad(|| {
            let _ = image.size3()?;
            let ops: Vec<_> = GeometricOp::iter().collect();
            let selected = sample_some_of(rng, ops.len(), self.max_augmenters);

            selected
                .into_iter()
                .try_fold(image.to_kind(Kind::Float), |image, index| {
                    self.apply(ops[index], &image, rng)
                })
        })
    }

    fn apply<R>(&self, op: GeometricOp, image: &Tensor, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let (_channels, height, width) = image.size3()?;

        let output = match op {
            GeometricOp::Flip => {
                if rng.gen_bool(self.flip_prob) {
                    image.f_hflip()?
                } else {
                    image.shallow_clone()
                }
            }
            GeometricOp::Perspective => {
                let sigma = sample_range(rng, self.perspective_scale);
                let transform = random_perspective(rng, sigma)?;
                warp(image, &transform)?
            }
            GeometricOp::Affine => {
                let scale = sample_range(rng, self.affine_scale);
                let angle = sample_range(rng, (-self.rotate_radians, self.rotate_radians));
                let shift_x = sample_range(rng, (-self.translation, self.translation));
                let shift_y = sample_range(rng, (-self.translation, self.translation));
                let transform =
                    affine_transform(height, width, scale, angle, [shift_x, shift_y])?;
                warp(image, &transform)?
            }
            GeometricOp::Crop => {
                let [top, left, bottom, right] =
                    [(); 4].map(|()| sample_range(rng, self.crop_percent));
                image
                    .f_crop_by_ratio(top, left, 1.0 - bottom, 1.0 - right)?
                    .resize2d_exact(height, width)?
            }
            GeometricOp::CoarsePepper => {
                let mask = coarse_mask(
                    rng,
                    height,
                    width,
                    self.pepper_size_percent,
                    self.pepper_prob,
                )
                .to_device(image.device());
                image.masked_fill(&mask.unsqueeze(0), 0.0)
            }
        };

        Ok(output)
    }
}

/// Warp a `[C, H, W]` image. The transform maps normalized output coordinates
/// `(x, y)` in `[-1, 1]` to normalized input coordinates. Outside pixels are zeros.
pub fn warp(image: &Tensor, transform: &Matrix3<f64>) -> Result<Tensor> {
    let (channels, height, width) = image.size3()?;
    let device = image.device();

    // pixel centers in normalized coordinates
    let xs = ((Tensor::arange(width, (Kind::Float, device)) * 2.0 + 1.0) / width as f64 - 1.0)
        .view([1, width]);
    let ys = ((Tensor::arange(height, (Kind::Float, device)) * 2.0 + 1.0) / height as f64 - 1.0)
        .view([height, 1]);

    let m = |row: usize, col: usize| transform[(row, col)];
    let src_x = &xs * m(0, 0) + &ys * m(0, 1) + m(0, 2);
    let src_y = &xs * m(1, 0) + &ys * m(1, 1) + m(1, 2);
    let src_z = &xs * m(2, 0) + &ys * m(2, 1) + m(2, 2);
    let grid = Tensor::stack(&[src_x / &src_z, src_y / &src_z], 2).view([1, height, width, 2]);

    let output = image
        .to_kind(Kind::Float)
        .view([1, channels, height, width])
        // bilinear interpolation with zeros padding
        .f_grid_sampler(&grid, 0, 0, false)?
        .view([channels, height, width]);
    Ok(output)
}

/// The normalized output-to-input transform of scaling, rotation and translation about the image center.
pub fn affine_transform(
    height: i64,
    width: i64,
    scale: f64,
    angle: f64,
    [shift_x, shift_y]: [f64; 2],
) -> Result<Matrix3<f64>> {
    let (width, height) = (width as f64, height as f64);
    let (sin, cos) = angle.sin_cos();

    #[rustfmt::skip]
    let forward = {
        let scaling = Matrix3::new(
            scale, 0.0, 0.0,
            0.0, scale, 0.0,
            0.0, 0.0, 1.0,
        );
        let rotation = Matrix3::new(
            cos, -sin, 0.0,
            sin, cos, 0.0,
            0.0, 0.0, 1.0,
        );
        let translation = Matrix3::new(
            1.0, 0.0, shift_x * width,
            0.0, 1.0, shift_y * height,
            0.0, 0.0, 1.0,
        );
        translation * rotation * scaling
    };

    // from normalized to centered pixel coordinates
    let to_pixel = Matrix3::new(width / 2.0, 0.0, 0.0, 0.0, height / 2.0, 0.0, 0.0, 0.0, 1.0);
    let inverse = forward
        .try_inverse()
        .ok_or_else(|| format_err!("the affine transform is singular"))?;
    let to_normalized = to_pixel
        .try_inverse()
        .ok_or_else(|| format_err!("the image is empty"))?;

    Ok(to_normalized * inverse * to_pixel)
}

/// Sample a perspective transform mapping the output frame onto a quadrilateral whose
/// corners are pulled inward by `|N(0, sigma)|` of the image size.
pub fn random_perspective<R>(rng: &mut R, sigma: f64) -> Result<Matrix3<f64>>
where
    R: Rng + ?Sized,
{
    let mut offset = || {
        let normal: f64 = rng.sample(StandardNormal);
        (normal * sigma).abs().min(MAX_CORNER_OFFSET) * 2.0
    };

    let targets = [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]];
    let sources = [
        [-1.0 + offset(), -1.0 + offset()],
        [1.0 - offset(), -1.0 + offset()],
        [1.0 - offset(), 1.0 - offset()],
        [-1.0 + offset(), 1.0 - offset()],
    ];
    solve_homography(&targets, &sources)
}

/// Solve the homography mapping each `from` point to the `to` point.
pub fn solve_homography(from: &[[f64; 2]; 4], to: &[[f64; 2]; 4]) -> Result<Matrix3<f64>> {
    let mut lhs = SMatrix::<f64, 8, 8>::zeros();
    let mut rhs = SVector::<f64, 8>::zeros();

    for (index, (&[u, v], &[x, y])) in from.iter().zip(to.iter()).enumerate() {
        let row = index * 2;
        let coefs_x = [u, v, 1.0, 0.0, 0.0, 0.0, -u * x, -v * x];
        let coefs_y = [0.0, 0.0, 0.0, u, v, 1.0, -u * y, -v * y];
        for col in 0..8 {
            lhs[(row, col)] = coefs_x[col];
            lhs[(row + 1, col)] = coefs_y[col];
        }
        rhs[row] = x;
        rhs[row + 1] = y;
    }

    let h = lhs
        .lu()
        .solve(&rhs)
        .ok_or_else(|| format_err!("degenerate point correspondences"))?;
    Ok(Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0))
}

/// A `[H, W]` boolean mask of coarse blocks, each set with probability `prob`.
fn coarse_mask<R>(rng: &mut R, height: i64, width: i64, size_percent: f64, prob: f64) -> Tensor
where
    R: Rng + ?Sized,
{
    let coarse_h = ((height as f64 * size_percent).round() as i64).max(1);
    let coarse_w = ((width as f64 * size_percent).round() as i64).max(1);

    let coarse: Vec<bool> = (0..(coarse_h * coarse_w))
        .map(|_| rng.gen_bool(prob))
        .collect();
    let coarse = Tensor::of_slice(&coarse).view([coarse_h, coarse_w]);

    // nearest upsampling
    let rows: Vec<i64> = (0..height).map(|row| row * coarse_h / height).collect();
    let cols: Vec<i64> = (0..width).map(|col| col * coarse_w / width).collect();
    coarse
        .index_select(0, &Tensor::of_slice(&rows))
        .index_select(1, &Tensor::of_slice(&cols))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_abs_diff(lhs: &Tensor, rhs: &Tensor) -> f64 {
        f64::from((lhs - rhs).abs().max())
    }

    #[test]
    fn identity_warp_keeps_image() -> Result<()> {
        let image = Tensor::rand(&[3, 16, 8], (Kind::Float, Device::Cpu));
        let output = warp(&image, &Matrix3::identity())?;
        assert_abs_diff_eq!(max_abs_diff(&output, &image), 0.0, epsilon = 1e-5);

        let transform = affine_transform(16, 8, 1.0, 0.0, [0.0, 0.0])?;
        assert_abs_diff_eq!(
            (transform - Matrix3::identity()).abs().max(),
            0.0,
            epsilon = 1e-12
        );
        Ok(())
    }

    #[test]
    fn affine_translation_shifts_pixels() -> Result<()> {
        let image = Tensor::zeros(&[1, 8, 8], (Kind::Float, Device::Cpu));
        let _ = image.i((.., 2, 2)).fill_(1.0);

        // shift right and down by 1/8 of the image, i.e. one pixel
        let transform = affine_transform(8, 8, 1.0, 0.0, [0.125, 0.125])?;
        let output = warp(&image, &transform)?;
        assert_abs_diff_eq!(output.double_value(&[0, 3, 3]), 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(output.double_value(&[0, 2, 2]), 0.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn homography_maps_corners() -> Result<()> {
        let from = [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]];
        let to = [[-0.8, -0.9], [0.9, -0.7], [0.85, 0.95], [-0.9, 0.8]];
        let h = solve_homography(&from, &to)?;

        for (&[u, v], &[x, y]) in from.iter().zip(to.iter()) {
            let p = h * nalgebra::Vector3::new(u, v, 1.0);
            assert_abs_diff_eq!(p[0] / p[2], x, epsilon = 1e-9);
            assert_abs_diff_eq!(p[1] / p[2], y, epsilon = 1e-9);
        }

        let degenerate = [[0.0, 0.0]; 4];
        assert!(solve_homography(&from, &degenerate).is_err());
        Ok(())
    }

    #[test]
    fn random_perspective_pulls_corners_inward() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(8);

        let identity = random_perspective(&mut rng, 0.0)?;
        assert_abs_diff_eq!(identity, Matrix3::identity(), epsilon = 1e-9);

        let corners = [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]];
        let mut max_offset: f64 = 0.0;
        for _ in 0..200 {
            let transform = random_perspective(&mut rng, 0.075)?;
            for &[u, v] in &corners {
                let mapped = transform * nalgebra::Vector3::new(u, v, 1.0);
                let (x, y) = (mapped[0] / mapped[2], mapped[1] / mapped[2]);
                let (dx, dy) = ((x - u) * -u, (y - v) * -v);
                assert!(dx >= -1e-9 && dy >= -1e-9, "corner ({}, {}) moved outward", u, v);
                assert!(dx <= 2.0 * MAX_CORNER_OFFSET + 1e-9);
                assert!(dy <= 2.0 * MAX_CORNER_OFFSET + 1e-9);
                max_offset = max_offset.max(dx).max(dy);
            }
        }
        assert!(max_offset > 0.0);
        Ok(())
    }

    #[test]
    fn coarse_mask_blocks() {
        let mut rng = StdRng::seed_from_u64(3);
        let mask = coarse_mask(&mut rng, 20, 10, 0.1, 1.0);
        assert_eq!(mask.size(), vec![20, 10]);
        assert!(bool::from(mask.all()));

        let mask = coarse_mask(&mut rng, 20, 10, 0.1, 0.0);
        assert!(!bool::from(mask.any()));
    }

    #[test]
    fn keeps_shape() -> Result<()> {
        let augment = GeometricAugmentInit::default().build()?;
        let mut rng = StdRng::seed_from_u64(5);

        for _ in 0..20 {
            let image = Tensor::rand(&[3, 64, 32], (Kind::Float, Device::Cpu));
            let output = augment.forward(&image, &mut rng)?;
            assert_eq!(output.size(), vec![3, 64, 32]);
            assert!(f64::from(output.min()) >= 0.0);
            assert!(f64::from(output.max()) <= 1.0 + 1e-5);
        }
        Ok(())
    }

    #[test]
    fn reject_invalid_config() {
        let init = GeometricAugmentInit {
            flip_prob: r64(1.5),
            ..Default::default()
        };
        assert!(init.build().is_err());

        let init = GeometricAugmentInit {
            crop_percent: (r64(0.0), r64(0.6)),
            ..Default::default()
        };
        assert!(init.build().is_err());
    }
}
