//! Wavelet denoising by Bayes shrink.

use crate::common::*;

/// The scale of the median absolute deviation to the noise standard deviation.
const MAD_TO_SIGMA: f64 = 0.6745;

/// Single-level 2D Haar wavelet coefficients.
#[derive(Debug, TensorLike)]
pub struct HaarCoefficients {
    /// The approximation band.
    pub approx: Tensor,
    pub horizontal: Tensor,
    pub vertical: Tensor,
    pub diagonal: Tensor,
}

impl HaarCoefficients {
    /// Decompose a `[H, W]` plane. Odd sizes are padded by replicating the last row or column.
    pub fn decompose(plane: &Tensor) -> Result<Self> {
        let (height, width) = plane.size2()?;
        ensure!(height > 0 && width > 0, "the plane is empty");

        let plane = plane.to_kind(Kind::Float);
        let plane = if height % 2 == 1 {
            Tensor::cat(&[&plane, &plane.i((height - 1)..height)], 0)
        } else {
            plane
        };
        let plane = if width % 2 == 1 {
            Tensor::cat(&[&plane, &plane.i((.., (width - 1)..width))], 1)
        } else {
            plane
        };
        let (height, width) = plane.size2()?;

        let blocks = plane.reshape(&[height / 2, 2, width / 2, 2]);
        let top_left = blocks.select(1, 0).select(2, 0);
        let top_right = blocks.select(1, 0).select(2, 1);
        let bottom_left = blocks.select(1, 1).select(2, 0);
        let bottom_right = blocks.select(1, 1).select(2, 1);

        let approx = (&top_left + &top_right + &bottom_left + &bottom_right) / 2.0;
        let horizontal = (&top_left + &top_right - &bottom_left - &bottom_right) / 2.0;
        let vertical = (&top_left - &top_right + &bottom_left - &bottom_right) / 2.0;
        let diagonal = (&top_left - &top_right - &bottom_left + &bottom_right) / 2.0;

        Ok(Self {
            approx,
            horizontal,
            vertical,
            diagonal,
        })
    }

    /// Reconstruct the `[2h, 2w]` plane.
    pub fn reconstruct(&self) -> Tensor {
        let Self {
            approx,
            horizontal,
            vertical,
            diagonal,
        } = self;
        let (half_h, half_w) = (approx.size()[0], approx.size()[1]);

        let top_left = (approx + horizontal + vertical + diagonal) / 2.0;
        let top_right = (approx + horizontal - vertical - diagonal) / 2.0;
        let bottom_left = (approx - horizontal + vertical - diagonal) / 2.0;
        let bottom_right = (approx - horizontal - vertical + diagonal) / 2.0;

        let top = Tensor::stack(&[top_left, top_right], 2);
        let bottom = Tensor::stack(&[bottom_left, bottom_right], 2);
        Tensor::stack(&[top, bottom], 1).reshape(&[half_h * 2, half_w * 2])
    }

    /// The Bayes shrink threshold over the four stacked bands.
    ///
    /// The noise variance is estimated from the diagonal band. If the estimated signal
    /// deviation vanishes, the maximum absolute coefficient is used instead.
    pub fn bayes_shrink_threshold(&self) -> Result<f64> {
        let sigma_noise = self.diagonal.abs().f_median_all()? / MAD_TO_SIGMA;
        let var_noise = sigma_noise.powi(2);

        let stacked = Tensor::stack(
            &[&self.approx, &self.horizontal, &self.vertical, &self.diagonal],
            0,
        );
        let var_observed = f64::from((&stacked * &stacked).sum(Kind::Double)) / 4.0;
        let sigma_signal = (var_observed - var_noise).max(0.0).sqrt();

        let threshold = if sigma_signal != 0.0 {
            var_noise / sigma_signal
        } else {
            f64::from(stacked.abs().max())
        };
        Ok(threshold)
    }

    /// Soft-threshold the detail bands, leaving the approximation band intact.
    pub fn shrink_details(&self, threshold: f64) -> Self {
        Self {
            approx: self.approx.shallow_clone(),
            horizontal: soft_threshold(&self.horizontal, threshold),
            vertical: soft_threshold(&self.vertical, threshold),
            diagonal: soft_threshold(&self.diagonal, threshold),
        }
    }
}

/// `sign(x) * max(|x| - threshold, 0)`
pub fn soft_threshold(xs: &Tensor, threshold: f64) -> Tensor {
    xs.sign() * (xs.abs() - threshold).clamp_min(0.0)
}

/// Per-channel Haar wavelet denoising of `[C, H, W]` float images.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaveletDenoise;

impl WaveletDenoise {
    pub fn forward(&self, image: &Tensor) -> Result<Tensor> {
        tch::no_grad(|| {
            let (channels, height, width) = image.size3()?;

            let planes: Vec<Tensor> = (0..channels)
                .map(|channel| -> Result<_> {
                    let coefs = HaarCoefficients::decompose(&image.select(0, channel))?;
                    let threshold = coefs.bayes_shrink_threshold()?;
                    let plane = coefs
                        .shrink_details(threshold)
                        .reconstruct()
                        .i((0..height, 0..width));
                    Ok(plane)
                })
                .try_collect()?;

            Ok(Tensor::stack(&planes, 0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_abs_diff(lhs: &Tensor, rhs: &Tensor) -> f64 {
        f64::from((lhs - rhs).abs().max())
    }

    #[test]
    fn haar_perfect_reconstruction() -> Result<()> {
        let plane = Tensor::rand(&[6, 8], (Kind::Float, Device::Cpu));
        let coefs = HaarCoefficients::decompose(&plane)?;
        assert_eq!(coefs.approx.size(), vec![3, 4]);
        assert_abs_diff_eq!(max_abs_diff(&coefs.reconstruct(), &plane), 0.0, epsilon = 1e-5);

        // odd sizes are padded
        let plane = Tensor::rand(&[5, 7], (Kind::Float, Device::Cpu));
        let coefs = HaarCoefficients::decompose(&plane)?;
        assert_eq!(coefs.approx.size(), vec![3, 4]);
        let reconstructed = coefs.reconstruct().i((0..5, 0..7));
        assert_abs_diff_eq!(max_abs_diff(&reconstructed, &plane), 0.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn haar_coefficients_of_a_block() -> Result<()> {
        let plane = Tensor::of_slice(&[1f32, 2.0, 3.0, 4.0]).view([2, 2]);
        let coefs = HaarCoefficients::decompose(&plane)?;
        assert_abs_diff_eq!(coefs.approx.double_value(&[0, 0]), 5.0, epsilon = 1e-6);
        assert_abs_diff_eq!(coefs.horizontal.double_value(&[0, 0]), -2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(coefs.vertical.double_value(&[0, 0]), -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(coefs.diagonal.double_value(&[0, 0]), 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn soft_threshold_shrinks_toward_zero() {
        let xs = Tensor::of_slice(&[-2f32, -0.5, 0.0, 0.5, 2.0]);
        let ys: Vec<f32> = soft_threshold(&xs, 1.0).into();
        assert_eq!(ys, vec![-1.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn degenerate_planes_have_zero_threshold() -> Result<()> {
        // no detail at all, so the noise estimate is zero
        let plane = Tensor::ones(&[4, 4], (Kind::Float, Device::Cpu)) * 0.5;
        let coefs = HaarCoefficients::decompose(&plane)?;
        assert_abs_diff_eq!(coefs.bayes_shrink_threshold()?, 0.0);

        // zero signal deviation falls back to the maximum coefficient, which is zero here
        let plane = Tensor::zeros(&[4, 4], (Kind::Float, Device::Cpu));
        let coefs = HaarCoefficients::decompose(&plane)?;
        assert_abs_diff_eq!(coefs.bayes_shrink_threshold()?, 0.0);
        Ok(())
    }

    #[test]
    fn denoise_reduces_noise() -> Result<()> {
        tch::manual_seed(1);
        let clean = Tensor::ones(&[3, 32, 16], (Kind::Float, Device::Cpu)) * 0.5;
        let noisy = &clean + Tensor::randn(&[3, 32, 16], (Kind::Float, Device::Cpu)) * 0.05;

        let denoised = WaveletDenoise.forward(&noisy)?;
        assert_eq!(denoised.size(), vec![3, 32, 16]);

        let error_before = f64::from((&noisy - &clean).square().mean(Kind::Float));
        let error_after = f64::from((&denoised - &clean).square().mean(Kind::Float));
        assert!(error_after < error_before);
        Ok(())
    }
}
