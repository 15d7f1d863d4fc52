use crate::common::*;

/// Luma coefficients of the ITU-R BT.601 standard.
const GRAYSCALE_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];

pub trait TensorExt {
    fn is_empty(&self) -> bool;

    /// Resize a `[C, H, W]` or `[B, C, H, W]` image to the exact size, ignoring the aspect ratio.
    fn resize2d_exact(&self, new_height: i64, new_width: i64) -> Result<Tensor>;

    fn f_crop(&self, top: i64, left: i64, height: i64, width: i64) -> Result<Tensor>;

    fn f_crop_by_ratio(&self, top: f64, left: f64, bottom: f64, right: f64) -> Result<Tensor>;

    fn f_hflip(&self) -> Result<Tensor>;

    /// Convert RGB channels to a single luma channel, keeping the channel dimension.
    fn f_rgb_to_grayscale(&self) -> Result<Tensor>;

    /// Separable Gaussian blur on a `[C, H, W]` float image.
    fn f_gaussian_blur(&self, sigma: f64) -> Result<Tensor>;

    /// The median over all elements. Averages the two middle values on even counts.
    fn f_median_all(&self) -> Result<f64>;
}

impl TensorExt for Tensor {
    fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    fn resize2d_exact(&self, new_height: i64, new_width: i64) -> Result<Tensor> {
        tch::no_grad(|| match (self.kind(), self.size().as_slice()) {
            (Kind::Uint8, &[_n_channels, _height, _width]) => {
                let resized = vision::image::resize(self, new_width, new_height)?;
                Ok(resized)
            }
            (Kind::Float, &[_n_channels, _height, _width]) => {
                let resized = vision::image::resize(
                    &(self * 255.0).clamp(0.0, 255.0).to_kind(Kind::Uint8),
                    new_width,
                    new_height,
                )?
                .to_kind(Kind::Float)
                    / 255.0;
                Ok(resized)
            }
            (_, &[_n_channels, _height, _width]) => bail!("unsupported data kind"),
            (Kind::Float | Kind::Uint8, &[batch_size, _n_channels, _height, _width]) => {
                let resized_vec: Vec<_> = (0..batch_size)
                    .map(|index| self.select(0, index).resize2d_exact(new_height, new_width))
                    .try_collect()?;
                Ok(Tensor::stack(resized_vec.as_slice(), 0))
            }
            (_, &[_batch_size, _n_channels, _height, _width]) => bail!("unsupported data kind"),
            _ => bail!("invalid shape: expect three or four dimensions"),
        })
    }

    fn f_crop(&self, top: i64, left: i64, height: i64, width: i64) -> Result<Tensor> {
        let [orig_h, orig_w] = match self.size().as_slice() {
            &[_c, h, w] => [h, w],
            &[_b, _c, h, w] => [h, w],
            _ => bail!("input tensor must be either 3 or 4 dimensional"),
        };
        ensure!(
            top >= 0 && left >= 0 && height > 0 && width > 0,
            "invalid crop window top={}, left={}, height={}, width={}",
            top,
            left,
            height,
            width
        );
        ensure!(
            top + height <= orig_h && left + width <= orig_w,
            "crop window {}x{} at ({}, {}) exceeds image size {}x{}",
            height,
            width,
            top,
            left,
            orig_h,
            orig_w
        );

        let cropped = match self.dim() {
            3 => self.i((.., top..(top + height), left..(left + width))),
            4 => self.i((.., .., top..(top + height), left..(left + width))),
            _ => unreachable!(),
        };
        Ok(cropped)
    }

    fn f_crop_by_ratio(&self, top: f64, left: f64, bottom: f64, right: f64) -> Result<Tensor> {
        ensure!((0.0..=1.0).contains(&top), "invalid range");
        ensure!((0.0..=1.0).contains(&left), "invalid range");
        ensure!((0.0..=1.0).contains(&bottom), "invalid range");
        ensure!((0.0..=1.0).contains(&right), "invalid range");
        ensure!(left < right, "invalid range");
        ensure!(top < bottom, "invalid range");

        let [height, width] = match self.size().as_slice() {
            &[_c, h, w] => [h, w],
            &[_b, _c, h, w] => [h, w],
            _ => bail!("input tensor must be either 3 or 4 dimensional"),
        };
        let height = height as f64;
        let width = width as f64;

        let crop_t = (top * height) as i64;
        let crop_l = (left * width) as i64;
        let crop_b = ((bottom * height) as i64).max(crop_t + 1);
        let crop_r = ((right * width) as i64).max(crop_l + 1);

        self.f_crop(crop_t, crop_l, crop_b - crop_t, crop_r - crop_l)
    }

    fn f_hflip(&self) -> Result<Tensor> {
        ensure!(
            matches!(self.dim(), 3 | 4),
            "input tensor must be either 3 or 4 dimensional"
        );
        Ok(self.f_flip(&[-1])?)
    }

    fn f_rgb_to_grayscale(&self) -> Result<Tensor> {
        let channels = match self.size().as_slice() {
            &[c, _h, _w] => c,
            &[_b, c, _h, _w] => c,
            _ => bail!("input tensor must be either 3 or 4 dimensional"),
        };
        ensure!(
            channels == 3,
            "channel size must be 3, but get {}",
            channels
        );

        let weights = Tensor::of_slice(&GRAYSCALE_WEIGHTS)
            .to_device(self.device())
            .view([3, 1, 1]);
        let gray = (self.to_kind(Kind::Float) * weights).f_sum_dim_intlist(
            &[-3],
            true,
            Kind::Float,
        )?;
        Ok(gray)
    }

    fn f_gaussian_blur(&self, sigma: f64) -> Result<Tensor> {
        let (channels, height, width) = self.size3()?;
        ensure!(sigma >= 0.0, "sigma must be non-negative");

        let radius = ((3.0 * sigma).ceil() as i64).min(height - 1).min(width - 1);
        if sigma == 0.0 || radius <= 0 {
            return Ok(self.copy());
        }

        let kernel: Vec<f32> = {
            let weights: Vec<f64> = (-radius..=radius)
                .map(|x| (-((x * x) as f64) / (2.0 * sigma * sigma)).exp())
                .collect();
            let sum: f64 = weights.iter().sum();
            weights.into_iter().map(|w| (w / sum) as f32).collect()
        };
        let ksize = kernel.len() as i64;
        let kernel = Tensor::of_slice(&kernel).to_device(self.device());
        let kernel_h = kernel.view([1, 1, 1, ksize]).repeat(&[channels, 1, 1, 1]);
        let kernel_v = kernel.view([1, 1, ksize, 1]).repeat(&[channels, 1, 1, 1]);

        let blurred = tch::no_grad(|| -> Result<_> {
            let input = self.to_kind(Kind::Float).view([1, channels, height, width]);
            let horizontal = input
                .f_reflection_pad2d(&[radius, radius, 0, 0])?
                .f_conv2d(&kernel_h, None::<Tensor>, &[1, 1], &[0, 0], &[1, 1], channels)?;
            let vertical = horizontal
                .f_reflection_pad2d(&[0, 0, radius, radius])?
                .f_conv2d(&kernel_v, None::<Tensor>, &[1, 1], &[0, 0], &[1, 1], channels)?;
            Ok(vertical.view([channels, height, width]))
        })?;

        Ok(blurred)
    }

    fn f_median_all(&self) -> Result<f64> {
        let flat = self.f_reshape(&[-1])?;
        let numel = flat.size1()?;
        ensure!(numel > 0, "cannot take the median of an empty tensor");

        let (sorted, _indexes) = flat.to_kind(Kind::Double).f_sort(0, false)?;
        let median = if numel % 2 == 1 {
            sorted.double_value(&[numel / 2])
        } else {
            let lower = sorted.double_value(&[numel / 2 - 1]);
            let upper = sorted.double_value(&[numel / 2]);
            (lower + upper) / 2.0
        };
        Ok(median)
    }
}
