use burn::tensor::{Tensor, backend::Backend, module::conv2d, ops::ConvOptions};

/// Weights of the five MS-SSIM scales, finest first.
const MS_SSIM_WEIGHTS: [f32; 5] = [0.0448, 0.2856, 0.3001, 0.2363, 0.1333];

pub(crate) struct Ssim<B: Backend> {
    weights_1d_v: Tensor<B, 4>,
}

fn gaussian<B: Backend>(window_size: usize, sigma: f32, device: &B::Device) -> Tensor<B, 1> {
    let window_extent = (window_size / 2) as f32;
    let vals: Vec<_> = (0..window_size)
        .map(|x| f32::exp(-(x as f32 - window_extent).powf(2.0) / (2.0 * sigma.powf(2.0))))
        .collect();
    let gauss = Tensor::from_floats(vals.as_slice(), device);
    gauss.clone() / gauss.sum()
}

// 2x2 average pooling of [B, C, H, W]. An odd last row or column is dropped.
fn downsample<B: Backend>(img: Tensor<B, 4>) -> Tensor<B, 4> {
    let [b, c, h, w] = img.dims();
    let (h2, w2) = (h / 2, w / 2);
    img.slice([0..b, 0..c, 0..h2 * 2, 0..w2 * 2])
        .reshape([b, c, h2, 2, w2, 2])
        .mean_dim(5)
        .mean_dim(3)
        .reshape([b, c, h2, w2])
}

impl<B: Backend> Ssim<B> {
    pub fn new(window_size: usize, channels: usize, device: &B::Device) -> Self {
        // Channels out, in, h, w.
        let weights_1d_v = gaussian(window_size, 1.5, device)
            .reshape([window_size, 1])
            .unsqueeze()
            .repeat_dim(0, channels);
        Self { weights_1d_v }
    }

    fn window_size(&self) -> usize {
        self.weights_1d_v.dims()[2]
    }

    fn gaussian_blur(&self, img: Tensor<B, 4>) -> Tensor<B, 4> {
        let [channels, _, window_size, _] = self.weights_1d_v.dims();
        let padding = window_size / 2;

        let conv_options_v = ConvOptions::new([1, 1], [padding, 0], [1, 1], channels);
        let conv_options_h = ConvOptions::new([1, 1], [0, padding], [1, 1], channels);
        let kernel_v = self.weights_1d_v.clone();
        let kernel_h = self
            .weights_1d_v
            .clone()
            .reshape([channels, 1, 1, window_size]);

        let v_blur = conv2d(img, kernel_v, None, conv_options_v);
        conv2d(v_blur, kernel_h, None, conv_options_h)
    }

    /// The SSIM map and the contrast-structure map of two `[B, C, H, W]` images.
    fn components(&self, img1: Tensor<B, 4>, img2: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let mu_x = self.gaussian_blur(img1.clone());
        let mu_y = self.gaussian_blur(img2.clone());
        let mu_xx = mu_x.clone() * mu_x.clone();
        let mu_yy = mu_y.clone() * mu_y.clone();
        let mu_xy = mu_x * mu_y;

        let sigma_xx = self.gaussian_blur(img1.clone() * img1.clone()) - mu_xx.clone();
        let sigma_yy = self.gaussian_blur(img2.clone() * img2.clone()) - mu_yy.clone();
        let sigma_xy = self.gaussian_blur(img1 * img2) - mu_xy.clone();

        let c1 = 0.01f32.powf(2.0);
        let c2 = 0.03f32.powf(2.0);

        let cs = (sigma_xy * 2.0 + c2) / (sigma_xx + sigma_yy + c2);
        let ssim = (mu_xy * 2.0 + c1) / (mu_xx + mu_yy + c1) * cs.clone();
        (ssim, cs)
    }

    /// Nr. of scales that still fit a full window, at most five.
    pub fn num_scales(&self, height: usize, width: usize) -> usize {
        let min_side = height.min(width);
        let window = self.window_size();
        (1..MS_SSIM_WEIGHTS.len())
            .take_while(|level| min_side >> level >= window)
            .count()
            + 1
    }

    /// Multi scale SSIM of two `[B, H, W, C]` batches, averaged over the batch.
    ///
    /// Scales that don't fit the window are dropped and the remaining weights renormalized.
    pub fn ms_ssim(&self, img1: Tensor<B, 4>, img2: Tensor<B, 4>) -> Tensor<B, 1> {
        let [_, h, w, _] = img1.dims();
        let levels = self.num_scales(h, w);
        let weights = &MS_SSIM_WEIGHTS[..levels];
        let total: f32 = weights.iter().sum();

        let mut img1 = img1.permute([0, 3, 1, 2]);
        let mut img2 = img2.permute([0, 3, 1, 2]);

        let mut result = None;
        for (level, weight) in weights.iter().enumerate() {
            let (ssim, cs) = self.components(img1.clone(), img2.clone());
            let last = level + 1 == levels;
            let value = if last { ssim.mean() } else { cs.mean() };
            let term = value.clamp_min(1e-6).powf_scalar(weight / total);
            result = Some(match result {
                Some(acc) => acc * term,
                None => term,
            });
            if !last {
                img1 = downsample(img1);
                img2 = downsample(img2);
            }
        }
        // There is always at least one scale.
        result.unwrap_or_else(|| Tensor::ones([1], &self.weights_1d_v.device()))
    }
}
