use std::sync::Arc;

use burn::prelude::{Backend, Tensor};
use dataset::ViewSample;
use image::Rgb32FImage;
use render::SplatRenderer;
use render::gaussian_splats::{Splats, read_floats};
use tracing::trace_span;

use crate::error::TrainError;
use crate::lpips::{FeatureExtractor, Lpips};
use crate::metrics::MetricsSink;
use crate::msg::ValidationMetrics;
use crate::ssim::Ssim;

pub struct EvalSample<B: Backend> {
    pub image_name: String,
    /// `[H, W, 3]`, clamped to [0, 1].
    pub rendered: Tensor<B, 3>,
    pub gt_image: Tensor<B, 3>,
    pub opacity: Tensor<B, 3>,
    /// Min-max normalized depth.
    pub depth: Tensor<B, 3>,
    pub l1: f32,
    pub psnr: f32,
    pub ms_ssim: f32,
    pub lpips: Option<f32>,
}

fn scalar<B: Backend>(value: Tensor<B, 1>) -> Result<f32, TrainError> {
    Ok(read_floats(value)?.first().copied().unwrap_or(0.0))
}

fn normalize_depth<B: Backend>(depth: Tensor<B, 3>) -> Tensor<B, 3> {
    let min = depth.clone().min().reshape([1, 1, 1]);
    let max = depth.clone().max().reshape([1, 1, 1]);
    (depth - min.clone()) / (max - min).clamp_min(1e-8)
}

/// Convert an `[H, W, 1]` or `[H, W, 3]` tensor to an image.
pub fn tensor_to_image<B: Backend>(tensor: Tensor<B, 3>) -> Result<Rgb32FImage, TrainError> {
    let [h, w, c] = tensor.dims();
    let tensor = if c == 1 { tensor.repeat_dim(2, 3) } else { tensor };
    let data = read_floats(tensor)?;
    Rgb32FImage::from_raw(w as u32, h as u32, data)
        .ok_or_else(|| TrainError::Image(format!("[{h}, {w}, {c}] tensor")))
}

/// Scores renders of held out views.
pub struct Validator<B: Backend> {
    ssim: Ssim<B>,
    lpips: Option<Lpips<B>>,
}

impl<B: Backend> Validator<B> {
    pub fn new(extractor: Option<Arc<dyn FeatureExtractor<B>>>, device: &B::Device) -> Self {
        const SSIM_WINDOW_SIZE: usize = 11;
        Self {
            ssim: Ssim::new(SSIM_WINDOW_SIZE, 3, device),
            lpips: extractor.map(Lpips::new),
        }
    }

    pub fn eval_view<R: SplatRenderer<B> + ?Sized>(
        &self,
        renderer: &R,
        splats: &Splats<B>,
        view: &ViewSample<B>,
    ) -> Result<EvalSample<B>, TrainError> {
        let device = splats.device();
        let holder = Tensor::zeros([splats.num_points(), 2], &device);
        let output = renderer.render(splats, &view.camera, view.img_size(), holder);

        let rendered = output.render.clamp(0.0, 1.0);
        let gt_image = view.image.clone().clamp(0.0, 1.0);

        let diff = rendered.clone() - gt_image.clone();
        let l1 = scalar(diff.clone().abs().mean())?;
        let mse = diff.powi_scalar(2).mean();
        let psnr = scalar(mse.recip().log() * 10.0 / std::f32::consts::LN_10)?;

        let pred_batch = rendered.clone().unsqueeze::<4>();
        let gt_batch = gt_image.clone().unsqueeze::<4>();
        let ms_ssim = scalar(self.ssim.ms_ssim(pred_batch.clone(), gt_batch.clone()))?;
        let lpips = match &self.lpips {
            Some(lpips) => Some(scalar(lpips.distance(pred_batch, gt_batch))?),
            None => None,
        };

        Ok(EvalSample {
            image_name: view.image_name.clone(),
            rendered,
            gt_image,
            opacity: output.opacity,
            depth: normalize_depth(output.depth),
            l1,
            psnr,
            ms_ssim,
            lpips,
        })
    }

    /// Score every view once and report per view images and the averages to `sink`.
    ///
    /// The splats are only read.
    pub fn validate<R: SplatRenderer<B> + ?Sized>(
        &self,
        renderer: &R,
        splats: &Splats<B>,
        views: &[ViewSample<B>],
        sink: &mut dyn MetricsSink,
        step: u32,
    ) -> Result<ValidationMetrics, TrainError> {
        let _span = trace_span!("Validate", views = views.len()).entered();

        if views.is_empty() {
            log::warn!("No views to validate on");
            return Ok(ValidationMetrics::default());
        }

        let mut metrics = ValidationMetrics::default();
        let mut lpips_sum = 0.0;
        for view in views {
            let sample = self.eval_view(renderer, splats, view)?;

            let prefix = format!("test_view_{}", sample.image_name);
            sink.add_image(&format!("{prefix}/render"), &tensor_to_image(sample.rendered)?, step);
            sink.add_image(
                &format!("{prefix}/ground_truth"),
                &tensor_to_image(sample.gt_image)?,
                step,
            );
            sink.add_image(&format!("{prefix}/opacity"), &tensor_to_image(sample.opacity)?, step);
            sink.add_image(&format!("{prefix}/depth"), &tensor_to_image(sample.depth)?, step);

            metrics.l1 += sample.l1;
            metrics.psnr += sample.psnr;
            metrics.ms_ssim += sample.ms_ssim;
            lpips_sum += sample.lpips.unwrap_or(0.0);
        }

        let count = views.len() as f32;
        metrics.num_views = views.len();
        metrics.l1 /= count;
        metrics.psnr /= count;
        metrics.ms_ssim /= count;
        metrics.lpips = self.lpips.as_ref().map(|_| lpips_sum / count);

        sink.add_scalar("test/loss_viewpoint - l1_loss", metrics.l1 as f64, step);
        sink.add_scalar("test/loss_viewpoint - psnr", metrics.psnr as f64, step);
        sink.add_scalar("test/loss_viewpoint - ssims", metrics.ms_ssim as f64, step);
        if let Some(lpips) = metrics.lpips {
            sink.add_scalar("test/loss_viewpoint - lpips", lpips as f64, step);
        }

        log::info!(
            "[{step}] Validation: L1 {:.5} PSNR {:.5} SSIMS {:.5} LPIPS {:?}",
            metrics.l1,
            metrics.psnr,
            metrics.ms_ssim,
            metrics.lpips
        );
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use burn::prelude::Tensor;
    use dataset::ViewSample;
    use glam::UVec2;
    use render::RenderOutput;
    use render::camera::Camera;
    use render::gaussian_splats::{Splats, read_floats};

    use super::{Validator, tensor_to_image};
    use crate::lpips::tests::PoolFeatures;
    use crate::metrics::MetricsRecorder;
    use crate::optimizer::tests::{Backend, line_splats};

    // Renders a flat gray image and a depth ramp.
    fn gray_render(splats: &Splats<Backend>, _: &Camera, size: UVec2, holder: Tensor<Backend, 2>) -> RenderOutput<Backend> {
        let device = splats.device();
        let n = splats.num_points();
        let (w, h) = (size.x as usize, size.y as usize);
        let ramp: Vec<f32> = (0..h * w).map(|i| i as f32 * 3.0).collect();
        RenderOutput {
            render: Tensor::ones([h, w, 3], &device) * 0.5,
            opacity: Tensor::ones([h, w, 1], &device),
            depth: Tensor::<Backend, 1>::from_floats(ramp.as_slice(), &device).reshape([h, w, 1]),
            viewspace_points: holder,
            visibility_filter: Tensor::<Backend, 1>::ones([n], &device).greater_elem(0.0),
            radii: Tensor::zeros([n], &device),
        }
    }

    fn gray_view(name: &str, value: f32) -> ViewSample<Backend> {
        let device = Default::default();
        ViewSample {
            image: Tensor::ones([16, 16, 3], &device) * value,
            camera: Camera::from_fov(glam::Mat3::IDENTITY, glam::Vec3::ZERO, 1.0, 16, 16),
            image_name: name.to_owned(),
        }
    }

    #[test]
    fn reports_averages_and_images() {
        let device = Default::default();
        let splats = line_splats(4);
        let before = read_floats(splats.means()).expect("Readable");

        let validator = Validator::<Backend>::new(Some(Arc::new(PoolFeatures)), &device);
        let mut sink = MetricsRecorder::new();
        let views = vec![gray_view("a", 0.5), gray_view("b", 0.25)];
        let metrics = validator
            .validate(&gray_render, &splats, &views, &mut sink, 7)
            .expect("Validation runs");

        assert_eq!(metrics.num_views, 2);
        assert!((metrics.l1 - 0.125).abs() < 1e-6);
        assert_eq!(sink.scalar("test/loss_viewpoint - l1_loss"), Some(metrics.l1 as f64));
        assert!(sink.scalar("test/loss_viewpoint - psnr").is_some());
        assert!(sink.scalar("test/loss_viewpoint - ssims").is_some());
        assert!(sink.scalar("test/loss_viewpoint - lpips").is_some());
        assert_eq!(sink.images.len(), 8);
        assert!(sink.scalars.iter().all(|s| s.step == 7));

        let depth = sink.image("test_view_b/depth").expect("Depth logged");
        let values = depth.as_raw();
        assert_eq!(values.first(), Some(&0.0));
        assert!((values[values.len() - 1] - 1.0).abs() < 1e-6);

        assert_eq!(read_floats(splats.means()).expect("Readable"), before);
    }

    #[test]
    fn single_channel_images_are_expanded() {
        let device = Default::default();
        let img = tensor_to_image(Tensor::<Backend, 3>::ones([2, 3, 1], &device)).expect("Valid image");
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.as_raw().len(), 18);
    }
}
