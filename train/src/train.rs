use std::sync::Arc;

use burn::tensor::backend::AutodiffBackend;
use dataset::ViewSample;
use render::gaussian_splats::Splats;
use render::{Attribute, AttributeSet, SplatRenderer};
use tracing::trace_span;

use crate::batch::render_batch;
use crate::config::TrainConfig;
use crate::error::TrainError;
use crate::loss::CompositeLoss;
use crate::lpips::FeatureExtractor;
use crate::msg::{RefineStats, TrainStepStats};
use crate::optimizer::SplatOptimizer;
use crate::refine::RefineThresholds;
use crate::scheduler::GroupScheduler;

/// Runs optimization steps on splats that live on the inner backend of `AB`.
///
/// Each step lifts the splats into `AB`, renders the batch, backpropagates the loss and
/// hands the gradients to the [`SplatOptimizer`]. Refining is a separate call so the
/// caller decides when it happens.
pub struct SplatTrainer<AB: AutodiffBackend> {
    config: TrainConfig,
    scene_extent: f32,
    optimizer: SplatOptimizer<AB::InnerBackend>,
    scheduler: GroupScheduler,
    loss: CompositeLoss<AB>,
}

impl<AB: AutodiffBackend> SplatTrainer<AB> {
    pub fn new(
        config: &TrainConfig,
        splats: &Splats<AB::InnerBackend>,
        scene_extent: f32,
        extractor: Option<Arc<dyn FeatureExtractor<AB>>>,
    ) -> Result<Self, TrainError> {
        let device = splats.device();
        let optimizer = SplatOptimizer::new(&config.groups, &config.refine, splats)?;
        let scheduler = GroupScheduler::new(&config.groups, config.total_steps, scene_extent)?;
        let loss = CompositeLoss::new(&config.loss, extractor, &device)?;

        log::info!(
            "Training {} splats for {} steps, scene extent {scene_extent:.3}",
            splats.num_points(),
            config.total_steps
        );

        Ok(Self {
            config: config.clone(),
            scene_extent,
            optimizer,
            scheduler,
            loss,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn scene_extent(&self) -> f32 {
        self.scene_extent
    }

    pub fn optimizer(&self) -> &SplatOptimizer<AB::InnerBackend> {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut SplatOptimizer<AB::InnerBackend> {
        &mut self.optimizer
    }

    pub fn step<R: SplatRenderer<AB> + ?Sized>(
        &mut self,
        iter: u32,
        batch: &[ViewSample<AB>],
        splats: &mut Splats<AB::InnerBackend>,
        renderer: &R,
    ) -> Result<TrainStepStats<AB::InnerBackend>, TrainError> {
        let learning_rates = self.scheduler.apply(&mut self.optimizer, iter);

        let diff_splats = splats.clone().into_autodiff::<AB>();
        let rendered = render_batch(renderer, &diff_splats, batch)?;
        let terms = self
            .loss
            .compute(rendered.images.clone(), rendered.gt_images.clone());

        let grads = trace_span!("Backward pass").in_scope(|| terms.total.backward());

        let mut param_grads = AttributeSet::new();
        for attribute in Attribute::ALL {
            if let Some(grad) = diff_splats.column(attribute).grad(&grads) {
                param_grads.insert(attribute, grad);
            }
        }

        trace_span!("Optimizer step").in_scope(|| self.optimizer.step(splats, &param_grads))?;

        if iter < self.config.refine.densify_stop {
            let _span = trace_span!("Housekeeping").entered();
            let rows = splats.num_points();
            for view in &rendered.views {
                // A renderer that ignores the holder produces no screen space gradient.
                let Some(viewspace_grad) = view.viewspace_holder.grad(&grads) else {
                    continue;
                };
                self.optimizer.accumulate_stats(
                    viewspace_grad,
                    view.visibility(rows).inner(),
                    view.radii(rows).inner(),
                    view.img_size,
                )?;
            }
        }

        Ok(TrainStepStats {
            pred_images: rendered.images.inner(),
            loss: terms.total.inner(),
            l1: terms.l1.inner(),
            ssim: terms.ms_ssim.map(|t| t.inner()),
            lpips: terms.lpips.map(|t| t.inner()),
            learning_rates: learning_rates.into_iter().collect(),
            num_points: splats.num_points(),
            num_views: batch.len(),
        })
    }

    /// Densify and prune when `iter` is on the refine schedule.
    pub fn refine_if_needed(
        &mut self,
        iter: u32,
        splats: &mut Splats<AB::InnerBackend>,
    ) -> Result<Option<RefineStats>, TrainError> {
        let refine = &self.config.refine;
        let due = iter > refine.densify_start
            && iter < refine.densify_stop
            && refine.densify_interval > 0
            && iter % refine.densify_interval == 0;
        if !due {
            return Ok(None);
        }

        let mut thresholds = RefineThresholds::from_config(refine, self.scene_extent);
        if iter <= refine.opacity_reset_interval {
            thresholds.max_screen_size = None;
        }
        let stats = self.optimizer.densify_and_prune(splats, &thresholds)?;
        log::info!(
            "[{iter}] Refine: {} split, {} cloned, {} pruned, {} splats",
            stats.num_split,
            stats.num_cloned,
            stats.num_pruned,
            stats.num_points
        );
        Ok(Some(stats))
    }

    /// Lower all opacities when `iter` is on the opacity reset schedule. Returns whether
    /// a reset happened.
    pub fn reset_opacity_if_needed(
        &mut self,
        iter: u32,
        splats: &mut Splats<AB::InnerBackend>,
    ) -> Result<bool, TrainError> {
        let refine = &self.config.refine;
        let due = iter > 0
            && iter < refine.densify_stop
            && refine.opacity_reset_interval > 0
            && iter % refine.opacity_reset_interval == 0;
        if !due {
            return Ok(false);
        }
        self.optimizer
            .reset_opacity(splats, refine.opacity_reset_value)?;
        log::info!("[{iter}] Reset opacities to {}", refine.opacity_reset_value);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};
    use burn::prelude::{Backend, Tensor};
    use burn::tensor::activation::sigmoid;
    use dataset::ViewSample;
    use glam::UVec2;
    use render::camera::Camera;
    use render::gaussian_splats::{Splats, read_floats};
    use render::{Attribute, RenderOutput};

    use super::SplatTrainer;
    use crate::config::{RefineConfig, TrainConfig};
    use crate::optimizer::tests::{assert_lockstep, line_splats};

    type DiffBackend = Autodiff<NdArray>;

    // A flat image colored by the mean splat color, nudged by the projected means.
    fn flat_render<B: Backend>(
        splats: &Splats<B>,
        _: &Camera,
        size: UVec2,
        holder: Tensor<B, 2>,
    ) -> RenderOutput<B> {
        let device = splats.device();
        let n = splats.num_points();
        let (w, h) = (size.x as usize, size.y as usize);

        let projected = splats.means().slice([0..n, 0..2]) + holder;
        let shift = projected.clone().mean().reshape([1, 1, 1]);
        let color = sigmoid(splats.sh_coeffs().slice([0..n, 0..3]))
            .mean_dim(0)
            .reshape([1, 1, 3]);
        let opacity = splats.opacities().mean().reshape([1, 1, 1]);
        let render = (color * opacity + shift * 0.01)
            .repeat_dim(0, h)
            .repeat_dim(1, w);

        RenderOutput {
            render,
            opacity: Tensor::ones([h, w, 1], &device),
            depth: Tensor::zeros([h, w, 1], &device),
            viewspace_points: projected,
            visibility_filter: Tensor::<B, 1>::ones([n], &device).greater_elem(0.0),
            radii: Tensor::<B, 1>::ones([n], &device).int() * 3,
        }
    }

    fn view(value: f32) -> ViewSample<DiffBackend> {
        let device = Default::default();
        ViewSample {
            image: Tensor::ones([16, 16, 3], &device) * value,
            camera: Camera::from_fov(glam::Mat3::IDENTITY, glam::Vec3::ZERO, 1.0, 16, 16),
            image_name: "view".to_owned(),
        }
    }

    fn config() -> TrainConfig {
        TrainConfig::new().with_total_steps(100).with_refine(
            RefineConfig::new()
                .with_densify_start(2)
                .with_densify_stop(50)
                .with_densify_interval(5)
                .with_opacity_reset_interval(20)
                .with_grad_statistic("mean".to_owned()),
        )
    }

    #[test]
    fn step_updates_parameters_and_stats() {
        let mut splats = line_splats(6);
        let mut trainer =
            SplatTrainer::<DiffBackend>::new(&config(), &splats, 2.0, None).expect("Valid config");

        let colors_before = read_floats(splats.sh_coeffs()).expect("Readable");
        let batch = vec![view(0.9), view(0.8)];
        let stats = trainer
            .step(0, &batch, &mut splats, &flat_render::<DiffBackend>)
            .expect("Step runs");

        assert_eq!(stats.num_views, 2);
        assert_eq!(stats.num_points, 6);
        assert_eq!(stats.pred_images.dims(), [2, 16, 16, 3]);
        let position_lr = stats.learning_rates[&Attribute::Position];
        assert!((position_lr - 1.6e-4 * 2.0).abs() < 1e-12);

        // The target is brighter, so colors go up.
        let colors_after = read_floats(splats.sh_coeffs()).expect("Readable");
        assert!(colors_after.iter().zip(&colors_before).all(|(a, b)| a > b));

        let visible = read_floats(trainer.optimizer().record.visible_count()).expect("Readable");
        assert_eq!(visible, vec![2.0; 6]);
        assert_lockstep(trainer.optimizer(), &splats);
    }

    #[test]
    fn loss_goes_down() {
        let mut splats = line_splats(4);
        let mut trainer =
            SplatTrainer::<DiffBackend>::new(&config(), &splats, 1.0, None).expect("Valid config");
        let batch = vec![view(0.9)];

        let mut losses = vec![];
        for iter in 0..20 {
            let stats = trainer
                .step(iter, &batch, &mut splats, &flat_render::<DiffBackend>)
                .expect("Step runs");
            losses.push(stats.loss.into_scalar());
        }
        assert!(losses[19] < losses[0]);
    }

    #[test]
    fn refine_follows_schedule() {
        let mut splats = line_splats(6);
        let mut trainer =
            SplatTrainer::<DiffBackend>::new(&config(), &splats, 1.0, None).expect("Valid config");

        assert!(trainer.refine_if_needed(2, &mut splats).expect("Refine runs").is_none());
        assert!(trainer.refine_if_needed(7, &mut splats).expect("Refine runs").is_none());
        assert!(trainer.refine_if_needed(50, &mut splats).expect("Refine runs").is_none());

        let stats = trainer
            .refine_if_needed(5, &mut splats)
            .expect("Refine runs")
            .expect("Refine is due");
        assert_eq!(stats.num_points, splats.num_points());
        assert_lockstep(trainer.optimizer(), &splats);

        assert!(!trainer.reset_opacity_if_needed(10, &mut splats).expect("Reset runs"));
        assert!(trainer.reset_opacity_if_needed(20, &mut splats).expect("Reset runs"));
        let opacities = read_floats(splats.opacities()).expect("Readable");
        assert!(opacities.iter().all(|o| *o <= 0.01 + 1e-6));
    }
}
