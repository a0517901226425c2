use burn::prelude::{Backend, Bool, Int, Tensor};
use glam::UVec2;
use render::gaussian_splats::StructuralChange;
use tracing::trace_span;

use crate::config::RefineConfig;
use crate::error::ConfigError;

/// How screen space gradients are folded together between refines.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GradStatistic {
    /// Exponential moving average over the views a splat was visible in.
    Ema { decay: f32 },
    /// Mean over the views a splat was visible in.
    Mean,
}

impl GradStatistic {
    pub fn from_config(config: &RefineConfig) -> Result<Self, ConfigError> {
        match config.grad_statistic.as_str() {
            "ema" => Ok(Self::Ema {
                decay: config.ema_decay,
            }),
            "mean" => Ok(Self::Mean),
            other => Err(ConfigError::UnknownStatistic(other.to_owned())),
        }
    }
}

pub(crate) struct RefineRecord<B: Backend> {
    // Helper tensors for accumulating the viewspace_xy gradients and the number
    // of observations per gaussian. Used in pruning and densification.
    grad_accum: Tensor<B, 1>,
    visible_count: Tensor<B, 1>,
    max_radii: Tensor<B, 1>,
}

impl<B: Backend> RefineRecord<B> {
    pub(crate) fn new(num_points: usize, device: &B::Device) -> Self {
        Self {
            grad_accum: Tensor::zeros([num_points], device),
            visible_count: Tensor::zeros([num_points], device),
            max_radii: Tensor::zeros([num_points], device),
        }
    }

    pub(crate) fn rows(&self) -> usize {
        self.grad_accum.dims()[0]
    }

    pub(crate) fn gather_stats(
        &mut self,
        statistic: GradStatistic,
        viewspace_grad: Tensor<B, 2>,
        visible: Tensor<B, 1, Bool>,
        radii: Tensor<B, 1, Int>,
        resolution: UVec2,
    ) {
        let _span = trace_span!("Gather stats").entered();
        let device = viewspace_grad.device();

        // Gradients are in NDC, scale them to pixels.
        let half_res = Tensor::<B, 1>::from_floats(
            [resolution.x as f32 / 2.0, resolution.y as f32 / 2.0],
            &device,
        )
        .unsqueeze::<2>();
        let grad_norm: Tensor<B, 1> = (viewspace_grad * half_res)
            .powi_scalar(2)
            .sum_dim(1)
            .sqrt()
            .squeeze(1);
        let visible = visible.float();

        self.grad_accum = match statistic {
            GradStatistic::Ema { decay } => {
                let delta = (grad_norm - self.grad_accum.clone()) * (1.0 - decay);
                self.grad_accum.clone() + delta * visible.clone()
            }
            GradStatistic::Mean => self.grad_accum.clone() + grad_norm * visible.clone(),
        };
        self.visible_count = self.visible_count.clone() + visible;
        self.max_radii = self.max_radii.clone().max_pair(radii.float());
    }

    /// Per splat value compared against the densification threshold.
    pub(crate) fn grad_statistic(&self, statistic: GradStatistic) -> Tensor<B, 1> {
        match statistic {
            GradStatistic::Ema { .. } => self.grad_accum.clone(),
            GradStatistic::Mean => {
                self.grad_accum.clone() / self.visible_count.clone().clamp_min(1.0)
            }
        }
    }

    pub(crate) fn max_radii(&self) -> Tensor<B, 1> {
        self.max_radii.clone()
    }

    pub(crate) fn visible_count(&self) -> Tensor<B, 1> {
        self.visible_count.clone()
    }

    pub(crate) fn apply(&self, change: &StructuralChange) -> Self {
        Self {
            grad_accum: change.apply_rows(self.grad_accum.clone()),
            visible_count: change.apply_rows(self.visible_count.clone()),
            max_radii: change.apply_rows(self.max_radii.clone()),
        }
    }
}
