use burn::prelude::{Backend, Bool, Tensor, TensorData};
use burn::tensor::Distribution;
use render::gaussian_splats::{Splats, index_tensor, read_floats};
use render::{Attribute, AttributeSet};
use tracing::trace_span;

use crate::config::RefineConfig;
use crate::error::TrainError;
use crate::msg::RefineStats;
use crate::optimizer::SplatOptimizer;
use crate::quat_vec::rotate_vectors;

#[derive(Clone, Debug, PartialEq)]
pub struct RefineThresholds {
    pub grad_threshold: f32,
    pub opacity_threshold: f32,
    /// Grown splats larger than this are split, smaller ones are cloned.
    pub scale_threshold: f32,
    pub max_scale: f32,
    /// Largest allowed screen radius in pixels.
    pub max_screen_size: Option<f32>,
    pub split_scale_divisor: f32,
}

impl RefineThresholds {
    pub fn new(grad_threshold: f32, opacity_threshold: f32, scale_threshold: f32, max_scale: f32) -> Self {
        Self {
            grad_threshold,
            opacity_threshold,
            scale_threshold,
            max_scale,
            max_screen_size: None,
            split_scale_divisor: 2.0,
        }
    }

    /// Thresholds for a scene of the given extent.
    pub fn from_config(config: &RefineConfig, scene_extent: f32) -> Self {
        Self {
            grad_threshold: config.grad_threshold,
            opacity_threshold: config.opacity_threshold,
            scale_threshold: config.percent_dense * scene_extent,
            max_scale: config.max_scale_fraction * scene_extent,
            max_screen_size: config.max_screen_size,
            split_scale_divisor: config.split_scale_divisor,
        }
    }
}

fn max_scales<B: Backend>(splats: &Splats<B>) -> Result<Vec<f32>, TrainError> {
    Ok(read_floats(splats.scales().max_dim(1))?)
}

// Two children per parent, offset by a sample from the parent's gaussian and shrunk.
fn split_children<B: Backend>(
    splats: &Splats<B>,
    parents: &[usize],
    scale_divisor: f32,
) -> AttributeSet<B> {
    let device = splats.device();
    let count = parents.len() * 2;
    let indices = index_tensor(parents, &device);
    let pair = |t: Tensor<B, 2>| t.select(0, indices.clone()).repeat_dim(0, 2);

    let samples = rotate_vectors(
        pair(splats.rotations_normed()),
        Tensor::random([count, 3], Distribution::Normal(0.0, 1.0), &device) * pair(splats.scales()),
    );

    AttributeSet::new()
        .with(Attribute::Position, pair(splats.means()) + samples)
        .with(Attribute::Rotation, pair(splats.rotations()))
        .with(
            Attribute::Scale,
            pair(splats.log_scales()) - scale_divisor.ln(),
        )
        .with(Attribute::Opacity, pair(splats.raw_opacities()))
        .with(Attribute::Color, pair(splats.sh_coeffs()))
}

impl<B: Backend> SplatOptimizer<B> {
    /// Grow splats with large screen space gradients and remove ones that are too transparent
    /// or too large.
    ///
    /// Clones and split children are appended first, then a single prune removes the split
    /// parents together with every splat (old or new) that fails the prune checks. When
    /// nothing would be added or removed, nothing is touched, the statistics included.
    pub fn densify_and_prune(
        &mut self,
        splats: &mut Splats<B>,
        thresholds: &RefineThresholds,
    ) -> Result<RefineStats, TrainError> {
        let _span = trace_span!("Densify and prune").entered();
        let n = self.check_rows(splats)?;

        let grads = read_floats(self.record.grad_statistic(self.statistic()))?;
        let scales = max_scales(splats)?;

        let mut split = vec![];
        let mut clone = vec![];
        for i in 0..n {
            if grads[i] > thresholds.grad_threshold {
                if scales[i] > thresholds.scale_threshold {
                    split.push(i);
                } else {
                    clone.push(i);
                }
            }
        }

        let device = splats.device();
        let mut additions = vec![];
        if !clone.is_empty() {
            additions.push(splats.select(index_tensor(&clone, &device)));
        }
        if !split.is_empty() {
            additions.push(split_children(splats, &split, thresholds.split_scale_divisor));
        }
        let mut changed = false;
        if let Some(new) = AttributeSet::cat(additions)? {
            self.append(splats, &new)?;
            changed = true;
        }

        let total = splats.num_points();
        let opacities = read_floats(splats.opacities())?;
        let scales = max_scales(splats)?;
        let radii = match thresholds.max_screen_size {
            Some(_) => read_floats(self.record.max_radii())?,
            None => vec![],
        };

        let mut keep = vec![true; total];
        for &i in &split {
            keep[i] = false;
        }
        let mut num_pruned = 0;
        for i in 0..total {
            let too_big_on_screen = thresholds
                .max_screen_size
                .is_some_and(|max| radii[i] > max);
            let prune = opacities[i] < thresholds.opacity_threshold
                || scales[i] > thresholds.max_scale
                || too_big_on_screen;
            if prune && keep[i] {
                keep[i] = false;
                num_pruned += 1;
            }
        }

        if keep.iter().any(|k| !k) {
            let keep = Tensor::<B, 1, Bool>::from_data(TensorData::new(keep, [total]), &device);
            self.prune(splats, keep)?;
            changed = true;
        }

        if changed && self.reset_stats_on_refine() {
            self.reset_stats();
        }

        let stats = RefineStats {
            num_split: split.len(),
            num_cloned: clone.len(),
            num_pruned,
            num_points: splats.num_points(),
        };
        log::debug!(
            "Refine: split {}, cloned {}, pruned {}, now {} splats",
            stats.num_split,
            stats.num_cloned,
            stats.num_pruned,
            stats.num_points
        );
        Ok(stats)
    }
}
