use std::collections::BTreeMap;

use burn::LearningRate;
use burn::prelude::{Backend, Tensor};
use render::Attribute;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefineStats {
    pub num_split: usize,
    pub num_cloned: usize,
    /// Splats removed by the prune checks. Split parents are not counted.
    pub num_pruned: usize,
    pub num_points: usize,
}

#[derive(Clone, Debug)]
pub struct TrainStepStats<B: Backend> {
    /// `[B, H, W, 3]`
    pub pred_images: Tensor<B, 4>,

    pub loss: Tensor<B, 1>,
    pub l1: Tensor<B, 1>,
    pub ssim: Option<Tensor<B, 1>>,
    pub lpips: Option<Tensor<B, 1>>,

    pub learning_rates: BTreeMap<Attribute, LearningRate>,
    pub num_points: usize,
    pub num_views: usize,
}

/// Averages over one pass of the validation split.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValidationMetrics {
    pub num_views: usize,
    pub l1: f32,
    pub psnr: f32,
    pub ms_ssim: f32,
    pub lpips: Option<f32>,
}
