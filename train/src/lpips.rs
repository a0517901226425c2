use std::sync::Arc;

use burn::prelude::{Backend, Tensor};

/// A frozen, pretrained feature network such as VGG or AlexNet.
///
/// The network itself is not part of this workspace. Implementations take images as
/// `[B, 3, H, W]` in [-1, 1] and return one `[B, C, H', W']` activation per layer.
pub trait FeatureExtractor<B: Backend>: Send + Sync {
    fn features(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>>;
}

/// Learned perceptual image patch similarity, without the learned per channel weights.
#[derive(Clone)]
pub struct Lpips<B: Backend> {
    extractor: Arc<dyn FeatureExtractor<B>>,
}

fn unit_normalize<B: Backend>(features: Tensor<B, 4>) -> Tensor<B, 4> {
    let norm = features.clone().powi_scalar(2).sum_dim(1).sqrt();
    features / (norm + 1e-10)
}

impl<B: Backend> Lpips<B> {
    pub fn new(extractor: Arc<dyn FeatureExtractor<B>>) -> Self {
        Self { extractor }
    }

    /// Distance between two `[B, H, W, 3]` batches in [0, 1], averaged over the batch.
    pub fn distance(&self, pred: Tensor<B, 4>, gt: Tensor<B, 4>) -> Tensor<B, 1> {
        let to_input = |img: Tensor<B, 4>| img.permute([0, 3, 1, 2]) * 2.0 - 1.0;
        let pred_features = self.extractor.features(to_input(pred));
        let gt_features = self.extractor.features(to_input(gt));

        let device = match pred_features.first() {
            Some(f) => f.device(),
            None => return Tensor::from_floats([0.0], &Default::default()),
        };

        pred_features
            .into_iter()
            .zip(gt_features)
            .map(|(p, g)| {
                (unit_normalize(p) - unit_normalize(g))
                    .powi_scalar(2)
                    .sum_dim(1)
                    .mean()
            })
            .fold(Tensor::zeros([1], &device), |acc, layer| acc + layer)
    }
}
