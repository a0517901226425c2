use std::sync::Arc;

use burn::prelude::{Backend, Tensor};
use tracing::trace_span;

use crate::config::LossConfig;
use crate::error::ConfigError;
use crate::lpips::{FeatureExtractor, Lpips};
use crate::ssim::Ssim;

/// The individual terms of one loss evaluation. Unused terms are not computed.
#[derive(Clone, Debug)]
pub struct LossTerms<B: Backend> {
    pub total: Tensor<B, 1>,
    pub l1: Tensor<B, 1>,
    pub ms_ssim: Option<Tensor<B, 1>>,
    pub lpips: Option<Tensor<B, 1>>,
}

/// `l1 * L1 + ssim * (1 - MS-SSIM) + lpips * LPIPS`
pub struct CompositeLoss<B: Backend> {
    l1_weight: f32,
    ssim_weight: f32,
    lpips_weight: f32,
    ssim: Ssim<B>,
    lpips: Option<Lpips<B>>,
}

impl<B: Backend> CompositeLoss<B> {
    pub fn new(
        config: &LossConfig,
        extractor: Option<Arc<dyn FeatureExtractor<B>>>,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        for (term, weight) in [
            ("l1", config.l1_weight),
            ("ssim", config.ssim_weight),
            ("lpips", config.lpips_weight),
        ] {
            if weight < 0.0 {
                return Err(ConfigError::NegativeWeight { term, weight });
            }
        }
        if config.lpips_weight > 0.0 && extractor.is_none() {
            return Err(ConfigError::MissingFeatureExtractor(config.lpips_weight));
        }

        Ok(Self {
            l1_weight: config.l1_weight,
            ssim_weight: config.ssim_weight,
            lpips_weight: config.lpips_weight,
            ssim: Ssim::new(config.ssim_window, 3, device),
            lpips: extractor.map(Lpips::new),
        })
    }

    /// Loss between two `[B, H, W, 3]` batches.
    pub fn compute(&self, pred: Tensor<B, 4>, gt: Tensor<B, 4>) -> LossTerms<B> {
        let _span = trace_span!("Calculate losses").entered();

        let l1 = (pred.clone() - gt.clone()).abs().mean();
        let mut total = l1.clone() * self.l1_weight;

        let ms_ssim = (self.ssim_weight > 0.0).then(|| self.ssim.ms_ssim(pred.clone(), gt.clone()));
        if let Some(ms_ssim) = &ms_ssim {
            total = total + (ms_ssim.clone().neg() + 1.0) * self.ssim_weight;
        }

        let lpips = match &self.lpips {
            Some(lpips) if self.lpips_weight > 0.0 => Some(lpips.distance(pred, gt)),
            _ => None,
        };
        if let Some(lpips) = &lpips {
            total = total + lpips.clone() * self.lpips_weight;
        }

        LossTerms {
            total,
            l1,
            ms_ssim,
            lpips,
        }
    }
}
