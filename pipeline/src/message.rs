use std::time::Duration;

use burn::prelude::Backend;
use render::gaussian_splats::Splats;
use train::msg::{RefineStats, TrainStepStats, ValidationMetrics};

#[derive(Debug)]
pub enum PipelineMessage<B: Backend> {
    /// Some number of training steps are done.
    TrainStep {
        splats: Box<Splats<B>>,
        stats: Box<TrainStepStats<B>>,
        iter: u32,
        total_elapsed: Duration,
    },
    /// Splats were densified and pruned.
    RefineStep {
        stats: Box<RefineStats>,
        iter: u32,
    },
    /// All opacities were lowered.
    OpacityReset { iter: u32 },
    /// Eval was run successfully with these results.
    EvalResult {
        iter: u32,
        metrics: ValidationMetrics,
    },
    Finished {
        splats: Box<Splats<B>>,
        iter: u32,
    },
}
