use render::{Attribute, SplatError};
use thiserror::Error;

/// Problems with the training setup. All of these are raised before the first step.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Loss weight for {term} must not be negative, got {weight}")]
    NegativeWeight { term: &'static str, weight: f32 },

    #[error("Unknown optimizer '{0}', expected 'adam' or 'sgd'")]
    UnknownOptimizer(String),

    #[error("Unknown learning rate schedule '{0}', expected 'constant' or 'exponential'")]
    UnknownSchedule(String),

    #[error("Unknown parameter group '{0}'")]
    UnknownGroup(String),

    #[error("Parameter group '{0}' is configured twice")]
    DuplicateGroup(String),

    #[error("Unknown gradient statistic '{0}', expected 'ema' or 'mean'")]
    UnknownStatistic(String),

    #[error("Learning rate for {group} must be positive for an exponential schedule, got {lr}")]
    InvalidLearningRate { group: String, lr: f64 },

    #[error("LPIPS weight is {0} but no feature extractor was provided")]
    MissingFeatureExtractor(f32),
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Can not render an empty batch")]
    Empty,

    #[error("View {index} is {found:?} but the batch is {expected:?}")]
    ImageShape {
        index: usize,
        expected: [usize; 3],
        found: [usize; 3],
    },

    #[error("View {index} reported {found} splats but there are {expected}")]
    PointCount {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("Render of view {index} is {found:?} but the ground truth is {expected:?}")]
    RenderShape {
        index: usize,
        expected: [usize; 3],
        found: [usize; 3],
    },
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Gradient for {attribute} has {found} rows but there are {expected} splats")]
    GradientShape {
        attribute: Attribute,
        expected: usize,
        found: usize,
    },

    #[error("Optimizer tracks {tracked} splats but there are {expected}")]
    StateOutOfSync { expected: usize, tracked: usize },

    #[error("Invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error("Splat error: {0}")]
    Splat(#[from] SplatError),

    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("Failed to convert {0} to an image")]
    Image(String),
}
