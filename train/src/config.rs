use burn::prelude::Config;

/// Update rule of one parameter group.
#[derive(Config, Debug)]
pub struct OptimizerConfig {
    /// Either "adam" or "sgd".
    #[config(default = "String::from(\"adam\")")]
    pub name: String,
    /// Parameter for Adam.
    #[config(default = 0.9)]
    pub beta_1: f32,
    /// Parameter for Adam.
    #[config(default = 0.999)]
    pub beta_2: f32,
    /// A value required for numerical stability.
    #[config(default = 1e-15)]
    pub epsilon: f32,
    /// Momentum for SGD. Zero means plain gradient descent.
    #[config(default = 0.0)]
    pub momentum: f32,
}

#[derive(Config, Debug)]
pub struct LrScheduleConfig {
    /// Starting learning rate.
    pub lr_init: f64,
    /// Either "constant" or "exponential".
    #[config(default = "String::from(\"constant\")")]
    pub name: String,
    /// Learning rate reached at `max_steps` by an exponential schedule.
    pub lr_final: Option<f64>,
    /// Steps to decay over. Defaults to the total nr. of training steps.
    pub max_steps: Option<u32>,
}

#[derive(Config, Debug)]
pub struct GroupConfig {
    /// The splat attribute this group updates: position, rotation, scale, opacity or color.
    pub name: String,
    pub lr: LrScheduleConfig,
    #[config(default = "OptimizerConfig::new()")]
    pub optimizer: OptimizerConfig,
    /// Multiply the learning rate by the scene extent.
    #[config(default = false)]
    pub scale_by_extent: bool,
}

#[derive(Config, Debug)]
pub struct RefineConfig {
    /// Don't densify before this iteration.
    #[config(default = 500)]
    pub densify_start: u32,
    /// Period after which splats are no longer densified, pruned or reset.
    #[config(default = 15000)]
    pub densify_stop: u32,
    #[config(default = 100)]
    pub densify_interval: u32,
    /// Every this many steps, all opacities are lowered to `opacity_reset_value`.
    #[config(default = 3000)]
    pub opacity_reset_interval: u32,
    #[config(default = 0.01)]
    pub opacity_reset_value: f32,
    /// Threshold on the accumulated screen space gradient to grow a splat.
    #[config(default = 2e-4)]
    pub grad_threshold: f32,
    /// Splats less opaque than this are pruned.
    #[config(default = 0.005)]
    pub opacity_threshold: f32,
    /// Splats larger than this fraction of the scene extent are split, smaller ones cloned.
    #[config(default = 0.01)]
    pub percent_dense: f32,
    /// Splats larger than this fraction of the scene extent are pruned.
    #[config(default = 0.1)]
    pub max_scale_fraction: f32,
    /// Splats whose screen radius (in pixels) ever exceeded this are pruned. Only applies
    /// after the first opacity reset.
    pub max_screen_size: Option<f32>,
    /// How much smaller the children of a split splat are.
    #[config(default = 2.0)]
    pub split_scale_divisor: f32,
    /// How gradients are accumulated between refines: "ema" or "mean".
    #[config(default = "String::from(\"ema\")")]
    pub grad_statistic: String,
    /// Decay of the "ema" statistic.
    #[config(default = 0.9)]
    pub ema_decay: f32,
    /// Clear the accumulated statistics after every densify step.
    #[config(default = true)]
    pub reset_stats_on_refine: bool,
}

#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = 0.8)]
    pub l1_weight: f32,
    /// Weight of the (1 - MS-SSIM) term.
    #[config(default = 0.2)]
    pub ssim_weight: f32,
    /// Weight of the perceptual term. Needs a feature extractor when positive.
    #[config(default = 0.0)]
    pub lpips_weight: f32,
    #[config(default = 11)]
    pub ssim_window: usize,
}

#[derive(Config, Debug)]
pub struct TrainConfig {
    /// Total number of steps to train for.
    #[config(default = 30000)]
    pub total_steps: u32,

    #[config(default = 3)]
    pub sh_degree: u32,

    #[config(default = "LossConfig::new()")]
    pub loss: LossConfig,

    #[config(default = "RefineConfig::new()")]
    pub refine: RefineConfig,

    /// One entry per trained attribute. Attributes without a group stay fixed.
    #[config(default = "default_groups()")]
    pub groups: Vec<GroupConfig>,
}

pub fn default_groups() -> Vec<GroupConfig> {
    let constant = |name: &str, lr: f64| GroupConfig::new(name.to_owned(), LrScheduleConfig::new(lr));
    vec![
        GroupConfig::new(
            "position".to_owned(),
            LrScheduleConfig::new(1.6e-4)
                .with_name("exponential".to_owned())
                .with_lr_final(Some(1.6e-6)),
        )
        .with_scale_by_extent(true),
        constant("color", 2.5e-3),
        constant("opacity", 5e-2),
        constant("scale", 5e-3),
        constant("rotation", 1e-3),
    ]
}
