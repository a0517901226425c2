use burn::LearningRate;
use burn::prelude::Backend;
use render::Attribute;

use crate::config::{GroupConfig, LrScheduleConfig};
use crate::error::ConfigError;
use crate::optimizer::SplatOptimizer;

/// Log-linear decay from `lr_init` to `lr_final` over `max_steps`.
#[derive(Clone, Debug, PartialEq)]
pub struct ExponLrScheduler {
    lr_init: LearningRate,
    lr_final: LearningRate,
    max_steps: u32,
}

impl ExponLrScheduler {
    pub fn new(lr_init: LearningRate, lr_final: LearningRate, max_steps: u32) -> Self {
        Self {
            lr_init,
            lr_final,
            max_steps,
        }
    }

    pub fn lr(&self, step: u32) -> LearningRate {
        if step >= self.max_steps {
            return self.lr_final;
        }
        let t = step as f64 / self.max_steps as f64;
        let lr = self.lr_init * (self.lr_final / self.lr_init).powf(t);
        lr.clamp(
            self.lr_init.min(self.lr_final),
            self.lr_init.max(self.lr_final),
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LrSchedule {
    Constant(LearningRate),
    Exponential(ExponLrScheduler),
}

impl LrSchedule {
    pub fn from_config(
        group: &str,
        config: &LrScheduleConfig,
        total_steps: u32,
    ) -> Result<Self, ConfigError> {
        match config.name.as_str() {
            "constant" => Ok(Self::Constant(config.lr_init)),
            "exponential" => {
                let lr_final = config.lr_final.unwrap_or(config.lr_init);
                for lr in [config.lr_init, lr_final] {
                    if lr <= 0.0 {
                        return Err(ConfigError::InvalidLearningRate {
                            group: group.to_owned(),
                            lr,
                        });
                    }
                }
                Ok(Self::Exponential(ExponLrScheduler::new(
                    config.lr_init,
                    lr_final,
                    config.max_steps.unwrap_or(total_steps),
                )))
            }
            other => Err(ConfigError::UnknownSchedule(other.to_owned())),
        }
    }

    pub fn lr(&self, step: u32) -> LearningRate {
        match self {
            Self::Constant(lr) => *lr,
            Self::Exponential(sched) => sched.lr(step),
        }
    }
}

/// The learning rate schedule of every parameter group.
#[derive(Clone, Debug)]
pub struct GroupScheduler {
    schedules: Vec<(Attribute, LrSchedule, f64)>,
}

impl GroupScheduler {
    pub fn new(
        groups: &[GroupConfig],
        total_steps: u32,
        scene_extent: f32,
    ) -> Result<Self, ConfigError> {
        let schedules = groups
            .iter()
            .map(|group| {
                let attribute = Attribute::from_name(&group.name)
                    .ok_or_else(|| ConfigError::UnknownGroup(group.name.clone()))?;
                let schedule = LrSchedule::from_config(&group.name, &group.lr, total_steps)?;
                let scale = if group.scale_by_extent {
                    scene_extent as f64
                } else {
                    1.0
                };
                Ok((attribute, schedule, scale))
            })
            .collect::<Result<_, ConfigError>>()?;
        Ok(Self { schedules })
    }

    pub fn lr(&self, attribute: Attribute, step: u32) -> Option<LearningRate> {
        self.schedules
            .iter()
            .find(|(attr, _, _)| *attr == attribute)
            .map(|(_, schedule, scale)| schedule.lr(step) * scale)
    }

    /// Write the rate for `step` into every group. Returns the rates that were set.
    pub fn apply<B: Backend>(
        &self,
        optimizer: &mut SplatOptimizer<B>,
        step: u32,
    ) -> Vec<(Attribute, LearningRate)> {
        self.schedules
            .iter()
            .map(|(attribute, schedule, scale)| {
                let lr = schedule.lr(step) * scale;
                optimizer.set_learning_rate(*attribute, lr);
                (*attribute, lr)
            })
            .collect()
    }
}
