use burn::{
    LearningRate,
    optim::AdaptiveMomentumState,
    prelude::Backend,
    tensor::{ElementConversion, Tensor},
};

use crate::config::OptimizerConfig;
use crate::error::ConfigError;

/// How one parameter group turns gradients into updates.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateRule {
    /// Adam optimizer as described in the paper [Adam: A Method for Stochastic Optimization](https://arxiv.org/pdf/1412.6980.pdf).
    Adam(AdaptiveMomentum),
    Sgd { momentum: f32 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct AdaptiveMomentum {
    beta_1: f32,
    beta_2: f32,
    epsilon: f32,
}

/// Per row state of an update rule. Always as many rows as there are splats.
#[derive(Clone)]
pub enum RuleState<B: Backend> {
    Adam(AdaptiveMomentumState<B, 2>),
    Sgd { velocity: Tensor<B, 2> },
}

impl<B: Backend> RuleState<B> {
    pub fn rows(&self) -> usize {
        match self {
            Self::Adam(state) => state.moment_1.dims()[0],
            Self::Sgd { velocity } => velocity.dims()[0],
        }
    }

    /// Apply the same row operation to every per row tensor. The Adam step counter is shared.
    pub fn map_rows(self, map: impl Fn(Tensor<B, 2>) -> Tensor<B, 2>) -> Self {
        match self {
            Self::Adam(mut state) => {
                state.moment_1 = map(state.moment_1);
                state.moment_2 = map(state.moment_2);
                Self::Adam(state)
            }
            Self::Sgd { velocity } => Self::Sgd {
                velocity: map(velocity),
            },
        }
    }
}

impl UpdateRule {
    pub fn from_config(config: &OptimizerConfig) -> Result<Self, ConfigError> {
        match config.name.as_str() {
            "adam" => Ok(Self::Adam(AdaptiveMomentum {
                beta_1: config.beta_1,
                beta_2: config.beta_2,
                epsilon: config.epsilon,
            })),
            "sgd" => Ok(Self::Sgd {
                momentum: config.momentum,
            }),
            other => Err(ConfigError::UnknownOptimizer(other.to_owned())),
        }
    }

    pub fn init_state<B: Backend>(&self, shape: [usize; 2], device: &B::Device) -> RuleState<B> {
        match self {
            Self::Adam(_) => RuleState::Adam(AdaptiveMomentumState::new(
                0,
                Tensor::zeros(shape, device),
                Tensor::zeros(shape, device),
            )),
            Self::Sgd { .. } => RuleState::Sgd {
                velocity: Tensor::zeros(shape, device),
            },
        }
    }

    pub fn step<B: Backend>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, 2>,
        grad: Tensor<B, 2>,
        state: RuleState<B>,
    ) -> (Tensor<B, 2>, RuleState<B>) {
        let state = match (self, state) {
            (Self::Adam(_), state @ RuleState::Adam(_)) => state,
            (Self::Sgd { .. }, state @ RuleState::Sgd { .. }) => state,
            _ => self.init_state(grad.dims(), &grad.device()),
        };

        match (self, state) {
            (Self::Adam(momentum), RuleState::Adam(state)) => {
                let (grad, state) = momentum.transform(grad, state);
                (tensor - grad * lr, RuleState::Adam(state))
            }
            (Self::Sgd { momentum }, RuleState::Sgd { velocity }) => {
                let velocity = velocity.mul_scalar(*momentum).add(grad);
                (tensor - velocity.clone() * lr, RuleState::Sgd { velocity })
            }
            (_, state) => (tensor, state),
        }
    }
}

impl AdaptiveMomentum {
    pub fn transform<B: Backend, const D: usize>(
        &self,
        grad: Tensor<B, D>,
        mut state: AdaptiveMomentumState<B, D>,
    ) -> (Tensor<B, D>, AdaptiveMomentumState<B, D>) {
        let factor = 1.0 - self.beta_1;
        state.moment_1 = state
            .moment_1
            .mul_scalar(self.beta_1)
            .add(grad.clone().mul_scalar(factor));

        let factor = 1.0 - self.beta_2;
        state.moment_2 = state
            .moment_2
            .mul_scalar(self.beta_2)
            .add(grad.powi_scalar(2).mul_scalar(factor));

        state.time += 1;

        let time = (state.time as i32).elem();
        let moment_1_corrected = state
            .moment_1
            .clone()
            .div_scalar(1f32 - self.beta_1.powi(time));
        let moment_2_corrected = state
            .moment_2
            .clone()
            .div_scalar(1f32 - self.beta_2.powi(time));
        let grad = moment_1_corrected.div(moment_2_corrected.sqrt().add_scalar(self.epsilon));
        (grad, state)
    }
}
