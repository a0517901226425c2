#![recursion_limit = "256"]

pub mod batch;
pub mod config;
pub mod error;
pub mod eval;
pub mod loss;
pub mod lpips;
pub mod metrics;
pub mod msg;
pub mod optimizer;
pub mod refine;
pub mod scheduler;
pub mod train;
pub mod update_rule;

mod quat_vec;
mod ssim;
mod stats;

pub use error::{BatchError, ConfigError, TrainError};
pub use stats::GradStatistic;
