mod config;
mod error;
mod eval_export;
mod message;
mod train_stream;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use eval_export::DiskSink;
pub use message::PipelineMessage;
pub use train_stream::TrainStream;
