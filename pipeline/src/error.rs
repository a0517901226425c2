use dataset::DatasetError;
use thiserror::Error;
use train::TrainError;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to load data: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Training failed: {0}")]
    Train(#[from] TrainError),

    #[error("The training split has no cameras")]
    NoCameras,
}
