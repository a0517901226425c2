use thiserror::Error;

use crate::format::Split;

pub(crate) type Result<T> = std::result::Result<T, DatasetError>;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("IO error while loading dataset: {0}")]
    Io(String),

    #[error("File IO error: {0}")]
    File(#[from] std::io::Error),

    #[error("Error decoding camera parameters: {0}")]
    InvalidCamera(&'static str),

    #[error("Split {split} has {cameras} cameras but {images} images")]
    CountMismatch {
        split: Split,
        cameras: usize,
        images: usize,
    },
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to load format: {0}")]
    Format(#[from] FormatError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("File IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("The {0} split has no views")]
    EmptySplit(Split),

    #[error("View {index} requested but the split has {len} views")]
    MissingView { index: usize, len: usize },

    #[error("No validation split was loaded")]
    NoValidationSplit,

    #[error("Loading worker failed: {0}")]
    Worker(String),

    #[error("Data loading channel was closed")]
    LoaderClosed,
}
