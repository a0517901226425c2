mod config;
mod error;
pub mod format;
pub mod image;
mod loader;
mod normalization;
mod sample;
pub mod source;

pub use config::LoadConfig;
pub use error::{DatasetError, FormatError};
pub use format::{DataFormat, DataFormatReader, Split, ViewRecord};
pub use loader::DataPipeline;
pub use normalization::{SceneNormalization, nerf_normalization};
pub use sample::ViewSample;
pub use source::{ImageViewSource, MemoryViewSource, ViewSource};
