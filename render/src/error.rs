use thiserror::Error;

use crate::Attribute;

#[derive(Debug, Error)]
pub enum SplatError {
    #[error("Shape mismatch for {attribute}: expected {expected:?}, got {found:?}")]
    ShapeMismatch {
        attribute: Attribute,
        expected: [usize; 2],
        found: [usize; 2],
    },

    #[error("Mask has {found} entries but there are {expected} splats")]
    SizeMismatch { expected: usize, found: usize },

    #[error("Attribute {0} is missing")]
    MissingAttribute(Attribute),

    #[error("Failed to read tensor data: {0}")]
    Data(String),
}
