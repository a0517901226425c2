use std::fmt;
use std::path::PathBuf;

use hashbrown::HashMap;
use render::camera::Camera;
use serde::{Deserialize, Serialize};

use crate::error::FormatError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Val,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train => f.write_str("train"),
            Self::Val => f.write_str("val"),
        }
    }
}

/// One view of a dataset, before its image is loaded.
#[derive(Clone, Debug)]
pub struct ViewRecord {
    pub image_path: PathBuf,
    pub camera: Camera,
    pub image_name: String,
}

/// The ordered views of one split, plus whatever else the format wants to pass along.
#[derive(Clone, Debug, Default)]
pub struct DataFormat {
    pub records: Vec<ViewRecord>,
    pub metadata: HashMap<String, String>,
}

impl DataFormat {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn cameras(&self) -> impl Iterator<Item = &Camera> {
        self.records.iter().map(|r| &r.camera)
    }
}

/// Parses a dataset layout on disk (COLMAP, NeRF synthetic, ...) into records.
pub trait DataFormatReader {
    fn load_cameras(&self, split: Split) -> Result<Vec<Camera>, FormatError>;

    /// One image per camera, in the same order.
    fn load_image_paths(&self, cameras: &[Camera], split: Split)
    -> Result<Vec<PathBuf>, FormatError>;

    fn load_metadata(&self, _split: Split) -> Result<HashMap<String, String>, FormatError> {
        Ok(HashMap::new())
    }

    fn load_split(&self, split: Split) -> Result<DataFormat, FormatError> {
        let cameras = self.load_cameras(split)?;
        let paths = self.load_image_paths(&cameras, split)?;
        if paths.len() != cameras.len() {
            return Err(FormatError::CountMismatch {
                split,
                cameras: cameras.len(),
                images: paths.len(),
            });
        }

        let records = cameras
            .into_iter()
            .zip(paths)
            .map(|(camera, image_path)| {
                let image_name = image_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                ViewRecord {
                    image_path,
                    camera,
                    image_name,
                }
            })
            .collect();

        Ok(DataFormat {
            records,
            metadata: self.load_metadata(split)?,
        })
    }
}
