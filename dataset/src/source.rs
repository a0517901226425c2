use std::sync::{Arc, RwLock};

use burn::prelude::Backend;
use image::Rgb32FImage;
use render::camera::Camera;

use crate::error::{DatasetError, Result};
use crate::format::DataFormat;
use crate::image::{ImageCache, load_view_image};
use crate::sample::ViewSample;

/// Random access to the views of one split. Loads may run on worker threads.
pub trait ViewSource<B: Backend>: Send + Sync + 'static {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cameras(&self) -> Vec<Camera>;

    fn load(&self, index: usize, device: &B::Device) -> Result<ViewSample<B>>;
}

// Loaded images can be smaller than what the camera was calibrated for.
fn fit_camera(camera: &Camera, width: u32, height: u32) -> Camera {
    let mut camera = camera.clone();
    if camera.width != width || camera.height != height {
        let sx = width as f32 / camera.width.max(1) as f32;
        let sy = height as f32 / camera.height.max(1) as f32;
        camera.fx *= sx;
        camera.cx *= sx;
        camera.fy *= sy;
        camera.cy *= sy;
        camera.width = width;
        camera.height = height;
    }
    camera
}

/// Reads images from disk, keeping decoded images around up to a memory budget.
pub struct ImageViewSource {
    format: DataFormat,
    max_resolution: Option<u32>,
    cache: RwLock<ImageCache>,
}

impl ImageViewSource {
    pub fn new(format: DataFormat, max_resolution: Option<u32>, cache_mb: usize) -> Self {
        let n_images = format.len();
        Self {
            format,
            max_resolution,
            cache: RwLock::new(ImageCache::new(cache_mb, n_images)),
        }
    }

    fn load_image(&self, index: usize) -> Result<Arc<Rgb32FImage>> {
        // A poisoned cache is only a cache miss.
        if let Some(image) = self.cache.read().ok().and_then(|c| c.try_get(index)) {
            return Ok(image);
        }

        let record = &self.format.records[index];
        let image = Arc::new(load_view_image(
            &record.image_path,
            record.camera.background,
            self.max_resolution,
        )?);
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(index, image.clone());
        }
        Ok(image)
    }
}

impl<B: Backend> ViewSource<B> for ImageViewSource {
    fn len(&self) -> usize {
        self.format.len()
    }

    fn cameras(&self) -> Vec<Camera> {
        self.format.cameras().cloned().collect()
    }

    fn load(&self, index: usize, device: &B::Device) -> Result<ViewSample<B>> {
        let len = self.format.len();
        if index >= len {
            return Err(DatasetError::MissingView { index, len });
        }
        let image = self.load_image(index)?;
        let record = &self.format.records[index];
        let camera = fit_camera(&record.camera, image.width(), image.height());
        Ok(ViewSample::from_image(
            &image,
            camera,
            record.image_name.clone(),
            device,
        ))
    }
}

/// Views that are already decoded in memory.
#[derive(Default)]
pub struct MemoryViewSource {
    views: Vec<(String, Camera, Rgb32FImage)>,
}

impl MemoryViewSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_view(mut self, name: impl Into<String>, camera: Camera, image: Rgb32FImage) -> Self {
        self.push(name, camera, image);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, camera: Camera, image: Rgb32FImage) {
        let camera = fit_camera(&camera, image.width(), image.height());
        self.views.push((name.into(), camera, image));
    }
}

impl<B: Backend> ViewSource<B> for MemoryViewSource {
    fn len(&self) -> usize {
        self.views.len()
    }

    fn cameras(&self) -> Vec<Camera> {
        self.views.iter().map(|(_, c, _)| c.clone()).collect()
    }

    fn load(&self, index: usize, device: &B::Device) -> Result<ViewSample<B>> {
        let (name, camera, image) = self.views.get(index).ok_or(DatasetError::MissingView {
            index,
            len: self.views.len(),
        })?;
        Ok(ViewSample::from_image(image, camera.clone(), name.clone(), device))
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use glam::{Mat3, Vec3};
    use image::{Rgb, RgbImage};
    use render::camera::Camera;

    use super::{ImageViewSource, ViewSource};
    use crate::DatasetError;
    use crate::format::{DataFormat, ViewRecord};

    type Backend = NdArray;

    #[test]
    fn loads_records_and_rescales_intrinsics() {
        let dir = tempfile::tempdir().expect("Temp dir");
        let path = dir.path().join("r_0.png");
        RgbImage::from_pixel(16, 8, Rgb([0, 255, 0]))
            .save(&path)
            .expect("Write png");

        let camera = Camera::new(Mat3::IDENTITY, Vec3::ZERO, 20.0, 20.0, 16, 8);
        let format = DataFormat {
            records: vec![ViewRecord {
                image_path: path,
                camera,
                image_name: "r_0".to_owned(),
            }],
            metadata: Default::default(),
        };
        let source = ImageViewSource::new(format, Some(8), 64);

        let device = Default::default();
        let sample = ViewSource::<Backend>::load(&source, 0, &device).expect("Load view");
        assert_eq!(sample.image.dims(), [4, 8, 3]);
        assert_eq!(sample.camera.width, 8);
        assert!((sample.camera.fx - 10.0).abs() < 1e-5);
        assert_eq!(sample.image_name, "r_0");

        // Second load comes from the cache.
        let again = ViewSource::<Backend>::load(&source, 0, &device).expect("Load view");
        assert_eq!(again.image.dims(), [4, 8, 3]);

        assert!(matches!(
            ViewSource::<Backend>::load(&source, 3, &device),
            Err(DatasetError::MissingView { index: 3, len: 1 })
        ));
    }
}
