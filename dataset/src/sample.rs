use burn::prelude::{Backend, Tensor, TensorData};
use burn::tensor::backend::AutodiffBackend;
use glam::UVec2;
use image::Rgb32FImage;
use render::camera::Camera;

/// A loaded view, ready to be rendered against.
#[derive(Clone, Debug)]
pub struct ViewSample<B: Backend> {
    /// `[H, W, 3]` in [0, 1].
    pub image: Tensor<B, 3>,
    pub camera: Camera,
    pub image_name: String,
}

impl<B: Backend> ViewSample<B> {
    pub fn from_image(
        image: &Rgb32FImage,
        camera: Camera,
        image_name: String,
        device: &B::Device,
    ) -> Self {
        let (w, h) = image.dimensions();
        let data = TensorData::new(image.as_raw().clone(), [h as usize, w as usize, 3]);
        Self {
            image: Tensor::from_data(data, device),
            camera,
            image_name,
        }
    }

    pub fn img_size(&self) -> UVec2 {
        let [h, w, _] = self.image.dims();
        glam::uvec2(w as u32, h as u32)
    }
}

impl<B: AutodiffBackend> ViewSample<B> {
    pub fn inner(&self) -> ViewSample<B::InnerBackend> {
        ViewSample {
            image: self.image.clone().inner(),
            camera: self.camera.clone(),
            image_name: self.image_name.clone(),
        }
    }
}
