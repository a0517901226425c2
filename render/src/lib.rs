#![recursion_limit = "256"]

use burn::prelude::{Backend, Bool, Int, Tensor};
use glam::UVec2;

pub mod attribute;
pub mod camera;
pub mod error;
pub mod gaussian_splats;
pub mod sh;

pub use attribute::{Attribute, AttributeSet};
pub use error::SplatError;

use camera::Camera;
use gaussian_splats::Splats;

/// Everything the rasterizer reports for a single view.
#[derive(Debug, Clone)]
pub struct RenderOutput<B: Backend> {
    /// `[H, W, 3]`
    pub render: Tensor<B, 3>,
    /// Accumulated alpha, `[H, W, 1]`.
    pub opacity: Tensor<B, 3>,
    /// `[H, W, 1]`
    pub depth: Tensor<B, 3>,
    /// Projected means, `[N, 2]`. Carries the screen space gradients.
    pub viewspace_points: Tensor<B, 2>,
    /// `[N]`, true for splats that touched at least one pixel.
    pub visibility_filter: Tensor<B, 1, Bool>,
    /// Screen space radius in pixels, `[N]`. Zero for culled splats.
    pub radii: Tensor<B, 1, Int>,
}

pub trait SplatRenderer<B: Backend> {
    /// Render splats for one camera.
    ///
    /// The rasterizer itself lives outside this workspace. `viewspace_holder` is a zero
    /// `[N, 2]` tensor which must be added to the projected means, so that the screen space
    /// gradients can be read back from it after the backward pass.
    fn render(
        &self,
        splats: &Splats<B>,
        camera: &Camera,
        img_size: UVec2,
        viewspace_holder: Tensor<B, 2>,
    ) -> RenderOutput<B>;
}

impl<B, F> SplatRenderer<B> for F
where
    B: Backend,
    F: Fn(&Splats<B>, &Camera, UVec2, Tensor<B, 2>) -> RenderOutput<B>,
{
    fn render(
        &self,
        splats: &Splats<B>,
        camera: &Camera,
        img_size: UVec2,
        viewspace_holder: Tensor<B, 2>,
    ) -> RenderOutput<B> {
        self(splats, camera, img_size, viewspace_holder)
    }
}
