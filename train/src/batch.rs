use burn::prelude::{Backend, Bool, Int, Tensor};
use dataset::ViewSample;
use glam::UVec2;
use render::SplatRenderer;
use render::gaussian_splats::Splats;
use tracing::trace_span;

use crate::error::BatchError;

/// The render of a single view of a batch.
#[derive(Clone, Debug)]
pub struct ViewRender<B: Backend> {
    /// The zero tensor handed to the renderer. Its gradient is the screen space gradient.
    pub viewspace_holder: Tensor<B, 2>,
    pub viewspace_points: Tensor<B, 2>,
    pub visibility_filter: Tensor<B, 1, Bool>,
    pub radii: Tensor<B, 1, Int>,
    /// `[H, W, 1]`
    pub opacity: Tensor<B, 3>,
    /// `[H, W, 1]`
    pub depth: Tensor<B, 3>,
    pub img_size: UVec2,
}

impl<B: Backend> ViewRender<B> {
    /// Visibility padded with `false` to `rows` entries.
    pub fn visibility(&self, rows: usize) -> Tensor<B, 1, Bool> {
        pad(self.visibility_filter.clone().int(), rows).greater_elem(0)
    }

    /// Radii padded with zeros to `rows` entries.
    pub fn radii(&self, rows: usize) -> Tensor<B, 1, Int> {
        pad(self.radii.clone(), rows)
    }
}

#[derive(Clone, Debug)]
pub struct BatchRenderResult<B: Backend> {
    /// `[B, H, W, 3]`
    pub images: Tensor<B, 4>,
    /// `[B, H, W, 3]`
    pub gt_images: Tensor<B, 4>,
    /// Largest screen radius over the batch.
    pub radii: Tensor<B, 1, Int>,
    /// Visible in any view of the batch.
    pub visibility: Tensor<B, 1, Bool>,
    pub views: Vec<ViewRender<B>>,
}

fn pad<B: Backend>(values: Tensor<B, 1, Int>, rows: usize) -> Tensor<B, 1, Int> {
    let len = values.dims()[0];
    if len >= rows {
        return values;
    }
    let device = values.device();
    Tensor::cat(vec![values, Tensor::zeros([rows - len], &device)], 0)
}

/// Render every view of a batch and reduce the per view outputs.
///
/// Radii are reduced with a maximum and visibility with a logical or. Per view outputs
/// shorter than the number of splats are padded, so both reductions have one entry per splat.
pub fn render_batch<B, R>(
    renderer: &R,
    splats: &Splats<B>,
    batch: &[ViewSample<B>],
) -> Result<BatchRenderResult<B>, BatchError>
where
    B: Backend,
    R: SplatRenderer<B> + ?Sized,
{
    let _span = trace_span!("Render batch", views = batch.len()).entered();

    let first = batch.first().ok_or(BatchError::Empty)?;
    let expected = first.image.dims();
    let device = splats.device();
    let num_points = splats.num_points();

    let mut images = Vec::with_capacity(batch.len());
    let mut gt_images = Vec::with_capacity(batch.len());
    let mut views = Vec::with_capacity(batch.len());

    for (index, view) in batch.iter().enumerate() {
        let found = view.image.dims();
        if found != expected {
            return Err(BatchError::ImageShape {
                index,
                expected,
                found,
            });
        }

        let holder = Tensor::<B, 2>::zeros([num_points, 2], &device).require_grad();
        let img_size = view.img_size();
        let output = renderer.render(splats, &view.camera, img_size, holder.clone());

        let rendered = output.render.dims();
        if rendered != expected {
            return Err(BatchError::RenderShape {
                index,
                expected,
                found: rendered,
            });
        }

        let found = output.radii.dims()[0].max(output.visibility_filter.dims()[0]);
        if found > num_points {
            return Err(BatchError::PointCount {
                index,
                expected: num_points,
                found,
            });
        }

        images.push(output.render);
        gt_images.push(view.image.clone());
        views.push(ViewRender {
            viewspace_holder: holder,
            viewspace_points: output.viewspace_points,
            visibility_filter: output.visibility_filter,
            radii: output.radii,
            opacity: output.opacity,
            depth: output.depth,
            img_size,
        });
    }

    let (radii, visible) = views
        .iter()
        .map(|v| (v.radii(num_points), v.visibility_filter.clone().int()))
        .map(|(r, vis)| (r, pad(vis, num_points)))
        .reduce(|(r1, v1), (r2, v2)| (r1.max_pair(r2), v1.max_pair(v2)))
        .ok_or(BatchError::Empty)?;

    Ok(BatchRenderResult {
        images: Tensor::stack(images, 0),
        gt_images: Tensor::stack(gt_images, 0),
        radii,
        visibility: visible.greater_elem(0),
        views,
    })
}
