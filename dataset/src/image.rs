use std::path::Path;
use std::sync::Arc;

use glam::Vec3;
use image::{DynamicImage, Rgb32FImage};

// Take from image crate, just to be sure logic here matches exactly.
pub(crate) fn downscaled_size(width: u32, height: u32, max_res: u32) -> (u32, u32) {
    if width <= max_res && height <= max_res {
        return (width, height);
    }
    let wratio = f64::from(max_res) / f64::from(width);
    let hratio = f64::from(max_res) / f64::from(height);
    let ratio = f64::min(wratio, hratio);
    let nw = u64::max((f64::from(width) * ratio).round() as u64, 1);
    let nh = u64::max((f64::from(height) * ratio).round() as u64, 1);
    (nw as u32, nh as u32)
}

/// Load an image as float RGB in [0, 1].
///
/// Grayscale images are expanded to three channels. Images with alpha are composited
/// onto `background`, treating the alpha as un-premultiplied.
pub fn load_view_image(
    path: &Path,
    background: Vec3,
    max_resolution: Option<u32>,
) -> image::ImageResult<Rgb32FImage> {
    let img = image::open(path)?;
    let img = match max_resolution {
        Some(max_res) if img.width() > max_res || img.height() > max_res => {
            img.resize(max_res, max_res, image::imageops::FilterType::Triangle)
        }
        _ => img,
    };
    Ok(composite_on_background(img, background))
}

pub fn composite_on_background(image: DynamicImage, background: Vec3) -> Rgb32FImage {
    if !image.color().has_alpha() {
        return image.to_rgb32f();
    }

    let rgba = image.to_rgba32f();
    let bg = background.to_array();
    let mut rgb = Rgb32FImage::new(rgba.width(), rgba.height());
    for (out, pixel) in rgb.pixels_mut().zip(rgba.pixels()) {
        let alpha = pixel[3];
        for c in 0..3 {
            out[c] = pixel[c] * alpha + bg[c] * (1.0 - alpha);
        }
    }
    rgb
}

// Cache at most some nr. of megabytes of decoded images.
pub(crate) struct ImageCache {
    states: Vec<Option<Arc<Rgb32FImage>>>,
    max_size: usize,
    size: usize,
}

impl ImageCache {
    pub(crate) fn new(max_size: usize, n_images: usize) -> Self {
        Self {
            states: vec![None; n_images],
            max_size,
            size: 0,
        }
    }

    pub(crate) fn try_get(&self, index: usize) -> Option<Arc<Rgb32FImage>> {
        self.states.get(index).cloned().flatten()
    }

    pub(crate) fn insert(&mut self, index: usize, data: Arc<Rgb32FImage>) {
        let data_size_mb = std::mem::size_of_val(data.as_raw().as_slice()) / (1024 * 1024);

        if self.size + data_size_mb < self.max_size
            && self.states.get(index).is_some_and(|s| s.is_none())
        {
            self.states[index] = Some(data);
            self.size += data_size_mb;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use glam::Vec3;
    use image::{GrayImage, Luma, Rgb32FImage, Rgba, RgbaImage};

    use super::{ImageCache, downscaled_size, load_view_image};

    #[test]
    fn alpha_is_composited_onto_background() {
        let dir = tempfile::tempdir().expect("Temp dir");
        let path = dir.path().join("view.png");
        RgbaImage::from_pixel(2, 2, Rgba([255, 0, 0, 0]))
            .save(&path)
            .expect("Write png");

        let on_white = load_view_image(&path, Vec3::ONE, None).expect("Load png");
        assert_eq!(on_white.get_pixel(1, 1).0, [1.0, 1.0, 1.0]);

        let on_black = load_view_image(&path, Vec3::ZERO, None).expect("Load png");
        assert_eq!(on_black.get_pixel(0, 0).0, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn half_alpha_blends() {
        let dir = tempfile::tempdir().expect("Temp dir");
        let path = dir.path().join("view.png");
        RgbaImage::from_pixel(1, 1, Rgba([255, 0, 0, 255 / 2]))
            .save(&path)
            .expect("Write png");

        let img = load_view_image(&path, Vec3::ZERO, None).expect("Load png");
        let [r, g, b] = img.get_pixel(0, 0).0;
        assert!((r - 127.0 / 255.0).abs() < 1e-3);
        assert_eq!((g, b), (0.0, 0.0));
    }

    #[test]
    fn grayscale_is_expanded_and_downscaled() {
        let dir = tempfile::tempdir().expect("Temp dir");
        let path = dir.path().join("gray.png");
        GrayImage::from_pixel(8, 4, Luma([51]))
            .save(&path)
            .expect("Write png");

        let img = load_view_image(&path, Vec3::ONE, Some(4)).expect("Load png");
        assert_eq!(img.dimensions(), (4, 2));
        let [r, g, b] = img.get_pixel(3, 1).0;
        assert!((r - 0.2).abs() < 1e-3);
        assert_eq!(r, g);
        assert_eq!(g, b);
    }

    #[test]
    fn downscale_keeps_aspect() {
        assert_eq!(downscaled_size(1920, 1080, 960), (960, 540));
        assert_eq!(downscaled_size(100, 50, 960), (100, 50));
    }

    #[test]
    fn cache_respects_budget() {
        let mut cache = ImageCache::new(1, 2);
        // 512 * 512 * 3 floats is 3MB, over the budget.
        cache.insert(0, Arc::new(Rgb32FImage::new(512, 512)));
        assert!(cache.try_get(0).is_none());

        cache.insert(1, Arc::new(Rgb32FImage::new(4, 4)));
        assert!(cache.try_get(1).is_some());
        assert!(cache.try_get(5).is_none());
    }
}
