use std::path::{Path, PathBuf};

use image::{DynamicImage, Rgb32FImage};
use train::metrics::MetricsSink;

/// Saves eval images as PNGs under `{root}/eval_{step}/` and forwards everything to an
/// inner sink.
pub struct DiskSink<S> {
    root: PathBuf,
    inner: S,
}

impl<S: MetricsSink> DiskSink<S> {
    pub fn new(root: impl Into<PathBuf>, inner: S) -> Self {
        Self {
            root: root.into(),
            inner,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// `test_view_a/render` becomes `eval_{step}/test_view_a/render.png`.
    pub fn image_path(&self, tag: &str, step: u32) -> PathBuf {
        let mut path = self.root.join(format!("eval_{step}"));
        for part in tag.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path.set_extension("png");
        path
    }
}

fn save_image(image: &Rgb32FImage, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    DynamicImage::from(image.clone()).to_rgb8().save(path)?;
    Ok(())
}

impl<S: MetricsSink> MetricsSink for DiskSink<S> {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u32) {
        self.inner.add_scalar(tag, value, step);
    }

    fn add_image(&mut self, tag: &str, image: &Rgb32FImage, step: u32) {
        let path = self.image_path(tag, step);
        log::info!("Saving eval view to {path:?}");
        if let Err(err) = save_image(image, &path) {
            log::warn!("Failed to save {tag}: {err}");
        }
        self.inner.add_image(tag, image, step);
    }
}
