use image::Rgb32FImage;

/// Receives scalars and images keyed by tag, for example a tensorboard writer.
pub trait MetricsSink: Send {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u32);
    fn add_image(&mut self, tag: &str, image: &Rgb32FImage, step: u32);
}

/// Writes scalars to the log and drops images.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u32) {
        log::info!("[{step}] {tag}: {value:.5}");
    }

    fn add_image(&mut self, tag: &str, image: &Rgb32FImage, step: u32) {
        log::debug!("[{step}] {tag}: {}x{} image", image.width(), image.height());
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScalarRecord {
    pub tag: String,
    pub value: f64,
    pub step: u32,
}

/// Keeps everything in memory.
#[derive(Clone, Debug, Default)]
pub struct MetricsRecorder {
    pub scalars: Vec<ScalarRecord>,
    pub images: Vec<(String, Rgb32FImage, u32)>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest value written under `tag`.
    pub fn scalar(&self, tag: &str) -> Option<f64> {
        self.scalars
            .iter()
            .rev()
            .find(|s| s.tag == tag)
            .map(|s| s.value)
    }

    pub fn image(&self, tag: &str) -> Option<&Rgb32FImage> {
        self.images
            .iter()
            .rev()
            .find(|(t, _, _)| t == tag)
            .map(|(_, img, _)| img)
    }
}

impl MetricsSink for MetricsRecorder {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u32) {
        self.scalars.push(ScalarRecord {
            tag: tag.to_owned(),
            value,
            step,
        });
    }

    fn add_image(&mut self, tag: &str, image: &Rgb32FImage, step: u32) {
        self.images.push((tag.to_owned(), image.clone(), step));
    }
}
