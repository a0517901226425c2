use burn::prelude::Config;

#[derive(Config, Debug)]
pub struct LoadConfig {
    /// Views per training batch. The last batch of an epoch may be shorter.
    #[config(default = 1)]
    pub batch_size: usize,
    /// Reshuffle the views at the start of every epoch.
    #[config(default = true)]
    pub shuffle: bool,
    /// Batches being loaded in the background at once. Zero loads on the calling task.
    #[config(default = 2)]
    pub num_workers: usize,
    /// Nr. of loaded batches buffered ahead of the trainer.
    #[config(default = 4)]
    pub prefetch: usize,
    #[config(default = 42)]
    pub seed: u64,
    /// Max resolution of images to load.
    pub max_resolution: Option<u32>,
    /// Keep decoded images in memory, up to this many megabytes.
    #[config(default = 6144)]
    pub cache_mb: usize,
}
