use std::sync::Arc;

use burn::prelude::Backend;
use futures::{StreamExt, stream};
use rand::SeedableRng;
use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::LoadConfig;
use crate::error::{DatasetError, Result};
use crate::format::{DataFormat, DataFormatReader, Split};
use crate::sample::ViewSample;
use crate::source::{ImageViewSource, ViewSource};

/// Walks a split batch by batch and starts a new (reshuffled) epoch when it runs out.
struct EpochCursor {
    order: Vec<usize>,
    pos: usize,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
}

impl EpochCursor {
    fn new(len: usize, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        let mut cursor = Self {
            order: (0..len).collect(),
            pos: 0,
            batch_size: batch_size.max(1),
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        };
        cursor.start_epoch();
        cursor
    }

    fn start_epoch(&mut self) {
        self.pos = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    fn next_indices(&mut self) -> Vec<usize> {
        if self.pos >= self.order.len() {
            self.start_epoch();
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let indices = self.order[self.pos..end].to_vec();
        self.pos = end;
        indices
    }
}

fn load_batch<B: Backend>(
    source: &dyn ViewSource<B>,
    indices: &[usize],
    device: &B::Device,
) -> Result<Vec<ViewSample<B>>> {
    indices.iter().map(|&i| source.load(i, device)).collect()
}

struct Prefetcher<B: Backend> {
    receiver: mpsc::Receiver<Result<Vec<ViewSample<B>>>>,
    task: JoinHandle<()>,
}

impl<B: Backend> Drop for Prefetcher<B> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<B: Backend> Prefetcher<B> {
    fn spawn(
        source: Arc<dyn ViewSource<B>>,
        mut cursor: EpochCursor,
        device: B::Device,
        num_workers: usize,
        capacity: usize,
    ) -> Self {
        // The bounded size == number of batches to prefetch.
        let (sender, receiver) = mpsc::channel(capacity.max(1));

        let task = tokio::spawn(async move {
            let mut batches = stream::iter(std::iter::repeat_with(move || cursor.next_indices()))
                .map(move |indices| {
                    let source = source.clone();
                    let device = device.clone();
                    async move {
                        tokio::task::spawn_blocking(move || {
                            load_batch(source.as_ref(), &indices, &device)
                        })
                        .await
                        .map_err(|e| DatasetError::Worker(e.to_string()))?
                    }
                })
                .buffered(num_workers);

            while let Some(batch) = batches.next().await {
                let failed = batch.is_err();
                if sender.send(batch).await.is_err() || failed {
                    break;
                }
            }
        });

        Self { receiver, task }
    }

    async fn next(&mut self) -> Result<Vec<ViewSample<B>>> {
        self.receiver
            .recv()
            .await
            .ok_or(DatasetError::LoaderClosed)?
    }
}

enum LoadMode<B: Backend> {
    Inline(EpochCursor),
    // Started on first use, so construction doesn't need a runtime.
    Prefetch(Option<Prefetcher<B>>),
}

struct SplitLoader<B: Backend> {
    source: Arc<dyn ViewSource<B>>,
    mode: LoadMode<B>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    num_workers: usize,
    prefetch: usize,
    restarts: u64,
    device: B::Device,
}

impl<B: Backend> SplitLoader<B> {
    fn new(
        split: Split,
        source: Arc<dyn ViewSource<B>>,
        config: &LoadConfig,
        device: &B::Device,
    ) -> Result<Self> {
        if source.is_empty() {
            return Err(DatasetError::EmptySplit(split));
        }
        let seed = match split {
            Split::Train => config.seed,
            Split::Val => config.seed.wrapping_add(1),
        };
        let mut loader = Self {
            source,
            mode: LoadMode::Prefetch(None),
            batch_size: config.batch_size,
            shuffle: config.shuffle,
            seed,
            num_workers: config.num_workers,
            prefetch: config.prefetch,
            restarts: 0,
            device: device.clone(),
        };
        loader.reset();
        Ok(loader)
    }

    fn cursor(&self) -> EpochCursor {
        EpochCursor::new(
            self.source.len(),
            self.batch_size,
            self.shuffle,
            self.seed.wrapping_add(self.restarts),
        )
    }

    // Every restart reseeds, so inline and prefetched loading see the same orders.
    fn reset(&mut self) {
        self.restarts += 1;
        self.mode = if self.num_workers == 0 {
            LoadMode::Inline(self.cursor())
        } else {
            // Dropping the old prefetcher stops its workers.
            LoadMode::Prefetch(None)
        };
    }

    async fn next(&mut self) -> Result<Vec<ViewSample<B>>> {
        match &mut self.mode {
            LoadMode::Inline(cursor) => {
                let indices = cursor.next_indices();
                load_batch(self.source.as_ref(), &indices, &self.device)
            }
            LoadMode::Prefetch(Some(prefetcher)) => prefetcher.next().await,
            LoadMode::Prefetch(None) => {
                let mut prefetcher = Prefetcher::spawn(
                    self.source.clone(),
                    self.cursor(),
                    self.device.clone(),
                    self.num_workers,
                    self.prefetch,
                );
                let batch = prefetcher.next().await;
                self.mode = LoadMode::Prefetch(Some(prefetcher));
                batch
            }
        }
    }
}

/// Batched access to the train and validation splits.
///
/// Neither split ever runs out: once every view of an epoch was handed out, the next call
/// starts a new epoch.
pub struct DataPipeline<B: Backend> {
    train: SplitLoader<B>,
    val: Option<SplitLoader<B>>,
}

impl<B: Backend> DataPipeline<B> {
    pub fn new(
        train: Arc<dyn ViewSource<B>>,
        val: Option<Arc<dyn ViewSource<B>>>,
        config: &LoadConfig,
        device: &B::Device,
    ) -> Result<Self> {
        let train = SplitLoader::new(Split::Train, train, config, device)?;
        let val = val
            .map(|val| SplitLoader::new(Split::Val, val, config, device))
            .transpose()?;
        log::info!(
            "Data pipeline with {} train and {} validation views",
            train.source.len(),
            val.as_ref().map_or(0, |v| v.source.len())
        );
        Ok(Self { train, val })
    }

    pub fn from_formats(
        train: DataFormat,
        val: Option<DataFormat>,
        config: &LoadConfig,
        device: &B::Device,
    ) -> Result<Self> {
        let source = |format: DataFormat| -> Arc<dyn ViewSource<B>> {
            Arc::new(ImageViewSource::new(
                format,
                config.max_resolution,
                config.cache_mb,
            ))
        };
        let val = val.filter(|v| !v.is_empty()).map(&source);
        Self::new(source(train), val, config, device)
    }

    /// Read both splits from a dataset format. An empty validation split is skipped.
    pub fn from_reader(
        reader: &impl DataFormatReader,
        config: &LoadConfig,
        device: &B::Device,
    ) -> Result<Self> {
        let train = reader.load_split(Split::Train)?;
        let val = reader.load_split(Split::Val)?;
        Self::from_formats(train, Some(val), config, device)
    }

    pub fn train_len(&self) -> usize {
        self.train.source.len()
    }

    pub fn val_len(&self) -> usize {
        self.val.as_ref().map_or(0, |v| v.source.len())
    }

    pub fn batch_size(&self) -> usize {
        self.train.batch_size.max(1)
    }

    pub fn has_val(&self) -> bool {
        self.val.is_some()
    }

    pub fn train_source(&self) -> &Arc<dyn ViewSource<B>> {
        &self.train.source
    }

    pub async fn next_train(&mut self) -> Result<Vec<ViewSample<B>>> {
        self.train.next().await
    }

    pub async fn next_val(&mut self) -> Result<Vec<ViewSample<B>>> {
        self.val
            .as_mut()
            .ok_or(DatasetError::NoValidationSplit)?
            .next()
            .await
    }

    pub fn reset_train(&mut self) {
        self.train.reset();
    }

    pub fn reset_val(&mut self) {
        if let Some(val) = &mut self.val {
            val.reset();
        }
    }
}
