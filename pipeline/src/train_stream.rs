use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_fn_stream::{TryStreamEmitter, try_fn_stream};
use burn::tensor::backend::AutodiffBackend;
use dataset::{DataPipeline, ViewSample, nerf_normalization};
use futures::Stream;
use render::SplatRenderer;
use render::gaussian_splats::Splats;
use train::config::TrainConfig;
use train::eval::Validator;
use train::lpips::FeatureExtractor;
use train::metrics::{LogSink, MetricsSink};
use train::train::SplatTrainer;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::eval_export::DiskSink;
use crate::message::PipelineMessage;

type InnerBackend<AB> = <AB as AutodiffBackend>::InnerBackend;

/// The training loop of one scene.
///
/// Nothing runs until the stream returned by [`TrainStream::run`] is polled, and dropping
/// that stream stops training at the next step boundary.
pub struct TrainStream<AB: AutodiffBackend, R> {
    pipeline_config: PipelineConfig,
    train_config: TrainConfig,
    data: DataPipeline<AB>,
    splats: Splats<InnerBackend<AB>>,
    renderer: Arc<R>,
    scene_extent: f32,
    train_features: Option<Arc<dyn FeatureExtractor<AB>>>,
    eval_features: Option<Arc<dyn FeatureExtractor<InnerBackend<AB>>>>,
    sink: Box<dyn MetricsSink>,
}

impl<AB, R> TrainStream<AB, R>
where
    AB: AutodiffBackend,
    R: SplatRenderer<AB> + SplatRenderer<InnerBackend<AB>> + Send + Sync + 'static,
{
    /// The scene extent is derived from the training cameras.
    pub fn new(
        pipeline_config: PipelineConfig,
        train_config: TrainConfig,
        data: DataPipeline<AB>,
        splats: Splats<InnerBackend<AB>>,
        renderer: Arc<R>,
    ) -> Result<Self> {
        let cameras = data.train_source().cameras();
        if cameras.is_empty() {
            return Err(PipelineError::NoCameras);
        }
        let scene_extent = nerf_normalization(&cameras).radius;

        let sink: Box<dyn MetricsSink> = if pipeline_config.eval_save_to_disk {
            Box::new(DiskSink::new(Path::new(&pipeline_config.export_path), LogSink))
        } else {
            Box::new(LogSink)
        };

        Ok(Self {
            pipeline_config,
            train_config,
            data,
            splats,
            renderer,
            scene_extent,
            train_features: None,
            eval_features: None,
            sink,
        })
    }

    /// Feature networks for the perceptual loss and the LPIPS validation metric.
    pub fn with_lpips(
        mut self,
        train: Option<Arc<dyn FeatureExtractor<AB>>>,
        eval: Option<Arc<dyn FeatureExtractor<InnerBackend<AB>>>>,
    ) -> Self {
        self.train_features = train;
        self.eval_features = eval;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_scene_extent(mut self, scene_extent: f32) -> Self {
        self.scene_extent = scene_extent;
        self
    }

    pub fn scene_extent(&self) -> f32 {
        self.scene_extent
    }

    // One pass over the validation split.
    async fn validation_views(data: &mut DataPipeline<AB>) -> Result<Vec<ViewSample<InnerBackend<AB>>>> {
        let count = data.val_len();
        data.reset_val();
        let mut views = Vec::with_capacity(count);
        while views.len() < count {
            let batch = data.next_val().await?;
            views.extend(batch.iter().map(|v| v.inner()));
        }
        views.truncate(count);
        Ok(views)
    }

    pub fn run(self) -> impl Stream<Item = anyhow::Result<PipelineMessage<InnerBackend<AB>>>> {
        try_fn_stream(|emitter: TryStreamEmitter<PipelineMessage<InnerBackend<AB>>, anyhow::Error>| async move {
            let Self {
                pipeline_config,
                train_config,
                mut data,
                mut splats,
                renderer,
                scene_extent,
                train_features,
                eval_features,
                mut sink,
            } = self;

            log::info!("Using seed {}", pipeline_config.seed);
            AB::seed(pipeline_config.seed);

            let device = splats.device();
            let mut trainer = SplatTrainer::<AB>::new(&train_config, &splats, scene_extent, train_features)
                .context("Failed to set up training")?;
            let validator = Validator::<InnerBackend<AB>>::new(eval_features, &device);

            let mut train_duration = Duration::from_secs(0);
            let total_steps = train_config.total_steps;
            let mut last_iter = pipeline_config.start_iter;

            log::info!("Start training loop.");
            for iter in pipeline_config.start_iter..total_steps {
                log::debug!("Training iteration {} of {}", iter + 1, total_steps);
                let step_time = Instant::now();

                let batch = data
                    .next_train()
                    .await
                    .context("Failed to load training batch")?;
                let stats = trainer.step(iter, &batch, &mut splats, &*renderer)?;

                // We just finished iter 'iter', now starting iter + 1.
                let iter = iter + 1;
                last_iter = iter;
                let is_last_step = iter == total_steps;

                let refine = trainer.refine_if_needed(iter, &mut splats)?;
                let opacity_reset = trainer.reset_opacity_if_needed(iter, &mut splats)?;

                // Add up time from this step.
                train_duration += step_time.elapsed();

                // Emit some messages. Important to not count these in the training time (as this might pause).
                if let Some(stats) = refine {
                    emitter
                        .emit(PipelineMessage::RefineStep {
                            stats: Box::new(stats),
                            iter,
                        })
                        .await;
                }
                if opacity_reset {
                    emitter.emit(PipelineMessage::OpacityReset { iter }).await;
                }

                let eval_due = pipeline_config.eval_every > 0 && iter % pipeline_config.eval_every == 0;
                if data.has_val() && (eval_due || is_last_step) {
                    log::info!("Running evaluation for iteration {iter}");
                    let views = Self::validation_views(&mut data)
                        .await
                        .context("Failed to load validation views")?;
                    let metrics = validator
                        .validate(&*renderer, &splats, &views, &mut *sink, iter)
                        .context("Failed to run eval")?;
                    emitter
                        .emit(PipelineMessage::EvalResult { iter, metrics })
                        .await;
                }

                let update_due =
                    pipeline_config.update_every > 0 && iter % pipeline_config.update_every == 0;
                if update_due || is_last_step {
                    emitter
                        .emit(PipelineMessage::TrainStep {
                            splats: Box::new(splats.clone()),
                            stats: Box::new(stats),
                            iter,
                            total_elapsed: train_duration,
                        })
                        .await;
                }
            }

            log::info!(
                "Finished training at iteration {last_iter} with {} splats in {:.1}s",
                splats.num_points(),
                train_duration.as_secs_f32()
            );
            emitter
                .emit(PipelineMessage::Finished {
                    splats: Box::new(splats),
                    iter: last_iter,
                })
                .await;
            Ok(())
        })
    }
}
