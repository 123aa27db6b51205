//! Explicitly constructed service graph
//!
//! Everything a request handler needs is reachable from one [`ServiceContext`].
//! Tests build their own contexts with fake backends; nothing is global
//! except the process-wide metrics registry used by the binary.

use crate::device::DeviceProfile;
use crate::encoder::{FfmpegEncoder, FrameEncoder};
use crate::image_to_video::{VideoGenerator, VideoModel};
use crate::jobs::JobTracker;
use crate::model::{InferenceGate, ModelHandle, ModelService, ResourceState};
use crate::pipeline::{DiffusionPipeline, ModelSource, ResourceLoader, VideoPipeline};
use crate::reference::{ReferenceLoader, ReferenceVideoLoader};
use crate::scheduler::{BatchScheduler, ImageModel};
use crate::storage::{FsImageStore, ImageStore};
use crate::text_to_image::ImageGenerator;
use crate::warmup::{WarmupController, WarmupStatus};
use genloop_common::{GenLoopConfig, MetricsRegistry, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub type ImageLoader = Arc<dyn ResourceLoader<Box<dyn DiffusionPipeline>>>;
pub type VideoLoader = Arc<dyn ResourceLoader<Box<dyn VideoPipeline>>>;

/// Outbound capabilities plugged into a context
pub struct Backends {
    pub image_loader: ImageLoader,
    /// Absent when video generation is disabled
    pub video_loader: Option<VideoLoader>,
    pub store: Arc<dyn ImageStore>,
    pub encoder: Arc<dyn FrameEncoder>,
}

impl Backends {
    /// Reference CPU pipelines with filesystem storage and ffmpeg encoding
    pub fn reference(config: &GenLoopConfig) -> Self {
        let video_loader: Option<VideoLoader> = if config.video.enabled {
            Some(Arc::new(ReferenceVideoLoader::new(ModelSource::video(&config.model))))
        } else {
            None
        };

        Self {
            image_loader: Arc::new(ReferenceLoader::new(ModelSource::image(&config.model))),
            video_loader,
            store: Arc::new(FsImageStore::new(&config.storage.output_dir)),
            encoder: Arc::new(FfmpegEncoder::new(
                &config.video.ffmpeg_path,
                &config.storage.output_dir,
                &config.storage.temp_dir,
            )),
        }
    }
}

/// Readiness snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub device: DeviceProfile,
    pub image_model: ResourceState,
    pub video_model: Option<ResourceState>,
    pub warmup: WarmupStatus,
    pub tracked_jobs: usize,
    pub available_permits: usize,
}

pub struct ServiceContext {
    config: GenLoopConfig,
    profile: DeviceProfile,
    jobs: Arc<JobTracker>,
    gate: InferenceGate,
    image_model: Arc<ImageModel>,
    images: Arc<ImageGenerator>,
    video_model: Option<Arc<VideoModel>>,
    videos: Option<Arc<VideoGenerator>>,
    warmup: WarmupController,
    metrics: MetricsRegistry,
}

impl ServiceContext {
    pub fn new(
        config: GenLoopConfig,
        profile: DeviceProfile,
        backends: Backends,
        metrics: MetricsRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let jobs = Arc::new(JobTracker::new(metrics.clone()));
        // One gate shared by every model on the accelerator
        let gate = InferenceGate::new(config.scheduler.max_concurrent_inferences);

        let image_model: Arc<ImageModel> = Arc::new(ModelHandle::new(
            backends.image_loader,
            profile,
            metrics.clone(),
        ));
        let scheduler = BatchScheduler::new(
            image_model.clone(),
            gate.clone(),
            config.scheduler.max_steps,
            metrics.clone(),
        );
        let images = Arc::new(ImageGenerator::new(
            scheduler,
            backends.store,
            jobs.clone(),
            config.scheduler.default_micro_batch_size,
            config.scheduler.max_batch_items,
        ));

        let (video_model, videos) = match backends.video_loader {
            Some(loader) => {
                // The video model always runs at reduced precision on CUDA
                let video_profile = DeviceProfile::resolve(&[profile.device], true);
                let model: Arc<VideoModel> =
                    Arc::new(ModelHandle::new(loader, video_profile, metrics.clone()));
                let generator = Arc::new(VideoGenerator::new(
                    model.clone(),
                    gate.clone(),
                    backends.encoder,
                    jobs.clone(),
                ));
                (Some(model), Some(generator))
            }
            None => (None, None),
        };

        let warmup = WarmupController::new(images.clone(), metrics.clone());

        info!(
            device = %profile,
            permits = gate.capacity(),
            video = videos.is_some(),
            "Service context ready"
        );

        Ok(Self {
            config,
            profile,
            jobs,
            gate,
            image_model,
            images,
            video_model,
            videos,
            warmup,
            metrics,
        })
    }

    pub fn config(&self) -> &GenLoopConfig {
        &self.config
    }

    pub fn jobs(&self) -> &Arc<JobTracker> {
        &self.jobs
    }

    pub fn images(&self) -> &Arc<ImageGenerator> {
        &self.images
    }

    pub fn videos(&self) -> Option<&Arc<VideoGenerator>> {
        self.videos.as_ref()
    }

    pub fn warmup(&self) -> &WarmupController {
        &self.warmup
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Release every loaded model
    pub fn unload_all(&self) {
        self.images.unload();
        if let Some(videos) = &self.videos {
            videos.unload();
        }
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            device: self.profile,
            image_model: self.image_model.state(),
            video_model: self.video_model.as_ref().map(|m| m.state()),
            warmup: self.warmup.status(),
            tracked_jobs: self.jobs.len(),
            available_permits: self.gate.available(),
        }
    }

    /// Periodically evict expired jobs
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let max_age = this.config.job_max_age();
            let mut interval = tokio::time::interval(this.config.cleanup_interval());

            loop {
                interval.tick().await;
                let evicted = this.jobs.cleanup(max_age);
                debug!("Job cleanup pass evicted {}", evicted);
            }
        })
    }
}
