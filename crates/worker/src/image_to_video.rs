//! Image-to-video generation: one clip per job, looped to length by the encoder

use crate::encoder::FrameEncoder;
use crate::jobs::{JobId, JobStatus, JobTracker, JobUpdate};
use crate::model::{InferenceGate, ModelHandle, ModelService};
use crate::pipeline::{ClipCall, VideoPipeline};
use async_trait::async_trait;
use genloop_common::{GenLoopError, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

pub type VideoModel = ModelHandle<Box<dyn VideoPipeline>>;

/// Short side ceiling of the video model's input
pub const MAX_SHORT_SIDE: u32 = 576;
const MIN_SIDE: u32 = 256;
const DECODE_CHUNK_SIZE: u32 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoOptions {
    #[serde(default = "default_duration")]
    pub duration_minutes: f32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Motion bucket; higher means more movement
    #[serde(default = "default_motion")]
    pub motion: u32,

    /// Noise augmentation; lower keeps the clip closer to the source image
    #[serde(default = "default_preserve_strength")]
    pub preserve_strength: f32,

    #[serde(default = "default_num_frames")]
    pub num_frames: u32,

    #[serde(default = "default_enhance")]
    pub enhance_quality: bool,

    #[serde(default = "default_seed")]
    pub seed: Option<u64>,
}

fn default_duration() -> f32 {
    30.0
}

fn default_fps() -> u32 {
    24
}

fn default_motion() -> u32 {
    96
}

fn default_preserve_strength() -> f32 {
    0.02
}

fn default_num_frames() -> u32 {
    24
}

fn default_enhance() -> bool {
    true
}

fn default_seed() -> Option<u64> {
    Some(1234)
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            duration_minutes: default_duration(),
            fps: default_fps(),
            motion: default_motion(),
            preserve_strength: default_preserve_strength(),
            num_frames: default_num_frames(),
            enhance_quality: default_enhance(),
            seed: default_seed(),
        }
    }
}

impl VideoOptions {
    pub fn validate(&self) -> Result<()> {
        if !(0.1..=240.0).contains(&self.duration_minutes) {
            return Err(GenLoopError::validation(format!(
                "duration_minutes must be in 0.1..=240, got {}",
                self.duration_minutes
            )));
        }
        if !(8..=30).contains(&self.fps) {
            return Err(GenLoopError::validation(format!(
                "fps must be in 8..=30, got {}",
                self.fps
            )));
        }
        if self.motion > 255 {
            return Err(GenLoopError::validation(format!(
                "motion must be in 0..=255, got {}",
                self.motion
            )));
        }
        if !(0.0..=1.0).contains(&self.preserve_strength) {
            return Err(GenLoopError::validation(format!(
                "preserve_strength must be in 0..=1, got {}",
                self.preserve_strength
            )));
        }
        if !(14..=25).contains(&self.num_frames) {
            return Err(GenLoopError::validation(format!(
                "num_frames must be in 14..=25, got {}",
                self.num_frames
            )));
        }
        Ok(())
    }
}

/// Scale so the short side fits the model, then snap both sides down to
/// multiples of 8 with a floor of 256
pub fn resize_for_model(width: u32, height: u32) -> (u32, u32) {
    let short = width.min(height);
    let (mut w, mut h) = (width, height);
    if short > MAX_SHORT_SIDE {
        let scale = MAX_SHORT_SIDE as f64 / short as f64;
        w = (width as f64 * scale) as u32;
        h = (height as f64 * scale) as u32;
    }
    (MIN_SIDE.max(w / 8 * 8), MIN_SIDE.max(h / 8 * 8))
}

/// Ping-pong loop: forward frames, then back without repeating either end
pub fn seamless_loop<T: Clone>(mut frames: Vec<T>) -> Vec<T> {
    if frames.len() < 3 {
        return frames;
    }
    let back: Vec<T> = frames[1..frames.len() - 1].iter().rev().cloned().collect();
    frames.extend(back);
    frames
}

/// Mild sharpening: `1.15 * frame - 0.15 * blur(frame)`
pub fn enhance_frame(frame: &RgbImage) -> RgbImage {
    let blurred = imageops::blur(frame, 1.0);
    let mut out = frame.clone();
    for (pixel, soft) in out.pixels_mut().zip(blurred.pixels()) {
        for c in 0..3 {
            let v = 1.15 * pixel.0[c] as f32 - 0.15 * soft.0[c] as f32;
            pixel.0[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

pub struct VideoGenerator {
    model: Arc<VideoModel>,
    gate: InferenceGate,
    encoder: Arc<dyn FrameEncoder>,
    jobs: Arc<JobTracker>,
}

impl VideoGenerator {
    pub fn new(
        model: Arc<VideoModel>,
        gate: InferenceGate,
        encoder: Arc<dyn FrameEncoder>,
        jobs: Arc<JobTracker>,
    ) -> Self {
        Self {
            model,
            gate,
            encoder,
            jobs,
        }
    }

    /// Validate, create a job and render the clip in the background
    pub fn submit_clip(self: &Arc<Self>, image_bytes: Vec<u8>, options: VideoOptions) -> Result<JobId> {
        options.validate()?;
        if image_bytes.is_empty() {
            return Err(GenLoopError::validation("uploaded image is empty"));
        }

        let metadata = match serde_json::to_value(&options)? {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let job_id = self.jobs.create(metadata);
        info!(job_id = %job_id, frames = options.num_frames, "Submitted video clip");

        let this = self.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_job(&id, image_bytes, options).await {
                error!(job_id = %id, "Video job failed: {}", e);
                this.jobs.update(&id, JobUpdate::failed(e.to_string()));
            }
        });

        Ok(job_id)
    }

    async fn run_job(&self, job_id: &str, image_bytes: Vec<u8>, options: VideoOptions) -> Result<()> {
        self.jobs.update(job_id, JobUpdate::status(JobStatus::Loading));
        let source = tokio::task::spawn_blocking(move || image::load_from_memory(&image_bytes))
            .await
            .map_err(|e| GenLoopError::internal(format!("image decode task failed: {}", e)))?
            .map_err(|e| GenLoopError::validation(format!("could not decode image: {}", e)))?
            .to_rgb8();

        self.jobs.update(job_id, JobUpdate::status(JobStatus::Generating));
        let (frames, width, height) = self.render_clip(source, &options).await?;

        self.jobs.update(job_id, JobUpdate::status(JobStatus::Encoding));
        let path = self
            .encoder
            .create_looped_video(frames, options.fps, options.duration_minutes, job_id)
            .await?;

        self.jobs.update(
            job_id,
            JobUpdate::done(json!({
                "video_path": path.to_string_lossy(),
                "width": width,
                "height": height,
                "fps": options.fps,
                "duration_minutes": options.duration_minutes,
            })),
        );
        info!(job_id = %job_id, "Video job done");

        Ok(())
    }

    /// Resize, render under a gate permit, enhance and loop.
    /// Returns the frames and the size they were rendered at.
    pub async fn render_clip(&self, source: RgbImage, options: &VideoOptions) -> Result<(Vec<RgbImage>, u32, u32)> {
        let pipeline = self.model.ensure_loaded().await?;

        let (width, height) = resize_for_model(source.width(), source.height());
        let call = ClipCall {
            image: if source.dimensions() == (width, height) {
                source
            } else {
                imageops::resize(&source, width, height, FilterType::Lanczos3)
            },
            num_frames: options.num_frames,
            fps: options.fps,
            motion_bucket_id: options.motion,
            noise_aug_strength: options.preserve_strength,
            decode_chunk_size: DECODE_CHUNK_SIZE,
            seed: options.seed,
        };
        let enhance = options.enhance_quality;

        // Only the render holds the permit; it moves with the blocking task
        let permit = self.gate.acquire().await?;
        let rendered = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<RgbImage>> {
            let frames = pipeline.lock().render_clip(&call);
            drop(permit);
            let frames = frames?;
            anyhow::ensure!(!frames.is_empty(), "pipeline returned no frames");
            Ok(frames)
        })
        .await;
        let frames = generation_outcome(rendered)?;

        let finished = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<RgbImage>> {
            let frames = if enhance {
                frames.iter().map(enhance_frame).collect()
            } else {
                frames
            };
            Ok(seamless_loop(frames))
        })
        .await;
        let frames = generation_outcome(finished)?;

        Ok((frames, width, height))
    }
}

fn generation_outcome(
    joined: std::result::Result<anyhow::Result<Vec<RgbImage>>, tokio::task::JoinError>,
) -> Result<Vec<RgbImage>> {
    match joined {
        Ok(Ok(frames)) => Ok(frames),
        Ok(Err(e)) => Err(GenLoopError::generation(format!("Video generation failed: {:#}", e))),
        Err(e) => Err(GenLoopError::generation(format!(
            "Video generation failed: render task failed: {}",
            e
        ))),
    }
}

#[async_trait]
impl ModelService for VideoGenerator {
    fn name(&self) -> String {
        self.model.describe()
    }

    async fn ensure_loaded(&self) -> Result<()> {
        self.model.ensure_loaded().await.map(|_| ())
    }

    fn unload(&self) {
        self.model.unload();
    }

    fn is_loaded(&self) -> bool {
        self.model.is_loaded()
    }
}
