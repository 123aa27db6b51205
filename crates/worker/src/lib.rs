//! GenLoop Worker
//!
//! Inference scheduling core for generative media models: a lazily loaded
//! model resource behind a concurrency gate, a shape-grouping batch
//! scheduler, an in-memory job tracker and best-effort warmup.

pub mod context;
pub mod device;
pub mod encoder;
pub mod image_to_video;
pub mod jobs;
pub mod model;
pub mod pipeline;
pub mod reference;
pub mod request;
pub mod scheduler;
pub mod storage;
pub mod text_to_image;
pub mod warmup;

#[cfg(test)]
mod testing;

pub use context::{Backends, HealthReport, ServiceContext};
pub use device::{DeviceKind, DeviceProfile, Precision};
pub use image_to_video::{VideoGenerator, VideoOptions};
pub use jobs::{Job, JobId, JobStatus, JobTracker, JobUpdate};
pub use model::{InferenceGate, ModelHandle, ModelService, ResourceState};
pub use pipeline::ModelSource;
pub use request::{ArtStyle, BatchOptions, GenerationRequest, GenerationResult, SeedPolicy};
pub use scheduler::BatchScheduler;
pub use text_to_image::{BatchItem, ImageGenerator, ImageOutput};
pub use warmup::WarmupController;
