//! Outbound model capabilities
//!
//! The diffusion math lives in an external inference library. This module
//! defines the narrow interface the scheduling core drives: load a resource
//! for a device profile, render a batch, measure prompt lengths.

use crate::device::DeviceProfile;
use genloop_common::config::ModelConfig;
use image::RgbImage;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Where a loader finds a model's weights
#[derive(Clone)]
pub struct ModelSource {
    pub repo_id: String,
    /// Local cache root; each repository gets its own subdirectory
    pub cache_dir: PathBuf,
    /// Access token for gated repositories
    pub token: Option<String>,
}

impl ModelSource {
    pub fn new(repo_id: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_id: repo_id.into(),
            cache_dir: cache_dir.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn image(config: &ModelConfig) -> Self {
        Self::new(&config.image_repo_id, &config.hf_home).with_token(config.hf_token.clone())
    }

    pub fn video(config: &ModelConfig) -> Self {
        Self::new(&config.video_repo_id, &config.hf_home).with_token(config.hf_token.clone())
    }

    /// Cache directory of this repository, laid out like the hub cache
    pub fn repo_dir(&self) -> PathBuf {
        self.cache_dir
            .join(format!("models--{}", self.repo_id.replace('/', "--")))
    }
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSource")
            .field("repo_id", &self.repo_id)
            .field("cache_dir", &self.cache_dir)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Loads one heavyweight inference resource.
///
/// `load` blocks (weights are read and moved to the device) and is always
/// called from a blocking worker thread.
pub trait ResourceLoader<R>: Send + Sync + 'static {
    /// Human readable name for logs, usually the repository id
    fn describe(&self) -> String;

    fn load(&self, profile: DeviceProfile) -> anyhow::Result<R>;
}

/// Per-item randomness for one render call.
///
/// `None` for an item means library default randomness for that item.
pub type Generators = Vec<Option<u64>>;

/// One batched text-to-image call; every item shares the execution shape
#[derive(Debug, Clone)]
pub struct RenderCall {
    pub prompts: Vec<String>,
    pub negative_prompts: Vec<String>,
    pub steps: u32,
    pub guidance_scale: f32,
    pub width: u32,
    pub height: u32,
    /// Absent when every item runs unseeded
    pub generators: Option<Generators>,
}

impl RenderCall {
    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

/// Output of one render call, in input order
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub images: Vec<RgbImage>,
    /// Non-fatal warnings emitted by the library during the call
    pub warnings: Vec<String>,
}

/// Prompt length diagnostic for one tokenizer of the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TokenInfo {
    Measured {
        tokenizer: String,
        length: usize,
        max_length: usize,
        will_truncate: bool,
    },
    Failed {
        tokenizer: String,
        error: String,
    },
}

impl TokenInfo {
    pub fn measured(tokenizer: impl Into<String>, length: usize, max_length: usize) -> Self {
        TokenInfo::Measured {
            tokenizer: tokenizer.into(),
            length,
            max_length,
            will_truncate: length > max_length,
        }
    }

    pub fn will_truncate(&self) -> bool {
        matches!(self, TokenInfo::Measured { will_truncate: true, .. })
    }
}

/// A loaded text-to-image pipeline.
///
/// Not reentrant: callers hold exclusive access for a full
/// `reset_sampler` + `render` sequence.
pub trait DiffusionPipeline: Send + 'static {
    /// Replace the sampler with a fresh instance built from its config
    fn reset_sampler(&mut self);

    fn render(&mut self, call: &RenderCall) -> anyhow::Result<RenderOutput>;

    fn measure_tokens(&self, prompt: &str) -> Vec<TokenInfo>;
}

/// One image-to-video call
#[derive(Debug, Clone)]
pub struct ClipCall {
    pub image: RgbImage,
    pub num_frames: u32,
    pub fps: u32,
    pub motion_bucket_id: u32,
    pub noise_aug_strength: f32,
    pub decode_chunk_size: u32,
    pub seed: Option<u64>,
}

/// A loaded image-to-video pipeline
pub trait VideoPipeline: Send + 'static {
    fn render_clip(&mut self, call: &ClipCall) -> anyhow::Result<Vec<RgbImage>>;
}
