//! Configuration structures for GenLoop
//!
//! Configurations are loaded from YAML files and can be overridden by
//! `GENLOOP_`-prefixed environment variables (`__` separates sections, e.g.
//! `GENLOOP_SCHEDULER__MAX_CONCURRENT_INFERENCES=1`).

use crate::error::{GenLoopError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for a caller-tunable micro-batch size
pub const MAX_MICRO_BATCH_SIZE: usize = 64;

/// Top-level configuration for the generation service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenLoopConfig {
    /// Model resource configuration
    #[serde(default)]
    pub model: ModelConfig,

    /// Batch scheduling and concurrency limits
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Job tracker retention
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Output locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Background warmup
    #[serde(default)]
    pub warmup: WarmupConfig,

    /// Image-to-video generation
    #[serde(default)]
    pub video: VideoConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Model resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Text-to-image model repository
    #[serde(default = "default_image_repo_id")]
    pub image_repo_id: String,

    /// Image-to-video model repository
    #[serde(default = "default_video_repo_id")]
    pub video_repo_id: String,

    /// Local model cache directory
    #[serde(default = "default_hf_home")]
    pub hf_home: PathBuf,

    /// Access token for gated repositories
    #[serde(default)]
    pub hf_token: Option<String>,

    /// Run at half precision when the preferred accelerator is present
    #[serde(default = "default_force_fp16")]
    pub force_fp16: bool,
}

/// Batch scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Inference calls allowed in flight against the shared resource
    #[serde(default = "default_max_concurrent_inferences")]
    pub max_concurrent_inferences: usize,

    /// Micro-batch size used when the caller does not pick one
    #[serde(default = "default_micro_batch_size")]
    pub default_micro_batch_size: usize,

    /// Step count ceiling applied before execution
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Maximum number of items in one batch submission
    #[serde(default = "default_max_batch_items")]
    pub max_batch_items: usize,
}

/// Job tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Age after which job records are evicted
    #[serde(default = "default_job_max_age")]
    pub max_age_secs: u64,

    /// Interval of the background cleanup sweep
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

/// Output locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for persisted images and videos
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Scratch directory for encoder intermediates
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

/// Warmup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupConfig {
    /// Start loading the image model at process start
    #[serde(default = "default_auto_warmup")]
    pub auto_warmup: bool,
}

/// Image-to-video configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Build the video generator
    #[serde(default)]
    pub enabled: bool,

    /// Encoder executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_image_repo_id() -> String {
    "stabilityai/stable-diffusion-3.5-medium".to_string()
}

fn default_video_repo_id() -> String {
    "stabilityai/stable-video-diffusion-img2vid-xt".to_string()
}

fn default_hf_home() -> PathBuf {
    PathBuf::from("models")
}

fn default_force_fp16() -> bool {
    true
}

fn default_max_concurrent_inferences() -> usize {
    1 // One accelerator
}

fn default_micro_batch_size() -> usize {
    4
}

fn default_max_steps() -> u32 {
    120
}

fn default_max_batch_items() -> usize {
    10_000
}

fn default_job_max_age() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("tmp")
}

fn default_auto_warmup() -> bool {
    true
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            image_repo_id: default_image_repo_id(),
            video_repo_id: default_video_repo_id(),
            hf_home: default_hf_home(),
            hf_token: None,
            force_fp16: default_force_fp16(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_inferences: default_max_concurrent_inferences(),
            default_micro_batch_size: default_micro_batch_size(),
            max_steps: default_max_steps(),
            max_batch_items: default_max_batch_items(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_job_max_age(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            temp_dir: default_temp_dir(),
        }
    }
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            auto_warmup: default_auto_warmup(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ffmpeg_path: default_ffmpeg_path(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

impl GenLoopConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            GenLoopError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: GenLoopConfig = serde_yaml::from_str(&content).map_err(|e| {
            GenLoopError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file layered with
    /// `GENLOOP_` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("GENLOOP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: GenLoopConfig = settings.try_deserialize()?;

        // The conventional token variable is honored when nothing else set one
        if config.model.hf_token.is_none() {
            config.model.hf_token = std::env::var("HF_TOKEN").ok().filter(|t| !t.is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent_inferences == 0 {
            return Err(GenLoopError::config(
                "scheduler.max_concurrent_inferences must be at least 1",
            ));
        }

        let micro = self.scheduler.default_micro_batch_size;
        if micro == 0 || micro > MAX_MICRO_BATCH_SIZE {
            return Err(GenLoopError::config(format!(
                "scheduler.default_micro_batch_size must be in 1..={}, got {}",
                MAX_MICRO_BATCH_SIZE, micro
            )));
        }

        if self.scheduler.max_steps == 0 {
            return Err(GenLoopError::config("scheduler.max_steps must be at least 1"));
        }

        if self.jobs.max_age_secs == 0 {
            return Err(GenLoopError::config("jobs.max_age_secs must be at least 1"));
        }

        Ok(())
    }

    /// Create output, scratch and model cache directories
    pub fn prepare_dirs(&self) -> Result<()> {
        for dir in [
            &self.storage.output_dir,
            &self.storage.temp_dir,
            &self.model.hf_home,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| {
                GenLoopError::Config(format!("Failed to create directory {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Get job retention as Duration
    pub fn job_max_age(&self) -> Duration {
        Duration::from_secs(self.jobs.max_age_secs)
    }

    /// Get cleanup sweep interval as Duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.jobs.cleanup_interval_secs.max(1))
    }
}
