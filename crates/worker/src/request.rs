//! Generation requests and their execution shape
//!
//! Requests that share an [`ExecutionShapeKey`] can run in one batched
//! inference call.

use crate::pipeline::TokenInfo;
use genloop_common::config::MAX_MICRO_BATCH_SIZE;
use genloop_common::{GenLoopError, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};

pub const MAX_PROMPT_CHARS: usize = 1000;
pub const MIN_DIMENSION: u32 = 256;
pub const MAX_DIMENSION: u32 = 2048;
pub const MAX_REQUEST_STEPS: u32 = 150;
pub const MAX_GUIDANCE: f32 = 20.0;

pub const DEFAULT_NEGATIVE_PROMPT: &str = "low quality, blurry, distorted, watermark, text, error";

/// Visual style appended to the prompt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtStyle {
    #[default]
    Cinematic,
    Photographic,
    Anime,
    #[serde(rename = "Fantasy Art")]
    FantasyArt,
    #[serde(rename = "Digital Art")]
    DigitalArt,
    #[serde(rename = "3D Model")]
    Model3D,
    #[serde(rename = "Neon Punk")]
    NeonPunk,
    #[serde(rename = "Oil Painting")]
    OilPainting,
    Watercolor,
    Freestyle,
}

impl ArtStyle {
    pub fn phrase(&self) -> &'static str {
        match self {
            ArtStyle::Cinematic => "cinematic lighting, movie still, dramatic atmosphere",
            ArtStyle::Photographic => "professional photography, ultra realistic, 8k",
            ArtStyle::Anime => "anime art style, studio quality, vibrant colors",
            ArtStyle::FantasyArt => "fantasy art, magical atmosphere, ethereal lighting",
            ArtStyle::DigitalArt => "digital painting, concept art, highly detailed",
            ArtStyle::Model3D => "3d render, octane render, volumetric lighting",
            ArtStyle::NeonPunk => "cyberpunk, neon lights, futuristic",
            ArtStyle::OilPainting => "oil painting, traditional art, textured brushstrokes",
            ArtStyle::Watercolor => "watercolor painting, soft edges, flowing colors",
            ArtStyle::Freestyle => "",
        }
    }

    /// Prompt with the style phrase and quality tags appended
    pub fn apply(&self, prompt: &str) -> String {
        match self.phrase() {
            "" => prompt.to_string(),
            phrase => format!("{}, {}, masterpiece, best quality", prompt, phrase),
        }
    }
}

fn default_steps() -> u32 {
    44
}

fn default_guidance() -> f32 {
    7.5
}

fn default_dimension() -> u32 {
    1024
}

/// A single text-to-image request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,

    #[serde(default)]
    pub negative_prompt: Option<String>,

    #[serde(default)]
    pub style: ArtStyle,

    #[serde(default = "default_dimension")]
    pub width: u32,

    #[serde(default = "default_dimension")]
    pub height: u32,

    #[serde(default = "default_steps", alias = "num_inference_steps")]
    pub steps: u32,

    #[serde(default = "default_guidance")]
    pub guidance_scale: f32,

    #[serde(default)]
    pub seed: Option<u64>,
}

impl GenerationRequest {
    /// Request with default shape (1024x1024, 44 steps, guidance 7.5)
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            style: ArtStyle::default(),
            width: default_dimension(),
            height: default_dimension(),
            steps: default_steps(),
            guidance_scale: default_guidance(),
            seed: None,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_guidance(mut self, guidance_scale: f32) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_negative(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative.into());
        self
    }

    pub fn with_style(mut self, style: ArtStyle) -> Self {
        self.style = style;
        self
    }

    /// Reject malformed requests before any resource is touched
    pub fn validate(&self) -> Result<()> {
        let chars = self.prompt.chars().count();
        if chars == 0 || chars > MAX_PROMPT_CHARS {
            return Err(GenLoopError::validation(format!(
                "prompt must be 1..={} characters, got {}",
                MAX_PROMPT_CHARS, chars
            )));
        }

        if self.steps == 0 || self.steps > MAX_REQUEST_STEPS {
            return Err(GenLoopError::validation(format!(
                "steps must be in 1..={}, got {}",
                MAX_REQUEST_STEPS, self.steps
            )));
        }

        if !(0.0..=MAX_GUIDANCE).contains(&self.guidance_scale) {
            return Err(GenLoopError::validation(format!(
                "guidance_scale must be in 0..={}, got {}",
                MAX_GUIDANCE, self.guidance_scale
            )));
        }

        for (name, value) in [("width", self.width), ("height", self.height)] {
            if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) {
                return Err(GenLoopError::validation(format!(
                    "{} must be in {}..={}, got {}",
                    name, MIN_DIMENSION, MAX_DIMENSION, value
                )));
            }
            if value % 8 != 0 {
                return Err(GenLoopError::validation(format!(
                    "{} must be divisible by 8, got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }

    pub fn negative_or_default(&self) -> String {
        self.negative_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_NEGATIVE_PROMPT.to_string())
    }

    /// Prompt text with the style applied; the returned request has
    /// `Freestyle` so the style is never applied twice
    pub fn styled(&self) -> Self {
        Self {
            prompt: self.style.apply(&self.prompt),
            style: ArtStyle::Freestyle,
            ..self.clone()
        }
    }

    pub fn shape_key(&self, max_steps: u32) -> ExecutionShapeKey {
        ExecutionShapeKey::new(
            self.width,
            self.height,
            self.steps.min(max_steps),
            self.guidance_scale,
        )
    }
}

/// Parameters that decide whether requests can share one inference call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionShapeKey {
    pub width: u32,
    pub height: u32,
    /// Already clamped to the step ceiling
    pub steps: u32,
    guidance_bits: u32,
}

impl ExecutionShapeKey {
    pub fn new(width: u32, height: u32, steps: u32, guidance_scale: f32) -> Self {
        // -0.0 and 0.0 must land in the same group
        let guidance = if guidance_scale == 0.0 { 0.0 } else { guidance_scale };
        Self {
            width,
            height,
            steps,
            guidance_bits: guidance.to_bits(),
        }
    }

    pub fn guidance_scale(&self) -> f32 {
        f32::from_bits(self.guidance_bits)
    }
}

/// Batch-level seeding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPolicy {
    /// Item `i` without an explicit seed uses `start_seed + i`
    pub start_seed: Option<u64>,
}

impl SeedPolicy {
    pub fn unseeded() -> Self {
        Self { start_seed: None }
    }

    pub fn starting_at(seed: u64) -> Self {
        Self {
            start_seed: Some(seed),
        }
    }

    /// Explicit seed, then `start_seed + original_index`, then unseeded
    pub fn resolve(&self, explicit: Option<u64>, original_index: usize) -> Option<u64> {
        explicit.or_else(|| {
            self.start_seed
                .map(|start| start.wrapping_add(original_index as u64))
        })
    }
}

/// Caller-side batch options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOptions {
    #[serde(default)]
    pub start_seed: Option<u64>,

    #[serde(default)]
    pub micro_batch_size: Option<usize>,

    /// Persist images and return references instead of pixels
    #[serde(default)]
    pub save_to_disk: bool,

    /// File name prefix for persisted images
    #[serde(default)]
    pub prefix: Option<String>,
}

impl BatchOptions {
    pub fn seed_policy(&self) -> SeedPolicy {
        SeedPolicy {
            start_seed: self.start_seed,
        }
    }

    pub fn validate(&self, item_count: usize, max_items: usize) -> Result<()> {
        if item_count == 0 || item_count > max_items {
            return Err(GenLoopError::validation(format!(
                "batch must contain 1..={} items, got {}",
                max_items, item_count
            )));
        }

        if let Some(size) = self.micro_batch_size {
            if size == 0 || size > MAX_MICRO_BATCH_SIZE {
                return Err(GenLoopError::validation(format!(
                    "micro_batch_size must be in 1..={}, got {}",
                    MAX_MICRO_BATCH_SIZE, size
                )));
            }
        }

        if let Some(prefix) = &self.prefix {
            let valid = !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !valid {
                return Err(GenLoopError::validation(
                    "prefix may only contain ASCII letters, digits, '-' and '_'",
                ));
            }
        }

        Ok(())
    }
}

/// One generated image plus what produced it
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub image: RgbImage,
    /// Seed actually used; `None` for an unseeded run
    pub seed: Option<u64>,
    pub prompt: String,
    pub negative_prompt: String,
    /// Warnings emitted by the inference call that produced this item
    pub warnings: Vec<String>,
    /// Prompt length diagnostics, measured on the first prompt of the batch
    pub token_info: Vec<TokenInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_request_is_valid() {
        let request = GenerationRequest::new("a lighthouse at dusk");

        assert!(request.validate().is_ok());
        assert_eq!(request.steps, 44);
        assert_eq!(request.width, 1024);
    }

    #[test]
    fn test_validation_rejects_bad_dimensions() {
        let odd = GenerationRequest::new("x").with_size(1020, 1024);
        assert!(matches!(odd.validate(), Err(GenLoopError::Validation(_))));

        let small = GenerationRequest::new("x").with_size(128, 1024);
        assert!(small.validate().is_err());

        let large = GenerationRequest::new("x").with_size(1024, 2056);
        assert!(large.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_prompt_and_steps() {
        assert!(GenerationRequest::new("").validate().is_err());
        assert!(GenerationRequest::new("a".repeat(1001)).validate().is_err());
        assert!(GenerationRequest::new("x").with_steps(0).validate().is_err());
        assert!(GenerationRequest::new("x").with_steps(151).validate().is_err());
        assert!(GenerationRequest::new("x").with_guidance(20.5).validate().is_err());
        assert!(GenerationRequest::new("x").with_steps(150).validate().is_ok());
    }

    #[test]
    fn test_shape_key_clamps_steps() {
        let a = GenerationRequest::new("a").with_steps(150).shape_key(120);
        let b = GenerationRequest::new("b").with_steps(120).shape_key(120);

        assert_eq!(a, b);
        assert_eq!(a.steps, 120);
    }

    #[test]
    fn test_shape_key_distinguishes_guidance() {
        let a = GenerationRequest::new("a").with_guidance(7.5).shape_key(120);
        let b = GenerationRequest::new("a").with_guidance(7.0).shape_key(120);
        let zero = ExecutionShapeKey::new(512, 512, 20, 0.0);
        let neg_zero = ExecutionShapeKey::new(512, 512, 20, -0.0);

        assert_ne!(a, b);
        assert_eq!(a.guidance_scale(), 7.5);
        assert_eq!(zero, neg_zero);
    }

    #[test]
    fn test_seed_resolution_priority() {
        let policy = SeedPolicy::starting_at(100);

        assert_eq!(policy.resolve(Some(5), 3), Some(5));
        assert_eq!(policy.resolve(None, 3), Some(103));
        assert_eq!(SeedPolicy::unseeded().resolve(None, 3), None);
        assert_eq!(SeedPolicy::unseeded().resolve(Some(9), 0), Some(9));
    }

    #[test]
    fn test_style_application() {
        let styled = GenerationRequest::new("a cat")
            .with_style(ArtStyle::Anime)
            .styled();

        assert_eq!(
            styled.prompt,
            "a cat, anime art style, studio quality, vibrant colors, masterpiece, best quality"
        );
        assert_eq!(styled.style, ArtStyle::Freestyle);
        assert_eq!(styled.styled().prompt, styled.prompt);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: GenerationRequest = serde_json::from_value(serde_json::json!({
            "prompt": "harbor",
            "style": "Neon Punk",
            "num_inference_steps": 30
        }))
        .unwrap();

        assert_eq!(request.style, ArtStyle::NeonPunk);
        assert_eq!(request.steps, 30);
        assert_eq!(request.guidance_scale, 7.5);
        assert_eq!(request.negative_or_default(), DEFAULT_NEGATIVE_PROMPT);
    }

    #[test]
    fn test_batch_options_validation() {
        let options = BatchOptions::default();
        assert!(options.validate(1, 10).is_ok());
        assert!(options.validate(0, 10).is_err());
        assert!(options.validate(11, 10).is_err());

        let big = BatchOptions {
            micro_batch_size: Some(65),
            ..BatchOptions::default()
        };
        assert!(big.validate(1, 10).is_err());

        let bad_prefix = BatchOptions {
            prefix: Some("../etc".to_string()),
            ..BatchOptions::default()
        };
        assert!(bad_prefix.validate(1, 10).is_err());
    }
}
