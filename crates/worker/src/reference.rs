//! Deterministic CPU backend
//!
//! Stands in for a native diffusion library so the service runs end to end.
//! Output is procedural: a seed always yields the same pixels for the same
//! prompt and shape, and unseeded items draw from the sampler's own stream.

use crate::device::DeviceProfile;
use crate::pipeline::{
    ClipCall, DiffusionPipeline, ModelSource, RenderCall, RenderOutput, ResourceLoader,
    TokenInfo, VideoPipeline,
};
use candle_core::{DType, Device, Tensor};
use image::{Rgb, RgbImage};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const PALETTE_FILE: &str = "palette.safetensors";
const PALETTE_TENSOR: &str = "palette";

/// Tokenizers of the reference pipeline and their windows
const TOKENIZERS: [(&str, usize); 3] = [("tokenizer", 77), ("tokenizer_2", 77), ("tokenizer_3", 256)];

/// Begin and end markers added around every prompt
const SPECIAL_TOKENS: usize = 2;

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn fnv1a(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

fn token_count(prompt: &str) -> usize {
    prompt.split_whitespace().count() + SPECIAL_TOKENS
}

/// Sampler with its own noise stream for unseeded items
struct Sampler {
    stream: u64,
}

impl Sampler {
    fn fresh(entropy: u64) -> Self {
        Self { stream: entropy }
    }

    fn next_seed(&mut self) -> u64 {
        splitmix64(&mut self.stream)
    }
}

fn clock_entropy() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

pub struct ReferenceLoader {
    source: ModelSource,
}

impl ReferenceLoader {
    pub fn new(source: ModelSource) -> Self {
        Self { source }
    }
}

impl ResourceLoader<Box<dyn DiffusionPipeline>> for ReferenceLoader {
    fn describe(&self) -> String {
        self.source.repo_id.clone()
    }

    fn load(&self, profile: DeviceProfile) -> anyhow::Result<Box<dyn DiffusionPipeline>> {
        let palette = load_palette(&self.source, profile)?;
        Ok(Box::new(ReferencePipeline::new(palette)))
    }
}

/// Per-model color basis. Written to the repository cache on first load,
/// then read back and cast to the profile's precision like real weights.
fn load_palette(source: &ModelSource, profile: DeviceProfile) -> anyhow::Result<[f32; 3]> {
    let dir = source.repo_dir();
    let path = dir.join(PALETTE_FILE);

    if !path.exists() {
        let mut state = fnv1a(&source.repo_id);
        let values: Vec<f32> = (0..3)
            .map(|_| (splitmix64(&mut state) % 1000) as f32 / 1000.0)
            .collect();

        std::fs::create_dir_all(&dir)?;
        let tensor = Tensor::from_vec(values, 3, &Device::Cpu)?;
        candle_core::safetensors::save(&HashMap::from([(PALETTE_TENSOR, tensor)]), &path)?;
        info!(
            repo = %source.repo_id,
            authenticated = source.token.is_some(),
            "Materialized reference weights at {}",
            path.display()
        );
    }

    // Weights stay on the host for the reference backend
    let mut tensors = candle_core::safetensors::load(&path, &Device::Cpu)?;
    let weights = tensors
        .remove(PALETTE_TENSOR)
        .ok_or_else(|| anyhow::anyhow!("{} has no {} tensor", path.display(), PALETTE_TENSOR))?;
    let palette = weights
        .to_dtype(profile.dtype())?
        .to_dtype(DType::F32)?
        .to_vec1::<f32>()?;
    anyhow::ensure!(palette.len() == 3, "expected 3 palette weights, found {}", palette.len());
    debug!("Reference palette for {}: {:?} on {}", source.repo_id, palette, profile);

    Ok([palette[0], palette[1], palette[2]])
}

pub struct ReferencePipeline {
    palette: [f32; 3],
    sampler: Sampler,
}

impl ReferencePipeline {
    fn new(palette: [f32; 3]) -> Self {
        Self {
            palette,
            sampler: Sampler::fresh(clock_entropy()),
        }
    }

    fn paint(&self, prompt: &str, seed: u64, call: &RenderCall) -> RgbImage {
        let mut state = seed ^ fnv1a(prompt);
        let tint = [
            splitmix64(&mut state) % 256,
            splitmix64(&mut state) % 256,
            splitmix64(&mut state) % 256,
        ];
        // More steps means less residual noise
        let noise = (64.0 / call.steps.max(1) as f32).min(64.0);
        let contrast = 0.5 + call.guidance_scale / 40.0;

        RgbImage::from_fn(call.width, call.height, |x, y| {
            let fx = x as f32 / call.width as f32;
            let fy = y as f32 / call.height as f32;
            let grain = (splitmix64(&mut state) % 1000) as f32 / 1000.0 - 0.5;

            let mut pixel = [0u8; 3];
            for (c, value) in pixel.iter_mut().enumerate() {
                let base = tint[c] as f32 * self.palette[c];
                let gradient = 255.0 * (fx * (1.0 - self.palette[c]) + fy * self.palette[c]);
                let mixed = base * contrast + gradient * (1.0 - contrast) + grain * noise;
                *value = mixed.clamp(0.0, 255.0) as u8;
            }
            Rgb(pixel)
        })
    }
}

impl DiffusionPipeline for ReferencePipeline {
    fn reset_sampler(&mut self) {
        self.sampler = Sampler::fresh(clock_entropy());
    }

    fn render(&mut self, call: &RenderCall) -> anyhow::Result<RenderOutput> {
        anyhow::ensure!(
            call.negative_prompts.len() == call.len(),
            "got {} negative prompts for {} prompts",
            call.negative_prompts.len(),
            call.len()
        );
        if let Some(generators) = &call.generators {
            anyhow::ensure!(
                generators.len() == call.len(),
                "got {} generators for {} prompts",
                generators.len(),
                call.len()
            );
        }

        let mut warnings = Vec::new();
        let (clip, window) = TOKENIZERS[0];
        for prompt in &call.prompts {
            let tokens = token_count(prompt);
            if tokens > window {
                let kept = window - SPECIAL_TOKENS;
                let dropped: Vec<&str> = prompt.split_whitespace().skip(kept).collect();
                warnings.push(format!(
                    "The following part of your input was truncated because {} can only handle sequences up to {} tokens: {}",
                    clip,
                    window,
                    dropped.join(" ")
                ));
            }
        }

        let images = call
            .prompts
            .iter()
            .enumerate()
            .map(|(i, prompt)| {
                let seed = call
                    .generators
                    .as_ref()
                    .and_then(|g| g[i])
                    .unwrap_or_else(|| self.sampler.next_seed());
                self.paint(prompt, seed, call)
            })
            .collect();

        Ok(RenderOutput { images, warnings })
    }

    fn measure_tokens(&self, prompt: &str) -> Vec<TokenInfo> {
        TOKENIZERS
            .iter()
            .map(|(name, window)| TokenInfo::measured(*name, token_count(prompt), *window))
            .collect()
    }
}

pub struct ReferenceVideoLoader {
    source: ModelSource,
}

impl ReferenceVideoLoader {
    pub fn new(source: ModelSource) -> Self {
        Self { source }
    }
}

impl ResourceLoader<Box<dyn VideoPipeline>> for ReferenceVideoLoader {
    fn describe(&self) -> String {
        self.source.repo_id.clone()
    }

    fn load(&self, profile: DeviceProfile) -> anyhow::Result<Box<dyn VideoPipeline>> {
        load_palette(&self.source, profile)?;
        Ok(Box::new(ReferenceVideoPipeline))
    }
}

/// Pans the source image; motion sets the pan speed
struct ReferenceVideoPipeline;

impl VideoPipeline for ReferenceVideoPipeline {
    fn render_clip(&mut self, call: &ClipCall) -> anyhow::Result<Vec<RgbImage>> {
        anyhow::ensure!(call.num_frames > 0, "num_frames must be positive");
        anyhow::ensure!(call.decode_chunk_size > 0, "decode_chunk_size must be positive");

        let (width, height) = call.image.dimensions();
        let mut state = call.seed.unwrap_or_else(clock_entropy);
        let speed = call.motion_bucket_id as f32 / 255.0 * 4.0;
        let jitter = (call.noise_aug_strength * 255.0).max(0.0);

        let frames = (0..call.num_frames)
            .map(|frame| {
                let shift = (frame as f32 * speed) as u32;
                RgbImage::from_fn(width, height, |x, y| {
                    let source = call.image.get_pixel((x + shift) % width, y);
                    let grain = (splitmix64(&mut state) % 1000) as f32 / 1000.0 - 0.5;
                    Rgb(source.0.map(|v| (v as f32 + grain * jitter).clamp(0.0, 255.0) as u8))
                })
            })
            .collect();

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(prompts: &[&str], generators: Option<Vec<Option<u64>>>) -> RenderCall {
        RenderCall {
            prompts: prompts.iter().map(|p| p.to_string()).collect(),
            negative_prompts: prompts.iter().map(|_| String::new()).collect(),
            steps: 20,
            guidance_scale: 7.5,
            width: 32,
            height: 24,
            generators,
        }
    }

    fn pipeline() -> Box<dyn DiffusionPipeline> {
        let cache = tempfile::tempdir().unwrap();
        ReferenceLoader::new(ModelSource::new("reference/test", cache.path()))
            .load(DeviceProfile::cpu())
            .unwrap()
    }

    #[test]
    fn test_weights_cached_in_repo_dir() {
        let cache = tempfile::tempdir().unwrap();
        let source = ModelSource::new("reference/cached", cache.path())
            .with_token(Some("hf_token".to_string()));
        let weights = source.repo_dir().join(PALETTE_FILE);

        let first = load_palette(&source, DeviceProfile::cpu()).unwrap();
        assert!(weights.is_file());
        assert!(cache.path().join("models--reference--cached").is_dir());

        let second = load_palette(&source, DeviceProfile::cpu()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_weights_fail_to_load() {
        let cache = tempfile::tempdir().unwrap();
        let source = ModelSource::new("reference/broken", cache.path());
        std::fs::create_dir_all(source.repo_dir()).unwrap();
        std::fs::write(source.repo_dir().join(PALETTE_FILE), b"not safetensors").unwrap();

        assert!(ReferenceLoader::new(source).load(DeviceProfile::cpu()).is_err());
    }

    #[test]
    fn test_seeded_render_is_deterministic() {
        let mut first = pipeline();
        let mut second = pipeline();
        let call = call(&["a red fox", "a blue bird"], Some(vec![Some(7), Some(8)]));

        first.reset_sampler();
        second.reset_sampler();
        let a = first.render(&call).unwrap();
        let b = second.render(&call).unwrap();

        assert_eq!(a.images.len(), 2);
        assert_eq!(a.images[0].dimensions(), (32, 24));
        assert_eq!(a.images, b.images);
        assert_ne!(a.images[0], a.images[1]);
    }

    #[test]
    fn test_long_prompt_warns_about_truncation() {
        let mut pipeline = pipeline();
        let long = vec!["word"; 90].join(" ");

        pipeline.reset_sampler();
        let output = pipeline.render(&call(&[&long], None)).unwrap();

        assert_eq!(output.warnings.len(), 1);
        assert!(output.warnings[0].contains("77 tokens"));
    }

    #[test]
    fn test_measure_tokens_reports_every_tokenizer() {
        let pipeline = pipeline();
        let info = pipeline.measure_tokens("three word prompt");

        assert_eq!(info.len(), 3);
        assert_eq!(info[0], TokenInfo::measured("tokenizer", 5, 77));
        assert_eq!(info[2], TokenInfo::measured("tokenizer_3", 5, 256));
    }

    #[test]
    fn test_video_frames_match_source_size() {
        let cache = tempfile::tempdir().unwrap();
        let mut pipeline = ReferenceVideoLoader::new(ModelSource::new("reference/video", cache.path()))
            .load(DeviceProfile::cpu())
            .unwrap();
        let clip = ClipCall {
            image: RgbImage::from_pixel(16, 8, Rgb([100, 100, 100])),
            num_frames: 14,
            fps: 24,
            motion_bucket_id: 96,
            noise_aug_strength: 0.02,
            decode_chunk_size: 8,
            seed: Some(1234),
        };

        let frames = pipeline.render_clip(&clip).unwrap();
        let again = pipeline.render_clip(&clip).unwrap();

        assert_eq!(frames.len(), 14);
        assert!(frames.iter().all(|f| f.dimensions() == (16, 8)));
        assert_eq!(frames, again);
    }
}
