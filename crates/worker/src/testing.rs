//! Test doubles for the outbound capabilities

use crate::device::DeviceProfile;
use crate::encoder::FrameEncoder;
use crate::pipeline::{
    ClipCall, DiffusionPipeline, RenderCall, RenderOutput, ResourceLoader, TokenInfo,
    VideoPipeline,
};
use crate::storage::ImageStore;
use async_trait::async_trait;
use genloop_common::{GenLoopError, Result};
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct FakeLoaderBehavior {
    pub load_delay: Duration,
    /// Number of leading load attempts that fail
    pub fail_loads: usize,
    pub render_delay: Duration,
    /// 1-based render call that fails
    pub fail_render_call: Option<usize>,
    /// Return one image fewer than requested
    pub drop_one_image: bool,
}

/// Shared observations across every pipeline a loader produced
#[derive(Default)]
pub struct Observations {
    pub calls: Mutex<Vec<RenderCall>>,
    pub sampler_resets: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub measured_prompts: Mutex<Vec<String>>,
}

impl Observations {
    /// Count one unit of accelerator work lasting `duration`
    pub fn busy(&self, duration: Duration) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        std::thread::sleep(duration);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

pub struct FakeLoader {
    behavior: FakeLoaderBehavior,
    loads: AtomicUsize,
    pub observed: Arc<Observations>,
}

impl FakeLoader {
    pub fn new(behavior: FakeLoaderBehavior) -> Self {
        Self::with_observations(behavior, Arc::new(Observations::default()))
    }

    /// Report into observations shared with other loaders
    pub fn with_observations(behavior: FakeLoaderBehavior, observed: Arc<Observations>) -> Self {
        Self {
            behavior,
            loads: AtomicUsize::new(0),
            observed,
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RenderCall> {
        self.observed.calls.lock().clone()
    }
}

impl ResourceLoader<Box<dyn DiffusionPipeline>> for FakeLoader {
    fn describe(&self) -> String {
        "fake/text-to-image".to_string()
    }

    fn load(&self, _profile: DeviceProfile) -> anyhow::Result<Box<dyn DiffusionPipeline>> {
        let attempt = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        std::thread::sleep(self.behavior.load_delay);

        if attempt <= self.behavior.fail_loads {
            anyhow::bail!("weights missing");
        }

        Ok(Box::new(FakePipeline {
            behavior: self.behavior.clone(),
            observed: self.observed.clone(),
            fresh_sampler: false,
        }))
    }
}

pub struct FakePipeline {
    behavior: FakeLoaderBehavior,
    observed: Arc<Observations>,
    fresh_sampler: bool,
}

/// Pixel tag so tests can tell images apart: red carries the item's seed
/// (or 255 when unseeded), green the prompt length
fn tagged_image(call: &RenderCall, index: usize) -> RgbImage {
    let seed = call
        .generators
        .as_ref()
        .and_then(|g| g[index])
        .map(|s| (s % 255) as u8)
        .unwrap_or(255);
    let len = (call.prompts[index].len() % 256) as u8;
    RgbImage::from_pixel(call.width.min(8), call.height.min(8), Rgb([seed, len, 0]))
}

impl DiffusionPipeline for FakePipeline {
    fn reset_sampler(&mut self) {
        self.observed.sampler_resets.fetch_add(1, Ordering::SeqCst);
        self.fresh_sampler = true;
    }

    fn render(&mut self, call: &RenderCall) -> anyhow::Result<RenderOutput> {
        anyhow::ensure!(self.fresh_sampler, "sampler reused across calls");
        self.fresh_sampler = false;

        self.observed.busy(self.behavior.render_delay);

        let call_number = {
            let mut calls = self.observed.calls.lock();
            calls.push(call.clone());
            calls.len()
        };

        if self.behavior.fail_render_call == Some(call_number) {
            anyhow::bail!("CUDA out of memory on call {}", call_number);
        }

        let mut images: Vec<RgbImage> = (0..call.len()).map(|i| tagged_image(call, i)).collect();
        if self.behavior.drop_one_image {
            images.pop();
        }

        Ok(RenderOutput {
            images,
            warnings: vec![format!("call {}", call_number)],
        })
    }

    fn measure_tokens(&self, prompt: &str) -> Vec<TokenInfo> {
        self.observed.measured_prompts.lock().push(prompt.to_string());
        vec![TokenInfo::measured(
            "tokenizer",
            prompt.split_whitespace().count() + 2,
            77,
        )]
    }
}

pub struct FakeVideoLoader {
    pub fail: bool,
    pub render_delay: Duration,
    pub calls: Arc<Mutex<Vec<ClipCall>>>,
    pub observed: Arc<Observations>,
}

impl FakeVideoLoader {
    pub fn new(fail: bool) -> Self {
        Self {
            fail,
            render_delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
            observed: Arc::new(Observations::default()),
        }
    }

    pub fn with_render_delay(mut self, delay: Duration) -> Self {
        self.render_delay = delay;
        self
    }

    pub fn with_observations(mut self, observed: Arc<Observations>) -> Self {
        self.observed = observed;
        self
    }
}

impl ResourceLoader<Box<dyn VideoPipeline>> for FakeVideoLoader {
    fn describe(&self) -> String {
        "fake/image-to-video".to_string()
    }

    fn load(&self, _profile: DeviceProfile) -> anyhow::Result<Box<dyn VideoPipeline>> {
        if self.fail {
            anyhow::bail!("video weights missing");
        }
        Ok(Box::new(FakeVideoPipeline {
            render_delay: self.render_delay,
            calls: self.calls.clone(),
            observed: self.observed.clone(),
        }))
    }
}

struct FakeVideoPipeline {
    render_delay: Duration,
    calls: Arc<Mutex<Vec<ClipCall>>>,
    observed: Arc<Observations>,
}

impl VideoPipeline for FakeVideoPipeline {
    fn render_clip(&mut self, call: &ClipCall) -> anyhow::Result<Vec<RgbImage>> {
        self.observed.busy(self.render_delay);
        self.calls.lock().push(call.clone());
        let (w, h) = call.image.dimensions();
        Ok((0..call.num_frames)
            .map(|i| RgbImage::from_pixel(w, h, Rgb([i as u8, 0, 0])))
            .collect())
    }
}

/// Keeps stored images in memory
#[derive(Default)]
pub struct MemoryStore {
    pub stored: Mutex<Vec<(String, (u32, u32))>>,
}

impl ImageStore for MemoryStore {
    fn store(&self, image: &RgbImage, name: &str) -> Result<String> {
        self.stored.lock().push((name.to_string(), image.dimensions()));
        Ok(format!("mem://{}", name))
    }
}

/// Records encoded clips instead of running an encoder
#[derive(Default)]
pub struct FakeEncoder {
    pub fail: bool,
    pub encoded: Mutex<Vec<(String, usize, u32)>>,
}

#[async_trait]
impl FrameEncoder for FakeEncoder {
    async fn create_looped_video(
        &self,
        frames: Vec<RgbImage>,
        fps: u32,
        _duration_minutes: f32,
        job_id: &str,
    ) -> Result<PathBuf> {
        if self.fail {
            return Err(GenLoopError::encoding("FFmpeg failed: broken pipe"));
        }
        self.encoded
            .lock()
            .push((job_id.to_string(), frames.len(), fps));
        Ok(PathBuf::from(format!("outputs/{}.mp4", job_id)))
    }
}
