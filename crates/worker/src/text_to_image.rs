//! Text-to-image generation: synchronous and job-backed paths

use crate::jobs::{JobId, JobStatus, JobTracker, JobUpdate};
use crate::model::ModelService;
use crate::pipeline::TokenInfo;
use crate::request::{BatchOptions, GenerationRequest, GenerationResult};
use crate::scheduler::BatchScheduler;
use crate::storage::ImageStore;
use async_trait::async_trait;
use genloop_common::{GenLoopError, Result};
use image::RgbImage;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Image payload of a batch item
#[derive(Debug, Clone)]
pub enum ImageOutput {
    Pixels(RgbImage),
    /// Reference returned by the image store
    Stored(String),
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub index: usize,
    pub output: ImageOutput,
    pub seed: Option<u64>,
    pub prompt: String,
    pub negative_prompt: String,
    pub warnings: Vec<String>,
    pub token_info: Vec<TokenInfo>,
}

/// Per-item entry of a finished batch job's result
#[derive(Debug, Clone, Serialize)]
struct StoredItem {
    index: usize,
    reference: String,
    seed: Option<u64>,
    prompt: String,
    warnings: Vec<String>,
}

pub struct ImageGenerator {
    scheduler: BatchScheduler,
    store: Arc<dyn ImageStore>,
    jobs: Arc<JobTracker>,
    default_micro_batch_size: usize,
    max_batch_items: usize,
}

impl ImageGenerator {
    pub fn new(
        scheduler: BatchScheduler,
        store: Arc<dyn ImageStore>,
        jobs: Arc<JobTracker>,
        default_micro_batch_size: usize,
        max_batch_items: usize,
    ) -> Self {
        Self {
            scheduler,
            store,
            jobs,
            default_micro_batch_size,
            max_batch_items,
        }
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Generate one image, blocking until it is done
    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        request.validate()?;
        self.scheduler.infer(&request.styled()).await
    }

    /// Generate a whole batch, blocking until every item is done
    pub async fn generate_batch(
        &self,
        requests: &[GenerationRequest],
        options: &BatchOptions,
    ) -> Result<Vec<BatchItem>> {
        let prepared = self.prepare(requests, options)?;
        let results = self
            .scheduler
            .infer_batch(&prepared, options.seed_policy(), self.micro_batch_size(options))
            .await?;

        if !options.save_to_disk {
            return Ok(results
                .into_iter()
                .enumerate()
                .map(|(index, r)| BatchItem {
                    index,
                    output: ImageOutput::Pixels(r.image),
                    seed: r.seed,
                    prompt: r.prompt,
                    negative_prompt: r.negative_prompt,
                    warnings: r.warnings,
                    token_info: r.token_info,
                })
                .collect());
        }

        let prefix = options
            .prefix
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let stored = store_all(self.store.clone(), results, prefix).await?;

        Ok(stored
            .into_iter()
            .enumerate()
            .map(|(index, (r, reference))| BatchItem {
                index,
                output: ImageOutput::Stored(reference),
                seed: r.seed,
                prompt: r.prompt,
                negative_prompt: r.negative_prompt,
                warnings: r.warnings,
                token_info: r.token_info,
            })
            .collect())
    }

    /// Validate, create a job and run the batch in the background.
    ///
    /// Every image of a job-backed batch is persisted.
    pub fn submit_batch(
        self: &Arc<Self>,
        requests: &[GenerationRequest],
        options: &BatchOptions,
    ) -> Result<JobId> {
        let prepared = self.prepare(requests, options)?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("kind".to_string(), json!("image_batch"));
        metadata.insert("count".to_string(), json!(prepared.len()));
        let job_id = self.jobs.create(metadata);

        info!(job_id = %job_id, items = prepared.len(), "Submitted image batch");

        let this = self.clone();
        let options = options.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_job(&id, prepared, options).await {
                error!(job_id = %id, "Image batch job failed: {}", e);
                this.jobs.update(&id, JobUpdate::failed(e.to_string()));
            }
        });

        Ok(job_id)
    }

    async fn run_job(
        &self,
        job_id: &str,
        requests: Vec<GenerationRequest>,
        options: BatchOptions,
    ) -> Result<()> {
        self.jobs.update(job_id, JobUpdate::status(JobStatus::Loading));
        self.scheduler.model().ensure_loaded().await?;

        self.jobs.update(job_id, JobUpdate::status(JobStatus::Generating).with_progress(0.0));

        let jobs = &self.jobs;
        let results = self
            .scheduler
            .infer_batch_with_progress(
                &requests,
                options.seed_policy(),
                self.micro_batch_size(&options),
                |done, total| jobs.update(job_id, JobUpdate::progress(done as f32 / total as f32)),
            )
            .await?;

        let prefix = options.prefix.clone().unwrap_or_else(|| job_id.to_string());
        let token_info = results
            .first()
            .map(|r| r.token_info.clone())
            .unwrap_or_default();
        let stored = store_all(self.store.clone(), results, prefix).await?;

        let items: Vec<StoredItem> = stored
            .into_iter()
            .enumerate()
            .map(|(index, (r, reference))| StoredItem {
                index,
                reference,
                seed: r.seed,
                prompt: r.prompt,
                warnings: r.warnings,
            })
            .collect();

        let result = json!({
            "count": items.len(),
            "items": serde_json::to_value(&items)?,
            "token_info": serde_json::to_value(&token_info)?,
        });
        self.jobs.update(job_id, JobUpdate::done(result));
        info!(job_id = %job_id, "Image batch job done");

        Ok(())
    }

    fn prepare(&self, requests: &[GenerationRequest], options: &BatchOptions) -> Result<Vec<GenerationRequest>> {
        options.validate(requests.len(), self.max_batch_items)?;

        requests
            .iter()
            .enumerate()
            .map(|(i, request)| -> Result<GenerationRequest> {
                request.validate().map_err(|e| match e {
                    GenLoopError::Validation(msg) => {
                        GenLoopError::validation(format!("item {}: {}", i, msg))
                    }
                    other => other,
                })?;
                Ok(request.styled())
            })
            .collect()
    }

    fn micro_batch_size(&self, options: &BatchOptions) -> usize {
        options
            .micro_batch_size
            .unwrap_or(self.default_micro_batch_size)
            .max(1)
    }
}

/// Persist every image on a blocking thread, named `{prefix}_{index:04}`.
/// Results move through the blocking task and come back paired with their
/// store reference.
async fn store_all(
    store: Arc<dyn ImageStore>,
    results: Vec<GenerationResult>,
    prefix: String,
) -> Result<Vec<(GenerationResult, String)>> {
    tokio::task::spawn_blocking(move || {
        results
            .into_iter()
            .enumerate()
            .map(|(i, result)| {
                let reference = store.store(&result.image, &format!("{}_{:04}", prefix, i))?;
                Ok((result, reference))
            })
            .collect::<Result<Vec<_>>>()
    })
    .await
    .map_err(|e| GenLoopError::internal(format!("image store task failed: {}", e)))?
}

#[async_trait]
impl ModelService for ImageGenerator {
    fn name(&self) -> String {
        self.scheduler.model().describe()
    }

    async fn ensure_loaded(&self) -> Result<()> {
        self.scheduler.model().ensure_loaded().await.map(|_| ())
    }

    fn unload(&self) {
        if self.scheduler.model().is_loaded() {
            warn!("Unloading {}", self.name());
        }
        self.scheduler.model().unload();
    }

    fn is_loaded(&self) -> bool {
        self.scheduler.model().is_loaded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceProfile;
    use crate::model::{InferenceGate, ModelHandle};
    use crate::request::ArtStyle;
    use crate::scheduler::ImageModel;
    use crate::testing::{FakeLoader, FakeLoaderBehavior, MemoryStore};
    use genloop_common::MetricsRegistry;
    use std::time::Duration;

    struct Fixture {
        generator: Arc<ImageGenerator>,
        loader: Arc<FakeLoader>,
        store: Arc<MemoryStore>,
        jobs: Arc<JobTracker>,
    }

    fn fixture(behavior: FakeLoaderBehavior) -> Fixture {
        let metrics = MetricsRegistry::new();
        let loader = Arc::new(FakeLoader::new(behavior));
        let model: Arc<ImageModel> = Arc::new(ModelHandle::new(
            loader.clone(),
            DeviceProfile::cpu(),
            metrics.clone(),
        ));
        let scheduler = BatchScheduler::new(model, InferenceGate::new(1), 120, metrics.clone());
        let store = Arc::new(MemoryStore::default());
        let jobs = Arc::new(JobTracker::new(metrics));
        let generator = Arc::new(ImageGenerator::new(
            scheduler,
            store.clone(),
            jobs.clone(),
            4,
            100,
        ));

        Fixture {
            generator,
            loader,
            store,
            jobs,
        }
    }

    fn req(prompt: &str) -> GenerationRequest {
        GenerationRequest::new(prompt)
            .with_size(512, 512)
            .with_steps(20)
            .with_style(ArtStyle::Freestyle)
    }

    async fn wait_terminal(jobs: &JobTracker, id: &str) -> crate::jobs::Job {
        for _ in 0..500 {
            let job = jobs.get(id).unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never finished", id);
    }

    #[tokio::test]
    async fn test_generate_applies_style() {
        let f = fixture(FakeLoaderBehavior::default());
        let request = GenerationRequest::new("a castle")
            .with_size(512, 512)
            .with_style(ArtStyle::Anime);

        let result = f.generator.generate(&request).await.unwrap();

        assert!(result.prompt.starts_with("a castle, anime art style"));
        assert!(result.prompt.ends_with("masterpiece, best quality"));
        assert_eq!(result.negative_prompt, crate::request::DEFAULT_NEGATIVE_PROMPT);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_load() {
        let f = fixture(FakeLoaderBehavior::default());
        let bad = GenerationRequest::new("ok").with_size(500, 512);

        let err = f
            .generator
            .generate_batch(&[req("fine"), bad], &BatchOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, GenLoopError::Validation(_)));
        assert!(err.to_string().contains("item 1"));
        assert_eq!(f.loader.load_count(), 0);
    }

    #[tokio::test]
    async fn test_generate_batch_inline_pixels() {
        let f = fixture(FakeLoaderBehavior::default());
        let requests = vec![req("one"), req("two").with_size(256, 256), req("three")];
        let options = BatchOptions {
            start_seed: Some(100),
            ..BatchOptions::default()
        };

        let items = f.generator.generate_batch(&requests, &options).await.unwrap();

        assert_eq!(items.len(), 3);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.index, i);
            assert_eq!(item.prompt, requests[i].prompt);
            assert_eq!(item.seed, Some(100 + i as u64));
            assert!(matches!(item.output, ImageOutput::Pixels(_)));
        }
        assert!(f.store.stored.lock().is_empty());
    }

    #[tokio::test]
    async fn test_generate_batch_saves_to_store() {
        let f = fixture(FakeLoaderBehavior::default());
        let options = BatchOptions {
            save_to_disk: true,
            prefix: Some("poster".to_string()),
            ..BatchOptions::default()
        };

        let items = f
            .generator
            .generate_batch(&[req("a"), req("b")], &options)
            .await
            .unwrap();

        let refs: Vec<_> = items
            .iter()
            .map(|item| match &item.output {
                ImageOutput::Stored(r) => r.clone(),
                ImageOutput::Pixels(_) => panic!("expected stored output"),
            })
            .collect();
        assert_eq!(refs, vec!["mem://poster_0000", "mem://poster_0001"]);
    }

    #[tokio::test]
    async fn test_submit_batch_runs_to_done() {
        let f = fixture(FakeLoaderBehavior::default());
        let requests: Vec<_> = (0..5).map(|i| req(&format!("item {}", i))).collect();
        let options = BatchOptions {
            start_seed: Some(1),
            micro_batch_size: Some(2),
            ..BatchOptions::default()
        };

        let id = f.generator.submit_batch(&requests, &options).unwrap();
        let job = wait_terminal(&f.jobs, &id).await;

        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.progress, 1.0);
        let result = job.result.unwrap();
        assert_eq!(result["count"], 5);
        assert_eq!(result["items"][3]["seed"], 4);
        assert_eq!(result["items"][3]["reference"], format!("mem://{}_0003", id));
        assert_eq!(result["token_info"][0]["tokenizer"], "tokenizer");
        assert_eq!(f.store.stored.lock().len(), 5);
        assert_eq!(job.metadata["count"], 5);
    }

    #[tokio::test]
    async fn test_failed_job_keeps_last_progress() {
        let f = fixture(FakeLoaderBehavior {
            fail_render_call: Some(2),
            ..FakeLoaderBehavior::default()
        });
        let requests: Vec<_> = (0..4).map(|i| req(&format!("item {}", i))).collect();
        let options = BatchOptions {
            micro_batch_size: Some(1),
            ..BatchOptions::default()
        };

        let id = f.generator.submit_batch(&requests, &options).unwrap();
        let job = wait_terminal(&f.jobs, &id).await;

        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error.unwrap().contains("CUDA out of memory"));
        assert_eq!(job.progress, 0.25);
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn test_load_failure_marks_job_error() {
        let f = fixture(FakeLoaderBehavior {
            fail_loads: 1,
            ..FakeLoaderBehavior::default()
        });

        let id = f
            .generator
            .submit_batch(&[req("a")], &BatchOptions::default())
            .unwrap();
        let job = wait_terminal(&f.jobs, &id).await;

        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error.unwrap().contains("weights missing"));
        assert_eq!(job.progress, 0.0);
    }

    #[tokio::test]
    async fn test_model_service_lifecycle() {
        let f = fixture(FakeLoaderBehavior::default());
        let service: Arc<dyn ModelService> = f.generator.clone();

        assert!(!service.is_loaded());
        service.ensure_loaded().await.unwrap();
        assert!(service.is_loaded());
        assert_eq!(service.name(), "fake/text-to-image");

        service.unload();
        assert!(!service.is_loaded());
    }

    #[tokio::test]
    async fn test_store_all_hands_back_results_in_order() {
        let store = Arc::new(MemoryStore::default());
        let results: Vec<GenerationResult> = (0..3u8)
            .map(|i| GenerationResult {
                image: RgbImage::from_pixel(4, 2, image::Rgb([i, 0, 0])),
                seed: Some(i as u64),
                prompt: format!("p{}", i),
                negative_prompt: String::new(),
                warnings: Vec::new(),
                token_info: Vec::new(),
            })
            .collect();

        let stored = store_all(store.clone(), results, "set".to_string()).await.unwrap();

        assert_eq!(stored.len(), 3);
        for (i, (result, reference)) in stored.iter().enumerate() {
            assert_eq!(reference, &format!("mem://set_{:04}", i));
            assert_eq!(result.prompt, format!("p{}", i));
            assert_eq!(result.image.get_pixel(0, 0)[0], i as u8);
        }
        assert_eq!(store.stored.lock().len(), 3);
    }
}
