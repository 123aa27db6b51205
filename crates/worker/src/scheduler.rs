//! Shape-grouped micro-batch scheduling
//!
//! This module turns a list of heterogeneous requests into batched inference
//! calls. Requests are grouped by execution shape, each group is cut into
//! micro-batches, and every micro-batch runs as one call while holding a
//! permit from the shared [`InferenceGate`]. Results are scattered back by
//! original index so output order always matches input order.

use crate::model::{InferenceGate, ModelHandle, SharedResource};
use crate::pipeline::{DiffusionPipeline, RenderCall, RenderOutput, TokenInfo};
use crate::request::{ExecutionShapeKey, GenerationRequest, GenerationResult, SeedPolicy};
use genloop_common::metrics::LatencyTimer;
use genloop_common::{GenLoopError, MetricsRegistry, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type ImageModel = ModelHandle<Box<dyn DiffusionPipeline>>;

/// Same-shape requests, in insertion order, with their original positions
#[derive(Debug)]
pub struct BatchGroup<'a> {
    pub key: ExecutionShapeKey,
    pub items: Vec<(usize, &'a GenerationRequest)>,
}

impl<'a> BatchGroup<'a> {
    /// Contiguous slices of at most `size` items; each is one inference call
    pub fn micro_batches(&self, size: usize) -> std::slice::Chunks<'_, (usize, &'a GenerationRequest)> {
        self.items.chunks(size.max(1))
    }

    pub fn indices(&self) -> Vec<usize> {
        self.items.iter().map(|(index, _)| *index).collect()
    }
}

/// Group requests by execution shape, keeping first-seen group order and
/// insertion order within each group
pub fn partition(requests: &[GenerationRequest], max_steps: u32) -> Vec<BatchGroup<'_>> {
    let mut groups: Vec<BatchGroup<'_>> = Vec::new();
    let mut positions: HashMap<ExecutionShapeKey, usize> = HashMap::new();

    for (index, request) in requests.iter().enumerate() {
        let key = request.shape_key(max_steps);
        let position = *positions.entry(key).or_insert_with(|| {
            groups.push(BatchGroup {
                key,
                items: Vec::new(),
            });
            groups.len() - 1
        });
        groups[position].items.push((index, request));
    }

    groups
}

/// Batch scheduler driving micro-batches against the shared image model
pub struct BatchScheduler {
    model: Arc<ImageModel>,
    gate: InferenceGate,
    max_steps: u32,
    metrics: MetricsRegistry,
}

impl BatchScheduler {
    pub fn new(
        model: Arc<ImageModel>,
        gate: InferenceGate,
        max_steps: u32,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            model,
            gate,
            max_steps,
            metrics,
        }
    }

    pub fn model(&self) -> &Arc<ImageModel> {
        &self.model
    }

    /// Run a single request as a one-element batch
    pub async fn infer(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let mut results = self
            .infer_batch(std::slice::from_ref(request), SeedPolicy::unseeded(), 1)
            .await?;
        results
            .pop()
            .ok_or_else(|| GenLoopError::internal("empty result for single request"))
    }

    /// Run every request and return results in input order.
    ///
    /// Any failure aborts the whole call; completed items are discarded.
    pub async fn infer_batch(
        &self,
        requests: &[GenerationRequest],
        seeds: SeedPolicy,
        micro_batch_size: usize,
    ) -> Result<Vec<GenerationResult>> {
        self.infer_batch_with_progress(requests, seeds, micro_batch_size, |_, _| {})
            .await
    }

    /// Like [`infer_batch`](Self::infer_batch), calling
    /// `on_progress(completed, total)` once per finished item
    pub async fn infer_batch_with_progress<F>(
        &self,
        requests: &[GenerationRequest],
        seeds: SeedPolicy,
        micro_batch_size: usize,
        mut on_progress: F,
    ) -> Result<Vec<GenerationResult>>
    where
        F: FnMut(usize, usize) + Send,
    {
        self.metrics.generation.requests_total.inc();

        let outcome = self
            .run_batch(requests, seeds, micro_batch_size.max(1), &mut on_progress)
            .await;

        match &outcome {
            Ok(results) => {
                self.metrics
                    .generation
                    .items_generated_total
                    .inc_by(results.len() as u64);
            }
            Err(e) => {
                self.metrics.generation.requests_failed.inc();
                warn!("Batch of {} requests failed: {}", requests.len(), e);
            }
        }

        outcome
    }

    async fn run_batch(
        &self,
        requests: &[GenerationRequest],
        seeds: SeedPolicy,
        micro_batch_size: usize,
        on_progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<Vec<GenerationResult>> {
        // Load failures surface as ModelLoad, not Generation
        let pipeline = self.model.ensure_loaded().await?;

        let total = requests.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let groups = partition(requests, self.max_steps);
        debug!(
            "Partitioned {} requests into {} shape groups (micro batch {})",
            total,
            groups.len(),
            micro_batch_size
        );

        // Measured once, on the first prompt only, and shared by every item
        let token_info = measure_tokens(&pipeline, requests[0].prompt.clone()).await?;

        let mut slots: Vec<Option<GenerationResult>> = (0..total).map(|_| None).collect();
        let mut completed = 0usize;

        for group in &groups {
            for chunk in group.micro_batches(micro_batch_size) {
                let call = build_call(group.key, chunk, &seeds);
                let first = chunk.first().map(|(index, _)| *index).unwrap_or_default();

                info!(
                    items = chunk.len(),
                    first_index = first,
                    width = call.width,
                    height = call.height,
                    steps = call.steps,
                    guidance = call.guidance_scale,
                    "Running micro batch"
                );

                let output = self.run_call(&pipeline, call.clone()).await?;

                if output.images.len() != chunk.len() {
                    return Err(GenLoopError::generation(format!(
                        "Image batch generation failed: pipeline returned {} images for {} prompts",
                        output.images.len(),
                        chunk.len()
                    )));
                }

                let RenderCall {
                    prompts,
                    negative_prompts,
                    generators,
                    ..
                } = call;
                let item_seeds = generators.unwrap_or_else(|| vec![None; chunk.len()]);
                let items = chunk
                    .iter()
                    .zip(output.images)
                    .zip(item_seeds)
                    .zip(prompts.into_iter().zip(negative_prompts));

                for ((((index, _), image), seed), (prompt, negative_prompt)) in items {
                    slots[*index] = Some(GenerationResult {
                        image,
                        seed,
                        prompt,
                        negative_prompt,
                        warnings: output.warnings.clone(),
                        token_info: token_info.clone(),
                    });
                    completed += 1;
                    on_progress(completed, total);
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| {
                    GenLoopError::internal(format!("no result produced for item {}", index))
                })
            })
            .collect()
    }

    /// One inference call under a gate permit, offloaded to a blocking thread
    async fn run_call(
        &self,
        pipeline: &SharedResource<Box<dyn DiffusionPipeline>>,
        call: RenderCall,
    ) -> Result<RenderOutput> {
        let permit = self.gate.acquire().await?;
        self.metrics.generation.micro_batch_size.observe(call.len() as f64);

        let pipeline = pipeline.clone();
        let timer = self.metrics.generation.inference_duration.clone();
        let inflight = self.metrics.generation.inflight_calls.clone();
        inflight.inc();

        // The permit moves with the render so it outlives a dropped caller
        let joined = tokio::task::spawn_blocking(move || {
            let output = timer.time(|| {
                // Held for the whole reset + render sequence
                let mut pipeline = pipeline.lock();
                pipeline.reset_sampler();
                pipeline.render(&call)
            });
            inflight.dec();
            drop(permit);
            output
        })
        .await;

        match joined {
            Ok(Ok(output)) => {
                for warning in &output.warnings {
                    debug!("Pipeline warning: {}", warning);
                }
                Ok(output)
            }
            Ok(Err(e)) => Err(GenLoopError::generation(format!(
                "Image batch generation failed: {:#}",
                e
            ))),
            Err(e) => Err(GenLoopError::generation(format!(
                "Image batch generation failed: inference task failed: {}",
                e
            ))),
        }
    }
}

fn build_call(
    key: ExecutionShapeKey,
    chunk: &[(usize, &GenerationRequest)],
    seeds: &SeedPolicy,
) -> RenderCall {
    let resolved: Vec<Option<u64>> = chunk
        .iter()
        .map(|(index, request)| seeds.resolve(request.seed, *index))
        .collect();

    // Library default randomness when nothing in the slice is seeded
    let generators = if resolved.iter().all(Option::is_none) {
        None
    } else {
        Some(resolved)
    };

    RenderCall {
        prompts: chunk.iter().map(|(_, r)| r.prompt.clone()).collect(),
        negative_prompts: chunk.iter().map(|(_, r)| r.negative_or_default()).collect(),
        steps: key.steps,
        guidance_scale: key.guidance_scale(),
        width: key.width,
        height: key.height,
        generators,
    }
}

async fn measure_tokens(
    pipeline: &SharedResource<Box<dyn DiffusionPipeline>>,
    prompt: String,
) -> Result<Vec<TokenInfo>> {
    let pipeline = pipeline.clone();
    tokio::task::spawn_blocking(move || pipeline.lock().measure_tokens(&prompt))
        .await
        .map_err(|e| GenLoopError::generation(format!("token measurement failed: {}", e)))
}
