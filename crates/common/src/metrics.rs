//! Metrics collection for GenLoop
//!
//! This module provides Prometheus metrics for observability.
//! Components receive a registry by construction; the binary uses the
//! process-wide [`METRICS`] instance.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for GenLoop
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub generation: GenerationMetrics,
    pub model: ModelMetrics,
    pub jobs: JobMetrics,
}

/// Batch scheduler metrics
#[derive(Debug, Clone)]
pub struct GenerationMetrics {
    /// Total number of generation requests (one per batch call)
    pub requests_total: IntCounter,

    /// Total number of failed generation requests
    pub requests_failed: IntCounter,

    /// Total number of generated items
    pub items_generated_total: IntCounter,

    /// Items per inference call
    pub micro_batch_size: Histogram,

    /// Wall time of one inference call
    pub inference_duration: Histogram,

    /// Inference calls currently holding a permit
    pub inflight_calls: IntGauge,
}

/// Model resource metrics
#[derive(Debug, Clone)]
pub struct ModelMetrics {
    /// Model load duration
    pub load_duration: Histogram,

    /// Failed load attempts
    pub load_failures: IntCounter,

    /// Number of loaded model resources
    pub loaded: IntGauge,

    /// Warmup tasks started
    pub warmup_started: IntCounter,
}

/// Job tracker metrics
#[derive(Debug, Clone)]
pub struct JobMetrics {
    /// Jobs created
    pub created_total: IntCounter,

    /// Jobs that ended in error
    pub failed_total: IntCounter,

    /// Jobs evicted by cleanup
    pub evicted_total: IntCounter,

    /// Jobs not yet terminal
    pub active: IntGauge,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).unwrap();
    registry.register(Box::new(metric.clone())).unwrap();
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).unwrap();
    registry.register(Box::new(metric.clone())).unwrap();
    metric
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let metric = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets)).unwrap();
    registry.register(Box::new(metric.clone())).unwrap();
    metric
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let generation = GenerationMetrics {
            requests_total: counter(
                &registry,
                "generation_requests_total",
                "Total number of generation requests",
            ),
            requests_failed: counter(
                &registry,
                "generation_requests_failed_total",
                "Total number of failed generation requests",
            ),
            items_generated_total: counter(
                &registry,
                "generation_items_total",
                "Total number of generated items",
            ),
            micro_batch_size: histogram(
                &registry,
                "generation_micro_batch_size",
                "Items per inference call",
                vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0],
            ),
            inference_duration: histogram(
                &registry,
                "generation_inference_duration_seconds",
                "Inference call duration in seconds",
                vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0],
            ),
            inflight_calls: gauge(
                &registry,
                "generation_inflight_calls",
                "Inference calls currently running",
            ),
        };

        let model = ModelMetrics {
            load_duration: histogram(
                &registry,
                "model_load_duration_seconds",
                "Model load duration in seconds",
                vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0],
            ),
            load_failures: counter(
                &registry,
                "model_load_failures_total",
                "Total number of failed model loads",
            ),
            loaded: gauge(&registry, "model_loaded", "Number of loaded model resources"),
            warmup_started: counter(
                &registry,
                "model_warmup_started_total",
                "Total number of warmup tasks started",
            ),
        };

        let jobs = JobMetrics {
            created_total: counter(&registry, "jobs_created_total", "Total number of jobs created"),
            failed_total: counter(
                &registry,
                "jobs_failed_total",
                "Total number of jobs that ended in error",
            ),
            evicted_total: counter(
                &registry,
                "jobs_evicted_total",
                "Total number of job records evicted by cleanup",
            ),
            active: gauge(&registry, "jobs_active", "Jobs not yet in a terminal state"),
        };

        MetricsRegistry {
            registry,
            generation,
            model,
            jobs,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
