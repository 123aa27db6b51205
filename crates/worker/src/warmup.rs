//! Best-effort background model warmup

use crate::model::ModelService;
use genloop_common::MetricsRegistry;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Snapshot for readiness probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WarmupStatus {
    pub ready: bool,
    pub in_progress: bool,
}

pub struct WarmupController {
    service: Arc<dyn ModelService>,
    task: Mutex<Option<JoinHandle<()>>>,
    ready: Arc<AtomicBool>,
    metrics: MetricsRegistry,
}

impl WarmupController {
    pub fn new(service: Arc<dyn ModelService>, metrics: MetricsRegistry) -> Self {
        Self {
            service,
            task: Mutex::new(None),
            ready: Arc::new(AtomicBool::new(false)),
            metrics,
        }
    }

    /// Start a background load unless one is already running.
    ///
    /// Returns whether a new attempt was started. Never waits for the load.
    pub fn ensure_started(&self) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            info!("Warmup already in progress");
            return false;
        }

        let service = self.service.clone();
        let ready = self.ready.clone();
        self.metrics.model.warmup_started.inc();
        info!("Starting warmup for {}", service.name());

        *task = Some(tokio::spawn(async move {
            match service.ensure_loaded().await {
                Ok(()) => {
                    ready.store(true, Ordering::SeqCst);
                    info!("Warmup complete: {} is loaded and ready", service.name());
                }
                Err(e) => {
                    ready.store(false, Ordering::SeqCst);
                    error!("Warmup failed: {}", e);
                }
            }
        }));

        true
    }

    /// Whether the most recent warmup attempt succeeded
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn status(&self) -> WarmupStatus {
        WarmupStatus {
            ready: self.is_ready(),
            in_progress: self.is_running(),
        }
    }

    /// Wait for the current attempt, if any
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Warmup task aborted: {}", e);
            }
        }
    }
}
