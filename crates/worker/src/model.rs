//! Model resource lifecycle and the inference concurrency gate
//!
//! A [`ModelHandle`] owns one heavyweight resource through
//! unloaded -> loading -> loaded. Loads are single-flight: callers arriving
//! while a load runs wait on that same load and all observe its outcome.
//! The [`InferenceGate`] bounds how many inference calls run against the
//! accelerator at once.

use crate::device::DeviceProfile;
use crate::pipeline::ResourceLoader;
use async_trait::async_trait;
use genloop_common::{GenLoopError, MetricsRegistry, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

/// A loaded resource. The inner lock must be held for a whole inference call.
pub type SharedResource<R> = Arc<Mutex<R>>;

/// Outcome broadcast to everyone waiting on one load
type LoadOutcome<R> = std::result::Result<SharedResource<R>, String>;

/// Lifecycle state, as observed by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Unloaded,
    Loading,
    Loaded,
}

enum Slot<R> {
    Unloaded,
    Loading(watch::Receiver<Option<LoadOutcome<R>>>),
    Loaded(SharedResource<R>),
}

/// Owner of one lazily loaded inference resource
pub struct ModelHandle<R: Send + 'static> {
    loader: Arc<dyn ResourceLoader<R>>,
    profile: DeviceProfile,
    slot: Arc<Mutex<Slot<R>>>,
    metrics: MetricsRegistry,
}

impl<R: Send + 'static> ModelHandle<R> {
    /// Create an unloaded handle; the device profile is fixed from here on
    pub fn new(
        loader: Arc<dyn ResourceLoader<R>>,
        profile: DeviceProfile,
        metrics: MetricsRegistry,
    ) -> Self {
        info!("Model {} will run on {}", loader.describe(), profile);

        Self {
            loader,
            profile,
            slot: Arc::new(Mutex::new(Slot::Unloaded)),
            metrics,
        }
    }

    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    pub fn describe(&self) -> String {
        self.loader.describe()
    }

    pub fn state(&self) -> ResourceState {
        match &*self.slot.lock() {
            Slot::Unloaded => ResourceState::Unloaded,
            Slot::Loading(_) => ResourceState::Loading,
            Slot::Loaded(_) => ResourceState::Loaded,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == ResourceState::Loaded
    }

    /// Return the loaded resource, loading it first if needed.
    ///
    /// On failure the handle goes back to unloaded and the next call starts
    /// a fresh load.
    pub async fn ensure_loaded(&self) -> Result<SharedResource<R>> {
        let mut rx = {
            let mut slot = self.slot.lock();
            match &*slot {
                Slot::Loaded(resource) => return Ok(resource.clone()),
                Slot::Loading(rx) => {
                    debug!("Load of {} already in flight, waiting", self.loader.describe());
                    rx.clone()
                }
                Slot::Unloaded => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Slot::Loading(rx.clone());
                    self.spawn_load(tx);
                    rx
                }
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| GenLoopError::model_load("load task ended without reporting"))?
            .clone();

        match outcome {
            Some(Ok(resource)) => Ok(resource),
            Some(Err(msg)) => Err(GenLoopError::ModelLoad(msg)),
            None => Err(GenLoopError::model_load("load task ended without reporting")),
        }
    }

    // The load runs detached so that a dropped caller never strands waiters.
    fn spawn_load(&self, tx: watch::Sender<Option<LoadOutcome<R>>>) {
        let loader = self.loader.clone();
        let profile = self.profile;
        let slot = self.slot.clone();
        let metrics = self.metrics.clone();
        let name = loader.describe();

        info!("Loading model {} on {}", name, profile);

        tokio::spawn(async move {
            let start = Instant::now();
            let joined = tokio::task::spawn_blocking(move || loader.load(profile)).await;

            let outcome: LoadOutcome<R> = match joined {
                Ok(Ok(resource)) => Ok(Arc::new(Mutex::new(resource))),
                Ok(Err(e)) => Err(format!("Failed to load {}: {:#}", name, e)),
                Err(e) => Err(format!("Failed to load {}: load task failed: {}", name, e)),
            };

            {
                let mut slot = slot.lock();
                match &outcome {
                    Ok(resource) => {
                        metrics.model.load_duration.observe(start.elapsed().as_secs_f64());
                        metrics.model.loaded.inc();
                        info!("Model {} loaded in {:?}", name, start.elapsed());
                        *slot = Slot::Loaded(resource.clone());
                    }
                    Err(msg) => {
                        metrics.model.load_failures.inc();
                        error!("{}", msg);
                        *slot = Slot::Unloaded;
                    }
                }
            }

            // Every waiter may have gone away; nothing to report to then.
            let _ = tx.send(Some(outcome));
        });
    }

    /// Release the resource. In-flight calls keep their reference until they
    /// finish; a load in progress is left to complete.
    pub fn unload(&self) {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Loaded(_) => {
                *slot = Slot::Unloaded;
                self.metrics.model.loaded.dec();
                info!("Model {} unloaded", self.loader.describe());
            }
            Slot::Loading(_) => {
                debug!("Unload requested while {} is loading; ignored", self.loader.describe());
            }
            Slot::Unloaded => {}
        }
    }
}

/// Counting gate in front of the accelerator.
///
/// First come, first served; no priorities.
#[derive(Clone)]
pub struct InferenceGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl InferenceGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a permit; dropping the permit releases it
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GenLoopError::internal("inference gate closed"))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Capability shared by the image and video generators
#[async_trait]
pub trait ModelService: Send + Sync {
    fn name(&self) -> String;

    async fn ensure_loaded(&self) -> Result<()>;

    fn unload(&self);

    fn is_loaded(&self) -> bool;
}
