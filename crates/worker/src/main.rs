//! GenLoop Worker - Main Entry Point
//!
//! Builds the service context, warms the image model and keeps expired jobs
//! pruned until shutdown.

use genloop_common::{GenLoopConfig, Result, METRICS};
use genloop_worker::{Backends, DeviceProfile, ServiceContext};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::var("GENLOOP_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("configs/worker-config.yaml"));

    let config = GenLoopConfig::load(Some(config_path.as_path()))?;

    // Initialize logging
    let level = &config.observability.log_level;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("genloop_worker={},genloop_common={}", level, level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting GenLoop Worker");
    info!(
        "Configuration loaded from {}: image_model={}, video_enabled={}, permits={}",
        config_path.display(),
        config.model.image_repo_id,
        config.video.enabled,
        config.scheduler.max_concurrent_inferences
    );

    config.prepare_dirs()?;

    let profile = DeviceProfile::detect(config.model.force_fp16);
    info!("Selected device profile: {}", profile);

    let backends = Backends::reference(&config);
    let auto_warmup = config.warmup.auto_warmup;
    let enable_metrics = config.observability.enable_metrics;
    let context = Arc::new(ServiceContext::new(config, profile, backends, METRICS.clone())?);

    if auto_warmup {
        context.warmup().ensure_started();
    }

    let cleanup_handle = context.spawn_cleanup();

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    info!("Received shutdown signal");

    cleanup_handle.abort();
    context.unload_all();

    if enable_metrics {
        info!("Final metrics:\n{}", context.metrics().gather());
    }

    info!("GenLoop Worker shutdown complete");
    Ok(())
}
