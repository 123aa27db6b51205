//! GenLoop common library
//!
//! This crate contains shared code used across GenLoop components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::GenLoopConfig;
pub use error::{GenLoopError, Result};
pub use metrics::{MetricsRegistry, METRICS};
