//! Accelerator and precision selection
//!
//! Resolved once when a model handle is constructed and never changed after.

use candle_core::DType;
use serde::Serialize;
use std::fmt;

/// Compute device, in descending order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cuda,
    Metal,
    Cpu,
}

impl DeviceKind {
    /// Fallback order, ending in the always-available CPU path
    pub const PRIORITY: [DeviceKind; 3] = [DeviceKind::Cuda, DeviceKind::Metal, DeviceKind::Cpu];
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cuda => write!(f, "cuda"),
            DeviceKind::Metal => write!(f, "metal"),
            DeviceKind::Cpu => write!(f, "cpu"),
        }
    }
}

/// Numeric precision the model runs at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F16,
    F32,
}

/// Device and precision chosen for a model resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceProfile {
    pub device: DeviceKind,
    pub precision: Precision,
}

impl DeviceProfile {
    /// Pick the best device among `available` and the matching precision.
    ///
    /// Half precision is only used on CUDA and only when `force_fp16` is set.
    pub fn resolve(available: &[DeviceKind], force_fp16: bool) -> Self {
        let device = DeviceKind::PRIORITY
            .into_iter()
            .find(|kind| *kind == DeviceKind::Cpu || available.contains(kind))
            .unwrap_or(DeviceKind::Cpu);

        let precision = if device == DeviceKind::Cuda && force_fp16 {
            Precision::F16
        } else {
            Precision::F32
        };

        Self { device, precision }
    }

    /// Probe the host for accelerators
    pub fn detect(force_fp16: bool) -> Self {
        let mut available = Vec::with_capacity(3);
        if candle_core::utils::cuda_is_available() {
            available.push(DeviceKind::Cuda);
        }
        if candle_core::utils::metal_is_available() {
            available.push(DeviceKind::Metal);
        }
        available.push(DeviceKind::Cpu);

        Self::resolve(&available, force_fp16)
    }

    /// CPU profile, used by tests and CPU-only deployments
    pub fn cpu() -> Self {
        Self {
            device: DeviceKind::Cpu,
            precision: Precision::F32,
        }
    }

    pub fn dtype(&self) -> DType {
        match self.precision {
            Precision::F16 => DType::F16,
            Precision::F32 => DType::F32,
        }
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.device, self.precision)
    }
}
