use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{Device, GpuBackend};

/// One ranked guess as returned by the model, before reverse geocoding.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPrediction {
    pub latitude: f64,
    pub longitude: f64,
    /// Raw model score; not guaranteed to be normalized.
    pub probability: f64,
}

impl RawPrediction {
    pub fn new(latitude: f64, longitude: f64, probability: f64) -> Self {
        Self {
            latitude,
            longitude,
            probability,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite() && self.probability.is_finite()
    }
}

/// A loaded geolocation model.
///
/// Implementations must tolerate concurrent `predict` calls (`Sync`). Engines
/// that cannot should be run with `ResidencyConfig::exclusive_inference`.
pub trait InferenceEngine: Send + Sync + 'static {
    /// Rank up to `top_k` coordinates for the image at `path`, best first.
    fn predict(&self, path: &Path, top_k: usize) -> Result<Vec<RawPrediction>, EngineError>;

    /// Device the engine was loaded onto.
    fn device(&self) -> Device;
}

/// Constructs engines. Loading is expensive and may take seconds.
pub trait EngineFactory: Send + Sync + 'static {
    /// Accelerator the runtime can use, if any.
    fn accelerator(&self) -> Option<GpuBackend> {
        None
    }

    fn load(&self, device: Device) -> Result<Arc<dyn InferenceEngine>, EngineError>;

    /// Best-effort release of device-side caches after an engine was dropped.
    fn release_device_caches(&self, _device: Device) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("model load failed: {0}")]
    LoadFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),
}
