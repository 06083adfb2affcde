//! Compute device selection.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;

/// Device requested by configuration. Fixed for the lifetime of a manager.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRequest {
    /// Use an accelerator when one is present, otherwise the CPU.
    #[default]
    Auto,
    Cpu,
    Cuda,
    Rocm,
}

impl DeviceRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRequest::Auto => "auto",
            DeviceRequest::Cpu => "cpu",
            DeviceRequest::Cuda => "cuda",
            DeviceRequest::Rocm => "rocm",
        }
    }
}

impl fmt::Display for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(DeviceRequest::Auto),
            "cpu" => Ok(DeviceRequest::Cpu),
            "cuda" => Ok(DeviceRequest::Cuda),
            "rocm" => Ok(DeviceRequest::Rocm),
            other => Err(format!("unknown device option '{other}'")),
        }
    }
}

/// Accelerator backend a model runtime was built against.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuBackend {
    Cuda,
    Rocm,
}

/// Device an engine actually runs on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
    Rocm,
}

impl Device {
    /// Name understood by the model runtime. ROCm builds expose the GPU
    /// through the CUDA device name.
    pub fn compute_name(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda | Device::Rocm => "cuda",
        }
    }

    /// Human-readable label reported to callers.
    pub fn label(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Rocm => "rocm",
        }
    }

    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<GpuBackend> for Device {
    fn from(value: GpuBackend) -> Self {
        match value {
            GpuBackend::Cuda => Device::Cuda,
            GpuBackend::Rocm => Device::Rocm,
        }
    }
}

/// Resolve a device request against the accelerator that is available.
pub fn select_device(requested: DeviceRequest, available: Option<GpuBackend>) -> Result<Device, EngineError> {
    match (requested, available) {
        (DeviceRequest::Cpu, _) => Ok(Device::Cpu),
        (DeviceRequest::Auto, Some(backend)) => Ok(backend.into()),
        (DeviceRequest::Auto, None) => Ok(Device::Cpu),
        (DeviceRequest::Cuda, Some(GpuBackend::Cuda)) => Ok(Device::Cuda),
        (DeviceRequest::Cuda, Some(GpuBackend::Rocm)) => Err(EngineError::DeviceUnavailable(
            "CUDA requested but the model runtime targets ROCm".to_string(),
        )),
        (DeviceRequest::Cuda, None) => Err(EngineError::DeviceUnavailable(
            "CUDA requested but no compatible GPU is available".to_string(),
        )),
        (DeviceRequest::Rocm, Some(GpuBackend::Rocm)) => Ok(Device::Rocm),
        (DeviceRequest::Rocm, Some(GpuBackend::Cuda)) => Err(EngineError::DeviceUnavailable(
            "ROCm requested but the model runtime targets CUDA".to_string(),
        )),
        (DeviceRequest::Rocm, None) => Err(EngineError::DeviceUnavailable(
            "ROCm requested but no compatible GPU is available".to_string(),
        )),
    }
}
