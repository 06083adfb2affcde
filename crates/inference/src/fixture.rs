//! Deterministic stand-in engine.
//!
//! Used when no model backend is linked into the binary (local development,
//! black-box tests). Predictions are derived from a hash of the image bytes,
//! so the same file always yields the same ranked list. An empty file yields
//! no predictions.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::device::{Device, GpuBackend};
use crate::engine::{EngineError, EngineFactory, InferenceEngine, RawPrediction};

#[derive(Debug, Clone)]
pub struct DeterministicEngine {
    device: Device,
}

impl DeterministicEngine {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

impl InferenceEngine for DeterministicEngine {
    fn predict(&self, path: &Path, top_k: usize) -> Result<Vec<RawPrediction>, EngineError> {
        let bytes = fs::read(path)
            .map_err(|e| EngineError::InvalidInput(format!("cannot read {}: {e}", path.display())))?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = fnv1a(&bytes);
        let head = 0.2 + 0.4 * unit(splitmix64(&mut state));
        let predictions = (0..top_k)
            .map(|i| {
                let latitude = unit(splitmix64(&mut state)) * 180.0 - 90.0;
                let longitude = unit(splitmix64(&mut state)) * 360.0 - 180.0;
                RawPrediction::new(latitude, longitude, head / (i + 1) as f64)
            })
            .collect();
        Ok(predictions)
    }

    fn device(&self) -> Device {
        self.device
    }
}

/// Factory for [`DeterministicEngine`], with an optional artificial load delay.
#[derive(Debug, Clone, Default)]
pub struct DeterministicEngineFactory {
    accelerator: Option<GpuBackend>,
    load_delay: Duration,
}

impl DeterministicEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accelerator(mut self, backend: GpuBackend) -> Self {
        self.accelerator = Some(backend);
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }
}

impl EngineFactory for DeterministicEngineFactory {
    fn accelerator(&self) -> Option<GpuBackend> {
        self.accelerator
    }

    fn load(&self, device: Device) -> Result<Arc<dyn InferenceEngine>, EngineError> {
        if !self.load_delay.is_zero() {
            thread::sleep(self.load_delay);
        }
        Ok(Arc::new(DeterministicEngine::new(device)))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn unit(x: u64) -> f64 {
    (x >> 11) as f64 / (1u64 << 53) as f64
}
