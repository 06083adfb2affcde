//! Model residency: at most one engine per process, evicted when idle.
//!
//! ## Locking
//!
//! A single mutex guards `(engine, last_used)` as a unit. Loading and eviction
//! both run under it, so a caller never observes a half-built or half-evicted
//! engine, and the idle sweep can never drop an engine between a caller
//! stamping `last_used` and receiving its handle.
//!
//! ## Handles
//!
//! [`EngineHandle`] keeps the engine alive while a unit of work runs. Eviction
//! only drops the manager's reference; callers must reacquire per task instead
//! of caching handles.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::device::{Device, DeviceRequest, select_device};
use crate::engine::{EngineError, EngineFactory, InferenceEngine, RawPrediction};

/// Residency configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct ResidencyConfig {
    pub device: DeviceRequest,
    /// Evict after the engine has been unused for longer than this.
    pub idle_timeout: Duration,
    /// How often the background sweep checks for idleness.
    pub sweep_interval: Duration,
    /// Serialize `predict` calls for engines that are not safe to share.
    pub exclusive_inference: bool,
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        Self {
            device: DeviceRequest::Auto,
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            exclusive_inference: false,
        }
    }
}

impl ResidencyConfig {
    pub fn with_device(mut self, device: DeviceRequest) -> Self {
        self.device = device;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn with_exclusive_inference(mut self, exclusive: bool) -> Self {
        self.exclusive_inference = exclusive;
        self
    }
}

#[derive(Debug, Error)]
pub enum ResidencyError {
    #[error(transparent)]
    Load(#[from] EngineError),

    #[error("model manager has been shut down")]
    ShutDown,
}

/// Borrowed access to the resident engine for one unit of work.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<dyn InferenceEngine>,
    gate: Option<Arc<Mutex<()>>>,
}

impl EngineHandle {
    /// Wrap an engine directly, without a manager (tests, one-shot tools).
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self { engine, gate: None }
    }

    pub fn predict(&self, path: &Path, top_k: usize) -> Result<Vec<RawPrediction>, EngineError> {
        let _serialized = self
            .gate
            .as_ref()
            .map(|gate| gate.lock().unwrap_or_else(PoisonError::into_inner));
        self.engine.predict(path, top_k)
    }

    pub fn device(&self) -> Device {
        self.engine.device()
    }

    /// Whether two handles point at the same engine instance.
    pub fn same_engine(&self, other: &EngineHandle) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine)
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("device", &self.engine.device())
            .field("exclusive", &self.gate.is_some())
            .finish()
    }
}

/// Snapshot of residency state for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResidencyStatus {
    pub loaded: bool,
    pub requested_device: DeviceRequest,
    pub device: Option<Device>,
    pub idle_timeout_secs: u64,
    pub idle_secs: Option<u64>,
    pub loads: u64,
    pub evictions: u64,
}

struct ResidencyState {
    engine: Option<Arc<dyn InferenceEngine>>,
    last_used: Option<Instant>,
}

struct Shared {
    factory: Arc<dyn EngineFactory>,
    config: ResidencyConfig,
    state: Mutex<ResidencyState>,
    gate: Option<Arc<Mutex<()>>>,
    shut_down: AtomicBool,
    loads: AtomicU64,
    evictions: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ResidencyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, engine: &Arc<dyn InferenceEngine>) -> EngineHandle {
        EngineHandle {
            engine: engine.clone(),
            gate: self.gate.clone(),
        }
    }

    fn acquire(&self) -> Result<EngineHandle, ResidencyError> {
        let mut state = self.lock();
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ResidencyError::ShutDown);
        }

        state.last_used = Some(Instant::now());
        if let Some(engine) = &state.engine {
            return Ok(self.handle(engine));
        }

        let device = select_device(self.config.device, self.factory.accelerator())?;
        info!(requested = %self.config.device, device = %device, "loading inference engine");
        let started = Instant::now();

        let engine = match self.factory.load(device) {
            Ok(engine) => engine,
            Err(e) => {
                // State stays empty so the next caller retries the load.
                error!(device = %device, error = %e, "inference engine load failed");
                return Err(e.into());
            }
        };

        self.loads.fetch_add(1, Ordering::Relaxed);
        info!(
            device = %engine.device(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "inference engine loaded"
        );

        // Load time does not count towards idleness.
        state.last_used = Some(Instant::now());
        let handle = self.handle(&engine);
        state.engine = Some(engine);
        Ok(handle)
    }

    fn release_idle_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        let expired = match (&state.engine, state.last_used) {
            (Some(_), Some(last_used)) => now.saturating_duration_since(last_used) > self.config.idle_timeout,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !expired {
            return false;
        }
        info!(
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "inference engine idle, unloading"
        );
        self.evict(&mut state);
        true
    }

    fn evict(&self, state: &mut ResidencyState) {
        state.last_used = None;
        if let Some(engine) = state.engine.take() {
            let device = engine.device();
            drop(engine);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.factory.release_device_caches(device);
            info!(device = %device, "inference engine unloaded");
        }
    }
}

struct Sweeper {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

/// Owns the process's inference engine.
///
/// Constructed by the composition root and shared by `Arc`; there is no global
/// instance. After [`shutdown`](Self::shutdown), `acquire` returns
/// [`ResidencyError::ShutDown`] instead of reloading.
pub struct ModelResidencyManager {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl ModelResidencyManager {
    /// Create a manager without a background sweep.
    pub fn new(factory: Arc<dyn EngineFactory>, config: ResidencyConfig) -> Self {
        let gate = config.exclusive_inference.then(|| Arc::new(Mutex::new(())));
        Self {
            shared: Arc::new(Shared {
                factory,
                config,
                state: Mutex::new(ResidencyState {
                    engine: None,
                    last_used: None,
                }),
                gate,
                shut_down: AtomicBool::new(false),
                loads: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Create a manager and start its idle sweep.
    pub fn spawn(factory: Arc<dyn EngineFactory>, config: ResidencyConfig) -> Arc<Self> {
        let manager = Arc::new(Self::new(factory, config));
        manager.start_sweeper();
        manager
    }

    /// Start the background idle sweep. Returns `false` if it already runs.
    pub fn start_sweeper(&self) -> bool {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() || self.shared.shut_down.load(Ordering::SeqCst) {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let shared = self.shared.clone();
        let join = thread::Builder::new()
            .name("model-idle-sweep".to_string())
            .spawn(move || sweep_loop(shared, shutdown_rx));

        match join {
            Ok(join) => {
                *sweeper = Some(Sweeper {
                    shutdown: shutdown_tx,
                    join: Some(join),
                });
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to spawn idle sweep thread; engine will stay resident");
                false
            }
        }
    }

    /// Get the engine, loading it first if it is not resident.
    ///
    /// Blocks for the duration of a load. Async callers should run this on a
    /// blocking thread.
    pub fn acquire(&self) -> Result<EngineHandle, ResidencyError> {
        self.shared.acquire()
    }

    /// Evict the engine if it has been idle longer than the configured timeout.
    ///
    /// Returns whether an engine was evicted. A no-op when nothing is resident.
    pub fn release_idle_if_expired(&self) -> bool {
        self.shared.release_idle_at(Instant::now())
    }

    pub fn is_loaded(&self) -> bool {
        self.shared.lock().engine.is_some()
    }

    /// Number of engine constructions so far.
    pub fn load_count(&self) -> u64 {
        self.shared.loads.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &ResidencyConfig {
        &self.shared.config
    }

    pub fn status(&self) -> ResidencyStatus {
        let state = self.shared.lock();
        ResidencyStatus {
            loaded: state.engine.is_some(),
            requested_device: self.shared.config.device,
            device: state.engine.as_ref().map(|e| e.device()),
            idle_timeout_secs: self.shared.config.idle_timeout.as_secs(),
            idle_secs: state
                .engine
                .as_ref()
                .and(state.last_used)
                .map(|t| t.elapsed().as_secs()),
            loads: self.shared.loads.load(Ordering::Relaxed),
            evictions: self.shared.evictions.load(Ordering::Relaxed),
        }
    }

    /// Stop the sweep and evict the engine. Further acquisitions fail.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            self.shared.shut_down.store(true, Ordering::SeqCst);
            self.shared.evict(&mut state);
        }
        self.stop_sweeper();
        debug!("model residency manager shut down");
    }

    fn stop_sweeper(&self) {
        let taken = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut sweeper) = taken {
            let _ = sweeper.shutdown.send(());
            if let Some(join) = sweeper.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for ModelResidencyManager {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

impl fmt::Debug for ModelResidencyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelResidencyManager")
            .field("config", &self.shared.config)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

fn sweep_loop(shared: Arc<Shared>, shutdown_rx: mpsc::Receiver<()>) {
    debug!(
        interval_ms = shared.config.sweep_interval.as_millis() as u64,
        "idle sweep started"
    );
    loop {
        match shutdown_rx.recv_timeout(shared.config.sweep_interval) {
            Err(RecvTimeoutError::Timeout) => {
                shared.release_idle_at(Instant::now());
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("idle sweep stopped");
}
