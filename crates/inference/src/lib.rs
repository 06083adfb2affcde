//! `locate-inference`
//!
//! **Responsibility:** the boundary around the geolocation model.
//!
//! - The model itself is an opaque [`InferenceEngine`]; this crate never
//!   computes embeddings, it only orchestrates engine instances.
//! - [`ModelResidencyManager`] keeps at most one engine resident per process
//!   and evicts it after an idle period.
//! - [`predict_records`] fans a batch of image records out to one engine and
//!   produces exactly one [`PredictionOutcome`] per record.
//! - Reverse geocoding is delegated to a [`PlaceResolver`], which never fails.

pub mod device;
pub mod engine;
pub mod fixture;
pub mod place;
pub mod prediction;
pub mod residency;

pub use device::{Device, DeviceRequest, GpuBackend, select_device};
pub use engine::{EngineError, EngineFactory, InferenceEngine, RawPrediction};
pub use fixture::{DeterministicEngine, DeterministicEngineFactory};
pub use place::{GazetteerError, GazetteerResolver, NoPlaceResolver, Place, PlaceResolver};
pub use prediction::{
    BatchOptions, InputRecord, LocationPrediction, PredictionOutcome, RecordError, build_candidates,
    predict_records,
};
pub use residency::{
    EngineHandle, ModelResidencyManager, ResidencyConfig, ResidencyError, ResidencyStatus,
};
