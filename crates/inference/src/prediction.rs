//! Prediction records and the per-record fan-out.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::{EngineError, RawPrediction};
use crate::place::{Place, PlaceResolver};
use crate::residency::EngineHandle;

/// A single image to geolocate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    /// 1-based position in the submitted batch.
    pub index: usize,
    pub path: PathBuf,
    /// Optional content hash carried through for callers' bookkeeping.
    pub md5: Option<String>,
}

impl InputRecord {
    pub fn new(index: usize, path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            path: path.into(),
            md5: None,
        }
    }

    pub fn with_md5(mut self, md5: impl Into<String>) -> Self {
        self.md5 = Some(md5.into());
        self
    }

    /// Progress banner, e.g. `3/10 :: <md5> :: /images/a.jpg`.
    pub fn banner(&self, total: usize) -> String {
        let mut parts = vec![format!("{}/{}", self.index, total)];
        if let Some(md5) = &self.md5 {
            parts.push(md5.clone());
        }
        parts.push(self.path.display().to_string());
        parts.join(" :: ")
    }
}

/// One ranked, reverse-geocoded guess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPrediction {
    /// 1-based, contiguous within a result list.
    pub rank: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub probability: f64,
    pub city: String,
    pub state: String,
    pub county: String,
    pub country: String,
    pub location_summary: String,
}

impl LocationPrediction {
    pub fn new(rank: u32, raw: RawPrediction, place: Place) -> Self {
        let city = place.city.unwrap_or_default();
        let state = place.state.unwrap_or_default();
        let county = place.county.unwrap_or_default();
        let country = place.country.unwrap_or_default();
        let location_summary = summarize(&[&city, &state, &county, &country]);
        Self {
            rank,
            latitude: raw.latitude,
            longitude: raw.longitude,
            probability: raw.probability,
            city,
            state,
            county,
            country,
            location_summary,
        }
    }
}

fn summarize(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why a single record produced no predictions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("file does not exist: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("prediction failed: {0}")]
    Prediction(#[source] EngineError),

    #[error("model returned no predictions")]
    NoPredictions,
}

impl RecordError {
    /// Message safe to show to remote callers; engine internals are withheld.
    pub fn public_message(&self) -> String {
        match self {
            RecordError::MissingFile(_) => "file does not exist".to_string(),
            RecordError::Prediction(_) => "prediction failed".to_string(),
            RecordError::NoPredictions => self.to_string(),
        }
    }
}

/// Result of attempting one record.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionOutcome {
    Success {
        record: InputRecord,
        predictions: Vec<LocationPrediction>,
    },
    /// Missing file with `skip_missing` set: not an error.
    Skipped { record: InputRecord, warning: String },
    Failed { record: InputRecord, error: RecordError },
}

impl PredictionOutcome {
    pub fn record(&self) -> &InputRecord {
        match self {
            PredictionOutcome::Success { record, .. }
            | PredictionOutcome::Skipped { record, .. }
            | PredictionOutcome::Failed { record, .. } => record,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PredictionOutcome::Success { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, PredictionOutcome::Skipped { .. })
    }

    pub fn predictions(&self) -> &[LocationPrediction] {
        match self {
            PredictionOutcome::Success { predictions, .. } => predictions,
            _ => &[],
        }
    }

    pub fn warning(&self) -> Option<&str> {
        match self {
            PredictionOutcome::Skipped { warning, .. } => Some(warning),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&RecordError> {
        match self {
            PredictionOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Options for [`predict_records`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub top_k: usize,
    /// Emit a warning-only outcome for missing files instead of an error.
    pub skip_missing: bool,
    /// Stop at the first missing-file error without touching later records.
    pub fail_fast: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            skip_missing: false,
            fail_fast: false,
        }
    }
}

impl BatchOptions {
    pub fn top_k(top_k: usize) -> Self {
        Self {
            top_k,
            ..Default::default()
        }
    }

    pub fn skip_missing(mut self, skip: bool) -> Self {
        self.skip_missing = skip;
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// Run every record through the engine, one outcome per record, input order.
///
/// Records are pulled lazily, so in fail-fast mode nothing after the aborting
/// record is consumed.
pub fn predict_records<I>(
    engine: &EngineHandle,
    resolver: &dyn PlaceResolver,
    records: I,
    options: BatchOptions,
) -> Vec<PredictionOutcome>
where
    I: IntoIterator<Item = InputRecord>,
{
    let mut outcomes = Vec::new();

    for record in records {
        if !record.path.exists() {
            let error = RecordError::MissingFile(record.path.clone());
            if options.skip_missing {
                debug!(path = %record.path.display(), "skipping missing file");
                outcomes.push(PredictionOutcome::Skipped {
                    record,
                    warning: error.to_string(),
                });
                continue;
            }
            outcomes.push(PredictionOutcome::Failed { record, error });
            if options.fail_fast {
                break;
            }
            continue;
        }

        outcomes.push(predict_one(engine, resolver, record, options.top_k));
    }

    outcomes
}

fn predict_one(
    engine: &EngineHandle,
    resolver: &dyn PlaceResolver,
    record: InputRecord,
    top_k: usize,
) -> PredictionOutcome {
    let raw = match guarded_predict(engine, &record, top_k) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %record.path.display(), error = %e, "prediction failed");
            return PredictionOutcome::Failed {
                record,
                error: RecordError::Prediction(e),
            };
        }
    };

    if raw.is_empty() {
        return PredictionOutcome::Failed {
            record,
            error: RecordError::NoPredictions,
        };
    }

    if let Some(bad) = raw.iter().find(|p| !p.is_finite()) {
        let e = EngineError::InferenceFailed(format!("non-finite prediction {bad:?}"));
        warn!(path = %record.path.display(), error = %e, "engine returned malformed output");
        return PredictionOutcome::Failed {
            record,
            error: RecordError::Prediction(e),
        };
    }

    let raw = &raw[..raw.len().min(top_k)];
    PredictionOutcome::Success {
        record,
        predictions: build_candidates(raw, resolver),
    }
}

/// A panicking engine fails the record instead of unwinding into the caller.
fn guarded_predict(
    engine: &EngineHandle,
    record: &InputRecord,
    top_k: usize,
) -> Result<Vec<RawPrediction>, EngineError> {
    match panic::catch_unwind(AssertUnwindSafe(|| engine.predict(&record.path, top_k))) {
        Ok(result) => result,
        Err(payload) => Err(EngineError::InferenceFailed(format!(
            "engine panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Attach ranks and place names, keeping engine order.
pub fn build_candidates(raw: &[RawPrediction], resolver: &dyn PlaceResolver) -> Vec<LocationPrediction> {
    raw.iter()
        .enumerate()
        .map(|(i, p)| {
            let place = resolve_place(resolver, p.latitude, p.longitude);
            LocationPrediction::new((i + 1) as u32, *p, place)
        })
        .collect()
}

fn resolve_place(resolver: &dyn PlaceResolver, latitude: f64, longitude: f64) -> Place {
    // Resolvers must not fail; a panicking one degrades to "no place data".
    match panic::catch_unwind(AssertUnwindSafe(|| resolver.resolve(latitude, longitude))) {
        Ok(place) => place,
        Err(_) => {
            warn!(latitude, longitude, "place resolver panicked; leaving place blank");
            Place::default()
        }
    }
}
